//! Wire protocol shared with listeners
//!
//! The TCP control channel speaks little-endian 32-bit framed commands; the
//! format payload is a proto3 message matching the Android listener's
//! parser, and the WebSocket gateway announces the same format as JSON.

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use crate::constants::MAX_FORMAT_SIZE;
use crate::error::ProtocolError;

/// Commands a listener may send, and the first word of every server reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    None = 0,
    GetFormat = 1,
    StartPlay = 2,
    Heartbeat = 3,
}

impl Command {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Command::None),
            1 => Some(Command::GetFormat),
            2 => Some(Command::StartPlay),
            3 => Some(Command::Heartbeat),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// PCM sample encodings supported by the capture side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    F32,
    S8,
    S16,
    S24,
    S32,
}

impl Encoding {
    /// Enum value used in the serialized format message
    pub fn wire_value(self) -> u64 {
        match self {
            Encoding::F32 => 1,
            Encoding::S8 => 2,
            Encoding::S16 => 3,
            Encoding::S24 => 4,
            Encoding::S32 => 5,
        }
    }

    pub fn bits_per_sample(self) -> u16 {
        match self {
            Encoding::F32 | Encoding::S32 => 32,
            Encoding::S8 => 8,
            Encoding::S16 => 16,
            Encoding::S24 => 24,
        }
    }

    /// Short name used by the CLI and the WebSocket format message
    pub fn label(self) -> &'static str {
        match self {
            Encoding::F32 => "f32",
            Encoding::S8 => "s8",
            Encoding::S16 => "s16",
            Encoding::S24 => "s24",
            Encoding::S32 => "s32",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "f32" => Some(Encoding::F32),
            "s8" => Some(Encoding::S8),
            "s16" => Some(Encoding::S16),
            "s24" => Some(Encoding::S24),
            "s32" => Some(Encoding::S32),
            _ => None,
        }
    }
}

/// Stream format, fixed once capture has started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: Encoding,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioFormat {
    pub fn bits_per_sample(&self) -> u16 {
        self.encoding.bits_per_sample()
    }

    /// Bytes per sample frame; segment boundaries must be multiples of this
    pub fn block_align(&self) -> usize {
        self.channels as usize * self.bits_per_sample() as usize / 8
    }

    /// Serialize as the proto3 `AudioFormat` message the Android listener
    /// expects: `encoding = 1`, `channels = 2`, `sample_rate = 3`, all
    /// varint fields.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        put_field_varint(&mut buf, 1, self.encoding.wire_value());
        put_field_varint(&mut buf, 2, self.channels as u64);
        put_field_varint(&mut buf, 3, self.sample_rate as u64);
        buf
    }

    /// JSON message sent as the first WebSocket text frame
    pub fn to_json(&self) -> String {
        let msg = FormatMessage {
            kind: "format",
            encoding: self.encoding.label(),
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.bits_per_sample(),
        };
        serde_json::to_string(&msg).expect("format message serializes")
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}Hz {}ch",
            self.encoding.label(),
            self.sample_rate,
            self.channels
        )
    }
}

#[derive(Serialize)]
struct FormatMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    encoding: &'a str,
    channels: u16,
    #[serde(rename = "sampleRate")]
    sample_rate: u32,
    #[serde(rename = "bitsPerSample")]
    bits_per_sample: u16,
}

fn put_field_varint(buf: &mut Vec<u8>, field: u32, value: u64) {
    buf.push((field << 3) as u8);
    put_varint(buf, value);
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Reply to `GET_FORMAT`: `u32(1) | u32(size) | bytes(size)`
pub fn format_reply(format: &AudioFormat) -> Result<Vec<u8>, ProtocolError> {
    let body = format.to_wire();
    if body.len() > MAX_FORMAT_SIZE {
        return Err(ProtocolError::FormatTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_u32_le(Command::GetFormat.as_u32());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.to_vec())
}

/// Reply to `START_PLAY`: `u32(2) | u32(peer_id)`
pub fn start_reply(peer_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(Command::StartPlay.as_u32());
    buf.put_u32_le(peer_id);
    buf.to_vec()
}

/// Server-initiated liveness ping: `u32(3)`
pub fn heartbeat_frame() -> Vec<u8> {
    Command::Heartbeat.as_u32().to_le_bytes().to_vec()
}
