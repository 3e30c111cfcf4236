//! System-audio capture feeding the broadcast fabric
//!
//! The cpal stream lives on its own thread (`cpal::Stream` is not `Send`);
//! startup errors travel back over a bounded channel so `start` can fail
//! synchronously.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};

use crate::audio::device::find_endpoint;
use crate::audio::CaptureSource;
use crate::broadcast::AudioSink;
use crate::config::CaptureConfig;
use crate::error::{AudioError, Error, Result};
use crate::protocol::{AudioFormat, Encoding};

/// Captures what the machine is playing and feeds it to an [`AudioSink`]
pub struct LoopbackCapture {
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackCapture {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }
}

impl Default for LoopbackCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for LoopbackCapture {
    fn start(&self, sink: Arc<dyn AudioSink>, config: &CaptureConfig) -> Result<AudioFormat> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AudioError::StreamError("capture is already running".to_string()).into());
        }

        let device = match find_endpoint(&config.endpoint_id) {
            Ok(device) => device,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let format = match resolve_format(&device, config) {
            Ok(format) => format,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let stream_config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let block_align = format.block_align();
        let encoding = format.encoding;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) || data.is_empty() {
                            return;
                        }
                        let bytes = encode_samples(data, encoding);
                        sink.broadcast_audio_data(&bytes, block_align);
                    },
                    move |err| {
                        error!("capture stream error: {err}");
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string()).into()));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string()).into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // the stream only stays alive while this thread does
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                return Err(AudioError::StreamError("capture thread exited".to_string()).into());
            }
        }

        *self.thread.lock().unwrap() = Some(handle);
        info!("capture started: {format}");
        Ok(format)
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!("capture stopped");
    }
}

impl Drop for LoopbackCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve_format(device: &cpal::Device, config: &CaptureConfig) -> Result<AudioFormat> {
    config.validate()?;

    let supported = device
        .default_output_config()
        .or_else(|_| device.default_input_config())
        .map_err(|e| Error::Audio(AudioError::UnsupportedFormat(e.to_string())))?;

    let encoding = config.encoding.unwrap_or(match supported.sample_format() {
        SampleFormat::I8 => Encoding::S8,
        SampleFormat::I16 => Encoding::S16,
        SampleFormat::I32 => Encoding::S32,
        _ => Encoding::F32,
    });
    let channels = if config.channels == 0 {
        supported.channels()
    } else {
        config.channels
    };
    let sample_rate = if config.sample_rate == 0 {
        supported.sample_rate().0
    } else {
        config.sample_rate
    };

    if !(1..=8).contains(&channels) {
        return Err(Error::Audio(AudioError::UnsupportedFormat(format!(
            "endpoint default of {channels} channels is out of range"
        ))));
    }
    if !(8_000..=192_000).contains(&sample_rate) {
        return Err(Error::Audio(AudioError::UnsupportedFormat(format!(
            "endpoint default of {sample_rate} Hz is out of range"
        ))));
    }

    Ok(AudioFormat {
        encoding,
        channels,
        sample_rate,
    })
}

/// Convert interleaved f32 samples to the stream encoding, little-endian
fn encode_samples(samples: &[f32], encoding: Encoding) -> Vec<u8> {
    let bytes_per_sample = encoding.bits_per_sample() as usize / 8;
    let mut out = Vec::with_capacity(samples.len() * bytes_per_sample);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        match encoding {
            Encoding::F32 => out.extend_from_slice(&sample.to_le_bytes()),
            Encoding::S8 => out.push((clamped * i8::MAX as f32) as i8 as u8),
            Encoding::S16 => {
                out.extend_from_slice(&((clamped * i16::MAX as f32) as i16).to_le_bytes())
            }
            Encoding::S24 => {
                let value = (clamped as f64 * 8_388_607.0) as i32;
                out.extend_from_slice(&value.to_le_bytes()[..3]);
            }
            Encoding::S32 => {
                let value = (clamped as f64 * i32::MAX as f64) as i32;
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
    out
}
