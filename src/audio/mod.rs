//! Capture contract and the cpal-backed capture source

pub mod capture;
pub mod device;
pub mod pool;

use std::sync::Arc;

use crate::broadcast::AudioSink;
use crate::config::CaptureConfig;
use crate::error::Result;
use crate::protocol::AudioFormat;

pub use capture::LoopbackCapture;
pub use pool::{BufferPool, PooledBuffer};

/// A producer of PCM chunks.
///
/// The streaming server starts the source when it comes up and installs
/// itself as the sink; the source calls
/// [`AudioSink::broadcast_audio_data`] from its own thread for every chunk
/// it captures.
pub trait CaptureSource: Send + Sync {
    /// Start producing into `sink`, resolving any defaulted fields of
    /// `config` against the selected endpoint. Returns the final stream
    /// format, which stays fixed until [`CaptureSource::stop`].
    fn start(&self, sink: Arc<dyn AudioSink>, config: &CaptureConfig) -> Result<AudioFormat>;

    /// Stop producing. Must be idempotent; no `broadcast_audio_data` call
    /// may happen after this returns.
    fn stop(&self);
}
