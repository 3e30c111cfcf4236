//! Audio sink plumbing shared by the transports

use std::sync::{Arc, Mutex};

/// Anything that consumes captured PCM chunks.
///
/// `data` always holds whole sample frames; `block_align` is the size of one
/// frame in bytes, and implementations must never split a frame across a
/// transport boundary.
pub trait AudioSink: Send + Sync {
    fn broadcast_audio_data(&self, data: &[u8], block_align: usize);
}

/// Fans one broadcast call out to a list of sinks, in registration order.
pub struct CompositeBroadcaster {
    sinks: Mutex<Vec<Arc<dyn AudioSink>>>,
}

impl CompositeBroadcaster {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, sink: Arc<dyn AudioSink>) {
        self.sinks.lock().unwrap().push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CompositeBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CompositeBroadcaster {
    fn broadcast_audio_data(&self, data: &[u8], block_align: usize) {
        let sinks = self.sinks.lock().unwrap();
        for sink in sinks.iter() {
            sink.broadcast_audio_data(data, block_align);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        order: Arc<AtomicUsize>,
        seen_at: AtomicUsize,
        bytes: AtomicUsize,
    }

    impl RecordingSink {
        fn new(order: Arc<AtomicUsize>) -> Self {
            Self {
                order,
                seen_at: AtomicUsize::new(0),
                bytes: AtomicUsize::new(0),
            }
        }
    }

    impl AudioSink for RecordingSink {
        fn broadcast_audio_data(&self, data: &[u8], _block_align: usize) {
            let position = self.order.fetch_add(1, Ordering::SeqCst);
            self.seen_at.store(position + 1, Ordering::SeqCst);
            self.bytes.fetch_add(data.len(), Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let order = Arc::new(AtomicUsize::new(0));
        let first = Arc::new(RecordingSink::new(order.clone()));
        let second = Arc::new(RecordingSink::new(order.clone()));

        let composite = CompositeBroadcaster::new();
        composite.add(first.clone());
        composite.add(second.clone());
        assert_eq!(composite.len(), 2);

        composite.broadcast_audio_data(&[0u8; 64], 4);

        assert_eq!(first.seen_at.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen_at.load(Ordering::SeqCst), 2);
        assert_eq!(first.bytes.load(Ordering::SeqCst), 64);
        assert_eq!(second.bytes.load(Ordering::SeqCst), 64);
    }
}
