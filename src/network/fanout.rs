//! PCM segmentation for datagram dispatch
//!
//! Runs on the capture thread; the actual socket writes are posted to the
//! reactor so a slow network never stalls the producer.

use crate::audio::pool::{BufferPool, PooledBuffer};
use crate::constants::MAX_UDP_PAYLOAD;

/// Split a PCM chunk into pool-backed segments of at most
/// [`MAX_UDP_PAYLOAD`] bytes, never splitting a sample frame.
pub fn segment_chunk(data: &[u8], block_align: usize, pool: &BufferPool) -> Vec<PooledBuffer> {
    if data.is_empty() {
        return Vec::new();
    }

    let align = block_align.max(1);
    let seg_cap = MAX_UDP_PAYLOAD - MAX_UDP_PAYLOAD % align;
    if seg_cap == 0 {
        // a single frame would not fit in one datagram
        return Vec::new();
    }

    let mut segments = Vec::with_capacity(data.len().div_ceil(seg_cap));
    let mut begin = 0;
    while begin < data.len() {
        let end = usize::min(begin + seg_cap, data.len());
        let mut segment = pool.acquire();
        segment.clear();
        segment.extend_from_slice(&data[begin..end]);
        segments.push(segment);
        begin = end;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{POOL_INITIAL_CAPACITY, POOL_MAX_SIZE};

    fn pool() -> BufferPool {
        BufferPool::new(MAX_UDP_PAYLOAD, POOL_INITIAL_CAPACITY, POOL_MAX_SIZE)
    }

    #[test]
    fn test_alignment_rule() {
        // 1444 is not a multiple of 4, so segments cap at 1440 and a
        // 5776-byte chunk needs five datagrams, not four
        let data = vec![0u8; 5776];
        let segments = segment_chunk(&data, 4, &pool());
        let sizes: Vec<usize> = segments.iter().map(|s| s.len()).collect();
        assert_eq!(sizes, vec![1440, 1440, 1440, 1440, 16]);
    }

    #[test]
    fn test_every_segment_aligned_and_bounded() {
        let pool = pool();
        for align in [1usize, 2, 3, 4, 6, 8, 16, 32] {
            let data: Vec<u8> = (0..align * 2000).map(|i| i as u8).collect();
            for segment in segment_chunk(&data, align, &pool) {
                assert!(segment.len() <= MAX_UDP_PAYLOAD);
                assert_eq!(segment.len() % align, 0);
            }
        }
    }

    #[test]
    fn test_concatenation_reproduces_chunk() {
        let data: Vec<u8> = (0..9973u32).map(|i| (i % 251) as u8).collect();
        // align 1: segments fill the full payload
        let segments = segment_chunk(&data, 1, &pool());
        assert_eq!(segments[0].len(), MAX_UDP_PAYLOAD);
        let joined: Vec<u8> = segments.iter().flat_map(|s| s.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_small_chunk_is_one_segment() {
        let data = vec![7u8; 128];
        let segments = segment_chunk(&data, 4, &pool());
        assert_eq!(segments.len(), 1);
        assert_eq!(&segments[0][..], &data[..]);
    }

    #[test]
    fn test_empty_chunk() {
        assert!(segment_chunk(&[], 4, &pool()).is_empty());
    }

    #[test]
    fn test_buffers_return_to_pool() {
        let pool = pool();
        let resting = pool.pool_size();
        let segments = segment_chunk(&vec![0u8; 4000], 4, &pool);
        assert!(pool.pool_size() < resting);
        drop(segments);
        assert_eq!(pool.pool_size(), resting);
    }
}
