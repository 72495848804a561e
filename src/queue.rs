//! Chunk buffering.
use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Ordered chunk accumulator with total length tracking.
///
/// The tracked length always equals the sum of the buffered chunk lengths.
/// Extraction slices across chunk boundaries, splitting the chunk the cut
/// point falls in and leaving the remainder at the front.
#[derive(Debug, Default)]
pub struct BufferQueue {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self { chunks: VecDeque::new(), len: 0 }
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Remove up to `n` bytes from the front.
    ///
    /// `0`, or any `n` at or past the tracked length, takes everything.
    /// Returns `None` when nothing is buffered. Slicing inside a chunk
    /// shares its storage, only a cut spanning chunks copies.
    pub fn extract(&mut self, n: usize) -> Option<Bytes> {
        if self.chunks.is_empty() {
            return None;
        }

        if n == 0 || n >= self.len {
            let all = if self.chunks.len() == 1 {
                self.chunks.pop_front()?
            } else {
                let mut buf = BytesMut::with_capacity(self.len);
                while let Some(chunk) = self.chunks.pop_front() {
                    buf.extend_from_slice(&chunk);
                }
                buf.freeze()
            };
            self.len = 0;
            return Some(all);
        }

        let front_len = self.chunks.front().map_or(0, Bytes::len);

        if front_len > n {
            let piece = self.chunks.front_mut()?.split_to(n);
            self.len -= n;
            return Some(piece);
        }

        if front_len == n {
            self.len -= n;
            return self.chunks.pop_front();
        }

        // the cut spans past the first chunk
        let mut buf = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            if chunk.len() <= remaining {
                remaining -= chunk.len();
                buf.extend_from_slice(&chunk);
            } else {
                buf.extend_from_slice(&chunk.split_to(remaining));
                self.chunks.push_front(chunk);
                remaining = 0;
            }
        }
        self.len -= n;
        Some(buf.freeze())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn filled(parts: &[&'static str]) -> BufferQueue {
        let mut queue = BufferQueue::new();
        for part in parts {
            queue.push(Bytes::from(*part));
        }
        queue
    }

    #[test]
    fn tracks_length() {
        let mut queue = filled(&["he", "llo"]);
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.chunk_count(), 2);

        queue.push(Bytes::new());
        assert_eq!(queue.len(), 5);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn extract_empty() {
        let mut queue = BufferQueue::new();
        assert_eq!(queue.extract(0), None);
        assert_eq!(queue.extract(3), None);
    }

    #[test]
    fn extract_all() {
        let mut queue = filled(&["ab", "cd", "e"]);
        assert_eq!(queue.extract(0).as_deref(), Some(&b"abcde"[..]));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.extract(0), None);

        let mut queue = filled(&["ab", "cd"]);
        assert_eq!(queue.extract(99).as_deref(), Some(&b"abcd"[..]));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn extract_within_front_chunk_shares_storage() {
        let mut queue = filled(&["abcdef"]);
        let base = queue.chunks.front().map(|c| c.as_ptr());

        let piece = queue.extract(2);
        assert_eq!(piece.as_deref(), Some(&b"ab"[..]));
        assert_eq!(piece.map(|p| p.as_ptr()), base);

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.extract(0).as_deref(), Some(&b"cdef"[..]));
    }

    #[test]
    fn extract_spanning_chunks() {
        // sizes [5, 5, 5]: 7 takes all of chunk one and two bytes of chunk
        // two, 8 takes the rest
        let mut queue = filled(&["aaaaa", "bbbbb", "ccccc"]);

        assert_eq!(queue.extract(7).as_deref(), Some(&b"aaaaabb"[..]));
        assert_eq!(queue.len(), 8);

        assert_eq!(queue.extract(8).as_deref(), Some(&b"bbbccccc"[..]));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.extract(0), None);
    }

    #[test]
    fn extract_exact_chunk_boundary() {
        let mut queue = filled(&["ab", "cd"]);
        assert_eq!(queue.extract(2).as_deref(), Some(&b"ab"[..]));
        assert_eq!(queue.chunk_count(), 1);
        assert_eq!(queue.extract(2).as_deref(), Some(&b"cd"[..]));
        assert!(queue.is_empty());
    }

    #[test]
    fn skips_empty_chunks_when_slicing() {
        let mut queue = BufferQueue::new();
        queue.push(Bytes::new());
        queue.push(Bytes::from("abc"));
        assert_eq!(queue.extract(2).as_deref(), Some(&b"ab"[..]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn round_trip() {
        let original = b"the quick brown fox jumps over the lazy dog";
        for n in 0..=original.len() + 1 {
            let mut queue = filled(&["the quick ", "brown fox ", "jumps over ", "the lazy dog"]);
            let mut out = Vec::new();
            if let Some(head) = queue.extract(n) {
                out.extend_from_slice(&head);
            }
            while let Some(rest) = queue.extract(0) {
                out.extend_from_slice(&rest);
            }
            assert_eq!(out, original, "split at {n}");
        }
    }
}
