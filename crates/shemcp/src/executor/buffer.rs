//! Bounded tail-window buffer for captured stream bytes.

use std::collections::VecDeque;

/// Keeps the most recent `cap` bytes of a stream along with the absolute
/// offset of the first retained byte, so pages can still be addressed by
/// stream offset after older bytes are dropped.
#[derive(Debug)]
pub(crate) struct TailBuffer {
    cap: usize,
    chunks: VecDeque<Vec<u8>>,
    retained: usize,
    start_offset: u64,
}

impl TailBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            cap,
            chunks: VecDeque::new(),
            retained: 0,
            start_offset: 0,
        }
    }

    /// Absolute offset of the first byte still in memory.
    pub(crate) fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Absolute offset one past the last byte in memory.
    pub(crate) fn end_offset(&self) -> u64 {
        self.start_offset + self.retained as u64
    }

    /// Append a chunk, dropping the oldest bytes once over the cap.
    pub(crate) fn push_chunk(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if self.cap == 0 {
            self.start_offset += chunk.len() as u64;
            return;
        }
        if chunk.len() >= self.cap {
            // The chunk alone fills the window; keep only its tail.
            let dropped_before = self.retained as u64;
            let keep_from = chunk.len() - self.cap;
            self.start_offset += dropped_before + keep_from as u64;
            self.chunks.clear();
            self.chunks.push_back(chunk[keep_from..].to_vec());
            self.retained = self.cap;
            return;
        }
        self.chunks.push_back(chunk.to_vec());
        self.retained += chunk.len();
        self.trim_to_cap();
    }

    fn trim_to_cap(&mut self) {
        let mut excess = self.retained.saturating_sub(self.cap);
        while excess > 0 {
            match self.chunks.front_mut() {
                Some(front) if excess >= front.len() => {
                    excess -= front.len();
                    self.retained -= front.len();
                    self.start_offset += front.len() as u64;
                    self.chunks.pop_front();
                }
                Some(front) => {
                    front.drain(..excess);
                    self.retained -= excess;
                    self.start_offset += excess as u64;
                    break;
                }
                None => break,
            }
        }
    }

    /// Copy bytes `[start, end)` out of the window. Returns `None` when
    /// `start` precedes the window (those bytes are gone); the upper bound is
    /// clamped to the window end.
    pub(crate) fn slice(&self, start: u64, end: u64) -> Option<Vec<u8>> {
        if start < self.start_offset {
            return None;
        }
        let end = end.min(self.end_offset());
        if end <= start {
            return Some(Vec::new());
        }
        let mut skip = (start - self.start_offset) as usize;
        let mut remaining = (end - start) as usize;
        let mut out = Vec::with_capacity(remaining);
        for chunk in &self.chunks {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let available = &chunk[skip..];
            skip = 0;
            let take = available.len().min(remaining);
            out.extend_from_slice(&available[..take]);
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        Some(out)
    }
}
