//! Bounded output history

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default number of chunks retained per session
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// One chunk of terminal output and when it arrived
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputChunk {
    /// Position in the session's output stream, starting at 0
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// Ring of the most recent output chunks; oldest are evicted first
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    capacity: usize,
    next_seq: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
            capacity,
            next_seq: 0,
        }
    }

    /// Append a chunk and return the sequence number it was given
    pub fn push(&mut self, timestamp: DateTime<Utc>, data: Vec<u8>) -> u64 {
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.chunks.push_back(OutputChunk {
            seq,
            timestamp,
            data,
        });
        seq
    }

    /// Sequence number the next pushed chunk will get
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Copy of the last `count` chunks, oldest first
    pub fn recent(&self, count: usize) -> Vec<OutputChunk> {
        self.recent_before(self.next_seq, count)
    }

    /// Copy of the last `count` chunks numbered below `seq`, oldest first
    pub fn recent_before(&self, seq: u64, count: usize) -> Vec<OutputChunk> {
        let end = self.chunks.partition_point(|chunk| chunk.seq < seq);
        let start = end.saturating_sub(count);
        self.chunks.range(start..end).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
