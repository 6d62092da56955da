//! Bounded, ordered holding buffer for bytes that arrive before the peer

use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("pending buffer overflow: {attempted} bytes exceeds limit of {limit}")]
pub struct PendingOverflow {
    pub attempted: usize,
    pub limit: usize,
}

#[derive(Debug)]
pub struct PendingBuffer {
    chunks: VecDeque<Bytes>,
    size: usize,
    limit: usize,
}

impl PendingBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            limit,
        }
    }

    /// Append a chunk. Fails without storing anything once the bound would be exceeded.
    pub fn push(&mut self, chunk: Bytes) -> Result<(), PendingOverflow> {
        let attempted = self.size + chunk.len();
        if attempted > self.limit {
            return Err(PendingOverflow {
                attempted,
                limit: self.limit,
            });
        }
        if !chunk.is_empty() {
            self.size = attempted;
            self.chunks.push_back(chunk);
        }
        Ok(())
    }

    /// Take every chunk in arrival order, leaving the buffer empty.
    pub fn drain(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.size = 0;
        self.chunks.drain(..)
    }

    pub fn len_bytes(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
