//! Bounded step output capture
//!
//! Step output is kept in memory up to a fixed limit. When the limit is
//! exceeded the oldest bytes are dropped so the tail (where failures usually
//! show up) survives, and the number of dropped bytes is recorded.

use anvil_core::domain::log::StepOutput;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;

/// Tail-keeping output buffer
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    buffer: VecDeque<u8>,
    limit: usize,
    truncated: u64,
}

impl CapturedOutput {
    /// Creates an empty buffer holding at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            limit,
            truncated: 0,
        }
    }

    /// Creates a buffer pre-filled with `bytes`
    pub fn from_bytes(bytes: &[u8], limit: usize) -> Self {
        let mut output = Self::new(limit);
        output.push(bytes);
        output
    }

    /// Drains `reader` to the end, holding no more than `limit` bytes at once
    pub async fn read_from<R>(mut reader: R, limit: usize) -> std::io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut output = Self::new(limit);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(output);
            }
            output.push(&chunk[..n]);
        }
    }

    /// Appends another capture after this one
    pub fn append(&mut self, other: CapturedOutput) {
        self.truncated += other.truncated;
        let (front, back) = other.buffer.as_slices();
        self.push(front);
        self.push(back);
    }

    /// Appends a chunk, dropping the oldest bytes beyond the limit
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.limit {
            let skipped = chunk.len() - self.limit;
            self.truncated += (self.buffer.len() + skipped) as u64;
            self.buffer.clear();
            self.buffer.extend(&chunk[skipped..]);
            return;
        }

        self.buffer.extend(chunk);
        let overflow = self.buffer.len().saturating_sub(self.limit);
        if overflow > 0 {
            self.buffer.drain(..overflow);
            self.truncated += overflow as u64;
        }
    }

    /// Number of bytes currently held
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Leading bytes dropped so far
    pub fn truncated_bytes(&self) -> u64 {
        self.truncated
    }

    /// Held output decoded as UTF-8, replacing invalid sequences
    pub fn to_text(&self) -> String {
        let (front, back) = self.buffer.as_slices();
        let mut bytes = Vec::with_capacity(self.buffer.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Converts into the record shipped to the controlling service
    pub fn to_step_output(&self, unit_id: &str) -> StepOutput {
        StepOutput {
            unit_id: unit_id.to_string(),
            output: self.to_text(),
            truncated_bytes: self.truncated,
        }
    }
}
