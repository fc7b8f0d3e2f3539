/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use bytes::Bytes;

/// Append-only log of a job's merged stdout/stderr.
///
/// The buffer is authoritative: every byte the job ever produced is appended
/// here regardless of subscriber health. A retention cap bounds memory for
/// long-lived jobs: once `capacity` is exceeded the oldest bytes are dropped
/// and `dropped_bytes` records how many, so readers can tell a truncated
/// history from a complete one. `capacity == 0` disables the cap.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Vec<u8>,
    dropped_bytes: u64,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { data: Vec::new(), dropped_bytes: 0, capacity }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);

        if self.capacity > 0 && self.data.len() > self.capacity {
            let excess = self.data.len() - self.capacity;
            let _ = self.data.drain(..excess);
            self.dropped_bytes += excess as u64;
        }
    }

    /// Point-in-time copy of the retained bytes.
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    /// Number of bytes dropped from the head of the log by the retention cap.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
