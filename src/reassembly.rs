//! Per-stream message reassembly.
//!
//! DATA chunks arrive fragmented, duplicated and out of order. The queue
//! groups fragments into [`ChunkSet`]s and hands out whole messages:
//!
//! - **Unordered** fragments are kept sorted by TSN; as soon as a contiguous
//!   B..E run exists it becomes a complete set, delivered FIFO.
//! - **Ordered** fragments are grouped by SSN; a set is delivered only when
//!   it is complete and its SSN is the next one expected.
//!
//! FORWARD-TSN processing drops abandoned fragments and moves the expected
//! SSN forward.

use thiserror::Error;

use crate::chunk::{DataChunk, PayloadProtocolIdentifier};
use crate::core::{sna16_gt, sna16_lt, sna16_lte, sna32_gt, sna32_lt};

/// Errors returned by [`ReassemblyQueue::read`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    /// No complete message is ready.
    #[error("no complete message available")]
    TryAgain,

    /// The caller's buffer cannot hold the next message; the message is kept.
    #[error("short buffer: message needs {needed} bytes, buffer holds {available}")]
    ShortBuffer {
        /// Message size.
        needed: usize,
        /// Buffer size.
        available: usize,
    },
}

/// Fragments believed to form one message.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    /// SSN shared by the fragments (ordered sets only).
    pub ssn: u16,
    /// PPI of the first fragment received.
    pub ppi: PayloadProtocolIdentifier,
    chunks: Vec<DataChunk>,
}

impl ChunkSet {
    fn new(ssn: u16, ppi: PayloadProtocolIdentifier) -> Self {
        Self {
            ssn,
            ppi,
            chunks: Vec::new(),
        }
    }

    /// Insert a fragment keeping TSN order. Returns `false` for a duplicate
    /// TSN, which leaves the set untouched.
    fn insert(&mut self, chunk: DataChunk) -> bool {
        if self.chunks.iter().any(|c| c.tsn == chunk.tsn) {
            return false;
        }
        let pos = self
            .chunks
            .iter()
            .position(|c| sna32_lt(chunk.tsn, c.tsn))
            .unwrap_or(self.chunks.len());
        self.chunks.insert(pos, chunk);
        true
    }

    /// A set is complete when it is non-empty, starts with a B fragment,
    /// ends with an E fragment and its TSNs are strictly consecutive.
    pub fn is_complete(&self) -> bool {
        let (Some(first), Some(last)) = (self.chunks.first(), self.chunks.last()) else {
            return false;
        };
        if !first.beginning_fragment || !last.ending_fragment {
            return false;
        }
        self.chunks
            .windows(2)
            .all(|pair| pair[1].tsn == pair[0].tsn.wrapping_add(1))
    }

    fn is_fragmented_set(&self) -> bool {
        self.chunks.first().is_some_and(DataChunk::is_fragmented)
    }

    fn n_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.user_data.len()).sum()
    }

    /// Fragments in TSN order.
    pub fn chunks(&self) -> &[DataChunk] {
        &self.chunks
    }
}

/// Reassembly state of one inbound stream.
#[derive(Debug, Clone)]
pub struct ReassemblyQueue {
    stream_id: u16,
    /// SSN of the next ordered message to deliver.
    next_ssn: u16,
    /// Ordered sets, sorted by SSN.
    ordered: Vec<ChunkSet>,
    /// Complete unordered sets, in completion order.
    unordered: Vec<ChunkSet>,
    /// Unordered fragments not yet part of a complete run, sorted by TSN.
    unordered_chunks: Vec<DataChunk>,
    /// User data bytes held by the queue.
    n_bytes: usize,
}

impl ReassemblyQueue {
    /// Create an empty queue for `stream_id`. SSNs start from 0.
    pub fn new(stream_id: u16) -> Self {
        Self {
            stream_id,
            next_ssn: 0,
            ordered: Vec::new(),
            unordered: Vec::new(),
            unordered_chunks: Vec::new(),
            n_bytes: 0,
        }
    }

    /// Stream this queue belongs to.
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// SSN of the next ordered message to deliver.
    pub fn next_ssn(&self) -> u16 {
        self.next_ssn
    }

    /// User data bytes currently buffered.
    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    /// Add a fragment. Returns `true` if it completed a message.
    pub fn push(&mut self, chunk: DataChunk) -> bool {
        if chunk.stream_id != self.stream_id {
            return false;
        }

        if chunk.unordered {
            return self.push_unordered(chunk);
        }

        if sna16_lt(chunk.ssn, self.next_ssn) {
            return false;
        }
        if self
            .ordered
            .iter()
            .any(|set| set.chunks.iter().any(|c| c.tsn == chunk.tsn))
        {
            return false;
        }

        let existing = if chunk.is_fragmented() {
            self.ordered
                .iter()
                .position(|set| set.ssn == chunk.ssn && set.is_fragmented_set())
        } else {
            None
        };

        let idx = match existing {
            Some(idx) => idx,
            None => {
                let set = ChunkSet::new(chunk.ssn, chunk.ppi);
                let pos = self
                    .ordered
                    .iter()
                    .position(|s| sna16_lt(chunk.ssn, s.ssn))
                    .unwrap_or(self.ordered.len());
                self.ordered.insert(pos, set);
                pos
            }
        };

        let len = chunk.user_data.len();
        let set = &mut self.ordered[idx];
        if !set.insert(chunk) {
            return false;
        }
        self.n_bytes += len;
        set.is_complete()
    }

    fn push_unordered(&mut self, chunk: DataChunk) -> bool {
        if self.unordered_chunks.iter().any(|c| c.tsn == chunk.tsn) {
            return false;
        }

        self.n_bytes += chunk.user_data.len();
        let pos = self
            .unordered_chunks
            .iter()
            .position(|c| sna32_lt(chunk.tsn, c.tsn))
            .unwrap_or(self.unordered_chunks.len());
        self.unordered_chunks.insert(pos, chunk);

        match self.take_complete_unordered_set() {
            Some(set) => {
                self.unordered.push(set);
                true
            }
            None => false,
        }
    }

    /// Extract the first contiguous B..E run from `unordered_chunks`.
    fn take_complete_unordered_set(&mut self) -> Option<ChunkSet> {
        let mut start: Option<usize> = None;
        let mut last_tsn = 0u32;
        let mut end = None;

        for (i, chunk) in self.unordered_chunks.iter().enumerate() {
            if chunk.beginning_fragment {
                start = Some(i);
                last_tsn = chunk.tsn;
                if chunk.ending_fragment {
                    end = Some(i);
                    break;
                }
                continue;
            }

            if start.is_none() {
                continue;
            }

            if chunk.tsn != last_tsn.wrapping_add(1) {
                start = None;
                continue;
            }

            last_tsn = chunk.tsn;
            if chunk.ending_fragment {
                end = Some(i);
                break;
            }
        }

        let (start, end) = (start?, end?);
        let chunks: Vec<DataChunk> = self.unordered_chunks.drain(start..=end).collect();
        let mut set = ChunkSet::new(0, chunks[0].ppi);
        set.chunks = chunks;
        Some(set)
    }

    /// Whether [`read`](Self::read) would return a message.
    pub fn is_readable(&self) -> bool {
        if !self.unordered.is_empty() {
            return true;
        }
        self.ordered
            .first()
            .is_some_and(|set| set.is_complete() && sna16_lte(set.ssn, self.next_ssn))
    }

    /// Size of the message [`read`](Self::read) would return next.
    pub fn next_message_len(&self) -> Option<usize> {
        if let Some(set) = self.unordered.first() {
            return Some(set.n_bytes());
        }
        self.is_readable()
            .then(|| self.ordered.first().map(ChunkSet::n_bytes))
            .flatten()
    }

    /// Copy the next complete message into `buf`.
    ///
    /// Unordered messages take precedence. On
    /// [`ReassemblyError::ShortBuffer`] the message stays queued.
    pub fn read(
        &mut self,
        buf: &mut [u8],
    ) -> Result<(usize, PayloadProtocolIdentifier), ReassemblyError> {
        let (set, unordered) = if let Some(set) = self.unordered.first() {
            (set, true)
        } else if let Some(set) = self.ordered.first() {
            if !set.is_complete() || sna16_gt(set.ssn, self.next_ssn) {
                return Err(ReassemblyError::TryAgain);
            }
            (set, false)
        } else {
            return Err(ReassemblyError::TryAgain);
        };

        let needed = set.n_bytes();
        if needed > buf.len() {
            return Err(ReassemblyError::ShortBuffer {
                needed,
                available: buf.len(),
            });
        }

        let mut n = 0;
        for chunk in &set.chunks {
            buf[n..n + chunk.user_data.len()].copy_from_slice(&chunk.user_data);
            n += chunk.user_data.len();
        }
        let ppi = set.ppi;

        if unordered {
            self.unordered.remove(0);
        } else {
            let set = self.ordered.remove(0);
            if set.ssn == self.next_ssn {
                self.next_ssn = self.next_ssn.wrapping_add(1);
            }
        }
        self.subtract_bytes(n);

        Ok((n, ppi))
    }

    /// Drop incomplete ordered sets up to `last_ssn` and move the expected
    /// SSN past it.
    pub fn forward_tsn_for_ordered(&mut self, last_ssn: u16) {
        let mut dropped = 0;
        self.ordered.retain(|set| {
            if sna16_lte(set.ssn, last_ssn) && !set.is_complete() {
                dropped += set.n_bytes();
                return false;
            }
            true
        });
        self.subtract_bytes(dropped);

        if sna16_lte(self.next_ssn, last_ssn) {
            self.next_ssn = last_ssn.wrapping_add(1);
        }
    }

    /// Drop pending unordered fragments with TSN at or below
    /// `new_cumulative_tsn`. Complete unordered sets are kept.
    pub fn forward_tsn_for_unordered(&mut self, new_cumulative_tsn: u32) {
        let keep_from = self
            .unordered_chunks
            .iter()
            .position(|c| sna32_gt(c.tsn, new_cumulative_tsn))
            .unwrap_or(self.unordered_chunks.len());
        let dropped: usize = self
            .unordered_chunks
            .drain(..keep_from)
            .map(|c| c.user_data.len())
            .sum();
        self.subtract_bytes(dropped);
    }

    fn subtract_bytes(&mut self, n: usize) {
        self.n_bytes = self.n_bytes.saturating_sub(n);
    }
}
