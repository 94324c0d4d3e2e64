use std::collections::VecDeque;

use tokio::time::Instant;

use crate::chunk::DataChunk;

/// A transmitted DATA chunk and its sender-side bookkeeping.
#[derive(Debug, Clone)]
pub struct InflightChunk {
    /// The chunk as it goes on the wire.
    pub chunk: DataChunk,
    /// Number of transmissions so far.
    pub nsent: u32,
    /// Time of the first transmission.
    pub since: Instant,
    /// Acknowledged by a gap block (cumulative acks pop the chunk instead).
    pub acked: bool,
    /// Given up on under partial reliability.
    pub abandoned: bool,
    /// Scheduled for retransmission.
    pub retransmit: bool,
    /// Fast-retransmit miss indications.
    pub miss_indicator: u32,
}

impl InflightChunk {
    /// Record a first transmission at `now`.
    pub fn new(chunk: DataChunk, now: Instant) -> Self {
        Self {
            chunk,
            nsent: 1,
            since: now,
            acked: false,
            abandoned: false,
            retransmit: false,
            miss_indicator: 0,
        }
    }

    /// TSN of the chunk.
    pub fn tsn(&self) -> u32 {
        self.chunk.tsn
    }
}

/// Sent chunks in TSN order. TSNs are contiguous so lookup is an offset from
/// the head.
#[derive(Debug, Default)]
pub struct InflightQueue {
    chunks: VecDeque<InflightChunk>,
    /// Unacknowledged user bytes.
    n_bytes: usize,
}

impl InflightQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Its TSN must follow the current tail.
    pub fn push(&mut self, c: InflightChunk) {
        debug_assert!(
            self.chunks
                .back()
                .is_none_or(|last| last.tsn().wrapping_add(1) == c.tsn()),
            "inflight TSNs must be contiguous"
        );
        self.n_bytes += c.chunk.user_data.len();
        self.chunks.push_back(c);
    }

    fn index(&self, tsn: u32) -> Option<usize> {
        let front = self.chunks.front()?;
        let idx = tsn.wrapping_sub(front.tsn()) as usize;
        (idx < self.chunks.len()).then_some(idx)
    }

    /// Chunk with `tsn`, if still in flight.
    pub fn get(&self, tsn: u32) -> Option<&InflightChunk> {
        self.index(tsn).map(|i| &self.chunks[i])
    }

    /// Mutable chunk with `tsn`, if still in flight.
    pub fn get_mut(&mut self, tsn: u32) -> Option<&mut InflightChunk> {
        self.index(tsn).map(|i| &mut self.chunks[i])
    }

    /// Remove the head if it carries `tsn`.
    pub fn pop(&mut self, tsn: u32) -> Option<InflightChunk> {
        if self.chunks.front()?.tsn() != tsn {
            return None;
        }
        let c = self.chunks.pop_front()?;
        if !c.acked {
            self.n_bytes -= c.chunk.user_data.len();
        }
        Some(c)
    }

    /// Mark `tsn` acknowledged by a gap block. Returns the user bytes newly
    /// acknowledged (0 if unknown or already acked).
    pub fn mark_as_acked(&mut self, tsn: u32) -> usize {
        let Some(c) = self.get_mut(tsn) else {
            return 0;
        };
        if c.acked {
            return 0;
        }
        c.acked = true;
        c.retransmit = false;
        let len = c.chunk.user_data.len();
        self.n_bytes -= len;
        len
    }

    /// Schedule every unacked, unabandoned chunk for retransmission.
    pub fn mark_all_to_retransmit(&mut self) {
        for c in self.chunks.iter_mut() {
            if !c.acked && !c.abandoned {
                c.retransmit = true;
            }
        }
    }

    /// Abandon the whole message `tsn` belongs to. Only done when every
    /// fragment of the message is in flight; returns whether it happened.
    pub fn abandon_message(&mut self, tsn: u32) -> bool {
        let Some(idx) = self.index(tsn) else {
            return false;
        };

        let mut start = idx;
        while !self.chunks[start].chunk.beginning_fragment {
            if start == 0 {
                return false;
            }
            start -= 1;
        }
        let mut end = idx;
        while !self.chunks[end].chunk.ending_fragment {
            end += 1;
            if end == self.chunks.len() {
                return false;
            }
        }

        for c in self.chunks.range_mut(start..=end) {
            c.abandoned = true;
            c.retransmit = false;
        }
        true
    }

    /// Chunks in TSN order.
    pub fn iter(&self) -> impl Iterator<Item = &InflightChunk> {
        self.chunks.iter()
    }

    /// Mutable chunks in TSN order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InflightChunk> {
        self.chunks.iter_mut()
    }

    /// Unacknowledged user bytes.
    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    /// Number of chunks held.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sent(tsn: u32, b: bool, e: bool, len: usize) -> InflightChunk {
        InflightChunk::new(
            DataChunk {
                tsn,
                stream_id: 1,
                beginning_fragment: b,
                ending_fragment: e,
                user_data: Bytes::from(vec![0u8; len]),
                ..Default::default()
            },
            Instant::now(),
        )
    }

    #[test]
    fn test_push_pop_and_bytes() {
        let mut q = InflightQueue::new();
        q.push(sent(10, true, true, 100));
        q.push(sent(11, true, true, 50));
        assert_eq!(q.n_bytes(), 150);
        assert_eq!(q.get(11).map(|c| c.tsn()), Some(11));
        assert!(q.get(12).is_none());
        assert!(q.get(9).is_none());

        assert!(q.pop(11).is_none());
        assert_eq!(q.pop(10).map(|c| c.tsn()), Some(10));
        assert_eq!(q.n_bytes(), 50);
    }

    #[test]
    fn test_wrapping_tsns() {
        let mut q = InflightQueue::new();
        q.push(sent(u32::MAX, true, true, 1));
        q.push(sent(0, true, true, 1));
        assert_eq!(q.get(0).map(|c| c.tsn()), Some(0));
        assert!(q.pop(u32::MAX).is_some());
        assert!(q.pop(0).is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn test_mark_as_acked_counts_once() {
        let mut q = InflightQueue::new();
        q.push(sent(1, true, true, 10));
        q.push(sent(2, true, true, 20));
        assert_eq!(q.mark_as_acked(2), 20);
        assert_eq!(q.mark_as_acked(2), 0);
        assert_eq!(q.mark_as_acked(7), 0);
        assert_eq!(q.n_bytes(), 10);

        q.pop(1);
        q.pop(2);
        assert_eq!(q.n_bytes(), 0);
    }

    #[test]
    fn test_mark_all_to_retransmit_skips_acked() {
        let mut q = InflightQueue::new();
        q.push(sent(1, true, true, 1));
        q.push(sent(2, true, true, 1));
        q.mark_as_acked(2);
        q.mark_all_to_retransmit();
        assert!(q.get(1).is_some_and(|c| c.retransmit));
        assert!(q.get(2).is_some_and(|c| !c.retransmit));
    }

    #[test]
    fn test_abandon_whole_message() {
        let mut q = InflightQueue::new();
        q.push(sent(1, true, false, 1));
        q.push(sent(2, false, false, 1));
        q.push(sent(3, false, true, 1));
        q.push(sent(4, true, false, 1));

        assert!(q.abandon_message(2));
        assert!(q.iter().take(3).all(|c| c.abandoned));
        assert!(!q.get(4).is_some_and(|c| c.abandoned));

        // Last fragment not sent yet.
        assert!(!q.abandon_message(4));
    }
}
