use std::collections::HashSet;

use crate::chunk::GapAckBlock;
use crate::core::{sna32_gt, sna32_lte, MAX_DUPLICATE_TSNS};

/// TSNs received above the cumulative ack point, plus the duplicates seen
/// since the last SACK.
#[derive(Debug, Default)]
pub struct ReceivedQueue {
    tsns: HashSet<u32>,
    dup_tsns: Vec<u32>,
}

impl ReceivedQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `tsn` as received given the current cumulative TSN. Returns
    /// `false` and records a duplicate if it was already seen.
    pub fn push(&mut self, tsn: u32, cumulative_tsn: u32) -> bool {
        if sna32_lte(tsn, cumulative_tsn) || self.tsns.contains(&tsn) {
            self.push_duplicate(tsn);
            return false;
        }
        self.tsns.insert(tsn);
        true
    }

    fn push_duplicate(&mut self, tsn: u32) {
        if self.dup_tsns.len() < MAX_DUPLICATE_TSNS {
            self.dup_tsns.push(tsn);
        }
    }

    /// Whether `tsn` was received and not yet absorbed by the cumulative
    /// point.
    pub fn contains(&self, tsn: u32) -> bool {
        self.tsns.contains(&tsn)
    }

    /// Whether `tsn` lies below a TSN already held, i.e. it fills a hole
    /// rather than extending the received range.
    pub fn fills_hole(&self, tsn: u32) -> bool {
        self.tsns.iter().any(|&held| sna32_gt(held, tsn))
    }

    /// Remove `tsn`; used while advancing the cumulative point.
    pub fn pop(&mut self, tsn: u32) -> bool {
        self.tsns.remove(&tsn)
    }

    /// Advance `cumulative_tsn` over every contiguous TSN held and return
    /// the new value.
    pub fn advance(&mut self, mut cumulative_tsn: u32) -> u32 {
        while self.pop(cumulative_tsn.wrapping_add(1)) {
            cumulative_tsn = cumulative_tsn.wrapping_add(1);
        }
        cumulative_tsn
    }

    /// Forget every TSN at or below `cumulative_tsn` (FORWARD-TSN).
    pub fn drop_through(&mut self, cumulative_tsn: u32) {
        self.tsns.retain(|&tsn| sna32_gt(tsn, cumulative_tsn));
    }

    /// Gap ack blocks relative to `cumulative_tsn`, in ascending order.
    /// TSNs too far ahead to be expressed as a 16-bit offset are left out.
    pub fn gap_ack_blocks(&self, cumulative_tsn: u32) -> Vec<GapAckBlock> {
        let mut offsets: Vec<u32> = self
            .tsns
            .iter()
            .map(|&tsn| tsn.wrapping_sub(cumulative_tsn))
            .filter(|&off| off > 0 && off <= u16::MAX as u32)
            .collect();
        offsets.sort_unstable();

        let mut blocks: Vec<GapAckBlock> = Vec::new();
        for off in offsets {
            let off = off as u16;
            match blocks.last_mut() {
                Some(last) if last.end.wrapping_add(1) == off => last.end = off,
                _ => blocks.push(GapAckBlock {
                    start: off,
                    end: off,
                }),
            }
        }
        blocks
    }

    /// Take the duplicate TSNs collected since the last call.
    pub fn pop_duplicates(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.dup_tsns)
    }

    /// Whether duplicates are waiting to be reported.
    pub fn has_duplicates(&self) -> bool {
        !self.dup_tsns.is_empty()
    }

    /// Number of out-of-order TSNs held.
    pub fn len(&self) -> usize {
        self.tsns.len()
    }

    /// Whether no TSN is held above the cumulative point.
    pub fn is_empty(&self) -> bool {
        self.tsns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_blocks() {
        let mut q = ReceivedQueue::new();
        for tsn in [12, 13, 15, 17, 18, 19] {
            assert!(q.push(tsn, 10));
        }
        assert_eq!(
            q.gap_ack_blocks(10),
            vec![
                GapAckBlock { start: 2, end: 3 },
                GapAckBlock { start: 5, end: 5 },
                GapAckBlock { start: 7, end: 9 },
            ]
        );
    }

    #[test]
    fn test_gap_blocks_across_wrap() {
        let mut q = ReceivedQueue::new();
        let cum = u32::MAX - 1;
        q.push(u32::MAX.wrapping_add(1), cum);
        q.push(1, cum);
        assert_eq!(q.gap_ack_blocks(cum), vec![GapAckBlock { start: 2, end: 3 }]);
    }

    #[test]
    fn test_duplicates_are_recorded_and_capped() {
        let mut q = ReceivedQueue::new();
        assert!(q.push(5, 3));
        assert!(!q.push(5, 3));
        assert!(!q.push(2, 3));
        assert_eq!(q.pop_duplicates(), vec![5, 2]);
        assert!(!q.has_duplicates());

        for _ in 0..40 {
            q.push(1, 3);
        }
        assert_eq!(q.pop_duplicates().len(), MAX_DUPLICATE_TSNS);
    }

    #[test]
    fn test_advance_and_drop_through() {
        let mut q = ReceivedQueue::new();
        q.push(2, 0);
        q.push(3, 0);
        q.push(5, 0);
        assert_eq!(q.advance(0), 0);
        q.push(1, 0);
        assert_eq!(q.advance(0), 3);
        assert_eq!(q.len(), 1);

        q.push(7, 3);
        q.drop_through(6);
        assert!(!q.contains(5));
        assert!(q.contains(7));
    }

    #[test]
    fn test_fills_hole() {
        let mut q = ReceivedQueue::new();
        assert!(!q.fills_hole(11));
        q.push(13, 10);
        assert!(q.fills_hole(11));
        assert!(q.fills_hole(12));
        assert!(!q.fills_hole(14));
    }
}
