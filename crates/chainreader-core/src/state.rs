//! A bounded, contiguous, height-indexed window of synced blocks.

use std::collections::HashMap;

use chrono::Utc;

use crate::error::ReaderError;
use crate::snapshot::ReaderStateSnapshot;
use crate::types::Block;

/// The window of recently synced blocks.
///
/// Populated heights always form the run `[first_block_height, current_height]`
/// and never exceed `blocks_limit`; the oldest block is evicted on overflow.
#[derive(Debug, Clone)]
pub struct ReaderState {
    blocks: HashMap<u64, Block>,
    blocks_limit: usize,
    current_height: u64,
    first_block_height: u64,
    blocks_count: usize,
}

impl ReaderState {
    /// Create an empty state that retains at most `blocks_limit` blocks.
    pub fn new(blocks_limit: usize) -> Self {
        Self {
            blocks: HashMap::with_capacity(blocks_limit),
            blocks_limit,
            current_height: 0,
            first_block_height: 0,
            blocks_count: 0,
        }
    }

    /// Seed a state from a persisted snapshot.
    pub fn from_snapshot(
        snapshot: &ReaderStateSnapshot,
        blocks_limit: usize,
    ) -> Result<Self, ReaderError> {
        let mut state = Self::new(blocks_limit);
        for block in &snapshot.blocks {
            state.add_block(block.clone())?;
        }
        Ok(state)
    }

    /// Append `block` on top of the window.
    ///
    /// Fails unless the window is empty or `block` sits exactly one height
    /// above the current block.
    pub fn add_block(&mut self, block: Block) -> Result<(), ReaderError> {
        if !self.is_empty() && block.height != self.current_height + 1 {
            return Err(ReaderError::BlockSequence {
                expected: self.current_height + 1,
                actual: block.height,
            });
        }
        if self.is_empty() {
            self.first_block_height = block.height;
        }
        self.current_height = block.height;
        self.blocks.insert(block.height, block);
        self.blocks_count += 1;
        self.trim();
        Ok(())
    }

    /// Drop the block at the current height. No-op when empty.
    pub fn remove_last_block(&mut self) {
        if self.is_empty() {
            return;
        }
        self.blocks.remove(&self.current_height);
        self.blocks_count -= 1;
        if self.blocks_count == 0 {
            self.clear();
            return;
        }
        self.current_height -= 1;
    }

    /// Blocks from `first_block_height` to `current_height`, in height order.
    pub fn blocks(&self) -> Vec<Block> {
        if self.is_empty() {
            return vec![];
        }
        (self.first_block_height..=self.current_height)
            .filter_map(|height| self.blocks.get(&height).cloned())
            .collect()
    }

    /// The most recently added block.
    pub fn last_block(&self) -> Option<&Block> {
        self.blocks.get(&self.current_height)
    }

    /// Returns a block by height if it is in the window.
    pub fn get(&self, height: u64) -> Option<&Block> {
        self.blocks.get(&height)
    }

    pub fn first_block_height(&self) -> u64 {
        self.first_block_height
    }

    pub fn current_height(&self) -> u64 {
        self.current_height
    }

    pub fn blocks_count(&self) -> usize {
        self.blocks_count
    }

    pub fn blocks_limit(&self) -> usize {
        self.blocks_limit
    }

    pub fn is_empty(&self) -> bool {
        self.blocks_count == 0
    }

    /// Change the window size, evicting the oldest blocks when it shrinks.
    pub fn set_blocks_limit(&mut self, limit: usize) {
        let shrinking = limit < self.blocks_limit;
        self.blocks_limit = limit;
        if shrinking {
            self.trim();
        }
    }

    /// Reset to the empty state.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.current_height = 0;
        self.first_block_height = 0;
        self.blocks_count = 0;
    }

    /// Capture the window for persistence.
    pub fn snapshot(&self) -> ReaderStateSnapshot {
        ReaderStateSnapshot {
            blocks: self.blocks(),
            last_synced_at: Some(Utc::now()),
        }
    }

    fn trim(&mut self) {
        while self.blocks_count > self.blocks_limit {
            self.blocks.remove(&self.first_block_height);
            self.first_block_height += 1;
            self.blocks_count -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u64) -> Block {
        Block {
            height,
            hash: format!("h{height}"),
            previous_block_hash: Some(format!("h{}", height.saturating_sub(1))),
            next_block_hash: None,
            transaction_ids: vec![],
        }
    }

    fn heights(state: &ReaderState) -> Vec<u64> {
        state.blocks().iter().map(|b| b.height).collect()
    }

    #[test]
    fn add_contiguous_blocks() {
        let mut state = ReaderState::new(10);
        for h in 5..=8 {
            state.add_block(block(h)).unwrap();
        }
        assert_eq!(state.first_block_height(), 5);
        assert_eq!(state.current_height(), 8);
        assert_eq!(state.blocks_count(), 4);
        assert_eq!(heights(&state), vec![5, 6, 7, 8]);
        assert_eq!(state.last_block().unwrap().hash, "h8");
    }

    #[test]
    fn rejects_non_contiguous_insert() {
        let mut state = ReaderState::new(10);
        state.add_block(block(1)).unwrap();
        state.add_block(block(2)).unwrap();

        let gap = state.add_block(block(4));
        assert_eq!(
            gap,
            Err(ReaderError::BlockSequence {
                expected: 3,
                actual: 4
            })
        );
        assert!(state.add_block(block(2)).is_err());
        assert!(state.add_block(block(1)).is_err());
        assert_eq!(heights(&state), vec![1, 2]);
    }

    #[test]
    fn trims_oldest_first() {
        let mut state = ReaderState::new(3);
        for h in 1..=7 {
            state.add_block(block(h)).unwrap();
        }
        assert_eq!(state.blocks_count(), 3);
        assert_eq!(state.first_block_height(), 5);
        assert_eq!(heights(&state), vec![5, 6, 7]);
        assert!(state.get(4).is_none());
    }

    #[test]
    fn remove_last_block_until_empty() {
        let mut state = ReaderState::new(5);
        for h in 10..=12 {
            state.add_block(block(h)).unwrap();
        }
        state.remove_last_block();
        assert_eq!(heights(&state), vec![10, 11]);
        assert_eq!(state.current_height(), 11);

        state.remove_last_block();
        state.remove_last_block();
        assert!(state.is_empty());
        assert_eq!(state.first_block_height(), 0);
        assert_eq!(state.current_height(), 0);

        // no-op on empty
        state.remove_last_block();
        assert!(state.is_empty());

        // an empty window accepts any height again
        state.add_block(block(42)).unwrap();
        assert_eq!(state.first_block_height(), 42);
    }

    #[test]
    fn shrinking_limit_trims_window() {
        let mut state = ReaderState::new(10);
        for h in 1..=6 {
            state.add_block(block(h)).unwrap();
        }
        state.set_blocks_limit(2);
        assert_eq!(heights(&state), vec![5, 6]);

        state.set_blocks_limit(20);
        assert_eq!(heights(&state), vec![5, 6]);
    }

    #[test]
    fn window_stays_contiguous_under_mixed_operations() {
        let mut state = ReaderState::new(4);
        let mut next = 1;
        for step in 0..40u64 {
            if step % 5 == 3 {
                state.remove_last_block();
                next = if state.is_empty() { next } else { state.current_height() + 1 };
            } else {
                state.add_block(block(next)).unwrap();
                next += 1;
            }
            let hs = heights(&state);
            assert!(hs.len() <= 4);
            assert_eq!(hs.len(), state.blocks_count());
            assert!(hs.windows(2).all(|w| w[1] == w[0] + 1));
            if let (Some(first), Some(last)) = (hs.first(), hs.last()) {
                assert_eq!(*first, state.first_block_height());
                assert_eq!(*last, state.current_height());
            }
        }
    }

    #[test]
    fn clear_resets_everything() {
        let mut state = ReaderState::new(3);
        state.add_block(block(1)).unwrap();
        state.clear();
        assert!(state.is_empty());
        assert!(state.blocks().is_empty());
        assert!(state.last_block().is_none());
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut state = ReaderState::new(3);
        for h in 1..=4 {
            state.add_block(block(h)).unwrap();
        }
        let snapshot = state.snapshot();
        assert!(snapshot.last_synced_at.is_some());

        let restored = ReaderState::from_snapshot(&snapshot, 3).unwrap();
        assert_eq!(heights(&restored), vec![2, 3, 4]);
    }
}
