//! Block tracker — a sliding window of recently delivered block ids used to
//! tell re-deliveries apart from silent branch switches.

use std::collections::VecDeque;

use chainreader_core::types::BlockPosition;

/// A delivered block as the tracker remembers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedBlock {
    pub number: u64,
    pub id: String,
    pub prev_id: String,
}

/// What a newly arrived block means relative to what was already delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// The next block, linking to the previous one.
    Next,
    /// Same number and id as a block already delivered.
    Duplicate,
    /// A different block at or below the last delivered number: the node
    /// switched branches at this height.
    Replaces(u64),
    /// The next number, but its parent is not the block delivered before it.
    Unlinked { expected_prev: String },
    /// The next number, but its parent is not the block committed before this
    /// session: that committed block is no longer on the chain.
    Orphaned(u64),
    /// Blocks between the last delivered one and this one are missing.
    Gap { expected: u64 },
}

/// Tracks the last N delivered blocks.
pub struct BlockTracker {
    /// Oldest first.
    window: VecDeque<TrackedBlock>,
    window_size: usize,
    /// Number the next block must carry.
    expected: u64,
    /// Window entries at or below this number came from [`BlockTracker::resume`].
    committed_through: Option<u64>,
}

impl BlockTracker {
    /// A tracker expecting `start_block` first.
    pub fn new(window_size: usize, start_block: u64) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size.min(1024)),
            window_size: window_size.max(1),
            expected: start_block,
            committed_through: None,
        }
    }

    /// A tracker expecting `start_block`, seeded with blocks committed in
    /// earlier sessions. Only blocks below `start_block` are kept.
    pub fn resume(window_size: usize, start_block: u64, committed: &[BlockPosition]) -> Self {
        let mut tracker = Self::new(window_size, start_block);
        let mut seeds: Vec<&BlockPosition> = committed.iter().filter(|p| p.block_num < start_block).collect();
        seeds.sort_by_key(|p| p.block_num);
        for seed in seeds {
            tracker.push(TrackedBlock {
                number: seed.block_num,
                id: seed.block_id.clone(),
                prev_id: String::new(),
            });
        }
        tracker.committed_through = tracker.head().map(|b| b.number);
        tracker.expected = start_block;
        tracker
    }

    /// Every tracked block, oldest first.
    pub fn positions(&self) -> Vec<BlockPosition> {
        self.window
            .iter()
            .map(|b| BlockPosition {
                block_num: b.number,
                block_id: b.id.clone(),
            })
            .collect()
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Last delivered block.
    pub fn head(&self) -> Option<&TrackedBlock> {
        self.window.back()
    }

    pub fn get(&self, number: u64) -> Option<&TrackedBlock> {
        self.window.iter().rev().find(|b| b.number == number)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Classify a block without recording it.
    pub fn classify(&self, number: u64, id: &str, prev_id: &str) -> Arrival {
        if number > self.expected {
            return Arrival::Gap {
                expected: self.expected,
            };
        }
        if number < self.expected {
            return match self.get(number) {
                Some(seen) if seen.id == id => Arrival::Duplicate,
                // below the window: nothing to compare, assume a re-delivery
                None if self.window.front().map_or(true, |f| number < f.number) => Arrival::Duplicate,
                _ => Arrival::Replaces(number),
            };
        }
        match self.get(number.wrapping_sub(1)) {
            Some(parent) if !prev_id.is_empty() && parent.id != prev_id => {
                if self.committed_through.is_some_and(|c| parent.number <= c) {
                    Arrival::Orphaned(parent.number)
                } else {
                    Arrival::Unlinked {
                        expected_prev: parent.id.clone(),
                    }
                }
            }
            _ => Arrival::Next,
        }
    }

    /// Record a delivered block; it becomes the head.
    pub fn push(&mut self, block: TrackedBlock) {
        self.rewind_to(block.number.saturating_sub(1));
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.expected = block.number + 1;
        self.window.push_back(block);
    }

    /// Forget everything after `block_number`; the next block is `block_number + 1`.
    pub fn rewind_to(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.number > block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
        self.expected = block_number + 1;
        self.committed_through = self.committed_through.map(|c| c.min(block_number));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, id: &str, prev: &str) -> TrackedBlock {
        TrackedBlock {
            number,
            id: id.into(),
            prev_id: prev.into(),
        }
    }

    #[test]
    fn push_normal_chain() {
        let mut tracker = BlockTracker::new(10, 100);
        tracker.push(block(100, "a", "0"));
        assert_eq!(tracker.classify(101, "b", "a"), Arrival::Next);
        tracker.push(block(101, "b", "a"));
        tracker.push(block(102, "c", "b"));
        assert_eq!(tracker.head().unwrap().number, 102);
        assert_eq!(tracker.expected(), 103);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn classifies_duplicates_replacements_and_gaps() {
        let mut tracker = BlockTracker::new(10, 100);
        tracker.push(block(100, "a", "0"));
        tracker.push(block(101, "b", "a"));

        assert_eq!(tracker.classify(101, "b", "a"), Arrival::Duplicate);
        assert_eq!(tracker.classify(101, "b2", "a"), Arrival::Replaces(101));
        assert_eq!(tracker.classify(104, "x", "y"), Arrival::Gap { expected: 102 });
        assert_eq!(
            tracker.classify(102, "c", "b-other"),
            Arrival::Unlinked {
                expected_prev: "b".into()
            }
        );
        // unknown parent link is accepted
        assert_eq!(tracker.classify(102, "c", ""), Arrival::Next);
        // below the window
        assert_eq!(tracker.classify(50, "z", ""), Arrival::Duplicate);
    }

    #[test]
    fn rewind_to() {
        let mut tracker = BlockTracker::new(20, 100);
        for i in 100..=110 {
            let prev = if i == 100 { "0".to_string() } else { format!("{}", i - 1) };
            tracker.push(block(i, &format!("{i}"), &prev));
        }
        assert_eq!(tracker.head().unwrap().number, 110);
        tracker.rewind_to(105);
        assert_eq!(tracker.head().unwrap().number, 105);
        assert_eq!(tracker.expected(), 106);
    }

    #[test]
    fn replacing_push_drops_the_old_branch() {
        let mut tracker = BlockTracker::new(10, 100);
        tracker.push(block(100, "a", "0"));
        tracker.push(block(101, "b", "a"));
        tracker.push(block(102, "c", "b"));
        tracker.push(block(101, "b2", "a"));
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.expected(), 102);
        assert_eq!(tracker.get(101).unwrap().id, "b2");
    }

    fn position(number: u64, id: &str) -> BlockPosition {
        BlockPosition {
            block_num: number,
            block_id: id.into(),
        }
    }

    #[test]
    fn resumed_tracker_checks_the_committed_parent() {
        let committed = [position(102, "b102"), position(103, "a103"), position(200, "ignored")];
        let tracker = BlockTracker::resume(10, 104, &committed);
        assert_eq!(tracker.expected(), 104);
        assert_eq!(tracker.positions(), vec![position(102, "b102"), position(103, "a103")]);

        assert_eq!(tracker.classify(104, "a104", "a103"), Arrival::Next);
        assert_eq!(tracker.classify(104, "b104", "b103"), Arrival::Orphaned(103));
        assert_eq!(tracker.classify(103, "b103", "b102"), Arrival::Replaces(103));
    }

    #[test]
    fn orphan_check_follows_the_committed_chain_down() {
        let committed = [position(102, "a102"), position(103, "a103")];
        let mut tracker = BlockTracker::resume(10, 104, &committed);
        tracker.rewind_to(102);
        assert_eq!(tracker.classify(103, "b103", "b102"), Arrival::Orphaned(102));
        tracker.rewind_to(101);
        // nothing known below: accepted
        assert_eq!(tracker.classify(102, "b102", "b101"), Arrival::Next);
    }

    #[test]
    fn blocks_of_this_session_are_not_orphans() {
        let mut tracker = BlockTracker::resume(10, 101, &[position(100, "a")]);
        tracker.push(block(101, "b", "a"));
        tracker.push(block(102, "c", "b"));
        assert_eq!(
            tracker.classify(103, "d", "x"),
            Arrival::Unlinked {
                expected_prev: "c".into()
            }
        );
        // a replaced committed block stops counting as committed
        tracker.push(block(100, "a2", "z"));
        tracker.push(block(101, "b2", "a2"));
        assert_eq!(
            tracker.classify(102, "c2", "x"),
            Arrival::Unlinked {
                expected_prev: "b2".into()
            }
        );
    }

    #[test]
    fn window_size_enforced() {
        let mut tracker = BlockTracker::new(5, 0);
        for i in 0..10 {
            let prev = if i == 0 { "0".to_string() } else { format!("{}", i - 1) };
            tracker.push(block(i, &format!("{i}"), &prev));
        }
        assert_eq!(tracker.len(), 5); // oldest blocks evicted
    }
}
