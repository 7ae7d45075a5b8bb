//! In-memory recency index over the reading log.

use crate::types::{ChangeOperation, ReadingId};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Maps live reading ids to the offset of their newest log entry.
///
/// Ids are assigned in creation order, so the last key is the most
/// recently created reading that has not been deleted.
pub struct ReadingIndex {
    offsets: RwLock<BTreeMap<ReadingId, u64>>,
}

impl ReadingIndex {
    pub fn new() -> Self {
        Self {
            offsets: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record a log entry.
    pub fn apply(&self, operation: ChangeOperation, id: ReadingId, offset: u64) {
        let mut offsets = self.offsets.write();
        match operation {
            ChangeOperation::Created | ChangeOperation::Updated => {
                offsets.insert(id, offset);
            }
            ChangeOperation::Deleted => {
                offsets.remove(&id);
            }
        }
    }

    /// Offset of the newest entry for a reading.
    pub fn get_offset(&self, id: ReadingId) -> Option<u64> {
        self.offsets.read().get(&id).copied()
    }

    /// Most recently created live reading.
    pub fn latest(&self) -> Option<(ReadingId, u64)> {
        self.offsets
            .read()
            .iter()
            .next_back()
            .map(|(id, offset)| (*id, *offset))
    }

    /// All live readings in creation order.
    pub fn entries(&self) -> Vec<(ReadingId, u64)> {
        self.offsets
            .read()
            .iter()
            .map(|(id, offset)| (*id, *offset))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.offsets.read().len()
    }
}

impl Default for ReadingIndex {
    fn default() -> Self {
        Self::new()
    }
}
