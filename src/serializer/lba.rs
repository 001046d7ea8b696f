//! # Logical Block Address Index
//!
//! Maps each logical block id to the disk offset of its current copy. The
//! map is authoritative in memory and persisted wholesale with every
//! metablock publish; on restart it is the sole source for reconstructing
//! extent liveness.
//!
//! Garbage collection moves blocks without their owners noticing; an
//! optional observer is told about every such remap so callers that cache
//! offsets (or tests asserting move behavior) can track them.

use hashbrown::HashMap;

use crate::{BlockId, DiskOff};

/// Called with `(block_id, new_offset)` whenever the collector moves a block.
pub type RemapObserver = Box<dyn FnMut(BlockId, DiskOff) + Send>;

pub struct LbaIndex {
    map: HashMap<BlockId, DiskOff>,
    observer: Option<RemapObserver>,
}

impl LbaIndex {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            observer: None,
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (BlockId, DiskOff)>) -> Self {
        Self {
            map: entries.into_iter().collect(),
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: RemapObserver) {
        self.observer = Some(observer);
    }

    pub fn get(&self, block_id: BlockId) -> Option<DiskOff> {
        self.map.get(&block_id).copied()
    }

    /// Points `block_id` at `offset`, returning the displaced offset.
    pub fn set(&mut self, block_id: BlockId, offset: DiskOff) -> Option<DiskOff> {
        self.map.insert(block_id, offset)
    }

    /// Like [`set`](Self::set), but for collector moves: notifies the
    /// observer.
    pub fn set_from_move(&mut self, block_id: BlockId, offset: DiskOff) -> Option<DiskOff> {
        let old = self.map.insert(block_id, offset);
        if let Some(observer) = self.observer.as_mut() {
            observer(block_id, offset);
        }
        old
    }

    pub fn remove(&mut self, block_id: BlockId) -> Option<DiskOff> {
        self.map.remove(&block_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn offsets(&self) -> impl Iterator<Item = DiskOff> + '_ {
        self.map.values().copied()
    }

    pub fn entries_vec(&self) -> Vec<(BlockId, DiskOff)> {
        self.map.iter().map(|(&id, &off)| (id, off)).collect()
    }

    /// Highest block id in a slice's lane of the striped id space, where the
    /// lane holds ids congruent to `rank` modulo `count`.
    pub fn max_block_id_in_lane(&self, rank: u64, count: u64) -> Option<BlockId> {
        self.map
            .keys()
            .copied()
            .filter(|id| id % count == rank)
            .max()
    }
}

impl Default for LbaIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_returns_displaced_offset() {
        let mut lba = LbaIndex::new();
        assert_eq!(lba.set(5, 100), None);
        assert_eq!(lba.set(5, 200), Some(100));
        assert_eq!(lba.get(5), Some(200));
    }

    #[test]
    fn moves_notify_the_observer() {
        let moves = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&moves);

        let mut lba = LbaIndex::new();
        lba.set(9, 4096);
        lba.set_observer(Box::new(move |id, off| sink.lock().push((id, off))));

        lba.set_from_move(9, 8192);
        lba.set(9, 12288); // plain writes do not notify

        assert_eq!(*moves.lock(), vec![(9, 8192)]);
    }

    #[test]
    fn lane_maximum_respects_striping() {
        // Two slices striped over one file: even ids are rank 0, odd rank 1.
        let mut lba = LbaIndex::new();
        for id in [0u64, 2, 4, 1, 3, 7] {
            lba.set(id, id as i64 * 4096);
        }
        assert_eq!(lba.max_block_id_in_lane(0, 2), Some(4));
        assert_eq!(lba.max_block_id_in_lane(1, 2), Some(7));
        assert_eq!(lba.max_block_id_in_lane(0, 1), Some(7));
        assert_eq!(LbaIndex::new().max_block_id_in_lane(0, 2), None);
    }
}
