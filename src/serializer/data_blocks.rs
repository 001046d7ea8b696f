//! # Data Block Manager
//!
//! Places logical blocks into extents on disk, tracks which copies are
//! garbage, and reclaims sparse extents with a copying collector.
//!
//! ## Placement
//!
//! Writes are append-only within the active extent: the next block slot is
//! `active.offset + filled * block_size`. When the active extent fills, it
//! is demoted to *young* and a fresh extent is taken from the allocator.
//! Offsets are chosen synchronously; the disk write completes later through
//! the owning core's task queue.
//!
//! ## Extent Lifecycle
//!
//! ```text
//! reconstructing ──end_reconstruct──> young        (restart path)
//!      new ──> active ──extent full──> young ──aged──> old ──> in_gc ──> gone
//! ```
//!
//! Every live extent has a `GcEntry` carrying its garbage bitmap (bit set =
//! slot never written, or written and later discarded), its creation
//! timestamp and its queue position. Entries live in a generation-checked
//! arena; a two-level sparse table maps extent id to arena slot; young
//! extents sit in a FIFO, old ones in an indexed max-heap keyed by garbage
//! count (ties break toward the lower offset).
//!
//! ## Collection
//!
//! A pass starts when the garbage ratio across old extents crosses
//! `gc_high_ratio`, and keeps consuming candidates while the ratio stays
//! above `gc_low_ratio` and the next candidate is at least `gc_min_ratio`
//! garbage. One extent is processed at a time through a three-step machine:
//!
//! ```text
//! ready -> read   issue reads of every live block into the scratch buffer
//! read  -> write  re-check the bitmap, rewrite survivors via the normal
//!                 write path, publish each remap to the address table
//! write -> ready  flush the metablock, release the extent, next candidate
//! ```
//!
//! In-flight reads and writes are refcounted; `disable_gc` and `shutdown`
//! only observe the machine back in `ready` once the refcount drains. A
//! block discarded between the read and write steps is skipped, never
//! resurrected: the bitmap is consulted again at write issue, under the
//! single-threaded core invariant.
//!
//! ## Fully-Garbage Fast Path
//!
//! An extent whose last live block is discarded is handed straight back to
//! the allocator without copying, from whichever queue it was in.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, info, trace};
use zerocopy::{FromBytes, IntoBytes};

use crate::config::{SerDynamicConfig, SerStaticConfig, BLOCK_TRAILER_SIZE};
use crate::exec::{CoreContext, DoneCallback, Handle};
use crate::extent::ExtentAllocator;
use crate::io::{BlockDevice, SharedDevice};
use crate::serializer::metablock::MetablockSnapshot;
use crate::serializer::{BlockTrailer, LogSerializer, ReadCompletion, WriteCompletion};
use crate::{BlockId, DiskOff};

pub(crate) fn current_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Garbage bitmap
// ============================================================================

/// Per-extent bitmap; a set bit marks a slot holding no live data.
#[derive(Debug, Clone)]
struct GarbageBitmap {
    words: Vec<u64>,
    len: usize,
    garbage: usize,
}

impl GarbageBitmap {
    fn all_set(len: usize) -> Self {
        Self {
            words: vec![!0u64; len.div_ceil(64)],
            len,
            garbage: len,
        }
    }

    fn test(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize) -> bool {
        if self.test(i) {
            return false;
        }
        self.words[i / 64] |= 1u64 << (i % 64);
        self.garbage += 1;
        true
    }

    fn clear(&mut self, i: usize) -> bool {
        if !self.test(i) {
            return false;
        }
        self.words[i / 64] &= !(1u64 << (i % 64));
        self.garbage -= 1;
        true
    }

    fn garbage_count(&self) -> usize {
        self.garbage
    }

    fn is_all_garbage(&self) -> bool {
        self.garbage == self.len
    }
}

// ============================================================================
// GC entries, arena, extent table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GcEntryState {
    /// Being rebuilt from the address table after a restart.
    Reconstructing,
    /// The extent currently receiving writes.
    Active,
    /// Filled recently; likely to lose more blocks soon, so not collected.
    Young,
    /// Aged out of the young queue; a collection candidate.
    Old,
    /// Currently being copied out.
    InGc,
}

#[derive(Debug)]
struct GcEntry {
    offset: DiskOff,
    g_array: GarbageBitmap,
    timestamp_us: u64,
    state: GcEntryState,
    heap_index: Option<usize>,
}

impl GcEntry {
    fn new_active(offset: DiskOff, blocks_per_extent: usize) -> Self {
        Self {
            offset,
            g_array: GarbageBitmap::all_set(blocks_per_extent),
            timestamp_us: current_time_us(),
            state: GcEntryState::Active,
            heap_index: None,
        }
    }

    fn new_reconstructing(offset: DiskOff, blocks_per_extent: usize) -> Self {
        Self {
            offset,
            g_array: GarbageBitmap::all_set(blocks_per_extent),
            timestamp_us: 0,
            state: GcEntryState::Reconstructing,
            heap_index: None,
        }
    }
}

type EntryIdx = usize;

struct ArenaSlot {
    gen: u64,
    entry: Option<GcEntry>,
}

/// Slab of entries addressed by index. Generations let the lazily-cleaned
/// young FIFO detect that a slot was recycled.
struct EntryArena {
    slots: Vec<ArenaSlot>,
    free: Vec<EntryIdx>,
    next_gen: u64,
}

impl EntryArena {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_gen: 1,
        }
    }

    fn insert(&mut self, entry: GcEntry) -> (EntryIdx, u64) {
        let gen = self.next_gen;
        self.next_gen += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = ArenaSlot {
                    gen,
                    entry: Some(entry),
                };
                (idx, gen)
            }
            None => {
                self.slots.push(ArenaSlot {
                    gen,
                    entry: Some(entry),
                });
                (self.slots.len() - 1, gen)
            }
        }
    }

    fn get(&self, idx: EntryIdx) -> &GcEntry {
        self.slots[idx].entry.as_ref().expect("stale gc entry index") // INVARIANT: callers hold live indices
    }

    fn get_mut(&mut self, idx: EntryIdx) -> &mut GcEntry {
        self.slots[idx].entry.as_mut().expect("stale gc entry index")
    }

    fn gen(&self, idx: EntryIdx) -> u64 {
        self.slots[idx].gen
    }

    fn is_live(&self, idx: EntryIdx) -> bool {
        self.slots.get(idx).map_or(false, |s| s.entry.is_some())
    }

    fn remove(&mut self, idx: EntryIdx) -> GcEntry {
        let entry = self.slots[idx].entry.take().expect("stale gc entry index");
        self.free.push(idx);
        entry
    }

    fn live(&self) -> impl Iterator<Item = (EntryIdx, &GcEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.entry.as_ref().map(|e| (i, e)))
    }
}

const EXTENT_CHUNK: usize = 1024;

/// Two-level sparse map from extent id to arena slot.
struct ExtentTable {
    chunks: Vec<Option<Box<[Option<EntryIdx>; EXTENT_CHUNK]>>>,
}

impl ExtentTable {
    fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    fn get(&self, extent_id: usize) -> Option<EntryIdx> {
        self.chunks
            .get(extent_id / EXTENT_CHUNK)?
            .as_ref()?[extent_id % EXTENT_CHUNK]
    }

    fn set(&mut self, extent_id: usize, idx: EntryIdx) {
        let chunk_no = extent_id / EXTENT_CHUNK;
        if chunk_no >= self.chunks.len() {
            self.chunks.resize_with(chunk_no + 1, || None);
        }
        let chunk = self.chunks[chunk_no].get_or_insert_with(|| Box::new([None; EXTENT_CHUNK]));
        chunk[extent_id % EXTENT_CHUNK] = Some(idx);
    }

    fn clear(&mut self, extent_id: usize) {
        if let Some(Some(chunk)) = self.chunks.get_mut(extent_id / EXTENT_CHUNK) {
            chunk[extent_id % EXTENT_CHUNK] = None;
        }
    }
}

// ============================================================================
// GC state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GcStep {
    Ready,
    Read,
    Write,
}

/// What the collector needs from its owner after a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcSignal {
    None,
    /// Every surviving block of the current candidate has been rewritten
    /// (or none survived). Publish the metablock, then call
    /// [`DataBlockManager::gc_finalize`].
    ExtentCopied,
}

struct GcState {
    step: GcStep,
    should_be_stopped: bool,
    refcount: usize,
    scratch: Vec<u8>,
    current_entry: Option<EntryIdx>,
    active_pass: bool,
    disable_callbacks: Vec<DoneCallback>,
}

/// Liveness accounting across old extents, the population the collector
/// chooses from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub old_total_blocks: u64,
    pub old_garbage_blocks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Unstarted,
    Ready,
    ShuttingDown,
    ShutDown,
}

// ============================================================================
// Manager
// ============================================================================

pub struct DataBlockManager {
    state: ManagerState,
    block_size: usize,
    extent_size: usize,
    blocks_per_extent: usize,
    dynamic: SerDynamicConfig,
    device: SharedDevice,
    extents: ExtentAllocator,
    arena: EntryArena,
    extent_table: ExtentTable,
    /// Young extents in fill order; stale (recycled) indices are skipped.
    young: VecDeque<(EntryIdx, u64)>,
    /// Indexed max-heap of old extents by garbage count.
    old_heap: Vec<EntryIdx>,
    last_data_extent: Option<EntryIdx>,
    blocks_in_last_data_extent: usize,
    gc: GcState,
    stats: GcStats,
    gc_enabled: bool,
    reconstructing: bool,
    recovered_active: Option<(DiskOff, usize)>,
    shutdown_callback: Option<DoneCallback>,
}

impl DataBlockManager {
    pub fn new(
        device: SharedDevice,
        static_config: &SerStaticConfig,
        dynamic: SerDynamicConfig,
    ) -> Self {
        Self {
            state: ManagerState::Unstarted,
            block_size: static_config.block_size,
            extent_size: static_config.extent_size,
            blocks_per_extent: static_config.blocks_per_extent(),
            dynamic,
            device,
            extents: ExtentAllocator::new(static_config.extent_size),
            arena: EntryArena::new(),
            extent_table: ExtentTable::new(),
            young: VecDeque::new(),
            old_heap: Vec::new(),
            last_data_extent: None,
            blocks_in_last_data_extent: 0,
            gc: GcState {
                step: GcStep::Ready,
                should_be_stopped: false,
                refcount: 0,
                scratch: vec![0u8; static_config.extent_size],
                current_entry: None,
                active_pass: false,
                disable_callbacks: Vec::new(),
            },
            stats: GcStats::default(),
            gc_enabled: true,
            reconstructing: false,
            recovered_active: None,
            shutdown_callback: None,
        }
    }

    fn extent_id(&self, off: DiskOff) -> usize {
        (off / self.extent_size as DiskOff) as usize
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Initializes over a freshly created file; nothing to reconstruct.
    pub fn start_new(&mut self) {
        assert_eq!(self.state, ManagerState::Unstarted);
        self.state = ManagerState::Ready;
    }

    /// Resumes from the metablock of an existing file. The caller follows
    /// with `start_reconstruct`, one `mark_live` per address-table offset,
    /// and `end_reconstruct`.
    pub fn start_existing(&mut self, snapshot: &MetablockSnapshot) {
        assert_eq!(self.state, ManagerState::Unstarted);
        self.recovered_active = snapshot
            .last_data_extent
            .map(|off| (off, snapshot.blocks_in_last_data_extent));
        self.state = ManagerState::Ready;
    }

    pub fn start_reconstruct(&mut self) {
        assert_eq!(self.state, ManagerState::Ready);
        assert!(!self.reconstructing);
        self.reconstructing = true;
    }

    /// Declares the block at `off` live during reconstruction.
    pub fn mark_live(&mut self, off: DiskOff) -> Result<()> {
        assert!(self.reconstructing);
        ensure!(
            off >= self.extent_size as DiskOff,
            "live block offset {} lies inside the metablock extent",
            off
        );
        let extent_id = self.extent_id(off);
        let idx = match self.extent_table.get(extent_id) {
            Some(idx) => idx,
            None => {
                let extent_off = (extent_id * self.extent_size) as DiskOff;
                let (idx, _gen) = self.arena.insert(GcEntry::new_reconstructing(
                    extent_off,
                    self.blocks_per_extent,
                ));
                self.extent_table.set(extent_id, idx);
                idx
            }
        };
        let block_index = (off % self.extent_size as DiskOff) as usize / self.block_size;
        self.arena.get_mut(idx).g_array.clear(block_index);
        Ok(())
    }

    /// Finishes reconstruction: extents become young, except the one the
    /// metablock named active, which resumes filling where it left off.
    pub fn end_reconstruct(&mut self) {
        assert!(self.reconstructing);

        if let Some((active_off, _)) = self.recovered_active {
            let extent_id = self.extent_id(active_off);
            if self.extent_table.get(extent_id).is_none() {
                let (idx, _gen) = self
                    .arena
                    .insert(GcEntry::new_reconstructing(active_off, self.blocks_per_extent));
                self.extent_table.set(extent_id, idx);
            }
        }

        let reconstructed: Vec<EntryIdx> = self
            .arena
            .live()
            .filter(|(_, e)| e.state == GcEntryState::Reconstructing)
            .map(|(i, _)| i)
            .collect();

        let now = current_time_us();
        for idx in reconstructed {
            let is_active = {
                let entry = self.arena.get(idx);
                self.recovered_active
                    .map(|(off, _)| off == entry.offset)
                    .unwrap_or(false)
            };
            let gen = self.arena.gen(idx);
            let entry = self.arena.get_mut(idx);
            entry.timestamp_us = now;
            if is_active {
                entry.state = GcEntryState::Active;
                self.last_data_extent = Some(idx);
            } else {
                entry.state = GcEntryState::Young;
                self.young.push_back((idx, gen));
            }
        }

        self.blocks_in_last_data_extent = self
            .recovered_active
            .map(|(_, filled)| filled)
            .unwrap_or(0);

        let live: Vec<DiskOff> = self.arena.live().map(|(_, e)| e.offset).collect();
        self.extents = ExtentAllocator::rebuild(self.extent_size, live);
        self.reconstructing = false;

        info!(
            extents = self.arena.live().count(),
            end = self.extents.end(),
            "reconstruction finished"
        );
    }

    // ------------------------------------------------------------------
    // Reads and writes
    // ------------------------------------------------------------------

    /// Reserves the next slot in the active extent, rotating to a fresh
    /// extent when full.
    fn gimme_a_new_offset(&mut self) -> Result<DiskOff> {
        let needs_rotation = match self.last_data_extent {
            None => true,
            Some(_) => self.blocks_in_last_data_extent == self.blocks_per_extent,
        };

        if needs_rotation {
            if let Some(prev) = self.last_data_extent.take() {
                let all_garbage = self.arena.get(prev).g_array.is_all_garbage();
                if all_garbage {
                    // Everything written here has already been discarded.
                    self.release_entry(prev)?;
                } else {
                    let gen = self.arena.gen(prev);
                    self.arena.get_mut(prev).state = GcEntryState::Young;
                    self.young.push_back((prev, gen));
                }
            }
            let off = self.extents.gen_extent();
            let (idx, _gen) = self
                .arena
                .insert(GcEntry::new_active(off, self.blocks_per_extent));
            self.extent_table.set(self.extent_id(off), idx);
            self.last_data_extent = Some(idx);
            self.blocks_in_last_data_extent = 0;
            debug!(offset = off, "data extent opened");
        }

        let idx = self.last_data_extent.expect("active extent after rotation");
        let block_index = self.blocks_in_last_data_extent;
        let entry = self.arena.get_mut(idx);
        entry.g_array.clear(block_index);
        let off = entry.offset + (block_index * self.block_size) as DiskOff;
        self.blocks_in_last_data_extent += 1;
        Ok(off)
    }

    /// Places `block` (a full `block_size` buffer) at a fresh offset,
    /// stamps its trailer, and issues the disk write. The offset is chosen
    /// synchronously and returned; `completion` always fires exactly once,
    /// carrying any failure (in which case the returned offset is -1).
    pub fn write(
        &mut self,
        cx: &mut CoreContext,
        block: Vec<u8>,
        block_id: BlockId,
        completion: WriteCompletion,
    ) -> DiskOff {
        assert_eq!(self.state, ManagerState::Ready, "write on stopped manager");
        assert!(!self.reconstructing, "write during reconstruction");
        self.mark_unyoung_entries();
        self.write_internal(cx, block, block_id, completion)
    }

    fn write_internal(
        &mut self,
        cx: &mut CoreContext,
        mut block: Vec<u8>,
        block_id: BlockId,
        completion: WriteCompletion,
    ) -> DiskOff {
        assert_eq!(
            block.len(),
            self.block_size,
            "block buffer sized to the block"
        );
        let off = match self.gimme_a_new_offset() {
            Ok(off) => off,
            Err(err) => {
                cx.defer(move |cx| completion(cx, -1, Err(err)));
                return -1;
            }
        };
        let trailer = BlockTrailer::new(block_id);
        let trailer_at = self.block_size - BLOCK_TRAILER_SIZE;
        block[trailer_at..].copy_from_slice(trailer.as_bytes());

        let device = Arc::clone(&self.device);
        cx.dispatch(cx.id(), move |cx| {
            let res = device.write_at(off as u64, &block);
            completion(cx, off, res);
        });
        off
    }

    /// Reads the block at `off`; `completion` receives the raw block bytes
    /// (trailer included).
    pub fn read(&self, cx: &mut CoreContext, off: DiskOff, completion: ReadCompletion) {
        assert_ne!(self.state, ManagerState::ShutDown, "read on stopped manager");
        let device = Arc::clone(&self.device);
        let block_size = self.block_size;
        cx.dispatch(cx.id(), move |cx| {
            let mut buf = vec![0u8; block_size];
            let res = device.read_at(off as u64, &mut buf).map(|_| buf);
            completion(cx, res);
        });
    }

    /// Declares the block copy at `off` dead. Fully-garbage extents are
    /// handed back to the allocator on the spot.
    pub fn mark_garbage(&mut self, off: DiskOff) -> Result<()> {
        let extent_id = self.extent_id(off);
        let idx = match self.extent_table.get(extent_id) {
            Some(idx) => idx,
            None => bail!("garbage mark for offset {} outside any live extent", off),
        };
        let block_index = (off % self.extent_size as DiskOff) as usize / self.block_size;

        let (changed, state, all_garbage) = {
            let entry = self.arena.get_mut(idx);
            let changed = entry.g_array.set(block_index);
            (changed, entry.state, entry.g_array.is_all_garbage())
        };
        if !changed {
            return Ok(());
        }
        trace!(offset = off, "block marked garbage");

        if state == GcEntryState::Old {
            self.stats.old_garbage_blocks += 1;
            if let Some(pos) = self.arena.get(idx).heap_index {
                self.heap_sift_up(pos);
            }
        }

        if all_garbage
            && matches!(state, GcEntryState::Young | GcEntryState::Old)
        {
            if state == GcEntryState::Old {
                if let Some(pos) = self.arena.get(idx).heap_index {
                    self.heap_remove_at(pos);
                }
                self.stats.old_total_blocks -= self.blocks_per_extent as u64;
                self.stats.old_garbage_blocks -= self.blocks_per_extent as u64;
            }
            // Young entries are cleaned out of the FIFO lazily.
            self.release_entry(idx)?;
        }
        Ok(())
    }

    fn release_entry(&mut self, idx: EntryIdx) -> Result<()> {
        let entry = self.arena.remove(idx);
        self.extent_table.clear(self.extent_id(entry.offset));
        debug!(offset = entry.offset, "extent released");
        if let Some(new_end) = self.extents.release_extent(entry.offset) {
            self.device.set_len(new_end as u64)?;
        }
        Ok(())
    }

    /// Publishes the active-extent coordinates for the next metablock.
    pub fn prepare_metablock(&self) -> MetablockSnapshot {
        MetablockSnapshot {
            last_data_extent: self.last_data_extent.map(|idx| self.arena.get(idx).offset),
            blocks_in_last_data_extent: self.blocks_in_last_data_extent,
        }
    }

    // ------------------------------------------------------------------
    // Young / old aging
    // ------------------------------------------------------------------

    fn mark_unyoung_entries(&mut self) {
        let now = current_time_us();
        let age = self.dynamic.gc_young_extent_age_us;
        while let Some(&(idx, gen)) = self.young.front() {
            let stale = !self.arena.is_live(idx)
                || self.arena.gen(idx) != gen
                || self.arena.get(idx).state != GcEntryState::Young;
            if stale {
                self.young.pop_front();
                continue;
            }
            if now.saturating_sub(self.arena.get(idx).timestamp_us) >= age {
                self.young.pop_front();
                self.make_old(idx);
            } else {
                break;
            }
        }
    }

    fn make_old(&mut self, idx: EntryIdx) {
        let garbage = {
            let entry = self.arena.get_mut(idx);
            entry.state = GcEntryState::Old;
            entry.g_array.garbage_count()
        };
        self.stats.old_total_blocks += self.blocks_per_extent as u64;
        self.stats.old_garbage_blocks += garbage as u64;
        self.heap_push(idx);
    }

    // ------------------------------------------------------------------
    // Old-extent heap (indexed binary max-heap by garbage count)
    // ------------------------------------------------------------------

    fn heap_before(&self, a: EntryIdx, b: EntryIdx) -> bool {
        let ea = self.arena.get(a);
        let eb = self.arena.get(b);
        let ga = ea.g_array.garbage_count();
        let gb = eb.g_array.garbage_count();
        ga > gb || (ga == gb && ea.offset < eb.offset)
    }

    fn heap_set(&mut self, pos: usize, idx: EntryIdx) {
        self.old_heap[pos] = idx;
        self.arena.get_mut(idx).heap_index = Some(pos);
    }

    fn heap_push(&mut self, idx: EntryIdx) {
        self.old_heap.push(idx);
        let pos = self.old_heap.len() - 1;
        self.arena.get_mut(idx).heap_index = Some(pos);
        self.heap_sift_up(pos);
    }

    fn heap_sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.heap_before(self.old_heap[pos], self.old_heap[parent]) {
                let (a, b) = (self.old_heap[pos], self.old_heap[parent]);
                self.heap_set(pos, b);
                self.heap_set(parent, a);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn heap_sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut best = pos;
            if left < self.old_heap.len() && self.heap_before(self.old_heap[left], self.old_heap[best])
            {
                best = left;
            }
            if right < self.old_heap.len()
                && self.heap_before(self.old_heap[right], self.old_heap[best])
            {
                best = right;
            }
            if best == pos {
                break;
            }
            let (a, b) = (self.old_heap[pos], self.old_heap[best]);
            self.heap_set(pos, b);
            self.heap_set(best, a);
            pos = best;
        }
    }

    fn heap_pop(&mut self) -> Option<EntryIdx> {
        if self.old_heap.is_empty() {
            return None;
        }
        let last = self.old_heap.len() - 1;
        self.old_heap.swap(0, last);
        let idx = self.old_heap.pop().expect("heap checked non-empty");
        self.arena.get_mut(idx).heap_index = None;
        if !self.old_heap.is_empty() {
            self.heap_set(0, self.old_heap[0]);
            self.heap_sift_down(0);
        }
        Some(idx)
    }

    fn heap_remove_at(&mut self, pos: usize) {
        let last = self.old_heap.len() - 1;
        let removed = self.old_heap[pos];
        self.old_heap.swap(pos, last);
        self.old_heap.pop();
        self.arena.get_mut(removed).heap_index = None;
        if pos < self.old_heap.len() {
            self.heap_set(pos, self.old_heap[pos]);
            self.heap_sift_down(pos);
            self.heap_sift_up(pos);
        }
    }

    fn heap_peek(&self) -> Option<EntryIdx> {
        self.old_heap.first().copied()
    }

    // ------------------------------------------------------------------
    // Collection policy
    // ------------------------------------------------------------------

    /// Ratio of garbage to total blocks across old extents.
    pub fn garbage_ratio(&self) -> f64 {
        if self.stats.old_total_blocks == 0 {
            0.0
        } else {
            self.stats.old_garbage_blocks as f64 / self.stats.old_total_blocks as f64
        }
    }

    pub fn gc_stats(&self) -> GcStats {
        self.stats
    }

    pub fn do_we_want_to_start_gcing(&self) -> bool {
        self.gc_enabled && self.garbage_ratio() > self.dynamic.gc_high_ratio
    }

    fn should_we_keep_gcing(&self, candidate: EntryIdx) -> bool {
        let local = self.arena.get(candidate).g_array.garbage_count() as f64
            / self.blocks_per_extent as f64;
        self.garbage_ratio() > self.dynamic.gc_low_ratio && local > self.dynamic.gc_min_ratio
    }

    // ------------------------------------------------------------------
    // Collection machine
    // ------------------------------------------------------------------

    /// Starts (or continues) a collection pass if thresholds say so. Called
    /// at mutation boundaries by the owning serializer.
    pub(crate) fn gc_tick(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
    ) -> Result<GcSignal> {
        if self.state != ManagerState::Ready
            || !self.gc_enabled
            || self.gc.should_be_stopped
            || self.gc.step != GcStep::Ready
            || self.reconstructing
        {
            return Ok(GcSignal::None);
        }
        self.mark_unyoung_entries();

        let candidate = match self.heap_peek() {
            Some(idx) => idx,
            None => {
                self.gc.active_pass = false;
                return Ok(GcSignal::None);
            }
        };
        let go = if self.gc.active_pass {
            self.should_we_keep_gcing(candidate)
        } else {
            self.do_we_want_to_start_gcing() && self.should_we_keep_gcing(candidate)
        };
        if !go {
            self.gc.active_pass = false;
            return Ok(GcSignal::None);
        }
        self.gc.active_pass = true;

        let idx = self.heap_pop().expect("peeked candidate vanished");
        let (offset, garbage) = {
            let entry = self.arena.get_mut(idx);
            entry.state = GcEntryState::InGc;
            (entry.offset, entry.g_array.garbage_count())
        };
        self.stats.old_total_blocks -= self.blocks_per_extent as u64;
        self.stats.old_garbage_blocks -= garbage as u64;
        self.gc.current_entry = Some(idx);

        let live: SmallVec<[usize; 32]> = (0..self.blocks_per_extent)
            .filter(|&i| !self.arena.get(idx).g_array.test(i))
            .collect();
        info!(
            offset,
            live = live.len(),
            garbage,
            "collecting extent"
        );

        if live.is_empty() {
            self.gc.step = GcStep::Write;
            return Ok(GcSignal::ExtentCopied);
        }

        self.gc.step = GcStep::Read;
        self.gc.refcount = live.len();
        let block_size = self.block_size;
        for i in live {
            let device = Arc::clone(&self.device);
            let off = offset + (i * block_size) as DiskOff;
            cx.dispatch(cx.id(), move |cx| {
                let mut buf = vec![0u8; block_size];
                let res = device.read_at(off as u64, &mut buf).map(|_| buf);
                cx.with(me, |s, cx| s.gc_read_complete(cx, me, i, res));
            });
        }
        Ok(GcSignal::None)
    }

    /// One collector read landed. When the last one does, survivors are
    /// rewritten through the normal write path and each remap is published
    /// through `lba`.
    pub(crate) fn gc_read_complete(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        block_index: usize,
        data: Vec<u8>,
        lba: &mut super::lba::LbaIndex,
    ) -> Result<GcSignal> {
        assert_eq!(self.gc.step, GcStep::Read, "collector read outside read step");
        let start = block_index * self.block_size;
        self.gc.scratch[start..start + self.block_size].copy_from_slice(&data);
        self.gc.refcount -= 1;
        if self.gc.refcount > 0 {
            return Ok(GcSignal::None);
        }

        self.set_step(cx, GcStep::Write);
        let idx = self.gc.current_entry.expect("write step without candidate");
        let offset = self.arena.get(idx).offset;

        // Blocks discarded while the reads were in flight are dropped here,
        // not resurrected.
        let survivors: SmallVec<[usize; 32]> = (0..self.blocks_per_extent)
            .filter(|&i| !self.arena.get(idx).g_array.test(i))
            .collect();
        if survivors.is_empty() {
            return Ok(GcSignal::ExtentCopied);
        }

        self.gc.refcount = survivors.len();
        for i in survivors {
            let start = i * self.block_size;
            let block = self.gc.scratch[start..start + self.block_size].to_vec();
            let trailer_at = self.block_size - BLOCK_TRAILER_SIZE;
            let trailer = BlockTrailer::read_from_bytes(&block[trailer_at..])
                .ok()
                .expect("trailer slice sized exactly"); // INVARIANT: slice is BLOCK_TRAILER_SIZE
            let block_id = trailer.block_id();
            let old_off = offset + (i * self.block_size) as DiskOff;
            ensure!(
                lba.get(block_id) == Some(old_off),
                "trailer names block {} at offset {} but the address table disagrees",
                block_id,
                old_off
            );
            self.write_internal(
                cx,
                block,
                block_id,
                Box::new(move |cx, new_off, res| {
                    cx.with(me, |s, cx| {
                        s.gc_write_complete(cx, me, block_id, old_off, new_off, res);
                    });
                }),
            );
        }
        Ok(GcSignal::None)
    }

    /// Whether the candidate's block at `old_off` is still live. Consulted
    /// when a copy-write completes: a block discarded in the meantime must
    /// not have its remap published.
    pub(crate) fn gc_block_still_live(&self, old_off: DiskOff) -> bool {
        let idx = self.gc.current_entry.expect("liveness check without candidate");
        let entry = self.arena.get(idx);
        let block_index = (old_off - entry.offset) as usize / self.block_size;
        !entry.g_array.test(block_index)
    }

    /// One collector rewrite landed (its remap is already published).
    pub(crate) fn gc_copy_done(&mut self) -> GcSignal {
        assert_eq!(self.gc.step, GcStep::Write, "collector write outside write step");
        self.gc.refcount -= 1;
        if self.gc.refcount == 0 {
            GcSignal::ExtentCopied
        } else {
            GcSignal::None
        }
    }

    /// Called once the metablock carrying the remaps is durable: returns the
    /// candidate's extent to the allocator and re-arms the machine.
    pub(crate) fn gc_finalize(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
    ) -> Result<()> {
        assert_eq!(self.gc.step, GcStep::Write, "finalize outside write step");
        let idx = self.gc.current_entry.take().expect("finalize without candidate");
        self.release_entry(idx)?;
        self.set_step(cx, GcStep::Ready);

        if self.state == ManagerState::Ready && self.gc_enabled && !self.gc.should_be_stopped {
            cx.defer(move |cx| {
                cx.with(me, |s: &mut LogSerializer, cx| s.drive_gc(cx, me));
            });
        }
        Ok(())
    }

    fn set_step(&mut self, cx: &mut CoreContext, next: GcStep) {
        let prev = self.gc.step;
        self.gc.step = next;
        if next == GcStep::Ready && matches!(prev, GcStep::Read | GcStep::Write) {
            if self.gc.should_be_stopped {
                for cb in self.gc.disable_callbacks.drain(..) {
                    cx.defer(move |cx| cb(cx));
                }
            }
            if self.state == ManagerState::ShuttingDown {
                self.actually_shutdown(cx);
            }
        }
    }

    // ------------------------------------------------------------------
    // Pause, resume, shutdown
    // ------------------------------------------------------------------

    /// Pauses collection. The callback always fires: immediately when the
    /// machine is already idle, otherwise once in-flight I/O drains back to
    /// the ready step. Returns whether it was already idle.
    pub fn disable_gc(&mut self, cx: &mut CoreContext, cb: DoneCallback) -> bool {
        self.gc.should_be_stopped = true;
        if self.gc.step == GcStep::Ready {
            cx.defer(move |cx| cb(cx));
            true
        } else {
            self.gc.disable_callbacks.push(cb);
            false
        }
    }

    /// Re-arms collection after [`disable_gc`](Self::disable_gc); the next
    /// mutation boundary may start a pass again.
    pub fn enable_gc(&mut self) {
        self.gc.should_be_stopped = false;
    }

    pub fn gc_is_idle(&self) -> bool {
        self.gc.step == GcStep::Ready && self.gc.refcount == 0
    }

    /// Stops the manager. The callback fires once collection is idle.
    /// Returns true when that already happened synchronously.
    pub fn shutdown(&mut self, cx: &mut CoreContext, cb: DoneCallback) -> bool {
        assert_eq!(self.state, ManagerState::Ready, "shutdown on unstarted manager");
        self.state = ManagerState::ShuttingDown;
        self.gc.should_be_stopped = true;
        self.shutdown_callback = Some(cb);
        if self.gc.step == GcStep::Ready {
            self.actually_shutdown(cx);
            true
        } else {
            false
        }
    }

    fn actually_shutdown(&mut self, cx: &mut CoreContext) {
        assert_eq!(self.gc.refcount, 0, "shutdown with collector I/O in flight");
        self.state = ManagerState::ShutDown;
        self.gc.scratch = Vec::new();
        if let Some(cb) = self.shutdown_callback.take() {
            cx.defer(move |cx| cb(cx));
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Offsets of every live extent, sorted.
    pub fn live_extents(&self) -> Vec<DiskOff> {
        let mut v: Vec<DiskOff> = self.arena.live().map(|(_, e)| e.offset).collect();
        v.sort_unstable();
        v
    }

    /// Garbage fraction of every live extent.
    pub fn extent_garbage_ratios(&self) -> Vec<(DiskOff, f64)> {
        self.arena
            .live()
            .map(|(_, e)| {
                (
                    e.offset,
                    e.g_array.garbage_count() as f64 / self.blocks_per_extent as f64,
                )
            })
            .collect()
    }

    pub fn blocks_in_last_data_extent(&self) -> usize {
        self.blocks_in_last_data_extent
    }

    pub fn extents_end(&self) -> DiskOff {
        self.extents.end()
    }

    pub fn free_extent_count(&self) -> usize {
        self.extents.free_extents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_tracks_garbage_count() {
        let mut map = GarbageBitmap::all_set(100);
        assert_eq!(map.garbage_count(), 100);
        assert!(map.is_all_garbage());

        assert!(map.clear(0));
        assert!(map.clear(99));
        assert!(!map.clear(99));
        assert_eq!(map.garbage_count(), 98);
        assert!(!map.test(0));
        assert!(map.test(50));

        assert!(map.set(0));
        assert!(!map.set(0));
        assert_eq!(map.garbage_count(), 99);
    }

    #[test]
    fn arena_generations_detect_recycling() {
        let mut arena = EntryArena::new();
        let (idx, gen) = arena.insert(GcEntry::new_active(4096, 8));
        arena.remove(idx);
        let (idx2, gen2) = arena.insert(GcEntry::new_active(8192, 8));
        assert_eq!(idx, idx2);
        assert_ne!(gen, gen2);
    }

    #[test]
    fn extent_table_is_sparse() {
        let mut table = ExtentTable::new();
        assert_eq!(table.get(0), None);
        table.set(5, 1);
        table.set(5000, 2);
        assert_eq!(table.get(5), Some(1));
        assert_eq!(table.get(5000), Some(2));
        assert_eq!(table.get(4999), None);
        table.clear(5);
        assert_eq!(table.get(5), None);
        assert_eq!(table.get(5000), Some(2));
    }

    fn test_manager(blocks_per_extent: usize) -> (tempfile::TempDir, DataBlockManager) {
        use crate::io::{BlockDevice, FileDevice};
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::create(&dir.path().join("blocks")).unwrap();
        let static_config = SerStaticConfig {
            block_size: 512,
            extent_size: 512 * blocks_per_extent,
        };
        dev.set_len(static_config.extent_size as u64).unwrap();
        let mut mgr = DataBlockManager::new(
            Arc::new(dev),
            &static_config,
            SerDynamicConfig::default(),
        );
        mgr.start_new();
        (dir, mgr)
    }

    #[test]
    fn heap_orders_by_garbage_then_offset() {
        let (_dir, mut mgr) = test_manager(8);
        // Hand-build three old entries with differing garbage counts.
        let mut make = |off: DiskOff, garbage: usize| {
            let mut entry = GcEntry::new_active(off, 8);
            for i in 0..(8 - garbage) {
                entry.g_array.clear(i);
            }
            entry.state = GcEntryState::Old;
            let (idx, _) = mgr.arena.insert(entry);
            mgr.heap_push(idx);
            idx
        };
        let low = make(8 * 512, 2);
        let high = make(16 * 512, 7);
        let tie_higher_offset = make(24 * 512, 7);

        assert_eq!(mgr.heap_peek(), Some(high));
        assert_eq!(mgr.heap_pop(), Some(high));
        // Garbage tie: the lower offset wins.
        assert_eq!(mgr.heap_pop(), Some(tie_higher_offset));
        assert_eq!(mgr.heap_pop(), Some(low));
        assert_eq!(mgr.heap_pop(), None);
    }

    #[test]
    fn garbage_ratio_counts_old_extents_only() {
        let (_dir, mut mgr) = test_manager(8);
        assert_eq!(mgr.garbage_ratio(), 0.0);

        let mut entry = GcEntry::new_active(8 * 512, 8);
        for i in 0..8 {
            entry.g_array.clear(i);
        }
        for i in 0..4 {
            entry.g_array.set(i);
        }
        entry.state = GcEntryState::Young;
        let (idx, gen) = mgr.arena.insert(entry);
        mgr.extent_table.set(1, idx);
        mgr.young.push_back((idx, gen));

        // Still young: not counted.
        assert_eq!(mgr.garbage_ratio(), 0.0);

        mgr.make_old(idx);
        assert!((mgr.garbage_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(
            mgr.gc_stats(),
            GcStats {
                old_total_blocks: 8,
                old_garbage_blocks: 4
            }
        );
    }
}
