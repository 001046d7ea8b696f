//! # Log Serializer
//!
//! One serializer owns one on-disk file and everything needed to serve
//! block reads and writes against it: the block device, the extent
//! allocator, the data block manager with its garbage collector, the
//! logical block address index, and the metablock that makes it all
//! durable.
//!
//! ## Write Path
//!
//! ```text
//! write_block(id, payload)
//!   └─> data block manager picks the next slot in the active extent
//!        └─> disk write issued on this core's queue
//!             └─> completion: address table points id at the new offset,
//!                 the displaced copy (if any) becomes garbage,
//!                 the caller's callback fires, GC thresholds are checked
//! ```
//!
//! ## Sharing Across Slices
//!
//! Several slices can share a serializer. Each gets a [`SerializerShare`]:
//! a striped view of the block-id space where slice-local id `b` maps to
//! file id `b * count + rank`. Shares are plain handles; all calls hop to
//! the serializer's home core and reply on the caller's core.
//!
//! ## Failure Model
//!
//! I/O errors and trailer mismatches are unrecoverable: the serializer
//! flips to `Failed`, reports through its fatal hook, and rejects further
//! traffic. Shutdown from `Failed` skips the final metablock publish.

pub mod data_blocks;
pub mod lba;
pub mod metablock;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use tracing::{error, info};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{SerDynamicConfig, SerStaticConfig, BLOCK_TRAILER_SIZE};
use crate::exec::{CoreContext, CoreId, FatalHook, Handle};
use crate::io::{BlockDevice, SharedDevice};
use crate::{BlockId, DiskOff};

pub use data_blocks::{DataBlockManager, GcStats};
pub use lba::{LbaIndex, RemapObserver};
pub use metablock::{MetablockRegion, MetablockSnapshot};

use data_blocks::GcSignal;

/// Fires with the chosen offset once a block write is on disk.
pub type WriteCompletion = Box<dyn FnOnce(&mut CoreContext, DiskOff, Result<()>) + Send>;

/// Fires with the raw block bytes (trailer included).
pub type ReadCompletion = Box<dyn FnOnce(&mut CoreContext, Result<Vec<u8>>) + Send>;

/// Generic completion for operations with no payload.
pub type ResultCallback = Box<dyn FnOnce(&mut CoreContext, Result<()>) + Send>;

/// Fires with the block payload, or `None` for a never-written id.
pub type BlockReadCallback = Box<dyn FnOnce(&mut CoreContext, Result<Option<Vec<u8>>>) + Send>;

/// Every data block ends in this trailer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct BlockTrailer {
    block_id: U64,
}

const _: () = assert!(std::mem::size_of::<BlockTrailer>() == BLOCK_TRAILER_SIZE);

impl BlockTrailer {
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id: U64::new(block_id),
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SerState {
    Ready,
    ShuttingDown,
    ShutDown,
    Failed,
}

/// Per-file storage stack: device + extents + data blocks + address table
/// + metablock. Lives on one core; reached from elsewhere via dispatch.
pub struct LogSerializer {
    home_core: CoreId,
    state: SerState,
    path: PathBuf,
    static_config: SerStaticConfig,
    region: MetablockRegion,
    device: SharedDevice,
    lba: LbaIndex,
    data_blocks: DataBlockManager,
    metablock_version: u64,
    fatal: Option<FatalHook>,
}

impl LogSerializer {
    /// Initializes a brand-new file: reserves the metablock extent and
    /// publishes an empty version-1 metablock.
    pub fn create(
        home_core: CoreId,
        path: &Path,
        device: SharedDevice,
        static_config: SerStaticConfig,
        dynamic: SerDynamicConfig,
    ) -> Result<Self> {
        static_config.validate()?;
        dynamic.validate()?;

        device
            .set_len(static_config.extent_size as u64)
            .wrap_err_with(|| format!("failed to reserve metablock extent in {:?}", path))?;
        let region = MetablockRegion::new(static_config.block_size, static_config.extent_size);
        let empty = MetablockSnapshot {
            last_data_extent: None,
            blocks_in_last_data_extent: 0,
        };
        region
            .write(&*device, 1, &empty, &[])
            .wrap_err_with(|| format!("failed to publish initial metablock in {:?}", path))?;

        let mut data_blocks = DataBlockManager::new(Arc::clone(&device), &static_config, dynamic);
        data_blocks.start_new();

        info!(path = %path.display(), "serializer created");
        Ok(Self {
            home_core,
            state: SerState::Ready,
            path: path.to_path_buf(),
            static_config,
            region,
            device,
            lba: LbaIndex::new(),
            data_blocks,
            metablock_version: 1,
            fatal: None,
        })
    }

    /// Recovers an existing file: reads the newest metablock, loads the
    /// address table, and rebuilds extent liveness from it.
    pub fn open(
        home_core: CoreId,
        path: &Path,
        device: SharedDevice,
        static_config: SerStaticConfig,
        dynamic: SerDynamicConfig,
    ) -> Result<Self> {
        static_config.validate()?;
        dynamic.validate()?;

        let region = MetablockRegion::new(static_config.block_size, static_config.extent_size);
        let (version, snapshot, entries) = region
            .read_latest(&*device)
            .wrap_err_with(|| format!("failed to recover metablock from {:?}", path))?;
        let lba = LbaIndex::from_entries(entries);

        let mut data_blocks = DataBlockManager::new(Arc::clone(&device), &static_config, dynamic);
        data_blocks.start_existing(&snapshot);
        data_blocks.start_reconstruct();
        for off in lba.offsets() {
            data_blocks.mark_live(off)?;
        }
        data_blocks.end_reconstruct();

        // Drop any stale tail left by extents released right before a crash.
        device.set_len(data_blocks.extents_end() as u64)?;

        info!(
            path = %path.display(),
            version,
            blocks = lba.len(),
            "serializer recovered"
        );
        Ok(Self {
            home_core,
            state: SerState::Ready,
            path: path.to_path_buf(),
            static_config,
            region,
            device,
            lba,
            data_blocks,
            metablock_version: version,
            fatal: None,
        })
    }

    pub fn set_fatal_hook(&mut self, hook: FatalHook) {
        self.fatal = Some(hook);
    }

    pub fn static_config(&self) -> &SerStaticConfig {
        &self.static_config
    }

    pub fn data_blocks(&self) -> &DataBlockManager {
        &self.data_blocks
    }

    pub fn lba(&self) -> &LbaIndex {
        &self.lba
    }

    pub fn lba_mut(&mut self) -> &mut LbaIndex {
        &mut self.lba
    }

    pub fn is_serving(&self) -> bool {
        self.state == SerState::Ready
    }

    fn assert_core(&self, cx: &CoreContext) {
        debug_assert_eq!(cx.id(), self.home_core, "serializer touched off its home core");
    }

    fn fatal(&mut self, cx: &mut CoreContext, err: eyre::Report) {
        error!(path = %self.path.display(), error = %err, "serializer failed");
        if self.state != SerState::ShutDown {
            self.state = SerState::Failed;
        }
        if let Some(hook) = self.fatal.clone() {
            hook(cx, err);
        }
    }

    // ------------------------------------------------------------------
    // Block operations
    // ------------------------------------------------------------------

    /// Writes `payload` under `block_id`. The payload must fit
    /// `block_size - trailer`; shorter payloads are zero-padded.
    pub fn write_block(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        block_id: BlockId,
        payload: Vec<u8>,
        cb: ResultCallback,
    ) {
        self.assert_core(cx);
        if self.state != SerState::Ready {
            cb(cx, Err(eyre!("serializer {:?} is not serving", self.path)));
            return;
        }
        let capacity = self.static_config.block_payload_size();
        if payload.len() > capacity {
            cb(
                cx,
                Err(eyre!(
                    "payload of {} bytes exceeds block capacity {}",
                    payload.len(),
                    capacity
                )),
            );
            return;
        }

        let mut block = vec![0u8; self.static_config.block_size];
        block[..payload.len()].copy_from_slice(&payload);
        self.data_blocks.write(
            cx,
            block,
            block_id,
            Box::new(move |cx, off, res| {
                cx.with(me, |s: &mut LogSerializer, cx| {
                    s.write_block_complete(cx, me, block_id, off, res, cb);
                });
            }),
        );
    }

    fn write_block_complete(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        block_id: BlockId,
        off: DiskOff,
        res: Result<()>,
        cb: ResultCallback,
    ) {
        if let Err(err) = res {
            let msg = format!("write of block {} at offset {} failed: {:#}", block_id, off, err);
            self.fatal(cx, eyre!("{}", msg));
            cb(cx, Err(eyre!("{}", msg)));
            return;
        }
        if let Some(displaced) = self.lba.set(block_id, off) {
            if let Err(err) = self.data_blocks.mark_garbage(displaced) {
                let msg = format!("failed to retire old copy of block {}: {:#}", block_id, err);
                self.fatal(cx, eyre!("{}", msg));
                cb(cx, Err(eyre!("{}", msg)));
                return;
            }
        }
        cb(cx, Ok(()));
        self.drive_gc(cx, me);
    }

    /// Reads the current copy of `block_id`; never-written ids yield `None`.
    pub fn read_block(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        block_id: BlockId,
        cb: BlockReadCallback,
    ) {
        self.assert_core(cx);
        if self.state != SerState::Ready {
            cb(cx, Err(eyre!("serializer {:?} is not serving", self.path)));
            return;
        }
        match self.lba.get(block_id) {
            None => cb(cx, Ok(None)),
            Some(off) => {
                self.data_blocks.read(
                    cx,
                    off,
                    Box::new(move |cx, res| {
                        cx.with(me, |s: &mut LogSerializer, cx| {
                            s.read_block_complete(cx, block_id, off, res, cb);
                        });
                    }),
                );
            }
        }
    }

    fn read_block_complete(
        &mut self,
        cx: &mut CoreContext,
        block_id: BlockId,
        off: DiskOff,
        res: Result<Vec<u8>>,
        cb: BlockReadCallback,
    ) {
        let mut block = match res {
            Ok(block) => block,
            Err(err) => {
                let msg = format!("read of block {} at offset {} failed: {:#}", block_id, off, err);
                self.fatal(cx, eyre!("{}", msg));
                cb(cx, Err(eyre!("{}", msg)));
                return;
            }
        };
        let trailer_at = self.static_config.block_size - BLOCK_TRAILER_SIZE;
        let trailer = BlockTrailer::read_from_bytes(&block[trailer_at..])
            .ok()
            .expect("trailer slice sized exactly"); // INVARIANT: slice is BLOCK_TRAILER_SIZE
        if trailer.block_id() != block_id {
            let msg = format!(
                "trailer mismatch at offset {}: expected block {}, found {}",
                off,
                block_id,
                trailer.block_id()
            );
            self.fatal(cx, eyre!("{}", msg));
            cb(cx, Err(eyre!("{}", msg)));
            return;
        }
        block.truncate(trailer_at);
        cb(cx, Ok(Some(block)));
    }

    /// Drops `block_id` from the address table; its on-disk copy becomes
    /// garbage.
    pub fn delete_block(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        block_id: BlockId,
    ) -> Result<()> {
        self.assert_core(cx);
        if self.state != SerState::Ready {
            return Err(eyre!("serializer {:?} is not serving", self.path));
        }
        if let Some(off) = self.lba.remove(block_id) {
            if let Err(err) = self.data_blocks.mark_garbage(off) {
                let msg = format!("failed to retire block {}: {:#}", block_id, err);
                self.fatal(cx, eyre!("{}", msg));
                return Err(eyre!("{}", msg));
            }
        }
        self.drive_gc(cx, me);
        Ok(())
    }

    /// Publishes the metablock (active extent coordinates plus the whole
    /// address table) and syncs the device.
    pub fn flush_metablock(&mut self, cx: &mut CoreContext, cb: ResultCallback) {
        self.assert_core(cx);
        if !matches!(self.state, SerState::Ready | SerState::ShuttingDown) {
            cx.defer(move |cx| cb(cx, Err(eyre!("serializer is not serving"))));
            return;
        }
        let entries = self.lba.entries_vec();
        if entries.len() > self.region.capacity() {
            let msg = format!(
                "address table with {} entries exceeds metablock capacity {}; raise extent_size",
                entries.len(),
                self.region.capacity()
            );
            self.fatal(cx, eyre!("{}", msg));
            cx.defer(move |cx| cb(cx, Err(eyre!("{}", msg))));
            return;
        }
        let snapshot = self.data_blocks.prepare_metablock();
        self.metablock_version += 1;
        let version = self.metablock_version;
        let region = self.region;
        let device = Arc::clone(&self.device);
        cx.dispatch(cx.id(), move |cx| {
            let res = region.write(&*device, version, &snapshot, &entries);
            cb(cx, res);
        });
    }

    /// Highest slice-local block id present in the `(rank, count)` lane of
    /// the striped id space.
    pub fn max_block_id_in_lane(&self, rank: u64, count: u64) -> Option<BlockId> {
        self.lba
            .max_block_id_in_lane(rank, count)
            .map(|file_id| (file_id - rank) / count)
    }

    // ------------------------------------------------------------------
    // Garbage collection plumbing
    // ------------------------------------------------------------------

    /// Checks collection thresholds and advances the collector. Called at
    /// mutation boundaries and after every collector state change.
    pub fn drive_gc(&mut self, cx: &mut CoreContext, me: Handle<LogSerializer>) {
        let signal = self.data_blocks.gc_tick(cx, me);
        match signal {
            Ok(signal) => self.apply_gc_signal(cx, me, signal),
            Err(err) => self.fatal(cx, err),
        }
    }

    fn apply_gc_signal(&mut self, cx: &mut CoreContext, me: Handle<LogSerializer>, signal: GcSignal) {
        match signal {
            GcSignal::None => {}
            GcSignal::ExtentCopied => {
                // The remaps are in memory only; make them durable before
                // the source extent can be reused.
                self.flush_metablock(
                    cx,
                    Box::new(move |cx, res| {
                        cx.with(me, |s: &mut LogSerializer, cx| {
                            s.gc_metablock_flushed(cx, me, res);
                        });
                    }),
                );
            }
        }
    }

    pub(crate) fn gc_read_complete(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        block_index: usize,
        res: Result<Vec<u8>>,
    ) {
        self.assert_core(cx);
        match res {
            Err(err) => self.fatal(cx, err.wrap_err("collector read failed")),
            Ok(data) => {
                let signal = self
                    .data_blocks
                    .gc_read_complete(cx, me, block_index, data, &mut self.lba);
                match signal {
                    Ok(signal) => self.apply_gc_signal(cx, me, signal),
                    Err(err) => self.fatal(cx, err),
                }
            }
        }
    }

    pub(crate) fn gc_write_complete(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        block_id: BlockId,
        old_off: DiskOff,
        new_off: DiskOff,
        res: Result<()>,
    ) {
        self.assert_core(cx);
        if let Err(err) = res {
            self.fatal(cx, err.wrap_err(format!("collector rewrite of block {} failed", block_id)));
            return;
        }
        if self.data_blocks.gc_block_still_live(old_off) {
            self.lba.set_from_move(block_id, new_off);
        } else {
            // Discarded while the copy was in flight: the fresh copy is
            // garbage from birth and the address table stays silent.
            if let Err(err) = self.data_blocks.mark_garbage(new_off) {
                self.fatal(cx, err);
                return;
            }
        }
        let signal = self.data_blocks.gc_copy_done();
        self.apply_gc_signal(cx, me, signal);
    }

    fn gc_metablock_flushed(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        res: Result<()>,
    ) {
        if let Err(err) = res {
            self.fatal(cx, err.wrap_err("metablock publish after collection failed"));
            return;
        }
        if let Err(err) = self.data_blocks.gc_finalize(cx, me) {
            self.fatal(cx, err);
        }
    }

    /// Pauses collection; see [`DataBlockManager::disable_gc`].
    pub fn disable_gc(&mut self, cx: &mut CoreContext, cb: crate::exec::DoneCallback) -> bool {
        self.data_blocks.disable_gc(cx, cb)
    }

    /// Resumes collection and immediately re-checks thresholds.
    pub fn enable_gc(&mut self, cx: &mut CoreContext, me: Handle<LogSerializer>) {
        self.data_blocks.enable_gc();
        self.drive_gc(cx, me);
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Drains the collector, publishes a final metablock, and stops.
    /// Calling this in any state other than `Ready` or `Failed` is a bug.
    pub fn shutdown(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        cb: ResultCallback,
    ) {
        self.assert_core(cx);
        match self.state {
            SerState::Failed => {
                self.state = SerState::ShutDown;
                cx.defer(move |cx| cb(cx, Ok(())));
            }
            SerState::Ready => {
                self.state = SerState::ShuttingDown;
                let _already_idle = self.data_blocks.shutdown(
                    cx,
                    Box::new(move |cx| {
                        cx.with(me, |s: &mut LogSerializer, cx| s.finish_shutdown(cx, me, cb));
                    }),
                );
            }
            other => panic!("serializer shutdown in state {:?}", other),
        }
    }

    fn finish_shutdown(
        &mut self,
        cx: &mut CoreContext,
        me: Handle<LogSerializer>,
        cb: ResultCallback,
    ) {
        self.flush_metablock(
            cx,
            Box::new(move |cx, res| {
                cx.with(me, |s: &mut LogSerializer, _cx| {
                    s.state = SerState::ShutDown;
                });
                info!("serializer stopped");
                cb(cx, res);
            }),
        );
    }
}

// ============================================================================
// Slice share
// ============================================================================

/// A slice's striped view of one serializer.
///
/// Slice-local block id `b` maps to file block id `b * count + rank`, so
/// the slices sharing a file interleave without coordination. The share is
/// plain data; every operation dispatches to the serializer's home core and
/// replies on the caller's.
#[derive(Debug, Clone, Copy)]
pub struct SerializerShare {
    ser: Handle<LogSerializer>,
    rank: u64,
    count: u64,
}

impl SerializerShare {
    pub fn new(ser: Handle<LogSerializer>, rank: usize, count: usize) -> Self {
        debug_assert!(count >= 1 && rank < count);
        Self {
            ser,
            rank: rank as u64,
            count: count as u64,
        }
    }

    pub fn serializer(&self) -> Handle<LogSerializer> {
        self.ser
    }

    pub fn file_block_id(&self, local: BlockId) -> BlockId {
        local * self.count + self.rank
    }

    pub fn read_block(&self, cx: &mut CoreContext, local: BlockId, cb: BlockReadCallback) {
        let ser = self.ser;
        let file_id = self.file_block_id(local);
        let home = cx.id();
        cx.dispatch(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, cx| {
                s.read_block(
                    cx,
                    ser,
                    file_id,
                    Box::new(move |cx, res| {
                        cx.dispatch(home, move |cx| cb(cx, res));
                    }),
                );
            });
        });
    }

    pub fn write_block(
        &self,
        cx: &mut CoreContext,
        local: BlockId,
        payload: Vec<u8>,
        cb: ResultCallback,
    ) {
        let ser = self.ser;
        let file_id = self.file_block_id(local);
        let home = cx.id();
        cx.dispatch(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, cx| {
                s.write_block(
                    cx,
                    ser,
                    file_id,
                    payload,
                    Box::new(move |cx, res| {
                        cx.dispatch(home, move |cx| cb(cx, res));
                    }),
                );
            });
        });
    }

    pub fn delete_block(&self, cx: &mut CoreContext, local: BlockId, cb: ResultCallback) {
        let ser = self.ser;
        let file_id = self.file_block_id(local);
        let home = cx.id();
        cx.dispatch(ser.core(), move |cx| {
            let res = cx.with(ser, |s: &mut LogSerializer, cx| s.delete_block(cx, ser, file_id));
            cx.dispatch(home, move |cx| cb(cx, res));
        });
    }

    pub fn flush_metablock(&self, cx: &mut CoreContext, cb: ResultCallback) {
        let ser = self.ser;
        let home = cx.id();
        cx.dispatch(ser.core(), move |cx| {
            cx.with(ser, |s: &mut LogSerializer, cx| {
                s.flush_metablock(
                    cx,
                    Box::new(move |cx, res| {
                        cx.dispatch(home, move |cx| cb(cx, res));
                    }),
                );
            });
        });
    }

    /// Highest slice-local block id this share has ever stored.
    pub fn max_block_id(
        &self,
        cx: &mut CoreContext,
        cb: Box<dyn FnOnce(&mut CoreContext, Option<BlockId>) + Send>,
    ) {
        let ser = self.ser;
        let (rank, count) = (self.rank, self.count);
        let home = cx.id();
        cx.dispatch(ser.core(), move |cx| {
            let max = cx.with(ser, |s: &mut LogSerializer, _cx| {
                s.max_block_id_in_lane(rank, count)
            });
            cx.dispatch(home, move |cx| cb(cx, max));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BlockDevice, FileDevice};
    use tempfile::tempdir;

    fn small_geometry() -> SerStaticConfig {
        SerStaticConfig {
            block_size: 4096,
            extent_size: 64 * 4096,
        }
    }

    #[test]
    fn trailer_layout_is_stable() {
        let trailer = BlockTrailer::new(0xDEAD_BEEF);
        let bytes = trailer.as_bytes();
        assert_eq!(bytes.len(), BLOCK_TRAILER_SIZE);
        let back = BlockTrailer::read_from_bytes(bytes).unwrap();
        assert_eq!(back.block_id(), 0xDEAD_BEEF);
    }

    #[test]
    fn create_then_open_preserves_metablock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ser_0");

        let device: SharedDevice = Arc::new(FileDevice::create(&path).unwrap());
        let ser = LogSerializer::create(
            0,
            &path,
            device,
            small_geometry(),
            SerDynamicConfig::default(),
        )
        .unwrap();
        assert!(ser.is_serving());
        assert_eq!(ser.lba().len(), 0);
        drop(ser);

        let device: SharedDevice = Arc::new(FileDevice::open(&path).unwrap());
        let ser = LogSerializer::open(
            0,
            &path,
            device,
            small_geometry(),
            SerDynamicConfig::default(),
        )
        .unwrap();
        assert!(ser.is_serving());
        assert_eq!(ser.lba().len(), 0);
        assert_eq!(ser.data_blocks().blocks_in_last_data_extent(), 0);
    }

    #[test]
    fn open_of_garbage_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not_a_store");
        let device: SharedDevice = Arc::new(FileDevice::create(&path).unwrap());
        device.set_len(small_geometry().extent_size as u64).unwrap();
        device.write_at(0, b"definitely not a metablock").unwrap();

        let res = LogSerializer::open(
            0,
            &path,
            device,
            small_geometry(),
            SerDynamicConfig::default(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn share_stripes_block_ids() {
        // Layout mirrors two slices over one file: rank 0 and rank 1 of 2.
        let dir = tempdir().unwrap();
        let path = dir.path().join("ser_0");
        let device: SharedDevice = Arc::new(FileDevice::create(&path).unwrap());
        let cores = crate::exec::Cores::start(1).unwrap();
        let ser_handle = cores
            .run_blocking(0, move |cx| {
                let ser = LogSerializer::create(
                    0,
                    &path,
                    device,
                    small_geometry(),
                    SerDynamicConfig::default(),
                )
                .unwrap();
                cx.install(ser)
            })
            .unwrap();

        let a = SerializerShare::new(ser_handle, 0, 2);
        let b = SerializerShare::new(ser_handle, 1, 2);
        assert_eq!(a.file_block_id(0), 0);
        assert_eq!(b.file_block_id(0), 1);
        assert_eq!(a.file_block_id(5), 10);
        assert_eq!(b.file_block_id(5), 11);
        cores.stop();
    }
}
