//! # Transactional Buffer Cache
//!
//! Each slice owns one cache: a single-threaded, write-back block cache
//! over its serializer share. Callers see slice-local block ids and payload
//! bytes; the cache handles misses, pinning, dirty tracking, and flushing.
//!
//! ## Transactions
//!
//! ```text
//! begin_transaction(Write) ── one writer at a time; later writers queue
//!   acquire(block, Write)  ── miss reads through the share, then pins
//!   data_mut(token)        ── marks the block dirty
//!   release(token)         ── unpins
//! commit                   ── flushes dirty blocks, publishes the metablock
//! ```
//!
//! Commit is the durability fence: once its callback fires (with
//! `wait_for_flush`), the blocks and the address table pointing at them are
//! on disk. Without `wait_for_flush` the callback fires as soon as the
//! flush is issued. Read transactions are concurrent and free.
//!
//! ## Write-Back Policy
//!
//! Dirty blocks normally ride until commit. Two knobs move them earlier,
//! checked at operation boundaries: `flush_threshold_percent` (dirty share
//! of the cache) and `flush_timer_ms` (age of the oldest unflushed work).
//!
//! ## Eviction
//!
//! When the cache exceeds its block budget, clean unpinned blocks with no
//! flush in flight are dropped. A block whose flush is still in flight is
//! never evicted: until the serializer confirms the write, a re-read could
//! observe the previous copy.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use eyre::{eyre, Result};
use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::config::MIN_CACHE_BLOCKS;
use crate::exec::{CoreContext, CoreId, FatalHook, Handle};
use crate::serializer::{ResultCallback, SerializerShare};
use crate::BlockId;

/// Transaction identifier, local to one cache.
pub type TxnId = u64;

/// Read or write intent, for both transactions and acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// A pinned block. Plain data; pair every token with a `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufToken {
    block_id: BlockId,
}

impl BufToken {
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }
}

pub type TxnCallback = Box<dyn FnOnce(&mut CoreContext, TxnId) + Send>;
pub type AcquireCallback = Box<dyn FnOnce(&mut CoreContext, Result<BufToken>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Unstarted,
    Starting,
    Ready,
    ShuttingDown,
    ShutDown,
    Failed,
}

struct CacheBlock {
    data: Vec<u8>,
    dirty: bool,
    pin_count: u32,
    flush_in_flight: bool,
}

struct CommitState {
    txn: TxnId,
    remaining: usize,
    cb: Option<ResultCallback>,
}

/// Per-slice write-back block cache. Single-owner, home-core only.
pub struct BufCache {
    home_core: CoreId,
    state: CacheState,
    me: Option<Handle<BufCache>>,
    share: SerializerShare,
    payload_size: usize,
    max_blocks: usize,
    wait_for_flush: bool,
    flush_timer: Duration,
    flush_threshold_percent: u32,
    last_flush: Instant,
    blocks: HashMap<BlockId, CacheBlock>,
    pending_reads: HashMap<BlockId, Vec<AcquireCallback>>,
    next_block_id: BlockId,
    txns: HashMap<TxnId, AccessMode>,
    next_txn_id: TxnId,
    write_txn: Option<TxnId>,
    waiting_writers: VecDeque<(TxnId, TxnCallback)>,
    commit: Option<CommitState>,
    early_flushes: usize,
    start_cb: Option<ResultCallback>,
    shutdown_cb: Option<ResultCallback>,
    fatal: Option<FatalHook>,
}

impl BufCache {
    pub fn new(
        home_core: CoreId,
        share: SerializerShare,
        payload_size: usize,
        max_size_bytes: usize,
        wait_for_flush: bool,
        flush_timer_ms: u32,
        flush_threshold_percent: u32,
    ) -> Self {
        let max_blocks = (max_size_bytes / payload_size.max(1)).max(MIN_CACHE_BLOCKS);
        Self {
            home_core,
            state: CacheState::Unstarted,
            me: None,
            share,
            payload_size,
            max_blocks,
            wait_for_flush,
            flush_timer: Duration::from_millis(flush_timer_ms as u64),
            flush_threshold_percent,
            last_flush: Instant::now(),
            blocks: HashMap::new(),
            pending_reads: HashMap::new(),
            next_block_id: 1,
            txns: HashMap::new(),
            next_txn_id: 1,
            write_txn: None,
            waiting_writers: VecDeque::new(),
            commit: None,
            early_flushes: 0,
            start_cb: None,
            shutdown_cb: None,
            fatal: None,
        }
    }

    /// Records this cache's own handle; must be called right after install.
    pub fn bind(&mut self, me: Handle<BufCache>) {
        self.me = Some(me);
    }

    pub fn set_fatal_hook(&mut self, hook: FatalHook) {
        self.fatal = Some(hook);
    }

    fn me(&self) -> Handle<BufCache> {
        self.me.expect("cache used before bind") // INVARIANT: bind() follows install()
    }

    fn assert_core(&self, cx: &CoreContext) {
        debug_assert_eq!(cx.id(), self.home_core, "cache touched off its home core");
    }

    fn fatal(&mut self, cx: &mut CoreContext, err: eyre::Report) {
        warn!(error = %err, "cache failed");
        self.state = CacheState::Failed;
        if let Some(cb) = self.start_cb.take() {
            cx.defer(move |cx| cb(cx, Err(eyre!("cache failed during startup"))));
        }
        if let Some(hook) = self.fatal.clone() {
            hook(cx, err);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == CacheState::Ready
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Warms up: recovers the block-id watermark from the share, then
    /// reports ready.
    pub fn start(&mut self, cx: &mut CoreContext, cb: ResultCallback) {
        self.assert_core(cx);
        assert_eq!(self.state, CacheState::Unstarted, "cache started twice");
        self.state = CacheState::Starting;
        self.start_cb = Some(cb);
        let me = self.me();
        self.share.max_block_id(
            cx,
            Box::new(move |cx, max| {
                cx.with(me, |cache: &mut BufCache, cx| cache.watermark_loaded(cx, max));
            }),
        );
    }

    fn watermark_loaded(&mut self, cx: &mut CoreContext, max: Option<BlockId>) {
        if self.state != CacheState::Starting {
            return;
        }
        self.next_block_id = max.map(|m| m + 1).unwrap_or(1).max(1);
        self.state = CacheState::Ready;
        debug!(next_block_id = self.next_block_id, "cache ready");
        if let Some(cb) = self.start_cb.take() {
            cx.defer(move |cx| cb(cx, Ok(())));
        }
    }

    /// Publishes a final metablock and stops. No transaction may be open.
    pub fn shutdown(&mut self, cx: &mut CoreContext, cb: ResultCallback) {
        self.assert_core(cx);
        match self.state {
            CacheState::Failed => {
                self.state = CacheState::ShutDown;
                cx.defer(move |cx| cb(cx, Ok(())));
                return;
            }
            CacheState::Ready => {}
            other => panic!("cache shutdown in state {:?}", other),
        }
        assert!(self.txns.is_empty(), "cache shutdown with open transactions");
        self.state = CacheState::ShuttingDown;
        self.shutdown_cb = Some(cb);
        self.try_finish_shutdown(cx);
    }

    fn try_finish_shutdown(&mut self, cx: &mut CoreContext) {
        if self.state != CacheState::ShuttingDown
            || self.commit.is_some()
            || self.early_flushes > 0
        {
            return;
        }
        let me = self.me();
        self.share.flush_metablock(
            cx,
            Box::new(move |cx, res| {
                cx.with(me, |cache: &mut BufCache, cx| {
                    match res {
                        Err(err) => cache.fatal(cx, err.wrap_err("final metablock publish failed")),
                        Ok(()) => cache.state = CacheState::ShutDown,
                    }
                    if let Some(cb) = cache.shutdown_cb.take() {
                        cx.defer(move |cx| cb(cx, Ok(())));
                    }
                });
            }),
        );
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Opens a transaction. Writers are serialized: a second writer waits
    /// until the first commits.
    pub fn begin_transaction(&mut self, cx: &mut CoreContext, mode: AccessMode, cb: TxnCallback) {
        self.assert_core(cx);
        // A failed cache still hands out transaction ids; every access
        // under them reports the failure instead.
        assert!(
            matches!(self.state, CacheState::Ready | CacheState::Failed),
            "transaction on stopped cache"
        );
        let txn = self.next_txn_id;
        self.next_txn_id += 1;
        self.txns.insert(txn, mode);
        match mode {
            AccessMode::Read => cx.defer(move |cx| cb(cx, txn)),
            AccessMode::Write => {
                if self.write_txn.is_none() && self.commit.is_none() {
                    self.write_txn = Some(txn);
                    cx.defer(move |cx| cb(cx, txn));
                } else {
                    trace!(txn, "writer queued");
                    self.waiting_writers.push_back((txn, cb));
                }
            }
        }
    }

    fn wake_next_writer(&mut self, cx: &mut CoreContext) {
        if self.write_txn.is_some() || self.commit.is_some() {
            return;
        }
        if let Some((txn, cb)) = self.waiting_writers.pop_front() {
            self.write_txn = Some(txn);
            cx.defer(move |cx| cb(cx, txn));
        }
    }

    /// Allocates a fresh slice-local block id.
    pub fn allocate_block_id(&mut self) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id += 1;
        id
    }

    /// Pins `block_id` for `txn`, reading through the share on a miss.
    /// Never-written blocks come back zeroed.
    pub fn acquire(
        &mut self,
        cx: &mut CoreContext,
        txn: TxnId,
        block_id: BlockId,
        mode: AccessMode,
        cb: AcquireCallback,
    ) {
        self.assert_core(cx);
        if self.state == CacheState::Failed {
            cx.defer(move |cx| cb(cx, Err(eyre!("cache has failed"))));
            return;
        }
        assert_eq!(self.state, CacheState::Ready, "acquire on stopped cache");
        debug_assert!(self.txns.contains_key(&txn), "acquire outside a transaction");
        if mode == AccessMode::Write {
            debug_assert_eq!(self.write_txn, Some(txn), "write acquire outside the write txn");
        }

        self.maybe_flush_early(cx);

        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.pin_count += 1;
            let token = BufToken { block_id };
            cx.defer(move |cx| cb(cx, Ok(token)));
            return;
        }

        if let Some(waiters) = self.pending_reads.get_mut(&block_id) {
            waiters.push(cb);
            return;
        }

        self.pending_reads.insert(block_id, vec![cb]);
        let me = self.me();
        self.share.read_block(
            cx,
            block_id,
            Box::new(move |cx, res| {
                cx.with(me, |cache: &mut BufCache, cx| {
                    cache.read_complete(cx, block_id, res);
                });
            }),
        );
    }

    fn read_complete(
        &mut self,
        cx: &mut CoreContext,
        block_id: BlockId,
        res: Result<Option<Vec<u8>>>,
    ) {
        let waiters = self.pending_reads.remove(&block_id).unwrap_or_default();
        let data = match res {
            Err(err) => {
                for cb in waiters {
                    cx.defer(move |cx| cb(cx, Err(eyre!("block read failed"))));
                }
                self.fatal(cx, err.wrap_err(format!("read of block {} failed", block_id)));
                return;
            }
            Ok(Some(mut data)) => {
                data.resize(self.payload_size, 0);
                data
            }
            Ok(None) => vec![0u8; self.payload_size],
        };

        self.evict_if_needed();
        self.blocks.insert(
            block_id,
            CacheBlock {
                data,
                dirty: false,
                pin_count: waiters.len() as u32,
                flush_in_flight: false,
            },
        );
        for cb in waiters {
            let token = BufToken { block_id };
            cx.defer(move |cx| cb(cx, Ok(token)));
        }
    }

    fn evict_if_needed(&mut self) {
        while self.blocks.len() >= self.max_blocks {
            let victim = self
                .blocks
                .iter()
                .find(|(_, b)| !b.dirty && !b.flush_in_flight && b.pin_count == 0)
                .map(|(&id, _)| id);
            match victim {
                Some(id) => {
                    self.blocks.remove(&id);
                    trace!(block = id, "evicted");
                }
                None => {
                    debug!(
                        resident = self.blocks.len(),
                        budget = self.max_blocks,
                        "cache over budget with nothing evictable"
                    );
                    return;
                }
            }
        }
    }

    /// Immutable view of a pinned block's payload.
    pub fn data(&self, token: BufToken) -> &[u8] {
        &self
            .blocks
            .get(&token.block_id)
            .expect("token for unpinned block") // INVARIANT: pinned blocks are never evicted
            .data
    }

    /// Mutable view; marks the block dirty.
    pub fn data_mut(&mut self, token: BufToken) -> &mut [u8] {
        let block = self
            .blocks
            .get_mut(&token.block_id)
            .expect("token for unpinned block");
        block.dirty = true;
        &mut block.data
    }

    /// Unpins a block.
    pub fn release(&mut self, token: BufToken) {
        let block = self
            .blocks
            .get_mut(&token.block_id)
            .expect("release of unpinned block");
        debug_assert!(block.pin_count > 0);
        block.pin_count -= 1;
    }

    /// Drops `block_id` from the cache and the store. Requires the write
    /// transaction; the callback fires once the serializer has retired the
    /// block.
    pub fn delete(
        &mut self,
        cx: &mut CoreContext,
        txn: TxnId,
        block_id: BlockId,
        cb: ResultCallback,
    ) {
        self.assert_core(cx);
        if self.state == CacheState::Failed {
            cx.defer(move |cx| cb(cx, Err(eyre!("cache has failed"))));
            return;
        }
        assert_eq!(self.state, CacheState::Ready, "delete on stopped cache");
        debug_assert_eq!(self.write_txn, Some(txn), "delete outside the write txn");
        debug_assert!(
            !self.pending_reads.contains_key(&block_id),
            "delete of a block with a read in flight"
        );
        self.blocks.remove(&block_id);
        self.share.delete_block(cx, block_id, cb);
    }

    /// Commits `txn`. For the write transaction this flushes every dirty
    /// block and publishes the metablock; the callback fires per
    /// `wait_for_flush`. Read transactions just close.
    pub fn commit(&mut self, cx: &mut CoreContext, txn: TxnId, cb: ResultCallback) {
        self.assert_core(cx);
        let mode = self
            .txns
            .remove(&txn)
            .expect("commit of unknown transaction");
        if self.state == CacheState::Failed {
            if self.write_txn == Some(txn) {
                self.write_txn = None;
            }
            cx.defer(move |cx| cb(cx, Err(eyre!("cache has failed"))));
            return;
        }
        assert_eq!(self.state, CacheState::Ready, "commit on stopped cache");
        if mode == AccessMode::Read {
            cx.defer(move |cx| cb(cx, Ok(())));
            return;
        }

        assert_eq!(self.write_txn, Some(txn), "commit of a queued writer");
        let dirty: Vec<(BlockId, Vec<u8>)> = self
            .blocks
            .iter_mut()
            .filter(|(_, b)| b.dirty)
            .map(|(&id, b)| {
                b.dirty = false;
                b.flush_in_flight = true;
                (id, b.data.clone())
            })
            .collect();

        debug!(txn, blocks = dirty.len(), "commit flushing");
        let mut commit = CommitState {
            txn,
            remaining: dirty.len(),
            cb: Some(cb),
        };
        if !self.wait_for_flush {
            if let Some(cb) = commit.cb.take() {
                cx.defer(move |cx| cb(cx, Ok(())));
            }
        }
        self.commit = Some(commit);

        if dirty.is_empty() {
            self.commit_blocks_flushed(cx);
            return;
        }
        let me = self.me();
        for (block_id, data) in dirty {
            self.share.write_block(
                cx,
                block_id,
                data,
                Box::new(move |cx, res| {
                    cx.with(me, |cache: &mut BufCache, cx| {
                        cache.commit_block_flushed(cx, block_id, res);
                    });
                }),
            );
        }
    }

    fn commit_block_flushed(&mut self, cx: &mut CoreContext, block_id: BlockId, res: Result<()>) {
        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.flush_in_flight = false;
        }
        if let Err(err) = res {
            if let Some(mut commit) = self.commit.take() {
                self.write_txn = None;
                if let Some(cb) = commit.cb.take() {
                    cx.defer(move |cx| cb(cx, Err(eyre!("commit flush failed"))));
                }
            }
            self.fatal(cx, err.wrap_err(format!("flush of block {} failed", block_id)));
            return;
        }
        // An earlier completion may have already failed the commit.
        let done = match self.commit.as_mut() {
            Some(commit) => {
                commit.remaining -= 1;
                commit.remaining == 0
            }
            None => return,
        };
        if done {
            self.commit_blocks_flushed(cx);
        }
    }

    fn commit_blocks_flushed(&mut self, cx: &mut CoreContext) {
        let me = self.me();
        self.share.flush_metablock(
            cx,
            Box::new(move |cx, res| {
                cx.with(me, |cache: &mut BufCache, cx| {
                    cache.commit_metablock_flushed(cx, res);
                });
            }),
        );
    }

    fn commit_metablock_flushed(&mut self, cx: &mut CoreContext, res: Result<()>) {
        let mut commit = self.commit.take().expect("metablock completion without commit");
        if let Err(err) = res {
            if let Some(cb) = commit.cb.take() {
                cx.defer(move |cx| cb(cx, Err(eyre!("commit metablock publish failed"))));
            }
            self.fatal(cx, err.wrap_err("commit metablock publish failed"));
            return;
        }
        self.write_txn = None;
        self.last_flush = Instant::now();
        if let Some(cb) = commit.cb.take() {
            cx.defer(move |cx| cb(cx, Ok(())));
        }
        trace!(txn = commit.txn, "commit durable");
        self.wake_next_writer(cx);
        self.try_finish_shutdown(cx);
    }

    // ------------------------------------------------------------------
    // Early write-back
    // ------------------------------------------------------------------

    fn maybe_flush_early(&mut self, cx: &mut CoreContext) {
        if self.commit.is_some() {
            return;
        }
        let dirty_count = self.blocks.values().filter(|b| b.dirty).count();
        if dirty_count == 0 {
            return;
        }
        let over_threshold = self.flush_threshold_percent > 0
            && dirty_count * 100 >= self.flush_threshold_percent as usize * self.max_blocks;
        let timer_due =
            !self.flush_timer.is_zero() && self.last_flush.elapsed() >= self.flush_timer;
        if !over_threshold && !timer_due {
            return;
        }

        debug!(dirty = dirty_count, "early write-back");
        self.last_flush = Instant::now();
        let me = self.me();
        let dirty: Vec<(BlockId, Vec<u8>)> = self
            .blocks
            .iter_mut()
            .filter(|(_, b)| b.dirty)
            .map(|(&id, b)| {
                b.dirty = false;
                b.flush_in_flight = true;
                (id, b.data.clone())
            })
            .collect();
        self.early_flushes += dirty.len();
        for (block_id, data) in dirty {
            self.share.write_block(
                cx,
                block_id,
                data,
                Box::new(move |cx, res| {
                    cx.with(me, |cache: &mut BufCache, cx| {
                        cache.early_flush_done(cx, block_id, res);
                    });
                }),
            );
        }
    }

    fn early_flush_done(&mut self, cx: &mut CoreContext, block_id: BlockId, res: Result<()>) {
        self.early_flushes -= 1;
        if let Some(block) = self.blocks.get_mut(&block_id) {
            block.flush_in_flight = false;
        }
        if let Err(err) = res {
            self.fatal(cx, err.wrap_err(format!("early flush of block {} failed", block_id)));
            return;
        }
        self.try_finish_shutdown(cx);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn resident_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn share(&self) -> SerializerShare {
        self.share
    }
}
