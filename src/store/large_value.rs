//! # Large Values
//!
//! A value larger than one block payload is stored as an index block plus a
//! run of segment blocks, all ordinary cache blocks under the slice's
//! share. The index block records:
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Magic: "LVIX"
//! 4       2     Segment count
//! 6       2     First-block offset (bytes unused at the head of segment 0)
//! 8       4     Value size in bytes
//! 12      4     Reserved
//! 16      8*n   Segment block ids
//! ```
//!
//! The first-block offset makes prepends O(1): growing the value at the
//! front usually just lowers the offset instead of rewriting every segment.
//! The `size` field is carried for convenience; the record owning the value
//! remains the authoritative length.
//!
//! Acquisition is asynchronous the same way every cache access is: the
//! machine counts outstanding block acquisitions and reports once the whole
//! value is pinned.

use eyre::{bail, ensure, eyre, Result};
use hashbrown::HashMap;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::cache::{AccessMode, BufCache, BufToken, TxnId};
use crate::config::MAX_VALUE_SIZE;
use crate::exec::{CoreContext, CoreId, Handle};
use crate::serializer::ResultCallback;
use crate::BlockId;

const INDEX_MAGIC: &[u8; 4] = b"LVIX";
const INDEX_HEADER_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct LargeIndexHeader {
    magic: [u8; 4],
    num_segments: U16,
    first_block_offset: U16,
    size: U32,
    _pad: U32,
}

const _: () = assert!(std::mem::size_of::<LargeIndexHeader>() == INDEX_HEADER_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LvState {
    NotLoaded,
    Loading,
    Loaded,
    Deleted,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Allocate,
    Acquire,
    Grow,
    Delete,
}

/// A multi-block value pinned under one cache transaction.
pub struct LargeValue {
    home_core: CoreId,
    state: LvState,
    me: Option<Handle<LargeValue>>,
    cache: Handle<BufCache>,
    txn: TxnId,
    payload: usize,
    index_block: BlockId,
    index_token: Option<BufToken>,
    segments: Vec<BlockId>,
    tokens: HashMap<BlockId, BufToken>,
    first_block_offset: u16,
    size: u32,
    pending: usize,
    pending_op: Option<PendingOp>,
    callback: Option<ResultCallback>,
    failed: bool,
}

impl LargeValue {
    /// Builds the machine on the current core, bound to one transaction.
    pub fn install(
        cx: &mut CoreContext,
        cache: Handle<BufCache>,
        txn: TxnId,
    ) -> Handle<LargeValue> {
        let payload = cx.with(cache, |cache: &mut BufCache, _cx| cache.payload_size());
        let value = LargeValue {
            home_core: cx.id(),
            state: LvState::NotLoaded,
            me: None,
            cache,
            txn,
            payload,
            index_block: 0,
            index_token: None,
            segments: Vec::new(),
            tokens: HashMap::new(),
            first_block_offset: 0,
            size: 0,
            pending: 0,
            pending_op: None,
            callback: None,
            failed: false,
        };
        let handle = cx.install(value);
        cx.get(handle).borrow_mut().me = Some(handle);
        handle
    }

    fn me(&self) -> Handle<LargeValue> {
        self.me.expect("large value used before install")
    }

    pub fn index_block_id(&self) -> BlockId {
        self.index_block
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn first_block_offset(&self) -> u16 {
        self.first_block_offset
    }

    // ------------------------------------------------------------------
    // Allocation and acquisition
    // ------------------------------------------------------------------

    /// Creates a fresh value of `size` bytes: allocates the index block and
    /// enough segments, pins them all.
    pub fn allocate(&mut self, cx: &mut CoreContext, size: u32, cb: ResultCallback) {
        debug_assert_eq!(cx.id(), self.home_core);
        assert_eq!(self.state, LvState::NotLoaded, "value allocated twice");
        if size as usize > MAX_VALUE_SIZE || size == 0 {
            cx.defer(move |cx| cb(cx, Err(eyre!("value size {} out of range", size))));
            return;
        }
        self.state = LvState::Loading;
        self.size = size;
        self.first_block_offset = 0;
        self.callback = Some(cb);
        self.pending_op = Some(PendingOp::Allocate);

        let nsegs = (size as usize).div_ceil(self.payload);
        let cache = self.cache;
        let (index_block, segments) = cx.with(cache, |cache: &mut BufCache, _cx| {
            let index = cache.allocate_block_id();
            let segs: Vec<BlockId> = (0..nsegs).map(|_| cache.allocate_block_id()).collect();
            (index, segs)
        });
        self.index_block = index_block;
        self.segments = segments.clone();

        self.pending = 1 + segments.len();
        self.acquire_one(cx, index_block, true);
        for id in segments {
            self.acquire_one(cx, id, false);
        }
    }

    /// Loads an existing value from its index block and pins every segment.
    pub fn acquire(&mut self, cx: &mut CoreContext, index_block: BlockId, cb: ResultCallback) {
        debug_assert_eq!(cx.id(), self.home_core);
        assert_eq!(self.state, LvState::NotLoaded, "value acquired twice");
        self.state = LvState::Loading;
        self.index_block = index_block;
        self.callback = Some(cb);
        self.pending_op = Some(PendingOp::Acquire);
        self.pending = 1;
        self.acquire_one(cx, index_block, true);
    }

    fn acquire_one(&mut self, cx: &mut CoreContext, block_id: BlockId, is_index: bool) {
        let me = self.me();
        let txn = self.txn;
        let cache = self.cache;
        cx.with(cache, |cache: &mut BufCache, cx| {
            cache.acquire(
                cx,
                txn,
                block_id,
                AccessMode::Write,
                Box::new(move |cx, res| {
                    cx.with(me, |value: &mut LargeValue, cx| {
                        value.block_acquired(cx, block_id, is_index, res);
                    });
                }),
            );
        });
    }

    fn block_acquired(
        &mut self,
        cx: &mut CoreContext,
        block_id: BlockId,
        is_index: bool,
        res: Result<BufToken>,
    ) {
        self.pending -= 1;
        let token = match res {
            Ok(token) => token,
            Err(err) => {
                self.fail(cx, err.wrap_err(format!("segment {} unavailable", block_id)));
                return;
            }
        };
        if is_index {
            self.index_token = Some(token);
        } else {
            self.tokens.insert(block_id, token);
        }
        if self.failed {
            return;
        }

        // Loading an existing value: the index names the segments to pin.
        if is_index && self.pending_op == Some(PendingOp::Acquire) {
            let parsed = cx.with(self.cache, |cache: &mut BufCache, _cx| {
                parse_index(cache.data(token))
            });
            match parsed {
                Err(err) => {
                    self.fail(cx, err);
                    return;
                }
                Ok((fbo, size, segments)) => {
                    self.first_block_offset = fbo;
                    self.size = size;
                    self.segments = segments.clone();
                    self.pending += segments.len();
                    for id in segments {
                        self.acquire_one(cx, id, false);
                    }
                }
            }
        }

        if self.pending == 0 {
            self.pending_done(cx);
        }
    }

    fn pending_done(&mut self, cx: &mut CoreContext) {
        let op = self.pending_op.take().expect("completion without an operation");
        match op {
            PendingOp::Allocate | PendingOp::Grow => {
                self.write_index(cx);
                self.state = LvState::Loaded;
            }
            PendingOp::Acquire => self.state = LvState::Loaded,
            PendingOp::Delete => self.state = LvState::Deleted,
        }
        if let Some(cb) = self.callback.take() {
            cx.defer(move |cx| cb(cx, Ok(())));
        }
    }

    fn fail(&mut self, cx: &mut CoreContext, err: eyre::Report) {
        self.failed = true;
        if let Some(cb) = self.callback.take() {
            cx.defer(move |cx| cb(cx, Err(eyre!("{:#}", err))));
        }
    }

    fn write_index(&mut self, cx: &mut CoreContext) {
        let header = LargeIndexHeader {
            magic: *INDEX_MAGIC,
            num_segments: U16::new(self.segments.len() as u16),
            first_block_offset: U16::new(self.first_block_offset),
            size: U32::new(self.size),
            _pad: U32::new(0),
        };
        let token = self.index_token.expect("index pinned while loaded");
        let segments = self.segments.clone();
        cx.with(self.cache, |cache: &mut BufCache, _cx| {
            let buf = cache.data_mut(token);
            buf[..INDEX_HEADER_SIZE].copy_from_slice(header.as_bytes());
            for (i, id) in segments.iter().enumerate() {
                let at = INDEX_HEADER_SIZE + i * 8;
                buf[at..at + 8].copy_from_slice(U64::new(*id).as_bytes());
            }
        });
    }

    // ------------------------------------------------------------------
    // Data access
    // ------------------------------------------------------------------

    fn seg_index(&self, pos: u32) -> (usize, usize) {
        let abs = pos as usize + self.first_block_offset as usize;
        (abs / self.payload, abs % self.payload)
    }

    /// Copies `data` into the value starting at `pos`.
    pub fn fill_at(&mut self, cx: &mut CoreContext, pos: u32, data: &[u8]) -> Result<()> {
        assert_eq!(self.state, LvState::Loaded, "fill of an unpinned value");
        ensure!(
            pos as usize + data.len() <= self.size as usize,
            "fill of {} bytes at {} overruns value of {} bytes",
            data.len(),
            pos,
            self.size
        );
        let mut written = 0usize;
        while written < data.len() {
            let (ix, seg_pos) = self.seg_index(pos + written as u32);
            let chunk = (self.payload - seg_pos).min(data.len() - written);
            let token = self.tokens[&self.segments[ix]];
            let src = &data[written..written + chunk];
            cx.with(self.cache, |cache: &mut BufCache, _cx| {
                cache.data_mut(token)[seg_pos..seg_pos + chunk].copy_from_slice(src);
            });
            written += chunk;
        }
        Ok(())
    }

    /// Reads `len` bytes starting at `pos`.
    pub fn read_at(&self, cx: &mut CoreContext, pos: u32, len: usize) -> Result<Vec<u8>> {
        assert_eq!(self.state, LvState::Loaded, "read of an unpinned value");
        ensure!(
            pos as usize + len <= self.size as usize,
            "read of {} bytes at {} overruns value of {} bytes",
            len,
            pos,
            self.size
        );
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let (ix, seg_pos) = self.seg_index(pos + out.len() as u32);
            let chunk = (self.payload - seg_pos).min(len - out.len());
            let token = self.tokens[&self.segments[ix]];
            cx.with(self.cache, |cache: &mut BufCache, _cx| {
                out.extend_from_slice(&cache.data(token)[seg_pos..seg_pos + chunk]);
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Growth
    // ------------------------------------------------------------------

    /// Grows the value by `extra` bytes at the back, allocating segments as
    /// needed.
    pub fn append(&mut self, cx: &mut CoreContext, extra: u32, cb: ResultCallback) {
        assert_eq!(self.state, LvState::Loaded, "append to an unpinned value");
        let new_size = self.size as usize + extra as usize;
        if new_size > MAX_VALUE_SIZE {
            cx.defer(move |cx| cb(cx, Err(eyre!("append past the {} byte cap", MAX_VALUE_SIZE))));
            return;
        }
        let capacity = self.segments.len() * self.payload - self.first_block_offset as usize;
        let deficit = new_size.saturating_sub(capacity);
        let new_segs = deficit.div_ceil(self.payload);
        self.size = new_size as u32;
        self.grow(cx, new_segs, false, cb);
    }

    /// Grows the value by `extra` bytes at the front. When the head room of
    /// segment 0 suffices this is O(1): only the first-block offset moves.
    pub fn prepend(&mut self, cx: &mut CoreContext, extra: u32, cb: ResultCallback) {
        assert_eq!(self.state, LvState::Loaded, "prepend to an unpinned value");
        let new_size = self.size as usize + extra as usize;
        if new_size > MAX_VALUE_SIZE {
            cx.defer(move |cx| cb(cx, Err(eyre!("prepend past the {} byte cap", MAX_VALUE_SIZE))));
            return;
        }
        self.size = new_size as u32;
        if extra <= self.first_block_offset as u32 {
            self.first_block_offset -= extra as u16;
            self.grow(cx, 0, true, cb);
            return;
        }
        let deficit = extra as usize - self.first_block_offset as usize;
        let new_segs = deficit.div_ceil(self.payload);
        self.first_block_offset = (new_segs * self.payload - deficit) as u16;
        self.grow(cx, new_segs, true, cb);
    }

    fn grow(&mut self, cx: &mut CoreContext, new_segs: usize, front: bool, cb: ResultCallback) {
        if new_segs == 0 {
            self.write_index(cx);
            cx.defer(move |cx| cb(cx, Ok(())));
            return;
        }
        self.state = LvState::Loading;
        self.callback = Some(cb);
        self.pending_op = Some(PendingOp::Grow);
        let fresh: Vec<BlockId> = cx.with(self.cache, |cache: &mut BufCache, _cx| {
            (0..new_segs).map(|_| cache.allocate_block_id()).collect()
        });
        if front {
            let mut all = fresh.clone();
            all.extend_from_slice(&self.segments);
            self.segments = all;
        } else {
            self.segments.extend_from_slice(&fresh);
        }
        self.pending = fresh.len();
        for id in fresh {
            self.acquire_one(cx, id, false);
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Unpins every block and discards the value: segments and index are
    /// deleted from the store.
    pub fn mark_deleted(&mut self, cx: &mut CoreContext, cb: ResultCallback) {
        assert_eq!(self.state, LvState::Loaded, "delete of an unpinned value");
        self.release_pins(cx);
        self.state = LvState::Loading;
        self.callback = Some(cb);
        self.pending_op = Some(PendingOp::Delete);

        let mut ids = self.segments.clone();
        ids.push(self.index_block);
        self.pending = ids.len();
        let me = self.me();
        let txn = self.txn;
        for id in ids {
            cx.with(self.cache, |cache: &mut BufCache, cx| {
                cache.delete(
                    cx,
                    txn,
                    id,
                    Box::new(move |cx, res| {
                        cx.with(me, |value: &mut LargeValue, cx| value.delete_done(cx, res));
                    }),
                );
            });
        }
    }

    fn delete_done(&mut self, cx: &mut CoreContext, res: Result<()>) {
        self.pending -= 1;
        if let Err(err) = res {
            self.fail(cx, err.wrap_err("segment delete failed"));
            return;
        }
        if !self.failed && self.pending == 0 {
            self.pending_done(cx);
        }
    }

    /// Unpins every block, leaving the value stored.
    pub fn release(&mut self, cx: &mut CoreContext) {
        assert_eq!(self.state, LvState::Loaded, "release of an unpinned value");
        self.release_pins(cx);
        self.state = LvState::Released;
    }

    fn release_pins(&mut self, cx: &mut CoreContext) {
        let tokens: Vec<BufToken> = self
            .index_token
            .take()
            .into_iter()
            .chain(self.tokens.drain().map(|(_, t)| t))
            .collect();
        cx.with(self.cache, |cache: &mut BufCache, _cx| {
            for token in tokens {
                cache.release(token);
            }
        });
    }
}

fn parse_index(payload: &[u8]) -> Result<(u16, u32, Vec<BlockId>)> {
    if payload.len() < INDEX_HEADER_SIZE {
        bail!("index block too small");
    }
    let header = LargeIndexHeader::read_from_bytes(&payload[..INDEX_HEADER_SIZE])
        .map_err(|_| eyre!("malformed index header"))?;
    if header.magic != *INDEX_MAGIC {
        bail!("block is not a large-value index");
    }
    let nsegs = header.num_segments.get() as usize;
    ensure!(
        INDEX_HEADER_SIZE + nsegs * 8 <= payload.len(),
        "index names {} segments but the block holds fewer",
        nsegs
    );
    let mut segments = Vec::with_capacity(nsegs);
    for i in 0..nsegs {
        let at = INDEX_HEADER_SIZE + i * 8;
        let id = U64::read_from_bytes(&payload[at..at + 8])
            .ok()
            .expect("segment id slice sized exactly"); // INVARIANT: slice is 8 bytes
        segments.push(id.get());
    }
    Ok((
        header.first_block_offset.get(),
        header.size.get(),
        segments,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_header_roundtrip() {
        let mut payload = vec![0u8; 4088];
        let header = LargeIndexHeader {
            magic: *INDEX_MAGIC,
            num_segments: U16::new(3),
            first_block_offset: U16::new(17),
            size: U32::new(9000),
            _pad: U32::new(0),
        };
        payload[..INDEX_HEADER_SIZE].copy_from_slice(header.as_bytes());
        for (i, id) in [11u64, 22, 33].iter().enumerate() {
            let at = INDEX_HEADER_SIZE + i * 8;
            payload[at..at + 8].copy_from_slice(U64::new(*id).as_bytes());
        }

        let (fbo, size, segments) = parse_index(&payload).unwrap();
        assert_eq!(fbo, 17);
        assert_eq!(size, 9000);
        assert_eq!(segments, vec![11, 22, 33]);
    }

    #[test]
    fn non_index_block_is_rejected() {
        let payload = vec![0u8; 4088];
        assert!(parse_index(&payload).is_err());
    }
}
