//! # Superblock Bootstrap
//!
//! Block 0 of every slice is its superblock: the root record naming the
//! slice's index root. A freshly created file reads back as zeroes, which
//! decodes as "no database here". The bootstrap state machine turns that
//! into a valid empty root exactly once:
//!
//! ```text
//! begin write transaction
//!   acquire block 0
//!     if the record says no database exists:
//!         mark it existing, point the root at the nil block
//!     release
//! commit
//! ```
//!
//! Running against an already-initialized slice changes nothing but still
//! commits the (empty) transaction; callers use that commit as a fence.
//! Every step may suspend on the cache; the machine records where it was
//! and resumes on the same core.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::eyre;
use tracing::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::cache::{AccessMode, BufCache, BufToken, TxnId};
use crate::exec::{CoreContext, CoreId, Handle};
use crate::serializer::ResultCallback;
use crate::{BlockId, NIL_BLOCK_ID};

/// Slice-local id of the superblock.
pub const SUPERBLOCK_ID: BlockId = 0;

const SUPERBLOCK_MAGIC: &[u8; 8] = b"LODESUPR";
const FLAG_DATABASE_EXISTS: u32 = 1;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct SuperblockRecord {
    magic: [u8; 8],
    flags: U32,
    _pad: U32,
    root_block: U64,
    crc: U64,
}

const SUPERBLOCK_RECORD_SIZE: usize = 32;
const _: () = assert!(std::mem::size_of::<SuperblockRecord>() == SUPERBLOCK_RECORD_SIZE);

impl SuperblockRecord {
    fn compute_crc(&self) -> u64 {
        CRC64.checksum(&self.as_bytes()[..SUPERBLOCK_RECORD_SIZE - 8])
    }
}

/// Decoded view of a slice's root record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockView {
    pub database_exists: bool,
    pub root_block: BlockId,
}

/// Decodes a superblock payload. Anything that does not carry the magic and
/// a matching checksum (a zeroed fresh block in particular) reads as
/// "no database".
pub fn read_record(payload: &[u8]) -> SuperblockView {
    let absent = SuperblockView {
        database_exists: false,
        root_block: NIL_BLOCK_ID,
    };
    if payload.len() < SUPERBLOCK_RECORD_SIZE {
        return absent;
    }
    let record = match SuperblockRecord::read_from_bytes(&payload[..SUPERBLOCK_RECORD_SIZE]) {
        Ok(record) => record,
        Err(_) => return absent,
    };
    if record.magic != *SUPERBLOCK_MAGIC || record.crc.get() != record.compute_crc() {
        return absent;
    }
    SuperblockView {
        database_exists: record.flags.get() & FLAG_DATABASE_EXISTS != 0,
        root_block: record.root_block.get(),
    }
}

/// Encodes `view` into a superblock payload.
pub fn write_record(payload: &mut [u8], view: SuperblockView) {
    let mut record = SuperblockRecord {
        magic: *SUPERBLOCK_MAGIC,
        flags: U32::new(if view.database_exists {
            FLAG_DATABASE_EXISTS
        } else {
            0
        }),
        _pad: U32::new(0),
        root_block: U64::new(view.root_block),
        crc: U64::new(0),
    };
    record.crc = U64::new(record.compute_crc());
    payload[..SUPERBLOCK_RECORD_SIZE].copy_from_slice(record.as_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SbState {
    Unstarted,
    BeginTransaction,
    BeginningTransaction,
    AcquireSuperblock,
    AcquiringSuperblock,
    MakeChange,
    CommitTransaction,
    CommittingTransaction,
    Finish,
    Done,
}

/// One-shot bootstrap machine; install, `run`, then remove.
pub struct SuperblockInit {
    home_core: CoreId,
    state: SbState,
    me: Option<Handle<SuperblockInit>>,
    cache: Handle<BufCache>,
    txn: Option<TxnId>,
    callback: Option<ResultCallback>,
}

impl SuperblockInit {
    pub fn install(cx: &mut CoreContext, cache: Handle<BufCache>) -> Handle<SuperblockInit> {
        let fsm = SuperblockInit {
            home_core: cx.id(),
            state: SbState::Unstarted,
            me: None,
            cache,
            txn: None,
            callback: None,
        };
        let handle = cx.install(fsm);
        cx.get(handle).borrow_mut().me = Some(handle);
        handle
    }

    fn me(&self) -> Handle<SuperblockInit> {
        self.me.expect("superblock machine used before install")
    }

    /// Runs the machine; `cb` fires once the commit is durable.
    pub fn run(&mut self, cx: &mut CoreContext, cb: ResultCallback) {
        debug_assert_eq!(cx.id(), self.home_core);
        assert_eq!(self.state, SbState::Unstarted, "superblock machine reused");
        self.callback = Some(cb);
        self.state = SbState::BeginTransaction;
        self.next_step(cx);
    }

    fn next_step(&mut self, cx: &mut CoreContext) {
        if self.state == SbState::BeginTransaction {
            self.state = SbState::BeginningTransaction;
            let me = self.me();
            let cache = self.cache;
            cx.with(cache, |cache: &mut BufCache, cx| {
                cache.begin_transaction(
                    cx,
                    AccessMode::Write,
                    Box::new(move |cx, txn| {
                        cx.with(me, |fsm: &mut SuperblockInit, cx| fsm.on_txn_begun(cx, txn));
                    }),
                );
            });
            return;
        }

        if self.state == SbState::AcquireSuperblock {
            self.state = SbState::AcquiringSuperblock;
            let me = self.me();
            let cache = self.cache;
            let txn = self.txn.expect("acquire before transaction");
            cx.with(cache, |cache: &mut BufCache, cx| {
                cache.acquire(
                    cx,
                    txn,
                    SUPERBLOCK_ID,
                    AccessMode::Write,
                    Box::new(move |cx, res| {
                        cx.with(me, |fsm: &mut SuperblockInit, cx| fsm.on_acquired(cx, res));
                    }),
                );
            });
            return;
        }

        if self.state == SbState::CommitTransaction {
            self.state = SbState::CommittingTransaction;
            let me = self.me();
            let cache = self.cache;
            let txn = self.txn.expect("commit before transaction");
            cx.with(cache, |cache: &mut BufCache, cx| {
                cache.commit(
                    cx,
                    txn,
                    Box::new(move |cx, res| {
                        cx.with(me, |fsm: &mut SuperblockInit, cx| fsm.on_committed(cx, res));
                    }),
                );
            });
            return;
        }

        if self.state == SbState::Finish {
            self.state = SbState::Done;
            if let Some(cb) = self.callback.take() {
                cx.defer(move |cx| cb(cx, Ok(())));
            }
        }
    }

    fn on_txn_begun(&mut self, cx: &mut CoreContext, txn: TxnId) {
        debug_assert_eq!(self.state, SbState::BeginningTransaction);
        self.txn = Some(txn);
        self.state = SbState::AcquireSuperblock;
        self.next_step(cx);
    }

    fn on_acquired(&mut self, cx: &mut CoreContext, res: eyre::Result<BufToken>) {
        debug_assert_eq!(self.state, SbState::AcquiringSuperblock);
        let token = match res {
            Ok(token) => token,
            Err(err) => {
                self.fail(cx, err.wrap_err("superblock acquisition failed"));
                return;
            }
        };

        self.state = SbState::MakeChange;
        let cache = self.cache;
        cx.with(cache, |cache: &mut BufCache, _cx| {
            let view = read_record(cache.data(token));
            if !view.database_exists {
                // A newly created slice: install the empty root.
                write_record(
                    cache.data_mut(token),
                    SuperblockView {
                        database_exists: true,
                        root_block: NIL_BLOCK_ID,
                    },
                );
                debug!("superblock installed");
            }
            cache.release(token);
        });

        self.state = SbState::CommitTransaction;
        self.next_step(cx);
    }

    fn on_committed(&mut self, cx: &mut CoreContext, res: eyre::Result<()>) {
        debug_assert_eq!(self.state, SbState::CommittingTransaction);
        if let Err(err) = res {
            self.fail(cx, err.wrap_err("superblock commit failed"));
            return;
        }
        self.state = SbState::Finish;
        self.next_step(cx);
    }

    fn fail(&mut self, cx: &mut CoreContext, err: eyre::Report) {
        self.state = SbState::Done;
        if let Some(cb) = self.callback.take() {
            cx.defer(move |cx| cb(cx, Err(eyre!("{:#}", err))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_block_reads_as_absent() {
        let payload = vec![0u8; 128];
        let view = read_record(&payload);
        assert!(!view.database_exists);
        assert_eq!(view.root_block, NIL_BLOCK_ID);
    }

    #[test]
    fn record_roundtrip() {
        let mut payload = vec![0u8; 128];
        write_record(
            &mut payload,
            SuperblockView {
                database_exists: true,
                root_block: 42,
            },
        );
        let view = read_record(&payload);
        assert!(view.database_exists);
        assert_eq!(view.root_block, 42);
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let mut payload = vec![0u8; 128];
        write_record(
            &mut payload,
            SuperblockView {
                database_exists: true,
                root_block: 7,
            },
        );
        payload[12] ^= 0xff;
        assert!(!read_record(&payload).database_exists);
    }
}
