//! # Slice
//!
//! One shard of the store: a buffer cache bound to a share of a serializer,
//! pinned to a home core. The slice walks a small startup state machine
//! (cache warm-up, then superblock bootstrap) before it serves, and the
//! reverse on shutdown. It also mints CAS tokens, unique within the slice
//! for any reasonable uptime.

use std::time::{SystemTime, UNIX_EPOCH};

use eyre::eyre;
use tracing::{debug, info, warn};

use crate::cache::BufCache;
use crate::exec::{CoreContext, CoreId, FatalHook, Handle};
use crate::serializer::{ResultCallback, SerializerShare};
use crate::store::superblock::SuperblockInit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SliceState {
    Unstarted,
    StartingUpStartCache,
    StartingUpWaitingForCache,
    StartingUpInitializeSuperblock,
    StartingUpWaitingForSuperblock,
    StartingUpFinish,
    Ready,
    ShuttingDownShutdownCache,
    ShuttingDownWaitingForCache,
    ShuttingDownFinish,
    ShutDown,
    Failed,
}

/// One shard: cache + serializer share + CAS counter, single-owner on its
/// home core.
pub struct Slice {
    home_core: CoreId,
    state: SliceState,
    me: Option<Handle<Slice>>,
    cache: Handle<BufCache>,
    share: SerializerShare,
    cas_counter: u32,
    sb_fsm: Option<Handle<SuperblockInit>>,
    ready_cb: Option<ResultCallback>,
    shutdown_cb: Option<ResultCallback>,
    cache_shutdown_error: Option<String>,
}

impl Slice {
    /// Builds the slice and its cache on the current core and returns the
    /// slice handle.
    #[allow(clippy::too_many_arguments)]
    pub fn install(
        cx: &mut CoreContext,
        share: SerializerShare,
        payload_size: usize,
        cache_bytes: usize,
        wait_for_flush: bool,
        flush_timer_ms: u32,
        flush_threshold_percent: u32,
        fatal: FatalHook,
    ) -> Handle<Slice> {
        let mut cache = BufCache::new(
            cx.id(),
            share,
            payload_size,
            cache_bytes,
            wait_for_flush,
            flush_timer_ms,
            flush_threshold_percent,
        );
        cache.set_fatal_hook(fatal);
        let cache_handle = cx.install(cache);
        cx.get(cache_handle).borrow_mut().bind(cache_handle);

        let slice = Slice {
            home_core: cx.id(),
            state: SliceState::Unstarted,
            me: None,
            cache: cache_handle,
            share,
            cas_counter: 0,
            sb_fsm: None,
            ready_cb: None,
            shutdown_cb: None,
            cache_shutdown_error: None,
        };
        let handle = cx.install(slice);
        cx.get(handle).borrow_mut().me = Some(handle);
        handle
    }

    fn me(&self) -> Handle<Slice> {
        self.me.expect("slice used before install") // INVARIANT: install() binds the handle
    }

    fn assert_core(&self, cx: &CoreContext) {
        debug_assert_eq!(cx.id(), self.home_core, "slice touched off its home core");
    }

    pub fn home_core(&self) -> CoreId {
        self.home_core
    }

    pub fn cache_handle(&self) -> Handle<BufCache> {
        self.cache
    }

    pub fn share(&self) -> SerializerShare {
        self.share
    }

    pub fn is_ready(&self) -> bool {
        self.state == SliceState::Ready
    }

    /// CAS token: wall-clock seconds in the high half, a per-slice counter
    /// in the low half.
    pub fn gen_cas(&mut self) -> u64 {
        assert_eq!(self.state, SliceState::Ready, "CAS from a slice that is not serving");
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.cas_counter = self.cas_counter.wrapping_add(1);
        (seconds << 32) | self.cas_counter as u64
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Starts the slice: cache warm-up, then superblock bootstrap. Exactly
    /// one start per lifetime.
    pub fn start(&mut self, cx: &mut CoreContext, cb: ResultCallback) {
        self.assert_core(cx);
        assert_eq!(self.state, SliceState::Unstarted, "slice started twice");
        self.state = SliceState::StartingUpStartCache;
        self.ready_cb = Some(cb);
        self.next_starting_up_step(cx);
    }

    fn next_starting_up_step(&mut self, cx: &mut CoreContext) {
        if self.state == SliceState::StartingUpStartCache {
            self.state = SliceState::StartingUpWaitingForCache;
            let me = self.me();
            let cache = self.cache;
            cx.with(cache, |cache: &mut BufCache, cx| {
                cache.start(
                    cx,
                    Box::new(move |cx, res| {
                        cx.with(me, |slice: &mut Slice, cx| slice.on_cache_ready(cx, res));
                    }),
                );
            });
            return;
        }

        if self.state == SliceState::StartingUpInitializeSuperblock {
            self.state = SliceState::StartingUpWaitingForSuperblock;
            let me = self.me();
            let fsm_handle = SuperblockInit::install(cx, self.cache);
            self.sb_fsm = Some(fsm_handle);
            cx.with(fsm_handle, |fsm: &mut SuperblockInit, cx| {
                fsm.run(
                    cx,
                    Box::new(move |cx, res| {
                        cx.with(me, |slice: &mut Slice, cx| {
                            slice.on_superblock_initialized(cx, res);
                        });
                    }),
                );
            });
            return;
        }

        if self.state == SliceState::StartingUpFinish {
            self.state = SliceState::Ready;
            info!(core = self.home_core, "slice ready");
            if let Some(cb) = self.ready_cb.take() {
                cx.defer(move |cx| cb(cx, Ok(())));
            }
        }
    }

    fn on_cache_ready(&mut self, cx: &mut CoreContext, res: eyre::Result<()>) {
        debug_assert_eq!(self.state, SliceState::StartingUpWaitingForCache);
        if let Err(err) = res {
            self.fail_startup(cx, err);
            return;
        }
        debug!(core = self.home_core, "slice cache ready");
        self.state = SliceState::StartingUpInitializeSuperblock;
        self.next_starting_up_step(cx);
    }

    fn on_superblock_initialized(&mut self, cx: &mut CoreContext, res: eyre::Result<()>) {
        debug_assert_eq!(self.state, SliceState::StartingUpWaitingForSuperblock);
        if let Some(fsm) = self.sb_fsm.take() {
            cx.remove::<SuperblockInit>(fsm);
        }
        if let Err(err) = res {
            self.fail_startup(cx, err);
            return;
        }
        self.state = SliceState::StartingUpFinish;
        self.next_starting_up_step(cx);
    }

    fn fail_startup(&mut self, cx: &mut CoreContext, err: eyre::Report) {
        warn!(core = self.home_core, error = %err, "slice startup failed");
        self.state = SliceState::Failed;
        if let Some(cb) = self.ready_cb.take() {
            cx.defer(move |cx| cb(cx, Err(err)));
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stops the slice. Exactly one shutdown per lifetime; valid from
    /// `Ready` and from `Failed`.
    pub fn shutdown(&mut self, cx: &mut CoreContext, cb: ResultCallback) {
        self.assert_core(cx);
        match self.state {
            // Cache teardown still runs from Failed so its slot is freed.
            SliceState::Ready | SliceState::Failed => {}
            other => panic!("slice shutdown in state {:?}", other),
        }
        self.shutdown_cb = Some(cb);
        self.state = SliceState::ShuttingDownShutdownCache;
        self.next_shutting_down_step(cx);
    }

    fn next_shutting_down_step(&mut self, cx: &mut CoreContext) {
        if self.state == SliceState::ShuttingDownShutdownCache {
            self.state = SliceState::ShuttingDownWaitingForCache;
            let me = self.me();
            let cache = self.cache;
            cx.with(cache, |cache: &mut BufCache, cx| {
                cache.shutdown(
                    cx,
                    Box::new(move |cx, res| {
                        cx.with(me, |slice: &mut Slice, cx| slice.on_cache_shutdown(cx, res));
                    }),
                );
            });
            return;
        }

        if self.state == SliceState::ShuttingDownFinish {
            cx.remove::<BufCache>(self.cache);
            self.state = SliceState::ShutDown;
            info!(core = self.home_core, "slice stopped");
            if let Some(cb) = self.shutdown_cb.take() {
                match self.cache_shutdown_error.take() {
                    None => cx.defer(move |cx| cb(cx, Ok(()))),
                    Some(err) => cx.defer(move |cx| {
                        cb(cx, Err(eyre!("cache shutdown failed: {}", err)))
                    }),
                }
            }
        }
    }

    fn on_cache_shutdown(&mut self, cx: &mut CoreContext, res: eyre::Result<()>) {
        debug_assert_eq!(self.state, SliceState::ShuttingDownWaitingForCache);
        if let Err(err) = res {
            self.cache_shutdown_error = Some(format!("{err:#}"));
        }
        self.state = SliceState::ShuttingDownFinish;
        self.next_shutting_down_step(cx);
    }
}
