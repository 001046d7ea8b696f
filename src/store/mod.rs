//! # Store
//!
//! The top-level router: owns every serializer and every slice, spreads
//! them over the worker cores, and routes keys to slices by fingerprint.
//!
//! ## Startup
//!
//! Three barriers, each fanning out in parallel and completing on the
//! store's home core:
//!
//! 1. Serializer files are probed, then created or recovered, one per
//!    `<db_file_name>_<id>`, on core `id % num_cores`.
//! 2. Slices are built and started on core `id % num_cores`, each bound to
//!    serializer `id % n_serializers` at rank `id / n_serializers`.
//! 3. The store flips to ready and the caller hears about it.
//!
//! No slice serves until every serializer and every peer slice is up:
//! recovery and superblock bootstrap finish everywhere first. Shutdown is
//! the mirror image: all slices drain, then all serializers, then off.
//!
//! ## Failure
//!
//! A component that cannot continue reports through its fatal hook; the
//! store records the first error, flips to `Failed`, and stops accepting
//! work. Shutdown from `Failed` still tears everything down.
//!
//! ## Embedding
//!
//! [`StoreHandle`] wraps the asynchronous store in a blocking API for
//! embedders and tests: `launch`, `with_slice`, `shutdown`.

pub mod large_value;
pub mod slice;
pub mod superblock;

pub use large_value::LargeValue;
pub use slice::Slice;
pub use superblock::{SuperblockInit, SuperblockView, SUPERBLOCK_ID};

use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::bounded;
use eyre::{bail, eyre, Result};
use tracing::{error, info, warn};

use crate::config::StoreConfig;
use crate::exec::{CoreContext, CoreId, Cores, FatalHook, Handle};
use crate::io::{FileDevice, SharedDevice};
use crate::routing;
use crate::serializer::{LogSerializer, ResultCallback, SerializerShare};

/// Builds the block device for serializer `id` at `path`; `create` is true
/// for brand-new files. Swappable for alternate backends and fault
/// injection.
pub type DeviceFactory = Arc<dyn Fn(usize, &Path, bool) -> Result<SharedDevice> + Send + Sync>;

/// The standard file-backed device factory.
pub fn default_device_factory() -> DeviceFactory {
    Arc::new(|_id, path, create| {
        let device: SharedDevice = if create {
            Arc::new(FileDevice::create(path)?)
        } else {
            Arc::new(FileDevice::open(path)?)
        };
        Ok(device)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Off,
    StartingUp,
    Ready,
    ShuttingDown,
    Failed,
}

/// Router and lifecycle manager for all slices and serializers. Lives on
/// its home core; embedders drive it through [`StoreHandle`].
pub struct Store {
    config: StoreConfig,
    home_core: CoreId,
    state: StoreState,
    me: Option<Handle<Store>>,
    devices: DeviceFactory,
    serializers: Vec<Option<Handle<LogSerializer>>>,
    slices: Vec<Option<Handle<Slice>>>,
    messages_out: usize,
    first_error: Option<String>,
    ready_cb: Option<ResultCallback>,
    shutdown_cb: Option<ResultCallback>,
}

impl Store {
    pub fn new(config: StoreConfig, devices: DeviceFactory, home_core: CoreId) -> Self {
        let n_serializers = config.n_serializers;
        let n_slices = config.n_slices;
        Self {
            config,
            home_core,
            state: StoreState::Off,
            me: None,
            devices,
            serializers: (0..n_serializers).map(|_| None).collect(),
            slices: (0..n_slices).map(|_| None).collect(),
            messages_out: 0,
            first_error: None,
            ready_cb: None,
            shutdown_cb: None,
        }
    }

    /// Records this store's own handle; must follow install.
    pub fn bind(&mut self, me: Handle<Store>) {
        self.me = Some(me);
    }

    fn me(&self) -> Handle<Store> {
        self.me.expect("store used before bind")
    }

    fn assert_core(&self, cx: &CoreContext) {
        debug_assert_eq!(cx.id(), self.home_core, "store touched off its home core");
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.state == StoreState::Ready
    }

    pub fn has_failed(&self) -> bool {
        self.state == StoreState::Failed
    }

    /// First unrecoverable error seen, if any.
    pub fn failure(&self) -> Option<&str> {
        self.first_error.as_deref()
    }

    /// Index of the slice owning `key`.
    pub fn slice_for(&self, key: &[u8]) -> usize {
        routing::slice_for_key(key, self.config.n_slices)
    }

    /// Handle of slice `idx`; panics while the store is not ready.
    pub fn slice_handle(&self, idx: usize) -> Handle<Slice> {
        self.slices[idx].expect("slice not running")
    }

    pub fn serializer_handle(&self, idx: usize) -> Handle<LogSerializer> {
        self.serializers[idx].expect("serializer not running")
    }

    fn fatal_hook(&self) -> FatalHook {
        let me = self.me();
        Arc::new(move |cx: &mut CoreContext, err: eyre::Report| {
            let msg = format!("{:#}", err);
            cx.dispatch(me.core(), move |cx| {
                cx.with(me, |store: &mut Store, cx| store.on_fatal(cx, msg));
            });
        })
    }

    fn on_fatal(&mut self, _cx: &mut CoreContext, msg: String) {
        error!(error = %msg, "store component failed");
        if self.first_error.is_none() {
            self.first_error = Some(msg);
        }
        if self.state == StoreState::Ready {
            self.state = StoreState::Failed;
        }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Brings the store up. `cb` fires once every serializer and slice is
    /// serving, or with the first error once startup has failed
    /// everywhere it was going to.
    pub fn start(&mut self, cx: &mut CoreContext, cb: ResultCallback) {
        self.assert_core(cx);
        assert_eq!(self.state, StoreState::Off, "store started twice");
        if let Err(err) = self.config.validate() {
            self.state = StoreState::Failed;
            cx.defer(move |cx| cb(cx, Err(err)));
            return;
        }
        info!(
            n_serializers = self.config.n_serializers,
            n_slices = self.config.n_slices,
            path = %self.config.db_file_name.display(),
            "store starting"
        );
        self.state = StoreState::StartingUp;
        self.ready_cb = Some(cb);
        self.create_serializers(cx);
    }

    fn create_serializers(&mut self, cx: &mut CoreContext) {
        self.messages_out = self.config.n_serializers;
        let hook = self.fatal_hook();
        for id in 0..self.config.n_serializers {
            let target = id % cx.num_cores();
            let me = self.me();
            let home = self.home_core;
            let path = self.config.serializer_path(id);
            let static_config = self.config.ser_static_config;
            let dynamic = self.config.ser_dynamic_config;
            let devices = Arc::clone(&self.devices);
            let hook = Arc::clone(&hook);
            cx.dispatch(target, move |cx| {
                let result =
                    build_serializer(cx, id, &path, &devices, static_config, dynamic, hook);
                cx.dispatch(home, move |cx| {
                    cx.with(me, |store: &mut Store, cx| {
                        store.serializer_created(cx, id, result);
                    });
                });
            });
        }
    }

    fn serializer_created(
        &mut self,
        cx: &mut CoreContext,
        id: usize,
        result: Result<Handle<LogSerializer>>,
    ) {
        self.assert_core(cx);
        match result {
            Ok(handle) => self.serializers[id] = Some(handle),
            Err(err) => {
                warn!(serializer = id, error = %err, "serializer startup failed");
                if self.first_error.is_none() {
                    self.first_error = Some(format!("serializer {}: {:#}", id, err));
                }
            }
        }
        self.messages_out -= 1;
        if self.messages_out == 0 {
            if self.first_error.is_some() {
                self.finish_start_failed(cx);
            } else {
                self.create_slices(cx);
            }
        }
    }

    fn create_slices(&mut self, cx: &mut CoreContext) {
        self.messages_out = self.config.n_slices;
        let cache_bytes = self.config.max_cache_size / self.config.n_slices;
        let payload = self.config.ser_static_config.block_payload_size();
        for id in 0..self.config.n_slices {
            let target = id % cx.num_cores();
            let ser_id = self.config.serializer_for_slice(id);
            let ser = self.serializers[ser_id].expect("serializer barrier passed");
            let rank = self.config.rank_on_serializer(id);
            let count = self.config.count_on_serializer(ser_id);
            let me = self.me();
            let home = self.home_core;
            let wait_for_flush = self.config.wait_for_flush;
            let flush_timer_ms = self.config.flush_timer_ms;
            let flush_threshold = self.config.flush_threshold_percent;
            let hook = self.fatal_hook();
            cx.dispatch(target, move |cx| {
                let share = SerializerShare::new(ser, rank, count);
                let slice = Slice::install(
                    cx,
                    share,
                    payload,
                    cache_bytes,
                    wait_for_flush,
                    flush_timer_ms,
                    flush_threshold,
                    hook,
                );
                cx.with(slice, |s: &mut Slice, cx| {
                    s.start(
                        cx,
                        Box::new(move |cx, res| {
                            let err = res.err().map(|e| format!("{:#}", e));
                            cx.dispatch(home, move |cx| {
                                cx.with(me, |store: &mut Store, cx| {
                                    store.slice_ready(cx, id, slice, err);
                                });
                            });
                        }),
                    );
                });
            });
        }
    }

    fn slice_ready(
        &mut self,
        cx: &mut CoreContext,
        id: usize,
        handle: Handle<Slice>,
        err: Option<String>,
    ) {
        self.assert_core(cx);
        self.slices[id] = Some(handle);
        if let Some(err) = err {
            warn!(slice = id, error = %err, "slice startup failed");
            if self.first_error.is_none() {
                self.first_error = Some(format!("slice {}: {}", id, err));
            }
        }
        self.messages_out -= 1;
        if self.messages_out == 0 {
            if self.first_error.is_some() {
                self.finish_start_failed(cx);
            } else {
                self.finish_start(cx);
            }
        }
    }

    fn finish_start(&mut self, cx: &mut CoreContext) {
        assert_eq!(self.state, StoreState::StartingUp);
        self.state = StoreState::Ready;
        info!("store ready");
        if let Some(cb) = self.ready_cb.take() {
            cx.defer(move |cx| cb(cx, Ok(())));
        }
    }

    fn finish_start_failed(&mut self, cx: &mut CoreContext) {
        self.state = StoreState::Failed;
        let msg = self
            .first_error
            .clone()
            .unwrap_or_else(|| "startup failed".to_string());
        if let Some(cb) = self.ready_cb.take() {
            cx.defer(move |cx| cb(cx, Err(eyre!("{}", msg))));
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Tears the store down: every slice on its core, then every
    /// serializer, then `cb`. Valid from `Ready` and from `Failed`.
    pub fn shutdown(&mut self, cx: &mut CoreContext, cb: ResultCallback) {
        self.assert_core(cx);
        match self.state {
            StoreState::Ready | StoreState::Failed => {}
            other => panic!("store shutdown in state {:?}", other),
        }
        self.state = StoreState::ShuttingDown;
        self.shutdown_cb = Some(cb);
        info!("store shutting down");
        self.shutdown_slices(cx);
    }

    fn shutdown_slices(&mut self, cx: &mut CoreContext) {
        let live: Vec<(usize, Handle<Slice>)> = self
            .slices
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|&h| (i, h)))
            .collect();
        self.messages_out = live.len();
        if live.is_empty() {
            self.shutdown_serializers(cx);
            return;
        }
        for (id, handle) in live {
            let me = self.me();
            let home = self.home_core;
            cx.dispatch(handle.core(), move |cx| {
                cx.with(handle, |slice: &mut Slice, cx| {
                    slice.shutdown(
                        cx,
                        Box::new(move |cx, res| {
                            cx.remove::<Slice>(handle);
                            if let Err(err) = res {
                                warn!(slice = id, error = %err, "slice shutdown failed");
                            }
                            cx.dispatch(home, move |cx| {
                                cx.with(me, |store: &mut Store, cx| {
                                    store.slice_shut_down(cx, id);
                                });
                            });
                        }),
                    );
                });
            });
        }
    }

    fn slice_shut_down(&mut self, cx: &mut CoreContext, id: usize) {
        self.assert_core(cx);
        self.slices[id] = None;
        self.messages_out -= 1;
        if self.messages_out == 0 {
            self.shutdown_serializers(cx);
        }
    }

    fn shutdown_serializers(&mut self, cx: &mut CoreContext) {
        let live: Vec<(usize, Handle<LogSerializer>)> = self
            .serializers
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|&h| (i, h)))
            .collect();
        self.messages_out = live.len();
        if live.is_empty() {
            self.finish_shutdown(cx);
            return;
        }
        for (id, handle) in live {
            let me = self.me();
            let home = self.home_core;
            cx.dispatch(handle.core(), move |cx| {
                cx.with(handle, |ser: &mut LogSerializer, cx| {
                    ser.shutdown(
                        cx,
                        handle,
                        Box::new(move |cx, res| {
                            cx.remove::<LogSerializer>(handle);
                            if let Err(err) = res {
                                warn!(serializer = id, error = %err, "serializer shutdown failed");
                            }
                            cx.dispatch(home, move |cx| {
                                cx.with(me, |store: &mut Store, cx| {
                                    store.serializer_shut_down(cx, id);
                                });
                            });
                        }),
                    );
                });
            });
        }
    }

    fn serializer_shut_down(&mut self, cx: &mut CoreContext, id: usize) {
        self.assert_core(cx);
        self.serializers[id] = None;
        self.messages_out -= 1;
        if self.messages_out == 0 {
            self.finish_shutdown(cx);
        }
    }

    fn finish_shutdown(&mut self, cx: &mut CoreContext) {
        assert_eq!(self.state, StoreState::ShuttingDown);
        self.state = StoreState::Off;
        info!("store off");
        if let Some(cb) = self.shutdown_cb.take() {
            cx.defer(move |cx| cb(cx, Ok(())));
        }
    }
}

fn build_serializer(
    cx: &mut CoreContext,
    id: usize,
    path: &Path,
    devices: &DeviceFactory,
    static_config: crate::config::SerStaticConfig,
    dynamic: crate::config::SerDynamicConfig,
    hook: FatalHook,
) -> Result<Handle<LogSerializer>> {
    let create = match std::fs::metadata(path) {
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => bail!("cannot probe data file {:?}: {}", path, e),
    };
    let device = devices(id, path, create)?;
    let ser = if create {
        LogSerializer::create(cx.id(), path, device, static_config, dynamic)?
    } else {
        LogSerializer::open(cx.id(), path, device, static_config, dynamic)?
    };
    let handle = cx.install(ser);
    cx.get(handle).borrow_mut().set_fatal_hook(hook);
    Ok(handle)
}

// ============================================================================
// Blocking facade
// ============================================================================

/// Blocking wrapper around a running store.
///
/// `launch` spawns the core set, installs the store, and waits for the
/// startup barriers; `shutdown` drains everything and joins the cores.
/// Accessors hop to the owning core and block for the reply, so they must
/// be called from outside the core set (any plain thread).
pub struct StoreHandle {
    cores: Arc<Cores>,
    store: Handle<Store>,
    n_slices: usize,
}

impl StoreHandle {
    /// Starts a store with file-backed devices.
    pub fn launch(config: StoreConfig) -> Result<StoreHandle> {
        Self::launch_with_devices(config, default_device_factory())
    }

    /// Starts a store with a custom device factory (alternate backends,
    /// fault injection).
    pub fn launch_with_devices(config: StoreConfig, devices: DeviceFactory) -> Result<StoreHandle> {
        config.validate()?;
        let n_slices = config.n_slices;
        let cores = Cores::start(config.effective_cores())?;

        let store = cores.run_blocking(0, move |cx| {
            let store = Store::new(config, devices, cx.id());
            let handle = cx.install(store);
            cx.get(handle).borrow_mut().bind(handle);
            handle
        })?;

        let (tx, rx) = bounded::<Result<()>>(1);
        cores.dispatch(store.core(), move |cx| {
            cx.with(store, |s: &mut Store, cx| {
                s.start(
                    cx,
                    Box::new(move |_cx, res| {
                        let _ = tx.send(res);
                    }),
                );
            });
        });
        match rx.recv() {
            Ok(Ok(())) => Ok(StoreHandle {
                cores,
                store,
                n_slices,
            }),
            Ok(Err(err)) => {
                cores.stop();
                Err(err.wrap_err("store startup failed"))
            }
            Err(_) => {
                cores.stop();
                bail!("core set stopped during startup");
            }
        }
    }

    pub fn num_slices(&self) -> usize {
        self.n_slices
    }

    pub fn cores(&self) -> &Arc<Cores> {
        &self.cores
    }

    /// Index of the slice owning `key`; pure arithmetic, no dispatch.
    pub fn slice_for(&self, key: &[u8]) -> usize {
        routing::slice_for_key(key, self.n_slices)
    }

    /// Runs `body` on the store's home core with the store borrowed.
    pub fn with_store<R, F>(&self, body: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Store, &mut CoreContext) -> R + Send + 'static,
    {
        let handle = self.store;
        self.cores
            .run_blocking(handle.core(), move |cx| cx.with(handle, body))
    }

    /// Runs `body` on slice `idx`'s home core with the slice borrowed.
    pub fn with_slice<R, F>(&self, idx: usize, body: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Slice, &mut CoreContext) -> R + Send + 'static,
    {
        let handle = self.with_store(move |store, _cx| store.slice_handle(idx))?;
        self.cores
            .run_blocking(handle.core(), move |cx| cx.with(handle, body))
    }

    /// Drains the store and stops the cores.
    pub fn shutdown(self) -> Result<()> {
        let handle = self.store;
        let (tx, rx) = bounded::<Result<()>>(1);
        self.cores.dispatch(handle.core(), move |cx| {
            cx.with(handle, |store: &mut Store, cx| {
                store.shutdown(
                    cx,
                    Box::new(move |_cx, res| {
                        let _ = tx.send(res);
                    }),
                );
            });
        });
        let res = rx
            .recv()
            .map_err(|_| eyre!("core set stopped during shutdown"))?;
        res
        // Drop stops and joins the cores.
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        self.cores.stop();
    }
}
