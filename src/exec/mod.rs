//! # Per-Core Cooperative Executors
//!
//! The engine runs one single-threaded task queue per core. Every component
//! (store, slice, serializer, cache) is installed on exactly one core - its
//! home core - and its state is only ever touched by tasks running there.
//! Cross-core communication is a one-shot "run this closure on core X"
//! primitive; nothing else crosses a core boundary.
//!
//! ## Ownership Model
//!
//! Components live in a core-local slot table as `Rc<RefCell<T>>`. The `Rc`
//! never leaves its core; remote parties hold a [`Handle`] - a plain
//! `(core, slot)` pair that is `Copy + Send` - and reach the component by
//! dispatching a task to its core and resolving the handle there. This keeps
//! the single-owner invariant checkable: resolving a handle on the wrong
//! core is a debug assertion failure.
//!
//! ## Suspension Discipline
//!
//! Handlers run to completion; anything that needs to wait (disk I/O, a
//! cross-core reply) registers a callback and returns. Callbacks are always
//! delivered through the task queue - never invoked while the component that
//! registered them is still borrowed - so a `RefCell` is sufficient and
//! re-entrant borrows cannot happen.
//!
//! ## Usage
//!
//! ```ignore
//! let cores = Cores::start(4)?;
//! cores.dispatch(2, |cx| {
//!     let h = cx.install(Counter::default());
//!     cx.with(h, |counter, _cx| counter.bump());
//! });
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use eyre::{ensure, eyre, Result};
use parking_lot::Mutex;
use tracing::trace;

/// Index of a worker core, in `0..num_cores`.
pub type CoreId = usize;

/// Completion callback carrying no payload, delivered on the caller's core.
pub type DoneCallback = Box<dyn FnOnce(&mut CoreContext) + Send>;

/// Sink for unrecoverable component failures. Installed by the store so a
/// failing slice or serializer can report upward from its own core; the
/// hook dispatches to the store's home core.
pub type FatalHook = Arc<dyn Fn(&mut CoreContext, eyre::Report) + Send + Sync>;

enum Task {
    Run(Box<dyn FnOnce(&mut CoreContext) + Send>),
    Stop,
}

/// The set of worker cores. Cheap to share; all methods take `&self`.
pub struct Cores {
    senders: Vec<Sender<Task>>,
    joiners: Mutex<Vec<JoinHandle<()>>>,
}

impl Cores {
    /// Spawns `n` worker threads, each draining its own task queue.
    pub fn start(n: usize) -> Result<Arc<Cores>> {
        ensure!(n >= 1, "need at least one core, got {}", n);

        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = unbounded::<Task>();
            senders.push(tx);
            receivers.push(rx);
        }

        let cores = Arc::new(Cores {
            senders,
            joiners: Mutex::new(Vec::with_capacity(n)),
        });

        for (id, rx) in receivers.into_iter().enumerate() {
            let shared = Arc::clone(&cores);
            let handle = std::thread::Builder::new()
                .name(format!("lode-core-{id}"))
                .spawn(move || run_core(id, rx, shared))?;
            cores.joiners.lock().push(handle);
        }

        Ok(cores)
    }

    pub fn num_cores(&self) -> usize {
        self.senders.len()
    }

    /// Runs `task` on `core`. Tasks from one sender run in dispatch order.
    pub fn dispatch<F>(&self, core: CoreId, task: F)
    where
        F: FnOnce(&mut CoreContext) + Send + 'static,
    {
        self.senders[core]
            .send(Task::Run(Box::new(task)))
            .expect("core task queue closed"); // INVARIANT: queues live until stop()
    }

    /// Runs `task` on `core` and blocks until it returns.
    ///
    /// Must be called from outside the core set; calling it from a worker
    /// would wait on the very queue the caller is blocking.
    pub fn run_blocking<R, F>(&self, core: CoreId, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut CoreContext) -> R + Send + 'static,
    {
        let (tx, rx) = bounded::<R>(1);
        self.dispatch(core, move |cx| {
            let out = task(cx);
            let _ = tx.send(out);
        });
        rx.recv()
            .map_err(|_| eyre!("core {} stopped before replying", core))
    }

    /// Stops every worker and joins it. Queued tasks ahead of the stop
    /// marker still run; later dispatches panic.
    pub fn stop(&self) {
        for sender in &self.senders {
            let _ = sender.send(Task::Stop);
        }
        let handles: Vec<_> = self.joiners.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn run_core(id: CoreId, rx: Receiver<Task>, cores: Arc<Cores>) {
    let mut cx = CoreContext {
        id,
        cores,
        slots: Vec::new(),
        free_slots: Vec::new(),
        deferred: VecDeque::new(),
    };
    trace!(core = id, "core worker running");
    loop {
        match rx.recv() {
            Ok(Task::Run(task)) => {
                task(&mut cx);
                // Continuations queued by the task (and by each other) run
                // before the next cross-core message.
                while let Some(next) = cx.deferred.pop_front() {
                    next(&mut cx);
                }
            }
            Ok(Task::Stop) | Err(_) => break,
        }
    }
    trace!(core = id, "core worker stopped");
}

type LocalTask = Box<dyn FnOnce(&mut CoreContext)>;

/// Core-local execution context handed to every task.
///
/// Holds the component slot table for this core and the deferred-task queue.
pub struct CoreContext {
    id: CoreId,
    cores: Arc<Cores>,
    slots: Vec<Option<Rc<dyn Any>>>,
    free_slots: Vec<u32>,
    deferred: VecDeque<LocalTask>,
}

impl CoreContext {
    /// This core's id.
    pub fn id(&self) -> CoreId {
        self.id
    }

    pub fn cores(&self) -> &Arc<Cores> {
        &self.cores
    }

    pub fn num_cores(&self) -> usize {
        self.cores.num_cores()
    }

    /// One-shot dispatch to another core (or back to this one; tasks queued
    /// to the own core interleave fairly with remote ones).
    pub fn dispatch<F>(&self, core: CoreId, task: F)
    where
        F: FnOnce(&mut CoreContext) + Send + 'static,
    {
        self.cores.dispatch(core, task);
    }

    /// Runs `task` on this core after the current handler (and previously
    /// deferred continuations) finish, ahead of queued cross-core messages.
    pub fn defer<F>(&mut self, task: F)
    where
        F: FnOnce(&mut CoreContext) + 'static,
    {
        self.deferred.push_back(Box::new(task));
    }

    /// Installs a component on this core and returns its handle.
    pub fn install<T: 'static>(&mut self, component: T) -> Handle<T> {
        let cell: Rc<dyn Any> = Rc::new(RefCell::new(component));
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(cell);
                slot
            }
            None => {
                self.slots.push(Some(cell));
                (self.slots.len() - 1) as u32
            }
        };
        Handle {
            core: self.id,
            slot,
            _marker: PhantomData,
        }
    }

    /// Resolves a handle installed on this core.
    pub fn get<T: 'static>(&self, handle: Handle<T>) -> Rc<RefCell<T>> {
        debug_assert_eq!(
            handle.core, self.id,
            "component resolved off its home core"
        );
        let cell = self.slots[handle.slot as usize]
            .as_ref()
            .expect("stale component handle") // INVARIANT: handles outlive removal only in bugs
            .clone();
        cell.downcast::<RefCell<T>>()
            .ok()
            .expect("component handle type mismatch")
    }

    /// Borrows the component behind `handle` and runs `body` with both the
    /// component and the context available. The component is borrowed via
    /// its own `Rc`, so `body` is free to dispatch, defer, and resolve other
    /// handles - just not this one.
    pub fn with<T: 'static, R>(
        &mut self,
        handle: Handle<T>,
        body: impl FnOnce(&mut T, &mut CoreContext) -> R,
    ) -> R {
        let cell = self.get(handle);
        let mut component = cell.borrow_mut();
        body(&mut component, self)
    }

    /// Uninstalls a component, returning its cell so the caller can finish
    /// tearing it down.
    pub fn remove<T: 'static>(&mut self, handle: Handle<T>) -> Rc<RefCell<T>> {
        debug_assert_eq!(
            handle.core, self.id,
            "component removed off its home core"
        );
        let cell = self.slots[handle.slot as usize]
            .take()
            .expect("stale component handle");
        self.free_slots.push(handle.slot);
        cell.downcast::<RefCell<T>>()
            .ok()
            .expect("component handle type mismatch")
    }
}

/// Cross-core address of a component: its home core plus a slot index.
///
/// Handles are plain data - `Copy`, `Send`, comparable - and say nothing
/// about the component's lifetime; resolving a removed handle panics.
pub struct Handle<T> {
    core: CoreId,
    slot: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// The component's home core.
    pub fn core(&self) -> CoreId {
        self.core
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.core == other.core && self.slot == other.slot
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle(core={}, slot={})", self.core, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_runs_on_target_core() {
        let cores = Cores::start(3).unwrap();
        for target in 0..3 {
            let seen = cores.run_blocking(target, move |cx| cx.id()).unwrap();
            assert_eq!(seen, target);
        }
        cores.stop();
    }

    #[test]
    fn install_resolve_roundtrip() {
        let cores = Cores::start(1).unwrap();
        let value = cores
            .run_blocking(0, |cx| {
                let h = cx.install(41u64);
                cx.with(h, |v, _| *v += 1);
                cx.with(h, |v, _| *v)
            })
            .unwrap();
        assert_eq!(value, 42);
        cores.stop();
    }

    #[test]
    fn deferred_tasks_run_in_order_after_handler() {
        let cores = Cores::start(1).unwrap();
        let order = cores
            .run_blocking(0, |cx| {
                let h = cx.install(Vec::<u32>::new());
                cx.with(h, |v, _| v.push(1));
                cx.defer(move |cx| cx.with(h, |v, _| v.push(3)));
                cx.with(h, |v, _| v.push(2));
                h
            })
            .unwrap();
        let seen = cores
            .run_blocking(0, move |cx| cx.with(order, |v, _| v.clone()))
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
        cores.stop();
    }

    #[test]
    fn cross_core_ping_pong() {
        let cores = Cores::start(2).unwrap();
        let (tx, rx) = bounded::<CoreId>(1);
        cores.dispatch(0, move |cx| {
            cx.dispatch(1, move |cx| {
                let origin = cx.id();
                cx.dispatch(0, move |cx| {
                    assert_eq!(cx.id(), 0);
                    let _ = tx.send(origin);
                });
            });
        });
        assert_eq!(rx.recv().unwrap(), 1);
        cores.stop();
    }

    #[test]
    fn removed_slot_is_reused() {
        let cores = Cores::start(1).unwrap();
        cores
            .run_blocking(0, |cx| {
                let a = cx.install(1u8);
                cx.remove(a);
                let b = cx.install(2u8);
                assert_eq!(a.core(), b.core());
                assert_eq!(cx.with(b, |v, _| *v), 2);
            })
            .unwrap();
        cores.stop();
    }

    #[test]
    fn handles_are_plain_data() {
        let cores = Cores::start(1).unwrap();
        let h = cores.run_blocking(0, |cx| cx.install(7i32)).unwrap();
        let copy = h;
        assert_eq!(h, copy);
        let read = cores
            .run_blocking(0, move |cx| cx.with(copy, |v, _| *v))
            .unwrap();
        assert_eq!(read, 7);
        cores.stop();
    }
}
