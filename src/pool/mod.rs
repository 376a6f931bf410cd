//! A dynamically sized pool of uniform workers.
//!
//! The pool dispatches payloads to idle workers, optionally queues them on
//! the least loaded busy worker (overflow), and reports results through a
//! completion callback.
//!
//! # Architecture
//!
//! ```text
//!   send_data ──► resize ──► pick worker ──► Worker::send_payload
//!                                                   │
//!                        ┌──────────────────────────┘
//!                        ▼
//!   worker process ── SIGUSR1 ──► listener thread ──► completion scan
//!                  ── SIGUSR2 ──►                 ──► termination scan
//! ```
//!
//! All pool state sits behind one mutex. Dispatch, resize passes and scans
//! each run entirely under it; blocking waits sleep with it released.

mod events;
pub mod template;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::unistd::{Pid, getpid};
use serde::Serialize;

use crate::config::{ExecutionMode, Notification, PoolConfig};
use crate::error::{PoolError, Result};
use crate::worker::signals;
use crate::worker::{PayloadResult, StopStatus, Task, TerminationCheck, Worker, WorkerState};
use events::Listener;
pub use template::{KindRegistry, WorkerTemplate};

/// Tick of [`WorkersPool::wait_to_finish`].
pub const WAIT_UNIT: Duration = Duration::from_millis(100);

/// Called once per result with the worker that produced it and the
/// payload's sequence number on that worker.
///
/// Runs under the pool lock, so it must not call back into the pool.
pub type CompletionCallback<T> =
    Box<dyn FnMut(&Worker<T>, usize, PayloadResult<<T as Task>::Output>) + Send>;

/// Where a payload went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dispatched {
    pub worker_id: usize,
    /// `None` in simulation mode.
    pub pid: Option<i32>,
    /// Sequence number of the payload on that worker.
    pub seq: usize,
}

/// Periodic callback for [`WorkersPool::wait_to_finish`].
pub struct Tracker<'a, T: Task> {
    pub every: Duration,
    pub callback: Box<dyn FnMut(&WorkersPool<T>) + 'a>,
}

impl<'a, T: Task> Tracker<'a, T> {
    pub fn new<F>(every: Duration, callback: F) -> Self
    where
        F: FnMut(&WorkersPool<T>) + 'a,
    {
        Self {
            every,
            callback: Box::new(callback),
        }
    }

    /// Number of wait ticks between calls, at least one.
    fn period_ticks(&self) -> u128 {
        (self.every.as_millis() / WAIT_UNIT.as_millis()).max(1)
    }
}

struct Slot<T: Task> {
    worker: Worker<T>,
    /// Payloads queued on this worker since it was last picked while idle.
    overhead: usize,
    /// Stopped by a shrink; removed once reaped.
    retiring: bool,
}

pub(crate) struct PoolState<T: Task> {
    template: WorkerTemplate<T>,
    config: PoolConfig,
    slots: Vec<Slot<T>>,
    current_size: usize,
    target_size: usize,
    overflow: bool,
    next_id: usize,
    callback: Option<CompletionCallback<T>>,
}

impl<T: Task> PoolState<T> {
    fn new(template: WorkerTemplate<T>, config: PoolConfig) -> Self {
        Self {
            template,
            target_size: config.size,
            overflow: config.overflow,
            config,
            slots: Vec::new(),
            current_size: 0,
            next_id: 0,
            callback: None,
        }
    }

    /// One resize pass. Returns `true` once the current size matches the
    /// target.
    fn resize_pass(&mut self) -> Result<bool> {
        self.prune_crashed();

        if self.target_size > self.current_size {
            self.grow()?;
        } else if self.target_size < self.current_size {
            self.shrink_pass();
        }
        Ok(self.current_size == self.target_size)
    }

    /// Drop workers that exited without being retired by a shrink.
    fn prune_crashed(&mut self) {
        self.scan_terminations();
        let before = self.slots.len();
        self.slots
            .retain(|slot| slot.retiring || slot.worker.state() != WorkerState::Terminated);
        let pruned = before - self.slots.len();
        if pruned > 0 {
            tracing::warn!(pruned, "Removed crashed workers from the pool");
            self.current_size = self.slots.len();
        }
    }

    fn grow(&mut self) -> Result<()> {
        let wanted = self.target_size - self.current_size;
        let worker_config = self.config.worker_config();

        for _ in 0..wanted {
            let id = self.next_id;
            self.next_id += 1;

            let mut worker = Worker::with_config(id, self.template.instantiate(), worker_config.clone());
            worker.disable_self_management();
            let started = worker.start();
            if started.is_ok() {
                self.slots.push(Slot {
                    worker,
                    overhead: 0,
                    retiring: false,
                });
            }
            self.current_size = self.slots.len();
            started?;
        }

        tracing::info!(
            kind = self.template.label(),
            workers = self.current_size,
            "Pool grown"
        );
        Ok(())
    }

    /// Retire idle workers until enough are on their way out, then remove
    /// the ones that have exited. Busy workers are never stopped.
    fn shrink_pass(&mut self) {
        let quota = self.current_size - self.target_size;
        let mut in_flight = self.slots.iter().filter(|s| s.retiring).count();

        // Stop only up to the quota: with more idle workers than that,
        // stopping all of them would leave the pool below its target.
        for slot in &mut self.slots {
            if in_flight >= quota {
                break;
            }
            if slot.retiring || !slot.worker.is_idle() {
                continue;
            }
            if let StopStatus::SignalFailed(errno) = slot.worker.stop(false) {
                tracing::debug!(worker_id = slot.worker.id(), error = %errno, "Retiring worker that could not be signalled");
            }
            slot.retiring = true;
            in_flight += 1;
        }

        for slot in self.slots.iter_mut().filter(|s| s.retiring) {
            slot.worker.check_for_termination();
        }
        let before = self.slots.len();
        self.slots
            .retain(|slot| !(slot.retiring && slot.worker.state() == WorkerState::Terminated));
        let removed = before - self.slots.len();
        if removed > 0 {
            self.current_size = self.slots.len();
            tracing::info!(
                removed,
                workers = self.current_size,
                target = self.target_size,
                "Pool shrunk"
            );
        }
    }

    fn try_dispatch(&mut self, payload: &T::Payload) -> Result<Option<Dispatched>> {
        let picked = match self.slots.iter().position(|s| s.worker.is_idle()) {
            Some(index) => {
                self.slots[index].overhead = 0;
                index
            }
            None if self.overflow => {
                let least_loaded = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.worker.is_active() && !s.retiring)
                    .min_by_key(|(_, s)| s.overhead)
                    .map(|(index, _)| index);
                let Some(index) = least_loaded else {
                    return Ok(None);
                };
                self.slots[index].overhead += 1;
                index
            }
            None => return Ok(None),
        };

        let worker = &mut self.slots[picked].worker;
        let seq = worker.send_payload(payload)?;
        let dispatched = Dispatched {
            worker_id: worker.id(),
            pid: worker.pid(),
            seq,
        };
        tracing::debug!(
            worker_id = dispatched.worker_id,
            seq,
            overhead = self.slots[picked].overhead,
            "Payload dispatched"
        );
        Ok(Some(dispatched))
    }

    /// Push queued payload bytes to their workers.
    pub(crate) fn flush_output(&mut self) {
        for slot in self.slots.iter_mut().filter(|s| s.worker.has_pending_output()) {
            if let Err(e) = slot.worker.flush_output() {
                tracing::warn!(worker_id = slot.worker.id(), error = %e, "Worker channel failed, killing worker");
                slot.worker.kill(false);
            }
        }
    }

    /// Drain every available result of every active worker.
    ///
    /// Returns `true` if some reply is still only partly received.
    pub(crate) fn scan_completions(&mut self) -> bool {
        let Self {
            slots, callback, ..
        } = self;

        for slot in slots.iter_mut().filter(|s| s.worker.is_active()) {
            loop {
                match slot.worker.check_for_finish() {
                    Ok(Some((seq, result))) => {
                        if let Some(callback) = callback.as_mut() {
                            callback(&slot.worker, seq, result);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(worker_id = slot.worker.id(), error = %e, "Worker channel failed, killing worker");
                        slot.worker.kill(false);
                        break;
                    }
                }
            }
        }
        slots
            .iter()
            .any(|s| s.worker.is_active() && s.worker.has_partial_reply())
    }

    /// Reap every worker that has exited.
    pub(crate) fn scan_terminations(&mut self) {
        for slot in &mut self.slots {
            if let TerminationCheck::Exited(reason) = slot.worker.check_for_termination() {
                if slot.retiring {
                    tracing::debug!(worker_id = slot.worker.id(), %reason, "Retired worker exited");
                } else {
                    tracing::warn!(
                        worker_id = slot.worker.id(),
                        pid = slot.worker.pid(),
                        %reason,
                        "Worker exited unexpectedly"
                    );
                }
            }
        }
    }

    fn count(&self, pred: impl Fn(&Worker<T>) -> bool) -> usize {
        self.slots.iter().filter(|s| pred(&s.worker)).count()
    }

    /// Graceful stop, then force after `grace`.
    fn teardown(&mut self, grace: Duration) {
        for slot in &mut self.slots {
            slot.worker.stop(false);
        }

        let deadline = Instant::now() + grace;
        for slot in &mut self.slots {
            let left = deadline.saturating_duration_since(Instant::now());
            if !slot.worker.await_exit(left) {
                tracing::warn!(worker_id = slot.worker.id(), "Worker ignored stop request, killing");
                slot.worker.kill(true);
            }
        }
    }
}

/// A pool of workers running one kind of task.
///
/// Only the process that created the pool tears it down; a copy inherited
/// through `fork` leaves the workers alone.
pub struct WorkersPool<T: Task> {
    state: Arc<Mutex<PoolState<T>>>,
    listener: Option<Listener>,
    config: PoolConfig,
    owner: Pid,
}

impl<T: Task> WorkersPool<T> {
    /// Start configuring a pool.
    pub fn builder(config: PoolConfig) -> PoolBuilder<T> {
        PoolBuilder {
            config,
            templates: Vec::new(),
            error: None,
        }
    }

    /// Pool whose workers are built by `make`.
    pub fn from_factory<F>(config: PoolConfig, make: F) -> Result<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::new(WorkerTemplate::from_fn("factory", make), config)
    }

    /// Pool whose workers are clones of `prototype`.
    pub fn from_prototype(config: PoolConfig, prototype: T) -> Result<Self>
    where
        T: Clone + Sync,
    {
        Self::new(WorkerTemplate::prototype(prototype), config)
    }

    /// Pool of the named kind.
    pub fn from_kind(config: PoolConfig, registry: &KindRegistry<T>, kind: &str) -> Result<Self> {
        Self::new(registry.get(kind)?, config)
    }

    /// Pool from an explicit template. Workers are created lazily.
    pub fn new(template: WorkerTemplate<T>, config: PoolConfig) -> Result<Self> {
        let process_mode = config.mode == ExecutionMode::Process;
        if process_mode && config.notification == Notification::Signals {
            signals::install_parent_handlers()?;
        }

        tracing::debug!(
            kind = template.label(),
            size = config.size,
            mode = %config.mode,
            notification = %config.notification,
            "Creating worker pool"
        );

        let state = Arc::new(Mutex::new(PoolState::new(template, config.clone())));
        let listener = if process_mode {
            Some(Listener::spawn(Arc::clone(&state), &config)?)
        } else {
            None
        };

        Ok(Self {
            state,
            listener,
            config,
            owner: getpid(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        lock_state(&self.state)
    }

    /// Set the target size. Workers are added or removed by the next
    /// [`resize`](Self::resize) or dispatch.
    pub fn set_size(&self, size: usize) {
        self.lock().target_size = size;
    }

    /// Bring the pool to its target size.
    ///
    /// Growth is immediate. Shrinking only stops idle workers; with `wait`
    /// this blocks until enough have exited, otherwise it makes one pass.
    pub fn resize(&self, wait: bool) -> Result<()> {
        loop {
            let done = self.lock().resize_pass()?;
            if done || !wait {
                return Ok(());
            }
            std::thread::sleep(self.config.shrink_check_interval);
        }
    }

    /// Dispatch one payload.
    ///
    /// Goes to the first idle worker. When every worker is busy the payload
    /// is queued on the least loaded one if overflow is enabled; otherwise
    /// this returns `None`, or with `wait` blocks until a worker frees up.
    pub fn send_data(&self, payload: &T::Payload, wait: bool) -> Result<Option<Dispatched>> {
        if self.lock().target_size == 0 {
            return Err(PoolError::EmptyPool);
        }
        self.resize(wait)?;

        loop {
            let mut state = self.lock();
            if state.target_size == 0 {
                return Err(PoolError::EmptyPool);
            }
            state.resize_pass()?;

            if let Some(dispatched) = state.try_dispatch(payload)? {
                if self.config.mode == ExecutionMode::Simulation {
                    state.scan_completions();
                }
                return Ok(Some(dispatched));
            }
            if !wait {
                return Ok(None);
            }
            drop(state);
            std::thread::sleep(self.config.wait_period);
        }
    }

    /// Install the completion callback, replacing any previous one.
    pub fn register_completion_callback<F>(&self, callback: F)
    where
        F: FnMut(&Worker<T>, usize, PayloadResult<T::Output>) + Send + 'static,
    {
        self.lock().callback = Some(Box::new(callback));
    }

    pub fn enable_overflow(&self) {
        self.lock().overflow = true;
    }

    pub fn disable_overflow(&self) {
        self.lock().overflow = false;
    }

    pub fn is_overflow_enabled(&self) -> bool {
        self.lock().overflow
    }

    /// Block while any worker is running.
    ///
    /// Each tracker fires every `every` (rounded to [`WAIT_UNIT`]).
    pub fn wait_to_finish(&self, trackers: &mut [Tracker<'_, T>]) {
        let mut tick: u128 = 0;
        while self.count_running() > 0 {
            std::thread::sleep(WAIT_UNIT);
            tick += 1;
            for tracker in trackers.iter_mut() {
                if tick % tracker.period_ticks() == 0 {
                    (tracker.callback)(self);
                }
            }
        }
    }

    /// Run a completion scan now instead of waiting for the listener.
    pub fn collect_completions(&self) {
        self.lock().scan_completions();
    }

    pub fn count_running(&self) -> usize {
        self.lock().count(Worker::is_running)
    }

    pub fn count_idle(&self) -> usize {
        self.lock().count(Worker::is_idle)
    }

    pub fn count_active(&self) -> usize {
        self.lock().count(Worker::is_active)
    }

    /// States of all workers, in pool order.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.lock().slots.iter().map(|s| s.worker.state()).collect()
    }

    /// Ids of all workers, in pool order.
    pub fn worker_ids(&self) -> Vec<usize> {
        self.lock().slots.iter().map(|s| s.worker.id()).collect()
    }

    /// Overflow counters of all workers, in pool order.
    pub fn overhead_counters(&self) -> Vec<usize> {
        self.lock().slots.iter().map(|s| s.overhead).collect()
    }

    pub fn running_pids(&self) -> Vec<i32> {
        self.lock()
            .slots
            .iter()
            .filter(|s| s.worker.is_running())
            .filter_map(|s| s.worker.pid())
            .collect()
    }

    /// Process ids of all workers, in pool order.
    pub fn pids(&self) -> Vec<i32> {
        self.lock()
            .slots
            .iter()
            .filter_map(|s| s.worker.pid())
            .collect()
    }

    pub fn current_size(&self) -> usize {
        self.lock().current_size
    }

    pub fn target_size(&self) -> usize {
        self.lock().target_size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl<T: Task> Drop for WorkersPool<T> {
    fn drop(&mut self) {
        if getpid() != self.owner {
            // Inherited copy: the listener thread does not exist here and the
            // workers belong to the owner
            std::mem::forget(self.listener.take());
            std::mem::forget(Arc::clone(&self.state));
            return;
        }

        if let Some(mut listener) = self.listener.take() {
            listener.shutdown();
        }
        self.lock().teardown(self.config.shutdown_grace);
    }
}

pub(crate) fn lock_state<T: Task>(state: &Mutex<PoolState<T>>) -> MutexGuard<'_, PoolState<T>> {
    // A panicking completion callback must not wedge the pool
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for pools configured from one of several template sources.
///
/// Exactly one of [`kind`](Self::kind), [`prototype`](Self::prototype) or
/// [`factory`](Self::factory) must be given.
pub struct PoolBuilder<T: Task> {
    config: PoolConfig,
    templates: Vec<WorkerTemplate<T>>,
    error: Option<PoolError>,
}

impl<T: Task> PoolBuilder<T> {
    pub fn kind(mut self, registry: &KindRegistry<T>, name: &str) -> Self {
        match registry.get(name) {
            Ok(template) => self.templates.push(template),
            Err(e) => self.error = self.error.or(Some(e)),
        }
        self
    }

    pub fn prototype(mut self, prototype: T) -> Self
    where
        T: Clone + Sync,
    {
        self.templates.push(WorkerTemplate::prototype(prototype));
        self
    }

    pub fn factory<F>(mut self, make: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.templates.push(WorkerTemplate::from_fn("factory", make));
        self
    }

    pub fn build(mut self) -> Result<WorkersPool<T>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if self.templates.len() > 1 {
            return Err(PoolError::ConflictingTemplate);
        }
        let template = self.templates.pop().ok_or(PoolError::MissingTemplate)?;
        WorkersPool::new(template, self.config)
    }
}
