//! A single worker: one child process running a [`Task`].
//!
//! The worker owns its process, the parent end of the socket pair and the
//! bookkeeping needed to pair replies with payloads. Replies come back in the
//! order payloads were sent, so the n-th reply always belongs to the n-th
//! payload.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::getpid;
use serde::Serialize;

use super::child::{self, ChildSettings};
use super::frame::Channel;
use super::proc::Proc;
use super::protocol::{self, PayloadResult, Reply, TaskFailure};
use super::signals::{self, TerminationReason};
use super::spawn::{Forked, exit_child, fork_process};
use super::task::Task;
use crate::config::{ExecutionMode, WorkerConfig};
use crate::error::{PoolError, Result};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// No payload in flight.
    Idle,
    /// At least one payload sent and not yet reported.
    Running,
    /// Asked to exit, process not yet reaped.
    Terminating,
    /// Process reaped. Terminal.
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Terminating => write!(f, "terminating"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Outcome of a non-blocking termination check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCheck {
    /// The process exited during this check.
    Exited(TerminationReason),
    /// Still alive (or never started).
    Pending,
    /// Was already marked terminated before this check.
    AlreadyTerminated,
}

/// Outcome of [`Worker::stop`] and [`Worker::kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// Nothing to stop: already terminated, or already terminating when
    /// asked to stop gracefully.
    NotActive,
    /// The signal could not be delivered.
    SignalFailed(Errno),
    /// Signal delivered (and, when waiting, the process reaped).
    Stopped,
}

/// One worker process and the parent-side state that drives it.
pub struct Worker<T: Task> {
    id: usize,
    task: T,
    config: WorkerConfig,
    state: WorkerState,
    proc: Option<Proc>,
    started: bool,
    sent: usize,
    remaining: usize,
    reported: usize,
    /// Results produced in simulation mode, oldest first.
    buffered: VecDeque<PayloadResult<T::Output>>,
    exit: Option<TerminationReason>,
}

impl<T: Task> Worker<T> {
    /// Create a self-managed worker with the default configuration.
    pub fn new(task: T) -> Self {
        Self::with_config(0, task, WorkerConfig::default())
    }

    /// Create a worker with an explicit id and configuration.
    ///
    /// The process is not spawned until [`start`](Self::start) or the first
    /// [`send_payload`](Self::send_payload).
    pub fn with_config(id: usize, task: T, config: WorkerConfig) -> Self {
        Self {
            id,
            task,
            config,
            state: WorkerState::Idle,
            proc: None,
            started: false,
            sent: 0,
            remaining: 0,
            reported: 0,
            buffered: VecDeque::new(),
            exit: None,
        }
    }

    /// Spawn the worker process. Later calls are no-ops.
    pub fn start(&mut self) -> Result<()> {
        if self.started || !self.is_active() {
            return Ok(());
        }
        if self.config.mode == ExecutionMode::Simulation {
            self.started = true;
            return Ok(());
        }

        let (parent_end, child_end) = Channel::pair()?;
        let settings = ChildSettings {
            parent: getpid(),
            notify_parent: self.config.notify_parent,
            poll_interval: self.config.child_poll_interval,
        };

        // The child unblocks SIGTERM once its handler is in place
        let term_block = signals::block_termination()?;
        match fork_process()? {
            Forked::Child => {
                drop(parent_end);
                let code = child::run(&mut self.task, child_end, settings);
                exit_child(code)
            }
            Forked::Parent(pid) => {
                drop(term_block);
                drop(child_end);
                let proc = Proc::new(pid, parent_end);
                // The handle is kept even on failure so Drop reaps the child
                let nonblocking = proc
                    .channel()
                    .map(|c| c.set_nonblocking(true))
                    .unwrap_or(Ok(()));
                self.proc = Some(proc);
                self.started = true;
                nonblocking?;
                tracing::debug!(worker_id = self.id, pid = pid.as_raw(), "Worker started");
                Ok(())
            }
        }
    }

    /// Send one payload. Returns its zero-based sequence number.
    ///
    /// Never waits for the child to read: whatever the socket does not take
    /// right away is queued and flushed by [`flush_output`](Self::flush_output)
    /// and [`check_for_finish`](Self::check_for_finish).
    ///
    /// Starts the process on first use. In simulation mode the task runs
    /// right here and the result is buffered for [`check_for_finish`].
    ///
    /// [`check_for_finish`]: Self::check_for_finish
    pub fn send_payload(&mut self, payload: &T::Payload) -> Result<usize> {
        if !self.is_active() {
            return Err(PoolError::NotActive(self.id));
        }
        let body = protocol::encode_payload(payload)?;

        if self.config.mode == ExecutionMode::Simulation {
            self.started = true;
            let result = child::handle_request(&mut self.task, &body).into_result();
            self.buffered.push_back(result);
            let seq = self.record_sent();
            self.state = WorkerState::Idle;
            return Ok(seq);
        }

        self.start()?;
        let channel = self
            .proc
            .as_mut()
            .and_then(Proc::channel_mut)
            .ok_or(PoolError::NotActive(self.id))?;
        channel.send(&body)?;

        let seq = self.record_sent();
        self.state = WorkerState::Running;
        tracing::trace!(worker_id = self.id, seq, "Payload sent");
        Ok(seq)
    }

    fn record_sent(&mut self) -> usize {
        let seq = self.sent;
        self.sent += 1;
        self.remaining += 1;
        seq
    }

    /// Push queued payload bytes to the child. Returns `true` once nothing is
    /// left to write. Never blocks.
    pub fn flush_output(&mut self) -> Result<bool> {
        match self.proc.as_mut().and_then(Proc::channel_mut) {
            Some(channel) => Ok(channel.flush()?),
            None => Ok(true),
        }
    }

    /// Whether payload bytes are still waiting to be written.
    pub fn has_pending_output(&self) -> bool {
        self.proc
            .as_ref()
            .and_then(Proc::channel)
            .is_some_and(Channel::has_pending_output)
    }

    /// Whether part of a reply has arrived and the rest is still due.
    pub fn has_partial_reply(&self) -> bool {
        self.proc
            .as_ref()
            .and_then(Proc::channel)
            .is_some_and(|c| c.pending_input() > 0)
    }

    /// Collect the next result if one is complete. Never blocks.
    ///
    /// Returns the sequence number of the payload the result belongs to.
    /// A terminating worker still hands out results already in flight; a
    /// terminated one returns `None`.
    pub fn check_for_finish(&mut self) -> Result<Option<(usize, PayloadResult<T::Output>)>> {
        if self.state == WorkerState::Terminated {
            return Ok(None);
        }

        let result = if self.config.mode == ExecutionMode::Simulation {
            match self.buffered.pop_front() {
                Some(result) => result,
                None => return Ok(None),
            }
        } else {
            let Some(channel) = self.proc.as_mut().and_then(Proc::channel_mut) else {
                return Ok(None);
            };
            match channel.try_recv()? {
                Some(body) => Reply::<T::Output>::from_bytes(&body)
                    .map(Reply::into_result)
                    .unwrap_or_else(|e| Err(TaskFailure::new(format!("Undecodable reply: {}", e)))),
                None => return Ok(None),
            }
        };

        self.remaining = self.remaining.saturating_sub(1);
        if self.state == WorkerState::Running && self.remaining == 0 {
            self.state = WorkerState::Idle;
        }
        let seq = self.reported;
        self.reported += 1;
        Ok(Some((seq, result)))
    }

    /// Reap the process if it has exited. Never blocks.
    pub fn check_for_termination(&mut self) -> TerminationCheck {
        if self.state == WorkerState::Terminated {
            return TerminationCheck::AlreadyTerminated;
        }
        match self.proc.as_mut().and_then(Proc::try_wait) {
            Some(reason) => {
                self.mark_terminated(reason);
                TerminationCheck::Exited(reason)
            }
            None => TerminationCheck::Pending,
        }
    }

    /// Ask the worker to exit after its current payload (SIGTERM).
    ///
    /// With `wait` this blocks until the process is reaped.
    pub fn stop(&mut self, wait: bool) -> StopStatus {
        self.terminate(Signal::SIGTERM, wait)
    }

    /// Force the worker to exit immediately (SIGKILL).
    ///
    /// Also escalates a worker that is already terminating.
    pub fn kill(&mut self, wait: bool) -> StopStatus {
        self.terminate(Signal::SIGKILL, wait)
    }

    fn terminate(&mut self, sig: Signal, wait: bool) -> StopStatus {
        let escalating = sig == Signal::SIGKILL && self.state == WorkerState::Terminating;
        if !self.is_active() && !escalating {
            return StopStatus::NotActive;
        }

        let Some(proc) = self.proc.as_mut() else {
            // Never spawned, or simulation: nothing to signal
            self.mark_terminated(TerminationReason::Exited(0));
            return StopStatus::Stopped;
        };

        if let Err(errno) = proc.signal(sig) {
            tracing::warn!(worker_id = self.id, signal = ?sig, error = %errno, "Failed to signal worker");
            return StopStatus::SignalFailed(errno);
        }
        self.state = WorkerState::Terminating;
        tracing::debug!(worker_id = self.id, pid = proc.pid().as_raw(), signal = ?sig, "Worker stopping");

        let reason = if wait {
            Some(proc.wait())
        } else {
            proc.try_wait()
        };
        if let Some(reason) = reason {
            self.mark_terminated(reason);
        }
        StopStatus::Stopped
    }

    /// Wait up to `timeout` for a worker that was asked to stop. Returns
    /// whether it has terminated.
    pub fn await_exit(&mut self, timeout: Duration) -> bool {
        if self.state == WorkerState::Terminated {
            return true;
        }
        let Some(reason) = self.proc.as_mut().and_then(|p| p.wait_timeout(timeout)) else {
            return false;
        };
        self.mark_terminated(reason);
        true
    }

    fn mark_terminated(&mut self, reason: TerminationReason) {
        self.state = WorkerState::Terminated;
        self.exit = Some(reason);
        self.buffered.clear();
    }

    /// Leave teardown to the owner (a pool). Dropping the worker no longer
    /// stops it gracefully.
    pub fn disable_self_management(&mut self) {
        self.config.self_managed = false;
    }

    pub fn is_self_managed(&self) -> bool {
        self.config.self_managed
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Process id, once started in process mode.
    pub fn pid(&self) -> Option<i32> {
        self.proc.as_ref().map(|p| p.pid().as_raw())
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// Idle or running.
    pub fn is_active(&self) -> bool {
        matches!(self.state, WorkerState::Idle | WorkerState::Running)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    /// Payloads sent so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Payloads sent but not yet reported.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Results reported so far.
    pub fn reported(&self) -> usize {
        self.reported
    }

    /// Sequence number of the next result to be reported.
    pub fn current_payload(&self) -> usize {
        self.reported
    }

    /// Exit reason, once the process has been reaped.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.exit
    }
}

impl<T: Task> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("state", &self.state)
            .field("mode", &self.config.mode)
            .field("sent", &self.sent)
            .field("reported", &self.reported)
            .finish()
    }
}

impl<T: Task> Drop for Worker<T> {
    fn drop(&mut self) {
        if self.config.self_managed && self.is_active() && self.proc.is_some() {
            self.stop(true);
        }
    }
}
