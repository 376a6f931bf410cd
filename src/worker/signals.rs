//! Signal plumbing between parent and worker processes.
//!
//! Workers owned by a pool notify the parent out of band:
//!
//! - `SIGUSR1` - a worker finished a payload and has a result in its socket
//! - `SIGUSR2` - a worker left its run loop and is about to exit
//! - `SIGCHLD` - the kernel reports a child exit; not always delivered for
//!   every child, so it is treated like `SIGUSR2`
//!
//! Handlers only bump process-wide atomic counters. Pools compare counter
//! generations and scan their workers outside of signal context.
//!
//! Inside the worker, `SIGTERM` only records that termination was requested
//! so an in-flight task is never interrupted.

use std::ffi::c_int;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::WaitStatus;

use crate::error::{PoolError, Result};

static COMPLETIONS: AtomicU64 = AtomicU64::new(0);
static EXITS: AtomicU64 = AtomicU64::new(0);
static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Outcome of the one parent-side installation, shared by every pool.
static PARENT_HANDLERS: OnceLock<std::result::Result<(), String>> = OnceLock::new();

extern "C" fn on_completion(_: c_int) {
    COMPLETIONS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn on_exit(_: c_int) {
    EXITS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn on_terminate(_: c_int) {
    TERM_REQUESTED.store(true, Ordering::SeqCst);
}

/// Generation of the "a worker completed a payload" event.
pub fn completion_generation() -> u64 {
    COMPLETIONS.load(Ordering::SeqCst)
}

/// Generation of the "a worker exited" event.
pub fn exit_generation() -> u64 {
    EXITS.load(Ordering::SeqCst)
}

/// Install the parent-side handlers. Idempotent.
///
/// Only the first call installs anything; later calls report its outcome.
pub fn install_parent_handlers() -> Result<()> {
    install_once(&PARENT_HANDLERS, || {
        install(Signal::SIGUSR1, on_completion, SaFlags::SA_RESTART)?;
        install(Signal::SIGUSR2, on_exit, SaFlags::SA_RESTART)?;
        install(
            Signal::SIGCHLD,
            on_exit,
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        )
    })
}

fn install_once<F>(cell: &OnceLock<std::result::Result<(), String>>, install: F) -> Result<()>
where
    F: FnOnce() -> std::result::Result<(), String>,
{
    cell.get_or_init(install).clone().map_err(PoolError::Config)
}

fn install(
    sig: Signal,
    handler: extern "C" fn(c_int),
    flags: SaFlags,
) -> std::result::Result<(), String> {
    let action = SigAction::new(SigHandler::Handler(handler), flags, SigSet::empty());
    // Safety: the handlers only touch atomics, which is async-signal-safe.
    unsafe { signal::sigaction(sig, &action) }
        .map(|_| ())
        .map_err(|e| format!("failed to install {:?} handler: {}", sig, e))
}

/// SIGTERM held back on the calling thread. Dropping it restores the
/// previous mask.
///
/// Taken around `fork` so a stop request sent before the child installed its
/// handler stays pending instead of killing the child outright.
pub(crate) struct TermBlock {
    previous: SigSet,
}

impl Drop for TermBlock {
    fn drop(&mut self) {
        let _ = self.previous.thread_set_mask();
    }
}

fn term_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set
}

/// Block SIGTERM on the calling thread until the guard is dropped.
pub(crate) fn block_termination() -> Result<TermBlock> {
    let previous = term_set()
        .thread_swap_mask(SigmaskHow::SIG_BLOCK)
        .map_err(|e| PoolError::Config(format!("failed to block SIGTERM: {}", e)))?;
    Ok(TermBlock { previous })
}

/// Prepare signal dispositions inside a freshly forked worker.
///
/// SIGTERM is unblocked last; a stop requested before this point is
/// delivered to the handler right then.
pub(crate) fn init_child() {
    TERM_REQUESTED.store(false, Ordering::SeqCst);
    // Safety: installing handlers that only store to an atomic, and
    // resetting inherited dispositions; the child is single-threaded here.
    unsafe {
        let term = SigAction::new(
            SigHandler::Handler(on_terminate),
            SaFlags::empty(),
            SigSet::empty(),
        );
        signal::sigaction(Signal::SIGTERM, &term).ok();
        // Pipe errors are handled via io::Error
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn).ok();
        signal::signal(Signal::SIGCHLD, SigHandler::SigDfl).ok();
    }
    term_set().thread_unblock().ok();
}

/// Whether this worker process was asked to terminate.
pub(crate) fn termination_requested() -> bool {
    TERM_REQUESTED.load(Ordering::SeqCst)
}

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Unknown termination reason (already reaped elsewhere).
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` of a process that has exited.
///
/// Returns `None` while the process is still alive (or merely stopped).
pub fn analyze_wait_status(status: WaitStatus) -> Option<TerminationReason> {
    match status {
        WaitStatus::Exited(_, code) => Some(TerminationReason::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(TerminationReason::Signaled(signal)),
        _ => None,
    }
}
