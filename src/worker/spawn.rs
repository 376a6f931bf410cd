//! Worker process creation.
//!
//! Workers are created with `fork()` so the child inherits the task value
//! (closures and all) without any serialization of the handler itself. The
//! parent continues in the calling code; the child runs the worker loop and
//! leaves through [`exit_child`] without unwinding back into the caller.

use nix::unistd::{ForkResult, Pid, fork};

use crate::error::{PoolError, Result};

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Forked {
    Parent(Pid),
    Child,
}

/// Whether the platform can create isolated worker processes.
///
/// The crate only builds on unix targets, so this is currently always
/// `true`; simulation mode has to be chosen explicitly.
pub fn supports_forking() -> bool {
    cfg!(unix)
}

/// Fork the current process.
pub(crate) fn fork_process() -> Result<Forked> {
    // Safety: the child branch only runs the worker loop (socket I/O, the
    // task itself) and then calls `_exit`, never returning into code that
    // may rely on locks held by other parent threads.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(Forked::Parent(child)),
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Err(e) => Err(PoolError::Spawn(e)),
    }
}

/// Terminate a worker process immediately.
///
/// Skips atexit handlers and stdio flushing so buffers inherited from the
/// parent are not written twice.
pub(crate) fn exit_child(code: i32) -> ! {
    // Safety: `_exit` ends the process without touching any Rust state.
    unsafe { libc::_exit(code) }
}
