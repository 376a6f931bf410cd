//! Process handle for worker subprocesses.
//!
//! Wraps a forked child with its framed channel and reap state.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::frame::Channel;
use super::signals::{TerminationReason, analyze_wait_status};

/// Sleep between reap attempts while waiting for an exit.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a worker subprocess with its IPC channel.
#[derive(Debug)]
pub struct Proc {
    /// Process ID
    pid: Pid,
    /// Parent end of the socket pair; released once the process is reaped
    channel: Option<Channel>,
    /// Exit reason once the process has been reaped
    exit: Option<TerminationReason>,
}

impl Proc {
    /// Create a new process handle. The channel is expected to be
    /// non-blocking.
    pub fn new(pid: Pid, channel: Channel) -> Self {
        Self {
            pid,
            channel: Some(channel),
            exit: None,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> Option<&mut Channel> {
        self.channel.as_mut()
    }

    /// Send a signal to the process.
    pub fn signal(&self, sig: Signal) -> nix::Result<()> {
        signal::kill(self.pid, sig)
    }

    /// Try to reap the process (non-blocking).
    ///
    /// Returns the exit reason if the process has exited, `None` if it is
    /// still running.
    pub fn try_wait(&mut self) -> Option<TerminationReason> {
        if let Some(reason) = self.exit {
            return Some(reason);
        }
        let reason = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return None,
            Ok(status) => analyze_wait_status(status)?,
            Err(Errno::EINTR) => return None,
            // Reaped by someone else
            Err(_) => TerminationReason::Unknown,
        };
        self.exit = Some(reason);
        self.channel = None;
        Some(reason)
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> TerminationReason {
        loop {
            if let Some(reason) = self.wait_timeout(Duration::from_secs(1)) {
                return reason;
            }
        }
    }

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Unread replies are discarded while waiting: a child stuck writing to a
    /// full socket only reaches its exit once the parent reads.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<TerminationReason> {
        let start = Instant::now();
        loop {
            if let Some(reason) = self.try_wait() {
                return Some(reason);
            }
            if let Some(channel) = self.channel.as_mut() {
                while let Ok(Some(_)) = channel.try_recv() {}
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(REAP_POLL_INTERVAL);
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.exit.is_none() {
            // Unowned process: force kill and reap so no zombie is left
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}
