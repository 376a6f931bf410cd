//! Background listener that turns worker events into pool scans.
//!
//! Signal handlers only bump counters (see [`crate::worker::signals`]). This
//! thread notices new generations every tick and runs the matching scan
//! under the pool lock. In polling mode it scans on every tick instead.
//!
//! Every tick also pushes out payload bytes that a dispatch left queued, so
//! a large payload reaches its worker without anyone waiting on the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{PoolState, lock_state};
use crate::config::{Notification, PoolConfig};
use crate::error::Result;
use crate::worker::Task;
use crate::worker::signals::{completion_generation, exit_generation};

#[derive(Debug, Clone, Copy)]
struct ListenerSettings {
    notification: Notification,
    tick: Duration,
    fallback_scan_interval: Duration,
}

/// Handle to a pool's listener thread. Stops the thread on drop.
pub(crate) struct Listener {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    pub(crate) fn spawn<T: Task>(state: Arc<Mutex<PoolState<T>>>, config: &PoolConfig) -> Result<Self> {
        let settings = ListenerSettings {
            notification: config.notification,
            tick: config.event_tick,
            fallback_scan_interval: config.fallback_scan_interval,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("forkpool-listener".to_string())
            .spawn(move || listener_loop(state, settings, shutdown_clone))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it to finish its current scan.
    pub(crate) fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn listener_loop<T: Task>(
    state: Arc<Mutex<PoolState<T>>>,
    settings: ListenerSettings,
    shutdown: Arc<AtomicBool>,
) {
    tracing::debug!(notification = %settings.notification, "Pool listener started");

    let polling = settings.notification == Notification::Polling;
    let mut seen_completions = completion_generation();
    let mut seen_exits = exit_generation();
    let mut last_completion_scan = Instant::now();
    // A reply is half read: keep scanning until it is complete
    let mut partial = false;

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(settings.tick);

        // Read generations before scanning so events raised during a scan
        // trigger another one
        let completions = completion_generation();
        let exits = exit_generation();

        let scan_completions = polling
            || partial
            || completions != seen_completions
            || last_completion_scan.elapsed() >= settings.fallback_scan_interval;
        let scan_exits = polling || exits != seen_exits;

        let mut guard = lock_state(&state);
        guard.flush_output();
        if scan_completions {
            partial = guard.scan_completions();
            seen_completions = completions;
            last_completion_scan = Instant::now();
        }
        if scan_exits {
            guard.scan_terminations();
            seen_exits = exits;
        }
    }

    tracing::debug!("Pool listener stopped");
}
