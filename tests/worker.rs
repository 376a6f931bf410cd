//! Process-level tests for a single worker.

use std::time::{Duration, Instant};

use forkpool::{
    ExecutionMode, PayloadResult, PoolError, StopStatus, Task, TaskFailure, TerminationCheck,
    TerminationReason, Worker, WorkerConfig, WorkerState, task_fn,
};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

const TIMEOUT: Duration = Duration::from_secs(10);

fn process_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_mode(ExecutionMode::Process)
        .with_child_poll_interval(Duration::from_millis(5))
}

/// Poll until `n` results arrived or the timeout expires.
fn collect<T: Task>(worker: &mut Worker<T>, n: usize) -> Vec<(usize, PayloadResult<T::Output>)> {
    let start = Instant::now();
    let mut results = Vec::new();
    while results.len() < n {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for results");
        match worker.check_for_finish().unwrap() {
            Some(result) => results.push(result),
            None => std::thread::sleep(Duration::from_millis(2)),
        }
    }
    results
}

fn process_is_gone(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None) == Err(Errno::ESRCH)
}

#[test]
fn test_results_in_send_order() {
    let mut worker = Worker::with_config(0, task_fn(|x: i64| Ok(x * 2)), process_config());
    worker.start().unwrap();
    assert!(worker.pid().is_some());

    for (i, x) in [1, 2, 3].iter().enumerate() {
        assert_eq!(worker.send_payload(x).unwrap(), i);
    }
    assert!(worker.is_running());
    assert_eq!(worker.remaining(), 3);

    let results = collect(&mut worker, 3);
    assert_eq!(results, vec![(0, Ok(2)), (1, Ok(4)), (2, Ok(6))]);
    assert!(worker.is_idle());
    assert_eq!(worker.remaining(), 0);
    assert_eq!(worker.current_payload(), 3);
}

#[test]
fn test_send_starts_worker_lazily() {
    let mut worker = Worker::with_config(0, task_fn(|s: String| Ok(s.len())), process_config());
    assert!(!worker.is_started());

    worker.send_payload(&"hello".to_string()).unwrap();
    assert!(worker.is_started());
    assert_eq!(collect(&mut worker, 1), vec![(0, Ok(5))]);
}

#[test]
fn test_task_error_does_not_stop_worker() {
    let task = task_fn(|x: i64| {
        if x == 0 {
            anyhow::bail!("zero rejected");
        }
        Ok(100 / x)
    });
    let mut worker = Worker::with_config(0, task, process_config());

    worker.send_payload(&0).unwrap();
    worker.send_payload(&4).unwrap();
    let results = collect(&mut worker, 2);
    assert_eq!(
        results,
        vec![(0, Err(TaskFailure::new("zero rejected"))), (1, Ok(25))]
    );
    assert_eq!(worker.state(), WorkerState::Idle);
}

#[test]
fn test_large_reply_is_reassembled() {
    let mut worker = Worker::with_config(0, task_fn(|n: usize| Ok("x".repeat(n))), process_config());
    worker.send_payload(&(2 * 1024 * 1024)).unwrap();

    let (seq, result) = collect(&mut worker, 1).remove(0);
    assert_eq!(seq, 0);
    assert_eq!(result.unwrap().len(), 2 * 1024 * 1024);
}

#[test]
fn test_large_payloads_do_not_block_sender() {
    let mut worker = Worker::with_config(0, task_fn(|s: String| Ok(s)), process_config());
    let payload = "x".repeat(1 << 20);

    // Neither send waits for the child to read
    let start = Instant::now();
    assert_eq!(worker.send_payload(&payload).unwrap(), 0);
    assert_eq!(worker.send_payload(&payload).unwrap(), 1);
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(worker.remaining(), 2);

    let results = collect(&mut worker, 2);
    assert_eq!(results.len(), 2);
    for (i, (seq, result)) in results.into_iter().enumerate() {
        assert_eq!(seq, i);
        assert_eq!(result.unwrap().len(), 1 << 20);
    }
    assert!(worker.is_idle());
    assert!(!worker.has_pending_output());
}

#[test]
fn test_stop_right_after_start_is_graceful() {
    for _ in 0..20 {
        let mut worker = Worker::with_config(0, task_fn(|x: i64| Ok(x)), process_config());
        worker.start().unwrap();
        assert_eq!(worker.stop(true), StopStatus::Stopped);
        assert_eq!(worker.termination_reason(), Some(TerminationReason::Exited(0)));
    }
}

#[test]
fn test_signal_failure_is_reported() {
    let mut worker = Worker::with_config(0, task_fn(|x: i64| Ok(x)), process_config());
    worker.start().unwrap();
    let pid = Pid::from_raw(worker.pid().unwrap());

    // The process disappears behind the worker's back
    kill(pid, Signal::SIGKILL).unwrap();
    waitpid(pid, None).unwrap();

    let status = worker.stop(false);
    assert_eq!(status, StopStatus::SignalFailed(Errno::ESRCH));
    assert_ne!(status, StopStatus::NotActive);
    assert!(worker.is_active());
}

#[test]
fn test_stop_waits_for_graceful_exit() {
    let mut worker = Worker::with_config(0, task_fn(|x: i64| Ok(x)), process_config());
    worker.start().unwrap();

    assert_eq!(worker.stop(true), StopStatus::Stopped);
    assert_eq!(worker.state(), WorkerState::Terminated);
    assert_eq!(worker.termination_reason(), Some(TerminationReason::Exited(0)));
    assert_eq!(worker.stop(true), StopStatus::NotActive);
    assert_eq!(worker.check_for_termination(), TerminationCheck::AlreadyTerminated);
    assert!(matches!(worker.send_payload(&1), Err(PoolError::NotActive(0))));
}

#[test]
fn test_stop_lets_current_payload_finish() {
    let task = task_fn(|x: i64| {
        std::thread::sleep(Duration::from_millis(200));
        Ok(x)
    });
    let mut worker = Worker::with_config(0, task, process_config());
    worker.send_payload(&1).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(worker.stop(false), StopStatus::Stopped);
    assert_eq!(worker.state(), WorkerState::Terminating);

    // A terminating worker still hands out results already in flight
    assert_eq!(collect(&mut worker, 1), vec![(0, Ok(1))]);
    assert_eq!(worker.state(), WorkerState::Terminating);

    let start = Instant::now();
    while worker.check_for_termination() == TerminationCheck::Pending {
        assert!(start.elapsed() < TIMEOUT, "worker did not exit");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(worker.termination_reason(), Some(TerminationReason::Exited(0)));
}

#[test]
fn test_kill_terminates_immediately() {
    let task = task_fn(|x: i64| {
        std::thread::sleep(Duration::from_secs(30));
        Ok(x)
    });
    let mut worker = Worker::with_config(0, task, process_config());
    worker.send_payload(&1).unwrap();

    assert_eq!(worker.kill(true), StopStatus::Stopped);
    assert_eq!(
        worker.termination_reason(),
        Some(TerminationReason::Signaled(Signal::SIGKILL))
    );
    assert_eq!(worker.check_for_finish().unwrap(), None);
}

#[test]
fn test_crash_is_detected() {
    let task = task_fn(|code: i32| -> anyhow::Result<i32> { unsafe { libc::_exit(code) } });
    let mut worker = Worker::with_config(0, task, process_config());
    worker.send_payload(&3).unwrap();

    let start = Instant::now();
    let reason = loop {
        match worker.check_for_termination() {
            TerminationCheck::Exited(reason) => break reason,
            TerminationCheck::Pending => {
                assert!(start.elapsed() < TIMEOUT, "crash not detected");
                std::thread::sleep(Duration::from_millis(5));
            }
            TerminationCheck::AlreadyTerminated => panic!("unexpected state"),
        }
    };
    assert_eq!(reason, TerminationReason::Exited(3));
    assert_eq!(worker.state(), WorkerState::Terminated);
}

#[test]
fn test_dropped_worker_leaves_no_process() {
    let mut worker = Worker::new(task_fn(|x: i64| Ok(x)));
    assert!(worker.is_self_managed());
    worker.start().unwrap();
    let pid = worker.pid().unwrap();
    assert!(!process_is_gone(pid));

    drop(worker);
    assert!(process_is_gone(pid));
}

#[test]
fn test_simulation_mode_has_no_process() {
    let config = WorkerConfig::default().with_mode(ExecutionMode::Simulation);
    let mut worker = Worker::with_config(0, task_fn(|x: i64| Ok(x + 1)), config);

    worker.send_payload(&1).unwrap();
    assert!(worker.pid().is_none());
    assert_eq!(worker.check_for_finish().unwrap(), Some((0, Ok(2))));
}
