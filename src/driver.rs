//! Convenience drivers for running a batch of payloads.
//!
//! - [`run_in_background`] pushes everything through one worker.
//! - [`run_in_pool`] spreads the batch over a pool sized to the machine.
//!
//! Both return `true` when every payload succeeded (or the `on_finish`
//! callback accepted every result).

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use crate::config::{PoolConfig, default_worker_count};
use crate::error::Result;
use crate::pool::{WorkerTemplate, WorkersPool};
use crate::worker::{PayloadResult, Task, TerminationCheck, Worker};

/// Called with `(index, payload)` while a background worker has nothing to
/// report yet. `index` is the next payload waiting for its result.
pub type ProgressFn<'a, P> = &'a mut dyn FnMut(usize, &P);

/// Called with `(index, payload, result)` for every result. The return value
/// is that payload's outcome.
pub type FinishFn<'a, P, O> = &'a mut dyn FnMut(usize, &P, PayloadResult<O>) -> bool;

fn outcome_of<P, O>(
    on_finish: &mut Option<FinishFn<'_, P, O>>,
    index: usize,
    payload: &P,
    result: PayloadResult<O>,
) -> bool {
    match on_finish {
        Some(callback) => callback(index, payload, result),
        None => result.is_ok(),
    }
}

/// Run every payload through a single worker and wait for all results.
///
/// Payloads are sent up front (draining results between sends so neither
/// side stalls on a full socket), then the worker is polled every `poll`
/// until everything is reported. The worker is stopped afterwards.
pub fn run_in_background<T: Task>(
    mut worker: Worker<T>,
    payloads: &[T::Payload],
    mut on_progress: Option<ProgressFn<'_, T::Payload>>,
    mut on_finish: Option<FinishFn<'_, T::Payload, T::Output>>,
    poll: Duration,
) -> Result<bool> {
    worker.start()?;

    let mut outcome = true;
    let mut reported = 0;
    let mut drain = |worker: &mut Worker<T>, reported: &mut usize, outcome: &mut bool| -> Result<bool> {
        let mut any = false;
        while let Some((seq, result)) = worker.check_for_finish()? {
            *outcome &= outcome_of(&mut on_finish, seq, &payloads[seq], result);
            *reported += 1;
            any = true;
        }
        Ok(any)
    };

    for payload in payloads {
        worker.send_payload(payload)?;
        drain(&mut worker, &mut reported, &mut outcome)?;
    }

    while reported < payloads.len() {
        if drain(&mut worker, &mut reported, &mut outcome)? {
            continue;
        }
        if let TerminationCheck::Exited(reason) = worker.check_for_termination() {
            tracing::warn!(
                worker_id = worker.id(),
                %reason,
                lost = payloads.len() - reported,
                "Worker exited before reporting every result"
            );
            outcome = false;
            break;
        }
        if let Some(progress) = on_progress.as_mut() {
            progress(reported, &payloads[reported]);
        }
        std::thread::sleep(poll);
    }

    worker.stop(true);
    Ok(outcome)
}

/// Run every payload through a pool of `size` workers (default: one per
/// logical core).
pub fn run_in_pool<T: Task>(
    template: WorkerTemplate<T>,
    payloads: &[T::Payload],
    size: Option<usize>,
    on_finish: Option<FinishFn<'_, T::Payload, T::Output>>,
) -> Result<bool> {
    let config = PoolConfig::default().with_size(size.unwrap_or_else(default_worker_count));
    run_in_pool_with(config, template, payloads, on_finish)
}

/// [`run_in_pool`] with an explicit pool configuration.
pub fn run_in_pool_with<T: Task>(
    config: PoolConfig,
    template: WorkerTemplate<T>,
    payloads: &[T::Payload],
    mut on_finish: Option<FinishFn<'_, T::Payload, T::Output>>,
) -> Result<bool> {
    let pool = WorkersPool::new(template, config)?;

    let (tx, rx) = mpsc::channel();
    pool.register_completion_callback(move |worker, seq, result| {
        let _ = tx.send(((worker.id(), seq), result));
    });

    // (worker id, sequence on that worker) -> payload index
    let mut origin: HashMap<(usize, usize), usize> = HashMap::with_capacity(payloads.len());
    let mut outcome = true;
    let mut handled = 0;
    let mut deliver = |origin: &HashMap<(usize, usize), usize>, outcome: &mut bool| {
        for (key, result) in rx.try_iter() {
            let Some(&index) = origin.get(&key) else {
                tracing::warn!(worker_id = key.0, seq = key.1, "Result for unknown payload");
                continue;
            };
            *outcome &= outcome_of(&mut on_finish, index, &payloads[index], result);
            handled += 1;
        }
    };

    for (index, payload) in payloads.iter().enumerate() {
        if let Some(dispatched) = pool.send_data(payload, true)? {
            origin.insert((dispatched.worker_id, dispatched.seq), index);
        }
        deliver(&origin, &mut outcome);
    }

    pool.wait_to_finish(&mut []);
    pool.collect_completions();
    deliver(&origin, &mut outcome);
    drop(deliver);

    if handled < payloads.len() {
        tracing::warn!(
            lost = payloads.len() - handled,
            "Some payloads were never reported"
        );
        outcome = false;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, WorkerConfig};
    use crate::worker::task_fn;

    #[test]
    fn test_run_in_background_simulation() {
        let config = WorkerConfig::default().with_mode(ExecutionMode::Simulation);
        let worker = Worker::with_config(0, task_fn(|x: i64| Ok(x * 2)), config);

        let mut seen = Vec::new();
        let mut on_finish = |index: usize, payload: &i64, result: PayloadResult<i64>| {
            seen.push((index, *payload, result.clone().unwrap()));
            result.is_ok()
        };
        let ok = run_in_background(
            worker,
            &[1, 2, 3],
            None,
            Some(&mut on_finish),
            Duration::from_millis(1),
        )
        .unwrap();

        assert!(ok);
        assert_eq!(seen, vec![(0, 1, 2), (1, 2, 4), (2, 3, 6)]);
    }

    #[test]
    fn test_run_in_background_failure_without_callback() {
        let config = WorkerConfig::default().with_mode(ExecutionMode::Simulation);
        let task = task_fn(|x: i64| {
            if x == 2 {
                anyhow::bail!("two is not allowed");
            }
            Ok(x)
        });
        let worker = Worker::with_config(0, task, config);
        let ok = run_in_background(worker, &[1, 2, 3], None, None, Duration::from_millis(1)).unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_run_in_pool_simulation_maps_indices() {
        let config = PoolConfig::default()
            .with_size(3)
            .with_mode(ExecutionMode::Simulation);
        let template = WorkerTemplate::from_fn("double", || task_fn(|x: i64| Ok(x * 2)));

        let mut results = vec![0; 4];
        let mut on_finish = |index: usize, _: &i64, result: PayloadResult<i64>| {
            results[index] = result.unwrap();
            true
        };
        let ok = run_in_pool_with(config, template, &[5, 6, 7, 8], Some(&mut on_finish)).unwrap();

        assert!(ok);
        assert_eq!(results, vec![10, 12, 14, 16]);
    }
}
