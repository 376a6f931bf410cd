//! forkpool - process-based worker pools.
//!
//! Run a [`Task`] in forked worker processes, either one [`Worker`] at a time
//! or through a [`WorkersPool`] that grows, shrinks and load-balances on
//! demand.
//!
//! ```no_run
//! use forkpool::{PoolConfig, WorkersPool, task_fn};
//!
//! let pool = WorkersPool::from_factory(PoolConfig::default().with_size(4), || {
//!     task_fn(|x: i64| Ok(x * 2))
//! })?;
//! pool.register_completion_callback(|worker, seq, result| {
//!     println!("worker {} payload {}: {:?}", worker.id(), seq, result);
//! });
//! for x in 1..=10 {
//!     pool.send_data(&x, true)?;
//! }
//! pool.wait_to_finish(&mut []);
//! # Ok::<(), forkpool::PoolError>(())
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod pool;
pub mod worker;

pub use config::{ExecutionMode, Notification, PoolConfig, WorkerConfig};
pub use driver::{run_in_background, run_in_pool, run_in_pool_with};
pub use error::{PoolError, Result};
pub use pool::{Dispatched, KindRegistry, PoolBuilder, Tracker, WorkerTemplate, WorkersPool};
pub use worker::{
    FnTask, PayloadResult, StopStatus, Task, TaskFailure, TerminationCheck, TerminationReason,
    Worker, WorkerState, task_fn,
};
