//! Worker processes and the plumbing between them and their parent.
//!
//! A [`Worker`] forks a child that runs a [`Task`] for every payload it
//! receives. Parent and child talk over a Unix socket pair using
//! length-prefixed frames; completions and exits are announced with signals
//! when the worker belongs to a pool.
//!
//! # Architecture
//!
//! ```text
//!         ┌──────────────────────────┐
//!         │      Parent Process      │
//!         │  Worker { Proc, state }  │
//!         └────────────┬─────────────┘
//!            frames ▲  │  ▲ SIGUSR1 (result ready)
//!                   │  ▼  │ SIGUSR2 (exiting)
//!         ┌──────────────────────────┐
//!         │      Child Process       │
//!         │  recv → Task::run → send │
//!         └──────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `Idle → Running → Idle → … → Terminating → Terminated`. A worker is
//! running while any sent payload has not been reported back.

mod child;
pub mod frame;
mod lifecycle;
mod proc;
pub mod protocol;
pub mod signals;
pub(crate) mod spawn;
mod task;

pub use lifecycle::{StopStatus, TerminationCheck, Worker, WorkerState};
pub use protocol::{PayloadResult, TaskFailure};
pub use signals::TerminationReason;
pub use spawn::supports_forking;
pub use task::{FnTask, Task, task_fn};
