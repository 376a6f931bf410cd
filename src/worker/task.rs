//! The job handler contract run inside worker processes.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A handler invoked once per payload, synchronously, inside the worker.
///
/// The task value is copied into the worker process when it starts, so any
/// state it carries (configuration, counters) is per-worker.
pub trait Task: Send + 'static {
    type Payload: Serialize + DeserializeOwned;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Handle one payload. Errors are reported to the parent as failed payloads.
    fn run(&mut self, payload: Self::Payload) -> anyhow::Result<Self::Output>;
}

/// A [`Task`] backed by a closure. Built by [`task_fn`].
pub struct FnTask<F, P, O> {
    f: F,
    _marker: PhantomData<fn(P) -> O>,
}

impl<F: Clone, P, O> Clone for FnTask<F, P, O> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            _marker: PhantomData,
        }
    }
}

impl<F, P, O> fmt::Debug for FnTask<F, P, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnTask")
    }
}

impl<F, P, O> Task for FnTask<F, P, O>
where
    F: FnMut(P) -> anyhow::Result<O> + Send + 'static,
    P: Serialize + DeserializeOwned + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
{
    type Payload = P;
    type Output = O;

    fn run(&mut self, payload: P) -> anyhow::Result<O> {
        (self.f)(payload)
    }
}

/// Wrap a closure as a [`Task`].
///
/// ```
/// use forkpool::task_fn;
///
/// let double = task_fn(|x: i64| Ok(x * 2));
/// # let _ = double;
/// ```
pub fn task_fn<F, P, O>(f: F) -> FnTask<F, P, O>
where
    F: FnMut(P) -> anyhow::Result<O> + Send + 'static,
{
    FnTask {
        f,
        _marker: PhantomData,
    }
}
