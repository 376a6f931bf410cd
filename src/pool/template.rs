//! How a pool makes new workers.
//!
//! Every pool holds exactly one [`WorkerTemplate`]: a factory producing a
//! fresh task value for each worker it creates. Templates come from a
//! closure, from a prototype that is cloned, or from a named kind looked up
//! in a [`KindRegistry`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PoolError, Result};
use crate::worker::Task;

/// Factory for the task values of a pool's workers.
pub struct WorkerTemplate<T> {
    label: String,
    make: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T: Task> WorkerTemplate<T> {
    /// Template backed by a factory closure.
    pub fn from_fn<F>(label: impl Into<String>, make: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            make: Arc::new(make),
        }
    }

    /// Template that clones `prototype` for every new worker.
    pub fn prototype(prototype: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_fn("prototype", move || prototype.clone())
    }

    /// Produce a task value for a new worker.
    pub fn instantiate(&self) -> T {
        (self.make)()
    }

    /// Kind name, or `"prototype"` / the factory label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> Clone for WorkerTemplate<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            make: Arc::clone(&self.make),
        }
    }
}

impl<T> fmt::Debug for WorkerTemplate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerTemplate")
            .field("label", &self.label)
            .finish()
    }
}

/// Named worker kinds sharing one task type.
///
/// Lets callers pick the kind of worker by name, e.g. from a command line.
pub struct KindRegistry<T> {
    kinds: BTreeMap<String, WorkerTemplate<T>>,
}

impl<T: Task> KindRegistry<T> {
    pub fn new() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// Register a kind. A later registration under the same name replaces
    /// the earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, make: F) -> &mut Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let name = name.into();
        let template = WorkerTemplate::from_fn(name.clone(), make);
        self.kinds.insert(name, template);
        self
    }

    /// Look up a kind by name.
    pub fn get(&self, name: &str) -> Result<WorkerTemplate<T>> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownKind(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.kinds.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl<T: Task> Default for KindRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Scale(i64);

    impl Task for Scale {
        type Payload = i64;
        type Output = i64;

        fn run(&mut self, payload: i64) -> anyhow::Result<i64> {
            Ok(payload * self.0)
        }
    }

    #[test]
    fn test_prototype_clones_state() {
        let template = WorkerTemplate::prototype(Scale(3));
        let mut a = template.instantiate();
        let mut b = template.instantiate();
        assert_eq!(a.run(2).unwrap(), 6);
        assert_eq!(b.run(5).unwrap(), 15);
        assert_eq!(template.label(), "prototype");
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = KindRegistry::new();
        registry.register("triple", || Scale(3)).register("double", || Scale(2));

        assert_eq!(registry.names(), vec!["double", "triple"]);
        assert!(registry.contains("double"));

        let template = registry.get("triple").unwrap();
        assert_eq!(template.label(), "triple");
        assert_eq!(template.instantiate().run(2).unwrap(), 6);
    }

    #[test]
    fn test_registry_unknown_kind() {
        let registry: KindRegistry<Scale> = KindRegistry::new();
        assert!(registry.is_empty());
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, PoolError::UnknownKind(ref name) if name == "missing"));
    }
}
