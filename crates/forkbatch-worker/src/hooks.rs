//! Lifecycle hooks framing each batch.
//!
//! A `HookRegistry` is assembled at startup and handed to the `Worker`; the
//! worker only ever reads it afterwards. Hooks of one point run in
//! registration order and the first error stops the remaining ones.

use crate::error::{Result, WorkerError};
use crate::worker::Worker;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Callback invoked with the worker running the batch
pub type Hook = Arc<dyn Fn(&Worker) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// In the process executing the batch, before its first job
    BeforeBatch,
    /// In the process executing the batch, after its last job
    AfterBatch,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeBatch => "before_batch",
            HookPoint::AfterBatch => "after_batch",
        }
    }
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrap a closure as a `Hook`
pub fn hook<F>(f: F) -> Hook
where
    F: Fn(&Worker) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<HookPoint, Vec<Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook to `point`
    pub fn register(&mut self, point: HookPoint, hook: Hook) -> &mut Self {
        self.hooks.entry(point).or_default().push(hook);
        self
    }

    /// Hooks registered for `point`, in registration order
    pub fn hooks(&self, point: HookPoint) -> &[Hook] {
        self.hooks.get(&point).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Register a before-batch hook when one is given; either way, return
    /// the before-batch hooks.
    pub fn before_batch(&mut self, hook: Option<Hook>) -> &[Hook] {
        self.register_or_list(HookPoint::BeforeBatch, hook)
    }

    /// Register an after-batch hook when one is given; either way, return
    /// the after-batch hooks.
    pub fn after_batch(&mut self, hook: Option<Hook>) -> &[Hook] {
        self.register_or_list(HookPoint::AfterBatch, hook)
    }

    fn register_or_list(&mut self, point: HookPoint, hook: Option<Hook>) -> &[Hook] {
        if let Some(hook) = hook {
            self.register(point, hook);
        }
        self.hooks(point)
    }

    /// Run every hook of `point` against `worker`
    pub fn run(&self, point: HookPoint, worker: &Worker) -> Result<()> {
        let hooks = self.hooks(point);
        if !hooks.is_empty() {
            debug!("Running {} {} hook(s)", hooks.len(), point);
        }

        for hook in hooks {
            hook(worker).map_err(|source| WorkerError::Hook { point, source })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("before_batch", &self.hooks(HookPoint::BeforeBatch).len())
            .field("after_batch", &self.hooks(HookPoint::AfterBatch).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::handler::JobHandlerRegistry;
    use forkbatch_core::MemoryQueue;
    use parking_lot::Mutex;

    fn worker(hooks: HookRegistry) -> Worker {
        let config = WorkerConfig {
            fork: false,
            ..WorkerConfig::default()
        };
        Worker::new(config, Arc::new(MemoryQueue::new()), JobHandlerRegistry::new()).with_hooks(hooks)
    }

    #[test]
    fn test_register_and_list_through_same_operation() {
        let mut registry = HookRegistry::new();
        assert!(registry.before_batch(None).is_empty());

        assert_eq!(registry.before_batch(Some(hook(|_| Ok(())))).len(), 1);
        assert_eq!(registry.before_batch(Some(hook(|_| Ok(())))).len(), 2);
        assert_eq!(registry.before_batch(None).len(), 2);
        assert!(registry.after_batch(None).is_empty());
    }

    #[test]
    fn test_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        for n in 1..=3 {
            let calls = calls.clone();
            registry.register(
                HookPoint::AfterBatch,
                hook(move |_| {
                    calls.lock().push(n);
                    Ok(())
                }),
            );
        }

        let worker = worker(registry.clone());
        registry.run(HookPoint::AfterBatch, &worker).unwrap();
        registry.run(HookPoint::BeforeBatch, &worker).unwrap();

        assert_eq!(*calls.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_first_error_stops_remaining_hooks() {
        let calls = Arc::new(Mutex::new(0));
        let mut registry = HookRegistry::new();
        registry.register(HookPoint::BeforeBatch, hook(|_| anyhow::bail!("no database")));
        {
            let calls = calls.clone();
            registry.register(
                HookPoint::BeforeBatch,
                hook(move |_| {
                    *calls.lock() += 1;
                    Ok(())
                }),
            );
        }

        let worker = worker(registry.clone());
        match registry.run(HookPoint::BeforeBatch, &worker) {
            Err(WorkerError::Hook { point, source }) => {
                assert_eq!(point, HookPoint::BeforeBatch);
                assert_eq!(source.to_string(), "no database");
            }
            other => panic!("Expected hook error, got {:?}", other),
        }
        assert_eq!(*calls.lock(), 0);
    }
}
