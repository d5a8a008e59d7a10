use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

/// A task callback. Receives only the subject identifier — never the task
/// record — and reports failure through the returned `Result`.
pub type Callback = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// Maps task-type strings to registered callbacks.
///
/// Shared between the embedding application (which registers) and the
/// dispatch loops (which resolve), hence the concurrent map.
#[derive(Default)]
pub struct HandlerRegistry {
    callbacks: DashMap<String, Callback>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `task_type`, overwriting any prior one.
    pub fn register<F>(&self, task_type: &str, callback: F)
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self
            .callbacks
            .insert(task_type.to_string(), Arc::new(callback))
            .is_some()
        {
            debug!(%task_type, "callback re-registered");
        }
    }

    pub fn resolve(&self, task_type: &str) -> Option<Callback> {
        self.callbacks.get(task_type).map(|cb| Arc::clone(&cb))
    }

    /// Invoke a callback. Failures are logged and swallowed so that task
    /// bookkeeping (claim release, reschedule) always proceeds.
    pub fn execute(callback: &Callback, task_type: &str, subject: &str) {
        if let Err(e) = callback(subject) {
            warn!(%task_type, %subject, "task callback failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn register_overwrites() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.register("ping", |_| Ok(()));
        let hits2 = Arc::clone(&hits);
        registry.register("ping", move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let cb = registry.resolve("ping").unwrap();
        HandlerRegistry::execute(&cb, "ping", "s-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resolve_unknown_type_is_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("ghost").is_none());
    }

    #[test]
    fn execute_swallows_callback_errors() {
        let registry = HandlerRegistry::new();
        registry.register("boom", |_| anyhow::bail!("kaput"));
        let cb = registry.resolve("boom").unwrap();
        // Must not panic or propagate.
        HandlerRegistry::execute(&cb, "boom", "s-1");
    }
}
