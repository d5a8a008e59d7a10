use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use chime_core::config::SchedulerConfig;

use crate::pool::WorkerPool;
use crate::registry::HandlerRegistry;
use crate::store::TaskStore;
use crate::task::Task;

/// Tick dispatcher tuning.
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Polling interval `T`.
    pub tick: Duration,
    /// Resynchronize the due-soon cache with the store every N ticks.
    pub refresh_ticks: u32,
    /// Claim window = `lookahead_ticks × tick`.
    pub lookahead_ticks: u32,
    /// Worker pool slots.
    pub workers: usize,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(chime_core::config::DEFAULT_TICK_SECS),
            refresh_ticks: chime_core::config::DEFAULT_REFRESH_TICKS,
            lookahead_ticks: chime_core::config::DEFAULT_LOOKAHEAD_TICKS,
            workers: chime_core::config::DEFAULT_WORKERS,
        }
    }
}

impl From<&SchedulerConfig> for TickConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            tick: Duration::from_secs(cfg.tick_secs.max(1)),
            refresh_ticks: cfg.refresh_ticks.max(1),
            lookahead_ticks: cfg.lookahead_ticks.max(1),
            workers: cfg.workers.max(1),
        }
    }
}

impl TickConfig {
    fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.tick.as_millis() as i64 * self.lookahead_ticks as i64)
    }
}

/// Polling strategy: periodically refreshes a look-ahead window of claimed
/// due-soon tasks from the store, and submits the ones whose due time has
/// arrived to the worker pool.
pub struct TickDispatcher {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    pool: Arc<WorkerPool>,
    config: TickConfig,
    /// Set by workers after every execution (and by task creation) so the
    /// next tick resynchronizes with the store promptly instead of waiting
    /// out the refresh period.
    refresh_requested: Arc<AtomicBool>,
    /// Claimed, not-yet-due tasks, keyed by id.
    cache: HashMap<String, Task>,
}

impl TickDispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        config: TickConfig,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(config.workers));
        Self {
            store,
            registry,
            pool,
            config,
            refresh_requested: Arc::new(AtomicBool::new(false)),
            cache: HashMap::new(),
        }
    }

    /// Shared flag: setting it makes the next tick refresh the cache.
    pub fn refresh_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.refresh_requested)
    }

    /// Main loop. Polls every `tick` until `shutdown` broadcasts `true`,
    /// then releases unexecuted claims and drains the worker pool.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.config.tick.as_millis() as u64, "tick dispatcher started");

        // Crash recovery: claims left behind by a previous process would
        // otherwise block their tasks forever.
        match self.store.release_all() {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "released stale claims on startup"),
            Err(e) => error!("stale-claim recovery failed: {e}"),
        }
        self.refresh_cache();

        let mut interval = tokio::time::interval(self.config.tick);
        let mut tick_no: u64 = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tick_no += 1;
                    self.tick(tick_no).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("tick dispatcher shutting down");
                        break;
                    }
                }
            }
        }

        // Cached tasks are claimed but were never started; hand them back.
        for id in self.cache.keys() {
            if let Err(e) = self.store.release(id) {
                warn!(task_id = %id, "failed to release cached claim: {e}");
            }
        }
        self.pool.shutdown().await;
    }

    async fn tick(&mut self, tick_no: u64) {
        if tick_no % self.config.refresh_ticks as u64 == 0
            || self.refresh_requested.swap(false, Ordering::SeqCst)
        {
            self.refresh_cache();
        }

        let now = Utc::now();
        let due_ids: Vec<String> = self
            .cache
            .values()
            .filter(|t| t.next_time <= now)
            .map(|t| t.id.clone())
            .collect();

        for id in due_ids {
            if let Some(task) = self.cache.remove(&id) {
                // The task may have been cancelled or deleted while it sat
                // claimed in the cache; re-check before executing.
                match self.store.get(&id) {
                    Ok(Some(current)) if current.finished => {
                        debug!(task_id = %id, "cancelled while cached, skipping");
                        continue;
                    }
                    Ok(None) => continue,
                    Ok(Some(_)) => {}
                    Err(e) => warn!(task_id = %id, "pre-dispatch re-check failed: {e}"),
                }
                self.dispatch(task).await;
            }
        }
    }

    /// Claim everything due within the look-ahead window and merge it with
    /// the not-yet-executed remainder of the previous window.
    fn refresh_cache(&mut self) {
        match self.store.claim_due(Utc::now(), self.config.lookahead()) {
            Ok(batch) => {
                for task in batch {
                    self.cache.insert(task.id.clone(), task);
                }
            }
            // Transient store failure: keep the current cache and retry on
            // the next refresh.
            Err(e) => warn!("claim_due failed: {e}"),
        }
    }

    async fn dispatch(&self, task: Task) {
        let callback = match self.registry.resolve(&task.task_type) {
            Some(cb) => cb,
            None => {
                // Dropped, not retried.
                let err = crate::error::SchedulerError::UnregisteredType {
                    task_type: task.task_type.clone(),
                };
                warn!(task_id = %task.id, "{err}, dropping task");
                if let Err(e) = self.store.remove(&task.id) {
                    warn!(task_id = %task.id, "failed to drop task: {e}");
                }
                return;
            }
        };

        debug!(task_id = %task.id, task_type = %task.task_type, "dispatching task");
        let store = Arc::clone(&self.store);
        let refresh = Arc::clone(&self.refresh_requested);
        self.pool
            .submit(move || {
                HandlerRegistry::execute(&callback, &task.task_type, &task.subject);
                if let Err(e) = store.advance_and_release(&task.id, Utc::now()) {
                    warn!(task_id = %task.id, "advance_and_release failed: {e}");
                }
                refresh.store(true, Ordering::SeqCst);
            })
            .await;
    }
}
