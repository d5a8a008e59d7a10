use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alarm::{spawn_auto_update, AlarmConfig, AlarmDispatcher};
use crate::db::SqliteStore;
use crate::error::{Result, SchedulerError};
use crate::memory::MemoryStore;
use crate::registry::HandlerRegistry;
use crate::store::TaskStore;
use crate::task::Task;
use crate::tick::{TickConfig, TickDispatcher};

/// Which dispatch engine drives the scheduler.
#[derive(Debug, Clone)]
pub enum Strategy {
    /// Poll-and-claim with a bounded worker pool. Suited to many tasks
    /// firing close together.
    Tick(TickConfig),
    /// One cancellable timer for the single earliest task. Suited to sparse
    /// catalogues where polling every second is wasteful.
    Alarm(AlarmConfig),
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Tick(TickConfig::default())
    }
}

/// How running dispatch loops get woken after a catalogue mutation.
enum Wake {
    Tick(Arc<AtomicBool>),
    Alarm(AlarmDispatcher),
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    wake: Wake,
}

/// An explicit scheduler instance, constructed and owned by the embedding
/// application's startup path. There is no global singleton: anything that
/// registers callbacks or creates tasks receives a reference to this.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    strategy: Strategy,
    running: Option<Running>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, strategy: Strategy) -> Self {
        Self {
            store,
            registry: Arc::new(HandlerRegistry::new()),
            strategy,
            running: None,
        }
    }

    /// Scheduler over the SQLite store at `path` (shared with any other
    /// scheduler process pointed at the same file).
    pub fn with_sqlite(path: &Path, strategy: Strategy) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteStore::open(path)?), strategy))
    }

    /// Scheduler over a process-local in-memory store.
    pub fn in_memory(strategy: Strategy) -> Self {
        Self::new(Arc::new(MemoryStore::new()), strategy)
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    /// Register `callback` for `task_type`, overwriting any prior one.
    pub fn register<F>(&self, task_type: &str, callback: F)
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register(task_type, callback);
    }

    /// Create a one-shot task firing `delay_secs` from now. Returns its id.
    /// An out-of-range delay is a creation-time error; nothing is persisted.
    pub fn create_delay(&self, task_type: &str, subject: &str, delay_secs: u64) -> Result<String> {
        let task = Task::delay(task_type, subject, delay_secs)?;
        self.store.insert(&task)?;
        info!(task_id = %task.id, %task_type, delay_secs, "delay task created");
        self.notify_changed();
        Ok(task.id)
    }

    /// Create a recurring task firing every `interval_secs`. Returns its id.
    /// Schedule validation errors surface here; an invalid task is never
    /// persisted.
    #[allow(clippy::too_many_arguments)]
    pub fn create_loop(
        &self,
        task_type: &str,
        subject: &str,
        interval_secs: u64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        first: bool,
    ) -> Result<String> {
        let task = Task::looping(task_type, subject, interval_secs, start, end, first)?;
        self.store.insert(&task)?;
        info!(task_id = %task.id, %task_type, interval_secs, "loop task created");
        self.notify_changed();
        Ok(task.id)
    }

    /// Mark a task finished so it never fires again. A task already mid-
    /// execution runs to completion.
    pub fn cancel(&self, id: &str) -> Result<()> {
        self.store.cancel(id)?;
        self.notify_changed();
        Ok(())
    }

    /// The catalogue-changed hook. Creation/cancellation call this
    /// internally; applications mutating the store directly should call it
    /// themselves. The alarm strategy's auto-update loop heals a missed
    /// call within one interval.
    pub fn notify_changed(&self) {
        match &self.running {
            Some(running) => match &running.wake {
                Wake::Tick(flag) => flag.store(true, Ordering::SeqCst),
                Wake::Alarm(dispatcher) => dispatcher.notify_changed(),
            },
            None => {}
        }
    }

    /// Spawn the configured dispatch loops.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let running = match &self.strategy {
            Strategy::Tick(config) => {
                let dispatcher = TickDispatcher::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.registry),
                    config.clone(),
                );
                let flag = dispatcher.refresh_flag();
                let handle = tokio::spawn(dispatcher.run(shutdown_rx));
                Running {
                    shutdown_tx,
                    handles: vec![handle],
                    wake: Wake::Tick(flag),
                }
            }
            Strategy::Alarm(config) => {
                let dispatcher = AlarmDispatcher::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.registry),
                    config.clone(),
                );
                // Stale-claim recovery applies to the alarm strategy too: a
                // crashed process may have claimed at fire time and died.
                match self.store.release_all() {
                    Ok(0) => {}
                    Ok(n) => warn!(count = n, "released stale claims on startup"),
                    Err(e) => warn!("stale-claim recovery failed: {e}"),
                }
                dispatcher.notify_changed();
                let auto = spawn_auto_update(dispatcher.clone(), shutdown_rx);
                Running {
                    shutdown_tx,
                    handles: vec![auto],
                    wake: Wake::Alarm(dispatcher),
                }
            }
        };
        self.running = Some(running);
        info!("scheduler started");
        Ok(())
    }

    /// Graceful shutdown: signal the loops, wait for in-flight executions,
    /// join everything. No hard timeout — callers may apply their own.
    pub async fn shutdown(&mut self) -> Result<()> {
        let running = self.running.take().ok_or(SchedulerError::NotRunning)?;
        let _ = running.shutdown_tx.send(true);
        if let Wake::Alarm(dispatcher) = &running.wake {
            dispatcher.disarm().await;
        }
        for handle in running.handles {
            if let Err(e) = handle.await {
                warn!("dispatch loop join failed: {e}");
            }
        }
        info!("scheduler stopped");
        Ok(())
    }

    /// `shutdown` followed by `start`. Tasks pending before the shutdown
    /// fire exactly once after the restart.
    pub async fn reset(&mut self) -> Result<()> {
        self.shutdown().await?;
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}
