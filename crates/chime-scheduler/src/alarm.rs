use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chime_core::config::SchedulerConfig;

use crate::registry::HandlerRegistry;
use crate::store::TaskStore;
use crate::task::Task;

/// Alarm dispatcher tuning.
#[derive(Debug, Clone)]
pub struct AlarmConfig {
    /// Floor applied when arming a timer, so a past-due task still goes
    /// through a real timer instead of firing inline.
    pub min_delay: Duration,
    /// Auto-update loop interval — the fallback that heals missed
    /// catalogue-change notifications.
    pub auto_update: Duration,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(chime_core::config::DEFAULT_MIN_ALARM_DELAY_MS),
            auto_update: Duration::from_secs(chime_core::config::DEFAULT_AUTO_UPDATE_SECS),
        }
    }
}

impl From<&SchedulerConfig> for AlarmConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            min_delay: Duration::from_millis(cfg.min_alarm_delay_ms.max(1)),
            auto_update: Duration::from_secs(cfg.auto_update_secs.max(1)),
        }
    }
}

/// The timer currently armed, if any.
struct Armed {
    task_id: String,
    fire_time: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Single-next-task strategy: tracks only the earliest pending task across
/// the whole store and arms one cancellable timer for it.
///
/// [`AlarmDispatcher::resolve`] is the only state-mutating entry point and
/// runs single-flight. The embedding application should call
/// [`AlarmDispatcher::notify_changed`] after any catalogue mutation; the
/// auto-update loop is the correctness fallback when it doesn't.
#[derive(Clone)]
pub struct AlarmDispatcher {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: AlarmConfig,
    armed: Arc<Mutex<Option<Armed>>>,
    /// Single-flight guard for `resolve`.
    resolve_lock: Arc<tokio::sync::Mutex<()>>,
    /// Held around claim → execute → advance, so executions serialize and
    /// shutdown can wait for the one in flight.
    exec_lock: Arc<tokio::sync::Mutex<()>>,
    /// Set by `disarm`; keeps a trailing `resolve` (from a firing that was
    /// already executing during shutdown) from re-arming a timer.
    stopped: Arc<AtomicBool>,
}

impl AlarmDispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        config: AlarmConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            armed: Arc::new(Mutex::new(None)),
            resolve_lock: Arc::new(tokio::sync::Mutex::new(())),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Re-evaluate which task the timer should be armed for.
    ///
    /// Idempotent: when the earliest pending task is the one already armed
    /// (same id, same fire time) nothing happens. Otherwise the old timer is
    /// cancelled and a new one armed.
    pub async fn resolve(&self) {
        let _flight = self.resolve_lock.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let task = match self.store.earliest_pending() {
            Ok(Some(task)) => task,
            Ok(None) => return,
            // Transient store failure: the auto-update loop retries.
            Err(e) => {
                warn!("earliest_pending failed: {e}");
                return;
            }
        };

        let mut armed = self.armed.lock().unwrap();
        if let Some(current) = armed.as_ref() {
            if current.task_id == task.id && current.fire_time == task.next_time {
                return;
            }
            // Superseded before firing. A timer that already started its
            // firing sequence has cleared this slot and cannot be here.
            current.handle.abort();
            debug!(task_id = %current.task_id, "armed timer superseded");
        }

        let delay = (task.next_time - Utc::now())
            .to_std()
            .unwrap_or_default()
            .max(self.config.min_delay);
        let task_id = task.id.clone();
        let fire_time = task.next_time;
        debug!(task_id = %task_id, delay_ms = delay.as_millis() as u64, "arming timer");

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(task).await;
        });
        *armed = Some(Armed {
            task_id,
            fire_time,
            handle,
        });
    }

    /// Catalogue-changed hook. Schedules a `resolve` without blocking the
    /// caller (typically invoked right after an insert/cancel).
    pub fn notify_changed(&self) {
        let this = self.clone();
        tokio::spawn(async move { this.resolve().await });
    }

    /// Cancel any armed timer and wait for an in-flight execution to finish.
    /// The dispatcher is permanently stopped afterwards; `start` builds a
    /// fresh one.
    pub async fn disarm(&self) {
        // Serialize with any resolve in progress so it cannot arm a timer
        // after we swept the slot.
        {
            let _flight = self.resolve_lock.lock().await;
            self.stopped.store(true, Ordering::SeqCst);
            if let Some(current) = self.armed.lock().unwrap().take() {
                current.handle.abort();
            }
        }
        // An execution past the armed-state check keeps running to
        // completion; taking the lock waits it out.
        let _done = self.exec_lock.lock().await;
    }

    /// Timer body: verify this firing is still current, claim, execute,
    /// advance, then re-resolve.
    async fn fire(&self, task: Task) {
        // Check-and-clear under one lock acquisition: a concurrent resolve
        // either aborted us before this point or finds the slot empty and
        // arms freely. A stale firing (superseded armed state) stops here.
        {
            let mut armed = self.armed.lock().unwrap();
            match armed.as_ref() {
                Some(a) if a.task_id == task.id && a.fire_time == task.next_time => {
                    *armed = None;
                }
                _ => return,
            }
        }

        let _exec = self.exec_lock.lock().await;
        match self.store.claim_one(&task.id, task.next_time) {
            Ok(true) => self.execute(&task).await,
            // Another scheduler process got there first.
            Ok(false) => debug!(task_id = %task.id, "lost claim race"),
            Err(e) => warn!(task_id = %task.id, "claim failed: {e}"),
        }
        drop(_exec);

        // Re-resolve on a fresh task rather than awaiting here: the timer
        // body awaiting `resolve` while `resolve` spawns timer bodies would
        // make the two future types mutually recursive.
        self.notify_changed();
    }

    async fn execute(&self, task: &Task) {
        let callback = match self.registry.resolve(&task.task_type) {
            Some(cb) => cb,
            None => {
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

        let task_type = task.task_type.clone();
        let subject = task.subject.clone();
        let result = tokio::task::spawn_blocking(move || {
            HandlerRegistry::execute(&callback, &task_type, &subject);
        })
        .await;
        if let Err(e) = result {
            if e.is_panic() {
                error!(task_id = %task.id, "task callback panicked: {e}");
            }
        }

        if let Err(e) = self.store.advance_and_release(&task.id, Utc::now()) {
            warn!(task_id = %task.id, "advance_and_release failed: {e}");
        }
    }
}

/// Periodic fallback `resolve`, absorbing missed notifications and tasks
/// inserted by other processes. Stops when `shutdown` broadcasts `true`.
pub fn spawn_auto_update(
    dispatcher: AlarmDispatcher,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let every = dispatcher.config.auto_update;
    tokio::spawn(async move {
        info!(every_ms = every.as_millis() as u64, "auto-update loop started");
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => dispatcher.resolve().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("auto-update loop stopping");
                        break;
                    }
                }
            }
        }
    })
}
