use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Bounded-concurrency executor for task callbacks.
///
/// `submit` blocks the caller once all slots are busy — intentional
/// backpressure, no unbounded queueing. Callbacks are sync closures and run
/// on the blocking thread pool so a slow callback never stalls the
/// scheduling loop's timers.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    in_flight: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots.max(1))),
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Run `job` on a free slot, waiting for one when all are busy.
    /// Jobs submitted after `shutdown` are dropped with a warning.
    pub async fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("worker pool is shut down — job dropped");
                return;
            }
        };

        let mut in_flight = self.in_flight.lock().await;
        // Reap completed workers so the set stays bounded by the slot count.
        while let Some(finished) = in_flight.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("worker panicked: {e}");
                }
            }
        }
        in_flight.spawn(async move {
            let _slot = permit;
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                if e.is_panic() {
                    error!("worker panicked: {e}");
                }
            }
        });
    }

    /// Stop accepting work and wait for everything in flight to finish.
    pub async fn shutdown(&self) {
        self.slots.close();
        let mut in_flight = self.in_flight.lock().await;
        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("worker panicked: {e}");
                }
            }
        }
    }
}
