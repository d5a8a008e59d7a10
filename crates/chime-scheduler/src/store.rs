use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::task::Task;

/// Persistent task catalogue with row-level mutual exclusion.
///
/// Two implementations: [`crate::db::SqliteStore`] for persisted tasks
/// (correct across processes sharing one database file) and
/// [`crate::memory::MemoryStore`] for locally created tasks. Which one a
/// scheduler uses is decided at construction time.
///
/// The `claimed` flag is the only mutual-exclusion primitive. Every claim
/// operation must set and test it in the same atomic update as the
/// `finished`/`next_time` filter, so that no task is ever handed to two
/// concurrent claimants.
pub trait TaskStore: Send + Sync {
    /// Atomically claim every task with `claimed = false`, `finished = false`
    /// and `next_time <= now + lookahead`, and return the claimed rows.
    fn claim_due(&self, now: DateTime<Utc>, lookahead: Duration) -> Result<Vec<Task>>;

    /// Compare-and-swap claim of a single task. `expected_next_time` guards
    /// against claiming a row another process already executed and advanced.
    /// Returns `false` when the claim was lost to a concurrent claimant.
    fn claim_one(&self, id: &str, expected_next_time: DateTime<Utc>) -> Result<bool>;

    /// Clear `claimed` without touching `next_time`/`finished`. Used when a
    /// claimed task could not be started.
    fn release(&self, id: &str) -> Result<()>;

    /// Apply the catch-up reschedule ([`Task::advance`]) and clear `claimed`,
    /// atomically. A missing id is a no-op — the task may have been deleted
    /// concurrently.
    fn advance_and_release(&self, id: &str, now: DateTime<Utc>) -> Result<()>;

    /// The unclaimed, unfinished task with the smallest `next_time`; ties
    /// broken by id for determinism.
    fn earliest_pending(&self) -> Result<Option<Task>>;

    fn insert(&self, task: &Task) -> Result<()>;

    /// Mark a task finished so it is never dispatched again. Errors with
    /// `TaskNotFound` when no such task exists.
    fn cancel(&self, id: &str) -> Result<()>;

    /// Delete a task outright (unregistered-type drops).
    fn remove(&self, id: &str) -> Result<()>;

    /// Clear every stale claim. Startup recovery after a crash that left
    /// tasks claimed but never executed. Returns how many were released.
    fn release_all(&self) -> Result<usize>;

    fn get(&self, id: &str) -> Result<Option<Task>>;

    fn list(&self) -> Result<Vec<Task>>;
}
