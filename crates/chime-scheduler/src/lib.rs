//! `chime-scheduler` — recurring/delayed task scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Callers register a callback per task type, then create tasks. A task is
//! either a one-shot **delay** task (fire once after N seconds) or a
//! recurring **loop** task (fire every N seconds, optionally bounded by an
//! end time). The active dispatch strategy claims due tasks through the
//! [`store::TaskStore`] adapter and funnels every execution through the
//! catch-up reschedule in [`task::Task::advance`].
//!
//! # Dispatch strategies
//!
//! | Strategy | Behaviour                                                     |
//! |----------|---------------------------------------------------------------|
//! | Tick     | Polls on an interval, claims a look-ahead window of due-soon tasks, runs them on a bounded worker pool |
//! | Alarm    | Tracks only the single earliest pending task and arms one cancellable timer for it |
//!
//! Multiple scheduler processes may share one store; the `claimed` flag,
//! set and tested in a single conditional store update, is the only
//! cross-process mutual-exclusion primitive. A recurring task that missed
//! intervals (process outage, clock drift) is caught up in one step — it
//! never replays one execution per missed interval.

pub mod alarm;
pub mod db;
pub mod error;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod tick;

pub use alarm::{AlarmConfig, AlarmDispatcher};
pub use db::SqliteStore;
pub use error::{Result, SchedulerError};
pub use memory::MemoryStore;
pub use pool::WorkerPool;
pub use registry::{Callback, HandlerRegistry};
pub use scheduler::{Scheduler, Strategy};
pub use store::TaskStore;
pub use task::Task;
pub use tick::{TickConfig, TickDispatcher};
