use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Upper bound on user-supplied delay/interval seconds.
///
/// `chrono::Duration` counts milliseconds in an `i64` and its constructors
/// panic past that, so anything above this cannot be represented — and a
/// negative wrapped interval would walk `advance` backwards forever.
const MAX_SCHEDULE_SECS: u64 = i64::MAX as u64 / 1_000;

/// A scheduled unit of work.
///
/// `interval = None` makes this a one-shot delay task; `Some(secs)` a
/// recurring loop task. The callback registered for `task_type` receives
/// only `subject` — never the task record itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// UUID v4 string — primary key.
    pub id: String,
    /// Resolves the callback via the handler registry.
    pub task_type: String,
    /// Caller-supplied identifier passed to the callback.
    pub subject: String,
    pub start_time: DateTime<Utc>,
    /// Loop tasks stop recurring once `next_time` passes this.
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between recurrences. `None` means one-shot.
    pub interval: Option<u64>,
    /// When true the first occurrence is `start_time` itself, otherwise
    /// `start_time + interval`.
    pub first: bool,
    /// Next due timestamp; monotonically non-decreasing over the task's life.
    pub next_time: DateTime<Utc>,
    /// Terminal flag — a finished task is never dispatched again.
    pub finished: bool,
    /// Mutual-exclusion flag — true exactly while some worker holds the task.
    pub claimed: bool,
}

impl Task {
    /// One-shot task firing once, `delay_secs` from now.
    pub fn delay(task_type: &str, subject: &str, delay_secs: u64) -> Result<Self> {
        check_secs("delay", delay_secs)?;
        let now = Utc::now();
        let next_time = checked_offset(now, "delay", delay_secs)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            subject: subject.to_string(),
            start_time: now,
            end_time: None,
            interval: None,
            first: false,
            next_time,
            finished: false,
            claimed: false,
        })
    }

    /// Recurring task firing every `interval_secs`, optionally bounded by
    /// `[start, end]`. Validation failures are creation-time errors; an
    /// invalid task is never persisted.
    pub fn looping(
        task_type: &str,
        subject: &str,
        interval_secs: u64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        first: bool,
    ) -> Result<Self> {
        if interval_secs == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "interval must be at least 1 second".to_string(),
            ));
        }
        check_secs("interval", interval_secs)?;
        let start_time = start.unwrap_or_else(Utc::now);
        if let Some(end_time) = end {
            if end_time <= start_time {
                return Err(SchedulerError::InvalidSchedule(
                    "end_time must be after start_time".to_string(),
                ));
            }
        }
        let next_time = if first {
            start_time
        } else {
            checked_offset(start_time, "interval", interval_secs)?
        };
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            subject: subject.to_string(),
            start_time,
            end_time: end,
            interval: Some(interval_secs),
            first,
            next_time,
            finished: false,
            claimed: false,
        })
    }

    /// Whether the task may be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.claimed && !self.finished && self.next_time <= now
    }

    /// Catch-up reschedule, applied after an execution.
    ///
    /// Advances `next_time` past every missed occurrence in one step, so a
    /// task that missed N intervals fires once on recovery, not N times.
    /// One-shot tasks finish instead. Loop tasks finish once the advanced
    /// `next_time` passes `end_time`.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        match self.interval {
            None => self.finished = true,
            Some(secs) => {
                let step = Duration::seconds(secs as i64);
                while self.next_time < now {
                    self.next_time += step;
                }
                if let Some(end) = self.end_time {
                    if self.next_time > end {
                        self.finished = true;
                    }
                }
            }
        }
    }
}

fn check_secs(what: &str, secs: u64) -> Result<()> {
    if secs > MAX_SCHEDULE_SECS {
        return Err(SchedulerError::InvalidSchedule(format!(
            "{what} of {secs} seconds is out of range"
        )));
    }
    Ok(())
}

/// `from + secs`, erroring instead of panicking when the result falls
/// outside chrono's representable timestamp range.
fn checked_offset(from: DateTime<Utc>, what: &str, secs: u64) -> Result<DateTime<Utc>> {
    from.checked_add_signed(Duration::seconds(secs as i64))
        .ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("{what} of {secs} seconds is out of range"))
        })
}
