use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

use crate::error::Result;
use crate::store::TaskStore;
use crate::task::Task;

const TASK_COLUMNS: &str =
    "id, task_type, subject, start_time, end_time, interval, first, next_time, finished, claimed";

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks` table (idempotent) and an index on `next_time` so the
/// claim query is efficient even with thousands of scheduled tasks.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id          TEXT    NOT NULL PRIMARY KEY,
            task_type   TEXT    NOT NULL,
            subject     TEXT    NOT NULL,
            start_time  TEXT    NOT NULL,   -- ISO-8601
            end_time    TEXT,               -- ISO-8601 or NULL
            interval    INTEGER,            -- seconds; NULL means one-shot
            first       INTEGER NOT NULL DEFAULT 1,
            next_time   TEXT    NOT NULL,   -- ISO-8601
            finished    INTEGER NOT NULL DEFAULT 0,
            claimed     INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        -- Efficient claiming: SELECT … WHERE next_time <= ?  ORDER BY next_time
        CREATE INDEX IF NOT EXISTS idx_tasks_next_time ON tasks (next_time);
        ",
    )?;
    Ok(())
}

/// SQLite-backed task store.
///
/// Claim atomicity across processes comes from per-row conditional updates:
/// `UPDATE … SET claimed = 1 WHERE id = ? AND claimed = 0 AND …` succeeds
/// for exactly one claimant, observable via the affected-row count. SQLite
/// serialises writers per database file, so two processes polling the same
/// file never both win the same row.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`, running schema migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL lets a second scheduler process read while we write; the busy
        // timeout absorbs writer contention instead of surfacing SQLITE_BUSY.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::new(conn)
    }

    /// Wrap an existing connection, running schema migrations.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

type TaskRow = (
    String,         // id
    String,         // task_type
    String,         // subject
    String,         // start_time
    Option<String>, // end_time
    Option<u64>,    // interval
    bool,           // first
    String,         // next_time
    bool,           // finished
    bool,           // claimed
);

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<TaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!("unparseable timestamp in tasks table: {s}: {e}");
            None
        }
    }
}

fn parse_task(raw: TaskRow) -> Option<Task> {
    let (id, task_type, subject, start, end, interval, first, next, finished, claimed) = raw;
    Some(Task {
        id,
        task_type,
        subject,
        start_time: parse_time(&start)?,
        end_time: match end {
            Some(s) => Some(parse_time(&s)?),
            None => None,
        },
        interval,
        first,
        next_time: parse_time(&next)?,
        finished,
        claimed,
    })
}

impl TaskStore for SqliteStore {
    fn claim_due(&self, now: DateTime<Utc>, lookahead: Duration) -> Result<Vec<Task>> {
        let horizon = (now + lookahead).to_rfc3339();
        let conn = self.conn.lock().unwrap();

        // Collect candidates first, then take each row with a conditional
        // update. A row lost to a concurrent claimant between the two
        // statements simply fails its update and is skipped.
        let candidates: Vec<TaskRow> = {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE claimed = 0 AND finished = 0 AND next_time <= ?1
                 ORDER BY next_time, id",
            ))?;
            let rows: Vec<TaskRow> = stmt
                .query_map([&horizon], read_row)?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let mut claimed = Vec::new();
        for raw in candidates {
            let n = conn.execute(
                "UPDATE tasks SET claimed = 1
                 WHERE id = ?1 AND claimed = 0 AND finished = 0 AND next_time <= ?2",
                rusqlite::params![raw.0, horizon],
            )?;
            if n == 1 {
                if let Some(mut task) = parse_task(raw) {
                    task.claimed = true;
                    claimed.push(task);
                }
            }
        }
        Ok(claimed)
    }

    fn claim_one(&self, id: &str, expected_next_time: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE tasks SET claimed = 1
             WHERE id = ?1 AND claimed = 0 AND finished = 0 AND next_time = ?2",
            rusqlite::params![id, expected_next_time.to_rfc3339()],
        )?;
        Ok(n == 1)
    }

    fn release(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE tasks SET claimed = 0 WHERE id = ?1", [id])?;
        Ok(())
    }

    fn advance_and_release(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // Only the claimant mutates a claimed row, so read-then-write here
        // cannot race another writer on the same task.
        let raw: Option<TaskRow> = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                read_row,
            )
            .optional()?;

        let mut task = match raw.and_then(parse_task) {
            Some(t) => t,
            None => return Ok(()), // deleted concurrently — no-op
        };
        task.advance(now);

        conn.execute(
            "UPDATE tasks SET next_time = ?1, finished = ?2, claimed = 0 WHERE id = ?3",
            rusqlite::params![task.next_time.to_rfc3339(), task.finished, id],
        )?;
        Ok(())
    }

    fn earliest_pending(&self) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<TaskRow> = conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE claimed = 0 AND finished = 0
                     ORDER BY next_time, id LIMIT 1",
                ),
                [],
                read_row,
            )
            .optional()?;
        Ok(raw.and_then(parse_task))
    }

    fn insert(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            ),
            rusqlite::params![
                task.id,
                task.task_type,
                task.subject,
                task.start_time.to_rfc3339(),
                task.end_time.map(|t| t.to_rfc3339()),
                task.interval,
                task.first,
                task.next_time.to_rfc3339(),
                task.finished,
                task.claimed,
            ],
        )?;
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("UPDATE tasks SET finished = 1 WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(crate::error::SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        Ok(())
    }

    fn release_all(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("UPDATE tasks SET claimed = 0 WHERE claimed = 1", [])?;
        Ok(n)
    }

    fn get(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<TaskRow> = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                read_row,
            )
            .optional()?;
        Ok(raw.and_then(parse_task))
    }

    fn list(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY next_time, id",
        ))?;
        let tasks = stmt
            .query_map([], read_row)?
            .filter_map(|r| r.ok())
            .filter_map(parse_task)
            .collect();
        Ok(tasks)
    }
}
