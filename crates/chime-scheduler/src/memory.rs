use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::store::TaskStore;
use crate::task::Task;

/// In-memory task store for locally created tasks.
///
/// Same contract as the SQLite store, single-process only: the map mutex
/// makes each operation atomic with respect to concurrent claimants within
/// this process.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    fn claim_due(&self, now: DateTime<Utc>, lookahead: Duration) -> Result<Vec<Task>> {
        let horizon = now + lookahead;
        let mut tasks = self.tasks.lock().unwrap();
        let mut claimed = Vec::new();
        for task in tasks.values_mut() {
            if !task.claimed && !task.finished && task.next_time <= horizon {
                task.claimed = true;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    fn claim_one(&self, id: &str, expected_next_time: DateTime<Utc>) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(id) {
            Some(task)
                if !task.claimed && !task.finished && task.next_time == expected_next_time =>
            {
                task.claimed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, id: &str) -> Result<()> {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(id) {
            task.claimed = false;
        }
        Ok(())
    }

    fn advance_and_release(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(id) {
            task.advance(now);
            task.claimed = false;
        }
        Ok(())
    }

    fn earliest_pending(&self) -> Result<Option<Task>> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks
            .values()
            .filter(|t| !t.claimed && !t.finished)
            .min_by(|a, b| (a.next_time, &a.id).cmp(&(b.next_time, &b.id)))
            .cloned())
    }

    fn insert(&self, task: &Task) -> Result<()> {
        self.tasks
            .lock()
            .unwrap()
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<()> {
        match self.tasks.lock().unwrap().get_mut(id) {
            Some(task) => {
                task.finished = true;
                Ok(())
            }
            None => Err(crate::error::SchedulerError::TaskNotFound { id: id.to_string() }),
        }
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.tasks.lock().unwrap().remove(id);
        Ok(())
    }

    fn release_all(&self) -> Result<usize> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut released = 0;
        for task in tasks.values_mut() {
            if task.claimed {
                task.claimed = false;
                released += 1;
            }
        }
        Ok(released)
    }

    fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.lock().unwrap().values().cloned().collect();
        tasks.sort_by(|a, b| (a.next_time, &a.id).cmp(&(b.next_time, &b.id)));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_due_claims_exactly_once() {
        let store = MemoryStore::new();
        let task = Task::delay("ping", "s-1", 0).unwrap();
        store.insert(&task).unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let first = store.claim_due(now, Duration::seconds(0)).unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].claimed);

        // Already claimed — a second poll gets nothing.
        let second = store.claim_due(now, Duration::seconds(0)).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn earliest_pending_skips_claimed_and_breaks_ties_by_id() {
        let store = MemoryStore::new();
        let mut a = Task::delay("ping", "s-a", 5).unwrap();
        let mut b = Task::delay("ping", "s-b", 5).unwrap();
        a.id = "aaa".to_string();
        b.id = "bbb".to_string();
        b.next_time = a.next_time;
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        assert_eq!(store.earliest_pending().unwrap().unwrap().id, "aaa");

        assert!(store.claim_one("aaa", a.next_time).unwrap());
        assert_eq!(store.earliest_pending().unwrap().unwrap().id, "bbb");
    }

    #[test]
    fn claim_one_requires_expected_next_time() {
        let store = MemoryStore::new();
        let task = Task::delay("ping", "s-1", 5).unwrap();
        store.insert(&task).unwrap();

        let wrong = task.next_time + Duration::seconds(1);
        assert!(!store.claim_one(&task.id, wrong).unwrap());
        assert!(store.claim_one(&task.id, task.next_time).unwrap());
        // Second claim loses.
        assert!(!store.claim_one(&task.id, task.next_time).unwrap());
    }

    #[test]
    fn advance_and_release_finishes_one_shot() {
        let store = MemoryStore::new();
        let task = Task::delay("ping", "s-1", 0).unwrap();
        store.insert(&task).unwrap();
        assert!(store.claim_one(&task.id, task.next_time).unwrap());

        store.advance_and_release(&task.id, Utc::now()).unwrap();
        let stored = store.get(&task.id).unwrap().unwrap();
        assert!(stored.finished);
        assert!(!stored.claimed);

        // Missing id is a no-op.
        store.advance_and_release("nope", Utc::now()).unwrap();
    }

    #[test]
    fn release_all_recovers_stale_claims() {
        let store = MemoryStore::new();
        let task = Task::delay("ping", "s-1", 0).unwrap();
        store.insert(&task).unwrap();
        assert!(store.claim_one(&task.id, task.next_time).unwrap());

        assert_eq!(store.release_all().unwrap(), 1);
        assert!(!store.get(&task.id).unwrap().unwrap().claimed);
    }
}
