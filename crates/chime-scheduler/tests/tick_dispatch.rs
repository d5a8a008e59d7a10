// End-to-end dispatch tests for the tick strategy. Durations are scaled
// down (tens of milliseconds) so the suite stays fast; assertions leave
// generous margins for slow CI machines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use chime_scheduler::{Scheduler, SqliteStore, Strategy, Task, TaskStore, TickConfig};

fn fast_tick() -> Strategy {
    Strategy::Tick(TickConfig {
        tick: Duration::from_millis(20),
        refresh_ticks: 5,
        lookahead_ticks: 10,
        workers: 4,
    })
}

fn counter(scheduler: &Scheduler, task_type: &str) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);
    scheduler.register(task_type, move |_subject| {
        count2.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    count
}

fn temp_db(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("chime-{tag}-{}.db", uuid::Uuid::new_v4()))
}

#[tokio::test(flavor = "multi_thread")]
async fn delay_task_fires_exactly_once() {
    let mut scheduler = Scheduler::in_memory(fast_tick());
    let count = counter(&scheduler, "ping");

    scheduler.start().unwrap();
    let store = scheduler.store();
    let id = scheduler.create_delay("ping", "subject-1", 1).unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0, "fired before due time");

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let task = store.get(&id).unwrap().unwrap();
    assert!(task.finished);
    assert!(!task.claimed);

    // A finished task never refires, even across a restart.
    scheduler.reset().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn loop_task_fires_once_per_interval() {
    let mut scheduler = Scheduler::in_memory(fast_tick());
    let count = counter(&scheduler, "beat");

    scheduler.start().unwrap();
    scheduler
        .create_loop("beat", "subject-1", 1, None, None, true)
        .unwrap();

    // interval is 1s; over ~2.5s expect the t=0 and t=1s and t=2s firings.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    scheduler.shutdown().await.unwrap();

    let fired = count.load(Ordering::SeqCst);
    assert!((2..=3).contains(&fired), "fired {fired} times");
}

#[tokio::test(flavor = "multi_thread")]
async fn missed_intervals_catch_up_with_one_firing() {
    let mut scheduler = Scheduler::in_memory(fast_tick());
    let count = counter(&scheduler, "beat");
    let store = scheduler.store();

    // A recurring task that "slept" through many intervals.
    let start = Utc::now() - chrono::Duration::seconds(3600);
    let task = Task::looping("beat", "subject-1", 60, Some(start), None, true).unwrap();
    store.insert(&task).unwrap();

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    scheduler.shutdown().await.unwrap();

    // One catch-up firing, not one per missed interval.
    assert_eq!(count.load(Ordering::SeqCst), 1);
    let stored = store.get(&task.id).unwrap().unwrap();
    assert!(stored.next_time > Utc::now() - chrono::Duration::seconds(60));
    assert!(!stored.finished);
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_type_is_dropped_not_retried() {
    let mut scheduler = Scheduler::in_memory(fast_tick());
    let store = scheduler.store();

    scheduler.start().unwrap();
    let id = scheduler.create_delay("ghost", "subject-1", 0).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    scheduler.shutdown().await.unwrap();

    assert!(store.get(&id).unwrap().is_none(), "ghost task not dropped");
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_claim_is_recovered_on_startup() {
    let mut scheduler = Scheduler::in_memory(fast_tick());
    let count = counter(&scheduler, "ping");
    let store = scheduler.store();

    // Simulate a crash: the task was claimed but never executed.
    let mut task = Task::delay("ping", "subject-1", 0).unwrap();
    task.claimed = true;
    store.insert(&task).unwrap();

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    scheduler.shutdown().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(store.get(&task.id).unwrap().unwrap().finished);
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_failure_still_advances_the_task() {
    let mut scheduler = Scheduler::in_memory(fast_tick());
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);
    scheduler.register("flaky", move |_| {
        count2.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("transient downstream failure")
    });
    let store = scheduler.store();

    scheduler.start().unwrap();
    let id = scheduler.create_delay("flaky", "subject-1", 0).unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    scheduler.shutdown().await.unwrap();

    // Fired once, finished normally despite the error.
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(store.get(&id).unwrap().unwrap().finished);
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_resumes_pending_tasks_without_duplicates() {
    let mut scheduler = Scheduler::in_memory(fast_tick());
    let count = counter(&scheduler, "ping");

    scheduler.start().unwrap();
    scheduler.create_delay("ping", "subject-1", 1).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.reset().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    scheduler.shutdown().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_stops_a_task_already_claimed_into_the_cache() {
    // Wide look-ahead so the task is claimed well before it is due.
    let mut scheduler = Scheduler::in_memory(Strategy::Tick(TickConfig {
        tick: Duration::from_millis(20),
        refresh_ticks: 5,
        lookahead_ticks: 100,
        workers: 4,
    }));
    let count = counter(&scheduler, "ping");
    let store = scheduler.store();

    scheduler.start().unwrap();
    let id = scheduler.create_delay("ping", "subject-1", 1).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        store.get(&id).unwrap().unwrap().claimed,
        "task never entered the cache"
    );
    scheduler.cancel(&id).unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    scheduler.shutdown().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 0, "cancelled task still fired");
}

#[tokio::test(flavor = "multi_thread")]
async fn two_schedulers_on_one_store_fire_each_task_once() {
    let path = temp_db("shared");

    let mut a = Scheduler::with_sqlite(&path, fast_tick()).unwrap();
    let mut b = Scheduler::with_sqlite(&path, fast_tick()).unwrap();
    let count_a = counter(&a, "ping");
    let count_b = counter(&b, "ping");

    a.start().unwrap();
    b.start().unwrap();
    // Let both startup recovery passes finish before any task exists, as
    // they would in steady state.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..10 {
        a.create_delay("ping", &format!("subject-{i}"), 0).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(800)).await;
    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();

    let total = count_a.load(Ordering::SeqCst) + count_b.load(Ordering::SeqCst);
    assert_eq!(total, 10, "claim protocol allowed duplicate or lost firings");

    // Everything finished exactly once.
    let store = SqliteStore::open(&path).unwrap();
    assert!(store.list().unwrap().iter().all(|t| t.finished));

    std::fs::remove_file(&path).ok();
}
