// End-to-end dispatch tests for the alarm strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chime_scheduler::{AlarmConfig, Scheduler, Strategy, Task, TaskStore};

fn fast_alarm() -> Strategy {
    Strategy::Alarm(AlarmConfig {
        min_delay: Duration::from_millis(10),
        auto_update: Duration::from_millis(100),
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

#[tokio::test(flavor = "multi_thread")]
async fn delay_task_fires_exactly_once() {
    let mut scheduler = Scheduler::in_memory(fast_alarm());
    let count = counter(&scheduler, "ping");
    let store = scheduler.store();

    scheduler.start().unwrap();
    let id = scheduler.create_delay("ping", "subject-1", 1).unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0, "fired before due time");

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(store.get(&id).unwrap().unwrap().finished);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn loop_task_reschedules_after_each_firing() {
    let mut scheduler = Scheduler::in_memory(fast_alarm());
    let count = counter(&scheduler, "beat");

    scheduler.start().unwrap();
    scheduler
        .create_loop("beat", "subject-1", 1, None, None, true)
        .unwrap();

    // first=true fires almost immediately, then once per second.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    scheduler.shutdown().await.unwrap();

    let fired = count.load(Ordering::SeqCst);
    assert!((2..=4).contains(&fired), "fired {fired} times");
}

#[tokio::test(flavor = "multi_thread")]
async fn creation_wakes_the_dispatcher_before_auto_update() {
    // Auto-update period far in the future: only the notify hook can make
    // this fire on time.
    let mut scheduler = Scheduler::in_memory(Strategy::Alarm(AlarmConfig {
        min_delay: Duration::from_millis(10),
        auto_update: Duration::from_secs(3600),
    }));
    let count = counter(&scheduler, "ping");

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    scheduler.create_delay("ping", "subject-1", 0).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    scheduler.shutdown().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_update_heals_a_missed_notification() {
    let mut scheduler = Scheduler::in_memory(fast_alarm());
    let count = counter(&scheduler, "ping");
    let store = scheduler.store();

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Mutate the store behind the dispatcher's back — no notify_changed.
    store
        .insert(&Task::delay("ping", "subject-1", 0).unwrap())
        .unwrap();

    // The 100ms auto-update loop must pick it up on its own.
    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.shutdown().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn earlier_task_supersedes_the_armed_timer() {
    let mut scheduler = Scheduler::in_memory(fast_alarm());
    let slow = counter(&scheduler, "slow");
    let quick = counter(&scheduler, "quick");

    scheduler.start().unwrap();
    scheduler.create_delay("slow", "subject-1", 5).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Arrives later but is due sooner — must preempt the armed timer.
    scheduler.create_delay("quick", "subject-2", 0).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(quick.load(Ordering::SeqCst), 1);
    assert_eq!(slow.load(Ordering::SeqCst), 0);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_type_is_dropped_not_retried() {
    let mut scheduler = Scheduler::in_memory(fast_alarm());
    let store = scheduler.store();

    scheduler.start().unwrap();
    let id = scheduler.create_delay("ghost", "subject-1", 0).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    scheduler.shutdown().await.unwrap();

    assert!(store.get(&id).unwrap().is_none(), "ghost task not dropped");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_all_firing() {
    let mut scheduler = Scheduler::in_memory(fast_alarm());
    let count = counter(&scheduler, "beat");

    scheduler.start().unwrap();
    scheduler
        .create_loop("beat", "subject-1", 1, None, None, true)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    scheduler.shutdown().await.unwrap();
    let at_shutdown = count.load(Ordering::SeqCst);
    assert!(at_shutdown >= 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(count.load(Ordering::SeqCst), at_shutdown);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_prevents_future_firings() {
    let mut scheduler = Scheduler::in_memory(fast_alarm());
    let count = counter(&scheduler, "ping");

    scheduler.start().unwrap();
    let id = scheduler.create_delay("ping", "subject-1", 1).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    scheduler.cancel(&id).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    scheduler.shutdown().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 0);
}
