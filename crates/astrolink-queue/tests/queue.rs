//! Integration tests for the queue actor: ordering, exclusivity, and
//! cancellation, all exercised through real spawned tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use astrolink_queue::{Priority, QueueError, spawn_queue};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

#[tokio::test(start_paused = true)]
async fn test_acquire_grants_highest_priority_first() {
    let (_cancel, cancelled) = watch::channel(false);
    let queue = spawn_queue(cancelled);

    // Hold the slot so every worker queues up behind it.
    let gate = queue.acquire(Priority::Critical, "gate").await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    for (priority, name, delay_ms) in [
        (Priority::Low, "low", 1u64),
        (Priority::Critical, "critical", 2),
        (Priority::Normal, "normal", 3),
    ] {
        let queue = queue.clone();
        let order = Arc::clone(&order);
        workers.push(tokio::spawn(async move {
            sleep(Duration::from_millis(delay_ms)).await;
            let permit = queue.acquire(priority, name).await.unwrap();
            order.lock().unwrap().push(name);
            drop(permit);
        }));
    }

    sleep(Duration::from_millis(20)).await;
    drop(gate);

    for worker in workers {
        worker.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["critical", "normal", "low"]);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_same_priority_is_fifo() {
    let (_cancel, cancelled) = watch::channel(false);
    let queue = spawn_queue(cancelled);

    let gate = queue.acquire(Priority::Critical, "gate").await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut workers = Vec::new();
    for (i, name) in ["t0", "t1", "t2", "t3"].into_iter().enumerate() {
        let queue = queue.clone();
        let order = Arc::clone(&order);
        workers.push(tokio::spawn(async move {
            // Staggered so arrival order is deterministic.
            sleep(Duration::from_millis(i as u64 + 1)).await;
            let permit = queue.acquire(Priority::Normal, name).await.unwrap();
            order.lock().unwrap().push(name);
            drop(permit);
        }));
    }

    sleep(Duration::from_millis(20)).await;
    drop(gate);

    for worker in workers {
        worker.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["t0", "t1", "t2", "t3"]);
}

#[tokio::test(start_paused = true)]
async fn test_held_permit_blocks_higher_priority() {
    let (_cancel, cancelled) = watch::channel(false);
    let queue = spawn_queue(cancelled);

    // Simulates an open transaction: the permit stays held across calls.
    let transaction = queue.acquire(Priority::Normal, "transaction").await.unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&entered);
    let contender = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let permit = queue.acquire(Priority::Critical, "urgent").await.unwrap();
            flag.store(true, Ordering::SeqCst);
            drop(permit);
        })
    };

    sleep(Duration::from_millis(50)).await;
    assert!(
        !entered.load(Ordering::SeqCst),
        "critical task ran inside the exclusive window"
    );

    drop(transaction);
    contender.await.unwrap();
    assert!(entered.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_fails_queued_tasks_without_running_them() {
    let (cancel, cancelled) = watch::channel(false);
    let queue = spawn_queue(cancelled);

    let running = queue.acquire(Priority::Normal, "running").await.unwrap();

    let mut queued = Vec::new();
    for i in 0..3 {
        let queue = queue.clone();
        queued.push(tokio::spawn(async move {
            queue.acquire(Priority::Normal, format!("queued-{i}")).await
        }));
    }
    sleep(Duration::from_millis(10)).await;

    cancel.send_replace(true);

    for task in queued {
        assert_eq!(task.await.unwrap().unwrap_err(), QueueError::Inactive);
    }

    // The task holding the slot is unaffected and releases normally.
    drop(running);

    // Submissions after cancellation are refused outright.
    let err = queue.acquire(Priority::Critical, "late").await.unwrap_err();
    assert_eq!(err, QueueError::Inactive);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_counts_waiters_per_priority() {
    let (_cancel, cancelled) = watch::channel(false);
    let queue = spawn_queue(cancelled);

    let empty = queue.snapshot().await.unwrap();
    assert_eq!(empty.total(), 0);
    assert!(empty.running.is_none());

    let gate = queue.acquire(Priority::Normal, "refresh").await.unwrap();
    for (priority, name) in [
        (Priority::Low, "poll-a"),
        (Priority::Low, "poll-b"),
        (Priority::Critical, "defend"),
    ] {
        let queue = queue.clone();
        tokio::spawn(async move {
            let _ = queue.acquire(priority, name).await;
        });
    }
    sleep(Duration::from_millis(10)).await;

    let overview = queue.snapshot().await.unwrap();
    assert_eq!(overview.low, 2);
    assert_eq!(overview.normal, 0);
    assert_eq!(overview.critical, 1);
    assert_eq!(overview.total(), 3);
    assert_eq!(overview.running.as_deref(), Some("refresh"));

    drop(gate);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_waiter_is_skipped() {
    let (_cancel, cancelled) = watch::channel(false);
    let queue = spawn_queue(cancelled);

    let gate = queue.acquire(Priority::Normal, "gate").await.unwrap();

    // This caller gives up before the slot frees; its earlier queue
    // position must not block anyone behind it.
    let impatient = {
        let queue = queue.clone();
        tokio::spawn(async move {
            timeout(
                Duration::from_millis(5),
                queue.acquire(Priority::Normal, "impatient"),
            )
            .await
        })
    };
    sleep(Duration::from_millis(1)).await;

    let patient = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.acquire(Priority::Normal, "patient").await })
    };

    sleep(Duration::from_millis(10)).await;
    assert!(
        impatient.await.unwrap().is_err(),
        "impatient caller should have timed out"
    );

    drop(gate);
    let permit = patient.await.unwrap().unwrap();
    drop(permit);
}
