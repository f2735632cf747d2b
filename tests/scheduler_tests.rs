//! Integration tests for queue admission, priority, and fairness.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use nn_gateway::scheduler::{Priority, QueueSettings, TaskQueue};
use nn_gateway::GatewayError;

fn settings(fair: bool) -> QueueSettings {
    QueueSettings {
        max_size: 50,
        warning_threshold: 40,
        task_timeout: Duration::from_secs(30),
        priority_enabled: true,
        fair_enabled: fair,
        fairness_window: 4,
        auto_cleanup: true,
    }
}

fn fill(queue: &TaskQueue, priorities: &[Priority]) {
    for &p in priorities {
        queue
            .enqueue(1, Bytes::from_static(b"task"), None, p)
            .unwrap();
    }
}

async fn drain_order(queue: &TaskQueue, n: usize) -> Vec<Priority> {
    let mut order = Vec::with_capacity(n);
    for _ in 0..n {
        order.push(queue.dequeue().await.unwrap().priority);
    }
    order
}

#[tokio::test]
async fn test_strict_priority_without_fairness() {
    use Priority::*;
    let queue = TaskQueue::new(settings(false));

    // 5 Normal, 1 Urgent, 4 Low.
    fill(&queue, &[Normal, Normal, Normal, Normal, Normal, Urgent, Low, Low, Low, Low]);

    let order = drain_order(&queue, 10).await;
    assert_eq!(
        order,
        vec![Urgent, Normal, Normal, Normal, Normal, Normal, Low, Low, Low, Low]
    );
}

#[tokio::test]
async fn test_fair_scheduling_rotates_to_lower_level() {
    use Priority::*;
    let queue = TaskQueue::new(settings(true));

    fill(&queue, &[Normal, Normal, Normal, Normal, Normal, Urgent, Low, Low, Low, Low]);

    // After 4 consecutive Normal pops, a Low slips in before the last
    // Normal.
    let order = drain_order(&queue, 10).await;
    assert_eq!(
        order,
        vec![Urgent, Normal, Normal, Normal, Normal, Low, Normal, Low, Low, Low]
    );
}

#[tokio::test]
async fn test_rejection_past_enforced_cap() {
    let mut cfg = settings(false);
    cfg.max_size = 3;
    let queue = TaskQueue::new(cfg);

    for _ in 0..3 {
        queue
            .enqueue(1, Bytes::from_static(b"task"), None, Priority::Normal)
            .unwrap();
    }
    let err = queue
        .enqueue(1, Bytes::from_static(b"task"), None, Priority::Normal)
        .unwrap_err();
    assert!(matches!(err, GatewayError::Capacity(_)));

    let stats = queue.stats();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.current_size, 3);
}

#[tokio::test]
async fn test_expired_tasks_report_timeout() {
    let mut cfg = settings(false);
    cfg.task_timeout = Duration::from_millis(20);
    let queue = TaskQueue::new(cfg);

    let (id, mut rx) = queue
        .enqueue(7, Bytes::from_static(b"task"), None, Priority::Normal)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Enqueueing sweeps (auto cleanup), expiring the stale task.
    queue
        .enqueue(7, Bytes::from_static(b"fresh"), None, Priority::Normal)
        .unwrap();
    match rx.try_recv().unwrap() {
        Err(GatewayError::Timeout(expired)) => assert_eq!(expired, id),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(queue.stats().expired, 1);
    assert_eq!(queue.current_size(), 1);
}

#[tokio::test]
async fn test_shutdown_unblocks_waiting_worker() {
    let queue = Arc::new(TaskQueue::new(settings(false)));
    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.dequeue().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.shutdown();
    assert!(waiter.await.unwrap().is_none());

    // No admission after shutdown.
    assert!(queue
        .enqueue(1, Bytes::from_static(b"late"), None, Priority::Normal)
        .is_err());
}

#[tokio::test]
async fn test_accounting_balances() {
    let queue = TaskQueue::new(settings(false));
    fill(&queue, &[Priority::Normal; 5]);

    for _ in 0..2 {
        queue.dequeue().await.unwrap();
        queue.mark_completed();
    }

    let stats = queue.stats();
    assert_eq!(stats.accepted, 5);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.current_size, 3);
    assert_eq!(
        stats.accepted,
        stats.completed + stats.expired + stats.rejected + stats.current_size as u64
    );
}
