use std::sync::Arc;
use std::time::Duration;

use tagbus::bus::queue::{CoalescingQueue, QueuedSet};
use tagbus::periodic::{Backoff, Periodic};
use tagbus::protocol::Value;

fn set(v: i64, t: u64) -> QueuedSet {
    QueuedSet {
        value: Value::Int(v),
        time_us: t,
    }
}

#[test]
fn updates_for_one_tag_coalesce_to_the_newest() {
    let queue = CoalescingQueue::new(16);
    queue.push("IntVal", set(1, 10));
    queue.push("IntVal", set(2, 20));
    queue.push("IntVal", set(3, 30));
    assert_eq!(queue.len(), 1);

    let (name, popped) = queue.try_pop().expect("one entry");
    assert_eq!(name, "IntVal");
    assert_eq!(popped.value, Value::Int(3));
    assert_eq!(popped.time_us, 30);
    assert!(queue.try_pop().is_none());
}

#[test]
fn distinct_tags_pop_in_push_order() {
    let queue = CoalescingQueue::new(16);
    queue.push("A", set(1, 1));
    queue.push("B", set(2, 2));
    queue.push("A", set(3, 3)); // coalesces, keeps A's slot
    queue.push("C", set(4, 4));

    let order: Vec<String> = std::iter::from_fn(|| queue.try_pop().map(|(name, _)| name)).collect();
    assert_eq!(order, vec!["A", "B", "C"]);
}

#[test]
fn overflow_evicts_the_oldest_tag() {
    let queue = CoalescingQueue::new(2);
    queue.push("A", set(1, 1));
    queue.push("B", set(2, 2));
    queue.push("C", set(3, 3));

    assert_eq!(queue.len(), 2);
    let order: Vec<String> = std::iter::from_fn(|| queue.try_pop().map(|(name, _)| name)).collect();
    assert_eq!(order, vec!["B", "C"]);
}

#[tokio::test]
async fn pop_wakes_on_push() {
    let queue = Arc::new(CoalescingQueue::new(4));
    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.pop().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.push("IntVal", set(7, 70));

    let (name, popped) = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("pop woke")
        .expect("task ok");
    assert_eq!(name, "IntVal");
    assert_eq!(popped.time_us, 70);
}

#[test]
fn backoff_grows_to_the_cap_and_resets() {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
    let mut cap = Duration::from_millis(100);
    for _ in 0..12 {
        let wait = backoff.next();
        assert!(wait <= cap, "wait {:?} above cap {:?}", wait, cap);
        cap = (cap * 2).min(Duration::from_secs(30));
    }
    // Well past doubling range the cap pins at the maximum.
    for _ in 0..8 {
        assert!(backoff.next() <= Duration::from_secs(30));
    }

    backoff.reset();
    assert!(backoff.next() <= Duration::from_millis(100));
}

#[tokio::test]
async fn periodic_fires_repeatedly_and_stops() {
    let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let periodic = {
        let count = count.clone();
        Periodic::spawn(Duration::from_millis(25), move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(160)).await;
    let fired = count.load(std::sync::atomic::Ordering::SeqCst);
    assert!(fired >= 3, "expected several ticks, got {}", fired);

    periodic.stop();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let after_stop = count.load(std::sync::atomic::Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(after_stop, count.load(std::sync::atomic::Ordering::SeqCst));
}
