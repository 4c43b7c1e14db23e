//! Cross-instance properties of the distributed lock.
//!
//! These run against the in-memory lock store, which keeps the same
//! uniqueness invariant as the `cron_locks` primary key.

use std::sync::Arc;
use std::time::Duration;

use server_core::kernel::testing::MemoryLockStore;
use server_core::kernel::DistributedLock;

fn shared_lock(ttl: Duration) -> (Arc<DistributedLock>, Arc<MemoryLockStore>) {
    let store = Arc::new(MemoryLockStore::new());
    let lock = Arc::new(DistributedLock::new(store.clone(), ttl));
    (lock, store)
}

#[tokio::test]
async fn concurrent_acquires_have_exactly_one_winner() {
    let (lock, _store) = shared_lock(Duration::from_secs(60));

    let mut attempts = Vec::new();
    for i in 0..16 {
        let lock = Arc::clone(&lock);
        attempts.push(tokio::spawn(async move {
            lock.acquire("crawl_all_forums", &format!("instance-{}", i))
                .await
        }));
    }

    let results = futures::future::join_all(attempts).await;
    let winners = results
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn two_instances_in_same_lease_window() {
    // Two deployments race for the same job within one lease window.
    let store = Arc::new(MemoryLockStore::new());
    let instance_a = DistributedLock::new(store.clone(), Duration::from_secs(60));
    let instance_b = DistributedLock::new(store.clone(), Duration::from_secs(60));

    let (a, b) = tokio::join!(
        instance_a.acquire("crawl_all_forums", "A"),
        instance_b.acquire("crawl_all_forums", "B"),
    );
    assert!(a ^ b, "exactly one of the two instances must win");
}

#[tokio::test]
async fn loser_takes_over_after_expiry() {
    let (lock, _store) = shared_lock(Duration::from_millis(40));

    assert!(lock.acquire("crawl_all_forums", "A").await);
    assert!(!lock.acquire("crawl_all_forums", "B").await);

    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(lock.acquire("crawl_all_forums", "B").await);
    let lease = lock.info("crawl_all_forums").await.unwrap();
    assert_eq!(lease.instance_id, "B");
}

#[tokio::test]
async fn renewal_keeps_lease_alive_past_ttl() {
    let (lock, _store) = shared_lock(Duration::from_millis(60));

    assert!(lock.acquire("job", "A").await);
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock.renew("job", "A").await);
    }
    // Well past the original TTL, the lease is still held by A.
    assert!(!lock.acquire("job", "B").await);
    lock.release("job", "A").await;
    assert!(!lock.is_locked("job").await);
}

#[tokio::test]
async fn release_leaves_other_holders_untouched() {
    let (lock, store) = shared_lock(Duration::from_secs(60));

    assert!(lock.acquire("job", "A").await);
    lock.release("job", "B").await;
    assert_eq!(store.len(), 1);
    lock.release("job", "A").await;
    assert_eq!(store.len(), 0);
    // Releasing again never raises.
    lock.release("job", "A").await;
}
