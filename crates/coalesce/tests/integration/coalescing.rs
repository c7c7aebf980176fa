use std::sync::Arc;
use std::time::Duration;

use coalesce::{CacheConfig, CoalescingCache, EntryStatus};
use coalesce_test::{Retrievals, TestError};

type SharedCache = Arc<CoalescingCache<String, String, TestError>>;

fn setup_cache() -> SharedCache {
    coalesce_test::setup();
    Arc::new(CoalescingCache::new(CacheConfig::named("integration")))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_retrieval() {
    let cache = setup_cache();
    let retrievals = Retrievals::new();
    let slow = retrievals.succeed_after(Duration::from_millis(50), "value-1");

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let slow = slow.clone();
            tokio::spawn(async move { cache.get("k".to_owned(), slow).await })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|task| task.unwrap().unwrap())
        .collect();

    assert_eq!(retrievals.count(), 1);
    for value in &results {
        assert_eq!(value.as_str(), "value-1");
        assert!(Arc::ptr_eq(value, &results[0]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_is_replayed_to_everyone() {
    let cache = setup_cache();
    let retrievals = Retrievals::new();
    let failing = retrievals.fail_after(Duration::from_millis(20), "boom");

    let first = tokio::spawn({
        let cache = Arc::clone(&cache);
        let failing = failing.clone();
        async move { cache.get("k".to_owned(), failing).await }
    });
    let second = tokio::spawn({
        let cache = Arc::clone(&cache);
        let failing = failing.clone();
        async move { cache.get("k".to_owned(), failing).await }
    });

    let first = first.await.unwrap().unwrap_err();
    let second = second.await.unwrap().unwrap_err();
    assert_eq!(*first, TestError("boom".into()));
    assert!(Arc::ptr_eq(&first, &second));

    // a later caller with a perfectly good retrieval still sees the stored error
    let healthy = Retrievals::new();
    let third = cache
        .get("k".to_owned(), healthy.succeed("fine"))
        .await
        .unwrap_err();
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!((retrievals.count(), healthy.count()), (1, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_keys_many_callers() {
    let cache = setup_cache();
    let retrievals = Retrievals::new();

    let tasks: Vec<_> = (0..200)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let key = format!("key-{}", i % 10);
            let retrieve = retrievals.succeed_after(Duration::from_millis(5), key.clone());
            tokio::spawn(async move {
                let value = cache.get(key.clone(), retrieve).await.unwrap();
                assert_eq!(*value, key);
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    assert_eq!(retrievals.count(), 10);
    assert_eq!(cache.len(), 10);
    assert_eq!(cache.status(&"key-3".to_owned()), Some(EntryStatus::Done));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aborted_populator_is_taken_over() {
    let cache = setup_cache();
    let stuck = Retrievals::new();
    let takeover = Retrievals::new();

    let populator = tokio::spawn({
        let cache = Arc::clone(&cache);
        let retrieve = stuck.succeed_after(Duration::from_secs(3600), "never");
        async move { cache.get("k".to_owned(), retrieve).await }
    });

    while cache.status(&"k".to_owned()) != Some(EntryStatus::InProgress) {
        tokio::task::yield_now().await;
    }

    let waiter = tokio::spawn({
        let cache = Arc::clone(&cache);
        let retrieve = takeover.succeed_after(Duration::from_millis(10), "taken over");
        async move { cache.get("k".to_owned(), retrieve).await }
    });

    populator.abort();
    assert!(populator.await.unwrap_err().is_cancelled());

    let value = waiter.await.unwrap().unwrap();
    assert_eq!(value.as_str(), "taken over");
    assert_eq!((stuck.count(), takeover.count()), (1, 1));
}
