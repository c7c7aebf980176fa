use std::sync::Arc;
use std::time::Duration;

use coalesce::{Deferred, DeferredError};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_producer_on_another_task() {
    coalesce_test::setup();

    let deferred = Arc::new(Deferred::<Arc<String>, Arc<String>>::new());
    let consumers: Vec<_> = (0..8).map(|_| tokio::spawn(deferred.promise())).collect();

    let producer = tokio::spawn({
        let deferred = Arc::clone(&deferred);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            deferred.resolve(Arc::new("ready".to_owned()))
        }
    });
    assert!(producer.await.unwrap());

    let values: Vec<_> = futures::future::join_all(consumers)
        .await
        .into_iter()
        .map(|consumer| consumer.unwrap().unwrap())
        .collect();
    assert!(values.iter().all(|value| Arc::ptr_eq(value, &values[0])));
    assert_eq!(values[0].as_str(), "ready");
}

#[tokio::test]
async fn test_racing_settlements_agree() {
    let deferred = Arc::new(Deferred::<usize, usize>::new());

    let settlers: Vec<_> = (0..16)
        .map(|i| {
            let deferred = Arc::clone(&deferred);
            tokio::spawn(async move {
                if i % 2 == 0 {
                    deferred.resolve(i)
                } else {
                    deferred.reject(i)
                }
            })
        })
        .collect();

    let winners = futures::future::join_all(settlers)
        .await
        .into_iter()
        .filter(|settled| *settled.as_ref().unwrap())
        .count();
    assert_eq!(winners, 1);

    let outcome = deferred.promise().await;
    assert_eq!(deferred.promise().await, outcome);
    assert!(matches!(outcome, Ok(_) | Err(DeferredError::Rejected(_))));
}
