use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use coalesce::{CacheConfig, CoalescingCache};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// How many requests are in flight at the same time.
    pub concurrency: usize,
    /// The size of the key space requests are spread over.
    pub keys: u64,
    /// How long a single retrieval takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Every key divisible by this fails to retrieve.
    #[serde(default)]
    pub fail_every: Option<u64>,
}

/// A workload together with the cache it is hammering.
pub struct PreparedWorkload {
    pub concurrency: usize,
    cache: CoalescingCache<u64, String, anyhow::Error>,
    keys: u64,
    latency: Duration,
    fail_every: Option<u64>,
    next_request: AtomicU64,
    retrievals: AtomicUsize,
}

impl PreparedWorkload {
    pub fn new(cache: CacheConfig, workload: Workload) -> Result<Self> {
        ensure!(workload.keys > 0, "workload `{}` needs at least one key", cache.name);
        ensure!(
            workload.concurrency > 0,
            "workload `{}` needs a concurrency of at least one",
            cache.name
        );
        ensure!(
            workload.fail_every != Some(0),
            "workload `{}` has `fail_every: 0`",
            cache.name
        );

        Ok(Self {
            concurrency: workload.concurrency,
            cache: CoalescingCache::new(cache),
            keys: workload.keys,
            latency: workload.latency,
            fail_every: workload.fail_every,
            next_request: AtomicU64::new(0),
            retrievals: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        self.cache.name()
    }

    /// Requests the next key of the workload, returning whether it was retrieved successfully.
    pub async fn process(&self) -> bool {
        let key = self.next_request.fetch_add(1, Ordering::Relaxed) % self.keys;
        let latency = self.latency;
        let fail_every = self.fail_every;

        let result = self
            .cache
            .get(key, |key| {
                self.retrievals.fetch_add(1, Ordering::Relaxed);
                async move {
                    tokio::time::sleep(latency).await;
                    match fail_every {
                        Some(n) if key % n == 0 => {
                            Err(anyhow::anyhow!("simulated failure for key {key}"))
                        }
                        _ => Ok(format!("value-{key}")),
                    }
                }
            })
            .await;

        if let Err(error) = &result {
            tracing::trace!(workload = self.name(), key, "{error}");
        }
        result.is_ok()
    }

    /// How many retrievals actually ran.
    pub fn retrievals(&self) -> usize {
        self.retrievals.load(Ordering::Relaxed)
    }

    /// How many distinct keys have been requested.
    pub fn keys_touched(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 8
                keys: 100
                latency: 20ms
              - concurrency: 2
                keys: 10
                latency: 1s
                fail_every: 3
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.workloads.len(), 2);
        assert_eq!(config.workloads[0].latency, Duration::from_millis(20));
        assert_eq!(config.workloads[0].fail_every, None);
        assert_eq!(config.workloads[1].fail_every, Some(3));
    }

    #[test]
    fn test_rejects_empty_key_space() {
        let workload = Workload {
            concurrency: 1,
            keys: 0,
            latency: Duration::ZERO,
            fail_every: None,
        };
        assert!(PreparedWorkload::new(CacheConfig::named("empty"), workload).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retrieves_each_key_once() {
        let workload = Workload {
            concurrency: 16,
            keys: 4,
            latency: Duration::from_millis(5),
            fail_every: Some(2),
        };
        let workload =
            Arc::new(PreparedWorkload::new(CacheConfig::named("test"), workload).unwrap());

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let workload = Arc::clone(&workload);
                tokio::spawn(async move { workload.process().await })
            })
            .collect();
        let successes = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|ok| *ok.as_ref().unwrap())
            .count();

        // keys 0 and 2 fail, keys 1 and 3 succeed, for 16 requests each
        assert_eq!(successes, 32);
        assert_eq!(workload.retrievals(), 4);
        assert_eq!(workload.keys_touched(), 4);
    }
}
