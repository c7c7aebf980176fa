use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use coalesce::CacheConfig;
use coalesce::config::Config;

use crate::workloads::{PreparedWorkload, WorkloadsConfig};

pub async fn perform_stresstest(
    config: &Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // every workload gets a cache of its own
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let cache = CacheConfig::named(format!("{}-{i}", config.cache.name));
            PreparedWorkload::new(cache, workload).map(Arc::new)
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure all the machinery is up
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                workload.process().await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if !workload.process().await {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                std::mem::take(&mut *task_durations)
            };

            (task_durations, failures.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (workload, task) in workloads.iter().zip(finished_tasks) {
        let (task_durations, failures) = task?;
        let name = workload.name();
        let concurrency = workload.concurrency;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {name} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s"
        );

        let retrievals = workload.retrievals();
        let keys = workload.keys_touched();
        println!("  retrievals: {retrievals}; keys: {keys}; failed operations: {failures}");
        if retrievals != keys {
            tracing::error!(
                workload = name,
                retrievals,
                keys,
                "retrievals were not coalesced"
            );
        }

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            task_durations
                .quantile(q)
                .ok()
                .flatten()
                .map(Duration::from_secs_f64)
                .unwrap_or_default()
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}
