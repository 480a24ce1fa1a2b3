//! Task claiming benchmark
//!
//! Benchmarks the critical path: task save → claim_one → complete.
//! This is the core scheduling performance metric.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use taskqueue_core::storage::{InMemoryStorage, Storage};
use taskqueue_core::task::{Priority, Task, TaskKind, TaskPatch, TaskStatus};

fn bench_claim_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/single");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1usize, 5, 10] {
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, &batch_size| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let store = Arc::new(InMemoryStorage::new());

                let task_count = (iters as usize * batch_size).max(100);
                for _ in 0..task_count {
                    store
                        .save_task(Task::new(TaskKind::Read, Priority::Normal, serde_json::json!({})))
                        .await
                        .unwrap();
                }

                let start = Instant::now();
                let mut claimed_total = 0usize;
                while claimed_total < task_count {
                    match store.claim_one().await.unwrap() {
                        Some(task) => {
                            store
                                .update_task(
                                    task.id,
                                    TaskPatch { status: Some(TaskStatus::Completed), ..Default::default() },
                                )
                                .await
                                .unwrap();
                            claimed_total += 1;
                        }
                        None => break,
                    }
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

fn bench_claim_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/concurrent");
    group.sample_size(20);

    for workers in [2usize, 4, 8] {
        let task_count = 5000u64;
        group.throughput(Throughput::Elements(task_count));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async move {
                let store = Arc::new(InMemoryStorage::new());
                for _ in 0..task_count {
                    store
                        .save_task(Task::new(TaskKind::Read, Priority::Normal, serde_json::json!({})))
                        .await
                        .unwrap();
                }

                let claimed_total = Arc::new(AtomicU64::new(0));
                let mut handles = Vec::new();
                for worker_id in 0..workers {
                    let store = store.clone();
                    let claimed_total = claimed_total.clone();
                    handles.push(tokio::spawn(async move {
                        loop {
                            if claimed_total.load(Ordering::Relaxed) >= task_count {
                                break;
                            }
                            match store.claim_one().await.unwrap() {
                                Some(task) => {
                                    store
                                        .update_task(
                                            task.id,
                                            TaskPatch {
                                                status: Some(TaskStatus::Completed),
                                                ..Default::default()
                                            },
                                        )
                                        .await
                                        .unwrap();
                                    claimed_total.fetch_add(1, Ordering::Relaxed);
                                }
                                None => tokio::task::yield_now().await,
                            }
                        }
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_save(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/save");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = Arc::new(InMemoryStorage::new());
            let start = Instant::now();
            for _ in 0..iters {
                store
                    .save_task(Task::new(TaskKind::Read, Priority::Normal, serde_json::json!({})))
                    .await
                    .unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Schedule-to-start latency: time from `save_task` to the moment a worker
/// successfully claims that same task.
fn bench_schedule_to_start(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/schedule_to_start");
    group.throughput(Throughput::Elements(100));

    for workers in [1usize, 4, 8, 16] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter_custom(|_iters| async move {
                let store = Arc::new(InMemoryStorage::new());
                let task_count = 100u64;

                let enqueue_times: Arc<parking_lot::Mutex<Vec<(uuid::Uuid, Instant)>>> =
                    Arc::new(parking_lot::Mutex::new(Vec::new()));

                for _ in 0..task_count {
                    let enqueue_time = Instant::now();
                    let task = Task::new(TaskKind::Read, Priority::Normal, serde_json::json!({}));
                    let id = task.id;
                    store.save_task(task).await.unwrap();
                    enqueue_times.lock().push((id, enqueue_time));
                }

                let total_latency = Arc::new(AtomicU64::new(0));
                let claimed_count = Arc::new(AtomicU64::new(0));

                let mut handles = Vec::new();
                for worker_id in 0..workers {
                    let store = store.clone();
                    let enqueue_times = enqueue_times.clone();
                    let total_latency = total_latency.clone();
                    let claimed_count = claimed_count.clone();
                    handles.push(tokio::spawn(async move {
                        loop {
                            if claimed_count.load(Ordering::Relaxed) >= task_count {
                                break;
                            }
                            match store.claim_one().await.unwrap() {
                                Some(task) => {
                                    let claim_time = Instant::now();
                                    if let Some((_, enqueue_time)) =
                                        enqueue_times.lock().iter().find(|(id, _)| *id == task.id)
                                    {
                                        let latency = claim_time.duration_since(*enqueue_time);
                                        total_latency.fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
                                    }
                                    store
                                        .update_task(
                                            task.id,
                                            TaskPatch {
                                                status: Some(TaskStatus::Completed),
                                                ..Default::default()
                                            },
                                        )
                                        .await
                                        .unwrap();
                                    claimed_count.fetch_add(1, Ordering::Relaxed);
                                }
                                None => tokio::task::yield_now().await,
                            }
                        }
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }

                let avg_latency_micros = total_latency.load(Ordering::Relaxed) / task_count.max(1);
                Duration::from_micros(avg_latency_micros)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_claim_single, bench_claim_concurrent, bench_save, bench_schedule_to_start);
criterion_main!(benches);
