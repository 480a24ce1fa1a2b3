//! Scheduler throughput benchmark
//!
//! Tests the target scenario: thousands of tasks flowing through the full
//! claim -> dispatch -> complete pipeline (Scheduler + WorkerPool + lock
//! manager + admission controller), not just the raw storage layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::runtime::Runtime;

use taskqueue_core::admission::{AdmissionController, AdmissionLimits};
use taskqueue_core::bench::{BenchmarkMetrics, BenchmarkReport, ReportConfig};
use taskqueue_core::dlq::{DeadLetterQueue, DlqConfig};
use taskqueue_core::lock::LockManager;
use taskqueue_core::scheduler::{Scheduler, SchedulerConfig};
use taskqueue_core::storage::{InMemoryStorage, Storage};
use taskqueue_core::task::{Priority, Task, TaskKind};
use taskqueue_core::worker::{Executor, ExecutorResult, WorkerPool, WorkerPoolConfig};

struct CountingExecutor {
    completed: Arc<AtomicU64>,
    schedule_to_start: Arc<taskqueue_core::bench::LatencyHistogram>,
    execution: Arc<taskqueue_core::bench::LatencyHistogram>,
    end_to_end: Arc<taskqueue_core::bench::LatencyHistogram>,
    tasks_completed: Arc<taskqueue_core::bench::ThroughputCounter>,
    enqueue_times: Arc<parking_lot::Mutex<std::collections::HashMap<uuid::Uuid, Instant>>>,
    simulate_execution: bool,
}

impl Executor for CountingExecutor {
    fn run(&self, task: Task) -> std::pin::Pin<Box<dyn std::future::Future<Output = ExecutorResult> + Send>> {
        let completed = self.completed.clone();
        let schedule_to_start = self.schedule_to_start.clone();
        let execution = self.execution.clone();
        let end_to_end = self.end_to_end.clone();
        let tasks_completed = self.tasks_completed.clone();
        let enqueue_times = self.enqueue_times.clone();
        let simulate_execution = self.simulate_execution;
        Box::pin(async move {
            let enqueue_time = enqueue_times.lock().get(&task.id).copied();
            if let Some(enqueue_time) = enqueue_time {
                schedule_to_start.record(enqueue_time.elapsed());
            }

            let exec_start = Instant::now();
            if simulate_execution {
                let micros = 1000 + rand::random::<u64>() % 9000;
                tokio::time::sleep(Duration::from_micros(micros)).await;
            }
            execution.record(exec_start.elapsed());

            if let Some(enqueue_time) = enqueue_time {
                end_to_end.record(enqueue_time.elapsed());
            }
            tasks_completed.increment();
            completed.fetch_add(1, Ordering::Relaxed);
            Ok(task.payload)
        })
    }
}

async fn run_scenario(
    name: &str,
    task_count: u64,
    worker_count: usize,
    simulate_execution: bool,
) -> Arc<BenchmarkMetrics> {
    let metrics = Arc::new(BenchmarkMetrics::new(name));
    println!("\nRunning: {}", name);
    println!("   Tasks: {}, Workers: {}, Simulate execution: {}", task_count, worker_count, simulate_execution);

    let storage = Arc::new(InMemoryStorage::new());
    let lock_manager = Arc::new(LockManager::new(storage.clone()));
    let admission = Arc::new(AdmissionController::new(AdmissionLimits {
        max_concurrent_total: worker_count * 4,
        ..Default::default()
    }));
    let dlq = Arc::new(DeadLetterQueue::new(storage.clone(), DlqConfig::default()));

    let completed = Arc::new(AtomicU64::new(0));
    let enqueue_times = Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new()));
    let executor: Arc<dyn Executor> = Arc::new(CountingExecutor {
        completed: completed.clone(),
        schedule_to_start: metrics.schedule_to_start.clone(),
        execution: metrics.execution.clone(),
        end_to_end: metrics.end_to_end.clone(),
        tasks_completed: metrics.tasks_completed.clone(),
        enqueue_times: enqueue_times.clone(),
        simulate_execution,
    });
    let worker_pool = Arc::new(WorkerPool::new(
        executor,
        WorkerPoolConfig { worker_min: worker_count, worker_max: worker_count, ..Default::default() },
    ));

    let scheduler = Arc::new(Scheduler::new(
        storage.clone(),
        lock_manager,
        admission,
        worker_pool.clone(),
        dlq,
        SchedulerConfig { max_concurrent_total: worker_count * 4, batch_size: worker_count * 4, ..Default::default() },
    ));

    let enqueue_start = Instant::now();
    for i in 0..task_count {
        let task = Task::new(TaskKind::Read, Priority::Normal, serde_json::json!({ "i": i }));
        enqueue_times.lock().insert(task.id, Instant::now());
        storage.save_task(task).await.unwrap();
    }
    println!(
        "   Enqueued {} tasks in {:.2}ms",
        task_count,
        enqueue_start.elapsed().as_secs_f64() * 1000.0
    );

    let pb = ProgressBar::new(task_count);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .unwrap()
            .progress_chars("=>-"),
    );

    let metrics_clone = metrics.clone();
    let sampling_handle = tokio::spawn(async move {
        loop {
            metrics_clone.sample();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    let run_start = Instant::now();
    loop {
        let current = completed.load(Ordering::Relaxed);
        pb.set_position(current);
        if current >= task_count {
            break;
        }
        scheduler.run_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let run_time = run_start.elapsed();

    sampling_handle.abort();
    metrics.sample();
    pb.finish_and_clear();

    let s2s = metrics.schedule_to_start.summary();
    println!("Completed in {:.2}s", run_time.as_secs_f64());
    println!("   Task throughput:   {:.1} tasks/sec", task_count as f64 / run_time.as_secs_f64());
    println!(
        "   Schedule-to-Start: P50={:.2}ms P99={:.2}ms",
        s2s.p50.as_secs_f64() * 1000.0,
        s2s.p99.as_secs_f64() * 1000.0
    );

    metrics
}

fn main() {
    let rt = Runtime::new().unwrap();

    println!("==================================================");
    println!("         Scheduler Throughput Benchmark");
    println!("==================================================");
    println!("\nDrives thousands of tasks through the full claim/dispatch/complete pipeline.");

    let small = rt.block_on(run_scenario("small_1k_tasks", 1_000, 10, false));
    let medium = rt.block_on(run_scenario("medium_10k_tasks", 10_000, 50, false));
    let target = rt.block_on(run_scenario("target_100k_tasks", 100_000, 100, false));
    let target_exec = rt.block_on(run_scenario("target_100k_tasks_exec", 100_000, 100, true));
    let high_parallel = rt.block_on(run_scenario("parallel_100k_tasks_200workers", 100_000, 200, false));

    println!("\n==================================================");
    println!("                    Summary");
    println!("==================================================");
    println!(
        "\n{:<30} {:>12} {:>12} {:>12}",
        "Scenario", "Tasks/sec", "P50 S2S", "P99 S2S"
    );
    println!("{:-<30} {:->12} {:->12} {:->12}", "", "", "", "");

    for (name, m) in [
        ("small_1k_tasks", &small),
        ("medium_10k_tasks", &medium),
        ("target_100k_tasks", &target),
        ("target_100k_tasks_exec", &target_exec),
        ("parallel_100k_tasks_200workers", &high_parallel),
    ] {
        let throughput = m.tasks_completed.throughput();
        let s2s = m.schedule_to_start.summary();
        println!(
            "{:<30} {:>10.1}/s {:>10.2}ms {:>10.2}ms",
            name,
            throughput,
            s2s.p50.as_secs_f64() * 1000.0,
            s2s.p99.as_secs_f64() * 1000.0
        );
    }

    println!("\nGenerating HTML reports...");
    let report_config = ReportConfig {
        output_dir: "target/benchmark-reports".to_string(),
        title: "Scheduler Throughput Benchmark".to_string(),
        include_raw_data: false,
    };

    for (name, m) in [("target_100k_tasks", &target), ("target_100k_tasks_exec", &target_exec), ("parallel_100k_tasks_200workers", &high_parallel)] {
        let report = BenchmarkReport::new(report_config.clone());
        match report.generate(m) {
            Ok(path) => println!("   {}: {}", name, path),
            Err(e) => println!("   {} failed: {}", name, e),
        }
    }

    println!("\n==================================================");
}
