// Throughput harness for the list implementations.
//
// Spawns workers that spin on a start flag, run a fixed-duration workload
// against a shared list, and report aggregate ops/sec. Run with e.g.:
//
//   list-bench --bench readonly --policy lock_free_rcu --num-threads 4 --runtime 5

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};

use oxilist::prelude::*;
use oxilist::sync::pause;

/// Number of elements preloaded for the read-only workload.
const READONLY_ELEMS: u64 = 100;

#[derive(Parser, Debug)]
#[clap(name = "list-bench", about = "Concurrent linked-list throughput benchmark")]
struct Args {
    /// Workload to run
    #[clap(long, value_enum)]
    bench: Workload,

    /// List implementation under test
    #[clap(long, value_enum)]
    policy: Policy,

    /// Number of worker threads
    #[clap(long, value_parser = clap::value_parser!(u64).range(1..))]
    num_threads: u64,

    /// Measurement duration in seconds
    #[clap(long, value_parser = clap::value_parser!(u64).range(1..))]
    runtime: u64,

    /// Print per-worker throughput in addition to the aggregate
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "snake_case")]
enum Workload {
    /// Readers snapshot a preloaded list by iterating it
    Readonly,
    /// Half the workers push, half pop
    Queue,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "snake_case")]
enum Policy {
    GlobalLock,
    PerNodeLock,
    LockFree,
    LockFreeRcu,
}

struct WorkerReport {
    name: String,
    ops: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let (reports, elapsed) = match args.policy {
        Policy::GlobalLock => run_bench::<GlobalLockList<u64>>(&args),
        Policy::PerNodeLock => run_bench::<PerNodeLockList<u64>>(&args),
        Policy::LockFree => run_bench::<LockFreeRcList<u64>>(&args),
        Policy::LockFreeRcu => run_bench::<LockFreeRcuList<u64>>(&args),
    };

    let elapsed_sec = elapsed.as_secs_f64();
    let total_ops: u64 = reports.iter().map(|report| report.ops).sum();
    if args.verbose {
        for report in &reports {
            println!(
                "{} : {} ops/sec",
                report.name,
                report.ops as f64 / elapsed_sec
            );
        }
        println!("aggregate : {} ops/sec", total_ops as f64 / elapsed_sec);
    } else {
        println!("{}", total_ops as f64 / elapsed_sec);
    }
}

fn run_bench<L>(args: &Args) -> (Vec<WorkerReport>, Duration)
where
    L: ConcurrentList<u64> + Default + Send + Sync + 'static,
{
    let list = Arc::new(L::default());

    if matches!(args.bench, Workload::Readonly) {
        for i in 0..READONLY_ELEMS {
            list.push_back(i);
        }
    }

    let start_flag = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for worker_id in 0..args.num_threads {
        let list = list.clone();
        let start_flag = start_flag.clone();
        let stop_flag = stop_flag.clone();
        let workload = args.bench;
        handles.push(thread::spawn(move || {
            while !start_flag.load(Ordering::Acquire) {
                pause();
            }
            let ops = match workload {
                Workload::Readonly => run_readonly(&*list, &stop_flag),
                Workload::Queue => run_queue(&*list, &stop_flag, worker_id),
            };
            WorkerReport {
                name: worker_name(workload, worker_id),
                ops,
            }
        }));
    }

    let started_at = Instant::now();
    start_flag.store(true, Ordering::Release);
    thread::sleep(Duration::from_secs(args.runtime));
    stop_flag.store(true, Ordering::Release);

    let reports: Vec<WorkerReport> = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker panicked"))
        .collect();
    (reports, started_at.elapsed())
}

fn worker_name(workload: Workload, worker_id: u64) -> String {
    match workload {
        Workload::Readonly => format!("reader-{worker_id}"),
        Workload::Queue if worker_id % 2 == 0 => format!("pusher-{worker_id}"),
        Workload::Queue => format!("popper-{worker_id}"),
    }
}

fn run_readonly<L: ConcurrentList<u64>>(list: &L, stop_flag: &AtomicBool) -> u64 {
    let mut ops = 0u64;
    while !stop_flag.load(Ordering::Acquire) {
        let snapshot: Vec<u64> = list.iter().collect();
        std::hint::black_box(snapshot);
        ops += 1;
    }
    ops
}

fn run_queue<L: ConcurrentList<u64>>(list: &L, stop_flag: &AtomicBool, worker_id: u64) -> u64 {
    let mut ops = 0u64;
    if worker_id % 2 == 0 {
        let mut next = worker_id << 32;
        while !stop_flag.load(Ordering::Acquire) {
            list.push_back(next);
            next += 1;
            ops += 1;
        }
    } else {
        while !stop_flag.load(Ordering::Acquire) {
            if list.try_pop_front().is_some() {
                ops += 1;
            } else {
                pause();
            }
        }
    }
    ops
}
