//! Stress test - many fibers, cross-context calls and tasks
//!
//! Spawns fibers round-robin over every context. Each fiber yields a
//! few times, pings the next context with an async call and asks it for
//! a value with a request. A batch of tasks queued on context 0 has to
//! spread through stealing and distribution.
//!
//! Usage:
//!     stress [fibers] [tasks]
//!
//! The runtime reads `WEAVE_*` variables, e.g. `WEAVE_CONTEXTS=8 stress`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weave::api::{self, CallRoutine};
use weave::{Context, Runtime, RuntimeConfig, Task};

static PINGS: AtomicU64 = AtomicU64::new(0);
static TASKS_RUN: AtomicU64 = AtomicU64::new(0);

fn ping(_ctx: &Context, args: &[usize; 6]) {
    PINGS.fetch_add(args[0] as u64, Ordering::Relaxed);
}

fn context_index(ctx: &Context, args: &[usize; 4]) -> usize {
    ctx.index() as usize + args[0]
}

fn main() {
    println!("=== weave Stress Test ===\n");

    let mut args = std::env::args().skip(1);
    let num_fibers: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10_000);
    let num_tasks: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(100_000);

    let config = RuntimeConfig::from_env();
    config.print();
    let contexts = config.contexts as u32;

    let mut runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.start() {
        eprintln!("start: {}", e);
        std::process::exit(1);
    }

    let completed = Arc::new(AtomicU64::new(0));
    let mismatches = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    println!("\nSpawning {} fibers over {} contexts...", num_fibers, contexts);
    for i in 0..num_fibers {
        let completed = completed.clone();
        let mismatches = mismatches.clone();
        let home = i as u32 % contexts;
        let spawned = runtime.spawn_on(home, move || {
            for _ in 0..10 {
                api::fiber_yield().ok();
            }
            let next = (home + 1) % contexts;
            if let Some(ctx) = api::context_selfptr() {
                api::call_1(ctx.dispatcher().context(next), ping as CallRoutine, 1);
            }
            match api::request(next, context_index, [1, 0, 0, 0]) {
                Ok(v) if v == next as usize + 1 => {}
                _ => {
                    mismatches.fetch_add(1, Ordering::Relaxed);
                }
            }
            completed.fetch_add(1, Ordering::Relaxed);
            Ok(0)
        });
        if let Err(e) = spawned {
            eprintln!("spawn {}: {}", i, e);
        }
    }
    let spawn_time = start.elapsed();

    println!("Queueing {} tasks on context 0...", num_tasks);
    for _ in 0..num_tasks {
        let task = Task::boxed(|| {
            TASKS_RUN.fetch_add(1, Ordering::Relaxed);
        });
        runtime.send_task(0, task).ok();
    }

    println!("\nWaiting for completion...");
    let run_start = Instant::now();
    loop {
        let fibers = completed.load(Ordering::Relaxed) as usize;
        let tasks = TASKS_RUN.load(Ordering::Relaxed) as usize;
        if fibers >= num_fibers && tasks >= num_tasks {
            break;
        }
        if run_start.elapsed() > Duration::from_secs(30) {
            println!("\nTimeout! fibers {}/{} tasks {}/{}", fibers, num_fibers, tasks, num_tasks);
            break;
        }
        print!("\rfibers: {}/{} tasks: {}/{}", fibers, num_fibers, tasks, num_tasks);
        std::thread::sleep(Duration::from_millis(100));
    }
    let total_time = start.elapsed();

    println!("\n\n=== Results ===");
    println!("Fibers completed: {}", completed.load(Ordering::Relaxed));
    println!("Pings received:   {}", PINGS.load(Ordering::Relaxed));
    println!("Bad requests:     {}", mismatches.load(Ordering::Relaxed));
    println!("Tasks run:        {}", TASKS_RUN.load(Ordering::Relaxed));
    println!("Spawn time:       {:?}", spawn_time);
    println!("Total time:       {:?}", total_time);
    println!(
        "Throughput:       {:.0} fibers/sec",
        num_fibers as f64 / total_time.as_secs_f64()
    );

    println!("\nctx   tasks   calls  stolen  distributed  first-distribute");
    for (i, s) in runtime.stats().iter().enumerate() {
        println!(
            "{:>3} {:>7} {:>7} {:>7} {:>12}  {:?}",
            i, s.tasks_executed, s.calls, s.stolen, s.distributed, s.first_distribute_round
        );
    }

    runtime.stop();
    runtime.join();
    println!("\n=== Stress Test Complete ===");
}
