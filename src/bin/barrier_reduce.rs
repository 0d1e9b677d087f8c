//! Sum-reduction barrier driver.
//!
//! Spawns one child task per CPU. Child `i`, for each iteration `k`,
//! arrives at the barrier with the value `(k+1)*(i+1)` and advances.
//! After each generation the parent (and the matching child) reads the
//! result and checks it against `42 + (k+1)*N*(N+1)/2`. Exits 0 on
//! success, 1 on any mismatch.

use clap::Parser;
use lockstep::{
    runtime, Barrier, Event, ProcessorKind, ReductionOp, ReductionOpId, RunStyle, Runtime,
    RuntimeConfig, TaskContext, TaskFuncId, TASK_ID_FIRST_AVAILABLE,
};
use serde::{Deserialize, Serialize};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};

const TOP_LEVEL_TASK: TaskFuncId = TASK_ID_FIRST_AVAILABLE;
const CHILD_TASK: TaskFuncId = TASK_ID_FIRST_AVAILABLE + 1;

const REDOP_ADD: ReductionOpId = 1;
const BARRIER_INITIAL_VALUE: i32 = 42;

static ERRORS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct ChildTaskArgs {
    num_iters: u64,
    index: u64,
    barrier: Barrier,
}

fn expected_result(num_iters: u64, iter: u64) -> i32 {
    BARRIER_INITIAL_VALUE + ((iter + 1) * num_iters * (num_iters + 1) / 2) as i32
}

/// Reads the generation's result, waiting for publication if needed.
fn read_result(rt: &Runtime, b: &Barrier) -> Option<i32> {
    let mut out = [0_u8; 4];
    match b.get_result(rt, &mut out) {
        Ok(true) => return Some(i32::from_le_bytes(out)),
        Ok(false) => {}
        Err(err) => {
            tracing::error!(%err, barrier = %b.id, gen = b.gen, "get_result failed");
            return None;
        }
    }
    if let Err(err) = b.wait(rt) {
        tracing::error!(%err, barrier = %b.id, gen = b.gen, "barrier wait failed");
        return None;
    }
    match b.get_result(rt, &mut out) {
        Ok(true) => Some(i32::from_le_bytes(out)),
        Ok(false) => {
            tracing::error!(barrier = %b.id, gen = b.gen, "result not ready after wait");
            None
        }
        Err(err) => {
            tracing::error!(%err, barrier = %b.id, gen = b.gen, "get_result failed");
            None
        }
    }
}

fn check_result(who: &str, num_iters: u64, iter: u64, result: Option<i32>) {
    let expected = expected_result(num_iters, iter);
    match result {
        Some(value) if value == expected => {
            tracing::info!(who, iter, value, "result OK");
        }
        Some(value) => {
            tracing::error!(who, iter, value, expected, "result MISMATCH");
            ERRORS.fetch_add(1, Ordering::SeqCst);
        }
        None => {
            ERRORS.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn child_task(ctx: &TaskContext, args: &[u8]) {
    let rt = ctx.runtime();
    let child_args: ChildTaskArgs = match rmp_serde::from_slice(args) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!(%err, "child task got undecodable args");
            ERRORS.fetch_add(1, Ordering::SeqCst);
            return;
        }
    };
    tracing::info!(index = child_args.index, proc = %ctx.proc().id, "child task starting");

    let mut b = child_args.barrier;
    for i in 0..child_args.num_iters {
        let reduce_val = ((i + 1) * (child_args.index + 1)) as i32;
        if let Err(err) = b.arrive(rt, 1, Event::NO_EVENT, Some(&reduce_val.to_le_bytes())) {
            tracing::error!(%err, iter = i, "arrival failed");
            ERRORS.fetch_add(1, Ordering::SeqCst);
        }

        // Is it our turn to read the barrier?
        if i == child_args.index {
            let result = read_result(rt, &b);
            check_result("child", child_args.num_iters, i, result);
        }

        b = b.advance_barrier();
    }

    tracing::info!(index = child_args.index, "child task ending");
}

fn top_level_task(ctx: &TaskContext, _args: &[u8]) {
    let rt = ctx.runtime();
    let cpus = rt.machine().processors_of_kind(ProcessorKind::Cpu);
    let count = cpus.len() as u64;
    tracing::info!(cpus = count, "top level task creating barrier");

    let b = match Barrier::create_barrier(
        rt,
        count,
        Some(REDOP_ADD),
        &BARRIER_INITIAL_VALUE.to_le_bytes(),
    ) {
        Ok(b) => b,
        Err(err) => {
            tracing::error!(%err, "barrier creation failed");
            ERRORS.fetch_add(1, Ordering::SeqCst);
            rt.shutdown();
            return;
        }
    };

    let mut task_events = Vec::new();
    for (i, cpu) in cpus.iter().enumerate() {
        let args = ChildTaskArgs {
            num_iters: count,
            index: i as u64,
            barrier: b,
        };
        let encoded = match rmp_serde::to_vec(&args) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(%err, "child args encoding failed");
                ERRORS.fetch_add(1, Ordering::SeqCst);
                continue;
            }
        };
        match cpu.spawn(rt, CHILD_TASK, &encoded, Event::NO_EVENT) {
            Ok(finish) => task_events.push(finish),
            Err(err) => {
                tracing::error!(%err, index = i, "child spawn failed");
                ERRORS.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    tracing::info!(tasks = task_events.len(), "children launched");

    // Read each generation's result as it publishes.
    let mut parent_b = b;
    for i in 0..count {
        let result = read_result(rt, &parent_b);
        check_result("parent", count, i, result);
        parent_b = parent_b.advance_barrier();
    }

    // Wait for all children before tearing the barrier down.
    match Event::merge_events(rt, &task_events) {
        Ok(merged) => {
            tracing::info!(merged = %merged.id, gen = merged.gen, "waiting on merged event");
            if let Err(err) = merged.wait(rt) {
                tracing::error!(%err, "merged event wait failed");
                ERRORS.fetch_add(1, Ordering::SeqCst);
            }
        }
        Err(err) => {
            tracing::error!(%err, "event merge failed");
            ERRORS.fetch_add(1, Ordering::SeqCst);
        }
    }

    if let Err(err) = b.destroy_barrier(rt) {
        tracing::error!(%err, "barrier destroy failed");
        ERRORS.fetch_add(1, Ordering::SeqCst);
    }

    if ERRORS.load(Ordering::SeqCst) == 0 {
        tracing::info!("done!");
    } else {
        tracing::error!("exiting with errors");
    }

    // Shut down through the installed runtime, falling back to the
    // task's own handle outside the driver path.
    match runtime::current() {
        Some(installed) => installed.shutdown(),
        None => rt.shutdown(),
    }
}

#[derive(Parser, Debug)]
#[command(name = "barrier_reduce", about = "Sum-reduction barrier check")]
struct Cli {
    /// CPU processors to run with.
    #[arg(long, default_value_t = 4)]
    cpus: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let cli = Cli::parse();

    let config = RuntimeConfig::new().cpus_per_node(cli.cpus);
    let rt = match Runtime::init(&config) {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(%err, "runtime init failed");
            return ExitCode::FAILURE;
        }
    };

    let setup = rt
        .register_task(TOP_LEVEL_TASK, top_level_task)
        .and_then(|()| rt.register_task(CHILD_TASK, child_task))
        .and_then(|()| rt.register_reduction(ReductionOp::int_add(REDOP_ADD)))
        .and_then(|()| runtime::install(&rt));
    if let Err(err) = setup {
        tracing::error!(%err, "runtime setup failed");
        return ExitCode::FAILURE;
    }

    if let Err(err) = rt.run(TOP_LEVEL_TASK, RunStyle::OneTaskOnly, &[], false) {
        tracing::error!(%err, "run failed");
        return ExitCode::FAILURE;
    }
    runtime::uninstall();

    if ERRORS.load(Ordering::SeqCst) == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
