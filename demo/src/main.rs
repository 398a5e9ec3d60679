// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Demo application on the hosted port.
//!
//! A two-process system showing the supervisory pattern the kernel is
//! built around: a worker process runs a 10 ms cyclic job under a 2 ms
//! execution budget, and a supervisor process -- at the unblockable
//! priority tier, holding the one suspend permission -- polls the
//! worker's failure counters once per 50 ms and pulls the plug when the
//! deadline violations pile up.
//!
//! The worker is written to go bad: every fourth activation takes 4 ms.
//! Run with `RUST_LOG=trace` to watch the kernel's own commentary.

use std::sync::atomic::{AtomicU32, Ordering};

use abi::{AbortCause, Pid, Priority, UNBLOCKABLE_PRIORITY};
use kern::arch::{budget_for_ms, busy_wait_ms, SimStack};
use kern::descs::{EventDesc, TaskDesc};
use kern::proc::{
    get_stack_reserve, get_task_failures, get_total_task_failures,
    is_process_suspended, sc_suspend_process,
};
use kern::sched::{
    get_no_activation_loss, scheduler_tick, system_time_ms,
};
use kern::startup::Config;

const WORKER: Pid = Pid(1);
const SUPERVISOR: Pid = Pid(2);

/// How many deadline overruns the supervisor tolerates before it
/// suspends the worker.
const DEADLINE_TOLERANCE: u32 = 3;

static ACTIVATIONS: AtomicU32 = AtomicU32::new(0);
static SUSPENDED_AT_MS: AtomicU32 = AtomicU32::new(0);

/// The worker's cyclic job. Nominally 1 ms of work; every fourth
/// activation takes 4 ms, which its 2 ms budget does not cover.
fn worker_job(_event: u32) -> i32 {
    let n = ACTIVATIONS.fetch_add(1, Ordering::Relaxed);
    if n % 4 == 3 {
        busy_wait_ms(4);
    } else {
        busy_wait_ms(1);
    }
    0
}

/// One-time setup in the worker process, before the scheduler starts.
fn worker_init(pid: u32) -> i32 {
    log::info!("worker init, process {pid}");
    0
}

/// The supervisory job: read the counters, enact policy.
fn supervise(_event: u32) -> i32 {
    let overruns = get_task_failures(WORKER, AbortCause::Deadline);
    if overruns > DEADLINE_TOLERANCE && !is_process_suspended(WORKER) {
        sc_suspend_process(WORKER);
        SUSPENDED_AT_MS.store(system_time_ms(), Ordering::Relaxed);
    }
    0
}

fn main() {
    env_logger::init();

    let worker_stack = SimStack::new(2048);
    let supervisor_stack = SimStack::new(2048);

    let mut cfg = Config::new();
    cfg.set_process_stack(WORKER, worker_stack.desc()).unwrap();
    cfg.set_process_stack(SUPERVISOR, supervisor_stack.desc())
        .unwrap();
    cfg.grant_permission_suspend_process(SUPERVISOR, WORKER)
        .unwrap();

    let work_event = cfg
        .create_event(EventDesc {
            period_ms: 10,
            first_activation_ms: 10,
            priority: Priority(3),
            min_trigger_pid: 0,
        })
        .unwrap();
    cfg.register_task(
        work_event,
        TaskDesc {
            entry: worker_job,
            budget: budget_for_ms(2),
            pid: WORKER,
        },
    )
    .unwrap();

    let watch_event = cfg
        .create_event(EventDesc {
            period_ms: 50,
            first_activation_ms: 50,
            priority: UNBLOCKABLE_PRIORITY,
            min_trigger_pid: 0,
        })
        .unwrap();
    cfg.register_task(
        watch_event,
        TaskDesc {
            entry: supervise,
            budget: 0,
            pid: SUPERVISOR,
        },
    )
    .unwrap();

    cfg.register_init_task(TaskDesc {
        entry: worker_init,
        budget: 0,
        pid: WORKER,
    })
    .unwrap();

    let _kernel = cfg.init_kernel().expect("static configuration rejected");

    // Half a second of simulated wall time, one timer interrupt per
    // millisecond.
    while system_time_ms() < 500 {
        scheduler_tick();
    }

    println!("after {} ms:", system_time_ms());
    println!(
        "  worker activations started:   {}",
        ACTIVATIONS.load(Ordering::Relaxed)
    );
    println!(
        "  worker activations lost:      {}",
        get_no_activation_loss(work_event)
    );
    println!(
        "  worker deadline overruns:     {}",
        get_task_failures(WORKER, AbortCause::Deadline)
    );
    println!(
        "  worker activations refused:   {}",
        get_task_failures(WORKER, AbortCause::ProcessAbort)
    );
    println!(
        "  worker failures, total:       {}",
        get_total_task_failures(WORKER)
    );
    println!(
        "  worker stack reserve:         {} bytes",
        get_stack_reserve(WORKER)
    );
    if is_process_suspended(WORKER) {
        println!(
            "  worker suspended at:          {} ms",
            SUSPENDED_AT_MS.load(Ordering::Relaxed)
        );
    } else {
        println!("  worker still running");
    }
    println!(
        "  supervisor failures:          {}",
        get_total_task_failures(SUPERVISOR)
    );
}
