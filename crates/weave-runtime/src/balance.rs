//! Task balancing between contexts
//!
//! Two mechanisms, both driven by the master loop:
//!
//! - `request_tasks`: a context with nothing to do asks the busiest peer
//!   for up to `steal_batch` tasks. At most one request is outstanding.
//! - `distribute_tasks`: a context holding more than
//!   `distribute_threshold` tasks pushes up to `distribute_batch` of them
//!   to the least loaded peer, as long as that peer holds less than half
//!   as many.
//!
//! Only tasks whose `reassign` hook agrees are moved. Tasks travel three
//! to a call, two words each.

use std::sync::atomic::Ordering;

use weave_core::constants::CALL_ARGS;
use weave_core::{ktrace, Task};

use crate::context::{Context, Counters};

const TASKS_PER_CALL: usize = CALL_ARGS / 2;

/// Ask the busiest peer for work
pub fn request_tasks(ctx: &Context) -> bool {
    if ctx.requested.get() || ctx.is_stopped() {
        return false;
    }
    let victim = ctx
        .peers()
        .filter(|p| !p.is_stopped())
        .map(|p| (p.task_count(), p))
        .filter(|(count, _)| *count > 0)
        .max_by_key(|(count, _)| *count);
    let Some((count, victim)) = victim else {
        return false;
    };
    ktrace!("context {} requests tasks from {} ({} queued)", ctx.index(), victim.index(), count);
    ctx.requested.set(true);
    victim.call(steal_tasks, [ctx.index() as usize, ctx.steal_batch, 0, 0, 0, 0]);
    true
}

/// Push surplus work to the least loaded peer. Returns tasks moved.
pub fn distribute_tasks(ctx: &Context) -> usize {
    let own = ctx.strand().tasks_len();
    if own <= ctx.distribute_threshold {
        return 0;
    }
    let least = ctx
        .peers()
        .filter(|p| !p.is_stopped())
        .map(|p| (p.task_count(), p))
        .min_by_key(|(count, _)| *count);
    let Some((count, target)) = least else {
        return 0;
    };
    if count >= own / 2 {
        return 0;
    }
    let n = ctx.distribute_batch.min((own - count) / 2);
    if n == 0 {
        return 0;
    }
    let moved = ship(ctx, target, ctx.strand().take_reassignable(n, target.index()));
    if moved > 0 {
        Counters::add(&ctx.counters.distributed, moved as u64);
        let _ = ctx.counters.first_distribute_round.compare_exchange(
            u64::MAX,
            ctx.round(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        ktrace!("context {} distributed {} tasks to {}", ctx.index(), moved, target.index());
    }
    moved
}

/// Send tasks to `target`, three per call
fn ship(_from: &Context, target: &Context, tasks: Vec<Task>) -> usize {
    let moved = tasks.len();
    for chunk in tasks.chunks(TASKS_PER_CALL) {
        let mut args = [0usize; CALL_ARGS];
        for (i, task) in chunk.iter().enumerate() {
            let [routine, arg] = task.to_words();
            args[2 * i] = routine;
            args[2 * i + 1] = arg;
        }
        target.call(receive_tasks, args);
    }
    moved
}

/// Runs on the victim: `[requester, max]`
fn steal_tasks(ctx: &Context, args: &[usize; CALL_ARGS]) {
    let requester = ctx.dispatcher().context(args[0] as u32);
    let tasks = ctx.strand().take_reassignable(args[1], requester.index());
    let moved = ship(ctx, requester, tasks);
    requester.call(steal_done, [moved, 0, 0, 0, 0, 0]);
}

/// Runs on the requester after its batch arrived
fn steal_done(ctx: &Context, args: &[usize; CALL_ARGS]) {
    ctx.requested.set(false);
    if args[0] > 0 {
        Counters::add(&ctx.counters.stolen, args[0] as u64);
    }
}

/// Up to three tasks; a zero routine word ends the batch
fn receive_tasks(ctx: &Context, args: &[usize; CALL_ARGS]) {
    for pair in args.chunks(2) {
        if pair[0] == 0 {
            break;
        }
        // Safety: the words were produced by `ship` from tasks that left
        // the sender's list.
        let task = unsafe { Task::from_words([pair[0], pair[1]]) };
        ctx.strand().add_task(task);
    }
}
