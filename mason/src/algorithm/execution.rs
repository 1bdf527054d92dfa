// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Recipe execution.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{error, trace};

use crate::action::{Action, ExecutionMode};
use crate::context::Context;
use crate::mtime::Timestamp;
use crate::phase::{Phase, PhaseGuard};
use crate::rule::Error;
use crate::scheduler::CompletionToken;
use crate::sync;
use crate::target::{Target, TargetState, offset};

/// Start executing a target on the scheduler.
pub fn execute_async(ctx: &Arc<Context>, action: Action, target: &Arc<Target>, token: CompletionToken) {
    let task_ctx = Arc::clone(ctx);
    let target = Arc::clone(target);

    ctx.scheduler.spawn(move || {
        let _token = token;
        if let Err(e) = execute(&task_ctx, action, &target) {
            error!(target = %target, error = %super::matching::error_chain(&e), "execute failed");
        }
    });
}

/// Execute a target as one of its dependents.
///
/// Decrements the dependents countdown; in `last` mode only the final
/// dependent runs the recipe (earlier callers get `Postponed`), in
/// `first` mode the first caller runs it and the rest wait.
pub fn execute(ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<TargetState, Error> {
    let phase = ctx.phases.lock(Phase::Execute);

    let slot = target.op(action);
    let previous = slot.dependents.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous > 0, "execute without registered dependent");

    if action.mode() == ExecutionMode::Last && previous > 1 {
        return Ok(TargetState::Postponed);
    }

    execute_impl(ctx, &phase, action, target)
}

/// Execute a target outside the dependents protocol.
///
/// Used for direct updates (a generated header materialized during
/// match) where the caller is not a registered dependent.
pub fn execute_direct(ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<TargetState, Error> {
    let phase = ctx.phases.lock(Phase::Execute);
    execute_impl(ctx, &phase, action, target)
}

fn execute_impl(
    ctx: &Arc<Context>,
    phase: &PhaseGuard<'_>,
    action: Action,
    target: &Arc<Target>,
) -> Result<TargetState, Error> {
    let slot = target.op(action);
    let base = ctx.count_base();

    loop {
        let current = slot.task_count.load(Ordering::Acquire);

        if current == base + offset::BUSY {
            park(ctx, phase, action, target);
            continue;
        }

        if current >= base + offset::EXECUTED {
            return finished(target, action);
        }

        debug_assert!(current >= base + offset::APPLIED, "executing unmatched target");

        if slot
            .task_count
            .compare_exchange(current, base + offset::BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }

        // We own the transition
        let result = run_recipe(ctx, action, target);

        let state = match &result {
            Ok(state) => *state,
            Err(_) => TargetState::Failed,
        };
        slot.set_state(state);
        slot.task_count.store(base + offset::EXECUTED, Ordering::Release);
        ctx.monitors.notify(sync::key_of(&slot.task_count));

        return result;
    }
}

fn run_recipe(ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<TargetState, Error> {
    let recipe = target.op(action).recipe();

    let state = match recipe {
        Some(recipe) => recipe(ctx, action, target)?,
        None => TargetState::Unchanged,
    };

    trace!(target = %target, state = %state, "executed");
    Ok(state)
}

fn finished(target: &Target, action: Action) -> Result<TargetState, Error> {
    match target.state(action) {
        TargetState::Failed => Err(Error::Failed {
            target: target.to_string(),
        }),
        state => Ok(state),
    }
}

fn park(ctx: &Context, phase: &PhaseGuard<'_>, action: Action, target: &Target) {
    let slot = target.op(action);
    let base = ctx.count_base();

    if ctx.scheduler.help() {
        return;
    }

    phase.unlocked(|| {
        ctx.monitors.wait_until(sync::key_of(&slot.task_count), || {
            slot.task_count.load(Ordering::Acquire) != base + offset::BUSY
        });
    });
}

/// Block until a target's recipe has run, returning its state.
pub fn wait_executed(ctx: &Arc<Context>, phase: &PhaseGuard<'_>, action: Action, target: &Arc<Target>) -> TargetState {
    let slot = target.op(action);
    let base = ctx.count_base();

    while slot.task_count.load(Ordering::Acquire) < base + offset::EXECUTED
        || slot.task_count.load(Ordering::Acquire) == base + offset::BUSY
    {
        if ctx.scheduler.help() {
            continue;
        }

        phase.unlocked(|| {
            ctx.monitors.wait_until(sync::key_of(&slot.task_count), || {
                let v = slot.task_count.load(Ordering::Acquire);
                v >= base + offset::EXECUTED && v != base + offset::BUSY
            });
        });
    }

    target.state(action)
}

/// Should this entry participate in execution?
fn executes(entry: &crate::target::PrerequisiteTarget) -> bool {
    // Unmatched entries were let go of; data-marked ones were already
    // updated by the rule during match
    !entry.unmatched && entry.data == 0
}

/// Execute prerequisites in declaration order, concurrently.
pub fn straight_execute_prerequisites(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
) -> Result<TargetState, Error> {
    let phase = ctx.phases.lock(Phase::Execute);
    let entries = target
        .op(action)
        .prerequisite_targets
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    {
        let wait = crate::scheduler::WaitGuard::new(Arc::clone(&ctx.monitors));
        for entry in entries.iter().filter(|e| executes(e)) {
            execute_async(ctx, action, &entry.target, wait.start());
        }
        wait.wait(&ctx.scheduler, &phase);
    }

    let mut combined = TargetState::Unchanged;
    for entry in entries.iter().filter(|e| executes(e)) {
        match wait_executed(ctx, &phase, action, &entry.target) {
            TargetState::Failed => {
                return Err(Error::PrerequisiteFailed {
                    target: target.to_string(),
                    prerequisite: entry.target.to_string(),
                });
            }
            TargetState::Changed => combined = TargetState::Changed,
            _ => {}
        }
    }

    Ok(combined)
}

/// Execute prerequisites in reverse declaration order, serially.
///
/// Clean runs through here so that contents go before their directories.
pub fn reverse_execute_prerequisites(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
) -> Result<TargetState, Error> {
    let phase = ctx.phases.lock(Phase::Execute);
    let entries = target
        .op(action)
        .prerequisite_targets
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let mut combined = TargetState::Unchanged;
    for entry in entries.iter().rev().filter(|e| executes(e)) {
        execute(ctx, action, &entry.target)?;

        match wait_executed(ctx, &phase, action, &entry.target) {
            TargetState::Failed => {
                return Err(Error::PrerequisiteFailed {
                    target: target.to_string(),
                    prerequisite: entry.target.to_string(),
                });
            }
            TargetState::Changed => combined = TargetState::Changed,
            _ => {}
        }
    }

    Ok(combined)
}

/// Execute prerequisites and decide whether the target is out of date.
///
/// Returns `Some(combined_state)` when the target at mtime `mt` is still
/// current, `None` when some prerequisite renders it out of date.
/// Entries flagged `adhoc` or `unmatched` are excluded from the
/// comparison (but adhoc ones still execute).
pub fn execute_prerequisites(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
    mt: Timestamp,
) -> Result<Option<TargetState>, Error> {
    let phase = ctx.phases.lock(Phase::Execute);
    let entries = target
        .op(action)
        .prerequisite_targets
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    {
        let wait = crate::scheduler::WaitGuard::new(Arc::clone(&ctx.monitors));
        for entry in entries.iter().filter(|e| executes(e)) {
            execute_async(ctx, action, &entry.target, wait.start());
        }
        wait.wait(&ctx.scheduler, &phase);
    }

    let mut combined = TargetState::Unchanged;
    let mut out_of_date = mt == Timestamp::NONEXISTENT;

    for entry in entries.iter().filter(|e| executes(e)) {
        let state = wait_executed(ctx, &phase, action, &entry.target);

        if state == TargetState::Failed {
            return Err(Error::PrerequisiteFailed {
                target: target.to_string(),
                prerequisite: entry.target.to_string(),
            });
        }
        if state == TargetState::Changed {
            combined = TargetState::Changed;
        }

        if entry.adhoc || entry.unmatched {
            continue;
        }

        if state == TargetState::Changed {
            out_of_date = true;
        } else if mt.is_real() {
            let pmt = entry.target.effective_mtime(action);
            if pmt.is_real() && pmt > mt {
                out_of_date = true;
            }
        }
    }

    Ok(if out_of_date { None } else { Some(combined) })
}

/// Match-time prerequisite update (the dyndep fast path).
///
/// Temporarily switches to the execute phase, runs the target's recipe
/// directly, and reports whether the result renders a dependent with
/// mtime `ts` out of date.
pub fn update_during_match(
    ctx: &Arc<Context>,
    phase: &PhaseGuard<'_>,
    action: Action,
    target: &Arc<Target>,
    ts: Timestamp,
) -> Result<bool, Error> {
    debug_assert_eq!(phase.phase(), Phase::Match);

    let state = {
        let _switch = phase.switch(Phase::Execute);
        execute_direct(ctx, action, target)?
    };

    if state == TargetState::Changed {
        return Ok(true);
    }

    if !ts.is_real() {
        return Ok(false);
    }

    let mtime = target.effective_mtime(action);
    Ok(mtime.is_real() && mtime > ts)
}
