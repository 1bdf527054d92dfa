// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Rule selection and application.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, error, trace};

use crate::action::Action;
use crate::context::Context;
use crate::phase::{Phase, PhaseGuard};
use crate::rule::{Error, Recipe};
use crate::scheduler::CompletionToken;
use crate::sync;
use crate::target::{OpState, PrerequisiteTarget, Target, TargetState, offset, types};

thread_local! {
    /// Targets held busy by this thread's match recursion, for cycle
    /// detection
    static CHAIN: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Outcome of a target lock attempt
enum TargetLock {
    /// We own the transition; the word is at `busy`
    Owned,
    /// Already at or past `applied`
    Finished(TargetState),
}

/// Whether a prerequisite only matched for its metadata should be let go
/// of again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmatch {
    None,
    /// Unmatch if nothing forces execution; callers tolerate a
    /// still-matched result
    Safe,
}

fn chain_contains(target: &Target) -> bool {
    let key = std::ptr::from_ref(target) as usize;
    CHAIN.with_borrow(|chain| chain.contains(&key))
}

/// Acquire the match lock on a target, parking on `busy`.
fn lock(ctx: &Context, phase: &PhaseGuard<'_>, action: Action, target: &Target) -> Result<TargetLock, Error> {
    let slot = target.op(action);
    let base = ctx.count_base();

    loop {
        let current = slot.task_count.load(Ordering::Acquire);

        // Busy is numerically past applied; test it first
        if current == base + offset::BUSY {
            if chain_contains(target) {
                return Err(Error::Cycle {
                    target: target.to_string(),
                });
            }

            phase.unlocked(|| {
                ctx.monitors.wait_until(sync::key_of(&slot.task_count), || {
                    slot.task_count.load(Ordering::Acquire) != base + offset::BUSY
                });
            });
            continue;
        }

        if current >= base + offset::APPLIED {
            return Ok(TargetLock::Finished(target.state(action)));
        }

        // Resting below applied (untouched or tried); take it
        if slot
            .task_count
            .compare_exchange(current, base + offset::BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(TargetLock::Owned);
        }
    }
}

/// Publish a resting offset and wake parkers
fn publish(ctx: &Context, slot: &OpState, state: TargetState, to: usize) {
    slot.set_state(state);
    slot.task_count.store(ctx.count_base() + to, Ordering::Release);
    ctx.monitors.notify(sync::key_of(&slot.task_count));
}

/// Start matching a target on the scheduler.
pub fn match_async(ctx: &Arc<Context>, action: Action, target: &Arc<Target>, token: CompletionToken) {
    let task_ctx = Arc::clone(ctx);
    let target = Arc::clone(target);

    ctx.scheduler.spawn(move || {
        let _token = token;
        if let Err(e) = match_target(&task_ctx, action, &target) {
            // The failed state is already published; the first error
            // reaching the driver carries the diagnostics
            error!(target = %target, error = %error_chain(&e), "match failed");
        }
    });
}

/// Match a target: select a rule, apply it, publish the recipe.
///
/// On return the target's task count is at or past `applied` unless an
/// error is returned (in which case the state is failed, which also
/// rests at `applied`).
pub fn match_target(ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<TargetState, Error> {
    let phase = ctx.phases.lock(Phase::Match);
    match_impl(ctx, &phase, action, target)
}

fn match_impl(
    ctx: &Arc<Context>,
    phase: &PhaseGuard<'_>,
    action: Action,
    target: &Arc<Target>,
) -> Result<TargetState, Error> {
    let slot = target.op(action);

    match lock(ctx, phase, action, target)? {
        TargetLock::Finished(TargetState::Failed) => Err(Error::Failed {
            target: target.to_string(),
        }),
        TargetLock::Finished(state) => Ok(state),
        TargetLock::Owned => {
            // Stale per-action state from a previous operation in the
            // batch; apply() rebuilds it
            slot.prerequisite_targets
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            *slot.vars.write().unwrap_or_else(|e| e.into_inner()) = crate::variable::VariableMap::new();

            let key = std::ptr::from_ref(target.as_ref()) as usize;
            CHAIN.with_borrow_mut(|chain| chain.push(key));

            let applied = select_and_apply(ctx, action, target);

            CHAIN.with_borrow_mut(|chain| {
                let popped = chain.pop();
                debug_assert_eq!(popped, Some(key));
            });

            match applied {
                Ok(Some(recipe)) => {
                    slot.set_recipe(recipe);
                    publish(ctx, slot, TargetState::Unknown, offset::APPLIED);
                    Ok(TargetState::Unknown)
                }
                Ok(None) => {
                    // No rule matched; rest at tried so a later, stronger
                    // dependent attempt may retry
                    publish(ctx, slot, TargetState::Failed, offset::TRIED);
                    Err(Error::NoRule {
                        action: action.to_string(),
                        target: target.to_string(),
                    })
                }
                Err(e) => {
                    publish(ctx, slot, TargetState::Failed, offset::APPLIED);
                    Err(e)
                }
            }
        }
    }
}

/// Try registered rules in deterministic order; apply the first match.
fn select_and_apply(ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<Option<Recipe>, Error> {
    let hint = match ctx.lookup(target.as_ref(), None, "rule-hint") {
        Some(crate::variable::Value::String(h)) => Some(h),
        _ => None,
    };

    for rule in ctx.rules.candidates(target.ttype, action.operation, hint.as_deref()) {
        if !rule.matches(ctx, action, target) {
            trace!(target = %target, rule = rule.name(), "rule declined");
            continue;
        }

        debug!(target = %target, rule = rule.name(), "matched");
        target.op(action).set_rule(Arc::clone(&rule));

        return rule.apply(ctx, action, target).map(Some);
    }

    Ok(None)
}

/// Match and, per `unmatch`, possibly let go again.
///
/// Returns `(still_matched, state)`. With [`Unmatch::Safe`] the caller
/// does not register as a dependent; the target stays applied and may
/// still be executed by others.
pub fn match_complete(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
    unmatch: Unmatch,
) -> Result<(bool, TargetState), Error> {
    let state = match_target(ctx, action, target)?;

    match unmatch {
        Unmatch::None => Ok((true, state)),
        Unmatch::Safe => Ok((false, state)),
    }
}

/// Standard prerequisite matching for rules' `apply`.
///
/// Searches every declared prerequisite, matches them asynchronously
/// under a wait guard, then records the resolved entries (registering as
/// a dependent of each) in declaration order. Prerequisites matching
/// `unmatch_filter` are matched for metadata only and excluded from
/// execution.
pub fn match_prerequisites(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
    unmatch_filter: impl Fn(&Target) -> bool,
) -> Result<Vec<Arc<Target>>, Error> {
    let phase = ctx.phases.lock(Phase::Match);

    let resolved: Vec<Arc<Target>> = target
        .prerequisites()
        .iter()
        .map(|p| ctx.search(target, p))
        .collect();

    {
        let wait = crate::scheduler::WaitGuard::new(Arc::clone(&ctx.monitors));
        for prerequisite in &resolved {
            match_async(ctx, action, prerequisite, wait.start());
        }
        wait.wait(&ctx.scheduler, &phase);
    }

    let mut entries = vec![];
    for prerequisite in &resolved {
        let unmatch = if unmatch_filter(prerequisite) {
            Unmatch::Safe
        } else {
            Unmatch::None
        };

        let (still_matched, state) = match_complete(ctx, action, prerequisite, unmatch)?;

        if state == TargetState::Failed {
            return Err(Error::PrerequisiteFailed {
                target: target.to_string(),
                prerequisite: prerequisite.to_string(),
            });
        }

        let mut entry = PrerequisiteTarget::new(Arc::clone(prerequisite));
        entry.unmatched = !still_matched;

        if still_matched {
            prerequisite.op(action).dependents.fetch_add(1, Ordering::AcqRel);
        }

        entries.push(entry);
    }

    let slot = target.op(action);
    slot.prerequisite_targets
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .extend(entries);

    Ok(resolved)
}

/// Make sure the output directory exists.
///
/// The fsdir target is entered and matched, then updated directly from
/// match: directory creation is observation-idempotent, so no phase
/// switch is required. The entry is recorded with its data word set so
/// the execute-phase helpers skip it.
pub fn inject_fsdir(ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<(), Error> {
    let (fsdir, _) = ctx.store.insert(
        &types::FSDIR,
        target.dir.clone(),
        std::path::PathBuf::new(),
        String::new(),
        None,
        true,
    );

    match_target(ctx, action, &fsdir)?;

    let update = action.operation == crate::action::Operation::Update;
    if update {
        crate::rules::fsdir::perform_update_direct(&fsdir).map_err(|e| Error::rule("fsdir", target, e))?;
    }

    let mut entry = PrerequisiteTarget::new(Arc::clone(&fsdir));
    // For clean the directory participates normally (removed after its
    // contents); for update it is already done
    entry.data = u64::from(update);
    if !update {
        fsdir.op(action).dependents.fetch_add(1, Ordering::AcqRel);
    }

    target
        .op(action)
        .prerequisite_targets
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .push(entry);

    Ok(())
}

pub(crate) fn error_chain(e: &dyn std::error::Error) -> String {
    std::iter::successors(Some(e), |e| e.source())
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}
