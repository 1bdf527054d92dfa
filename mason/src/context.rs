// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The build context.
//!
//! One context owns the target store, the scope tree and variable pool,
//! the rule registry, the scheduler and the phase lock. Nothing escapes
//! to global state; tests construct fresh contexts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::action::{Action, MetaOperation, Operation};
use crate::algorithm;
use crate::phase::{Phase, PhaseLock};
use crate::rule::{self, RuleRegistry};
use crate::rules;
use crate::scheduler::Scheduler;
use crate::scope::{Lookup, ScopeMap};
use crate::sync::Monitors;
use crate::target::store::TargetStore;
use crate::target::{Prerequisite, Target, TargetState, TargetType, offset, types};
use crate::variable::{Value, VariablePool};

/// The single mutable root of a build.
pub struct Context {
    pub store: TargetStore,
    pub scopes: ScopeMap,
    pub vars: VariablePool,
    pub rules: RuleRegistry,
    pub scheduler: Scheduler,
    pub phases: PhaseLock,
    pub monitors: Arc<Monitors>,

    /// 1-based operation number within the current batch
    operation: AtomicUsize,

    /// Extension to target-type mapping for dynamic dependency entry
    ext_map: RwLock<HashMap<String, &'static TargetType>>,

    /// Buildscript recipes attached to specific targets by the loader
    scripts: RwLock<HashMap<usize, Arc<crate::adhoc::Script>>>,
}

impl Context {
    /// A context sized to the host
    pub fn new() -> Result<Arc<Self>, Error> {
        Self::with_jobs(0)
    }

    /// A context with a bounded worker pool
    pub fn with_jobs(jobs: usize) -> Result<Arc<Self>, Error> {
        let ctx = Arc::new(Self {
            store: TargetStore::new(),
            scopes: ScopeMap::new(),
            vars: VariablePool::new(),
            rules: RuleRegistry::new(),
            scheduler: Scheduler::new(jobs)?,
            phases: PhaseLock::new(),
            monitors: Arc::new(Monitors::new()),
            operation: AtomicUsize::new(1),
            ext_map: RwLock::default(),
            scripts: RwLock::default(),
        });

        rules::register_defaults(&ctx);

        // Well-known header/source extensions
        for (ext, ttype) in [
            ("h", &types::H),
            ("hh", &types::HXX),
            ("hpp", &types::HXX),
            ("hxx", &types::HXX),
            ("c", &types::C),
            ("cc", &types::CXX),
            ("cpp", &types::CXX),
            ("cxx", &types::CXX),
        ] {
            ctx.map_extension(ext, ttype);
        }

        Ok(ctx)
    }

    /// Register an extension to target-type mapping
    pub fn map_extension(&self, ext: impl ToString, ttype: &'static TargetType) {
        self.ext_map
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ext.to_string(), ttype);
    }

    /// Resolve a target type from a file extension
    pub fn type_for_extension(&self, ext: &str) -> Option<&'static TargetType> {
        self.ext_map.read().unwrap_or_else(|e| e.into_inner()).get(ext).copied()
    }

    /// Attach a buildscript recipe to a target (load phase)
    pub fn attach_script(&self, target: &Arc<Target>, script: crate::adhoc::Script) {
        self.scripts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Arc::as_ptr(target) as usize, Arc::new(script));
    }

    /// The buildscript attached to a target, if any
    pub fn script_for(&self, target: &Target) -> Option<Arc<crate::adhoc::Script>> {
        self.scripts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(std::ptr::from_ref(target) as usize))
            .cloned()
    }

    /// Base task-count offset of the current operation.
    ///
    /// Advancing the operation shifts the whole lifecycle window so every
    /// target logically resets to untouched without being visited.
    pub fn count_base(&self) -> usize {
        offset::STRIDE * (self.operation.load(Ordering::Acquire) - 1)
    }

    /// Serial point: move the batch to its next operation
    pub fn advance_operation(&self) {
        debug_assert!(self.phases.current().is_none());
        self.operation.fetch_add(1, Ordering::AcqRel);
    }

    /// Layered variable lookup for a target.
    ///
    /// Rule-specific (when an action is given), then target, then group,
    /// then type/pattern and scope chain with overrides.
    pub fn lookup(&self, target: &Target, action: Option<Action>, name: &str) -> Option<Value> {
        if let Some(a) = action {
            let slot = target.op(a);
            let rule_vars = slot.vars.read().unwrap_or_else(|e| e.into_inner());
            if let Some(value) = rule_vars.get(name) {
                return Some(value.clone());
            }
        }

        if let Some(value) = target.var(name) {
            return Some(value);
        }

        if let Some(group) = target.group() {
            if let Some(value) = group.var(name) {
                return Some(value);
            }
        }

        let chain = target.ttype.chain();
        let lookup = Lookup {
            scopes: &self.scopes,
            pool: &self.vars,
            start_dir: &target.dir,
            target: Some((target.name.as_str(), &chain)),
        };
        lookup.find(name)
    }

    /// Prerequisite search: resolve a declared prerequisite to its
    /// target, creating an implied entry if none was declared.
    pub fn search(&self, base: &Target, prerequisite: &Prerequisite) -> Arc<Target> {
        let dir = prerequisite
            .dir
            .as_ref()
            .map(|d| {
                if d.is_absolute() {
                    d.clone()
                } else {
                    base.dir.join(d)
                }
            })
            .unwrap_or_else(|| base.dir.clone());

        let (target, _) = self.store.insert(
            prerequisite.ttype,
            dir,
            PathBuf::new(),
            prerequisite.name.clone(),
            prerequisite.ext.clone().map(Some),
            true,
        );
        target
    }

    /// Drive an action over a set of top-level targets.
    ///
    /// Runs the match phase (parallel rule selection and application over
    /// the whole graph), then the execute phase (bottom-up recipe
    /// execution), and returns the final state per target.
    #[tracing::instrument(skip_all, fields(operation = %operation, targets = targets.len()))]
    pub fn perform(self: &Arc<Self>, operation: Operation, targets: &[Arc<Target>]) -> Result<Vec<TargetState>, Error> {
        let action = Action::new(MetaOperation::Perform, operation);

        let result = self.scheduler.install(|| {
            // Match phase
            {
                let phase = self.phases.lock(Phase::Match);
                let wait = crate::scheduler::WaitGuard::new(Arc::clone(&self.monitors));

                for target in targets {
                    algorithm::match_async(self, action, target, wait.start());
                }
                wait.wait(&self.scheduler, &phase);
            }

            for target in targets {
                if target.state(action) == TargetState::Failed {
                    return Err(Error::Action(rule::Error::Failed {
                        target: target.to_string(),
                    }));
                }
                // The driver counts itself as a dependent of each root
                target.op(action).dependents.fetch_add(1, Ordering::AcqRel);
            }

            // Execute phase
            let states = {
                let phase = self.phases.lock(Phase::Execute);
                let wait = crate::scheduler::WaitGuard::new(Arc::clone(&self.monitors));

                for target in targets {
                    algorithm::execute_async(self, action, target, wait.start());
                }
                wait.wait(&self.scheduler, &phase);

                targets
                    .iter()
                    .map(|t| {
                        algorithm::wait_executed(self, &phase, action, t);
                        t.state(action)
                    })
                    .collect::<Vec<_>>()
            };

            if let Some(failed) = targets
                .iter()
                .zip(&states)
                .find(|(_, s)| **s == TargetState::Failed)
            {
                return Err(Error::Action(rule::Error::Failed {
                    target: failed.0.to_string(),
                }));
            }

            Ok(states)
        });

        // Serial point: a subsequent operation over the same targets
        // starts from a logically untouched graph
        self.advance_operation();

        result
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::Error),

    #[error(transparent)]
    Action(#[from] rule::Error),
}
