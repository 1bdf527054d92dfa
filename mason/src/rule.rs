// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Rules and recipes.
//!
//! A rule is a `(match, apply)` pair registered for a `(target-type,
//! operation)`; the recipe is the executable action its `apply` returns.
//! Recipes are type-erased callables; rules move whatever state they
//! computed during apply into the closure rather than parking it on the
//! target.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::action::{Action, Operation};
use crate::context::Context;
use crate::target::{Target, TargetState, TargetType};

/// The executable action installed by a rule's `apply`
pub type Recipe = Arc<dyn Fn(&Arc<Context>, Action, &Arc<Target>) -> Result<TargetState, Error> + Send + Sync>;

/// A build rule.
pub trait Rule: Send + Sync {
    /// Stable identifier, also used for hint matching and the depdb
    fn name(&self) -> &'static str;

    /// Can this rule build `target` for `action`?
    fn matches(&self, ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> bool;

    /// Populate prerequisites and produce the recipe.
    ///
    /// Runs with the target synchronized to the calling thread; may
    /// derive paths, inject prerequisites and async-match them.
    fn apply(&self, ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<Recipe, Error>;
}

/// A recipe that does nothing and reports no change
pub fn noop_recipe() -> Recipe {
    Arc::new(|_, _, _| Ok(TargetState::Unchanged))
}

/// The member recipe of an explicit group: state and mtime come from the
/// group target
pub fn group_recipe() -> Recipe {
    Arc::new(|_, _, _| Ok(TargetState::Group))
}

struct Registration {
    rule: Arc<dyn Rule>,
}

/// Rules registered per `(target-type, operation)`.
///
/// Population happens during load; lookup walks the target type chain
/// so a rule registered for `file` also covers `cxx`.
#[derive(Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<(usize, Operation), Vec<Registration>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ttype: &'static TargetType, operation: Operation, rule: Arc<dyn Rule>) {
        let key = (std::ptr::from_ref(ttype) as usize, operation);

        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .push(Registration { rule });
    }

    /// Candidate rules for a target, in deterministic try order.
    ///
    /// Registration order within each type, most-derived type first; when
    /// a hint is given, rules whose name matches it most specifically are
    /// moved to the front.
    pub fn candidates(&self, ttype: &'static TargetType, operation: Operation, hint: Option<&str>) -> Vec<Arc<dyn Rule>> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());

        let mut found = vec![];
        let mut cursor = Some(ttype);
        while let Some(t) = cursor {
            if let Some(bucket) = rules.get(&(std::ptr::from_ref(t) as usize, operation)) {
                found.extend(bucket.iter().map(|r| Arc::clone(&r.rule)));
            }
            cursor = t.parent;
        }

        if let Some(hint) = hint {
            // Stable: hinted rules keep their relative order up front
            let (hinted, rest): (Vec<_>, Vec<_>) = found.into_iter().partition(|r| r.name().starts_with(hint));
            found = hinted.into_iter().chain(rest).collect();
        }

        found
    }
}

/// Engine-wide action failure.
///
/// User/build errors abort the current action with the target chain
/// attached; they do not unwind past the driver. Rule-specific causes
/// ride along as boxed sources.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no rule to {action} target {target}")]
    NoRule { action: String, target: String },

    #[error("target {target} failed to build")]
    Failed { target: String },

    #[error("prerequisite {prerequisite} failed, cannot build {target}")]
    PrerequisiteFailed { target: String, prerequisite: String },

    #[error("dependency cycle detected involving {target}")]
    Cycle { target: String },

    #[error("group member {member} matched without its group")]
    OrphanMember { member: String },

    #[error("rule {rule} failed on {target}")]
    Rule {
        rule: &'static str,
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Wrap a rule-specific failure
    pub fn rule(
        rule: &'static str,
        target: &Target,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Rule {
            rule,
            target: target.to_string(),
            source: Box::new(source),
        }
    }
}
