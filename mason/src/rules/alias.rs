// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The alias rule: no artefact of its own, just prerequisites.
//!
//! Also covers group fronts (`lib{}`, `obj{}`) whose members are picked
//! and built by the rules of their dependents.

use std::sync::Arc;

use crate::action::Action;
use crate::algorithm;
use crate::context::Context;
use crate::rule::{self, Recipe, Rule};
use crate::target::Target;

pub struct AliasRule;

impl Rule for AliasRule {
    fn name(&self) -> &'static str {
        "alias"
    }

    fn matches(&self, _: &Arc<Context>, _: Action, _: &Arc<Target>) -> bool {
        true
    }

    fn apply(&self, ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<Recipe, rule::Error> {
        algorithm::match_prerequisites(ctx, action, target, |_| false)?;

        Ok(Arc::new(|ctx: &Arc<Context>, action, target: &Arc<Target>| {
            algorithm::straight_execute_prerequisites(ctx, action, target)
        }))
    }
}
