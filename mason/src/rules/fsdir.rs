// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The `fsdir{}` rule: output directory creation and removal.
//!
//! Creation is observation-idempotent, which is what lets match-time
//! callers invoke [`perform_update_direct`] without a phase switch.

use std::sync::Arc;

use fs_err as fs;
use thiserror::Error;
use tracing::trace;

use crate::action::{Action, Operation};
use crate::context::Context;
use crate::rule::{self, Recipe, Rule};
use crate::target::{Target, TargetState};

pub struct FsdirRule;

impl Rule for FsdirRule {
    fn name(&self) -> &'static str {
        "fsdir"
    }

    fn matches(&self, _: &Arc<Context>, _: Action, _: &Arc<Target>) -> bool {
        true
    }

    fn apply(&self, _: &Arc<Context>, action: Action, _: &Arc<Target>) -> Result<Recipe, rule::Error> {
        match action.operation {
            Operation::Update => Ok(Arc::new(|_: &Arc<Context>, _, t: &Arc<Target>| {
                perform_update_direct(t).map_err(|e| rule::Error::rule("fsdir", t, e))
            })),
            Operation::Clean => Ok(Arc::new(|_: &Arc<Context>, _, t: &Arc<Target>| {
                Ok(perform_clean(t))
            })),
        }
    }
}

/// Create the directory now; safe to call straight from match.
pub fn perform_update_direct(target: &Target) -> Result<TargetState, Error> {
    if target.dir.is_dir() {
        return Ok(TargetState::Unchanged);
    }

    trace!(dir = %target.dir.display(), "mkdir");
    fs::create_dir_all(&target.dir).map_err(Error::Create)?;
    Ok(TargetState::Changed)
}

/// Remove the directory if (and only if) it is empty.
fn perform_clean(target: &Target) -> TargetState {
    match fs::remove_dir(&target.dir) {
        Ok(()) => TargetState::Changed,
        // Non-empty or already gone: not ours to force
        Err(_) => TargetState::Unchanged,
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to create directory")]
    Create(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::types;

    fn fsdir(dir: std::path::PathBuf) -> Target {
        Target::new(&types::FSDIR, dir, std::path::PathBuf::new(), String::new(), None, true)
    }

    #[test]
    fn update_is_idempotent() {
        let scratch = tempfile::tempdir().unwrap();
        let target = fsdir(scratch.path().join("a/b"));

        assert_eq!(perform_update_direct(&target).unwrap(), TargetState::Changed);
        assert_eq!(perform_update_direct(&target).unwrap(), TargetState::Unchanged);
        assert!(target.dir.is_dir());
    }

    #[test]
    fn clean_spares_non_empty() {
        let scratch = tempfile::tempdir().unwrap();
        let dir = scratch.path().join("out");
        fs::create_dir_all(dir.join("keep")).unwrap();

        let target = fsdir(dir.clone());
        assert_eq!(perform_clean(&target), TargetState::Unchanged);
        assert!(dir.exists());

        fs::remove_dir(dir.join("keep")).unwrap();
        assert_eq!(perform_clean(&target), TargetState::Changed);
        assert!(!dir.exists());
    }
}
