// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The fallback rule for file targets: sources and other static inputs
//! that exist on disk and are never built.

use std::sync::Arc;

use thiserror::Error;

use crate::action::{Action, Operation};
use crate::context::Context;
use crate::mtime::Timestamp;
use crate::rule::{self, Recipe, Rule};
use crate::target::{Target, TargetState};

pub struct FileRule;

impl Rule for FileRule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn matches(&self, _: &Arc<Context>, _: Action, _: &Arc<Target>) -> bool {
        // The last resort for any file target
        true
    }

    fn apply(&self, _: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<Recipe, rule::Error> {
        target
            .derive_path()
            .map_err(|e| rule::Error::rule(self.name(), target, e))?;

        match action.operation {
            Operation::Update => Ok(Arc::new(|_: &Arc<Context>, _a, t: &Arc<Target>| {
                match t.load_mtime() {
                    Timestamp::NONEXISTENT => Err(rule::Error::rule(
                        "file",
                        t,
                        Error::Missing(t.path().unwrap_or_default()),
                    )),
                    _ => Ok(TargetState::Unchanged),
                }
            })),
            // Static inputs are never cleaned
            Operation::Clean => Ok(crate::rule::noop_recipe()),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("file {} does not exist and no rule to generate it", .0.display())]
    Missing(std::path::PathBuf),
}
