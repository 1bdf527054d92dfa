// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

/// The meta-operation being performed over the whole target set.
///
/// Only `perform` is modelled here; configure/dist style meta-operations
/// sit outside the core engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum MetaOperation {
    Perform,
}

/// An inner operation. Each operation owns one per-target state slot for
/// the duration of a meta-operation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Operation {
    Update,
    Clean,
}

impl Operation {
    /// Number of per-target state slots
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        match self {
            Operation::Update => 0,
            Operation::Clean => 1,
        }
    }
}

/// Recipe execution mode for an operation.
///
/// `first` runs the recipe at the first dependent's turn with the rest
/// waiting; `last` defers to the final dependent so that parallel
/// execution orders itself with maximum concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ExecutionMode {
    First,
    Last,
}

/// A `(meta-operation, operation)` pair such as `(perform, update)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    pub meta: MetaOperation,
    pub operation: Operation,
}

impl Action {
    pub fn new(meta: MetaOperation, operation: Operation) -> Self {
        Self { meta, operation }
    }

    /// The per-target state slot this action addresses
    pub fn index(self) -> usize {
        self.operation.index()
    }

    /// Execution mode of the inner operation.
    ///
    /// Update runs bottom-up off the last dependent; clean removes the
    /// dependent before its prerequisites and so executes off the first.
    pub fn mode(self) -> ExecutionMode {
        match self.operation {
            Operation::Update => ExecutionMode::Last,
            Operation::Clean => ExecutionMode::First,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.meta, self.operation)
    }
}

/// `perform(update)`
pub fn perform_update() -> Action {
    Action::new(MetaOperation::Perform, Operation::Update)
}

/// `perform(clean)`
pub fn perform_clean() -> Action {
    Action::new(MetaOperation::Perform, Operation::Clean)
}
