// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The two-phase build algorithm.
//!
//! During *match*, rules are selected and applied over the graph, each
//! target transitioning `untouched -> busy -> applied` on its per-action
//! lifecycle word. During *execute*, recipes run with data-dependency
//! ordering driven by the dependents countdown. Both walks are parallel;
//! the target's `task_count` atomic is the sole per-target lock.

pub use self::execution::{
    execute, execute_async, execute_direct, execute_prerequisites, reverse_execute_prerequisites,
    straight_execute_prerequisites, update_during_match, wait_executed,
};
pub use self::matching::{
    Unmatch, inject_fsdir, match_async, match_complete, match_prerequisites, match_target,
};

mod execution;
mod matching;
