// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! mason: a general-purpose build system core.
//!
//! The engine consumes an already-loaded description of the world
//! (scopes, targets, prerequisites, rules) and drives actions over it in
//! two parallel phases: *match* selects and applies rules across the
//! dependency graph, *execute* runs the resulting recipes bottom-up.
//! Incremental state lives in per-target dependency databases; the
//! compile and buildscript rules use them to track dependencies
//! discovered at build time (headers, tool-reported inputs) as first
//! class prerequisites.
//!
//! Construct a [`Context`], populate its stores, then call
//! [`Context::perform`].

pub use self::action::{Action, MetaOperation, Operation, perform_clean, perform_update};
pub use self::context::Context;
pub use self::mtime::Timestamp;
pub use self::target::{Target, TargetState};

pub mod action;
pub mod adhoc;
pub mod algorithm;
pub mod cc;
pub mod context;
pub mod depdb;
pub mod mtime;
pub mod name;
pub mod phase;
pub mod rule;
pub mod rules;
pub mod scheduler;
pub mod scope;
pub mod sync;
pub mod target;
pub mod variable;
