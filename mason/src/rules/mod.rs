// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Built-in rules: existing files, output directories, aliases.

use std::sync::Arc;

use crate::action::Operation;
use crate::context::Context;
use crate::target::types;

pub mod alias;
pub mod file;
pub mod fsdir;

/// Register the baseline rule set every context carries.
pub fn register_defaults(ctx: &Arc<Context>) {
    let adhoc_rule = Arc::new(crate::adhoc::AdhocRule);
    let file_rule = Arc::new(file::FileRule);
    let fsdir_rule = Arc::new(fsdir::FsdirRule);
    let alias_rule = Arc::new(alias::AliasRule);

    for operation in [Operation::Update, Operation::Clean] {
        // Buildscripts beat the static-file fallback for file targets
        ctx.rules.register(&types::FILE, operation, adhoc_rule.clone());
        ctx.rules.register(&types::FILE, operation, file_rule.clone());

        ctx.rules.register(&types::FSDIR, operation, fsdir_rule.clone());
        ctx.rules.register(&types::ALIAS, operation, alias_rule.clone());
        ctx.rules.register(&types::LIB, operation, alias_rule.clone());
        ctx.rules.register(&types::OBJ, operation, alias_rule.clone());

        // Script-attached targets of other types
        ctx.rules.register(&types::TARGET, operation, adhoc_rule.clone());
    }
}
