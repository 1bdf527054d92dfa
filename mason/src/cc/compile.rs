// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The compile rule: one `c{}`/`cxx{}` source into an object variant.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use fs_err as fs;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};

use crate::action::{Action, Operation};
use crate::algorithm;
use crate::context::Context;
use crate::depdb::Depdb;
use crate::mtime::Timestamp;
use crate::phase::Phase;
use crate::rule::{self, Recipe, Rule};
use crate::target::{Target, TargetState, types};

use super::dyndep::Extractor;
use super::{CompilerId, Lang, ObjVariant, Toolchain, object_extension, strings_var};

/// Rule id and version, the first depdb line
const VERSION: u32 = 1;

pub struct Compile {
    lang: Lang,
    toolchain: Arc<Toolchain>,
}

/// Option sets feeding both the invocation and the options checksum.
struct Options {
    /// Preprocessor options: ours then exported ones from libraries
    poptions: Vec<String>,

    /// Compilation options incl. language standard and -fPIC
    coptions: Vec<String>,
}

impl Options {
    fn all(&self) -> impl Iterator<Item = &String> {
        self.poptions.iter().chain(&self.coptions)
    }
}

impl Compile {
    pub fn new(lang: Lang, toolchain: Arc<Toolchain>) -> Self {
        Self { lang, toolchain }
    }

    fn rule_id(&self) -> &'static str {
        match self.lang {
            Lang::C => "c.compile",
            Lang::Cxx => "cxx.compile",
        }
    }

    /// Collect options in invocation order.
    fn options(&self, ctx: &Context, target: &Target, libs: &[Arc<Target>]) -> Options {
        let prefix = self.lang.var_prefix();

        let mut poptions = strings_var(ctx, target, "cc.poptions");
        poptions.extend(strings_var(ctx, target, &format!("{prefix}.poptions")));

        // Exported preprocessor options of library prerequisites
        for lib in libs {
            poptions.extend(strings_var(ctx, lib, "cc.export.poptions"));
        }

        let mut coptions = strings_var(ctx, target, "cc.coptions");
        coptions.extend(strings_var(ctx, target, &format!("{prefix}.coptions")));

        if let Some(crate::variable::Value::String(std)) = ctx.lookup(target, None, &format!("{prefix}.std")) {
            coptions.push(match self.toolchain.id {
                CompilerId::Msvc => format!("/std:{std}"),
                _ => format!("-std={std}"),
            });
        }

        if self.toolchain.id == CompilerId::Msvc {
            // Sensible defaults unless the user already chose
            if !coptions.iter().any(|o| o.starts_with("/EH")) {
                coptions.push("/EHsc".to_owned());
            }
            if !coptions.iter().any(|o| o.starts_with("/MD") || o.starts_with("/MT")) {
                coptions.push("/MD".to_owned());
            }
        }

        // On Darwin and Win32 position independence is the default
        if ObjVariant::for_type(target.ttype) == Some(ObjVariant::Shared)
            && matches!(self.toolchain.target.class(), "linux" | "bsd")
        {
            coptions.push("-fPIC".to_owned());
        }

        Options { poptions, coptions }
    }

    /// The options checksum: everything in invocation order, system
    /// include directories appended last.
    fn options_checksum(&self, options: &Options) -> String {
        let mut hasher = Sha256::new();

        for option in &options.poptions {
            hasher.update(option);
            hasher.update([0]);
        }
        for dir in &self.toolchain.sys_include_dirs {
            hasher.update(dir.display().to_string());
            hasher.update([0]);
        }
        for option in &options.coptions {
            hasher.update(option);
            hasher.update([0]);
        }

        hex::encode(hasher.finalize())
    }

    fn apply_update(&self, ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<Recipe, rule::Error> {
        let as_rule_error = |e: Error, t: &Arc<Target>| rule::Error::rule(self.rule_id(), t, e);

        // Derive the object path per the (target system, variant) table
        let variant = ObjVariant::for_type(target.ttype).expect("matched object variant");
        target.upgrade_ext(Some(object_extension(&self.toolchain, variant).to_owned()));
        let obj_path = target
            .derive_path()
            .map_err(|e| rule::Error::rule(self.rule_id(), target, e))?;

        algorithm::inject_fsdir(ctx, action, target)?;

        // Libraries are matched for their exported metadata only; being
        // updated before us would only restrict parallelism
        let is_lib = |t: &Target| {
            t.ttype.is_a(&types::LIB) || t.ttype.is_a(&types::LIBA) || t.ttype.is_a(&types::LIBS)
        };
        let resolved = algorithm::match_prerequisites(ctx, action, target, &is_lib)?;

        let libs: Vec<_> = resolved.iter().filter(|t| is_lib(t)).cloned().collect();
        let src = resolved
            .iter()
            .find(|t| t.ttype.is_a(self.lang.source_type()))
            .cloned()
            .ok_or_else(|| as_rule_error(Error::MissingSource, target))?;
        let src_path = src.path().ok_or_else(|| as_rule_error(Error::MissingSource, target))?;

        let options = self.options(ctx, target, &libs);

        // The invalidation chain
        let mut dd = Depdb::open(PathBuf::from(format!("{}.d", obj_path.display())))
            .map_err(|e| as_rule_error(e.into(), target))?;

        if dd.expect(&format!("{} {VERSION}", self.rule_id())).is_some() {
            debug!(target = %target, "rule mismatch forcing update");
        }
        if dd.expect(&self.toolchain.checksum()).is_some() {
            debug!(target = %target, "compiler mismatch forcing update");
        }
        if dd.expect(&self.options_checksum(&options)).is_some() {
            debug!(target = %target, "options mismatch forcing update");
        }
        if dd.expect(&src_path.display().to_string()).is_some() {
            debug!(target = %target, "source file mismatch forcing update");
        }

        // Chain mismatch or depdb newer than the object: unconditional
        let obj_mtime = Timestamp::of(&obj_path);
        let mut update = dd.writing() || dd.mtime() > obj_mtime;
        let mt = if update { Timestamp::UNKNOWN } else { obj_mtime };

        // Update prerequisites (normally just the source) before
        // extracting; auto-generated inputs must exist by then
        {
            let phase = ctx.phases.lock(Phase::Match);
            for prerequisite in resolved.iter().filter(|t| !is_lib(t)) {
                if algorithm::update_during_match(ctx, &phase, action, prerequisite, mt)? {
                    // Cached data may still be valid; the extractor will
                    // revalidate, but only against a fresh db stamp
                    if dd.reading() {
                        dd.touch().map_err(|e| as_rule_error(e.into(), target))?;
                    }
                    update = true;
                }
            }
        }

        let all_options: Vec<String> = options.all().cloned().collect();
        let extractor = Extractor {
            ctx,
            action,
            target,
            toolchain: &self.toolchain,
            lang: self.lang,
            src: src_path.clone(),
            options: &all_options,
            prefix_options: &options.poptions,
        };
        update = extractor
            .inject(&mut dd)
            .map_err(|e| as_rule_error(e.into(), target))?
            || update;

        dd.close().map_err(|e| as_rule_error(e.into(), target))?;

        let mt = if update { Timestamp::NONEXISTENT } else { obj_mtime };

        let lang = self.lang;
        let toolchain = Arc::clone(&self.toolchain);
        let compile_options: Vec<String> = options.all().cloned().collect();

        Ok(Arc::new(move |ctx: &Arc<Context>, action, target: &Arc<Target>| {
            perform_update(
                ctx,
                action,
                target,
                &toolchain,
                lang,
                &compile_options,
                &src_path,
                &obj_path,
                mt,
            )
        }))
    }

    fn apply_clean(&self, ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<Recipe, rule::Error> {
        let variant = ObjVariant::for_type(target.ttype).expect("matched object variant");
        target.upgrade_ext(Some(object_extension(&self.toolchain, variant).to_owned()));
        let obj_path = target
            .derive_path()
            .map_err(|e| rule::Error::rule(self.rule_id(), target, e))?;

        algorithm::inject_fsdir(ctx, action, target)?;
        algorithm::match_prerequisites(ctx, action, target, |_| false)?;

        Ok(Arc::new(move |ctx: &Arc<Context>, action, target: &Arc<Target>| {
            let mut state = TargetState::Unchanged;

            // The object and its metadata files go before the directory
            for path in [
                obj_path.clone(),
                PathBuf::from(format!("{}.d", obj_path.display())),
                PathBuf::from(format!("{}.t", obj_path.display())),
            ] {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        trace!(path = %path.display(), "removed");
                        state = TargetState::Changed;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(rule::Error::rule("cc.compile", target, Error::Remove(e))),
                }
            }

            target.set_mtime(Timestamp::NONEXISTENT);

            if algorithm::reverse_execute_prerequisites(ctx, action, target)? == TargetState::Changed {
                state = TargetState::Changed;
            }
            Ok(state)
        }))
    }
}

impl Rule for Compile {
    fn name(&self) -> &'static str {
        self.rule_id()
    }

    fn matches(&self, _: &Arc<Context>, _: Action, target: &Arc<Target>) -> bool {
        ObjVariant::for_type(target.ttype).is_some()
            && target
                .prerequisites()
                .iter()
                .any(|p| p.ttype.is_a(self.lang.source_type()))
    }

    fn apply(&self, ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<Recipe, rule::Error> {
        match action.operation {
            Operation::Update => self.apply_update(ctx, action, target),
            Operation::Clean => self.apply_clean(ctx, action, target),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn perform_update(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
    toolchain: &Toolchain,
    lang: Lang,
    options: &[String],
    src: &PathBuf,
    obj: &PathBuf,
    mt: Timestamp,
) -> Result<TargetState, rule::Error> {
    // Even when up to date we execute prerequisites to keep the
    // dependency counts straight
    if let Some(_prereq_state) = algorithm::execute_prerequisites(ctx, action, target, mt)? {
        target.set_mtime(mt);
        return Ok(TargetState::Unchanged);
    }

    let start = Timestamp::now();

    let mut cmd = Command::new(&toolchain.path);
    cmd.current_dir(&target.dir);
    cmd.stdin(Stdio::null());

    match toolchain.id {
        CompilerId::Msvc => {
            cmd.arg("/nologo");
            cmd.arg(match lang {
                Lang::C => "/TC",
                Lang::Cxx => "/TP",
            });
            cmd.args(options);
            cmd.arg("/c").arg(format!("/Fo{}", obj.display()));
        }
        _ => {
            cmd.args(options);
            cmd.arg("-c").arg("-o").arg(obj);
        }
    }
    cmd.arg(src);

    debug!(src = %src.display(), obj = %obj.display(), "compiling");

    let output = cmd.output().map_err(|e| {
        rule::Error::rule(
            "cc.compile",
            target,
            Error::Spawn(toolchain.path.display().to_string(), e),
        )
    })?;

    if !output.status.success() {
        return Err(rule::Error::rule(
            "cc.compile",
            target,
            Error::CompileFailed {
                program: toolchain.path.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
        ));
    }

    // Guard against coarse filesystem timestamps producing a depdb that
    // looks newer than the object it describes
    let dd_path = PathBuf::from(format!("{}.d", obj.display()));
    Depdb::check_mtime(start, &dd_path, obj, Timestamp::now())
        .map_err(|e| rule::Error::rule("cc.compile", target, e))?;

    target.set_mtime(Timestamp::of(obj));
    Ok(TargetState::Changed)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no source file prerequisite")]
    MissingSource,

    #[error("unable to execute {0}")]
    Spawn(String, #[source] std::io::Error),

    #[error("{program} failed:\n{stderr}")]
    CompileFailed { program: String, stderr: String },

    #[error("unable to remove output")]
    Remove(#[source] std::io::Error),

    #[error(transparent)]
    Depdb(#[from] crate::depdb::Error),

    #[error(transparent)]
    Dyndep(#[from] super::dyndep::Error),
}
