// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Ad-hoc buildscript recipes with dynamic dependencies.
//!
//! A buildscript is a user-written recipe attached to a target by the
//! loader. Its depdb opens with the recipe identity and script checksum,
//! then the script-specified builtin lines, a blank separator, the
//! prerequisite and target set hashes, the dependency-tool checksum and
//! the environment checksum. The tail holds the dynamic entries, one
//! per line: `t <path>` for dynamically produced targets and `d <path>`
//! for discovered dependencies.
//!
//! Dynamic dependencies come in two flavours. With *preamble* dyndep the
//! dependency tool runs during apply and populates both the depdb and
//! the prerequisite list before the body executes (the compile-rule
//! protocol, restart logic included). With `--byproduct` the body itself
//! writes the dependency file; the apply-time cache round can then only
//! verify that recorded paths still exist and are not newer than the
//! target, and the fresh set is read back and appended after the body
//! runs.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use fs_err as fs;
use itertools::Itertools;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};

use crate::action::{Action, Operation};
use crate::algorithm;
use crate::context::Context;
use crate::depdb::Depdb;
use crate::mtime::Timestamp;
use crate::phase::{Phase, PhaseGuard};
use crate::rule::{self, Recipe, Rule};
use crate::target::{PrerequisiteTarget, Target, TargetState, types};

/// Tail line tags
const TAG_TARGET: &str = "t ";
const TAG_DEP: &str = "d ";

/// A parsed buildscript attached to a target.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Low-verbosity diagnostics name
    pub name: String,

    /// Shell command lines forming the body
    pub body: Vec<String>,

    /// Preamble depdb builtins, in declaration order
    pub depdb: Vec<Directive>,

    /// Environment variable names the body depends on
    pub env: Vec<String>,
}

impl Script {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn line(mut self, command: impl ToString) -> Self {
        self.body.push(command.to_string());
        self
    }

    pub fn directive(mut self, directive: Directive) -> Self {
        self.depdb.push(directive);
        self
    }

    pub fn depends_on_env(mut self, name: impl ToString) -> Self {
        self.env.push(name.to_string());
        self
    }

    /// Content checksum; any body edit invalidates
    fn checksum(&self) -> String {
        sha256(self.body.iter().join("\n"))
    }

    fn dyndep(&self) -> Option<&Dyndep> {
        self.depdb.iter().find_map(|d| match d {
            Directive::Dyndep(dyndep) => Some(dyndep),
            _ => None,
        })
    }
}

/// One `depdb` builtin of the script preamble.
#[derive(Debug, Clone)]
pub enum Directive {
    /// `depdb string <line>`: the literal line joins the chain
    String(String),

    /// `depdb hash <value>`: the value's hash joins the chain
    Hash(String),

    /// `depdb dyndep ...`
    Dyndep(Dyndep),
}

/// Dynamic dependency declaration.
#[derive(Debug, Clone, Default)]
pub struct Dyndep {
    /// The dependency information appears as a byproduct of the body
    /// rather than from a preamble tool run
    pub byproduct: bool,

    /// The body produces targets not known at apply time
    pub dyn_target: bool,

    /// Preamble dependency tool argv (make-format output on stdout)
    pub program: Option<Vec<String>>,

    /// Byproduct dependency file, relative to the target directory
    pub file: Option<PathBuf>,
}

/// The buildscript rule; a singleton covering every target the loader
/// attached a script to. Registered by the context defaults ahead of the
/// static-file fallback.
pub struct AdhocRule;

impl Rule for AdhocRule {
    fn name(&self) -> &'static str {
        "adhoc.buildscript"
    }

    fn matches(&self, ctx: &Arc<Context>, _: Action, target: &Arc<Target>) -> bool {
        ctx.script_for(target).is_some()
    }

    fn apply(&self, ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<Recipe, rule::Error> {
        let script = ctx.script_for(target).expect("matched script");

        match action.operation {
            Operation::Update => apply_update(ctx, action, target, script),
            Operation::Clean => apply_clean(ctx, action, target, script),
        }
    }
}

fn wrap(e: Error, target: &Arc<Target>) -> rule::Error {
    rule::Error::rule("adhoc.buildscript", target, e)
}

fn apply_update(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
    script: Arc<Script>,
) -> Result<Recipe, rule::Error> {
    let is_file = target.ttype.is_a(&types::PATH_TARGET);

    let target_path = if is_file {
        let path = target
            .derive_path()
            .map_err(|e| rule::Error::rule("adhoc.buildscript", target, e))?;
        algorithm::inject_fsdir(ctx, action, target)?;
        Some(path)
    } else {
        None
    };

    let resolved = algorithm::match_prerequisites(ctx, action, target, |_| false)?;

    let dd_path = depdb_path(target, target_path.as_deref());

    // The previous run's dynamic target set, before the chain below can
    // truncate it away
    let old_dyn_targets = read_dyn_targets(&dd_path).map_err(|e| wrap(e, target))?;

    let mut dd = Depdb::open(&dd_path).map_err(|e| wrap(e.into(), target))?;

    // Fixed part of the chain
    dd.expect("<ad hoc buildscript recipe> 1");
    dd.expect(&script.checksum());

    for directive in &script.depdb {
        match directive {
            Directive::String(line) => {
                dd.expect(line);
            }
            Directive::Hash(value) => {
                dd.expect(&sha256(value));
            }
            Directive::Dyndep(_) => {}
        }
    }

    dd.expect("");
    dd.expect(&set_hash(resolved.iter().filter_map(|t| t.path()).collect()));
    dd.expect(&target_set_hash(target, target_path.as_deref()));
    dd.expect(&program_checksum(script.dyndep()));
    dd.expect(&environment_checksum(&script.env));

    let t_mtime = target_path.as_deref().map(Timestamp::of).unwrap_or(Timestamp::NONEXISTENT);
    let mut update = dd.writing() || dd.mtime() > t_mtime;
    let mt = if update { Timestamp::UNKNOWN } else { t_mtime };

    // Static prerequisites first; dynamic information is only as fresh
    // as the inputs it was derived from
    {
        let phase = ctx.phases.lock(Phase::Match);
        for prerequisite in &resolved {
            if algorithm::update_during_match(ctx, &phase, action, prerequisite, mt)? {
                if dd.reading() {
                    dd.touch().map_err(|e| wrap(e.into(), target))?;
                }
                update = true;
            }
        }
    }

    match script.dyndep() {
        Some(dyndep) if dyndep.byproduct => {
            // Weaker cache round: we cannot re-invoke the tool, so only
            // verify recorded paths still exist and are not newer. The
            // body regenerates the whole tail when it runs.
            if !update && dd.reading() {
                update = validate_byproduct_cache(&mut dd, mt).map_err(|e| wrap(e, target))?;
            }
        }
        Some(dyndep) => {
            update = extract_preamble(ctx, action, target, dyndep, &mut dd, mt).map_err(|e| wrap(e, target))?
                || update;
        }
        None => {}
    }

    dd.close().map_err(|e| wrap(e.into(), target))?;

    let mt = if update { Timestamp::NONEXISTENT } else { t_mtime };

    Ok(Arc::new(move |ctx: &Arc<Context>, action, target: &Arc<Target>| {
        perform_update(
            ctx,
            action,
            target,
            &script,
            target_path.as_deref(),
            &old_dyn_targets,
            mt,
        )
    }))
}

fn apply_clean(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
    _script: Arc<Script>,
) -> Result<Recipe, rule::Error> {
    let is_file = target.ttype.is_a(&types::PATH_TARGET);
    let target_path = if is_file {
        Some(
            target
                .derive_path()
                .map_err(|e| rule::Error::rule("adhoc.buildscript", target, e))?,
        )
    } else {
        None
    };

    algorithm::inject_fsdir(ctx, action, target)?;
    algorithm::match_prerequisites(ctx, action, target, |_| false)?;

    Ok(Arc::new(move |ctx: &Arc<Context>, action, target: &Arc<Target>| {
        let mut state = TargetState::Unchanged;

        let dd_path = depdb_path(target, target_path.as_deref());
        let dyn_targets = read_dyn_targets(&dd_path).unwrap_or_default();

        let mut victims: Vec<PathBuf> = dyn_targets;
        if let Some(path) = &target_path {
            victims.push(path.clone());
        }
        victims.push(dd_path);

        for path in victims {
            match fs::remove_file(&path) {
                Ok(()) => {
                    trace!(path = %path.display(), "removed");
                    state = TargetState::Changed;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(wrap(Error::Remove(e), target)),
            }
        }

        target.set_mtime(Timestamp::NONEXISTENT);

        if algorithm::reverse_execute_prerequisites(ctx, action, target)? == TargetState::Changed {
            state = TargetState::Changed;
        }
        Ok(state)
    }))
}

/// Preamble dyndep: run the tool now, fill depdb and prerequisites.
fn extract_preamble(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
    dyndep: &Dyndep,
    dd: &mut Depdb,
    mt: Timestamp,
) -> Result<bool, Error> {
    let phase = ctx.phases.lock(Phase::Match);

    let program = dyndep.program.as_ref().ok_or(Error::MissingProgram)?;

    let mut updated = false;
    let mut skip_count = 0usize;
    let mut cache = dd.reading() && !dd.touched();

    // Dynamic targets lead the tail; they are recorded once (or
    // revalidated from the cache) and kept across restarts
    let mut targets_recorded = false;

    'restart: loop {
        if cache {
            while dd.more() {
                let line = dd.read().expect("line available");

                if let Some(path) = line.strip_prefix(TAG_TARGET) {
                    // Dynamic targets re-enter as ad-hoc members
                    enter_dyn_target(ctx, target, Path::new(path));
                    targets_recorded = true;
                    continue;
                }

                let Some(path) = line.strip_prefix(TAG_DEP) else {
                    dd.truncate();
                    cache = false;
                    continue 'restart;
                };

                let restart = add_dependency(ctx, &phase, action, target, dd, PathBuf::from(path), true, mt)?;
                skip_count += 1;

                if restart {
                    trace!(target = %target, "restarting after cached dependency update");
                    updated = true;
                    dd.touch()?;
                    cache = false;
                    continue 'restart;
                }
            }

            return Ok(updated);
        }

        let declarations = run_dyndep_program(target, program)?;

        // Dynamic targets precede dependencies in the tail
        if dyndep.dyn_target && !targets_recorded {
            for declaration in &declarations {
                let path = target.dir.join(&declaration.target);
                enter_dyn_target(ctx, target, &path);
                dd.expect(&format!("{TAG_TARGET}{}", path.display()));
            }
            targets_recorded = true;
        }

        let dependencies: Vec<_> = declarations.iter().flat_map(|d| d.prerequisites.iter()).collect();

        for dependency in dependencies.into_iter().skip(skip_count) {
            let path = resolve_dep(&target.dir, Path::new(dependency));
            let restart = add_dependency(ctx, &phase, action, target, dd, path, false, mt)?;
            skip_count += 1;
            updated = updated || restart;

            if restart {
                trace!(target = %target, "restarting");
                continue 'restart;
            }
        }

        return Ok(updated);
    }
}

/// Enter, match and update one discovered dependency; record it in the
/// depdb (compile round only) and the prerequisite list.
#[allow(clippy::too_many_arguments)]
fn add_dependency(
    ctx: &Arc<Context>,
    phase: &PhaseGuard<'_>,
    action: Action,
    target: &Arc<Target>,
    dd: &mut Depdb,
    path: PathBuf,
    cache: bool,
    mt: Timestamp,
) -> Result<bool, Error> {
    let dependency = enter_file(ctx, &path);

    dependency
        .set_path(path.clone())
        .map_err(|e| Error::Engine(Box::new(rule::Error::rule("adhoc.buildscript", &dependency, e))))?;

    algorithm::match_target(ctx, action, &dependency).map_err(|e| Error::Engine(Box::new(e)))?;

    let ts = if cache { dd.mtime() } else { mt };
    let restart =
        algorithm::update_during_match(ctx, phase, action, &dependency, ts).map_err(|e| Error::Engine(Box::new(e)))?;

    if !cache {
        dd.expect(&format!("{TAG_DEP}{}", path.display()));
    }

    dependency.op(action).dependents.fetch_add(1, Ordering::AcqRel);
    target
        .op(action)
        .prerequisite_targets
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .push(PrerequisiteTarget::new(dependency));

    Ok(restart)
}

/// Byproduct cache round: recorded dependencies must exist and be no
/// newer than the target.
fn validate_byproduct_cache(dd: &mut Depdb, mt: Timestamp) -> Result<bool, Error> {
    while dd.more() {
        let Some(line) = dd.read() else { break };

        if line.strip_prefix(TAG_TARGET).is_some() {
            continue;
        }
        let Some(path) = line.strip_prefix(TAG_DEP) else {
            return Ok(true);
        };

        let dep_mtime = Timestamp::of(Path::new(path));
        if dep_mtime == Timestamp::NONEXISTENT || (mt.is_real() && dep_mtime > mt) {
            debug!(dependency = path, "byproduct dependency out of date");
            return Ok(true);
        }
    }

    Ok(false)
}

/// The body has run; parse the byproduct file, verify, append to depdb,
/// and reconcile dynamic targets.
fn process_byproduct(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
    dyndep: &Dyndep,
    target_path: Option<&Path>,
    old_dyn_targets: &[PathBuf],
) -> Result<(), Error> {
    let file = dyndep.file.as_ref().ok_or(Error::MissingFile)?;
    let file = resolve_dep(&target.dir, file);

    let content = fs::read_to_string(&file).map_err(Error::Read)?;
    let declarations = parse_all(&content)?;

    let mut dd = Depdb::reopen(depdb_path(target, target_path))?;

    // Rebuild the dynamic-entry tail from scratch
    dd.rstrip(|line| line.starts_with(TAG_TARGET) || line.starts_with(TAG_DEP));

    let mut new_targets = vec![];
    if dyndep.dyn_target {
        for declaration in &declarations {
            let path = target.dir.join(&declaration.target);
            enter_dyn_target(ctx, target, &path);
            dd.write(&format!("{TAG_TARGET}{}", path.display()));
            new_targets.push(path);
        }
    }

    for declaration in &declarations {
        for dependency in &declaration.prerequisites {
            let path = resolve_dep(&target.dir, Path::new(dependency));

            // A byproduct dependency must already exist; discovering a
            // generated-but-not-updated input here is a race
            if Timestamp::of(&path) == Timestamp::NONEXISTENT {
                return Err(Error::ByproductMissing(path.display().to_string()));
            }
            if let Some(existing) = find_file(ctx, &path) {
                if let Some(rule) = existing.op(action).rule() {
                    if rule.name() != "file" {
                        return Err(Error::ByproductRace(path.display().to_string()));
                    }
                }
            }

            dd.write(&format!("{TAG_DEP}{}", path.display()));
        }
    }

    dd.close()?;

    // Files no longer produced are taken off the disk
    for stale in old_dyn_targets.iter().filter(|old| !new_targets.contains(old)) {
        debug!(path = %stale.display(), "removing stale dynamic target");
        let _ = fs::remove_file(stale);
    }

    Ok(())
}

fn perform_update(
    ctx: &Arc<Context>,
    action: Action,
    target: &Arc<Target>,
    script: &Script,
    target_path: Option<&Path>,
    old_dyn_targets: &[PathBuf],
    mt: Timestamp,
) -> Result<TargetState, rule::Error> {
    if let Some(state) = algorithm::execute_prerequisites(ctx, action, target, mt)? {
        target.set_mtime(mt);
        return Ok(state);
    }

    debug!(target = %target, script = script.name, "running buildscript");

    let start = Timestamp::now();
    run_body(target, script).map_err(|e| wrap(e, target))?;

    if let Some(dyndep) = script.dyndep() {
        if dyndep.byproduct {
            process_byproduct(ctx, action, target, dyndep, target_path, old_dyn_targets)
                .map_err(|e| wrap(e, target))?;

            // The depdb was rewritten after the body; restamp the target
            // so the database does not read as newer than its output
            if let Some(path) = target_path {
                let _ = filetime::set_file_mtime(path, filetime::FileTime::now());
            }
        }
    }

    if let Some(path) = target_path {
        let mtime = Timestamp::of(path);
        if mtime == Timestamp::NONEXISTENT {
            return Err(wrap(Error::NoOutput(path.display().to_string()), target));
        }

        Depdb::check_mtime(start, &depdb_path(target, Some(path)), path, Timestamp::now())
            .map_err(|e| wrap(e.into(), target))?;

        target.set_mtime(mtime);
    } else {
        target.set_mtime(start);
    }

    Ok(TargetState::Changed)
}

/// Run the body lines under `sh -e`, explicit cwd, untouched process
/// environment.
fn run_body(target: &Target, script: &Script) -> Result<(), Error> {
    if script.body.is_empty() {
        return Ok(());
    }

    let output = Command::new("sh")
        .arg("-e")
        .arg("-c")
        .arg(script.body.join("\n"))
        .current_dir(&target.dir)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::Spawn("sh".to_owned(), e))?;

    if !output.status.success() {
        return Err(Error::BodyFailed {
            script: script.name.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}

fn run_dyndep_program(target: &Target, program: &[String]) -> Result<Vec<depfile::make::Dependencies>, Error> {
    let (cmd, args) = program.split_first().ok_or(Error::MissingProgram)?;

    let output = Command::new(cmd)
        .args(args)
        .current_dir(&target.dir)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::Spawn(cmd.clone(), e))?;

    if !output.status.success() {
        return Err(Error::ProgramFailed {
            program: cmd.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    parse_all(&String::from_utf8_lossy(&output.stdout))
}

fn parse_all(content: &str) -> Result<Vec<depfile::make::Dependencies>, Error> {
    Ok(depfile::make::parse_all(content)?)
}

fn resolve_dep(base: &Path, path: &Path) -> PathBuf {
    use path_clean::PathClean;

    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path).clean()
    }
}

/// Enter a discovered file path as a target (implied), typed by
/// extension.
fn enter_file(ctx: &Context, path: &Path) -> Arc<Target> {
    let (dir, name, ext) = crate::name::split_path(path);
    let ttype = ext
        .as_deref()
        .and_then(|e| ctx.type_for_extension(e))
        .unwrap_or(&types::FILE);

    let (target, _) = ctx.store.insert(ttype, dir, PathBuf::new(), name, Some(ext), true);
    target
}

fn find_file(ctx: &Context, path: &Path) -> Option<Arc<Target>> {
    let (dir, name, ext) = crate::name::split_path(path);
    let ttype = ext
        .as_deref()
        .and_then(|e| ctx.type_for_extension(e))
        .unwrap_or(&types::FILE);

    ctx.store.find(ttype, &dir, &PathBuf::new(), &name, Some(ext.as_deref()))
}

/// Enter a dynamically produced file as an ad-hoc group member of the
/// primary target.
fn enter_dyn_target(ctx: &Context, primary: &Arc<Target>, path: &Path) {
    let member = enter_file(ctx, path);

    if Arc::ptr_eq(&member, primary) {
        return;
    }

    let _ = member.set_path(path.to_path_buf());
    primary.add_adhoc_member(member);
}

fn depdb_path(target: &Target, target_path: Option<&Path>) -> PathBuf {
    match target_path {
        Some(path) => PathBuf::from(format!("{}.d", path.display())),
        None => target.dir.join(format!("{}.d", target.name)),
    }
}

/// Dynamic target paths recorded in an existing depdb
fn read_dyn_targets(path: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut db = match Depdb::open(path) {
        Ok(db) => db,
        Err(_) => return Ok(vec![]),
    };

    let mut found = vec![];
    while let Some(line) = db.read() {
        if let Some(p) = line.strip_prefix(TAG_TARGET) {
            found.push(PathBuf::from(p));
        }
    }
    Ok(found)
}

fn sha256(text: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_ref());
    hex::encode(hasher.finalize())
}

/// Order-independent hash of a path set
fn set_hash(mut paths: Vec<PathBuf>) -> String {
    paths.sort();

    let mut hasher = Sha256::new();
    for path in paths {
        hasher.update(path.display().to_string());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

fn target_set_hash(target: &Target, target_path: Option<&Path>) -> String {
    let mut paths = vec![];
    if let Some(path) = target_path {
        paths.push(path.to_path_buf());
    }

    let mut member = target.adhoc_member().cloned();
    while let Some(m) = member {
        if let Some(path) = m.path() {
            paths.push(path);
        }
        member = m.adhoc_member().cloned();
    }

    set_hash(paths)
}

fn program_checksum(dyndep: Option<&Dyndep>) -> String {
    match dyndep {
        Some(Dyndep {
            program: Some(argv), ..
        }) => sha256(argv.iter().join("\u{0}")),
        Some(Dyndep { file: Some(file), .. }) => sha256(format!("byproduct:{}", file.display())),
        _ => sha256(""),
    }
}

fn environment_checksum(names: &[String]) -> String {
    let mut hasher = Sha256::new();
    for name in names {
        hasher.update(name);
        hasher.update("=");
        hasher.update(std::env::var(name).unwrap_or_default());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("depdb-dyndep requires a dependency program")]
    MissingProgram,

    #[error("depdb-dyndep --byproduct requires a dependency file")]
    MissingFile,

    #[error("unable to execute {0}")]
    Spawn(String, #[source] std::io::Error),

    #[error("buildscript {script} failed:\n{stderr}")]
    BodyFailed { script: String, stderr: String },

    #[error("dependency program {program} failed:\n{stderr}")]
    ProgramFailed { program: String, stderr: String },

    #[error("unable to read byproduct dependency file")]
    Read(#[source] std::io::Error),

    #[error("byproduct dependency {0} does not exist")]
    ByproductMissing(String),

    #[error("byproduct dependency {0} is a generated target; this is a race")]
    ByproductRace(String),

    #[error("buildscript did not produce {0}")]
    NoOutput(String),

    #[error("unable to remove output")]
    Remove(#[source] std::io::Error),

    #[error(transparent)]
    Depfile(#[from] depfile::Error),

    #[error(transparent)]
    Depdb(#[from] crate::depdb::Error),

    #[error(transparent)]
    Engine(Box<rule::Error>),
}
