// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios for the ad-hoc buildscript rule.

use std::path::PathBuf;
use std::sync::Arc;

use fs_err as fs;

use mason::adhoc::{Directive, Dyndep, Script};
use mason::target::{Prerequisite, types};
use mason::{Context, Operation, TargetState};

struct Project {
    _scratch: tempfile::TempDir,
    root: PathBuf,
}

impl Project {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let scratch = tempfile::tempdir().expect("tempdir");
        let root = fs::canonicalize(scratch.path()).expect("canonical root");
        Self {
            _scratch: scratch,
            root,
        }
    }

    fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.join(name);
        fs::write(&path, content).expect("write file");
        path
    }

    fn context(&self) -> Arc<Context> {
        let ctx = Context::with_jobs(2).expect("context");
        ctx.scopes.insert(&self.root, true);
        ctx
    }

    /// Declare a scripted file target with prerequisites
    fn declare(
        &self,
        ctx: &Arc<Context>,
        name: &str,
        prerequisites: Vec<Prerequisite>,
        script: Script,
    ) -> Arc<mason::Target> {
        let (target, _) = ctx.store.insert(
            &types::FILE,
            self.root.clone(),
            PathBuf::new(),
            name.to_owned(),
            Some(None),
            false,
        );
        target.set_prerequisites(prerequisites);
        ctx.attach_script(&target, script);
        target
    }
}

fn bump_mtime(path: &std::path::Path) {
    let now = filetime::FileTime::now();
    let bumped = filetime::FileTime::from_unix_time(now.unix_seconds() + 2, 0);
    filetime::set_file_mtime(path, bumped).expect("bump mtime");
}

fn stamp_script() -> Script {
    Script::new("stamp").line("cat input.txt > stamp")
}

fn input_prereq() -> Vec<Prerequisite> {
    vec![Prerequisite::new(&types::FILE, "input").with_ext("txt")]
}

#[test]
fn script_runs_once_and_caches() {
    let project = Project::new();
    project.file("input.txt", "hello\n");

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), stamp_script());
    let states = ctx.perform(Operation::Update, &[target]).expect("update");

    assert_eq!(states, vec![TargetState::Changed]);
    assert_eq!(fs::read_to_string(project.root.join("stamp")).unwrap(), "hello\n");

    // Unchanged inputs: the cached chain proves the target current
    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), stamp_script());
    let states = ctx.perform(Operation::Update, &[target]).expect("rebuild");
    assert_eq!(states, vec![TargetState::Unchanged]);
}

#[test]
fn input_change_reruns_body() {
    let project = Project::new();
    let input = project.file("input.txt", "hello\n");

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), stamp_script());
    ctx.perform(Operation::Update, &[target]).expect("update");

    project.file("input.txt", "changed\n");
    bump_mtime(&input);

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), stamp_script());
    let states = ctx.perform(Operation::Update, &[target]).expect("rebuild");

    assert_eq!(states, vec![TargetState::Changed]);
    assert_eq!(fs::read_to_string(project.root.join("stamp")).unwrap(), "changed\n");
}

#[test]
fn depdb_directive_change_invalidates() {
    let project = Project::new();
    project.file("input.txt", "hello\n");

    let with_config = |config: &str| {
        stamp_script().directive(Directive::String(format!("config {config}")))
    };

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), with_config("a"));
    ctx.perform(Operation::Update, &[target]).expect("update");

    // Same directive: cached
    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), with_config("a"));
    let states = ctx.perform(Operation::Update, &[target]).expect("same config");
    assert_eq!(states, vec![TargetState::Unchanged]);

    // Changed directive: the chain mismatches and the body reruns
    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), with_config("b"));
    let states = ctx.perform(Operation::Update, &[target]).expect("new config");
    assert_eq!(states, vec![TargetState::Changed]);
}

#[test]
fn preamble_dyndep_tracks_tool_output() {
    let project = Project::new();
    project.file("input.txt", "hello\n");
    let extra = project.file("extra.txt", "extra\n");

    let script = || {
        Script::new("concat")
            .line("cat input.txt extra.txt > stamp")
            .directive(Directive::Dyndep(Dyndep {
                program: Some(vec![
                    "sh".to_owned(),
                    "-c".to_owned(),
                    "printf 'stamp: extra.txt\\n'".to_owned(),
                ]),
                ..Dyndep::default()
            }))
    };

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), script());
    let states = ctx.perform(Operation::Update, &[target]).expect("update");
    assert_eq!(states, vec![TargetState::Changed]);

    // The discovered dependency is recorded
    let db = fs::read_to_string(project.root.join("stamp.d")).expect("depdb");
    assert!(db.lines().any(|l| l == format!("d {}", extra.display())));

    // Unchanged: no rerun
    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), script());
    let states = ctx.perform(Operation::Update, &[target]).expect("cached");
    assert_eq!(states, vec![TargetState::Unchanged]);

    // Touching only the discovered dependency reruns the body
    project.file("extra.txt", "different\n");
    bump_mtime(&extra);

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", input_prereq(), script());
    let states = ctx.perform(Operation::Update, &[target]).expect("rerun");
    assert_eq!(states, vec![TargetState::Changed]);
    assert_eq!(
        fs::read_to_string(project.root.join("stamp")).unwrap(),
        "hello\ndifferent\n"
    );
}

#[test]
fn byproduct_dyn_targets_reconcile() {
    let project = Project::new();
    project.file("in.x", "a.o b.o\n");

    let script = || {
        Script::new("generate")
            .line("outs=$(cat in.x)")
            .line(": > stamp")
            .line(": > stamp.dep")
            .line("for o in $outs; do echo generated > \"$o\"; printf '%s: in.x\\n' \"$o\" >> stamp.dep; done")
            .directive(Directive::Dyndep(Dyndep {
                byproduct: true,
                dyn_target: true,
                file: Some(PathBuf::from("stamp.dep")),
                ..Dyndep::default()
            }))
    };
    let prereqs = || vec![Prerequisite::new(&types::FILE, "in").with_ext("x")];

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", prereqs(), script());
    let states = ctx.perform(Operation::Update, &[target]).expect("update");
    assert_eq!(states, vec![TargetState::Changed]);

    assert!(project.root.join("a.o").exists());
    assert!(project.root.join("b.o").exists());

    let db = fs::read_to_string(project.root.join("stamp.d")).expect("depdb");
    assert!(db.lines().any(|l| l == format!("t {}", project.root.join("a.o").display())));
    assert!(db.lines().any(|l| l == format!("t {}", project.root.join("b.o").display())));

    // Unchanged: byproduct validation passes without running the body
    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", prereqs(), script());
    let states = ctx.perform(Operation::Update, &[target]).expect("cached");
    assert_eq!(states, vec![TargetState::Unchanged]);

    // The input now produces only a.o; b.o must disappear
    let input = project.file("in.x", "a.o\n");
    bump_mtime(&input);

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", prereqs(), script());
    let states = ctx.perform(Operation::Update, &[target]).expect("reconcile");
    assert_eq!(states, vec![TargetState::Changed]);

    assert!(project.root.join("a.o").exists());
    assert!(!project.root.join("b.o").exists());

    let db = fs::read_to_string(project.root.join("stamp.d")).expect("depdb");
    assert!(!db.contains(&format!("t {}", project.root.join("b.o").display())));
}

#[test]
fn clean_removes_outputs_and_dynamic_targets() {
    let project = Project::new();
    project.file("in.x", "a.o\n");

    let script = || {
        Script::new("generate")
            .line("outs=$(cat in.x)")
            .line(": > stamp")
            .line(": > stamp.dep")
            .line("for o in $outs; do echo generated > \"$o\"; printf '%s: in.x\\n' \"$o\" >> stamp.dep; done")
            .directive(Directive::Dyndep(Dyndep {
                byproduct: true,
                dyn_target: true,
                file: Some(PathBuf::from("stamp.dep")),
                ..Dyndep::default()
            }))
    };
    let prereqs = || vec![Prerequisite::new(&types::FILE, "in").with_ext("x")];

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", prereqs(), script());
    ctx.perform(Operation::Update, &[target]).expect("update");
    assert!(project.root.join("a.o").exists());

    let ctx = project.context();
    let target = project.declare(&ctx, "stamp", prereqs(), script());
    let states = ctx.perform(Operation::Clean, &[target]).expect("clean");
    assert_eq!(states, vec![TargetState::Changed]);

    assert!(!project.root.join("stamp").exists());
    assert!(!project.root.join("stamp.d").exists());
    assert!(!project.root.join("a.o").exists());
    // Inputs are never cleaned
    assert!(project.root.join("in.x").exists());
}
