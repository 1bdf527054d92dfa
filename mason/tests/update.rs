// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end update scenarios for the compile rule.
//!
//! The "compiler" is a shell stub: with `-M` it prints a make dependency
//! declaration assembled from a `<src>.deps` sidecar file (relative
//! entries playing the role of `-MG` non-existent headers), otherwise it
//! copies the source to the output. Every invocation appends its mode to
//! `<stub>.log` so tests can assert exactly when the compiler ran.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs_err as fs;

use mason::adhoc::Script;
use mason::cc::{self, CompilerId, Toolchain};
use mason::target::{Prerequisite, offset, types};
use mason::variable::Value;
use mason::{Context, Operation, TargetState};

const STUB: &str = r#"#!/bin/sh
mode=compile
for a in "$@"; do case "$a" in -M) mode=deps ;; esac; done
for a in "$@"; do src="$a"; done
echo "$mode" >> "$0.log"
if [ "$mode" = deps ]; then
  printf '^: %s' "$src"
  if [ -f "$src.deps" ]; then
    while IFS= read -r h; do [ -n "$h" ] && printf ' %s' "$h"; done < "$src.deps"
  fi
  printf '\n'
else
  grab=0
  out=""
  for a in "$@"; do
    if [ "$grab" = 1 ]; then out="$a"; grab=0; fi
    [ "$a" = "-o" ] && grab=1
  done
  cat "$src" > "$out"
fi
exit 0
"#;

struct Project {
    _scratch: tempfile::TempDir,
    root: PathBuf,
    stub: PathBuf,
}

impl Project {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let scratch = tempfile::tempdir().expect("tempdir");
        // Resolve symlinked temp locations up front; the engine realizes
        // reported header paths
        let root = fs::canonicalize(scratch.path()).expect("canonical root");

        let stub = root.join("cc.sh");
        fs::write(&stub, STUB).expect("stub");
        let mut perms = fs::metadata(&stub).expect("stub metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&stub, perms).expect("stub permissions");

        Self {
            _scratch: scratch,
            root,
            stub,
        }
    }

    fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.join(name);
        fs::write(&path, content).expect("write file");
        path
    }

    /// Sidecar driving the stub's dependency output, one entry per line
    fn deps(&self, src: &str, entries: &[&str]) {
        self.file(&format!("{src}.deps"), &(entries.join("\n") + "\n"));
    }

    fn toolchain(&self) -> Toolchain {
        Toolchain::from_yaml(&format!(
            "id: clang\npath: {}\nversion: '1'\ntarget: x86_64-pc-linux-gnu\n",
            self.stub.display()
        ))
        .expect("toolchain")
    }

    /// One build run: fresh context, freshly declared world.
    fn context(&self) -> Arc<Context> {
        let ctx = Context::with_jobs(2).expect("context");
        ctx.scopes.insert(&self.root, true);
        cc::register(&ctx, self.toolchain());
        ctx
    }

    fn declare_obj(&self, ctx: &Arc<Context>, name: &str) -> Arc<mason::Target> {
        let (obj, _) = ctx.store.insert(
            &types::OBJE,
            self.root.clone(),
            PathBuf::new(),
            name.to_owned(),
            None,
            false,
        );
        obj.set_prerequisites(vec![Prerequisite::new(&types::CXX, name)]);
        obj
    }

    fn spawn_log(&self) -> Vec<String> {
        fs::read_to_string(format!("{}.log", self.stub.display()))
            .map(|s| s.lines().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    fn depdb_lines(&self, target: &str) -> Vec<String> {
        fs::read_to_string(self.root.join(format!("{target}.d")))
            .expect("depdb")
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

fn bump_mtime(path: &Path) {
    let now = filetime::FileTime::now();
    let bumped = filetime::FileTime::from_unix_time(now.unix_seconds() + 2, 0);
    filetime::set_file_mtime(path, bumped).expect("bump mtime");
}

#[test]
fn fresh_compile_writes_chain() {
    let project = Project::new();
    let src = project.file("src.cxx", "int main() { return 0; }\n");
    let a = project.file("a.h", "// a\n");
    let b = project.file("b.h", "// b\n");
    project.deps("src.cxx", &[&a.display().to_string(), &b.display().to_string()]);

    let ctx = project.context();
    let obj = project.declare_obj(&ctx, "src");

    let states = ctx.perform(Operation::Update, &[obj.clone()]).expect("update");
    assert_eq!(states, vec![TargetState::Changed]);

    // Extraction once, compilation once
    assert_eq!(project.spawn_log(), vec!["deps", "compile"]);

    // The object carries the source content (stub semantics)
    let obj_path = project.root.join("src.o");
    assert_eq!(
        fs::read_to_string(&obj_path).expect("object"),
        "int main() { return 0; }\n"
    );

    // Invalidation chain: rule id, compiler checksum, options checksum,
    // source, then each header
    let lines = project.depdb_lines("src.o");
    assert_eq!(lines[0], "cxx.compile 1");
    assert_eq!(lines[1].len(), 64);
    assert_eq!(lines[2].len(), 64);
    assert_eq!(lines[3], src.display().to_string());
    assert_eq!(lines[4], a.display().to_string());
    assert_eq!(lines[5], b.display().to_string());

    // Object no older than its database
    let db_mtime = fs::metadata(project.root.join("src.o.d")).unwrap().modified().unwrap();
    let obj_mtime = fs::metadata(&obj_path).unwrap().modified().unwrap();
    assert!(obj_mtime >= db_mtime);

    // Post-match floor: the lifecycle word rests at executed
    let action = mason::perform_update();
    assert!(obj.op(action).task_count.load(std::sync::atomic::Ordering::Acquire) >= offset::APPLIED);
}

#[test]
fn noop_rebuild_reads_cache_only() {
    let project = Project::new();
    project.file("src.cxx", "int main() { return 0; }\n");
    let a = project.file("a.h", "// a\n");
    project.deps("src.cxx", &[&a.display().to_string()]);

    let ctx = project.context();
    let obj = project.declare_obj(&ctx, "src");
    ctx.perform(Operation::Update, &[obj]).expect("first build");

    let db_before = fs::read_to_string(project.root.join("src.o.d")).expect("depdb");

    // A fresh run with no changes: cache round only, no compiler at all
    let ctx = project.context();
    let obj = project.declare_obj(&ctx, "src");
    let states = ctx.perform(Operation::Update, &[obj]).expect("rebuild");

    assert_eq!(states, vec![TargetState::Unchanged]);
    assert_eq!(project.spawn_log(), vec!["deps", "compile"]);

    // Idempotence: replaying with no source changes writes nothing
    let db_after = fs::read_to_string(project.root.join("src.o.d")).expect("depdb");
    assert_eq!(db_before, db_after);
}

#[test]
fn header_change_recompiles_without_restart() {
    let project = Project::new();
    project.file("src.cxx", "int main() { return 0; }\n");
    let a = project.file("a.h", "// a\n");
    let b = project.file("b.h", "// b\n");
    project.deps("src.cxx", &[&a.display().to_string(), &b.display().to_string()]);

    let ctx = project.context();
    let obj = project.declare_obj(&ctx, "src");
    ctx.perform(Operation::Update, &[obj]).expect("first build");

    // Touch one header past the database stamp
    bump_mtime(&b);

    let ctx = project.context();
    let obj = project.declare_obj(&ctx, "src");
    let states = ctx.perform(Operation::Update, &[obj]).expect("rebuild");
    assert_eq!(states, vec![TargetState::Changed]);

    // The cache round detected the change and fell through to one
    // extraction plus one compile; the header set was unchanged so no
    // further restart happened
    assert_eq!(project.spawn_log(), vec!["deps", "compile", "deps", "compile"]);
}

#[test]
fn new_generated_header_restarts_once() {
    let project = Project::new();
    project.file("src.cxx", "int main() { return 0; }\n");
    let a = project.file("a.h", "// a\n");
    // `gen.h` is reported relative: it does not exist yet
    project.deps("src.cxx", &[&a.display().to_string(), "gen.h"]);

    let ctx = project.context();

    // Make relative reports resolvable: -I at the project root
    let scope = ctx.scopes.insert(&project.root, true);
    scope.assign(
        "cc.poptions",
        Value::Strings(vec![format!("-I{}", project.root.display())]),
    );

    // The generated header is declared with a buildscript
    let (header, _) = ctx.store.insert(
        &types::H,
        project.root.clone(),
        PathBuf::new(),
        "gen".to_owned(),
        Some(Some("h".to_owned())),
        false,
    );
    ctx.attach_script(&header, Script::new("gen-header").line("echo '// generated' > gen.h"));

    let obj = project.declare_obj(&ctx, "src");
    let states = ctx.perform(Operation::Update, &[obj]).expect("update");
    assert_eq!(states, vec![TargetState::Changed]);

    // Generating gen.h changed it, forcing exactly one extractor restart
    assert!(project.root.join("gen.h").exists());
    assert_eq!(project.spawn_log(), vec!["deps", "deps", "compile"]);

    // The final database lists the resolved generated header
    let lines = project.depdb_lines("src.o");
    assert!(lines.contains(&project.root.join("gen.h").display().to_string()));
}

#[test]
fn missing_msvc_header_is_a_good_error() {
    let project = Project::new();
    project.file("src.cxx", "int main() { return 0; }\n");
    let a = project.file("a.h", "// a\n");

    // /showIncludes output ending in C1083, with error exit
    let msvc = project.root.join("cl.sh");
    fs::write(
        &msvc,
        format!(
            "#!/bin/sh\n\
             echo 'src.cxx' >&2\n\
             echo 'Note: including file: {a}' >&2\n\
             echo \"src.cxx(3): fatal error C1083: Cannot open include file: 'missing.h': No such file or directory\" >&2\n\
             exit 2\n",
            a = a.display()
        ),
    )
    .expect("msvc stub");
    let mut perms = fs::metadata(&msvc).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&msvc, perms).expect("stub permissions");

    let ctx = Context::with_jobs(2).expect("context");
    ctx.scopes.insert(&project.root, true);
    cc::register(
        &ctx,
        Toolchain::from_yaml(&format!(
            "id: msvc\npath: {}\nversion: '19'\ntarget: x86_64-pc-win32-msvc\n",
            msvc.display()
        ))
        .expect("toolchain"),
    );
    let obj = project.declare_obj(&ctx, "src");

    let error = mason::algorithm::match_target(&ctx, mason::perform_update(), &obj).expect_err("must fail");
    let chain = std::iter::successors(Some(&error as &dyn std::error::Error), |e| e.source())
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ");
    assert!(
        chain.contains("header 'missing.h' not found and cannot be generated"),
        "unexpected error chain: {chain}"
    );
}

#[test]
fn library_prerequisites_feed_metadata_without_executing() {
    let project = Project::new();
    project.file("src.cxx", "int main() { return 0; }\n");
    // The library exports an include dir; gen.h resolves through it
    project.deps("src.cxx", &["gen.h"]);

    let ctx = project.context();

    let (lib, _) = ctx.store.insert(
        &types::LIB,
        project.root.clone(),
        PathBuf::new(),
        "util".to_owned(),
        None,
        false,
    );
    lib.assign(
        "cc.export.poptions",
        Value::Strings(vec![format!("-I{}", project.root.display())]),
    );

    let (header, _) = ctx.store.insert(
        &types::H,
        project.root.clone(),
        PathBuf::new(),
        "gen".to_owned(),
        Some(Some("h".to_owned())),
        false,
    );
    ctx.attach_script(&header, Script::new("gen-header").line("echo '// generated' > gen.h"));

    let (obj, _) = ctx.store.insert(
        &types::OBJE,
        project.root.clone(),
        PathBuf::new(),
        "src".to_owned(),
        None,
        false,
    );
    obj.set_prerequisites(vec![
        Prerequisite::new(&types::CXX, "src"),
        Prerequisite::new(&types::LIB, "util"),
    ]);

    let states = ctx.perform(Operation::Update, &[obj]).expect("update");
    assert_eq!(states, vec![TargetState::Changed]);
    assert!(project.root.join("gen.h").exists());

    // The library was matched for metadata only and never executed
    let action = mason::perform_update();
    assert_eq!(lib.op(action).state(), TargetState::Unknown);
}

#[test]
fn independent_objects_build_together() {
    let project = Project::new();
    for name in ["one", "two"] {
        project.file(&format!("{name}.cxx"), &format!("// {name}\n"));
        project.deps(&format!("{name}.cxx"), &[]);
    }

    let ctx = project.context();
    let one = project.declare_obj(&ctx, "one");
    let two = project.declare_obj(&ctx, "two");

    let states = ctx.perform(Operation::Update, &[one, two]).expect("update");
    assert_eq!(states, vec![TargetState::Changed, TargetState::Changed]);
    assert!(project.root.join("one.o").exists());
    assert!(project.root.join("two.o").exists());
}

#[test]
fn clean_removes_object_and_depdb() {
    let project = Project::new();
    project.file("src.cxx", "int main() { return 0; }\n");
    project.deps("src.cxx", &[]);

    let ctx = project.context();
    let obj = project.declare_obj(&ctx, "src");
    ctx.perform(Operation::Update, &[obj]).expect("build");
    assert!(project.root.join("src.o").exists());

    let ctx = project.context();
    let obj = project.declare_obj(&ctx, "src");
    let states = ctx.perform(Operation::Clean, &[obj]).expect("clean");

    assert_eq!(states, vec![TargetState::Changed]);
    assert!(!project.root.join("src.o").exists());
    assert!(!project.root.join("src.o.d").exists());
    // Sources are never cleaned
    assert!(project.root.join("src.cxx").exists());
}
