// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Header extraction and injection.
//!
//! The extractor runs in one of two phases per invocation: the *cache*
//! phase replays header paths stored in the depdb, matching and updating
//! each; the *compile* phase runs the preprocessor and parses its
//! dependency output. Updating a header that turns out to be generated
//! may surface further headers, so the compile phase restarts the
//! compiler; the already-processed prefix is guaranteed stable (all its
//! inputs are up to date) and is skipped by count on each restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use fs_err as fs;
use path_clean::PathClean;
use thiserror::Error;
use tracing::{debug, trace};

use crate::action::Action;
use crate::algorithm;
use crate::context::Context;
use crate::depdb::Depdb;
use crate::mtime::Timestamp;
use crate::phase::{Phase, PhaseGuard};
use crate::rule;
use crate::target::{PrerequisiteTarget, Target, types};

use super::{CompilerId, Lang, Toolchain};

/// Maps an include-prefix directory (as seen in source text) to the
/// `-I` directory it resolves against.
#[derive(Debug, Default)]
pub struct PrefixMap {
    entries: BTreeMap<PathBuf, PathBuf>,
}

impl PrefixMap {
    /// Build from `-I`/`/I` options that point inside the project's out
    /// root.
    ///
    /// If the target directory is a sub-directory of the include
    /// directory, the prefix is the difference between the two;
    /// otherwise the prefix is empty (and resolution through it requires
    /// an explicitly declared target).
    pub fn build<'a>(options: impl Iterator<Item = &'a str>, out_root: &Path, out_base: &Path) -> Self {
        let mut entries = BTreeMap::new();

        let mut options = options.peekable();
        while let Some(option) = options.next() {
            let dir = if let Some(rest) = option.strip_prefix("-I").or_else(|| option.strip_prefix("/I")) {
                if rest.is_empty() {
                    // `-I dir` split form
                    match options.next() {
                        Some(d) => PathBuf::from(d),
                        None => break,
                    }
                } else {
                    PathBuf::from(rest)
                }
            } else {
                continue;
            };

            // Relative or outside our project: cannot be auto-generated
            if dir.is_relative() || !dir.starts_with(out_root) {
                continue;
            }

            let prefix = out_base.strip_prefix(&dir).map(Path::to_path_buf).unwrap_or_default();

            trace!(prefix = %prefix.display(), dir = %dir.display(), "dependency prefix");

            // First mapping for a prefix wins, matching -I search order
            entries.entry(prefix).or_insert(dir);
        }

        Self { entries }
    }

    /// Resolve a relative reported path against the most qualified
    /// matching prefix. Returns the full path and whether the match was
    /// the empty (explicit-target-only) prefix.
    pub fn resolve(&self, relative: &Path) -> Option<(PathBuf, bool)> {
        let dir = relative.parent().unwrap_or(Path::new(""));

        let mut best: Option<(&PathBuf, &PathBuf)> = None;
        for (prefix, mapped) in &self.entries {
            // An empty prefix trivially matches; it is the last resort
            if dir.starts_with(prefix) && best.is_none_or(|(b, _)| prefix.components().count() >= b.components().count())
            {
                best = Some((prefix, mapped));
            }
        }

        best.map(|(prefix, mapped)| (mapped.join(relative), prefix.as_os_str().is_empty()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One preprocessor run's parsed result
struct Run {
    /// Reported headers in encounter order, source excluded
    headers: Vec<String>,

    /// A `C1083`-style missing include, if the run ended on one
    missing: Option<String>,
}

/// The header extraction engine for one object target.
pub(crate) struct Extractor<'a> {
    pub ctx: &'a Arc<Context>,
    pub action: Action,
    pub target: &'a Arc<Target>,
    pub toolchain: &'a Toolchain,
    pub lang: Lang,
    pub src: PathBuf,

    /// Full option set for the preprocessor invocation
    pub options: &'a [String],

    /// Options contributing `-I` entries to the prefix map (our
    /// poptions plus exported ones from library prerequisites)
    pub prefix_options: &'a [String],
}

impl Extractor<'_> {
    /// Extract headers, injecting each as a prerequisite. Returns
    /// whether any header changed (rendering the object out of date).
    pub fn inject(&self, dd: &mut Depdb) -> Result<bool, Error> {
        let phase = self.ctx.phases.lock(Phase::Match);

        let mut updated = false;
        let mut prefix_map: Option<PrefixMap> = None;
        let mut skip_count = 0usize;
        let mut cache = dd.reading() && !dd.touched();

        'restart: loop {
            if cache {
                debug_assert_eq!(skip_count, 0);

                while dd.more() {
                    let line = dd.read().expect("line available");

                    // An invalid (empty) line means a torn db; recompute
                    if line.is_empty() {
                        dd.truncate();
                        cache = false;
                        continue 'restart;
                    }

                    let restart = self.add(&phase, dd, &mut prefix_map, PathBuf::from(line), true)?;
                    skip_count += 1;

                    if restart {
                        trace!(target = %self.target, "restarting after cached header update");
                        updated = true;
                        dd.touch()?;
                        cache = false;
                        continue 'restart;
                    }
                }

                return Ok(updated);
            }

            let run = self.run_preprocessor()?;

            for header in run.headers.iter().skip(skip_count) {
                let restart = self.add(&phase, dd, &mut prefix_map, PathBuf::from(header), false)?;
                skip_count += 1;
                updated = updated || restart;

                if restart {
                    trace!(target = %self.target, "restarting");
                    continue 'restart;
                }
            }

            if let Some(missing) = run.missing {
                // The compiler stopped at a header it could not open; if
                // we can generate it, updating must change it, which
                // triggers the restart
                let restart = self.add(&phase, dd, &mut prefix_map, PathBuf::from(&missing), false)?;
                skip_count += 1;
                updated = true;

                if !restart {
                    return Err(Error::HeaderNotFound(missing));
                }
                continue 'restart;
            }

            return Ok(updated);
        }
    }

    /// Update and add one header to the prerequisite list.
    ///
    /// Returns whether extraction must restart (the header changed).
    fn add(
        &self,
        phase: &PhaseGuard<'_>,
        dd: &mut Depdb,
        prefix_map: &mut Option<PrefixMap>,
        mut file: PathBuf,
        cache: bool,
    ) -> Result<bool, Error> {
        let header;

        if file.is_relative() {
            // Relative paths come from -MG (or a missing-include error)
            // and are assumed auto-generated
            file = file.clean();
            debug!(header = %file.display(), "non-existent header");

            let map = prefix_map.get_or_insert_with(|| self.build_prefix_map());

            let Some((full, explicit_only)) = map.resolve(&file) else {
                return Err(Error::HeaderNotFound(file.display().to_string()));
            };

            if explicit_only {
                trace!(path = %full.display(), "trying as auto-generated");
                header = self
                    .find_header(&full, false)
                    .ok_or_else(|| Error::HeaderNotFound(file.display().to_string()))?;
            } else {
                trace!(path = %full.display(), "mapped as auto-generated");
                header = self.find_header(&full, true).expect("insert");
            }
            file = full;
        } else {
            // Realize rather than just normalize: symlinked system
            // header layouts produce paths normalization would corrupt.
            // Cached paths went through this when first recorded.
            if !cache {
                file = fs::canonicalize(&file).unwrap_or_else(|_| file.clean());
            }

            trace!(header = %file.display(), "injecting");
            header = self.find_header(&file, true).expect("insert");
        }

        header
            .set_path(file.clone())
            .map_err(|e| Error::Engine(Box::new(rule::Error::rule("cc.dyndep", &header, e))))?;

        algorithm::match_target(self.ctx, self.action, &header).map_err(|e| Error::Engine(Box::new(e)))?;

        // A cached header must be no older than the db itself, otherwise
        // the cached suffix is suspect
        let ts = if cache { dd.mtime() } else { Timestamp::UNKNOWN };
        let restart = algorithm::update_during_match(self.ctx, phase, self.action, &header, ts)
            .map_err(|e| Error::Engine(Box::new(e)))?;

        // Record after the update so we never cache a path we could
        // neither find nor generate
        if !cache {
            dd.expect(&file.display().to_string());
        }

        header.op(self.action).dependents.fetch_add(1, Ordering::AcqRel);
        self.target
            .op(self.action)
            .prerequisite_targets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PrerequisiteTarget::new(header));

        Ok(restart)
    }

    /// Resolve a header path to its target, optionally inserting.
    ///
    /// The target type comes from the extension map; unknown extensions
    /// default to plain `h{}`.
    fn find_header(&self, path: &Path, insert: bool) -> Option<Arc<Target>> {
        let (dir, name, ext) = crate::name::split_path(path);

        let ttype = ext
            .as_deref()
            .and_then(|e| self.ctx.type_for_extension(e))
            .unwrap_or(&types::H);

        if insert {
            let (target, _) = self
                .ctx
                .store
                .insert(ttype, dir, PathBuf::new(), name, Some(ext), true);
            Some(target)
        } else {
            self.ctx
                .store
                .find(ttype, &dir, &PathBuf::new(), &name, Some(ext.as_deref()))
        }
    }

    fn build_prefix_map(&self) -> PrefixMap {
        let out_base = &self.target.dir;
        let out_root = self
            .ctx
            .scopes
            .root_of(out_base)
            .map(|s| s.out_path.clone())
            .unwrap_or_default();

        if out_root.as_os_str().is_empty() {
            return PrefixMap::default();
        }

        PrefixMap::build(self.prefix_options.iter().map(String::as_str), &out_root, out_base)
    }

    /// Run the compiler in dependency-extraction mode and parse its
    /// output.
    fn run_preprocessor(&self) -> Result<Run, Error> {
        let program = &self.toolchain.path;
        let mut cmd = Command::new(program);
        cmd.current_dir(&self.target.dir);
        cmd.stdin(Stdio::null());

        // GCC cannot stream and preprocess at once; it writes the
        // declarations to a temporary file we read after wait
        let mf_path = (self.toolchain.id == CompilerId::Gcc).then(|| {
            let obj = self.target.path().unwrap_or_else(|| self.target.dir.join(&self.target.name));
            PathBuf::from(format!("{}.t", obj.display()))
        });

        match self.toolchain.id {
            CompilerId::Msvc => {
                cmd.arg("/nologo").arg("/EP").arg("/showIncludes");
                cmd.arg(match self.lang {
                    Lang::C => "/TC",
                    Lang::Cxx => "/TP",
                });
                cmd.args(self.options);
            }
            CompilerId::Gcc | CompilerId::Clang => {
                cmd.args(self.options);
                cmd.args(["-M", "-MG", "-MQ", "^"]);
                if let Some(mf) = &mf_path {
                    cmd.arg("-MF").arg(mf);
                }
            }
        }
        cmd.arg(&self.src);

        debug!(program = %program.display(), src = %self.src.display(), "extracting header dependencies");

        let output = cmd
            .output()
            .map_err(|e| Error::Spawn(program.display().to_string(), e))?;

        let parsed = match self.toolchain.id {
            CompilerId::Msvc => self.parse_show_includes(&output),
            _ => {
                let text = match &mf_path {
                    Some(mf) => {
                        let content = fs::read_to_string(mf);
                        let _ = fs::remove_file(mf);
                        content.map_err(Error::Output)?
                    }
                    None => String::from_utf8_lossy(&output.stdout).into_owned(),
                };
                self.parse_make(&text)
            }
        }?;

        if !output.status.success() {
            // A recognized missing include means the non-zero exit is
            // expected; anything else is fatal with stderr attached
            if parsed.missing.is_none() {
                return Err(Error::CompilerFailed {
                    program: program.display().to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
        } else if parsed.missing.is_some() {
            return Err(Error::ExpectedErrorExit);
        }

        Ok(parsed)
    }

    fn parse_make(&self, text: &str) -> Result<Run, Error> {
        if text.trim().is_empty() {
            return Err(Error::EmptyOutput);
        }

        let deps = depfile::make::parse(text)?;

        // The first prerequisite is the source file itself
        Ok(Run {
            headers: deps.prerequisites.into_iter().skip(1).collect(),
            missing: None,
        })
    }

    fn parse_show_includes(&self, output: &std::process::Output) -> Result<Run, Error> {
        let text = String::from_utf8_lossy(&output.stderr);
        let src_leaf = self.src.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();

        let mut headers = vec![];
        let mut missing = None;
        let mut first = true;

        for line in text.lines() {
            if first {
                // The first line is the file being compiled; anything
                // else is diagnostics from before compilation started
                if line != src_leaf {
                    return Err(Error::CompilerFailed {
                        program: self.toolchain.path.display().to_string(),
                        stderr: text.to_string(),
                    });
                }
                first = false;
                continue;
            }

            match depfile::msvc::classify(line)? {
                depfile::msvc::Line::Include(path) => headers.push(path.to_owned()),
                depfile::msvc::Line::MissingInclude(path) => {
                    missing = Some(path.to_owned());
                    break;
                }
                depfile::msvc::Line::Diagnostic => {
                    return Err(Error::CompilerFailed {
                        program: self.toolchain.path.display().to_string(),
                        stderr: text.to_string(),
                    });
                }
            }
        }

        Ok(Run { headers, missing })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("header '{0}' not found and cannot be generated")]
    HeaderNotFound(String),

    #[error("unable to execute {0}")]
    Spawn(String, #[source] std::io::Error),

    #[error("{program} failed to extract header dependencies:\n{stderr}")]
    CompilerFailed { program: String, stderr: String },

    #[error("expected error exit status from compiler")]
    ExpectedErrorExit,

    #[error("no dependency output from compiler")]
    EmptyOutput,

    #[error("unable to read compiler dependency output")]
    Output(#[source] std::io::Error),

    #[error(transparent)]
    Depfile(#[from] depfile::Error),

    #[error(transparent)]
    Depdb(#[from] crate::depdb::Error),

    #[error(transparent)]
    Engine(Box<rule::Error>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_map_canonical_setup() {
        // Headers included as <foo/...>, library target in /proj/foo,
        // poptions carrying -I/proj
        let map = PrefixMap::build(
            ["-O2", "-I/proj", "-I/elsewhere/inc"].into_iter(),
            Path::new("/proj"),
            Path::new("/proj/foo"),
        );

        let (full, explicit_only) = map.resolve(Path::new("foo/bar.h")).expect("resolved");
        assert_eq!(full, PathBuf::from("/proj/foo/bar.h"));
        assert!(!explicit_only);
    }

    #[test]
    fn prefix_map_split_form_and_duplicates() {
        let map = PrefixMap::build(
            ["-I", "/proj/sub", "-I/proj/other"].into_iter(),
            Path::new("/proj"),
            Path::new("/proj/sub/out"),
        );

        // Most qualified prefix wins
        let (full, _) = map.resolve(Path::new("out/gen.h")).expect("resolved");
        assert_eq!(full, PathBuf::from("/proj/sub/out/gen.h"));
    }

    #[test]
    fn prefix_map_ignores_outside_dirs() {
        let map = PrefixMap::build(
            ["-I/usr/include", "-Irelative/dir"].into_iter(),
            Path::new("/proj"),
            Path::new("/proj/out"),
        );
        assert!(map.is_empty());
    }

    #[test]
    fn empty_prefix_flags_explicit_only() {
        // -I inside the project but not an ancestor of out_base
        let map = PrefixMap::build(
            ["-I/proj/include"].into_iter(),
            Path::new("/proj"),
            Path::new("/proj/src"),
        );

        let (full, explicit_only) = map.resolve(Path::new("gen.h")).expect("resolved");
        assert_eq!(full, PathBuf::from("/proj/include/gen.h"));
        assert!(explicit_only);
    }
}
