// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Target names as they appear in prerequisite declarations.
//!
//! A name is the parsed `dir/type{value.ext}` form handed to the engine by
//! the buildfile loader. The engine resolves names against the dependent's
//! directory and the target-type registry; it never parses buildfile
//! syntax itself.

use std::fmt;
use std::path::{Path, PathBuf};

use path_clean::PathClean;

/// A (possibly qualified) target name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Name {
    /// Directory part; relative names resolve against the dependent
    pub dir: Option<PathBuf>,

    /// Target type name, e.g. `cxx` in `cxx{driver}`
    pub type_name: Option<String>,

    /// The value (leaf) part
    pub value: String,

    /// Explicit extension, if spelled out
    pub ext: Option<String>,
}

impl Name {
    pub fn new(value: impl ToString) -> Self {
        Self {
            value: value.to_string(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, type_name: impl ToString) -> Self {
        self.type_name = Some(type_name.to_string());
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_ext(mut self, ext: impl ToString) -> Self {
        self.ext = Some(ext.to_string());
        self
    }

    /// Is the directory part absolute?
    pub fn absolute(&self) -> bool {
        self.dir.as_deref().is_some_and(Path::is_absolute)
    }

    /// Resolve the directory part against `base`, normalizing lexically
    pub fn effective_dir(&self, base: &Path) -> PathBuf {
        match &self.dir {
            Some(dir) if dir.is_absolute() => dir.clean(),
            Some(dir) => base.join(dir).clean(),
            None => base.to_path_buf(),
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dir) = &self.dir {
            write!(f, "{}/", dir.display())?;
        }
        match (&self.type_name, &self.ext) {
            (Some(t), Some(e)) => write!(f, "{t}{{{}.{e}}}", self.value),
            (Some(t), None) => write!(f, "{t}{{{}}}", self.value),
            (None, Some(e)) => write!(f, "{}.{e}", self.value),
            (None, None) => f.write_str(&self.value),
        }
    }
}

/// Split a filesystem path into `(dir, base, extension)` the way target
/// keys want them: the extension is everything after the last dot of the
/// leaf, absent if the leaf carries no dot.
pub fn split_path(path: &Path) -> (PathBuf, String, Option<String>) {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let leaf = path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();

    match leaf.rsplit_once('.') {
        // A leading dot is part of the name, not an extension separator
        Some((base, ext)) if !base.is_empty() => (dir, base.to_owned(), Some(ext.to_owned())),
        _ => (dir, leaf, None),
    }
}
