// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The dependency database.
//!
//! A depdb is a line-oriented text file next to its target
//! (`<target-path>.d`) holding the hash chain of build inputs: rule id,
//! tool checksums, source path, discovered dependencies. Lines are
//! consumed in order; the first mismatch between the stored prefix and
//! the new chain truncates everything after it and flips the database to
//! writing mode. A database that was only read and never touched proves
//! the target up to date (subject to the mtime check).

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use fs_err as fs;
use thiserror::Error;

use crate::mtime::Timestamp;

/// End-of-data marker prefix; the trailing line is `#<line-count>`
const MARKER: char = '#';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Reading,
    Writing,
}

/// An open dependency database.
#[derive(Debug)]
pub struct Depdb {
    path: PathBuf,

    /// Validated stored lines (reading) or accumulated new ones (writing)
    lines: Vec<String>,
    pos: usize,

    mode: Mode,
    dirty: bool,
    touched: bool,

    /// Mtime of the existing file at open; `NONEXISTENT` for a fresh one
    mtime: Timestamp,
}

impl Depdb {
    /// Open for the regular read-verify-write cycle.
    ///
    /// An existing well-formed file starts in reading mode with the
    /// cursor at the first line; anything else (missing, truncated,
    /// corrupt) starts over in writing mode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();

        match read_valid(&path)? {
            Some(lines) => Ok(Self {
                mtime: Timestamp::of(&path),
                path,
                lines,
                pos: 0,
                mode: Mode::Reading,
                dirty: false,
                touched: false,
            }),
            None => Ok(Self {
                mtime: Timestamp::NONEXISTENT,
                path,
                lines: vec![],
                pos: 0,
                mode: Mode::Writing,
                dirty: true,
                touched: false,
            }),
        }
    }

    /// Reopen a previously closed database to append byproduct
    /// dependencies; the stored content is kept and the cursor sits at
    /// the end.
    pub fn reopen(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let mut db = Self::open(path)?;
        db.pos = db.lines.len();
        db.mode = Mode::Writing;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reading(&self) -> bool {
        self.mode == Mode::Reading
    }

    pub fn writing(&self) -> bool {
        self.mode == Mode::Writing
    }

    pub fn touched(&self) -> bool {
        self.touched
    }

    /// Mtime of the stored file at open time
    pub fn mtime(&self) -> Timestamp {
        self.mtime
    }

    /// More stored lines to read?
    pub fn more(&self) -> bool {
        self.mode == Mode::Reading && self.pos < self.lines.len()
    }

    /// Next stored line, or None at end (reading mode only)
    pub fn read(&mut self) -> Option<String> {
        if !self.more() {
            return None;
        }
        let line = self.lines[self.pos].clone();
        self.pos += 1;
        Some(line)
    }

    /// The central primitive.
    ///
    /// Reading: consume the next stored line; if it equals `line` return
    /// None. Otherwise truncate the suffix, switch to writing, record
    /// `line`, and return the mismatched old line (empty at end of data)
    /// for diagnostics. Writing: record `line`, return None.
    pub fn expect(&mut self, line: &str) -> Option<String> {
        match self.mode {
            Mode::Writing => {
                self.lines.push(line.to_owned());
                self.pos = self.lines.len();
                self.dirty = true;
                None
            }
            Mode::Reading => {
                if self.lines.get(self.pos).is_some_and(|stored| stored == line) {
                    self.pos += 1;
                    return None;
                }

                let old = self.lines.get(self.pos).cloned().unwrap_or_default();
                self.lines.truncate(self.pos);
                self.lines.push(line.to_owned());
                self.pos = self.lines.len();
                self.mode = Mode::Writing;
                self.dirty = true;
                Some(old)
            }
        }
    }

    /// Append a line (writing mode)
    pub fn write(&mut self, line: &str) {
        debug_assert_eq!(self.mode, Mode::Writing);
        self.lines.push(line.to_owned());
        self.pos = self.lines.len();
        self.dirty = true;
    }

    /// Truncate everything from the cursor on and switch to writing.
    pub fn truncate(&mut self) {
        self.lines.truncate(self.pos);
        self.mode = Mode::Writing;
        self.dirty = true;
    }

    /// Strip trailing lines matching `pred` and switch to writing.
    ///
    /// Used on reopen to rebuild a trailing dynamic-entry section while
    /// keeping the validated chain above it.
    pub fn rstrip(&mut self, pred: impl Fn(&str) -> bool) {
        while self.lines.last().is_some_and(|l| pred(l)) {
            self.lines.pop();
            self.dirty = true;
        }
        self.pos = self.lines.len();
        self.mode = Mode::Writing;
    }

    /// Refresh the database's mtime without altering content.
    ///
    /// Used when cached data remains valid but the inputs it was checked
    /// against moved forward; failing to bump would re-validate forever.
    pub fn touch(&mut self) -> Result<(), Error> {
        self.touched = true;

        if fs::metadata(&self.path).is_ok() {
            filetime::set_file_mtime(&self.path, FileTime::now())
                .map_err(|e| Error::Touch(self.path.clone(), e))?;
            self.mtime = Timestamp::of(&self.path);
        }
        Ok(())
    }

    /// Flush and close.
    ///
    /// A dirty database is rewritten whole: the validated prefix, the new
    /// suffix, a blank separator and the line-count marker.
    pub fn close(mut self) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }

        // Drop any unread stored suffix; it was never validated
        if self.mode == Mode::Reading {
            self.lines.truncate(self.pos);
        }

        let mut file = fs::File::create(&self.path).map_err(Error::Io)?;
        for line in &self.lines {
            writeln!(file, "{line}").map_err(|e| Error::Write(self.path.clone(), e))?;
        }
        writeln!(file).map_err(|e| Error::Write(self.path.clone(), e))?;
        writeln!(file, "{MARKER}{}", self.lines.len()).map_err(|e| Error::Write(self.path.clone(), e))?;
        file.flush().map_err(|e| Error::Write(self.path.clone(), e))?;

        Ok(())
    }

    /// Guard against filesystems with coarse timestamps.
    ///
    /// `start` is captured before the database was (re)written, `end`
    /// after the target itself. If the database ended up with an mtime
    /// later than the target's, a subsequent run would wrongly conclude
    /// "out of date" forever; worse, equal-and-truncated stamps can
    /// produce false "up to date". Detect the inversion inside the
    /// `[start, end]` window and report it.
    pub fn check_mtime(start: Timestamp, db_path: &Path, target_path: &Path, end: Timestamp) -> Result<(), Error> {
        let db_mtime = Timestamp::of(db_path);
        let target_mtime = Timestamp::of(target_path);

        if db_mtime <= target_mtime {
            return Ok(());
        }

        // Both stamps landed inside our write window yet compare
        // inverted: the filesystem rounded them
        if db_mtime >= start && db_mtime <= end {
            return Err(Error::Racy {
                db: db_path.to_path_buf(),
                target: target_path.to_path_buf(),
            });
        }

        Err(Error::TargetStale {
            db: db_path.to_path_buf(),
            target: target_path.to_path_buf(),
        })
    }
}

/// Read and validate a stored database: data lines, a blank line, then
/// the `#<count>` marker.
fn read_valid(path: &Path) -> Result<Option<Vec<String>>, Error> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut lines = vec![];
    for line in BufReader::new(file).lines() {
        lines.push(line.map_err(|e| Error::Read(path.to_path_buf(), e))?);
    }

    let Some(marker) = lines.pop() else {
        return Ok(None);
    };
    if lines.pop().as_deref() != Some("") {
        return Ok(None);
    }

    let count: usize = match marker.strip_prefix(MARKER).map(str::parse) {
        Some(Ok(n)) => n,
        _ => return Ok(None),
    };
    if count != lines.len() {
        // Interrupted write; start over
        return Ok(None);
    }

    Ok(Some(lines))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unable to read depdb {0}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("unable to write depdb {0}")]
    Write(PathBuf, #[source] std::io::Error),

    #[error("unable to touch depdb {0}")]
    Touch(PathBuf, #[source] std::io::Error),

    #[error("depdb {} is newer than its target {}; filesystem timestamps are too coarse", db.display(), target.display())]
    Racy { db: PathBuf, target: PathBuf },

    #[error("target {} was not updated alongside its depdb {}", target.display(), db.display())]
    TargetStale { db: PathBuf, target: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn fresh_db_is_writing() {
        let dir = scratch();
        let db = Depdb::open(dir.path().join("t.d")).unwrap();
        assert!(db.writing());
        assert_eq!(db.mtime(), Timestamp::NONEXISTENT);
    }

    #[test]
    fn write_then_read_back() {
        let dir = scratch();
        let path = dir.path().join("t.d");

        let mut db = Depdb::open(&path).unwrap();
        db.expect("rule 1");
        db.expect("checksum");
        db.write("/src/a.h");
        db.close().unwrap();

        let mut db = Depdb::open(&path).unwrap();
        assert!(db.reading());
        assert_eq!(db.expect("rule 1"), None);
        assert_eq!(db.expect("checksum"), None);
        assert_eq!(db.read().as_deref(), Some("/src/a.h"));
        assert!(!db.more());
        db.close().unwrap();
    }

    #[test]
    fn first_mismatch_truncates_suffix() {
        let dir = scratch();
        let path = dir.path().join("t.d");

        let mut db = Depdb::open(&path).unwrap();
        for line in ["rule 1", "old-options", "/src/a.cxx", "/src/a.h"] {
            db.write(line);
        }
        db.close().unwrap();

        let mut db = Depdb::open(&path).unwrap();
        assert_eq!(db.expect("rule 1"), None);
        // Mismatch reports the old line and flips to writing
        assert_eq!(db.expect("new-options").as_deref(), Some("old-options"));
        assert!(db.writing());
        db.expect("/src/a.cxx");
        db.close().unwrap();

        // The old suffix is gone
        let mut db = Depdb::open(&path).unwrap();
        db.expect("rule 1");
        db.expect("new-options");
        db.expect("/src/a.cxx");
        assert!(!db.more());
        db.close().unwrap();
    }

    #[test]
    fn clean_read_leaves_file_alone() {
        let dir = scratch();
        let path = dir.path().join("t.d");

        let mut db = Depdb::open(&path).unwrap();
        db.write("rule 1");
        db.close().unwrap();

        let before = fs::read_to_string(&path).unwrap();
        let mut db = Depdb::open(&path).unwrap();
        assert_eq!(db.expect("rule 1"), None);
        db.close().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn corrupt_marker_starts_over() {
        let dir = scratch();
        let path = dir.path().join("t.d");
        fs::write(&path, "some line\n\n#42\n").unwrap();

        let db = Depdb::open(&path).unwrap();
        assert!(db.writing());
    }

    #[test]
    fn eof_mismatch_reports_empty() {
        let dir = scratch();
        let path = dir.path().join("t.d");

        let mut db = Depdb::open(&path).unwrap();
        db.write("only");
        db.close().unwrap();

        let mut db = Depdb::open(&path).unwrap();
        assert_eq!(db.expect("only"), None);
        assert_eq!(db.expect("beyond").as_deref(), Some(""));
        db.close().unwrap();
    }

    #[test]
    fn reopen_appends() {
        let dir = scratch();
        let path = dir.path().join("t.d");

        let mut db = Depdb::open(&path).unwrap();
        db.write("header");
        db.close().unwrap();

        let mut db = Depdb::reopen(&path).unwrap();
        db.write("/gen/a.o");
        db.close().unwrap();

        let mut db = Depdb::open(&path).unwrap();
        assert_eq!(db.read().as_deref(), Some("header"));
        assert_eq!(db.read().as_deref(), Some("/gen/a.o"));
        db.close().unwrap();
    }

    #[test]
    fn unread_suffix_dropped_on_dirty_close() {
        let dir = scratch();
        let path = dir.path().join("t.d");

        let mut db = Depdb::open(&path).unwrap();
        for line in ["a", "b", "c"] {
            db.write(line);
        }
        db.close().unwrap();

        let mut db = Depdb::open(&path).unwrap();
        assert_eq!(db.expect("a"), None);
        db.truncate();
        db.close().unwrap();

        let mut db = Depdb::open(&path).unwrap();
        assert_eq!(db.read().as_deref(), Some("a"));
        assert!(!db.more());
        db.close().unwrap();
    }
}
