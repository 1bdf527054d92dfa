// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Target-type/pattern-specific variables.
//!
//! Each scope carries an ordered collection of `(pattern, variable_map)`
//! pairs, consulted during target variable lookup. A pattern is either a
//! shell-style path glob or a regex, optionally qualified by a target
//! type (`cxx{*}: ...`). The most specific matching pattern wins; ties go
//! to the later declaration.

use regex::Regex;

use super::{Value, VariableMap};

#[derive(Debug, Clone)]
pub enum PatternKind {
    Glob(fnmatch::Pattern),
    Regex(Regex),
}

impl PatternKind {
    fn matches(&self, text: &str) -> bool {
        match self {
            PatternKind::Glob(glob) => glob.matches(text),
            PatternKind::Regex(regex) => regex.is_match(text),
        }
    }

    /// Specificity rank; literal characters for globs, expression length
    /// as an approximation for regexes.
    fn specificity(&self) -> usize {
        match self {
            PatternKind::Glob(glob) => glob.literal_len(),
            PatternKind::Regex(regex) => regex.as_str().len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternEntry {
    kind: PatternKind,
    /// Restrict to targets of this type (or a derived type)
    type_name: Option<String>,
    pub vars: VariableMap,
}

/// The ordered pattern collection of one scope.
#[derive(Debug, Clone, Default)]
pub struct PatternMap {
    entries: Vec<PatternEntry>,
}

impl PatternMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a glob pattern; returns the entry's map for population
    pub fn insert_glob(&mut self, pattern: fnmatch::Pattern, type_name: Option<&str>) -> &mut VariableMap {
        self.entries.push(PatternEntry {
            kind: PatternKind::Glob(pattern),
            type_name: type_name.map(str::to_owned),
            vars: VariableMap::new(),
        });
        &mut self.entries.last_mut().expect("just pushed").vars
    }

    /// Add a regex pattern; returns the entry's map for population
    pub fn insert_regex(&mut self, regex: Regex, type_name: Option<&str>) -> &mut VariableMap {
        self.entries.push(PatternEntry {
            kind: PatternKind::Regex(regex),
            type_name: type_name.map(str::to_owned),
            vars: VariableMap::new(),
        });
        &mut self.entries.last_mut().expect("just pushed").vars
    }

    /// Look up `variable` for a target whose scope-relative name is
    /// `name` and whose type chain (most derived first) is `type_chain`.
    pub fn find(&self, name: &str, type_chain: &[&str], variable: &str) -> Option<&Value> {
        let mut best: Option<(usize, &Value)> = None;

        for entry in &self.entries {
            if let Some(tn) = &entry.type_name {
                if !type_chain.contains(&tn.as_str()) {
                    continue;
                }
            }
            if !entry.kind.matches(name) {
                continue;
            }
            let Some(value) = entry.vars.get(variable) else {
                continue;
            };

            let score = entry.kind.specificity();
            if best.is_none_or(|(prev, _)| score >= prev) {
                best = Some((score, value));
            }
        }

        best.map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::Value;

    fn glob(p: &str) -> fnmatch::Pattern {
        fnmatch::Pattern::new(p).unwrap()
    }

    #[test]
    fn most_specific_wins() {
        let mut map = PatternMap::new();
        map.insert_glob(glob("*"), None)
            .assign("opt", Value::String("coarse".into()));
        map.insert_glob(glob("lib*"), None)
            .assign("opt", Value::String("fine".into()));

        assert_eq!(
            map.find("libhello", &["file"], "opt"),
            Some(&Value::String("fine".into()))
        );
        assert_eq!(map.find("driver", &["file"], "opt"), Some(&Value::String("coarse".into())));
    }

    #[test]
    fn type_qualifier_filters() {
        let mut map = PatternMap::new();
        map.insert_glob(glob("*"), Some("cxx"))
            .assign("std", Value::String("c++20".into()));

        assert_eq!(
            map.find("hello", &["cxx", "file", "target"], "std"),
            Some(&Value::String("c++20".into()))
        );
        assert_eq!(map.find("hello", &["c", "file", "target"], "std"), None);
    }

    #[test]
    fn regex_patterns() {
        let mut map = PatternMap::new();
        map.insert_regex(Regex::new(r"^test-\d+$").unwrap(), None)
            .assign("kind", Value::String("numbered".into()));

        assert_eq!(
            map.find("test-42", &["file"], "kind"),
            Some(&Value::String("numbered".into()))
        );
        assert_eq!(map.find("test-x", &["file"], "kind"), None);
    }
}
