// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Directory-keyed variable scopes.
//!
//! Scopes form a tree by directory prefix with the global scope at the
//! top. A lookup starting at a directory walks the ancestor chain,
//! consulting each scope's pattern variables and then its plain map, and
//! finally layers any command-line overrides on top. Override resolution
//! never mutates the underlying maps; resolved results are cached in the
//! scope the lookup started from.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::variable::pattern::PatternMap;
use crate::variable::{Value, Variable, VariableMap, VariablePool, Visibility};

/// One directory scope.
pub struct Scope {
    /// Output directory this scope covers
    pub out_path: PathBuf,

    /// Corresponding source directory for out-of-tree configurations
    pub src_path: Option<PathBuf>,

    /// Project name when this is a project root scope
    pub project: Option<String>,

    root: bool,
    vars: RwLock<VariableMap>,
    patterns: RwLock<PatternMap>,
    override_cache: RwLock<HashMap<String, Option<Value>>>,
}

impl Scope {
    fn new(out_path: PathBuf, root: bool) -> Self {
        Self {
            out_path,
            src_path: None,
            project: None,
            root,
            vars: RwLock::default(),
            patterns: RwLock::default(),
            override_cache: RwLock::default(),
        }
    }

    /// Is this a project root scope?
    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn assign(&self, name: impl ToString, value: Value) {
        self.vars.write().unwrap_or_else(|e| e.into_inner()).assign(name, value);
    }

    pub fn append(&self, name: impl ToString, value: Value) -> Result<(), crate::variable::value::Error> {
        self.vars.write().unwrap_or_else(|e| e.into_inner()).append(name, value)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    /// Mutate the pattern collection (load phase)
    pub fn patterns_mut<R>(&self, f: impl FnOnce(&mut PatternMap) -> R) -> R {
        f(&mut self.patterns.write().unwrap_or_else(|e| e.into_inner()))
    }

    fn pattern_find(&self, name: &str, type_chain: &[&str], variable: &str) -> Option<Value> {
        self.patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .find(name, type_chain, variable)
            .cloned()
    }

    fn cached_override(&self, name: &str, f: impl FnOnce() -> Option<Value>) -> Option<Value> {
        if let Some(hit) = self
            .override_cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return hit.clone();
        }

        let resolved = f();

        self.override_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_owned(), resolved.clone());
        resolved
    }
}

/// The scope tree.
pub struct ScopeMap {
    scopes: RwLock<BTreeMap<PathBuf, Arc<Scope>>>,
    global: Arc<Scope>,
}

impl Default for ScopeMap {
    fn default() -> Self {
        Self {
            scopes: RwLock::default(),
            global: Arc::new(Scope::new(PathBuf::new(), false)),
        }
    }
}

impl ScopeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(&self) -> &Arc<Scope> {
        &self.global
    }

    /// Enter a scope for `dir` (load phase), or fetch the existing one
    pub fn insert(&self, dir: impl Into<PathBuf>, root: bool) -> Arc<Scope> {
        let dir = dir.into();
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());

        Arc::clone(
            scopes
                .entry(dir.clone())
                .or_insert_with(|| Arc::new(Scope::new(dir, root))),
        )
    }

    /// Innermost scope containing `dir`; the global scope as fallback
    pub fn find(&self, dir: &Path) -> Arc<Scope> {
        self.ancestors(dir).into_iter().next().unwrap_or_else(|| Arc::clone(&self.global))
    }

    /// Scopes containing `dir`, innermost first, global excluded
    pub fn ancestors(&self, dir: &Path) -> Vec<Arc<Scope>> {
        let scopes = self.scopes.read().unwrap_or_else(|e| e.into_inner());

        let mut found = vec![];
        let mut cursor = Some(dir);
        while let Some(d) = cursor {
            if let Some(scope) = scopes.get(d) {
                found.push(Arc::clone(scope));
            }
            cursor = d.parent();
        }
        found
    }

    /// Nearest enclosing project root scope
    pub fn root_of(&self, dir: &Path) -> Option<Arc<Scope>> {
        self.ancestors(dir).into_iter().find(|s| s.is_root())
    }
}

/// Context for a scope-chain variable lookup.
pub struct Lookup<'a> {
    pub scopes: &'a ScopeMap,
    pub pool: &'a VariablePool,

    /// Directory the lookup starts from (the target's dir, usually)
    pub start_dir: &'a Path,

    /// Target identity for pattern variables: scope-relative name and the
    /// type chain, most derived first
    pub target: Option<(&'a str, &'a [&'a str])>,
}

impl Lookup<'_> {
    /// Resolve `name` through the scope chain with overrides layered on.
    pub fn find(&self, name: &str) -> Option<Value> {
        let variable = self.pool.find(name);

        // Target/prerequisite visibility never reaches scope maps
        if let Some(v) = &variable {
            if matches!(v.visibility, Visibility::Target | Visibility::Prerequisite) {
                return None;
            }
        }

        let base = self.find_base(name, variable.as_deref());

        match &variable {
            Some(v) if v.overridable && v.has_overrides() => {
                let start = self.scopes.find(self.start_dir);
                start.cached_override(name, || self.apply_overrides(v, base.clone()))
            }
            _ => base,
        }
    }

    fn find_base(&self, name: &str, variable: Option<&Variable>) -> Option<Value> {
        let project_only = variable.is_some_and(|v| v.visibility == Visibility::Project);

        let mut ancestors = self.scopes.ancestors(self.start_dir);
        ancestors.push(Arc::clone(self.scopes.global()));

        let mut passed_root = false;
        for scope in ancestors {
            if project_only && passed_root {
                break;
            }

            if let Some((target_name, type_chain)) = self.target {
                if let Some(value) = scope.pattern_find(target_name, type_chain, name) {
                    return Some(value);
                }
            }

            if let Some(value) = scope.get(name) {
                return Some(value);
            }

            passed_root |= scope.is_root();
        }

        None
    }

    /// Deepest applicable override wins over the base value.
    fn apply_overrides(&self, variable: &Variable, base: Option<Value>) -> Option<Value> {
        let mut best: Option<(usize, Value)> = None;

        for o in variable.overrides_for(self.start_dir) {
            let depth = o.dir.as_ref().map(|d| d.components().count()).unwrap_or(0);
            if best.as_ref().is_none_or(|(prev, _)| depth >= *prev) {
                best = Some((depth, o.value));
            }
        }

        best.map(|(_, value)| value).or(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::Visibility;

    fn pool() -> VariablePool {
        VariablePool::new()
    }

    #[test]
    fn inner_scope_shadows_outer() {
        let scopes = ScopeMap::new();
        scopes.global().assign("jobs", Value::UInt(1));
        let proj = scopes.insert("/work/proj", true);
        proj.assign("jobs", Value::UInt(8));

        let lookup = Lookup {
            scopes: &scopes,
            pool: &pool(),
            start_dir: Path::new("/work/proj/src"),
            target: None,
        };
        assert_eq!(lookup.find("jobs"), Some(Value::UInt(8)));
    }

    #[test]
    fn project_visibility_stops_at_root() {
        let scopes = ScopeMap::new();
        scopes.global().assign("private", Value::Bool(true));
        scopes.insert("/work/proj", true);

        let vars = pool();
        vars.insert("private", None, Visibility::Project, false).unwrap();

        let lookup = Lookup {
            scopes: &scopes,
            pool: &vars,
            start_dir: Path::new("/work/proj/src"),
            target: None,
        };
        // Value only exists above the project root; project visibility
        // prevents crossing it
        assert_eq!(lookup.find("private"), None);
    }

    #[test]
    fn pattern_beats_plain_scope_value() {
        let scopes = ScopeMap::new();
        let proj = scopes.insert("/p", true);
        proj.assign("opt", Value::String("plain".into()));
        proj.patterns_mut(|patterns| {
            patterns
                .insert_glob(fnmatch::Pattern::new("lib*").unwrap(), None)
                .assign("opt", Value::String("patterned".into()));
        });

        let chain = ["file", "target"];
        let lookup = Lookup {
            scopes: &scopes,
            pool: &pool(),
            start_dir: Path::new("/p"),
            target: Some(("libhello", &chain)),
        };
        assert_eq!(lookup.find("opt"), Some(Value::String("patterned".into())));
    }

    #[test]
    fn override_layers_on_top() {
        let scopes = ScopeMap::new();
        let proj = scopes.insert("/p", true);
        proj.assign("config.opt", Value::String("base".into()));

        let vars = pool();
        vars.insert("config.opt", None, Visibility::Global, true).unwrap();
        vars.add_override("config.opt", None, Value::String("forced".into()))
            .unwrap();

        let lookup = Lookup {
            scopes: &scopes,
            pool: &vars,
            start_dir: Path::new("/p"),
            target: None,
        };
        assert_eq!(lookup.find("config.opt"), Some(Value::String("forced".into())));
        // Second lookup hits the per-scope cache
        assert_eq!(lookup.find("config.opt"), Some(Value::String("forced".into())));
    }

    #[test]
    fn scoped_override_outside_dir_is_inert() {
        let scopes = ScopeMap::new();
        let proj = scopes.insert("/p", true);
        proj.assign("config.opt", Value::String("base".into()));

        let vars = pool();
        vars.insert("config.opt", None, Visibility::Global, true).unwrap();
        vars.add_override("config.opt", Some(PathBuf::from("/elsewhere")), Value::String("forced".into()))
            .unwrap();

        let lookup = Lookup {
            scopes: &scopes,
            pool: &vars,
            start_dir: Path::new("/p"),
            target: None,
        };
        assert_eq!(lookup.find("config.opt"), Some(Value::String("base".into())));
    }
}
