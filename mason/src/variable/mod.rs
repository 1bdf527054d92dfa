// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Variables, pools and maps.
//!
//! Variables are interned in a pool (optionally a project-private pool
//! chained to the public one) and carry their declared type, visibility
//! and override state. Values live in per-scope / per-target / per-rule
//! maps keyed by variable name; lookup layers those maps (see
//! [`crate::scope`]).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use thiserror::Error;

pub use self::value::{ProcessPath, TargetTriplet, Value, ValueType};

pub mod pattern;
pub mod value;

/// How far down the scope tree a variable's value propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Visibility {
    Global,
    Project,
    Scope,
    Target,
    Prerequisite,
}

/// A command-line style override attached to a variable.
///
/// `dir` limits the override to scopes at or below that directory; a
/// global override has none.
#[derive(Debug, Clone)]
pub struct Override {
    pub dir: Option<PathBuf>,
    pub value: Value,
}

/// An interned variable.
#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub vtype: Option<ValueType>,
    pub visibility: Visibility,
    pub overridable: bool,

    // Populated during load only
    overrides: RwLock<Vec<Override>>,
}

impl Variable {
    /// Overrides applicable at `dir` (global ones always apply)
    pub fn overrides_for(&self, dir: &std::path::Path) -> Vec<Override> {
        self.overrides
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|o| o.dir.as_deref().is_none_or(|d| dir.starts_with(d)))
            .cloned()
            .collect()
    }

    pub fn has_overrides(&self) -> bool {
        !self.overrides.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

/// A pool of interned variables.
///
/// Insertion is only MT-safe during the load phase; later phases treat
/// the pool as read-only.
#[derive(Debug, Default)]
pub struct VariablePool {
    vars: RwLock<HashMap<String, Arc<Variable>>>,
    public: Option<Arc<VariablePool>>,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A project-private pool chaining to the public `pool`
    pub fn with_public(pool: Arc<VariablePool>) -> Self {
        Self {
            vars: RwLock::default(),
            public: Some(pool),
        }
    }

    /// Intern a variable, or return the existing entry.
    ///
    /// Redeclaring with a different type is an error; redeclaring with no
    /// type adopts the existing one.
    pub fn insert(
        &self,
        name: impl ToString,
        vtype: Option<ValueType>,
        visibility: Visibility,
        overridable: bool,
    ) -> Result<Arc<Variable>, Error> {
        let name = name.to_string();

        if let Some(existing) = self.find(&name) {
            if vtype.is_some() && existing.vtype != vtype {
                return Err(Error::TypeConflict {
                    name,
                    declared: existing.vtype,
                    requested: vtype,
                });
            }
            return Ok(existing);
        }

        let variable = Arc::new(Variable {
            name: name.clone(),
            vtype,
            visibility,
            overridable,
            overrides: RwLock::default(),
        });

        let mut vars = self.vars.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(vars.entry(name).or_insert(variable)))
    }

    /// Find a variable here or in the chained public pool
    pub fn find(&self, name: &str) -> Option<Arc<Variable>> {
        let vars = self.vars.read().unwrap_or_else(|e| e.into_inner());

        vars.get(name)
            .cloned()
            .or_else(|| self.public.as_ref().and_then(|p| p.find(name)))
    }

    /// Register `alias` as another name for `name`; the two resolve to
    /// the same interned variable (the alias ring).
    pub fn alias(&self, name: &str, alias: impl ToString) -> Result<(), Error> {
        let variable = self.find(name).ok_or_else(|| Error::Unknown(name.to_owned()))?;

        let mut vars = self.vars.write().unwrap_or_else(|e| e.into_inner());
        vars.insert(alias.to_string(), variable);
        Ok(())
    }

    /// Attach an override; the variable must be overridable.
    pub fn add_override(&self, name: &str, dir: Option<PathBuf>, value: Value) -> Result<(), Error> {
        let variable = self.find(name).ok_or_else(|| Error::Unknown(name.to_owned()))?;

        if !variable.overridable {
            return Err(Error::NotOverridable(name.to_owned()));
        }

        variable
            .overrides
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Override { dir, value });
        Ok(())
    }
}

/// A name-keyed value map (scope, target, or rule-specific).
#[derive(Debug, Clone, Default)]
pub struct VariableMap {
    values: HashMap<String, Value>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Assign, replacing any previous value
    pub fn assign(&mut self, name: impl ToString, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    /// Append to an existing value (or assign if none)
    pub fn append(&mut self, name: impl ToString, value: Value) -> Result<(), value::Error> {
        let name = name.to_string();
        match self.values.get_mut(&name) {
            Some(existing) => existing.append(value),
            None => {
                self.values.insert(name, value);
                Ok(())
            }
        }
    }

    /// Prepend to an existing value (or assign if none)
    pub fn prepend(&mut self, name: impl ToString, value: Value) -> Result<(), value::Error> {
        let name = name.to_string();
        match self.values.get_mut(&name) {
            Some(existing) => existing.prepend(value),
            None => {
                self.values.insert(name, value);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Typify an entry in place per the declared variable type
    pub fn typify(&mut self, name: &str, vtype: ValueType) -> Result<(), value::Error> {
        if let Some(value) = self.values.get_mut(name) {
            value.typify(vtype)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("variable `{name}` already declared as {declared:?}, requested {requested:?}")]
    TypeConflict {
        name: String,
        declared: Option<ValueType>,
        requested: Option<ValueType>,
    },

    #[error("unknown variable `{0}`")]
    Unknown(String),

    #[error("variable `{0}` is not overridable")]
    NotOverridable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_interns_once() {
        let pool = VariablePool::new();
        let a = pool
            .insert("cc.poptions", Some(ValueType::Strings), Visibility::Project, true)
            .unwrap();
        let b = pool.insert("cc.poptions", None, Visibility::Project, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn pool_rejects_retype() {
        let pool = VariablePool::new();
        pool.insert("x", Some(ValueType::Strings), Visibility::Global, false)
            .unwrap();
        assert!(pool.insert("x", Some(ValueType::Bool), Visibility::Global, false).is_err());
    }

    #[test]
    fn private_pool_chains_to_public() {
        let public = Arc::new(VariablePool::new());
        public
            .insert("cc.coptions", Some(ValueType::Strings), Visibility::Project, true)
            .unwrap();

        let private = VariablePool::with_public(Arc::clone(&public));
        assert!(private.find("cc.coptions").is_some());
    }

    #[test]
    fn alias_resolves_to_same_variable() {
        let pool = VariablePool::new();
        pool.insert("cxx.std", Some(ValueType::String), Visibility::Project, true)
            .unwrap();
        pool.alias("cxx.std", "cxx.standard").unwrap();

        let a = pool.find("cxx.std").unwrap();
        let b = pool.find("cxx.standard").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn override_requires_flag() {
        let pool = VariablePool::new();
        pool.insert("fixed", None, Visibility::Global, false).unwrap();
        assert!(matches!(
            pool.add_override("fixed", None, Value::Bool(true)),
            Err(Error::NotOverridable(_))
        ));
    }

    #[test]
    fn scoped_override_filtering() {
        let pool = VariablePool::new();
        pool.insert("opt", None, Visibility::Global, true).unwrap();
        pool.add_override("opt", Some(PathBuf::from("/proj/sub")), Value::Bool(true))
            .unwrap();

        let var = pool.find("opt").unwrap();
        assert_eq!(var.overrides_for(std::path::Path::new("/proj/sub/dir")).len(), 1);
        assert!(var.overrides_for(std::path::Path::new("/proj/other")).is_empty());
    }
}
