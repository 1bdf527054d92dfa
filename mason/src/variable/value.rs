// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Typed variable values.
//!
//! A freshly assigned value is an untyped vector of names; declaring a
//! variable with a type (or an explicit typification request) converts it
//! in place. That conversion is the only supported type change.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::name::Name;

/// Declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ValueType {
    Bool,
    Int,
    UInt,
    String,
    Path,
    DirPath,
    AbsDirPath,
    Name,
    NamePair,
    ProcessPath,
    TargetTriplet,
    ProjectName,
    Json,
    Strings,
    Paths,
    DirPaths,
    Names,
    StringMap,
}

/// An executable's resolved location, optionally with its content hash
/// (used for change detection of tools named in recipes).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessPath {
    pub path: PathBuf,
    pub checksum: Option<String>,
}

impl ProcessPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            checksum: None,
        }
    }
}

/// A `cpu-vendor-system` target triplet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct TargetTriplet {
    pub cpu: String,
    pub vendor: String,
    pub system: String,
}

impl TargetTriplet {
    /// Coarse system class used for option defaulting
    pub fn class(&self) -> &'static str {
        match self.system.as_str() {
            s if s.starts_with("linux") => "linux",
            s if s.starts_with("freebsd") || s.starts_with("openbsd") || s.starts_with("netbsd") => "bsd",
            s if s.starts_with("darwin") || s.starts_with("macos") => "macos",
            s if s.starts_with("win32") || s.starts_with("windows") || s.starts_with("mingw32") => "windows",
            _ => "other",
        }
    }
}

impl FromStr for TargetTriplet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');

        let cpu = parts.next().filter(|p| !p.is_empty());
        let second = parts.next();
        let third = parts.next();

        match (cpu, second, third) {
            // cpu-vendor-system
            (Some(cpu), Some(vendor), Some(system)) => Ok(Self {
                cpu: cpu.to_owned(),
                vendor: vendor.to_owned(),
                system: system.to_owned(),
            }),
            // cpu-system shorthand
            (Some(cpu), Some(system), None) => Ok(Self {
                cpu: cpu.to_owned(),
                vendor: "unknown".to_owned(),
                system: system.to_owned(),
            }),
            _ => Err(Error::InvalidTriplet(s.to_owned())),
        }
    }
}

impl TryFrom<String> for TargetTriplet {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for TargetTriplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.cpu, self.vendor, self.system)
    }
}

/// A variable value.
///
/// `Names` is the raw untyped form; everything else is a typification of
/// it. The variant set mirrors the declared [`ValueType`]s plus `Null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    String(String),
    Path(PathBuf),
    DirPath(PathBuf),
    AbsDirPath(PathBuf),
    Name(Name),
    NamePair(Name, Name),
    ProcessPath(ProcessPath),
    TargetTriplet(TargetTriplet),
    ProjectName(String),
    Json(serde_json::Value),
    Strings(Vec<String>),
    Paths(Vec<PathBuf>),
    DirPaths(Vec<PathBuf>),
    Names(Vec<Name>),
    StringMap(BTreeMap<String, String>),
}

impl Value {
    /// The value's type; untyped names and null have none
    pub fn type_of(&self) -> Option<ValueType> {
        match self {
            Value::Null | Value::Names(_) => None,
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Int(_) => Some(ValueType::Int),
            Value::UInt(_) => Some(ValueType::UInt),
            Value::String(_) => Some(ValueType::String),
            Value::Path(_) => Some(ValueType::Path),
            Value::DirPath(_) => Some(ValueType::DirPath),
            Value::AbsDirPath(_) => Some(ValueType::AbsDirPath),
            Value::Name(_) => Some(ValueType::Name),
            Value::NamePair(..) => Some(ValueType::NamePair),
            Value::ProcessPath(_) => Some(ValueType::ProcessPath),
            Value::TargetTriplet(_) => Some(ValueType::TargetTriplet),
            Value::ProjectName(_) => Some(ValueType::ProjectName),
            Value::Json(_) => Some(ValueType::Json),
            Value::Strings(_) => Some(ValueType::Strings),
            Value::Paths(_) => Some(ValueType::Paths),
            Value::DirPaths(_) => Some(ValueType::DirPaths),
            Value::StringMap(_) => Some(ValueType::StringMap),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) | Value::ProjectName(s) => s.is_empty(),
            Value::Strings(v) => v.is_empty(),
            Value::Paths(v) | Value::DirPaths(v) => v.is_empty(),
            Value::Names(v) => v.is_empty(),
            Value::StringMap(m) => m.is_empty(),
            Value::Json(j) => match j {
                serde_json::Value::Null => true,
                serde_json::Value::Array(a) => a.is_empty(),
                serde_json::Value::Object(o) => o.is_empty(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Append, concatenating vectors and merging maps.
    pub fn append(&mut self, other: Value) -> Result<(), Error> {
        match (self, other) {
            (this @ Value::Null, other) => *this = other,
            (Value::Strings(v), Value::Strings(o)) => v.extend(o),
            (Value::Paths(v), Value::Paths(o)) | (Value::DirPaths(v), Value::DirPaths(o)) => v.extend(o),
            (Value::Names(v), Value::Names(o)) => v.extend(o),
            (Value::StringMap(m), Value::StringMap(o)) => m.extend(o),
            (Value::String(s), Value::String(o)) => s.push_str(&o),
            (this, other) => {
                return Err(Error::Append {
                    to: kind_name(this),
                    from: kind_name(&other),
                });
            }
        }
        Ok(())
    }

    /// Prepend; same pairs as [`Value::append`].
    pub fn prepend(&mut self, other: Value) -> Result<(), Error> {
        match (self, other) {
            (this @ Value::Null, other) => *this = other,
            (Value::Strings(v), Value::Strings(mut o)) => {
                std::mem::swap(v, &mut o);
                v.extend(o);
            }
            (Value::Paths(v), Value::Paths(mut o)) | (Value::DirPaths(v), Value::DirPaths(mut o)) => {
                std::mem::swap(v, &mut o);
                v.extend(o);
            }
            (Value::Names(v), Value::Names(mut o)) => {
                std::mem::swap(v, &mut o);
                v.extend(o);
            }
            (Value::String(s), Value::String(o)) => *s = format!("{o}{s}"),
            (this, other) => {
                return Err(Error::Append {
                    to: kind_name(this),
                    from: kind_name(&other),
                });
            }
        }
        Ok(())
    }

    /// Element access for vector values
    pub fn subscript(&self, index: usize) -> Option<Value> {
        match self {
            Value::Strings(v) => v.get(index).cloned().map(Value::String),
            Value::Paths(v) => v.get(index).cloned().map(Value::Path),
            Value::DirPaths(v) => v.get(index).cloned().map(Value::DirPath),
            Value::Names(v) => v.get(index).cloned().map(Value::Name),
            Value::Json(serde_json::Value::Array(a)) => a.get(index).cloned().map(Value::Json),
            _ => None,
        }
    }

    /// Total order within one type, mirroring assignment compatibility
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::UInt(a), Value::UInt(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) | (Value::ProjectName(a), Value::ProjectName(b)) => Some(a.cmp(b)),
            (Value::Path(a), Value::Path(b))
            | (Value::DirPath(a), Value::DirPath(b))
            | (Value::AbsDirPath(a), Value::AbsDirPath(b)) => Some(a.cmp(b)),
            (Value::Strings(a), Value::Strings(b)) => Some(a.cmp(b)),
            (Value::Paths(a), Value::Paths(b)) | (Value::DirPaths(a), Value::DirPaths(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Convert an untyped names value in place.
    ///
    /// This is the only supported type change; typifying an already-typed
    /// value to the same type is a no-op, to a different type an error.
    pub fn typify(&mut self, vtype: ValueType) -> Result<(), Error> {
        match self.type_of() {
            Some(current) if current == vtype => return Ok(()),
            Some(current) => {
                return Err(Error::Retype {
                    from: current,
                    to: vtype,
                });
            }
            None if self.is_null() => return Ok(()),
            None => {}
        }

        let Value::Names(names) = std::mem::replace(self, Value::Null) else {
            unreachable!("untyped non-null value is names");
        };

        *self = typify_names(names, vtype)?;
        Ok(())
    }
}

fn typify_names(names: Vec<Name>, vtype: ValueType) -> Result<Value, Error> {
    let scalar = |names: &[Name]| -> Result<String, Error> {
        match names {
            [single] => Ok(match &single.dir {
                Some(dir) => format!("{}/{}", dir.display(), single.value),
                None => single.value.clone(),
            }),
            _ => Err(Error::ScalarCardinality(vtype, names.len())),
        }
    };

    let path_of = |name: &Name| -> PathBuf {
        match &name.dir {
            Some(dir) => dir.join(&name.value),
            None => PathBuf::from(&name.value),
        }
    };

    Ok(match vtype {
        ValueType::Bool => Value::Bool(match scalar(&names)?.as_str() {
            "true" => true,
            "false" => false,
            text => return Err(Error::Parse(vtype, text.to_owned())),
        }),
        ValueType::Int => {
            let text = scalar(&names)?;
            Value::Int(text.parse().map_err(|_| Error::Parse(vtype, text))?)
        }
        ValueType::UInt => {
            let text = scalar(&names)?;
            Value::UInt(text.parse().map_err(|_| Error::Parse(vtype, text))?)
        }
        ValueType::String => Value::String(scalar(&names)?),
        ValueType::Path => Value::Path(names.first().map(path_of).ok_or(Error::ScalarCardinality(vtype, 0))?),
        ValueType::DirPath => Value::DirPath(names.first().map(path_of).ok_or(Error::ScalarCardinality(vtype, 0))?),
        ValueType::AbsDirPath => {
            let path = names.first().map(path_of).ok_or(Error::ScalarCardinality(vtype, 0))?;
            if !path.is_absolute() {
                return Err(Error::Parse(vtype, path.display().to_string()));
            }
            Value::AbsDirPath(path)
        }
        ValueType::Name => {
            let mut names = names;
            match names.len() {
                1 => Value::Name(names.swap_remove(0)),
                n => return Err(Error::ScalarCardinality(vtype, n)),
            }
        }
        ValueType::NamePair => {
            let mut names = names;
            match names.len() {
                2 => {
                    let second = names.pop().expect("two names");
                    let first = names.pop().expect("two names");
                    Value::NamePair(first, second)
                }
                n => return Err(Error::ScalarCardinality(vtype, n)),
            }
        }
        ValueType::ProcessPath => Value::ProcessPath(ProcessPath::new(
            names.first().map(path_of).ok_or(Error::ScalarCardinality(vtype, 0))?,
        )),
        ValueType::TargetTriplet => Value::TargetTriplet(scalar(&names)?.parse()?),
        ValueType::ProjectName => Value::ProjectName(scalar(&names)?),
        ValueType::Json => {
            let text = scalar(&names)?;
            Value::Json(serde_json::from_str(&text).map_err(|_| Error::Parse(vtype, text))?)
        }
        ValueType::Strings => Value::Strings(names.into_iter().map(|n| n.value).collect()),
        ValueType::Paths => Value::Paths(names.iter().map(path_of).collect()),
        ValueType::DirPaths => Value::DirPaths(names.iter().map(path_of).collect()),
        ValueType::Names => Value::Names(names),
        ValueType::StringMap => {
            let mut map = BTreeMap::new();
            for name in names {
                let (k, v) = name
                    .value
                    .split_once('=')
                    .ok_or_else(|| Error::Parse(vtype, name.value.clone()))?;
                map.insert(k.to_owned(), v.to_owned());
            }
            Value::StringMap(map)
        }
    })
}

fn kind_name(value: &Value) -> &'static str {
    match value.type_of() {
        Some(ValueType::Bool) => "bool",
        Some(ValueType::Int) => "int",
        Some(ValueType::UInt) => "uint",
        Some(ValueType::String) => "string",
        Some(ValueType::Path) => "path",
        Some(ValueType::DirPath) => "dir-path",
        Some(ValueType::AbsDirPath) => "abs-dir-path",
        Some(ValueType::Name) => "name",
        Some(ValueType::NamePair) => "name-pair",
        Some(ValueType::ProcessPath) => "process-path",
        Some(ValueType::TargetTriplet) => "target-triplet",
        Some(ValueType::ProjectName) => "project-name",
        Some(ValueType::Json) => "json",
        Some(ValueType::Strings) => "strings",
        Some(ValueType::Paths) => "paths",
        Some(ValueType::DirPaths) => "dir-paths",
        Some(ValueType::Names) | None => "names",
        Some(ValueType::StringMap) => "string-map",
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot append {from} to {to}")]
    Append { to: &'static str, from: &'static str },

    #[error("value already typed as {from}, cannot typify to {to}")]
    Retype { from: ValueType, to: ValueType },

    #[error("{0} expects a single name, got {1}")]
    ScalarCardinality(ValueType, usize),

    #[error("invalid {0} value `{1}`")]
    Parse(ValueType, String),

    #[error("invalid target triplet `{0}`")]
    InvalidTriplet(String),
}
