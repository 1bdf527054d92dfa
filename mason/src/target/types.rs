// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The target type registry.
//!
//! Types form a DAG rooted at `target{}` with single inheritance for
//! is-a checks; identity is by descriptor address. The path-based spine
//! is `file -> path_target -> mtime_target -> target`.

/// A target type descriptor.
#[derive(Debug)]
pub struct TargetType {
    pub name: &'static str,
    pub parent: Option<&'static TargetType>,

    /// Iterate group members instead of the group itself
    pub see_through: bool,

    /// Represents a directory rather than a file
    pub dir_based: bool,

    /// Extension applied when a path is derived and none was specified
    pub default_ext: Option<&'static str>,
}

impl TargetType {
    /// Is-a check by descriptor identity along the parent chain
    pub fn is_a(&'static self, ancestor: &'static TargetType) -> bool {
        let mut cursor = Some(self);
        while let Some(t) = cursor {
            if std::ptr::eq(t, ancestor) {
                return true;
            }
            cursor = t.parent;
        }
        false
    }

    /// Type names from most derived to the root, for pattern matching
    pub fn chain(&'static self) -> Vec<&'static str> {
        let mut names = vec![];
        let mut cursor = Some(self);
        while let Some(t) = cursor {
            names.push(t.name);
            cursor = t.parent;
        }
        names
    }

    /// Does this type carry a filesystem path?
    pub fn is_path_based(&'static self) -> bool {
        self.is_a(&PATH_TARGET) || self.dir_based
    }
}

impl PartialEq for TargetType {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for TargetType {}

/// The abstract root
pub static TARGET: TargetType = TargetType {
    name: "target",
    parent: None,
    see_through: false,
    dir_based: false,
    default_ext: None,
};

/// A no-recipe grouping name
pub static ALIAS: TargetType = TargetType {
    name: "alias",
    parent: Some(&TARGET),
    see_through: true,
    dir_based: false,
    default_ext: None,
};

/// An existing directory (no creation semantics)
pub static DIR: TargetType = TargetType {
    name: "dir",
    parent: Some(&ALIAS),
    see_through: true,
    dir_based: true,
    default_ext: None,
};

/// A created output directory
pub static FSDIR: TargetType = TargetType {
    name: "fsdir",
    parent: Some(&TARGET),
    see_through: false,
    dir_based: true,
    default_ext: None,
};

/// Spine: targets with an atomically cached mtime
pub static MTIME_TARGET: TargetType = TargetType {
    name: "mtime_target",
    parent: Some(&TARGET),
    see_through: false,
    dir_based: false,
    default_ext: None,
};

/// Spine: targets with a write-once path
pub static PATH_TARGET: TargetType = TargetType {
    name: "path_target",
    parent: Some(&MTIME_TARGET),
    see_through: false,
    dir_based: false,
    default_ext: None,
};

/// A regular file
pub static FILE: TargetType = TargetType {
    name: "file",
    parent: Some(&PATH_TARGET),
    see_through: false,
    dir_based: false,
    default_ext: Some(""),
};

/// Generic C/C++ header
pub static H: TargetType = TargetType {
    name: "h",
    parent: Some(&FILE),
    see_through: false,
    dir_based: false,
    default_ext: Some("h"),
};

/// C++ header
pub static HXX: TargetType = TargetType {
    name: "hxx",
    parent: Some(&H),
    see_through: false,
    dir_based: false,
    default_ext: Some("hxx"),
};

/// C translation unit
pub static C: TargetType = TargetType {
    name: "c",
    parent: Some(&FILE),
    see_through: false,
    dir_based: false,
    default_ext: Some("c"),
};

/// C++ translation unit
pub static CXX: TargetType = TargetType {
    name: "cxx",
    parent: Some(&FILE),
    see_through: false,
    dir_based: false,
    default_ext: Some("cxx"),
};

/// Object file group; members below are picked per link variant
pub static OBJ: TargetType = TargetType {
    name: "obj",
    parent: Some(&TARGET),
    see_through: true,
    dir_based: false,
    default_ext: None,
};

/// Object for an executable
pub static OBJE: TargetType = TargetType {
    name: "obje",
    parent: Some(&FILE),
    see_through: false,
    dir_based: false,
    default_ext: None,
};

/// Object for a static library
pub static OBJA: TargetType = TargetType {
    name: "obja",
    parent: Some(&FILE),
    see_through: false,
    dir_based: false,
    default_ext: None,
};

/// Object for a shared library
pub static OBJS: TargetType = TargetType {
    name: "objs",
    parent: Some(&FILE),
    see_through: false,
    dir_based: false,
    default_ext: None,
};

/// Library group
pub static LIB: TargetType = TargetType {
    name: "lib",
    parent: Some(&TARGET),
    see_through: true,
    dir_based: false,
    default_ext: None,
};

/// Static library
pub static LIBA: TargetType = TargetType {
    name: "liba",
    parent: Some(&FILE),
    see_through: false,
    dir_based: false,
    default_ext: Some("a"),
};

/// Shared library
pub static LIBS: TargetType = TargetType {
    name: "libs",
    parent: Some(&FILE),
    see_through: false,
    dir_based: false,
    default_ext: Some("so"),
};

/// All built-in types, for name lookup
static BUILTIN: &[&TargetType] = &[
    &TARGET,
    &ALIAS,
    &DIR,
    &FSDIR,
    &MTIME_TARGET,
    &PATH_TARGET,
    &FILE,
    &H,
    &HXX,
    &C,
    &CXX,
    &OBJ,
    &OBJE,
    &OBJA,
    &OBJS,
    &LIB,
    &LIBA,
    &LIBS,
];

/// Resolve a type by name
pub fn lookup(name: &str) -> Option<&'static TargetType> {
    BUILTIN.iter().copied().find(|t| t.name == name)
}
