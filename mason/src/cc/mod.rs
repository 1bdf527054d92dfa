// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! C/C++ compilation with dynamic header dependency extraction.
//!
//! The compile rule turns one `c{}`/`cxx{}` source into an object
//! variant, discovering every included header through the compiler's
//! preprocessor so that headers participate as real prerequisites on
//! subsequent builds. Discovered sets are cached in the target's depdb.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::action::Operation;
use crate::context::Context;
use crate::target::{Target, types};
use crate::variable::{TargetTriplet, Value};

pub use self::compile::Compile;

pub mod compile;
pub mod dyndep;

/// Compiler family; selects invocation style and dependency output
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CompilerId {
    Gcc,
    Clang,
    Msvc,
}

/// Source language handled by one compile rule instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Lang {
    C,
    Cxx,
}

impl Lang {
    /// The source target type of this language
    pub fn source_type(self) -> &'static types::TargetType {
        match self {
            Lang::C => &types::C,
            Lang::Cxx => &types::CXX,
        }
    }

    /// Variable namespace prefix (`c.poptions`, `cxx.coptions`, ...)
    pub fn var_prefix(self) -> &'static str {
        match self {
            Lang::C => "c",
            Lang::Cxx => "cxx",
        }
    }
}

/// A configured toolchain.
///
/// Loadable from YAML the same way the rest of the configuration
/// surface is; the engine only ever consumes the deserialized form.
#[derive(Debug, Clone, Deserialize)]
pub struct Toolchain {
    pub id: CompilerId,

    /// Compiler executable
    pub path: PathBuf,

    #[serde(default)]
    pub version: String,

    /// Default compilation target
    pub target: TargetTriplet,

    /// Extra system header directories, hashed after user options
    #[serde(default)]
    pub sys_include_dirs: Vec<PathBuf>,
}

impl Toolchain {
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Checksum covering compiler identity and its default target, so a
    /// retargeted compiler invalidates even if the binary is unchanged.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.to_string());
        hasher.update([0]);
        hasher.update(self.path.display().to_string());
        hasher.update([0]);
        hasher.update(&self.version);
        hasher.update([0]);
        hasher.update(self.target.to_string());
        hex::encode(hasher.finalize())
    }

    /// Coarse object-variant naming system, per the extension table
    fn object_system(&self) -> ObjectSystem {
        if self.id == CompilerId::Msvc {
            ObjectSystem::WinMsvc
        } else if self.target.system.contains("mingw32") {
            ObjectSystem::Mingw
        } else if self.target.class() == "macos" {
            ObjectSystem::Darwin
        } else {
            ObjectSystem::Elf
        }
    }
}

/// Object file variant by eventual linkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ObjVariant {
    Exe,
    Static,
    Shared,
}

impl ObjVariant {
    pub fn for_type(ttype: &'static types::TargetType) -> Option<Self> {
        if ttype.is_a(&types::OBJE) {
            Some(ObjVariant::Exe)
        } else if ttype.is_a(&types::OBJA) {
            Some(ObjVariant::Static)
        } else if ttype.is_a(&types::OBJS) {
            Some(ObjVariant::Shared)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ObjectSystem {
    WinMsvc,
    Mingw,
    Darwin,
    Elf,
}

/// Object file extension for `(target system, variant)`.
pub fn object_extension(toolchain: &Toolchain, variant: ObjVariant) -> &'static str {
    match (toolchain.object_system(), variant) {
        (ObjectSystem::WinMsvc, ObjVariant::Exe) => "exe.obj",
        (ObjectSystem::WinMsvc, ObjVariant::Static) => "lib.obj",
        (ObjectSystem::WinMsvc, ObjVariant::Shared) => "dll.obj",
        (ObjectSystem::Mingw, ObjVariant::Exe) => "exe.o",
        (ObjectSystem::Mingw, ObjVariant::Static) => "a.o",
        (ObjectSystem::Mingw, ObjVariant::Shared) => "dll.o",
        (ObjectSystem::Darwin, ObjVariant::Exe) => "o",
        (ObjectSystem::Darwin, ObjVariant::Static) => "a.o",
        (ObjectSystem::Darwin, ObjVariant::Shared) => "dylib.o",
        (ObjectSystem::Elf, ObjVariant::Exe) => "o",
        (ObjectSystem::Elf, ObjVariant::Static) => "a.o",
        (ObjectSystem::Elf, ObjVariant::Shared) => "so.o",
    }
}

/// Collect a strings-typed variable through the full lookup chain.
pub(crate) fn strings_var(ctx: &Context, target: &Target, name: &str) -> Vec<String> {
    match ctx.lookup(target, None, name) {
        Some(Value::Strings(v)) => v,
        Some(Value::String(s)) => vec![s],
        _ => vec![],
    }
}

/// Register the compile rule pair for both languages.
pub fn register(ctx: &Arc<Context>, toolchain: Toolchain) {
    let toolchain = Arc::new(toolchain);

    for lang in [Lang::C, Lang::Cxx] {
        let rule = Arc::new(Compile::new(lang, Arc::clone(&toolchain)));
        for ttype in [&types::OBJE, &types::OBJA, &types::OBJS] {
            ctx.rules.register(ttype, Operation::Update, rule.clone());
            ctx.rules.register(ttype, Operation::Clean, rule.clone());
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid toolchain configuration")]
    Config(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain(id: CompilerId, triplet: &str) -> Toolchain {
        Toolchain {
            id,
            path: PathBuf::from("/usr/bin/cc"),
            version: "14.1.0".into(),
            target: triplet.parse().unwrap(),
            sys_include_dirs: vec![],
        }
    }

    #[test]
    fn extension_table() {
        let elf = toolchain(CompilerId::Gcc, "x86_64-pc-linux-gnu");
        assert_eq!(object_extension(&elf, ObjVariant::Exe), "o");
        assert_eq!(object_extension(&elf, ObjVariant::Static), "a.o");
        assert_eq!(object_extension(&elf, ObjVariant::Shared), "so.o");

        let msvc = toolchain(CompilerId::Msvc, "x86_64-pc-win32-msvc");
        assert_eq!(object_extension(&msvc, ObjVariant::Exe), "exe.obj");
        assert_eq!(object_extension(&msvc, ObjVariant::Shared), "dll.obj");

        let mingw = toolchain(CompilerId::Gcc, "x86_64-w64-mingw32");
        assert_eq!(object_extension(&mingw, ObjVariant::Shared), "dll.o");

        let mac = toolchain(CompilerId::Clang, "aarch64-apple-darwin23");
        assert_eq!(object_extension(&mac, ObjVariant::Shared), "dylib.o");
    }

    #[test]
    fn checksum_covers_target() {
        let a = toolchain(CompilerId::Gcc, "x86_64-pc-linux-gnu");
        let mut b = a.clone();
        b.target = "aarch64-unknown-linux-gnu".parse().unwrap();
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn yaml_round() {
        let t = Toolchain::from_yaml(
            "id: clang\npath: /usr/bin/clang++\nversion: '18.1'\ntarget: x86_64-pc-linux-gnu\n",
        )
        .unwrap();
        assert_eq!(t.id, CompilerId::Clang);
        assert_eq!(t.target.class(), "linux");
    }
}
