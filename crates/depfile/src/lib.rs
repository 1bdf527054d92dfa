// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Parsers for compiler dependency output.
//!
//! Two formats are understood: GNU make dependency declarations as emitted
//! by `gcc -M` and friends (`target: prereq prereq \` with escaped spaces
//! and `$$`), and MSVC `/showIncludes` stderr notes.

pub use self::make::Parser as MakeParser;

pub mod make;
pub mod msvc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing `:` separator after make target")]
    MissingSeparator,

    #[error("dependency declaration ended mid-escape")]
    TrailingEscape,

    #[error("unable to parse /showIncludes include note line")]
    MalformedNote,

    #[error("unable to parse /showIncludes include error line")]
    MalformedError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_single_line() {
        let deps = make::parse("^: /src/hello.cxx /usr/include/stdio.h\n").unwrap();
        assert_eq!(deps.target, "^");
        assert_eq!(deps.prerequisites, vec!["/src/hello.cxx", "/usr/include/stdio.h"]);
    }

    #[test]
    fn make_continuations() {
        let deps = make::parse("hello.o: hello.cxx \\\n hello.hxx \\\n config.hxx\n").unwrap();
        assert_eq!(deps.target, "hello.o");
        assert_eq!(deps.prerequisites, vec!["hello.cxx", "hello.hxx", "config.hxx"]);
    }

    #[test]
    fn make_escapes() {
        let deps = make::parse("a.o: my\\ file.h price$$.h back\\\\slash.h\n").unwrap();
        assert_eq!(deps.prerequisites, vec!["my file.h", "price$.h", "back\\slash.h"]);
    }

    #[test]
    fn make_target_on_own_line() {
        // Long target names push the first prerequisite to the next line.
        let deps = make::parse("^: \\\n /src/hello.cxx\n").unwrap();
        assert_eq!(deps.prerequisites, vec!["/src/hello.cxx"]);
    }

    #[test]
    fn msvc_note() {
        let line = "Note: including file:   C:\\Program Files (x86)\\VC\\include\\iostream";
        match msvc::classify(line).unwrap() {
            msvc::Line::Include(p) => {
                assert_eq!(p, "C:\\Program Files (x86)\\VC\\include\\iostream");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn msvc_missing_include() {
        let line = "x.cpp(3): fatal error C1083: Cannot open include file: 'd/h.hpp': No such file or directory";
        match msvc::classify(line).unwrap() {
            msvc::Line::MissingInclude(p) => assert_eq!(p, "d/h.hpp"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn msvc_other_error() {
        let line = "x.cpp(10): error C2065: 'foo': undeclared identifier";
        assert!(matches!(msvc::classify(line).unwrap(), msvc::Line::Diagnostic));
    }
}
