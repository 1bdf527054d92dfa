// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! MSVC `/showIncludes` output classification.
//!
//! With `/EP /showIncludes` the compiler prints include notes to stderr,
//! one per line, in a translatable form ending with the header path:
//!
//! ```text
//! Note: including file:   C:\Program Files (x86)\VC\include\iostream
//! ```
//!
//! A missing header ends the stream with a `C1083` fatal error carrying
//! the quoted path. Any line containing ` C####:` is some other compiler
//! diagnostic; everything else is assumed to be an include note, since the
//! note prefix text cannot be relied upon across localisations.

use super::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    /// An include note; the borrowed text is the header path.
    Include(&'a str),

    /// A `C1083` include error naming a header that could not be opened.
    /// The compiler will exit non-zero; callers treat that as expected.
    MissingInclude(&'a str),

    /// Some other `C####` diagnostic; the caller shows the line and fails.
    Diagnostic,
}

/// Classify one stderr line.
pub fn classify(line: &str) -> Result<Line<'_>, Error> {
    match find_error_code(line) {
        Some((code, _)) if code == "1083" => {
            // Path is conveniently quoted with ''
            let end = line.rfind('\'').ok_or(Error::MalformedError)?;
            let start = line[..end].rfind('\'').ok_or(Error::MalformedError)?;
            Ok(Line::MissingInclude(&line[start + 1..end]))
        }
        Some(_) => Ok(Line::Diagnostic),
        None => note_path(line).map(Line::Include),
    }
}

/// Find ` C####:` in the line, returning the digits and their offset.
fn find_error_code(line: &str) -> Option<(&str, usize)> {
    let bytes = line.as_bytes();

    let mut search = 0;
    while let Some(pos) = line[search..].find(':').map(|p| p + search) {
        if pos > 5
            && bytes[pos - 6] == b' '
            && bytes[pos - 5] == b'C'
            && bytes[pos - 4..pos].iter().all(u8::is_ascii_digit)
        {
            return Some((&line[pos - 4..pos], pos - 4));
        }
        search = pos + 1;
    }

    None
}

/// Extract the path from an include note: the text after the last `:`
/// that is not part of a Windows drive letter, with indentation skipped.
fn note_path(line: &str) -> Result<&str, Error> {
    let bytes = line.as_bytes();

    let mut pos = line.rfind(':');

    if let Some(p) = pos {
        // `X:` two characters back, preceded by a space, is a drive letter
        // and part of the path rather than a separator.
        if p > 1
            && p + 1 < line.len()
            && bytes[p - 2] == b' '
            && bytes[p - 1].is_ascii_alphabetic()
            && matches!(bytes[p + 1], b'\\' | b'/')
        {
            pos = line[..p - 2].rfind(':');
        }
    }

    // Indentation after the colon expresses include nesting depth
    let start = pos
        .map(|p| p + 1)
        .and_then(|p| line[p..].find(|c| c != ' ').map(|o| p + o))
        .ok_or(Error::MalformedNote)?;

    Ok(&line[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_note_indentation() {
        let line = "Note: including file:     C:\\VC\\include\\yvals.h";
        assert_eq!(classify(line).unwrap(), Line::Include("C:\\VC\\include\\yvals.h"));
    }

    #[test]
    fn posix_path_note() {
        let line = "Note: including file: /usr/include/stdio.h";
        assert_eq!(classify(line).unwrap(), Line::Include("/usr/include/stdio.h"));
    }

    #[test]
    fn translated_note_text() {
        // Prefix text may be localised; only the trailing path matters
        let line = "Hinweis: Einlesen der Datei:  C:\\include\\foo.h";
        assert_eq!(classify(line).unwrap(), Line::Include("C:\\include\\foo.h"));
    }

    #[test]
    fn c1083_extracts_quoted_path() {
        let line = "t.cpp(1): fatal error C1083: Cannot open include file: 'gen/config.h': No such file or directory";
        assert_eq!(classify(line).unwrap(), Line::MissingInclude("gen/config.h"));
    }

    #[test]
    fn other_code_is_diagnostic() {
        let line = "t.cpp(4): warning C4005: 'MAX': macro redefinition";
        assert_eq!(classify(line).unwrap(), Line::Diagnostic);
    }

    #[test]
    fn garbage_is_error() {
        assert!(classify("no colon here at all").is_err());
    }
}
