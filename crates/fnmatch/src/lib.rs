// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Shell-style path patterns, compiled to anchored regular expressions.
//!
//! Used for pattern-scoped variable maps: `*.cxx` matches any name in the
//! same directory, `**` spans directory separators, `?` matches a single
//! non-separator character and `[...]` character classes pass through.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde_core::de::{self, Deserialize};
use snafu::{ResultExt, Snafu};

/// A compiled shell-style pattern.
///
/// Ordering of candidate patterns is up to the caller; [`Pattern::literal_len`]
/// exposes how many non-wildcard characters the pattern carries so that the
/// most specific candidate can win.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    literal_len: usize,
}

impl Pattern {
    /// Compile a shell-style pattern.
    pub fn new(pattern: &str) -> Result<Self, Error> {
        let (expression, literal_len) = translate(pattern)?;

        let regex = Regex::new(&expression).context(CompileSnafu { pattern })?;

        Ok(Self {
            source: pattern.to_owned(),
            regex,
            literal_len,
        })
    }

    /// The original pattern text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of literal (non-wildcard) characters
    pub fn literal_len(&self) -> usize {
        self.literal_len
    }

    /// Test a path (or path tail) against the pattern
    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> de::Deserialize<'de> for Pattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Translate a glob into an anchored regex, counting literal characters.
fn translate(pattern: &str) -> Result<(String, usize), Error> {
    let mut expression = String::with_capacity(pattern.len() * 2 + 2);
    let mut literal_len = 0;

    expression.push('^');

    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**` spans separators
                    expression.push_str(".*");
                } else {
                    expression.push_str("[^/]*");
                }
            }
            '?' => expression.push_str("[^/]"),
            '[' => {
                // Pass the class through, honouring `!` negation
                let mut class = String::from("[");
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    if matches!(c, '\\' | '^') {
                        class.push('\\');
                    }
                    class.push(c);
                }
                if !closed {
                    return Err(Error::UnterminatedClass {
                        pattern: pattern.to_owned(),
                    });
                }
                class.push(']');
                expression.push_str(&class);
                literal_len += 1;
            }
            _ => {
                if regex_syntax_char(c) {
                    expression.push('\\');
                }
                expression.push(c);
                literal_len += 1;
            }
        }
    }

    expression.push('$');

    Ok((expression, literal_len))
}

fn regex_syntax_char(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' | '#' | '&' | '-' | '~'
    )
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid pattern `{pattern}`"))]
    Compile { pattern: String, source: regex::Error },

    #[snafu(display("unterminated character class in `{pattern}`"))]
    UnterminatedClass { pattern: String },
}
