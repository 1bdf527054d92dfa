// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! GNU make dependency declarations.
//!
//! The declarations we consume come from `-M`-style preprocessor runs and
//! carry one target, a `:` separator and whitespace-separated prerequisite
//! paths. Spaces inside paths arrive escaped as `\ `, literal dollars as
//! `$$`, and long lines are split with trailing-`\` continuations.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::tag,
    character::complete::none_of,
    combinator::{map, value},
    multi::many1,
};

use super::Error;

/// A parsed dependency declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependencies {
    pub target: String,
    pub prerequisites: Vec<String>,
}

/// Parse a complete declaration, following continuations.
pub fn parse(content: &str) -> Result<Dependencies, Error> {
    let mut parser = Parser::new();
    let mut prerequisites = vec![];

    for line in content.lines() {
        prerequisites.extend(parser.feed_line(line)?);
        if parser.is_done() {
            break;
        }
    }

    let target = parser.target.ok_or(Error::MissingSeparator)?;

    Ok(Dependencies { target, prerequisites })
}

/// Parse a whole file of declarations, as written by `-MF`-style tools
/// that emit one declaration per produced target.
pub fn parse_all(content: &str) -> Result<Vec<Dependencies>, Error> {
    let mut declarations = vec![];
    let mut parser = Parser::new();
    let mut prerequisites = vec![];

    for line in content.lines() {
        // Blank lines separate declarations
        if parser.target.is_none() && line.trim().is_empty() {
            continue;
        }

        prerequisites.extend(parser.feed_line(line)?);

        if parser.is_done() {
            let done = std::mem::take(&mut parser);
            declarations.push(Dependencies {
                target: done.target.unwrap_or_default(),
                prerequisites: std::mem::take(&mut prerequisites),
            });
        }
    }

    // A trailing declaration without a final newline is still complete
    if let Some(target) = parser.target {
        declarations.push(Dependencies { target, prerequisites });
    }

    Ok(declarations)
}

/// Incremental line-by-line parser.
///
/// Callers that stream compiler output (and may abandon it mid-way on a
/// restart) feed one line at a time and receive the prerequisites found on
/// that line.
#[derive(Debug, Default)]
pub struct Parser {
    target: Option<String>,
    done: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declaration finished (a line without a trailing continuation seen)
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume one line, yielding the prerequisites it carries.
    pub fn feed_line(&mut self, line: &str) -> Result<Vec<String>, Error> {
        if self.done {
            return Ok(vec![]);
        }

        let (line, continued) = match line.strip_suffix('\\') {
            Some(rest) => (rest, true),
            None => (line, false),
        };

        let mut rest = line;

        // First line carries `target:`
        if self.target.is_none() {
            let colon = find_separator(rest).ok_or(Error::MissingSeparator)?;
            self.target = Some(rest[..colon].trim().to_owned());
            rest = &rest[colon + 1..];
        }

        let mut prerequisites = vec![];

        loop {
            let trimmed = rest.trim_start_matches(' ');
            if trimmed.is_empty() {
                break;
            }
            match token(trimmed) {
                Ok((remainder, tok)) => {
                    prerequisites.push(tok);
                    rest = remainder;
                }
                Err(_) => return Err(Error::TrailingEscape),
            }
        }

        if !continued {
            self.done = true;
        }

        Ok(prerequisites)
    }
}

/// Locate the target/prerequisite `:` separator, skipping Windows drive
/// letters (`c:\...` as the target itself).
fn find_separator(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut search = 0;

    while let Some(pos) = line[search..].find(':').map(|p| p + search) {
        let followed_by_sep = bytes.get(pos + 1).is_some_and(|c| matches!(c, b'\\' | b'/'));
        if pos == 1 && followed_by_sep && bytes[0].is_ascii_alphabetic() {
            search = pos + 1;
            continue;
        }
        return Some(pos);
    }

    None
}

/// One prerequisite token: a run of fragments up to an unescaped space.
fn token(input: &str) -> IResult<&str, String> {
    map(many1(fragment), |chars| chars.into_iter().collect())(input)
}

fn fragment(input: &str) -> IResult<&str, char> {
    alt((
        value('$', tag("$$")),
        value(' ', tag("\\ ")),
        value('\\', tag("\\\\")),
        none_of(" "),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_feed() {
        let mut parser = Parser::new();
        let first = parser.feed_line("^: a.cxx b.h \\").unwrap();
        assert_eq!(first, vec!["a.cxx", "b.h"]);
        assert!(!parser.is_done());

        let second = parser.feed_line(" c.h").unwrap();
        assert_eq!(second, vec!["c.h"]);
        assert!(parser.is_done());

        // Further lines are ignored once complete
        assert!(parser.feed_line("noise").unwrap().is_empty());
    }

    #[test]
    fn windows_target_drive() {
        let deps = parse("c:\\out\\a.obj: c:\\src\\a.cpp\n").unwrap();
        assert_eq!(deps.target, "c:\\out\\a.obj");
        assert_eq!(deps.prerequisites, vec!["c:\\src\\a.cpp"]);
    }

    #[test]
    fn missing_separator() {
        assert!(matches!(parse("no separator here\n"), Err(Error::MissingSeparator)));
    }

    #[test]
    fn parse_all_multiple_declarations() {
        let all = parse_all("a.o: in.x common.h\n\nb.o: in.x \\\n other.h\n").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].target, "a.o");
        assert_eq!(all[0].prerequisites, vec!["in.x", "common.h"]);
        assert_eq!(all[1].target, "b.o");
        assert_eq!(all[1].prerequisites, vec!["in.x", "other.h"]);
    }

    #[test]
    fn parse_all_trailing_declaration() {
        let all = parse_all("only.o: dep.h \\").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].target, "only.o");
        assert_eq!(all[0].prerequisites, vec!["dep.h"]);
    }
}
