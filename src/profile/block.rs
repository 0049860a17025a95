//! Managed-block text model.
//!
//! A block is delimited by whole-line markers:
//!
//! ```text
//! # >>> devstation:go >>>
//! export GOROOT="/usr/local/go"
//! # <<< devstation:go <<<
//! ```
//!
//! All functions here are pure string transforms; the file handling lives in
//! [`super::ProfileMutator`].

use serde::Serialize;
use thiserror::Error;

use crate::registry::is_block_name;

const BEGIN_PREFIX: &str = "# >>> devstation:";
const BEGIN_SUFFIX: &str = " >>>";
const END_PREFIX: &str = "# <<< devstation:";
const END_SUFFIX: &str = " <<<";

/// One managed block as found in a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileBlock {
    pub name: String,
    /// Lines between the markers, each newline-terminated.
    pub content: String,
}

/// Result of a profile edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Unchanged,
    Inserted,
    Replaced,
    Removed,
}

impl Mutation {
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block {name:?} opened on line {line} is never closed")]
    Unterminated { name: String, line: usize },
    #[error("block name {0:?} must match [A-Za-z0-9._-]+")]
    InvalidName(String),
    #[error("content for block {0:?} contains a devstation marker line")]
    MarkerInContent(String),
}

#[must_use]
pub fn begin_marker(name: &str) -> String {
    format!("{BEGIN_PREFIX}{name}{BEGIN_SUFFIX}")
}

#[must_use]
pub fn end_marker(name: &str) -> String {
    format!("{END_PREFIX}{name}{END_SUFFIX}")
}

fn marker_name<'a>(line: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    line.trim_end()
        .strip_prefix(prefix)?
        .strip_suffix(suffix)
        .filter(|n| is_block_name(n))
}

fn is_marker(line: &str) -> bool {
    marker_name(line, BEGIN_PREFIX, BEGIN_SUFFIX).is_some()
        || marker_name(line, END_PREFIX, END_SUFFIX).is_some()
}

/// Normalize block content: newline-terminated, no trailing blank lines.
fn normalize_content(content: &str) -> String {
    let trimmed = content.trim_end_matches(['\n', ' ', '\t']);
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

/// Full text of a block including markers.
#[must_use]
pub fn render(name: &str, content: &str) -> String {
    format!(
        "{}\n{}{}\n",
        begin_marker(name),
        normalize_content(content),
        end_marker(name)
    )
}

/// Line range `[begin, end]` (inclusive, zero-based) of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    name: String,
    begin: usize,
    end: usize,
}

/// Blank line written between existing text and an appended block.
const SEPARATOR: &str = "\n";

fn lines(contents: &str) -> Vec<&str> {
    contents.split_inclusive('\n').collect()
}

/// Locate every managed block. An end marker with no open block is plain
/// text; a begin marker with no matching end is an error.
fn scan(lines: &[&str]) -> Result<Vec<Span>, BlockError> {
    let mut spans = Vec::new();
    let mut open: Option<(String, usize)> = None;
    for (i, line) in lines.iter().enumerate() {
        if let Some(name) = marker_name(line, BEGIN_PREFIX, BEGIN_SUFFIX) {
            if let Some((open_name, at)) = open {
                return Err(BlockError::Unterminated {
                    name: open_name,
                    line: at + 1,
                });
            }
            open = Some((name.to_string(), i));
            continue;
        }
        if let Some(name) = marker_name(line, END_PREFIX, END_SUFFIX)
            && let Some((open_name, at)) = &open
            && open_name == name
        {
            spans.push(Span {
                name: open_name.clone(),
                begin: *at,
                end: i,
            });
            open = None;
        }
    }
    if let Some((name, at)) = open {
        return Err(BlockError::Unterminated { name, line: at + 1 });
    }
    Ok(spans)
}

/// Every block in file order.
pub fn parse(contents: &str) -> Result<Vec<ProfileBlock>, BlockError> {
    let lines = lines(contents);
    Ok(scan(&lines)?
        .into_iter()
        .map(|span| ProfileBlock {
            content: lines[span.begin + 1..span.end].concat(),
            name: span.name,
        })
        .collect())
}

/// First block named `name`.
pub fn find(contents: &str, name: &str) -> Result<Option<ProfileBlock>, BlockError> {
    Ok(parse(contents)?.into_iter().find(|b| b.name == name))
}

/// Insert or replace block `name`. Duplicates collapse into the first one.
pub fn upsert(contents: &str, name: &str, content: &str) -> Result<(String, Mutation), BlockError> {
    if !is_block_name(name) {
        return Err(BlockError::InvalidName(name.to_string()));
    }
    if content.lines().any(is_marker) {
        return Err(BlockError::MarkerInContent(name.to_string()));
    }
    let lines = lines(contents);
    let spans: Vec<Span> = scan(&lines)?
        .into_iter()
        .filter(|s| s.name == name)
        .collect();
    let rendered = render(name, content);

    let Some(first) = spans.first() else {
        let mut out = contents.to_string();
        if !out.is_empty() {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(SEPARATOR);
        }
        out.push_str(&rendered);
        return Ok((out, Mutation::Inserted));
    };

    let existing = lines[first.begin..=first.end].concat();
    let existing_normalized = existing.trim_end_matches('\n');
    if spans.len() == 1 && existing_normalized == rendered.trim_end_matches('\n') {
        return Ok((contents.to_string(), Mutation::Unchanged));
    }

    let mut out = String::with_capacity(contents.len() + rendered.len());
    let mut i = 0;
    for (n, span) in spans.iter().enumerate() {
        if n == 0 {
            out.push_str(&lines[i..span.begin].concat());
            out.push_str(&rendered);
        } else {
            out.push_str(&lines[i..separated_begin(&lines, i, span)].concat());
        }
        i = span.end + 1;
    }
    out.push_str(&lines[i..].concat());
    Ok((out, Mutation::Replaced))
}

/// Remove every block named `name`.
pub fn remove(contents: &str, name: &str) -> Result<(String, Mutation), BlockError> {
    let lines = lines(contents);
    let spans: Vec<Span> = scan(&lines)?
        .into_iter()
        .filter(|s| s.name == name)
        .collect();
    if spans.is_empty() {
        return Ok((contents.to_string(), Mutation::Unchanged));
    }

    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    let mut i = 0;
    for span in &spans {
        kept.extend_from_slice(&lines[i..separated_begin(&lines, i, span)]);
        i = span.end + 1;
    }
    kept.extend_from_slice(&lines[i..]);
    Ok((kept.concat(), Mutation::Removed))
}

/// Start of `span` including the separator line `upsert` put before it.
/// Lines before `from` belong to an earlier block and are never taken.
fn separated_begin(lines: &[&str], from: usize, span: &Span) -> usize {
    if span.begin > from && lines[span.begin - 1] == SEPARATOR {
        span.begin - 1
    } else {
        span.begin
    }
}

/// Drop unmanaged lines containing any of `patterns`. Lines inside managed
/// blocks are never touched. Returns the new text and the number of lines
/// removed.
pub fn remove_legacy_lines(
    contents: &str,
    patterns: &[String],
) -> Result<(String, usize), BlockError> {
    let lines = lines(contents);
    let spans = scan(&lines)?;
    let inside = |i: usize| spans.iter().any(|s| s.begin <= i && i <= s.end);
    let mut removed = 0;
    let mut out = String::with_capacity(contents.len());
    for (i, line) in lines.iter().enumerate() {
        if !inside(i) && patterns.iter().any(|p| !p.is_empty() && line.contains(p.as_str())) {
            removed += 1;
            continue;
        }
        out.push_str(line);
    }
    Ok((out, removed))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GO: &str = "export GOROOT=\"/usr/local/go\"\n";

    #[test]
    fn render_shape() {
        assert_eq!(
            render("go", GO),
            "# >>> devstation:go >>>\nexport GOROOT=\"/usr/local/go\"\n# <<< devstation:go <<<\n"
        );
        assert_eq!(render("x", "a"), render("x", "a\n\n"));
        assert_eq!(
            render("x", ""),
            "# >>> devstation:x >>>\n# <<< devstation:x <<<\n"
        );
    }

    #[test]
    fn upsert_appends_with_blank_separator() {
        let (out, m) = upsert("alias ll='ls -l'", "go", GO).unwrap();
        assert_eq!(m, Mutation::Inserted);
        assert_eq!(out, format!("alias ll='ls -l'\n\n{}", render("go", GO)));
    }

    #[test]
    fn upsert_into_empty_file() {
        let (out, m) = upsert("", "go", GO).unwrap();
        assert_eq!(m, Mutation::Inserted);
        assert_eq!(out, render("go", GO));
    }

    #[test]
    fn upsert_identical_is_unchanged() {
        let (once, _) = upsert("x=1\n", "go", GO).unwrap();
        let (twice, m) = upsert(&once, "go", GO).unwrap();
        assert_eq!(m, Mutation::Unchanged);
        assert_eq!(once, twice);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let start = format!("a\n{}b\n", render("go", "export X=1\n"));
        let (out, m) = upsert(&start, "go", GO).unwrap();
        assert_eq!(m, Mutation::Replaced);
        assert_eq!(out, format!("a\n{}b\n", render("go", GO)));
        let blocks = parse(&out).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, GO);
    }

    #[test]
    fn duplicates_collapse_to_first_position() {
        let start = format!(
            "head\n{}middle\n{}tail\n",
            render("go", "old1\n"),
            render("go", "old2\n")
        );
        let (out, m) = upsert(&start, "go", GO).unwrap();
        assert_eq!(m, Mutation::Replaced);
        assert_eq!(out, format!("head\n{}middle\ntail\n", render("go", GO)));
    }

    #[test]
    fn duplicates_with_same_content_still_collapse() {
        let start = format!("{}{}", render("go", GO), render("go", GO));
        let (out, m) = upsert(&start, "go", GO).unwrap();
        assert_eq!(m, Mutation::Replaced);
        assert_eq!(out, render("go", GO));
    }

    #[test]
    fn remove_all_copies_and_separator() {
        let (with, _) = upsert("x=1\n", "go", GO).unwrap();
        let (without, m) = remove(&with, "go").unwrap();
        assert_eq!(m, Mutation::Removed);
        assert_eq!(without, "x=1\n");

        let dup = format!("{}a\n{}", render("go", GO), render("go", GO));
        assert_eq!(remove(&dup, "go").unwrap().0, "a\n");
    }

    #[test]
    fn remove_keeps_user_blank_lines() {
        let text = "x=1\n\n";
        let (with, _) = upsert(text, "go", GO).unwrap();
        assert_eq!(with, format!("x=1\n\n\n{}", render("go", GO)));
        assert_eq!(remove(&with, "go").unwrap().0, text);
    }

    #[test]
    fn remove_from_middle_takes_its_separator() {
        let (with, _) = upsert("a\n", "go", GO).unwrap();
        let (with, _) = upsert(&with, "node", "N\n").unwrap();
        let (out, _) = remove(&with, "go").unwrap();
        assert_eq!(out, format!("a\n\n{}", render("node", "N\n")));
        let (out, _) = remove(&out, "node").unwrap();
        assert_eq!(out, "a\n");
    }

    #[test]
    fn remove_missing_is_unchanged() {
        let (out, m) = remove("x=1\n", "go").unwrap();
        assert_eq!(m, Mutation::Unchanged);
        assert_eq!(out, "x=1\n");
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let text = "a\n# >>> devstation:go >>>\nexport X=1\n";
        assert_eq!(
            upsert(text, "go", GO).unwrap_err(),
            BlockError::Unterminated {
                name: "go".into(),
                line: 2
            }
        );
        assert!(remove(text, "other").is_err());
        assert!(parse(text).is_err());
    }

    #[test]
    fn nested_begin_is_an_error() {
        let text = format!("# >>> devstation:a >>>\n{}# <<< devstation:a <<<\n", render("b", ""));
        assert!(parse(&text).is_err());
    }

    #[test]
    fn stray_end_marker_is_plain_text() {
        let text = "# <<< devstation:go <<<\n";
        assert!(parse(text).unwrap().is_empty());
    }

    #[test]
    fn other_blocks_are_untouched() {
        let start = format!("{}{}", render("node", "N\n"), render("go", "G\n"));
        let (out, _) = upsert(&start, "go", GO).unwrap();
        assert!(out.starts_with(&render("node", "N\n")));
        let (out, _) = remove(&out, "go").unwrap();
        assert_eq!(out, render("node", "N\n"));
    }

    #[test]
    fn invalid_names_and_marker_content_rejected() {
        assert_eq!(
            upsert("", "bad name", GO).unwrap_err(),
            BlockError::InvalidName("bad name".into())
        );
        assert!(matches!(
            upsert("", "go", "# <<< devstation:go <<<\n"),
            Err(BlockError::MarkerInContent(_))
        ));
    }

    #[test]
    fn legacy_lines_outside_blocks_only() {
        let text = format!(
            "# Go environment variables\nexport GOROOT=/usr/lib/go\nalias g=git\n{}",
            render("go", GO)
        );
        let (out, removed) = remove_legacy_lines(
            &text,
            &["# Go environment variables".into(), "export GOROOT=".into()],
        )
        .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(out, format!("alias g=git\n{}", render("go", GO)));
    }

    #[test]
    fn empty_legacy_pattern_matches_nothing() {
        let (out, removed) = remove_legacy_lines("a\nb\n", &[String::new()]).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(out, "a\nb\n");
    }

    #[test]
    fn markers_with_trailing_whitespace_are_recognised() {
        let text = "# >>> devstation:go >>>  \nX\n# <<< devstation:go <<<\t\n";
        let blocks = parse(text).unwrap();
        assert_eq!(blocks[0].content, "X\n");
    }
}
