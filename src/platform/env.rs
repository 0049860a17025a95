//! Owned process environment.
//!
//! Installers run in a single process and later components must see the
//! exports of earlier ones (a Go tool installer needs the freshly placed Go
//! on `PATH`). Instead of mutating the real process environment, the run
//! carries an `Environment` value and hands it to every child process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Variable map handed to child processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Snapshot of the current process environment.
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build from explicit pairs (tests, sandboxed runs).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn unset(&mut self, name: &str) -> Option<String> {
        self.vars.remove(name)
    }

    /// Iterate all variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn home(&self) -> Option<PathBuf> {
        self.get("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
    }

    /// `PATH` split into entries, empty entries dropped.
    #[must_use]
    pub fn path_entries(&self) -> Vec<String> {
        self.get("PATH")
            .map(|p| {
                p.split(':')
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Put `dir` at the front of `PATH` unless it is already present.
    ///
    /// Returns `true` when `PATH` changed.
    pub fn prepend_path(&mut self, dir: &str) -> bool {
        let mut entries = self.path_entries();
        if entries.iter().any(|e| e == dir) {
            return false;
        }
        entries.insert(0, dir.to_string());
        self.set("PATH", entries.join(":"));
        true
    }

    /// Drop every occurrence of `dir` from `PATH`.
    pub fn remove_path_entry(&mut self, dir: &str) -> bool {
        let entries = self.path_entries();
        let kept: Vec<String> = entries.iter().filter(|e| *e != dir).cloned().collect();
        if kept.len() == entries.len() {
            return false;
        }
        self.set("PATH", kept.join(":"));
        true
    }

    /// Expand `$NAME` and `${NAME}` references the way a POSIX shell would
    /// for the simple cases used in profile exports. Unset variables expand
    /// to the empty string; a `$` not followed by a name is kept literally.
    #[must_use]
    pub fn expand(&self, raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let rest = &raw[idx + 1..];
            if let Some(braced) = rest.strip_prefix('{') {
                if let Some(end) = braced.find('}') {
                    let name = &braced[..end];
                    if is_identifier(name) {
                        out.push_str(self.get(name).unwrap_or(""));
                        // Skip `{name}`.
                        for _ in 0..=end + 1 {
                            chars.next();
                        }
                        continue;
                    }
                }
                out.push('$');
                continue;
            }
            let name_len = rest
                .chars()
                .enumerate()
                .take_while(|(i, ch)| {
                    ch.is_ascii_alphabetic() || *ch == '_' || (*i > 0 && ch.is_ascii_digit())
                })
                .count();
            if name_len == 0 {
                out.push('$');
                continue;
            }
            let name = &rest[..name_len];
            out.push_str(self.get(name).unwrap_or(""));
            for _ in 0..name_len {
                chars.next();
            }
        }
        out
    }

    /// Resolve `program` against this environment's `PATH`.
    ///
    /// Anything containing a `/` is treated as a path and only checked for
    /// existence.
    #[must_use]
    pub fn which(&self, program: &str) -> Option<PathBuf> {
        if program.is_empty() {
            return None;
        }
        if program.contains('/') {
            let path = PathBuf::from(program);
            return is_executable_file(&path).then_some(path);
        }
        self.path_entries()
            .into_iter()
            .map(|dir| Path::new(&dir).join(program))
            .find(|candidate| is_executable_file(candidate))
    }
}

/// Shell identifier: `[A-Za-z_][A-Za-z0-9_]*`.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}
