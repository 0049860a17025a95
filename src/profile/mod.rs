//! Shell profile mutation.
//!
//! [`ProfileMutator`] owns one profile file and edits only the managed
//! blocks inside it. Every change is written to a sibling temp file, synced
//! and renamed over the original, so a reader never observes a partial
//! profile. A symlinked profile is edited at its target.

#![allow(missing_docs)]

pub mod block;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::random;

use crate::core::errors::{DvsError, Result};

pub use block::{Mutation, ProfileBlock};

/// Single writer for one shell profile.
#[derive(Debug)]
pub struct ProfileMutator {
    path: PathBuf,
    backup: bool,
    backup_path: Option<PathBuf>,
}

impl ProfileMutator {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup: false,
            backup_path: None,
        }
    }

    /// Copy the profile aside before the first change made by this mutator.
    #[must_use]
    pub const fn with_backup(mut self, enabled: bool) -> Self {
        self.backup = enabled;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backup taken during this run, if any.
    #[must_use]
    pub fn backup_path(&self) -> Option<&Path> {
        self.backup_path.as_deref()
    }

    /// Current profile text; a missing file reads as empty.
    pub fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(DvsError::io(&self.path, error)),
        }
    }

    pub fn blocks(&self) -> Result<Vec<ProfileBlock>> {
        let text = self.read()?;
        block::parse(&text).map_err(|e| self.block_error(&e))
    }

    pub fn block(&self, name: &str) -> Result<Option<ProfileBlock>> {
        let text = self.read()?;
        block::find(&text, name).map_err(|e| self.block_error(&e))
    }

    /// Make block `name` hold exactly `content`.
    pub fn upsert(&mut self, name: &str, content: &str) -> Result<Mutation> {
        let text = self.read()?;
        let (updated, mutation) =
            block::upsert(&text, name, content).map_err(|e| self.block_error(&e))?;
        if mutation.changed() {
            self.commit(&updated)?;
        }
        Ok(mutation)
    }

    /// Remove every block named `name`. Missing blocks are not an error.
    pub fn remove(&mut self, name: &str) -> Result<Mutation> {
        let text = self.read()?;
        let (updated, mutation) = block::remove(&text, name).map_err(|e| self.block_error(&e))?;
        if mutation.changed() {
            self.commit(&updated)?;
        }
        Ok(mutation)
    }

    /// Drop unmanaged lines matching any pattern. Returns lines removed.
    pub fn remove_legacy_lines(&mut self, patterns: &[String]) -> Result<usize> {
        if patterns.is_empty() {
            return Ok(0);
        }
        let text = self.read()?;
        let (updated, removed) =
            block::remove_legacy_lines(&text, patterns).map_err(|e| self.block_error(&e))?;
        if removed > 0 {
            self.commit(&updated)?;
        }
        Ok(removed)
    }

    fn block_error(&self, error: &block::BlockError) -> DvsError {
        DvsError::profile_write(&self.path, error.to_string())
    }

    fn commit(&mut self, contents: &str) -> Result<()> {
        let target = resolve_target(&self.path);
        if self.backup && self.backup_path.is_none() && target.exists() {
            let backup = create_backup(&target)
                .map_err(|e| DvsError::profile_write(&target, format!("backup failed: {e}")))?;
            self.backup_path = Some(backup);
        }
        write_atomic(&target, contents)
            .map_err(|e| DvsError::profile_write(&target, e.to_string()))
    }
}

/// Follow symlinks so the rename replaces the real file, not the link.
fn resolve_target(path: &Path) -> PathBuf {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

fn create_backup(path: &Path) -> io::Result<PathBuf> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let file_name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let backup_path = path.with_file_name(format!("{file_name}.devstation-backup-{timestamp}"));
    fs::copy(path, &backup_path)?;
    Ok(backup_path)
}

fn write_atomic(target: &Path, contents: &str) -> io::Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let file_name = target
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let nonce: u32 = random();
    let tmp = dir.join(format!(".{file_name}.devstation-{nonce:08x}.tmp"));

    let result = (|| -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        if let Ok(meta) = fs::metadata(target) {
            file.set_permissions(meta.permissions())?;
        }
        file.sync_all()?;
        fs::rename(&tmp, target)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }
    // Persist the rename itself; not all filesystems support this.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}
