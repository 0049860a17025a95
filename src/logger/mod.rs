//! Activity logging: an append-only JSONL trail of every provisioning run.

pub mod jsonl;

use std::path::Path;

use parking_lot::Mutex;

use self::jsonl::{JsonlConfig, JsonlWriter, LogEntry};

/// Thread-safe handle to the activity log.
///
/// Worker threads record through a shared reference; a disabled log drops
/// every entry, which keeps tests and `--dry-run` free of file writes when
/// wanted.
pub struct ActivityLog {
    writer: Option<Mutex<JsonlWriter>>,
}

impl ActivityLog {
    /// Open the log at `path` with default rotation settings.
    pub fn open(path: &Path) -> Self {
        Self::with_config(JsonlConfig::at(path))
    }

    pub fn with_config(config: JsonlConfig) -> Self {
        Self {
            writer: Some(Mutex::new(JsonlWriter::open(config))),
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn record(&self, entry: &LogEntry) {
        if let Some(writer) = &self.writer {
            writer.lock().write_entry(entry);
        }
    }

    /// Flush and sync; called once at the end of a run.
    pub fn sync(&self) {
        if let Some(writer) = &self.writer {
            writer.lock().sync();
        }
    }

    /// Current sink: `primary`, `fallback`, `stderr`, `discard` or `disabled`.
    pub fn state(&self) -> &'static str {
        self.writer.as_ref().map_or("disabled", |w| w.lock().state())
    }
}

impl Drop for ActivityLog {
    fn drop(&mut self) {
        if let Some(writer) = &self.writer {
            writer.lock().flush();
        }
    }
}
