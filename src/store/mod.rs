//! Durable fingerprint state: a YAML mapping of appid -> fingerprint,
//! rewritten in full after every successful backup, plus a one-shot
//! migration path from the legacy CSV encoding.

mod legacy;
mod state;

pub use legacy::{migrate_legacy, MigrationOutcome};
pub use state::{is_current, BackupState, Fingerprint};

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Handle to the persisted state file. Loading yields a `BackupState`
/// snapshot; committing rewrites the whole file atomically.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        StateFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted state. An absent file is an empty state, and an
    /// unreadable or corrupt file degrades to an empty state as well: the
    /// worst outcome of losing state is one redundant backup pass, which
    /// beats refusing to run.
    pub fn load(&self) -> BackupState {
        if !self.path.exists() {
            return BackupState::default();
        }

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("state file {:?} unreadable ({}), starting empty", self.path, err);
                return BackupState::default();
            }
        };

        match serde_yaml::from_str(&content) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!("state file {:?} corrupt ({}), starting empty", self.path, err);
                BackupState::default()
            }
        }
    }

    /// Persist the complete mapping: serialize everything, write to a temp
    /// file next to the target, then rename over it. The rename is atomic on
    /// POSIX, so the file on disk is always one complete snapshot.
    pub fn write_state(&self, state: &BackupState) -> Result<()> {
        let yaml = serde_yaml::to_string(state).context("Failed to serialize backup state")?;

        let temp_path = self.path.with_extension("yaml.tmp");
        fs::write(&temp_path, yaml)
            .with_context(|| format!("Failed to write state file {:?}", temp_path))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to replace state file {:?}", self.path))?;

        Ok(())
    }
}
