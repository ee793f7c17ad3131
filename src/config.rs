use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// On-disk config shape. Everything is optional here; required fields are
/// enforced after env and CLI overrides have been applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    /// Steam library `steamapps` directory, the one holding the manifests
    library_path: Option<PathBuf>,
    /// Where archives and the state file live; defaults to `<library>/backup`
    backup_dir: Option<PathBuf>,
    /// Path to the archiver executable
    archiver_path: Option<PathBuf>,
}

/// Values from the command line that take precedence over file and env.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub library_path: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub archiver_path: Option<PathBuf>,
}

/// Resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub library_path: PathBuf,
    pub backup_dir: PathBuf,
    pub archiver_path: PathBuf,
}

impl VaultConfig {
    /// Load configuration, layering config file, then `STEAMVAULT_*`
    /// environment variables, then command-line overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut raw = match config_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("config file not found at {:?}", path);
                }
                Self::load_raw(path)?
            }
            None => {
                let default_path = Self::config_file_path()?;
                tracing::debug!("looking for config at {:?}", default_path);
                if default_path.exists() {
                    Self::load_raw(&default_path)?
                } else {
                    RawConfig::default()
                }
            }
        };

        if let Ok(path) = env::var("STEAMVAULT_LIBRARY") {
            raw.library_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = env::var("STEAMVAULT_BACKUP_DIR") {
            raw.backup_dir = Some(PathBuf::from(path));
        }
        if let Ok(path) = env::var("STEAMVAULT_ARCHIVER") {
            raw.archiver_path = Some(PathBuf::from(path));
        }

        if let Some(path) = overrides.library_path {
            raw.library_path = Some(path);
        }
        if let Some(path) = overrides.backup_dir {
            raw.backup_dir = Some(path);
        }
        if let Some(path) = overrides.archiver_path {
            raw.archiver_path = Some(path);
        }

        let library_path = expand_tilde(
            &raw.library_path
                .context("library path not configured (config file, STEAMVAULT_LIBRARY, or --library)")?,
        );
        let archiver_path = expand_tilde(
            &raw.archiver_path
                .context("archiver path not configured (config file, STEAMVAULT_ARCHIVER, or --archiver)")?,
        );
        let backup_dir = raw
            .backup_dir
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|| library_path.join("backup"));

        Ok(VaultConfig {
            library_path,
            backup_dir,
            archiver_path,
        })
    }

    fn load_raw(path: &Path) -> Result<RawConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Get default config file path
    pub fn config_file_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".config/steamvault/config.yaml"))
            .context("Could not determine home directory for config file")
    }

    /// Fatal startup check: the library must exist before we touch anything.
    pub fn validate(&self) -> Result<()> {
        if !self.library_path.is_dir() {
            anyhow::bail!("steam library not found at {:?}", self.library_path);
        }
        Ok(())
    }

    /// Get backup directory, creating it if necessary
    pub fn ensure_backup_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("Failed to create backup directory: {:?}", self.backup_dir))
    }

    /// Structured state file location, inside the backup directory.
    pub fn state_path(&self) -> PathBuf {
        self.backup_dir.join("backup.yaml")
    }

    /// Legacy CSV state location, inside the backup directory.
    pub fn legacy_state_path(&self) -> PathBuf {
        self.backup_dir.join("backup.csv")
    }
}
