use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

/// File extension of the archives we produce.
pub const ARCHIVE_EXT: &str = "rar";

/// The seam between the backup loop and the external compression tool, so
/// the loop can be driven in tests without a real archiver on the machine.
pub trait Archiver {
    /// Compress `source_dir` into the archive at `dest`. Blocking; returns
    /// once the external process has exited. Non-zero exit is an error.
    fn archive(&self, source_dir: &Path, dest: &Path) -> Result<()>;
}

/// Client for the WinRAR command line (or anything argument-compatible).
pub struct RarArchiver {
    exe_path: PathBuf,
}

// Fixed switches, matching what the tool has always passed: exclude the base
// path, no prompts, lock the archive, best compression, 4 GiB dictionary,
// store identical files once, solid archive.
const RAR_SWITCHES: &[&str] = &[
    "a", "-ep1", "-ibck", "-k", "-m5", "-mcx", "-md4g", "-oi", "-s",
];

impl RarArchiver {
    pub fn new<P: AsRef<Path>>(exe_path: P) -> Self {
        Self {
            exe_path: exe_path.as_ref().to_path_buf(),
        }
    }

    /// Verify the configured path is an invocable executable before any item
    /// is processed. A missing or non-runnable archiver is a startup
    /// failure, not a per-item one.
    pub fn check_available(&self) -> Result<()> {
        let metadata = fs::metadata(&self.exe_path)
            .with_context(|| format!("archiver executable not found at {:?}", self.exe_path))?;
        if !metadata.is_file() {
            anyhow::bail!("archiver path {:?} is not a file", self.exe_path);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                anyhow::bail!("archiver {:?} is not executable", self.exe_path);
            }
        }
        Ok(())
    }

    fn build_command(&self, source_dir: &Path, dest: &Path) -> Command {
        let mut cmd = Command::new(&self.exe_path);
        cmd.args(RAR_SWITCHES).arg(dest).arg(source_dir);
        cmd
    }
}

impl Archiver for RarArchiver {
    fn archive(&self, source_dir: &Path, dest: &Path) -> Result<()> {
        let mut cmd = self.build_command(source_dir, dest);
        tracing::debug!("running {:?}", cmd);

        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute archiver {:?}", self.exe_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "archiver exited with {} for {:?}: {}",
                output.status,
                dest,
                stderr.trim()
            );
        }

        Ok(())
    }
}
