//! One-shot migration from the legacy flat state encoding.
//!
//! Early versions of the tool kept state as CSV rows of
//! `appid,buildid,lastupdated,manifest` with no header. Migration parses the
//! whole file up front, folds the rows into the structured store, writes it,
//! and only then renames the CSV so it can never be consumed twice. Any bad
//! row aborts the whole migration with both files untouched.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::{BackupState, Fingerprint, StateFile};

/// Suffix appended to the legacy file once its contents are in the
/// structured store.
const CONSUMED_SUFFIX: &str = ".migrated";

#[derive(Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No legacy file present (or already consumed); nothing to do.
    NoLegacy,
    /// Migration ran; this many legacy entries were carried over.
    Migrated(usize),
}

/// Migrate the legacy CSV at `legacy_path` into `state_file`, if present.
///
/// Explicitly callable and idempotent: entries already in the structured
/// store win over legacy rows (the structured store is newer by
/// construction), so a crash between writing the store and renaming the CSV
/// is repaired by simply running migration again.
pub fn migrate_legacy(legacy_path: &Path, state_file: &StateFile) -> Result<MigrationOutcome> {
    if !legacy_path.exists() {
        return Ok(MigrationOutcome::NoLegacy);
    }

    let content = fs::read_to_string(legacy_path)
        .with_context(|| format!("Failed to read legacy state file {:?}", legacy_path))?;

    // Parse every row before touching anything on disk
    let mut rows = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 4 {
            anyhow::bail!(
                "legacy state {:?} line {}: expected 4 fields, found {}",
                legacy_path,
                lineno + 1,
                fields.len()
            );
        }
        rows.push((
            fields[0].to_string(),
            Fingerprint {
                build_id: fields[1].to_string(),
                last_updated: fields[2].to_string(),
                manifest_id: fields[3].to_string(),
            },
        ));
    }

    let count = rows.len();
    let mut state = state_file.load();
    for (app_id, fingerprint) in rows {
        if !state.contains(&app_id) {
            state.put(app_id, fingerprint);
        }
    }

    state_file.write_state(&state)?;

    // Mark the legacy source consumed so migration never re-triggers
    let mut consumed = legacy_path.as_os_str().to_os_string();
    consumed.push(CONSUMED_SUFFIX);
    fs::rename(legacy_path, &consumed)
        .with_context(|| format!("Failed to mark legacy state {:?} as consumed", legacy_path))?;

    Ok(MigrationOutcome::Migrated(count))
}
