//! The backup loop: discover manifests, detect changes, archive, commit.
//!
//! Each discovered manifest runs through parse -> detect -> resolve ->
//! archive -> commit and ends in exactly one of three terminal outcomes:
//! skipped (fingerprint unchanged), backed up, or failed. Failures are
//! per-item: they are logged, counted, and the loop moves on. State is
//! persisted in full after every successful item, so a crash can only ever
//! lose the in-flight item, never completed ones.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::DateTime;

use crate::archiver::{Archiver, ARCHIVE_EXT};
use crate::error::ItemError;
use crate::manifest::{parse_manifest, ManifestRecord};
use crate::store::{is_current, BackupState, StateFile};

const MANIFEST_PREFIX: &str = "appmanifest_";
const MANIFEST_SUFFIX: &str = ".acf";

/// Subdirectory of the library holding the actual install directories.
const INSTALL_SUBDIR: &str = "common";

/// Aggregated outcome of one run. Per-item failures live here; they never
/// turn into a process-level error.
#[derive(Debug, Default)]
pub struct RunReport {
    pub backed_up: usize,
    pub skipped: usize,
    pub failed: Vec<(String, ItemError)>,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.backed_up + self.skipped + self.failed.len()
    }
}

#[derive(Debug)]
enum Processed {
    Skipped(ManifestRecord),
    BackedUp(ManifestRecord),
}

/// List manifest files under the library root. The library being unreadable
/// is run-fatal; ordering is whatever the directory listing yields.
fn discover_manifests(library: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(library)
        .with_context(|| format!("Failed to list steam library {:?}", library))?;

    let mut manifests = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list steam library {:?}", library))?;
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if name.starts_with(MANIFEST_PREFIX) && name.ends_with(MANIFEST_SUFFIX) {
                manifests.push(entry.path());
            }
        }
    }
    Ok(manifests)
}

/// Destination archive file name:
/// `[appid][buildid][YYMMDD][manifestid]<installdir>.rar`.
///
/// The parser passes `lastupdated` through untouched, so this is where a
/// non-numeric timestamp surfaces, as a per-item failure.
fn archive_file_name(record: &ManifestRecord) -> Result<String, ItemError> {
    let secs: i64 = record.fingerprint.last_updated.parse().map_err(|_| {
        ItemError::Parse(format!(
            "app {}: lastupdated {:?} is not a unix timestamp",
            record.app_id, record.fingerprint.last_updated
        ))
    })?;
    let date = DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        ItemError::Parse(format!(
            "app {}: lastupdated {:?} is out of range",
            record.app_id, record.fingerprint.last_updated
        ))
    })?;

    Ok(format!(
        "[{}][{}][{}][{}]{}.{}",
        record.app_id,
        record.fingerprint.build_id,
        date.format("%y%m%d"),
        record.fingerprint.manifest_id,
        record.install_dir,
        ARCHIVE_EXT
    ))
}

fn process_manifest<A: Archiver>(
    library: &Path,
    backup_dir: &Path,
    archiver: &A,
    state_file: &StateFile,
    state: &mut BackupState,
    path: &Path,
) -> Result<Processed, ItemError> {
    let text = fs::read_to_string(path)
        .map_err(|err| ItemError::Parse(format!("cannot read {:?}: {}", path, err)))?;

    let record =
        parse_manifest(&text).map_err(|err| ItemError::Parse(format!("{:?}: {}", path, err)))?;

    if is_current(state.get(&record.app_id), &record.fingerprint) {
        return Ok(Processed::Skipped(record));
    }

    let archive_name = archive_file_name(&record)?;

    let source_dir = library.join(INSTALL_SUBDIR).join(&record.install_dir);
    if !source_dir.is_dir() {
        return Err(ItemError::MissingSource(format!(
            "app {}: install directory {:?} does not exist",
            record.app_id, source_dir
        )));
    }

    let dest = backup_dir.join(&archive_name);
    archiver
        .archive(&source_dir, &dest)
        .map_err(|err| ItemError::Archive(format!("app {}: {:#}", record.app_id, err)))?;

    // Commit: record the new fingerprint and persist the whole mapping
    // immediately. If the write fails, roll the in-memory entry back so
    // memory never disagrees with disk and the item is retried next run.
    let previous = state.put(record.app_id.clone(), record.fingerprint.clone());
    if let Err(err) = state_file.write_state(state) {
        match previous {
            Some(previous) => {
                state.put(record.app_id.clone(), previous);
            }
            None => {
                state.remove(&record.app_id);
            }
        }
        return Err(ItemError::Persistence(format!(
            "app {}: {:#}",
            record.app_id, err
        )));
    }

    Ok(Processed::BackedUp(record))
}

/// Run one full backup pass over the library.
///
/// Loads the state snapshot once, then processes items sequentially; the
/// state file has a single writer for the whole run. Only discovery failure
/// propagates as an error, everything item-scoped lands in the report.
pub fn run_backup<A: Archiver>(
    library: &Path,
    backup_dir: &Path,
    archiver: &A,
    state_file: &StateFile,
) -> Result<RunReport> {
    let manifests = discover_manifests(library)?;
    tracing::info!("found {} manifests in {:?}", manifests.len(), library);

    let mut state = state_file.load();
    let mut report = RunReport::default();

    for path in &manifests {
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        match process_manifest(library, backup_dir, archiver, state_file, &mut state, path) {
            Ok(Processed::Skipped(record)) => {
                tracing::info!(
                    "app {}:{}:{} already backed up",
                    record.install_dir,
                    record.app_id,
                    record.fingerprint.build_id
                );
                report.skipped += 1;
            }
            Ok(Processed::BackedUp(record)) => {
                tracing::info!(
                    "app {}:{}:{} backed up",
                    record.install_dir,
                    record.app_id,
                    record.fingerprint.build_id
                );
                report.backed_up += 1;
            }
            Err(err) => {
                tracing::warn!("{}: {}", label, err);
                report.failed.push((label, err));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::store::Fingerprint;

    /// Records invocations; creates the destination file on success like a
    /// real archiver would.
    struct MockArchiver {
        calls: RefCell<Vec<(PathBuf, PathBuf)>>,
        fail: bool,
    }

    impl MockArchiver {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail: true,
            }
        }
    }

    impl Archiver for MockArchiver {
        fn archive(&self, source_dir: &Path, dest: &Path) -> Result<()> {
            self.calls
                .borrow_mut()
                .push((source_dir.to_path_buf(), dest.to_path_buf()));
            if self.fail {
                anyhow::bail!("mock archiver failure");
            }
            fs::write(dest, b"rar")?;
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            fs::create_dir(dir.path().join("backup")).unwrap();
            fs::create_dir(dir.path().join(INSTALL_SUBDIR)).unwrap();
            Fixture { dir }
        }

        fn library(&self) -> PathBuf {
            self.dir.path().to_path_buf()
        }

        fn backup_dir(&self) -> PathBuf {
            self.dir.path().join("backup")
        }

        fn state_file(&self) -> StateFile {
            StateFile::new(self.backup_dir().join("backup.yaml"))
        }

        fn add_app(
            &self,
            app_id: &str,
            install_dir: &str,
            build_id: &str,
            last_updated: &str,
            manifest_id: &str,
        ) {
            let text = format!(
                "\"AppState\"\n{{\n\t\"appid\"\t\"{}\"\n\t\"installdir\"\t\"{}\"\n\t\"buildid\"\t\"{}\"\n\t\"LastUpdated\"\t\"{}\"\n\t\"InstalledDepots\"\n\t{{\n\t\t\"1\"\n\t\t{{\n\t\t\t\"manifest\"\t\"{}\"\n\t\t}}\n\t}}\n}}\n",
                app_id, install_dir, build_id, last_updated, manifest_id
            );
            fs::write(
                self.library().join(format!("appmanifest_{}.acf", app_id)),
                text,
            )
            .unwrap();
            let install = self.library().join(INSTALL_SUBDIR).join(install_dir);
            if !install.exists() {
                fs::create_dir(&install).unwrap();
            }
        }

        fn run(&self, archiver: &MockArchiver) -> RunReport {
            run_backup(
                &self.library(),
                &self.backup_dir(),
                archiver,
                &self.state_file(),
            )
            .unwrap()
        }
    }

    fn fp(build: &str, updated: &str, manifest: &str) -> Fingerprint {
        Fingerprint {
            build_id: build.to_string(),
            last_updated: updated.to_string(),
            manifest_id: manifest.to_string(),
        }
    }

    #[test]
    fn new_app_is_backed_up_with_expected_destination() {
        let fx = Fixture::new();
        fx.add_app("480", "Spacewar", "100", "1700000000", "555");

        let archiver = MockArchiver::new();
        let report = fx.run(&archiver);
        assert_eq!(report.backed_up, 1);
        assert_eq!(report.skipped, 0);
        assert!(report.failed.is_empty());

        let calls = archiver.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, fx.library().join("common/Spacewar"));
        assert_eq!(
            calls[0].1,
            fx.backup_dir().join("[480][100][231114][555]Spacewar.rar")
        );

        let state = fx.state_file().load();
        assert_eq!(state.get("480"), Some(&fp("100", "1700000000", "555")));
    }

    #[test]
    fn second_run_with_no_changes_is_all_skips() {
        let fx = Fixture::new();
        fx.add_app("480", "Spacewar", "100", "1700000000", "555");
        fx.add_app("620", "Portal 2", "77", "1600000000", "abc");

        let archiver = MockArchiver::new();
        let first = fx.run(&archiver);
        assert_eq!(first.backed_up, 2);

        let persisted_before = fs::read_to_string(fx.state_file().path()).unwrap();

        let second = fx.run(&archiver);
        assert_eq!(second.backed_up, 0);
        assert_eq!(second.skipped, 2);
        assert!(second.failed.is_empty());

        let persisted_after = fs::read_to_string(fx.state_file().path()).unwrap();
        assert_eq!(persisted_before, persisted_after);
    }

    #[test]
    fn any_single_fingerprint_field_change_triggers_one_backup() {
        for (build, updated, manifest) in [
            ("101", "1700000000", "555"),
            ("100", "1700086400", "555"),
            ("100", "1700000000", "556"),
        ] {
            let fx = Fixture::new();
            fx.add_app("480", "Spacewar", "100", "1700000000", "555");
            fx.run(&MockArchiver::new());

            fx.add_app("480", "Spacewar", build, updated, manifest);
            let archiver = MockArchiver::new();
            let report = fx.run(&archiver);
            assert_eq!(report.backed_up, 1, "change {:?} must trigger a backup", (build, updated, manifest));
            assert_eq!(archiver.calls.borrow().len(), 1);

            let state = fx.state_file().load();
            assert_eq!(state.get("480"), Some(&fp(build, updated, manifest)));
        }
    }

    #[test]
    fn one_bad_manifest_does_not_halt_the_run() {
        let fx = Fixture::new();
        fx.add_app("100", "Alpha", "1", "1700000000", "m1");
        fs::write(
            fx.library().join("appmanifest_200.acf"),
            "\"AppState\"\n{\n\t\"appid\"\t\"200\"\n}\n",
        )
        .unwrap();
        fx.add_app("300", "Gamma", "3", "1700000000", "m3");

        let report = fx.run(&MockArchiver::new());
        assert_eq!(report.backed_up, 2);
        assert_eq!(report.failed.len(), 1);
        let (label, err) = &report.failed[0];
        assert_eq!(label, "appmanifest_200.acf");
        assert!(matches!(err, ItemError::Parse(_)));

        let state = fx.state_file().load();
        assert!(state.contains("100"));
        assert!(state.contains("300"));
        assert!(!state.contains("200"));
    }

    #[test]
    fn archiver_failure_leaves_state_untouched() {
        let fx = Fixture::new();
        fx.add_app("480", "Spacewar", "100", "1700000000", "555");

        let archiver = MockArchiver::failing();
        let report = fx.run(&archiver);
        assert_eq!(report.backed_up, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, ItemError::Archive(_)));

        // Invoked, but no commit
        assert_eq!(archiver.calls.borrow().len(), 1);
        assert!(!fx.state_file().load().contains("480"));

        // The item is retried on the next run
        let retry = fx.run(&MockArchiver::new());
        assert_eq!(retry.backed_up, 1);
    }

    #[test]
    fn missing_install_dir_fails_without_invoking_archiver() {
        let fx = Fixture::new();
        fx.add_app("480", "Spacewar", "100", "1700000000", "555");
        fs::remove_dir(fx.library().join("common/Spacewar")).unwrap();

        let archiver = MockArchiver::new();
        let report = fx.run(&archiver);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, ItemError::MissingSource(_)));
        assert!(archiver.calls.borrow().is_empty());
        assert!(!fx.state_file().load().contains("480"));
    }

    #[test]
    fn persist_failure_fails_the_item_after_archiving() {
        let fx = Fixture::new();
        fx.add_app("480", "Spacewar", "100", "1700000000", "555");

        // State file in a directory that does not exist, so every write fails
        let archiver = MockArchiver::new();
        let state_file = StateFile::new(fx.dir.path().join("no-such-dir/backup.yaml"));
        let report = run_backup(&fx.library(), &fx.backup_dir(), &archiver, &state_file).unwrap();

        assert_eq!(report.backed_up, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, ItemError::Persistence(_)));
        // The archive itself succeeded; only the commit failed
        assert_eq!(archiver.calls.borrow().len(), 1);
    }

    #[test]
    fn persist_failure_reverts_the_in_memory_entry() {
        let fx = Fixture::new();
        fx.add_app("480", "Spacewar", "100", "1700000000", "555");
        let manifest = fx.library().join("appmanifest_480.acf");
        let archiver = MockArchiver::new();
        let state_file = StateFile::new(fx.dir.path().join("no-such-dir/backup.yaml"));

        // Fresh entry: rolled back to absent
        let mut state = BackupState::default();
        let err = process_manifest(
            &fx.library(),
            &fx.backup_dir(),
            &archiver,
            &state_file,
            &mut state,
            &manifest,
        )
        .unwrap_err();
        assert!(matches!(err, ItemError::Persistence(_)));
        assert!(!state.contains("480"));

        // Existing entry: rolled back to the previous fingerprint
        let mut state = BackupState::default();
        state.put("480".to_string(), fp("99", "1600000000", "111"));
        let err = process_manifest(
            &fx.library(),
            &fx.backup_dir(),
            &archiver,
            &state_file,
            &mut state,
            &manifest,
        )
        .unwrap_err();
        assert!(matches!(err, ItemError::Persistence(_)));
        assert_eq!(state.get("480"), Some(&fp("99", "1600000000", "111")));
    }

    #[test]
    fn non_numeric_lastupdated_fails_at_resolution() {
        let fx = Fixture::new();
        fx.add_app("480", "Spacewar", "100", "soon", "555");

        let archiver = MockArchiver::new();
        let report = fx.run(&archiver);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, ItemError::Parse(_)));
        assert!(archiver.calls.borrow().is_empty());
    }

    #[test]
    fn non_manifest_files_are_ignored() {
        let fx = Fixture::new();
        fs::write(fx.library().join("libraryfolders.vdf"), "x").unwrap();
        fs::write(fx.library().join("appmanifest_9.acf.bak"), "x").unwrap();
        fx.add_app("480", "Spacewar", "100", "1700000000", "555");

        let report = fx.run(&MockArchiver::new());
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn archive_name_formats_lastupdated_as_yymmdd() {
        let record = ManifestRecord {
            app_id: "480".to_string(),
            install_dir: "Spacewar".to_string(),
            fingerprint: fp("100", "1700000000", "555"),
        };
        assert_eq!(
            archive_file_name(&record).unwrap(),
            "[480][100][231114][555]Spacewar.rar"
        );
    }
}
