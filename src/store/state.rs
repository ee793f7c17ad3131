use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The three-field version signature for one installed app. All fields are
/// kept as the exact strings found in the manifest; equality is exact match
/// on all three, nothing fuzzier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fingerprint {
    #[serde(rename = "buildid")]
    pub build_id: String,
    #[serde(rename = "lastupdated")]
    pub last_updated: String,
    #[serde(rename = "manifest")]
    pub manifest_id: String,
}

/// The full persisted mapping of appid -> last backed-up fingerprint.
/// A plain value: load yields a snapshot, commits go through `put` followed
/// by a full rewrite of the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupState {
    #[serde(flatten)]
    apps: BTreeMap<String, Fingerprint>,
}

impl BackupState {
    pub fn get(&self, app_id: &str) -> Option<&Fingerprint> {
        self.apps.get(app_id)
    }

    /// Record a fingerprint for an app. Last write wins.
    pub fn put(&mut self, app_id: String, fingerprint: Fingerprint) -> Option<Fingerprint> {
        self.apps.insert(app_id, fingerprint)
    }

    pub fn remove(&mut self, app_id: &str) -> Option<Fingerprint> {
        self.apps.remove(app_id)
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.apps.contains_key(app_id)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

/// Change detector: is the stored fingerprint still current for this app?
/// `None` means the app was never backed up, so it is never current.
pub fn is_current(stored: Option<&Fingerprint>, fresh: &Fingerprint) -> bool {
    match stored {
        Some(stored) => stored == fresh,
        None => false,
    }
}
