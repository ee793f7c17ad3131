use std::fmt;

/// Per-item failure kinds. These are carried as values through the backup
/// loop and aggregated into the run report; they never abort the run. Fatal
/// startup conditions (bad config, missing archiver executable) use anyhow
/// and propagate out of main instead.
#[derive(Debug)]
pub enum ItemError {
    Parse(String),
    MissingSource(String),
    Archive(String),
    Persistence(String),
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemError::Parse(msg) => write!(f, "manifest parse error: {}", msg),
            ItemError::MissingSource(msg) => write!(f, "missing source: {}", msg),
            ItemError::Archive(msg) => write!(f, "archive error: {}", msg),
            ItemError::Persistence(msg) => write!(f, "persistence error: {}", msg),
        }
    }
}

impl std::error::Error for ItemError {}
