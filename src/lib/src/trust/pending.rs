//! Verifications that fell back to `unknown` because the trust list could
//! not be reached, kept so they can be retried once back online.

use crate::error::PSError;
use crate::secure_file;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Oldest entries are dropped past this size.
const MAX_PENDING: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVerification {
    pub fingerprint: String,
    /// Asset that was being verified, as shown to the user
    pub asset: String,
    /// Unix seconds
    pub recorded_at: u64,
    pub reason: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PendingFile {
    version: u32,
    entries: Vec<PendingVerification>,
}

pub struct PendingHistory {
    path: Option<PathBuf>,
    entries: Mutex<Vec<PendingVerification>>,
}

impl PendingHistory {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// History persisted at `path`; an unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match load(&path) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Ignoring pending history at {}: {}", path.display(), e);
                Vec::new()
            }
        };
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    /// Record a degraded verification. A newer record for the same
    /// fingerprint and asset replaces the older one.
    pub fn record(&self, entry: PendingVerification) -> Result<(), PSError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|e| !(e.fingerprint == entry.fingerprint && e.asset == entry.asset));
        entries.push(entry);
        if entries.len() > MAX_PENDING {
            let excess = entries.len() - MAX_PENDING;
            entries.drain(..excess);
        }
        self.persist(&entries)
    }

    pub fn entries(&self) -> Vec<PendingVerification> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry for `fingerprint`; returns how many were removed.
    pub fn resolve(&self, fingerprint: &str) -> Result<usize, PSError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| e.fingerprint != fingerprint);
        let removed = before - entries.len();
        if removed > 0 {
            self.persist(&entries)?;
        }
        Ok(removed)
    }

    fn persist(&self, entries: &[PendingVerification]) -> Result<(), PSError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = PendingFile {
            version: 1,
            entries: entries.to_vec(),
        };
        secure_file::write_atomic(path, &serde_json::to_vec_pretty(&file)?)
    }
}

fn load(path: &Path) -> Result<Vec<PendingVerification>, PSError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file: PendingFile = serde_json::from_slice(&std::fs::read(path)?)?;
    Ok(file.entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(fingerprint: &str, asset: &str, at: u64) -> PendingVerification {
        PendingVerification {
            fingerprint: fingerprint.to_string(),
            asset: asset.to_string(),
            recorded_at: at,
            reason: "timeout".to_string(),
        }
    }

    #[test]
    fn test_record_replaces_duplicates() {
        let history = PendingHistory::in_memory();
        history.record(entry("aa", "a.jpg", 1)).unwrap();
        history.record(entry("aa", "a.jpg", 2)).unwrap();
        history.record(entry("aa", "b.jpg", 3)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.entries()[0].recorded_at, 2);
    }

    #[test]
    fn test_bounded() {
        let history = PendingHistory::in_memory();
        for i in 0..(MAX_PENDING as u64 + 10) {
            history.record(entry(&format!("{i}"), "a.jpg", i)).unwrap();
        }
        assert_eq!(history.len(), MAX_PENDING);
        assert_eq!(history.entries()[0].recorded_at, 10);
    }

    #[test]
    fn test_persist_and_resolve() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pending.json");
        let history = PendingHistory::open(&path);
        history.record(entry("aa", "a.jpg", 1)).unwrap();
        history.record(entry("bb", "b.jpg", 2)).unwrap();

        let reopened = PendingHistory::open(&path);
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.resolve("aa").unwrap(), 1);
        assert_eq!(PendingHistory::open(&path).entries()[0].fingerprint, "bb");
    }
}
