//! Trust-list verdict cache
//!
//! A single owned cache, keyed by certificate fingerprint. Readers see the
//! last committed snapshot; writers build a new snapshot and swap it in.
//! At most one refresh against the remote list runs at a time.

use super::list::{TrustListClient, TrustListMetadata};
use crate::error::PSError;
use crate::secure_file;
use crate::time::TimeSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::Duration;

const CACHE_FORMAT_VERSION: u32 = 1;

/// Cached remote verdict for one fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedVerdict {
    pub trusted: bool,
    /// Unix seconds
    pub checked_at: u64,
}

/// Persisted form of the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub format: u32,
    /// Trust-list version the verdicts were obtained under
    pub version: Option<String>,
    /// Unix seconds of the last successful refresh
    pub fetched_at: Option<u64>,
    pub entries: BTreeMap<String, CachedVerdict>,
}

/// Result of [`TrustListCache::refresh`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(TrustListMetadata),
    /// Another caller holds the refresh lock; nothing was fetched.
    AlreadyInProgress,
}

pub struct TrustListCache {
    path: Option<PathBuf>,
    ttl: Duration,
    time: Arc<dyn TimeSource>,
    snapshot: RwLock<Arc<CacheSnapshot>>,
    refresh_lock: Mutex<()>,
}

impl TrustListCache {
    /// Cache that lives only as long as the process.
    pub fn in_memory(ttl: Duration, time: Arc<dyn TimeSource>) -> Self {
        Self {
            path: None,
            ttl,
            time,
            snapshot: RwLock::new(Arc::new(CacheSnapshot {
                format: CACHE_FORMAT_VERSION,
                ..CacheSnapshot::default()
            })),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Cache persisted at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>, ttl: Duration, time: Arc<dyn TimeSource>) -> Self {
        let path = path.into();
        let mut cache = Self::in_memory(ttl, time);
        match load_snapshot(&path) {
            Ok(Some(snapshot)) => {
                log::debug!(
                    "Loaded {} cached trust verdicts from {}",
                    snapshot.entries.len(),
                    path.display()
                );
                cache.snapshot = RwLock::new(Arc::new(snapshot));
            }
            Ok(None) => {}
            Err(e) => log::warn!("Ignoring trust cache at {}: {}", path.display(), e),
        }
        cache.path = Some(path);
        cache
    }

    /// Last committed snapshot.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn version(&self) -> Option<String> {
        self.snapshot().version.clone()
    }

    /// Fresh verdict for `fingerprint`; entries older than the TTL are ignored.
    pub fn lookup(&self, fingerprint: &str) -> Option<CachedVerdict> {
        let now = self.time.now_unix().ok()?;
        let snapshot = self.snapshot();
        let verdict = snapshot.entries.get(fingerprint)?;
        if now.saturating_sub(verdict.checked_at) > self.ttl.as_secs() {
            log::debug!("Cached verdict for {} is stale", fingerprint);
            return None;
        }
        Some(*verdict)
    }

    /// Store a verdict obtained from the remote list.
    pub fn record(&self, fingerprint: &str, trusted: bool) -> Result<(), PSError> {
        let checked_at = self.time.now_unix()?;
        self.commit(|snapshot| {
            snapshot
                .entries
                .insert(fingerprint.to_string(), CachedVerdict { trusted, checked_at });
        })
    }

    /// Pull trust-list metadata and commit its version.
    ///
    /// A changed version invalidates every cached verdict; otherwise only
    /// verdicts past the TTL are dropped.
    pub fn refresh(&self, client: &dyn TrustListClient) -> Result<RefreshOutcome, PSError> {
        let _guard = match self.refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(RefreshOutcome::AlreadyInProgress),
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };

        let metadata = client.fetch_metadata()?;
        let fetched_at = self.time.now_unix()?;
        self.commit(|snapshot| {
            if snapshot.version.as_deref() != Some(metadata.version.as_str()) {
                if !snapshot.entries.is_empty() {
                    log::info!(
                        "Trust list changed to version {}, dropping {} cached verdicts",
                        metadata.version,
                        snapshot.entries.len()
                    );
                }
                snapshot.entries.clear();
            }
            let ttl = self.ttl.as_secs();
            let before = snapshot.entries.len();
            snapshot
                .entries
                .retain(|_, verdict| fetched_at.saturating_sub(verdict.checked_at) <= ttl);
            if snapshot.entries.len() < before {
                log::debug!("Pruned {} expired trust verdicts", before - snapshot.entries.len());
            }
            snapshot.version = Some(metadata.version.clone());
            snapshot.fetched_at = Some(fetched_at);
        })?;
        Ok(RefreshOutcome::Refreshed(metadata))
    }

    fn commit<F>(&self, update: F) -> Result<(), PSError>
    where
        F: FnOnce(&mut CacheSnapshot),
    {
        let mut slot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = CacheSnapshot::clone(&slot);
        update(&mut next);
        if let Some(path) = &self.path {
            save_snapshot(path, &next)?;
        }
        *slot = Arc::new(next);
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<Option<CacheSnapshot>, PSError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    let snapshot: CacheSnapshot = serde_json::from_slice(&data)?;
    if snapshot.format != CACHE_FORMAT_VERSION {
        return Err(PSError::SerializationError(format!(
            "Unsupported trust cache format {}",
            snapshot.format
        )));
    }
    Ok(Some(snapshot))
}

fn save_snapshot(path: &Path, snapshot: &CacheSnapshot) -> Result<(), PSError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(snapshot)?;
    secure_file::write_atomic(path, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::FixedTimeSource;
    use tempfile::tempdir;

    const JAN_2026: u64 = 1_767_225_600;

    struct StaticList(&'static str);

    impl TrustListClient for StaticList {
        fn fetch_metadata(&self) -> Result<TrustListMetadata, PSError> {
            Ok(TrustListMetadata {
                version: self.0.to_string(),
                ..TrustListMetadata::default()
            })
        }

        fn validate_fingerprint(&self, _fingerprint: &str) -> Result<bool, PSError> {
            Ok(true)
        }
    }

    fn at(secs: u64) -> Arc<dyn TimeSource> {
        Arc::new(FixedTimeSource::from_unix_secs(secs))
    }

    #[test]
    fn test_record_and_lookup() {
        let cache = TrustListCache::in_memory(Duration::from_secs(3600), at(JAN_2026));
        assert!(cache.lookup("abc").is_none());
        cache.record("abc", true).unwrap();
        assert_eq!(
            cache.lookup("abc"),
            Some(CachedVerdict {
                trusted: true,
                checked_at: JAN_2026
            })
        );
    }

    #[test]
    fn test_stale_entries_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trust-cache.json");
        TrustListCache::open(&path, Duration::from_secs(60), at(JAN_2026))
            .record("abc", false)
            .unwrap();

        let fresh = TrustListCache::open(&path, Duration::from_secs(60), at(JAN_2026 + 30));
        assert!(fresh.lookup("abc").is_some());

        let later = TrustListCache::open(&path, Duration::from_secs(60), at(JAN_2026 + 61));
        assert!(later.lookup("abc").is_none());
    }

    #[test]
    fn test_refresh_stores_version_and_drops_old_verdicts() {
        let cache = TrustListCache::in_memory(Duration::from_secs(3600), at(JAN_2026));
        cache.refresh(&StaticList("v1")).unwrap();
        cache.record("abc", true).unwrap();

        // Same version keeps verdicts
        cache.refresh(&StaticList("v1")).unwrap();
        assert!(cache.lookup("abc").is_some());

        let outcome = cache.refresh(&StaticList("v2")).unwrap();
        assert!(matches!(outcome, RefreshOutcome::Refreshed(ref m) if m.version == "v2"));
        assert_eq!(cache.version().as_deref(), Some("v2"));
        assert!(cache.lookup("abc").is_none());
    }

    #[test]
    fn test_refresh_prunes_expired_verdicts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trust-cache.json");
        let early = TrustListCache::open(&path, Duration::from_secs(60), at(JAN_2026));
        early.refresh(&StaticList("v1")).unwrap();
        early.record("old", true).unwrap();
        TrustListCache::open(&path, Duration::from_secs(60), at(JAN_2026 + 50))
            .record("recent", false)
            .unwrap();

        let later = TrustListCache::open(&path, Duration::from_secs(60), at(JAN_2026 + 90));
        later.refresh(&StaticList("v1")).unwrap();
        let snapshot = later.snapshot();
        assert!(!snapshot.entries.contains_key("old"));
        assert!(snapshot.entries.contains_key("recent"));

        // Pruning is persisted
        let reopened = TrustListCache::open(&path, Duration::from_secs(3600), at(JAN_2026 + 90));
        assert!(reopened.lookup("old").is_none());
        assert!(reopened.lookup("recent").is_some());
    }

    #[test]
    fn test_refresh_is_single_flight() {
        let cache = TrustListCache::in_memory(Duration::from_secs(3600), at(JAN_2026));
        let _held = cache.refresh_lock.lock().unwrap();
        assert_eq!(
            cache.refresh(&StaticList("v1")).unwrap(),
            RefreshOutcome::AlreadyInProgress
        );
        assert!(cache.version().is_none());
    }

    #[test]
    fn test_corrupt_cache_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trust-cache.json");
        std::fs::write(&path, b"{broken").unwrap();
        let cache = TrustListCache::open(&path, Duration::from_secs(60), at(JAN_2026));
        assert!(cache.snapshot().entries.is_empty());
        cache.record("abc", true).unwrap();
        assert!(TrustListCache::open(&path, Duration::from_secs(60), at(JAN_2026))
            .lookup("abc")
            .is_some());
    }
}
