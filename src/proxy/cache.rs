//! Durable snapshot of the pool with a freshness window
//!
//! The cache only ever sees immutable snapshots. Stale entries are dropped here on load, so
//! callers can treat an empty result as "nothing usable".

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::models::PoolEntry;
use crate::proxy::source::CacheEntry;

/// Default freshness window (1 hour)
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(3600);

pub struct ProxyCache {
    path: PathBuf,
    freshness: Duration,
}

impl ProxyCache {
    pub fn new(path: impl Into<PathBuf>, freshness: Duration) -> Self {
        Self {
            path: path.into(),
            freshness,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Load entries that are still inside the freshness window
    pub async fn load(&self) -> Result<Vec<PoolEntry>> {
        self.load_at(Utc::now()).await
    }

    /// Load as of `now`.
    ///
    /// A missing file is an empty cache. Entries that fail to convert are skipped.
    pub async fn load_at(&self, now: DateTime<Utc>) -> Result<Vec<PoolEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No cache file, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(PoolError::CachePersistence(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let stored: Vec<CacheEntry> = serde_json::from_str(&content).map_err(|e| {
            PoolError::CachePersistence(format!("failed to parse {}: {}", self.path.display(), e))
        })?;

        let total = stored.len();
        let mut stale = 0;
        let mut entries = Vec::with_capacity(total);

        for entry in stored {
            if !self.is_fresh(&entry, now) {
                stale += 1;
                continue;
            }
            let address = entry.address.clone();
            match entry.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(address = %address, error = %e, "Skipping unreadable cache entry"),
            }
        }

        info!(
            path = %self.path.display(),
            loaded = entries.len(),
            stale,
            total,
            "Loaded proxy cache"
        );

        Ok(entries)
    }

    /// Persist a snapshot, stamping every entry with the current time
    pub async fn save(&self, snapshot: &[PoolEntry]) -> Result<()> {
        self.save_at(snapshot, Utc::now()).await
    }

    /// Persist a snapshot stamped with `now`.
    ///
    /// Writes to a sibling temp file and renames it over the cache file.
    pub async fn save_at(&self, snapshot: &[PoolEntry], now: DateTime<Utc>) -> Result<()> {
        let stored: Vec<CacheEntry> = snapshot
            .iter()
            .map(|entry| CacheEntry::from_entry(entry, now))
            .collect();
        let content = serde_json::to_string_pretty(&stored).map_err(|e| {
            PoolError::CachePersistence(format!("failed to serialize snapshot: {}", e))
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PoolError::CachePersistence(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, content).await.map_err(|e| {
            PoolError::CachePersistence(format!("failed to write {}: {}", tmp_path.display(), e))
        })?;

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(PoolError::CachePersistence(format!(
                "failed to rename {} -> {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            )));
        }

        debug!(path = %self.path.display(), count = stored.len(), "Saved proxy cache");
        Ok(())
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let Some(stamped_at) = entry.stamped_at() else {
            return false;
        };
        match (now - stamped_at).to_std() {
            Ok(age) => age <= self.freshness,
            // Stamped in the future; clock skew between writer and reader.
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Credentials, Protocol, ProxyRecord};
    use chrono::TimeZone;

    fn snapshot() -> Vec<PoolEntry> {
        let checked = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let mut working = PoolEntry::new(
            ProxyRecord::new("10.0.0.1:8080", Protocol::Http)
                .unwrap()
                .with_region(Some("EU".to_string()))
                .with_credentials(Some(Credentials::new("user", "secret"))),
        );
        working
            .status
            .record_success(Duration::from_millis(250), checked);

        let mut failed = PoolEntry::new(ProxyRecord::new("10.0.0.2:1080", Protocol::Socks5).unwrap());
        failed.status.record_failure("connection refused", checked);

        let fresh = PoolEntry::new(ProxyRecord::new("10.0.0.3:3128", Protocol::Http).unwrap());

        vec![working, failed, fresh]
    }

    #[tokio::test]
    async fn test_round_trip_within_freshness_window() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProxyCache::new(dir.path().join("proxies.json"), DEFAULT_FRESHNESS);
        let saved_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap();

        let original = snapshot();
        cache.save_at(&original, saved_at).await.unwrap();

        let loaded = cache
            .load_at(saved_at + chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_entries_expire_after_freshness_window() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProxyCache::new(dir.path().join("proxies.json"), DEFAULT_FRESHNESS);
        let saved_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap();

        cache.save_at(&snapshot(), saved_at).await.unwrap();

        let loaded = cache
            .load_at(saved_at + chrono::Duration::minutes(61))
            .await
            .unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_resaving_does_not_refresh_old_validations() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProxyCache::new(dir.path().join("proxies.json"), DEFAULT_FRESHNESS);
        // Validated at 12:00, written again two hours later.
        let saved_at = Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap();

        cache.save_at(&snapshot(), saved_at).await.unwrap();

        let loaded = cache
            .load_at(saved_at + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].address(), "10.0.0.3:3128");
        assert_eq!(loaded[0].status.attempts(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProxyCache::new(dir.path().join("absent.json"), DEFAULT_FRESHNESS);

        assert!(cache.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let cache = ProxyCache::new(&path, DEFAULT_FRESHNESS);
        assert!(matches!(
            cache.load().await,
            Err(PoolError::CachePersistence(_))
        ));
    }

    #[tokio::test]
    async fn test_save_replaces_file_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("proxies.json");
        let cache = ProxyCache::new(&path, DEFAULT_FRESHNESS);

        cache.save(&snapshot()).await.unwrap();
        cache.save(&snapshot()[..1]).await.unwrap();

        assert!(!path.with_extension("tmp").exists());
        assert_eq!(cache.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_entries_without_timestamps_are_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        tokio::fs::write(
            &path,
            r#"[
                {"address": "10.0.0.9:8080", "protocol": "http"},
                {"address": "10.0.0.8:8080", "protocol": "http",
                 "last_checked": "2099-01-01T00:00:00Z", "response_time": 0.5}
            ]"#,
        )
        .await
        .unwrap();

        let cache = ProxyCache::new(&path, DEFAULT_FRESHNESS);
        let loaded = cache.load().await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].address(), "10.0.0.8:8080");
        assert!(loaded[0].status.is_working());
    }
}
