// =============================================================================
// Compressed Cache — content-addressed, TTL-bound page cache
// =============================================================================
//
// Two storage layers keyed by the canonical hash of the URL:
//   L1: in-process map, expired lazily on read.
//   L2: one gzip file per key under the cache directory; contents are a
//       UTF-8 JSON object {stored_at, url, payload}.
//
// A disk hit is promoted back into L1. Writes go to both layers; the file
// write is atomic (tmp + rename) so no partial file survives a crash. The
// sweeper deletes expired and unreadable files; it runs at construction and
// periodically from the orchestrator.
// =============================================================================

use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::identity::content_key;
use crate::metrics::MetricsRegistry;

/// One cached page payload with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    stored_at: DateTime<Utc>,
    url: String,
    payload: Value,
}

impl CacheEntry {
    fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now - self.stored_at > max_age
    }
}

/// Raw vs. compressed byte totals for the session.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CompressionStats {
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
}

impl CompressionStats {
    pub fn ratio(&self) -> f64 {
        if self.compressed_bytes == 0 {
            return 0.0;
        }
        self.raw_bytes as f64 / self.compressed_bytes as f64
    }
}

/// Gzip-compressed, content-addressed key-value cache.
pub struct CompressedCache {
    dir: PathBuf,
    max_age: Duration,
    memory: Mutex<HashMap<String, CacheEntry>>,
    metrics: Arc<MetricsRegistry>,
    raw_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

impl CompressedCache {
    /// Create the cache, ensuring the directory exists and sweeping whatever
    /// is already on disk. An unusable directory is a startup-fatal error.
    pub fn new(
        dir: impl Into<PathBuf>,
        max_age: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;

        let cache = Self {
            dir,
            max_age,
            memory: Mutex::new(HashMap::new()),
            metrics,
            raw_bytes: AtomicU64::new(0),
            compressed_bytes: AtomicU64::new(0),
        };
        cache.sweep();
        Ok(cache)
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    // -------------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------------

    /// Return the cached payload for `url` when present and fresh.
    pub async fn get(&self, url: &str) -> Option<Value> {
        let key = content_key(url);
        let now = Utc::now();

        // L1 first; expired entries are dropped on the spot.
        {
            let mut memory = self.memory.lock();
            if let Some(entry) = memory.get(&key) {
                if entry.is_expired(self.max_age, now) {
                    memory.remove(&key);
                } else {
                    let payload = entry.payload.clone();
                    self.record_hit(url, "memory");
                    return Some(payload);
                }
            }
        }

        // L2: decode, validate freshness, promote.
        let path = self.file_path(&key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => {
                self.record_miss(url);
                return None;
            }
        };

        match decode_entry(&bytes) {
            Ok(entry) if !entry.is_expired(self.max_age, now) => {
                let payload = entry.payload.clone();
                self.memory.lock().insert(key, entry);
                self.record_hit(url, "disk");
                Some(payload)
            }
            Ok(_) => {
                // Expired on disk: delete eagerly.
                tokio::fs::remove_file(&path).await.ok();
                self.record_miss(url);
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt cache file removed");
                tokio::fs::remove_file(&path).await.ok();
                self.record_miss(url);
                None
            }
        }
    }

    fn record_hit(&self, url: &str, layer: &str) {
        debug!(layer, url, "cache hit");
        self.metrics.increment_counter("cache.hits", 1);
        self.update_hit_rate();
    }

    fn record_miss(&self, url: &str) {
        debug!(url, "cache miss");
        self.metrics.increment_counter("cache.misses", 1);
        self.update_hit_rate();
    }

    fn update_hit_rate(&self) {
        let hits = self.metrics.counter_value("cache.hits") as f64;
        let misses = self.metrics.counter_value("cache.misses") as f64;
        if hits + misses > 0.0 {
            self.metrics
                .set_gauge("cache.hit_rate", hits / (hits + misses) * 100.0);
        }
    }

    // -------------------------------------------------------------------------
    // Write path
    // -------------------------------------------------------------------------

    /// Store `payload` for `url`, overwriting both layers.
    pub async fn set(&self, url: &str, payload: Value) -> Result<()> {
        let key = content_key(url);
        let entry = CacheEntry {
            stored_at: Utc::now(),
            url: url.to_string(),
            payload,
        };

        let (compressed, raw_len) = encode_entry(&entry)?;
        self.raw_bytes.fetch_add(raw_len as u64, Ordering::Relaxed);
        self.compressed_bytes
            .fetch_add(compressed.len() as u64, Ordering::Relaxed);

        // Atomic file write: tmp sibling, then rename over the final name.
        let path = self.file_path(&key);
        let tmp = self.dir.join(format!("{key}.tmp"));
        tokio::fs::write(&tmp, &compressed)
            .await
            .with_context(|| format!("failed to write cache tmp file {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to rename cache file {}", path.display()))?;

        self.memory.lock().insert(key, entry);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sweeping
    // -------------------------------------------------------------------------

    /// Delete expired and unreadable files. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cache sweep failed to list dir");
                return 0;
            }
        };

        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }
            // Leftover tmp files from a crashed write are always garbage.
            let stale_tmp = path.extension().is_some_and(|ext| ext == "tmp");

            let delete = stale_tmp
                || match std::fs::read(&path).and_then(|bytes| {
                    decode_entry(&bytes)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                }) {
                    Ok(entry) => entry.is_expired(self.max_age, now),
                    Err(_) => true,
                };

            if delete && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        // Drop expired L1 entries in the same pass.
        self.memory
            .lock()
            .retain(|_, entry| !entry.is_expired(self.max_age, now));

        if removed > 0 {
            debug!(removed, "cache sweep removed entries");
        }
        removed
    }

    /// Session compression totals.
    pub fn compression_stats(&self) -> CompressionStats {
        CompressionStats {
            raw_bytes: self.raw_bytes.load(Ordering::Relaxed),
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed),
        }
    }
}

fn encode_entry(entry: &CacheEntry) -> Result<(Vec<u8>, usize)> {
    let raw = serde_json::to_vec(entry).context("failed to serialize cache entry")?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .context("failed to compress cache entry")?;
    let compressed = encoder.finish().context("failed to finish gzip stream")?;
    Ok((compressed, raw.len()))
}

fn decode_entry(bytes: &[u8]) -> Result<CacheEntry> {
    let mut decoder = GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .context("failed to decompress cache entry")?;
    serde_json::from_slice(&raw).context("failed to parse cache entry")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    fn test_cache(dir: &Path, max_age: Duration) -> CompressedCache {
        CompressedCache::new(dir, max_age, Arc::new(MetricsRegistry::new())).unwrap()
    }

    #[tokio::test]
    async fn roundtrip_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), Duration::hours(6));

        let payload = json!({"jobs": [{"title": "Dev", "link": "/vagas/1"}], "page": 1});
        cache
            .set("https://example.com/vagas?page=1", payload.clone())
            .await
            .unwrap();

        let got = cache.get("https://example.com/vagas?page=1").await;
        assert_eq!(got, Some(payload));
    }

    #[tokio::test]
    async fn disk_layer_survives_l1_loss() {
        let dir = tempfile::tempdir().unwrap();
        let payload = json!({"jobs": []});

        {
            let cache = test_cache(dir.path(), Duration::hours(6));
            cache.set("https://example.com/a", payload.clone()).await.unwrap();
        }

        // A fresh instance has an empty L1 and must promote from disk.
        let cache = test_cache(dir.path(), Duration::hours(6));
        assert_eq!(cache.get("https://example.com/a").await, Some(payload));
    }

    #[tokio::test]
    async fn expired_entry_misses_and_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), Duration::zero());

        cache.set("https://example.com/a", json!(1)).await.unwrap();
        let key = content_key("https://example.com/a");
        assert!(dir.path().join(&key).exists());

        assert_eq!(cache.get("https://example.com/a").await, None);
        assert!(!dir.path().join(&key).exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_removed_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), Duration::hours(6));

        let key = content_key("https://example.com/bad");
        std::fs::write(dir.path().join(&key), b"not gzip at all").unwrap();

        assert_eq!(cache.get("https://example.com/bad").await, None);
        assert!(!dir.path().join(&key).exists());
    }

    #[tokio::test]
    async fn sweep_removes_expired_corrupt_and_tmp_files() {
        let dir = tempfile::tempdir().unwrap();

        {
            let cache = test_cache(dir.path(), Duration::zero());
            cache.set("https://example.com/old", json!(1)).await.unwrap();
        }
        std::fs::write(dir.path().join("deadbeef"), b"garbage").unwrap();
        std::fs::write(dir.path().join("abc.tmp"), b"partial").unwrap();

        let cache = test_cache(dir.path(), Duration::zero());
        // Construction already swept; the directory holds no stale files.
        let _ = cache;
        let survivors: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert!(survivors.is_empty());
    }

    #[tokio::test]
    async fn set_overwrites_previous_payload() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), Duration::hours(6));

        cache.set("https://example.com/a", json!(1)).await.unwrap();
        cache.set("https://example.com/a", json!(2)).await.unwrap();
        assert_eq!(cache.get("https://example.com/a").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn compression_shrinks_job_like_json() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), Duration::hours(6));

        let jobs: Vec<Value> = (0..50)
            .map(|i| {
                json!({
                    "title": format!("Desenvolvedor Python Pleno {i}"),
                    "company": "TechCorp Sistemas Ltda",
                    "location": "São Paulo, SP",
                    "salary": "R$ 8.000 - R$ 12.000",
                    "link": format!("https://example.com/vagas/{i}"),
                })
            })
            .collect();
        cache
            .set("https://example.com/vagas", json!({"jobs": jobs}))
            .await
            .unwrap();

        let stats = cache.compression_stats();
        assert!(
            stats.ratio() >= 2.0,
            "expected >= 2x compression, got {:.2}",
            stats.ratio()
        );
    }

    #[tokio::test]
    async fn hit_and_miss_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        let cache =
            CompressedCache::new(dir.path(), Duration::hours(6), metrics.clone()).unwrap();

        cache.get("https://example.com/none").await;
        cache.set("https://example.com/a", json!(1)).await.unwrap();
        cache.get("https://example.com/a").await;

        assert_eq!(metrics.counter_value("cache.misses"), 1);
        assert_eq!(metrics.counter_value("cache.hits"), 1);
        assert_eq!(metrics.gauge_value("cache.hit_rate"), Some(50.0));
    }
}
