//! Durable per-metric cache of samples that have not yet been pruned.
//!
//! Each metric owns an ordered log guarded by its own mutex, so writers on
//! different metrics never contend. Logs are persisted one JSON file per
//! metric; [`LocalCache::flush`] writes every log modified since the previous
//! flush. Entries appended after the last flush are lost on a crash.

pub mod entry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub use self::entry::CacheEntry;

#[derive(Default)]
struct LogState {
    entries: Vec<CacheEntry>,
    next_seq: u64,
    dirty: bool,
}

#[derive(Default)]
struct MetricLog {
    state: Mutex<LogState>,
}

/// On-disk layout of one metric log.
#[derive(Deserialize)]
struct LogFile {
    id: String,
    #[serde(default)]
    entries: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct LogFileRef<'a> {
    id: &'a str,
    entries: &'a [CacheEntry],
}

/// Restart-safe local cache keyed by metric id.
pub struct LocalCache {
    dir: PathBuf,
    logs: DashMap<String, Arc<MetricLog>>,
    /// Serializes flushes so two writers never share a temp file.
    flush_lock: tokio::sync::Mutex<()>,
}

impl LocalCache {
    /// Opens the cache rooted at `dir`, reloading every persisted log.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating cache directory {}", dir.display()))?;

        let cache = Self {
            dir,
            logs: DashMap::new(),
            flush_lock: tokio::sync::Mutex::new(()),
        };

        let read_dir = std::fs::read_dir(&cache.dir)
            .with_context(|| format!("listing cache directory {}", cache.dir.display()))?;

        for dir_entry in read_dir {
            let path = dir_entry.context("reading cache directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Err(e) = cache.load_file(&path) {
                warn!(path = %path.display(), error = %e, "skipping unreadable cache file");
            }
        }

        debug!(
            dir = %cache.dir.display(),
            metrics = cache.logs.len(),
            entries = cache.total_entries(),
            "local cache opened"
        );

        Ok(cache)
    }

    fn load_file(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path).context("reading cache file")?;
        let file: LogFile = serde_json::from_slice(&data).context("parsing cache file")?;

        let mut corrupt = 0usize;
        let mut entries = Vec::with_capacity(file.entries.len());
        for raw in file.entries {
            match serde_json::from_value::<CacheEntry>(raw) {
                Ok(entry) => entries.push(entry),
                Err(_) => corrupt += 1,
            }
        }
        if corrupt > 0 {
            warn!(id = %file.id, corrupt, "dropped corrupt cache entries on load");
        }

        // Sequence numbers only need to be unique within this process.
        for (idx, entry) in entries.iter_mut().enumerate() {
            entry.seq = idx as u64 + 1;
        }

        let state = LogState {
            next_seq: entries.len() as u64,
            entries,
            dirty: corrupt > 0,
        };
        self.logs.insert(
            file.id,
            Arc::new(MetricLog {
                state: Mutex::new(state),
            }),
        );

        Ok(())
    }

    fn log_for(&self, id: &str) -> Arc<MetricLog> {
        if let Some(log) = self.logs.get(id) {
            return Arc::clone(&log);
        }
        Arc::clone(&self.logs.entry(id.to_string()).or_default())
    }

    fn existing_log(&self, id: &str) -> Option<Arc<MetricLog>> {
        self.logs.get(id).map(|log| Arc::clone(&log))
    }

    /// Appends an entry to the metric's log and returns its sequence number.
    pub fn append(&self, id: &str, mut entry: CacheEntry) -> u64 {
        let log = self.log_for(id);
        let mut state = log.state.lock();
        state.next_seq += 1;
        entry.seq = state.next_seq;
        state.entries.push(entry);
        state.dirty = true;
        state.next_seq
    }

    /// Returns a snapshot of the metric's log in append order.
    pub fn read_all(&self, id: &str) -> Vec<CacheEntry> {
        match self.existing_log(id) {
            Some(log) => log.state.lock().entries.clone(),
            None => Vec::new(),
        }
    }

    /// Returns the most recently appended entry.
    pub fn last(&self, id: &str) -> Option<CacheEntry> {
        self.existing_log(id)
            .and_then(|log| log.state.lock().entries.last().cloned())
    }

    /// Returns a snapshot of the entries not yet written to the store.
    pub fn unpersisted(&self, id: &str) -> Vec<CacheEntry> {
        match self.existing_log(id) {
            Some(log) => log
                .state
                .lock()
                .entries
                .iter()
                .filter(|e| !e.persisted)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Swaps the metric's whole log for `entries`.
    pub fn replace(&self, id: &str, entries: Vec<CacheEntry>) {
        self.replace_with(id, |_| Some(entries));
    }

    /// Replaces the metric's log with the result of `f`, computed while the
    /// log is locked so that concurrent appends are never lost. Returning
    /// `None` leaves the log untouched. Returns whether the log was replaced.
    pub fn replace_with<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&[CacheEntry]) -> Option<Vec<CacheEntry>>,
    {
        let log = self.log_for(id);
        let mut state = log.state.lock();
        let Some(replacement) = f(&state.entries) else {
            return false;
        };
        if let Some(last) = replacement.last() {
            state.next_seq = state.next_seq.max(last.seq);
        }
        state.entries = replacement;
        state.dirty = true;
        true
    }

    /// Marks the entry with sequence number `seq` as stored. Returns false if
    /// the entry no longer exists.
    pub fn mark_persisted(&self, id: &str, seq: u64) -> bool {
        let Some(log) = self.existing_log(id) else {
            return false;
        };
        let mut state = log.state.lock();
        match state.entries.binary_search_by_key(&seq, |e| e.seq) {
            Ok(idx) => {
                if let Some(entry) = state.entries.get_mut(idx) {
                    if !entry.persisted {
                        entry.persisted = true;
                        state.dirty = true;
                    }
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Lists every metric id present in the cache, sorted.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.logs.iter().map(|e| e.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    /// Total number of cached entries across all metrics.
    pub fn total_entries(&self) -> usize {
        self.logs
            .iter()
            .map(|e| e.value().state.lock().entries.len())
            .sum()
    }

    /// Writes every log modified since the last flush to disk. Returns the
    /// number of logs written.
    pub async fn flush(&self) -> Result<usize> {
        let _flushing = self.flush_lock.lock().await;

        let logs: Vec<(String, Arc<MetricLog>)> = self
            .logs
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut written = 0usize;
        let mut last_err = None;

        for (id, log) in logs {
            let payload = {
                let mut state = log.state.lock();
                if !state.dirty {
                    continue;
                }
                state.dirty = false;
                serde_json::to_vec(&LogFileRef {
                    id: &id,
                    entries: &state.entries,
                })
            };

            let result = match payload {
                Ok(payload) => self.write_atomic(&id, &payload).await,
                Err(e) => Err(e).context("encoding cache log"),
            };

            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    log.state.lock().dirty = true;
                    warn!(id = %id, error = %e, "cache flush failed");
                    last_err = Some(e.context(format!("flushing cache log for {id}")));
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => {
                if written > 0 {
                    debug!(written, "cache flushed");
                }
                Ok(written)
            }
        }
    }

    async fn write_atomic(&self, id: &str, payload: &[u8]) -> Result<()> {
        let path = self.dir.join(file_name(id));
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, payload)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} into place", tmp.display()))?;

        Ok(())
    }
}

/// File name for a metric id. Ids may contain any character, so they are
/// hashed rather than used verbatim.
fn file_name(id: &str) -> String {
    format!("{:x}.json", Sha256::digest(id.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn entry(ts: i64, v: f64) -> CacheEntry {
        CacheEntry::new(ts, Value::Number(v))
    }

    #[test]
    fn test_append_assigns_increasing_seq() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open");

        let a = cache.append("m.a", entry(1_700_000_000, 1.0));
        let b = cache.append("m.a", entry(1_700_000_001, 2.0));
        let other = cache.append("m.b", entry(1_700_000_000, 3.0));

        assert!(b > a);
        assert_eq!(other, 1);
        let log = cache.read_all("m.a");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].val, Value::Number(1.0));
        assert_eq!(cache.last("m.a").map(|e| e.seq), Some(b));
        assert_eq!(cache.list_ids(), vec!["m.a".to_string(), "m.b".to_string()]);
        assert_eq!(cache.total_entries(), 3);
    }

    #[test]
    fn test_read_unknown_id_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open");
        assert!(cache.read_all("missing").is_empty());
        assert!(cache.last("missing").is_none());
        assert!(cache.list_ids().is_empty());
        assert!(!cache.mark_persisted("missing", 1));
    }

    #[test]
    fn test_mark_persisted_is_monotonic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open");

        let seq = cache.append("m", entry(1_700_000_000, 1.0));
        cache.append("m", entry(1_700_000_001, 2.0));

        assert!(cache.mark_persisted("m", seq));
        assert!(cache.mark_persisted("m", seq));

        let log = cache.read_all("m");
        assert!(log[0].persisted);
        assert!(!log[1].persisted);
        assert_eq!(cache.unpersisted("m").len(), 1);
    }

    #[test]
    fn test_mark_persisted_after_replace_finds_entry_by_seq() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open");

        let first = cache.append("m", entry(1_700_000_000, 1.0));
        let second = cache.append("m", entry(1_700_000_001, 2.0));
        assert!(cache.replace_with("m", |entries| {
            Some(entries.iter().filter(|e| e.seq != first).cloned().collect())
        }));
        assert!(!cache.replace_with("m", |_| None));

        assert!(!cache.mark_persisted("m", first));
        assert!(cache.mark_persisted("m", second));
    }

    #[test]
    fn test_replace_keeps_seq_monotonic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = LocalCache::open(dir.path()).expect("open");

        cache.append("m", entry(1_700_000_000, 1.0));
        let kept = cache.read_all("m");
        cache.replace("m", Vec::new());
        let next = cache.append("m", entry(1_700_000_002, 2.0));

        assert!(next > kept[0].seq);
        assert_eq!(cache.read_all("m").len(), 1);
    }

    #[tokio::test]
    async fn test_flush_and_reopen_restores_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let cache = LocalCache::open(dir.path()).expect("open");
            let seq = cache.append("hm-rpc.0.temp/with:odd chars", entry(1_700_000_000, 21.5));
            cache.append(
                "hm-rpc.0.temp/with:odd chars",
                CacheEntry::new(1_700_000_060, Value::Text("x".into()))
                    .with_ack(true)
                    .with_source(Some("system.adapter.js".into())),
            );
            cache.mark_persisted("hm-rpc.0.temp/with:odd chars", seq);
            assert_eq!(cache.flush().await.expect("flush"), 1);
            // Nothing dirty, nothing written.
            assert_eq!(cache.flush().await.expect("flush"), 0);
            // Not flushed: lost on restart.
            cache.append("unflushed", entry(1_700_000_000, 1.0));
        }

        let cache = LocalCache::open(dir.path()).expect("reopen");
        assert_eq!(cache.list_ids(), vec!["hm-rpc.0.temp/with:odd chars".to_string()]);
        let log = cache.read_all("hm-rpc.0.temp/with:odd chars");
        assert_eq!(log.len(), 2);
        assert!(log[0].persisted);
        assert_eq!(log[1].val, Value::Text("x".into()));
        assert!(log[1].ack);
        assert_eq!(log[1].from.as_deref(), Some("system.adapter.js"));
        assert!(log[0].seq < log[1].seq);
    }

    #[tokio::test]
    async fn test_open_skips_corrupt_entries_and_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"id":"m","entries":[null,{"ts":1700000000,"val":3},{"bogus":true}]}"#,
        )
        .expect("write");
        std::fs::write(dir.path().join("b.json"), "not json").expect("write");
        std::fs::write(dir.path().join("ignored.txt"), "whatever").expect("write");

        let cache = LocalCache::open(dir.path()).expect("open");
        let log = cache.read_all("m");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].val, Value::Number(3.0));
        assert!(!log[0].persisted);
        assert_eq!(cache.list_ids(), vec!["m".to_string()]);
    }

    #[test]
    fn test_file_name_is_stable_hex() {
        let name = file_name("a/b");
        assert_eq!(name.len(), 64 + ".json".len());
        assert!(name.ends_with(".json"));
        assert_eq!(name, file_name("a/b"));
        assert_ne!(name, file_name("a_b"));
    }
}
