//! Per-platform compilation caches.
//!
//! Each target platform (iPhoneSimulator, MacOSX, ...) gets its own cache
//! mapping source path -> [`CompilationRecord`]. Caches survive daemon
//! restarts through gzip-compressed JSON snapshots so a project does not have
//! to be rebuilt just to repopulate compiler arguments.

use crate::record::CompilationRecord;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Suffix of on-disk snapshot files, appended to the platform name.
pub const SNAPSHOT_SUFFIX: &str = "_commands.json.gz";

/// Records for one platform, plus the single postponed-injection slot.
pub struct CompilationCache {
    /// Platform these records were captured for.
    platform: String,

    /// Source path -> captured invocation.
    records: FxHashMap<String, Arc<CompilationRecord>>,

    /// Most recently stored record. Successive captures in one build are
    /// usually identical apart from the primary file, so new entries reuse
    /// this allocation when they compare equal.
    last_record: Option<Arc<CompilationRecord>>,

    /// Source whose injection was requested before its record existed.
    /// Holds at most one path; a newer request replaces an older one.
    pending_source: Option<String>,
}

impl CompilationCache {
    /// Create an empty cache for `platform`.
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            records: FxHashMap::default(),
            last_record: None,
            pending_source: None,
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, source: &str) -> bool {
        self.records.contains_key(source)
    }

    /// Look up the captured invocation for `source`.
    pub fn lookup(&self, source: &str) -> Option<Arc<CompilationRecord>> {
        self.records.get(source).cloned()
    }

    /// Store a record for `source`, reusing an equal existing allocation
    /// where possible.
    ///
    /// Returns the postponed source if this store satisfied the pending
    /// slot: the caller should retry that injection exactly once. The slot
    /// is cleared before returning so a second store cannot retrigger it.
    pub fn store(&mut self, source: &str, record: CompilationRecord) -> Option<String> {
        let record = self.dedup(source, record);
        self.last_record = Some(Arc::clone(&record));
        self.records.insert(source.to_string(), record);

        if self.pending_source.as_deref() == Some(source) {
            self.pending_source = None;
            return Some(source.to_string());
        }
        None
    }

    fn dedup(&self, source: &str, record: CompilationRecord) -> Arc<CompilationRecord> {
        if let Some(existing) = self.records.get(source) {
            if **existing == record {
                return Arc::clone(existing);
            }
        }
        if let Some(last) = &self.last_record {
            if **last == record {
                return Arc::clone(last);
            }
        }
        Arc::new(record)
    }

    /// Park `source` until its compiler arguments show up.
    pub fn set_pending(&mut self, source: &str) {
        self.pending_source = Some(source.to_string());
    }

    pub fn pending_source(&self) -> Option<&str> {
        self.pending_source.as_deref()
    }

    pub fn remove(&mut self, source: &str) -> Option<Arc<CompilationRecord>> {
        self.records.remove(source)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.last_record = None;
        self.pending_source = None;
    }

    /// Sources currently cached, in no particular order.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Snapshot path for `platform` under `dir`.
    pub fn snapshot_path(dir: &Path, platform: &str) -> PathBuf {
        dir.join(format!("{platform}{SNAPSHOT_SUFFIX}"))
    }

    /// Write all records to the platform's snapshot file under `dir`.
    pub fn save_snapshot(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::snapshot_path(dir, &self.platform);
        std::fs::create_dir_all(dir)?;

        // Arc is transparent for serialization; a sorted view keeps the
        // output stable across runs.
        let view: std::collections::BTreeMap<&str, &CompilationRecord> = self
            .records
            .iter()
            .map(|(source, record)| (source.as_str(), record.as_ref()))
            .collect();

        let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
        serde_json::to_writer(&mut encoder, &view)?;
        encoder.finish()?;
        info!(
            platform = %self.platform,
            records = self.records.len(),
            path = %path.display(),
            "saved compilation cache snapshot"
        );
        Ok(path)
    }

    /// Load the snapshot for `platform` from `dir`.
    ///
    /// Returns an empty cache when no snapshot exists. A snapshot that
    /// cannot be decoded is an error; callers that can start cold should use
    /// [`CompilationCache::open`] instead.
    pub fn load_snapshot(dir: &Path, platform: &str) -> Result<Self> {
        let path = Self::snapshot_path(dir, platform);
        if !path.exists() {
            return Ok(Self::new(platform));
        }

        let file = BufReader::new(File::open(&path)?);
        let decoder = GzDecoder::new(file);
        let raw: FxHashMap<String, CompilationRecord> = serde_json::from_reader(decoder)?;

        // Rebuild the sharing that serialization flattened: equal records
        // collapse back into one allocation.
        let mut pool: HashSet<Arc<CompilationRecord>> = HashSet::new();
        let mut records = FxHashMap::default();
        for (source, record) in raw {
            let shared = match pool.get(&record) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let fresh = Arc::new(record);
                    pool.insert(Arc::clone(&fresh));
                    fresh
                }
            };
            records.insert(source, shared);
        }

        info!(
            platform,
            records = records.len(),
            path = %path.display(),
            "loaded compilation cache snapshot"
        );
        Ok(Self {
            platform: platform.to_string(),
            records,
            last_record: None,
            pending_source: None,
        })
    }

    /// Load the snapshot for `platform`, falling back to an empty cache if
    /// the file is missing or unreadable.
    pub fn open(dir: &Path, platform: &str) -> Self {
        match Self::load_snapshot(dir, platform) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(platform, "could not load cache snapshot, starting cold: {err}");
                Self::new(platform)
            }
        }
    }
}
