//! Content-hash cache contexts for mutable snapshots.
//!
//! A context records, for every path in a snapshot, the stat the peer last
//! reported and a digest over that stat and the file's content. The file
//! sync receiver consults it to skip unchanged files and updates it as it
//! writes. Contexts are kept in memory and mirrored to one JSON file per ref.

use std::collections::BTreeMap;
use std::path::PathBuf;

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::Digest;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::session::FileStat;

/// One recorded path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub stat: FileStat,
    pub digest: Digest,
}

impl FileRecord {
    /// Record `stat`, hashing it together with the content digest if any.
    pub fn new(stat: FileStat, content: Option<&Digest>) -> Self {
        let mut preimage = format!(
            "{:?}\0{:o}\0{}\0{}\0{}\0{}\0{}\0",
            stat.kind, stat.mode, stat.uid, stat.gid, stat.size, stat.mod_time, stat.linkname
        )
        .into_bytes();
        if let Some(content) = content {
            preimage.extend_from_slice(content.as_str().as_bytes());
        }
        Self {
            digest: Digest::from_bytes(&preimage),
            stat,
        }
    }

    /// Whether `stat` describes the same entry this record was made from.
    pub fn same_metadata(&self, stat: &FileStat) -> bool {
        self.stat == *stat
    }
}

/// Per-snapshot record of transferred paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheContext {
    records: BTreeMap<String, FileRecord>,
}

impl CacheContext {
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, record: FileRecord) {
        self.records.insert(path.into(), record);
    }

    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.records.remove(path)
    }

    /// Keep only the paths for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.records.retain(|path, _| keep(path));
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Digest over every recorded path, in path order.
    pub fn root_digest(&self) -> Digest {
        let mut preimage = Vec::new();
        for (path, record) in &self.records {
            preimage.extend_from_slice(path.as_bytes());
            preimage.push(0);
            preimage.extend_from_slice(record.digest.as_str().as_bytes());
            preimage.push(b'\n');
        }
        Digest::from_bytes(&preimage)
    }
}

/// Cache contexts keyed by mutable ref id.
pub struct ContentHashStore {
    contexts: DashMap<String, CacheContext>,
    dir: Option<PathBuf>,
}

impl ContentHashStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            contexts: DashMap::new(),
            dir: None,
        }
    }

    /// A store mirrored to JSON files under `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            BuildError::CacheError(format!(
                "Failed to create content hash directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            contexts: DashMap::new(),
            dir: Some(dir),
        })
    }

    fn context_path(&self, ref_id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json", ref_id)))
    }

    /// The context for `ref_id`; empty if none was recorded.
    pub fn get(&self, ref_id: &str) -> Result<CacheContext> {
        if let Some(cc) = self.contexts.get(ref_id) {
            return Ok(cc.clone());
        }

        let Some(path) = self.context_path(ref_id) else {
            return Ok(CacheContext::default());
        };
        if !path.exists() {
            return Ok(CacheContext::default());
        }

        let data = std::fs::read_to_string(&path).map_err(|e| {
            BuildError::CacheError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let cc: CacheContext = serde_json::from_str(&data)?;
        self.contexts.insert(ref_id.to_string(), cc.clone());
        Ok(cc)
    }

    /// Replace the context for `ref_id`.
    pub fn set(&self, ref_id: &str, cc: CacheContext) -> Result<()> {
        if let Some(path) = self.context_path(ref_id) {
            let data = serde_json::to_string(&cc)?;
            std::fs::write(&path, data).map_err(|e| {
                BuildError::CacheError(format!("Failed to write {}: {}", path.display(), e))
            })?;
        }
        self.contexts.insert(ref_id.to_string(), cc);
        Ok(())
    }

    /// Forget the context for `ref_id`. Never fails; a stale file is logged.
    pub fn clear(&self, ref_id: &str) {
        self.contexts.remove(ref_id);
        if let Some(path) = self.context_path(ref_id) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove content hash context");
                }
            }
        }
    }
}

impl Default for ContentHashStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
