//! Directory-backed snapshot ref store.
//!
//! Mutable refs live under `mutable/<id>/` and committed snapshots under
//! `snapshots/<id>/`. Ref records are indexed in memory and persisted to
//! `index.json` after every change. Holds on mutable refs are in-memory only,
//! so a restart releases every hold.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use a3s_build_core::error::{BuildError, RefErrorKind, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{
    CacheAccessor, CachePolicy, IdentityMapping, ImmutableRef, Mount, MutableRef, NewRefOptions,
    RefMetadata,
};

/// Persisted metadata for one ref.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefRecord {
    pub id: String,
    pub mutable: bool,
    pub policy: CachePolicy,
    pub description: String,
    pub record_type: String,
    /// String metadata by key
    #[serde(default)]
    pub strings: HashMap<String, String>,
    /// Search index by metadata key
    #[serde(default)]
    pub indexes: HashMap<String, String>,
    /// For snapshots, the mutable ref they were committed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RefIndex {
    refs: Vec<RefRecord>,
}

struct Inner {
    root: PathBuf,
    records: RwLock<HashMap<String, RefRecord>>,
    held: Mutex<HashSet<String>>,
    save_lock: Mutex<()>,
    identity_mapping: Option<IdentityMapping>,
}

impl Inner {
    fn mutable_dir(&self, id: &str) -> PathBuf {
        self.root.join("mutable").join(id)
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.root.join("snapshots").join(id)
    }

    fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock();
        let index = RefIndex {
            refs: self.records.read().values().cloned().collect(),
        };
        let data = serde_json::to_string_pretty(&index)?;

        let index_path = self.root.join("index.json");
        let tmp_path = self.root.join("index.json.tmp");
        std::fs::write(&tmp_path, data).map_err(|e| {
            BuildError::CacheError(format!(
                "Failed to write ref index {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &index_path).map_err(|e| {
            BuildError::CacheError(format!(
                "Failed to replace ref index {}: {}",
                index_path.display(),
                e
            ))
        })
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut RefRecord)) -> Result<()> {
        {
            let mut records = self.records.write();
            let record = records.get_mut(id).ok_or_else(|| BuildError::RefError {
                id: id.to_string(),
                kind: RefErrorKind::NotFound,
            })?;
            f(record);
        }
        self.save()
    }

    fn unhold(&self, id: &str) {
        self.held.lock().remove(id);
    }
}

/// Snapshot ref store rooted at a directory.
#[derive(Clone)]
pub struct LocalRefManager {
    inner: Arc<Inner>,
}

impl LocalRefManager {
    /// Open the store at `root`, creating it if needed.
    pub fn new(root: &Path) -> Result<Self> {
        Self::open(root, None)
    }

    /// Open the store; files written through mounts are owned according to
    /// `identity_mapping`.
    pub fn open(root: &Path, identity_mapping: Option<IdentityMapping>) -> Result<Self> {
        for dir in [root.join("mutable"), root.join("snapshots")] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildError::CacheError(format!(
                    "Failed to create snapshot directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let inner = Inner {
            root: root.to_path_buf(),
            records: RwLock::new(load_index(root)?),
            held: Mutex::new(HashSet::new()),
            save_lock: Mutex::new(()),
            identity_mapping,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn get(&self, id: &str) -> Option<RefRecord> {
        self.inner.records.read().get(id).cloned()
    }

    /// All refs, oldest first.
    pub fn list(&self) -> Vec<RefRecord> {
        let mut refs: Vec<_> = self.inner.records.read().values().cloned().collect();
        refs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        refs
    }

    /// Whether a mutable ref is currently held.
    pub fn is_held(&self, id: &str) -> bool {
        self.inner.held.lock().contains(id)
    }

    /// Total size of committed snapshots.
    pub fn total_size(&self) -> u64 {
        self.inner
            .records
            .read()
            .values()
            .filter(|r| !r.mutable)
            .map(|r| r.size_bytes)
            .sum()
    }

    fn hold(&self, id: &str) -> Box<dyn MutableRef> {
        Box::new(LocalMutableRef {
            id: id.to_string(),
            inner: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        })
    }
}

fn load_index(root: &Path) -> Result<HashMap<String, RefRecord>> {
    let index_path = root.join("index.json");
    if !index_path.exists() {
        return Ok(HashMap::new());
    }

    let data = std::fs::read_to_string(&index_path).map_err(|e| {
        BuildError::CacheError(format!(
            "Failed to read ref index {}: {}",
            index_path.display(),
            e
        ))
    })?;
    let index: RefIndex = serde_json::from_str(&data)
        .map_err(|e| BuildError::CacheError(format!("Failed to parse ref index: {}", e)))?;

    // Only keep refs whose directories still exist
    Ok(index
        .refs
        .into_iter()
        .filter(|r| {
            let sub = if r.mutable { "mutable" } else { "snapshots" };
            root.join(sub).join(&r.id).is_dir()
        })
        .map(|r| (r.id.clone(), r))
        .collect())
}

#[async_trait]
impl CacheAccessor for LocalRefManager {
    async fn new_mutable(&self, opts: NewRefOptions) -> Result<Box<dyn MutableRef>> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.inner.mutable_dir(&id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            BuildError::CacheError(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let record = RefRecord {
            id: id.clone(),
            mutable: true,
            policy: opts.policy,
            description: opts.description,
            record_type: opts.record_type,
            strings: HashMap::new(),
            indexes: HashMap::new(),
            parent: None,
            size_bytes: 0,
            created_at: Utc::now(),
        };
        self.inner.records.write().insert(id.clone(), record);
        self.inner.held.lock().insert(id.clone());
        self.inner.save()?;

        tracing::debug!(id = %id, "Created mutable ref");
        Ok(self.hold(&id))
    }

    async fn get_mutable(&self, id: &str) -> Result<Box<dyn MutableRef>> {
        let ref_error = |kind| BuildError::RefError {
            id: id.to_string(),
            kind,
        };

        match self.inner.records.read().get(id) {
            None => return Err(ref_error(RefErrorKind::NotFound)),
            Some(record) if !record.mutable => return Err(ref_error(RefErrorKind::NotMutable)),
            Some(_) => {}
        }
        if !self.inner.mutable_dir(id).is_dir() {
            return Err(ref_error(RefErrorKind::NotFound));
        }
        if !self.inner.held.lock().insert(id.to_string()) {
            return Err(ref_error(RefErrorKind::Locked));
        }

        Ok(self.hold(id))
    }

    async fn search(&self, index: &str) -> Result<Vec<RefMetadata>> {
        let records = self.inner.records.read();
        let mut found: Vec<_> = records
            .values()
            .filter(|r| r.indexes.values().any(|i| i == index))
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found
            .into_iter()
            .map(|r| RefMetadata {
                id: r.id.clone(),
                strings: r.strings.clone(),
            })
            .collect())
    }
}

struct LocalMutableRef {
    id: String,
    inner: Arc<Inner>,
    released: AtomicBool,
}

impl LocalMutableRef {
    fn ensure_held(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(BuildError::CacheError(format!(
                "mutable ref {} has already been released",
                self.id
            )));
        }
        Ok(())
    }

    fn give_up(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.inner.unhold(&self.id);
        }
    }
}

impl Drop for LocalMutableRef {
    fn drop(&mut self) {
        self.give_up();
    }
}

#[async_trait]
impl MutableRef for LocalMutableRef {
    fn id(&self) -> &str {
        &self.id
    }

    async fn mount(&self) -> Result<Mount> {
        self.ensure_held()?;
        let path = self.inner.mutable_dir(&self.id);
        if !path.is_dir() {
            return Err(BuildError::MountError(format!(
                "snapshot directory {} is missing",
                path.display()
            )));
        }
        Ok(Mount {
            path,
            identity_mapping: self.inner.identity_mapping.clone(),
        })
    }

    async fn unmount(&self) -> Result<()> {
        Ok(())
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.inner
            .records
            .read()
            .get(&self.id)
            .and_then(|r| r.strings.get(key).cloned())
    }

    fn set_string(&self, key: &str, value: &str, index: &str) -> Result<()> {
        self.inner.update(&self.id, |r| {
            r.strings.insert(key.to_string(), value.to_string());
            if index.is_empty() {
                r.indexes.remove(key);
            } else {
                r.indexes.insert(key.to_string(), index.to_string());
            }
        })
    }

    fn clear_string(&self, key: &str) -> Result<()> {
        self.inner.update(&self.id, |r| {
            r.strings.remove(key);
            r.indexes.remove(key);
        })
    }

    fn set_cache_policy_default(&self) -> Result<()> {
        self.inner
            .update(&self.id, |r| r.policy = CachePolicy::Default)
    }

    async fn commit(&self) -> Result<Box<dyn ImmutableRef>> {
        self.ensure_held()?;

        let snapshot_id = uuid::Uuid::new_v4().simple().to_string();
        let src = self.inner.mutable_dir(&self.id);
        let dst = self.inner.snapshot_dir(&snapshot_id);
        copy_dir_recursive(&src, &dst)?;
        let size_bytes = dir_size(&dst)?;

        let (policy, description, record_type) = {
            let records = self.inner.records.read();
            let record = records.get(&self.id).ok_or_else(|| BuildError::RefError {
                id: self.id.clone(),
                kind: RefErrorKind::NotFound,
            })?;
            (
                record.policy,
                record.description.clone(),
                record.record_type.clone(),
            )
        };

        let record = RefRecord {
            id: snapshot_id.clone(),
            mutable: false,
            policy,
            description,
            record_type,
            strings: HashMap::new(),
            indexes: HashMap::new(),
            parent: Some(self.id.clone()),
            size_bytes,
            created_at: Utc::now(),
        };
        self.inner.records.write().insert(snapshot_id.clone(), record);
        self.inner.save()?;
        self.give_up();

        tracing::debug!(mutable = %self.id, snapshot = %snapshot_id, size_bytes, "Committed snapshot");
        Ok(Box::new(LocalImmutableRef {
            id: snapshot_id,
            path: dst,
            size: size_bytes,
        }))
    }

    async fn release(&self) -> Result<()> {
        self.give_up();
        Ok(())
    }
}

#[derive(Debug)]
struct LocalImmutableRef {
    id: String,
    path: PathBuf,
    size: u64,
}

#[async_trait]
impl ImmutableRef for LocalImmutableRef {
    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Recursively copy a directory, keeping symlinks as links.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| {
        BuildError::CacheError(format!(
            "Failed to create directory {}: {}",
            dst.display(),
            e
        ))
    })?;

    let entries = std::fs::read_dir(src).map_err(|e| {
        BuildError::CacheError(format!("Failed to read directory {}: {}", src.display(), e))
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            BuildError::CacheError(format!("Failed to read directory entry: {}", e))
        })?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
            let perms = std::fs::metadata(&src_path)?.permissions();
            std::fs::set_permissions(&dst_path, perms)?;
        } else if file_type.is_symlink() {
            copy_symlink(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path).map_err(|e| {
                BuildError::CacheError(format!(
                    "Failed to copy {} to {}: {}",
                    src_path.display(),
                    dst_path.display(),
                    e
                ))
            })?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(&target, dst).map_err(|e| {
        BuildError::CacheError(format!("Failed to link {}: {}", dst.display(), e))
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Total size of regular files under a directory.
pub(crate) fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                total += dir_size(&entry.path())?;
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}
