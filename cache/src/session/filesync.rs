//! Receiving side of directory synchronization.
//!
//! The peer streams the metadata of every entry in the requested directory;
//! the receiver decides per entry whether it needs the content, reads only
//! those files, writes them under the destination, and finally removes
//! anything in the destination the peer no longer has.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use a3s_build_core::error::{BuildError, Result, SessionErrorKind};
use a3s_build_core::Digest;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::patterns::{clean_path, parents, PatternMatcher};
use super::{Caller, FileKind, FileStat, SyncRequest, FILESYNC_METHOD};
use crate::contenthash::{CacheContext, FileRecord};

/// How the receiver decides a file is unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Differ {
    /// Skip files whose recorded metadata matches what the peer reports.
    #[default]
    Metadata,
    /// Treat every entry as changed.
    None,
}

/// Rewrites an entry's metadata before it is applied. Returning `false`
/// drops the entry.
pub type StatFilter<'a> = &'a (dyn Fn(&mut FileStat) -> bool + Send + Sync);

/// Options for one receive.
pub struct SyncOptions<'a> {
    pub request: SyncRequest,
    /// Directory to write into
    pub dest: &'a Path,
    pub differ: Differ,
    /// In metadata-only mode, paths that still receive content
    pub metadata_exceptions: Option<&'a PatternMatcher>,
    pub filter: Option<StatFilter<'a>>,
}

/// Counters from one receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Content bytes transferred
    pub bytes: u64,
    /// Entries written or rewritten
    pub written: usize,
    /// Entries skipped as unchanged
    pub unchanged: usize,
    /// Stale destination entries removed
    pub removed: usize,
}

/// Synchronize the requested directory from `caller` into `opts.dest`.
///
/// `cc` is read to skip unchanged entries and updated with every entry
/// written. `progress` receives the running byte count, and is called once
/// more with `last = true` when the receive completes.
pub async fn receive(
    caller: &dyn Caller,
    opts: SyncOptions<'_>,
    cc: &mut CacheContext,
    mut progress: impl FnMut(u64, bool),
) -> Result<SyncStats> {
    if !caller.supports(FILESYNC_METHOD) {
        return Err(BuildError::session(
            SessionErrorKind::Unsupported,
            format!("session {} does not serve local sources", caller.session_id()),
        ));
    }

    let request = &opts.request;
    let includes = PatternMatcher::new(&request.include_patterns)?;
    let excludes = PatternMatcher::new(&request.exclude_patterns)?;
    let follows = PatternMatcher::new(&request.follow_paths)?;

    tokio::fs::create_dir_all(opts.dest).await.map_err(|e| {
        BuildError::TransferError(format!("Failed to create {}: {}", opts.dest.display(), e))
    })?;

    let mut entries = caller.walk(request).await?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut dirs: Vec<(PathBuf, FileStat)> = Vec::new();
    let mut stats = SyncStats::default();

    while let Some(entry) = entries.next().await {
        let mut stat = entry?;
        let path = validate_path(&stat.path)?;
        stat.path = path.clone();

        if !selected(&path, stat.kind, &includes, &excludes, &follows) {
            continue;
        }
        if let Some(filter) = opts.filter {
            if !filter(&mut stat) {
                tracing::trace!(path = %path, "Entry dropped by filter");
                continue;
            }
        }

        for parent in parents(&path) {
            seen.insert(parent.to_string());
        }
        seen.insert(path.clone());

        check_parents(opts.dest, &path).await?;
        let target = opts.dest.join(&path);
        let present = tokio::fs::symlink_metadata(&target).await.is_ok();
        let unchanged = opts.differ == Differ::Metadata
            && present
            && cc.get(&path).map_or(false, |r| r.same_metadata(&stat));
        if unchanged {
            stats.unchanged += 1;
            continue;
        }

        let content = match stat.kind {
            FileKind::Dir => {
                write_dir(&target).await?;
                // Applied once the children are written.
                dirs.push((target, stat.clone()));
                None
            }
            FileKind::Symlink => {
                write_symlink(&target, &stat.linkname).await?;
                set_owner(&target, &stat)?;
                None
            }
            FileKind::File => {
                let wants_content = !request.metadata_only
                    || opts.metadata_exceptions.map_or(false, |m| m.matches(&path));
                let digest = if wants_content {
                    let data = caller.read_file(&request.name, &path).await?;
                    if data.len() as u64 != stat.size {
                        return Err(BuildError::TransferError(format!(
                            "{}: expected {} bytes, received {}",
                            path,
                            stat.size,
                            data.len()
                        )));
                    }
                    write_file(&target, &data).await?;
                    stats.bytes += data.len() as u64;
                    progress(stats.bytes, false);
                    Some(Digest::from_bytes(&data))
                } else {
                    touch_file(&target).await?;
                    None
                };
                apply_metadata(&target, &stat).await?;
                digest
            }
        };

        cc.insert(path, FileRecord::new(stat, content.as_ref()));
        stats.written += 1;
    }

    stats.removed = prune(opts.dest, &seen)?;
    cc.retain(|p| seen.contains(p));

    // Deepest first so a read-only parent does not block its children.
    for (dir, stat) in dirs.iter().rev() {
        let mut stat = stat.clone();
        stat.mode |= 0o700;
        apply_metadata(dir, &stat).await?;
    }
    progress(stats.bytes, true);

    tracing::debug!(
        name = %request.name,
        bytes = stats.bytes,
        written = stats.written,
        unchanged = stats.unchanged,
        removed = stats.removed,
        "Received local directory"
    );
    Ok(stats)
}

/// Reject paths that would escape the destination.
fn validate_path(raw: &str) -> Result<String> {
    let path = clean_path(raw);
    if path.is_empty() || path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(BuildError::TransferError(format!("invalid path {:?}", raw)));
    }
    Ok(path.to_string())
}

/// Fail if an existing ancestor of `path` under `dest` is anything but a
/// real directory, so nothing is written through a symlink.
async fn check_parents(dest: &Path, path: &str) -> Result<()> {
    let ancestors: Vec<&str> = parents(path).collect();
    for parent in ancestors.into_iter().rev() {
        let dir = dest.join(parent);
        match tokio::fs::symlink_metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(BuildError::TransferError(format!(
                    "{}: parent {} is not a directory",
                    path, parent
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(BuildError::TransferError(format!(
                    "Failed to stat {}: {}",
                    dir.display(),
                    e
                )))
            }
        }
    }
    Ok(())
}

fn selected(
    path: &str,
    kind: FileKind,
    includes: &PatternMatcher,
    excludes: &PatternMatcher,
    follows: &PatternMatcher,
) -> bool {
    if excludes.matches(path) {
        return false;
    }
    if includes.is_empty() || includes.matches(path) || follows.matches(path) {
        return true;
    }
    // Keep directories that lead to an included path.
    kind == FileKind::Dir && (includes.may_match_below(path) || follows.may_match_below(path))
}

async fn remove_existing(target: &Path) -> Result<()> {
    let Ok(meta) = tokio::fs::symlink_metadata(target).await else {
        return Ok(());
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(target).await
    } else {
        tokio::fs::remove_file(target).await
    };
    result.map_err(|e| {
        BuildError::TransferError(format!("Failed to replace {}: {}", target.display(), e))
    })
}

async fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            BuildError::TransferError(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    Ok(())
}

async fn write_dir(target: &Path) -> Result<()> {
    if let Ok(meta) = tokio::fs::symlink_metadata(target).await {
        if meta.is_dir() {
            return Ok(());
        }
        remove_existing(target).await?;
    }
    tokio::fs::create_dir_all(target).await.map_err(|e| {
        BuildError::TransferError(format!("Failed to create {}: {}", target.display(), e))
    })
}

async fn write_file(target: &Path, data: &[u8]) -> Result<()> {
    ensure_parent(target).await?;
    remove_existing(target).await?;
    tokio::fs::write(target, data).await.map_err(|e| {
        BuildError::TransferError(format!("Failed to write {}: {}", target.display(), e))
    })
}

/// Create an empty file if nothing is there; existing content is kept.
async fn touch_file(target: &Path) -> Result<()> {
    if let Ok(meta) = tokio::fs::symlink_metadata(target).await {
        if meta.is_file() {
            return Ok(());
        }
        remove_existing(target).await?;
    }
    write_file(target, &[]).await
}

#[cfg(unix)]
async fn write_symlink(target: &Path, linkname: &str) -> Result<()> {
    ensure_parent(target).await?;
    remove_existing(target).await?;
    tokio::fs::symlink(linkname, target).await.map_err(|e| {
        BuildError::TransferError(format!("Failed to link {}: {}", target.display(), e))
    })
}

#[cfg(not(unix))]
async fn write_symlink(target: &Path, _linkname: &str) -> Result<()> {
    Err(BuildError::TransferError(format!(
        "Symlinks are not supported on this platform: {}",
        target.display()
    )))
}

/// Apply the entry's mtime, ownership and permissions, in that order;
/// changing the owner may clear setuid bits.
async fn apply_metadata(target: &Path, stat: &FileStat) -> Result<()> {
    set_mtime(target, stat.mod_time)?;
    set_owner(target, stat)?;
    set_mode(target, stat.mode).await
}

#[cfg(unix)]
fn set_mtime(target: &Path, mod_time: i64) -> Result<()> {
    let Ok(nanos) = u64::try_from(mod_time) else {
        return Ok(());
    };
    let time = std::time::UNIX_EPOCH + std::time::Duration::from_nanos(nanos);
    std::fs::File::open(target)
        .and_then(|f| f.set_modified(time))
        .map_err(|e| {
            BuildError::TransferError(format!("Failed to set mtime of {}: {}", target.display(), e))
        })
}

#[cfg(not(unix))]
fn set_mtime(_target: &Path, _mod_time: i64) -> Result<()> {
    Ok(())
}

/// Change the owner without following symlinks. Unprivileged receivers
/// keep their own ownership.
#[cfg(unix)]
fn set_owner(target: &Path, stat: &FileStat) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::symlink_metadata(target)?;
    if meta.uid() == stat.uid && meta.gid() == stat.gid {
        return Ok(());
    }
    match std::os::unix::fs::lchown(target, Some(stat.uid), Some(stat.gid)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::trace!(path = %target.display(), uid = stat.uid, gid = stat.gid, "Ownership not changed");
            Ok(())
        }
        Err(e) => Err(BuildError::TransferError(format!(
            "Failed to chown {}: {}",
            target.display(),
            e
        ))),
    }
}

#[cfg(not(unix))]
fn set_owner(_target: &Path, _stat: &FileStat) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn set_mode(target: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode & 0o7777);
    tokio::fs::set_permissions(target, perms).await.map_err(|e| {
        BuildError::TransferError(format!("Failed to chmod {}: {}", target.display(), e))
    })
}

#[cfg(not(unix))]
async fn set_mode(_target: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Remove everything under `dest` whose relative path is not in `keep`.
fn prune(dest: &Path, keep: &HashSet<String>) -> Result<usize> {
    fn walk(dir: &Path, prefix: &str, keep: &HashSet<String>, removed: &mut usize) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            BuildError::TransferError(format!("Failed to read {}: {}", dir.display(), e))
        })?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let path = entry.path();
            let file_type = entry.file_type()?;

            if !keep.contains(&rel) {
                if file_type.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
                *removed += 1;
            } else if file_type.is_dir() {
                walk(&path, &rel, keep, removed)?;
            }
        }
        Ok(())
    }

    let mut removed = 0;
    walk(dest, "", keep, &mut removed)?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// Serves an in-memory tree and records every file read.
    struct TreePeer {
        entries: Vec<FileStat>,
        contents: BTreeMap<String, Vec<u8>>,
        reads: Mutex<Vec<String>>,
    }

    impl TreePeer {
        fn new() -> Self {
            Self {
                entries: Vec::new(),
                contents: BTreeMap::new(),
                reads: Mutex::new(Vec::new()),
            }
        }

        fn dir(mut self, path: &str) -> Self {
            self.entries.push(FileStat::dir(path));
            self
        }

        fn file(mut self, path: &str, data: &str, mod_time: i64) -> Self {
            self.entries
                .push(FileStat::file(path, data.len() as u64, mod_time));
            self.contents.insert(path.to_string(), data.as_bytes().to_vec());
            self
        }

        fn reads(&self) -> Vec<String> {
            self.reads.lock().clone()
        }
    }

    #[async_trait]
    impl Caller for TreePeer {
        fn session_id(&self) -> &str {
            "peer"
        }

        fn shared_key(&self) -> &str {
            "peer-key"
        }

        fn supports(&self, method: &str) -> bool {
            method == FILESYNC_METHOD
        }

        async fn walk(
            &self,
            _request: &SyncRequest,
        ) -> Result<BoxStream<'static, Result<FileStat>>> {
            let entries: Vec<Result<FileStat>> = self.entries.iter().cloned().map(Ok).collect();
            Ok(Box::pin(futures::stream::iter(entries)))
        }

        async fn read_file(&self, _name: &str, path: &str) -> Result<Bytes> {
            self.reads.lock().push(path.to_string());
            self.contents
                .get(path)
                .map(|d| Bytes::from(d.clone()))
                .ok_or_else(|| BuildError::NotFound(path.to_string()))
        }
    }

    fn options<'a>(dest: &'a Path, request: SyncRequest) -> SyncOptions<'a> {
        SyncOptions {
            request,
            dest,
            differ: Differ::Metadata,
            metadata_exceptions: None,
            filter: None,
        }
    }

    fn request(include: &[&str], exclude: &[&str]) -> SyncRequest {
        SyncRequest {
            name: "context".to_string(),
            include_patterns: include.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: exclude.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_receive_writes_tree() {
        let tmp = TempDir::new().unwrap();
        let peer = TreePeer::new()
            .dir("src")
            .file("src/main.rs", "fn main() {}", 1)
            .file("README.md", "hello", 1);
        let mut cc = CacheContext::default();
        let mut last = None;

        let stats = receive(&peer, options(tmp.path(), request(&[], &[])), &mut cc, |n, done| {
            if done {
                last = Some(n);
            }
        })
        .await
        .unwrap();

        assert_eq!(stats.bytes, 17);
        assert_eq!(stats.written, 3);
        assert_eq!(last, Some(17));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
        assert_eq!(cc.len(), 3);
    }

    #[tokio::test]
    async fn test_unchanged_files_are_not_read_again() {
        let tmp = TempDir::new().unwrap();
        let peer = TreePeer::new().file("a.txt", "aaa", 1).file("b.txt", "bbb", 1);
        let mut cc = CacheContext::default();
        receive(&peer, options(tmp.path(), request(&[], &[])), &mut cc, |_, _| {})
            .await
            .unwrap();

        let peer = TreePeer::new().file("a.txt", "aaa", 1).file("b.txt", "BBBB", 2);
        let stats = receive(&peer, options(tmp.path(), request(&[], &[])), &mut cc, |_, _| {})
            .await
            .unwrap();

        assert_eq!(peer.reads(), vec!["b.txt".to_string()]);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(std::fs::read_to_string(tmp.path().join("b.txt")).unwrap(), "BBBB");
    }

    #[tokio::test]
    async fn test_differ_none_rereads_everything() {
        let tmp = TempDir::new().unwrap();
        let mut cc = CacheContext::default();
        let peer = TreePeer::new().file("a.txt", "aaa", 1);
        receive(&peer, options(tmp.path(), request(&[], &[])), &mut cc, |_, _| {})
            .await
            .unwrap();

        let peer = TreePeer::new().file("a.txt", "aaa", 1);
        let mut opts = options(tmp.path(), request(&[], &[]));
        opts.differ = Differ::None;
        receive(&peer, opts, &mut cc, |_, _| {}).await.unwrap();
        assert_eq!(peer.reads(), vec!["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_entries_are_removed() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("old/dir")).unwrap();
        std::fs::write(tmp.path().join("old/dir/file"), "x").unwrap();
        std::fs::write(tmp.path().join("gone.txt"), "x").unwrap();

        let peer = TreePeer::new().file("kept.txt", "k", 1);
        let mut cc = CacheContext::default();
        let stats = receive(&peer, options(tmp.path(), request(&[], &[])), &mut cc, |_, _| {})
            .await
            .unwrap();

        assert_eq!(stats.removed, 2);
        assert!(!tmp.path().join("old").exists());
        assert!(!tmp.path().join("gone.txt").exists());
        assert!(tmp.path().join("kept.txt").exists());
    }

    #[tokio::test]
    async fn test_include_and_exclude_patterns() {
        let tmp = TempDir::new().unwrap();
        let peer = TreePeer::new()
            .dir("src")
            .file("src/lib.rs", "lib", 1)
            .dir("src/gen")
            .file("src/gen/out.rs", "gen", 1)
            .file("Cargo.toml", "toml", 1);
        let mut cc = CacheContext::default();

        receive(
            &peer,
            options(tmp.path(), request(&["src/**"], &["src/gen"])),
            &mut cc,
            |_, _| {},
        )
        .await
        .unwrap();

        assert!(tmp.path().join("src/lib.rs").exists());
        assert!(!tmp.path().join("src/gen").exists());
        assert!(!tmp.path().join("Cargo.toml").exists());
        assert_eq!(peer.reads(), vec!["src/lib.rs".to_string()]);
    }

    #[tokio::test]
    async fn test_metadata_only_with_exceptions() {
        let tmp = TempDir::new().unwrap();
        let peer = TreePeer::new()
            .dir("pkg")
            .file("pkg/package.json", "{}", 1)
            .file("pkg/index.js", "module.exports = 1", 1);
        let exceptions = PatternMatcher::new(&["pkg/package.json"]).unwrap();
        let mut req = request(&[], &[]);
        req.metadata_only = true;
        let mut opts = options(tmp.path(), req);
        opts.metadata_exceptions = Some(&exceptions);
        let mut cc = CacheContext::default();

        receive(&peer, opts, &mut cc, |_, _| {}).await.unwrap();

        assert_eq!(peer.reads(), vec!["pkg/package.json".to_string()]);
        assert_eq!(std::fs::read_to_string(tmp.path().join("pkg/package.json")).unwrap(), "{}");
        assert_eq!(std::fs::metadata(tmp.path().join("pkg/index.js")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_filter_drops_entries() {
        let tmp = TempDir::new().unwrap();
        let peer = TreePeer::new().file("a", "a", 1).file("b", "b", 1);
        let drop_b = |stat: &mut FileStat| stat.path != "b";
        let mut opts = options(tmp.path(), request(&[], &[]));
        opts.filter = Some(&drop_b);
        let mut cc = CacheContext::default();

        receive(&peer, opts, &mut cc, |_, _| {}).await.unwrap();
        assert!(tmp.path().join("a").exists());
        assert!(!tmp.path().join("b").exists());
        assert!(cc.get("b").is_none());
    }

    #[tokio::test]
    async fn test_short_read_fails() {
        struct Liar(TreePeer);

        #[async_trait]
        impl Caller for Liar {
            fn session_id(&self) -> &str {
                self.0.session_id()
            }
            fn shared_key(&self) -> &str {
                self.0.shared_key()
            }
            fn supports(&self, method: &str) -> bool {
                self.0.supports(method)
            }
            async fn walk(
                &self,
                request: &SyncRequest,
            ) -> Result<BoxStream<'static, Result<FileStat>>> {
                self.0.walk(request).await
            }
            async fn read_file(&self, _name: &str, _path: &str) -> Result<Bytes> {
                Ok(Bytes::from_static(b"x"))
            }
        }

        let tmp = TempDir::new().unwrap();
        let peer = Liar(TreePeer::new().file("a", "abc", 1));
        let mut cc = CacheContext::default();
        let err = receive(&peer, options(tmp.path(), request(&[], &[])), &mut cc, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::TransferError(_)));
    }

    #[tokio::test]
    async fn test_escaping_path_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut peer = TreePeer::new();
        peer.entries.push(FileStat::file("../etc/passwd", 0, 1));
        let mut cc = CacheContext::default();
        let err = receive(&peer, options(tmp.path(), request(&[], &[])), &mut cc, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::TransferError(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_through_symlink_rejected() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();

        let mut peer = TreePeer::new();
        peer.entries
            .push(FileStat::symlink("link", outside.to_string_lossy()));
        let peer = peer.file("link/escaped", "owned", 1);
        let mut cc = CacheContext::default();

        let err = receive(&peer, options(&dest, request(&[], &[])), &mut cc, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::TransferError(_)), "{err}");
        assert!(!outside.join("escaped").exists());
        assert!(peer.reads().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_existing_symlink_parent_rejected() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dest");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, dest.join("sub")).unwrap();

        let peer = TreePeer::new().file("sub/a.txt", "a", 1);
        let mut cc = CacheContext::default();
        let err = receive(&peer, options(&dest, request(&[], &[])), &mut cc, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::TransferError(_)));
        assert!(!outside.join("a.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mtime_applied_to_files_and_dirs() {
        let tmp = TempDir::new().unwrap();
        let file_time = 1_700_000_000 * 1_000_000_000i64;
        let mut dir = FileStat::dir("src");
        dir.mod_time = 1_600_000_000 * 1_000_000_000i64;
        let mut peer = TreePeer::new();
        peer.entries.push(dir);
        let peer = peer.file("src/lib.rs", "lib", file_time);
        let mut cc = CacheContext::default();

        receive(&peer, options(tmp.path(), request(&[], &[])), &mut cc, |_, _| {})
            .await
            .unwrap();

        let secs = |p: &Path| {
            std::fs::metadata(p)
                .unwrap()
                .modified()
                .unwrap()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs()
        };
        assert_eq!(secs(&tmp.path().join("src/lib.rs")), 1_700_000_000);
        assert_eq!(secs(&tmp.path().join("src")), 1_600_000_000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_metadata_only_updates_mode_and_mtime() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let mut stat = FileStat::file("run.sh", 10, 1_650_000_000 * 1_000_000_000i64);
        stat.mode = 0o750;
        let mut peer = TreePeer::new();
        peer.entries.push(stat);
        let mut req = request(&[], &[]);
        req.metadata_only = true;
        let mut cc = CacheContext::default();

        receive(&peer, options(tmp.path(), req), &mut cc, |_, _| {})
            .await
            .unwrap();

        let meta = std::fs::metadata(tmp.path().join("run.sh")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o750);
        assert_eq!(
            meta.modified()
                .unwrap()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs(),
            1_650_000_000
        );
        assert!(peer.reads().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_kept_when_already_matching() {
        use std::os::unix::fs::MetadataExt;

        let tmp = TempDir::new().unwrap();
        let dir_meta = std::fs::metadata(tmp.path()).unwrap();
        let (uid, gid) = (dir_meta.uid(), dir_meta.gid());
        let peer = TreePeer::new().file("a.txt", "a", 1);
        let as_owner = move |stat: &mut FileStat| {
            stat.uid = uid;
            stat.gid = gid;
            true
        };
        let mut opts = options(tmp.path(), request(&[], &[]));
        opts.filter = Some(&as_owner);
        let mut cc = CacheContext::default();

        receive(&peer, opts, &mut cc, |_, _| {}).await.unwrap();

        let meta = std::fs::symlink_metadata(tmp.path().join("a.txt")).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (uid, gid));
        assert_eq!(cc.get("a.txt").unwrap().stat.uid, uid);
    }

    #[test]
    fn test_differ_serde() {
        assert_eq!(serde_json::to_string(&Differ::None).unwrap(), "\"none\"");
        assert_eq!(Differ::default(), Differ::Metadata);
    }
}
