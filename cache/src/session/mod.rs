//! Sessions: logical connections to build clients.
//!
//! The transport behind a session is not implemented here. A session is
//! reached through a [`SessionManager`] and used through a [`Caller`], which
//! negotiates capabilities by method name and serves file walks and reads
//! for the file sync receiver.

pub mod filesync;
pub mod patterns;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use a3s_build_core::error::{BuildError, Result, SessionErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Method name a peer must support to serve directory contents.
pub const FILESYNC_METHOD: &str = "/a3s.filesync.v1.FileSync/DiffCopy";

/// Type of a transferred filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

/// Metadata of one entry as reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Slash-separated path relative to the synced directory
    pub path: String,
    pub kind: FileKind,
    /// Permission bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Modification time in nanoseconds since the epoch
    pub mod_time: i64,
    /// Symlink target, empty for other kinds
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub linkname: String,
}

impl FileStat {
    pub fn file(path: impl Into<String>, size: u64, mod_time: i64) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size,
            mod_time,
            linkname: String::new(),
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Dir,
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            mod_time: 0,
            linkname: String::new(),
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Symlink,
            mode: 0o777,
            uid: 0,
            gid: 0,
            size: 0,
            mod_time: 0,
            linkname: target.into(),
        }
    }
}

/// Directory request sent to the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Name of the directory the client exposes
    pub name: String,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub follow_paths: Vec<String>,
    pub metadata_only: bool,
}

/// A connected session.
#[async_trait]
pub trait Caller: Send + Sync {
    fn session_id(&self) -> &str;

    /// Identity of the client for snapshot deduplication.
    fn shared_key(&self) -> &str;

    /// Whether the peer implements `method`.
    fn supports(&self, method: &str) -> bool;

    /// Walk the requested directory, streaming entry metadata.
    async fn walk(&self, request: &SyncRequest) -> Result<BoxStream<'static, Result<FileStat>>>;

    /// Read the full content of one file in the named directory.
    async fn read_file(&self, name: &str, path: &str) -> Result<Bytes>;
}

/// Looks up connected sessions by id.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Get a session. Unless `no_wait` is set, waits for a session that is
    /// still connecting; callers bound the wait with a timeout.
    async fn get(&self, id: &str, no_wait: bool) -> Result<Arc<dyn Caller>>;
}

/// The sessions a build request may use, in preference order.
#[derive(Debug, Clone, Default)]
pub struct SessionGroup {
    ids: Vec<String>,
}

impl SessionGroup {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).filter(|id: &String| !id.is_empty()).collect(),
        }
    }

    pub fn iter(&self) -> SessionIterator<'_> {
        SessionIterator {
            ids: self.ids.iter(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Iterator over a group's session ids.
pub struct SessionIterator<'a> {
    ids: std::slice::Iter<'a, String>,
}

impl<'a> SessionIterator<'a> {
    /// Next session id, or `None` when the group is exhausted.
    pub fn next_session(&mut self) -> Option<&'a str> {
        self.ids.next().map(String::as_str)
    }
}

/// Get a session, bounding the wait by `timeout`.
pub async fn connect(
    manager: &dyn SessionManager,
    id: &str,
    timeout: Duration,
) -> Result<Arc<dyn Caller>> {
    match tokio::time::timeout(timeout, manager.get(id, false)).await {
        Ok(result) => result,
        Err(_) => Err(BuildError::TimeoutError(format!(
            "Timed out after {:?} waiting for session {}",
            timeout, id
        ))),
    }
}

/// Run `f` against the first session in `group` for which it succeeds.
///
/// Each connect is bounded by `connect_timeout`; `f` itself is only bounded
/// by the caller. Returns the last error when every session fails.
pub async fn any_session<T, F, Fut>(
    manager: &dyn SessionManager,
    group: &SessionGroup,
    connect_timeout: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut(Arc<dyn Caller>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    let mut sessions = group.iter();

    while let Some(id) = sessions.next_session() {
        let caller = match connect(manager, id, connect_timeout).await {
            Ok(caller) => caller,
            Err(e) => {
                tracing::debug!(session = %id, error = %e, "Session unavailable");
                last_err = Some(e);
                continue;
            }
        };

        match f(caller).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::debug!(session = %id, error = %e, "Session attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        BuildError::session(SessionErrorKind::NoSession, "no active sessions")
    }))
}
