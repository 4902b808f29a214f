//! Local directory source.
//!
//! Pulls a directory from a build client over a session into a mutable
//! snapshot, reusing the snapshot left by an earlier sync of the same
//! directory so that only changed files are transferred.

use std::collections::HashMap;
use std::sync::Arc;

use a3s_build_core::error::{BuildError, Result, SessionErrorKind};
use a3s_build_core::{Digest, LocalSourceConfig, ProgressEmitter};
use serde::Serialize;

use super::identifier::LocalIdentifier;
use super::progress::ProgressHandler;
use super::{CacheKeyResult, LOCAL_SCHEME};
use crate::contenthash::{CacheContext, ContentHashStore};
use crate::session::filesync::{self, StatFilter, SyncOptions};
use crate::session::patterns::PatternMatcher;
use crate::session::{self, Caller, FileStat, SessionGroup, SessionManager, SyncRequest};
use crate::snapshot::{
    CacheAccessor, CachePolicy, ImmutableRef, Mount, MutableRef, NewRefOptions, ReleaseWorker,
    RECORD_TYPE_LOCAL_SOURCE,
};

/// Metadata key holding the shared key a mutable ref was synced under.
pub const KEY_SHARED_KEY: &str = "local.sharedKey";

/// Index prefix for shared-key searches.
pub const SHARED_KEY_INDEX: &str = "local.sharedKey:";

/// Session failures after which a sync on an explicitly named session is
/// retried on any session of the group.
pub const SESSION_FALLBACK_ERRORS: &[SessionErrorKind] =
    &[SessionErrorKind::NotFound, SessionErrorKind::Invalid];

fn falls_back(err: &BuildError) -> bool {
    err.session_kind()
        .map_or(false, |kind| SESSION_FALLBACK_ERRORS.contains(&kind))
}

fn shared_key_index(shared_key: &str) -> String {
    format!("{}{}", SHARED_KEY_INDEX, shared_key)
}

/// Collaborators of the local source.
pub struct LocalSourceOpt {
    pub cache: Arc<dyn CacheAccessor>,
    pub sessions: Arc<dyn SessionManager>,
    pub hashes: Arc<ContentHashStore>,
    pub releaser: ReleaseWorker,
    pub progress: ProgressEmitter,
    pub config: LocalSourceConfig,
}

/// Resolves `local://` references.
#[derive(Clone)]
pub struct LocalSource {
    cache: Arc<dyn CacheAccessor>,
    sessions: Arc<dyn SessionManager>,
    hashes: Arc<ContentHashStore>,
    releaser: ReleaseWorker,
    progress: ProgressEmitter,
    config: LocalSourceConfig,
}

impl LocalSource {
    pub fn new(opt: LocalSourceOpt) -> Self {
        Self {
            cache: opt.cache,
            sessions: opt.sessions,
            hashes: opt.hashes,
            releaser: opt.releaser,
            progress: opt.progress,
            config: opt.config,
        }
    }

    pub fn schemes(&self) -> &'static [&'static str] {
        &[LOCAL_SCHEME]
    }

    /// Parse a reference and its attributes.
    pub fn identifier(
        &self,
        reference: &str,
        attrs: &HashMap<String, String>,
    ) -> Result<LocalIdentifier> {
        LocalIdentifier::from_attrs(reference, attrs)
    }

    pub fn resolve(&self, src: LocalIdentifier) -> LocalSourceHandler {
        LocalSourceHandler {
            src,
            source: self.clone(),
        }
    }
}

/// Canonical cache key material. Field names are part of the key.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    #[serde(rename = "SessionID")]
    session_id: &'a str,
    #[serde(rename = "IncludePatterns")]
    include_patterns: &'a [String],
    #[serde(rename = "ExcludePatterns")]
    exclude_patterns: &'a [String],
    #[serde(rename = "FollowPaths")]
    follow_paths: &'a [String],
    #[serde(rename = "MetadataTransfer", skip_serializing_if = "std::ops::Not::not")]
    metadata_transfer: bool,
    #[serde(rename = "MetadataExceptions", skip_serializing_if = "<[String]>::is_empty")]
    metadata_exceptions: &'a [String],
}

/// A resolved local directory.
pub struct LocalSourceHandler {
    src: LocalIdentifier,
    source: LocalSource,
}

impl LocalSourceHandler {
    pub fn identifier(&self) -> &LocalIdentifier {
        &self.src
    }

    /// Compute the cache key. Binds the identifier's session, or the first
    /// session of `group` when it names none.
    pub fn cache_key(&self, group: &SessionGroup, _index: usize) -> Result<CacheKeyResult> {
        let session_id = if self.src.session_id.is_empty() {
            group.iter().next_session().ok_or_else(|| {
                BuildError::session(
                    SessionErrorKind::NoSession,
                    "could not access local files without session",
                )
            })?
        } else {
            self.src.session_id.as_str()
        };

        let material = KeyMaterial {
            session_id,
            include_patterns: &self.src.include_patterns,
            exclude_patterns: &self.src.exclude_patterns,
            follow_paths: &self.src.follow_paths,
            metadata_transfer: self.src.metadata_only,
            metadata_exceptions: &self.src.metadata_exceptions,
        };
        let digest = Digest::from_bytes(&serde_json::to_vec(&material)?);

        Ok(CacheKeyResult {
            key: format!("session:{}:{}", self.src.name, digest),
            digest,
            opts: HashMap::new(),
            exact: true,
        })
    }

    /// Sync the directory and commit it as an immutable snapshot.
    pub async fn snapshot(&self, group: &SessionGroup) -> Result<Box<dyn ImmutableRef>> {
        if self.src.session_id.is_empty() {
            return self.snapshot_with_any_session(group).await;
        }

        let timeout = self.source.config.session_timeout();
        let caller =
            match session::connect(self.source.sessions.as_ref(), &self.src.session_id, timeout)
                .await
            {
                Ok(caller) => caller,
                Err(e) => {
                    tracing::debug!(
                        session = %self.src.session_id,
                        error = %e,
                        "Session unavailable, trying any session"
                    );
                    return self.snapshot_with_any_session(group).await;
                }
            };

        match self.snapshot_with_caller(caller.as_ref()).await {
            Err(e) if falls_back(&e) => {
                tracing::debug!(
                    session = %self.src.session_id,
                    error = %e,
                    "Session no longer valid, trying any session"
                );
                self.snapshot_with_any_session(group).await
            }
            result => result,
        }
    }

    async fn snapshot_with_any_session(
        &self,
        group: &SessionGroup,
    ) -> Result<Box<dyn ImmutableRef>> {
        session::any_session(
            self.source.sessions.as_ref(),
            group,
            self.source.config.session_timeout(),
            |caller| async move { self.snapshot_with_caller(caller.as_ref()).await },
        )
        .await
    }

    fn shared_key(&self, caller_key: &str) -> String {
        let suffix = if self.src.metadata_only { ":metadata" } else { "" };
        format!(
            "{}:{}:{}{}",
            self.src.name, self.src.shared_key_hint, caller_key, suffix
        )
    }

    async fn snapshot_with_caller(&self, caller: &dyn Caller) -> Result<Box<dyn ImmutableRef>> {
        let shared_key = self.shared_key(caller.shared_key());
        let mutable: Arc<dyn MutableRef> = Arc::from(self.acquire_mutable(&shared_key).await?);

        let rollback = Rollback {
            mutable: Arc::clone(&mutable),
            hashes: &self.source.hashes,
            releaser: &self.source.releaser,
            armed: true,
        };
        let snapshot = self.populate(mutable.as_ref(), caller, &shared_key).await?;
        rollback.disarm();
        Ok(snapshot)
    }

    /// The first reusable mutable ref synced under `shared_key`, or a new one.
    async fn acquire_mutable(&self, shared_key: &str) -> Result<Box<dyn MutableRef>> {
        let candidates = self.source.cache.search(&shared_key_index(shared_key)).await?;
        for candidate in candidates {
            match self.source.cache.get_mutable(&candidate.id).await {
                Ok(mutable) => {
                    tracing::debug!(id = %mutable.id(), "Reusing ref for local source");
                    return Ok(mutable);
                }
                Err(e) => {
                    tracing::debug!(id = %candidate.id, error = %e, "Not reusing ref for local source");
                }
            }
        }

        let mutable = self
            .source
            .cache
            .new_mutable(NewRefOptions {
                policy: CachePolicy::Retain,
                description: format!("local source for {}", self.src.name),
                record_type: RECORD_TYPE_LOCAL_SOURCE.to_string(),
            })
            .await?;
        tracing::debug!(id = %mutable.id(), "New ref for local source");
        Ok(mutable)
    }

    async fn populate(
        &self,
        mutable: &dyn MutableRef,
        caller: &dyn Caller,
        shared_key: &str,
    ) -> Result<Box<dyn ImmutableRef>> {
        let mount = mutable.mount().await?;

        let cc = match self.transfer(mutable, &mount, caller).await {
            Ok(cc) => cc,
            Err(e) => {
                if let Err(unmount_err) = mutable.unmount().await {
                    tracing::warn!(id = %mutable.id(), error = %unmount_err, "Failed to unmount after transfer error");
                }
                return Err(e);
            }
        };
        mutable.unmount().await?;

        self.source.hashes.set(mutable.id(), cc)?;

        if mutable.get_string(KEY_SHARED_KEY).as_deref() != Some(shared_key) {
            mutable.set_string(KEY_SHARED_KEY, shared_key, &shared_key_index(shared_key))?;
            tracing::debug!(id = %mutable.id(), shared_key = %shared_key, "Saved ref under shared key");
        }

        mutable.commit().await
    }

    async fn transfer(
        &self,
        mutable: &dyn MutableRef,
        mount: &Mount,
        caller: &dyn Caller,
    ) -> Result<CacheContext> {
        let mut cc = self.source.hashes.get(mutable.id())?;

        let exceptions = if self.src.metadata_only && !self.src.metadata_exceptions.is_empty() {
            Some(PatternMatcher::new(&self.src.metadata_exceptions)?)
        } else {
            None
        };

        let remap = |stat: &mut FileStat| -> bool {
            let Some(idmap) = &mount.identity_mapping else {
                return true;
            };
            match idmap.to_host(stat.uid, stat.gid) {
                Ok((uid, gid)) => {
                    stat.uid = uid;
                    stat.gid = gid;
                    true
                }
                Err(_) => false,
            }
        };
        let filter: Option<StatFilter<'_>> = match mount.identity_mapping {
            Some(_) => Some(&remap),
            None => None,
        };

        let mut progress = ProgressHandler::new(
            self.source.progress.clone(),
            format!("transferring {}:", self.src.name),
            self.source.config.progress_interval(),
        );

        let opts = SyncOptions {
            request: SyncRequest {
                name: self.src.name.clone(),
                include_patterns: self.src.include_patterns.clone(),
                exclude_patterns: self.src.exclude_patterns.clone(),
                follow_paths: self.src.follow_paths.clone(),
                metadata_only: self.src.metadata_only,
            },
            dest: &mount.path,
            differ: self.src.differ,
            metadata_exceptions: exceptions.as_ref(),
            filter,
        };
        filesync::receive(caller, opts, &mut cc, |bytes, last| {
            progress.update(bytes, last)
        })
        .await?;

        Ok(cc)
    }
}

/// Undoes a failed sync when dropped while armed.
///
/// The ref's checksums are undefined after a partial transfer, so it loses
/// its retain policy, shared key and cache context before it is released.
struct Rollback<'a> {
    mutable: Arc<dyn MutableRef>,
    hashes: &'a ContentHashStore,
    releaser: &'a ReleaseWorker,
    armed: bool,
}

impl Rollback<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.mutable.id().to_string();

        if let Err(e) = self.mutable.set_cache_policy_default() {
            tracing::error!(id = %id, error = %e, "Failed to reset mutable cache policy");
        }
        if self.mutable.get_string(KEY_SHARED_KEY).is_some() {
            if let Err(e) = self.mutable.clear_string(KEY_SHARED_KEY) {
                tracing::error!(id = %id, error = %e, "Failed to clear shared key");
            }
        }
        self.hashes.clear(&id);
        self.releaser.release(Arc::clone(&self.mutable));
        tracing::debug!(id = %id, "Rolled back local source ref");
    }
}
