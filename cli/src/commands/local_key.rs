//! `a3s-build local-key` command.
//!
//! Computes the cache key a local directory source would be stored under,
//! without connecting to any session.

use std::collections::HashMap;
use std::sync::Arc;

use a3s_build_cache::contenthash::ContentHashStore;
use a3s_build_cache::session::{Caller, SessionGroup, SessionManager};
use a3s_build_cache::snapshot::{LocalRefManager, ReleaseWorker};
use a3s_build_cache::source::identifier::{
    ATTR_EXCLUDE_PATTERNS, ATTR_FOLLOW_PATHS, ATTR_INCLUDE_PATTERNS, ATTR_LOCAL_SESSION_ID,
    ATTR_METADATA_TRANSFER, ATTR_METADATA_TRANSFER_EXCLUDE, ATTR_SHARED_KEY_HINT,
};
use a3s_build_cache::source::{LocalSource, LocalSourceOpt};
use a3s_build_core::error::{BuildError, Result, SessionErrorKind};
use a3s_build_core::{CacheConfig, ProgressEmitter};
use async_trait::async_trait;
use clap::Args;

#[derive(Args)]
pub struct LocalKeyArgs {
    /// Directory name exposed by the client
    pub name: String,

    /// Session id, optionally prefixed as `<prefix>:<id>`
    #[arg(long)]
    pub session: Option<String>,

    /// Include pattern (repeatable)
    #[arg(long)]
    pub include: Vec<String>,

    /// Exclude pattern (repeatable)
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Follow path (repeatable)
    #[arg(long)]
    pub follow: Vec<String>,

    /// Shared key hint
    #[arg(long)]
    pub shared_key_hint: Option<String>,

    /// Transfer metadata only
    #[arg(long)]
    pub metadata_only: bool,

    /// Paths transferred in full despite --metadata-only (repeatable)
    #[arg(long)]
    pub metadata_exception: Vec<String>,

    /// Session ids of the request, used when --session is not given
    #[arg(long = "group")]
    pub group: Vec<String>,
}

/// Session manager for key computation; no session is ever connected.
struct Offline;

#[async_trait]
impl SessionManager for Offline {
    async fn get(&self, id: &str, _no_wait: bool) -> Result<Arc<dyn Caller>> {
        Err(BuildError::session(
            SessionErrorKind::NotFound,
            format!("session {} is not connected", id),
        ))
    }
}

fn attrs(args: &LocalKeyArgs) -> serde_json::Result<HashMap<String, String>> {
    let mut attrs = HashMap::new();
    if let Some(session) = &args.session {
        attrs.insert(ATTR_LOCAL_SESSION_ID.to_string(), session.clone());
    }
    for (key, list) in [
        (ATTR_INCLUDE_PATTERNS, &args.include),
        (ATTR_EXCLUDE_PATTERNS, &args.exclude),
        (ATTR_FOLLOW_PATHS, &args.follow),
        (ATTR_METADATA_TRANSFER_EXCLUDE, &args.metadata_exception),
    ] {
        if !list.is_empty() {
            attrs.insert(key.to_string(), serde_json::to_string(list)?);
        }
    }
    if let Some(hint) = &args.shared_key_hint {
        attrs.insert(ATTR_SHARED_KEY_HINT.to_string(), hint.clone());
    }
    if args.metadata_only {
        attrs.insert(ATTR_METADATA_TRANSFER.to_string(), "true".to_string());
    }
    Ok(attrs)
}

pub async fn execute(args: LocalKeyArgs, config: &CacheConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let refs = LocalRefManager::new(&config.snapshots_dir())?;
    let source = LocalSource::new(LocalSourceOpt {
        cache: Arc::new(refs),
        sessions: Arc::new(Offline),
        hashes: Arc::new(ContentHashStore::in_memory()),
        releaser: ReleaseWorker::spawn(),
        progress: ProgressEmitter::default(),
        config: config.local.clone(),
    });

    let id = source.identifier(&args.name, &attrs(&args)?)?;
    let handler = source.resolve(id);
    let key = handler.cache_key(&SessionGroup::new(args.group.iter().cloned()), 0)?;

    println!("Key: {}", key.key);
    println!("Digest: {}", key.digest);
    Ok(())
}
