//! Local source snapshots against in-process sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use a3s_build_cache::contenthash::ContentHashStore;
use a3s_build_cache::session::{
    Caller, FileStat, SessionGroup, SessionManager, SyncRequest, FILESYNC_METHOD,
};
use a3s_build_cache::snapshot::{
    CacheAccessor, CachePolicy, IdMap, IdentityMapping, LocalRefManager, ReleaseWorker,
};
use a3s_build_cache::source::identifier::ATTR_LOCAL_SESSION_ID;
use a3s_build_cache::source::local::{KEY_SHARED_KEY, SHARED_KEY_INDEX};
use a3s_build_cache::source::{LocalIdentifier, LocalSource, LocalSourceOpt};
use a3s_build_core::error::{BuildError, Result, SessionErrorKind};
use a3s_build_core::{LocalSourceConfig, ProgressEmitter};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::broadcast::error::TryRecvError;

/// A client exposing one directory, with counters and fault switches.
struct FakePeer {
    id: String,
    files: Mutex<BTreeMap<String, (Vec<u8>, i64)>>,
    /// Client-side uid and gid per path, 0 if unset
    owners: Mutex<HashMap<String, u32>>,
    walk_error: Option<SessionErrorKind>,
    serves_files: bool,
    fail_reads: AtomicBool,
    reads: AtomicUsize,
}

impl FakePeer {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            files: Mutex::new(BTreeMap::new()),
            owners: Mutex::new(HashMap::new()),
            walk_error: None,
            serves_files: true,
            fail_reads: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    fn file(self, path: &str, data: &str, mod_time: i64) -> Self {
        self.write(path, data, mod_time);
        self
    }

    fn owned_by(self, path: &str, id: u32) -> Self {
        self.owners.lock().insert(path.to_string(), id);
        self
    }

    fn walk_error(mut self, kind: SessionErrorKind) -> Self {
        self.walk_error = Some(kind);
        self
    }

    fn without_filesync(mut self) -> Self {
        self.serves_files = false;
        self
    }

    fn write(&self, path: &str, data: &str, mod_time: i64) {
        self.files
            .lock()
            .insert(path.to_string(), (data.as_bytes().to_vec(), mod_time));
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Caller for FakePeer {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn shared_key(&self) -> &str {
        "client-1"
    }

    fn supports(&self, method: &str) -> bool {
        self.serves_files && method == FILESYNC_METHOD
    }

    async fn walk(&self, _request: &SyncRequest) -> Result<BoxStream<'static, Result<FileStat>>> {
        if let Some(kind) = self.walk_error {
            return Err(BuildError::session(kind, format!("session {} closed", self.id)));
        }
        let owners = self.owners.lock();
        let entries: Vec<Result<FileStat>> = self
            .files
            .lock()
            .iter()
            .map(|(path, (data, mod_time))| {
                let mut stat = FileStat::file(path.clone(), data.len() as u64, *mod_time);
                let id = owners.get(path).copied().unwrap_or(0);
                stat.uid = id;
                stat.gid = id;
                Ok(stat)
            })
            .collect();
        Ok(Box::pin(futures::stream::iter(entries)))
    }

    async fn read_file(&self, _name: &str, path: &str) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BuildError::TransferError("connection reset".to_string()));
        }
        self.files
            .lock()
            .get(path)
            .map(|(data, _)| Bytes::from(data.clone()))
            .ok_or_else(|| BuildError::NotFound(path.to_string()))
    }
}

struct FakeSessions {
    peers: HashMap<String, Arc<FakePeer>>,
}

#[async_trait]
impl SessionManager for FakeSessions {
    async fn get(&self, id: &str, _no_wait: bool) -> Result<Arc<dyn Caller>> {
        match self.peers.get(id) {
            Some(peer) => Ok(peer.clone()),
            None => Err(BuildError::session(
                SessionErrorKind::NotFound,
                format!("no session {}", id),
            )),
        }
    }
}

struct Harness {
    _tmp: TempDir,
    refs: LocalRefManager,
    hashes: Arc<ContentHashStore>,
    releaser: ReleaseWorker,
    progress: ProgressEmitter,
    source: LocalSource,
}

impl Harness {
    fn new(peers: &[&Arc<FakePeer>]) -> Self {
        Self::open(peers, None)
    }

    fn open(peers: &[&Arc<FakePeer>], identity_mapping: Option<IdentityMapping>) -> Self {
        let tmp = TempDir::new().unwrap();
        let refs = LocalRefManager::open(tmp.path(), identity_mapping).unwrap();
        let hashes = Arc::new(ContentHashStore::in_memory());
        let releaser = ReleaseWorker::spawn();
        let progress = ProgressEmitter::default();
        let sessions = FakeSessions {
            peers: peers
                .iter()
                .map(|p| (p.id.clone(), Arc::clone(p)))
                .collect(),
        };

        let source = LocalSource::new(LocalSourceOpt {
            cache: Arc::new(refs.clone()),
            sessions: Arc::new(sessions),
            hashes: hashes.clone(),
            releaser: releaser.clone(),
            progress: progress.clone(),
            config: LocalSourceConfig::default(),
        });

        Self {
            _tmp: tmp,
            refs,
            hashes,
            releaser,
            progress,
            source,
        }
    }

    /// The mutable ref a snapshot was committed from.
    fn mutable_of(&self, snapshot_id: &str) -> String {
        self.refs.get(snapshot_id).unwrap().parent.unwrap()
    }
}

fn context_with_sources() -> LocalIdentifier {
    let mut id = LocalIdentifier::new("ctx").unwrap();
    id.include_patterns = vec!["src/**".to_string()];
    id
}

#[tokio::test]
async fn test_resync_reuses_mutable_ref() {
    let peer = Arc::new(
        FakePeer::new("s1")
            .file("src/main.rs", "fn main() {}", 1)
            .file("README.md", "hello", 1),
    );
    let h = Harness::new(&[&peer]);
    let handler = h.source.resolve(context_with_sources());
    let group = SessionGroup::new(["s1"]);

    let first = handler.snapshot(&group).await.unwrap();
    assert!(first.path().join("src/main.rs").exists());
    assert!(!first.path().join("README.md").exists());

    let second = handler.snapshot(&group).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(h.mutable_of(first.id()), h.mutable_of(second.id()));

    // Unchanged files are not transferred again.
    assert_eq!(peer.reads(), 1);

    let mutable = h.refs.get(&h.mutable_of(first.id())).unwrap();
    assert_eq!(mutable.policy, CachePolicy::Retain);
    assert_eq!(mutable.description, "local source for ctx");
    assert_eq!(
        mutable.strings.get(KEY_SHARED_KEY).map(String::as_str),
        Some("ctx::client-1")
    );
}

#[tokio::test]
async fn test_changed_file_is_transferred_into_same_ref() {
    let peer = Arc::new(FakePeer::new("s1").file("src/lib.rs", "v1", 1));
    let h = Harness::new(&[&peer]);
    let handler = h.source.resolve(context_with_sources());
    let group = SessionGroup::new(["s1"]);

    let first = handler.snapshot(&group).await.unwrap();
    peer.write("src/lib.rs", "v2!", 2);
    let second = handler.snapshot(&group).await.unwrap();

    assert_eq!(h.mutable_of(first.id()), h.mutable_of(second.id()));
    assert_eq!(
        std::fs::read_to_string(second.path().join("src/lib.rs")).unwrap(),
        "v2!"
    );
    assert_eq!(
        std::fs::read_to_string(first.path().join("src/lib.rs")).unwrap(),
        "v1"
    );
    assert_eq!(peer.reads(), 2);
}

#[tokio::test]
async fn test_failed_transfer_rolls_back_ref() {
    let peer = Arc::new(FakePeer::new("s1").file("src/main.rs", "fn main() {}", 1));
    let h = Harness::new(&[&peer]);
    let handler = h.source.resolve(context_with_sources());
    let group = SessionGroup::new(["s1"]);

    let first = handler.snapshot(&group).await.unwrap();
    let mutable_id = h.mutable_of(first.id());

    peer.write("src/main.rs", "fn main() { todo!() }", 2);
    peer.fail_reads.store(true, Ordering::SeqCst);
    let err = handler.snapshot(&group).await.unwrap_err();
    assert!(matches!(err, BuildError::TransferError(_)), "{err}");

    h.releaser.flush().await;

    let record = h.refs.get(&mutable_id).unwrap();
    assert_eq!(record.policy, CachePolicy::Default);
    assert!(!record.strings.contains_key(KEY_SHARED_KEY));
    assert!(!h.refs.is_held(&mutable_id));
    assert!(h.hashes.get(&mutable_id).unwrap().is_empty());

    let index = format!("{}ctx::client-1", SHARED_KEY_INDEX);
    assert!(h.refs.search(&index).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_first_sync_leaves_no_shared_key() {
    let peer = Arc::new(FakePeer::new("s1").file("src/main.rs", "fn main() {}", 1));
    peer.fail_reads.store(true, Ordering::SeqCst);
    let h = Harness::new(&[&peer]);
    let handler = h.source.resolve(context_with_sources());

    assert!(handler.snapshot(&SessionGroup::new(["s1"])).await.is_err());
    h.releaser.flush().await;

    let records = h.refs.list();
    assert_eq!(records.len(), 1);
    assert!(records[0].mutable);
    assert_eq!(records[0].policy, CachePolicy::Default);
    assert!(records[0].indexes.is_empty());
    assert!(!h.refs.is_held(&records[0].id));
}

#[tokio::test]
async fn test_cache_key_requires_session() {
    let h = Harness::new(&[]);
    let handler = h.source.resolve(LocalIdentifier::new("ctx").unwrap());

    let err = handler.cache_key(&SessionGroup::default(), 0).unwrap_err();
    assert_eq!(err.session_kind(), Some(SessionErrorKind::NoSession));

    let key = handler.cache_key(&SessionGroup::new(["s1"]), 0).unwrap();
    assert!(key.key.starts_with("session:ctx:sha256:"));
    assert!(key.exact);

    let other = handler.cache_key(&SessionGroup::new(["s2"]), 0).unwrap();
    assert_ne!(key.digest, other.digest);
}

#[tokio::test]
async fn test_cache_key_prefers_named_session() {
    let h = Harness::new(&[]);
    let attrs = HashMap::from([(ATTR_LOCAL_SESSION_ID.to_string(), "s9".to_string())]);
    let handler = h.source.resolve(h.source.identifier("ctx", &attrs).unwrap());

    let a = handler.cache_key(&SessionGroup::new(["s1"]), 0).unwrap();
    let b = handler.cache_key(&SessionGroup::default(), 0).unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_missing_session_falls_back_to_group() {
    let s2 = Arc::new(FakePeer::new("s2").file("Dockerfile", "FROM scratch", 1));
    let h = Harness::new(&[&s2]);
    let attrs = HashMap::from([(ATTR_LOCAL_SESSION_ID.to_string(), "gone".to_string())]);
    let handler = h.source.resolve(h.source.identifier("ctx", &attrs).unwrap());

    let snapshot = handler
        .snapshot(&SessionGroup::new(["gone", "s2"]))
        .await
        .unwrap();
    assert!(snapshot.path().join("Dockerfile").exists());
    assert_eq!(s2.reads(), 1);
}

#[tokio::test]
async fn test_invalidated_session_falls_back_to_group() {
    let s1 = Arc::new(
        FakePeer::new("s1")
            .file("Dockerfile", "FROM scratch", 1)
            .walk_error(SessionErrorKind::Invalid),
    );
    let s2 = Arc::new(FakePeer::new("s2").file("Dockerfile", "FROM alpine", 1));
    let h = Harness::new(&[&s1, &s2]);
    let attrs = HashMap::from([(ATTR_LOCAL_SESSION_ID.to_string(), "s1".to_string())]);
    let handler = h.source.resolve(h.source.identifier("ctx", &attrs).unwrap());

    let snapshot = handler
        .snapshot(&SessionGroup::new(["s1", "s2"]))
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(snapshot.path().join("Dockerfile")).unwrap(),
        "FROM alpine"
    );
}

#[tokio::test]
async fn test_unsupported_session_does_not_fall_back() {
    let s1 = Arc::new(FakePeer::new("s1").without_filesync());
    let s2 = Arc::new(FakePeer::new("s2").file("Dockerfile", "FROM scratch", 1));
    let h = Harness::new(&[&s1, &s2]);
    let attrs = HashMap::from([(ATTR_LOCAL_SESSION_ID.to_string(), "s1".to_string())]);
    let handler = h.source.resolve(h.source.identifier("ctx", &attrs).unwrap());

    let err = handler
        .snapshot(&SessionGroup::new(["s1", "s2"]))
        .await
        .unwrap_err();
    assert_eq!(err.session_kind(), Some(SessionErrorKind::Unsupported));
    assert_eq!(s2.reads(), 0);
}

#[tokio::test]
async fn test_transfer_reports_completion() {
    let peer = Arc::new(FakePeer::new("s1").file("src/main.rs", "fn main() {}", 1));
    let h = Harness::new(&[&peer]);
    let mut rx = h.progress.subscribe();
    let handler = h.source.resolve(context_with_sources());

    handler.snapshot(&SessionGroup::new(["s1"])).await.unwrap();

    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(status) => events.push(status),
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }

    let last = events.last().unwrap();
    assert_eq!(last.id, "transferring ctx:");
    assert_eq!(last.action, "transferring");
    assert_eq!(last.current, 12);
    assert!(last.is_completed());
    assert!(events[..events.len() - 1].iter().all(|e| !e.is_completed()));
}

#[tokio::test]
async fn test_identity_mapping_remaps_and_drops_entries() {
    let peer = Arc::new(
        FakePeer::new("s1")
            .file("src/mapped.rs", "mapped", 1)
            .owned_by("src/mapped.rs", 1000)
            .file("src/stray.rs", "stray", 1)
            .owned_by("src/stray.rs", 70_000),
    );
    let range = |host_id| {
        vec![IdMap {
            container_id: 0,
            host_id,
            size: 65_536,
        }]
    };
    let mapping = IdentityMapping::new(range(100_000), range(100_000));
    let h = Harness::open(&[&peer], Some(mapping));
    let handler = h.source.resolve(context_with_sources());

    let snap = handler.snapshot(&SessionGroup::new(["s1"])).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(snap.path().join("src/mapped.rs")).unwrap(),
        "mapped"
    );
    assert!(!snap.path().join("src/stray.rs").exists());
    assert_eq!(peer.reads(), 1);

    let cc = h.hashes.get(&h.mutable_of(snap.id())).unwrap();
    let record = cc.get("src/mapped.rs").unwrap();
    assert_eq!((record.stat.uid, record.stat.gid), (101_000, 101_000));
    assert!(cc.get("src/stray.rs").is_none());

    // Ownership can only be changed with privilege.
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let privileged = std::fs::metadata(h.refs.root()).unwrap().uid() == 0;
        if privileged {
            let written = h
                .refs
                .root()
                .join("mutable")
                .join(h.mutable_of(snap.id()))
                .join("src/mapped.rs");
            assert_eq!(std::fs::symlink_metadata(written).unwrap().uid(), 101_000);
        }
    }
}
