//! Leases over stored content.
//!
//! A lease keeps the content it references from being collected until it
//! expires or is deleted. Temporary leases taken while resolving images are
//! not deleted when resolution returns; their release is queued on a
//! [`LeaseReleaseQueue`] that the owner drains at a time of its choosing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::Digest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A retention guarantee over referenced content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Creates and deletes leases.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Create a lease expiring after `ttl`.
    async fn create(&self, ttl: Duration) -> Result<Lease>;

    /// Add a blob to the content a lease protects.
    async fn add_resource(&self, lease: &Lease, digest: &Digest) -> Result<()>;

    async fn delete(&self, lease: &Lease) -> Result<()>;
}

struct LeaseEntry {
    lease: Lease,
    resources: BTreeSet<Digest>,
}

/// In-process lease manager.
#[derive(Default)]
pub struct LocalLeaseManager {
    leases: DashMap<String, LeaseEntry>,
}

impl LocalLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Lease> {
        self.leases.get(id).map(|e| e.lease.clone())
    }

    /// Number of leases, expired or not.
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Digests protected by a lease.
    pub fn resources(&self, id: &str) -> Vec<Digest> {
        self.leases
            .get(id)
            .map(|e| e.resources.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether an unexpired lease protects `digest`.
    pub fn is_protected(&self, digest: &Digest) -> bool {
        self.leases
            .iter()
            .any(|e| !e.lease.is_expired() && e.resources.contains(digest))
    }

    /// Drop expired leases, returning how many were removed.
    pub fn expire(&self) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, e| !e.lease.is_expired());
        before - self.leases.len()
    }
}

#[async_trait]
impl LeaseManager for LocalLeaseManager {
    async fn create(&self, ttl: Duration) -> Result<Lease> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| BuildError::LeaseError(format!("Invalid lease ttl: {}", e)))?;
        let now = Utc::now();
        let lease = Lease {
            id: format!("temp-{}", uuid::Uuid::new_v4().simple()),
            created_at: now,
            expires_at: now + ttl,
        };
        self.leases.insert(
            lease.id.clone(),
            LeaseEntry {
                lease: lease.clone(),
                resources: BTreeSet::new(),
            },
        );
        tracing::debug!(lease = %lease.id, expires_at = %lease.expires_at, "Created lease");
        Ok(lease)
    }

    async fn add_resource(&self, lease: &Lease, digest: &Digest) -> Result<()> {
        let mut entry = self
            .leases
            .get_mut(&lease.id)
            .ok_or_else(|| BuildError::LeaseError(format!("lease {} not found", lease.id)))?;
        entry.resources.insert(digest.clone());
        Ok(())
    }

    async fn delete(&self, lease: &Lease) -> Result<()> {
        self.leases
            .remove(&lease.id)
            .map(|_| ())
            .ok_or_else(|| BuildError::LeaseError(format!("lease {} not found", lease.id)))
    }
}

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct PendingRelease {
    lease_id: String,
    release: ReleaseFn,
}

/// Deferred lease releases, drained by the owner.
#[derive(Default)]
pub struct LeaseReleaseQueue {
    pending: Mutex<Vec<PendingRelease>>,
}

impl LeaseReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue deletion of `lease` through `manager`.
    pub fn push(&self, manager: Arc<dyn LeaseManager>, lease: Lease) {
        let lease_id = lease.id.clone();
        let release: ReleaseFn =
            Box::new(move || Box::pin(async move { manager.delete(&lease).await }));
        self.pending.lock().push(PendingRelease { lease_id, release });
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Run every queued release. Failures are logged and counted, never
    /// retried. Returns the number of failures.
    pub async fn flush(&self) -> usize {
        let drained = std::mem::take(&mut *self.pending.lock());
        let mut failures = 0;
        for pending in drained {
            if let Err(e) = (pending.release)().await {
                tracing::warn!(lease = %pending.lease_id, error = %e, "Failed to release lease");
                failures += 1;
            }
        }
        failures
    }
}
