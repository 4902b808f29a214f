//! Build graph vertices and their recorded results.

use std::collections::HashMap;

use a3s_build_core::Digest;

use super::buildinfo::CacheBuildInfos;

/// A result recorded for a vertex once its operation has run.
#[derive(Debug, Clone, Default)]
pub struct CacheResult {
    /// Cache record id
    pub id: String,
    /// Build info attached to this result, if any
    pub build_infos: Option<CacheBuildInfos>,
}

/// A vertex of the build graph.
#[derive(Debug, Clone)]
pub struct State {
    /// Digest of the operation and its ordered inputs
    pub digest: Digest,
    /// Digests of input vertices, in operation order
    pub inputs: Vec<Digest>,
    /// Display name
    pub name: String,
    /// Recorded error, empty when the vertex succeeded or has not run
    pub error: String,
    /// Results produced by this vertex's operation
    pub cache_results: Vec<CacheResult>,
}

impl State {
    /// Create a vertex whose digest is derived from `op` and `inputs`.
    pub fn new(name: impl Into<String>, op: &[u8], inputs: Vec<Digest>) -> Self {
        Self {
            digest: vertex_digest(op, &inputs),
            inputs,
            name: name.into(),
            error: String::new(),
            cache_results: Vec::new(),
        }
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Digest of an operation plus its ordered input digests.
///
/// Equal operations over equal inputs produce equal digests and are treated
/// as producing equal outputs.
pub fn vertex_digest(op: &[u8], inputs: &[Digest]) -> Digest {
    let mut preimage = Vec::with_capacity(op.len() + inputs.len() * 72 + 16);
    preimage.extend_from_slice(b"vertex-v1\n");
    preimage.extend_from_slice(op);
    preimage.push(b'\n');
    for input in inputs {
        preimage.extend_from_slice(input.as_str().as_bytes());
        preimage.push(b'\n');
    }
    Digest::from_bytes(&preimage)
}

/// Vertices indexed by digest.
#[derive(Debug, Default)]
pub struct BuildGraph {
    states: HashMap<Digest, State>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex, returning its digest. Re-adding an existing digest keeps
    /// the recorded state.
    pub fn insert(&mut self, state: State) -> Digest {
        let digest = state.digest.clone();
        self.states.entry(digest.clone()).or_insert(state);
        digest
    }

    pub fn get(&self, digest: &Digest) -> Option<&State> {
        self.states.get(digest)
    }

    /// Record a failure for a vertex.
    pub fn record_error(&mut self, digest: &Digest, error: impl Into<String>) {
        if let Some(state) = self.states.get_mut(digest) {
            state.error = error.into();
        }
    }

    /// Attach a result to a vertex.
    pub fn add_result(&mut self, digest: &Digest, result: CacheResult) {
        if let Some(state) = self.states.get_mut(digest) {
            state.cache_results.push(result);
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
