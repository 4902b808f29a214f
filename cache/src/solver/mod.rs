//! Ancestor build info lookup over the build graph.
//!
//! When a step executes it may need to know which sources its inputs were
//! built from (for provenance records). Rather than recomputing, the step
//! reads the build info its ancestors already attached to their results.
//!
//! The lookup is an explicit capability: [`StepContext`] is created once per
//! vertex and carries an [`AncestorBuildInfos`] for the lifetime of that
//! vertex's execution.

pub mod buildinfo;
pub mod graph;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use a3s_build_core::Digest;
use parking_lot::RwLock;

pub use buildinfo::{BuildInfo, BuildInfoKey, BuildInfoType, CacheBuildInfos};
pub use graph::{vertex_digest, BuildGraph, CacheResult, State};

/// Build graph shared between the solver and the steps it runs.
pub type SharedGraph = Arc<RwLock<BuildGraph>>;

/// Build info lookup rooted at one vertex.
#[derive(Clone)]
pub struct AncestorBuildInfos {
    graph: SharedGraph,
    start: Digest,
}

impl AncestorBuildInfos {
    pub fn new(graph: SharedGraph, start: Digest) -> Self {
        Self { graph, start }
    }

    /// Look up build info for `keys` among the start vertex and its ancestors.
    ///
    /// Values recorded by errored vertices are never returned. Keys that no
    /// ancestor carries are absent from the result.
    pub fn get(&self, keys: &[BuildInfoKey]) -> HashMap<BuildInfoKey, BuildInfo> {
        let mut pending: HashSet<&BuildInfoKey> = keys.iter().collect();
        let mut found = HashMap::new();
        if pending.is_empty() {
            return found;
        }

        let graph = self.graph.read();
        let satisfied = walk_ancestors(&graph, &self.start, &mut pending, &mut found);
        tracing::trace!(
            start = %self.start,
            requested = keys.len(),
            found = found.len(),
            satisfied,
            "Resolved ancestor build info"
        );
        found
    }
}

/// Depth-first walk from `start` following input edges.
///
/// Each vertex is visited at most once. Returns `true` as soon as every
/// pending key has been found, which stops the walk.
fn walk_ancestors(
    graph: &BuildGraph,
    start: &Digest,
    pending: &mut HashSet<&BuildInfoKey>,
    found: &mut HashMap<BuildInfoKey, BuildInfo>,
) -> bool {
    let mut stack = vec![start];
    let mut visited: HashSet<&Digest> = HashSet::new();

    while let Some(digest) = stack.pop() {
        if !visited.insert(digest) {
            continue;
        }

        let Some(state) = graph.get(digest) else {
            tracing::warn!(vertex = %digest, "Ancestor vertex not found in build graph");
            continue;
        };

        // Errored vertices contribute nothing, but their inputs may still.
        if !state.has_error() && absorb(state, pending, found) {
            return true;
        }

        // Reverse so the first input is visited first.
        stack.extend(state.inputs.iter().rev());
    }

    false
}

/// Move matching pending keys from a vertex's results into `found`.
fn absorb(
    state: &State,
    pending: &mut HashSet<&BuildInfoKey>,
    found: &mut HashMap<BuildInfoKey, BuildInfo>,
) -> bool {
    for result in &state.cache_results {
        let Some(infos) = &result.build_infos else {
            continue;
        };
        pending.retain(|key| match infos.get(*key) {
            Some(info) => {
                found.insert((*key).clone(), info.clone());
                false
            }
            None => true,
        });
        if pending.is_empty() {
            return true;
        }
    }
    false
}

/// Capabilities available to a step while it executes.
#[derive(Clone)]
pub struct StepContext {
    vertex: Digest,
    build_infos: AncestorBuildInfos,
}

impl StepContext {
    /// Materialize the context for `vertex`.
    pub fn new(graph: SharedGraph, vertex: Digest) -> Self {
        Self {
            build_infos: AncestorBuildInfos::new(graph, vertex.clone()),
            vertex,
        }
    }

    pub fn vertex(&self) -> &Digest {
        &self.vertex
    }

    /// Build info lookup over this step's ancestors.
    pub fn ancestor_build_infos(&self) -> &AncestorBuildInfos {
        &self.build_infos
    }
}
