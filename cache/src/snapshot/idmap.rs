//! User namespace identity mapping.

use a3s_build_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

/// One contiguous range of ids mapped into the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    fn to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }
}

/// Mapping of container uids and gids to host ids.
///
/// An empty uid or gid list maps ids to themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub uids: Vec<IdMap>,
    pub gids: Vec<IdMap>,
}

impl IdentityMapping {
    pub fn new(uids: Vec<IdMap>, gids: Vec<IdMap>) -> Self {
        Self { uids, gids }
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty() && self.gids.is_empty()
    }

    /// Translate a container uid/gid pair to host ids.
    pub fn to_host(&self, uid: u32, gid: u32) -> Result<(u32, u32)> {
        let host_uid = map_id(&self.uids, uid)
            .ok_or_else(|| BuildError::Other(format!("container uid {} is not mapped", uid)))?;
        let host_gid = map_id(&self.gids, gid)
            .ok_or_else(|| BuildError::Other(format!("container gid {} is not mapped", gid)))?;
        Ok((host_uid, host_gid))
    }
}

fn map_id(maps: &[IdMap], id: u32) -> Option<u32> {
    if maps.is_empty() {
        return Some(id);
    }
    maps.iter().find_map(|m| m.to_host(id))
}
