//! Configured cache-folder documents. Derivative writers pick the lowest
//! priority folder with remaining capacity and bump its statistics in one
//! compound update.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{CacheFolderId, CollectionId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFolder {
    pub id: CacheFolderId,
    pub path: PathBuf,
    /// Lower values are preferred when selecting a destination.
    pub priority: i32,
    pub max_size_bytes: u64,
    pub current_size_bytes: u64,
    pub total_files: u64,
    pub total_collections: u64,
    pub cached_collection_ids: HashSet<CollectionId>,
    pub enabled: bool,
}

impl CacheFolder {
    pub fn new(path: impl Into<PathBuf>, priority: i32, max_size_bytes: u64) -> Self {
        Self {
            id: CacheFolderId::generate(),
            path: path.into(),
            priority,
            max_size_bytes,
            current_size_bytes: 0,
            total_files: 0,
            total_collections: 0,
            cached_collection_ids: HashSet::new(),
            enabled: true,
        }
    }

    pub fn has_capacity_for(&self, estimated_bytes: u64) -> bool {
        self.current_size_bytes + estimated_bytes < self.max_size_bytes
    }
}
