// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the group loader.
use serde::{Deserialize, Serialize};

/// Default maximum number of ancestors loaded to check a single group.
pub const DEFAULT_MAX_ANCESTOR_DEPTH: usize = 16;

/// Configuration parameters for [`TeamLoader`](crate::TeamLoader).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// How many parent groups may be loaded in a row, for implicit admin and sub-group checks.
    pub max_ancestor_depth: usize,

    /// Write every verified group to the snapshot store and start later loads from it.
    pub persist_snapshots: bool,

    /// Check the ordering obligations of every load against the identity logs.
    ///
    /// Disabling this accepts groups whose signers may have used revoked keys or lost their
    /// admin rights. Only useful for tests and debugging.
    pub resolve_proofs: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_ancestor_depth: DEFAULT_MAX_ANCESTOR_DEPTH,
            persist_snapshots: true,
            resolve_proofs: true,
        }
    }
}
