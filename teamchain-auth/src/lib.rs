// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replay and verification of group sigchains.
//!
//! A group's chain is replayed link by link with [`ChainPlayer`], producing immutable
//! [`ChainState`] snapshots which answer membership, key and invite queries. Claims which can
//! only be checked against other identities' logs are collected as ordering obligations in a
//! [`ProofSet`].
pub mod invites;
pub mod parent_child;
pub mod player;
pub mod policy;
pub mod proofs;
mod role;
pub mod state;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use invites::InviteError;
pub use parent_child::{
    ParentChildError, ParentChildOperation, check_parent_child_operations, parent_child_operation,
};
pub use player::{ChainPlayer, ErrorKind, PlayerError, Signer, ValidationError};
pub use policy::{LinkRules, PolicyError, Rule, check_link_rules};
pub use proofs::{Proof, ProofSet, ProofTerm, SignerKey, add_proofs_for_admin, add_proofs_for_key};
pub use role::Role;
pub use state::{AdminBookends, ChainState, StateError};
