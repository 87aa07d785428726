// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error as StdError;
use std::sync::Arc;

use teamchain_auth::{ParentChildError, PlayerError, StateError};
use teamchain_core::{EnvelopeError, GroupId, Seqno, UnpackError};
use thiserror::Error;

use crate::resolve::ResolveError;

type BoxedError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("fetching links failed: {0}")]
    Fetch(#[source] BoxedError),

    #[error("looking up signer key failed: {0}")]
    Verifier(#[source] BoxedError),

    #[error("snapshot store failed: {0}")]
    Store(#[source] BoxedError),

    #[error(transparent)]
    Unpack(#[from] UnpackError),

    #[error("envelope of link {seqno} is invalid: {source}")]
    Envelope {
        seqno: Seqno,
        #[source]
        source: EnvelopeError,
    },

    #[error("link {seqno} was not signed by the key it names")]
    SignerKeyMismatch { seqno: Seqno },

    #[error("head of sub-group {0} does not name an admin group")]
    HeadWithoutAdmin(GroupId),

    #[error("{admin} is not an ancestor of {group_id}")]
    AdminNotAncestor { group_id: GroupId, admin: GroupId },

    #[error("admin section points at link {seqno} beyond the chain of {group_id}")]
    AdminSeqnoBeyondChain { group_id: GroupId, seqno: Seqno },

    #[error(transparent)]
    Player(PlayerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    ParentChild(#[from] ParentChildError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("links {seqnos:?} of {group_id} stayed stubbed")]
    MissingLinks { group_id: GroupId, seqnos: Vec<Seqno> },

    #[error("no links for {0}")]
    EmptyChain(GroupId),

    #[error("loading {0} depends on itself")]
    Cycle(GroupId),

    #[error("more than {0} ancestors needed")]
    AncestorDepthExceeded(usize),

    #[error("ancestor {group_id} failed to load: {source}")]
    Ancestor {
        group_id: GroupId,
        #[source]
        source: Arc<LoaderError>,
    },

    #[error("group {group_id} was deleted at link {seqno}")]
    GroupDeleted { group_id: GroupId, seqno: Seqno },
}

impl LoaderError {
    /// The load failed because payloads were withheld. Retrying with the affected links
    /// requested can succeed.
    pub fn is_stubbed(&self) -> bool {
        match self {
            LoaderError::Player(
                PlayerError::Stubbed { .. }
                | PlayerError::StubbedInvite { .. }
                | PlayerError::FirstLinkStubbed,
            ) => true,
            LoaderError::ParentChild(err) => err.stubbed_seqno().is_some(),
            LoaderError::MissingLinks { .. } => true,
            LoaderError::Ancestor { source, .. } => source.is_stubbed(),
            _ => false,
        }
    }
}

impl From<PlayerError> for LoaderError {
    fn from(err: PlayerError) -> Self {
        match err {
            PlayerError::GroupDeleted { group_id, seqno } => {
                LoaderError::GroupDeleted { group_id, seqno }
            }
            err => LoaderError::Player(err),
        }
    }
}
