// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the services a loader depends on.
use std::error::Error;

use serde::{Deserialize, Serialize};
use teamchain_auth::SignerKey;
use teamchain_core::{
    EnvelopeError, GroupId, KeyId, RawLink, Seqno, SignedEnvelope, UserId, UserOrGroupId,
};

use crate::loader::LoadedGroup;

/// Which links of a chain to fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkQuery {
    /// All links with a greater sequence number, in order. The server may withhold payloads.
    After(Seqno),

    /// The given links with their payloads.
    Seqnos(Vec<Seqno>),
}

/// Source of raw chain links.
pub trait LinkFetcher {
    type Error: Error + Send + Sync + 'static;

    fn fetch(
        &self,
        group_id: GroupId,
        public: bool,
        query: LinkQuery,
    ) -> impl Future<Output = Result<Vec<RawLink>, Self::Error>>;
}

/// Verifies link envelopes and looks up the keys which signed them.
pub trait SignerVerifier {
    type Error: Error + Send + Sync + 'static;

    /// Check the envelope signature and return the id of the signing key.
    fn verify_envelope(&self, envelope: &SignedEnvelope) -> Result<KeyId, EnvelopeError> {
        envelope.verify().map(KeyId::from)
    }

    /// Resolve a user's key through their own identity log.
    fn load_key(
        &self,
        uid: UserId,
        kid: KeyId,
    ) -> impl Future<Output = Result<SignerKey, Self::Error>>;
}

/// Kind of an identity log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEventKind {
    /// Grants a right to `subject`, for example provisions a key or promotes an admin.
    Grant { subject: String },

    /// Takes a right away from `subject`.
    Revoke { subject: String },

    Other,
}

/// Entry of an identity log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Sequence number within the identity's log.
    pub seqno: Seqno,

    /// Position on the global clock.
    pub position: u64,

    pub kind: LogEventKind,
}

/// Consistent view of one identity log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLogSnapshot {
    pub events: Vec<LogEvent>,
}

impl IdentityLogSnapshot {
    pub fn event(&self, seqno: Seqno) -> Option<&LogEvent> {
        self.events.iter().find(|event| event.seqno == seqno)
    }
}

/// Authoritative view of user and group logs.
pub trait IdentityLogs {
    type Error: Error + Send + Sync + 'static;

    fn snapshot(
        &self,
        identity: UserOrGroupId,
    ) -> impl Future<Output = Result<IdentityLogSnapshot, Self::Error>>;
}

/// Persistence for verified groups.
pub trait SnapshotStore {
    type Error: Error + Send + Sync + 'static;

    fn get(
        &self,
        group_id: GroupId,
        public: bool,
    ) -> impl Future<Output = Result<Option<LoadedGroup>, Self::Error>>;

    fn put(
        &self,
        group_id: GroupId,
        public: bool,
        group: &LoadedGroup,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}
