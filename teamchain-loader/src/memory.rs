// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory implementations of the loader collaborators.
//!
//! These do not persist data permanently, all changes are lost when the process ends. Use them
//! only in development or test contexts.
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::rc::Rc;

use teamchain_auth::SignerKey;
use teamchain_core::{GroupId, KeyId, RawLink, Seqno, UserId, UserOrGroupId};
use thiserror::Error;

use crate::loader::LoadedGroup;
use crate::traits::{
    IdentityLogSnapshot, IdentityLogs, LinkFetcher, LinkQuery, LogEvent, SignerVerifier,
    SnapshotStore,
};

type GroupKey = (GroupId, bool);

/// In-memory snapshot store.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    snapshots: Rc<RefCell<HashMap<GroupKey, LoadedGroup>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    type Error = Infallible;

    async fn get(&self, group_id: GroupId, public: bool) -> Result<Option<LoadedGroup>, Infallible> {
        Ok(self.snapshots.borrow().get(&(group_id, public)).cloned())
    }

    async fn put(
        &self,
        group_id: GroupId,
        public: bool,
        group: &LoadedGroup,
    ) -> Result<(), Infallible> {
        self.snapshots
            .borrow_mut()
            .insert((group_id, public), group.clone());
        Ok(())
    }
}

/// Chains held in memory, playing the part of the server.
#[derive(Clone, Debug, Default)]
pub struct MemoryLinks {
    chains: Rc<RefCell<HashMap<GroupKey, Vec<RawLink>>>>,
    withheld: Rc<RefCell<HashMap<GroupKey, BTreeSet<Seqno>>>>,
    queries: Rc<RefCell<Vec<(GroupId, LinkQuery)>>>,
}

impl MemoryLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the chain of a group.
    pub fn insert(&self, group_id: GroupId, public: bool, links: Vec<RawLink>) {
        self.chains.borrow_mut().insert((group_id, public), links);
    }

    /// Withhold the payloads of `seqnos` unless they are asked for explicitly.
    pub fn withhold(&self, group_id: GroupId, public: bool, seqnos: &[Seqno]) {
        self.withheld
            .borrow_mut()
            .entry((group_id, public))
            .or_default()
            .extend(seqnos);
    }

    /// All queries received so far, oldest first.
    pub fn queries(&self) -> Vec<(GroupId, LinkQuery)> {
        self.queries.borrow().clone()
    }
}

impl LinkFetcher for MemoryLinks {
    type Error = MemoryError;

    async fn fetch(
        &self,
        group_id: GroupId,
        public: bool,
        query: LinkQuery,
    ) -> Result<Vec<RawLink>, MemoryError> {
        self.queries.borrow_mut().push((group_id, query.clone()));

        let key = (group_id, public);
        let chains = self.chains.borrow();
        let links = chains.get(&key).ok_or(MemoryError::UnknownGroup(group_id))?;
        let withheld = self.withheld.borrow();
        let withheld = withheld.get(&key);

        let result = match query {
            LinkQuery::After(seqno) => links
                .iter()
                .filter(|link| link.seqno > seqno)
                .map(|link| {
                    if withheld.is_some_and(|seqnos| seqnos.contains(&link.seqno)) {
                        link.to_stub()
                    } else {
                        link.clone()
                    }
                })
                .collect(),
            LinkQuery::Seqnos(seqnos) => links
                .iter()
                .filter(|link| seqnos.contains(&link.seqno))
                .cloned()
                .collect(),
        };
        Ok(result)
    }
}

/// Signer keys held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeys {
    keys: Rc<RefCell<HashMap<(UserId, KeyId), SignerKey>>>,
}

impl MemoryKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: SignerKey) {
        self.keys.borrow_mut().insert((key.user.uid, key.kid), key);
    }
}

impl SignerVerifier for MemoryKeys {
    type Error = MemoryError;

    async fn load_key(&self, uid: UserId, kid: KeyId) -> Result<SignerKey, MemoryError> {
        self.keys
            .borrow()
            .get(&(uid, kid))
            .cloned()
            .ok_or(MemoryError::UnknownKey(kid))
    }
}

/// Identity logs held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryIdentityLogs {
    logs: Rc<RefCell<HashMap<UserOrGroupId, IdentityLogSnapshot>>>,
    requests: Rc<RefCell<Vec<UserOrGroupId>>>,
}

impl MemoryIdentityLogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, identity: UserOrGroupId, event: LogEvent) {
        self.logs
            .borrow_mut()
            .entry(identity)
            .or_default()
            .events
            .push(event);
    }

    /// Identities whose snapshots were requested, oldest first.
    pub fn requests(&self) -> Vec<UserOrGroupId> {
        self.requests.borrow().clone()
    }
}

impl IdentityLogs for MemoryIdentityLogs {
    type Error = Infallible;

    async fn snapshot(&self, identity: UserOrGroupId) -> Result<IdentityLogSnapshot, Infallible> {
        self.requests.borrow_mut().push(identity);
        Ok(self
            .logs
            .borrow()
            .get(&identity)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("unknown key {0}")]
    UnknownKey(KeyId),
}
