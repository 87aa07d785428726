// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loading and verifying groups.
//!
//! [`TeamLoader`] fetches a group's links, checks every envelope and signer key, replays the
//! chain and resolves the resulting ordering obligations. Ancestor groups are loaded on demand,
//! for implicit admins and for sub-group cross checks. Loads of the same group are serialised,
//! concurrent callers share the outcome.
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use teamchain_auth::{
    ChainPlayer, ChainState, PlayerError, ProofSet, Signer, add_proofs_for_admin,
    add_proofs_for_key, check_parent_child_operations, parent_child_operation,
};
use teamchain_core::{GroupId, LinkType, RawLink, Seqno, UnpackedLink, unpack_link};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::config::LoaderConfig;
use crate::errors::LoaderError;
use crate::resolve::resolve_proofs;
use crate::traits::{IdentityLogs, LinkFetcher, LinkQuery, SignerVerifier, SnapshotStore};

/// Outcome of a load, shared between all callers waiting for it.
pub type LoadResult = Result<Arc<LoadedGroup>, Arc<LoaderError>>;

type GroupKey = (GroupId, bool);

/// Which group to load and which of its links must be present with their payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadRequest {
    pub group_id: GroupId,
    pub public: bool,
    pub need_seqnos: Vec<Seqno>,

    /// Fetch new links even if an earlier load satisfies the request.
    pub refresh: bool,
}

impl LoadRequest {
    pub fn new(group_id: GroupId, public: bool) -> Self {
        Self {
            group_id,
            public,
            need_seqnos: Vec::new(),
            refresh: false,
        }
    }

    pub fn need(mut self, seqnos: impl IntoIterator<Item = Seqno>) -> Self {
        self.need_seqnos.extend(seqnos);
        self
    }

    pub fn refresh(mut self) -> Self {
        self.refresh = true;
        self
    }
}

/// A verified group: its state and the obligations which were checked to accept it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedGroup {
    pub state: ChainState,
    pub proofs: ProofSet,
}

impl LoadedGroup {
    /// All `seqnos` are part of the chain and not stubbed.
    pub fn satisfies(&self, seqnos: &[Seqno]) -> bool {
        seqnos
            .iter()
            .all(|seqno| *seqno <= self.state.last_seqno() && !self.state.is_stubbed(*seqno))
    }
}

#[derive(Debug, Default)]
struct Slot {
    /// Number of loads which finished for this group.
    finished: AtomicU64,
    outcome: Mutex<Option<LoadResult>>,
}

/// Loads groups through the given collaborators.
pub struct TeamLoader<F, V, L, S> {
    fetcher: F,
    verifier: V,
    logs: L,
    store: S,
    config: LoaderConfig,
    slots: Mutex<HashMap<GroupKey, Arc<Slot>>>,
    deleted: Mutex<HashMap<GroupKey, Seqno>>,
}

impl<F, V, L, S> TeamLoader<F, V, L, S>
where
    F: LinkFetcher,
    V: SignerVerifier,
    L: IdentityLogs,
    S: SnapshotStore,
{
    pub fn new(fetcher: F, verifier: V, logs: L, store: S, config: LoaderConfig) -> Self {
        Self {
            fetcher,
            verifier,
            logs,
            store,
            config,
            slots: Mutex::new(HashMap::new()),
            deleted: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load and verify a group.
    ///
    /// An earlier outcome is reused when it already satisfies the request. Nothing is returned
    /// or stored before all checks of the load passed.
    pub async fn load(&self, request: LoadRequest) -> LoadResult {
        self.load_in(request, Vec::new()).await
    }

    /// Sequence number of the link which deleted the group, if a load observed one.
    pub async fn deleted_at(&self, group_id: GroupId, public: bool) -> Option<Seqno> {
        self.deleted.lock().await.get(&(group_id, public)).copied()
    }

    fn load_in(
        &self,
        request: LoadRequest,
        path: Vec<GroupId>,
    ) -> Pin<Box<dyn Future<Output = LoadResult> + '_>> {
        Box::pin(self.load_serialised(request, path))
    }

    async fn load_serialised(&self, request: LoadRequest, path: Vec<GroupId>) -> LoadResult {
        let group_id = request.group_id;
        let key = (group_id, request.public);

        if path.contains(&group_id) {
            return Err(Arc::new(LoaderError::Cycle(group_id)));
        }
        if path.len() > self.config.max_ancestor_depth {
            return Err(Arc::new(LoaderError::AncestorDepthExceeded(
                self.config.max_ancestor_depth,
            )));
        }
        if let Some(seqno) = self.deleted_at(group_id, request.public).await {
            return Err(Arc::new(LoaderError::GroupDeleted { group_id, seqno }));
        }

        let slot = self.slots.lock().await.entry(key).or_default().clone();
        let seen = slot.finished.load(Ordering::Acquire);
        let mut outcome = slot.outcome.lock().await;

        // A load which finished while we were waiting counts as ours.
        let fresh = slot.finished.load(Ordering::Acquire) != seen;
        match outcome.as_ref() {
            Some(Err(err)) if fresh => return Err(err.clone()),
            Some(Ok(group))
                if (fresh || !request.refresh) && group.satisfies(&request.need_seqnos) =>
            {
                trace!(%group_id, "reuse loaded group");
                return Ok(group.clone());
            }
            _ => (),
        }

        let prior = match outcome.as_ref() {
            Some(Ok(group)) => Some(group.clone()),
            _ => None,
        };
        let result = self
            .run(&request, prior, path)
            .await
            .map(Arc::new)
            .map_err(Arc::new);

        if let Err(err) = &result {
            warn!(%group_id, %err, "rejected group");
            if let LoaderError::GroupDeleted { group_id: deleted, seqno } = err.as_ref() {
                if *deleted == group_id {
                    self.deleted.lock().await.insert(key, *seqno);
                }
            }
        }

        *outcome = Some(result.clone());
        slot.finished.fetch_add(1, Ordering::Release);
        result
    }

    async fn run(
        &self,
        request: &LoadRequest,
        prior: Option<Arc<LoadedGroup>>,
        mut path: Vec<GroupId>,
    ) -> Result<LoadedGroup, LoaderError> {
        let group_id = request.group_id;
        let public = request.public;
        path.push(group_id);

        let start = match prior {
            Some(group) => Some(LoadedGroup::clone(&group)),
            None if self.config.persist_snapshots => self
                .store
                .get(group_id, public)
                .await
                .map_err(|err| LoaderError::Store(Box::new(err)))?,
            None => None,
        };
        let (mut state, mut proofs) = match start {
            Some(group) => (Some(group.state), group.proofs),
            None => (None, ProofSet::new()),
        };

        let after = state.as_ref().map_or(0, ChainState::last_seqno);
        debug!(%group_id, after, "fetch links");
        let raw_links = self.fetch(group_id, public, LinkQuery::After(after)).await?;

        let mut new_proofs = ProofSet::new();
        let mut operations = Vec::new();
        for raw in raw_links {
            let mut link = unpack_link(raw)?;
            if link.is_stubbed() && !link.link_type.is_stubbable() {
                link = self.fetch_link(group_id, public, link.seqno()).await?;
            }

            let signer = self
                .verify_link(group_id, public, state.as_ref(), &link, &mut new_proofs, &path)
                .await?;
            if let Some(operation) = parent_child_operation(&link)? {
                operations.push(operation);
            }
            let next = match ChainPlayer::append(state.as_ref(), &link, signer.as_ref()) {
                Err(PlayerError::StubbedInvite { invite, needed, .. }) => {
                    let y = state.take().ok_or(LoaderError::EmptyChain(group_id))?;
                    debug!(%group_id, seqno = link.seqno(), %invite, "invite is in stubbed links");
                    let y = self
                        .inflate(group_id, public, y, &needed, &mut new_proofs, &path)
                        .await?;
                    ChainPlayer::append(Some(&y), &link, signer.as_ref())?
                }
                result => result?,
            };
            state = Some(next);
        }
        let mut state = state.ok_or(LoaderError::EmptyChain(group_id))?;

        let missing = stubbed_in(&state, &request.need_seqnos);
        if !missing.is_empty() {
            state = self
                .inflate(group_id, public, state, &missing, &mut new_proofs, &path)
                .await?;
        }

        if let Some(parent_id) = state.parent_id().filter(|_| !operations.is_empty()) {
            let needed = operations.iter().map(|operation| operation.parent_seqno);
            let parent = self
                .load_ancestor(parent_id, public, needed.collect(), &path)
                .await?;
            check_parent_child_operations(&parent.state, &state, &operations)?;
            debug!(%group_id, %parent_id, count = operations.len(), "checked parent links");
        }

        if self.config.resolve_proofs {
            resolve_proofs(&self.logs, &new_proofs).await?;
        }
        proofs.merge(new_proofs);

        let group = LoadedGroup { state, proofs };
        if self.config.persist_snapshots {
            self.store
                .put(group_id, public, &group)
                .await
                .map_err(|err| LoaderError::Store(Box::new(err)))?;
        }

        debug!(
            %group_id,
            seqno = group.state.last_seqno(),
            proofs = group.proofs.len(),
            "loaded group"
        );
        Ok(group)
    }

    /// Fetch the payloads of the stubbed `seqnos` and supply them to the state.
    async fn inflate(
        &self,
        group_id: GroupId,
        public: bool,
        mut state: ChainState,
        seqnos: &[Seqno],
        proofs: &mut ProofSet,
        path: &[GroupId],
    ) -> Result<ChainState, LoaderError> {
        debug!(%group_id, ?seqnos, "inflate links");
        let raw_links = self
            .fetch(group_id, public, LinkQuery::Seqnos(seqnos.to_vec()))
            .await?;
        for raw in raw_links {
            let link = unpack_link(raw)?;
            if link.is_stubbed() || !state.is_stubbed(link.seqno()) {
                continue;
            }
            let signer = self
                .verify_link(group_id, public, Some(&state), &link, proofs, path)
                .await?;
            if let Some(signer) = signer {
                state = ChainPlayer::inflate(&state, &link, &signer)?;
            }
        }

        let seqnos = stubbed_in(&state, seqnos);
        if !seqnos.is_empty() {
            return Err(LoaderError::MissingLinks { group_id, seqnos });
        }
        Ok(state)
    }

    /// Check the envelope and signer key of a link and determine who signed it.
    ///
    /// Returns `None` for stubbed links. Obligations for the signer key and for implicit admin
    /// rights are added to `proofs`.
    async fn verify_link(
        &self,
        group_id: GroupId,
        public: bool,
        prior: Option<&ChainState>,
        link: &UnpackedLink,
        proofs: &mut ProofSet,
        path: &[GroupId],
    ) -> Result<Option<Signer>, LoaderError> {
        let seqno = link.seqno();
        let kid = self
            .verifier
            .verify_envelope(&link.envelope)
            .map_err(|source| LoaderError::Envelope { seqno, source })?;
        let Some(sig_meta) = link.signature_metadata() else {
            return Ok(None);
        };
        if sig_meta.signing_kid != kid {
            return Err(LoaderError::SignerKeyMismatch { seqno });
        }

        let uid = link.source.uid;
        let key = self
            .verifier
            .load_key(uid, kid)
            .await
            .map_err(|err| LoaderError::Verifier(Box::new(err)))?;
        if key.user.uid != uid || key.kid != kid {
            return Err(LoaderError::SignerKeyMismatch { seqno });
        }
        add_proofs_for_key(proofs, group_id, sig_meta, &key);

        let mut signer = Signer::new(key.user);
        let team = link.team();
        match team.and_then(|team| team.admin.as_ref()) {
            None if matches!(link.link_type, LinkType::SubgroupHead) => {
                return Err(LoaderError::HeadWithoutAdmin(group_id));
            }
            None => (),
            // Own admins are checked while replaying.
            Some(admin) if admin.group_id == group_id && prior.is_some() => (),
            Some(admin) => {
                let parent_id = match prior {
                    Some(y) => y.parent_id(),
                    None => team
                        .and_then(|team| team.parent.as_ref())
                        .map(|parent| parent.id),
                };
                let ancestor = self
                    .find_ancestor(group_id, parent_id, admin.group_id, public, path)
                    .await?;
                if admin.seqno > ancestor.state.last_seqno() {
                    return Err(LoaderError::AdminSeqnoBeyondChain {
                        group_id: admin.group_id,
                        seqno: admin.seqno,
                    });
                }

                let bookends = ancestor
                    .state
                    .assert_became_admin_at(&key.user, admin.seqno)?;
                add_proofs_for_admin(proofs, group_id, sig_meta, admin.group_id, &bookends);
                signer.implicit_admin = true;
                trace!(%group_id, seqno, ancestor = %admin.group_id, "implicit admin");
            }
        }

        Ok(Some(signer))
    }

    /// Walk up the parent pointers starting at `parent_id` until `target` is found.
    async fn find_ancestor(
        &self,
        group_id: GroupId,
        parent_id: Option<GroupId>,
        target: GroupId,
        public: bool,
        path: &[GroupId],
    ) -> Result<Arc<LoadedGroup>, LoaderError> {
        let mut path = path.to_vec();
        let mut current = parent_id;
        while let Some(id) = current {
            let ancestor = self.load_ancestor(id, public, Vec::new(), &path).await?;
            if id == target {
                return Ok(ancestor);
            }
            path.push(id);
            current = ancestor.state.parent_id();
        }
        Err(LoaderError::AdminNotAncestor {
            group_id,
            admin: target,
        })
    }

    async fn load_ancestor(
        &self,
        group_id: GroupId,
        public: bool,
        need_seqnos: Vec<Seqno>,
        path: &[GroupId],
    ) -> Result<Arc<LoadedGroup>, LoaderError> {
        let request = LoadRequest::new(group_id, public).need(need_seqnos);
        self.load_in(request, path.to_vec())
            .await
            .map_err(|source| LoaderError::Ancestor { group_id, source })
    }

    async fn fetch(
        &self,
        group_id: GroupId,
        public: bool,
        query: LinkQuery,
    ) -> Result<Vec<RawLink>, LoaderError> {
        self.fetcher
            .fetch(group_id, public, query)
            .await
            .map_err(|err| LoaderError::Fetch(Box::new(err)))
    }

    /// Fetch a single link with its payload.
    async fn fetch_link(
        &self,
        group_id: GroupId,
        public: bool,
        seqno: Seqno,
    ) -> Result<UnpackedLink, LoaderError> {
        let missing = || LoaderError::MissingLinks {
            group_id,
            seqnos: vec![seqno],
        };
        let raw = self
            .fetch(group_id, public, LinkQuery::Seqnos(vec![seqno]))
            .await?
            .into_iter()
            .find(|raw| raw.seqno == seqno && !raw.is_stubbed())
            .ok_or_else(missing)?;
        debug!(%group_id, seqno, "refetched withheld link");
        Ok(unpack_link(raw)?)
    }
}

impl<F, V, L, S> fmt::Debug for TeamLoader<F, V, L, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeamLoader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn stubbed_in(state: &ChainState, seqnos: &[Seqno]) -> Vec<Seqno> {
    let mut stubbed: Vec<Seqno> = seqnos
        .iter()
        .copied()
        .filter(|seqno| state.is_stubbed(*seqno))
        .collect();
    stubbed.sort_unstable();
    stubbed.dedup();
    stubbed
}
