// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordering obligations between positions in different identity logs.
//!
//! Replaying a group chain trusts that the signer's key was valid and, for implicit admins,
//! that they held admin rights in an ancestor group when the link was signed. Both claims are
//! collected as "`a` happened before `b`" obligations and resolved against an authoritative
//! view of all logs once the chain has been replayed.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use teamchain_core::{GroupId, KeyId, SignatureMetadata, UserOrGroupId, UserVersion};
use tracing::trace;

use crate::state::AdminBookends;

/// A position in some identity's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofTerm {
    pub identity: UserOrGroupId,
    pub sig_meta: SignatureMetadata,
}

impl ProofTerm {
    pub fn new(identity: UserOrGroupId, sig_meta: SignatureMetadata) -> Self {
        Self { identity, sig_meta }
    }

    /// Global clock position claimed for this term.
    pub fn position(&self) -> u64 {
        self.sig_meta.merkle_seqno
    }

    pub fn less_than_or_equal(&self, other: &ProofTerm) -> bool {
        self.position() <= other.position()
    }
}

/// Obligation that `a` happened before `b`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub a: ProofTerm,
    pub b: ProofTerm,
    pub reason: String,
}

/// Unordered pair of identities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct ProofIndex {
    low: UserOrGroupId,
    high: UserOrGroupId,
}

impl ProofIndex {
    fn new(a: UserOrGroupId, b: UserOrGroupId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }
}

/// Minimal set of ordering obligations, indexed by the pair of identities involved.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofSet {
    proofs: BTreeMap<ProofIndex, Vec<Proof>>,

    /// Endpoints of obligations which were merged away.
    #[serde(default)]
    superseded: Vec<ProofTerm>,
}

impl ProofSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the obligation that `a` happened before `b`.
    ///
    /// Obligations between the same identities and in the same direction are merged: a new
    /// one which is stricter than an existing one replaces it, one which is implied by an
    /// existing one is dropped. The endpoints which no longer take part in an obligation are
    /// kept in [`ProofSet::superseded`], as their claimed positions still need checking.
    pub fn add_needed_happens_before(&mut self, a: ProofTerm, b: ProofTerm, reason: impl Into<String>) {
        let index = ProofIndex::new(a.identity, b.identity);
        let entries = self.proofs.entry(index).or_default();
        let superseded = &mut self.superseded;

        for existing in entries.iter_mut() {
            if existing.a.identity != a.identity {
                continue;
            }

            if existing.a.less_than_or_equal(&a) && b.less_than_or_equal(&existing.b) {
                trace!(
                    a = %a.identity,
                    b = %b.identity,
                    "tighten {}->{} to {}->{}",
                    existing.a.position(),
                    existing.b.position(),
                    a.position(),
                    b.position()
                );
                let old_a = std::mem::replace(&mut existing.a, a);
                let old_b = std::mem::replace(&mut existing.b, b);
                remember(superseded, old_a, &existing.a);
                remember(superseded, old_b, &existing.b);
                existing.reason = reason.into();
                return;
            }

            if a.less_than_or_equal(&existing.a) && existing.b.less_than_or_equal(&b) {
                trace!(a = %a.identity, b = %b.identity, "implied by existing obligation");
                remember(superseded, a, &existing.a);
                remember(superseded, b, &existing.b);
                return;
            }
        }

        entries.push(Proof {
            a,
            b,
            reason: reason.into(),
        });
    }

    /// Add all obligations of another set.
    pub fn merge(&mut self, other: ProofSet) {
        for proof in other.proofs.into_values().flatten() {
            self.add_needed_happens_before(proof.a, proof.b, proof.reason);
        }
        for term in other.superseded {
            if !self.superseded.contains(&term) {
                self.superseded.push(term);
            }
        }
    }

    /// Terms whose obligation was tightened or implied by another one.
    pub fn superseded(&self) -> &[ProofTerm] {
        &self.superseded
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proof> {
        self.proofs.values().flatten()
    }

    /// Obligations between two identities, in either direction.
    pub fn between(&self, a: UserOrGroupId, b: UserOrGroupId) -> &[Proof] {
        self.proofs
            .get(&ProofIndex::new(a, b))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.proofs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remember(superseded: &mut Vec<ProofTerm>, term: ProofTerm, kept: &ProofTerm) {
    if &term != kept && !superseded.contains(&term) {
        superseded.push(term);
    }
}

/// Key which signed a link, as resolved through the signer's own identity log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerKey {
    pub user: UserVersion,
    pub kid: KeyId,
    pub provisioning: SignatureMetadata,
    pub revocation: Option<SignatureMetadata>,
}

/// Require the signing key to be provisioned before the link and, if revoked, the link to come
/// before the revocation.
pub fn add_proofs_for_key(
    proofs: &mut ProofSet,
    group_id: GroupId,
    link: SignatureMetadata,
    key: &SignerKey,
) {
    let user = UserOrGroupId::User(key.user.uid);
    let link = ProofTerm::new(UserOrGroupId::Group(group_id), link);

    proofs.add_needed_happens_before(
        ProofTerm::new(user, key.provisioning),
        link.clone(),
        format!("key {} provisioned before it signed", key.kid),
    );
    if let Some(revocation) = key.revocation {
        proofs.add_needed_happens_before(
            link,
            ProofTerm::new(user, revocation),
            format!("key {} signed before it was revoked", key.kid),
        );
    }
}

/// Require the signer to have become admin of `ancestor` before the link and, if they lost the
/// role, the link to come before the downgrade.
pub fn add_proofs_for_admin(
    proofs: &mut ProofSet,
    group_id: GroupId,
    link: SignatureMetadata,
    ancestor: GroupId,
    bookends: &AdminBookends,
) {
    let ancestor_id = UserOrGroupId::Group(ancestor);
    let link = ProofTerm::new(UserOrGroupId::Group(group_id), link);

    proofs.add_needed_happens_before(
        ProofTerm::new(ancestor_id, bookends.became_admin),
        link.clone(),
        format!("became admin of {ancestor} before signing"),
    );
    if let Some(downgraded) = bookends.downgraded {
        proofs.add_needed_happens_before(
            link,
            ProofTerm::new(ancestor_id, downgraded),
            format!("signed before losing admin of {ancestor}"),
        );
    }
}
