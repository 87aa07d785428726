// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolution of ordering obligations against the identity logs.
use std::collections::BTreeMap;
use std::error::Error as StdError;

use teamchain_auth::{Proof, ProofSet, ProofTerm};
use teamchain_core::{Seqno, UserOrGroupId};
use thiserror::Error;
use tracing::{debug, trace};

use crate::traits::{IdentityLogSnapshot, IdentityLogs, LogEventKind};

/// Check every obligation of `proofs`.
///
/// One snapshot is fetched per identity, so all obligations touching the same log are checked
/// against the same view of it.
pub async fn resolve_proofs<L>(logs: &L, proofs: &ProofSet) -> Result<(), ResolveError>
where
    L: IdentityLogs,
{
    let mut snapshots: BTreeMap<UserOrGroupId, IdentityLogSnapshot> = BTreeMap::new();

    for proof in proofs.iter() {
        for identity in [proof.a.identity, proof.b.identity] {
            fetch_snapshot(logs, &mut snapshots, identity).await?;
        }
        check_proof(proof, &snapshots)?;
        trace!(a = %proof.a.identity, b = %proof.b.identity, reason = %proof.reason, "obligation holds");
    }

    // Merged away endpoints were still claimed by some link.
    for term in proofs.superseded() {
        fetch_snapshot(logs, &mut snapshots, term.identity).await?;
        authoritative_position(term, &snapshots)?;
    }

    debug!(count = proofs.len(), identities = snapshots.len(), "resolved obligations");
    Ok(())
}

async fn fetch_snapshot<L>(
    logs: &L,
    snapshots: &mut BTreeMap<UserOrGroupId, IdentityLogSnapshot>,
    identity: UserOrGroupId,
) -> Result<(), ResolveError>
where
    L: IdentityLogs,
{
    if !snapshots.contains_key(&identity) {
        let snapshot = logs
            .snapshot(identity)
            .await
            .map_err(|err| ResolveError::Logs(Box::new(err)))?;
        snapshots.insert(identity, snapshot);
    }
    Ok(())
}

fn check_proof(
    proof: &Proof,
    snapshots: &BTreeMap<UserOrGroupId, IdentityLogSnapshot>,
) -> Result<(), ResolveError> {
    let a = authoritative_position(&proof.a, snapshots)?;
    let b = authoritative_position(&proof.b, snapshots)?;
    if a > b {
        return Err(ResolveError::OrderViolated {
            reason: proof.reason.clone(),
            a,
            b,
        });
    }

    // Whatever `a` granted must not have been taken away before `b`.
    let log = &snapshots[&proof.a.identity];
    let granted = log
        .event(proof.a.sig_meta.location.seqno)
        .and_then(|event| match &event.kind {
            LogEventKind::Grant { subject } => Some(subject),
            _ => None,
        });
    if let Some(subject) = granted {
        let revocation = log.events.iter().find(|event| {
            event.position > a
                && event.position < b
                && matches!(&event.kind, LogEventKind::Revoke { subject: revoked } if revoked == subject)
        });
        if let Some(revocation) = revocation {
            return Err(ResolveError::RevokedBetween {
                subject: subject.clone(),
                position: revocation.position,
                reason: proof.reason.clone(),
            });
        }
    }

    Ok(())
}

fn authoritative_position(
    term: &ProofTerm,
    snapshots: &BTreeMap<UserOrGroupId, IdentityLogSnapshot>,
) -> Result<u64, ResolveError> {
    let seqno = term.sig_meta.location.seqno;
    let event = snapshots
        .get(&term.identity)
        .and_then(|log| log.event(seqno))
        .ok_or(ResolveError::UnknownPosition {
            identity: term.identity,
            seqno,
        })?;
    if event.position != term.position() {
        return Err(ResolveError::PositionMismatch {
            identity: term.identity,
            seqno,
            claimed: term.position(),
            actual: event.position,
        });
    }
    Ok(event.position)
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("fetching identity log failed: {0}")]
    Logs(#[source] Box<dyn StdError + Send + Sync>),

    #[error("{identity} has no entry {seqno}")]
    UnknownPosition { identity: UserOrGroupId, seqno: Seqno },

    #[error("{identity} entry {seqno} claims position {claimed} but is at {actual}")]
    PositionMismatch {
        identity: UserOrGroupId,
        seqno: Seqno,
        claimed: u64,
        actual: u64,
    },

    #[error("obligation violated ({reason}): {a} is after {b}")]
    OrderViolated { reason: String, a: u64, b: u64 },

    #[error("{subject} was revoked at {position} ({reason})")]
    RevokedBetween {
        subject: String,
        position: u64,
        reason: String,
    },
}
