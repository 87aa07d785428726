// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle of invitations: issue, cancel, complete, use and automatic obsoletion.
use std::collections::{BTreeMap, BTreeSet};

use teamchain_core::payload::{InviteEntry, InvitesSection, UsedInvite};
use teamchain_core::{GroupId, InviteId, Seqno, UserVersion};
use thiserror::Error;

use crate::role::Role;
use crate::state::{ChainState, Invite, InviteStatus, InviteUse};

/// Links of implicit groups which invited owners without being signed by an owner, accepted
/// for compatibility with chains written before the rule was enforced.
pub const LEGACY_OWNER_INVITE_EXEMPTIONS: &[(&str, Seqno)] = &[
    ("2b1434a78be94b43b10bc9a9e0d0bb24", 2),
    ("d6a672c1a12e9b378dbae4e8ca0b0e24", 6),
];

fn is_legacy_exemption(group_id: &GroupId, seqno: Seqno) -> bool {
    let id = group_id.to_string();
    LEGACY_OWNER_INVITE_EXEMPTIONS
        .iter()
        .any(|(exempt_id, exempt_seqno)| *exempt_id == id && *exempt_seqno == seqno)
}

fn by_role(section: &InvitesSection) -> [(Role, &[InviteEntry]); 4] {
    [
        (Role::Owner, section.owner.as_deref().unwrap_or_default()),
        (Role::Admin, section.admin.as_deref().unwrap_or_default()),
        (Role::Writer, section.writer.as_deref().unwrap_or_default()),
        (Role::Reader, section.reader.as_deref().unwrap_or_default()),
    ]
}

/// Apply the additions and cancellations of an invite section.
pub(crate) fn apply_invites(
    y: &mut ChainState,
    section: &InvitesSection,
    inviter: UserVersion,
    inviter_role: Role,
    seqno: Seqno,
) -> Result<(), InviteError> {
    let mut added_names = BTreeSet::new();

    for (role, entries) in by_role(section) {
        for entry in entries {
            if y.is_implicit() && !matches!(role, Role::Owner | Role::Reader) {
                return Err(InviteError::ImplicitGroupRole(role));
            }
            if role == Role::Owner
                && !inviter_role.is_owner()
                && !(y.is_implicit() && is_legacy_exemption(&y.id(), seqno))
            {
                return Err(InviteError::OwnerInviteNotAllowed(inviter));
            }
            match entry.max_uses {
                None | Some(-1) => (),
                Some(uses) if uses > 0 => (),
                Some(uses) => return Err(InviteError::InvalidMaxUses(uses)),
            }
            if y.invites().get(&entry.id).is_some() {
                return Err(InviteError::DuplicateId(entry.id.clone()));
            }
            let key = (entry.invite_type.clone(), entry.name.clone());
            let duplicate_active = y
                .invites()
                .active()
                .any(|invite| invite.invite_type == key.0 && invite.name == key.1);
            if duplicate_active || !added_names.insert(key) {
                return Err(InviteError::DuplicateName(entry.name.clone()));
            }

            let invites = y.invites_mut();
            invites
                .known
                .insert(entry.id.clone(), Invite::from_entry(entry, role, inviter, seqno));
            invites.status.insert(entry.id.clone(), InviteStatus::Active);
        }
    }

    for id in section.cancel.as_deref().unwrap_or_default() {
        cancel_invite(y, id, seqno)?;
    }

    Ok(())
}

/// Cancel an invite. Cancelling an invite which is no longer active has no effect.
pub(crate) fn cancel_invite(y: &mut ChainState, id: &InviteId, seqno: Seqno) -> Result<(), InviteError> {
    match y.invites().status(id) {
        None => Err(InviteError::UnknownInvite(id.clone())),
        Some(InviteStatus::Active) => {
            y.invites_mut()
                .status
                .insert(id.clone(), InviteStatus::Obsolete { seqno });
            Ok(())
        }
        Some(_) => Ok(()),
    }
}

/// Resolve the invites consumed by a membership change and return them per added user.
///
/// Every consumed invite must be active and must name a user added by the same link.
pub(crate) fn consume_invites(
    y: &mut ChainState,
    completed: Option<&BTreeMap<InviteId, UserVersion>>,
    used: Option<&[UsedInvite]>,
    additions: &BTreeSet<UserVersion>,
    seqno: Seqno,
) -> Result<BTreeMap<UserVersion, Vec<InviteId>>, InviteError> {
    let mut resolved: BTreeMap<UserVersion, Vec<InviteId>> = BTreeMap::new();

    for (id, uv) in completed.into_iter().flatten() {
        let invite = active_invite(y, id)?;
        if !invite.is_old_style() {
            return Err(InviteError::WrongInviteStyle(id.clone()));
        }
        if !additions.contains(uv) {
            return Err(InviteError::NotAdded(*uv));
        }
        y.invites_mut()
            .status
            .insert(id.clone(), InviteStatus::Completed { seqno });
        resolved.entry(*uv).or_default().push(id.clone());
    }

    for UsedInvite { id, uv } in used.into_iter().flatten() {
        let invite = active_invite(y, id)?;
        let Some(max_uses) = invite.max_uses else {
            return Err(InviteError::WrongInviteStyle(id.clone()));
        };
        let uses = y.invites().uses(id).len();
        if !invite.is_infinite() && uses as i64 >= max_uses {
            return Err(InviteError::Exhausted(id.clone()));
        }
        if !additions.contains(uv) {
            return Err(InviteError::NotAdded(*uv));
        }
        y.invites_mut()
            .uses
            .entry(id.clone())
            .or_default()
            .push(InviteUse { uv: *uv, seqno });
        resolved.entry(*uv).or_default().push(id.clone());
    }

    Ok(resolved)
}

fn active_invite(y: &ChainState, id: &InviteId) -> Result<Invite, InviteError> {
    let invite = y
        .invites()
        .get(id)
        .ok_or_else(|| InviteError::UnknownInvite(id.clone()))?;
    if !y.invites().is_active(id) {
        return Err(InviteError::NotActive(id.clone()));
    }
    Ok(invite.clone())
}

/// A user who became a full member no longer needs pending invites naming them.
pub(crate) fn obsolete_invites_for_member(y: &mut ChainState, uv: &UserVersion, role: Role, seqno: Seqno) {
    if !role.is_member() || role.is_bot_like() {
        return;
    }
    let obsolete: Vec<InviteId> = y
        .invites()
        .active()
        .filter(|invite| invite.keybase_user().is_some_and(|invited| invited.uid == uv.uid))
        .map(|invite| invite.id.clone())
        .collect();
    for id in obsolete {
        y.invites_mut()
            .status
            .insert(id, InviteStatus::Obsolete { seqno });
    }
}

/// Obsolete invites revealed from the link at `seqno` whose user already became a full member
/// by a later link, as if the link had been replayed in order.
pub(crate) fn obsolete_revealed_invites(y: &mut ChainState, seqno: Seqno) {
    let revealed: Vec<(InviteId, UserVersion)> = y
        .invites()
        .active()
        .filter(|invite| invite.seqno == seqno)
        .filter_map(|invite| invite.keybase_user().map(|uv| (invite.id.clone(), uv)))
        .collect();

    for (id, invited) in revealed {
        let joined_at = y
            .user_log()
            .iter()
            .filter(|(uv, _)| uv.uid == invited.uid)
            .flat_map(|(_, points)| points.iter())
            .filter(|point| point.sig_meta.location.seqno > seqno)
            .find(|point| point.role.is_member() && !point.role.is_bot_like())
            .map(|point| point.sig_meta.location.seqno);
        if let Some(joined_at) = joined_at {
            y.invites_mut()
                .status
                .insert(id, InviteStatus::Obsolete { seqno: joined_at });
        }
    }
}

#[derive(Debug, Error)]
pub enum InviteError {
    #[error("implicit groups cannot invite with role {0}")]
    ImplicitGroupRole(Role),

    #[error("{0} is not an owner and cannot invite owners")]
    OwnerInviteNotAllowed(UserVersion),

    #[error("invalid max uses {0}")]
    InvalidMaxUses(i64),

    #[error("invite id {0} was used before")]
    DuplicateId(InviteId),

    #[error("an active invite for '{0}' already exists")]
    DuplicateName(String),

    #[error("unknown invite {0}")]
    UnknownInvite(InviteId),

    #[error("invite {0} is not active")]
    NotActive(InviteId),

    #[error("invite {0} cannot be resolved this way")]
    WrongInviteStyle(InviteId),

    #[error("invite {0} has no uses left")]
    Exhausted(InviteId),

    #[error("invite resolved for {0} who is not added by the same link")]
    NotAdded(UserVersion),
}
