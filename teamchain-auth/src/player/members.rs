// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of membership sections into role updates.
use std::collections::{BTreeMap, BTreeSet};

use teamchain_core::UserVersion;
use teamchain_core::payload::MembersSection;

use crate::player::ValidationError;
use crate::role::Role;
use crate::state::ChainState;

/// Constraints on a membership section, depending on the link and group.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MemberChecks {
    pub allow_owners: bool,
    pub allow_removals: bool,
    pub implicit: bool,
    pub public: bool,
}

/// New role per user. `Role::None` marks a removal.
pub(crate) type RoleUpdates = BTreeMap<UserVersion, Role>;

pub(crate) fn parse_members(
    section: &MembersSection,
    checks: MemberChecks,
) -> Result<RoleUpdates, ValidationError> {
    let lists = [
        (Role::Owner, &section.owner),
        (Role::Admin, &section.admin),
        (Role::Writer, &section.writer),
        (Role::Reader, &section.reader),
        (Role::Bot, &section.bot),
        (Role::RestrictedBot, &section.restricted_bot),
        (Role::None, &section.none),
    ];

    let mut updates = RoleUpdates::new();
    let mut added_uids = BTreeSet::new();

    for (role, list) in lists {
        let list = list.as_deref().unwrap_or_default();
        if list.is_empty() {
            continue;
        }

        match role {
            Role::None if !checks.allow_removals => return Err(ValidationError::UnexpectedRemovals),
            Role::Owner if !checks.allow_owners => return Err(ValidationError::SubgroupOwners),
            _ => (),
        }
        if checks.implicit {
            // Private implicit groups only know owners, public ones also readers.
            let allowed = match role {
                Role::None | Role::Owner => true,
                Role::Reader => checks.public,
                _ => false,
            };
            if !allowed {
                return Err(ValidationError::ImplicitGroupRole(role));
            }
        }

        for uv in list {
            if updates.insert(*uv, role).is_some() {
                return Err(ValidationError::DuplicateMember(*uv));
            }
            if role.is_member() && !added_uids.insert(uv.uid) {
                return Err(ValidationError::DuplicateUid(uv.uid));
            }
        }
    }

    Ok(updates)
}

/// Users gaining membership through these updates.
pub(crate) fn additions(y: &ChainState, updates: &RoleUpdates) -> BTreeSet<UserVersion> {
    updates
        .iter()
        .filter(|(uv, role)| role.is_member() && !y.role(uv).is_member())
        .map(|(uv, _)| *uv)
        .collect()
}

/// Check a membership change of an implicit group and return the additions which need to be
/// backed by a consumed invite.
///
/// Additions are either a reset user replacing their previous incarnation, in which case the
/// removal of the old version is part of the same link, or consume an invite.
pub(crate) fn unpaired_implicit_additions(
    y: &ChainState,
    updates: &RoleUpdates,
) -> Result<BTreeSet<UserVersion>, ValidationError> {
    let additions = additions(y, updates);
    let removals: Vec<UserVersion> = updates
        .iter()
        .filter(|(_, role)| !role.is_member())
        .map(|(uv, _)| *uv)
        .collect();

    for (uv, role) in updates {
        let prior = y.role(uv);
        if prior.is_member() && role.is_member() && prior != *role {
            return Err(ValidationError::ImplicitRoleChange(*uv));
        }
    }

    let mut paired = BTreeSet::new();
    let mut unpaired = BTreeSet::new();
    for addition in &additions {
        match removals.iter().find(|removed| removed.uid == addition.uid) {
            Some(removed) => {
                if removed.eldest_seqno >= addition.eldest_seqno {
                    return Err(ValidationError::ImplicitReset(*addition));
                }
                paired.insert(*removed);
            }
            None => {
                unpaired.insert(*addition);
            }
        }
    }

    for removed in &removals {
        if !paired.contains(removed) || !y.role(removed).is_member() {
            return Err(ValidationError::UnpairedRemoval(*removed));
        }
    }

    Ok(unpaired)
}
