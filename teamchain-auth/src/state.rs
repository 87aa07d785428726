// SPDX-License-Identifier: MIT OR Apache-2.0

//! Immutable snapshot of a group after replaying a prefix of its chain.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use teamchain_core::payload::{BotSettings, InviteEntry};
use teamchain_core::{
    GroupId, GroupName, InviteId, KeyId, LinkId, LinkType, PublicKey, Seqno, SignatureMetadata,
    UserId, UserVersion,
};
use thiserror::Error;

use crate::role::Role;

/// Role change of a user, recorded at the link which caused it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLogPoint {
    pub role: Role,
    pub sig_meta: SignatureMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerGroupKey {
    pub generation: u64,
    pub seqno: Seqno,
    pub signing_kid: PublicKey,
    pub encryption_kid: KeyId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    pub id: InviteId,
    pub role: Role,
    pub invite_type: String,
    pub name: String,
    pub inviter: UserVersion,
    pub max_uses: Option<i64>,
    pub etime: Option<u64>,
    pub seqno: Seqno,
}

impl Invite {
    pub(crate) fn from_entry(entry: &InviteEntry, role: Role, inviter: UserVersion, seqno: Seqno) -> Self {
        Self {
            id: entry.id.clone(),
            role,
            invite_type: entry.invite_type.clone(),
            name: entry.name.clone(),
            inviter,
            max_uses: entry.max_uses,
            etime: entry.etime,
            seqno,
        }
    }

    /// Old-style invites are single use and resolved through completion.
    pub fn is_old_style(&self) -> bool {
        self.max_uses.is_none()
    }

    pub fn is_infinite(&self) -> bool {
        self.max_uses == Some(-1)
    }

    /// The invited user, for invites naming an existing user.
    pub fn keybase_user(&self) -> Option<UserVersion> {
        InviteEntry {
            id: self.id.clone(),
            name: self.name.clone(),
            invite_type: self.invite_type.clone(),
            max_uses: self.max_uses,
            etime: self.etime,
        }
        .keybase_user()
    }
}

/// One use of a multi-use invite.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteUse {
    pub uv: UserVersion,
    pub seqno: Seqno,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteStatus {
    Active,
    Completed { seqno: Seqno },
    Obsolete { seqno: Seqno },
}

/// All invites ever seen by a group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteSet {
    pub(crate) known: BTreeMap<InviteId, Invite>,
    pub(crate) status: BTreeMap<InviteId, InviteStatus>,
    pub(crate) uses: BTreeMap<InviteId, Vec<InviteUse>>,
}

impl InviteSet {
    pub fn get(&self, id: &InviteId) -> Option<&Invite> {
        self.known.get(id)
    }

    pub fn status(&self, id: &InviteId) -> Option<InviteStatus> {
        self.status.get(id).copied()
    }

    pub fn is_active(&self, id: &InviteId) -> bool {
        matches!(self.status(id), Some(InviteStatus::Active))
    }

    pub fn is_obsolete(&self, id: &InviteId) -> bool {
        matches!(self.status(id), Some(InviteStatus::Obsolete { .. }))
    }

    pub fn active(&self) -> impl Iterator<Item = &Invite> {
        self.known.values().filter(|invite| self.is_active(&invite.id))
    }

    pub fn uses(&self, id: &InviteId) -> &[InviteUse] {
        self.uses.get(id).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Creation, rename or deletion (`name` is `None`) of a sub-group, seen from the parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgroupLogEntry {
    pub name: Option<String>,
    pub seqno: Seqno,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameLogEntry {
    pub name: GroupName,
    pub seqno: Seqno,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSettings {
    pub open: bool,
    pub join_as: Role,
    pub seqno: Seqno,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlfEntry {
    pub id: String,
    pub seqno: Seqno,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyUpgrade {
    pub app_type: u64,
    pub team_generation: u64,
    pub legacy_generation: u64,
    pub keyset_hash: String,
    pub seqno: Seqno,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotSettingsEntry {
    pub settings: BotSettings,
    pub seqno: Seqno,
}

/// Positions in an ancestor's chain where a user became admin and, if it happened, where they
/// lost that role again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminBookends {
    pub became_admin: SignatureMetadata,
    pub downgraded: Option<SignatureMetadata>,
}

/// State of a group after applying links `1..=last_seqno`.
///
/// Snapshots are never mutated once returned. Larger collections are shared between
/// consecutive snapshots and copied on write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub(crate) id: GroupId,
    pub(crate) public: bool,
    pub(crate) implicit: bool,
    pub(crate) parent_id: Option<GroupId>,
    pub(crate) name: GroupName,
    pub(crate) name_log: Vec<NameLogEntry>,
    pub(crate) last_seqno: Seqno,
    pub(crate) last_link_id: LinkId,
    pub(crate) last_high_seqno: Seqno,
    pub(crate) last_high_link_id: LinkId,
    pub(crate) link_ids: Arc<BTreeMap<Seqno, LinkId>>,
    pub(crate) stubbed: Arc<BTreeMap<Seqno, LinkType>>,
    pub(crate) user_log: Arc<BTreeMap<UserVersion, Vec<UserLogPoint>>>,
    pub(crate) per_group_keys: Arc<BTreeMap<u64, PerGroupKey>>,
    pub(crate) invites: Arc<InviteSet>,
    pub(crate) subgroup_log: Arc<BTreeMap<GroupId, Vec<SubgroupLogEntry>>>,
    pub(crate) open: Option<OpenSettings>,
    pub(crate) tlf_ids: Vec<TlfEntry>,
    pub(crate) legacy_upgrades: BTreeMap<u64, Vec<LegacyUpgrade>>,
    pub(crate) bot_settings: Arc<BTreeMap<UserVersion, BotSettingsEntry>>,
    pub(crate) box_summary_hashes: BTreeMap<Seqno, String>,
}

impl ChainState {
    pub(crate) fn new(
        id: GroupId,
        name: GroupName,
        public: bool,
        implicit: bool,
        parent_id: Option<GroupId>,
        link_id: LinkId,
    ) -> Self {
        Self {
            id,
            public,
            implicit,
            parent_id,
            name_log: vec![NameLogEntry {
                name: name.clone(),
                seqno: 1,
            }],
            name,
            last_seqno: 1,
            last_link_id: link_id,
            last_high_seqno: 1,
            last_high_link_id: link_id,
            link_ids: Arc::new(BTreeMap::from([(1, link_id)])),
            stubbed: Arc::default(),
            user_log: Arc::default(),
            per_group_keys: Arc::default(),
            invites: Arc::default(),
            subgroup_log: Arc::default(),
            open: None,
            tlf_ids: Vec::new(),
            legacy_upgrades: BTreeMap::new(),
            bot_settings: Arc::default(),
            box_summary_hashes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &GroupName {
        &self.name
    }

    pub fn name_log(&self) -> &[NameLogEntry] {
        &self.name_log
    }

    /// Name of the group as of the link at `seqno`.
    pub fn name_at(&self, seqno: Seqno) -> &GroupName {
        self.name_log
            .iter()
            .rev()
            .find(|entry| entry.seqno <= seqno)
            .map(|entry| &entry.name)
            .unwrap_or(&self.name)
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn is_subgroup(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn parent_id(&self) -> Option<GroupId> {
        self.parent_id
    }

    pub fn last_seqno(&self) -> Seqno {
        self.last_seqno
    }

    pub fn last_link_id(&self) -> LinkId {
        self.last_link_id
    }

    /// Seqno of the latest link which changed the set of admins or owners.
    pub fn last_high_seqno(&self) -> Seqno {
        self.last_high_seqno
    }

    pub fn last_high_link_id(&self) -> LinkId {
        self.last_high_link_id
    }

    pub fn link_id(&self, seqno: Seqno) -> Option<LinkId> {
        self.link_ids.get(&seqno).copied()
    }

    pub fn is_stubbed(&self, seqno: Seqno) -> bool {
        self.stubbed.contains_key(&seqno)
    }

    pub fn stubbed_links(&self) -> &BTreeMap<Seqno, LinkType> {
        &self.stubbed
    }

    /// `true` when the link at `seqno` was applied with its payload.
    pub fn is_link_fully_present(&self, seqno: Seqno) -> bool {
        seqno >= 1 && seqno <= self.last_seqno && !self.is_stubbed(seqno)
    }

    // Membership

    pub fn user_log(&self) -> &BTreeMap<UserVersion, Vec<UserLogPoint>> {
        &self.user_log
    }

    /// Current role of a user.
    pub fn role(&self, uv: &UserVersion) -> Role {
        self.user_log
            .get(uv)
            .and_then(|points| points.last())
            .map(|point| point.role)
            .unwrap_or_default()
    }

    /// Role of a user as of (and including) the link at `seqno`.
    pub fn role_at(&self, uv: &UserVersion, seqno: Seqno) -> Role {
        self.user_log
            .get(uv)
            .and_then(|points| {
                points
                    .iter()
                    .rev()
                    .find(|point| point.sig_meta.location.seqno <= seqno)
            })
            .map(|point| point.role)
            .unwrap_or_default()
    }

    /// All current members and their roles.
    pub fn members(&self) -> BTreeMap<UserVersion, Role> {
        self.user_log
            .keys()
            .map(|uv| (*uv, self.role(uv)))
            .filter(|(_, role)| role.is_member())
            .collect()
    }

    pub fn users_with_role(&self, role: Role) -> Vec<UserVersion> {
        self.user_log
            .keys()
            .filter(|uv| self.role(uv) == role)
            .copied()
            .collect()
    }

    /// Current members with the given uid, regardless of their eldest seqno.
    pub fn members_with_uid(&self, uid: &UserId) -> Vec<UserVersion> {
        self.user_log
            .keys()
            .filter(|uv| &uv.uid == uid && self.role(uv).is_member())
            .copied()
            .collect()
    }

    pub fn was_member(&self, uv: &UserVersion) -> bool {
        self.user_log
            .get(uv)
            .is_some_and(|points| points.iter().any(|point| point.role.is_member()))
    }

    pub fn assert_role_at_least(
        &self,
        uv: &UserVersion,
        role: Role,
        seqno: Seqno,
    ) -> Result<(), StateError> {
        let actual = self.role_at(uv, seqno);
        if actual < role {
            return Err(StateError::InsufficientRole {
                user: *uv,
                required: role,
                actual,
                seqno,
            });
        }
        Ok(())
    }

    /// Find where a user became admin (or owner) before the link at `seqno` and where, if ever,
    /// they stopped being one.
    pub fn assert_became_admin_at(
        &self,
        uv: &UserVersion,
        seqno: Seqno,
    ) -> Result<AdminBookends, StateError> {
        let not_admin = || StateError::NotAdmin {
            user: *uv,
            group_id: self.id,
            seqno,
        };
        let points = self.user_log.get(uv).ok_or_else(not_admin)?;

        let index = points
            .iter()
            .rposition(|point| point.sig_meta.location.seqno <= seqno)
            .ok_or_else(not_admin)?;
        if !points[index].role.is_admin_or_above() {
            return Err(not_admin());
        }

        // Walk back to the first point of the current admin streak.
        let mut first = index;
        while first > 0 && points[first - 1].role.is_admin_or_above() {
            first -= 1;
        }
        let downgraded = points[index + 1..]
            .iter()
            .find(|point| !point.role.is_admin_or_above())
            .map(|point| point.sig_meta);

        Ok(AdminBookends {
            became_admin: points[first].sig_meta,
            downgraded,
        })
    }

    // Keys

    pub fn per_group_keys(&self) -> &BTreeMap<u64, PerGroupKey> {
        &self.per_group_keys
    }

    pub fn latest_key(&self) -> Option<&PerGroupKey> {
        self.per_group_keys.values().next_back()
    }

    pub fn key(&self, generation: u64) -> Option<&PerGroupKey> {
        self.per_group_keys.get(&generation)
    }

    pub fn latest_generation(&self) -> u64 {
        self.latest_key().map(|key| key.generation).unwrap_or_default()
    }

    // Invites

    pub fn invites(&self) -> &InviteSet {
        &self.invites
    }

    // Sub-groups

    pub fn subgroup_log(&self) -> &BTreeMap<GroupId, Vec<SubgroupLogEntry>> {
        &self.subgroup_log
    }

    /// Current last name part of a sub-group, `None` when unknown or deleted.
    pub fn subgroup_name(&self, id: &GroupId) -> Option<&str> {
        self.subgroup_log
            .get(id)
            .and_then(|entries| entries.last())
            .and_then(|entry| entry.name.as_deref())
    }

    /// Live sub-group with the given last name part. If the name was used by several
    /// sub-groups over time, the most recent wins.
    pub fn subgroup_by_name(&self, part: &str) -> Option<GroupId> {
        self.subgroup_log
            .iter()
            .filter_map(|(id, entries)| entries.last().map(|entry| (id, entry)))
            .filter(|(_, entry)| entry.name.as_deref() == Some(part))
            .max_by_key(|(_, entry)| entry.seqno)
            .map(|(id, _)| *id)
    }

    pub fn subgroup_entry_at(&self, id: &GroupId, seqno: Seqno) -> Option<&SubgroupLogEntry> {
        self.subgroup_log
            .get(id)
            .and_then(|entries| entries.iter().find(|entry| entry.seqno == seqno))
    }

    // Settings

    pub fn open_settings(&self) -> Option<&OpenSettings> {
        self.open.as_ref()
    }

    pub fn tlf_ids(&self) -> &[TlfEntry] {
        &self.tlf_ids
    }

    pub fn legacy_upgrades(&self) -> &BTreeMap<u64, Vec<LegacyUpgrade>> {
        &self.legacy_upgrades
    }

    pub fn bot_settings(&self) -> &BTreeMap<UserVersion, BotSettingsEntry> {
        &self.bot_settings
    }

    pub fn box_summary_hashes(&self) -> &BTreeMap<Seqno, String> {
        &self.box_summary_hashes
    }

    // Updates, only used while building the next snapshot.

    /// Record a role for a user, unless it is already their current role.
    pub(crate) fn inform_user(&mut self, uv: UserVersion, role: Role, sig_meta: SignatureMetadata) {
        if self.role(&uv) == role {
            return;
        }
        Arc::make_mut(&mut self.user_log)
            .entry(uv)
            .or_default()
            .push(UserLogPoint { role, sig_meta });
    }

    pub(crate) fn inform_key(&mut self, key: PerGroupKey) {
        Arc::make_mut(&mut self.per_group_keys).insert(key.generation, key);
    }

    pub(crate) fn inform_subgroup(
        &mut self,
        id: GroupId,
        name: Option<String>,
        seqno: Seqno,
    ) -> Result<(), StateError> {
        let entries = Arc::make_mut(&mut self.subgroup_log).entry(id).or_default();
        let position = entries
            .iter()
            .position(|entry| entry.seqno >= seqno)
            .unwrap_or(entries.len());
        if entries.get(position).is_some_and(|entry| entry.seqno == seqno) {
            return Err(StateError::DuplicateSubgroupEntry { id, seqno });
        }
        entries.insert(position, SubgroupLogEntry { name, seqno });
        Ok(())
    }

    pub(crate) fn invites_mut(&mut self) -> &mut InviteSet {
        Arc::make_mut(&mut self.invites)
    }

    pub(crate) fn bot_settings_mut(&mut self) -> &mut BTreeMap<UserVersion, BotSettingsEntry> {
        Arc::make_mut(&mut self.bot_settings)
    }

    /// Move the chain tip forward by one link.
    pub(crate) fn advance(&mut self, link_id: LinkId, seqno: Seqno, high: bool) {
        self.last_seqno = seqno;
        self.last_link_id = link_id;
        Arc::make_mut(&mut self.link_ids).insert(seqno, link_id);
        if high {
            self.last_high_seqno = seqno;
            self.last_high_link_id = link_id;
        }
    }

    pub(crate) fn mark_stubbed(&mut self, seqno: Seqno, link_type: LinkType) {
        Arc::make_mut(&mut self.stubbed).insert(seqno, link_type);
    }

    pub(crate) fn clear_stubbed(&mut self, seqno: Seqno) {
        Arc::make_mut(&mut self.stubbed).remove(&seqno);
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("user {user} needs role {required} at seqno {seqno} but has {actual}")]
    InsufficientRole {
        user: UserVersion,
        required: Role,
        actual: Role,
        seqno: Seqno,
    },

    #[error("user {user} is not an admin of group {group_id} at seqno {seqno}")]
    NotAdmin {
        user: UserVersion,
        group_id: GroupId,
        seqno: Seqno,
    },

    #[error("sub-group {id} already has an entry at seqno {seqno}")]
    DuplicateSubgroupEntry { id: GroupId, seqno: Seqno },
}
