// SPDX-License-Identifier: MIT OR Apache-2.0

//! State transitions per link type.
//!
//! Every transition takes the prior snapshot by value and returns the next one. Transitions of
//! stubbable types also run as a deferred reveal and must then produce the same result as if
//! the link had been applied in order.
use teamchain_core::payload::{
    BotSettings, KbfsSection, MembersSection, PerGroupKeySection, SettingsSection,
    reverse_sig_input,
};
use teamchain_core::{GroupId, GroupName, LinkType, SeqType, Seqno, UserVersion};

use crate::invites::{
    apply_invites, consume_invites, obsolete_invites_for_member, obsolete_revealed_invites,
};
use crate::player::members::{
    MemberChecks, RoleUpdates, additions, parse_members, unpaired_implicit_additions,
};
use crate::player::{LinkContext, ValidationError};
use crate::policy::{PolicyError, Section};
use crate::role::Role;
use crate::state::{
    BotSettingsEntry, ChainState, LegacyUpgrade, NameLogEntry, OpenSettings, PerGroupKey,
    TlfEntry,
};

/// Build the state of a chain from its first link.
pub(crate) fn first(ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    match ctx.link.link_type {
        LinkType::Root => root(ctx),
        LinkType::SubgroupHead => subgroup_head(ctx),
        link_type => Err(PolicyError::CannotBeFirst(link_type).into()),
    }
}

/// Apply a link which is not the first of its chain.
pub(crate) fn apply(y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    match ctx.link.link_type {
        LinkType::ChangeMembership => change_membership(y, ctx),
        LinkType::RotateKey => rotate_key(y, ctx),
        LinkType::Leave => leave(y, ctx),
        LinkType::NewSubgroup => new_subgroup(y, ctx),
        LinkType::RenameSubgroup => rename_subgroup(y, ctx),
        LinkType::DeleteSubgroup => delete_subgroup(y, ctx),
        LinkType::RenameUpPointer => rename_up_pointer(y, ctx),
        LinkType::Invite => invite(y, ctx),
        LinkType::Settings => settings(y, ctx),
        LinkType::KbfsUpgrade => kbfs(y, ctx),
        LinkType::BotSettings => bot_settings(y, ctx),
        link_type @ (LinkType::Root
        | LinkType::SubgroupHead
        | LinkType::DeleteRoot
        | LinkType::DeleteUpPointer
        | LinkType::Unsupported(_)) => {
            Err(PolicyError::Unsupported(link_type).into())
        }
    }
}

fn parse_name(value: Option<&String>) -> Result<GroupName, ValidationError> {
    let value = value.ok_or(PolicyError::MissingSection(
        Section::Name,
    ))?;
    Ok(value.parse()?)
}

fn root(ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let team = ctx.team;
    let id = team.id.ok_or(PolicyError::MissingGroupId)?;
    let name = parse_name(team.name.as_ref())?;

    if !id.is_root() || !name.is_root() {
        return Err(ValidationError::InvalidGroupId(id));
    }
    if id.is_public() != team.public {
        return Err(ValidationError::PublicMismatch);
    }
    if team.implicit != name.is_implicit() {
        return Err(ValidationError::ImplicitMismatch);
    }
    // Implicit groups are named after their members, so their id cannot be derived.
    if !team.implicit && name.to_root_group_id(team.public)? != id {
        return Err(ValidationError::InvalidGroupId(id));
    }
    if ctx.link.outer.seq_type != SeqType::for_group(team.public) {
        return Err(ValidationError::SeqTypeMismatch);
    }

    let mut y = ChainState::new(id, name, team.public, team.implicit, None, ctx.link.link_id);

    let updates = members(
        team.members.as_ref(),
        MemberChecks {
            allow_owners: true,
            allow_removals: false,
            implicit: team.implicit,
            public: team.public,
        },
    )?;
    if !updates.values().any(Role::is_owner) {
        return Err(ValidationError::RootWithoutOwners);
    }
    if updates.get(&ctx.signer.user) != Some(&Role::Owner) {
        return Err(ValidationError::RootSignerNotOwner(ctx.signer.user));
    }
    apply_role_updates(&mut y, &updates, ctx);

    let key = key_section(ctx)?;
    let key = check_key(&y, key, ctx)?;
    y.inform_key(key);

    if let Some(section) = &team.invites {
        apply_invites(&mut y, section, ctx.signer.user, Role::Owner, ctx.seqno)?;
    }
    if let Some(section) = &team.settings {
        if team.implicit {
            return Err(ValidationError::ImplicitSettings);
        }
        apply_settings(&mut y, section, ctx)?;
    }
    if let Some(section) = &team.kbfs {
        apply_kbfs(&mut y, section, ctx)?;
    }
    record_box_summary(&mut y, ctx);

    Ok(y)
}

fn subgroup_head(ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let team = ctx.team;
    let id = team.id.ok_or(PolicyError::MissingGroupId)?;
    let name = parse_name(team.name.as_ref())?;
    let parent = team.parent.as_ref().ok_or(PolicyError::MissingSection(
        Section::Parent,
    ))?;

    if !id.is_subgroup() || parent.id == id {
        return Err(ValidationError::InvalidGroupId(id));
    }
    if name.is_root() {
        return Err(ValidationError::NotDirectChild(name.to_string()));
    }
    if id.is_public() != team.public {
        return Err(ValidationError::PublicMismatch);
    }
    if team.implicit {
        return Err(ValidationError::ImplicitMismatch);
    }
    if ctx.link.outer.seq_type != SeqType::for_group(team.public) {
        return Err(ValidationError::SeqTypeMismatch);
    }

    let mut y = ChainState::new(id, name, team.public, false, Some(parent.id), ctx.link.link_id);

    if team.members.is_some() {
        let updates = members(
            team.members.as_ref(),
            MemberChecks {
                allow_owners: false,
                allow_removals: false,
                implicit: false,
                public: team.public,
            },
        )?;
        apply_role_updates(&mut y, &updates, ctx);
    }

    let key = key_section(ctx)?;
    let key = check_key(&y, key, ctx)?;
    y.inform_key(key);

    if let Some(section) = &team.settings {
        apply_settings(&mut y, section, ctx)?;
    }
    record_box_summary(&mut y, ctx);

    Ok(y)
}

fn change_membership(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let team = ctx.team;
    let updates = members(
        team.members.as_ref(),
        MemberChecks {
            allow_owners: !y.is_subgroup(),
            allow_removals: true,
            implicit: y.is_implicit(),
            public: y.is_public(),
        },
    )?;

    let signer_is_owner = y.role_at(&ctx.signer.user, ctx.seqno - 1).is_owner();
    for (uv, role) in &updates {
        let prior = y.role(uv);
        let touches_owner = role.is_owner() || prior.is_owner();
        if touches_owner && prior != *role && !signer_is_owner {
            return Err(ValidationError::OwnerChangeNotAllowed(*uv));
        }
    }

    let unpaired = if y.is_implicit() {
        Some(unpaired_implicit_additions(&y, &updates)?)
    } else {
        None
    };

    let added = additions(&y, &updates);
    let resolved = consume_invites(
        &mut y,
        team.completed_invites.as_ref(),
        team.used_invites.as_deref(),
        &added,
        ctx.seqno,
    )?;
    // Each unpaired addition of an implicit group resolves exactly one invite.
    if let Some(unpaired) = unpaired {
        if let Some(uv) = unpaired.iter().find(|uv| !resolved.contains_key(*uv)) {
            return Err(ValidationError::UninvitedAddition(*uv));
        }
        let unexpected = resolved
            .iter()
            .find(|(uv, invites)| invites.len() > 1 || !unpaired.contains(*uv));
        if let Some((uv, _)) = unexpected {
            return Err(ValidationError::UnexpectedInvite(*uv));
        }
    }

    apply_role_updates(&mut y, &updates, ctx);

    if let Some(key) = &team.per_team_key {
        let key = check_key(&y, key, ctx)?;
        y.inform_key(key);
    }
    record_box_summary(&mut y, ctx);

    Ok(y)
}

fn rotate_key(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let key = key_section(ctx)?;
    let key = check_key(&y, key, ctx)?;
    y.inform_key(key);
    record_box_summary(&mut y, ctx);
    Ok(y)
}

fn leave(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let user = ctx.signer.user;
    if y.role(&user).is_owner() && !y.is_subgroup() && y.users_with_role(Role::Owner).len() == 1 {
        return Err(ValidationError::LastOwnerLeaving);
    }
    y.inform_user(user, Role::None, ctx.sig_meta);
    y.bot_settings_mut().remove(&user);
    Ok(y)
}

fn new_subgroup(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let (id, name) = subgroup_section(&y, ctx)?;

    let known_before = y
        .subgroup_log()
        .get(&id)
        .is_some_and(|entries| entries.iter().any(|entry| entry.seqno <= ctx.seqno));
    if known_before {
        return Err(ValidationError::SubgroupExists(id));
    }
    if !ctx.reveal && y.subgroup_by_name(name.last_part()).is_some() {
        return Err(ValidationError::SubgroupNameTaken(name.last_part().to_string()));
    }

    y.inform_subgroup(id, Some(name.last_part().to_string()), ctx.seqno)?;
    Ok(y)
}

fn rename_subgroup(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let (id, name) = subgroup_section(&y, ctx)?;
    live_subgroup_name(&y, &id, ctx)?;
    if !ctx.reveal && y.subgroup_by_name(name.last_part()).is_some() {
        return Err(ValidationError::SubgroupNameTaken(name.last_part().to_string()));
    }
    y.inform_subgroup(id, Some(name.last_part().to_string()), ctx.seqno)?;
    Ok(y)
}

fn delete_subgroup(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let (id, name) = subgroup_section(&y, ctx)?;
    if live_subgroup_name(&y, &id, ctx)? != name.last_part() {
        return Err(ValidationError::SubgroupNameMismatch(id));
    }
    y.inform_subgroup(id, None, ctx.seqno)?;
    Ok(y)
}

fn rename_up_pointer(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let name = parse_name(ctx.team.name.as_ref())?;
    check_parent_pointer(&y, ctx)?;
    if name.parent() != y.name().parent() {
        return Err(ValidationError::RenameMustKeepParent);
    }
    y.name_log.push(NameLogEntry {
        name: name.clone(),
        seqno: ctx.seqno,
    });
    y.name = name;
    Ok(y)
}

/// Validate a deletion link. Applying it ends the chain.
pub(crate) fn check_deletion(y: &ChainState, ctx: &LinkContext) -> Result<(), ValidationError> {
    match ctx.link.link_type {
        LinkType::DeleteRoot if y.is_subgroup() => Err(ValidationError::DeleteRootOfSubgroup),
        LinkType::DeleteUpPointer => {
            check_parent_pointer(y, ctx)?;
            let name = parse_name(ctx.team.name.as_ref())?;
            if &name != y.name() {
                return Err(ValidationError::NotDirectChild(name.to_string()));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn invite(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let section = ctx.team.invites.as_ref().ok_or(PolicyError::MissingSection(
        Section::Invites,
    ))?;
    let inviter_role = y.role_at(&ctx.signer.user, ctx.seqno - 1);
    apply_invites(&mut y, section, ctx.signer.user, inviter_role, ctx.seqno)?;
    if ctx.reveal {
        obsolete_revealed_invites(&mut y, ctx.seqno);
    }
    Ok(y)
}

fn settings(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let section = ctx.team.settings.as_ref().ok_or(PolicyError::MissingSection(
        Section::Settings,
    ))?;
    apply_settings(&mut y, section, ctx)?;
    Ok(y)
}

fn kbfs(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let section = ctx.team.kbfs.as_ref().ok_or(PolicyError::MissingSection(
        Section::Kbfs,
    ))?;
    apply_kbfs(&mut y, section, ctx)?;
    Ok(y)
}

fn bot_settings(mut y: ChainState, ctx: &LinkContext) -> Result<ChainState, ValidationError> {
    let section = ctx.team.bot_settings.as_ref().ok_or(
        PolicyError::MissingSection(Section::BotSettings),
    )?;
    for (uv, settings) in section {
        if y.role_at(uv, ctx.seqno) != Role::RestrictedBot {
            return Err(ValidationError::NotRestrictedBot(*uv));
        }
        if ctx.reveal && !still_restricted_bot_since(&y, uv, ctx.seqno) {
            continue;
        }
        set_bot_settings(&mut y, *uv, settings, ctx.seqno);
    }
    Ok(y)
}

// Helpers

fn members(
    section: Option<&MembersSection>,
    checks: MemberChecks,
) -> Result<RoleUpdates, ValidationError> {
    let section = section.ok_or(PolicyError::MissingSection(
        Section::Members,
    ))?;
    parse_members(section, checks)
}

fn apply_role_updates(y: &mut ChainState, updates: &RoleUpdates, ctx: &LinkContext) {
    for (uv, role) in updates {
        y.inform_user(*uv, *role, ctx.sig_meta);
        if *role != Role::RestrictedBot {
            y.bot_settings_mut().remove(uv);
        }
        obsolete_invites_for_member(y, uv, *role, ctx.seqno);
    }
}

fn key_section<'a>(ctx: &LinkContext<'a>) -> Result<&'a PerGroupKeySection, ValidationError> {
    ctx.team
        .per_team_key
        .as_ref()
        .ok_or_else(|| PolicyError::MissingSection(Section::PerGroupKey).into())
}

/// Validate a published per-group key. Returns the key to record, which for a re-seen
/// generation is the already known one.
fn check_key(
    y: &ChainState,
    section: &PerGroupKeySection,
    ctx: &LinkContext,
) -> Result<PerGroupKey, ValidationError> {
    let signature = section.reverse_sig.ok_or(ValidationError::MissingReverseSig)?;
    let input = reverse_sig_input(ctx.raw_payload()?)?;
    if !section.signing_kid.verify(&input, &signature) {
        return Err(ValidationError::InvalidReverseSig);
    }

    if let Some(existing) = y.key(section.generation) {
        if existing.signing_kid == section.signing_kid
            && existing.encryption_kid == section.encryption_kid
        {
            return Ok(existing.clone());
        }
        return Err(ValidationError::KeyMismatch(section.generation));
    }

    let expected = y.latest_generation() + 1;
    if section.generation != expected {
        return Err(ValidationError::InvalidKeyGeneration {
            expected,
            actual: section.generation,
        });
    }
    let reused = y.per_group_keys().values().any(|key| {
        key.signing_kid == section.signing_kid || key.encryption_kid == section.encryption_kid
    });
    if reused {
        return Err(ValidationError::KeyReused(section.generation));
    }

    Ok(PerGroupKey {
        generation: section.generation,
        seqno: ctx.seqno,
        signing_kid: section.signing_kid,
        encryption_kid: section.encryption_kid,
    })
}

fn record_box_summary(y: &mut ChainState, ctx: &LinkContext) {
    if let Some(hash) = &ctx.team.box_summary_hash {
        y.box_summary_hashes.insert(ctx.seqno, hash.clone());
    }
}

/// Sub-group named by a parent-side link, which must be a direct child of this group as the
/// group was named at the time of the link.
fn subgroup_section(y: &ChainState, ctx: &LinkContext) -> Result<(GroupId, GroupName), ValidationError> {
    let section = ctx.team.subteam.as_ref().ok_or(PolicyError::MissingSection(
        Section::Subgroup,
    ))?;
    if !section.id.is_subgroup() || section.id == y.id() {
        return Err(ValidationError::InvalidGroupId(section.id));
    }
    let name: GroupName = section.name.parse()?;
    if name.parent().as_ref() != Some(y.name_at(ctx.seqno)) {
        return Err(ValidationError::NotDirectChild(name.to_string()));
    }
    Ok((section.id, name))
}

/// Name of a sub-group which exists and is not deleted as of the link.
fn live_subgroup_name(y: &ChainState, id: &GroupId, ctx: &LinkContext) -> Result<String, ValidationError> {
    y.subgroup_log()
        .get(id)
        .and_then(|entries| entries.iter().rev().find(|entry| entry.seqno < ctx.seqno))
        .and_then(|entry| entry.name.clone())
        .ok_or(ValidationError::UnknownSubgroup(*id))
}

fn check_parent_pointer(y: &ChainState, ctx: &LinkContext) -> Result<(), ValidationError> {
    let parent = ctx.team.parent.as_ref().ok_or(PolicyError::MissingSection(
        Section::Parent,
    ))?;
    if Some(parent.id) != y.parent_id() {
        return Err(ValidationError::WrongParent {
            claimed: parent.id,
            actual: y.parent_id(),
        });
    }
    Ok(())
}

fn apply_settings(
    y: &mut ChainState,
    section: &SettingsSection,
    ctx: &LinkContext,
) -> Result<(), ValidationError> {
    let Some(open) = &section.open else {
        return Ok(());
    };
    let join_as = match open.join_as.as_deref() {
        None if !open.enabled => Role::Reader,
        Some("reader") => Role::Reader,
        Some("writer") => Role::Writer,
        other => return Err(ValidationError::InvalidJoinAs(other.unwrap_or_default().to_string())),
    };
    // A revealed link only wins over settings recorded by a later link if it is newer.
    if y.open.as_ref().is_some_and(|current| current.seqno > ctx.seqno) {
        return Ok(());
    }
    y.open = Some(OpenSettings {
        open: open.enabled,
        join_as,
        seqno: ctx.seqno,
    });
    Ok(())
}

fn apply_kbfs(y: &mut ChainState, section: &KbfsSection, ctx: &LinkContext) -> Result<(), ValidationError> {
    if let Some(tlf) = &section.tlf {
        if tlf.id.is_empty() {
            return Err(ValidationError::EmptyTlfId);
        }
        let position = y
            .tlf_ids
            .iter()
            .position(|entry| entry.seqno > ctx.seqno)
            .unwrap_or(y.tlf_ids.len());
        y.tlf_ids.insert(
            position,
            TlfEntry {
                id: tlf.id.clone(),
                seqno: ctx.seqno,
            },
        );
    }

    if let Some(keyset) = &section.keyset {
        let known = y
            .key(keyset.team_generation)
            .is_some_and(|key| key.seqno <= ctx.seqno);
        if !known {
            return Err(ValidationError::UnknownKeyGeneration(keyset.team_generation));
        }
        let upgrades = y.legacy_upgrades.entry(keyset.app_type).or_default();
        let position = upgrades
            .iter()
            .position(|entry| entry.seqno > ctx.seqno)
            .unwrap_or(upgrades.len());
        upgrades.insert(
            position,
            LegacyUpgrade {
                app_type: keyset.app_type,
                team_generation: keyset.team_generation,
                legacy_generation: keyset.legacy_generation,
                keyset_hash: keyset.keyset_hash.clone(),
                seqno: ctx.seqno,
            },
        );
    }

    Ok(())
}

/// The user is a restricted bot now and has been one without interruption since `seqno`.
fn still_restricted_bot_since(y: &ChainState, uv: &UserVersion, seqno: Seqno) -> bool {
    y.role(uv) == Role::RestrictedBot
        && y.user_log()
            .get(uv)
            .and_then(|points| points.last())
            .is_some_and(|point| point.sig_meta.location.seqno <= seqno)
}

fn set_bot_settings(y: &mut ChainState, uv: UserVersion, settings: &BotSettings, seqno: Seqno) {
    let newer_known = y
        .bot_settings()
        .get(&uv)
        .is_some_and(|entry| entry.seqno > seqno);
    if newer_known {
        return;
    }
    y.bot_settings_mut().insert(
        uv,
        BotSettingsEntry {
            settings: settings.clone(),
            seqno,
        },
    );
}
