// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replay of chain links into [`ChainState`] snapshots.
//!
//! [`ChainPlayer::append`] applies the next link of a chain, [`ChainPlayer::inflate`] supplies
//! the payload of a link which was applied stubbed earlier. Both are pure: the prior snapshot
//! is never touched and a failing link leaves no partial state behind.
mod members;
#[cfg(test)]
mod tests;
mod transitions;

use teamchain_core::{
    GroupId, IdError, InviteId, LinkType, PayloadError, SeqType, Seqno, SignatureMetadata,
    TeamSection, UnpackedLink, UserId, UserVersion,
};
use thiserror::Error;
use tracing::debug;

use crate::invites::InviteError;
use crate::policy::{Authorization, LinkRules, PolicyError, check_link_rules};
use crate::role::Role;
use crate::state::{ChainState, StateError};

/// Identity which signed a link, as established by the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signer {
    pub user: UserVersion,

    /// Signer proved to be admin of an ancestor group for this link.
    pub implicit_admin: bool,
}

impl Signer {
    pub fn new(user: UserVersion) -> Self {
        Self {
            user,
            implicit_admin: false,
        }
    }

    pub fn implicit_admin(user: UserVersion) -> Self {
        Self {
            user,
            implicit_admin: true,
        }
    }
}

/// Everything a transition needs to know about the link being applied.
pub(crate) struct LinkContext<'a> {
    pub link: &'a UnpackedLink,
    pub team: &'a TeamSection,
    pub signer: &'a Signer,
    pub sig_meta: SignatureMetadata,
    pub seqno: Seqno,

    /// Link is supplied after later links were already applied.
    pub reveal: bool,
}

impl<'a> LinkContext<'a> {
    fn new(link: &'a UnpackedLink, signer: &'a Signer, reveal: bool) -> Result<Self, ValidationError> {
        let (Some(payload), Some(sig_meta)) = (link.inner.as_ref(), link.signature_metadata()) else {
            return Err(ValidationError::MissingPayload);
        };
        let team = payload
            .body
            .team
            .as_ref()
            .ok_or(PolicyError::MissingTeamSection)?;
        if payload.body.key.uid != signer.user.uid {
            return Err(ValidationError::SignerMismatch {
                signer: signer.user,
                key_uid: payload.body.key.uid,
            });
        }
        Ok(Self {
            link,
            team,
            signer,
            sig_meta,
            seqno: link.seqno(),
            reveal,
        })
    }

    pub fn raw_payload(&self) -> Result<&'a str, ValidationError> {
        self.link
            .source
            .payload
            .as_deref()
            .ok_or(ValidationError::MissingPayload)
    }
}

/// Replays links of group chains.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainPlayer;

impl ChainPlayer {
    /// Apply the next link of a chain. `prior` is `None` for the first link.
    ///
    /// `signer` may only be omitted for stubbed or ignored links.
    pub fn append(
        prior: Option<&ChainState>,
        link: &UnpackedLink,
        signer: Option<&Signer>,
    ) -> Result<ChainState, PlayerError> {
        let seqno = link.seqno();
        let fail = |cause: ValidationError| PlayerError::Validation { seqno, cause };

        check_continuity(prior, link).map_err(fail)?;

        if link.is_stubbed() {
            let Some(y) = prior else {
                return Err(PlayerError::FirstLinkStubbed);
            };
            if !link.link_type.is_stubbable() {
                return Err(PlayerError::Stubbed {
                    seqno,
                    link_type: link.link_type,
                });
            }
            let mut next = y.clone();
            next.advance(link.link_id, seqno, false);
            next.mark_stubbed(seqno, link.link_type);
            debug!(group_id = %y.id(), seqno, link_type = %link.link_type, "append stubbed link");
            return Ok(next);
        }

        if let LinkType::Unsupported(_) = link.link_type {
            let Some(y) = prior else {
                return Err(fail(PolicyError::Unsupported(link.link_type).into()));
            };
            let mut next = y.clone();
            next.advance(link.link_id, seqno, false);
            debug!(group_id = %y.id(), seqno, link_type = %link.link_type, "skip unsupported link");
            return Ok(next);
        }

        let signer = signer.ok_or_else(|| fail(ValidationError::MissingSigner))?;
        let ctx = LinkContext::new(link, signer, false).map_err(fail)?;

        let Some(y) = prior else {
            check_link_rules(link.link_type, Some(ctx.team), ctx.team.implicit, true)
                .map_err(|err| fail(err.into()))?;
            let next = transitions::first(&ctx).map_err(fail)?;
            debug!(group_id = %next.id(), name = %next.name(), "start chain");
            return Ok(next);
        };

        let rules = check_link_rules(link.link_type, Some(ctx.team), y.is_implicit(), false)
            .map_err(|err| fail(err.into()))?;
        check_group(y, &ctx).map_err(fail)?;
        authorize(y, &rules, &ctx).map_err(fail)?;

        if matches!(
            link.link_type,
            LinkType::DeleteRoot | LinkType::DeleteUpPointer
        ) {
            transitions::check_deletion(y, &ctx).map_err(fail)?;
            debug!(group_id = %y.id(), seqno, link_type = %link.link_type, "group deleted");
            return Err(PlayerError::GroupDeleted {
                group_id: y.id(),
                seqno,
            });
        }

        let mut next = transitions::apply(y.clone(), &ctx)
            .map_err(|cause| withheld_invite(y, seqno, cause))?;
        let high = y.role_at(&signer.user, seqno - 1).is_admin_or_above() || signer.implicit_admin;
        next.advance(link.link_id, seqno, high);
        debug!(group_id = %y.id(), seqno, link_type = %link.link_type, high, "append link");
        Ok(next)
    }

    /// Supply the payload of a link which was appended stubbed.
    ///
    /// The result equals the state an in-order replay with the payload present would have
    /// produced.
    pub fn inflate(
        prior: &ChainState,
        link: &UnpackedLink,
        signer: &Signer,
    ) -> Result<ChainState, PlayerError> {
        let seqno = link.seqno();
        let fail = |cause: ValidationError| PlayerError::Validation { seqno, cause };

        if seqno == 0 || seqno > prior.last_seqno() {
            return Err(PlayerError::NotInChain { seqno });
        }
        if !prior.is_stubbed(seqno) {
            return Err(PlayerError::AlreadyInflated { seqno });
        }
        if prior.link_id(seqno) != Some(link.link_id) {
            return Err(PlayerError::InflateMismatch { seqno });
        }
        if link.is_stubbed() {
            return Err(PlayerError::Stubbed {
                seqno,
                link_type: link.link_type,
            });
        }

        let ctx = LinkContext::new(link, signer, true).map_err(fail)?;
        let rules = check_link_rules(link.link_type, Some(ctx.team), prior.is_implicit(), false)
            .map_err(|err| fail(err.into()))?;
        if !rules.allow_inflate {
            return Err(PlayerError::Stubbed {
                seqno,
                link_type: link.link_type,
            });
        }
        check_group(prior, &ctx).map_err(fail)?;
        authorize(prior, &rules, &ctx).map_err(fail)?;

        let mut next = transitions::apply(prior.clone(), &ctx)
            .map_err(|cause| withheld_invite(prior, seqno, cause))?;
        next.clear_stubbed(seqno);
        debug!(group_id = %prior.id(), seqno, link_type = %link.link_type, "inflate link");
        Ok(next)
    }
}

/// An unknown invite may live in a link whose payload was withheld. Such failures are reported
/// together with the stubbed invite links which could define it.
fn withheld_invite(y: &ChainState, seqno: Seqno, cause: ValidationError) -> PlayerError {
    if let ValidationError::Invite(InviteError::UnknownInvite(invite)) = &cause {
        let needed: Vec<Seqno> = y
            .stubbed_links()
            .iter()
            .filter(|(_, link_type)| matches!(link_type, LinkType::Invite))
            .map(|(seqno, _)| *seqno)
            .collect();
        if !needed.is_empty() {
            return PlayerError::StubbedInvite {
                seqno,
                invite: invite.clone(),
                needed,
            };
        }
    }
    PlayerError::Validation { seqno, cause }
}

fn check_continuity(prior: Option<&ChainState>, link: &UnpackedLink) -> Result<(), ValidationError> {
    let (expected_seqno, expected_prev) = match prior {
        Some(y) => (y.last_seqno() + 1, Some(y.last_link_id())),
        None => (1, None),
    };
    if link.seqno() != expected_seqno {
        return Err(ValidationError::UnexpectedSeqno {
            expected: expected_seqno,
            actual: link.seqno(),
        });
    }
    if link.prev() != expected_prev {
        return Err(ValidationError::PrevMismatch);
    }
    if let Some(y) = prior {
        if link.outer.seq_type != SeqType::for_group(y.is_public()) {
            return Err(ValidationError::SeqTypeMismatch);
        }
    }
    Ok(())
}

fn check_group(y: &ChainState, ctx: &LinkContext) -> Result<(), ValidationError> {
    match ctx.team.id {
        Some(id) if id == y.id() => Ok(()),
        Some(id) => Err(ValidationError::WrongGroup {
            claimed: id,
            actual: y.id(),
        }),
        None => Err(PolicyError::MissingGroupId.into()),
    }
}

/// Check the signer's role as of the link before this one.
fn authorize(y: &ChainState, rules: &LinkRules, ctx: &LinkContext) -> Result<(), ValidationError> {
    let Authorization::AtLeast {
        role,
        implicit_admin,
    } = rules.authorization
    else {
        return Ok(());
    };
    let actual = y.role_at(&ctx.signer.user, ctx.seqno - 1);
    if actual >= role || (implicit_admin && ctx.signer.implicit_admin) {
        return Ok(());
    }
    Err(ValidationError::InsufficientRole {
        user: ctx.signer.user,
        required: role,
        actual,
    })
}

/// Broad classes of validation failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Link is malformed or violates the rules of its type.
    Structural,

    /// Signer lacks the required rights.
    Authorization,

    /// Link contradicts the current state of the group.
    Consistency,
}

/// Reason why a link was rejected.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("expected seqno {expected}, got {actual}")]
    UnexpectedSeqno { expected: Seqno, actual: Seqno },

    #[error("prev does not point at the previous link")]
    PrevMismatch,

    #[error("seq type does not match the group's visibility")]
    SeqTypeMismatch,

    #[error("link claims group {claimed} but the chain belongs to {actual}")]
    WrongGroup { claimed: GroupId, actual: GroupId },

    #[error("link payload is missing")]
    MissingPayload,

    #[error("unstubbed link has no signer")]
    MissingSigner,

    #[error("signer {signer} does not match payload key uid {key_uid}")]
    SignerMismatch { signer: UserVersion, key_uid: UserId },

    #[error("{user} has role {actual} but {required} is required")]
    InsufficientRole {
        user: UserVersion,
        required: Role,
        actual: Role,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Invite(#[from] InviteError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("invalid name: {0}")]
    InvalidName(#[from] IdError),

    #[error("group id {0} does not fit the link type")]
    InvalidGroupId(GroupId),

    #[error("visibility flag does not match group id")]
    PublicMismatch,

    #[error("implicit flag does not match group name")]
    ImplicitMismatch,

    #[error("root link names no owners")]
    RootWithoutOwners,

    #[error("root link signer {0} is not an owner")]
    RootSignerNotOwner(UserVersion),

    #[error("implicit groups cannot assign role {0}")]
    ImplicitGroupRole(Role),

    #[error("sub-groups cannot have owners")]
    SubgroupOwners,

    #[error("link cannot remove members")]
    UnexpectedRemovals,

    #[error("{0} appears more than once")]
    DuplicateMember(UserVersion),

    #[error("uid {0} is added more than once")]
    DuplicateUid(UserId),

    #[error("only owners can add or demote owner {0}")]
    OwnerChangeNotAllowed(UserVersion),

    #[error("reset of {0} must increase the eldest seqno")]
    ImplicitReset(UserVersion),

    #[error("removal of {0} is not paired with a reset")]
    UnpairedRemoval(UserVersion),

    #[error("implicit groups cannot change the role of {0}")]
    ImplicitRoleChange(UserVersion),

    #[error("{0} joins the implicit group without an invite")]
    UninvitedAddition(UserVersion),

    #[error("{0} may resolve at most one invite and only when joining")]
    UnexpectedInvite(UserVersion),

    #[error("expected key generation {expected}, got {actual}")]
    InvalidKeyGeneration { expected: u64, actual: u64 },

    #[error("key generation {0} is already known with different keys")]
    KeyMismatch(u64),

    #[error("key of generation {0} reuses a known key")]
    KeyReused(u64),

    #[error("per-group key reverse signature is missing")]
    MissingReverseSig,

    #[error("per-group key reverse signature is invalid")]
    InvalidReverseSig,

    #[error("the last owner cannot leave")]
    LastOwnerLeaving,

    #[error("sub-group {0} already exists")]
    SubgroupExists(GroupId),

    #[error("a sub-group named '{0}' already exists")]
    SubgroupNameTaken(String),

    #[error("unknown sub-group {0}")]
    UnknownSubgroup(GroupId),

    #[error("sub-group {0} has a different name")]
    SubgroupNameMismatch(GroupId),

    #[error("name {0} is not a direct child of this group")]
    NotDirectChild(String),

    #[error("link points at parent {claimed} but the group's parent is {actual:?}")]
    WrongParent {
        claimed: GroupId,
        actual: Option<GroupId>,
    },

    #[error("sub-groups cannot be moved to another parent")]
    RenameMustKeepParent,

    #[error("only root groups can be deleted with a root deletion")]
    DeleteRootOfSubgroup,

    #[error("implicit groups have no settings")]
    ImplicitSettings,

    #[error("invalid open join role '{0}'")]
    InvalidJoinAs(String),

    #[error("empty folder id")]
    EmptyTlfId,

    #[error("unknown key generation {0}")]
    UnknownKeyGeneration(u64),

    #[error("{0} is not a restricted bot")]
    NotRestrictedBot(UserVersion),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::Policy(_)
            | ValidationError::UnexpectedSeqno { .. }
            | ValidationError::PrevMismatch
            | ValidationError::SeqTypeMismatch
            | ValidationError::WrongGroup { .. }
            | ValidationError::MissingPayload
            | ValidationError::MissingSigner
            | ValidationError::Payload(_)
            | ValidationError::InvalidName(_)
            | ValidationError::DuplicateMember(_)
            | ValidationError::DuplicateUid(_)
            | ValidationError::MissingReverseSig
            | ValidationError::InvalidReverseSig => ErrorKind::Structural,
            ValidationError::SignerMismatch { .. }
            | ValidationError::InsufficientRole { .. }
            | ValidationError::State(StateError::InsufficientRole { .. })
            | ValidationError::State(StateError::NotAdmin { .. })
            | ValidationError::RootSignerNotOwner(_)
            | ValidationError::OwnerChangeNotAllowed(_)
            | ValidationError::Invite(InviteError::OwnerInviteNotAllowed(_)) => {
                ErrorKind::Authorization
            }
            _ => ErrorKind::Consistency,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("invalid link at seqno {seqno}: {cause}")]
    Validation {
        seqno: Seqno,
        #[source]
        cause: ValidationError,
    },

    #[error("link at seqno {seqno} of type {link_type} is stubbed")]
    Stubbed { seqno: Seqno, link_type: LinkType },

    #[error("link at seqno {seqno} resolves invite {invite} which may be in stubbed links {needed:?}")]
    StubbedInvite {
        seqno: Seqno,
        invite: InviteId,
        needed: Vec<Seqno>,
    },

    #[error("the first link of a chain cannot be stubbed")]
    FirstLinkStubbed,

    #[error("link at seqno {seqno} is not stubbed")]
    AlreadyInflated { seqno: Seqno },

    #[error("link at seqno {seqno} is not part of the chain yet")]
    NotInChain { seqno: Seqno },

    #[error("link at seqno {seqno} does not match the committed link id")]
    InflateMismatch { seqno: Seqno },

    #[error("group {group_id} was deleted at seqno {seqno}")]
    GroupDeleted { group_id: GroupId, seqno: Seqno },
}

impl PlayerError {
    pub fn seqno(&self) -> Option<Seqno> {
        match self {
            PlayerError::Validation { seqno, .. }
            | PlayerError::Stubbed { seqno, .. }
            | PlayerError::StubbedInvite { seqno, .. }
            | PlayerError::AlreadyInflated { seqno }
            | PlayerError::NotInChain { seqno }
            | PlayerError::InflateMismatch { seqno }
            | PlayerError::GroupDeleted { seqno, .. } => Some(*seqno),
            PlayerError::FirstLinkStubbed => Some(1),
        }
    }

    pub fn cause(&self) -> Option<&ValidationError> {
        match self {
            PlayerError::Validation { cause, .. } => Some(cause),
            _ => None,
        }
    }
}
