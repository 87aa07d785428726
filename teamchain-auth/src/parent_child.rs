// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cross checks between the links of a sub-group and the parent links they point at.
//!
//! A sub-group chain claims in its head and rename links that a certain parent link created or
//! renamed it. These claims are collected while replaying the child and checked against the
//! parent's sub-group log once both chains are loaded.
use teamchain_core::{GroupId, GroupName, IdError, LinkType, Seqno, UnpackedLink};
use thiserror::Error;

use crate::state::ChainState;

/// Claim of a child link about the parent link which named it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentChildOperation {
    pub parent_seqno: Seqno,
    pub name: GroupName,
}

/// Extract the claim of a sub-group head or rename-up-pointer link.
///
/// Returns `Ok(None)` for all other links and for stubbed links.
pub fn parent_child_operation(
    link: &UnpackedLink,
) -> Result<Option<ParentChildOperation>, ParentChildError> {
    if !matches!(
        link.link_type,
        LinkType::SubgroupHead | LinkType::RenameUpPointer
    ) {
        return Ok(None);
    }
    let Some(team) = link.team() else {
        return Ok(None);
    };

    let parent = team
        .parent
        .as_ref()
        .ok_or(ParentChildError::MissingParent(link.seqno()))?;
    let name = team
        .name
        .as_deref()
        .ok_or(ParentChildError::MissingName(link.seqno()))?
        .parse()?;

    Ok(Some(ParentChildOperation {
        parent_seqno: parent.seqno,
        name,
    }))
}

/// Check every claim of `child` against the sub-group log of `parent`.
pub fn check_parent_child_operations(
    parent: &ChainState,
    child: &ChainState,
    operations: &[ParentChildOperation],
) -> Result<(), ParentChildError> {
    if child.parent_id() != Some(parent.id()) {
        return Err(ParentChildError::WrongParent {
            parent: parent.id(),
            child: child.id(),
        });
    }

    for operation in operations {
        let seqno = operation.parent_seqno;
        if parent.is_stubbed(seqno) {
            return Err(ParentChildError::ParentLinkStubbed(seqno));
        }
        if !parent.is_link_fully_present(seqno) {
            return Err(ParentChildError::ParentLinkMissing(seqno));
        }

        let entry = parent
            .subgroup_entry_at(&child.id(), seqno)
            .ok_or(ParentChildError::NoSubgroupEntry {
                child: child.id(),
                seqno,
            })?;
        if entry.name.as_deref() != Some(operation.name.last_part()) {
            return Err(ParentChildError::NameMismatch {
                name: operation.name.to_string(),
                seqno,
            });
        }

        let parent_name = parent.name_at(seqno);
        if operation.name.root_ancestor() != parent_name.root_ancestor()
            || operation.name.depth() != parent_name.depth() + 1
        {
            return Err(ParentChildError::NotDirectChild {
                name: operation.name.to_string(),
                parent: parent_name.to_string(),
            });
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum ParentChildError {
    #[error("link {0} has no parent section")]
    MissingParent(Seqno),

    #[error("link {0} has no name")]
    MissingName(Seqno),

    #[error(transparent)]
    InvalidName(#[from] IdError),

    #[error("{child} is not a sub-group of {parent}")]
    WrongParent { parent: GroupId, child: GroupId },

    #[error("parent link {0} is stubbed")]
    ParentLinkStubbed(Seqno),

    #[error("parent link {0} is not part of the loaded chain")]
    ParentLinkMissing(Seqno),

    #[error("parent link {seqno} does not mention sub-group {child}")]
    NoSubgroupEntry { child: GroupId, seqno: Seqno },

    #[error("parent link {seqno} names the sub-group differently than {name}")]
    NameMismatch { name: String, seqno: Seqno },

    #[error("{name} is not a direct child of {parent}")]
    NotDirectChild { name: String, parent: String },
}

impl ParentChildError {
    /// The parent chain needs the payload of a stubbed link to complete the check.
    pub fn stubbed_seqno(&self) -> Option<Seqno> {
        match self {
            ParentChildError::ParentLinkStubbed(seqno) => Some(*seqno),
            _ => None,
        }
    }
}
