// SPDX-License-Identifier: MIT OR Apache-2.0

//! Static per-link-type rules on which payload sections may appear and who may sign.
use std::fmt::Display;

use teamchain_core::{LinkType, TeamSection};
use thiserror::Error;

use crate::role::Role;

/// Whether a payload section must, may or must not appear.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rule {
    Disallow,
    Require,
    Optional,
}

/// Optional sections of the team part of a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Name,
    Members,
    Parent,
    Subgroup,
    PerGroupKey,
    Admin,
    Invites,
    CompletedInvites,
    Settings,
    Kbfs,
    BoxSummaryHash,
    BotSettings,
}

impl Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Section::Name => "name",
            Section::Members => "members",
            Section::Parent => "parent",
            Section::Subgroup => "subteam",
            Section::PerGroupKey => "per_team_key",
            Section::Admin => "admin",
            Section::Invites => "invites",
            Section::CompletedInvites => "completed_invites",
            Section::Settings => "settings",
            Section::Kbfs => "kbfs",
            Section::BoxSummaryHash => "box_summary_hash",
            Section::BotSettings => "bot_settings",
        };

        write!(f, "{}", s)
    }
}

/// Who may sign a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authorization {
    /// Checked by dedicated logic of the link type, if at all.
    Unchecked,

    /// Signer needs at least `role` before the link. If `implicit_admin` is set, an admin of an
    /// ancestor group is accepted as well.
    AtLeast { role: Role, implicit_admin: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkRules {
    pub name: Rule,
    pub members: Rule,
    pub parent: Rule,
    pub subgroup: Rule,
    pub per_group_key: Rule,
    pub admin: Rule,
    pub invites: Rule,
    pub completed_invites: Rule,
    pub settings: Rule,
    pub kbfs: Rule,
    pub box_summary_hash: Rule,
    pub bot_settings: Rule,
    pub allow_in_implicit_group: bool,

    /// Link may be stubbed and its payload supplied later.
    pub allow_inflate: bool,
    pub first_in_chain: bool,
    pub authorization: Authorization,
}

const BASE: LinkRules = LinkRules {
    name: Rule::Disallow,
    members: Rule::Disallow,
    parent: Rule::Disallow,
    subgroup: Rule::Disallow,
    per_group_key: Rule::Disallow,
    admin: Rule::Optional,
    invites: Rule::Disallow,
    completed_invites: Rule::Disallow,
    settings: Rule::Disallow,
    kbfs: Rule::Disallow,
    box_summary_hash: Rule::Disallow,
    bot_settings: Rule::Disallow,
    allow_in_implicit_group: false,
    allow_inflate: false,
    first_in_chain: false,
    authorization: Authorization::AtLeast {
        role: Role::Admin,
        implicit_admin: true,
    },
};

/// Rules for a link type, `None` for types this implementation does not know.
pub fn rules(link_type: LinkType) -> Option<LinkRules> {
    let rules = match link_type {
        LinkType::Root => LinkRules {
            name: Rule::Require,
            members: Rule::Require,
            per_group_key: Rule::Require,
            admin: Rule::Disallow,
            invites: Rule::Optional,
            settings: Rule::Optional,
            kbfs: Rule::Optional,
            box_summary_hash: Rule::Optional,
            allow_in_implicit_group: true,
            first_in_chain: true,
            authorization: Authorization::Unchecked,
            ..BASE
        },
        LinkType::ChangeMembership => LinkRules {
            members: Rule::Require,
            per_group_key: Rule::Optional,
            completed_invites: Rule::Optional,
            box_summary_hash: Rule::Optional,
            allow_in_implicit_group: true,
            ..BASE
        },
        LinkType::RotateKey => LinkRules {
            per_group_key: Rule::Require,
            box_summary_hash: Rule::Optional,
            allow_in_implicit_group: true,
            authorization: Authorization::AtLeast {
                role: Role::Writer,
                implicit_admin: true,
            },
            ..BASE
        },
        LinkType::Leave => LinkRules {
            admin: Rule::Disallow,
            authorization: Authorization::AtLeast {
                role: Role::Bot,
                implicit_admin: false,
            },
            ..BASE
        },
        LinkType::NewSubgroup => LinkRules {
            subgroup: Rule::Require,
            allow_inflate: true,
            ..BASE
        },
        LinkType::SubgroupHead => LinkRules {
            name: Rule::Require,
            members: Rule::Optional,
            parent: Rule::Require,
            per_group_key: Rule::Require,
            admin: Rule::Require,
            settings: Rule::Optional,
            box_summary_hash: Rule::Optional,
            first_in_chain: true,
            authorization: Authorization::Unchecked,
            ..BASE
        },
        LinkType::RenameSubgroup => LinkRules {
            subgroup: Rule::Require,
            allow_inflate: true,
            ..BASE
        },
        LinkType::RenameUpPointer => LinkRules {
            name: Rule::Require,
            parent: Rule::Require,
            ..BASE
        },
        LinkType::DeleteSubgroup => LinkRules {
            subgroup: Rule::Require,
            allow_inflate: true,
            ..BASE
        },
        LinkType::DeleteUpPointer => LinkRules {
            name: Rule::Require,
            parent: Rule::Require,
            ..BASE
        },
        LinkType::DeleteRoot => LinkRules {
            admin: Rule::Disallow,
            allow_in_implicit_group: true,
            authorization: Authorization::AtLeast {
                role: Role::Owner,
                implicit_admin: false,
            },
            ..BASE
        },
        LinkType::Invite => LinkRules {
            invites: Rule::Require,
            allow_in_implicit_group: true,
            allow_inflate: true,
            ..BASE
        },
        LinkType::Settings => LinkRules {
            settings: Rule::Require,
            allow_inflate: true,
            ..BASE
        },
        LinkType::KbfsUpgrade => LinkRules {
            kbfs: Rule::Require,
            allow_in_implicit_group: true,
            allow_inflate: true,
            authorization: Authorization::AtLeast {
                role: Role::Writer,
                implicit_admin: true,
            },
            ..BASE
        },
        LinkType::BotSettings => LinkRules {
            bot_settings: Rule::Require,
            allow_in_implicit_group: true,
            allow_inflate: true,
            ..BASE
        },
        LinkType::Unsupported(_) => return None,
    };
    Some(rules)
}

fn check_rule(section: Section, rule: Rule, present: bool) -> Result<(), PolicyError> {
    match (rule, present) {
        (Rule::Require, false) => Err(PolicyError::MissingSection(section)),
        (Rule::Disallow, true) => Err(PolicyError::UnexpectedSection(section)),
        _ => Ok(()),
    }
}

/// Check the structure of an unstubbed link against the rules of its type.
///
/// `first` is set when the link has no predecessor in its chain.
pub fn check_link_rules(
    link_type: LinkType,
    team: Option<&TeamSection>,
    implicit_group: bool,
    first: bool,
) -> Result<LinkRules, PolicyError> {
    let rules = rules(link_type).ok_or(PolicyError::Unsupported(link_type))?;
    let team = team.ok_or(PolicyError::MissingTeamSection)?;

    if team.id.is_none() {
        return Err(PolicyError::MissingGroupId);
    }
    if implicit_group && !rules.allow_in_implicit_group {
        return Err(PolicyError::NotAllowedInImplicitGroup(link_type));
    }
    match (rules.first_in_chain, first) {
        (true, false) => return Err(PolicyError::MustBeFirst(link_type)),
        (false, true) => return Err(PolicyError::CannotBeFirst(link_type)),
        _ => (),
    }

    check_rule(Section::Name, rules.name, team.name.is_some())?;
    check_rule(Section::Members, rules.members, team.members.is_some())?;
    check_rule(Section::Parent, rules.parent, team.parent.is_some())?;
    check_rule(Section::Subgroup, rules.subgroup, team.subteam.is_some())?;
    check_rule(
        Section::PerGroupKey,
        rules.per_group_key,
        team.per_team_key.is_some(),
    )?;
    check_rule(Section::Admin, rules.admin, team.admin.is_some())?;
    check_rule(Section::Invites, rules.invites, team.invites.is_some())?;
    check_rule(
        Section::CompletedInvites,
        rules.completed_invites,
        team.completed_invites.is_some() || team.used_invites.is_some(),
    )?;
    check_rule(Section::Settings, rules.settings, team.settings.is_some())?;
    check_rule(Section::Kbfs, rules.kbfs, team.kbfs.is_some())?;
    check_rule(
        Section::BoxSummaryHash,
        rules.box_summary_hash,
        team.box_summary_hash.is_some(),
    )?;
    check_rule(
        Section::BotSettings,
        rules.bot_settings,
        team.bot_settings.is_some(),
    )?;

    Ok(rules)
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("link type {0} is not supported")]
    Unsupported(LinkType),

    #[error("payload has no team section")]
    MissingTeamSection,

    #[error("payload does not name a group id")]
    MissingGroupId,

    #[error("link type {0} is not allowed in implicit groups")]
    NotAllowedInImplicitGroup(LinkType),

    #[error("link type {0} must be the first link of a chain")]
    MustBeFirst(LinkType),

    #[error("link type {0} cannot be the first link of a chain")]
    CannotBeFirst(LinkType),

    #[error("missing required section '{0}'")]
    MissingSection(Section),

    #[error("section '{0}' is not allowed in this link type")]
    UnexpectedSection(Section),
}

#[cfg(test)]
mod tests {
    use teamchain_core::payload::{MembersSection, PerGroupKeySection, SubgroupSection};
    use teamchain_core::{GroupId, GroupName, KeyId, LinkType, PrivateKey, TeamSection};

    use crate::role::Role;

    use super::{Authorization, PolicyError, Section, check_link_rules, rules};

    fn base_team() -> TeamSection {
        let name: GroupName = "acme".parse().unwrap();
        TeamSection {
            id: Some(name.to_root_group_id(false).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn stubbable_types_may_be_inflated() {
        for link_type in LinkType::ALL {
            assert_eq!(
                rules(link_type).unwrap().allow_inflate,
                link_type.is_stubbable(),
                "{link_type}"
            );
        }
        assert!(rules(LinkType::Unsupported(99)).is_none());
    }

    #[test]
    fn required_and_disallowed_sections() {
        let mut team = base_team();
        assert!(matches!(
            check_link_rules(LinkType::ChangeMembership, Some(&team), false, false),
            Err(PolicyError::MissingSection(Section::Members))
        ));

        team.members = Some(MembersSection::default());
        assert!(check_link_rules(LinkType::ChangeMembership, Some(&team), false, false).is_ok());

        team.subteam = Some(SubgroupSection {
            id: GroupId::new_subgroup([2; 15], false),
            name: "acme.dev".to_string(),
        });
        assert!(matches!(
            check_link_rules(LinkType::ChangeMembership, Some(&team), false, false),
            Err(PolicyError::UnexpectedSection(Section::Subgroup))
        ));

        assert!(matches!(
            check_link_rules(LinkType::Leave, None, false, false),
            Err(PolicyError::MissingTeamSection)
        ));
    }

    #[test]
    fn chain_position() {
        let mut team = base_team();
        team.name = Some("acme".to_string());
        team.members = Some(MembersSection::default());
        team.per_team_key = Some(PerGroupKeySection {
            generation: 1,
            encryption_kid: KeyId::from_bytes([3; 32]),
            signing_kid: PrivateKey::new().public_key(),
            reverse_sig: None,
        });
        assert!(check_link_rules(LinkType::Root, Some(&team), false, true).is_ok());
        assert!(matches!(
            check_link_rules(LinkType::Root, Some(&team), false, false),
            Err(PolicyError::MustBeFirst(LinkType::Root))
        ));

        let team = base_team();
        assert!(matches!(
            check_link_rules(LinkType::Leave, Some(&team), false, true),
            Err(PolicyError::CannotBeFirst(LinkType::Leave))
        ));
    }

    #[test]
    fn implicit_groups() {
        let team = base_team();
        assert!(matches!(
            check_link_rules(LinkType::Leave, Some(&team), true, false),
            Err(PolicyError::NotAllowedInImplicitGroup(LinkType::Leave))
        ));
        assert!(!rules(LinkType::NewSubgroup).unwrap().allow_in_implicit_group);
        assert!(rules(LinkType::Invite).unwrap().allow_in_implicit_group);
    }

    #[test]
    fn authorization() {
        assert_eq!(
            rules(LinkType::DeleteRoot).unwrap().authorization,
            Authorization::AtLeast {
                role: Role::Owner,
                implicit_admin: false
            }
        );
        assert_eq!(
            rules(LinkType::RotateKey).unwrap().authorization,
            Authorization::AtLeast {
                role: Role::Writer,
                implicit_admin: true
            }
        );
        assert_eq!(
            rules(LinkType::SubgroupHead).unwrap().authorization,
            Authorization::Unchecked
        );
    }
}
