// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Roles which can be assigned to a member of a group. Greater roles are assumed to also contain
/// all permissions of the lower ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Not a member.
    #[default]
    None,

    /// Bot restricted to explicitly configured conversations.
    RestrictedBot,

    /// Bot with read access.
    Bot,

    /// Permission to read group data.
    Reader,

    /// Permission to write group data and rotate the group key.
    Writer,

    /// Permission to change membership, invite and manage sub-groups.
    Admin,

    /// Permission to manage other owners and delete the group.
    Owner,
}

impl Role {
    /// All roles a member can hold, lowest first.
    pub const MEMBER_ROLES: [Role; 6] = [
        Role::RestrictedBot,
        Role::Bot,
        Role::Reader,
        Role::Writer,
        Role::Admin,
        Role::Owner,
    ];

    pub fn is_member(&self) -> bool {
        !matches!(self, Role::None)
    }

    pub fn is_bot_like(&self) -> bool {
        matches!(self, Role::Bot | Role::RestrictedBot)
    }

    pub fn is_reader_or_above(&self) -> bool {
        *self >= Role::Reader
    }

    pub fn is_writer_or_above(&self) -> bool {
        *self >= Role::Writer
    }

    pub fn is_admin_or_above(&self) -> bool {
        *self >= Role::Admin
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, Role::Owner)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::None => "none",
            Role::RestrictedBot => "restricted_bot",
            Role::Bot => "bot",
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Admin => "admin",
            Role::Owner => "owner",
        };

        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::Role;

    #[test]
    fn ordering() {
        assert!(Role::Owner > Role::Admin);
        assert!(Role::Admin > Role::Writer);
        assert!(Role::Writer > Role::Reader);
        assert!(Role::Reader > Role::Bot);
        assert!(Role::Bot > Role::RestrictedBot);
        assert!(Role::RestrictedBot > Role::None);
    }

    #[test]
    fn predicates() {
        assert!(Role::Admin.is_admin_or_above());
        assert!(!Role::Writer.is_admin_or_above());
        assert!(Role::Writer.is_writer_or_above());
        assert!(Role::Bot.is_bot_like());
        assert!(Role::RestrictedBot.is_bot_like());
        assert!(!Role::Reader.is_bot_like());
        assert!(!Role::None.is_member());
        assert!(!Role::Bot.is_reader_or_above());
        assert_eq!(Role::RestrictedBot.to_string(), "restricted_bot");
    }
}
