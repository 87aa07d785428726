// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group, user and name identifiers.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::Hash;
use crate::serde::{deserialize_array, serialize_hex};

/// 1-based position of a link in a chain.
pub type Seqno = u64;

/// Size of group and user ids.
pub const ID_LEN: usize = 16;

/// Type suffix of a private root group id.
pub const PRIVATE_ROOT_SUFFIX: u8 = 0x24;

/// Type suffix of a public root group id.
pub const PUBLIC_ROOT_SUFFIX: u8 = 0x2e;

/// Type suffix of a private sub-group id.
pub const PRIVATE_SUB_SUFFIX: u8 = 0x25;

/// Type suffix of a public sub-group id.
pub const PUBLIC_SUB_SUFFIX: u8 = 0x2f;

/// Prefix of the reserved names given to implicit groups.
pub const IMPLICIT_NAME_PREFIX: &str = "__implicit_group__";

const NAME_PART_MIN_LEN: usize = 2;
const NAME_PART_MAX_LEN: usize = 16;

/// 16-byte group identifier, the last byte encodes whether the group is public and whether it is
/// a sub-group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId([u8; ID_LEN]);

impl GroupId {
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Result<Self, IdError> {
        match bytes[ID_LEN - 1] {
            PRIVATE_ROOT_SUFFIX | PUBLIC_ROOT_SUFFIX | PRIVATE_SUB_SUFFIX | PUBLIC_SUB_SUFFIX => {
                Ok(Self(bytes))
            }
            suffix => Err(IdError::InvalidGroupSuffix(suffix)),
        }
    }

    /// Derive a sub-group id from random or hashed bytes.
    pub fn new_subgroup(seed: [u8; ID_LEN - 1], public: bool) -> Self {
        Self::with_suffix(
            seed,
            if public {
                PUBLIC_SUB_SUFFIX
            } else {
                PRIVATE_SUB_SUFFIX
            },
        )
    }

    fn with_suffix(seed: [u8; ID_LEN - 1], suffix: u8) -> Self {
        let mut bytes = [0u8; ID_LEN];
        bytes[..ID_LEN - 1].copy_from_slice(&seed);
        bytes[ID_LEN - 1] = suffix;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn is_public(&self) -> bool {
        matches!(self.0[ID_LEN - 1], PUBLIC_ROOT_SUFFIX | PUBLIC_SUB_SUFFIX)
    }

    pub fn is_subgroup(&self) -> bool {
        matches!(self.0[ID_LEN - 1], PRIVATE_SUB_SUFFIX | PUBLIC_SUB_SUFFIX)
    }

    pub fn is_root(&self) -> bool {
        !self.is_subgroup()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupId").field(&hex::encode(self.0)).finish()
    }
}

impl FromStr for GroupId {
    type Err = IdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; ID_LEN] = hex::decode(value)?
            .try_into()
            .map_err(|_| IdError::InvalidLength)?;
        Self::from_bytes(bytes)
    }
}

impl Serialize for GroupId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_array(deserializer)?;
        Self::from_bytes(bytes).map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

/// Validated, lowercased hierarchical group name, for example `acme.dev.infra`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupName(Vec<String>);

impl GroupName {
    /// Reserved name of an implicit group, derived from its display hash.
    pub fn implicit(display_hash: &[u8; ID_LEN]) -> Self {
        Self(vec![format!("{IMPLICIT_NAME_PREFIX}{}", hex::encode(display_hash))])
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.depth() == 1
    }

    pub fn is_implicit(&self) -> bool {
        self.is_root() && self.0[0].starts_with(IMPLICIT_NAME_PREFIX)
    }

    pub fn last_part(&self) -> &str {
        // Names are never empty after parsing.
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn root_ancestor(&self) -> GroupName {
        Self(self.0[..1].to_vec())
    }

    pub fn parent(&self) -> Option<GroupName> {
        if self.is_root() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Append a part to this name, yielding the name of a direct sub-group.
    pub fn child(&self, part: &str) -> Result<GroupName, IdError> {
        validate_part(part)?;
        let mut parts = self.0.clone();
        parts.push(part.to_lowercase());
        Ok(Self(parts))
    }

    pub fn is_ancestor_of(&self, other: &GroupName) -> bool {
        self.depth() < other.depth() && other.0.starts_with(&self.0)
    }

    /// The id a root group with this name is required to have.
    pub fn to_root_group_id(&self, public: bool) -> Result<GroupId, IdError> {
        if !self.is_root() {
            return Err(IdError::NotRootName(self.to_string()));
        }
        let hash = Hash::new(self.0[0].as_bytes());
        let mut seed = [0u8; ID_LEN - 1];
        seed.copy_from_slice(&hash.as_bytes()[..ID_LEN - 1]);
        Ok(GroupId::with_suffix(
            seed,
            if public {
                PUBLIC_ROOT_SUFFIX
            } else {
                PRIVATE_ROOT_SUFFIX
            },
        ))
    }
}

fn validate_part(part: &str) -> Result<(), IdError> {
    let invalid = || IdError::InvalidNamePart(part.to_string());
    if part.len() < NAME_PART_MIN_LEN || part.len() > NAME_PART_MAX_LEN {
        return Err(invalid());
    }
    if part.starts_with('_') || part.contains("__") {
        return Err(invalid());
    }
    if !part
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(invalid());
    }
    Ok(())
}

fn is_implicit_part(part: &str) -> bool {
    part.strip_prefix(IMPLICIT_NAME_PREFIX)
        .is_some_and(|rest| rest.len() == ID_LEN * 2 && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

impl FromStr for GroupName {
    type Err = IdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lowercased = value.to_lowercase();
        if is_implicit_part(&lowercased) {
            return Ok(Self(vec![lowercased]));
        }
        let parts: Vec<String> = lowercased.split('.').map(str::to_string).collect();
        for part in &parts {
            validate_part(part)?;
        }
        Ok(Self(parts))
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl fmt::Debug for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupName").field(&self.to_string()).finish()
    }
}

impl Serialize for GroupName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GroupName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse()
            .map_err(|err: IdError| serde::de::Error::custom(err.to_string()))
    }
}

/// 16-byte stable user identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId([u8; ID_LEN]);

impl UserId {
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UserId").field(&hex::encode(self.0)).finish()
    }
}

impl FromStr for UserId {
    type Err = IdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; ID_LEN] = hex::decode(value)?
            .try_into()
            .map_err(|_| IdError::InvalidLength)?;
        Ok(Self(bytes))
    }
}

impl Serialize for UserId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(deserialize_array(deserializer)?))
    }
}

/// A user at a specific account incarnation.
///
/// Resetting an account bumps `eldest_seqno`, which makes the reset user a different member.
/// Textual form is `<uid>%<eldest_seqno>`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserVersion {
    pub uid: UserId,
    pub eldest_seqno: Seqno,
}

impl UserVersion {
    pub fn new(uid: UserId, eldest_seqno: Seqno) -> Self {
        Self { uid, eldest_seqno }
    }
}

impl fmt::Display for UserVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%{}", self.uid, self.eldest_seqno)
    }
}

impl fmt::Debug for UserVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserVersion({self})")
    }
}

impl FromStr for UserVersion {
    type Err = IdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (uid, eldest_seqno) = value
            .split_once('%')
            .ok_or_else(|| IdError::InvalidUserVersion(value.to_string()))?;
        let eldest_seqno = eldest_seqno
            .parse()
            .map_err(|_| IdError::InvalidUserVersion(value.to_string()))?;
        Ok(Self {
            uid: uid.parse()?,
            eldest_seqno,
        })
    }
}

impl Serialize for UserVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UserVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse()
            .map_err(|err: IdError| serde::de::Error::custom(err.to_string()))
    }
}

/// Identity whose log an ordering obligation refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UserOrGroupId {
    User(UserId),
    Group(GroupId),
}

impl fmt::Display for UserOrGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserOrGroupId::User(uid) => write!(f, "user:{uid}"),
            UserOrGroupId::Group(id) => write!(f, "group:{id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IdError {
    #[error("invalid id length")]
    InvalidLength,

    #[error("invalid group id suffix {0:#04x}")]
    InvalidGroupSuffix(u8),

    #[error("invalid group name part '{0}'")]
    InvalidNamePart(String),

    #[error("'{0}' is not the name of a root group")]
    NotRootName(String),

    #[error("invalid user version '{0}'")]
    InvalidUserVersion(String),

    #[error("invalid hex encoding: {0}")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}
