// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON inner payload of a link.
//!
//! ```json
//! {
//!   "body": {
//!     "type": "team.change_membership",
//!     "version": 2,
//!     "key": { "uid": "..", "kid": ".." },
//!     "merkle_root": { "seqno": 812 },
//!     "team": { "id": "..", "members": { "writer": ["<uid>%1"] } }
//!   },
//!   "ctime": 1700000000,
//!   "prev": "..",
//!   "seqno": 4,
//!   "tag": "signature"
//! }
//! ```
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hash::LinkId;
use crate::identity::{IdentityError, KeyId, PrivateKey, PublicKey, Signature};
use crate::ids::{GroupId, Seqno, UserId, UserVersion};

/// JSON path of the reverse signature inside a payload.
const REVERSE_SIG_POINTER: &str = "/body/team/per_team_key/reverse_sig";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub body: PayloadBody,
    pub ctime: u64,
    #[serde(default)]
    pub expire_in: u64,
    pub prev: Option<LinkId>,
    pub seqno: Seqno,
    pub tag: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadBody {
    #[serde(rename = "type")]
    pub link_type: String,
    pub version: u64,
    pub key: KeySection,
    pub merkle_root: MerkleRootSection,
    pub team: Option<TeamSection>,
}

/// Signing key of the link author.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySection {
    pub uid: UserId,
    pub kid: KeyId,
}

/// Global clock position observed by the signer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleRootSection {
    pub seqno: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_meta: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub implicit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<MembersSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subteam: Option<SubgroupSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_team_key: Option<PerGroupKeySection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invites: Option<InvitesSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_invites: Option<BTreeMap<InviteId, UserVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_invites: Option<Vec<UsedInvite>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbfs: Option<KbfsSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub box_summary_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_settings: Option<BTreeMap<UserVersion, BotSettings>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entropy: Option<String>,
}

/// Role assignments. Users listed under `none` are removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Vec<UserVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<Vec<UserVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<Vec<UserVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<Vec<UserVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<Vec<UserVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted_bot: Option<Vec<UserVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub none: Option<Vec<UserVersion>>,
}

/// Pointer from a sub-group to the parent link which created or renamed it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentSection {
    pub id: GroupId,
    pub seqno: Seqno,
}

/// Sub-group created, renamed or deleted by a parent link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgroupSection {
    pub id: GroupId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerGroupKeySection {
    pub generation: u64,
    pub encryption_kid: KeyId,
    pub signing_kid: PublicKey,

    /// Signature by the new signing key over the payload with this field set to `null`.
    pub reverse_sig: Option<Signature>,
}

/// Claim that the signer is an admin of an ancestor group, as of the given link there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSection {
    pub group_id: GroupId,
    pub seqno: Seqno,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitesSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Vec<InviteEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<Vec<InviteEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<Vec<InviteEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<Vec<InviteEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<Vec<InviteId>>,
}

/// Invitation identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InviteId(String);

impl InviteId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InviteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for InviteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InviteId").field(&self.0).finish()
    }
}

/// Invite type naming an existing user by their user version.
pub const KEYBASE_INVITE_TYPE: &str = "keybase";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteEntry {
    pub id: InviteId,
    pub name: String,
    #[serde(rename = "type")]
    pub invite_type: String,

    /// Absent for single-use invites completed through `completed_invites`. `-1` means
    /// unlimited uses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<i64>,

    /// Advisory expiry time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etime: Option<u64>,
}

impl InviteEntry {
    /// The invited user, if this invite names an existing user.
    pub fn keybase_user(&self) -> Option<UserVersion> {
        if self.invite_type == KEYBASE_INVITE_TYPE {
            self.name.parse().ok()
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedInvite {
    pub id: InviteId,
    pub uv: UserVersion,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<OpenSettingsSection>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSettingsSection {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_as: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbfsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tlf: Option<TlfSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyset: Option<LegacyUpgradeSection>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlfSection {
    pub id: String,
}

/// Upgrade of a legacy folder key set to the group key of the given generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyUpgradeSection {
    pub app_type: u64,
    pub team_generation: u64,
    pub legacy_generation: u64,
    pub keyset_hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotSettings {
    #[serde(default)]
    pub cmds: bool,
    #[serde(default)]
    pub mentions: bool,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub convs: Vec<String>,
}

impl Payload {
    pub fn from_json(value: &str) -> Result<Self, PayloadError> {
        Ok(serde_json::from_str(value)?)
    }
}

/// Bytes covered by the reverse signature of the per-group key in this payload: the payload
/// with `reverse_sig` set to `null`, re-serialized with sorted keys.
pub fn reverse_sig_input(payload: &str) -> Result<Vec<u8>, PayloadError> {
    let mut value: Value = serde_json::from_str(payload)?;
    let slot = value
        .pointer_mut(REVERSE_SIG_POINTER)
        .ok_or(PayloadError::MissingReverseSig)?;
    *slot = Value::Null;
    Ok(serde_json::to_vec(&value)?)
}

/// Fill in the reverse signature of a payload under construction with the new per-group
/// signing key.
pub fn sign_reverse(value: &mut Value, signing_key: &PrivateKey) -> Result<(), PayloadError> {
    let slot = value
        .pointer_mut(REVERSE_SIG_POINTER)
        .ok_or(PayloadError::MissingReverseSig)?;
    *slot = Value::Null;
    let bytes = serde_json::to_vec(value)?;
    let signature = signing_key.sign(&bytes);
    if let Some(slot) = value.pointer_mut(REVERSE_SIG_POINTER) {
        *slot = Value::String(signature.to_hex());
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid payload json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload carries no per-group key reverse signature")]
    MissingReverseSig,

    #[error(transparent)]
    Identity(#[from] IdentityError),
}
