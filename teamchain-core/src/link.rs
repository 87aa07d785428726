// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire representation of chain links.
//!
//! A link is delivered as a [`RawLink`]: a hex-encoded, signed CBOR envelope wrapping the
//! [`OuterLink`], and an optional JSON inner payload. The outer link commits to the payload by
//! hash, so a link with its payload withheld ("stubbed") still has a stable [`LinkId`] and can
//! be checked for chain continuity.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::hash::{Hash, LinkId};
use crate::identity::{PrivateKey, PublicKey, Signature};
use crate::ids::{Seqno, UserId};

/// The only outer link version understood by this implementation.
pub const SUPPORTED_LINK_VERSION: u64 = 2;

/// Kinds of links appearing in a group chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LinkType {
    Root,
    NewSubgroup,
    ChangeMembership,
    RotateKey,
    Leave,
    SubgroupHead,
    RenameSubgroup,
    Invite,
    RenameUpPointer,
    DeleteRoot,
    DeleteSubgroup,
    DeleteUpPointer,
    KbfsUpgrade,
    Settings,
    BotSettings,

    /// A type code from a newer protocol revision, accepted only when the link asks to be
    /// ignored if unsupported.
    Unsupported(u64),
}

impl LinkType {
    pub const ALL: [LinkType; 15] = [
        LinkType::Root,
        LinkType::NewSubgroup,
        LinkType::ChangeMembership,
        LinkType::RotateKey,
        LinkType::Leave,
        LinkType::SubgroupHead,
        LinkType::RenameSubgroup,
        LinkType::Invite,
        LinkType::RenameUpPointer,
        LinkType::DeleteRoot,
        LinkType::DeleteSubgroup,
        LinkType::DeleteUpPointer,
        LinkType::KbfsUpgrade,
        LinkType::Settings,
        LinkType::BotSettings,
    ];

    /// Numeric code carried in the outer link.
    pub fn code(&self) -> u64 {
        match self {
            LinkType::Root => 33,
            LinkType::NewSubgroup => 34,
            LinkType::ChangeMembership => 35,
            LinkType::RotateKey => 36,
            LinkType::Leave => 37,
            LinkType::SubgroupHead => 38,
            LinkType::RenameSubgroup => 39,
            LinkType::Invite => 40,
            LinkType::RenameUpPointer => 41,
            LinkType::DeleteRoot => 42,
            LinkType::DeleteSubgroup => 43,
            LinkType::DeleteUpPointer => 44,
            LinkType::KbfsUpgrade => 45,
            LinkType::Settings => 46,
            LinkType::BotSettings => 47,
            LinkType::Unsupported(code) => *code,
        }
    }

    pub fn from_code(code: u64) -> Option<LinkType> {
        LinkType::ALL.into_iter().find(|link_type| link_type.code() == code)
    }

    /// Name used for the `body.type` field of inner payloads.
    pub fn as_str(&self) -> Option<&'static str> {
        let name = match self {
            LinkType::Root => "team.root",
            LinkType::NewSubgroup => "team.new_subteam",
            LinkType::ChangeMembership => "team.change_membership",
            LinkType::RotateKey => "team.rotate_key",
            LinkType::Leave => "team.leave",
            LinkType::SubgroupHead => "team.subteam_head",
            LinkType::RenameSubgroup => "team.rename_subteam",
            LinkType::Invite => "team.invite",
            LinkType::RenameUpPointer => "team.rename_up_pointer",
            LinkType::DeleteRoot => "team.delete_root",
            LinkType::DeleteSubgroup => "team.delete_subteam",
            LinkType::DeleteUpPointer => "team.delete_up_pointer",
            LinkType::KbfsUpgrade => "team.kbfs",
            LinkType::Settings => "team.settings",
            LinkType::BotSettings => "team.bot_settings",
            LinkType::Unsupported(_) => return None,
        };
        Some(name)
    }

    /// Whether links of this type may be sent with their payload withheld.
    pub fn is_stubbable(&self) -> bool {
        matches!(
            self,
            LinkType::NewSubgroup
                | LinkType::RenameSubgroup
                | LinkType::DeleteSubgroup
                | LinkType::Invite
                | LinkType::Settings
                | LinkType::KbfsUpgrade
                | LinkType::BotSettings
        )
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "unsupported({})", self.code()),
        }
    }
}

/// Visibility class of a chain, committed to by every outer link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeqType {
    Public,
    Semiprivate,
}

impl SeqType {
    pub fn for_group(public: bool) -> Self {
        if public {
            SeqType::Public
        } else {
            SeqType::Semiprivate
        }
    }
}

/// Signed, hash-chained part of a link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuterLink {
    pub version: u64,
    pub seqno: Seqno,
    pub prev: Option<LinkId>,
    pub payload_hash: Hash,
    pub link_type: u64,
    pub seq_type: SeqType,
    pub ignore_if_unsupported: bool,
}

impl OuterLink {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(self)
    }
}

/// Outer link bytes together with the signer's key and signature over them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    #[serde(with = "serde_bytes")]
    pub outer: Vec<u8>,
    pub kid: PublicKey,
    pub signature: Signature,
}

impl SignedEnvelope {
    /// Encode and sign an outer link.
    pub fn sign(outer: &OuterLink, private_key: &PrivateKey) -> Result<Self, EncodeError> {
        let outer = outer.to_bytes()?;
        let signature = private_key.sign(&outer);
        Ok(Self {
            outer,
            kid: private_key.public_key(),
            signature,
        })
    }

    /// Check the signature and return the key which produced it.
    pub fn verify(&self) -> Result<PublicKey, EnvelopeError> {
        if self.kid.verify(&self.outer, &self.signature) {
            Ok(self.kid)
        } else {
            Err(EnvelopeError::InvalidSignature(self.kid))
        }
    }

    /// Link id committed to by this envelope.
    pub fn link_id(&self) -> LinkId {
        Hash::new(&self.outer)
    }

    pub fn decode_outer(&self) -> Result<OuterLink, DecodeError> {
        decode_cbor(&self.outer[..])
    }

    /// Hex encoding used for the `sig` field of raw links.
    pub fn to_hex(&self) -> Result<String, EncodeError> {
        Ok(hex::encode(encode_cbor(self)?))
    }

    pub fn from_hex(value: &str) -> Result<Self, EnvelopeError> {
        let bytes = hex::decode(value)?;
        Ok(decode_cbor(&bytes[..])?)
    }
}

/// A link as delivered by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLink {
    pub seqno: Seqno,

    /// Hex of the CBOR-encoded [`SignedEnvelope`].
    pub sig: String,

    /// JSON inner payload, absent when the link is stubbed.
    pub payload: Option<String>,

    pub uid: UserId,
    pub version: u64,
}

impl RawLink {
    pub fn is_stubbed(&self) -> bool {
        self.payload.is_none()
    }

    /// Copy of this link with the payload withheld.
    pub fn to_stub(&self) -> RawLink {
        RawLink {
            payload: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("signature by {0} does not match outer link")]
    InvalidSignature(PublicKey),

    #[error("invalid hex encoding: {0}")]
    InvalidHexEncoding(#[from] hex::FromHexError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use crate::identity::PrivateKey;
    use crate::{Hash, LinkType, OuterLink, SeqType, SignedEnvelope};

    use super::EnvelopeError;

    fn outer() -> OuterLink {
        OuterLink {
            version: 2,
            seqno: 1,
            prev: None,
            payload_hash: Hash::new(b"{}"),
            link_type: LinkType::Root.code(),
            seq_type: SeqType::Semiprivate,
            ignore_if_unsupported: false,
        }
    }

    #[test]
    fn type_codes() {
        for link_type in LinkType::ALL {
            assert_eq!(LinkType::from_code(link_type.code()), Some(link_type));
            assert!(link_type.as_str().is_some());
        }
        assert_eq!(LinkType::from_code(99), None);
        assert_eq!(LinkType::Unsupported(99).to_string(), "unsupported(99)");
        assert!(LinkType::Invite.is_stubbable());
        assert!(!LinkType::ChangeMembership.is_stubbable());
    }

    #[test]
    fn sign_and_verify_envelope() {
        let private_key = PrivateKey::new();
        let envelope = SignedEnvelope::sign(&outer(), &private_key).unwrap();
        assert_eq!(envelope.verify().unwrap(), private_key.public_key());

        let decoded = SignedEnvelope::from_hex(&envelope.to_hex().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.decode_outer().unwrap(), outer());
        assert_eq!(decoded.link_id(), envelope.link_id());
    }

    #[test]
    fn tampered_envelope() {
        let private_key = PrivateKey::new();
        let mut envelope = SignedEnvelope::sign(&outer(), &private_key).unwrap();
        envelope.kid = PrivateKey::new().public_key();
        assert!(matches!(
            envelope.verify(),
            Err(EnvelopeError::InvalidSignature(_))
        ));
    }
}
