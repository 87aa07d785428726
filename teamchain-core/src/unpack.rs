// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoding of raw links into their outer and inner parts.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{Hash, LinkId};
use crate::identity::KeyId;
use crate::ids::{GroupId, Seqno};
use crate::link::{
    EnvelopeError, LinkType, OuterLink, RawLink, SUPPORTED_LINK_VERSION, SeqType, SignedEnvelope,
};
use crate::payload::{Payload, PayloadError, TeamSection};

/// Expected value of the `tag` field of inner payloads.
const PAYLOAD_TAG: &str = "signature";

/// Position of a signature in a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SigLocation {
    pub seqno: Seqno,
    pub seq_type: SeqType,
}

/// Where and when a link was signed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureMetadata {
    pub signing_kid: KeyId,
    pub location: SigLocation,

    /// Global clock position the signer claims to have seen.
    pub merkle_seqno: u64,
    pub ctime: u64,
}

/// A decoded link whose outer and inner parts are consistent with each other.
///
/// The signature of the envelope is not verified here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnpackedLink {
    pub source: RawLink,
    pub envelope: SignedEnvelope,
    pub outer: OuterLink,
    pub link_id: LinkId,
    pub link_type: LinkType,

    /// Absent when the link is stubbed.
    pub inner: Option<Payload>,
}

impl UnpackedLink {
    pub fn seqno(&self) -> Seqno {
        self.outer.seqno
    }

    pub fn prev(&self) -> Option<LinkId> {
        self.outer.prev
    }

    pub fn is_stubbed(&self) -> bool {
        self.inner.is_none()
    }

    pub fn team(&self) -> Option<&TeamSection> {
        self.inner.as_ref().and_then(|inner| inner.body.team.as_ref())
    }

    /// Group id claimed by the inner payload.
    pub fn inner_group_id(&self) -> Option<GroupId> {
        self.team().and_then(|team| team.id)
    }

    pub fn signature_metadata(&self) -> Option<SignatureMetadata> {
        self.inner.as_ref().map(|inner| SignatureMetadata {
            signing_kid: inner.body.key.kid,
            location: SigLocation {
                seqno: self.outer.seqno,
                seq_type: self.outer.seq_type,
            },
            merkle_seqno: inner.body.merkle_root.seqno,
            ctime: inner.ctime,
        })
    }
}

/// Decode a raw link and check that all of its parts describe the same link.
pub fn unpack_link(raw: RawLink) -> Result<UnpackedLink, UnpackError> {
    if raw.version != SUPPORTED_LINK_VERSION {
        return Err(UnpackError::UnsupportedVersion(raw.version));
    }

    let envelope = SignedEnvelope::from_hex(&raw.sig)?;
    let outer = envelope
        .decode_outer()
        .map_err(|err| UnpackError::Envelope(err.into()))?;
    let link_id = envelope.link_id();

    if outer.version != raw.version {
        return Err(UnpackError::VersionMismatch {
            declared: raw.version,
            embedded: outer.version,
        });
    }
    if outer.seqno != raw.seqno {
        return Err(UnpackError::SeqnoMismatch {
            declared: raw.seqno,
            embedded: outer.seqno,
        });
    }
    if outer.seqno == 0 {
        return Err(UnpackError::ZeroSeqno);
    }

    let link_type = match LinkType::from_code(outer.link_type) {
        Some(link_type) => link_type,
        None if outer.ignore_if_unsupported => LinkType::Unsupported(outer.link_type),
        None => return Err(UnpackError::UnknownLinkType(outer.link_type)),
    };

    let inner = match &raw.payload {
        Some(payload) => Some(unpack_inner(&raw, &outer, link_type, payload)?),
        None => None,
    };

    Ok(UnpackedLink {
        source: raw,
        envelope,
        outer,
        link_id,
        link_type,
        inner,
    })
}

fn unpack_inner(
    raw: &RawLink,
    outer: &OuterLink,
    link_type: LinkType,
    payload: &str,
) -> Result<Payload, UnpackError> {
    let payload_hash = Hash::new(payload.as_bytes());
    if payload_hash != outer.payload_hash {
        return Err(UnpackError::PayloadHashMismatch {
            expected: outer.payload_hash,
            actual: payload_hash,
        });
    }

    let inner = Payload::from_json(payload)?;

    if inner.tag != PAYLOAD_TAG {
        return Err(UnpackError::InvalidTag(inner.tag));
    }
    if inner.seqno != outer.seqno {
        return Err(UnpackError::InnerMismatch("seqno"));
    }
    if inner.prev != outer.prev {
        return Err(UnpackError::InnerMismatch("prev"));
    }
    if inner.body.version != outer.version {
        return Err(UnpackError::InnerMismatch("version"));
    }
    if inner.body.key.uid != raw.uid {
        return Err(UnpackError::InnerMismatch("uid"));
    }
    if let Some(name) = link_type.as_str() {
        if inner.body.link_type != name {
            return Err(UnpackError::InnerMismatch("type"));
        }
    }

    Ok(inner)
}

/// Link could not be decoded or its parts contradict each other.
#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("unsupported link version {0}")]
    UnsupportedVersion(u64),

    #[error("invalid envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("declared version {declared} does not match embedded version {embedded}")]
    VersionMismatch { declared: u64, embedded: u64 },

    #[error("declared seqno {declared} does not match embedded seqno {embedded}")]
    SeqnoMismatch { declared: Seqno, embedded: Seqno },

    #[error("links start at seqno 1")]
    ZeroSeqno,

    #[error("unknown link type {0}")]
    UnknownLinkType(u64),

    #[error("payload hash {actual} does not match committed hash {expected}")]
    PayloadHashMismatch { expected: Hash, actual: Hash },

    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("unexpected payload tag '{0}'")]
    InvalidTag(String),

    #[error("inner payload disagrees with outer link on {0}")]
    InnerMismatch(&'static str),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::identity::PrivateKey;
    use crate::ids::UserId;
    use crate::link::{LinkType, OuterLink, RawLink, SeqType, SignedEnvelope};
    use crate::{Hash, LinkId};

    use super::{UnpackError, unpack_link};

    struct Fixture {
        private_key: PrivateKey,
        uid: UserId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                private_key: PrivateKey::new(),
                uid: UserId::from_bytes([5; 16]),
            }
        }

        fn payload(&self, link_type: &str, seqno: u64, prev: Option<LinkId>) -> String {
            json!({
                "body": {
                    "type": link_type,
                    "version": 2,
                    "key": { "uid": self.uid, "kid": self.private_key.public_key().key_id() },
                    "merkle_root": { "seqno": 100 },
                    "team": { "id": format!("{}24", "aa".repeat(15)) },
                },
                "ctime": 1_700_000_000u64,
                "prev": prev,
                "seqno": seqno,
                "tag": "signature",
            })
            .to_string()
        }

        fn raw(&self, outer: OuterLink, payload: Option<String>) -> RawLink {
            let envelope = SignedEnvelope::sign(&outer, &self.private_key).unwrap();
            RawLink {
                seqno: outer.seqno,
                sig: envelope.to_hex().unwrap(),
                payload,
                uid: self.uid,
                version: 2,
            }
        }

        fn link(&self, link_type: LinkType, seqno: u64, prev: Option<LinkId>) -> RawLink {
            let payload = self.payload(link_type.as_str().unwrap(), seqno, prev);
            let outer = OuterLink {
                version: 2,
                seqno,
                prev,
                payload_hash: Hash::new(payload.as_bytes()),
                link_type: link_type.code(),
                seq_type: SeqType::Semiprivate,
                ignore_if_unsupported: false,
            };
            self.raw(outer, Some(payload))
        }
    }

    #[test]
    fn unpack_full_and_stubbed() {
        let fixture = Fixture::new();
        let prev = Hash::new(b"prev");
        let raw = fixture.link(LinkType::Invite, 2, Some(prev));

        let link = unpack_link(raw.clone()).unwrap();
        assert_eq!(link.seqno(), 2);
        assert_eq!(link.prev(), Some(prev));
        assert_eq!(link.link_type, LinkType::Invite);
        assert!(!link.is_stubbed());
        assert_eq!(link.signature_metadata().unwrap().merkle_seqno, 100);

        let stub = unpack_link(raw.to_stub()).unwrap();
        assert!(stub.is_stubbed());
        assert_eq!(stub.link_id, link.link_id);
        assert!(stub.signature_metadata().is_none());
    }

    #[test]
    fn declared_fields_must_match() {
        let fixture = Fixture::new();

        let mut raw = fixture.link(LinkType::Root, 1, None);
        raw.seqno = 4;
        assert!(matches!(
            unpack_link(raw),
            Err(UnpackError::SeqnoMismatch {
                declared: 4,
                embedded: 1
            })
        ));

        let mut raw = fixture.link(LinkType::Root, 1, None);
        raw.version = 1;
        assert!(matches!(
            unpack_link(raw),
            Err(UnpackError::UnsupportedVersion(1))
        ));

        let mut raw = fixture.link(LinkType::Root, 1, None);
        raw.payload = Some(fixture.payload("team.root", 1, Some(Hash::new(b"x"))));
        assert!(matches!(
            unpack_link(raw),
            Err(UnpackError::PayloadHashMismatch { .. })
        ));
    }

    #[test]
    fn inner_must_match_outer() {
        let fixture = Fixture::new();
        let payload = fixture.payload("team.leave", 3, None);
        let outer = OuterLink {
            version: 2,
            seqno: 3,
            prev: None,
            payload_hash: Hash::new(payload.as_bytes()),
            link_type: LinkType::Invite.code(),
            seq_type: SeqType::Semiprivate,
            ignore_if_unsupported: false,
        };
        assert!(matches!(
            unpack_link(fixture.raw(outer, Some(payload))),
            Err(UnpackError::InnerMismatch("type"))
        ));

        let payload = fixture.payload("team.invite", 3, Some(Hash::new(b"other")));
        let outer = OuterLink {
            version: 2,
            seqno: 3,
            prev: Some(Hash::new(b"prev")),
            payload_hash: Hash::new(payload.as_bytes()),
            link_type: LinkType::Invite.code(),
            seq_type: SeqType::Semiprivate,
            ignore_if_unsupported: false,
        };
        assert!(matches!(
            unpack_link(fixture.raw(outer, Some(payload))),
            Err(UnpackError::InnerMismatch("prev"))
        ));
    }

    #[test]
    fn unknown_types() {
        let fixture = Fixture::new();
        let payload = fixture.payload("team.from_the_future", 2, None);
        let mut outer = OuterLink {
            version: 2,
            seqno: 2,
            prev: None,
            payload_hash: Hash::new(payload.as_bytes()),
            link_type: 120,
            seq_type: SeqType::Semiprivate,
            ignore_if_unsupported: false,
        };
        assert!(matches!(
            unpack_link(fixture.raw(outer.clone(), Some(payload.clone()))),
            Err(UnpackError::UnknownLinkType(120))
        ));

        outer.ignore_if_unsupported = true;
        let link = unpack_link(fixture.raw(outer, Some(payload))).unwrap();
        assert_eq!(link.link_type, LinkType::Unsupported(120));
    }

    #[test]
    fn garbage_envelope() {
        let raw = RawLink {
            seqno: 1,
            sig: "zz".to_string(),
            payload: None,
            uid: UserId::from_bytes([1; 16]),
            version: 2,
        };
        assert!(matches!(unpack_link(raw), Err(UnpackError::Envelope(_))));
    }
}
