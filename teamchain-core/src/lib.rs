// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifiers, signed envelopes and link unpacking for group sigchains.
pub mod cbor;
pub mod hash;
pub mod identity;
pub mod ids;
pub mod link;
pub mod payload;
pub mod serde;
pub mod unpack;

pub use hash::{Hash, HashError, LinkId};
pub use identity::{IdentityError, KeyId, PrivateKey, PublicKey, Signature};
pub use ids::{GroupId, GroupName, IdError, Seqno, UserId, UserOrGroupId, UserVersion};
pub use link::{
    EnvelopeError, LinkType, OuterLink, RawLink, SUPPORTED_LINK_VERSION, SeqType, SignedEnvelope,
};
pub use payload::{InviteId, Payload, PayloadError, TeamSection};
pub use unpack::{SigLocation, SignatureMetadata, UnpackError, UnpackedLink, unpack_link};
