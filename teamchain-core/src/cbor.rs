// SPDX-License-Identifier: MIT OR Apache-2.0

//! Utility methods to encode or decode values in [CBOR] format.
//!
//! Outer links and signed envelopes are encoded in the Concise Binary Object Representation
//! (CBOR) format. The link id is the hash of the encoded outer link, so the encoding needs to be
//! stable for a given value.
//!
//! [CBOR]: https://cbor.io/
use std::io::Read;

use ciborium::de::Error as DeserializeError;
use ciborium::ser::Error as SerializeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serializes a value into CBOR format.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(Into::<EncodeError>::into)?;
    Ok(bytes)
}

/// Deserializes a value which was formatted in CBOR.
pub fn decode_cbor<T: for<'a> Deserialize<'a>, R: Read>(reader: R) -> Result<T, DecodeError> {
    let value = ciborium::from_reader::<T, R>(reader).map_err(Into::<DecodeError>::into)?;
    Ok(value)
}

/// An error occurred during CBOR serialization.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// An error occurred while writing bytes.
    #[error("an error occurred while writing bytes: {0}")]
    Io(std::io::Error),

    /// A value could not be serialized.
    #[error("an error occurred while serializing value: {0}")]
    Value(String),
}

impl From<SerializeError<std::io::Error>> for EncodeError {
    fn from(value: SerializeError<std::io::Error>) -> Self {
        match value {
            SerializeError::Io(err) => EncodeError::Io(err),
            SerializeError::Value(err) => EncodeError::Value(err),
        }
    }
}

/// An error occurred during CBOR deserialization.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// An error occurred while reading bytes.
    #[error("an error occurred while reading bytes: {0}")]
    Io(std::io::Error),

    /// An error occurred while parsing bytes at the given offset.
    #[error("an error occurred while parsing bytes at position {0}")]
    Syntax(usize),

    /// An error occurred while processing a parsed value.
    #[error("an error occurred while processing a parsed value at position {0:?}: {1}")]
    Semantic(Option<usize>, String),

    /// The input caused serde to recurse too much.
    #[error("recursion limit exceeded while decoding")]
    RecursionLimitExceeded,
}

impl From<DeserializeError<std::io::Error>> for DecodeError {
    fn from(value: DeserializeError<std::io::Error>) -> Self {
        match value {
            DeserializeError::Io(err) => DecodeError::Io(err),
            DeserializeError::Syntax(offset) => DecodeError::Syntax(offset),
            DeserializeError::Semantic(offset, description) => {
                DecodeError::Semantic(offset, description)
            }
            DeserializeError::RecursionLimitExceeded => DecodeError::RecursionLimitExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::link::{SeqType, SignedEnvelope};
    use crate::{Hash, LinkType, OuterLink, PrivateKey};

    use super::{decode_cbor, encode_cbor};

    #[test]
    fn reencoding_keeps_link_id() {
        let outer = OuterLink {
            version: 2,
            seqno: 3,
            prev: Some(Hash::new(b"prev")),
            payload_hash: Hash::new(b"payload"),
            link_type: LinkType::Invite.code(),
            seq_type: SeqType::Semiprivate,
            ignore_if_unsupported: false,
        };

        let bytes = encode_cbor(&outer).unwrap();
        let outer_again: OuterLink = decode_cbor(&bytes[..]).unwrap();
        assert_eq!(outer, outer_again);
        assert_eq!(Hash::new(&bytes), Hash::new(encode_cbor(&outer_again).unwrap()));

        // Envelopes carry the outer bytes as they were signed.
        let envelope = SignedEnvelope::sign(&outer, &PrivateKey::new()).unwrap();
        let envelope_again = SignedEnvelope::from_hex(&envelope.to_hex().unwrap()).unwrap();
        assert_eq!(envelope_again.link_id(), Hash::new(&bytes));
        assert_eq!(envelope_again.decode_outer().unwrap(), outer);
        assert!(envelope_again.verify().is_ok());
    }

    #[test]
    fn garbage_fails_to_decode() {
        let result = decode_cbor::<OuterLink, _>(&[0xff, 0x00, 0x13][..]);
        assert!(result.is_err());
    }
}
