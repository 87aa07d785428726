// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 keys and signatures used for envelopes and per-group key reverse signatures.
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{SECRET_KEY_LENGTH, Signer};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serde::{deserialize_array, serialize_hex};

/// Size of public keys and key ids.
pub const PUBLIC_KEY_LEN: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

/// Size of signatures.
pub const SIGNATURE_LEN: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Private ed25519 key used for signing.
#[derive(Clone)]
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    /// Generates a new private key using the system's random number generator as a seed.
    pub fn new() -> Self {
        let mut csprng = OsRng;
        Self(ed25519_dalek::SigningKey::generate(&mut csprng))
    }

    pub fn from_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(bytes))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.0.sign(bytes))
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey").field(&self.public_key()).finish()
    }
}

/// Public ed25519 key used for verifying signatures.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LEN]) -> Result<Self, IdentityError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Verify a signature over the given bytes, using strict verification.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(bytes, &signature.0).is_ok()
    }

    /// Key id under which this key is referenced in inner payloads.
    pub fn key_id(&self) -> KeyId {
        KeyId(*self.as_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

impl FromStr for PublicKey {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; PUBLIC_KEY_LEN] = hex::decode(value)?
            .try_into()
            .map_err(|_| IdentityError::InvalidLength)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: [u8; PUBLIC_KEY_LEN] = deserialize_array(deserializer)?;
        Self::from_bytes(&bytes).map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

/// Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    pub fn from_bytes(bytes: &[u8; SIGNATURE_LEN]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature").field(&self.to_hex()).finish()
    }
}

impl FromStr for Signature {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; SIGNATURE_LEN] = hex::decode(value)?
            .try_into()
            .map_err(|_| IdentityError::InvalidLength)?;
        Ok(Self::from_bytes(&bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: [u8; SIGNATURE_LEN] = deserialize_array(deserializer)?;
        Ok(Self::from_bytes(&bytes))
    }
}

/// Opaque 32-byte key identifier.
///
/// Used for signer keys in the inner payload and for per-group encryption keys, which are never
/// interpreted here.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId([u8; PUBLIC_KEY_LEN]);

impl KeyId {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }
}

impl From<PublicKey> for KeyId {
    fn from(value: PublicKey) -> Self {
        value.key_id()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyId").field(&hex::encode(self.0)).finish()
    }
}

impl Serialize for KeyId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(deserialize_array(deserializer)?))
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid ed25519 public key")]
    InvalidPublicKey,

    #[error("invalid key or signature length")]
    InvalidLength,

    #[error("invalid hex encoding: {0}")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::PrivateKey;

    #[test]
    fn sign_and_verify() {
        let private_key = PrivateKey::new();
        let public_key = private_key.public_key();

        let signature = private_key.sign(b"team.root");
        assert!(public_key.verify(b"team.root", &signature));
        assert!(!public_key.verify(b"team.leave", &signature));
        assert!(!PrivateKey::new().public_key().verify(b"team.root", &signature));
    }

    #[test]
    fn key_id_matches_public_key() {
        let public_key = PrivateKey::new().public_key();
        assert_eq!(public_key.key_id().as_bytes(), public_key.as_bytes());
        assert_eq!(public_key.key_id().to_string(), public_key.to_hex());
    }
}
