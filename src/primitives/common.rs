// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::hash::{base58check_decode, base58check_encode, hash160, sha256};
use bincode::{Decode, Encode};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::Hash as HashTrait;

pub const PUBLIC_KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;

/// Version byte for ordinary account addresses. Yields the `Q` prefix.
pub const ADDRESS_VERSION: u8 = 58;

/// Version byte for AT account addresses. Yields the `A` prefix.
pub const AT_ADDRESS_VERSION: u8 = 23;

/// Base58Check account address. Ordinary accounts start with `Q`,
/// AT accounts with `A`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, HashTrait, Encode, Decode)]
pub struct Address(String);

impl Address {
    pub fn from_string(encoded: &str) -> Result<Self, &'static str> {
        let (version, payload) = base58check_decode(encoded)?;

        if version != ADDRESS_VERSION && version != AT_ADDRESS_VERSION {
            return Err("unknown address version");
        }

        if payload.len() != 20 {
            return Err("invalid address length");
        }

        Ok(Self(encoded.to_owned()))
    }

    #[must_use]
    pub fn is_valid(encoded: &str) -> bool {
        Self::from_string(encoded).is_ok()
    }

    /// Derives the address of an AT from its creator's public key and the
    /// creation transaction's reference. A pure function of the pair.
    #[must_use]
    pub fn from_at_creation(creator: &PublicKey, creation_reference: &[u8]) -> Self {
        let mut preimage = Vec::with_capacity(PUBLIC_KEY_BYTES + creation_reference.len());
        preimage.extend_from_slice(&creator.0);
        preimage.extend_from_slice(creation_reference);

        let digest = hash160(&sha256(&preimage));
        Self(base58check_encode(AT_ADDRESS_VERSION, &digest))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_at_address(&self) -> bool {
        // Version was validated on construction, a prefix check suffices
        self.0.starts_with('A')
    }

    #[cfg(test)]
    #[must_use]
    pub fn random() -> Self {
        use rand::Rng;
        let payload: [u8; 20] = rand::thread_rng().gen();
        Self(base58check_encode(ADDRESS_VERSION, &payload))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.0).finish()
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        String::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Address::from_string(&string).map_err(serde::de::Error::custom)
    }
}

/// 32-byte ed25519 public key. Kept as raw bytes: the VM's B register holds
/// arbitrary 32-byte values that are only sometimes valid curve points, and
/// address derivation is defined over the bytes, not the point.
#[derive(Clone, Copy, PartialEq, Eq, HashTrait, Encode, Decode)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_BYTES]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != PUBLIC_KEY_BYTES {
            return Err("invalid slice length! expected 32");
        }

        let mut out = [0; PUBLIC_KEY_BYTES];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn from_hex(hexstr: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(hexstr).map_err(|_| "invalid hexstr")?;
        Self::from_bytes(&bytes)
    }

    #[must_use]
    pub fn zero() -> Self {
        Self([0; PUBLIC_KEY_BYTES])
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn to_address(&self) -> Address {
        let digest = hash160(&self.0);
        Address(base58check_encode(ADDRESS_VERSION, &digest))
    }

    /// Verifies an ed25519 signature over `message`. Fails for keys that are
    /// not valid curve points.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };

        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&hex::encode(self.0))
            .finish()
    }
}

/// 64-byte ed25519 signature. AT transactions carry a deterministic
/// pseudo-signature in the same container, see `primitives::transaction`.
#[derive(Clone, Copy, PartialEq, Eq, HashTrait, Encode, Decode)]
pub struct Signature(pub [u8; SIGNATURE_BYTES]);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != SIGNATURE_BYTES {
            return Err("invalid slice length! expected 64");
        }

        let mut out = [0; SIGNATURE_BYTES];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    #[must_use]
    pub fn zero() -> Self {
        Self([0; SIGNATURE_BYTES])
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_BYTES] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature")
            .field(&hex::encode(self.0))
            .finish()
    }
}

/// Signs `message` with an ed25519 secret key. Used by account-owned
/// transactions; AT transactions never call this.
#[must_use]
pub fn sign_message(secret: &[u8; 32], message: &[u8]) -> Signature {
    let key = SigningKey::from_bytes(secret);
    Signature(key.sign(message).to_bytes())
}

#[must_use]
pub fn public_key_of(secret: &[u8; 32]) -> PublicKey {
    let key = SigningKey::from_bytes(secret);
    PublicKey(key.verifying_key().to_bytes())
}
