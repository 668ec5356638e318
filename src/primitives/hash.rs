// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

#[inline]
#[must_use]
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Double SHA-256 as used by the external chain for checksums and txids.
#[inline]
#[must_use]
pub fn hash256(bytes: &[u8]) -> [u8; 32] {
    sha256(&sha256(bytes))
}

/// RIPEMD-160 of SHA-256. Address and script-hash digest on both chains.
#[inline]
#[must_use]
pub fn hash160(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Ripemd160::new();
    hasher.update(sha256(bytes));
    hasher.finalize().into()
}

/// First 24 bytes of SHA-256. The canonical short hash used to fingerprint
/// transaction signatures inside the AT register lanes A2..A4. Must stay
/// byte-identical across implementations.
#[inline]
#[must_use]
pub fn sha192(bytes: &[u8]) -> [u8; 24] {
    let mut out = [0; 24];
    out.copy_from_slice(&sha256(bytes)[..24]);
    out
}

/// Base58Check with an explicit version byte and 4-byte `hash256` checksum.
#[must_use]
pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    bs58::encode(payload)
        .with_check_version(version)
        .into_string()
}

/// Decodes a Base58Check string into (version, payload). Rejects bad
/// checksums and empty payloads.
pub fn base58check_decode(encoded: &str) -> Result<(u8, Vec<u8>), &'static str> {
    let decoded = bs58::decode(encoded)
        .with_check(None)
        .into_vec()
        .map_err(|_| "invalid base58check string")?;

    if decoded.is_empty() {
        return Err("empty base58check payload");
    }

    Ok((decoded[0], decoded[1..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_empty_vector() {
        let result = hex::encode(sha256(b""));
        assert_eq!(
            &result,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hash256_empty_vector() {
        let result = hex::encode(hash256(b""));
        assert_eq!(
            &result,
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn hash160_empty_vector() {
        let result = hex::encode(hash160(b""));
        assert_eq!(&result, "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb");
    }

    #[test]
    fn sha192_is_sha256_prefix() {
        let full = sha256(b"quartz");
        let short = sha192(b"quartz");
        assert_eq!(&full[..24], &short[..]);
    }

    #[test]
    fn base58check_round_trip() {
        let payload = [0x42u8; 20];
        let encoded = base58check_encode(58, &payload);
        let (version, decoded) = base58check_decode(&encoded).unwrap();
        assert_eq!(version, 58);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn base58check_rejects_corruption() {
        let encoded = base58check_encode(58, &[0x42u8; 20]);
        let mut corrupted = encoded.into_bytes();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == b'2' { b'3' } else { b'2' };
        let corrupted = String::from_utf8(corrupted).unwrap();
        assert!(base58check_decode(&corrupted).is_err());
    }
}
