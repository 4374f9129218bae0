// This file is part of ZENITH.
//
// Copyright (C) 2023 Affidaty Spa.
//
// ZENITH is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// ZENITH is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with ZENITH. If not, see <https://www.gnu.org/licenses/>.

//! Consensus key handling: parsing, signature verification, and the address
//! derivation that binds a validator address to its public key.

use crate::{cryptoutil, error::*};
use ed25519_dalek::Verifier as _;
use ring::digest;

pub const KEY_TYPE_ED25519: &str = "ed25519";
pub const KEY_TYPE_SECP256K1: &str = "secp256k1";

const ED25519_PUB_KEY_SIZE: usize = 32;

/// A validator consensus public key.
#[derive(Debug, Clone)]
pub enum PubKey {
    Ed25519(ed25519_dalek::PublicKey),
}

impl PubKey {
    /// Parse key material as tagged by the chain.
    ///
    /// secp256k1 is recognized as a type but not currently supported as key
    /// material; chains using it cannot register.
    pub fn new(key_type: &str, bytes: &[u8]) -> Result<Self> {
        match key_type {
            KEY_TYPE_ED25519 if bytes.len() == ED25519_PUB_KEY_SIZE => {
                let key = ed25519_dalek::PublicKey::from_bytes(bytes)
                    .map_err(|err| Error::new_ext(ErrorKind::InvalidKey, err))?;
                Ok(PubKey::Ed25519(key))
            }
            KEY_TYPE_SECP256K1 => Err(Error::new_ext(
                ErrorKind::InvalidKey,
                "secp256k1 keys are not supported",
            )),
            _ => Err(Error::new_ext(
                ErrorKind::InvalidKey,
                format!("unusable key type {} ({} bytes)", key_type, bytes.len()),
            )),
        }
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<()> {
        match self {
            PubKey::Ed25519(key) => ed25519_dalek::Signature::try_from(sig)
                .map_err(|err| Error::new_ext(ErrorKind::BadSignature, err))
                .and_then(|s| {
                    key.verify(msg, &s)
                        .map_err(|err| Error::new_ext(ErrorKind::BadSignature, err))
                }),
        }
    }

    /// Consensus address: uppercase hex of the first 20 bytes of the SHA-256
    /// of the raw key. Validator addresses reported by the chain follow the
    /// same derivation, which is what lets the engine trust an address after
    /// verifying a signature with the key behind it.
    pub fn address(&self) -> String {
        let bytes = match self {
            PubKey::Ed25519(key) => key.as_bytes().as_slice(),
        };
        let hash = digest::digest(&digest::SHA256, bytes);
        hex::encode_upper(&hash.as_ref()[..20])
    }
}

/// Check that `addr` is a plausible payment address for a chain using the
/// given Bech32 prefix: well-formed Bech32, matching prefix, and a payload of
/// 20 (account) or 32 (module account) bytes.
pub fn validate_payment_address(addr: &str, hrp_prefix: &str) -> Result<()> {
    let (hrp, payload) = cryptoutil::bech32_decode(addr)
        .map_err(|err| Error::new_ext(ErrorKind::InvalidRequest, err.to_string_full()))?;

    if !hrp.starts_with(hrp_prefix) {
        return Err(Error::new_ext(
            ErrorKind::InvalidRequest,
            format!("address ({}) missing prefix ({})", addr, hrp_prefix),
        ));
    }

    match payload.len() {
        20 | 32 => Ok(()),
        n => Err(Error::new_ext(
            ErrorKind::InvalidRequest,
            format!("address length ({}) invalid: must be 20 or 32", n),
        )),
    }
}
