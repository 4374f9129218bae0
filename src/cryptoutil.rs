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

//! Hashing, nonces and deterministic signing blobs.
//!
//! Every party that signs or verifies a registration challenge or a build
//! request must derive byte-identical messages, so the constructions here are
//! fixed: length-prefixed fields, big-endian integers, a domain tag per
//! message type.

use crate::{Error, ErrorKind, Result};
use rand::{rngs::OsRng, RngCore};
use ring::digest;

/// Domain tag for registration challenge signatures.
const REGISTER_CHALLENGE_TAG: &[u8] = b"zenith/register-challenge\n";

/// Domain tag for build request signatures.
const BUILD_BLOCK_REQUEST_TAG: &[u8] = b"zenith/build-block-request\n";

/// SHA-256 over the concatenation of length-prefixed transaction bytes.
///
/// Prefixing every transaction with its u64 big-endian length makes the
/// digest unambiguous with respect to transaction boundaries.
pub fn hash_txs<T: AsRef<[u8]>>(txs: &[T]) -> [u8; 32] {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for tx in txs {
        let tx = tx.as_ref();
        ctx.update(&(tx.len() as u64).to_be_bytes());
        ctx.update(tx);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

/// Canonical transaction hash string, used for claim tracking and tracing.
pub fn hash_tx(txb: &[u8]) -> String {
    hex::encode_upper(hash_txs(&[txb]))
}

/// Hash every transaction in the slice. See [hash_tx].
pub fn hash_txs_hex<T: AsRef<[u8]>>(txs: &[T]) -> Vec<String> {
    txs.iter().map(|tx| hash_tx(tx.as_ref())).collect()
}

/// Cryptographically secure random bytes, for challenge nonces.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// The message a validator signs to answer a registration challenge.
pub fn register_challenge_sign_bytes(chain_id: &str, challenge: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(
        REGISTER_CHALLENGE_TAG.len() + 16 + chain_id.len() + challenge.len(),
    );
    msg.extend_from_slice(REGISTER_CHALLENGE_TAG);
    put_bytes(&mut msg, chain_id.as_bytes());
    put_bytes(&mut msg, challenge);
    msg
}

/// The message a proposer signs to authenticate a build request.
///
/// `txs_hash` is [hash_txs] over the request's mempool transactions.
pub fn build_block_request_sign_bytes(
    chain_id: &str,
    height: i64,
    validator_addr: &str,
    max_bytes: i64,
    max_gas: i64,
    txs_hash: &[u8; 32],
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(
        BUILD_BLOCK_REQUEST_TAG.len() + 56 + chain_id.len() + validator_addr.len(),
    );
    msg.extend_from_slice(BUILD_BLOCK_REQUEST_TAG);
    put_bytes(&mut msg, chain_id.as_bytes());
    msg.extend_from_slice(&height.to_be_bytes());
    put_bytes(&mut msg, validator_addr.as_bytes());
    msg.extend_from_slice(&max_bytes.to_be_bytes());
    msg.extend_from_slice(&max_gas.to_be_bytes());
    msg.extend_from_slice(txs_hash);
    msg
}

fn put_bytes(msg: &mut Vec<u8>, bytes: &[u8]) {
    msg.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    msg.extend_from_slice(bytes);
}

//
// Bech32 (BIP-173), used for payment address validation and test fixtures.
//

const BECH32_CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

const BECH32_GENERATOR: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];

fn bech32_polymod(values: &[u8]) -> u32 {
    let mut chk: u32 = 1;
    for &v in values {
        let top = chk >> 25;
        chk = ((chk & 0x01ff_ffff) << 5) ^ u32::from(v);
        for (i, gen) in BECH32_GENERATOR.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= gen;
            }
        }
    }
    chk
}

fn bech32_hrp_expand(hrp: &str) -> Vec<u8> {
    let bytes = hrp.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() * 2 + 1);
    out.extend(bytes.iter().map(|b| b >> 5));
    out.push(0);
    out.extend(bytes.iter().map(|b| b & 0x1f));
    out
}

fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Result<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut out = Vec::new();
    let maxv: u32 = (1 << to) - 1;
    for &v in data {
        if u32::from(v) >> from != 0 {
            return Err(Error::new_ext(ErrorKind::InvalidRequest, "invalid data value"));
        }
        acc = (acc << from) | u32::from(v);
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & maxv) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & maxv) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & maxv) != 0 {
        return Err(Error::new_ext(ErrorKind::InvalidRequest, "invalid padding"));
    }
    Ok(out)
}

/// Encode a Bech32 string from a human-readable part and an 8-bit payload.
pub fn bech32_encode(hrp: &str, payload: &[u8]) -> String {
    let data = convert_bits(payload, 8, 5, true).expect("8-bit input is always convertible");

    let mut values = bech32_hrp_expand(hrp);
    values.extend_from_slice(&data);
    values.extend_from_slice(&[0; 6]);
    let polymod = bech32_polymod(&values) ^ 1;

    let mut out = String::with_capacity(hrp.len() + 1 + data.len() + 6);
    out.push_str(hrp);
    out.push('1');
    for v in data {
        out.push(BECH32_CHARSET[v as usize] as char);
    }
    for i in 0..6 {
        let v = (polymod >> (5 * (5 - i))) & 0x1f;
        out.push(BECH32_CHARSET[v as usize] as char);
    }
    out
}

/// Decode a Bech32 string into its human-readable part and 8-bit payload.
pub fn bech32_decode(addr: &str) -> Result<(String, Vec<u8>)> {
    let invalid = |msg: &str| Error::new_ext(ErrorKind::InvalidRequest, msg.to_string());

    if addr.len() > 90 {
        return Err(invalid("address too long"));
    }
    let has_lower = addr.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = addr.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(invalid("mixed case"));
    }
    let addr = addr.to_ascii_lowercase();

    let sep = addr.rfind('1').ok_or_else(|| invalid("missing separator"))?;
    if sep == 0 || sep + 7 > addr.len() {
        return Err(invalid("invalid separator position"));
    }
    let (hrp, data_part) = (&addr[..sep], &addr[sep + 1..]);
    if hrp.bytes().any(|b| !(33..=126).contains(&b)) {
        return Err(invalid("invalid human-readable part"));
    }

    let mut data = Vec::with_capacity(data_part.len());
    for c in data_part.bytes() {
        let v = BECH32_CHARSET
            .iter()
            .position(|&b| b == c)
            .ok_or_else(|| invalid("invalid data character"))?;
        data.push(v as u8);
    }

    let mut values = bech32_hrp_expand(hrp);
    values.extend_from_slice(&data);
    if bech32_polymod(&values) != 1 {
        return Err(invalid("checksum mismatch"));
    }

    let payload = convert_bits(&data[..data.len() - 6], 5, 8, false)?;
    Ok((hrp.to_string(), payload))
}
