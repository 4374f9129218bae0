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

//! Abstraction over a specific Tendermint-style chain.
//!
//! The auction engine never talks to a full node directly: everything it
//! needs (heights, validator sets, balances, the transaction codec, signature
//! checks) goes through the [Chain] trait. Network-backed operations are
//! async, pure operations are not, which keeps store transactions free of
//! suspension points.

use crate::{error::*, serialize};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

pub mod cache;
mod cond_cache;
pub mod keys;
pub mod predict;
mod ring_cache;
pub mod rpc;

pub use cache::CachedChain;

/// A single denomination amount.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub denom: String,
    pub amount: i64,
}

/// A message within a transaction.
///
/// The engine only inspects plain transfers; everything else rides along
/// opaquely and is reproduced verbatim in the built block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    Send {
        from: String,
        to: String,
        amount: Vec<Coin>,
    },
    Other {
        type_url: String,
    },
}

/// A decoded transaction.
///
/// `raw` holds the bytes the transaction was decoded from and is not part of
/// the wire form. Encoding a decoded transaction yields its normalized form,
/// which is authoritative; re-encoding the normalized form is a fixed point.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub msgs: Vec<Msg>,
    pub gas: i64,
    #[serde(skip)]
    pub(crate) raw: Vec<u8>,
}

impl Transaction {
    pub fn new(msgs: Vec<Msg>, gas: i64) -> Self {
        Transaction { msgs, gas, raw: vec![] }
    }

    pub fn messages(&self) -> &[Msg] {
        &self.msgs
    }

    /// Size of the encoded form this transaction was decoded from.
    pub fn byte_count(&self) -> i64 {
        self.raw.len() as i64
    }

    pub fn gas_amount(&self) -> i64 {
        self.gas
    }
}

/// A payment carried by a transaction message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub amount: i64,
}

/// A consensus validator as reported by the chain at some height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    pub address: String,
    pub moniker: String,
    pub payment_address: String,
    pub pub_key_type: String,
    pub pub_key_bytes: Vec<u8>,
    pub voting_power: i64,
    /// Proposer priority at the set's height.
    pub proposer_priority: i64,
}

/// The validator set at a specific height. Immutable, shared via `Arc`.
#[derive(Debug, Clone)]
pub struct ValidatorSet {
    pub height: i64,
    pub validators: Vec<Validator>,
    pub total_power: i64,
    index: HashMap<String, usize>,
}

impl ValidatorSet {
    pub fn new(height: i64, validators: Vec<Validator>) -> Self {
        let total_power = validators.iter().map(|v| v.voting_power).sum();
        let index = validators
            .iter()
            .enumerate()
            .map(|(i, v)| (v.address.clone(), i))
            .collect();
        ValidatorSet { height, validators, total_power, index }
    }

    pub fn get(&self, addr: &str) -> Option<&Validator> {
        self.index.get(addr).map(|&i| &self.validators[i])
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.index.contains_key(addr)
    }
}

/// Capabilities the auction engine requires from a chain.
///
/// `latest_height`, `validator_set` and `account_balance` hit the chain's
/// full nodes and may suspend; the rest must be pure. Per-chain adapters are
/// expected to build on [rpc::RpcClients] for the network-backed operations
/// and on [keys] for key handling.
#[async_trait]
pub trait Chain: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Check that `addr` is a well-formed payment address for this chain:
    /// Bech32, expected prefix, 20 or 32 byte payload.
    fn validate_payment_address(&self, addr: &str) -> Result<()>;

    /// Verify `sig` over `msg` against the given public key material.
    fn verify_signature(
        &self,
        pub_key_type: &str,
        pub_key_bytes: &[u8],
        msg: &[u8],
        sig: &[u8],
    ) -> Result<()>;

    /// Height of the chain's most recent block. Fails if every full node is
    /// unreachable, catching up, or stalled.
    async fn latest_height(&self) -> Result<i64>;

    /// Validator set at `height`, with payment addresses resolved.
    async fn validator_set(&self, height: i64) -> Result<Arc<ValidatorSet>>;

    /// Project the proposer for a future `height` from a known set.
    fn predict_proposer(&self, valset: &ValidatorSet, height: i64) -> Result<Validator> {
        predict::next_proposer(valset, height)
    }

    fn decode_transaction(&self, txb: &[u8]) -> Result<Transaction>;

    /// Encode to the normalized byte form.
    fn encode_transaction(&self, tx: &Transaction) -> Result<Vec<u8>>;

    /// Spendable balance of `addr` in `denom` at `height`.
    async fn account_balance(&self, height: i64, addr: &str, denom: &str) -> Result<i64>;

    /// Extract the payment a message carries in `denom`, if any.
    ///
    /// Only the chain's canonical transfer shape is recognized; everything
    /// else yields a `NoPayment` error the caller is expected to skip.
    fn get_payment(&self, msg: &Msg, denom: &str) -> Result<Transfer> {
        let no_payment = |detail: &str| Error::new_ext(ErrorKind::NoPayment, detail.to_string());

        let (from, to, amount) = match msg {
            Msg::Send { from, to, amount } => (from, to, amount),
            Msg::Other { type_url } => {
                return Err(no_payment(&format!("irrelevant msg type {}", type_url)))
            }
        };

        let coin = amount
            .iter()
            .find(|c| c.denom == denom)
            .ok_or_else(|| no_payment("no amount of denom"))?;

        if coin.amount <= 0 {
            return Err(no_payment(&format!("bad amount ({})", coin.amount)));
        }

        Ok(Transfer {
            from: from.clone(),
            to: to.clone(),
            amount: coin.amount,
        })
    }
}

/// Decode `txb` with the reference MessagePack codec.
///
/// Chains whose transactions are already in this form can delegate their
/// codec here; the in-tree test chain does.
pub fn decode_rmp_transaction(txb: &[u8]) -> Result<Transaction> {
    let mut tx: Transaction = serialize::rmp_deserialize(txb)?;
    tx.raw = txb.to_vec();
    Ok(tx)
}

/// Encode to the normalized MessagePack form. Counterpart of
/// [decode_rmp_transaction].
pub fn encode_rmp_transaction(tx: &Transaction) -> Result<Vec<u8>> {
    serialize::rmp_serialize(tx)
}
