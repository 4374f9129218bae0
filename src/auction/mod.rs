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

//! The auction engine: lifecycle endpoints, bid ranking, block packing.

use crate::{
    chain::Chain,
    error::*,
    store::{Auction, Bid, Challenge, Validator},
};
use async_trait::async_trait;

mod builder;
pub mod manager;
pub mod service;

pub use manager::ServiceManager;
pub use service::CoreService;

/// The portion of bid payments that validators receive. Historically an
/// output of [power_share_allocation], until validator pushback fixed it.
pub const FIXED_ALLOCATION: f64 = 0.97;

/// How far a bid's actual payment split may deviate from the auction's
/// allocation, on either side.
pub const ALLOCATION_TOLERANCE: f64 = 0.01;

/// Legacy validator payment allocation: a linear function of the chain's
/// voting power participating in the auction service, meant to incentivize
/// validators to recruit their peers. Output range [0.5, 0.9].
pub fn power_share_allocation(registered_power: i64, total_power: i64) -> f64 {
    const MIN: f64 = 0.5;
    const MAX: f64 = 0.9;
    let power_share = registered_power as f64 / total_power as f64;
    power_share * (MAX - MIN) + MIN
}

/// Resolve a chain's allocation policy to the validator share of an auction.
pub(crate) fn allocation_for(
    policy: crate::store::AllocationPolicy,
    registered_power: i64,
    total_power: i64,
) -> f64 {
    match policy {
        crate::store::AllocationPolicy::Fixed => FIXED_ALLOCATION,
        crate::store::AllocationPolicy::PowerShare => {
            power_share_allocation(registered_power, total_power)
        }
    }
}

/// One auction per height, claimed once and never reopened.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn chain_id(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    /// The open auction for `height`, created on first touch.
    async fn auction(&self, height: i64) -> Result<Auction>;

    /// Evaluate and persist a bid on the auction for `height`.
    async fn bid(&self, height: i64, kind: &str, txs: Vec<Vec<u8>>) -> Result<Bid>;

    /// Registration step 1: issue a signing challenge to a validator.
    async fn apply(&self, validator_addr: &str, payment_addr: &str) -> Result<Challenge>;

    /// Registration step 2: consume the challenge, verify the signature,
    /// record the validator.
    async fn register(&self, challenge_id: &str, signature: &[u8]) -> Result<Validator>;

    /// Claim the auction for `params.height` and assemble the block.
    /// The proposer must have registered beforehand.
    async fn build(&self, params: BuildParams) -> Result<BuiltBlock>;

    /// Like [Service::build], but registers the proposer on the fly instead
    /// of requiring a prior registration.
    async fn build_v1(&self, params: BuildParams) -> Result<BuiltBlock>;
}

/// A proposer's request for block content.
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub height: i64,
    pub validator_address: String,
    /// -1 means no limit.
    pub max_bytes: i64,
    /// -1 means no limit.
    pub max_gas: i64,
    /// The proposer's mempool, in its preferred order.
    pub txs: Vec<Vec<u8>>,
    pub signature: Vec<u8>,
}

/// The assembled block content and what the proposer earns for it,
/// rendered as `"<amount><denom>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltBlock {
    pub txs: Vec<Vec<u8>>,
    pub validator_payment: String,
}

/// Addresses compare case-insensitively wherever payments are classified.
pub(crate) fn same_addr(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

pub(crate) fn tx_byte_count(chain: &dyn Chain, txb: &[u8]) -> Result<i64> {
    Ok(chain.decode_transaction(txb)?.byte_count())
}

pub(crate) fn tx_gas_amount(chain: &dyn Chain, txb: &[u8]) -> Result<i64> {
    Ok(chain.decode_transaction(txb)?.gas_amount())
}
