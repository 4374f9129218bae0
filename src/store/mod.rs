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

//! Transactional persistence of chains, validators, challenges, auctions and
//! bids.
//!
//! The engine consumes the [Store] trait; backends own their physical form
//! and their locking. Transactions are serializable: everything inside
//! commits or nothing does, and competing claims of the same auction
//! serialize, with the loser observing the winner's writes.

use crate::error::*;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

pub mod memstore;

pub use memstore::MemStore;

/// Challenges are single-use and short-lived; anything older is garbage.
pub const CHALLENGE_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// How many times a serializable transaction is attempted before its
/// conflict is surfaced.
const MAX_TRANSACT_ATTEMPTS: u32 = 3;

/// A chain the operator runs auctions for. Created and updated externally.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub id: String,
    pub network: String,
    pub payment_denom: String,
    pub operator_payment_address: String,
    pub allocation_policy: AllocationPolicy,
    /// Per-request timeout towards this chain's full nodes.
    pub timeout: Duration,
    pub node_uris: Vec<String>,
    /// Auctions older than this are dropped by cleanup. `None` keeps them
    /// forever.
    pub retention: Option<Duration>,
    pub created_at: Option<SystemTime>,
    pub updated_at: Option<SystemTime>,
}

/// How the validator's share of bid payments is determined for a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// The fixed constant share.
    #[default]
    Fixed,
    /// Legacy linear function of registered voting power.
    PowerShare,
}

/// The exclusive right to build the block at (chain, height).
#[derive(Debug, Clone, PartialEq)]
pub struct Auction {
    pub chain_id: String,
    pub height: i64,
    /// Elected proposer at creation time.
    pub validator_address: String,
    pub validator_allocation: f64,
    pub validator_payment_address: String,
    pub operator_payment_address: String,
    pub payment_denom: String,
    /// Voting power of registered validators at creation.
    pub registered_power: i64,
    pub total_power: i64,
    pub created_at: Option<SystemTime>,
    /// The only field that changes after creation. `None` means open.
    pub finished_at: Option<SystemTime>,
}

impl Auction {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// A searcher's offer for an auction.
#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub id: Uuid,
    pub chain_id: String,
    pub height: i64,
    pub kind: BidKind,
    /// Ordered transactions, in their normalized encoding once evaluated.
    pub txs: Vec<Vec<u8>>,
    /// Total payment; higher wins.
    pub priority: i64,
    pub operator_payment: i64,
    pub validator_payment: i64,
    pub payments: Vec<Payment>,
    /// The only field that changes after creation.
    pub state: BidState,
    pub created_at: Option<SystemTime>,
    pub updated_at: Option<SystemTime>,
}

impl Bid {
    /// Bids persisted before the payment breakdown was stored have no
    /// payments; evaluation guarantees at least one.
    pub fn is_evaluated(&self) -> bool {
        !self.payments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub from: String,
    pub to: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidKind {
    /// Must be first in the block; at most one per auction wins.
    Top,
    Block,
}

impl BidKind {
    pub fn parse(s: &str) -> BidKind {
        match s.to_ascii_lowercase().as_str() {
            "block" => BidKind::Block,
            _ => BidKind::Top,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BidKind::Top => "top",
            BidKind::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BidState {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl BidState {
    pub fn parse(s: &str) -> BidState {
        match s.to_ascii_lowercase().as_str() {
            "accepted" => BidState::Accepted,
            "rejected" => BidState::Rejected,
            _ => BidState::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BidState::Pending => "pending",
            BidState::Accepted => "accepted",
            BidState::Rejected => "rejected",
        }
    }
}

/// A registration nonce issued by Apply and consumed (once) by Register.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub id: Uuid,
    pub chain_id: String,
    pub validator_address: String,
    pub pub_key_bytes: Vec<u8>,
    pub pub_key_type: String,
    pub payment_address: String,
    pub challenge: Vec<u8>,
    pub created_at: Option<SystemTime>,
}

/// A validator that completed registration for a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Validator {
    pub chain_id: String,
    pub address: String,
    pub moniker: String,
    pub pub_key_bytes: Vec<u8>,
    pub pub_key_type: String,
    pub payment_address: String,
    pub created_at: Option<SystemTime>,
    pub updated_at: Option<SystemTime>,
}

/// Persistence operations the engine relies on.
///
/// `transact` runs the closure against a transaction-scoped view with
/// serializable isolation. A conflicting transaction fails with the
/// `Conflict` kind; use [transact] for the retrying variant.
pub trait Store: Send + Sync {
    fn transact(&self, f: &mut dyn FnMut(&dyn Store) -> Result<()>) -> Result<()>;

    fn ping(&self) -> Result<()>;

    /// Drop expired challenges and auctions (with their bids) past their
    /// chain's retention.
    fn cleanup(&self) -> Result<()>;

    fn insert_bid(&self, bid: &mut Bid) -> Result<()>;
    fn update_bids(&self, bids: &[Bid]) -> Result<()>;
    /// All bids for an auction, in insertion order.
    fn list_bids(&self, chain_id: &str, height: i64) -> Result<Vec<Bid>>;

    /// Insert, or update `finished_at` on an existing row. No other field of
    /// an existing auction is ever modified.
    fn upsert_auction(&self, auction: &mut Auction) -> Result<()>;
    fn select_auction(&self, chain_id: &str, height: i64) -> Result<Auction>;

    fn insert_challenge(&self, challenge: &mut Challenge) -> Result<()>;
    fn select_challenge(&self, id: &str) -> Result<Challenge>;
    fn delete_challenge(&self, id: &str) -> Result<()>;

    fn upsert_validator(&self, validator: &Validator) -> Result<()>;
    fn select_validator(&self, chain_id: &str, addr: &str) -> Result<Validator>;
    /// All registered validators of a chain, ordered by address.
    fn list_validators(&self, chain_id: &str) -> Result<Vec<Validator>>;

    fn upsert_chain(&self, chain: &Chain) -> Result<()>;
    fn select_chain(&self, id: &str) -> Result<Chain>;
    fn list_chains(&self) -> Result<Vec<Chain>>;
}

/// Run `f` in a serializable transaction, retrying on conflict.
///
/// Only the `Conflict` kind is retried; every other error propagates
/// immediately. `f` must therefore be idempotent across attempts.
pub fn transact(store: &dyn Store, mut f: impl FnMut(&dyn Store) -> Result<()>) -> Result<()> {
    let mut last = None;
    for attempt in 1..=MAX_TRANSACT_ATTEMPTS {
        match store.transact(&mut f) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind == ErrorKind::Conflict => {
                trace!(
                    "transact conflict ({}), attempt {}/{}",
                    err.to_string_full(),
                    attempt,
                    MAX_TRANSACT_ATTEMPTS
                );
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.expect("loop ran at least once"))
}
