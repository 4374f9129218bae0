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

//! The per-chain auction service.
//!
//! All lifecycle rules live here: height windows, proposer registration
//! checks, the once-only claim, challenge consumption. Chain reads happen
//! before the store transaction opens; everything inside a transaction is
//! pure store work plus signature checks, so transactions carry no
//! suspension points and retry cleanly.

use super::{
    builder::{compute_order, select_transactions},
    allocation_for, same_addr, BuildParams, BuiltBlock, Service, ALLOCATION_TOLERANCE,
};
use crate::{
    chain::{Chain, ValidatorSet},
    cryptoutil,
    error::*,
    store::{self, Auction, Bid, BidKind, BidState, Challenge, Payment, Store, Validator},
};
use async_trait::async_trait;
use std::{sync::Arc, time::SystemTime};

/// Height window over the latest height within which auctions may be touched.
const AUCTION_MAX_HEIGHT_OFFSET: i64 = 10;

/// Builds commit a block; they only make sense right at the tip.
const BUILD_MAX_HEIGHT_OFFSET: i64 = 2;

/// Nonce length of registration challenges.
const CHALLENGE_BYTES: usize = 32;

pub struct CoreService {
    chain: Arc<dyn Chain>,
    store: Arc<dyn Store>,
}

impl CoreService {
    pub fn new(chain: Arc<dyn Chain>, store: Arc<dyn Store>) -> Self {
        CoreService { chain, store }
    }

    /// Latest height and its validator set, fetched once per request.
    async fn chain_view(&self) -> Result<ChainView> {
        let latest_height = self.chain.latest_height().await?;
        let valset = self.chain.validator_set(latest_height).await?;
        if valset.height != latest_height {
            return Err(Error::new_ext(
                ErrorKind::Internal,
                format!(
                    "mismatch: latest height {}, validator set height {}",
                    latest_height, valset.height
                ),
            ));
        }
        Ok(ChainView { latest_height, valset })
    }

    /// Order, pack and persist: the shared tail of both build variants.
    async fn finish_build(
        &self,
        auction: Auction,
        all_bids: Vec<Bid>,
        params: &BuildParams,
    ) -> Result<BuiltBlock> {
        let chain = self.chain.as_ref();

        trace!("[Build] total bid count {}", all_bids.len());
        for bid in &all_bids {
            for tx in &bid.txs {
                trace!("[Build] {}: {}", bid.id, cryptoutil::hash_tx(tx));
            }
        }
        trace!("[Build] mempool tx count {}", params.txs.len());

        // Pick the winning bids for the auction. Those bids establish an
        // implicit, ordered set of transactions to be included in the block;
        // mempool transactions not claimed by them follow.
        let (winning_bids, losing_bids, remaining_txs) =
            compute_order(chain, &auction, all_bids, &params.txs).await?;

        trace!(
            "[Build] winning bid count {}, losing bid count {}, remaining tx count {}",
            winning_bids.len(),
            losing_bids.len(),
            remaining_txs.len()
        );

        // Select transactions to go in the block, respecting capacity limits.
        let (bundles, accepted_bids, rejected_bids, used_bytes, used_gas) = select_transactions(
            chain,
            winning_bids,
            &remaining_txs,
            params.max_bytes,
            params.max_gas,
        );

        trace!(
            "[Build] accepted bid count {}, capacity-rejected bid count {}",
            accepted_bids.len(),
            rejected_bids.len()
        );
        trace!(
            "[Build] {}/{} bytes, {}/{} gas",
            used_bytes,
            params.max_bytes,
            used_gas,
            params.max_gas
        );

        // Ordering and packing partitioned the bids and set their states;
        // persist the outcome.
        let mut updates = losing_bids;
        updates.extend(rejected_bids);
        updates.extend(accepted_bids);
        self.store.update_bids(&updates)?;

        // Flatten the bundles and total the payments.
        let mut block_txs: Vec<Vec<u8>> = Vec::new();
        let mut validator_payment = 0i64;
        let mut operator_payment = 0i64;
        for bundle in &bundles {
            for tx in &bundle.txs {
                trace!("[Build] block tx {} ({})", cryptoutil::hash_tx(tx), bundle.source);
            }
            block_txs.extend(bundle.txs.iter().cloned());
            validator_payment += bundle.validator_payment;
            operator_payment += bundle.operator_payment;
        }

        trace!("[Build] block tx count {}", block_txs.len());
        trace!("[Build] {} {} to validator", validator_payment, auction.payment_denom);
        trace!("[Build] {} {} to operator", operator_payment, auction.payment_denom);

        Ok(BuiltBlock {
            txs: block_txs,
            validator_payment: format!("{}{}", validator_payment, auction.payment_denom),
        })
    }
}

#[async_trait]
impl Service for CoreService {
    fn chain_id(&self) -> &str {
        self.chain.id()
    }

    async fn ping(&self) -> Result<()> {
        self.store.ping().map_err(|err| Error::new_ext(ErrorKind::StoreFault, err))
    }

    async fn auction(&self, height: i64) -> Result<Auction> {
        trace!("[Auction] requested auction height {}", height);

        let view = self.chain_view().await?;

        let mut auction = None;
        store::transact(self.store.as_ref(), |tx| {
            let (a, _) =
                verify_auction(self.chain.as_ref(), &view, height, AUCTION_MAX_HEIGHT_OFFSET, tx)?;
            auction = Some(a);
            Ok(())
        })?;

        Ok(auction.expect("auction set on transaction success"))
    }

    async fn bid(&self, height: i64, kind: &str, txs: Vec<Vec<u8>>) -> Result<Bid> {
        trace!("[Bid] height {}, kind {}, tx count {}", height, kind, txs.len());

        let auction = self.auction(height).await?;

        let mut bid = Bid {
            id: uuid::Uuid::nil(),
            chain_id: auction.chain_id.clone(),
            height: auction.height,
            kind: BidKind::parse(kind),
            txs,
            priority: 0,
            operator_payment: 0,
            validator_payment: 0,
            payments: Vec::new(),
            state: BidState::Pending,
            created_at: None,
            updated_at: None,
        };

        evaluate_bid(self.chain.as_ref(), &auction, &mut bid)?;

        self.store.insert_bid(&mut bid)?;

        Ok(bid)
    }

    async fn apply(&self, validator_addr: &str, payment_addr: &str) -> Result<Challenge> {
        trace!("[Apply] validator addr {}, payment addr {}", validator_addr, payment_addr);

        self.chain.validate_payment_address(payment_addr)?;

        let view = self.chain_view().await?;

        let validator = view.valset.get(validator_addr).ok_or_else(|| {
            Error::new_ext(
                ErrorKind::InvalidRequest,
                format!(
                    "validator ({}) not in latest validator set ({})",
                    validator_addr, view.valset.height
                ),
            )
        })?;

        let mut challenge = Challenge {
            id: uuid::Uuid::nil(),
            chain_id: self.chain.id().to_string(),
            validator_address: validator.address.clone(),
            pub_key_bytes: validator.pub_key_bytes.clone(),
            pub_key_type: validator.pub_key_type.clone(),
            payment_address: payment_addr.to_string(),
            challenge: cryptoutil::random_bytes(CHALLENGE_BYTES),
            created_at: None,
        };

        self.store.insert_challenge(&mut challenge)?;

        trace!("[Apply] issued challenge ID {}", challenge.id);

        Ok(challenge)
    }

    async fn register(&self, challenge_id: &str, signature: &[u8]) -> Result<Validator> {
        trace!("[Register] challenge ID {}", challenge_id);

        let view = self.chain_view().await?;

        let mut registered = None;
        store::transact(self.store.as_ref(), |tx| {
            let challenge = tx.select_challenge(challenge_id)?;

            // The challenge is burned on any outcome: a failed signature
            // costs the validator a fresh Apply.
            if let Err(err) = tx.delete_challenge(&challenge.id.to_string()) {
                error!(
                    "delete challenge {} from validator {}: {}",
                    challenge_id,
                    challenge.validator_address,
                    err.to_string_full()
                );
            }

            let msg = cryptoutil::register_challenge_sign_bytes(
                &challenge.chain_id,
                &challenge.challenge,
            );
            self.chain.verify_signature(
                &challenge.pub_key_type,
                &challenge.pub_key_bytes,
                &msg,
                signature,
            )?;

            let in_set = view.valset.get(&challenge.validator_address).ok_or_else(|| {
                Error::new_ext(
                    ErrorKind::InvalidRequest,
                    format!(
                        "validator {} not present in validator set",
                        challenge.validator_address
                    ),
                )
            })?;

            let validator = Validator {
                chain_id: challenge.chain_id.clone(),
                address: challenge.validator_address.clone(),
                moniker: in_set.moniker.clone(),
                pub_key_bytes: challenge.pub_key_bytes.clone(),
                pub_key_type: challenge.pub_key_type.clone(),
                payment_address: challenge.payment_address.clone(),
                created_at: None,
                updated_at: None,
            };
            tx.upsert_validator(&validator)?;

            registered = Some(validator);
            Ok(())
        })?;

        trace!("[Register] success");

        Ok(registered.expect("validator set on transaction success"))
    }

    async fn build(&self, params: BuildParams) -> Result<BuiltBlock> {
        let chain_id = self.chain.id().to_string();

        trace!(
            "[Build] height {}, validator addr {}, max bytes {}, max gas {}, tx count {}",
            params.height,
            params.validator_address,
            params.max_bytes,
            params.max_gas,
            params.txs.len()
        );

        let view = self.chain_view().await?;

        // One atomic transaction verifies and claims the auction.
        let mut claimed = None;
        store::transact(self.store.as_ref(), |tx| {
            let (mut auction, proposer) = verify_auction(
                self.chain.as_ref(),
                &view,
                params.height,
                BUILD_MAX_HEIGHT_OFFSET,
                tx,
            )?;

            // This authenticates the request with the public key captured at
            // registration. The validator address is derived from that key
            // by the chain, so a rogue caller can't claim an address they
            // don't own.
            let txs_hash = cryptoutil::hash_txs(&params.txs);
            let msg = cryptoutil::build_block_request_sign_bytes(
                &chain_id,
                params.height,
                &params.validator_address,
                params.max_bytes,
                params.max_gas,
                &txs_hash,
            );
            self.chain.verify_signature(
                &proposer.pub_key_type,
                &proposer.pub_key_bytes,
                &msg,
                &params.signature,
            )?;

            // Mark the auction finished; from here on it can't be reopened.
            auction.finished_at = Some(SystemTime::now());
            tx.upsert_auction(&mut auction)?;

            let bids = tx.list_bids(&chain_id, params.height)?;

            claimed = Some((auction, bids));
            Ok(())
        })?;

        let (auction, all_bids) = claimed.expect("claim set on transaction success");

        self.finish_build(auction, all_bids, &params).await
    }

    async fn build_v1(&self, params: BuildParams) -> Result<BuiltBlock> {
        let chain_id = self.chain.id().to_string();

        trace!(
            "[BuildV1] height {}, validator addr {}, max bytes {}, max gas {}, tx count {}",
            params.height,
            params.validator_address,
            params.max_bytes,
            params.max_gas,
            params.txs.len()
        );

        // Payment metadata for the chain we operate on.
        let chain_row = self.store.select_chain(&chain_id)?;

        let view = self.chain_view().await?;

        // The caller must be the proposer for the requested height.
        let proposer = {
            let min_height = view.latest_height;
            let max_height = view.latest_height + BUILD_MAX_HEIGHT_OFFSET;
            if params.height < min_height {
                return Err(Error::new_ext(
                    ErrorKind::AuctionTooOld,
                    format!("{}/{}", chain_id, params.height),
                ));
            }
            if params.height > max_height {
                return Err(Error::new_ext(
                    ErrorKind::AuctionTooNew,
                    format!("{}/{}", chain_id, params.height),
                ));
            }

            let p = self.chain.predict_proposer(&view.valset, params.height)?;
            if p.address != params.validator_address {
                return Err(Error::new_ext(
                    ErrorKind::InvalidRequest,
                    format!(
                        "wrong proposer {} for height {}, want {}",
                        params.validator_address, params.height, p.address
                    ),
                ));
            }
            p
        };

        // Authenticate with the key the chain reports for the proposer.
        {
            let txs_hash = cryptoutil::hash_txs(&params.txs);
            let msg = cryptoutil::build_block_request_sign_bytes(
                &chain_id,
                params.height,
                &params.validator_address,
                params.max_bytes,
                params.max_gas,
                &txs_hash,
            );
            self.chain.verify_signature(
                &proposer.pub_key_type,
                &proposer.pub_key_bytes,
                &msg,
                &params.signature,
            )?;
        }

        // Register the proposing validator, or refresh their registration.
        self.store.upsert_validator(&Validator {
            chain_id: chain_id.clone(),
            address: proposer.address.clone(),
            moniker: proposer.moniker.clone(),
            pub_key_bytes: proposer.pub_key_bytes.clone(),
            pub_key_type: proposer.pub_key_type.clone(),
            payment_address: proposer.payment_address.clone(),
            created_at: None,
            updated_at: None,
        })?;

        // Claim the auction and collect its bids.
        let mut claimed = None;
        store::transact(self.store.as_ref(), |tx| {
            let mut auction = match tx.select_auction(&chain_id, params.height) {
                Ok(a) => a,
                Err(err) if err.kind == ErrorKind::NotFound => create_auction(
                    &view,
                    &chain_row,
                    &proposer.address,
                    &proposer.payment_address,
                    params.height,
                    tx,
                )?,
                Err(err) => return Err(err),
            };

            if auction.is_finished() {
                return Err(Error::new(ErrorKind::AuctionFinished));
            }

            if auction.validator_address != proposer.address {
                return Err(Error::new_ext(
                    ErrorKind::Internal,
                    format!(
                        "mismatched validators: want {}, have {}",
                        proposer.address, auction.validator_address
                    ),
                ));
            }

            auction.finished_at = Some(SystemTime::now());
            tx.upsert_auction(&mut auction)?;

            let bids = tx.list_bids(&chain_id, params.height)?;

            claimed = Some((auction, bids));
            Ok(())
        })?;

        let (auction, all_bids) = claimed.expect("claim set on transaction success");

        self.finish_build(auction, all_bids, &params).await
    }
}

struct ChainView {
    latest_height: i64,
    valset: Arc<ValidatorSet>,
}

/// Check that an auction at `height` may be touched right now, and return it,
/// materializing it on first touch. The predicted proposer must already be
/// registered.
fn verify_auction(
    chain: &dyn Chain,
    view: &ChainView,
    height: i64,
    max_height_offset: i64,
    tx: &dyn Store,
) -> Result<(Auction, Validator)> {
    let chain_id = chain.id();

    // Verify we operate on the chain.
    let chain_row = tx.select_chain(chain_id)?;

    let min_height = view.latest_height;
    let max_height = view.latest_height + max_height_offset;
    trace!(
        "[verify auction] chain {}, height {}, window [{}, {}]",
        chain_id,
        height,
        min_height,
        max_height
    );

    if height < min_height {
        return Err(Error::new_ext(ErrorKind::AuctionTooOld, format!("{}/{}", chain_id, height)));
    }
    if height > max_height {
        return Err(Error::new_ext(ErrorKind::AuctionTooNew, format!("{}/{}", chain_id, height)));
    }

    let predicted = chain.predict_proposer(&view.valset, height)?;

    let proposer = tx.select_validator(chain_id, &predicted.address).map_err(|err| {
        if err.kind == ErrorKind::NotFound {
            Error::new_ext(
                ErrorKind::AuctionUnavailable,
                format!("proposer {} not registered", predicted.address),
            )
        } else {
            err
        }
    })?;

    // If the auction is in the store, get it. Otherwise, create it.
    let auction = match tx.select_auction(chain_id, height) {
        Ok(a) => a,
        Err(err) if err.kind == ErrorKind::NotFound => {
            trace!("[verify auction] auction not found, creating");
            create_auction(view, &chain_row, &proposer.address, &proposer.payment_address, height, tx)?
        }
        Err(err) => return Err(err),
    };

    if auction.is_finished() {
        return Err(Error::new(ErrorKind::AuctionFinished));
    }

    // Bidders paid the proposer recorded in the auction; if the chain now
    // elects someone else for the height, the auction is unusable.
    if auction.validator_address != proposer.address {
        return Err(Error::new_ext(
            ErrorKind::Internal,
            format!(
                "mismatched validators: want {}, have {}",
                proposer.address, auction.validator_address
            ),
        ));
    }

    Ok((auction, proposer))
}

/// Materialize the auction row for (chain, height).
fn create_auction(
    view: &ChainView,
    chain_row: &store::Chain,
    proposer_addr: &str,
    proposer_payment_addr: &str,
    height: i64,
    tx: &dyn Store,
) -> Result<Auction> {
    // Sum the voting power of registered validators present in the set.
    let mut registered_power = 0i64;
    for v in tx.list_validators(&chain_row.id)? {
        if let Some(in_set) = view.valset.get(&v.address) {
            registered_power += in_set.voting_power;
        }
    }

    let allocation =
        allocation_for(chain_row.allocation_policy, registered_power, view.valset.total_power);

    trace!(
        "[verify auction] power: registered {}, total {}, allocation {:.3}",
        registered_power,
        view.valset.total_power,
        allocation
    );

    let mut auction = Auction {
        chain_id: chain_row.id.clone(),
        height,
        validator_address: proposer_addr.to_string(),
        validator_allocation: allocation,
        validator_payment_address: proposer_payment_addr.to_string(),
        operator_payment_address: chain_row.operator_payment_address.clone(),
        payment_denom: chain_row.payment_denom.clone(),
        registered_power,
        total_power: view.valset.total_power,
        created_at: None,
        finished_at: None,
    };
    tx.upsert_auction(&mut auction)?;

    Ok(auction)
}

/// Evaluate a pending bid against its auction: normalize the transaction
/// encodings, extract the payments, check the allocation split, and set the
/// priority. On error the bid is unusable and should be thrown away.
pub(crate) fn evaluate_bid(chain: &dyn Chain, auction: &Auction, bid: &mut Bid) -> Result<()> {
    let mut validator_payment = 0i64;
    let mut operator_payment = 0i64;
    let mut payments: Vec<Payment> = Vec::new();

    for i in 0..bid.txs.len() {
        let txb = bid.txs[i].clone();

        let tx = match chain.decode_transaction(&txb) {
            Ok(tx) => tx,
            Err(err) => {
                trace!("bid tx {}: decode failed: {}", i, err.to_string_full());
                continue;
            }
        };

        let normalized = match chain.encode_transaction(&tx) {
            Ok(b) => b,
            Err(err) => {
                trace!("bid tx {}: re-encode failed: {}", i, err.to_string_full());
                continue;
            }
        };

        if txb != normalized {
            trace!(
                "bid tx {}: normalization changed {} -> {}",
                i,
                cryptoutil::hash_tx(&txb),
                cryptoutil::hash_tx(&normalized)
            );
        }
        bid.txs[i] = normalized;

        for msg in tx.messages() {
            let transfer = match chain.get_payment(msg, &auction.payment_denom) {
                Ok(t) => t,
                Err(err) => {
                    trace!("bid tx {}: ignoring msg: {}", i, err.to_string_full());
                    continue;
                }
            };

            let to_validator = same_addr(&transfer.to, &auction.validator_payment_address);
            let to_operator = same_addr(&transfer.to, &auction.operator_payment_address);

            if to_validator {
                trace!("{} send {} to {} (validator)", transfer.from, transfer.amount, transfer.to);
                validator_payment += transfer.amount;
            } else if to_operator {
                trace!("{} send {} to {} (operator)", transfer.from, transfer.amount, transfer.to);
                operator_payment += transfer.amount;
            } else {
                trace!(
                    "{} send {} to {} (someone): ignoring",
                    transfer.from,
                    transfer.amount,
                    transfer.to
                );
                continue;
            }

            payments.push(Payment {
                from: transfer.from,
                to: transfer.to,
                amount: transfer.amount,
            });
        }
    }

    let total_payment = validator_payment + operator_payment;
    if total_payment <= 0 {
        return Err(Error::new_ext(ErrorKind::InvalidRequest, "no payments"));
    }

    let want_validator = auction.validator_allocation;
    let want_operator = 1.0 - want_validator;
    let have_validator = validator_payment as f64 / total_payment as f64;
    let have_operator = operator_payment as f64 / total_payment as f64;
    let validator_diff = (want_validator - have_validator).abs();
    let operator_diff = (want_operator - have_operator).abs();

    if validator_diff > ALLOCATION_TOLERANCE || operator_diff > ALLOCATION_TOLERANCE {
        return Err(Error::new_ext(
            ErrorKind::InvalidRequest,
            format!(
                "payment allocation {:.3}/{:.3} doesn't satisfy {:.3}/{:.3}",
                have_validator, have_operator, want_validator, want_operator
            ),
        ));
    }

    bid.priority = total_payment;
    bid.operator_payment = operator_payment;
    bid.validator_payment = validator_payment;
    bid.payments = payments;

    Ok(())
}
