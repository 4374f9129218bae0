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

//! Block assembly: rank the bids, reject the unusable, pack the rest.

use super::{service::evaluate_bid, tx_byte_count, tx_gas_amount};
use crate::{
    chain::Chain,
    cryptoutil,
    error::*,
    store::{Auction, Bid, BidState},
};
use std::collections::{HashMap, HashSet};

/// A run of transactions placed in the block from a single source, with the
/// payments it contributes.
pub(crate) struct TxBundle {
    pub source: String,
    pub txs: Vec<Vec<u8>>,
    pub validator_payment: i64,
    pub operator_payment: i64,
}

/// Partition `bids` into winners and rejects and compute the mempool
/// remainder.
///
/// Bids are ranked by priority (total payment) descending, ties on the bid
/// ID. Walking that order, a bid is rejected when it wants top-of-block but
/// the block already has content, when any of its transactions was claimed
/// by a better bid, or when its senders can no longer cover its payments
/// given the payments of the bids accepted ahead of it. Rejected bids have
/// their state set; winners keep theirs until capacity packing settles them.
pub(crate) async fn compute_order(
    chain: &dyn Chain,
    auction: &Auction,
    bids: Vec<Bid>,
    mempool_txs: &[Vec<u8>],
) -> Result<(Vec<Bid>, Vec<Bid>, Vec<Vec<u8>>)> {
    // Bids stored before the payment breakdown was persisted arrive
    // unevaluated; give them a priority now. A bid failing evaluation here is
    // fatal to the request, unlike at submission time where it is the
    // bidder's problem.
    let mut evaluated_bids = Vec::with_capacity(bids.len());
    for mut bid in bids {
        if !bid.is_evaluated() {
            evaluate_bid(chain, auction, &mut bid)?;
        }
        evaluated_bids.push(bid);
    }

    // Capture the balances of every paying address as of the parent height.
    // A failed lookup downgrades the address to a zero balance rather than
    // failing the build.
    let mut sender_balances: HashMap<String, i64> = HashMap::new();
    {
        let mut query_balances: HashSet<&str> = HashSet::new();
        for bid in &evaluated_bids {
            for payment in &bid.payments {
                query_balances.insert(&payment.from);
            }
        }

        for addr in query_balances {
            match chain.account_balance(auction.height - 1, addr, &auction.payment_denom).await {
                Ok(balance) => {
                    sender_balances.insert(addr.to_string(), balance);
                }
                Err(err) => {
                    error!(
                        "get account balance for sender {}: {}",
                        addr,
                        err.to_string_full()
                    );
                }
            }
        }
    }

    // Highest-payment bids first; the ID tie-break keeps the order total.
    evaluated_bids.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then_with(|| a.id.as_bytes().cmp(b.id.as_bytes()))
    });

    let mut winning_bids: Vec<Bid> = Vec::new();
    let mut rejected_bids: Vec<Bid> = Vec::new();
    let mut claimed_txs: HashSet<String> = HashSet::new();

    for mut bid in evaluated_bids {
        // A top-of-block bid is worthless unless it comes first.
        if bid.kind == crate::store::BidKind::Top && !winning_bids.is_empty() {
            trace!("bid {}: rejected, block already has a top-of-block", bid.id);
            bid.state = BidState::Rejected;
            rejected_bids.push(bid);
            continue;
        }

        // Transactions already claimed by a better bid disqualify this one.
        let has_claimed_txs =
            bid.txs.iter().any(|tx| claimed_txs.contains(&cryptoutil::hash_tx(tx)));
        if has_claimed_txs {
            trace!("bid {}: rejected, has claimed txs", bid.id);
            bid.state = BidState::Rejected;
            rejected_bids.push(bid);
            continue;
        }

        // Debit the payments on a scratch copy; commit only on success.
        let mut balances_scratch = sender_balances.clone();
        let mut insufficient_funds = false;
        for payment in &bid.payments {
            let balance = balances_scratch.get(&payment.from).copied().unwrap_or(0);
            let result = balance - payment.amount;
            if result < 0 {
                trace!(
                    "bid {}: payment addr {}: {} - {} = {} -- insufficient funds",
                    bid.id,
                    payment.from,
                    balance,
                    payment.amount,
                    result
                );
                insufficient_funds = true;
                break;
            }
            balances_scratch.insert(payment.from.clone(), result);
        }
        if insufficient_funds {
            bid.state = BidState::Rejected;
            rejected_bids.push(bid);
            continue;
        }

        trace!("bid {}: accepted, priority {}", bid.id, bid.priority);
        sender_balances = balances_scratch;
        for tx in &bid.txs {
            claimed_txs.insert(cryptoutil::hash_tx(tx));
        }
        winning_bids.push(bid);
    }

    // The mempool remainder: whatever the winners didn't already claim.
    let mut remaining_txs: Vec<Vec<u8>> = Vec::new();
    for tx in mempool_txs {
        let hash = cryptoutil::hash_tx(tx);
        if claimed_txs.contains(&hash) {
            continue;
        }
        remaining_txs.push(tx.clone());
        claimed_txs.insert(hash);
    }

    Ok((winning_bids, rejected_bids, remaining_txs))
}

/// Pack winning bids and the mempool tail into the block without exceeding
/// `max_bytes` or `max_gas` (-1 lifts the respective limit). A bid's
/// transactions are taken or left as a unit, and this settles its final
/// state.
///
/// The fill is greedy in the given order, but an oversized high-priority bid
/// is skipped rather than ending the fill: one heavy bid must not deny block
/// space to everything behind it. Mempool transactions get the same per-item
/// treatment. Transactions that cannot be sized are skipped with a trace.
pub(crate) fn select_transactions(
    chain: &dyn Chain,
    winning_bids: Vec<Bid>,
    txs: &[Vec<u8>],
    max_bytes: i64,
    max_gas: i64,
) -> (Vec<TxBundle>, Vec<Bid>, Vec<Bid>, i64, i64) {
    let max_bytes = if max_bytes == -1 { i64::MAX } else { max_bytes };
    let max_gas = if max_gas == -1 { i64::MAX } else { max_gas };

    let mut bundles: Vec<TxBundle> = Vec::new();
    let mut accepted_bids: Vec<Bid> = Vec::new();
    let mut rejected_bids: Vec<Bid> = Vec::new();
    let mut total_bytes = 0i64;
    let mut total_gas = 0i64;

    for mut bid in winning_bids {
        let mut bid_bytes = 0i64;
        let mut bid_gas = 0i64;
        for tx in &bid.txs {
            let tx_bytes = match tx_byte_count(chain, tx) {
                Ok(n) => n,
                Err(err) => {
                    trace!("bid {}: get bytes: {}", bid.id, err.to_string_full());
                    continue;
                }
            };
            let tx_gas = match tx_gas_amount(chain, tx) {
                Ok(n) => n,
                Err(err) => {
                    trace!("bid {}: get gas: {}", bid.id, err.to_string_full());
                    continue;
                }
            };
            bid_bytes += tx_bytes;
            bid_gas += tx_gas;
        }

        let too_many_bytes = total_bytes + bid_bytes > max_bytes;
        let too_much_gas = total_gas + bid_gas > max_gas;
        if too_many_bytes || too_much_gas {
            trace!(
                "bid {}: rejected, too many bytes ({}) {}, too much gas ({}) {}",
                bid.id,
                bid_bytes,
                too_many_bytes,
                bid_gas,
                too_much_gas
            );
            bid.state = BidState::Rejected;
            rejected_bids.push(bid);
            continue;
        }

        trace!(
            "bid {}: accepted, priority {}, bytes {}, gas {}, tx count {}, validator payment {}",
            bid.id,
            bid.priority,
            bid_bytes,
            bid_gas,
            bid.txs.len(),
            bid.validator_payment
        );
        bid.state = BidState::Accepted;
        total_bytes += bid_bytes;
        total_gas += bid_gas;
        bundles.push(TxBundle {
            source: format!("bid {}", bid.id),
            txs: bid.txs.clone(),
            validator_payment: bid.validator_payment,
            operator_payment: bid.operator_payment,
        });
        accepted_bids.push(bid);
    }

    // Mempool txs come next, individually.
    let mut mempool_accept_count = 0usize;
    let mut mempool_reject_count = 0usize;
    for tx in txs {
        let tx_bytes = match tx_byte_count(chain, tx) {
            Ok(n) => n,
            Err(err) => {
                trace!("mempool tx {}: get bytes: {}", cryptoutil::hash_tx(tx), err.to_string_full());
                continue;
            }
        };
        let tx_gas = match tx_gas_amount(chain, tx) {
            Ok(n) => n,
            Err(err) => {
                trace!("mempool tx {}: get gas: {}", cryptoutil::hash_tx(tx), err.to_string_full());
                continue;
            }
        };

        let too_many_bytes = total_bytes + tx_bytes > max_bytes;
        let too_much_gas = total_gas + tx_gas > max_gas;
        if too_many_bytes || too_much_gas {
            mempool_reject_count += 1;
            continue;
        }

        mempool_accept_count += 1;
        total_bytes += tx_bytes;
        total_gas += tx_gas;
        bundles.push(TxBundle {
            source: "mempool".to_string(),
            txs: vec![tx.clone()],
            validator_payment: 0,
            operator_payment: 0,
        });
    }

    trace!("bids: accepted {}, rejected {}", accepted_bids.len(), rejected_bids.len());
    trace!("mempool txs: accepted {}, rejected {}", mempool_accept_count, mempool_reject_count);

    (bundles, accepted_bids, rejected_bids, total_bytes, total_gas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::tests::{encode_payment_tx, encode_tx, TestChain},
        chain::{Coin, Msg, ValidatorSet},
        store::{BidKind, Payment},
        store::memstore::tests::{test_auction, test_bid},
    };
    use async_std::task;
    use uuid::Uuid;

    fn test_chain() -> TestChain {
        TestChain::new("test-1", 9, ValidatorSet::new(9, vec![]))
    }

    fn bid_with_txs(priority: i64, kind: BidKind, txs: Vec<Vec<u8>>) -> Bid {
        let mut bid = test_bid("test-1", 10, priority);
        bid.id = Uuid::new_v4();
        bid.kind = kind;
        bid.txs = txs;
        bid.payments = vec![Payment {
            from: "zen1searcher".to_string(),
            to: "zen1validator".to_string(),
            amount: priority,
        }];
        bid
    }

    fn simple_tx(tag: &str, gas: i64) -> Vec<u8> {
        encode_tx(
            vec![Msg::Send {
                from: format!("zen1{}", tag),
                to: "zen1someone".to_string(),
                amount: vec![Coin { denom: "uzen".to_string(), amount: 1 }],
            }],
            gas,
        )
    }

    #[test]
    fn higher_priority_wins_claimed_txs() {
        task::block_on(async {
            let mut chain = test_chain();
            chain.default_balance = 1_000_000;
            let auction = test_auction("test-1", 10);

            let shared_tx = simple_tx("shared", 10);
            let low = bid_with_txs(100, BidKind::Block, vec![shared_tx.clone()]);
            let high = bid_with_txs(900, BidKind::Block, vec![shared_tx.clone()]);
            let (low_id, high_id) = (low.id, high.id);

            let (winning, rejected, remaining) =
                compute_order(&chain, &auction, vec![low, high], &[]).await.unwrap();

            assert_eq!(winning.iter().map(|b| b.id).collect::<Vec<_>>(), vec![high_id]);
            assert_eq!(rejected.iter().map(|b| b.id).collect::<Vec<_>>(), vec![low_id]);
            assert_eq!(rejected[0].state, BidState::Rejected);
            assert!(remaining.is_empty());
        });
    }

    #[test]
    fn one_top_of_block_per_auction() {
        task::block_on(async {
            let mut chain = test_chain();
            chain.default_balance = 1_000_000;
            let auction = test_auction("test-1", 10);

            let first = bid_with_txs(900, BidKind::Top, vec![simple_tx("a", 10)]);
            let second = bid_with_txs(100, BidKind::Top, vec![simple_tx("b", 10)]);
            let (first_id, second_id) = (first.id, second.id);

            let (winning, rejected, _) =
                compute_order(&chain, &auction, vec![second, first], &[]).await.unwrap();

            assert_eq!(winning.iter().map(|b| b.id).collect::<Vec<_>>(), vec![first_id]);
            assert_eq!(rejected.iter().map(|b| b.id).collect::<Vec<_>>(), vec![second_id]);
        });
    }

    #[test]
    fn top_of_block_rejected_after_block_bid() {
        task::block_on(async {
            let mut chain = test_chain();
            chain.default_balance = 1_000_000;
            let auction = test_auction("test-1", 10);

            let block_bid = bid_with_txs(900, BidKind::Block, vec![simple_tx("a", 10)]);
            let top_bid = bid_with_txs(100, BidKind::Top, vec![simple_tx("b", 10)]);

            let (winning, rejected, _) =
                compute_order(&chain, &auction, vec![block_bid, top_bid], &[]).await.unwrap();

            assert_eq!(winning.len(), 1);
            assert_eq!(winning[0].kind, BidKind::Block);
            assert_eq!(rejected.len(), 1);
            assert_eq!(rejected[0].kind, BidKind::Top);
        });
    }

    #[test]
    fn insufficient_funds_rejects_later_bids() {
        task::block_on(async {
            let mut chain = test_chain();
            chain.balances.insert("zen1searcher".to_string(), 1000);
            let auction = test_auction("test-1", 10);

            // Two bids from the same sender: together they overdraw.
            let big = bid_with_txs(900, BidKind::Block, vec![simple_tx("a", 10)]);
            let small = bid_with_txs(200, BidKind::Block, vec![simple_tx("b", 10)]);
            let (big_id, small_id) = (big.id, small.id);

            let (winning, rejected, _) =
                compute_order(&chain, &auction, vec![small, big], &[]).await.unwrap();

            assert_eq!(winning.iter().map(|b| b.id).collect::<Vec<_>>(), vec![big_id]);
            assert_eq!(rejected.iter().map(|b| b.id).collect::<Vec<_>>(), vec![small_id]);
        });
    }

    #[test]
    fn priority_ties_break_on_bid_id() {
        task::block_on(async {
            let mut chain = test_chain();
            chain.default_balance = 1_000_000;
            let auction = test_auction("test-1", 10);

            let mut a = bid_with_txs(500, BidKind::Block, vec![simple_tx("a", 10)]);
            let mut b = bid_with_txs(500, BidKind::Block, vec![simple_tx("b", 10)]);
            a.id = Uuid::from_bytes([1; 16]);
            b.id = Uuid::from_bytes([2; 16]);

            let (winning, _, _) =
                compute_order(&chain, &auction, vec![b, a], &[]).await.unwrap();

            assert_eq!(winning[0].id, Uuid::from_bytes([1; 16]));
            assert_eq!(winning[1].id, Uuid::from_bytes([2; 16]));
        });
    }

    #[test]
    fn mempool_remainder_skips_claimed_and_duplicate_txs() {
        task::block_on(async {
            let mut chain = test_chain();
            chain.default_balance = 1_000_000;
            let auction = test_auction("test-1", 10);

            let claimed = simple_tx("claimed", 10);
            let free = simple_tx("free", 10);
            let bid = bid_with_txs(500, BidKind::Block, vec![claimed.clone()]);

            let mempool = vec![claimed.clone(), free.clone(), free.clone()];
            let (_, _, remaining) =
                compute_order(&chain, &auction, vec![bid], &mempool).await.unwrap();

            assert_eq!(remaining, vec![free]);
        });
    }

    #[test]
    fn unevaluated_bids_get_evaluated() {
        task::block_on(async {
            let mut chain = test_chain();
            chain.default_balance = 1_000_000;
            let auction = test_auction("test-1", 10);

            let txb = encode_payment_tx(
                "zen1searcher",
                &auction.validator_payment_address,
                &auction.operator_payment_address,
                1000,
                auction.validator_allocation,
                &auction.payment_denom,
                10,
            );
            let mut bid = bid_with_txs(0, BidKind::Block, vec![txb]);
            bid.payments.clear(); // as a legacy row would look

            let (winning, _, _) =
                compute_order(&chain, &auction, vec![bid], &[]).await.unwrap();

            assert_eq!(winning.len(), 1);
            assert_eq!(winning[0].priority, 1000);
            assert!(winning[0].is_evaluated());
        });
    }

    //
    // Capacity packing.
    //

    #[test]
    fn oversized_bid_is_skipped_not_terminal() {
        let chain = test_chain();

        // Each encoded tx is a few dozen bytes; leave room for exactly one.
        let heavy = bid_with_txs(
            900,
            BidKind::Block,
            vec![simple_tx("h1", 10), simple_tx("h2", 10), simple_tx("h3", 10)],
        );
        let light = bid_with_txs(100, BidKind::Block, vec![simple_tx("l", 10)]);
        let light_size = tx_byte_count(&chain, &light.txs[0]).unwrap();
        let (heavy_id, light_id) = (heavy.id, light.id);

        let (bundles, accepted, rejected, used_bytes, used_gas) =
            select_transactions(&chain, vec![heavy, light], &[], light_size, -1);

        assert_eq!(accepted.iter().map(|b| b.id).collect::<Vec<_>>(), vec![light_id]);
        assert_eq!(accepted[0].state, BidState::Accepted);
        assert_eq!(rejected.iter().map(|b| b.id).collect::<Vec<_>>(), vec![heavy_id]);
        assert_eq!(rejected[0].state, BidState::Rejected);
        assert_eq!(bundles.len(), 1);
        assert_eq!(used_bytes, light_size);
        assert_eq!(used_gas, 10);
    }

    #[test]
    fn gas_limit_binds_like_byte_limit() {
        let chain = test_chain();

        let thirsty = bid_with_txs(900, BidKind::Block, vec![simple_tx("t", 100)]);
        let frugal = bid_with_txs(100, BidKind::Block, vec![simple_tx("f", 30)]);
        let frugal_id = frugal.id;

        let (_, accepted, rejected, _, used_gas) =
            select_transactions(&chain, vec![thirsty, frugal], &[], -1, 50);

        assert_eq!(accepted.iter().map(|b| b.id).collect::<Vec<_>>(), vec![frugal_id]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(used_gas, 30);
    }

    #[test]
    fn no_limits_accepts_everything() {
        let chain = test_chain();

        let a = bid_with_txs(900, BidKind::Block, vec![simple_tx("a", 10)]);
        let b = bid_with_txs(100, BidKind::Block, vec![simple_tx("b", 10)]);
        let mempool = vec![simple_tx("m1", 5), simple_tx("m2", 5)];

        let (bundles, accepted, rejected, _, used_gas) =
            select_transactions(&chain, vec![a, b], &mempool, -1, -1);

        assert_eq!(accepted.len(), 2);
        assert!(rejected.is_empty());
        assert_eq!(bundles.len(), 4); // two bid bundles + two mempool singletons
        assert_eq!(used_gas, 10 + 10 + 5 + 5);
        assert_eq!(bundles[0].source, format!("bid {}", accepted[0].id));
        assert_eq!(bundles[2].source, "mempool");
    }

    #[test]
    fn mempool_txs_pack_per_tx() {
        let chain = test_chain();

        let txs = vec![simple_tx("m1", 40), simple_tx("m2", 40), simple_tx("m3", 40)];

        let (bundles, _, _, _, used_gas) =
            select_transactions(&chain, vec![], &txs, -1, 80);

        assert_eq!(bundles.len(), 2);
        assert_eq!(used_gas, 80);
    }

    #[test]
    fn undecodable_txs_are_skipped_with_a_trace() {
        let chain = test_chain();

        let mut bid = bid_with_txs(500, BidKind::Block, vec![b"garbage".to_vec()]);
        bid.payments = vec![Payment {
            from: "zen1searcher".to_string(),
            to: "zen1validator".to_string(),
            amount: 500,
        }];

        let (bundles, accepted, _, used_bytes, _) =
            select_transactions(&chain, vec![bid], &[b"more garbage".to_vec()], -1, -1);

        // The bid is still accepted (its sizing is zero), the mempool
        // garbage is dropped.
        assert_eq!(accepted.len(), 1);
        assert_eq!(bundles.len(), 1);
        assert_eq!(used_bytes, 0);
    }
}
