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

//! Per-height validator-set caching in front of a [Chain].
//!
//! Validator sets are requested on every auction touch, are expensive to
//! assemble, and are immutable per height, which makes them ideal cache
//! entries. Entries never expire by time: build paths re-fetch at the latest
//! height and re-derive the proposer, so a stale set is harmless.

use super::{cond_cache::CondCache, ring_cache::RingCache, Chain, Transaction, ValidatorSet};
use crate::error::*;
use async_trait::async_trait;
use std::sync::Arc;

const DEFAULT_CAPACITY: usize = 100;

enum ValsetCache {
    Cond(CondCache<i64, Arc<ValidatorSet>>),
    Ring(RingCache<i64, Arc<ValidatorSet>>),
}

/// A [Chain] decorator that caches `validator_set` per height with
/// singleflight semantics. Every other operation is passed through.
pub struct CachedChain<C> {
    inner: C,
    cache: ValsetCache,
}

impl<C: Chain> CachedChain<C> {
    /// Cache entries on completion latches with explicit LRU ordering.
    pub fn with_cond_cache(inner: C) -> Self {
        CachedChain {
            inner,
            cache: ValsetCache::Cond(CondCache::new(DEFAULT_CAPACITY)),
        }
    }

    /// Cache entries in a fixed ring of slots with per-slot locks.
    pub fn with_ring_cache(inner: C) -> Self {
        CachedChain {
            inner,
            cache: ValsetCache::Ring(RingCache::new(DEFAULT_CAPACITY)),
        }
    }

    /// Number of heights currently cached.
    pub fn cached_heights(&self) -> usize {
        match &self.cache {
            ValsetCache::Cond(c) => c.len(),
            ValsetCache::Ring(c) => c.len(),
        }
    }
}

#[async_trait]
impl<C: Chain> Chain for CachedChain<C> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn validate_payment_address(&self, addr: &str) -> Result<()> {
        self.inner.validate_payment_address(addr)
    }

    fn verify_signature(
        &self,
        pub_key_type: &str,
        pub_key_bytes: &[u8],
        msg: &[u8],
        sig: &[u8],
    ) -> Result<()> {
        self.inner.verify_signature(pub_key_type, pub_key_bytes, msg, sig)
    }

    async fn latest_height(&self) -> Result<i64> {
        self.inner.latest_height().await
    }

    async fn validator_set(&self, height: i64) -> Result<Arc<ValidatorSet>> {
        let inner = &self.inner;
        match &self.cache {
            ValsetCache::Cond(c) => c.get(height, |h| inner.validator_set(h)).await,
            ValsetCache::Ring(c) => c.get(height, |h| inner.validator_set(h)).await,
        }
    }

    fn predict_proposer(&self, valset: &ValidatorSet, height: i64) -> Result<super::Validator> {
        self.inner.predict_proposer(valset, height)
    }

    fn decode_transaction(&self, txb: &[u8]) -> Result<Transaction> {
        self.inner.decode_transaction(txb)
    }

    fn encode_transaction(&self, tx: &Transaction) -> Result<Vec<u8>> {
        self.inner.encode_transaction(tx)
    }

    async fn account_balance(&self, height: i64, addr: &str, denom: &str) -> Result<i64> {
        self.inner.account_balance(height, addr, denom).await
    }

    fn get_payment(&self, msg: &super::Msg, denom: &str) -> Result<super::Transfer> {
        self.inner.get_payment(msg, denom)
    }
}
