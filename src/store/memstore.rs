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

//! In-memory [Store].
//!
//! Serves tests and database-less deployments. Individual operations are
//! atomic behind one mutex; `transact` simply runs the closure against the
//! same store, so there is no cross-operation isolation and no conflict
//! to retry. Single-process deployments don't race between read and claim in
//! practice, the SQL backend is the one that provides true serializability.

use super::*;
use crate::error::*;
use std::{collections::HashMap, sync::Mutex, time::SystemTime};
use uuid::Uuid;

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    bids: HashMap<AuctionKey, Vec<Bid>>,
    auctions: HashMap<AuctionKey, Auction>,
    challenges: HashMap<String, Challenge>,
    validators: HashMap<ValidatorKey, Validator>,
    chains: HashMap<String, Chain>,
}

type AuctionKey = (String, i64);
type ValidatorKey = (String, String);

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }
}

impl Store for MemStore {
    fn transact(&self, f: &mut dyn FnMut(&dyn Store) -> Result<()>) -> Result<()> {
        f(self)
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        let now = SystemTime::now();
        let mut inner = self.inner.lock().unwrap();

        let before = inner.challenges.len();
        inner.challenges.retain(|_, c| match c.created_at {
            Some(created) => match now.duration_since(created) {
                Ok(age) => age <= CHALLENGE_MAX_AGE,
                Err(_) => true,
            },
            None => false,
        });
        trace!("cleanup: deleted {} challenges", before - inner.challenges.len());

        let mut expired: Vec<AuctionKey> = Vec::new();
        for (key, auction) in &inner.auctions {
            let retention = match inner.chains.get(&auction.chain_id).and_then(|c| c.retention) {
                Some(retention) => retention,
                None => continue,
            };
            if let Some(created) = auction.created_at {
                if now.duration_since(created).map_or(false, |age| age >= retention) {
                    expired.push(key.clone());
                }
            }
        }
        for key in &expired {
            inner.auctions.remove(key);
            inner.bids.remove(key);
        }
        trace!("cleanup: deleted {} auctions and their bids", expired.len());

        Ok(())
    }

    fn insert_bid(&self, bid: &mut Bid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if bid.id.is_nil() {
            bid.id = Uuid::new_v4();
        }
        bid.created_at = Some(SystemTime::now());

        let key = (bid.chain_id.clone(), bid.height);
        inner.bids.entry(key).or_default().push(bid.clone());

        Ok(())
    }

    fn update_bids(&self, bids: &[Bid]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        for bid in bids {
            let key = (bid.chain_id.clone(), bid.height);
            if let Some(stored) = inner
                .bids
                .get_mut(&key)
                .and_then(|list| list.iter_mut().find(|b| b.id == bid.id))
            {
                stored.state = bid.state;
                stored.updated_at = Some(SystemTime::now());
            }
        }

        Ok(())
    }

    fn list_bids(&self, chain_id: &str, height: i64) -> Result<Vec<Bid>> {
        let inner = self.inner.lock().unwrap();
        let key = (chain_id.to_string(), height);
        Ok(inner.bids.get(&key).cloned().unwrap_or_default())
    }

    fn upsert_auction(&self, auction: &mut Auction) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let key = (auction.chain_id.clone(), auction.height);
        if let Some(existing) = inner.auctions.get_mut(&key) {
            existing.finished_at = auction.finished_at;
            return Ok(());
        }

        auction.created_at = Some(SystemTime::now());
        inner.auctions.insert(key, auction.clone());

        Ok(())
    }

    fn select_auction(&self, chain_id: &str, height: i64) -> Result<Auction> {
        let inner = self.inner.lock().unwrap();
        let key = (chain_id.to_string(), height);
        inner.auctions.get(&key).cloned().ok_or_else(|| Error::new(ErrorKind::NotFound))
    }

    fn insert_challenge(&self, challenge: &mut Challenge) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        challenge.id = Uuid::new_v4();
        challenge.created_at = Some(SystemTime::now());
        inner.challenges.insert(challenge.id.to_string(), challenge.clone());

        Ok(())
    }

    fn select_challenge(&self, id: &str) -> Result<Challenge> {
        let inner = self.inner.lock().unwrap();
        inner.challenges.get(id).cloned().ok_or_else(|| Error::new(ErrorKind::NotFound))
    }

    fn delete_challenge(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.challenges.remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::new(ErrorKind::NotFound)),
        }
    }

    fn upsert_validator(&self, validator: &Validator) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let key = (validator.chain_id.clone(), validator.address.clone());
        match inner.validators.get_mut(&key) {
            Some(existing) => {
                existing.moniker = validator.moniker.clone();
                existing.payment_address = validator.payment_address.clone();
                existing.updated_at = Some(SystemTime::now());
            }
            None => {
                let mut fresh = validator.clone();
                fresh.created_at = Some(SystemTime::now());
                inner.validators.insert(key, fresh);
            }
        }

        Ok(())
    }

    fn select_validator(&self, chain_id: &str, addr: &str) -> Result<Validator> {
        let inner = self.inner.lock().unwrap();
        let key = (chain_id.to_string(), addr.to_string());
        inner.validators.get(&key).cloned().ok_or_else(|| Error::new(ErrorKind::NotFound))
    }

    fn list_validators(&self, chain_id: &str) -> Result<Vec<Validator>> {
        let inner = self.inner.lock().unwrap();

        let mut validators: Vec<Validator> = inner
            .validators
            .values()
            .filter(|v| v.chain_id == chain_id)
            .cloned()
            .collect();
        validators.sort_by(|a, b| a.address.cmp(&b.address));

        Ok(validators)
    }

    fn upsert_chain(&self, chain: &Chain) -> Result<()> {
        let now = SystemTime::now();
        let mut inner = self.inner.lock().unwrap();

        match inner.chains.get_mut(&chain.id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = chain.clone();
                existing.created_at = created_at;
                existing.updated_at = Some(now);
            }
            None => {
                let mut fresh = chain.clone();
                fresh.created_at = Some(now);
                fresh.updated_at = Some(now);
                inner.chains.insert(chain.id.clone(), fresh);
            }
        }

        Ok(())
    }

    fn select_chain(&self, id: &str) -> Result<Chain> {
        let inner = self.inner.lock().unwrap();
        inner.chains.get(id).cloned().ok_or_else(|| Error::new(ErrorKind::NotFound))
    }

    fn list_chains(&self) -> Result<Vec<Chain>> {
        let inner = self.inner.lock().unwrap();

        let mut chains: Vec<Chain> = inner.chains.values().cloned().collect();
        chains.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(chains)
    }
}
