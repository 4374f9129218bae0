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

//! Bounded singleflight cache built on a ring of fixed slots.
//!
//! Each slot carries its own reader-writer lock: readers of a completed slot
//! never contend with fillers of other slots, and concurrent fillers of the
//! same slot serialize on the writer side, with the losers observing the
//! winner's result on a double check. Capacity is enforced by slot reuse:
//! claiming the slot at the ring head evicts whatever key lived there.

use crate::error::*;
use async_std::sync::RwLock;
use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex},
};

pub(crate) struct RingCache<K, V> {
    inner: Mutex<Ring<K, V>>,
}

struct Ring<K, V> {
    index: HashMap<K, usize>, // key -> pos in ring
    ring: Vec<Option<Arc<RingItem<K, V>>>>,
    head: usize,
}

struct RingItem<K, V> {
    key: K,
    cell: RwLock<Option<Result<V>>>,
}

impl<K, V> RingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        RingCache {
            inner: Mutex::new(Ring {
                index: HashMap::with_capacity(capacity),
                ring: (0..capacity).map(|_| None).collect(),
                head: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    pub async fn get<F, Fut>(&self, key: K, fill: F) -> Result<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let item = self.item(&key);

        {
            let cell = item.cell.read().await;
            if let Some(res) = cell.as_ref() {
                return res.clone();
            }
        }

        let mut cell = item.cell.write().await;
        if let Some(res) = cell.as_ref() {
            // Someone beat us to the punch while we queued for the lock.
            return res.clone();
        }

        let res = fill(key.clone()).await;
        *cell = Some(res.clone());
        drop(cell);

        if res.is_err() {
            self.del(&key);
        }

        res
    }

    /// Slot for `key`, claiming (and thereby evicting) the ring head slot
    /// when the key is new.
    fn item(&self, key: &K) -> Arc<RingItem<K, V>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&pos) = inner.index.get(key) {
            if let Some(item) = &inner.ring[pos] {
                return item.clone();
            }
        }

        let head = inner.head;
        if let Some(old) = inner.ring[head].take() {
            inner.index.remove(&old.key);
        }

        let item = Arc::new(RingItem { key: key.clone(), cell: RwLock::new(None) });
        inner.index.insert(key.clone(), head);
        inner.ring[head] = Some(item.clone());
        inner.head = (head + 1) % inner.ring.len();

        item
    }

    fn del(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.index.remove(key) {
            inner.ring[pos] = None;
        }
    }
}
