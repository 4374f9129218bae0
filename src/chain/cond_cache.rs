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

//! Bounded singleflight cache built on per-entry completion latches.
//!
//! Entries are inserted empty and filled exactly once; concurrent readers of
//! a pending entry park on its latch until the filler publishes a result.
//! Eviction is least-recently-used, driven by an explicit access order list.

use crate::error::*;
use futures::future::poll_fn;
use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex},
    task::{Poll, Waker},
};

pub(crate) struct CondCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    cache: HashMap<K, Arc<CondItem<V>>>,
    order: Seq<K>,
}

impl<K, V> CondCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(limit: usize) -> Self {
        CondCache {
            inner: Mutex::new(Inner {
                cache: HashMap::new(),
                order: Seq { set: Vec::new(), max: limit },
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().cache.len()
    }

    /// Return the cached value for `key`, or run `fill` to produce it.
    ///
    /// Among concurrent callers of a missing key exactly one runs `fill`; the
    /// rest wait on the entry's latch and observe the same result. A failed
    /// fill is published to the waiters and then evicted, so the next caller
    /// retries. If the filling caller is dropped mid-fill, the latch is
    /// failed with `Cancelled` instead of wedging the waiters.
    pub async fn get<F, Fut>(&self, key: K, fill: F) -> Result<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        // Get the item from the cache, or insert an empty one.
        let (item, valid) = self.slot(&key);

        // An existing item either has a result or someone is filling it.
        if valid {
            return item.wait().await;
        }

        // The item is fresh and filling it is on us.
        let guard = FillGuard { cache: self, key: &key, item: &item };
        let res = fill(key.clone()).await;
        guard.finish(res)
    }

    /// Return the item for `key`, creating an empty one if absent. The bool
    /// tells the caller whether the item can be awaited directly (true) or
    /// must be filled by them (false). Also enforces the capacity bound,
    /// dropping the least-recently accessed keys.
    fn slot(&self, key: &K) -> (Arc<CondItem<V>>, bool) {
        let mut inner = self.inner.lock().unwrap();

        let evicted = inner.order.poke(key);
        for kill in evicted {
            inner.cache.remove(&kill);
        }

        if let Some(item) = inner.cache.get(key) {
            return (item.clone(), true);
        }

        let item = Arc::new(CondItem::new());
        inner.cache.insert(key.clone(), item.clone());
        (item, false)
    }

    fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        inner.cache.remove(key);
        inner.order.drop_key(key);
    }
}

/// Publishes the fill result exactly once, even when the filling future is
/// dropped before completion: the drop path fails the latch so waiters are
/// released, and removes the entry so the next caller retries.
struct FillGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    cache: &'a CondCache<K, V>,
    key: &'a K,
    item: &'a Arc<CondItem<V>>,
}

impl<'a, K, V> FillGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn finish(self, res: Result<V>) -> Result<V> {
        self.item.set(res.clone());
        if res.is_err() {
            self.cache.remove(self.key);
        }
        std::mem::forget(self);
        res
    }
}

impl<'a, K, V> Drop for FillGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        self.item.set(Err(Error::new_ext(ErrorKind::Cancelled, "fill abandoned")));
        self.cache.remove(self.key);
    }
}

/// A completion latch: a slot that is written once and read many times, with
/// readers parking until the write happens.
struct CondItem<V> {
    state: Mutex<ItemState<V>>,
}

struct ItemState<V> {
    ready: Option<Result<V>>,
    wakers: Vec<Waker>,
}

impl<V: Clone> CondItem<V> {
    fn new() -> Self {
        CondItem {
            state: Mutex::new(ItemState { ready: None, wakers: Vec::new() }),
        }
    }

    /// Publish the result and wake every parked reader. Subsequent calls are
    /// no-ops, the first result wins.
    fn set(&self, res: Result<V>) {
        let mut state = self.state.lock().unwrap();
        if state.ready.is_none() {
            state.ready = Some(res);
            for waker in state.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    /// Wait for the result. Returns immediately if already published.
    async fn wait(&self) -> Result<V> {
        poll_fn(|cx| {
            let mut state = self.state.lock().unwrap();
            match &state.ready {
                Some(res) => Poll::Ready(res.clone()),
                None => {
                    if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                        state.wakers.push(cx.waker().clone());
                    }
                    Poll::Pending
                }
            }
        })
        .await
    }
}

/// Access-order line for LRU eviction. Front is oldest.
struct Seq<K> {
    set: Vec<K>,
    max: usize,
}

impl<K: PartialEq + Clone> Seq<K> {
    /// Move `key` to the back of the line, adding it if absent. Returns the
    /// keys that fell off the front, which the caller must drop too.
    fn poke(&mut self, key: &K) -> Vec<K> {
        match self.set.iter().position(|k| k == key) {
            Some(i) => {
                let k = self.set.remove(i);
                self.set.push(k);
            }
            None => self.set.push(key.clone()),
        }

        if self.set.len() > self.max {
            let overflow = self.set.len() - self.max;
            self.set.drain(..overflow).collect()
        } else {
            Vec::new()
        }
    }

    fn drop_key(&mut self, key: &K) {
        self.set.retain(|k| k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::{channel, task};
    use std::time::Duration;

    #[test]
    fn hit_returns_without_filling() {
        task::block_on(async {
            let cache = CondCache::<i64, i64>::new(4);

            assert_eq!(cache.get(1, |k| async move { Ok(k * 10) }).await.unwrap(), 10);
            // A second get must not invoke the fill.
            let v = cache
                .get(1, |_| async move { panic!("fill on cached key") })
                .await
                .unwrap();
            assert_eq!(v, 10);
            assert_eq!(cache.len(), 1);
        });
    }

    #[test]
    fn failed_fill_is_evicted_and_retried() {
        task::block_on(async {
            let cache = CondCache::<i64, i64>::new(4);

            let err = cache
                .get(1, |_| async move { Err(Error::new_ext(ErrorKind::NetworkFault, "boom")) })
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::NetworkFault);
            assert_eq!(cache.len(), 0);

            assert_eq!(cache.get(1, |k| async move { Ok(k + 1) }).await.unwrap(), 2);
        });
    }

    #[test]
    fn lru_eviction_order() {
        task::block_on(async {
            let cache = CondCache::<i64, i64>::new(2);
            let fill = |k: i64| async move { Ok(k) };

            cache.get(1, fill).await.unwrap();
            cache.get(2, fill).await.unwrap();
            cache.get(1, fill).await.unwrap(); // refresh 1
            cache.get(3, fill).await.unwrap(); // evicts 2

            assert_eq!(cache.len(), 2);
            let v = cache.get(2, |_| async move { Ok(-1) }).await.unwrap();
            assert_eq!(v, -1, "2 should have been evicted and refilled");
            let v = cache.get(3, |_| async move { Ok(-1) }).await.unwrap();
            assert_eq!(v, 3, "3 should still be cached");
        });
    }

    #[test]
    fn cancelled_fill_releases_waiters() {
        task::block_on(async {
            let cache = Arc::new(CondCache::<i64, i64>::new(4));
            let (gate_tx, gate_rx) = channel::bounded::<i64>(1);

            // First getter starts a fill that blocks on the gate.
            let c1 = cache.clone();
            let filling = task::spawn(async move {
                c1.get(1, move |_| async move {
                    let v = gate_rx.recv().await.map_err(|_| Error::new(ErrorKind::Internal))?;
                    Ok(v)
                })
                .await
            });
            task::sleep(Duration::from_millis(50)).await;

            // Second getter parks on the pending entry.
            let c2 = cache.clone();
            let waiting = task::spawn(async move { c2.get(1, |k| async move { Ok(k) }).await });
            task::sleep(Duration::from_millis(50)).await;

            // Cancel the filler: the waiter must observe an error, not hang.
            filling.cancel().await;
            let err = waiting.await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Cancelled);

            // And the entry is gone, so the next get refills.
            drop(gate_tx);
            assert_eq!(cache.get(1, |k| async move { Ok(k + 100) }).await.unwrap(), 101);
        });
    }
}
