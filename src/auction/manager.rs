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

//! Ownership of the chain ID → service map.
//!
//! The set of served chains lives in the store and changes at runtime;
//! `refresh` reconciles the managed services against it and swaps the map in
//! one step, so lookups never observe a half-built generation and never block
//! on a refresh in progress.

use super::Service;
use crate::{chain::Chain, error::*, store::Store};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Should this store chain be served by this instance (e.g. network match).
pub type AllowChainFn = Box<dyn Fn(&crate::store::Chain) -> bool + Send + Sync>;

/// Build the chain adapter for a store chain record.
pub type ConvertChainFn =
    Box<dyn Fn(&crate::store::Chain) -> Result<Arc<dyn Chain>> + Send + Sync>;

/// Build the service for a chain adapter.
pub type CreateServiceFn =
    Box<dyn Fn(Arc<dyn Chain>, Arc<dyn Store>) -> Arc<dyn Service> + Send + Sync>;

pub struct ServiceManager {
    /// `None` for a static manager, which cannot refresh.
    store: Option<Arc<dyn Store>>,
    allow: Option<AllowChainFn>,
    convert: Option<ConvertChainFn>,
    create: Option<CreateServiceFn>,

    managed: Mutex<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceManager {
    pub fn new(
        store: Arc<dyn Store>,
        allow: AllowChainFn,
        convert: ConvertChainFn,
        create: CreateServiceFn,
    ) -> Self {
        ServiceManager {
            store: Some(store),
            allow: Some(allow),
            convert: Some(convert),
            create: Some(create),
            managed: Mutex::new(HashMap::new()),
        }
    }

    /// A fixed set of services, for tests and single-chain deployments.
    pub fn new_static(services: Vec<Arc<dyn Service>>) -> Self {
        let managed = services
            .into_iter()
            .map(|s| (s.chain_id().to_string(), s))
            .collect();
        ServiceManager {
            store: None,
            allow: None,
            convert: None,
            create: None,
            managed: Mutex::new(managed),
        }
    }

    /// Reconcile the managed services with the chains in the store: build a
    /// next-generation map and swap it in. Chains that disappeared are
    /// dropped; chains that stayed get a fresh service, since their
    /// parameters may have changed.
    pub fn refresh(&self) -> Result<()> {
        let store = self.store.as_ref().ok_or_else(|| {
            Error::new_ext(ErrorKind::InvalidRequest, "refresh on static service manager")
        })?;
        let allow = self.allow.as_ref().expect("non-static manager has allow");
        let convert = self.convert.as_ref().expect("non-static manager has convert");
        let create = self.create.as_ref().expect("non-static manager has create");

        let store_chains = store.list_chains()?;

        // Convert outside the lock; conversion may validate addresses etc.
        let mut converted: Vec<(String, Arc<dyn Chain>)> = Vec::new();
        for sc in &store_chains {
            if !allow(sc) {
                trace!("store chain ID {}: ignored", sc.id);
                continue;
            }
            let chain = convert(sc).map_err(|err| {
                error!("store chain ID {}: {}", sc.id, err.to_string_full());
                err
            })?;
            trace!("store chain ID {}: accepted", sc.id);
            converted.push((sc.id.clone(), chain));
        }

        let mut managed = self.managed.lock().unwrap();

        let mut nextgen: HashMap<String, Arc<dyn Service>> = HashMap::new();
        for (id, chain) in converted {
            match managed.contains_key(&id) {
                true => trace!("{}: update existing service", id),
                false => trace!("{}: create new service", id),
            }
            nextgen.insert(id, create(chain, store.clone()));
        }
        for id in managed.keys() {
            if !nextgen.contains_key(id) {
                trace!("{}: remove dropped service", id);
            }
        }

        *managed = nextgen;
        Ok(())
    }

    pub fn get_service(&self, chain_id: &str) -> Option<Arc<dyn Service>> {
        self.managed.lock().unwrap().get(chain_id).cloned()
    }

    pub fn all_services(&self) -> Vec<Arc<dyn Service>> {
        self.managed.lock().unwrap().values().cloned().collect()
    }
}
