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

//! Server assembly: configuration, the service manager, the maintenance
//! loops, and the HTTP listener.

use super::worker::{new_app, State};
use crate::{
    auction::{
        manager::{ConvertChainFn, CreateServiceFn},
        CoreService, Service, ServiceManager,
    },
    error::*,
    store::Store,
};
use async_std::task;
use std::{sync::Arc, time::Duration};

/// Values parsed once at start and immutable thereafter.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Public API listen address, e.g. ":4417".
    pub api_addr: String,
    /// Serve only store chains tagged with this network.
    pub network: String,
    /// How often expired challenges and retained auctions are dropped.
    pub cleanup_interval: Duration,
    /// How often services are reconciled with the chains in the store.
    pub refresh_interval: Duration,
}

impl RunConfig {
    pub fn new(api_addr: &str, network: &str) -> Self {
        RunConfig {
            api_addr: api_addr.to_string(),
            network: network.to_string(),
            cleanup_interval: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_addr.is_empty() {
            return Err(Error::new_ext(ErrorKind::InvalidRequest, "missing API addr"));
        }
        if self.network.is_empty() {
            return Err(Error::new_ext(ErrorKind::InvalidRequest, "missing network"));
        }
        if self.cleanup_interval.is_zero() || self.refresh_interval.is_zero() {
            return Err(Error::new_ext(ErrorKind::InvalidRequest, "zero maintenance interval"));
        }
        Ok(())
    }
}

/// Assemble the service manager, start the maintenance loops, and serve the
/// API until the listener fails. `convert` builds the per-chain adapter,
/// typically an RPC-backed chain wrapped in a validator-set cache.
pub async fn run(cfg: RunConfig, store: Arc<dyn Store>, convert: ConvertChainFn) -> Result<()> {
    cfg.validate()?;

    let manager = {
        let network = cfg.network.clone();
        let create: CreateServiceFn =
            Box::new(|chain, store| Arc::new(CoreService::new(chain, store)));
        let manager = Arc::new(ServiceManager::new(
            store.clone(),
            Box::new(move |sc| sc.network == network),
            convert,
            create,
        ));
        manager.refresh()?;
        manager
    };

    for service in manager.all_services() {
        info!("added chain {}", service.chain_id());
    }

    spawn_cleanup_loop(store.clone(), cfg.cleanup_interval);
    spawn_refresh_loop(manager.clone(), cfg.refresh_interval);

    info!("api addr {}", cfg.api_addr);
    let app = new_app(State { manager, store });
    app.listen(cfg.api_addr)
        .await
        .map_err(|err| Error::new_ext(ErrorKind::NetworkFault, err))
}

fn spawn_cleanup_loop(store: Arc<dyn Store>, interval: Duration) {
    task::spawn(async move {
        loop {
            task::sleep(interval).await;
            if let Err(err) = store.cleanup() {
                error!("store cleanup failed: {}", err.to_string_full());
            }
        }
    });
}

fn spawn_refresh_loop(manager: Arc<ServiceManager>, interval: Duration) {
    task::spawn(async move {
        loop {
            task::sleep(interval).await;
            if let Err(err) = manager.refresh() {
                error!("service refresh failed: {}", err.to_string_full());
            }
        }
    });
}
