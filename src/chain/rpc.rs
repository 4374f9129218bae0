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

//! Full-node JSON-RPC plumbing shared by per-chain adapters.
//!
//! A chain is usually served by several full nodes of varying health, so
//! every query walks the configured endpoints in order and returns the first
//! success; only when all of them fail does the caller see an error, carrying
//! every endpoint's failure. Also hosts the node-status interpretation:
//! a node that is catching up or hasn't produced a block within the stall
//! threshold is not an acceptable source for the latest height.

use crate::error::*;
use chrono::{DateTime, Utc};
use isahc::{config::Configurable, AsyncReadResponseExt, HttpClient};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// How long a node may go without a new block before it is considered
/// stalled.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_secs(5 * 60);

const VALIDATORS_PER_PAGE: usize = 100;

/// An ordered set of full-node RPC endpoints for one chain.
pub struct RpcClients {
    endpoints: Vec<String>,
    client: HttpClient,
}

impl RpcClients {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::new_ext(ErrorKind::InvalidRequest, "node URIs required"));
        }

        let client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::new_ext(ErrorKind::NetworkFault, err))?;

        let endpoints = endpoints
            .into_iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();

        Ok(RpcClients { endpoints, client })
    }

    /// GET `path` from the first endpoint that answers with a valid RPC
    /// result. All failures concatenated form the final error.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let mut failures: Vec<String> = Vec::new();

        for endpoint in &self.endpoints {
            let url = format!("{}{}", endpoint, path);
            match self.get_json_one(&url).await {
                Ok(v) => return Ok(v),
                Err(err) => {
                    trace!("{}: {}", url, err.to_string_full());
                    failures.push(format!("{}: {}", endpoint, err.to_string_full()));
                }
            }
        }

        Err(Error::new_ext(ErrorKind::NetworkFault, failures.join("; ")))
    }

    async fn get_json_one<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut response = self
            .client
            .get_async(url)
            .await
            .map_err(|err| Error::new_ext(ErrorKind::NetworkFault, err))?;

        if !response.status().is_success() {
            return Err(Error::new_ext(
                ErrorKind::NetworkFault,
                format!("unexpected HTTP status {}", response.status()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|err| Error::new_ext(ErrorKind::NetworkFault, err))?;

        let envelope: RpcEnvelope<T> = serde_json::from_str(&body)
            .map_err(|err| Error::new_ext(ErrorKind::NetworkFault, err))?;

        match (envelope.result, envelope.error) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) => Err(Error::new_ext(
                ErrorKind::NetworkFault,
                format!("RPC error {}: {}", err.code, err.message),
            )),
            (None, None) => Err(Error::new_ext(ErrorKind::NetworkFault, "empty RPC response")),
        }
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.get_json("/status").await
    }

    /// Latest block height, from the first healthy node. A node that is
    /// catching up or stalled past `stall_threshold` does not count.
    pub async fn latest_height(&self, stall_threshold: Duration) -> Result<i64> {
        let status = self.status().await?;
        status.sync_info.usable_height(stall_threshold, Utc::now())
    }

    /// Full validator set at `height`, walking the paginated endpoint.
    /// Returns the height the node actually reported alongside the set.
    pub async fn validators(&self, height: i64) -> Result<(i64, Vec<RawValidator>)> {
        let mut actual_height = -1i64;
        let mut validators: Vec<RawValidator> = Vec::new();
        let mut page = 1usize;

        loop {
            let path = format!(
                "/validators?height={}&page={}&per_page={}",
                height, page, VALIDATORS_PER_PAGE
            );
            let result: ValidatorsPage = self.get_json(&path).await?;

            let block_height = parse_i64("block_height", &result.block_height)?;
            if validators.is_empty() {
                actual_height = block_height;
            } else if block_height != actual_height {
                return Err(Error::new_ext(
                    ErrorKind::NetworkFault,
                    format!("height discrepancy: {}, {}", actual_height, block_height),
                ));
            }

            let count = parse_i64("count", &result.count)? as usize;
            validators.extend(result.validators);

            if count != VALIDATORS_PER_PAGE {
                return Ok((actual_height, validators));
            }
            page += 1;
        }
    }
}

#[derive(Deserialize, Debug)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize, Debug)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NodeStatus {
    pub sync_info: SyncInfo,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SyncInfo {
    pub latest_block_height: String,
    pub latest_block_time: String,
    pub catching_up: bool,
}

impl SyncInfo {
    /// The height this node can vouch for, or why it can't.
    fn usable_height(&self, stall_threshold: Duration, now: DateTime<Utc>) -> Result<i64> {
        if self.catching_up {
            return Err(Error::new_ext(ErrorKind::NetworkFault, "node is catching up"));
        }

        let block_time = DateTime::parse_from_rfc3339(&self.latest_block_time)
            .map_err(|err| Error::new_ext(ErrorKind::NetworkFault, err))?;
        let age = now.signed_duration_since(block_time);
        if age.num_seconds() > stall_threshold.as_secs() as i64 {
            return Err(Error::new_ext(
                ErrorKind::NetworkFault,
                format!("node appears stalled: last block was {}s ago", age.num_seconds()),
            ));
        }

        parse_i64("latest_block_height", &self.latest_block_height)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RawValidator {
    pub address: String,
    pub pub_key: RawPubKey,
    pub voting_power: String,
    pub proposer_priority: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RawPubKey {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub value: String,
}

impl RawPubKey {
    /// The engine's key type name for this node-reported key.
    pub fn key_type(&self) -> &str {
        match self.type_tag.as_str() {
            "tendermint/PubKeyEd25519" => super::keys::KEY_TYPE_ED25519,
            "tendermint/PubKeySecp256k1" => super::keys::KEY_TYPE_SECP256K1,
            other => other,
        }
    }

    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(&self.value)
            .map_err(|err| Error::new_ext(ErrorKind::InvalidKey, err))
    }
}

#[derive(Deserialize, Debug)]
struct ValidatorsPage {
    block_height: String,
    validators: Vec<RawValidator>,
    count: String,
}

fn parse_i64(field: &str, s: &str) -> Result<i64> {
    s.parse::<i64>()
        .map_err(|err| Error::new_ext(ErrorKind::NetworkFault, format!("{}: {}", field, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sync_info(height: &str, time: &str, catching_up: bool) -> SyncInfo {
        SyncInfo {
            latest_block_height: height.to_string(),
            latest_block_time: time.to_string(),
            catching_up,
        }
    }

    #[test]
    fn usable_height_accepts_fresh_nodes() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 12, 4, 0).unwrap();
        let info = sync_info("12345", "2023-05-01T12:00:00.000000000Z", false);

        let height = info.usable_height(DEFAULT_STALL_THRESHOLD, now).unwrap();

        assert_eq!(height, 12345);
    }

    #[test]
    fn usable_height_rejects_catching_up() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 1).unwrap();
        let info = sync_info("12345", "2023-05-01T12:00:00Z", true);

        let err = info.usable_height(DEFAULT_STALL_THRESHOLD, now).unwrap_err();

        assert!(err.to_string_full().contains("catching up"));
    }

    #[test]
    fn usable_height_rejects_stalled() {
        let now = Utc.with_ymd_and_hms(2023, 5, 1, 13, 0, 0).unwrap();
        let info = sync_info("12345", "2023-05-01T12:00:00Z", false);

        let err = info.usable_height(DEFAULT_STALL_THRESHOLD, now).unwrap_err();

        assert!(err.to_string_full().contains("stalled"));
    }

    #[test]
    fn pub_key_mapping() {
        let key = RawPubKey {
            type_tag: "tendermint/PubKeyEd25519".to_string(),
            value: {
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD.encode([7u8; 32])
            },
        };

        assert_eq!(key.key_type(), super::super::keys::KEY_TYPE_ED25519);
        assert_eq!(key.key_bytes().unwrap(), vec![7u8; 32]);
    }

    #[test]
    fn no_endpoints_is_an_error() {
        assert!(RpcClients::new(vec![], Duration::from_secs(1)).is_err());
    }
}

#[cfg(all(test, feature = "rest"))]
mod server_tests {
    use super::*;
    use async_std::task;
    use std::{
        sync::atomic::{AtomicU16, Ordering},
        thread,
    };

    fn status_body(height: i64) -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": -1,
            "result": {
                "sync_info": {
                    "latest_block_height": height.to_string(),
                    "latest_block_time": Utc::now().to_rfc3339(),
                    "catching_up": false,
                }
            }
        })
    }

    fn start_node(height: i64) -> String {
        static PORT: AtomicU16 = AtomicU16::new(9300);
        let port = PORT.fetch_add(1, Ordering::SeqCst);
        let addr = format!("127.0.0.1:{}", port);

        let mut app = tide::with_state(height);
        app.at("/status").get(|req: tide::Request<i64>| async move {
            let body = tide::Body::from_json(&status_body(*req.state()))?;
            Ok(tide::Response::builder(tide::StatusCode::Ok).body(body).build())
        });
        app.at("/validators").get(|req: tide::Request<i64>| async move {
            // Two pages: 100 validators, then 50.
            let page: usize = req
                .url()
                .query_pairs()
                .find(|(k, _)| k == "page")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(1);
            let (start, count) = match page {
                1 => (0, 100),
                _ => (100, 50),
            };
            let validators: Vec<serde_json::Value> = (start..start + count)
                .map(|i| {
                    serde_json::json!({
                        "address": format!("ADDR{:04}", i),
                        "pub_key": {"type": "tendermint/PubKeyEd25519", "value": ""},
                        "voting_power": "10",
                        "proposer_priority": "0",
                    })
                })
                .collect();
            let body = tide::Body::from_json(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": -1,
                "result": {
                    "block_height": req.state().to_string(),
                    "validators": validators,
                    "count": count.to_string(),
                    "total": "150",
                }
            }))?;
            Ok(tide::Response::builder(tide::StatusCode::Ok).body(body).build())
        });

        let listen_addr = addr.clone();
        thread::spawn(move || task::block_on(app.listen(listen_addr)));

        let url = format!("http://{}", addr);
        let mut trials = 30;
        loop {
            match ureq::get(&format!("{}/status", url)).call() {
                Ok(_) => break,
                Err(_) if trials > 0 => {
                    trials -= 1;
                    thread::sleep(Duration::from_millis(100));
                }
                _ => panic!("connection refused"),
            }
        }
        url
    }

    #[test]
    fn fan_out_skips_dead_endpoints() {
        let live = start_node(777);
        let endpoints = vec!["http://127.0.0.1:9".to_string(), live];
        let clients = RpcClients::new(endpoints, Duration::from_secs(2)).unwrap();

        let height =
            task::block_on(clients.latest_height(DEFAULT_STALL_THRESHOLD)).unwrap();

        assert_eq!(height, 777);
    }

    #[test]
    fn fan_out_concatenates_failures() {
        let endpoints =
            vec!["http://127.0.0.1:9".to_string(), "http://127.0.0.1:10".to_string()];
        let clients = RpcClients::new(endpoints, Duration::from_secs(1)).unwrap();

        let err = task::block_on(clients.status()).unwrap_err();
        let msg = err.to_string_full();

        assert_eq!(err.kind, ErrorKind::NetworkFault);
        assert!(msg.contains("127.0.0.1:9"));
        assert!(msg.contains("127.0.0.1:10"));
    }

    #[test]
    fn validators_paginate() {
        let live = start_node(555);
        let clients = RpcClients::new(vec![live], Duration::from_secs(2)).unwrap();

        let (height, validators) = task::block_on(clients.validators(555)).unwrap();

        assert_eq!(height, 555);
        assert_eq!(validators.len(), 150);
        assert_eq!(validators[0].address, "ADDR0000");
        assert_eq!(validators[149].address, "ADDR0149");
    }
}
