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

//! HTTP handlers.
//!
//! Requests resolve their chain's service through the manager and delegate;
//! every error surfaces as a JSON body with a status code derived from the
//! error kind. Auction queries are lenient about their encoding: JSON body,
//! urlencoded form body, or URL query, negotiated by content type, all work.

use crate::{
    auction::{BuildParams, Service, ServiceManager},
    cryptoutil,
    error::*,
    store::Store,
};
use serde::Serialize;
use std::sync::Arc;
use tide::{http::mime, Request, Response, StatusCode};

/// Conversion from engine errors to HTTP statuses.
impl From<ErrorKind> for StatusCode {
    fn from(kind: ErrorKind) -> StatusCode {
        use ErrorKind::*;
        match kind {
            AuctionTooOld | AuctionFinished => StatusCode::Gone,
            AuctionTooNew => StatusCode::TooEarly,
            AuctionUnavailable => StatusCode::ExpectationFailed,
            InvalidRequest | NoPayment => StatusCode::BadRequest,
            BadSignature | InvalidKey => StatusCode::Unauthorized,
            NotFound => StatusCode::NotFound,
            Conflict => StatusCode::Conflict,
            NetworkFault => StatusCode::BadGateway,
            Cancelled | StoreFault | Internal => StatusCode::InternalServerError,
        }
    }
}

#[derive(Clone)]
pub struct State {
    pub manager: Arc<ServiceManager>,
    /// Direct store access, needed to look up the chain of a phase-2
    /// registration request, which carries only a challenge ID.
    pub store: Arc<dyn Store>,
}

pub fn new_app(state: State) -> tide::Server<State> {
    let mut app = tide::with_state(state);

    app.at("/-/ping").get(get_ping);
    app.at("/v0/auction").get(get_auction);
    app.at("/v0/bid").post(post_bid);
    app.at("/v0/register").post(post_register);
    app.at("/v0/build").post(post_build_v0);
    app.at("/v1/build").post(post_build_v1);

    app
}

fn respond_ok(body: impl Serialize) -> tide::Result {
    let body = tide::Body::from_json(&body)?;
    Ok(Response::builder(StatusCode::Ok).content_type(mime::JSON).body(body).build())
}

fn respond_error(err: Error) -> tide::Result {
    respond_error_status(err.kind.into(), &err.to_string_full())
}

fn respond_error_status(status: StatusCode, message: &str) -> tide::Result {
    debug!("error response: {} ({})", message, status);
    let body = tide::Body::from_json(&ErrorResponse {
        error: message.to_string(),
        status_code: status as u16,
        status_text: status.canonical_reason().to_string(),
    })?;
    Ok(Response::builder(status).content_type(mime::JSON).body(body).build())
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    status_code: u16,
    status_text: String,
}

fn invalid(errs: Vec<&str>) -> Error {
    Error::new_ext(ErrorKind::InvalidRequest, errs.join("; "))
}

//
// Ping.
//

async fn get_ping(req: Request<State>) -> tide::Result {
    let services = req.state().manager.all_services();
    if services.is_empty() {
        return respond_error_status(StatusCode::ServiceUnavailable, "no services");
    }

    let results = futures::future::join_all(services.iter().map(|s| s.ping())).await;
    for result in results {
        if let Err(err) = result {
            return respond_error(err);
        }
    }

    respond_ok(serde_json::json!({}))
}

//
// Auction.
//

#[derive(Deserialize, Default, Debug)]
struct AuctionRequest {
    #[serde(default)]
    chain_id: String,
    #[serde(default)]
    height: i64,
}

impl AuctionRequest {
    fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();
        if self.chain_id.is_empty() {
            errs.push("no chain ID");
        }
        if self.height <= 0 {
            errs.push("invalid height");
        }
        match errs.is_empty() {
            true => Ok(()),
            false => Err(invalid(errs)),
        }
    }

    fn apply_pairs<'a>(&mut self, pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>) {
        for (key, value) in pairs {
            match key.as_ref() {
                "chain_id" if !value.is_empty() => self.chain_id = value.into_owned(),
                "height" => {
                    if let Ok(height) = value.parse() {
                        self.height = height;
                    }
                }
                _ => {}
            }
        }
    }

    fn apply_form_body(&mut self, body: &str) {
        // Lean on the URL parser for percent decoding.
        if let Ok(url) = tide::http::Url::parse(&format!("http://form/?{}", body)) {
            self.apply_pairs(url.query_pairs());
        }
    }
}

/// Auction requests arrive as JSON, urlencoded form data, or URL query
/// parameters. The content type picks the parser; without a usable one, all
/// three are attempted, later sources overriding earlier.
async fn parse_auction_request(req: &mut Request<State>) -> Result<AuctionRequest> {
    let content_type = req.content_type().map(|m| m.essence().to_string());

    let mut auction_req = AuctionRequest::default();
    match content_type.as_deref() {
        Some("application/json") => {
            auction_req = req
                .body_json()
                .await
                .map_err(|err| Error::new_ext(ErrorKind::InvalidRequest, err.to_string()))?;
        }
        Some("application/x-www-form-urlencoded") => {
            let body = req
                .body_string()
                .await
                .map_err(|err| Error::new_ext(ErrorKind::InvalidRequest, err.to_string()))?;
            auction_req.apply_form_body(&body);
        }
        _ => {
            trace!("auction request has no usable content type, trying a few things");
            let body = req.body_string().await.unwrap_or_default();
            match serde_json::from_str::<AuctionRequest>(&body) {
                Ok(parsed) => auction_req = parsed,
                Err(err) => trace!("JSON parse failed: {}", err),
            }
            auction_req.apply_form_body(&body);
            let url = req.url().clone();
            auction_req.apply_pairs(url.query_pairs());
        }
    }

    auction_req.validate()?;
    Ok(auction_req)
}

#[derive(Serialize)]
struct AuctionResponse {
    chain_id: String,
    height: i64,
    payments: Vec<PaymentTerms>,
}

#[derive(Serialize)]
struct PaymentTerms {
    address: String,
    allocation: f64,
    denom: String,
}

async fn get_auction(mut req: Request<State>) -> tide::Result {
    let auction_req = match parse_auction_request(&mut req).await {
        Ok(r) => r,
        Err(err) => return respond_error(err),
    };

    let service = match req.state().manager.get_service(&auction_req.chain_id) {
        Some(service) => service,
        None => {
            return respond_error(Error::new_ext(
                ErrorKind::InvalidRequest,
                format!("{}: unknown chain ID", auction_req.chain_id),
            ))
        }
    };

    let auction = match service.auction(auction_req.height).await {
        Ok(auction) => auction,
        Err(err) => return respond_error(err),
    };

    respond_ok(AuctionResponse {
        chain_id: auction.chain_id.clone(),
        height: auction.height,
        payments: vec![
            PaymentTerms {
                address: auction.validator_payment_address.clone(),
                allocation: auction.validator_allocation,
                denom: auction.payment_denom.clone(),
            },
            PaymentTerms {
                address: auction.operator_payment_address.clone(),
                allocation: 1.0 - auction.validator_allocation,
                denom: auction.payment_denom.clone(),
            },
        ],
    })
}

//
// Bid.
//

#[derive(Deserialize)]
struct BidRequest {
    #[serde(default)]
    chain_id: String,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    kind: String,
    #[serde(default, with = "b64_list")]
    txs: Vec<Vec<u8>>,
}

#[derive(Serialize)]
struct BidResponse {
    chain_id: String,
    height: i64,
    kind: String,
    tx_hashes: Vec<String>,
}

async fn post_bid(mut req: Request<State>) -> tide::Result {
    let bid_req: BidRequest = match req.body_json().await {
        Ok(r) => r,
        Err(err) => {
            return respond_error(Error::new_ext(ErrorKind::InvalidRequest, err.to_string()))
        }
    };

    let mut errs = Vec::new();
    if bid_req.chain_id.is_empty() {
        errs.push("no chain ID");
    }
    if bid_req.height <= 0 {
        errs.push("invalid height");
    }
    if !errs.is_empty() {
        return respond_error(invalid(errs));
    }

    let service = match req.state().manager.get_service(&bid_req.chain_id) {
        Some(service) => service,
        None => {
            return respond_error(Error::new_ext(
                ErrorKind::InvalidRequest,
                format!("{}: unknown chain ID", bid_req.chain_id),
            ))
        }
    };

    let bid = match service.bid(bid_req.height, &bid_req.kind, bid_req.txs).await {
        Ok(bid) => bid,
        Err(err) => return respond_error(err),
    };

    respond_ok(BidResponse {
        chain_id: bid.chain_id.clone(),
        height: bid.height,
        kind: bid.kind.as_str().to_string(),
        tx_hashes: cryptoutil::hash_txs_hex(&bid.txs),
    })
}

//
// Register (two phases through one endpoint).
//

#[derive(Deserialize, Default)]
struct RegisterRequest {
    // Initial apply request.
    #[serde(default)]
    chain_id: String,
    #[serde(default)]
    validator_address: String,
    #[serde(default)]
    payment_address: String,

    // Second register request.
    #[serde(default)]
    challenge_id: String,
    #[serde(default, with = "b64")]
    signature: Vec<u8>,
}

impl RegisterRequest {
    fn is_apply(&self) -> bool {
        self.challenge_id.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();
        match self.is_apply() {
            true => {
                if self.chain_id.is_empty() {
                    errs.push("no chain ID");
                }
                if self.validator_address.is_empty() {
                    errs.push("no validator address");
                }
                if self.payment_address.is_empty() {
                    errs.push("no payment address");
                }
            }
            false => {
                if self.signature.is_empty() {
                    errs.push("no signature");
                }
            }
        }
        match errs.is_empty() {
            true => Ok(()),
            false => Err(invalid(errs)),
        }
    }
}

#[derive(Serialize, Default)]
struct RegisterResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    challenge_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty", with = "b64")]
    challenge: Vec<u8>,
    #[serde(skip_serializing_if = "String::is_empty")]
    result: String,
}

async fn post_register(mut req: Request<State>) -> tide::Result {
    let mut reg_req: RegisterRequest = match req.body_json().await {
        Ok(r) => r,
        Err(err) => {
            return respond_error(Error::new_ext(ErrorKind::InvalidRequest, err.to_string()))
        }
    };

    if let Err(err) = reg_req.validate() {
        return respond_error(err);
    }

    // Phase-2 requests don't carry a chain ID; recover it from the
    // challenge they reference.
    if !reg_req.is_apply() && reg_req.chain_id.is_empty() {
        match req.state().store.select_challenge(&reg_req.challenge_id) {
            Ok(challenge) => reg_req.chain_id = challenge.chain_id,
            Err(err) => return respond_error(err),
        }
    }

    let service = match req.state().manager.get_service(&reg_req.chain_id) {
        Some(service) => service,
        None => {
            return respond_error(Error::new_ext(
                ErrorKind::InvalidRequest,
                format!("{}: unknown chain ID", reg_req.chain_id),
            ))
        }
    };

    if reg_req.is_apply() {
        let challenge = match service
            .apply(&reg_req.validator_address, &reg_req.payment_address)
            .await
        {
            Ok(challenge) => challenge,
            Err(err) => return respond_error(err),
        };
        respond_ok(RegisterResponse {
            challenge_id: challenge.id.to_string(),
            challenge: challenge.challenge.clone(),
            ..Default::default()
        })
    } else {
        if let Err(err) = service.register(&reg_req.challenge_id, &reg_req.signature).await {
            return respond_error(err);
        }
        respond_ok(RegisterResponse { result: "success".to_string(), ..Default::default() })
    }
}

//
// Build.
//

#[derive(Deserialize)]
struct BuildRequest {
    #[serde(default)]
    chain_id: String,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    validator_address: String,
    #[serde(default)]
    max_bytes: i64,
    #[serde(default)]
    max_gas: i64,
    #[serde(default, with = "b64_list")]
    txs: Vec<Vec<u8>>,
    #[serde(default, with = "b64")]
    signature: Vec<u8>,
}

impl BuildRequest {
    fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();
        if self.chain_id.is_empty() {
            errs.push("chain ID missing");
        }
        if self.height <= 0 {
            errs.push("height missing");
        }
        if self.validator_address.is_empty() {
            errs.push("validator address missing");
        }
        if self.signature.is_empty() {
            errs.push("signature missing");
        }
        match errs.is_empty() {
            true => Ok(()),
            false => Err(invalid(errs)),
        }
    }

    fn into_params(self) -> BuildParams {
        BuildParams {
            height: self.height,
            validator_address: self.validator_address,
            max_bytes: self.max_bytes,
            max_gas: self.max_gas,
            txs: self.txs,
            signature: self.signature,
        }
    }
}

#[derive(Serialize)]
struct BuildResponse {
    #[serde(with = "b64_list")]
    txs: Vec<Vec<u8>>,
    validator_payment: String,
}

async fn post_build_v0(req: Request<State>) -> tide::Result {
    post_build(req, false).await
}

async fn post_build_v1(req: Request<State>) -> tide::Result {
    post_build(req, true).await
}

async fn post_build(mut req: Request<State>, auto_register: bool) -> tide::Result {
    let build_req: BuildRequest = match req.body_json().await {
        Ok(r) => r,
        Err(err) => {
            return respond_error(Error::new_ext(ErrorKind::InvalidRequest, err.to_string()))
        }
    };

    if let Err(err) = build_req.validate() {
        return respond_error(err);
    }

    let service = match req.state().manager.get_service(&build_req.chain_id) {
        Some(service) => service,
        None => {
            return respond_error(Error::new_ext(
                ErrorKind::InvalidRequest,
                format!("{}: unknown chain ID", build_req.chain_id),
            ))
        }
    };

    let params = build_req.into_params();
    let result = match auto_register {
        false => service.build(params).await,
        true => service.build_v1(params).await,
    };

    match result {
        Ok(block) => respond_ok(BuildResponse {
            txs: block.txs,
            validator_payment: block.validator_payment,
        }),
        Err(err) => respond_error(err),
    }
}

//
// Base64 byte fields.
//

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod b64_list {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(list: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(list.len()))?;
        for bytes in list {
            seq.serialize_element(&STANDARD.encode(bytes))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded: Vec<String> = Vec::deserialize(d)?;
        encoded
            .into_iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auction::{CoreService, Service},
        chain::tests::{encode_payment_tx, test_validator, TestChain},
        chain::ValidatorSet,
        store::memstore::tests::test_chain_record,
        store::{MemStore, Validator},
    };
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::{
        sync::atomic::{AtomicU16, Ordering},
        thread,
        time::Duration,
    };

    const HEIGHT: i64 = 123;

    struct Listener {
        addr: String,
        store: Arc<MemStore>,
    }

    fn start_listener() -> Listener {
        let proposer = test_validator("BBBB", 10);
        let valset = ValidatorSet::new(
            HEIGHT,
            vec![test_validator("AAAA", 10), proposer.clone(), test_validator("CCCC", 10)],
        );
        let mut chain = TestChain::new("test-1", HEIGHT, valset);
        chain.predicted_proposer = Some(proposer.clone());
        chain.default_balance = 1_000_000;

        let store = Arc::new(MemStore::new());
        store.upsert_chain(&test_chain_record("test-1")).unwrap();
        store
            .upsert_validator(&Validator {
                chain_id: "test-1".to_string(),
                address: proposer.address.clone(),
                moniker: proposer.moniker.clone(),
                pub_key_bytes: proposer.pub_key_bytes.clone(),
                pub_key_type: proposer.pub_key_type.clone(),
                payment_address: proposer.payment_address.clone(),
                created_at: None,
                updated_at: None,
            })
            .unwrap();

        let service: Arc<dyn Service> =
            Arc::new(CoreService::new(Arc::new(chain), store.clone()));
        let manager = Arc::new(ServiceManager::new_static(vec![service]));
        let state = State { manager, store: store.clone() };

        Listener { addr: spawn_app(new_app(state)), store }
    }

    fn spawn_app(app: tide::Server<State>) -> String {
        static PORT: AtomicU16 = AtomicU16::new(9200);
        let port = PORT.fetch_add(1, Ordering::SeqCst);
        let addr = format!("127.0.0.1:{}", port);

        let listen_addr = addr.clone();
        thread::spawn(move || async_std::task::block_on(app.listen(listen_addr)));

        let url = format!("http://{}", addr);
        let mut trials = 30;
        loop {
            match ureq::get(&format!("{}/-/ping", url)).call() {
                Ok(_) => break,
                Err(ureq::Error::Status(_, _)) => break,
                Err(_) if trials > 0 => {
                    trials -= 1;
                    thread::sleep(Duration::from_millis(100));
                }
                Err(err) => panic!("connection refused: {}", err),
            }
        }
        url
    }

    fn body_json(response: ureq::Response) -> serde_json::Value {
        serde_json::from_str(&response.into_string().unwrap()).unwrap()
    }

    fn error_response(err: ureq::Error) -> (u16, serde_json::Value) {
        match err {
            ureq::Error::Status(code, response) => (code, body_json(response)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    fn bid_tx_b64(listener: &Listener, total: i64) -> (String, Vec<u8>) {
        // The registered proposer's payment address, as recorded on the
        // auction the service materializes.
        let proposer = listener.store.select_validator("test-1", "BBBB").unwrap();
        let txb = encode_payment_tx(
            "zen1searcher",
            &proposer.payment_address,
            "zen1operator",
            total,
            crate::auction::FIXED_ALLOCATION,
            "uzen",
            10,
        );
        (STANDARD.encode(&txb), txb)
    }

    #[test]
    fn ping_ok() {
        let listener = start_listener();

        let response = ureq::get(&format!("{}/-/ping", listener.addr)).call().unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(body_json(response), serde_json::json!({}));
    }

    #[test]
    fn ping_without_services_is_unavailable() {
        let store: Arc<MemStore> = Arc::new(MemStore::new());
        let state = State {
            manager: Arc::new(ServiceManager::new_static(vec![])),
            store: store.clone(),
        };
        let url = spawn_app(new_app(state));

        let err = ureq::get(&format!("{}/-/ping", url)).call().unwrap_err();
        let (code, body) = error_response(err);

        assert_eq!(code, 503);
        assert_eq!(body["error"], "no services");
    }

    #[test]
    fn auction_from_query_params() {
        let listener = start_listener();

        let response = ureq::get(&format!(
            "{}/v0/auction?chain_id=test-1&height={}",
            listener.addr,
            HEIGHT + 1
        ))
        .call()
        .unwrap();

        let body = body_json(response);
        assert_eq!(body["chain_id"], "test-1");
        assert_eq!(body["height"], HEIGHT + 1);
        let payments = body["payments"].as_array().unwrap();
        assert_eq!(payments.len(), 2);
        assert_eq!(payments[0]["allocation"], 0.97);
        assert_eq!(payments[0]["denom"], "uzen");
        assert_eq!(payments[1]["address"], "zen1operator");
    }

    #[test]
    fn auction_from_json_body() {
        let listener = start_listener();

        let response = ureq::request("GET", &format!("{}/v0/auction", listener.addr))
            .set("content-type", "application/json")
            .send_string(&format!(r#"{{"chain_id":"test-1","height":{}}}"#, HEIGHT + 1))
            .unwrap();

        assert_eq!(body_json(response)["height"], HEIGHT + 1);
    }

    #[test]
    fn auction_from_form_body() {
        let listener = start_listener();

        let response = ureq::request("GET", &format!("{}/v0/auction", listener.addr))
            .set("content-type", "application/x-www-form-urlencoded")
            .send_string(&format!("chain_id=test-1&height={}", HEIGHT + 1))
            .unwrap();

        assert_eq!(body_json(response)["height"], HEIGHT + 1);
    }

    #[test]
    fn auction_request_validation() {
        let listener = start_listener();

        let err = ureq::get(&format!("{}/v0/auction", listener.addr)).call().unwrap_err();
        let (code, body) = error_response(err);

        assert_eq!(code, 400);
        let message = body["error"].as_str().unwrap();
        assert!(message.contains("no chain ID"));
        assert!(message.contains("invalid height"));
    }

    #[test]
    fn auction_for_unknown_chain() {
        let listener = start_listener();

        let err = ureq::get(&format!(
            "{}/v0/auction?chain_id=elsewhere&height={}",
            listener.addr,
            HEIGHT + 1
        ))
        .call()
        .unwrap_err();
        let (code, body) = error_response(err);

        assert_eq!(code, 400);
        assert!(body["error"].as_str().unwrap().contains("unknown chain ID"));
    }

    #[test]
    fn bid_round_trip() {
        let listener = start_listener();
        let (tx_b64, txb) = bid_tx_b64(&listener, 1000);

        let response = ureq::post(&format!("{}/v0/bid", listener.addr))
            .send_json(serde_json::json!({
                "chain_id": "test-1",
                "height": HEIGHT + 1,
                "kind": "block",
                "txs": [tx_b64],
            }))
            .unwrap();

        let body = body_json(response);
        assert_eq!(body["kind"], "block");
        assert_eq!(
            body["tx_hashes"],
            serde_json::json!([cryptoutil::hash_tx(&txb)])
        );
    }

    #[test]
    fn register_two_phases() {
        let listener = start_listener();

        // Phase 1: apply.
        let response = ureq::post(&format!("{}/v0/register", listener.addr))
            .send_json(serde_json::json!({
                "chain_id": "test-1",
                "validator_address": "AAAA",
                "payment_address": "zen1payme",
            }))
            .unwrap();
        let body = body_json(response);
        let challenge_id = body["challenge_id"].as_str().unwrap().to_string();
        assert!(!body["challenge"].as_str().unwrap().is_empty());

        // Phase 2: no chain ID on purpose; the handler recovers it from the
        // challenge.
        let response = ureq::post(&format!("{}/v0/register", listener.addr))
            .send_json(serde_json::json!({
                "challenge_id": challenge_id,
                "signature": STANDARD.encode([0u8; 64]),
            }))
            .unwrap();
        assert_eq!(body_json(response)["result"], "success");

        let registered = listener.store.select_validator("test-1", "AAAA").unwrap();
        assert_eq!(registered.payment_address, "zen1payme");
    }

    #[test]
    fn build_then_finished_maps_to_gone() {
        let listener = start_listener();
        let (tx_b64, txb) = bid_tx_b64(&listener, 1000);

        // Place a bid first so the block has content.
        ureq::post(&format!("{}/v0/bid", listener.addr))
            .send_json(serde_json::json!({
                "chain_id": "test-1",
                "height": HEIGHT + 1,
                "kind": "block",
                "txs": [tx_b64],
            }))
            .unwrap();

        let build_request = serde_json::json!({
            "chain_id": "test-1",
            "height": HEIGHT + 1,
            "validator_address": "BBBB",
            "max_bytes": -1,
            "max_gas": -1,
            "txs": [],
            "signature": STANDARD.encode([0u8; 64]),
        });

        let response = ureq::post(&format!("{}/v0/build", listener.addr))
            .send_json(build_request.clone())
            .unwrap();
        let body = body_json(response);
        assert_eq!(body["validator_payment"], "970uzen");
        let txs = body["txs"].as_array().unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0], STANDARD.encode(&txb));

        // The auction is claimed; a second build is Gone.
        let err = ureq::post(&format!("{}/v0/build", listener.addr))
            .send_json(build_request)
            .unwrap_err();
        let (code, body) = error_response(err);
        assert_eq!(code, 410);
        assert_eq!(body["status_text"], "Gone");
    }

    #[test]
    fn build_too_new_maps_to_too_early() {
        let listener = start_listener();

        let err = ureq::post(&format!("{}/v0/build", listener.addr))
            .send_json(serde_json::json!({
                "chain_id": "test-1",
                "height": HEIGHT + 10,
                "validator_address": "BBBB",
                "max_bytes": -1,
                "max_gas": -1,
                "txs": [],
                "signature": STANDARD.encode([0u8; 64]),
            }))
            .unwrap_err();
        let (code, _) = error_response(err);

        assert_eq!(code, 425);
    }

    #[test]
    fn build_request_validation() {
        let listener = start_listener();

        let err = ureq::post(&format!("{}/v0/build", listener.addr))
            .send_json(serde_json::json!({"chain_id": "test-1"}))
            .unwrap_err();
        let (code, body) = error_response(err);

        assert_eq!(code, 400);
        let message = body["error"].as_str().unwrap();
        assert!(message.contains("height missing"));
        assert!(message.contains("validator address missing"));
        assert!(message.contains("signature missing"));
    }
}
