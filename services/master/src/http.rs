//! Operator HTTP front.
//!
//! Routes (explicit table, built at startup):
//!   GET/PUT  /configure  — read or set the (timeout, agents) defaults
//!   GET      /ping       — ping broadcast, per-route defaults 10000ms / +Inf
//!   GET      /poll       — collect-only for an earlier correlation id
//!   GET/DELETE /missed   — drain the collector into the missed buffer
//!   POST     /<action>   — broadcast <action> with query+body as fields
//!
//! The front only parses and translates; all correlation, deadline, and
//! salvage behavior lives in the engine.  Operator state (missed buffer,
//! last minted id) is keyed by the HTTP connection's peer address and never
//! shared across clients.

use crate::engine::{CollectConfig, Engine, MissedBuffer, Quorum};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fleetbus_protocol::Request;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use url::form_urlencoded;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// One operator connection's private slate.
#[derive(Default)]
pub struct ClientState {
    pub missed: MissedBuffer,
    pub last_req_id: Option<String>,
}

pub struct AppState {
    pub engine: Engine,
    defaults: RwLock<CollectConfig>,
    clients: Mutex<HashMap<SocketAddr, Arc<Mutex<ClientState>>>>,
}

impl AppState {
    pub fn new(engine: Engine) -> Arc<Self> {
        Arc::new(AppState {
            engine,
            defaults: RwLock::new(CollectConfig::default()),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// The calling connection's state, created on first use.
    async fn client(&self, peer: SocketAddr) -> Arc<Mutex<ClientState>> {
        self.clients
            .lock()
            .await
            .entry(peer)
            .or_default()
            .clone()
    }

    /// Forget a connection whose slate is empty again.
    async fn drop_client(&self, peer: SocketAddr) {
        self.clients.lock().await.remove(&peer);
    }
}

/// The wide window `/ping` and `/missed` default to.
fn wide_window() -> CollectConfig {
    CollectConfig {
        timeout: 10_000.0,
        agents: Quorum::All,
    }
}

// ---------------------------------------------------------------------------
// Query/body parsing
// ---------------------------------------------------------------------------

/// Decode urlencoded pairs into a field map; a repeated key becomes an
/// array, matching how list-valued fields (`path`, `env`, `target`) arrive
/// from forms.
fn parse_pairs(input: &str) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in form_urlencoded::parse(input.as_bytes()) {
        let value = Value::String(value.into_owned());
        match map.entry(key.into_owned()) {
            serde_json::map::Entry::Vacant(slot) => {
                slot.insert(value);
            }
            serde_json::map::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if let Value::Array(items) = existing {
                    items.push(value);
                } else {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            }
        }
    }
    map
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Merge URL and body fields; a key present in both is a client error.
fn merge_disjoint(
    url_params: &Map<String, Value>,
    body_params: Map<String, Value>,
) -> Result<Map<String, Value>, Response> {
    let mut merged = body_params;
    for key in merged.keys() {
        if url_params.contains_key(key) {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Duplicate argumets.",
            ));
        }
    }
    merged.extend(url_params.clone());
    Ok(merged)
}

/// Build the broadcast request from merged operator fields.
fn request_from(mut fields: Map<String, Value>, action: &str) -> Result<Request, Response> {
    fields.insert("action".to_owned(), Value::String(action.to_owned()));
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &e.to_string()))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn broadcast(
    state: &AppState,
    peer: SocketAddr,
    request: Request,
    config: CollectConfig,
) -> Response {
    let client = state.client(peer).await;
    let mut client = client.lock().await;
    match state
        .engine
        .send_and_collect(request, config, &mut client.missed)
        .await
    {
        Ok((req_id, replies)) => {
            client.last_req_id = Some(req_id);
            Json(replies).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn configure(
    State(state): State<Arc<AppState>>,
    method: Method,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_pairs(query.as_deref().unwrap_or(""));
    let merged = state.defaults.read().await.overridden(&params);
    if method == Method::PUT {
        debug!(timeout = merged.timeout, "defaults updated");
        *state.defaults.write().await = merged;
    }
    Json(merged).into_response()
}

async fn ping(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_pairs(query.as_deref().unwrap_or(""));
    let config = wide_window().overridden(&params);
    match request_from(params, "ping") {
        Ok(request) => broadcast(&state, peer, request, config).await,
        Err(response) => response,
    }
}

async fn post_action(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let action = uri.path().trim_start_matches('/').to_owned();
    let url_params = parse_pairs(query.as_deref().unwrap_or(""));
    let body_params = parse_pairs(std::str::from_utf8(&body).unwrap_or(""));

    let fields = match merge_disjoint(&url_params, body_params) {
        Ok(fields) => fields,
        Err(response) => return response,
    };
    let config = state.defaults.read().await.overridden(&url_params);
    match request_from(fields, &action) {
        Ok(request) => broadcast(&state, peer, request, config).await,
        Err(response) => response,
    }
}

async fn poll(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_pairs(query.as_deref().unwrap_or(""));
    let config = state.defaults.read().await.overridden(&params);

    let client = state.client(peer).await;
    let mut client = client.lock().await;
    let req_id = params
        .get("req")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| client.last_req_id.clone())
        .or_else(|| state.engine.last_req_id());

    match state
        .engine
        .collect(req_id.as_deref(), config, &mut client.missed)
        .await
    {
        Ok(replies) => Json(replies).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn missed(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    RawQuery(query): RawQuery,
) -> Response {
    let params = parse_pairs(query.as_deref().unwrap_or(""));
    let config = wide_window().overridden(&params);

    let client = state.client(peer).await;
    let mut client = client.lock().await;
    if let Err(e) = state.engine.drain_missed(config, &mut client.missed).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
    }

    let snapshot = client.missed.clone();
    if method == Method::DELETE {
        client.missed.clear();
        let forget = client.last_req_id.is_none();
        drop(client);
        if forget {
            state.drop_client(peer).await;
        }
    }
    Json(json!({ "missed": snapshot })).into_response()
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    // POST on the named routes still broadcasts that name as an action;
    // only the wildcard needs it, but axum resolves static routes first and
    // would answer 405 otherwise.
    Router::new()
        .route("/configure", get(configure).put(configure).post(post_action))
        .route("/ping", get(ping).post(post_action))
        .route("/poll", get(poll).post(post_action))
        .route("/missed", get(missed).delete(missed).post(post_action))
        .route("/{action}", post(post_action))
        .with_state(state)
}
