//! HTTP routes. Every handler hands one [`Operation`] to the dispatcher on
//! the blocking pool and returns its reply verbatim.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::dispatch::{Dispatcher, Operation, Reply};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher: Arc::new(dispatcher) }
    }
}

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    pub key_name: String,
}

#[derive(Deserialize)]
pub struct XpubQuery {
    pub path: Option<String>,
}

#[derive(Deserialize)]
pub struct SignQuery {
    #[serde(default)]
    pub strict: bool,
}

pub fn create_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/keys", post(create_key))
        .route("/keys/:key", get(get_xpub).post(import_wallet))
        .route("/keys/:key/wallet", post(sign_psbt))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(dispatcher))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "keywarden"}))
}

pub async fn create_key(State(s): State<AppState>, body: Bytes) -> (StatusCode, Json<Value>) {
    let request: CreateKeyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "malformed_input",
                    "message": format!("expected {{\"key_name\": ...}}: {e}"),
                    "retryable": false,
                })),
            )
        }
    };
    run(&s, Operation::CreateKey { name: request.key_name }).await
}

pub async fn get_xpub(
    State(s): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<XpubQuery>,
) -> (StatusCode, Json<Value>) {
    run(&s, Operation::GetXpub { name: key, path: q.path }).await
}

pub async fn import_wallet(State(s): State<AppState>, Path(key): Path<String>, body: Bytes) -> (StatusCode, Json<Value>) {
    run(&s, Operation::ImportWallet { name: key, blob: body.to_vec() }).await
}

pub async fn sign_psbt(
    State(s): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<SignQuery>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    run(&s, Operation::SignPsbt { name: key, psbt: body.to_vec(), strict: q.strict }).await
}

async fn run(state: &AppState, op: Operation) -> (StatusCode, Json<Value>) {
    let dispatcher = state.dispatcher.clone();
    match tokio::task::spawn_blocking(move || dispatcher.dispatch(op)).await {
        Ok(reply) => respond(reply),
        Err(e) => {
            error!(error = %e, "dispatcher task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal", "message": "request worker failed", "retryable": true})),
            )
        }
    }
}

fn respond(reply: Reply) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body))
}
