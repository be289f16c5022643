use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use mirrorbot_execution::breaker::CircuitBreaker;
use mirrorbot_ingestion::{RawTransaction, WebhookIngest};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct WebState {
    pub ingest: Arc<WebhookIngest>,
    pub breaker: Arc<CircuitBreaker>,
}

pub fn router(state: WebState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any);
    Router::new()
        .route("/webhook/:source", post(handle_webhook))
        .route("/healthz", get(handle_healthz))
        .layer(cors)
        .with_state(state)
}

/// Always 200: processing is deferred, the sender must never see
/// backpressure or parse errors.
async fn handle_webhook(
    State(state): State<WebState>,
    Path(source): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let batch = parse_webhook_batch(body);
    if batch.is_empty() {
        debug!(source = %source, "webhook delivery contained no parsable transactions");
    } else {
        debug!(source = %source, batch_len = batch.len(), "webhook delivery accepted");
        state.ingest.enqueue(batch);
    }
    Json(json!({"ok": true}))
}

async fn handle_healthz(State(state): State<WebState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "breaker_open": state.breaker.is_open(Utc::now()),
    }))
}

/// The body is either a JSON array of raw transactions or a single
/// object. Entries that do not deserialize are dropped with a warning.
fn parse_webhook_batch(body: Value) -> Vec<RawTransaction> {
    let items = match body {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawTransaction>(item) {
            Ok(transaction) => Some(transaction),
            Err(error) => {
                warn!(error = %error, "unparsable webhook entry dropped");
                None
            }
        })
        .collect()
}
