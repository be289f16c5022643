use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use mirrorbot_core_types::SourceTag;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::ProducerDeps;

/// Long-lived log subscription filtered by the upstream wallet. The loop
/// never returns under normal operation: connection errors back off and
/// reconnect, an idle stream is torn down by the health check.
pub struct SubscriptionSource {
    deps: ProducerDeps,
    ws_url: String,
    health_check_seconds: u64,
    reconnect_initial_ms: u64,
    reconnect_max_ms: u64,
}

impl SubscriptionSource {
    pub fn new(
        deps: ProducerDeps,
        ws_url: impl Into<String>,
        health_check_seconds: u64,
        reconnect_initial_ms: u64,
        reconnect_max_ms: u64,
    ) -> Self {
        Self {
            deps,
            ws_url: ws_url.into(),
            health_check_seconds: health_check_seconds.max(5),
            reconnect_initial_ms: reconnect_initial_ms.max(100),
            reconnect_max_ms: reconnect_max_ms.max(1_000),
        }
    }

    pub async fn run(self) {
        let mut backoff_ms = self.reconnect_initial_ms;
        loop {
            match self.run_connection().await {
                Ok(()) => {
                    backoff_ms = self.reconnect_initial_ms;
                }
                Err(error) => {
                    warn!(error = %error, backoff_ms, "log subscription dropped, reconnecting");
                }
            }
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(self.reconnect_max_ms);
        }
    }

    async fn run_connection(&self) -> Result<()> {
        let (mut stream, _) = connect_async(&self.ws_url)
            .await
            .context("failed connecting log subscription websocket")?;

        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "logsSubscribe",
            "params": [
                {"mentions": [self.deps.wallet]},
                {"commitment": "confirmed"}
            ]
        });
        stream
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("failed sending logsSubscribe")?;
        info!(wallet = %self.deps.wallet, "log subscription established");

        let idle_timeout = Duration::from_secs(self.health_check_seconds);
        loop {
            let message = match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(Some(message)) => message.context("websocket read failed")?,
                Ok(None) => {
                    return Err(anyhow::anyhow!("websocket stream ended"));
                }
                Err(_) => {
                    // Idle health check: a ping that fails tears the
                    // connection down and falls through to reconnect.
                    stream
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("health-check ping failed")?;
                    continue;
                }
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Ping(payload) => {
                    stream
                        .send(Message::Pong(payload))
                        .await
                        .context("failed answering ping")?;
                    continue;
                }
                Message::Close(frame) => {
                    return Err(anyhow::anyhow!("websocket closed: {frame:?}"));
                }
                _ => continue,
            };

            if let Some(signature) = parse_log_notification(&text) {
                if let Err(error) = self
                    .deps
                    .handle_signature(&signature, SourceTag::Subscription)
                    .await
                {
                    warn!(signature = %signature, error = %error, "subscription handling failed");
                }
            }
        }
    }
}

/// Extracts the signature from a logsNotification, skipping failed
/// transactions and subscription acknowledgements.
fn parse_log_notification(text: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(error) => {
            debug!(error = %error, "skipping invalid ws message json");
            return None;
        }
    };

    if value.get("method").and_then(Value::as_str) != Some("logsNotification") {
        return None;
    }
    let event = value.pointer("/params/result/value")?;
    if event.get("err").map(|err| !err.is_null()).unwrap_or(false) {
        return None;
    }
    event
        .get("signature")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}
