use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ProducerDeps;
use crate::raw::RawTransaction;
use crate::source::rate_limit::FixedWindowLimiter;

const WEBHOOK_QUEUE_CAPACITY: usize = 256;

/// Push ingestion: the HTTP handler acknowledges immediately and drops the
/// batch here; a single task drains batches sequentially so webhook
/// processing never reorders within a delivery.
pub struct WebhookIngest {
    tx: mpsc::Sender<Vec<RawTransaction>>,
    limiter: FixedWindowLimiter,
}

impl WebhookIngest {
    pub fn spawn(deps: ProducerDeps, rate_limit_per_min: u32) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(WEBHOOK_QUEUE_CAPACITY);
        let worker = tokio::spawn(process_loop(deps, rx));
        (
            Arc::new(Self {
                tx,
                limiter: FixedWindowLimiter::per_minute(rate_limit_per_min),
            }),
            worker,
        )
    }

    /// Returns false when the delivery was shed (rate limit or shutdown);
    /// the HTTP response is 200 either way, the webhook contract never
    /// surfaces backpressure to the sender.
    pub fn enqueue(&self, batch: Vec<RawTransaction>) -> bool {
        if !self.limiter.allow(Utc::now()) {
            warn!(
                batch_len = batch.len(),
                "webhook delivery shed by rate limiter"
            );
            return false;
        }
        match self.tx.try_send(batch) {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, "webhook queue unavailable, delivery dropped");
                false
            }
        }
    }
}

async fn process_loop(deps: ProducerDeps, mut rx: mpsc::Receiver<Vec<RawTransaction>>) {
    info!("webhook processor started");
    while let Some(batch) = rx.recv().await {
        debug!(batch_len = batch.len(), "processing webhook batch");
        for raw in &batch {
            if let Err(error) = deps.handle_raw(raw).await {
                warn!(
                    signature = %raw.signature,
                    error = %error,
                    "webhook transaction handling failed"
                );
            }
        }
    }
    info!("webhook processor stopped");
}
