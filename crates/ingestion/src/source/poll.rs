use mirrorbot_core_types::SourceTag;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use super::ProducerDeps;

/// Periodic sweep over the wallet's recent signatures. The slowest but
/// most robust producer; anything the push and subscription paths missed
/// lands here within one interval.
pub struct PollSource {
    deps: ProducerDeps,
    interval_seconds: u64,
    signature_limit: u32,
}

impl PollSource {
    pub fn new(deps: ProducerDeps, interval_seconds: u64, signature_limit: u32) -> Self {
        Self {
            deps,
            interval_seconds: interval_seconds.max(1),
            signature_limit: signature_limit.max(1),
        }
    }

    pub async fn run(self) {
        let mut interval = time::interval(Duration::from_secs(self.interval_seconds));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let signatures = match self
                .deps
                .rpc
                .get_signatures_for_address(&self.deps.wallet, self.signature_limit)
                .await
            {
                Ok(signatures) => signatures,
                Err(error) => {
                    warn!(error = %error, "signature poll failed");
                    continue;
                }
            };
            debug!(count = signatures.len(), "signature poll tick");

            // The RPC returns newest first; process oldest first so the
            // pipeline sees the wallet's trades in their on-chain order.
            for signature in signatures.iter().rev() {
                if let Err(error) = self
                    .deps
                    .handle_signature(signature, SourceTag::Poll)
                    .await
                {
                    warn!(signature = %signature, error = %error, "poll handling failed");
                }
            }
        }
    }
}
