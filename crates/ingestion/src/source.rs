use anyhow::Result;
use chrono::Utc;
use mirrorbot_core_types::{SourceTag, SwapDescriptor, TradeSide};
use mirrorbot_execution::pipeline::PipelineHandle;
use mirrorbot_execution::rpc::ChainRpc;
use mirrorbot_storage::SqliteStore;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::parser::SwapParser;
use crate::raw::RawTransaction;

pub mod poll;
pub mod rate_limit;
pub mod subscription;
pub mod webhook;

/// Everything one producer needs: its own store handle (read probes and
/// the not-a-swap marker), the parser, the chain view, and the pipeline.
pub struct ProducerDeps {
    pub store: SqliteStore,
    pub parser: SwapParser,
    pub rpc: Arc<dyn ChainRpc>,
    pub pipeline: Arc<PipelineHandle>,
    pub wallet: String,
}

impl ProducerDeps {
    /// Webhook path: structured event first, then fetched balance deltas,
    /// then the unsafe transfer-list reconstruction.
    pub async fn handle_raw(&self, raw: &RawTransaction) -> Result<()> {
        if self.store.is_processed(&raw.signature)? {
            debug!(signature = %raw.signature, "already processed, skipping");
            return Ok(());
        }

        let parsed = match self.parser.parse_swap_event(raw, SourceTag::Webhook) {
            Some(swap) => Some(swap),
            None => self.parse_via_fallbacks(raw).await,
        };

        match parsed {
            Some(swap) => self.dispatch(swap).await,
            None => self.mark_not_a_swap(&raw.signature),
        }
    }

    /// Subscription/poll path: only a signature is known, so the balance
    /// view is fetched and parsed directly.
    pub async fn handle_signature(&self, signature: &str, source: SourceTag) -> Result<()> {
        if self.store.is_processed(signature)? {
            return Ok(());
        }

        let balances = match self
            .rpc
            .get_transaction_balances(signature, &self.wallet)
            .await
        {
            Ok(balances) => balances,
            Err(error) => {
                warn!(signature, error = %error, "transaction fetch failed");
                return Ok(());
            }
        };
        let parsed = balances
            .as_ref()
            .and_then(|view| self.parser.parse_balances(signature, view, source));

        match parsed {
            Some(swap) => self.dispatch(swap).await,
            None => {
                // A transaction we could not fetch yet may still parse on a
                // later sighting from another source; only a fetched
                // not-a-swap is marked.
                if balances.is_some() {
                    self.mark_not_a_swap(signature)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn parse_via_fallbacks(&self, raw: &RawTransaction) -> Option<SwapDescriptor> {
        match self
            .rpc
            .get_transaction_balances(&raw.signature, &self.wallet)
            .await
        {
            Ok(Some(view)) => {
                if let Some(swap) =
                    self.parser
                        .parse_balances(&raw.signature, &view, SourceTag::WebhookFallback)
                {
                    return Some(swap);
                }
            }
            Ok(None) => {}
            Err(error) => {
                debug!(
                    signature = %raw.signature,
                    error = %error,
                    "balance fetch failed, falling through to transfer list"
                );
            }
        }
        self.parser
            .parse_transfer_list(raw, SourceTag::WebhookFallback)
    }

    /// The pending-buy flag is set BEFORE the submit call so a SELL
    /// arriving concurrently from another producer already observes it.
    async fn dispatch(&self, swap: SwapDescriptor) -> Result<()> {
        if swap.side == TradeSide::Buy {
            self.pipeline.register_pending_buy(&swap.mint);
        }
        let accepted = self.pipeline.submit(&self.store, swap).await?;
        if !accepted {
            warn!("pipeline queue closed, submission dropped");
        }
        Ok(())
    }

    /// Not-a-swap still consumes the signature so redundant sources stop
    /// re-parsing it.
    fn mark_not_a_swap(&self, signature: &str) -> Result<()> {
        self.store.mark_processed(signature, Utc::now())?;
        debug!(signature, "not a swap, signature consumed");
        Ok(())
    }
}
