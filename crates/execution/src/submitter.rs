use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use mirrorbot_storage::SqliteStore;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::transaction::VersionedTransaction;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::aggregator::AggregatorApi;
use crate::notify::Notifier;
use crate::risk::TradePlan;
use crate::rpc::{ChainRpc, SignatureStatus};
use crate::{ExecOutcome, FilledTrade};

const CONFIRM_POLL_INTERVAL_MS: u64 = 1_000;
const CONFIRM_MAX_POLLS: u32 = 90;

pub fn keypair_from_base58(encoded: &str) -> Result<Keypair> {
    let bytes = bs58::decode(encoded.trim())
        .into_vec()
        .context("failed decoding base58 keypair")?;
    Keypair::from_bytes(&bytes).map_err(|error| anyhow!("invalid keypair bytes: {error}"))
}

pub fn keypair_pubkey(keypair: &Keypair) -> String {
    keypair.pubkey().to_string()
}

/// Live executor: turns the pre-fetched quote into a signed transaction and
/// broadcasts it. The quote is deliberately never re-fetched between risk
/// evaluation and here.
pub struct LiveExecutor {
    aggregator: Arc<dyn AggregatorApi>,
    rpc: Arc<dyn ChainRpc>,
    keypair: Keypair,
}

impl LiveExecutor {
    pub fn new(
        aggregator: Arc<dyn AggregatorApi>,
        rpc: Arc<dyn ChainRpc>,
        keypair: Keypair,
    ) -> Self {
        Self {
            aggregator,
            rpc,
            keypair,
        }
    }

    pub fn pubkey(&self) -> String {
        self.keypair.pubkey().to_string()
    }

    pub async fn execute(&self, plan: &TradePlan) -> ExecOutcome {
        match self.try_execute(plan).await {
            Ok(filled) => ExecOutcome::Filled(filled),
            Err(error) => ExecOutcome::Failed {
                reason: format!("{error:#}"),
            },
        }
    }

    async fn try_execute(&self, plan: &TradePlan) -> Result<FilledTrade> {
        let swap_tx = self
            .aggregator
            .swap(&plan.quote, &self.pubkey(), plan.fee.priority_lamports)
            .await
            .context("failed building swap transaction")?;

        let raw = BASE64_STANDARD
            .decode(&swap_tx.tx_base64)
            .context("failed decoding swap transaction base64")?;
        let unsigned: VersionedTransaction =
            bincode::deserialize(&raw).context("failed deserializing swap transaction")?;
        let signed = VersionedTransaction::try_new(unsigned.message, &[&self.keypair])
            .map_err(|error| anyhow!("failed signing swap transaction: {error}"))?;
        let signed_b64 = BASE64_STANDARD
            .encode(bincode::serialize(&signed).context("failed serializing signed transaction")?);

        let signature = self
            .rpc
            .send_transaction(&signed_b64)
            .await
            .context("failed broadcasting swap transaction")?;

        info!(
            signature = %signature,
            mint = %plan.mint,
            side = plan.side.as_str(),
            last_valid_block_height = swap_tx.last_valid_block_height,
            "swap transaction broadcast"
        );
        Ok(FilledTrade {
            signature,
            out_raw: plan.quote.out_amount,
            fee_lamports: plan.fee.total_lamports(),
            last_valid_block_height: Some(swap_tx.last_valid_block_height),
        })
    }
}

/// Waits for the broadcast to reach `confirmed` commitment, then settles
/// exactly this broadcast's pending share. A failed or expired broadcast
/// rolls only its own share back. Runs detached; the reaper is the
/// backstop if this task dies with the process.
pub fn spawn_buy_confirmation(
    rpc: Arc<dyn ChainRpc>,
    notifier: Arc<dyn Notifier>,
    db_path: String,
    mint: String,
    tx_signature: String,
    last_valid_block_height: Option<u64>,
) {
    tokio::spawn(async move {
        let result = confirm_buy(
            rpc,
            notifier,
            &db_path,
            &mint,
            &tx_signature,
            last_valid_block_height,
        )
        .await;
        if let Err(error) = result {
            warn!(
                signature = %tx_signature,
                mint = %mint,
                error = %error,
                "buy confirmation task failed"
            );
        }
    });
}

async fn confirm_buy(
    rpc: Arc<dyn ChainRpc>,
    notifier: Arc<dyn Notifier>,
    db_path: &str,
    mint: &str,
    tx_signature: &str,
    last_valid_block_height: Option<u64>,
) -> Result<()> {
    for _ in 0..CONFIRM_MAX_POLLS {
        match rpc.signature_status(tx_signature).await {
            Ok(SignatureStatus::Confirmed) => {
                let store = SqliteStore::open(Path::new(db_path))
                    .context("failed opening store for buy confirmation")?;
                store.confirm_pending_buy(mint, tx_signature, Utc::now())?;
                info!(signature = %tx_signature, mint = %mint, "buy confirmed on chain");
                return Ok(());
            }
            Ok(SignatureStatus::Failed) => {
                let store = SqliteStore::open(Path::new(db_path))
                    .context("failed opening store for buy rollback")?;
                store.fail_pending_buy(mint, tx_signature, Utc::now())?;
                notifier.notify(
                    "buy_failed_on_chain",
                    &format!("signature={tx_signature} mint={mint}"),
                );
                return Ok(());
            }
            Ok(SignatureStatus::Unknown) => {
                if let Some(limit) = last_valid_block_height {
                    if rpc.get_block_height().await.unwrap_or(0) > limit {
                        let store = SqliteStore::open(Path::new(db_path))
                            .context("failed opening store for expired buy rollback")?;
                        store.fail_pending_buy(mint, tx_signature, Utc::now())?;
                        notifier.notify(
                            "buy_expired",
                            &format!(
                                "signature={tx_signature} mint={mint} last_valid_block_height={limit}"
                            ),
                        );
                        return Ok(());
                    }
                }
            }
            Err(error) => {
                warn!(signature = %tx_signature, error = %error, "signature status poll failed");
            }
        }
        tokio::time::sleep(Duration::from_millis(CONFIRM_POLL_INTERVAL_MS)).await;
    }

    // Left to the stale-Sent reaper.
    warn!(
        signature = %tx_signature,
        mint = %mint,
        "confirmation polling exhausted without a terminal status"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trips_through_base58() {
        let keypair = Keypair::new();
        let encoded = bs58::encode(keypair.to_bytes()).into_string();
        let decoded = keypair_from_base58(&encoded).expect("decode keypair");
        assert_eq!(decoded.pubkey(), keypair.pubkey());
    }

    #[test]
    fn keypair_rejects_garbage() {
        assert!(keypair_from_base58("not-base58-!!").is_err());
        assert!(keypair_from_base58("1111").is_err());
    }
}
