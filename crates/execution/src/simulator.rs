use anyhow::Result;
use chrono::Utc;
use mirrorbot_config::DryRunFeeMode;
use mirrorbot_core_types::{TradeSide, LAMPORTS_PER_SOL};
use mirrorbot_storage::{SqliteStore, VirtualTrade};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::aggregator::AggregatorApi;
use crate::risk::TradePlan;
use crate::rpc::ChainRpc;
use crate::{ExecOutcome, FilledTrade};

/// Compute budget assumed when translating the configured priority fee
/// into a per-CU price for the accurate sub-mode.
const ASSUMED_CU_LIMIT: u64 = 1_400_000;

/// DRY-RUN executor: estimates fees, validates virtual cash, records a
/// virtual trade. No transaction ever leaves this process.
pub struct DryRunExecutor {
    fee_mode: DryRunFeeMode,
    aggregator: Arc<dyn AggregatorApi>,
    rpc: Arc<dyn ChainRpc>,
    bot_pubkey: String,
}

impl DryRunExecutor {
    pub fn new(
        fee_mode: DryRunFeeMode,
        aggregator: Arc<dyn AggregatorApi>,
        rpc: Arc<dyn ChainRpc>,
        bot_pubkey: String,
    ) -> Self {
        Self {
            fee_mode,
            aggregator,
            rpc,
            bot_pubkey,
        }
    }

    pub async fn execute(&self, store: &SqliteStore, plan: &TradePlan) -> Result<ExecOutcome> {
        let fee_lamports = match self.fee_mode {
            DryRunFeeMode::Estimate => plan.fee.total_lamports(),
            DryRunFeeMode::Accurate => self
                .accurate_fee_lamports(plan)
                .await
                .unwrap_or_else(|| plan.fee.total_lamports()),
        };
        let fee_sol = fee_lamports as f64 / LAMPORTS_PER_SOL as f64;
        let signature = format!("sim-{}", Uuid::new_v4());
        let now = Utc::now();

        match plan.side {
            TradeSide::Buy => {
                let spend_sol = plan.amount_raw as f64 / LAMPORTS_PER_SOL as f64;
                let cash = store.virtual_cash_sol()?;
                if spend_sol + fee_sol > cash {
                    return Ok(ExecOutcome::Failed {
                        reason: format!(
                            "insufficient_virtual_cash need={:.6} have={:.6}",
                            spend_sol + fee_sol,
                            cash
                        ),
                    });
                }
                store.record_virtual_trade(
                    &VirtualTrade {
                        signature: signature.clone(),
                        side: TradeSide::Buy,
                        mint: plan.mint.clone(),
                        sol_amount: spend_sol + fee_sol,
                        token_raw: plan.quote.out_amount,
                        decimals: plan.token_decimals,
                        fee_sol,
                    },
                    now,
                )?;
                store.add_daily_spend(now, plan.amount_raw as u64)?;
                store.set_cooldown(&plan.mint, now)?;
                Ok(ExecOutcome::Filled(FilledTrade {
                    signature,
                    out_raw: plan.quote.out_amount,
                    fee_lamports,
                    last_valid_block_height: None,
                }))
            }
            TradeSide::Sell => {
                let proceeds_sol = plan.quote.out_amount as f64 / LAMPORTS_PER_SOL as f64;
                let net_sol = (proceeds_sol - fee_sol).max(0.0);
                store.record_virtual_trade(
                    &VirtualTrade {
                        signature: signature.clone(),
                        side: TradeSide::Sell,
                        mint: plan.mint.clone(),
                        sol_amount: net_sol,
                        token_raw: plan.amount_raw,
                        decimals: plan.token_decimals,
                        fee_sol,
                    },
                    now,
                )?;
                store.set_cooldown(&plan.mint, now)?;
                Ok(ExecOutcome::Filled(FilledTrade {
                    signature,
                    out_raw: plan.quote.out_amount,
                    fee_lamports,
                    last_valid_block_height: None,
                }))
            }
        }
    }

    /// Builds the real swap transaction and simulates it to read consumed
    /// compute units; the configured priority fee is scaled down to the
    /// actual budget. Any failure falls back to the fixed estimate.
    async fn accurate_fee_lamports(&self, plan: &TradePlan) -> Option<u64> {
        let swap_tx = self
            .aggregator
            .swap(&plan.quote, &self.bot_pubkey, plan.fee.priority_lamports)
            .await
            .ok()?;
        let units = self
            .rpc
            .simulate_transaction_units(&swap_tx.tx_base64)
            .await
            .ok()??;
        let scaled_priority =
            (plan.fee.priority_lamports as u128 * units as u128 / ASSUMED_CU_LIMIT as u128) as u64;
        debug!(
            units,
            scaled_priority,
            "accurate fee derived from simulated compute units"
        );
        Some(plan.fee.base_lamports + scaled_priority + plan.fee.ata_rent_lamports)
    }
}
