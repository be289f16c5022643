use anyhow::{Context, Result};
use chrono::Utc;
use mirrorbot_core_types::{TradeSide, LAMPORTS_PER_SOL};
use mirrorbot_storage::{ComparisonRow, SqliteStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::notify::Notifier;
use crate::rpc::{ChainRpc, TxBalances};

const COMPARE_DELAY_MS: u64 = 2_500;

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub tx_signature: String,
    pub side: TradeSide,
    pub mint: String,
    pub quoted_in_raw: u128,
    pub quoted_out_raw: u128,
    pub alert_pct: f64,
}

/// Fire-and-forget quoted-vs-realised check for a live fill. Fetches the
/// finalised transaction a little after broadcast and records what the
/// chain actually did.
pub fn spawn_execution_comparison(
    rpc: Arc<dyn ChainRpc>,
    notifier: Arc<dyn Notifier>,
    db_path: String,
    bot_pubkey: String,
    request: CompareRequest,
) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(COMPARE_DELAY_MS)).await;
        if let Err(error) = run_comparison(rpc, notifier, &db_path, &bot_pubkey, &request).await {
            warn!(
                signature = %request.tx_signature,
                error = %error,
                "execution comparison failed"
            );
        }
    });
}

async fn run_comparison(
    rpc: Arc<dyn ChainRpc>,
    notifier: Arc<dyn Notifier>,
    db_path: &str,
    bot_pubkey: &str,
    request: &CompareRequest,
) -> Result<()> {
    let balances = rpc
        .get_transaction_balances(&request.tx_signature, bot_pubkey)
        .await
        .context("failed fetching finalised transaction for comparison")?;

    let row = build_comparison_row(request, balances.as_ref());
    let store = SqliteStore::open(Path::new(db_path))
        .context("failed opening store for execution comparison")?;
    store.insert_execution_comparison(&row, Utc::now())?;

    if let Some(slippage_pct) = row.slippage_pct {
        info!(
            signature = %request.tx_signature,
            mint = %request.mint,
            slippage_pct,
            "execution comparison recorded"
        );
        if slippage_pct.abs() > request.alert_pct {
            notifier.notify(
                "execution_slippage",
                &format!(
                    "signature={} mint={} slippage_pct={:.4}",
                    request.tx_signature, request.mint, slippage_pct
                ),
            );
        }
    }
    Ok(())
}

/// The quoted leg lives in the request; the realised leg comes from the
/// transaction's pre/post balances at the bot wallet. Missing balances
/// leave the realised columns NULL rather than inventing numbers.
pub fn build_comparison_row(
    request: &CompareRequest,
    balances: Option<&TxBalances>,
) -> ComparisonRow {
    let quoted_sol = match request.side {
        TradeSide::Buy => request.quoted_in_raw as f64 / LAMPORTS_PER_SOL as f64,
        TradeSide::Sell => request.quoted_out_raw as f64 / LAMPORTS_PER_SOL as f64,
    };

    let mut real_sol = None;
    let mut real_token_raw = None;
    let mut slippage_pct = None;
    let mut fee_lamports = None;
    let mut compute_units = None;

    if let Some(balances) = balances {
        fee_lamports = Some(balances.fee_lamports);
        compute_units = balances.compute_units;
        real_sol = Some(balances.wallet_sol_delta().unsigned_abs() as f64 / LAMPORTS_PER_SOL as f64);
        let token_delta = balances
            .token_changes
            .iter()
            .find(|change| change.mint == request.mint)
            .map(|change| change.delta().unsigned_abs());
        real_token_raw = token_delta;

        slippage_pct = match request.side {
            // BUY: how many tokens actually arrived vs quoted.
            TradeSide::Buy => token_delta.and_then(|real| {
                if request.quoted_out_raw == 0 {
                    None
                } else {
                    Some((real as f64 / request.quoted_out_raw as f64 - 1.0) * 100.0)
                }
            }),
            // SELL: how much SOL actually arrived vs quoted.
            TradeSide::Sell => {
                if request.quoted_out_raw == 0 {
                    None
                } else {
                    real_sol.map(|sol| {
                        let quoted = request.quoted_out_raw as f64 / LAMPORTS_PER_SOL as f64;
                        (sol / quoted - 1.0) * 100.0
                    })
                }
            }
        };
    }

    ComparisonRow {
        signature: request.tx_signature.clone(),
        side: request.side,
        mint: request.mint.clone(),
        quoted_sol,
        real_sol,
        quoted_token_raw: request.quoted_out_raw,
        real_token_raw,
        slippage_pct,
        fee_lamports,
        compute_units,
    }
}
