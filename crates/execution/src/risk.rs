use anyhow::Result;
use chrono::Utc;
use mirrorbot_config::TradeConfig;
use mirrorbot_core_types::{RejectReason, SwapDescriptor, TradeSide, LAMPORTS_PER_SOL, SOL_MINT};
use mirrorbot_storage::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::aggregator::{AggregatorApi, Quote};
use crate::breaker::CircuitBreaker;
use crate::fees::{self, FeeEstimate};
use crate::rpc::ChainRpc;

const QUOTE_RETRY_DELAY_MS: u64 = 1_500;
const SENT_POLL_STEP_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct TradePlan {
    pub side: TradeSide,
    pub mint: String,
    /// BUY: lamports paid in. SELL: raw token amount sold.
    pub amount_raw: u128,
    pub token_decimals: u8,
    pub quote: Quote,
    pub fee: FeeEstimate,
    pub new_token: bool,
    pub drift_pct: Option<f64>,
    pub sent_wait_ms: u64,
}

#[derive(Debug)]
pub enum RiskDecision {
    Execute(Box<TradePlan>),
    Reject {
        reason: RejectReason,
        drift_pct: Option<f64>,
        sent_wait_ms: u64,
    },
}

impl RiskDecision {
    fn reject(reason: RejectReason) -> Self {
        Self::Reject {
            reason,
            drift_pct: None,
            sent_wait_ms: 0,
        }
    }
}

pub fn sol_to_lamports(sol: f64) -> u64 {
    if sol <= 0.0 {
        return 0;
    }
    (sol * LAMPORTS_PER_SOL as f64).round() as u64
}

/// Per-token price drift between what the upstream realised and what our
/// quote promises, in percent. None when either side divides by zero.
pub fn compute_drift_pct(
    upstream_sol_lamports: u64,
    upstream_token_raw: u128,
    my_sol_lamports: u64,
    quote_out_raw: u128,
    decimals: u8,
) -> Option<f64> {
    let scale = 10f64.powi(decimals as i32);
    let upstream_tokens = upstream_token_raw as f64 / scale;
    let quote_tokens = quote_out_raw as f64 / scale;
    if upstream_tokens <= 0.0 || quote_tokens <= 0.0 {
        return None;
    }
    let p_src = (upstream_sol_lamports as f64 / LAMPORTS_PER_SOL as f64) / upstream_tokens;
    let p_quote = (my_sol_lamports as f64 / LAMPORTS_PER_SOL as f64) / quote_tokens;
    if p_src <= 0.0 {
        return None;
    }
    Some((p_quote / p_src - 1.0) * 100.0)
}

pub struct RiskEngine {
    trade: TradeConfig,
    breaker: Arc<CircuitBreaker>,
    aggregator: Arc<dyn AggregatorApi>,
    rpc: Arc<dyn ChainRpc>,
    upstream_wallet: String,
    bot_pubkey: String,
}

impl RiskEngine {
    pub fn new(
        trade: TradeConfig,
        breaker: Arc<CircuitBreaker>,
        aggregator: Arc<dyn AggregatorApi>,
        rpc: Arc<dyn ChainRpc>,
        upstream_wallet: String,
        bot_pubkey: String,
    ) -> Self {
        Self {
            trade,
            breaker,
            aggregator,
            rpc,
            upstream_wallet,
            bot_pubkey,
        }
    }

    pub async fn evaluate(&self, store: &SqliteStore, swap: &SwapDescriptor) -> Result<RiskDecision> {
        if self.trade.pause_trading {
            return Ok(RiskDecision::reject(RejectReason::Paused));
        }
        // Checked before any external call; an open breaker must not cost
        // a single RPC round trip.
        if self.breaker.is_open(Utc::now()) {
            return Ok(RiskDecision::reject(RejectReason::CircuitBreaker));
        }
        match swap.side {
            TradeSide::Buy => self.evaluate_buy(store, swap).await,
            TradeSide::Sell => self.evaluate_sell(store, swap).await,
        }
    }

    async fn evaluate_buy(
        &self,
        store: &SqliteStore,
        swap: &SwapDescriptor,
    ) -> Result<RiskDecision> {
        let now = Utc::now();

        if swap.unsafe_parse && !self.trade.allow_unsafe_parse_trades {
            return Ok(RiskDecision::reject(RejectReason::UnsafeParse));
        }

        if store.open_positions_count()? >= self.trade.max_open_positions as u64 {
            return Ok(RiskDecision::reject(RejectReason::MaxOpenPositions));
        }

        let max_per_trade = sol_to_lamports(self.trade.max_sol_per_trade);
        let min_per_trade = sol_to_lamports(self.trade.min_sol_per_trade);
        let mut spend = ((swap.upstream_sol_lamports as f64 * self.trade.copy_ratio).floor()
            as u64)
            .min(max_per_trade);
        if spend < min_per_trade {
            return Ok(RiskDecision::reject(RejectReason::BelowMinTrade));
        }

        let max_per_day = sol_to_lamports(self.trade.max_sol_per_day);
        let spent_today = store.daily_spent_lamports(now)?;
        if spent_today.saturating_add(spend) > max_per_day {
            let remaining = max_per_day.saturating_sub(spent_today);
            if remaining < min_per_trade {
                return Ok(RiskDecision::reject(RejectReason::BudgetExhausted));
            }
            debug!(
                mint = %swap.mint,
                requested = spend,
                remaining,
                "daily budget nearly spent, reducing trade size"
            );
            spend = remaining;
        }

        if self.trade.cooldown_seconds > 0 {
            if let Some(last) = store.last_trade_at(&swap.mint)? {
                let age = (now - last).num_seconds().max(0) as u64;
                if age < self.trade.cooldown_seconds {
                    return Ok(RiskDecision::reject(RejectReason::Cooldown {
                        remaining_seconds: self.trade.cooldown_seconds - age,
                    }));
                }
            }
        }

        let new_token = if self.trade.dry_run {
            store.get_position(&swap.mint)?.is_none()
        } else {
            !self
                .rpc
                .has_token_account(&self.bot_pubkey, &swap.mint)
                .await?
        };
        let fee = fees::estimate_fee(self.trade.priority_fee_lamports, new_token);
        let fee_pct = fees::fee_pct(fee.total_lamports(), spend);
        if fee_pct > fees::adaptive_max_fee_pct(self.trade.max_fee_pct, spend) {
            return Ok(RiskDecision::reject(RejectReason::FeeOverhead));
        }

        let available = if self.trade.dry_run {
            sol_to_lamports(store.virtual_cash_sol()?)
        } else {
            self.rpc.get_balance_lamports(&self.bot_pubkey).await?
        };
        let reserve = sol_to_lamports(self.trade.min_reserve_sol);
        if spend.saturating_add(fee.total_lamports()).saturating_add(reserve) > available {
            return Ok(RiskDecision::reject(RejectReason::InsufficientBalance));
        }

        if self.trade.block_if_mint_authority || self.trade.block_if_freeze_authority {
            let authorities = self.rpc.get_mint_authorities(&swap.mint).await?;
            let blocked = (self.trade.block_if_mint_authority && authorities.has_mint_authority)
                || (self.trade.block_if_freeze_authority && authorities.has_freeze_authority);
            if blocked {
                return Ok(RiskDecision::reject(RejectReason::TokenAuthority));
            }
        }

        let Some(quote) = self
            .quote_with_retry(SOL_MINT, &swap.mint, spend as u128)
            .await
        else {
            return Ok(RiskDecision::reject(RejectReason::UnroutableToken));
        };

        if quote.price_impact_bps > self.trade.max_price_impact_bps as f64 {
            return Ok(RiskDecision::reject(RejectReason::PriceImpactTooHigh));
        }

        let drift_pct = compute_drift_pct(
            swap.upstream_sol_lamports,
            swap.upstream_token_raw,
            spend,
            quote.out_amount,
            swap.token_decimals,
        );
        let drift_guard_active = self.trade.max_price_drift_pct > 0.0
            && !(swap.unsafe_parse && self.trade.disable_drift_guard_on_unsafe_parse);
        if drift_guard_active {
            if let Some(drift) = drift_pct {
                let threshold_pct = self.trade.max_price_drift_pct * 100.0;
                if drift > threshold_pct {
                    return Ok(RiskDecision::Reject {
                        reason: RejectReason::PriceDriftTooHigh,
                        drift_pct: Some(drift),
                        sent_wait_ms: 0,
                    });
                }
            }
        }

        Ok(RiskDecision::Execute(Box::new(TradePlan {
            side: TradeSide::Buy,
            mint: swap.mint.clone(),
            amount_raw: spend as u128,
            token_decimals: swap.token_decimals,
            quote,
            fee,
            new_token,
            drift_pct,
            sent_wait_ms: 0,
        })))
    }

    async fn evaluate_sell(
        &self,
        store: &SqliteStore,
        swap: &SwapDescriptor,
    ) -> Result<RiskDecision> {
        let Some(mut position) = store.get_position(&swap.mint)? else {
            return Ok(RiskDecision::reject(RejectReason::NoPosition));
        };

        // A SELL racing our own unconfirmed BUY waits for the Sent row to
        // settle instead of selling reserved quantity.
        let mut sent_wait_ms = 0u64;
        if position.status == mirrorbot_core_types::PositionStatus::Sent
            && !self.trade.allow_sell_on_sent_position
        {
            let deadline_ms = self.trade.sell_on_sent_timeout_seconds.saturating_mul(1_000);
            loop {
                if position.status == mirrorbot_core_types::PositionStatus::Confirmed {
                    break;
                }
                if sent_wait_ms >= deadline_ms {
                    return Ok(RiskDecision::Reject {
                        reason: RejectReason::PositionNotConfirmed,
                        drift_pct: None,
                        sent_wait_ms,
                    });
                }
                tokio::time::sleep(Duration::from_millis(SENT_POLL_STEP_MS)).await;
                sent_wait_ms += SENT_POLL_STEP_MS;
                position = match store.get_position(&swap.mint)? {
                    Some(position) => position,
                    None => {
                        return Ok(RiskDecision::Reject {
                            reason: RejectReason::NoPosition,
                            drift_pct: None,
                            sent_wait_ms,
                        });
                    }
                };
            }
        }

        let my_balance = position.raw_balance;
        let upstream_sold = swap.upstream_token_raw;
        // fraction = sold / (B_now + sold); full exit when it cannot be
        // determined. Integer math keeps the floor exact.
        let my_sell = match self
            .rpc
            .get_token_balance_raw(&self.upstream_wallet, &swap.mint)
            .await
        {
            Ok(Some(upstream_now)) => {
                let before = upstream_now.saturating_add(upstream_sold);
                if before == 0 || upstream_sold == 0 {
                    my_balance
                } else {
                    my_balance
                        .saturating_mul(upstream_sold)
                        .checked_div(before)
                        .unwrap_or(my_balance)
                        .min(my_balance)
                }
            }
            Ok(None) => my_balance,
            Err(error) => {
                warn!(
                    mint = %swap.mint,
                    error = %error,
                    "upstream balance unavailable, defaulting to full exit"
                );
                my_balance
            }
        };

        let Some(quote) = self
            .quote_with_retry(&swap.mint, SOL_MINT, my_sell)
            .await
        else {
            return Ok(RiskDecision::Reject {
                reason: RejectReason::UnroutableToken,
                drift_pct: None,
                sent_wait_ms,
            });
        };

        // High impact never blocks an exit; it is only worth a log line.
        if quote.price_impact_bps > self.trade.max_price_impact_bps as f64 {
            warn!(
                mint = %swap.mint,
                price_impact_bps = quote.price_impact_bps,
                "sell price impact above configured cap, proceeding"
            );
        }

        Ok(RiskDecision::Execute(Box::new(TradePlan {
            side: TradeSide::Sell,
            mint: swap.mint.clone(),
            amount_raw: my_sell,
            token_decimals: position.decimals,
            quote,
            fee: fees::estimate_fee(self.trade.priority_fee_lamports, false),
            new_token: false,
            drift_pct: None,
            sent_wait_ms,
        })))
    }

    async fn quote_with_retry(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount_raw: u128,
    ) -> Option<Quote> {
        for attempt in 0..2 {
            match self
                .aggregator
                .quote(input_mint, output_mint, amount_raw, self.trade.slippage_bps)
                .await
            {
                Ok(Some(quote)) => return Some(quote),
                Ok(None) => {
                    debug!(input_mint, output_mint, attempt, "no route from aggregator");
                }
                Err(error) => {
                    debug!(
                        input_mint,
                        output_mint,
                        attempt,
                        error = %error,
                        "aggregator quote failed"
                    );
                }
            }
            if attempt == 0 {
                tokio::time::sleep(Duration::from_millis(QUOTE_RETRY_DELAY_MS)).await;
            }
        }
        None
    }
}
