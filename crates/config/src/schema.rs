use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub system: SystemConfig,
    pub sqlite: SqliteConfig,
    pub wallet: WalletConfig,
    pub ingestion: IngestionConfig,
    pub aggregator: AggregatorConfig,
    pub trade: TradeConfig,
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub env: String,
    pub log_level: String,
    pub log_json: bool,
    pub heartbeat_seconds: u64,
    pub migrations_dir: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            heartbeat_seconds: 30,
            migrations_dir: "migrations".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "state/mirrorbot.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WalletConfig {
    /// The upstream wallet whose swaps are mirrored.
    pub upstream: String,
    /// Bot signing key, base58-encoded 64-byte secret. Required for live mode.
    pub keypair_base58: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub webhook_bind_addr: String,
    pub webhook_rate_limit_per_min: u32,
    pub rpc_http_url: String,
    pub rpc_ws_url: String,
    pub poll_interval_seconds: u64,
    pub poll_signature_limit: u32,
    pub ws_health_check_seconds: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            webhook_bind_addr: "127.0.0.1:8787".to_string(),
            webhook_rate_limit_per_min: 120,
            rpc_http_url: "https://api.mainnet-beta.solana.com".to_string(),
            rpc_ws_url: "wss://api.mainnet-beta.solana.com".to_string(),
            poll_interval_seconds: 5,
            poll_signature_limit: 20,
            ws_health_check_seconds: 30,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://quote-api.jup.ag/v6".to_string(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DryRunFeeMode {
    Estimate,
    Accurate,
}

impl Default for DryRunFeeMode {
    fn default() -> Self {
        Self::Estimate
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradeConfig {
    /// Fraction of the upstream notional copied per trade, 0 < ratio <= 1.
    pub copy_ratio: f64,
    pub min_sol_per_trade: f64,
    pub max_sol_per_trade: f64,
    pub max_sol_per_day: f64,
    pub max_open_positions: u32,
    pub slippage_bps: u32,
    pub max_price_impact_bps: u32,
    pub priority_fee_lamports: u64,
    pub cooldown_seconds: u64,
    pub min_reserve_sol: f64,
    /// Base fee-overhead ceiling in percent of the trade size; the engine
    /// relaxes it for small trades (2x under 0.5 SOL, 3x under 0.1 SOL).
    pub max_fee_pct: f64,
    pub block_if_mint_authority: bool,
    pub block_if_freeze_authority: bool,
    pub restrict_intermediate_tokens: bool,
    /// Fraction of the upstream price, 0..=1; 0 disables the drift guard.
    pub max_price_drift_pct: f64,
    pub allow_unsafe_parse_trades: bool,
    pub disable_drift_guard_on_unsafe_parse: bool,
    pub allow_sell_on_sent_position: bool,
    pub sell_on_sent_timeout_seconds: u64,
    pub pending_position_timeout_minutes: u64,
    pub pause_trading: bool,
    pub dry_run: bool,
    pub dry_run_fee_mode: DryRunFeeMode,
    pub compare_alert_pct: f64,
    pub virtual_starting_balance_sol: f64,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            copy_ratio: 0.5,
            min_sol_per_trade: 0.01,
            max_sol_per_trade: 0.5,
            max_sol_per_day: 5.0,
            max_open_positions: 10,
            slippage_bps: 100,
            max_price_impact_bps: 500,
            priority_fee_lamports: 100_000,
            cooldown_seconds: 60,
            min_reserve_sol: 0.05,
            max_fee_pct: 1.0,
            block_if_mint_authority: true,
            block_if_freeze_authority: true,
            restrict_intermediate_tokens: true,
            max_price_drift_pct: 0.2,
            allow_unsafe_parse_trades: false,
            disable_drift_guard_on_unsafe_parse: true,
            allow_sell_on_sent_position: false,
            sell_on_sent_timeout_seconds: 30,
            pending_position_timeout_minutes: 5,
            pause_trading: false,
            dry_run: true,
            dry_run_fee_mode: DryRunFeeMode::Estimate,
            compare_alert_pct: 2.0,
            virtual_starting_balance_sol: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub fail_rate_pct: f64,
    pub fail_window_minutes: u64,
    pub latency_p99_ms: u64,
    pub no_position_spike: u32,
    pub auto_reset_minutes: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_rate_pct: 30.0,
            fail_window_minutes: 10,
            latency_p99_ms: 8_000,
            no_position_spike: 5,
            auto_reset_minutes: 0,
        }
    }
}

impl AppConfig {
    /// Every violation here must abort startup; a bot trading with a
    /// half-valid config is worse than one that refuses to start.
    pub fn validate(&self) -> Result<()> {
        if self.wallet.upstream.trim().is_empty() {
            return Err(anyhow!("wallet.upstream must be set"));
        }
        if !self.trade.dry_run && self.wallet.keypair_base58.trim().is_empty() {
            return Err(anyhow!(
                "wallet.keypair_base58 is required when trade.dry_run is false"
            ));
        }
        if !(self.trade.copy_ratio > 0.0 && self.trade.copy_ratio <= 1.0) {
            return Err(anyhow!(
                "trade.copy_ratio must be in (0, 1], got {}",
                self.trade.copy_ratio
            ));
        }
        if self.trade.min_sol_per_trade <= 0.0 {
            return Err(anyhow!("trade.min_sol_per_trade must be positive"));
        }
        if self.trade.max_sol_per_trade < self.trade.min_sol_per_trade {
            return Err(anyhow!(
                "trade.max_sol_per_trade {} is below trade.min_sol_per_trade {}",
                self.trade.max_sol_per_trade,
                self.trade.min_sol_per_trade
            ));
        }
        if self.trade.max_sol_per_day <= 0.0 {
            return Err(anyhow!("trade.max_sol_per_day must be positive"));
        }
        if self.trade.max_open_positions == 0 {
            return Err(anyhow!("trade.max_open_positions must be at least 1"));
        }
        if !(1..=5_000).contains(&self.trade.slippage_bps) {
            return Err(anyhow!(
                "trade.slippage_bps must be in 1..=5000, got {}",
                self.trade.slippage_bps
            ));
        }
        if !(0.0..=100.0).contains(&self.trade.max_fee_pct) {
            return Err(anyhow!(
                "trade.max_fee_pct must be in 0..=100, got {}",
                self.trade.max_fee_pct
            ));
        }
        if !(0.0..=1.0).contains(&self.trade.max_price_drift_pct) {
            return Err(anyhow!(
                "trade.max_price_drift_pct must be in 0..=1 (0 disables), got {}",
                self.trade.max_price_drift_pct
            ));
        }
        if self.trade.min_reserve_sol < 0.0 {
            return Err(anyhow!("trade.min_reserve_sol must not be negative"));
        }
        if self.trade.virtual_starting_balance_sol <= 0.0 {
            return Err(anyhow!(
                "trade.virtual_starting_balance_sol must be positive"
            ));
        }
        if self.ingestion.webhook_rate_limit_per_min == 0 {
            return Err(anyhow!(
                "ingestion.webhook_rate_limit_per_min must be at least 1"
            ));
        }
        if self.ingestion.poll_interval_seconds == 0 {
            return Err(anyhow!("ingestion.poll_interval_seconds must be at least 1"));
        }
        if self.ingestion.rpc_http_url.trim().is_empty() {
            return Err(anyhow!("ingestion.rpc_http_url must be set"));
        }
        if self.aggregator.base_url.trim().is_empty() {
            return Err(anyhow!("aggregator.base_url must be set"));
        }
        if !(0.0..=100.0).contains(&self.breaker.fail_rate_pct) {
            return Err(anyhow!(
                "breaker.fail_rate_pct must be in 0..=100, got {}",
                self.breaker.fail_rate_pct
            ));
        }
        if self.breaker.fail_window_minutes == 0 {
            return Err(anyhow!("breaker.fail_window_minutes must be at least 1"));
        }
        Ok(())
    }
}
