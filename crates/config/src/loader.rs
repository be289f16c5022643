use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::AppConfig;

pub fn load_from_path(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

/// Loads the config file (`MIRRORBOT_CONFIG` wins over the default path),
/// applies `MIRRORBOT_*` environment overrides, then validates. Any error
/// here must abort startup.
pub fn load_from_env_or_default(default_path: &Path) -> Result<(AppConfig, PathBuf)> {
    let configured = env::var("MIRRORBOT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_path.to_path_buf());
    let mut config = load_from_path(&configured)?;
    apply_env_overrides(&mut config);
    config.validate().context("invalid configuration")?;
    Ok((config, configured))
}

fn parse_env_bool(value: String) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Some(value) = env_string("MIRRORBOT_LOG_LEVEL") {
        config.system.log_level = value;
    }
    if let Some(value) = env::var("MIRRORBOT_LOG_JSON").ok().and_then(parse_env_bool) {
        config.system.log_json = value;
    }
    if let Some(value) = env_string("MIRRORBOT_SQLITE_PATH") {
        config.sqlite.path = value;
    }
    if let Some(value) = env_string("MIRRORBOT_UPSTREAM_WALLET") {
        config.wallet.upstream = value;
    }
    if let Some(value) = env_string("MIRRORBOT_KEYPAIR_BASE58") {
        config.wallet.keypair_base58 = value;
    }
    if let Some(value) = env_string("MIRRORBOT_WEBHOOK_BIND_ADDR") {
        config.ingestion.webhook_bind_addr = value;
    }
    if let Some(value) = env_parse::<u32>("MIRRORBOT_WEBHOOK_RATE_LIMIT_PER_MIN") {
        config.ingestion.webhook_rate_limit_per_min = value;
    }
    if let Some(value) = env_string("MIRRORBOT_RPC_HTTP_URL") {
        config.ingestion.rpc_http_url = value;
    }
    if let Some(value) = env_string("MIRRORBOT_RPC_WS_URL") {
        config.ingestion.rpc_ws_url = value;
    }
    if let Some(value) = env_parse::<u64>("MIRRORBOT_POLL_INTERVAL_SECONDS") {
        config.ingestion.poll_interval_seconds = value;
    }
    if let Some(value) = env_string("MIRRORBOT_AGGREGATOR_BASE_URL") {
        config.aggregator.base_url = value;
    }
    if let Some(value) = env_parse::<u64>("MIRRORBOT_AGGREGATOR_TIMEOUT_MS") {
        config.aggregator.timeout_ms = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_COPY_RATIO") {
        config.trade.copy_ratio = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_MIN_SOL_PER_TRADE") {
        config.trade.min_sol_per_trade = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_MAX_SOL_PER_TRADE") {
        config.trade.max_sol_per_trade = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_MAX_SOL_PER_DAY") {
        config.trade.max_sol_per_day = value;
    }
    if let Some(value) = env_parse::<u32>("MIRRORBOT_MAX_OPEN_POSITIONS") {
        config.trade.max_open_positions = value;
    }
    if let Some(value) = env_parse::<u32>("MIRRORBOT_SLIPPAGE_BPS") {
        config.trade.slippage_bps = value;
    }
    if let Some(value) = env_parse::<u32>("MIRRORBOT_MAX_PRICE_IMPACT_BPS") {
        config.trade.max_price_impact_bps = value;
    }
    if let Some(value) = env_parse::<u64>("MIRRORBOT_PRIORITY_FEE_LAMPORTS") {
        config.trade.priority_fee_lamports = value;
    }
    if let Some(value) = env_parse::<u64>("MIRRORBOT_COOLDOWN_SECONDS") {
        config.trade.cooldown_seconds = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_MIN_RESERVE_SOL") {
        config.trade.min_reserve_sol = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_MAX_FEE_PCT") {
        config.trade.max_fee_pct = value;
    }
    if let Some(value) = env::var("MIRRORBOT_BLOCK_IF_MINT_AUTHORITY")
        .ok()
        .and_then(parse_env_bool)
    {
        config.trade.block_if_mint_authority = value;
    }
    if let Some(value) = env::var("MIRRORBOT_BLOCK_IF_FREEZE_AUTHORITY")
        .ok()
        .and_then(parse_env_bool)
    {
        config.trade.block_if_freeze_authority = value;
    }
    if let Some(value) = env::var("MIRRORBOT_RESTRICT_INTERMEDIATE_TOKENS")
        .ok()
        .and_then(parse_env_bool)
    {
        config.trade.restrict_intermediate_tokens = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_MAX_PRICE_DRIFT_PCT") {
        config.trade.max_price_drift_pct = value;
    }
    if let Some(value) = env::var("MIRRORBOT_ALLOW_UNSAFE_PARSE_TRADES")
        .ok()
        .and_then(parse_env_bool)
    {
        config.trade.allow_unsafe_parse_trades = value;
    }
    if let Some(value) = env::var("MIRRORBOT_DISABLE_DRIFT_GUARD_ON_UNSAFE_PARSE")
        .ok()
        .and_then(parse_env_bool)
    {
        config.trade.disable_drift_guard_on_unsafe_parse = value;
    }
    if let Some(value) = env::var("MIRRORBOT_ALLOW_SELL_ON_SENT_POSITION")
        .ok()
        .and_then(parse_env_bool)
    {
        config.trade.allow_sell_on_sent_position = value;
    }
    if let Some(value) = env_parse::<u64>("MIRRORBOT_SELL_ON_SENT_TIMEOUT_SECONDS") {
        config.trade.sell_on_sent_timeout_seconds = value;
    }
    if let Some(value) = env_parse::<u64>("MIRRORBOT_PENDING_POSITION_TIMEOUT_MINUTES") {
        config.trade.pending_position_timeout_minutes = value;
    }
    if let Some(value) = env::var("MIRRORBOT_PAUSE_TRADING")
        .ok()
        .and_then(parse_env_bool)
    {
        config.trade.pause_trading = value;
    }
    if let Some(value) = env::var("MIRRORBOT_DRY_RUN").ok().and_then(parse_env_bool) {
        config.trade.dry_run = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_COMPARE_ALERT_PCT") {
        config.trade.compare_alert_pct = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_VIRTUAL_STARTING_BALANCE_SOL") {
        config.trade.virtual_starting_balance_sol = value;
    }
    if let Some(value) = env_parse::<f64>("MIRRORBOT_BREAKER_FAIL_RATE_PCT") {
        config.breaker.fail_rate_pct = value;
    }
    if let Some(value) = env_parse::<u64>("MIRRORBOT_BREAKER_FAIL_WINDOW_MINUTES") {
        config.breaker.fail_window_minutes = value;
    }
    if let Some(value) = env_parse::<u64>("MIRRORBOT_BREAKER_LATENCY_P99_MS") {
        config.breaker.latency_p99_ms = value;
    }
    if let Some(value) = env_parse::<u32>("MIRRORBOT_BREAKER_NO_POSITION_SPIKE") {
        config.breaker.no_position_spike = value;
    }
    if let Some(value) = env_parse::<u64>("MIRRORBOT_BREAKER_AUTO_RESET_MINUTES") {
        config.breaker.auto_reset_minutes = value;
    }
}
