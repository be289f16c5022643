use super::*;
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp config file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_parse_from_empty_toml() {
    let file = write_config("");
    let config = load_from_path(file.path()).expect("load empty config");
    assert_eq!(config.trade.max_open_positions, 10);
    assert_eq!(config.ingestion.webhook_rate_limit_per_min, 120);
    assert!(config.trade.dry_run);
    assert_eq!(config.trade.dry_run_fee_mode, DryRunFeeMode::Estimate);
}

#[test]
fn sections_override_defaults() {
    let file = write_config(
        r#"
[wallet]
upstream = "UpstreamWa11et111111111111111111111111111111"

[trade]
copy_ratio = 0.25
max_sol_per_trade = 1.5
dry_run_fee_mode = "accurate"

[breaker]
fail_rate_pct = 45.0
"#,
    );
    let config = load_from_path(file.path()).expect("load config");
    assert_eq!(config.trade.copy_ratio, 0.25);
    assert_eq!(config.trade.max_sol_per_trade, 1.5);
    assert_eq!(config.trade.dry_run_fee_mode, DryRunFeeMode::Accurate);
    assert_eq!(config.breaker.fail_rate_pct, 45.0);
    config.validate().expect("config should validate");
}

#[test]
fn validate_rejects_copy_ratio_out_of_range() {
    let mut config = AppConfig::default();
    config.wallet.upstream = "w".to_string();
    config.trade.copy_ratio = 1.5;
    let error = config.validate().expect_err("ratio above 1 must fail");
    assert!(error.to_string().contains("copy_ratio"));

    config.trade.copy_ratio = 0.0;
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_missing_upstream_wallet() {
    let config = AppConfig::default();
    let error = config.validate().expect_err("missing wallet must fail");
    assert!(error.to_string().contains("wallet.upstream"));
}

#[test]
fn validate_requires_keypair_for_live_mode() {
    let mut config = AppConfig::default();
    config.wallet.upstream = "w".to_string();
    config.trade.dry_run = false;
    let error = config.validate().expect_err("live mode without key must fail");
    assert!(error.to_string().contains("keypair_base58"));
}

#[test]
fn validate_rejects_slippage_out_of_bounds() {
    let mut config = AppConfig::default();
    config.wallet.upstream = "w".to_string();
    config.trade.slippage_bps = 0;
    assert!(config.validate().is_err());
    config.trade.slippage_bps = 5_001;
    assert!(config.validate().is_err());
    config.trade.slippage_bps = 5_000;
    assert!(config.validate().is_ok());
}

#[test]
fn validate_rejects_drift_fraction_above_one() {
    let mut config = AppConfig::default();
    config.wallet.upstream = "w".to_string();
    config.trade.max_price_drift_pct = 1.2;
    assert!(config.validate().is_err());
    config.trade.max_price_drift_pct = 0.0;
    assert!(config.validate().is_ok(), "0 disables the guard");
}

#[test]
fn validate_rejects_min_above_max_trade() {
    let mut config = AppConfig::default();
    config.wallet.upstream = "w".to_string();
    config.trade.min_sol_per_trade = 2.0;
    config.trade.max_sol_per_trade = 1.0;
    let error = config.validate().expect_err("min above max must fail");
    assert!(error.to_string().contains("max_sol_per_trade"));
}
