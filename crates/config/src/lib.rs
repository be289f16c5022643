mod loader;
mod schema;

pub use loader::{load_from_env_or_default, load_from_path};
pub use schema::{
    AggregatorConfig, AppConfig, BreakerConfig, DryRunFeeMode, IngestionConfig, SqliteConfig,
    SystemConfig, TradeConfig, WalletConfig,
};

#[cfg(test)]
mod tests;
