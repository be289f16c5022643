use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use mirrorbot_core_types::TradeSide;
use rusqlite::{params, OptionalExtension};

use crate::{parse_raw_amount, SqliteStore};

#[derive(Debug, Clone, Copy)]
pub struct VirtualWalletRow {
    pub starting_sol: f64,
    pub cash_sol: f64,
}

#[derive(Debug, Clone)]
pub struct VirtualPortfolioRow {
    pub mint: String,
    pub token_raw: u128,
    pub decimals: u8,
    pub spent_sol: f64,
    pub received_sol: f64,
}

/// One simulated fill. `sol_amount` is the full cash delta of the trade,
/// fees included, so that the signed sum over the trade log always equals
/// `starting - cash`.
#[derive(Debug, Clone)]
pub struct VirtualTrade {
    pub signature: String,
    pub side: TradeSide,
    pub mint: String,
    pub sol_amount: f64,
    pub token_raw: u128,
    pub decimals: u8,
    pub fee_sol: f64,
}

impl SqliteStore {
    /// Seeds the singleton wallet row on first startup; later startups keep
    /// the persisted cash.
    pub fn init_virtual_wallet(&self, starting_sol: f64, now: DateTime<Utc>) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO virtual_wallet(id, starting_sol, cash_sol, updated_at)
                 VALUES (1, ?1, ?1, ?2)",
                params![starting_sol, now.to_rfc3339()],
            )
        })
        .context("failed seeding virtual wallet")?;
        Ok(())
    }

    pub fn virtual_wallet(&self) -> Result<VirtualWalletRow> {
        let row: Option<(f64, f64)> = self
            .conn()
            .query_row(
                "SELECT starting_sol, cash_sol FROM virtual_wallet WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed querying virtual wallet")?;
        let (starting_sol, cash_sol) =
            row.ok_or_else(|| anyhow!("virtual wallet is not initialized"))?;
        Ok(VirtualWalletRow {
            starting_sol,
            cash_sol,
        })
    }

    pub fn virtual_cash_sol(&self) -> Result<f64> {
        Ok(self.virtual_wallet()?.cash_sol)
    }

    /// Applies one simulated fill atomically: wallet cash, per-mint
    /// portfolio aggregates, and the trade log move together or not at all.
    pub fn record_virtual_trade(&self, trade: &VirtualTrade, now: DateTime<Utc>) -> Result<()> {
        let now_raw = now.to_rfc3339();
        self.with_immediate_tx(|conn| {
            let cash: f64 = conn.query_row(
                "SELECT cash_sol FROM virtual_wallet WHERE id = 1",
                [],
                |row| row.get(0),
            )?;

            let new_cash = match trade.side {
                TradeSide::Buy => cash - trade.sol_amount,
                TradeSide::Sell => cash + trade.sol_amount,
            };
            if new_cash < 0.0 {
                return Err(rusqlite::Error::IntegralValueOutOfRange(0, 0));
            }
            conn.execute(
                "UPDATE virtual_wallet SET cash_sol = ?1, updated_at = ?2 WHERE id = 1",
                params![new_cash, &now_raw],
            )?;

            let existing: Option<(String, f64, f64)> = conn
                .query_row(
                    "SELECT token_raw, spent_sol, received_sol
                     FROM virtual_portfolio WHERE mint = ?1",
                    params![&trade.mint],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let (token_raw, spent_sol, received_sol) = existing
                .map(|(raw, spent, received)| {
                    (raw.parse::<u128>().unwrap_or(0), spent, received)
                })
                .unwrap_or((0, 0.0, 0.0));

            let (new_token_raw, new_spent, new_received) = match trade.side {
                TradeSide::Buy => (
                    token_raw.saturating_add(trade.token_raw),
                    spent_sol + trade.sol_amount,
                    received_sol,
                ),
                TradeSide::Sell => (
                    token_raw.saturating_sub(trade.token_raw),
                    spent_sol,
                    received_sol + trade.sol_amount,
                ),
            };
            conn.execute(
                "INSERT INTO virtual_portfolio(
                    mint, token_raw, decimals, spent_sol, received_sol, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(mint) DO UPDATE SET
                    token_raw = excluded.token_raw,
                    decimals = excluded.decimals,
                    spent_sol = excluded.spent_sol,
                    received_sol = excluded.received_sol,
                    updated_at = excluded.updated_at",
                params![
                    &trade.mint,
                    new_token_raw.to_string(),
                    trade.decimals as i64,
                    new_spent,
                    new_received,
                    &now_raw,
                ],
            )?;

            conn.execute(
                "INSERT INTO virtual_trades(
                    signature, side, mint, sol_amount, token_raw, fee_sol, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &trade.signature,
                    trade.side.as_str(),
                    &trade.mint,
                    trade.sol_amount,
                    trade.token_raw.to_string(),
                    trade.fee_sol,
                    &now_raw,
                ],
            )?;
            Ok(())
        })
        .context("failed recording virtual trade")
    }

    pub fn virtual_portfolio_row(&self, mint: &str) -> Result<Option<VirtualPortfolioRow>> {
        let row: Option<(String, i64, f64, f64)> = self
            .conn()
            .query_row(
                "SELECT token_raw, decimals, spent_sol, received_sol
                 FROM virtual_portfolio WHERE mint = ?1",
                params![mint],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .context("failed querying virtual portfolio")?;
        row.map(|(token_raw, decimals, spent_sol, received_sol)| {
            Ok(VirtualPortfolioRow {
                mint: mint.to_string(),
                token_raw: parse_raw_amount(&token_raw, "virtual_portfolio.token_raw")?,
                decimals: decimals.clamp(0, u8::MAX as i64) as u8,
                spent_sol,
                received_sol,
            })
        })
        .transpose()
    }

    pub fn virtual_totals(&self) -> Result<(f64, f64)> {
        let (spent, received): (f64, f64) = self
            .conn()
            .query_row(
                "SELECT COALESCE(SUM(spent_sol), 0.0), COALESCE(SUM(received_sol), 0.0)
                 FROM virtual_portfolio",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed querying virtual totals")?;
        Ok((spent, received))
    }

    /// Invariant check: `cash = starting + received - spent`. Returns the
    /// observed deviation so callers can log it.
    pub fn virtual_reconcile(&self) -> Result<f64> {
        let wallet = self.virtual_wallet()?;
        let (spent, received) = self.virtual_totals()?;
        let expected = wallet.starting_sol + received - spent;
        Ok((wallet.cash_sol - expected).abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_test_store;
    use tempfile::tempdir;

    #[test]
    fn cash_tracks_signed_trade_amounts() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let now = Utc::now();
        store.init_virtual_wallet(10.0, now)?;

        store.record_virtual_trade(
            &VirtualTrade {
                signature: "sim-1".to_string(),
                side: TradeSide::Buy,
                mint: "mint-a".to_string(),
                sol_amount: 0.505,
                token_raw: 1_000_000,
                decimals: 6,
                fee_sol: 0.005,
            },
            now,
        )?;
        store.record_virtual_trade(
            &VirtualTrade {
                signature: "sim-2".to_string(),
                side: TradeSide::Sell,
                mint: "mint-a".to_string(),
                sol_amount: 0.495,
                token_raw: 1_000_000,
                decimals: 6,
                fee_sol: 0.005,
            },
            now,
        )?;

        let wallet = store.virtual_wallet()?;
        assert!((wallet.cash_sol - 9.99).abs() < 1e-9);
        assert!(store.virtual_reconcile()? < 1e-6);

        let row = store
            .virtual_portfolio_row("mint-a")?
            .expect("portfolio row");
        assert_eq!(row.token_raw, 0);
        assert!((row.spent_sol - 0.505).abs() < 1e-9);
        assert!((row.received_sol - 0.495).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn overdrawing_virtual_cash_is_rejected() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let now = Utc::now();
        store.init_virtual_wallet(1.0, now)?;

        let result = store.record_virtual_trade(
            &VirtualTrade {
                signature: "sim-over".to_string(),
                side: TradeSide::Buy,
                mint: "mint-a".to_string(),
                sol_amount: 2.0,
                token_raw: 1,
                decimals: 6,
                fee_sol: 0.0,
            },
            now,
        );
        assert!(result.is_err());
        assert!((store.virtual_cash_sol()? - 1.0).abs() < 1e-9, "cash untouched");
        Ok(())
    }
}
