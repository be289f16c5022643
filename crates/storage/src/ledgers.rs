use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::{parse_rfc3339, SqliteStore};

/// UTC day key used for the daily budget rows.
pub fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

impl SqliteStore {
    /// Atomic increment; only confirmed BUY spend lands here.
    pub fn add_daily_spend(&self, now: DateTime<Utc>, lamports: u64) -> Result<()> {
        let day = day_key(now);
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT INTO budgets(day, spent_lamports) VALUES (?1, ?2)
                 ON CONFLICT(day) DO UPDATE SET
                    spent_lamports = budgets.spent_lamports + excluded.spent_lamports",
                params![&day, lamports as i64],
            )
        })
        .context("failed incrementing daily budget")?;
        Ok(())
    }

    pub fn daily_spent_lamports(&self, now: DateTime<Utc>) -> Result<u64> {
        let spent: Option<i64> = self
            .conn()
            .query_row(
                "SELECT spent_lamports FROM budgets WHERE day = ?1",
                params![day_key(now)],
                |row| row.get(0),
            )
            .optional()
            .context("failed querying daily budget")?;
        Ok(spent.unwrap_or(0).max(0) as u64)
    }

    pub fn set_cooldown(&self, mint: &str, now: DateTime<Utc>) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT INTO cooldowns(mint, last_trade_at) VALUES (?1, ?2)
                 ON CONFLICT(mint) DO UPDATE SET last_trade_at = excluded.last_trade_at",
                params![mint, now.to_rfc3339()],
            )
        })
        .context("failed setting cooldown")?;
        Ok(())
    }

    pub fn last_trade_at(&self, mint: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT last_trade_at FROM cooldowns WHERE mint = ?1",
                params![mint],
                |row| row.get(0),
            )
            .optional()
            .context("failed querying cooldown")?;
        raw.as_deref()
            .map(|value| parse_rfc3339(value, "cooldowns.last_trade_at"))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_test_store;
    use tempfile::tempdir;

    #[test]
    fn daily_spend_accumulates_per_day_key() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let today = Utc::now();
        let yesterday = today - chrono::Duration::days(1);

        store.add_daily_spend(today, 100_000_000)?;
        store.add_daily_spend(today, 50_000_000)?;
        store.add_daily_spend(yesterday, 999)?;

        assert_eq!(store.daily_spent_lamports(today)?, 150_000_000);
        assert_eq!(store.daily_spent_lamports(yesterday)?, 999);
        Ok(())
    }

    #[test]
    fn cooldown_tracks_latest_trade_timestamp() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        assert!(store.last_trade_at("mint-a")?.is_none());

        let first = Utc::now() - chrono::Duration::seconds(30);
        let second = Utc::now();
        store.set_cooldown("mint-a", first)?;
        store.set_cooldown("mint-a", second)?;

        let recorded = store.last_trade_at("mint-a")?.expect("cooldown recorded");
        assert!((recorded - second).num_milliseconds().abs() < 1_000);
        Ok(())
    }
}
