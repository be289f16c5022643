use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mirrorbot_core_types::PositionStatus;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{parse_raw_amount, parse_rfc3339, SqliteStore};

#[derive(Debug, Clone)]
pub struct PositionRow {
    pub mint: String,
    pub raw_balance: u128,
    /// Sum of the quantities added by broadcast-but-unconfirmed BUYs;
    /// zero on confirmed rows. Each broadcast's own share lives in
    /// `position_pendings`, keyed by its transaction signature.
    pub pending_raw: u128,
    pub decimals: u8,
    pub status: PositionStatus,
    pub updated_at: DateTime<Utc>,
}

/// One outstanding broadcast for a mint.
#[derive(Debug, Clone)]
pub struct PendingBuyRow {
    pub mint: String,
    pub tx_signature: String,
    pub raw: u128,
    pub created_at: DateTime<Utc>,
}

/// Result of subtracting quantity from a position: the row is either gone
/// or left with the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Deleted,
    Reduced { remaining_raw: u128 },
}

fn row_to_position(
    mint: String,
    raw_balance: String,
    pending_raw: String,
    decimals: i64,
    status: String,
    updated_at: String,
) -> Result<PositionRow> {
    Ok(PositionRow {
        mint,
        raw_balance: parse_raw_amount(&raw_balance, "positions.raw_balance")?,
        pending_raw: parse_raw_amount(&pending_raw, "positions.pending_raw")?,
        decimals: decimals.clamp(0, u8::MAX as i64) as u8,
        status: PositionStatus::parse(&status)
            .with_context(|| format!("invalid positions.status value: {status}"))?,
        updated_at: parse_rfc3339(&updated_at, "positions.updated_at")?,
    })
}

fn read_position_raw(conn: &Connection, mint: &str) -> rusqlite::Result<Option<(u128, u128)>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT raw_balance, pending_raw FROM positions WHERE mint = ?1",
            params![mint],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row.map(|(balance, pending)| {
        (
            balance.parse::<u128>().unwrap_or(0),
            pending.parse::<u128>().unwrap_or(0),
        )
    }))
}

fn write_position(
    conn: &Connection,
    mint: &str,
    raw_balance: u128,
    pending_raw: u128,
    decimals: Option<u8>,
    now_raw: &str,
) -> rusqlite::Result<()> {
    let status = if pending_raw > 0 {
        PositionStatus::Sent
    } else {
        PositionStatus::Confirmed
    };
    match decimals {
        Some(decimals) => conn.execute(
            "INSERT INTO positions(mint, raw_balance, pending_raw, decimals, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(mint) DO UPDATE SET
                raw_balance = excluded.raw_balance,
                pending_raw = excluded.pending_raw,
                decimals = excluded.decimals,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                mint,
                raw_balance.to_string(),
                pending_raw.to_string(),
                decimals as i64,
                status.as_str(),
                now_raw,
            ],
        )?,
        None => conn.execute(
            "UPDATE positions
             SET raw_balance = ?1, pending_raw = ?2, status = ?3, updated_at = ?4
             WHERE mint = ?5",
            params![
                raw_balance.to_string(),
                pending_raw.to_string(),
                status.as_str(),
                now_raw,
                mint,
            ],
        )?,
    };
    Ok(())
}

impl SqliteStore {
    pub fn get_position(&self, mint: &str) -> Result<Option<PositionRow>> {
        let row: Option<(String, String, i64, String, String)> = self
            .conn()
            .query_row(
                "SELECT raw_balance, pending_raw, decimals, status, updated_at
                 FROM positions WHERE mint = ?1",
                params![mint],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .context("failed querying position")?;

        row.map(|(raw_balance, pending_raw, decimals, status, updated_at)| {
            row_to_position(
                mint.to_string(),
                raw_balance,
                pending_raw,
                decimals,
                status,
                updated_at,
            )
        })
        .transpose()
    }

    pub fn has_position(&self, mint: &str) -> Result<bool> {
        Ok(self.get_position(mint)?.is_some())
    }

    pub fn open_positions_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM positions", [], |row| row.get(0))
            .context("failed counting open positions")?;
        Ok(count.max(0) as u64)
    }

    /// Creates or grows a position after a confirmed fill (simulation, or
    /// a live fill that is already final). Outstanding pending quantity
    /// from other broadcasts is left untouched.
    pub fn apply_confirmed_buy(
        &self,
        mint: &str,
        add_raw: u128,
        decimals: u8,
        now: DateTime<Utc>,
    ) -> Result<u128> {
        let mint = mint.to_string();
        let now_raw = now.to_rfc3339();
        let new_total = self
            .with_immediate_tx(|conn| {
                let (balance, pending) = read_position_raw(conn, &mint)?.unwrap_or((0, 0));
                let new_total = balance.saturating_add(add_raw);
                write_position(conn, &mint, new_total, pending, Some(decimals), &now_raw)?;
                Ok(new_total)
            })
            .context("failed applying confirmed buy to position")?;
        Ok(new_total)
    }

    /// Creates or grows a position right after a live broadcast: the added
    /// quantity is reserved as pending under its transaction signature and
    /// stacks on top of any earlier still-unconfirmed broadcasts.
    pub fn apply_sent_buy(
        &self,
        mint: &str,
        add_raw: u128,
        decimals: u8,
        tx_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<u128> {
        let mint = mint.to_string();
        let tx_signature = tx_signature.to_string();
        let now_raw = now.to_rfc3339();
        let new_total = self
            .with_immediate_tx(|conn| {
                let (balance, pending) = read_position_raw(conn, &mint)?.unwrap_or((0, 0));
                let new_total = balance.saturating_add(add_raw);
                let new_pending = pending.saturating_add(add_raw);
                write_position(conn, &mint, new_total, new_pending, Some(decimals), &now_raw)?;
                conn.execute(
                    "INSERT OR IGNORE INTO position_pendings(tx_signature, mint, raw, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![&tx_signature, &mint, add_raw.to_string(), &now_raw],
                )?;
                Ok(new_total)
            })
            .context("failed applying sent buy to position")?;
        Ok(new_total)
    }

    /// Settles one broadcast once its signature reaches `confirmed`
    /// commitment: its share leaves the pending sum, and the row flips to
    /// Confirmed only when no other broadcast is still outstanding.
    pub fn confirm_pending_buy(
        &self,
        mint: &str,
        tx_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mint = mint.to_string();
        let tx_signature = tx_signature.to_string();
        let now_raw = now.to_rfc3339();
        self.with_immediate_tx(|conn| {
            let Some(share) = take_pending_row(conn, &mint, &tx_signature)? else {
                return Ok(false);
            };
            let Some((balance, pending)) = read_position_raw(conn, &mint)? else {
                return Ok(false);
            };
            write_position(
                conn,
                &mint,
                balance,
                pending.saturating_sub(share),
                None,
                &now_raw,
            )?;
            Ok(true)
        })
        .context("failed confirming pending buy")
    }

    /// Rolls back one failed or expired broadcast: only its own share is
    /// subtracted; confirmed inventory and other outstanding broadcasts
    /// are untouched. None when the signature was already settled.
    pub fn fail_pending_buy(
        &self,
        mint: &str,
        tx_signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FailOutcome>> {
        let mint = mint.to_string();
        let tx_signature = tx_signature.to_string();
        let now_raw = now.to_rfc3339();
        self.with_immediate_tx(|conn| {
            let Some(share) = take_pending_row(conn, &mint, &tx_signature)? else {
                return Ok(None);
            };
            let Some((balance, pending)) = read_position_raw(conn, &mint)? else {
                return Ok(None);
            };
            let remaining = balance.saturating_sub(share);
            if remaining == 0 {
                conn.execute("DELETE FROM positions WHERE mint = ?1", params![&mint])?;
                conn.execute(
                    "DELETE FROM position_pendings WHERE mint = ?1",
                    params![&mint],
                )?;
                return Ok(Some(FailOutcome::Deleted));
            }
            write_position(
                conn,
                &mint,
                remaining,
                pending.saturating_sub(share),
                None,
                &now_raw,
            )?;
            Ok(Some(FailOutcome::Reduced {
                remaining_raw: remaining,
            }))
        })
        .context("failed rolling back pending buy")
    }

    /// Shrinks a position after a SELL fill; the row disappears when the
    /// balance reaches zero (a zero-balance position must not exist).
    /// Pending reservations are not touched: a sell against a Sent row is
    /// only possible through the explicit allow-sell-on-sent override.
    pub fn reduce_after_sell(
        &self,
        mint: &str,
        sold_raw: u128,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let mint = mint.to_string();
        let now_raw = now.to_rfc3339();
        self.with_immediate_tx(|conn| {
            let (balance, pending) = read_position_raw(conn, &mint)?.unwrap_or((0, 0));
            let remaining = balance.saturating_sub(sold_raw);
            if remaining == 0 {
                conn.execute("DELETE FROM positions WHERE mint = ?1", params![&mint])?;
                conn.execute(
                    "DELETE FROM position_pendings WHERE mint = ?1",
                    params![&mint],
                )?;
                return Ok(FailOutcome::Deleted);
            }
            write_position(conn, &mint, remaining, pending.min(remaining), None, &now_raw)?;
            Ok(FailOutcome::Reduced {
                remaining_raw: remaining,
            })
        })
        .context("failed reducing position after sell")
    }

    /// Broadcasts whose confirmation is overdue; the reaper rolls each of
    /// these back individually.
    pub fn list_pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<PendingBuyRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT mint, tx_signature, raw, created_at
                 FROM position_pendings
                 WHERE created_at < ?1
                 ORDER BY created_at ASC",
            )
            .context("failed to prepare stale pending buys query")?;
        let mut rows = stmt
            .query(params![cutoff.to_rfc3339()])
            .context("failed querying stale pending buys")?;

        let mut pendings = Vec::new();
        while let Some(row) = rows.next().context("failed iterating stale pending buys")? {
            let mint: String = row.get(0).context("failed reading position_pendings.mint")?;
            let tx_signature: String = row
                .get(1)
                .context("failed reading position_pendings.tx_signature")?;
            let raw: String = row.get(2).context("failed reading position_pendings.raw")?;
            let created_at: String = row
                .get(3)
                .context("failed reading position_pendings.created_at")?;
            pendings.push(PendingBuyRow {
                mint,
                tx_signature,
                raw: parse_raw_amount(&raw, "position_pendings.raw")?,
                created_at: parse_rfc3339(&created_at, "position_pendings.created_at")?,
            });
        }
        Ok(pendings)
    }
}

fn take_pending_row(
    conn: &Connection,
    mint: &str,
    tx_signature: &str,
) -> rusqlite::Result<Option<u128>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT raw FROM position_pendings WHERE tx_signature = ?1 AND mint = ?2",
            params![tx_signature, mint],
            |row| row.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    conn.execute(
        "DELETE FROM position_pendings WHERE tx_signature = ?1",
        params![tx_signature],
    )?;
    Ok(Some(raw.parse::<u128>().unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_test_store;
    use tempfile::tempdir;

    #[test]
    fn buy_then_full_sell_deletes_the_row() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let now = Utc::now();

        store.apply_confirmed_buy("mint-a", 1_000_000, 6, now)?;
        let position = store.get_position("mint-a")?.expect("position exists");
        assert_eq!(position.raw_balance, 1_000_000);
        assert_eq!(position.pending_raw, 0);
        assert_eq!(position.status, PositionStatus::Confirmed);

        let outcome = store.reduce_after_sell("mint-a", 1_000_000, now)?;
        assert_eq!(outcome, FailOutcome::Deleted);
        assert!(store.get_position("mint-a")?.is_none());
        Ok(())
    }

    #[test]
    fn repeated_buys_accumulate_raw_balance() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let now = Utc::now();

        store.apply_confirmed_buy("mint-a", 500, 6, now)?;
        let total = store.apply_confirmed_buy("mint-a", 250, 6, now)?;
        assert_eq!(total, 750);
        assert_eq!(store.open_positions_count()?, 1);
        Ok(())
    }

    #[test]
    fn sent_write_reserves_the_added_quantity_as_pending() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let now = Utc::now();

        store.apply_confirmed_buy("mint-a", 300, 6, now)?;
        store.apply_sent_buy("mint-a", 200, 6, "tx-1", now)?;

        let position = store.get_position("mint-a")?.expect("position");
        assert_eq!(position.status, PositionStatus::Sent);
        assert_eq!(position.raw_balance, 500);
        assert_eq!(position.pending_raw, 200);

        assert!(store.confirm_pending_buy("mint-a", "tx-1", now)?);
        let position = store.get_position("mint-a")?.expect("position");
        assert_eq!(position.status, PositionStatus::Confirmed);
        assert_eq!(position.pending_raw, 0);

        // Already settled: a second confirmation is a no-op.
        assert!(!store.confirm_pending_buy("mint-a", "tx-1", now)?);
        Ok(())
    }

    #[test]
    fn stacked_sent_buys_accumulate_and_settle_per_broadcast() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let now = Utc::now();

        // Two broadcasts for the same mint, neither confirmed yet: the
        // second must stack its pending share, not overwrite the first.
        store.apply_sent_buy("mint-a", 500, 6, "tx-1", now)?;
        store.apply_sent_buy("mint-a", 200, 6, "tx-2", now)?;
        let position = store.get_position("mint-a")?.expect("position");
        assert_eq!(position.raw_balance, 700);
        assert_eq!(position.pending_raw, 700);
        assert_eq!(position.status, PositionStatus::Sent);

        // Confirming the first broadcast clears only its share; the row
        // stays Sent while the second is outstanding.
        assert!(store.confirm_pending_buy("mint-a", "tx-1", now)?);
        let position = store.get_position("mint-a")?.expect("position");
        assert_eq!(position.raw_balance, 700);
        assert_eq!(position.pending_raw, 200);
        assert_eq!(position.status, PositionStatus::Sent);

        // Failing the second rolls back exactly its 200, leaving the
        // confirmed 500 intact.
        let outcome = store.fail_pending_buy("mint-a", "tx-2", now)?;
        assert_eq!(outcome, Some(FailOutcome::Reduced { remaining_raw: 500 }));
        let position = store.get_position("mint-a")?.expect("position");
        assert_eq!(position.raw_balance, 500);
        assert_eq!(position.pending_raw, 0);
        assert_eq!(position.status, PositionStatus::Confirmed);
        Ok(())
    }

    #[test]
    fn fail_rolls_back_only_the_failed_broadcast() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let now = Utc::now();

        store.apply_confirmed_buy("mint-a", 300, 6, now)?;
        store.apply_sent_buy("mint-a", 200, 6, "tx-1", now)?;

        let outcome = store.fail_pending_buy("mint-a", "tx-1", now)?;
        assert_eq!(outcome, Some(FailOutcome::Reduced { remaining_raw: 300 }));
        let position = store.get_position("mint-a")?.expect("position remains");
        assert_eq!(position.status, PositionStatus::Confirmed);
        assert_eq!(position.pending_raw, 0);

        // Settled signatures cannot be rolled back twice.
        assert_eq!(store.fail_pending_buy("mint-a", "tx-1", now)?, None);
        Ok(())
    }

    #[test]
    fn fail_of_the_only_broadcast_deletes_the_row() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let now = Utc::now();

        store.apply_sent_buy("mint-a", 1_000, 6, "tx-1", now)?;
        let outcome = store.fail_pending_buy("mint-a", "tx-1", now)?;
        assert_eq!(outcome, Some(FailOutcome::Deleted));
        assert!(store.get_position("mint-a")?.is_none());
        assert!(store.list_pending_older_than(now + chrono::Duration::hours(1))?.is_empty());
        Ok(())
    }

    #[test]
    fn stale_pending_listing_honors_cutoff() -> Result<()> {
        let temp = tempdir().context("tempdir")?;
        let store = open_test_store(temp.path());
        let old = Utc::now() - chrono::Duration::minutes(10);
        let fresh = Utc::now();

        store.apply_sent_buy("stale-mint", 100, 6, "tx-old", old)?;
        store.apply_sent_buy("fresh-mint", 100, 6, "tx-new", fresh)?;

        let stale = store.list_pending_older_than(Utc::now() - chrono::Duration::minutes(5))?;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].mint, "stale-mint");
        assert_eq!(stale[0].tx_signature, "tx-old");
        assert_eq!(stale[0].raw, 100);
        Ok(())
    }
}
