use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use mirrorbot_core_types::SwapDescriptor;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration as StdDuration;

mod ledgers;
mod metrics;
mod positions;
mod virtual_ledger;

pub use ledgers::day_key;
pub use metrics::{ComparisonRow, PipelineMetricRow, PnlSnapshotRow};
pub use positions::{FailOutcome, PendingBuyRow, PositionRow};
pub use virtual_ledger::{VirtualPortfolioRow, VirtualTrade, VirtualWalletRow};

const WRITE_MAX_RETRIES: usize = 3;
const WRITE_RETRY_BACKOFF_MS: [u64; WRITE_MAX_RETRIES] = [100, 300, 700];

/// One handle per task. The inner mutex makes the handle shareable across
/// async suspension points; every lock is taken and released inside a
/// synchronous call, never held across an await.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create sqlite parent dir: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db: {}", path.display()))?;
        conn.busy_timeout(StdDuration::from_secs(5))
            .context("failed to set sqlite busy_timeout")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to set sqlite journal mode WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set sqlite synchronous NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable sqlite foreign keys")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Applies every pending `.sql` file in `migrations_dir`, sorted by
    /// filename, inside one transaction. Already-recorded versions are
    /// skipped, so repeated startups are no-ops.
    pub fn run_migrations(&mut self, migrations_dir: &Path) -> Result<usize> {
        if !migrations_dir.exists() {
            return Err(anyhow!(
                "migrations directory not found: {}",
                migrations_dir.display()
            ));
        }

        let mut files = read_migration_files(migrations_dir)?;
        files.sort();

        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("failed to open sqlite migration transaction")?;
        let mut applied = 0usize;

        for path in files {
            let version = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("invalid migration filename: {}", path.display()))?;

            let already_applied: Option<String> = tx
                .query_row(
                    "SELECT version FROM schema_migrations WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("failed checking migration {}", version))?;
            if already_applied.is_some() {
                continue;
            }

            let sql = fs::read_to_string(&path)
                .with_context(|| format!("failed reading migration file {}", path.display()))?;
            tx.execute_batch(&sql)
                .with_context(|| format!("failed applying migration {}", version))?;
            tx.execute(
                "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, datetime('now'))",
                params![version],
            )
            .with_context(|| format!("failed recording migration {}", version))?;

            applied += 1;
            tracing::info!(version = version, "migration applied");
        }

        tx.commit().context("failed to commit migrations")?;
        Ok(applied)
    }

    pub fn record_heartbeat(&self, component: &str, status: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO system_heartbeat(component, ts, status) VALUES (?1, datetime('now'), ?2)",
                params![component, status],
            )
            .context("failed to record heartbeat")?;
        Ok(())
    }

    /// The idempotency primitive: true only on the first insert of a
    /// signature. Callers inside the decision stage treat `false` as
    /// "another producer won the race, drop silently".
    pub fn mark_processed(&self, signature: &str, now: DateTime<Utc>) -> Result<bool> {
        let written = self
            .execute_with_retry(|conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO processed_events(signature, seen_at) VALUES (?1, ?2)",
                    params![signature, now.to_rfc3339()],
                )
            })
            .context("failed to insert processed event")?;
        Ok(written > 0)
    }

    /// Read-only probe used by producers before submitting; it must not
    /// mark anything, the authoritative insert happens in the stage.
    pub fn is_processed(&self, signature: &str) -> Result<bool> {
        let exists: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM processed_events WHERE signature = ?1",
                params![signature],
                |row| row.get(0),
            )
            .optional()
            .context("failed probing processed event")?;
        Ok(exists.is_some())
    }

    pub fn prune_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .execute_with_retry(|conn| {
                conn.execute(
                    "DELETE FROM processed_events WHERE seen_at < ?1",
                    params![cutoff.to_rfc3339()],
                )
            })
            .context("failed pruning processed events")?;
        Ok(removed)
    }

    pub fn insert_source_trade(&self, swap: &SwapDescriptor) -> Result<bool> {
        let written = self
            .execute_with_retry(|conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO source_trades(
                        signature, side, mint, sol_lamports, token_raw,
                        decimals, source, unsafe_parse, observed_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        &swap.signature,
                        swap.side.as_str(),
                        &swap.mint,
                        swap.upstream_sol_lamports as i64,
                        swap.upstream_token_raw.to_string(),
                        swap.token_decimals as i64,
                        swap.source.as_str(),
                        swap.unsafe_parse as i64,
                        swap.observed_at.to_rfc3339(),
                    ],
                )
            })
            .context("failed to insert source trade")?;
        Ok(written > 0)
    }

    pub(crate) fn execute_with_retry<F>(&self, mut operation: F) -> rusqlite::Result<usize>
    where
        F: FnMut(&Connection) -> rusqlite::Result<usize>,
    {
        for attempt in 0..=WRITE_MAX_RETRIES {
            match operation(&self.conn()) {
                Ok(changed) => return Ok(changed),
                Err(error) => {
                    if attempt < WRITE_MAX_RETRIES && is_retryable_sqlite_error(&error) {
                        std::thread::sleep(StdDuration::from_millis(
                            WRITE_RETRY_BACKOFF_MS[attempt],
                        ));
                        continue;
                    }
                    return Err(error);
                }
            }
        }
        unreachable!("retry loop must return on success or terminal error");
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection lock poisoned")
    }

    /// Runs `body` inside BEGIN IMMEDIATE .. COMMIT, rolling back on any
    /// error. Used by the multi-row mutations (virtual trades, position
    /// rollbacks) so readers never observe a half-applied write.
    pub(crate) fn with_immediate_tx<T>(
        &self,
        body: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn();
        conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
        match body(&conn) {
            Ok(value) => match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(error) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(error)
                }
            },
            Err(error) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(error)
            }
        }
    }
}

fn read_migration_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read migrations dir {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("sql") {
            files.push(path);
        }
    }
    Ok(files)
}

fn is_retryable_sqlite_error(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(code, message) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) || message
                .as_deref()
                .map(is_retryable_sqlite_message)
                .unwrap_or(false)
        }
        _ => is_retryable_sqlite_message(&error.to_string()),
    }
}

fn is_retryable_sqlite_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("database is locked")
        || lowered.contains("database is busy")
        || lowered.contains("database table is locked")
}

pub(crate) fn parse_rfc3339(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid {column} rfc3339 value: {raw}"))
}

pub(crate) fn parse_raw_amount(raw: &str, column: &str) -> Result<u128> {
    raw.parse::<u128>()
        .with_context(|| format!("invalid {column} raw amount: {raw}"))
}

#[cfg(test)]
pub(crate) fn open_test_store(dir: &Path) -> SqliteStore {
    let mut store = SqliteStore::open(&dir.join("mirrorbot-test.db")).expect("open test store");
    let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
    store.run_migrations(&migrations).expect("run migrations");
    store
}
