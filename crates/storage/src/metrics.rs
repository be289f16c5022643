use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mirrorbot_core_types::{SourceTag, TradeOutcome, TradeSide};
use rusqlite::{params, OptionalExtension};

use crate::SqliteStore;

/// One row per signature that entered the decision stage. The reason tag is
/// the stable string from `RejectReason::tag`, never free text.
#[derive(Debug, Clone)]
pub struct PipelineMetricRow {
    pub signature: String,
    pub side: TradeSide,
    pub mint: String,
    pub source: SourceTag,
    pub outcome: TradeOutcome,
    pub reject_reason: Option<String>,
    pub sell_buffered: bool,
    pub sell_buffer_ms: u64,
    pub risk_ms: u64,
    pub exec_ms: u64,
    pub total_ms: u64,
    pub price_drift_pct: Option<f64>,
    pub unsafe_parse: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PnlSnapshotRow {
    pub ts: DateTime<Utc>,
    pub cash_sol: f64,
    pub open_positions: u64,
    pub spent_sol: f64,
    pub received_sol: f64,
}

#[derive(Debug, Clone)]
pub struct ComparisonRow {
    pub signature: String,
    pub side: TradeSide,
    pub mint: String,
    pub quoted_sol: f64,
    pub real_sol: Option<f64>,
    pub quoted_token_raw: u128,
    pub real_token_raw: Option<u128>,
    pub slippage_pct: Option<f64>,
    pub fee_lamports: Option<u64>,
    pub compute_units: Option<u64>,
}

impl SqliteStore {
    pub fn insert_pipeline_metric(&self, metric: &PipelineMetricRow) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT INTO trade_pipeline_metrics(
                    signature, side, mint, source, outcome, reject_reason,
                    sell_buffered, sell_buffer_ms, risk_ms, exec_ms, total_ms,
                    price_drift_pct, unsafe_parse, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    &metric.signature,
                    metric.side.as_str(),
                    &metric.mint,
                    metric.source.as_str(),
                    metric.outcome.as_str(),
                    metric.reject_reason.as_deref(),
                    metric.sell_buffered as i64,
                    metric.sell_buffer_ms as i64,
                    metric.risk_ms as i64,
                    metric.exec_ms as i64,
                    metric.total_ms as i64,
                    metric.price_drift_pct,
                    metric.unsafe_parse as i64,
                    metric.created_at.to_rfc3339(),
                ],
            )
        })
        .context("failed inserting pipeline metric")?;
        Ok(())
    }

    pub fn pipeline_metric_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM trade_pipeline_metrics", [], |row| {
                row.get(0)
            })
            .context("failed counting pipeline metrics")?;
        Ok(count.max(0) as u64)
    }

    pub fn pipeline_metric_count_for_signature(&self, signature: &str) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM trade_pipeline_metrics WHERE signature = ?1",
                params![signature],
                |row| row.get(0),
            )
            .context("failed counting pipeline metrics for signature")?;
        Ok(count.max(0) as u64)
    }

    pub fn get_pipeline_metric(&self, signature: &str) -> Result<Option<PipelineMetricRow>> {
        let row = self
            .conn()
            .query_row(
                "SELECT signature, side, mint, source, outcome, reject_reason,
                        sell_buffered, sell_buffer_ms, risk_ms, exec_ms, total_ms,
                        price_drift_pct, unsafe_parse, created_at
                 FROM trade_pipeline_metrics
                 WHERE signature = ?1
                 ORDER BY id ASC
                 LIMIT 1",
                params![signature],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, i64>(10)?,
                        row.get::<_, Option<f64>>(11)?,
                        row.get::<_, i64>(12)?,
                        row.get::<_, String>(13)?,
                    ))
                },
            )
            .optional()
            .context("failed querying pipeline metric")?;

        row.map(
            |(
                signature,
                side,
                mint,
                source,
                outcome,
                reject_reason,
                sell_buffered,
                sell_buffer_ms,
                risk_ms,
                exec_ms,
                total_ms,
                price_drift_pct,
                unsafe_parse,
                created_at,
            )| {
                Ok(PipelineMetricRow {
                    signature,
                    side: TradeSide::parse(&side)
                        .with_context(|| format!("invalid metric side value: {side}"))?,
                    mint,
                    source: SourceTag::parse(&source)
                        .with_context(|| format!("invalid metric source value: {source}"))?,
                    outcome: TradeOutcome::parse(&outcome)
                        .with_context(|| format!("invalid metric outcome value: {outcome}"))?,
                    reject_reason,
                    sell_buffered: sell_buffered != 0,
                    sell_buffer_ms: sell_buffer_ms.max(0) as u64,
                    risk_ms: risk_ms.max(0) as u64,
                    exec_ms: exec_ms.max(0) as u64,
                    total_ms: total_ms.max(0) as u64,
                    price_drift_pct,
                    unsafe_parse: unsafe_parse != 0,
                    created_at: crate::parse_rfc3339(&created_at, "trade_pipeline_metrics.created_at")?,
                })
            },
        )
        .transpose()
    }

    pub fn insert_pnl_snapshot(&self, snapshot: &PnlSnapshotRow) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT INTO pnl_snapshots(ts, cash_sol, open_positions, spent_sol, received_sol)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    snapshot.ts.to_rfc3339(),
                    snapshot.cash_sol,
                    snapshot.open_positions as i64,
                    snapshot.spent_sol,
                    snapshot.received_sol,
                ],
            )
        })
        .context("failed inserting pnl snapshot")?;
        Ok(())
    }

    pub fn prune_pnl_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .execute_with_retry(|conn| {
                conn.execute(
                    "DELETE FROM pnl_snapshots WHERE ts < ?1",
                    params![cutoff.to_rfc3339()],
                )
            })
            .context("failed pruning pnl snapshots")?;
        Ok(removed)
    }

    pub fn prune_pipeline_metrics_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .execute_with_retry(|conn| {
                conn.execute(
                    "DELETE FROM trade_pipeline_metrics WHERE created_at < ?1",
                    params![cutoff.to_rfc3339()],
                )
            })
            .context("failed pruning pipeline metrics")?;
        Ok(removed)
    }

    pub fn insert_execution_comparison(
        &self,
        row: &ComparisonRow,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.execute_with_retry(|conn| {
            conn.execute(
                "INSERT INTO execution_comparisons(
                    signature, side, mint, quoted_sol, real_sol,
                    quoted_token_raw, real_token_raw, slippage_pct,
                    fee_lamports, compute_units, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    &row.signature,
                    row.side.as_str(),
                    &row.mint,
                    row.quoted_sol,
                    row.real_sol,
                    row.quoted_token_raw.to_string(),
                    row.real_token_raw.map(|value| value.to_string()),
                    row.slippage_pct,
                    row.fee_lamports.map(|value| value as i64),
                    row.compute_units.map(|value| value as i64),
                    now.to_rfc3339(),
                ],
            )
        })
        .context("failed inserting execution comparison")?;
        Ok(())
    }
}
