use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mirrorbot_core_types::LAMPORTS_PER_SOL;
use mirrorbot_execution::notify::Notifier;
use mirrorbot_execution::rpc::ChainRpc;
use mirrorbot_storage::{PnlSnapshotRow, SqliteStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

const SNAPSHOT_INTERVAL_SECS: u64 = 60;
const REAPER_INTERVAL_SECS: u64 = 120;
const CLEANUP_INTERVAL_SECS: u64 = 6 * 60 * 60;

const PROCESSED_RETENTION_HOURS: i64 = 48;
const SNAPSHOT_RETENTION_DAYS: i64 = 14;
const METRIC_RETENTION_DAYS: i64 = 14;

pub struct SchedulerDeps {
    pub db_path: String,
    pub dry_run: bool,
    pub pending_timeout_minutes: u64,
    pub heartbeat_seconds: u64,
    pub bot_pubkey: String,
    pub rpc: Arc<dyn ChainRpc>,
    pub notifier: Arc<dyn Notifier>,
}

/// Spawns the periodic tasks. Each one owns its store handle and swallows
/// its own errors, so a failing tick in one never touches the others.
pub fn spawn_scheduler_tasks(deps: SchedulerDeps) -> Vec<JoinHandle<()>> {
    let SchedulerDeps {
        db_path,
        dry_run,
        pending_timeout_minutes,
        heartbeat_seconds,
        bot_pubkey,
        rpc,
        notifier,
    } = deps;

    let mut tasks = Vec::new();

    {
        let db_path = db_path.clone();
        let rpc = Arc::clone(&rpc);
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(SNAPSHOT_INTERVAL_SECS));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(error) =
                    snapshot_once(&db_path, dry_run, &bot_pubkey, rpc.as_ref()).await
                {
                    warn!(error = %error, "pnl snapshot tick failed");
                }
            }
        }));
    }

    {
        let db_path = db_path.clone();
        let notifier = Arc::clone(&notifier);
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(REAPER_INTERVAL_SECS));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match open_store(&db_path) {
                    Ok(store) => {
                        if let Err(error) = reap_stale_sent(
                            &store,
                            pending_timeout_minutes,
                            notifier.as_ref(),
                            Utc::now(),
                        ) {
                            warn!(error = %error, "stale position reap tick failed");
                        }
                    }
                    Err(error) => warn!(error = %error, "reaper could not open store"),
                }
            }
        }));
    }

    {
        let db_path = db_path.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match open_store(&db_path) {
                    Ok(store) => {
                        if let Err(error) = cleanup_once(&store, Utc::now()) {
                            warn!(error = %error, "cleanup tick failed");
                        }
                    }
                    Err(error) => warn!(error = %error, "cleanup could not open store"),
                }
            }
        }));
    }

    {
        tasks.push(tokio::spawn(async move {
            let mut interval =
                time::interval(Duration::from_secs(heartbeat_seconds.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match open_store(&db_path) {
                    Ok(store) => {
                        if let Err(error) = store.record_heartbeat("mirrorbot", "alive") {
                            warn!(error = %error, "heartbeat write failed");
                        }
                    }
                    Err(error) => warn!(error = %error, "heartbeat could not open store"),
                }
            }
        }));
    }

    tasks
}

fn open_store(db_path: &str) -> Result<SqliteStore> {
    SqliteStore::open(Path::new(db_path)).context("failed opening sqlite store for scheduler task")
}

async fn snapshot_once(
    db_path: &str,
    dry_run: bool,
    bot_pubkey: &str,
    rpc: &dyn ChainRpc,
) -> Result<()> {
    let store = open_store(db_path)?;
    let open_positions = store.open_positions_count()?;
    let snapshot = if dry_run {
        let wallet = store.virtual_wallet()?;
        let (spent_sol, received_sol) = store.virtual_totals()?;
        PnlSnapshotRow {
            ts: Utc::now(),
            cash_sol: wallet.cash_sol,
            open_positions,
            spent_sol,
            received_sol,
        }
    } else {
        let lamports = rpc.get_balance_lamports(bot_pubkey).await?;
        PnlSnapshotRow {
            ts: Utc::now(),
            cash_sol: lamports as f64 / LAMPORTS_PER_SOL as f64,
            open_positions,
            spent_sol: 0.0,
            received_sol: 0.0,
        }
    };
    store.insert_pnl_snapshot(&snapshot)?;
    Ok(())
}

/// Scenario: a broadcast that never confirmed leaves its pending share
/// reserved on a Sent row. Every broadcast older than the timeout is
/// rolled back individually; shares of fresher broadcasts on the same
/// mint stay reserved.
pub fn reap_stale_sent(
    store: &SqliteStore,
    pending_timeout_minutes: u64,
    notifier: &dyn Notifier,
    now: DateTime<Utc>,
) -> Result<u64> {
    let cutoff = now - chrono::Duration::minutes(pending_timeout_minutes.max(1) as i64);
    let stale = store.list_pending_older_than(cutoff)?;
    let mut reaped = 0u64;
    for pending in stale {
        let Some(outcome) = store.fail_pending_buy(&pending.mint, &pending.tx_signature, now)?
        else {
            // Settled by the confirmation task between listing and here.
            continue;
        };
        reaped += 1;
        info!(
            mint = %pending.mint,
            tx_signature = %pending.tx_signature,
            pending_raw = %pending.raw,
            outcome = ?outcome,
            "stale pending buy reaped"
        );
        notifier.notify(
            "stale_position_reaped",
            &format!(
                "mint={} tx_signature={} pending_raw={} broadcast_at={}",
                pending.mint,
                pending.tx_signature,
                pending.raw,
                pending.created_at.to_rfc3339()
            ),
        );
    }
    Ok(reaped)
}

fn cleanup_once(store: &SqliteStore, now: DateTime<Utc>) -> Result<()> {
    let processed = store
        .prune_processed_before(now - chrono::Duration::hours(PROCESSED_RETENTION_HOURS))?;
    let snapshots =
        store.prune_pnl_snapshots_before(now - chrono::Duration::days(SNAPSHOT_RETENTION_DAYS))?;
    let metrics =
        store.prune_pipeline_metrics_before(now - chrono::Duration::days(METRIC_RETENTION_DAYS))?;
    info!(processed, snapshots, metrics, "retention cleanup done");
    Ok(())
}
