use anyhow::{Context, Result};
use chrono::Utc;
use mirrorbot_core_types::{RejectReason, SwapDescriptor, TradeOutcome, TradeSide};
use mirrorbot_storage::{PipelineMetricRow, SqliteStore};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::breaker::{BreakerSample, CircuitBreaker};
use crate::compare::{spawn_execution_comparison, CompareRequest};
use crate::notify::Notifier;
use crate::pending::{PendingBuys, PendingClearGuard};
use crate::queue::FifoQueue;
use crate::risk::{RiskDecision, RiskEngine, TradePlan};
use crate::rpc::ChainRpc;
use crate::simulator::DryRunExecutor;
use crate::submitter::{spawn_buy_confirmation, LiveExecutor};
use crate::{ExecOutcome, FilledTrade};

const PIPELINE_QUEUE_CAPACITY: usize = 1_024;
const SELL_BUFFER_STEP_MS: u64 = 500;
const SELL_BUFFER_MAX_MS: u64 = 4_000;

#[derive(Debug)]
pub struct SubmitItem {
    pub swap: SwapDescriptor,
    pub sell_buffered: bool,
    pub sell_buffer_ms: u64,
}

pub enum Executor {
    DryRun(DryRunExecutor),
    Live(LiveExecutor),
}

pub struct PipelineDeps {
    pub db_path: String,
    pub risk: RiskEngine,
    pub executor: Executor,
    pub breaker: Arc<CircuitBreaker>,
    pub pending: Arc<PendingBuys>,
    pub notifier: Arc<dyn Notifier>,
    pub rpc: Arc<dyn ChainRpc>,
    pub dry_run: bool,
    pub compare_alert_pct: f64,
    pub bot_pubkey: String,
}

/// Producer-facing side of the serializer. Submissions keep arrival order;
/// the sell-before-buy buffer runs here, outside the critical section, so
/// the racing BUY can reach the worker while the SELL waits.
pub struct PipelineHandle {
    queue: Arc<FifoQueue<SubmitItem>>,
    pending: Arc<PendingBuys>,
}

impl PipelineHandle {
    pub fn register_pending_buy(&self, mint: &str) {
        self.pending.add(mint);
    }

    pub fn pending(&self) -> Arc<PendingBuys> {
        Arc::clone(&self.pending)
    }

    pub async fn submit(&self, store: &SqliteStore, swap: SwapDescriptor) -> Result<bool> {
        let mut sell_buffered = false;
        let mut sell_buffer_ms = 0u64;

        if swap.side == TradeSide::Sell
            && !store.has_position(&swap.mint)?
            && self.pending.contains(&swap.mint)
        {
            sell_buffered = true;
            debug!(
                signature = %swap.signature,
                mint = %swap.mint,
                "sell arrived before its buy settled, buffering"
            );
            while sell_buffer_ms < SELL_BUFFER_MAX_MS {
                tokio::time::sleep(Duration::from_millis(SELL_BUFFER_STEP_MS)).await;
                sell_buffer_ms += SELL_BUFFER_STEP_MS;
                if store.has_position(&swap.mint)? || !self.pending.contains(&swap.mint) {
                    break;
                }
            }
        }

        Ok(self
            .queue
            .push(SubmitItem {
                swap,
                sell_buffered,
                sell_buffer_ms,
            })
            .await)
    }

    pub async fn close(&self) {
        self.queue.close().await;
    }
}

pub fn build_pipeline(deps: PipelineDeps) -> Result<(Arc<PipelineHandle>, PipelineWorker)> {
    let queue = Arc::new(FifoQueue::new(PIPELINE_QUEUE_CAPACITY));
    let store = SqliteStore::open(Path::new(&deps.db_path))
        .context("failed opening sqlite store for pipeline worker")?;
    let handle = Arc::new(PipelineHandle {
        queue: Arc::clone(&queue),
        pending: Arc::clone(&deps.pending),
    });
    let worker = PipelineWorker {
        queue,
        store,
        deps,
    };
    Ok((handle, worker))
}

/// The single logical worker behind the FIFO: every descriptor passes
/// through here one at a time, so risk checks always see a settled view of
/// positions, budget, and cooldowns.
pub struct PipelineWorker {
    queue: Arc<FifoQueue<SubmitItem>>,
    store: SqliteStore,
    deps: PipelineDeps,
}

impl PipelineWorker {
    pub async fn run(self) {
        info!("trade pipeline worker started");
        loop {
            let Some(item) = self.queue.pop().await else {
                info!("trade pipeline worker stopping, queue closed");
                return;
            };
            let signature = item.swap.signature.clone();
            if let Err(error) = self.process(item).await {
                warn!(
                    signature = %signature,
                    error = %error,
                    "pipeline stage failed"
                );
            }
        }
    }

    async fn process(&self, item: SubmitItem) -> Result<()> {
        let swap = &item.swap;
        // Finally-equivalent: the pending-buy flag clears on every exit
        // path of the stage, including errors.
        let _pending_guard = PendingClearGuard::new(
            Arc::clone(&self.deps.pending),
            (swap.side == TradeSide::Buy).then(|| swap.mint.clone()),
        );

        let stage_started = Instant::now();
        if !self.store.mark_processed(&swap.signature, Utc::now())? {
            debug!(signature = %swap.signature, "duplicate signature dropped");
            return Ok(());
        }

        if let Err(error) = self.store.insert_source_trade(swap) {
            warn!(signature = %swap.signature, error = %error, "source trade write failed");
        }

        let risk_started = Instant::now();
        let decision = self.deps.risk.evaluate(&self.store, swap).await?;
        let risk_ms = risk_started.elapsed().as_millis() as u64;

        match decision {
            RiskDecision::Execute(plan) => {
                let exec_started = Instant::now();
                let outcome = match &self.deps.executor {
                    Executor::DryRun(simulator) => simulator.execute(&self.store, &plan).await?,
                    Executor::Live(live) => live.execute(&plan).await,
                };
                let exec_ms = exec_started.elapsed().as_millis() as u64;
                let total_ms = stage_started.elapsed().as_millis() as u64;

                match outcome {
                    ExecOutcome::Filled(filled) => {
                        self.settle_fill(&plan, &filled)?;
                        self.emit_metric(
                            &item,
                            TradeOutcome::Copied,
                            None,
                            risk_ms,
                            exec_ms,
                            total_ms,
                            plan.drift_pct,
                        );
                        self.deps
                            .breaker
                            .record(BreakerSample::Copied { latency_ms: total_ms }, Utc::now());
                        info!(
                            signature = %swap.signature,
                            side = swap.side.as_str(),
                            mint = %swap.mint,
                            fill_signature = %filled.signature,
                            total_ms,
                            "trade copied"
                        );
                    }
                    ExecOutcome::Failed { reason } => {
                        self.emit_metric(
                            &item,
                            TradeOutcome::Failed,
                            Some(reason.clone()),
                            risk_ms,
                            exec_ms,
                            total_ms,
                            plan.drift_pct,
                        );
                        self.deps.breaker.record(BreakerSample::Failed, Utc::now());
                        self.deps.notifier.notify(
                            "execution_failed",
                            &format!("signature={} mint={} reason={}", swap.signature, swap.mint, reason),
                        );
                    }
                }
            }
            RiskDecision::Reject {
                reason,
                drift_pct,
                sent_wait_ms,
            } => {
                let total_ms = stage_started.elapsed().as_millis() as u64;
                let outcome = if reason == RejectReason::CircuitBreaker {
                    TradeOutcome::CircuitBreaker
                } else {
                    TradeOutcome::Rejected
                };
                self.emit_metric(
                    &item,
                    outcome,
                    Some(reason.detail()),
                    risk_ms,
                    0,
                    total_ms,
                    drift_pct,
                );
                let sample = if reason == RejectReason::NoPosition {
                    BreakerSample::NoPosition
                } else {
                    BreakerSample::Rejected
                };
                self.deps.breaker.record(sample, Utc::now());
                self.deps.notifier.notify(
                    "trade_rejected",
                    &format!(
                        "signature={} side={} mint={} reason={}",
                        swap.signature,
                        swap.side.as_str(),
                        swap.mint,
                        reason.tag()
                    ),
                );
                if sent_wait_ms > 0 {
                    debug!(
                        signature = %swap.signature,
                        sent_wait_ms,
                        "sell waited on an unconfirmed position before rejecting"
                    );
                }
            }
        }
        Ok(())
    }

    /// Position state machine and live-side ledgers after a fill. The
    /// simulator already settled the virtual ledger before returning.
    fn settle_fill(&self, plan: &TradePlan, filled: &FilledTrade) -> Result<()> {
        let now = Utc::now();
        match plan.side {
            TradeSide::Buy => {
                if self.deps.dry_run {
                    self.store.apply_confirmed_buy(
                        &plan.mint,
                        filled.out_raw,
                        plan.token_decimals,
                        now,
                    )?;
                } else {
                    self.store.apply_sent_buy(
                        &plan.mint,
                        filled.out_raw,
                        plan.token_decimals,
                        &filled.signature,
                        now,
                    )?;
                }

                if !self.deps.dry_run {
                    self.store.add_daily_spend(now, plan.amount_raw as u64)?;
                    self.store.set_cooldown(&plan.mint, now)?;
                    spawn_buy_confirmation(
                        Arc::clone(&self.deps.rpc),
                        Arc::clone(&self.deps.notifier),
                        self.deps.db_path.clone(),
                        plan.mint.clone(),
                        filled.signature.clone(),
                        filled.last_valid_block_height,
                    );
                    spawn_execution_comparison(
                        Arc::clone(&self.deps.rpc),
                        Arc::clone(&self.deps.notifier),
                        self.deps.db_path.clone(),
                        self.deps.bot_pubkey.clone(),
                        CompareRequest {
                            tx_signature: filled.signature.clone(),
                            side: TradeSide::Buy,
                            mint: plan.mint.clone(),
                            quoted_in_raw: plan.amount_raw,
                            quoted_out_raw: plan.quote.out_amount,
                            alert_pct: self.deps.compare_alert_pct,
                        },
                    );
                }
            }
            TradeSide::Sell => {
                self.store.reduce_after_sell(&plan.mint, plan.amount_raw, now)?;
                if !self.deps.dry_run {
                    self.store.set_cooldown(&plan.mint, now)?;
                    spawn_execution_comparison(
                        Arc::clone(&self.deps.rpc),
                        Arc::clone(&self.deps.notifier),
                        self.deps.db_path.clone(),
                        self.deps.bot_pubkey.clone(),
                        CompareRequest {
                            tx_signature: filled.signature.clone(),
                            side: TradeSide::Sell,
                            mint: plan.mint.clone(),
                            quoted_in_raw: plan.amount_raw,
                            quoted_out_raw: plan.quote.out_amount,
                            alert_pct: self.deps.compare_alert_pct,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_metric(
        &self,
        item: &SubmitItem,
        outcome: TradeOutcome,
        reject_reason: Option<String>,
        risk_ms: u64,
        exec_ms: u64,
        total_ms: u64,
        price_drift_pct: Option<f64>,
    ) {
        let metric = PipelineMetricRow {
            signature: item.swap.signature.clone(),
            side: item.swap.side,
            mint: item.swap.mint.clone(),
            source: item.swap.source,
            outcome,
            reject_reason,
            sell_buffered: item.sell_buffered,
            sell_buffer_ms: item.sell_buffer_ms,
            risk_ms,
            exec_ms,
            total_ms,
            price_drift_pct,
            unsafe_parse: item.swap.unsafe_parse,
            created_at: Utc::now(),
        };
        if let Err(error) = self.store.insert_pipeline_metric(&metric) {
            warn!(
                signature = %item.swap.signature,
                error = %error,
                "pipeline metric write failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use crate::testing::{FakeAggregator, FakeRpc};
    use mirrorbot_config::{BreakerConfig, DryRunFeeMode, TradeConfig};
    use mirrorbot_core_types::SourceTag;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    const UPSTREAM: &str = "UpstreamWa11et111111111111111111111111111111";
    const BOT: &str = "BotWa11et11111111111111111111111111111111111";
    const MINT_A: &str = "MintA1111111111111111111111111111111111111";

    fn trade_config() -> TradeConfig {
        TradeConfig {
            copy_ratio: 1.0,
            min_sol_per_trade: 0.001,
            max_sol_per_trade: 1.0,
            max_sol_per_day: 100.0,
            max_open_positions: 10,
            slippage_bps: 100,
            max_price_impact_bps: 10_000,
            priority_fee_lamports: 100_000,
            cooldown_seconds: 0,
            min_reserve_sol: 0.0,
            max_fee_pct: 100.0,
            block_if_mint_authority: false,
            block_if_freeze_authority: false,
            restrict_intermediate_tokens: true,
            max_price_drift_pct: 0.0,
            allow_unsafe_parse_trades: false,
            disable_drift_guard_on_unsafe_parse: false,
            allow_sell_on_sent_position: false,
            sell_on_sent_timeout_seconds: 2,
            pending_position_timeout_minutes: 5,
            pause_trading: false,
            dry_run: true,
            dry_run_fee_mode: DryRunFeeMode::Estimate,
            compare_alert_pct: 2.0,
            virtual_starting_balance_sol: 10.0,
        }
    }

    fn breaker_config() -> BreakerConfig {
        BreakerConfig {
            fail_rate_pct: 30.0,
            fail_window_minutes: 10,
            latency_p99_ms: 60_000,
            no_position_spike: 50,
            auto_reset_minutes: 0,
        }
    }

    struct Harness {
        _temp: TempDir,
        db_path: String,
        handle: Arc<PipelineHandle>,
        breaker: Arc<CircuitBreaker>,
        aggregator: Arc<FakeAggregator>,
        probe: SqliteStore,
        _worker: JoinHandle<()>,
    }

    fn open_store(db_path: &str) -> SqliteStore {
        let mut store = SqliteStore::open(Path::new(db_path)).expect("open store");
        let migrations = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        store.run_migrations(&migrations).expect("run migrations");
        store
    }

    fn spawn_harness(trade: TradeConfig, aggregator: FakeAggregator, rpc: FakeRpc) -> Harness {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp
            .path()
            .join("pipeline.db")
            .to_string_lossy()
            .to_string();
        let store = open_store(&db_path);
        store
            .init_virtual_wallet(trade.virtual_starting_balance_sol, Utc::now())
            .expect("init virtual wallet");

        let aggregator = Arc::new(aggregator);
        let aggregator_api: Arc<dyn crate::aggregator::AggregatorApi> =
            Arc::clone(&aggregator) as Arc<dyn crate::aggregator::AggregatorApi>;
        let chain_rpc: Arc<dyn ChainRpc> = Arc::new(rpc);
        let breaker = CircuitBreaker::new(breaker_config());
        let pending = PendingBuys::new();
        let risk = RiskEngine::new(
            trade.clone(),
            Arc::clone(&breaker),
            Arc::clone(&aggregator_api),
            Arc::clone(&chain_rpc),
            UPSTREAM.to_string(),
            BOT.to_string(),
        );
        let simulator = DryRunExecutor::new(
            trade.dry_run_fee_mode,
            Arc::clone(&aggregator_api),
            Arc::clone(&chain_rpc),
            BOT.to_string(),
        );
        let deps = PipelineDeps {
            db_path: db_path.clone(),
            risk,
            executor: Executor::DryRun(simulator),
            breaker: Arc::clone(&breaker),
            pending,
            notifier: Arc::new(LogNotifier),
            rpc: chain_rpc,
            dry_run: true,
            compare_alert_pct: trade.compare_alert_pct,
            bot_pubkey: BOT.to_string(),
        };
        let (handle, worker) = build_pipeline(deps).expect("build pipeline");
        let worker = tokio::spawn(worker.run());

        Harness {
            probe: open_store(&db_path),
            _temp: temp,
            db_path,
            handle,
            breaker,
            aggregator,
            _worker: worker,
        }
    }

    fn swap(signature: &str, side: TradeSide, mint: &str, sol_lamports: u64, token_raw: u128) -> SwapDescriptor {
        SwapDescriptor {
            signature: signature.to_string(),
            side,
            mint: mint.to_string(),
            upstream_sol_lamports: sol_lamports,
            upstream_token_raw: token_raw,
            token_decimals: 6,
            source: SourceTag::Webhook,
            unsafe_parse: false,
            observed_at: Utc::now(),
        }
    }

    async fn wait_for_metric(probe: &SqliteStore, signature: &str) -> u64 {
        for _ in 0..200 {
            let count = probe
                .pipeline_metric_count_for_signature(signature)
                .expect("metric count");
            if count > 0 {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("metric for {signature} never appeared");
    }

    fn metric_row(probe: &SqliteStore, signature: &str) -> PipelineMetricRow {
        probe
            .get_pipeline_metric(signature)
            .expect("query metric")
            .expect("metric row exists")
    }

    #[tokio::test]
    async fn concurrent_duplicate_submission_processes_once() {
        let aggregator = FakeAggregator::default().with_buy_rate(MINT_A, 1_000_000, 500_000_000);
        let harness = spawn_harness(trade_config(), aggregator, FakeRpc::default());

        let buy = swap("dup-sig", TradeSide::Buy, MINT_A, 500_000_000, 1_000_000);
        let store_a = open_store(&harness.db_path);
        let store_b = open_store(&harness.db_path);
        let handle_a = Arc::clone(&harness.handle);
        let handle_b = Arc::clone(&harness.handle);
        let buy_a = buy.clone();
        let buy_b = buy.clone();

        let submit_a = tokio::spawn(async move { handle_a.submit(&store_a, buy_a).await });
        let submit_b = tokio::spawn(async move { handle_b.submit(&store_b, buy_b).await });
        submit_a.await.expect("join a").expect("submit a");
        submit_b.await.expect("join b").expect("submit b");

        wait_for_metric(&harness.probe, "dup-sig").await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            harness
                .probe
                .pipeline_metric_count_for_signature("dup-sig")
                .expect("count"),
            1,
            "exactly one metric row despite two producers"
        );
        let position = harness
            .probe
            .get_position(MINT_A)
            .expect("query position")
            .expect("position exists");
        assert_eq!(position.raw_balance, 1_000_000, "single position mutation");
    }

    #[tokio::test]
    async fn sell_before_buy_buffers_then_copies_proportionally() {
        // The slow quote keeps the BUY inside the decision stage while the
        // SELL arrives 100ms later.
        let aggregator = FakeAggregator::default()
            .with_buy_rate(MINT_A, 1_000_000, 500_000_000)
            .with_sell_rate(MINT_A, 500_000_000, 1_000_000)
            .with_quote_delay_ms(700);
        // Upstream sold its whole balance: fraction resolves to 1.
        let rpc = FakeRpc::default().with_token_balance(UPSTREAM, MINT_A, 0);
        let harness = spawn_harness(trade_config(), aggregator, rpc);

        let buy = swap("race-buy", TradeSide::Buy, MINT_A, 500_000_000, 1_000_000);
        let sell = swap("race-sell", TradeSide::Sell, MINT_A, 500_000_000, 1_000_000);

        // Producer protocol: the BUY is registered pending before submit.
        harness.handle.register_pending_buy(MINT_A);
        let buy_handle = Arc::clone(&harness.handle);
        let buy_store = open_store(&harness.db_path);
        let buy_task = tokio::spawn(async move { buy_handle.submit(&buy_store, buy).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let sell_store = open_store(&harness.db_path);
        harness
            .handle
            .submit(&sell_store, sell)
            .await
            .expect("submit sell");
        buy_task.await.expect("join buy").expect("submit buy");

        wait_for_metric(&harness.probe, "race-sell").await;
        let metric = metric_row(&harness.probe, "race-sell");
        assert_eq!(metric.outcome, TradeOutcome::Copied);
        assert!(metric.sell_buffered, "sell must report it was buffered");
        assert!(
            metric.sell_buffer_ms > 0 && metric.sell_buffer_ms <= 4_000,
            "buffer delay in (0, 4000], got {}",
            metric.sell_buffer_ms
        );
        assert!(
            harness
                .probe
                .get_position(MINT_A)
                .expect("query position")
                .is_none(),
            "full proportional exit deletes the position"
        );
    }

    #[tokio::test]
    async fn unsafe_parse_is_gated_with_zero_exec_latency() {
        let aggregator = FakeAggregator::default().with_buy_rate(MINT_A, 1_000_000, 500_000_000);
        let harness = spawn_harness(trade_config(), aggregator, FakeRpc::default());

        let mut buy = swap("unsafe-sig", TradeSide::Buy, MINT_A, 500_000_000, 1_000_000);
        buy.unsafe_parse = true;
        let store = open_store(&harness.db_path);
        harness.handle.submit(&store, buy).await.expect("submit");

        wait_for_metric(&harness.probe, "unsafe-sig").await;
        let metric = metric_row(&harness.probe, "unsafe-sig");
        assert_eq!(metric.outcome, TradeOutcome::Rejected);
        assert_eq!(metric.reject_reason.as_deref(), Some("UNSAFE_PARSE"));
        assert_eq!(metric.exec_ms, 0);
        assert!(metric.unsafe_parse);
    }

    #[tokio::test]
    async fn price_drift_rejection_records_measured_drift() {
        // Upstream got 1_000_000 raw per SOL; our quote gives 500_000.
        let aggregator = FakeAggregator::default().with_buy_rate(MINT_A, 500_000, 1_000_000_000);
        let mut trade = trade_config();
        trade.max_price_drift_pct = 0.2; // 20% threshold
        let harness = spawn_harness(trade, aggregator, FakeRpc::default());

        let buy = swap("drift-sig", TradeSide::Buy, MINT_A, 1_000_000_000, 1_000_000);
        let store = open_store(&harness.db_path);
        harness.handle.submit(&store, buy).await.expect("submit");

        wait_for_metric(&harness.probe, "drift-sig").await;
        let metric = metric_row(&harness.probe, "drift-sig");
        assert_eq!(metric.outcome, TradeOutcome::Rejected);
        assert_eq!(metric.reject_reason.as_deref(), Some("PRICE_DRIFT_TOO_HIGH"));
        let drift = metric.price_drift_pct.expect("drift recorded");
        assert!((drift - 100.0).abs() < 1e-6, "drift should be 100%, got {drift}");
    }

    #[tokio::test]
    async fn open_breaker_rejects_buy_before_any_external_call() {
        let aggregator = FakeAggregator::default().with_buy_rate(MINT_A, 1_000_000, 500_000_000);
        let harness = spawn_harness(trade_config(), aggregator, FakeRpc::default());

        let now = Utc::now();
        for _ in 0..4 {
            harness.breaker.record(BreakerSample::Failed, now);
        }
        assert!(harness.breaker.is_open(now));

        let buy = swap("breaker-sig", TradeSide::Buy, MINT_A, 500_000_000, 1_000_000);
        let store = open_store(&harness.db_path);
        harness.handle.submit(&store, buy).await.expect("submit");

        wait_for_metric(&harness.probe, "breaker-sig").await;
        let metric = metric_row(&harness.probe, "breaker-sig");
        assert_eq!(metric.outcome, TradeOutcome::CircuitBreaker);
        assert_eq!(metric.reject_reason.as_deref(), Some("CIRCUIT_BREAKER"));
        assert_eq!(
            harness
                .aggregator
                .quote_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0,
            "no external call may happen while the breaker is open"
        );
    }

    #[tokio::test]
    async fn replaying_a_batch_three_times_equals_one_submission() {
        let mut aggregator = FakeAggregator::default();
        for index in 0..10 {
            aggregator = aggregator.with_buy_rate(&format!("BatchMint{index}"), 1_000_000, 500_000_000);
        }
        let harness = spawn_harness(trade_config(), aggregator, FakeRpc::default());
        let store = open_store(&harness.db_path);

        for _round in 0..3 {
            for index in 0..10 {
                let buy = swap(
                    &format!("batch-sig-{index}"),
                    TradeSide::Buy,
                    &format!("BatchMint{index}"),
                    100_000_000,
                    1_000_000,
                );
                harness.handle.submit(&store, buy).await.expect("submit");
            }
        }

        for index in 0..10 {
            wait_for_metric(&harness.probe, &format!("batch-sig-{index}")).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(harness.probe.pipeline_metric_count().expect("count"), 10);
        assert_eq!(harness.probe.open_positions_count().expect("count"), 10);
        for index in 0..10 {
            let position = harness
                .probe
                .get_position(&format!("BatchMint{index}"))
                .expect("query")
                .expect("position");
            assert_eq!(
                position.raw_balance, 200_000,
                "replays must not grow the position"
            );
        }
    }

    #[tokio::test]
    async fn buy_then_full_sell_restores_cash_minus_fees() {
        let aggregator = FakeAggregator::default()
            .with_buy_rate(MINT_A, 1_000_000, 500_000_000)
            .with_sell_rate(MINT_A, 500_000_000, 1_000_000);
        let rpc = FakeRpc::default().with_token_balance(UPSTREAM, MINT_A, 0);
        let harness = spawn_harness(trade_config(), aggregator, rpc);
        let store = open_store(&harness.db_path);

        let buy = swap("cycle-buy", TradeSide::Buy, MINT_A, 500_000_000, 1_000_000);
        harness.handle.submit(&store, buy).await.expect("submit buy");
        wait_for_metric(&harness.probe, "cycle-buy").await;

        let sell = swap("cycle-sell", TradeSide::Sell, MINT_A, 500_000_000, 1_000_000);
        harness.handle.submit(&store, sell).await.expect("submit sell");
        wait_for_metric(&harness.probe, "cycle-sell").await;

        assert!(harness.probe.get_position(MINT_A).expect("query").is_none());
        let cash = harness.probe.virtual_cash_sol().expect("cash");
        let fees_paid = 2.0 * (5_000.0 + 100_000.0) / 1e9;
        assert!(
            cash >= 10.0 - fees_paid - 1e-9,
            "cash {cash} must be at least initial minus fees {fees_paid}"
        );
        assert!(
            harness.probe.virtual_reconcile().expect("reconcile") < 1e-6,
            "virtual ledger must reconcile"
        );
    }

    #[tokio::test]
    async fn sell_without_position_or_pending_rejects_no_position() {
        let aggregator = FakeAggregator::default().with_sell_rate(MINT_A, 500_000_000, 1_000_000);
        let harness = spawn_harness(trade_config(), aggregator, FakeRpc::default());
        let store = open_store(&harness.db_path);

        let sell = swap("lonely-sell", TradeSide::Sell, MINT_A, 500_000_000, 1_000_000);
        harness.handle.submit(&store, sell).await.expect("submit");

        wait_for_metric(&harness.probe, "lonely-sell").await;
        let metric = metric_row(&harness.probe, "lonely-sell");
        assert_eq!(metric.outcome, TradeOutcome::Rejected);
        assert_eq!(metric.reject_reason.as_deref(), Some("NO_POSITION"));
        assert!(!metric.sell_buffered, "no pending flag means no buffering");
    }

    #[tokio::test]
    async fn daily_budget_shrinks_then_exhausts() {
        let aggregator = FakeAggregator::default()
            .with_buy_rate("BudgetMint0", 1_000_000, 500_000_000)
            .with_buy_rate("BudgetMint1", 1_000_000, 500_000_000)
            .with_buy_rate("BudgetMint2", 1_000_000, 500_000_000);
        let mut trade = trade_config();
        trade.max_sol_per_day = 0.15;
        let harness = spawn_harness(trade, aggregator, FakeRpc::default());
        let store = open_store(&harness.db_path);

        // 0.1 spent, 0.05 left, 0.1 requested: the engine shrinks the
        // second trade to the remainder instead of rejecting it.
        for index in 0..3 {
            let buy = swap(
                &format!("budget-{index}"),
                TradeSide::Buy,
                &format!("BudgetMint{index}"),
                100_000_000,
                1_000_000,
            );
            harness.handle.submit(&store, buy).await.expect("submit");
            wait_for_metric(&harness.probe, &format!("budget-{index}")).await;
        }

        assert_eq!(metric_row(&harness.probe, "budget-0").outcome, TradeOutcome::Copied);
        assert_eq!(metric_row(&harness.probe, "budget-1").outcome, TradeOutcome::Copied);
        let third = metric_row(&harness.probe, "budget-2");
        assert_eq!(third.outcome, TradeOutcome::Rejected);
        assert_eq!(third.reject_reason.as_deref(), Some("BUDGET_EXHAUSTED"));

        let spent = harness
            .probe
            .daily_spent_lamports(Utc::now())
            .expect("daily spend");
        assert_eq!(spent, 150_000_000, "second buy reduced to the remainder");
    }

    #[tokio::test]
    async fn buy_beyond_position_cap_is_rejected() {
        let aggregator = FakeAggregator::default()
            .with_buy_rate(MINT_A, 1_000_000, 500_000_000)
            .with_buy_rate("OtherMint", 1_000_000, 500_000_000);
        let mut trade = trade_config();
        trade.max_open_positions = 1;
        let harness = spawn_harness(trade, aggregator, FakeRpc::default());
        let store = open_store(&harness.db_path);

        let first = swap("cap-1", TradeSide::Buy, MINT_A, 500_000_000, 1_000_000);
        harness.handle.submit(&store, first).await.expect("submit");
        wait_for_metric(&harness.probe, "cap-1").await;

        let second = swap("cap-2", TradeSide::Buy, "OtherMint", 500_000_000, 1_000_000);
        harness.handle.submit(&store, second).await.expect("submit");
        wait_for_metric(&harness.probe, "cap-2").await;

        let metric = metric_row(&harness.probe, "cap-2");
        assert_eq!(metric.outcome, TradeOutcome::Rejected);
        assert_eq!(metric.reject_reason.as_deref(), Some("MAX_OPEN_POSITIONS"));
        assert_eq!(harness.probe.open_positions_count().expect("count"), 1);
    }
}
