use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use mirrorbot_config::load_from_env_or_default;
use mirrorbot_execution::{
    build_pipeline, keypair_from_base58, keypair_pubkey, CircuitBreaker, DryRunExecutor, Executor,
    HttpAggregator, HttpChainRpc, LiveExecutor, LogNotifier, PendingBuys, PipelineDeps,
    PipelineHandle, RiskEngine,
};
use mirrorbot_ingestion::{
    PollSource, ProducerDeps, SubscriptionSource, SwapParser, WebhookIngest,
};
use mirrorbot_storage::SqliteStore;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod scheduler;
mod web;

use scheduler::{spawn_scheduler_tasks, SchedulerDeps};
use web::{router, WebState};

const DEFAULT_CONFIG_PATH: &str = "configs/dev.toml";
const RPC_TIMEOUT_MS: u64 = 5_000;

#[tokio::main]
async fn main() -> Result<()> {
    let cli_config = parse_config_arg();
    let default_path = cli_config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let (config, loaded_config_path) = load_from_env_or_default(&default_path)?;

    init_tracing(&config.system.log_level, config.system.log_json);
    info!(
        config_path = %loaded_config_path.display(),
        env = %config.system.env,
        upstream = %config.wallet.upstream,
        dry_run = config.trade.dry_run,
        "configuration loaded"
    );

    let mut store = SqliteStore::open(Path::new(&config.sqlite.path))
        .context("failed to initialize sqlite store")?;
    let migrations_dir = resolve_migrations_dir(&loaded_config_path, &config.system.migrations_dir);
    let applied = store
        .run_migrations(&migrations_dir)
        .with_context(|| format!("failed to apply migrations in {}", migrations_dir.display()))?;
    info!(applied, "sqlite migrations applied");

    store
        .record_heartbeat("mirrorbot", "startup")
        .context("failed to write startup heartbeat")?;
    if config.trade.dry_run {
        store
            .init_virtual_wallet(config.trade.virtual_starting_balance_sol, Utc::now())
            .context("failed seeding virtual wallet")?;
    }

    let rpc: Arc<dyn mirrorbot_execution::ChainRpc> = Arc::new(
        HttpChainRpc::new(&config.ingestion.rpc_http_url, RPC_TIMEOUT_MS)
            .context("failed building chain rpc client")?,
    );
    let aggregator: Arc<dyn mirrorbot_execution::AggregatorApi> = Arc::new(
        HttpAggregator::new(&config.aggregator.base_url, config.aggregator.timeout_ms)
            .context("failed building aggregator client")?,
    );
    let breaker = CircuitBreaker::new(config.breaker.clone());
    let notifier: Arc<dyn mirrorbot_execution::Notifier> = Arc::new(LogNotifier);
    let pending = PendingBuys::new();

    let keypair = {
        let encoded = config.wallet.keypair_base58.trim();
        if encoded.is_empty() {
            None
        } else {
            Some(keypair_from_base58(encoded).context("invalid wallet.keypair_base58")?)
        }
    };
    let bot_pubkey = keypair
        .as_ref()
        .map(keypair_pubkey)
        .unwrap_or_else(|| "11111111111111111111111111111111".to_string());

    let executor = if config.trade.dry_run {
        Executor::DryRun(DryRunExecutor::new(
            config.trade.dry_run_fee_mode,
            Arc::clone(&aggregator),
            Arc::clone(&rpc),
            bot_pubkey.clone(),
        ))
    } else {
        let keypair =
            keypair.ok_or_else(|| anyhow!("live mode requires wallet.keypair_base58"))?;
        Executor::Live(LiveExecutor::new(
            Arc::clone(&aggregator),
            Arc::clone(&rpc),
            keypair,
        ))
    };

    let risk = RiskEngine::new(
        config.trade.clone(),
        Arc::clone(&breaker),
        Arc::clone(&aggregator),
        Arc::clone(&rpc),
        config.wallet.upstream.clone(),
        bot_pubkey.clone(),
    );
    let (pipeline, worker) = build_pipeline(PipelineDeps {
        db_path: config.sqlite.path.clone(),
        risk,
        executor,
        breaker: Arc::clone(&breaker),
        pending,
        notifier: Arc::clone(&notifier),
        rpc: Arc::clone(&rpc),
        dry_run: config.trade.dry_run,
        compare_alert_pct: config.trade.compare_alert_pct,
        bot_pubkey: bot_pubkey.clone(),
    })
    .context("failed building trade pipeline")?;
    let worker_task = tokio::spawn(worker.run());

    // Three redundant producers, each with its own store handle.
    let (ingest, _webhook_task) = WebhookIngest::spawn(
        producer_deps(&config.sqlite.path, &config, Arc::clone(&rpc), Arc::clone(&pipeline))?,
        config.ingestion.webhook_rate_limit_per_min,
    );
    tokio::spawn(
        SubscriptionSource::new(
            producer_deps(&config.sqlite.path, &config, Arc::clone(&rpc), Arc::clone(&pipeline))?,
            config.ingestion.rpc_ws_url.clone(),
            config.ingestion.ws_health_check_seconds,
            config.ingestion.reconnect_initial_ms,
            config.ingestion.reconnect_max_ms,
        )
        .run(),
    );
    tokio::spawn(
        PollSource::new(
            producer_deps(&config.sqlite.path, &config, Arc::clone(&rpc), Arc::clone(&pipeline))?,
            config.ingestion.poll_interval_seconds,
            config.ingestion.poll_signature_limit,
        )
        .run(),
    );

    let _scheduler_tasks = spawn_scheduler_tasks(SchedulerDeps {
        db_path: config.sqlite.path.clone(),
        dry_run: config.trade.dry_run,
        pending_timeout_minutes: config.trade.pending_position_timeout_minutes,
        heartbeat_seconds: config.system.heartbeat_seconds,
        bot_pubkey,
        rpc: Arc::clone(&rpc),
        notifier,
    });

    let app = router(WebState {
        ingest,
        breaker,
    });
    let listener = tokio::net::TcpListener::bind(&config.ingestion.webhook_bind_addr)
        .await
        .with_context(|| {
            format!(
                "failed binding webhook listener on {}",
                config.ingestion.webhook_bind_addr
            )
        })?;
    info!(addr = %config.ingestion.webhook_bind_addr, "webhook server listening");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(error = %error, "webhook server stopped");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed waiting for shutdown signal")?;
    info!("shutdown signal received");

    pipeline.close().await;
    let _ = worker_task.await;
    store
        .record_heartbeat("mirrorbot", "shutdown")
        .context("failed to write shutdown heartbeat")?;
    Ok(())
}

fn producer_deps(
    db_path: &str,
    config: &mirrorbot_config::AppConfig,
    rpc: Arc<dyn mirrorbot_execution::ChainRpc>,
    pipeline: Arc<PipelineHandle>,
) -> Result<ProducerDeps> {
    Ok(ProducerDeps {
        store: SqliteStore::open(Path::new(db_path))
            .context("failed opening sqlite store for producer")?,
        parser: SwapParser::new(
            config.wallet.upstream.clone(),
            config.trade.restrict_intermediate_tokens,
        ),
        rpc,
        pipeline,
        wallet: config.wallet.upstream.clone(),
    })
}

fn parse_config_arg() -> Option<PathBuf> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(inline) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(inline));
        }
    }
    None
}

fn resolve_migrations_dir(config_path: &Path, configured_migrations_dir: &str) -> PathBuf {
    let configured = PathBuf::from(configured_migrations_dir);
    if configured.is_absolute() || configured.exists() {
        return configured;
    }

    if let Some(config_parent) = config_path.parent() {
        let sibling_candidate = config_parent.join(&configured);
        if sibling_candidate.exists() {
            return sibling_candidate;
        }
        if let Some(project_root) = config_parent.parent() {
            let root_candidate = project_root.join(&configured);
            if root_candidate.exists() {
                return root_candidate;
            }
        }
    }

    configured
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    if json {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
