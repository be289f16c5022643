pub mod aggregator;
pub mod breaker;
pub mod compare;
pub mod fees;
pub mod notify;
pub mod pending;
pub mod pipeline;
pub mod queue;
pub mod risk;
pub mod rpc;
pub mod simulator;
pub mod submitter;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{AggregatorApi, HttpAggregator, Quote, SwapTransaction};
pub use breaker::{BreakerSample, BreakerStatus, CircuitBreaker};
pub use notify::{LogNotifier, Notifier};
pub use pending::PendingBuys;
pub use pipeline::{build_pipeline, Executor, PipelineDeps, PipelineHandle, PipelineWorker};
pub use risk::{RiskDecision, RiskEngine, TradePlan};
pub use rpc::{ChainRpc, HttpChainRpc, MintAuthorities, TokenBalanceChange, TxBalances};
pub use simulator::DryRunExecutor;
pub use submitter::{keypair_from_base58, keypair_pubkey, LiveExecutor};

/// A fill as reported by either executor. `signature` is synthetic in
/// simulation and the broadcast signature in live mode.
#[derive(Debug, Clone)]
pub struct FilledTrade {
    pub signature: String,
    pub out_raw: u128,
    pub fee_lamports: u64,
    pub last_valid_block_height: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Filled(FilledTrade),
    Failed { reason: String },
}
