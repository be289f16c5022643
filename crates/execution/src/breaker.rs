use chrono::{DateTime, Duration, Utc};
use mirrorbot_config::BreakerConfig;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

const SAMPLE_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerSample {
    Copied { latency_ms: u64 },
    Failed,
    Rejected,
    NoPosition,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    kind: BreakerSample,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BreakerState {
    samples: VecDeque<Sample>,
    open: bool,
    opened_at: Option<DateTime<Utc>>,
    reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BreakerStatus {
    pub open: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub window_samples: usize,
}

/// Sliding-window outcome monitor. Opening is monotonic: once tripped, the
/// breaker stays open until `reset` or the timed auto-reset elapses.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(BreakerState::default()),
        })
    }

    pub fn record(&self, sample: BreakerSample, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.samples.push_back(Sample { kind: sample, at: now });
        while state.samples.len() > SAMPLE_CAPACITY {
            state.samples.pop_front();
        }
        Self::prune_window(&mut state, &self.config, now);

        if state.open {
            return;
        }
        if let Some(reason) = Self::trip_reason(&state, &self.config) {
            error!(reason = %reason, "circuit breaker opened");
            state.open = true;
            state.opened_at = Some(now);
            state.reason = Some(reason);
        }
    }

    /// Queried before every trade; a timed auto-reset is applied here so an
    /// idle breaker still closes on schedule.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if !state.open {
            return false;
        }
        if self.config.auto_reset_minutes > 0 {
            if let Some(opened_at) = state.opened_at {
                let elapsed = now - opened_at;
                if elapsed >= Duration::minutes(self.config.auto_reset_minutes as i64) {
                    info!("circuit breaker auto-reset after timed interval");
                    Self::reset_state(&mut state);
                    return false;
                }
            }
        }
        true
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        if state.open {
            info!("circuit breaker reset");
        }
        Self::reset_state(&mut state);
    }

    pub fn status(&self, now: DateTime<Utc>) -> BreakerStatus {
        let open = self.is_open(now);
        let state = self.state.lock().expect("breaker lock poisoned");
        BreakerStatus {
            open,
            opened_at: state.opened_at,
            reason: state.reason.clone(),
            window_samples: state.samples.len(),
        }
    }

    fn reset_state(state: &mut BreakerState) {
        state.open = false;
        state.opened_at = None;
        state.reason = None;
        state.samples.clear();
    }

    fn prune_window(state: &mut BreakerState, config: &BreakerConfig, now: DateTime<Utc>) {
        let cutoff = now - Duration::minutes(config.fail_window_minutes as i64);
        while state
            .samples
            .front()
            .map(|sample| sample.at < cutoff)
            .unwrap_or(false)
        {
            state.samples.pop_front();
        }
    }

    fn trip_reason(state: &BreakerState, config: &BreakerConfig) -> Option<String> {
        let total = state.samples.len();
        let failed = state
            .samples
            .iter()
            .filter(|sample| matches!(sample.kind, BreakerSample::Failed))
            .count();
        if total >= 3 {
            let fail_rate = failed as f64 / total as f64 * 100.0;
            if fail_rate > config.fail_rate_pct {
                return Some(format!(
                    "fail_rate {:.1}% over {} samples exceeds {:.1}%",
                    fail_rate, total, config.fail_rate_pct
                ));
            }
        }

        let no_position = state
            .samples
            .iter()
            .filter(|sample| matches!(sample.kind, BreakerSample::NoPosition))
            .count();
        if no_position >= config.no_position_spike as usize && config.no_position_spike > 0 {
            return Some(format!(
                "no_position spike: {} in window (threshold {})",
                no_position, config.no_position_spike
            ));
        }

        let mut copied_latencies: Vec<u64> = state
            .samples
            .iter()
            .filter_map(|sample| match sample.kind {
                BreakerSample::Copied { latency_ms } => Some(latency_ms),
                _ => None,
            })
            .collect();
        if copied_latencies.len() >= 5 {
            copied_latencies.sort_unstable();
            let index = ((copied_latencies.len() as f64) * 0.99).ceil() as usize;
            let p99 = copied_latencies[index.saturating_sub(1).min(copied_latencies.len() - 1)];
            if p99 > config.latency_p99_ms {
                return Some(format!(
                    "copied p99 latency {}ms exceeds {}ms",
                    p99, config.latency_p99_ms
                ));
            }
        }

        None
    }
}
