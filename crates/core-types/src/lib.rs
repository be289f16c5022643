use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Smallest upstream notional treated as a swap (0.00005 SOL).
pub const MIN_SWAP_LAMPORTS: u64 = 50_000;

/// Mints that are never selected as the canonical swap token: wrapped SOL,
/// the main stablecoins, and the staked-SOL derivatives.
pub const INTERMEDIATE_MINTS: &[&str] = &[
    SOL_MINT,
    "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v", // USDC
    "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB", // USDT
    "mSoLzYCxHdYgdzU16g5QSh3i5K3z3KZK7ytfqcJm7So",  // mSOL
    "7dHbWXmci3dT8UFYWYZweBLXgycu7Y3iL6trKn1Y7ARj", // stSOL
    "J1toso1uCk3RLmjorhTtrVwY9HJ7X8V9yYac6Y7kGCPn", // jitoSOL
    "bSo13r4TkiE4KumL71LsHTPpL2euBYLFx6h9HP3piy1",  // bSOL
];

pub fn is_intermediate_mint(mint: &str) -> bool {
    INTERMEDIATE_MINTS.contains(&mint)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTag {
    Webhook,
    WebhookFallback,
    Subscription,
    Poll,
}

impl SourceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::WebhookFallback => "webhook-fallback",
            Self::Subscription => "subscription",
            Self::Poll => "poll",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "webhook" => Some(Self::Webhook),
            "webhook-fallback" => Some(Self::WebhookFallback),
            "subscription" => Some(Self::Subscription),
            "poll" => Some(Self::Poll),
            _ => None,
        }
    }
}

/// Canonical description of one upstream swap, produced by the parser and
/// consumed by the decision stage. Raw token amounts stay integral end to
/// end; floats only ever appear in drift math.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapDescriptor {
    pub signature: String,
    pub side: TradeSide,
    pub mint: String,
    /// Lamports the upstream wallet paid (BUY) or received (SELL).
    pub upstream_sol_lamports: u64,
    pub upstream_token_raw: u128,
    pub token_decimals: u8,
    pub source: SourceTag,
    /// Set when token decimals had to be approximated from a transfer list.
    pub unsafe_parse: bool,
    pub observed_at: DateTime<Utc>,
}

impl SwapDescriptor {
    pub fn upstream_sol(&self) -> f64 {
        self.upstream_sol_lamports as f64 / LAMPORTS_PER_SOL as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Confirmed,
    Sent,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Sent => "sent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "confirmed" => Some(Self::Confirmed),
            "sent" => Some(Self::Sent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    Copied,
    Rejected,
    Failed,
    CircuitBreaker,
}

impl TradeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copied => "COPIED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "COPIED" => Some(Self::Copied),
            "REJECTED" => Some(Self::Rejected),
            "FAILED" => Some(Self::Failed),
            "CIRCUIT_BREAKER" => Some(Self::CircuitBreaker),
            _ => None,
        }
    }
}

/// Stable reject tags. These strings feed metrics, alerting, and the
/// breaker's NO_POSITION spike detector, so they must never change shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Paused,
    CircuitBreaker,
    UnsafeParse,
    MaxOpenPositions,
    BelowMinTrade,
    BudgetExhausted,
    Cooldown { remaining_seconds: u64 },
    FeeOverhead,
    InsufficientBalance,
    TokenAuthority,
    UnroutableToken,
    PriceImpactTooHigh,
    PriceDriftTooHigh,
    NoPosition,
    PositionNotConfirmed,
}

impl RejectReason {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Paused => "PAUSED",
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
            Self::UnsafeParse => "UNSAFE_PARSE",
            Self::MaxOpenPositions => "MAX_OPEN_POSITIONS",
            Self::BelowMinTrade => "BELOW_MIN_TRADE",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::Cooldown { .. } => "COOLDOWN",
            Self::FeeOverhead => "FEE_OVERHEAD",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::TokenAuthority => "TOKEN_AUTHORITY",
            Self::UnroutableToken => "UNROUTABLE_TOKEN",
            Self::PriceImpactTooHigh => "PRICE_IMPACT_TOO_HIGH",
            Self::PriceDriftTooHigh => "PRICE_DRIFT_TOO_HIGH",
            Self::NoPosition => "NO_POSITION",
            Self::PositionNotConfirmed => "POSITION_NOT_CONFIRMED",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Self::Cooldown { remaining_seconds } => {
                format!("COOLDOWN remaining_seconds={remaining_seconds}")
            }
            other => other.tag().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intermediate_set_contains_wrapped_sol() {
        assert!(is_intermediate_mint(SOL_MINT));
        assert!(!is_intermediate_mint(
            "SomeRandomMint1111111111111111111111111111"
        ));
    }

    #[test]
    fn cooldown_detail_carries_remaining_seconds() {
        let reason = RejectReason::Cooldown {
            remaining_seconds: 42,
        };
        assert_eq!(reason.tag(), "COOLDOWN");
        assert_eq!(reason.detail(), "COOLDOWN remaining_seconds=42");
    }

    #[test]
    fn position_status_round_trips_through_text() {
        assert_eq!(
            PositionStatus::parse(PositionStatus::Sent.as_str()),
            Some(PositionStatus::Sent)
        );
        assert_eq!(PositionStatus::parse("bogus"), None);
    }
}
