use chrono::Utc;
use mirrorbot_core_types::{
    is_intermediate_mint, SourceTag, SwapDescriptor, TradeSide, MIN_SWAP_LAMPORTS, SOL_MINT,
};
use mirrorbot_execution::rpc::TxBalances;
use tracing::debug;

use crate::raw::{RawTokenAmount, RawTransaction};

/// Decimals assumed when the payload carries only UI amounts.
const APPROX_DECIMALS: u8 = 6;

/// Converts raw transaction records into canonical swap descriptors. Pure:
/// the one optional RPC lookup (pre/post balances) happens in the caller,
/// which hands the fetched view to `parse_balances`.
#[derive(Debug, Clone)]
pub struct SwapParser {
    wallet: String,
    restrict_intermediate: bool,
}

impl SwapParser {
    pub fn new(wallet: impl Into<String>, restrict_intermediate: bool) -> Self {
        Self {
            wallet: wallet.into(),
            restrict_intermediate,
        }
    }

    fn mint_allowed(&self, mint: &str) -> bool {
        if mint == SOL_MINT {
            return false;
        }
        !(self.restrict_intermediate && is_intermediate_mint(mint))
    }

    /// Filter-then-max: entries owned by the wallet, non-intermediate,
    /// largest raw amount wins, first seen on ties.
    fn best_token_entry<'a>(&self, entries: &'a [RawTokenAmount]) -> Option<(&'a RawTokenAmount, u128)> {
        let mut best: Option<(&RawTokenAmount, u128)> = None;
        for entry in entries {
            if entry.user_account != self.wallet || !self.mint_allowed(&entry.mint) {
                continue;
            }
            let Some(raw) = entry.raw_amount() else {
                continue;
            };
            match best {
                Some((_, best_raw)) if raw <= best_raw => {}
                _ => best = Some((entry, raw)),
            }
        }
        best
    }

    /// Path 1: the provider's structured swap event.
    pub fn parse_swap_event(&self, raw: &RawTransaction, source: SourceTag) -> Option<SwapDescriptor> {
        let swap = raw.events.swap.as_ref()?;

        // Native in + token out is a BUY from the wallet's perspective;
        // the mirror is a SELL.
        if let Some(native_input) = swap
            .native_input
            .as_ref()
            .filter(|input| input.account == self.wallet)
        {
            let lamports = native_input.lamports()?;
            if lamports < MIN_SWAP_LAMPORTS {
                return None;
            }
            let (entry, token_raw) = self.best_token_entry(&swap.token_outputs)?;
            return Some(SwapDescriptor {
                signature: raw.signature.clone(),
                side: TradeSide::Buy,
                mint: entry.mint.clone(),
                upstream_sol_lamports: lamports,
                upstream_token_raw: token_raw,
                token_decimals: entry.raw_token_amount.decimals,
                source,
                unsafe_parse: false,
                observed_at: Utc::now(),
            });
        }

        if let Some(native_output) = swap
            .native_output
            .as_ref()
            .filter(|output| output.account == self.wallet)
        {
            let lamports = native_output.lamports()?;
            if lamports < MIN_SWAP_LAMPORTS {
                return None;
            }
            let (entry, token_raw) = self.best_token_entry(&swap.token_inputs)?;
            return Some(SwapDescriptor {
                signature: raw.signature.clone(),
                side: TradeSide::Sell,
                mint: entry.mint.clone(),
                upstream_sol_lamports: lamports,
                upstream_token_raw: token_raw,
                token_decimals: entry.raw_token_amount.decimals,
                source,
                unsafe_parse: false,
                observed_at: Utc::now(),
            });
        }

        None
    }

    /// Path 2: pre/post balances fetched from the chain. The wallet's net
    /// SOL delta decides the direction; the token delta sign must agree.
    pub fn parse_balances(
        &self,
        signature: &str,
        balances: &TxBalances,
        source: SourceTag,
    ) -> Option<SwapDescriptor> {
        let sol_delta = balances.wallet_sol_delta();
        if sol_delta.unsigned_abs() < MIN_SWAP_LAMPORTS as u128 {
            return None;
        }
        let side = if sol_delta > 0 {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        };

        let mut best: Option<(&str, u8, i128)> = None;
        for change in &balances.token_changes {
            if !self.mint_allowed(&change.mint) {
                continue;
            }
            let delta = change.delta();
            if delta == 0 {
                continue;
            }
            match best {
                Some((_, _, best_delta)) if delta.unsigned_abs() <= best_delta.unsigned_abs() => {}
                _ => best = Some((&change.mint, change.decimals, delta)),
            }
        }
        let (mint, decimals, token_delta) = best?;

        let signs_agree = match side {
            TradeSide::Buy => token_delta > 0,
            TradeSide::Sell => token_delta < 0,
        };
        if !signs_agree {
            debug!(
                signature,
                sol_delta,
                token_delta,
                "balance deltas disagree on direction, not a swap"
            );
            return None;
        }

        Some(SwapDescriptor {
            signature: signature.to_string(),
            side,
            mint: mint.to_string(),
            upstream_sol_lamports: sol_delta.unsigned_abs().min(u64::MAX as u128) as u64,
            upstream_token_raw: token_delta.unsigned_abs(),
            token_decimals: decimals,
            source,
            unsafe_parse: false,
            observed_at: Utc::now(),
        })
    }

    /// Path 3, weakest: reconstruct from the flat transfer list. Decimals
    /// are approximated, so the descriptor is flagged unsafe.
    pub fn parse_transfer_list(
        &self,
        raw: &RawTransaction,
        source: SourceTag,
    ) -> Option<SwapDescriptor> {
        let mut net_lamports: i128 = 0;
        for transfer in &raw.native_transfers {
            if transfer.to_user_account == self.wallet {
                net_lamports += transfer.amount as i128;
            }
            if transfer.from_user_account == self.wallet {
                net_lamports -= transfer.amount as i128;
            }
        }
        if net_lamports.unsigned_abs() < MIN_SWAP_LAMPORTS as u128 {
            return None;
        }
        let side = if net_lamports > 0 {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        };

        let mut best: Option<(&str, f64, bool)> = None;
        for transfer in &raw.token_transfers {
            let received = transfer.to_user_account == self.wallet;
            let sent = transfer.from_user_account == self.wallet;
            if !received && !sent {
                continue;
            }
            if !self.mint_allowed(&transfer.mint) || transfer.token_amount <= 0.0 {
                continue;
            }
            match best {
                Some((_, best_amount, _)) if transfer.token_amount <= best_amount => {}
                _ => best = Some((&transfer.mint, transfer.token_amount, received)),
            }
        }
        let (mint, ui_amount, received) = best?;

        // Cross-validate the token direction against the SOL delta sign.
        let signs_agree = match side {
            TradeSide::Buy => received,
            TradeSide::Sell => !received,
        };
        if !signs_agree {
            return None;
        }

        let token_raw = (ui_amount * 10f64.powi(APPROX_DECIMALS as i32)).round();
        if !token_raw.is_finite() || token_raw <= 0.0 {
            return None;
        }

        Some(SwapDescriptor {
            signature: raw.signature.clone(),
            side,
            mint: mint.to_string(),
            upstream_sol_lamports: net_lamports.unsigned_abs().min(u64::MAX as u128) as u64,
            upstream_token_raw: token_raw as u128,
            token_decimals: APPROX_DECIMALS,
            source,
            unsafe_parse: true,
            observed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::{
        RawEvents, RawNativeAmount, RawNativeTransfer, RawSwapEvent, RawTokenAmount,
        RawTokenAmountDetail, RawTokenTransfer,
    };
    use mirrorbot_execution::rpc::TokenBalanceChange;

    const WALLET: &str = "UpstreamWa11et111111111111111111111111111111";
    const MINT_A: &str = "MintA1111111111111111111111111111111111111";
    const MINT_B: &str = "MintB1111111111111111111111111111111111111";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn parser() -> SwapParser {
        SwapParser::new(WALLET, true)
    }

    fn token_amount(mint: &str, raw: &str, decimals: u8) -> RawTokenAmount {
        RawTokenAmount {
            user_account: WALLET.to_string(),
            mint: mint.to_string(),
            raw_token_amount: RawTokenAmountDetail {
                token_amount: raw.to_string(),
                decimals,
            },
        }
    }

    fn buy_event_tx(signature: &str, lamports: &str, outputs: Vec<RawTokenAmount>) -> RawTransaction {
        RawTransaction {
            signature: signature.to_string(),
            fee_payer: WALLET.to_string(),
            events: RawEvents {
                swap: Some(RawSwapEvent {
                    native_input: Some(RawNativeAmount {
                        account: WALLET.to_string(),
                        amount: lamports.to_string(),
                    }),
                    native_output: None,
                    token_inputs: Vec::new(),
                    token_outputs: outputs,
                }),
            },
            token_transfers: Vec::new(),
            native_transfers: Vec::new(),
            description: String::new(),
        }
    }

    #[test]
    fn structured_event_buy_selects_largest_non_intermediate_token() {
        let tx = buy_event_tx(
            "sig-buy",
            "500000000",
            vec![
                token_amount(USDC, "999999999", 6),
                token_amount(MINT_A, "1000000", 6),
                token_amount(MINT_B, "2000000", 6),
            ],
        );
        let swap = parser()
            .parse_swap_event(&tx, SourceTag::Webhook)
            .expect("parsed");
        assert_eq!(swap.side, TradeSide::Buy);
        assert_eq!(swap.mint, MINT_B, "intermediate filtered, then max raw delta");
        assert_eq!(swap.upstream_sol_lamports, 500_000_000);
        assert_eq!(swap.upstream_token_raw, 2_000_000);
        assert!(!swap.unsafe_parse);
    }

    #[test]
    fn structured_event_rejects_below_min_notional() {
        let below = buy_event_tx("sig-small", "49999", vec![token_amount(MINT_A, "1000", 6)]);
        assert!(parser().parse_swap_event(&below, SourceTag::Webhook).is_none());

        let at_floor = buy_event_tx("sig-floor", "50000", vec![token_amount(MINT_A, "1000", 6)]);
        assert!(parser()
            .parse_swap_event(&at_floor, SourceTag::Webhook)
            .is_some());
    }

    #[test]
    fn structured_event_sell_reads_native_output() {
        let tx = RawTransaction {
            signature: "sig-sell".to_string(),
            fee_payer: WALLET.to_string(),
            events: RawEvents {
                swap: Some(RawSwapEvent {
                    native_input: None,
                    native_output: Some(RawNativeAmount {
                        account: WALLET.to_string(),
                        amount: "250000000".to_string(),
                    }),
                    token_inputs: vec![token_amount(MINT_A, "1000000", 6)],
                    token_outputs: Vec::new(),
                }),
            },
            token_transfers: Vec::new(),
            native_transfers: Vec::new(),
            description: String::new(),
        };
        let swap = parser()
            .parse_swap_event(&tx, SourceTag::Webhook)
            .expect("parsed");
        assert_eq!(swap.side, TradeSide::Sell);
        assert_eq!(swap.mint, MINT_A);
    }

    #[test]
    fn structured_event_ignores_entries_for_other_accounts() {
        let mut foreign = token_amount(MINT_A, "5000000", 6);
        foreign.user_account = "SomeoneE1se111111111111111111111111111111111".to_string();
        let tx = buy_event_tx("sig-foreign", "500000000", vec![foreign]);
        assert!(parser().parse_swap_event(&tx, SourceTag::Webhook).is_none());
    }

    fn balances(sol_pre: u64, sol_post: u64, changes: Vec<TokenBalanceChange>) -> TxBalances {
        TxBalances {
            wallet_pre_lamports: sol_pre,
            wallet_post_lamports: sol_post,
            fee_lamports: 5_000,
            compute_units: None,
            token_changes: changes,
        }
    }

    #[test]
    fn balance_deltas_buy_picks_largest_delta_and_validates_sign() {
        let view = balances(
            10_000_000_000,
            9_500_000_000,
            vec![
                TokenBalanceChange {
                    mint: MINT_A.to_string(),
                    decimals: 6,
                    pre_raw: 0,
                    post_raw: 1_000_000,
                },
                TokenBalanceChange {
                    mint: MINT_B.to_string(),
                    decimals: 9,
                    pre_raw: 0,
                    post_raw: 5_000_000,
                },
            ],
        );
        let swap = parser()
            .parse_balances("sig-bal", &view, SourceTag::Subscription)
            .expect("parsed");
        assert_eq!(swap.side, TradeSide::Buy);
        assert_eq!(swap.mint, MINT_B);
        assert_eq!(swap.upstream_sol_lamports, 500_000_000);
        assert_eq!(swap.token_decimals, 9);
    }

    #[test]
    fn balance_deltas_reject_disagreeing_signs() {
        // SOL decreased (buy) but the wallet's token balance also
        // decreased: not a swap we can trust.
        let view = balances(
            10_000_000_000,
            9_500_000_000,
            vec![TokenBalanceChange {
                mint: MINT_A.to_string(),
                decimals: 6,
                pre_raw: 1_000_000,
                post_raw: 0,
            }],
        );
        assert!(parser()
            .parse_balances("sig-bad", &view, SourceTag::Subscription)
            .is_none());
    }

    #[test]
    fn balance_deltas_respect_min_notional() {
        let view = balances(1_000_000_000, 1_000_000_000 - 49_999, vec![]);
        assert!(parser()
            .parse_balances("sig-dust", &view, SourceTag::Poll)
            .is_none());
    }

    #[test]
    fn transfer_list_reconstruction_is_flagged_unsafe() {
        let tx = RawTransaction {
            signature: "sig-transfers".to_string(),
            fee_payer: WALLET.to_string(),
            events: RawEvents::default(),
            token_transfers: vec![RawTokenTransfer {
                from_user_account: "pool".to_string(),
                to_user_account: WALLET.to_string(),
                mint: MINT_A.to_string(),
                token_amount: 1.5,
            }],
            native_transfers: vec![RawNativeTransfer {
                from_user_account: WALLET.to_string(),
                to_user_account: "pool".to_string(),
                amount: 500_000_000,
            }],
            description: String::new(),
        };
        let swap = parser()
            .parse_transfer_list(&tx, SourceTag::WebhookFallback)
            .expect("parsed");
        assert_eq!(swap.side, TradeSide::Buy);
        assert!(swap.unsafe_parse);
        assert_eq!(swap.token_decimals, 6);
        assert_eq!(swap.upstream_token_raw, 1_500_000, "ui amount scaled by 10^6");
    }

    #[test]
    fn transfer_list_rejects_direction_mismatch() {
        // Wallet paid SOL but also sent the token away.
        let tx = RawTransaction {
            signature: "sig-mismatch".to_string(),
            fee_payer: WALLET.to_string(),
            events: RawEvents::default(),
            token_transfers: vec![RawTokenTransfer {
                from_user_account: WALLET.to_string(),
                to_user_account: "pool".to_string(),
                mint: MINT_A.to_string(),
                token_amount: 1.5,
            }],
            native_transfers: vec![RawNativeTransfer {
                from_user_account: WALLET.to_string(),
                to_user_account: "pool".to_string(),
                amount: 500_000_000,
            }],
            description: String::new(),
        };
        assert!(parser()
            .parse_transfer_list(&tx, SourceTag::WebhookFallback)
            .is_none());
    }
}
