use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mirrorbot_core_types::SOL_MINT;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::aggregator::{AggregatorApi, Quote, SwapTransaction};
use crate::rpc::{ChainRpc, MintAuthorities, SignatureStatus, TxBalances};

/// In-memory aggregator: quotes are linear rates per mint, configured by
/// the test. `out = amount * num / den`.
#[derive(Default)]
pub(crate) struct FakeAggregator {
    pub buy_rates: Mutex<HashMap<String, (u128, u128)>>,
    pub sell_rates: Mutex<HashMap<String, (u128, u128)>>,
    pub impact_bps: Mutex<f64>,
    pub unroutable: Mutex<HashSet<String>>,
    pub quote_calls: AtomicU64,
    pub quote_delay_ms: AtomicU64,
}

impl FakeAggregator {
    pub fn with_buy_rate(self, mint: &str, num: u128, den: u128) -> Self {
        self.buy_rates
            .lock()
            .expect("buy rates lock")
            .insert(mint.to_string(), (num, den));
        self
    }

    pub fn with_sell_rate(self, mint: &str, num: u128, den: u128) -> Self {
        self.sell_rates
            .lock()
            .expect("sell rates lock")
            .insert(mint.to_string(), (num, den));
        self
    }

    /// Makes in-flight quotes take a while, so tests can overlap a racing
    /// submission with a trade that is still inside the decision stage.
    pub fn with_quote_delay_ms(self, delay_ms: u64) -> Self {
        self.quote_delay_ms.store(delay_ms, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl AggregatorApi for FakeAggregator {
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount_raw: u128,
        _slippage_bps: u32,
    ) -> Result<Option<Quote>> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.quote_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        let (mint, rates) = if input_mint == SOL_MINT {
            (output_mint, &self.buy_rates)
        } else {
            (input_mint, &self.sell_rates)
        };
        if self
            .unroutable
            .lock()
            .expect("unroutable lock")
            .contains(mint)
        {
            return Ok(None);
        }
        let Some((num, den)) = rates.lock().expect("rates lock").get(mint).copied() else {
            return Ok(None);
        };
        let out_amount = amount_raw.saturating_mul(num) / den.max(1);
        Ok(Some(Quote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount: amount_raw,
            out_amount,
            price_impact_bps: *self.impact_bps.lock().expect("impact lock"),
            raw: json!({}),
        }))
    }

    async fn swap(
        &self,
        _quote: &Quote,
        _user_pubkey: &str,
        _priority_fee_lamports: u64,
    ) -> Result<SwapTransaction> {
        Err(anyhow!("swap building is not modelled by FakeAggregator"))
    }
}

/// In-memory chain view. Everything the risk engine can ask for has a
/// benign default: zero balances, no token accounts, no authorities.
#[derive(Default)]
pub(crate) struct FakeRpc {
    pub balances: Mutex<HashMap<String, u64>>,
    pub token_balances: Mutex<HashMap<(String, String), u128>>,
    pub authorities: Mutex<HashMap<String, MintAuthorities>>,
}

impl FakeRpc {
    pub fn with_token_balance(self, owner: &str, mint: &str, raw: u128) -> Self {
        self.token_balances
            .lock()
            .expect("token balances lock")
            .insert((owner.to_string(), mint.to_string()), raw);
        self
    }
}

#[async_trait]
impl ChainRpc for FakeRpc {
    async fn get_balance_lamports(&self, pubkey: &str) -> Result<u64> {
        Ok(self
            .balances
            .lock()
            .expect("balances lock")
            .get(pubkey)
            .copied()
            .unwrap_or(0))
    }

    async fn get_token_balance_raw(&self, owner: &str, mint: &str) -> Result<Option<u128>> {
        Ok(self
            .token_balances
            .lock()
            .expect("token balances lock")
            .get(&(owner.to_string(), mint.to_string()))
            .copied())
    }

    async fn has_token_account(&self, owner: &str, mint: &str) -> Result<bool> {
        Ok(self.get_token_balance_raw(owner, mint).await?.is_some())
    }

    async fn get_mint_authorities(&self, mint: &str) -> Result<MintAuthorities> {
        Ok(self
            .authorities
            .lock()
            .expect("authorities lock")
            .get(mint)
            .copied()
            .unwrap_or_default())
    }

    async fn get_transaction_balances(
        &self,
        _signature: &str,
        _wallet: &str,
    ) -> Result<Option<TxBalances>> {
        Ok(None)
    }

    async fn get_signatures_for_address(&self, _wallet: &str, _limit: u32) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn simulate_transaction_units(&self, _tx_base64: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    async fn send_transaction(&self, _tx_base64: &str) -> Result<String> {
        Err(anyhow!("broadcast is not modelled by FakeRpc"))
    }

    async fn get_block_height(&self) -> Result<u64> {
        Ok(0)
    }

    async fn signature_status(&self, _signature: &str) -> Result<SignatureStatus> {
        Ok(SignatureStatus::Unknown)
    }
}
