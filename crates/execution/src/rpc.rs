use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const RPC_MAX_ATTEMPTS: u32 = 3;
const RPC_BACKOFF_STEP_MS: u64 = 300;

#[derive(Debug, Clone, Copy, Default)]
pub struct MintAuthorities {
    pub has_mint_authority: bool,
    pub has_freeze_authority: bool,
}

#[derive(Debug, Clone)]
pub struct TokenBalanceChange {
    pub mint: String,
    pub decimals: u8,
    pub pre_raw: u128,
    pub post_raw: u128,
}

impl TokenBalanceChange {
    pub fn delta(&self) -> i128 {
        self.post_raw as i128 - self.pre_raw as i128
    }
}

/// Pre/post view of one transaction at the monitored wallet, the input to
/// the parser's balance-delta path and to the execution comparison.
#[derive(Debug, Clone)]
pub struct TxBalances {
    pub wallet_pre_lamports: u64,
    pub wallet_post_lamports: u64,
    pub fee_lamports: u64,
    pub compute_units: Option<u64>,
    pub token_changes: Vec<TokenBalanceChange>,
}

impl TxBalances {
    pub fn wallet_sol_delta(&self) -> i128 {
        self.wallet_post_lamports as i128 - self.wallet_pre_lamports as i128
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Confirmed,
    Failed,
    Unknown,
}

/// Chain JSON-RPC collaborator contract. Kept narrow so scenario tests can
/// stand in an in-memory fake.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_balance_lamports(&self, pubkey: &str) -> Result<u64>;
    async fn get_token_balance_raw(&self, owner: &str, mint: &str) -> Result<Option<u128>>;
    async fn has_token_account(&self, owner: &str, mint: &str) -> Result<bool>;
    async fn get_mint_authorities(&self, mint: &str) -> Result<MintAuthorities>;
    async fn get_transaction_balances(
        &self,
        signature: &str,
        wallet: &str,
    ) -> Result<Option<TxBalances>>;
    async fn get_signatures_for_address(&self, wallet: &str, limit: u32) -> Result<Vec<String>>;
    async fn simulate_transaction_units(&self, tx_base64: &str) -> Result<Option<u64>>;
    async fn send_transaction(&self, tx_base64: &str) -> Result<String>;
    async fn get_block_height(&self) -> Result<u64>;
    async fn signature_status(&self, signature: &str) -> Result<SignatureStatus>;
}

pub struct HttpChainRpc {
    http: Client,
    url: String,
}

impl HttpChainRpc {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(500)))
            .build()
            .context("failed building rpc http client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 1..=RPC_MAX_ATTEMPTS {
            match self.call_once(&payload).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    debug!(method, attempt, error = %error, "rpc call failed");
                    last_error = Some(error);
                    if attempt < RPC_MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            RPC_BACKOFF_STEP_MS * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("rpc call failed without error")))
            .with_context(|| format!("rpc {method} exhausted {RPC_MAX_ATTEMPTS} attempts"))
    }

    async fn call_once(&self, payload: &Value) -> Result<Value> {
        let response = self
            .http
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .context("failed posting json-rpc request")?
            .error_for_status()
            .context("non-success json-rpc response")?
            .json::<Value>()
            .await
            .context("failed parsing json-rpc response body")?;
        if let Some(error) = response.get("error") {
            return Err(anyhow!("json-rpc error: {error}"));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn parse_raw_token_amount(info: &Value) -> Option<(u128, u8)> {
    let token_amount = info.pointer("/tokenAmount")?;
    let raw = token_amount.get("amount")?.as_str()?.parse::<u128>().ok()?;
    let decimals = token_amount.get("decimals")?.as_u64()? as u8;
    Some((raw, decimals))
}

fn token_balance_entries(meta: &Value, key: &str, wallet: &str) -> Vec<(String, u128, u8)> {
    meta.get(key)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| entry.get("owner").and_then(Value::as_str) == Some(wallet))
                .filter_map(|entry| {
                    let mint = entry.get("mint")?.as_str()?.to_string();
                    let ui = entry.get("uiTokenAmount")?;
                    let raw = ui.get("amount")?.as_str()?.parse::<u128>().ok()?;
                    let decimals = ui.get("decimals")?.as_u64()? as u8;
                    Some((mint, raw, decimals))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn get_balance_lamports(&self, pubkey: &str) -> Result<u64> {
        let result = self.call("getBalance", json!([pubkey])).await?;
        result
            .pointer("/value")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("missing getBalance.value for {pubkey}"))
    }

    async fn get_token_balance_raw(&self, owner: &str, mint: &str) -> Result<Option<u128>> {
        let result = self
            .call(
                "getTokenAccountsByOwner",
                json!([owner, {"mint": mint}, {"encoding": "jsonParsed"}]),
            )
            .await?;
        let accounts = result
            .pointer("/value")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if accounts.is_empty() {
            return Ok(None);
        }
        let mut total: u128 = 0;
        for account in &accounts {
            if let Some(info) = account.pointer("/account/data/parsed/info") {
                if let Some((raw, _)) = parse_raw_token_amount(info) {
                    total = total.saturating_add(raw);
                }
            }
        }
        Ok(Some(total))
    }

    async fn has_token_account(&self, owner: &str, mint: &str) -> Result<bool> {
        Ok(self.get_token_balance_raw(owner, mint).await?.is_some())
    }

    async fn get_mint_authorities(&self, mint: &str) -> Result<MintAuthorities> {
        let result = self
            .call("getAccountInfo", json!([mint, {"encoding": "jsonParsed"}]))
            .await?;
        let info = result
            .pointer("/value/data/parsed/info")
            .ok_or_else(|| anyhow!("missing parsed mint info for {mint}"))?;
        let has_authority = |key: &str| {
            info.get(key)
                .map(|value| !value.is_null())
                .unwrap_or(false)
        };
        Ok(MintAuthorities {
            has_mint_authority: has_authority("mintAuthority"),
            has_freeze_authority: has_authority("freezeAuthority"),
        })
    }

    async fn get_transaction_balances(
        &self,
        signature: &str,
        wallet: &str,
    ) -> Result<Option<TxBalances>> {
        let result = self
            .call(
                "getTransaction",
                json!([signature, {
                    "encoding": "jsonParsed",
                    "commitment": "confirmed",
                    "maxSupportedTransactionVersion": 0
                }]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let meta = match result.get("meta") {
            Some(meta) if !meta.is_null() => meta,
            _ => return Ok(None),
        };

        let account_keys = result
            .pointer("/transaction/message/accountKeys")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let wallet_index = account_keys.iter().position(|item| {
            item.as_str() == Some(wallet)
                || item.get("pubkey").and_then(Value::as_str) == Some(wallet)
        });
        let Some(wallet_index) = wallet_index else {
            return Ok(None);
        };

        let balance_at = |key: &str| {
            meta.get(key)
                .and_then(Value::as_array)
                .and_then(|balances| balances.get(wallet_index))
                .and_then(Value::as_u64)
        };
        let (Some(pre), Some(post)) = (balance_at("preBalances"), balance_at("postBalances"))
        else {
            return Ok(None);
        };

        let pre_tokens = token_balance_entries(meta, "preTokenBalances", wallet);
        let post_tokens = token_balance_entries(meta, "postTokenBalances", wallet);
        let mut changes: Vec<TokenBalanceChange> = Vec::new();
        for (mint, pre_raw, decimals) in &pre_tokens {
            changes.push(TokenBalanceChange {
                mint: mint.clone(),
                decimals: *decimals,
                pre_raw: *pre_raw,
                post_raw: 0,
            });
        }
        for (mint, post_raw, decimals) in &post_tokens {
            if let Some(change) = changes.iter_mut().find(|change| &change.mint == mint) {
                change.post_raw = *post_raw;
                change.decimals = *decimals;
            } else {
                changes.push(TokenBalanceChange {
                    mint: mint.clone(),
                    decimals: *decimals,
                    pre_raw: 0,
                    post_raw: *post_raw,
                });
            }
        }

        Ok(Some(TxBalances {
            wallet_pre_lamports: pre,
            wallet_post_lamports: post,
            fee_lamports: meta.get("fee").and_then(Value::as_u64).unwrap_or(0),
            compute_units: meta.get("computeUnitsConsumed").and_then(Value::as_u64),
            token_changes: changes,
        }))
    }

    async fn get_signatures_for_address(&self, wallet: &str, limit: u32) -> Result<Vec<String>> {
        let result = self
            .call(
                "getSignaturesForAddress",
                json!([wallet, {"limit": limit.max(1), "commitment": "confirmed"}]),
            )
            .await?;
        let entries = result
            .as_array()
            .ok_or_else(|| anyhow!("invalid getSignaturesForAddress result"))?;
        Ok(entries
            .iter()
            .filter_map(|entry| entry.get("signature").and_then(Value::as_str))
            .map(ToString::to_string)
            .collect())
    }

    async fn simulate_transaction_units(&self, tx_base64: &str) -> Result<Option<u64>> {
        let result = self
            .call(
                "simulateTransaction",
                json!([tx_base64, {
                    "encoding": "base64",
                    "sigVerify": false,
                    "replaceRecentBlockhash": true
                }]),
            )
            .await?;
        if result
            .pointer("/value/err")
            .map(|err| !err.is_null())
            .unwrap_or(false)
        {
            return Ok(None);
        }
        Ok(result.pointer("/value/unitsConsumed").and_then(Value::as_u64))
    }

    async fn send_transaction(&self, tx_base64: &str) -> Result<String> {
        let result = self
            .call(
                "sendTransaction",
                json!([tx_base64, {
                    "encoding": "base64",
                    "skipPreflight": true,
                    "maxRetries": 3
                }]),
            )
            .await?;
        result
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("sendTransaction returned no signature"))
    }

    async fn get_block_height(&self) -> Result<u64> {
        let result = self.call("getBlockHeight", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| anyhow!("invalid getBlockHeight result"))
    }

    async fn signature_status(&self, signature: &str) -> Result<SignatureStatus> {
        let result = self
            .call(
                "getSignatureStatuses",
                json!([[signature], {"searchTransactionHistory": false}]),
            )
            .await?;
        let status = result.pointer("/value/0");
        let Some(status) = status.filter(|value| !value.is_null()) else {
            return Ok(SignatureStatus::Unknown);
        };
        if status.get("err").map(|err| !err.is_null()).unwrap_or(false) {
            return Ok(SignatureStatus::Failed);
        }
        let commitment = status
            .get("confirmationStatus")
            .and_then(Value::as_str)
            .unwrap_or("");
        if commitment == "confirmed" || commitment == "finalized" {
            Ok(SignatureStatus::Confirmed)
        } else {
            Ok(SignatureStatus::Unknown)
        }
    }
}
