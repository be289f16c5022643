use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// One routing quote. `raw` keeps the aggregator's full response so the
/// swap request can echo it back untouched.
#[derive(Debug, Clone)]
pub struct Quote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u128,
    pub out_amount: u128,
    pub price_impact_bps: f64,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct SwapTransaction {
    pub tx_base64: String,
    pub last_valid_block_height: u64,
}

/// Aggregator collaborator contract: quote a route, then ask for a
/// prebuilt transaction from that exact quote. The quote is never
/// re-fetched between the two calls.
#[async_trait]
pub trait AggregatorApi: Send + Sync {
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount_raw: u128,
        slippage_bps: u32,
    ) -> Result<Option<Quote>>;

    async fn swap(
        &self,
        quote: &Quote,
        user_pubkey: &str,
        priority_fee_lamports: u64,
    ) -> Result<SwapTransaction>;
}

pub struct HttpAggregator {
    http: Client,
    base_url: String,
}

impl HttpAggregator {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(500)))
            .build()
            .context("failed building aggregator http client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }
}

fn parse_u128_field(value: &Value, key: &str) -> Result<u128> {
    let field = value
        .get(key)
        .ok_or_else(|| anyhow!("quote response missing {key}"))?;
    if let Some(raw) = field.as_str() {
        return raw
            .parse::<u128>()
            .with_context(|| format!("invalid {key} in quote response: {raw}"));
    }
    field
        .as_u64()
        .map(u128::from)
        .ok_or_else(|| anyhow!("invalid {key} in quote response"))
}

#[async_trait]
impl AggregatorApi for HttpAggregator {
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount_raw: u128,
        slippage_bps: u32,
    ) -> Result<Option<Quote>> {
        let url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.base_url, input_mint, output_mint, amount_raw, slippage_bps
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed requesting aggregator quote")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .error_for_status()
            .context("non-success aggregator quote response")?
            .json::<Value>()
            .await
            .context("failed parsing aggregator quote body")?;
        if body.is_null() || body.get("error").is_some() {
            debug!(input_mint, output_mint, "aggregator returned no route");
            return Ok(None);
        }

        // priceImpactPct arrives as a stringified fraction ("0.0123").
        let price_impact_bps = body
            .get("priceImpactPct")
            .and_then(|value| {
                value
                    .as_str()
                    .and_then(|raw| raw.parse::<f64>().ok())
                    .or_else(|| value.as_f64())
            })
            .map(|fraction| fraction * 10_000.0)
            .unwrap_or(0.0);

        Ok(Some(Quote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount: parse_u128_field(&body, "inAmount")?,
            out_amount: parse_u128_field(&body, "outAmount")?,
            price_impact_bps,
            raw: body,
        }))
    }

    async fn swap(
        &self,
        quote: &Quote,
        user_pubkey: &str,
        priority_fee_lamports: u64,
    ) -> Result<SwapTransaction> {
        let url = format!("{}/swap", self.base_url);
        let payload = json!({
            "quoteResponse": quote.raw,
            "userPublicKey": user_pubkey,
            "wrapAndUnwrapSol": true,
            "prioritizationFeeLamports": priority_fee_lamports,
        });
        let body = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("failed requesting aggregator swap transaction")?
            .error_for_status()
            .context("non-success aggregator swap response")?
            .json::<Value>()
            .await
            .context("failed parsing aggregator swap body")?;

        let tx_base64 = body
            .get("swapTransaction")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("swap response missing swapTransaction"))?
            .to_string();
        let last_valid_block_height = body
            .get("lastValidBlockHeight")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("swap response missing lastValidBlockHeight"))?;

        Ok(SwapTransaction {
            tx_base64,
            last_valid_block_height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u128_fields_accept_string_and_number() {
        let body = json!({"inAmount": "500000000", "outAmount": 1000000u64});
        assert_eq!(parse_u128_field(&body, "inAmount").unwrap(), 500_000_000);
        assert_eq!(parse_u128_field(&body, "outAmount").unwrap(), 1_000_000);
        assert!(parse_u128_field(&body, "missing").is_err());
    }
}
