use serde::Deserialize;

/// Webhook payload shape: one enhanced transaction per element, with the
/// structured swap event when the provider recognised one.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub signature: String,
    #[serde(default)]
    pub fee_payer: String,
    #[serde(default)]
    pub events: RawEvents,
    #[serde(default)]
    pub token_transfers: Vec<RawTokenTransfer>,
    #[serde(default)]
    pub native_transfers: Vec<RawNativeTransfer>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvents {
    #[serde(default)]
    pub swap: Option<RawSwapEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSwapEvent {
    #[serde(default)]
    pub native_input: Option<RawNativeAmount>,
    #[serde(default)]
    pub native_output: Option<RawNativeAmount>,
    #[serde(default)]
    pub token_inputs: Vec<RawTokenAmount>,
    #[serde(default)]
    pub token_outputs: Vec<RawTokenAmount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNativeAmount {
    #[serde(default)]
    pub account: String,
    /// Lamports, stringified by the provider.
    #[serde(default)]
    pub amount: String,
}

impl RawNativeAmount {
    pub fn lamports(&self) -> Option<u64> {
        self.amount.trim().parse::<u64>().ok()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenAmount {
    #[serde(default)]
    pub user_account: String,
    #[serde(default)]
    pub mint: String,
    #[serde(default)]
    pub raw_token_amount: RawTokenAmountDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenAmountDetail {
    #[serde(default)]
    pub token_amount: String,
    #[serde(default)]
    pub decimals: u8,
}

impl RawTokenAmount {
    pub fn raw_amount(&self) -> Option<u128> {
        self.raw_token_amount
            .token_amount
            .trim()
            .parse::<u128>()
            .ok()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenTransfer {
    #[serde(default)]
    pub from_user_account: String,
    #[serde(default)]
    pub to_user_account: String,
    #[serde(default)]
    pub mint: String,
    /// UI amount; decimals are NOT carried here, which is what makes the
    /// transfer-list parse path unsafe.
    #[serde(default)]
    pub token_amount: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNativeTransfer {
    #[serde(default)]
    pub from_user_account: String,
    #[serde(default)]
    pub to_user_account: String,
    #[serde(default)]
    pub amount: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_payload_deserializes_with_missing_optionals() {
        let raw: RawTransaction = serde_json::from_str(
            r#"{
                "signature": "sig-1",
                "feePayer": "wallet-1",
                "tokenTransfers": [
                    {"fromUserAccount": "a", "toUserAccount": "b", "mint": "m", "tokenAmount": 1.5}
                ]
            }"#,
        )
        .expect("deserialize");
        assert_eq!(raw.signature, "sig-1");
        assert!(raw.events.swap.is_none());
        assert_eq!(raw.token_transfers.len(), 1);
        assert!(raw.native_transfers.is_empty());
    }

    #[test]
    fn native_amount_parses_stringified_lamports() {
        let amount = RawNativeAmount {
            account: "w".to_string(),
            amount: "500000000".to_string(),
        };
        assert_eq!(amount.lamports(), Some(500_000_000));
        let bad = RawNativeAmount {
            account: "w".to_string(),
            amount: "0.5".to_string(),
        };
        assert_eq!(bad.lamports(), None);
    }
}
