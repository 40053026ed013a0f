//! On-chain activity source for feature extraction.
//!
//! Uses the Etherscan `account/txlist` endpoint, newest first.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::features::ActivityTransaction;

const ETHERSCAN_API_URL: &str = "https://api.etherscan.io/v2/api";
const PAGE_SIZE: u32 = 200;
const REQUEST_TIMEOUT_SECS: u64 = 20;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Up to 200 recent transactions involving `address`, newest first.
    async fn recent_transactions(&self, address: &str) -> Result<Vec<ActivityTransaction>>;
}

// ---------------------------------------------------------------------------
// Etherscan
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TxListResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtherscanTx {
    time_stamp: String,
    from: String,
    value: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    gas_price: String,
    #[serde(default)]
    is_error: String,
}

impl EtherscanTx {
    fn into_activity(self) -> Option<ActivityTransaction> {
        let secs: i64 = self.time_stamp.parse().ok()?;
        let timestamp = Utc.timestamp_opt(secs, 0).single()?;
        Some(ActivityTransaction {
            from: self.from,
            value_eth: self.value.parse::<f64>().unwrap_or(0.0) / 1e18,
            timestamp,
            input: self.input,
            gas_price: self.gas_price.parse::<f64>().unwrap_or(0.0),
            failed: self.is_error == "1",
        })
    }
}

pub struct EtherscanClient {
    http: Client,
    api_key: String,
    chain_id: u64,
    base_url: String,
}

impl EtherscanClient {
    pub fn new(api_key: String, chain_id: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_key,
            chain_id,
            base_url: ETHERSCAN_API_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn parse_response(body: TxListResponse) -> Result<Vec<ActivityTransaction>> {
        if body.status != "1" {
            // Etherscan reports an empty history as an error status.
            if body.message.starts_with("No transactions found") {
                return Ok(Vec::new());
            }
            bail!("Etherscan error: {} ({})", body.message, body.result);
        }
        let txs: Vec<EtherscanTx> =
            serde_json::from_value(body.result).context("Unexpected Etherscan result shape")?;
        Ok(txs.into_iter().filter_map(EtherscanTx::into_activity).collect())
    }
}

#[async_trait]
impl ActivitySource for EtherscanClient {
    async fn recent_transactions(&self, address: &str) -> Result<Vec<ActivityTransaction>> {
        let chain_id = self.chain_id.to_string();
        let page_size = PAGE_SIZE.to_string();
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[
                ("chainid", chain_id.as_str()),
                ("module", "account"),
                ("action", "txlist"),
                ("address", address),
                ("startblock", "0"),
                ("endblock", "99999999"),
                ("page", "1"),
                ("offset", page_size.as_str()),
                ("sort", "desc"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .context("Etherscan request failed")?
            .error_for_status()
            .context("Etherscan returned an error status")?;

        let body: TxListResponse = resp.json().await.context("Failed to parse Etherscan response")?;
        let txs = Self::parse_response(body)?;
        debug!(address, count = txs.len(), "Fetched contract activity");
        Ok(txs)
    }
}
