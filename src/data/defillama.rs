//! DeFiLlama protocol TVL.
//!
//! Reports no rates. Each configured protocol slug contributes a
//! [`ProtocolTvl`] that ends up in the market-pattern records as context
//! for the planner.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::MarketDataProvider;
use crate::types::{ProtocolTvl, ProviderData};

const DEFILLAMA_API_URL: &str = "https://api.llama.fi";
const REQUEST_TIMEOUT_SECS: u64 = 20;
/// Daily points back to the "7d" TVL figure.
const WEEK_POINTS: usize = 7;

pub struct DefiLlamaProvider {
    http: Client,
    base_url: String,
    slugs: Vec<String>,
}

impl DefiLlamaProvider {
    pub fn new(slugs: Vec<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: DEFILLAMA_API_URL.to_string(),
            slugs,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn fetch_protocol(&self, slug: &str) -> Result<ProtocolTvl> {
        let url = format!("{}/protocol/{slug}", self.base_url.trim_end_matches('/'));
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await
            .context("DeFiLlama request failed")?
            .error_for_status()
            .context("DeFiLlama returned an error status")?
            .json()
            .await
            .context("Failed to parse DeFiLlama response")?;
        parse_protocol(slug, &body)
    }
}

#[async_trait]
impl MarketDataProvider for DefiLlamaProvider {
    fn name(&self) -> &str {
        "defillama"
    }

    async fn fetch_data(&self) -> Result<ProviderData> {
        let mut data = ProviderData::empty();
        for slug in &self.slugs {
            match self.fetch_protocol(slug).await {
                Ok(tvl) => {
                    debug!(slug = %slug, tvl = tvl.tvl_current, change_7d = ?tvl.change_7d(), "Protocol TVL read");
                    data.protocols.insert(slug.clone(), tvl);
                }
                Err(e) => warn!(slug = %slug, error = %e, "Skipping DeFiLlama protocol"),
            }
        }
        if data.protocols.is_empty() && !self.slugs.is_empty() {
            bail!("no DeFiLlama protocol could be read");
        }
        data.timestamp = Utc::now();
        Ok(data)
    }
}

/// Reads `/protocol/{slug}`. `tvl` is either the daily history
/// (`[{date, totalLiquidityUSD}]`) or a `{current, 7d}` object.
pub fn parse_protocol(slug: &str, body: &Value) -> Result<ProtocolTvl> {
    if !body.is_object() {
        bail!("unexpected DeFiLlama body for '{slug}'");
    }
    if let Some(msg) = body.get("message").and_then(Value::as_str) {
        bail!("DeFiLlama error for '{slug}': {msg}");
    }

    let (tvl_current, tvl_7d) = match body.get("tvl") {
        Some(Value::Array(points)) => {
            let usd = |v: &Value| v.get("totalLiquidityUSD").and_then(Value::as_f64).unwrap_or(0.0);
            let current = points.last().map_or(0.0, usd);
            let week_ago = if points.len() >= WEEK_POINTS {
                usd(&points[points.len() - WEEK_POINTS])
            } else {
                current
            };
            (current, week_ago)
        }
        Some(Value::Object(o)) => (
            o.get("current").and_then(Value::as_f64).unwrap_or(0.0),
            o.get("7d").and_then(Value::as_f64).unwrap_or(0.0),
        ),
        _ => (0.0, 0.0),
    };

    let chain_tvls: BTreeMap<String, f64> = body
        .get("currentChainTvls")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_f64().map(|tvl| (k.clone(), tvl)))
                .collect()
        })
        .unwrap_or_default();

    Ok(ProtocolTvl {
        name: body.get("name").and_then(Value::as_str).unwrap_or(slug).to_string(),
        chain: body.get("chain").and_then(Value::as_str).unwrap_or("unknown").to_string(),
        tvl_current,
        tvl_7d,
        chain_tvls,
    })
}
