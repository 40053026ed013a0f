//! Compound V3 (Comet) rates.
//!
//! Each Comet market has one base asset. Rates come back per second,
//! scaled by 1e18.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, U256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::MarketDataProvider;
use crate::chain::{abi, ChainClient};
use crate::types::{u256_to_f64, AssetApr, PoolData, ProviderData};

const SECONDS_PER_YEAR: f64 = 31_536_000.0;
const RATE_SCALE: f64 = 1e18;

/// One Comet market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CometMarket {
    pub symbol: String,
    pub comet: Address,
    pub decimals: u32,
}

pub struct CompoundV3Provider {
    client: Arc<dyn ChainClient>,
    markets: Vec<CometMarket>,
}

impl CompoundV3Provider {
    pub fn new(client: Arc<dyn ChainClient>, markets: Vec<CometMarket>) -> Self {
        Self { client, markets }
    }

    /// Per-second rate scaled by 1e18 to annual percent.
    pub fn per_second_to_percent(rate: U256) -> f64 {
        u256_to_f64(rate) / RATE_SCALE * SECONDS_PER_YEAR * 100.0
    }

    async fn read_uint(&self, to: Address, data: ethers::types::Bytes) -> Result<U256> {
        let raw = self.client.call(to, data).await?;
        Ok(abi::decode_uint(&raw)?)
    }

    async fn fetch_market(&self, market: &CometMarket) -> Result<(PoolData, AssetApr)> {
        let comet = market.comet;
        let utilization = self
            .read_uint(comet, abi::comet_get_utilization())
            .await
            .with_context(|| format!("getUtilization on {} failed", market.symbol))?;
        let supply_rate = self.read_uint(comet, abi::comet_get_supply_rate(utilization)).await?;
        let borrow_rate = self.read_uint(comet, abi::comet_get_borrow_rate(utilization)).await?;
        let supplied = self.read_uint(comet, abi::total_supply()).await?;
        let borrowed = self.read_uint(comet, abi::comet_total_borrow()).await?;

        let unit = 10f64.powi(market.decimals as i32);
        Ok((
            PoolData {
                total_liquidity: u256_to_f64(supplied) / unit,
                total_borrows: u256_to_f64(borrowed) / unit,
                utilization_rate: u256_to_f64(utilization) / RATE_SCALE,
            },
            AssetApr {
                supply_apr: Self::per_second_to_percent(supply_rate),
                borrow_apr: Self::per_second_to_percent(borrow_rate),
            },
        ))
    }
}

#[async_trait]
impl MarketDataProvider for CompoundV3Provider {
    fn name(&self) -> &str {
        "compound"
    }

    async fn fetch_data(&self) -> Result<ProviderData> {
        let mut pool_data = BTreeMap::new();
        let mut aprs = BTreeMap::new();

        for market in &self.markets {
            match self.fetch_market(market).await {
                Ok((pool, apr)) => {
                    debug!(asset = %market.symbol, supply_apr = apr.supply_apr, "Comet market read");
                    pool_data.insert(market.symbol.clone(), pool);
                    aprs.insert(market.symbol.clone(), apr);
                }
                Err(e) => warn!(asset = %market.symbol, error = %e, "Skipping Comet market"),
            }
        }

        Ok(ProviderData {
            pool_data,
            aprs,
            protocols: BTreeMap::new(),
            timestamp: Utc::now(),
        })
    }
}

/// Annual percentage to a per-second rate scaled by 1e18.
pub fn percent_to_per_second(percent: f64) -> U256 {
    U256::from((percent / 100.0 / SECONDS_PER_YEAR * RATE_SCALE).round().max(0.0) as u128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::simulated::SimulatedChain;
    use crate::chain::Chain;

    const COMET: Address = Address::repeat_byte(0xc0);

    #[tokio::test]
    async fn test_fetch_comet_market() {
        let chain = Arc::new(SimulatedChain::new(Chain::Ethereum));
        let util = U256::exp10(17) * U256::from(8u8); // 80%
        chain.set_selector_response(COMET, abi::COMET_GET_UTILIZATION, abi::encode_uint(util));
        chain.set_selector_response(COMET, abi::COMET_GET_SUPPLY_RATE, abi::encode_uint(percent_to_per_second(4.5)));
        chain.set_selector_response(COMET, abi::COMET_GET_BORROW_RATE, abi::encode_uint(percent_to_per_second(6.0)));
        chain.set_selector_response(
            COMET,
            abi::TOTAL_SUPPLY,
            abi::encode_uint(U256::from(500_000u64) * U256::exp10(6)),
        );
        chain.set_selector_response(
            COMET,
            abi::COMET_TOTAL_BORROW,
            abi::encode_uint(U256::from(400_000u64) * U256::exp10(6)),
        );

        let provider = CompoundV3Provider::new(
            chain.clone(),
            vec![CometMarket {
                symbol: "USDC".into(),
                comet: COMET,
                decimals: 6,
            }],
        );
        let data = provider.fetch_data().await.unwrap();
        let apr = &data.aprs["USDC"];
        assert!((apr.supply_apr - 4.5).abs() < 1e-6, "{}", apr.supply_apr);
        assert!((apr.borrow_apr - 6.0).abs() < 1e-6);
        let pool = &data.pool_data["USDC"];
        assert_eq!(pool.total_liquidity, 500_000.0);
        assert!((pool.utilization_rate - 0.8).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unreachable_market_skipped() {
        let chain = Arc::new(SimulatedChain::new(Chain::Ethereum));
        let provider = CompoundV3Provider::new(
            chain.clone(),
            vec![CometMarket {
                symbol: "USDC".into(),
                comet: COMET,
                decimals: 6,
            }],
        );
        let data = provider.fetch_data().await.unwrap();
        assert!(data.aprs.is_empty());
    }
}
