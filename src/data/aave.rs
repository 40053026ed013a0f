//! Aave V3 pool rates read straight from the Pool contract.
//!
//! `getReserveData(asset)` returns the reserve struct as 15 words:
//! word 2 is the current liquidity rate and word 4 the variable borrow
//! rate, both in ray (1e27). Words 8 and 10 hold the aToken and variable
//! debt token, whose total supplies give liquidity and borrows.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, U256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{AssetSpec, MarketDataProvider};
use crate::chain::{abi, ChainClient};
use crate::types::{u256_to_f64, AssetApr, PoolData, ProviderData};

const RAY: f64 = 1e27;

const WORD_LIQUIDITY_RATE: usize = 2;
const WORD_VARIABLE_BORROW_RATE: usize = 4;
const WORD_A_TOKEN: usize = 8;
const WORD_VARIABLE_DEBT_TOKEN: usize = 10;

pub struct AaveV3Provider {
    client: Arc<dyn ChainClient>,
    pool: Address,
    assets: Vec<AssetSpec>,
}

impl AaveV3Provider {
    pub fn new(client: Arc<dyn ChainClient>, pool: Address, assets: Vec<AssetSpec>) -> Self {
        Self { client, pool, assets }
    }

    /// Ray-denominated per-year rate to percent.
    pub fn ray_to_percent(rate: U256) -> f64 {
        u256_to_f64(rate) / RAY * 100.0
    }

    async fn token_supply(&self, token: Address, decimals: u32) -> Result<f64> {
        let raw = self.client.call(token, abi::total_supply()).await?;
        let supply = abi::decode_uint(&raw)?;
        Ok(u256_to_f64(supply) / 10f64.powi(decimals as i32))
    }

    async fn fetch_asset(&self, asset: &AssetSpec) -> Result<(PoolData, AssetApr)> {
        let reserve = self
            .client
            .call(self.pool, abi::aave_get_reserve_data(asset.address))
            .await
            .with_context(|| format!("getReserveData({}) failed", asset.symbol))?;

        let supply_apr = Self::ray_to_percent(abi::word(&reserve, WORD_LIQUIDITY_RATE)?);
        let borrow_apr = Self::ray_to_percent(abi::word(&reserve, WORD_VARIABLE_BORROW_RATE)?);
        let a_token = abi::word_address(&reserve, WORD_A_TOKEN)?;
        let debt_token = abi::word_address(&reserve, WORD_VARIABLE_DEBT_TOKEN)?;

        let total_liquidity = self.token_supply(a_token, asset.decimals).await?;
        // Debt token reads are optional; some forks leave it unset.
        let total_borrows = match self.token_supply(debt_token, asset.decimals).await {
            Ok(v) => v,
            Err(e) => {
                debug!(asset = asset.symbol, error = %e, "Variable debt supply unavailable");
                0.0
            }
        };
        let utilization_rate = if total_liquidity > 0.0 {
            total_borrows / total_liquidity
        } else {
            0.0
        };

        Ok((
            PoolData {
                total_liquidity,
                total_borrows,
                utilization_rate,
            },
            AssetApr { supply_apr, borrow_apr },
        ))
    }
}

#[async_trait]
impl MarketDataProvider for AaveV3Provider {
    fn name(&self) -> &str {
        "aave"
    }

    async fn fetch_data(&self) -> Result<ProviderData> {
        let mut pool_data = BTreeMap::new();
        let mut aprs = BTreeMap::new();

        for asset in &self.assets {
            match self.fetch_asset(asset).await {
                Ok((pool, apr)) => {
                    debug!(asset = asset.symbol, supply_apr = apr.supply_apr, "Aave reserve read");
                    pool_data.insert(asset.symbol.to_string(), pool);
                    aprs.insert(asset.symbol.to_string(), apr);
                }
                Err(e) => warn!(asset = asset.symbol, error = %e, "Skipping Aave reserve"),
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

/// Encoded `getReserveData` return value, for simulated chains.
pub fn encode_reserve_data(liquidity_rate: U256, variable_borrow_rate: U256, a_token: Address, debt_token: Address) -> ethers::types::Bytes {
    let mut words = vec![U256::zero(); 15];
    words[WORD_LIQUIDITY_RATE] = liquidity_rate;
    words[WORD_VARIABLE_BORROW_RATE] = variable_borrow_rate;
    words[WORD_A_TOKEN] = U256::from_big_endian(a_token.as_bytes());
    words[WORD_VARIABLE_DEBT_TOKEN] = U256::from_big_endian(debt_token.as_bytes());
    abi::encode_words(&words)
}

/// Annual percentage to a ray-denominated rate.
pub fn percent_to_ray(percent: f64) -> U256 {
    // 1e27 overflows u128 math, so scale in two steps.
    let scaled = (percent / 100.0 * 1e18).round().max(0.0) as u128;
    U256::from(scaled) * U256::exp10(9)
}
