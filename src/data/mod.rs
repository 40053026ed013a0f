//! Lending-market data providers.
//!
//! Each provider reports per-asset pool data and annualised rates, or
//! protocol TVL context. The orchestrator folds all providers into a
//! [`MarketAnalysis`]; only supply APR and total liquidity drive the
//! choice of strategy.

pub mod aave;
pub mod compound;
pub mod defillama;

use anyhow::Result;
use async_trait::async_trait;
use ethers::types::Address;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::types::{ProtocolTvl, ProviderData};

/// Abstraction over market-rate sources.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Short lowercase name, used as the strategy key prefix.
    fn name(&self) -> &str;

    async fn fetch_data(&self) -> Result<ProviderData>;
}

/// A tracked asset on mainnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetSpec {
    pub symbol: &'static str,
    pub address: Address,
    pub decimals: u32,
}

/// USDC, USDT and WETH.
pub fn default_assets() -> Vec<AssetSpec> {
    let asset = |symbol, hex: &str, decimals| AssetSpec {
        symbol,
        address: hex.parse().unwrap_or_default(),
        decimals,
    };
    vec![
        asset("USDC", "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", 6),
        asset("USDT", "0xdac17f958d2ee523a2206206994597c13d831ec7", 6),
        asset("WETH", "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", 18),
    ]
}

pub fn asset_decimals(symbol: &str) -> u32 {
    default_assets()
        .iter()
        .find(|a| a.symbol.eq_ignore_ascii_case(symbol))
        .map_or(18, |a| a.decimals)
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// One supply opportunity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Opportunity {
    /// `<provider>_<asset lowercase>`, e.g. `aave_usdc`.
    pub key: String,
    pub provider: String,
    pub asset: String,
    /// Fractional APY (0.06 = 6%).
    pub apy: f64,
    pub total_liquidity: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MarketAnalysis {
    pub opportunities: Vec<Opportunity>,
    pub snapshots: BTreeMap<String, ProviderData>,
}

impl MarketAnalysis {
    pub fn from_snapshots(snapshots: BTreeMap<String, ProviderData>) -> Self {
        let mut opportunities = Vec::new();
        for (provider, data) in &snapshots {
            for (asset, apr) in &data.aprs {
                if !apr.supply_apr.is_finite() {
                    continue;
                }
                let total_liquidity = data
                    .pool_data
                    .get(asset)
                    .map_or(0.0, |p| p.total_liquidity);
                opportunities.push(Opportunity {
                    key: format!("{provider}_{}", asset.to_lowercase()),
                    provider: provider.clone(),
                    asset: asset.clone(),
                    apy: apr.supply_apr / 100.0,
                    total_liquidity,
                });
            }
        }
        Self {
            opportunities,
            snapshots,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.opportunities.is_empty()
    }

    /// Highest APY, deeper liquidity breaking ties.
    pub fn best(&self) -> Option<&Opportunity> {
        self.opportunities.iter().max_by(|a, b| {
            a.apy
                .total_cmp(&b.apy)
                .then(a.total_liquidity.total_cmp(&b.total_liquidity))
        })
    }

    /// Best opportunity for one asset.
    pub fn best_for(&self, asset: &str) -> Option<&Opportunity> {
        self.opportunities
            .iter()
            .filter(|o| o.asset.eq_ignore_ascii_case(asset))
            .max_by(|a, b| a.apy.total_cmp(&b.apy))
    }

    /// APY per strategy key.
    pub fn apy_table(&self) -> BTreeMap<String, f64> {
        self.opportunities.iter().map(|o| (o.key.clone(), o.apy)).collect()
    }

    /// Protocol TVL from every provider that reports it, keyed by slug.
    pub fn protocol_tvl(&self) -> BTreeMap<String, ProtocolTvl> {
        self.snapshots
            .values()
            .flat_map(|d| d.protocols.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

/// Query every provider concurrently. Failed providers are dropped.
pub async fn collect(providers: &[Box<dyn MarketDataProvider>]) -> MarketAnalysis {
    let results = join_all(providers.iter().map(|p| async move { (p.name().to_string(), p.fetch_data().await) })).await;

    let mut snapshots = BTreeMap::new();
    for (name, result) in results {
        match result {
            Ok(data) if !data.is_empty() => {
                snapshots.insert(name, data);
            }
            Ok(_) => warn!(provider = %name, "Provider returned no data"),
            Err(e) => warn!(provider = %name, error = %e, "Provider fetch failed"),
        }
    }

    let analysis = MarketAnalysis::from_snapshots(snapshots);
    if let Some(best) = analysis.best() {
        info!(
            providers = analysis.snapshots.len(),
            opportunities = analysis.opportunities.len(),
            best = %best.key,
            apy = format!("{:.2}%", best.apy * 100.0),
            "Market data collected"
        );
    }
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetApr, PoolData};

    struct FixedProvider {
        name: &'static str,
        rates: Vec<(&'static str, f64, f64)>,
        fail: bool,
    }

    #[async_trait]
    impl MarketDataProvider for FixedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch_data(&self) -> Result<ProviderData> {
            if self.fail {
                anyhow::bail!("rpc down");
            }
            let mut data = ProviderData::empty();
            for (asset, apr, liquidity) in &self.rates {
                data.aprs.insert(
                    asset.to_string(),
                    AssetApr {
                        supply_apr: *apr,
                        borrow_apr: apr * 1.5,
                    },
                );
                data.pool_data.insert(
                    asset.to_string(),
                    PoolData {
                        total_liquidity: *liquidity,
                        ..PoolData::default()
                    },
                );
            }
            Ok(data)
        }
    }

    #[tokio::test]
    async fn test_collect_picks_best() {
        let providers: Vec<Box<dyn MarketDataProvider>> = vec![
            Box::new(FixedProvider {
                name: "aave",
                rates: vec![("USDC", 6.0, 1e9), ("WETH", 2.0, 1e6)],
                fail: false,
            }),
            Box::new(FixedProvider {
                name: "compound",
                rates: vec![("USDC", 4.5, 5e8)],
                fail: false,
            }),
        ];
        let analysis = collect(&providers).await;
        assert_eq!(analysis.opportunities.len(), 3);
        let best = analysis.best().unwrap();
        assert_eq!(best.key, "aave_usdc");
        assert!((best.apy - 0.06).abs() < 1e-12);
        assert_eq!(analysis.best_for("weth").unwrap().key, "aave_weth");
    }

    #[tokio::test]
    async fn test_failed_provider_dropped() {
        let providers: Vec<Box<dyn MarketDataProvider>> = vec![
            Box::new(FixedProvider {
                name: "aave",
                rates: vec![],
                fail: true,
            }),
            Box::new(FixedProvider {
                name: "compound",
                rates: vec![("USDC", 4.5, 5e8)],
                fail: false,
            }),
        ];
        let analysis = collect(&providers).await;
        assert_eq!(analysis.snapshots.len(), 1);
        assert_eq!(analysis.best().unwrap().key, "compound_usdc");
    }

    struct TvlOnly;

    #[async_trait]
    impl MarketDataProvider for TvlOnly {
        fn name(&self) -> &str {
            "defillama"
        }

        async fn fetch_data(&self) -> Result<ProviderData> {
            let mut data = ProviderData::empty();
            data.protocols.insert(
                "aave-v3".into(),
                ProtocolTvl {
                    name: "Aave V3".into(),
                    tvl_current: 1.2e10,
                    tvl_7d: 1.0e10,
                    ..ProtocolTvl::default()
                },
            );
            Ok(data)
        }
    }

    #[tokio::test]
    async fn test_tvl_provider_adds_context_not_opportunities() {
        let providers: Vec<Box<dyn MarketDataProvider>> = vec![
            Box::new(TvlOnly),
            Box::new(FixedProvider {
                name: "aave",
                rates: vec![("USDC", 6.0, 1e9)],
                fail: false,
            }),
        ];
        let analysis = collect(&providers).await;
        assert_eq!(analysis.snapshots.len(), 2);
        assert_eq!(analysis.opportunities.len(), 1);
        assert_eq!(analysis.best().unwrap().key, "aave_usdc");

        let tvl = analysis.protocol_tvl();
        assert_eq!(tvl.len(), 1);
        assert_eq!(tvl["aave-v3"].tvl_current, 1.2e10);
    }

    #[tokio::test]
    async fn test_no_providers_is_empty() {
        let analysis = collect(&[]).await;
        assert!(analysis.is_empty());
        assert!(analysis.best().is_none());
    }

    #[test]
    fn test_tie_broken_by_liquidity() {
        let mut snapshots = BTreeMap::new();
        for (name, liquidity) in [("aave", 1e6), ("compound", 2e6)] {
            let mut data = ProviderData::empty();
            data.aprs.insert("USDC".into(), AssetApr { supply_apr: 5.0, borrow_apr: 7.0 });
            data.pool_data.insert(
                "USDC".into(),
                PoolData {
                    total_liquidity: liquidity,
                    ..PoolData::default()
                },
            );
            snapshots.insert(name.to_string(), data);
        }
        let analysis = MarketAnalysis::from_snapshots(snapshots);
        assert_eq!(analysis.best().unwrap().key, "compound_usdc");
    }

    #[test]
    fn test_asset_decimals() {
        assert_eq!(asset_decimals("usdc"), 6);
        assert_eq!(asset_decimals("WETH"), 18);
        assert_eq!(asset_decimals("DAI"), 18);
    }
}
