//! Mock market, planner and risk detector for integration testing.
//!
//! Everything here is deterministic and in-memory. A [`Scenario`] wires
//! the mocks to simulated chains and builds a ready-to-run
//! [`Orchestrator`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vaultkeeper::chain::simulated::SimulatedChain;
use vaultkeeper::chain::{Chain, ChainMap};
use vaultkeeper::data::MarketDataProvider;
use vaultkeeper::engine::contracts::{ContractBook, StrategyContract};
use vaultkeeper::engine::executor::{ExecutionEngine, ExecutionSettings};
use vaultkeeper::engine::orchestrator::{Orchestrator, OrchestratorSettings};
use vaultkeeper::engine::registry::VaultRegistry;
use vaultkeeper::llm::{baseline_strategy, MarketContext, StrategyPlanner};
use vaultkeeper::risk::{AnomalyDetector, Detection, RiskScorer};
use vaultkeeper::storage::knowledge::{HistoricalContext, KnowledgeBase};
use vaultkeeper::types::{AssetApr, OptimizerError, PoolData, ProtocolTvl, ProviderData, Strategy};

pub const SIGNER: Address = Address::repeat_byte(0xee);
pub const WRAPPER: Address = Address::repeat_byte(0x11);
pub const VAULT: Address = Address::repeat_byte(0x22);
pub const USDC: Address = Address::repeat_byte(0xa0);
pub const AAVE_STRATEGY: Address = Address::repeat_byte(0x44);
pub const COMPOUND_STRATEGY: Address = Address::repeat_byte(0x55);
pub const DEPOSIT_PROXY: Address = Address::repeat_byte(0x66);

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A lending market with fixed supply rates.
pub struct MockProvider {
    name: &'static str,
    /// Asset symbol -> supply APR in percent.
    rates: Vec<(&'static str, f64)>,
    /// Protocol slug -> (current TVL, TVL a week ago).
    tvl: Vec<(&'static str, f64, f64)>,
    force_error: Arc<Mutex<Option<String>>>,
    calls: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(name: &'static str, rates: Vec<(&'static str, f64)>) -> Self {
        Self {
            name,
            rates,
            tvl: Vec::new(),
            force_error: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(name: &'static str, msg: &str) -> Self {
        let p = Self::new(name, Vec::new());
        *p.force_error.lock().unwrap() = Some(msg.to_string());
        p
    }

    pub fn with_tvl(mut self, slug: &'static str, current: f64, week_ago: f64) -> Self {
        self.tvl.push((slug, current, week_ago));
        self
    }
}

#[async_trait]
impl MarketDataProvider for MockProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch_data(&self) -> Result<ProviderData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(anyhow!(msg));
        }

        let mut data = ProviderData::empty();
        for (asset, pct) in &self.rates {
            data.aprs.insert(
                asset.to_string(),
                AssetApr {
                    supply_apr: *pct,
                    borrow_apr: pct * 1.4,
                },
            );
            data.pool_data.insert(
                asset.to_string(),
                PoolData {
                    total_liquidity: 1_000_000.0,
                    total_borrows: 700_000.0,
                    utilization_rate: 0.7,
                },
            );
        }
        for (slug, current, week_ago) in &self.tvl {
            data.protocols.insert(
                slug.to_string(),
                ProtocolTvl {
                    name: slug.to_string(),
                    chain: "Ethereum".into(),
                    tvl_current: *current,
                    tvl_7d: *week_ago,
                    chain_tvls: BTreeMap::new(),
                },
            );
        }
        Ok(data)
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Returns the baseline draft aimed at a fixed protocol, or fails.
pub struct ScriptedPlanner {
    target: Option<String>,
    calls: Arc<AtomicUsize>,
    last_history: Arc<Mutex<Option<HistoricalContext>>>,
}

impl ScriptedPlanner {
    pub fn targeting(protocol: &str) -> Self {
        Self {
            target: Some(protocol.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
            last_history: Arc::new(Mutex::new(None)),
        }
    }

    pub fn offline() -> Self {
        Self {
            target: None,
            calls: Arc::new(AtomicUsize::new(0)),
            last_history: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl StrategyPlanner for ScriptedPlanner {
    async fn generate_strategy(&self, market: &MarketContext, history: &HistoricalContext) -> Result<Strategy> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_history.lock().unwrap() = Some(history.clone());
        let Some(target) = &self.target else {
            return Err(anyhow!("planner offline"));
        };
        let mut s = baseline_strategy(market);
        s.target_protocol = target.clone();
        Ok(s)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Risk detector
// ---------------------------------------------------------------------------

/// Reports the same anomaly score for every contract.
pub struct StubDetector {
    anomaly_score: f64,
    seen: Arc<Mutex<Vec<String>>>,
}

impl StubDetector {
    pub fn new(anomaly_score: f64) -> Self {
        Self {
            anomaly_score,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl AnomalyDetector for StubDetector {
    async fn inspect(&self, contract: &str) -> Result<Option<Detection>, OptimizerError> {
        self.seen.lock().unwrap().push(contract.to_string());
        Ok(Some(Detection {
            anomaly_score: self.anomaly_score,
            is_anomaly: self.anomaly_score < 0.0,
            features: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

/// Knobs for one end-to-end run. Defaults: 1000 idle USDC, Aave at 6%,
/// Compound at 4.5%, planner aimed at "aave", anomaly score 0.2 (risk 0.3).
pub struct Scenario {
    pub idle_usdc: u64,
    pub providers: Vec<MockProvider>,
    pub planner: ScriptedPlanner,
    /// `None` leaves the scorer without a model.
    pub anomaly_score: Option<f64>,
    pub settings: OrchestratorSettings,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            idle_usdc: 1000,
            providers: vec![
                MockProvider::new("aave", vec![("USDC", 6.0), ("WETH", 2.0)]),
                MockProvider::new("compound", vec![("USDC", 4.5)]),
            ],
            planner: ScriptedPlanner::targeting("aave"),
            anomaly_score: Some(0.2),
            settings: OrchestratorSettings::default(),
        }
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub ethereum: Arc<SimulatedChain>,
    pub story: Arc<SimulatedChain>,
    pub planner_calls: Arc<AtomicUsize>,
    pub planner_history: Arc<Mutex<Option<HistoricalContext>>>,
    pub provider_calls: Vec<Arc<AtomicUsize>>,
}

impl Scenario {
    pub fn build(self) -> Harness {
        let ethereum = Arc::new(SimulatedChain::new(Chain::Ethereum).with_signer(SIGNER));
        let story = Arc::new(SimulatedChain::new(Chain::Story).with_signer(SIGNER));

        let units = U256::from(self.idle_usdc) * U256::exp10(6);
        ethereum.set_erc20(USDC, "USD Coin", "USDC", 6, units);
        ethereum.set_vault(VAULT, USDC, units, units);

        let mut chains: ChainMap = BTreeMap::new();
        chains.insert(Chain::Ethereum, ethereum.clone());
        chains.insert(Chain::Story, story.clone());

        let book = ContractBook {
            royalty_wrapper: WRAPPER,
            base_vault: VAULT,
            usdc: USDC,
            strategies: BTreeMap::from([
                (
                    "aave_usdc".to_string(),
                    StrategyContract {
                        address: AAVE_STRATEGY,
                        chain: Chain::Ethereum,
                    },
                ),
                (
                    "compound_usdc".to_string(),
                    StrategyContract {
                        address: COMPOUND_STRATEGY,
                        chain: Chain::Ethereum,
                    },
                ),
            ]),
        };

        let detector: Option<Box<dyn AnomalyDetector>> = self
            .anomaly_score
            .map(|s| Box::new(StubDetector::new(s)) as Box<dyn AnomalyDetector>);
        let scorer = RiskScorer::new(detector, &Default::default());

        let planner_calls = self.planner.calls.clone();
        let planner_history = self.planner.last_history.clone();
        let provider_calls = self.providers.iter().map(|p| p.calls.clone()).collect();
        let providers: Vec<Box<dyn MarketDataProvider>> = self
            .providers
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn MarketDataProvider>)
            .collect();

        let orchestrator = Orchestrator::new(
            ExecutionEngine::new(chains, book, ExecutionSettings::immediate()),
            scorer,
            VaultRegistry::new(story.clone()),
            Box::new(self.planner),
            providers,
            KnowledgeBase::in_memory(),
            self.settings,
        );

        Harness {
            orchestrator,
            ethereum,
            story,
            planner_calls,
            planner_history,
            provider_calls,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_rates() {
        let p = MockProvider::new("aave", vec![("USDC", 6.0)]);
        let data = p.fetch_data().await.unwrap();
        assert_eq!(data.aprs["USDC"].supply_apr, 6.0);
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mock_provider_forced_error() {
        let p = MockProvider::failing("aave", "node down");
        assert!(p.fetch_data().await.is_err());
    }

    #[tokio::test]
    async fn test_stub_detector_records_contracts() {
        let d = StubDetector::new(-0.1);
        let det = d.inspect("0xabc").await.unwrap().unwrap();
        assert!(det.is_anomaly);
        assert_eq!(d.seen.lock().unwrap().as_slice(), ["0xabc"]);
    }
}
