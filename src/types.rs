//! Shared types for the VAULTKEEPER agent.
//!
//! Strategies, actions, vault connections, risk assessments and the
//! persisted agent state live here so that the chain, risk, engine and
//! storage modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::chain::ChainError;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// The closed set of on-chain operations a strategy may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ClaimAndOptimize,
    DeployToStrategy,
    RebalanceStrategies,
    HarvestStrategy,
    EmergencyExit,
    CrossChainDeploy,
    EnableYieldOptimization,
    ClaimEnhancedRoyalties,
}

impl ActionType {
    pub const ALL: [ActionType; 8] = [
        ActionType::ClaimAndOptimize,
        ActionType::DeployToStrategy,
        ActionType::RebalanceStrategies,
        ActionType::HarvestStrategy,
        ActionType::EmergencyExit,
        ActionType::CrossChainDeploy,
        ActionType::EnableYieldOptimization,
        ActionType::ClaimEnhancedRoyalties,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ClaimAndOptimize => "claim_and_optimize",
            ActionType::DeployToStrategy => "deploy_to_strategy",
            ActionType::RebalanceStrategies => "rebalance_strategies",
            ActionType::HarvestStrategy => "harvest_strategy",
            ActionType::EmergencyExit => "emergency_exit",
            ActionType::CrossChainDeploy => "cross_chain_deploy",
            ActionType::EnableYieldOptimization => "enable_yield_optimization",
            ActionType::ClaimEnhancedRoyalties => "claim_enhanced_royalties",
        }
    }

    /// Static gas estimate before the configured multiplier is applied.
    pub fn default_gas(&self) -> u64 {
        match self {
            ActionType::ClaimAndOptimize => 300_000,
            ActionType::DeployToStrategy => 250_000,
            ActionType::RebalanceStrategies => 400_000,
            ActionType::HarvestStrategy => 200_000,
            ActionType::EmergencyExit => 350_000,
            ActionType::CrossChainDeploy => 500_000,
            ActionType::EnableYieldOptimization => 150_000,
            ActionType::ClaimEnhancedRoyalties => 200_000,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| OptimizerError::Validation(format!("unknown action type '{s}'")))
    }
}

/// One atomic on-chain operation within a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    pub parameters: Map<String, Value>,
}

impl Action {
    pub fn new(action_type: ActionType, parameters: Map<String, Value>) -> Self {
        Self { action_type, parameters }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    /// Expected APR as a fraction (0.06 = 6%).
    pub apr: f64,
    pub risk_level: String,
}

/// The unit of work handed to the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub strategy_type: String,
    pub target_protocol: String,
    pub actions: Vec<Action>,
    pub expected_outcome: ExpectedOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_address: Option<String>,
}

impl Strategy {
    /// Structural check run before any network I/O.
    pub fn validate(&self) -> Result<(), OptimizerError> {
        if self.strategy_type.trim().is_empty() {
            return Err(OptimizerError::Validation("missing strategy_type".into()));
        }
        if self.target_protocol.trim().is_empty() {
            return Err(OptimizerError::Validation("missing target_protocol".into()));
        }
        if !self.expected_outcome.apr.is_finite() {
            return Err(OptimizerError::Validation("expected_outcome.apr is not finite".into()));
        }
        Ok(())
    }

    /// Parse a strategy from untrusted JSON (LLM output, files).
    pub fn from_json(json: &str) -> Result<Self, OptimizerError> {
        let draft: StrategyDraft = serde_json::from_str(json)
            .map_err(|e| OptimizerError::StrategyFormat(e.to_string()))?;
        Strategy::try_from(draft)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} ({} actions, expected APR {:.2}%, {})",
            self.strategy_type,
            self.target_protocol,
            self.actions.len(),
            self.expected_outcome.apr * 100.0,
            self.expected_outcome.risk_level,
        )
    }
}

/// Loosely-typed strategy as it arrives from outside the process.
///
/// Every field is optional so that a missing field surfaces as a
/// `Validation` error naming it rather than an opaque serde message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyDraft {
    #[serde(default)]
    pub strategy_type: Option<String>,
    #[serde(default)]
    pub target_protocol: Option<String>,
    #[serde(default)]
    pub actions: Option<Vec<Value>>,
    #[serde(default)]
    pub expected_outcome: Option<Value>,
    #[serde(default)]
    pub vault_address: Option<String>,
}

impl TryFrom<StrategyDraft> for Strategy {
    type Error = OptimizerError;

    fn try_from(draft: StrategyDraft) -> Result<Self, Self::Error> {
        let missing = |field: &str| OptimizerError::Validation(format!("missing {field}"));

        let strategy_type = draft.strategy_type.ok_or_else(|| missing("strategy_type"))?;
        let target_protocol = draft.target_protocol.ok_or_else(|| missing("target_protocol"))?;
        let raw_actions = draft.actions.ok_or_else(|| missing("actions"))?;
        let raw_outcome = draft.expected_outcome.ok_or_else(|| missing("expected_outcome"))?;

        let actions = raw_actions
            .iter()
            .enumerate()
            .map(|(i, raw)| parse_action(i, raw))
            .collect::<Result<Vec<_>, _>>()?;

        let outcome = raw_outcome
            .as_object()
            .ok_or_else(|| OptimizerError::Validation("expected_outcome is not an object".into()))?;
        let apr = match outcome.get("apr") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| OptimizerError::Validation("expected_outcome.apr is not a number".into()))?;
        let risk_level = outcome
            .get("risk_level")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let strategy = Strategy {
            strategy_type,
            target_protocol,
            actions,
            expected_outcome: ExpectedOutcome { apr, risk_level },
            vault_address: draft.vault_address,
        };
        strategy.validate()?;
        Ok(strategy)
    }
}

fn parse_action(index: usize, raw: &Value) -> Result<Action, OptimizerError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| OptimizerError::Validation(format!("action {index} is not an object")))?;
    let tag = obj
        .get("action_type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OptimizerError::Validation(format!("action {index} missing action_type")))?;
    let action_type = ActionType::from_str(tag)?;
    let parameters = obj
        .get("parameters")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| OptimizerError::Validation(format!("action {index} missing parameters")))?;
    Ok(Action::new(action_type, parameters))
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 0.3 {
            RiskLevel::Low
        } else if score < 0.7 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
        }
    }
}

/// Result of scoring one contract. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Resolved contract address, empty when nothing resolved.
    pub contract: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub is_anomaly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RiskAssessment {
    pub fn moderate(contract: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            risk_score: 0.5,
            risk_level: RiskLevel::Medium,
            is_anomaly: false,
            anomaly_score: None,
            note: Some(note.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Vaults
// ---------------------------------------------------------------------------

/// ERC-20 metadata read while validating a vault token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultInfo {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub total_supply: U256,
    pub is_likely_royalty: bool,
}

/// A registered link between a user-owned vault token and the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultConnection {
    pub vault_address: Address,
    pub user_address: Address,
    pub connected_at: DateTime<Utc>,
    pub user_balance: U256,
    pub ownership_percentage: f64,
    pub vault_info: VaultInfo,
    pub optimization_enabled: bool,
    pub last_optimized: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl VaultConnection {
    /// Eligible when enabled and never optimized or past the cooldown.
    pub fn is_due(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        self.optimization_enabled
            && self
                .last_optimized
                .map_or(true, |last| now - last >= cooldown)
    }
}

/// On-chain balance breakdown of an ERC-4626 vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultBalance {
    pub vault: Address,
    pub asset: Address,
    pub decimals: u32,
    pub total_assets: U256,
    pub total_supply: U256,
    /// Underlying asset held by the vault itself.
    pub idle: U256,
    /// Assets out in strategies (`total_assets - idle`).
    pub deployed: U256,
}

impl VaultBalance {
    pub fn total_human(&self) -> Decimal {
        from_base_units(self.total_assets, self.decimals).unwrap_or(Decimal::MAX)
    }

    pub fn idle_human(&self) -> Decimal {
        from_base_units(self.idle, self.decimals).unwrap_or(Decimal::MAX)
    }

    pub fn deployed_human(&self) -> Decimal {
        from_base_units(self.deployed, self.decimals).unwrap_or(Decimal::MAX)
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolData {
    pub total_liquidity: f64,
    pub total_borrows: f64,
    pub utilization_rate: f64,
}

/// Annualised rates, in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetApr {
    pub supply_apr: f64,
    pub borrow_apr: f64,
}

/// Protocol-level TVL, in USD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolTvl {
    pub name: String,
    pub chain: String,
    pub tvl_current: f64,
    /// TVL seven daily points back, or the current value with shorter history.
    pub tvl_7d: f64,
    #[serde(default)]
    pub chain_tvls: BTreeMap<String, f64>,
}

impl ProtocolTvl {
    /// Fractional change over the last seven days.
    pub fn change_7d(&self) -> Option<f64> {
        (self.tvl_7d > 0.0).then(|| self.tvl_current / self.tvl_7d - 1.0)
    }
}

/// One provider's snapshot keyed by asset symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderData {
    pub pool_data: BTreeMap<String, PoolData>,
    pub aprs: BTreeMap<String, AssetApr>,
    /// Protocol TVL context keyed by protocol slug. Rate providers leave it empty.
    #[serde(default)]
    pub protocols: BTreeMap<String, ProtocolTvl>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderData {
    pub fn empty() -> Self {
        Self {
            pool_data: BTreeMap::new(),
            aprs: BTreeMap::new(),
            protocols: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aprs.is_empty() && self.protocols.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Agent state
// ---------------------------------------------------------------------------

/// Lifetime counters, persisted after every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub cycle_count: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
    pub strategies_executed: u64,
    pub strategies_failed: u64,
    pub strategies_rejected: u64,
    pub connected_optimized: u64,
    /// Sum of deployed amounts in human units of the primary asset.
    pub total_deployed: Decimal,
    /// Sum of USDC swept in from the deposit proxy.
    #[serde(default)]
    pub total_swept: Decimal,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            cycle_count: 0,
            cycles_failed: 0,
            cycles_skipped: 0,
            strategies_executed: 0,
            strategies_failed: 0,
            strategies_rejected: 0,
            connected_optimized: 0,
            total_deployed: Decimal::ZERO,
            total_swept: Decimal::ZERO,
            last_cycle_at: None,
            start_time: Utc::now(),
        }
    }

    /// Fraction of attempted executions that succeeded.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.strategies_executed + self.strategies_failed;
        if attempted == 0 {
            0.0
        } else {
            self.strategies_executed as f64 / attempted as f64
        }
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

fn ten_pow(decimals: u32) -> Option<Decimal> {
    let mut factor = Decimal::ONE;
    for _ in 0..decimals {
        factor = factor.checked_mul(Decimal::TEN)?;
    }
    Some(factor)
}

/// Convert a human amount to token base units, truncating dust.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Option<U256> {
    if amount.is_sign_negative() {
        return None;
    }
    let scaled = amount.checked_mul(ten_pow(decimals)?)?.trunc();
    scaled.to_u128().map(U256::from)
}

/// Convert token base units to a human amount.
pub fn from_base_units(amount: U256, decimals: u32) -> Option<Decimal> {
    if amount > U256::from(i128::MAX as u128) {
        return None;
    }
    let raw = amount.as_u128() as i128;
    if decimals <= 28 {
        if let Ok(d) = Decimal::try_from_i128_with_scale(raw, decimals) {
            return Some(d.normalize());
        }
    }
    Decimal::try_from_i128_with_scale(raw, 0)
        .ok()?
        .checked_div(ten_pow(decimals)?)
        .map(|d| d.normalize())
}

/// Lossy conversion for ratios and display.
pub fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(f64::MAX)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Domain error taxonomy shared by the engine, scorer and orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("Invalid strategy: {0}")]
    Validation(String),

    #[error("Transient chain error: {0}")]
    TransientChain(#[from] ChainError),

    #[error("Risk model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Strategy format error: {0}")]
    StrategyFormat(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cycle {0} failed")]
    CycleFailed(u64),
}

impl OptimizerError {
    /// Only chain-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OptimizerError::TransientChain(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
