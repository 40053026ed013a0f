//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (signing key, API keys, RPC overrides) are referenced by
//! env-var name in the config and resolved at runtime.

use anyhow::{Context, Result};
use ethers::types::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

use crate::chain::Chain;
use crate::types::OptimizerError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub chains: ChainsConfig,
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub optimization: OptimizationConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_interval_secs")]
    pub optimization_interval_secs: u64,
    /// Minimum wait after a failed cycle.
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Idle USDC the simulated primary vault starts with in dry-run mode.
    #[serde(default = "default_dry_run_balance")]
    pub dry_run_vault_balance: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_gas_multiplier")]
    pub gas_multiplier: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    /// Gas price floor in wei.
    #[serde(default = "default_min_gas_price")]
    pub min_gas_price: u64,
    /// Gas price ceiling in wei.
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price: u64,
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,
    /// Retry delay is this times the attempt number.
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_action_spacing_secs")]
    pub action_spacing_secs: u64,
    /// Value attached to cross-chain deploys, in wei.
    #[serde(default = "default_bridge_fee_wei")]
    pub bridge_fee_wei: u64,
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
    /// Overrides for the static gas table, keyed by action type tag.
    #[serde(default)]
    pub gas_estimates: HashMap<String, u64>,
    /// Gas for the deposit-proxy `autoDeposit()` sweep.
    #[serde(default = "default_sweep_gas")]
    pub sweep_gas: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainsConfig {
    pub story: ChainEndpoint,
    pub ethereum: ChainEndpoint,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainEndpoint {
    pub rpc_url: String,
    /// Env var that, when set, replaces `rpc_url`.
    #[serde(default)]
    pub rpc_url_env: Option<String>,
}

impl ChainEndpoint {
    pub fn resolve_rpc_url(&self) -> String {
        self.rpc_url_env
            .as_deref()
            .and_then(|env| std::env::var(env).ok())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.rpc_url.clone())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContractsConfig {
    pub royalty_wrapper: String,
    pub base_vault: String,
    pub usdc: String,
    /// Deployed strategy contracts keyed by strategy name (`aave_usdc`).
    #[serde(default)]
    pub strategies: HashMap<String, StrategyContractConfig>,
    /// Proxy that collects user USDC deposits on Ethereum. Swept into the
    /// primary vault at the start of every cycle when set.
    #[serde(default)]
    pub deposit_proxy: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StrategyContractConfig {
    #[serde(default)]
    pub address: Option<String>,
    /// Env var holding the address; wins over `address` when set.
    #[serde(default)]
    pub address_env: Option<String>,
    #[serde(default = "default_strategy_chain")]
    pub chain: Chain,
}

impl StrategyContractConfig {
    pub fn resolve_address(&self) -> Option<String> {
        self.address_env
            .as_deref()
            .and_then(|env| std::env::var(env).ok())
            .filter(|v| !v.is_empty())
            .or_else(|| self.address.clone().filter(|v| !v.is_empty()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    /// Execute only when the risk score is strictly below this.
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default)]
    pub etherscan_api_key_env: Option<String>,
    #[serde(default = "default_etherscan_chain_id")]
    pub etherscan_chain_id: u64,
    /// Extra protocol name -> contract entries for the resolver.
    #[serde(default)]
    pub protocol_addresses: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OptimizationConfig {
    #[serde(default = "default_min_balance")]
    pub min_balance_threshold: Decimal,
    /// Fractional APY (0.05 = 5%).
    #[serde(default = "default_min_yield")]
    pub min_yield_threshold: f64,
    /// Share of idle balance deployed per cycle.
    #[serde(default = "default_deploy_fraction")]
    pub deploy_fraction: Decimal,
    #[serde(default = "default_primary_asset")]
    pub primary_asset: String,
    #[serde(default = "default_context_limit")]
    pub history_context_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub aave: Option<AaveConfig>,
    #[serde(default)]
    pub compound: Option<CompoundConfig>,
    #[serde(default)]
    pub defillama: Option<DefiLlamaConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AaveConfig {
    pub enabled: bool,
    pub pool_address: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompoundConfig {
    pub enabled: bool,
    /// Comet market per base asset symbol.
    pub comets: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DefiLlamaConfig {
    pub enabled: bool,
    /// Protocol slugs, e.g. `aave-v3`.
    #[serde(default)]
    pub protocols: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_registry_file")]
    pub registry_file: String,
    #[serde(default = "default_knowledge_dir")]
    pub knowledge_dir: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_interval_secs() -> u64 {
    3600
}
fn default_error_backoff_secs() -> u64 {
    60
}
fn default_dry_run_balance() -> Decimal {
    dec!(1000)
}
fn default_gas_multiplier() -> f64 {
    1.2
}
fn default_max_retries() -> u32 {
    3
}
fn default_confirmation_blocks() -> u64 {
    2
}
fn default_min_gas_price() -> u64 {
    1_000_000_000
}
fn default_max_gas_price() -> u64 {
    100_000_000_000
}
fn default_receipt_timeout_secs() -> u64 {
    300
}
fn default_receipt_poll_ms() -> u64 {
    2000
}
fn default_retry_base_delay_secs() -> u64 {
    5
}
fn default_action_spacing_secs() -> u64 {
    2
}
fn default_bridge_fee_wei() -> u64 {
    10_000_000_000_000_000
}
fn default_sweep_gas() -> u64 {
    300_000
}
fn default_signing_key_env() -> String {
    "PRIV_KEY".to_string()
}
fn default_strategy_chain() -> Chain {
    Chain::Ethereum
}
fn default_acceptance_threshold() -> f64 {
    0.6
}
fn default_model_path() -> String {
    "models/anomaly_model.json".to_string()
}
fn default_etherscan_chain_id() -> u64 {
    1
}
fn default_min_balance() -> Decimal {
    dec!(100)
}
fn default_min_yield() -> f64 {
    0.05
}
fn default_deploy_fraction() -> Decimal {
    dec!(0.8)
}
fn default_primary_asset() -> String {
    "USDC".to_string()
}
fn default_context_limit() -> usize {
    10
}
fn default_temperature() -> f32 {
    0.3
}
fn default_state_file() -> String {
    "vaultkeeper_state.json".to_string()
}
fn default_registry_file() -> String {
    "vaultkeeper_vaults.json".to_string()
}
fn default_knowledge_dir() -> String {
    "data/knowledge".to_string()
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            gas_multiplier: default_gas_multiplier(),
            max_retries: default_max_retries(),
            confirmation_blocks: default_confirmation_blocks(),
            min_gas_price: default_min_gas_price(),
            max_gas_price: default_max_gas_price(),
            receipt_timeout_secs: default_receipt_timeout_secs(),
            receipt_poll_ms: default_receipt_poll_ms(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            action_spacing_secs: default_action_spacing_secs(),
            bridge_fee_wei: default_bridge_fee_wei(),
            signing_key_env: default_signing_key_env(),
            gas_estimates: HashMap::new(),
            sweep_gas: default_sweep_gas(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: default_acceptance_threshold(),
            model_path: default_model_path(),
            etherscan_api_key_env: None,
            etherscan_chain_id: default_etherscan_chain_id(),
            protocol_addresses: HashMap::new(),
        }
    }
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            min_balance_threshold: default_min_balance(),
            min_yield_threshold: default_min_yield(),
            deploy_fraction: default_deploy_fraction(),
            primary_asset: default_primary_asset(),
            history_context_limit: default_context_limit(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            registry_file: default_registry_file(),
            knowledge_dir: default_knowledge_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// The transaction signing key, if its env var is set and non-empty.
    pub fn signing_key(&self) -> Option<SecretString> {
        std::env::var(&self.execution.signing_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::new)
    }

    /// Bounds and address checks. `require_key` is false in dry-run mode.
    pub fn validate(&self, require_key: bool) -> Result<(), OptimizerError> {
        let bad = |msg: String| Err(OptimizerError::Configuration(msg));
        let exec = &self.execution;

        if exec.max_retries == 0 {
            return bad("execution.max_retries must be at least 1".into());
        }
        if !(exec.gas_multiplier.is_finite() && exec.gas_multiplier > 0.0) {
            return bad(format!("execution.gas_multiplier {} must be positive", exec.gas_multiplier));
        }
        if exec.min_gas_price > exec.max_gas_price {
            return bad(format!(
                "execution.min_gas_price {} exceeds max_gas_price {}",
                exec.min_gas_price, exec.max_gas_price
            ));
        }
        if !(0.0..=1.0).contains(&self.risk.acceptance_threshold) {
            return bad(format!(
                "risk.acceptance_threshold {} outside [0, 1]",
                self.risk.acceptance_threshold
            ));
        }
        let fraction = self.optimization.deploy_fraction;
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return bad(format!("optimization.deploy_fraction {fraction} outside (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.optimization.min_yield_threshold) {
            return bad(format!(
                "optimization.min_yield_threshold {} outside [0, 1]",
                self.optimization.min_yield_threshold
            ));
        }
        for tag in exec.gas_estimates.keys() {
            tag.parse::<crate::types::ActionType>()
                .map_err(|_| OptimizerError::Configuration(format!("unknown gas_estimates key '{tag}'")))?;
        }

        parse_address("contracts.royalty_wrapper", &self.contracts.royalty_wrapper)?;
        parse_address("contracts.base_vault", &self.contracts.base_vault)?;
        parse_address("contracts.usdc", &self.contracts.usdc)?;
        if let Some(proxy) = &self.contracts.deposit_proxy {
            parse_address("contracts.deposit_proxy", proxy)?;
        }
        for (name, strategy) in &self.contracts.strategies {
            if let Some(addr) = strategy.resolve_address() {
                parse_address(&format!("contracts.strategies.{name}"), &addr)?;
            }
        }

        if require_key && self.signing_key().is_none() {
            return bad(format!(
                "signing key env var {} is not set",
                self.execution.signing_key_env
            ));
        }
        Ok(())
    }
}

/// Parse a hex address, naming the config field on failure.
pub fn parse_address(field: &str, value: &str) -> Result<Address, OptimizerError> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|e| OptimizerError::Configuration(format!("{field}: invalid address '{value}': {e}")))
}
