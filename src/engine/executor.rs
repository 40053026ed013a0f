//! Strategy executor.
//!
//! Turns an approved strategy into confirmed on-chain transactions.
//! Actions run sequentially in strategy order with a fixed spacing
//! delay; each action is retried as a unit with linear backoff and the
//! strategy is abandoned at the first action that exhausts its retries.
//! Nothing is rolled back: earlier actions stay committed.

use chrono::{DateTime, Utc};
use ethers::types::{Address, TransactionRequest, H256, U256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::chain::{abi, Chain, ChainClient, ChainError, ChainMap};
use crate::config::ExecutionConfig;
use crate::engine::actions::{ActionCall, ContractCall};
use crate::engine::contracts::ContractBook;
use crate::types::{ActionType, OptimizerError, Strategy, StrategyDraft, VaultBalance};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub gas_multiplier: f64,
    pub max_retries: u32,
    pub confirmation_blocks: u64,
    pub min_gas_price: U256,
    pub max_gas_price: U256,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
    pub retry_base_delay: Duration,
    pub action_spacing: Duration,
    pub bridge_fee: U256,
    pub gas_estimates: BTreeMap<ActionType, u64>,
    pub sweep_gas: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            gas_multiplier: 1.2,
            max_retries: 3,
            confirmation_blocks: 2,
            min_gas_price: U256::from(1_000_000_000u64),
            max_gas_price: U256::from(100_000_000_000u64),
            receipt_timeout: Duration::from_secs(300),
            receipt_poll_interval: Duration::from_secs(2),
            retry_base_delay: Duration::from_secs(5),
            action_spacing: Duration::from_secs(2),
            bridge_fee: U256::from(10_000_000_000_000_000u64),
            gas_estimates: ActionType::ALL.iter().map(|t| (*t, t.default_gas())).collect(),
            sweep_gas: 300_000,
        }
    }
}

impl ExecutionSettings {
    pub fn from_config(cfg: &ExecutionConfig) -> Result<Self, OptimizerError> {
        let mut gas_estimates: BTreeMap<ActionType, u64> =
            ActionType::ALL.iter().map(|t| (*t, t.default_gas())).collect();
        for (tag, gas) in &cfg.gas_estimates {
            let t = tag.parse::<ActionType>().map_err(|_| {
                OptimizerError::Configuration(format!("unknown gas_estimates key '{tag}'"))
            })?;
            gas_estimates.insert(t, *gas);
        }

        Ok(Self {
            gas_multiplier: cfg.gas_multiplier,
            max_retries: cfg.max_retries.max(1),
            confirmation_blocks: cfg.confirmation_blocks.max(1),
            min_gas_price: U256::from(cfg.min_gas_price),
            max_gas_price: U256::from(cfg.max_gas_price),
            receipt_timeout: Duration::from_secs(cfg.receipt_timeout_secs),
            receipt_poll_interval: Duration::from_millis(cfg.receipt_poll_ms),
            retry_base_delay: Duration::from_secs(cfg.retry_base_delay_secs),
            action_spacing: Duration::from_secs(cfg.action_spacing_secs),
            bridge_fee: U256::from(cfg.bridge_fee_wei),
            gas_estimates,
            sweep_gas: cfg.sweep_gas,
        })
    }

    /// Settings with every delay zeroed, for tests and simulations.
    pub fn immediate() -> Self {
        Self {
            receipt_poll_interval: Duration::ZERO,
            retry_base_delay: Duration::ZERO,
            action_spacing: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn gas_limit(&self, action_type: ActionType) -> U256 {
        let base = self
            .gas_estimates
            .get(&action_type)
            .copied()
            .unwrap_or_else(|| action_type.default_gas());
        self.scaled_gas(base)
    }

    fn scaled_gas(&self, base: u64) -> U256 {
        U256::from((base as f64 * self.gas_multiplier).round() as u64)
    }

    /// `max(min_gas_price, min(network, max_gas_price))`.
    pub fn clamp_gas_price(&self, network: U256) -> U256 {
        self.min_gas_price.max(network.min(self.max_gas_price))
    }
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub tx_hash: H256,
    pub block_number: u64,
    pub confirmations: u64,
    pub gas_used: U256,
}

/// Outcome of one action after all its attempts.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub action_type: ActionType,
    pub success: bool,
    /// Every hash broadcast for this action, across attempts.
    pub tx_hashes: Vec<H256>,
    /// Confirmations observed on the successful attempt (minimum across its txs).
    pub confirmations: u64,
    pub attempts: u32,
    pub error: Option<String>,
}

impl ActionResult {
    fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            success: false,
            tx_hashes: Vec::new(),
            confirmations: 0,
            attempts: 0,
            error: None,
        }
    }
}

/// Aggregate result of running a strategy.
#[derive(Debug, Clone)]
pub struct StrategyExecution {
    /// True only if every action succeeded.
    pub success: bool,
    pub actions: Vec<ActionResult>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StrategyExecution {
    fn rejected(err: OptimizerError) -> Self {
        let now = Utc::now();
        Self {
            success: false,
            actions: Vec::new(),
            error: Some(err.to_string()),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn transactions_submitted(&self) -> usize {
        self.actions.iter().map(|a| a.tx_hashes.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChainHealth {
    pub chain: Chain,
    pub connected: bool,
    pub chain_id: Option<u64>,
    pub head_block: Option<u64>,
    pub signer: Option<Address>,
    pub signer_balance: Option<U256>,
    pub gas_price: Option<U256>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContractHealth {
    pub name: String,
    pub chain: Chain,
    pub address: Address,
    pub deployed: bool,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub chains: Vec<ChainHealth>,
    pub contracts: Vec<ContractHealth>,
}

/// Outcome of sweeping the deposit proxy into the primary vault.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub proxy: Address,
    /// USDC held by the proxy before the sweep, base units.
    pub pending: U256,
    /// USDC still held after it.
    pub remaining: U256,
    pub tx_hash: Option<H256>,
}

impl SweepReport {
    pub fn swept(&self) -> U256 {
        self.pending.saturating_sub(self.remaining)
    }
}

impl HealthReport {
    pub fn all_connected(&self) -> bool {
        self.chains.iter().all(|c| c.connected)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    chains: ChainMap,
    book: ContractBook,
    settings: ExecutionSettings,
}

impl ExecutionEngine {
    pub fn new(chains: ChainMap, book: ContractBook, settings: ExecutionSettings) -> Self {
        Self {
            chains,
            book,
            settings,
        }
    }

    pub fn book(&self) -> &ContractBook {
        &self.book
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn client(&self, chain: Chain) -> Result<&Arc<dyn ChainClient>, OptimizerError> {
        self.chains
            .get(&chain)
            .ok_or(OptimizerError::TransientChain(ChainError::NotConfigured(chain)))
    }

    /// Validate and run a loosely-typed strategy.
    pub async fn execute_draft(&self, draft: StrategyDraft) -> StrategyExecution {
        match Strategy::try_from(draft) {
            Ok(strategy) => self.execute(&strategy).await,
            Err(e) => {
                warn!(error = %e, "Rejected malformed strategy");
                StrategyExecution::rejected(e)
            }
        }
    }

    /// Run every action of `strategy` in order.
    pub async fn execute(&self, strategy: &Strategy) -> StrategyExecution {
        let planned = match strategy.validate().and_then(|_| self.plan(strategy)) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Strategy failed validation, nothing submitted");
                return StrategyExecution::rejected(e);
            }
        };

        let started_at = Utc::now();
        info!(
            strategy_type = %strategy.strategy_type,
            target = %strategy.target_protocol,
            actions = planned.len(),
            "Executing strategy"
        );

        let mut results = Vec::with_capacity(planned.len());
        for (i, action) in planned.iter().enumerate() {
            if i > 0 && !self.settings.action_spacing.is_zero() {
                tokio::time::sleep(self.settings.action_spacing).await;
            }

            let result = self.execute_with_retry(action).await;
            let ok = result.success;
            let reason = result.error.clone();
            results.push(result);

            if !ok {
                error!(
                    action = %action.action_type(),
                    index = i,
                    error = ?reason,
                    "Action exhausted retries, abandoning strategy"
                );
                return StrategyExecution {
                    success: false,
                    actions: results,
                    error: reason,
                    started_at,
                    finished_at: Utc::now(),
                };
            }
        }

        info!(actions = results.len(), "Strategy executed");
        StrategyExecution {
            success: true,
            actions: results,
            error: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Parse every action and check routing before any network I/O.
    fn plan(&self, strategy: &Strategy) -> Result<Vec<ActionCall>, OptimizerError> {
        let calls = strategy
            .actions
            .iter()
            .map(|a| ActionCall::parse(a, &self.book))
            .collect::<Result<Vec<_>, _>>()?;

        for call in &calls {
            for cc in call.calls(&self.book, self.settings.bridge_fee) {
                let client = self.chains.get(&cc.chain).ok_or_else(|| {
                    OptimizerError::Configuration(format!("no client for chain {}", cc.chain))
                })?;
                if client.signer().is_none() {
                    return Err(OptimizerError::Configuration(format!(
                        "no signer configured for chain {}",
                        cc.chain
                    )));
                }
            }
        }
        Ok(calls)
    }

    async fn execute_with_retry(&self, action: &ActionCall) -> ActionResult {
        let mut result = ActionResult::new(action.action_type());

        for attempt in 1..=self.settings.max_retries {
            result.attempts = attempt;
            match self.run_action(action, &mut result.tx_hashes).await {
                Ok(confirmations) => {
                    result.success = true;
                    result.confirmations = confirmations;
                    result.error = None;
                    return result;
                }
                Err(e) => {
                    warn!(
                        action = %action.action_type(),
                        attempt,
                        max = self.settings.max_retries,
                        error = %e,
                        "Action attempt failed"
                    );
                    let retryable = e.is_retryable();
                    result.error = Some(e.to_string());
                    if !retryable {
                        break;
                    }
                    if attempt < self.settings.max_retries {
                        tokio::time::sleep(self.settings.retry_base_delay * attempt).await;
                    }
                }
            }
        }
        result
    }

    /// One attempt: submit each contract call and wait for it.
    /// Returns the smallest confirmation count observed.
    async fn run_action(&self, action: &ActionCall, hashes: &mut Vec<H256>) -> Result<u64, OptimizerError> {
        let calls = action.calls(&self.book, self.settings.bridge_fee);
        if calls.is_empty() {
            info!(action = %action.action_type(), "Acknowledged, no transaction required");
            return Ok(0);
        }

        let mut min_confirmations = u64::MAX;
        for call in &calls {
            let tx_hash = self.submit(call).await?;
            hashes.push(tx_hash);
            let client = self.client(call.chain)?;
            let confirmation = self.await_confirmation(client.as_ref(), tx_hash).await?;
            info!(
                action = %action.action_type(),
                call = call.label,
                tx = ?tx_hash,
                block = confirmation.block_number,
                confirmations = confirmation.confirmations,
                "Transaction confirmed"
            );
            min_confirmations = min_confirmations.min(confirmation.confirmations);
        }
        Ok(min_confirmations)
    }

    /// Build the transaction for `call`: gas limit from the table,
    /// clamped gas price, pending nonce.
    pub async fn build_transaction(&self, call: &ContractCall) -> Result<TransactionRequest, OptimizerError> {
        let tx = TransactionRequest::new()
            .to(call.to)
            .data(call.data.clone())
            .value(call.value)
            .gas(self.settings.gas_limit(call.gas_key));
        self.fill_sender(call.chain, tx).await
    }

    /// Sender, clamped gas price and pending nonce.
    async fn fill_sender(&self, chain: Chain, tx: TransactionRequest) -> Result<TransactionRequest, OptimizerError> {
        let client = self.client(chain)?;
        let sender = client.signer().ok_or_else(|| {
            OptimizerError::Configuration(format!("no signer configured for chain {chain}"))
        })?;

        let network_price = client.gas_price().await?;
        let gas_price = self.settings.clamp_gas_price(network_price);
        let nonce = client.transaction_count(sender).await?;

        debug!(
            chain = %chain,
            network_price = %network_price,
            gas_price = %gas_price,
            nonce = %nonce,
            "Built transaction"
        );

        Ok(tx.from(sender).gas_price(gas_price).nonce(nonce))
    }

    async fn submit(&self, call: &ContractCall) -> Result<H256, OptimizerError> {
        let tx = self.build_transaction(call).await?;
        let client = self.client(call.chain)?;
        let tx_hash = client.send_transaction(tx).await?;
        info!(chain = %call.chain, call = call.label, tx = ?tx_hash, "Transaction submitted");
        Ok(tx_hash)
    }

    // -- Deposit proxy ------------------------------------------------------

    /// Forward USDC waiting in the deposit `proxy` into the primary vault
    /// with `autoDeposit()`. An empty proxy sends nothing. Transient
    /// failures are retried like strategy actions.
    pub async fn sweep_deposit_proxy(&self, proxy: Address) -> Result<SweepReport, OptimizerError> {
        let client = self.client(Chain::Ethereum)?;
        let usdc = self.book.usdc;
        let pending = abi::decode_uint(&client.call(usdc, abi::balance_of(proxy)).await?)?;
        if pending.is_zero() {
            debug!(proxy = ?proxy, "Deposit proxy empty");
            return Ok(SweepReport {
                proxy,
                pending,
                remaining: pending,
                tx_hash: None,
            });
        }

        info!(proxy = ?proxy, pending = %pending, "Sweeping deposit proxy");
        let mut attempt = 0;
        let tx_hash = loop {
            attempt += 1;
            match self.send_sweep(client.as_ref(), proxy).await {
                Ok(hash) => break hash,
                Err(e) if e.is_retryable() && attempt < self.settings.max_retries => {
                    warn!(attempt, max = self.settings.max_retries, error = %e, "Sweep attempt failed");
                    tokio::time::sleep(self.settings.retry_base_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        };

        let remaining = abi::decode_uint(&client.call(usdc, abi::balance_of(proxy)).await?)?;
        if remaining >= pending {
            warn!(proxy = ?proxy, remaining = %remaining, "Proxy balance unchanged after sweep");
        } else {
            info!(proxy = ?proxy, swept = %(pending - remaining), tx = ?tx_hash, "Deposit proxy swept");
        }
        Ok(SweepReport {
            proxy,
            pending,
            remaining,
            tx_hash: Some(tx_hash),
        })
    }

    async fn send_sweep(&self, client: &dyn ChainClient, proxy: Address) -> Result<H256, OptimizerError> {
        let tx = TransactionRequest::new()
            .to(proxy)
            .data(abi::auto_deposit())
            .value(U256::zero())
            .gas(self.settings.scaled_gas(self.settings.sweep_gas));
        let tx = self.fill_sender(Chain::Ethereum, tx).await?;
        let tx_hash = client.send_transaction(tx).await?;
        info!(chain = %Chain::Ethereum, call = "autoDeposit", tx = ?tx_hash, "Transaction submitted");
        self.await_confirmation(client, tx_hash).await?;
        Ok(tx_hash)
    }

    /// Wait for a successful receipt and enough confirmations, all
    /// within the receipt timeout.
    async fn await_confirmation(&self, client: &dyn ChainClient, tx_hash: H256) -> Result<Confirmation, OptimizerError> {
        let timeout = self.settings.receipt_timeout;
        match tokio::time::timeout(timeout, self.poll_confirmation(client, tx_hash)).await {
            Ok(result) => result.map_err(OptimizerError::from),
            Err(_) => Err(OptimizerError::from(ChainError::Timeout {
                tx: tx_hash,
                secs: timeout.as_secs(),
            })),
        }
    }

    async fn poll_confirmation(&self, client: &dyn ChainClient, tx_hash: H256) -> Result<Confirmation, ChainError> {
        let poll = self.settings.receipt_poll_interval;

        let receipt = loop {
            if let Some(r) = client.transaction_receipt(tx_hash).await? {
                break r;
            }
            tokio::time::sleep(poll).await;
        };
        if !receipt.success {
            return Err(ChainError::Reverted(tx_hash));
        }

        loop {
            let head = client.block_number().await?;
            let confirmations = head.saturating_sub(receipt.block_number) + 1;
            if confirmations >= self.settings.confirmation_blocks {
                return Ok(Confirmation {
                    tx_hash,
                    block_number: receipt.block_number,
                    confirmations,
                    gas_used: receipt.gas_used,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    // -- Read-only helpers --------------------------------------------------

    /// ERC-4626 balance breakdown of `vault` on Ethereum.
    pub async fn vault_balance(&self, vault: Address) -> Result<VaultBalance, OptimizerError> {
        let client = self.client(Chain::Ethereum)?;
        let total_assets = abi::decode_uint(&client.call(vault, abi::total_assets()).await?)?;
        let total_supply = abi::decode_uint(&client.call(vault, abi::total_supply()).await?)?;
        let asset = abi::decode_address(&client.call(vault, abi::asset()).await?)?;
        let idle = abi::decode_uint(&client.call(asset, abi::balance_of(vault)).await?)?;
        let decimals = abi::decode_uint(&client.call(asset, abi::decimals()).await?)?;

        Ok(VaultBalance {
            vault,
            asset,
            decimals: decimals.low_u32(),
            total_assets,
            total_supply,
            idle,
            deployed: total_assets.saturating_sub(idle),
        })
    }

    /// Assets a strategy contract reports as deployed.
    pub async fn strategy_position(&self, strategy: Address) -> Result<U256, OptimizerError> {
        let client = self.client(self.book.chain_for_strategy(strategy))?;
        let data = client.call(strategy, abi::get_balance()).await?;
        Ok(abi::decode_uint(&data)?)
    }

    /// Probe every chain and check each configured contract has code.
    pub async fn health_check(&self) -> HealthReport {
        let mut chains = Vec::new();
        for (chain, client) in &self.chains {
            chains.push(probe_chain(*chain, client.as_ref()).await);
        }

        let mut contracts = Vec::new();
        for (name, chain, address) in self.book.all() {
            let deployed = match self.chains.get(&chain) {
                Some(client) => client.code(address).await.map(|c| !c.is_empty()).unwrap_or(false),
                None => false,
            };
            if !deployed {
                warn!(contract = %name, chain = %chain, address = ?address, "No code at configured address");
            }
            contracts.push(ContractHealth {
                name,
                chain,
                address,
                deployed,
            });
        }

        HealthReport { chains, contracts }
    }
}

async fn probe_chain(chain: Chain, client: &dyn ChainClient) -> ChainHealth {
    let signer = client.signer();
    let mut health = ChainHealth {
        chain,
        connected: false,
        chain_id: None,
        head_block: None,
        signer,
        signer_balance: None,
        gas_price: None,
        error: None,
    };

    let probe = async {
        health.chain_id = Some(client.chain_id().await?);
        health.head_block = Some(client.block_number().await?);
        health.gas_price = Some(client.gas_price().await?);
        if let Some(addr) = signer {
            health.signer_balance = Some(client.balance(addr).await?);
        }
        Ok::<(), ChainError>(())
    };

    match probe.await {
        Ok(()) => health.connected = true,
        Err(e) => {
            warn!(chain = %chain, error = %e, "Chain health probe failed");
            health.error = Some(e.to_string());
        }
    }
    health
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
