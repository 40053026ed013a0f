//! Orchestration loop.
//!
//! One cycle has two independent parts, preceded by a sweep of the
//! deposit proxy (when one is configured) into the primary vault:
//!
//! 1. Every connected vault whose cooldown has elapsed runs the
//!    extraction pipeline and gets its `last_optimized` stamped.
//! 2. The operator's primary vault goes through
//!    balance → market data → draft → enrich → risk gate → execute.
//!
//! Only infrastructure errors abort a cycle. Skips and rejections are
//! ordinary outcomes and are reported as such.

use chrono::Utc;
use ethers::types::Address;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::data::{self, MarketDataProvider};
use crate::engine::accountant::{Accountant, CycleReport, PrimaryOutcome, SkipReason};
use crate::engine::executor::ExecutionEngine;
use crate::engine::registry::{RegistryError, StatusUpdate, VaultRegistry};
use crate::llm::{baseline_strategy, MarketContext, StrategyPlanner};
use crate::risk::{is_safe_score, RiskScorer};
use crate::storage::{self, knowledge::{KnowledgeBase, RiskEvent, StrategyOutcome}};
use crate::strategy::{enrich, plan_deployment};
use crate::types::{from_base_units, AgentState, OptimizerError, VaultConnection};

const USDC_DECIMALS: u32 = 6;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Execute only when the risk score is strictly below this.
    pub acceptance_threshold: f64,
    /// Idle balance, in human units, below which the primary vault is left alone.
    pub min_balance_threshold: Decimal,
    /// Fractional APY below which nothing is deployed.
    pub min_yield_threshold: f64,
    pub deploy_fraction: Decimal,
    pub primary_asset: String,
    pub history_context_limit: usize,
    pub interval: Duration,
    pub error_backoff: Duration,
    /// Proxy swept into the primary vault at the start of each cycle.
    pub deposit_proxy: Option<Address>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.6,
            min_balance_threshold: Decimal::new(100, 0),
            min_yield_threshold: 0.05,
            deploy_fraction: Decimal::new(8, 1),
            primary_asset: "USDC".into(),
            history_context_limit: 10,
            interval: Duration::from_secs(3600),
            error_backoff: Duration::from_secs(60),
            deposit_proxy: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            acceptance_threshold: cfg.risk.acceptance_threshold,
            min_balance_threshold: cfg.optimization.min_balance_threshold,
            min_yield_threshold: cfg.optimization.min_yield_threshold,
            deploy_fraction: cfg.optimization.deploy_fraction,
            primary_asset: cfg.optimization.primary_asset.clone(),
            history_context_limit: cfg.optimization.history_context_limit,
            interval: Duration::from_secs(cfg.agent.optimization_interval_secs),
            error_backoff: Duration::from_secs(cfg.agent.error_backoff_secs),
            // Checked by AppConfig::validate.
            deposit_proxy: cfg.contracts.deposit_proxy.as_deref().and_then(|a| a.trim().parse().ok()),
        }
    }

    /// Wait before the next cycle.
    pub fn next_delay(&self, last_cycle_ok: bool) -> Duration {
        if last_cycle_ok {
            self.interval
        } else {
            self.interval.max(self.error_backoff)
        }
    }
}

/// Where state is written after each cycle. `None` keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct Persistence {
    pub state_file: Option<String>,
    pub registry_file: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    engine: ExecutionEngine,
    scorer: RiskScorer,
    registry: VaultRegistry,
    planner: Box<dyn StrategyPlanner>,
    providers: Vec<Box<dyn MarketDataProvider>>,
    knowledge: KnowledgeBase,
    settings: OrchestratorSettings,
    state: AgentState,
    persistence: Option<Persistence>,
}

impl Orchestrator {
    pub fn new(
        engine: ExecutionEngine,
        scorer: RiskScorer,
        registry: VaultRegistry,
        planner: Box<dyn StrategyPlanner>,
        providers: Vec<Box<dyn MarketDataProvider>>,
        knowledge: KnowledgeBase,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            engine,
            scorer,
            registry,
            planner,
            providers,
            knowledge,
            settings,
            state: AgentState::new(),
            persistence: None,
        }
    }

    pub fn with_state(mut self, state: AgentState) -> Self {
        self.state = state;
        self
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn registry(&self) -> &VaultRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut VaultRegistry {
        &mut self.registry
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    // -- Cycle --------------------------------------------------------------

    /// One full cycle. Does not touch the lifetime state.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, OptimizerError> {
        let cycle_number = self.state.cycle_count + 1;
        info!(cycle = cycle_number, planner = self.planner.name(), "Starting cycle");

        let deposits_swept = self.sweep_deposits().await;
        let (connected_processed, connected_succeeded) = self.process_connected_vaults().await;
        let primary = self.optimize_primary().await?;

        Ok(CycleReport {
            cycle_number,
            connected_processed,
            connected_succeeded,
            deposits_swept,
            primary,
            timestamp: Utc::now(),
        })
    }

    /// Run a cycle, fold it into the lifetime state and persist.
    /// Returns `false` when the cycle failed.
    pub async fn run_and_record(&mut self) -> bool {
        let ok = match self.run_cycle().await {
            Ok(report) => {
                Accountant::reconcile(&mut self.state, &report);
                !report.is_failure()
            }
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "Cycle failed, continuing to next");
                Accountant::record_failure(&mut self.state, Utc::now());
                false
            }
        };
        self.persist();
        ok
    }

    /// A single recorded cycle, as an error when it failed.
    pub async fn run_once(&mut self) -> Result<(), OptimizerError> {
        if self.run_and_record().await {
            Ok(())
        } else {
            Err(OptimizerError::CycleFailed(self.state.cycle_count))
        }
    }

    /// Cycle until `shutdown` flips to `true` or its sender is dropped.
    /// An in-flight cycle always finishes. Returns the number of cycles run.
    pub async fn run_continuous(&mut self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut cycles = 0u64;
        info!(interval_secs = self.settings.interval.as_secs(), "Entering continuous mode");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let ok = self.run_and_record().await;
            cycles += 1;

            let delay = self.settings.next_delay(ok);
            debug!(delay_secs = delay.as_secs(), "Sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(cycles, total = self.state.cycle_count, "Continuous mode stopped");
        cycles
    }

    fn persist(&self) {
        let Some(p) = &self.persistence else {
            return;
        };
        if let Err(e) = storage::save_state(&self.state, p.state_file.as_deref()) {
            error!(error = %e, "Failed to save state");
        }
        self.persist_registry();
    }

    fn persist_registry(&self) {
        let Some(p) = &self.persistence else {
            return;
        };
        if let Err(e) = storage::save_registry(&self.registry.snapshot(), p.registry_file.as_deref()) {
            error!(error = %e, "Failed to save vault registry");
        }
    }

    // -- User vaults --------------------------------------------------------

    /// Register a user's royalty vault and persist the registry.
    pub async fn connect_user_vault(
        &mut self,
        vault: Address,
        user: Address,
        metadata: Option<Map<String, Value>>,
    ) -> Result<VaultConnection, RegistryError> {
        let connection = self.registry.connect(vault, user, metadata).await?;
        self.persist_registry();
        Ok(connection)
    }

    pub fn disconnect_user_vault(&mut self, vault: Address, user: Address) -> Result<(), RegistryError> {
        self.registry.disconnect(vault, user)?;
        self.persist_registry();
        Ok(())
    }

    // -- Deposit proxy ------------------------------------------------------

    /// Sweep pending user deposits so they count as idle this cycle.
    /// A failed sweep is logged and picked up again next cycle.
    async fn sweep_deposits(&self) -> Decimal {
        let Some(proxy) = self.settings.deposit_proxy else {
            return Decimal::ZERO;
        };
        match self.engine.sweep_deposit_proxy(proxy).await {
            Ok(report) => from_base_units(report.swept(), USDC_DECIMALS).unwrap_or(Decimal::ZERO),
            Err(e) => {
                warn!(proxy = ?proxy, error = %e, "Deposit sweep failed");
                Decimal::ZERO
            }
        }
    }

    // -- Connected vaults ---------------------------------------------------

    async fn process_connected_vaults(&mut self) -> (usize, usize) {
        let candidates = self.registry.optimization_candidates();
        if candidates.is_empty() {
            debug!("No connected vaults due");
            return (0, 0);
        }

        let mut succeeded = 0;
        for conn in &candidates {
            if !self.run_connected_pipeline(conn).await {
                continue;
            }
            match self
                .registry
                .update_status(conn.vault_address, conn.user_address, StatusUpdate::optimized_at(Utc::now()))
            {
                Ok(()) => succeeded += 1,
                Err(e) => warn!(vault = ?conn.vault_address, user = ?conn.user_address, error = %e, "Status update failed"),
            }
        }

        info!(processed = candidates.len(), succeeded, "Connected vaults processed");
        (candidates.len(), succeeded)
    }

    /// Royalty extraction, bridge and deposit for one connected vault.
    /// The on-chain legs are not wired yet, so every stage reports success.
    async fn run_connected_pipeline(&self, conn: &VaultConnection) -> bool {
        for stage in ["extract_royalties", "bridge", "deposit"] {
            debug!(vault = ?conn.vault_address, user = ?conn.user_address, stage, "Connected vault stage");
        }
        true
    }

    // -- Primary vault ------------------------------------------------------

    async fn optimize_primary(&mut self) -> Result<PrimaryOutcome, OptimizerError> {
        let vault = self.engine.book().base_vault;
        let balance = self.engine.vault_balance(vault).await?;
        let idle = balance.idle_human();
        info!(vault = ?vault, idle = %idle, total = %balance.total_human(), "Primary vault balance");

        if idle < self.settings.min_balance_threshold {
            info!(idle = %idle, min = %self.settings.min_balance_threshold, "Idle balance below threshold");
            return Ok(skipped(SkipReason::InsufficientBalance));
        }

        // -- Market data --
        let analysis = data::collect(&self.providers).await;
        let Some(best) = analysis.best_for(&self.settings.primary_asset).cloned() else {
            warn!(asset = %self.settings.primary_asset, "No market data for primary asset");
            return Ok(skipped(SkipReason::NoMarketData));
        };
        if let Err(e) = self.knowledge.add_market_pattern(
            "lending_rates",
            json!({
                "apy": analysis.apy_table(),
                "best": best.key,
                "best_apy": best.apy,
                "tvl": analysis.protocol_tvl(),
            }),
        ) {
            warn!(error = %e, "Failed to record market pattern");
        }
        if best.apy < self.settings.min_yield_threshold {
            info!(best = %best.key, apy = best.apy, min = self.settings.min_yield_threshold, "Best yield below threshold");
            return Ok(skipped(SkipReason::YieldBelowThreshold));
        }

        // -- Draft --
        let market = MarketContext {
            opportunities: analysis.apy_table(),
            best_strategy: best.key.clone(),
            best_apy: best.apy,
            asset: self.settings.primary_asset.clone(),
            idle_balance: idle,
            total_assets: balance.total_human(),
            timestamp: Utc::now(),
        };
        let history = self
            .knowledge
            .get_context(self.settings.history_context_limit)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Knowledge store unreadable, planning without history");
                Default::default()
            });
        let draft = match self.planner.generate_strategy(&market, &history).await {
            Ok(s) => s,
            Err(e) => {
                warn!(planner = self.planner.name(), error = %e, "Planner failed, using baseline draft");
                baseline_strategy(&market)
            }
        };

        // -- Enrich --
        let Some(plan) = plan_deployment(
            &balance,
            self.settings.deploy_fraction,
            &best.key,
            best.apy,
            &self.settings.primary_asset,
            self.engine.book(),
        ) else {
            return Ok(skipped(SkipReason::NoDeployedStrategy));
        };
        if plan.amount.is_zero() {
            return Ok(skipped(SkipReason::InsufficientBalance));
        }
        let strategy = enrich(draft, &plan);

        // -- Risk gate --
        let assessment = self.scorer.assess(&strategy).await;
        if !is_safe_score(assessment.risk_score, self.settings.acceptance_threshold) {
            warn!(
                protocol = %strategy.target_protocol,
                risk_score = assessment.risk_score,
                threshold = self.settings.acceptance_threshold,
                "Strategy rejected"
            );
            let event = RiskEvent {
                event_type: "strategy_rejected".into(),
                protocol: strategy.target_protocol.clone(),
                contract: assessment.contract.clone(),
                risk_score: assessment.risk_score,
                risk_level: assessment.risk_level,
                details: Some(format!(
                    "score {:.3} not below threshold {:.3}",
                    assessment.risk_score, self.settings.acceptance_threshold
                )),
            };
            if let Err(e) = self.knowledge.add_risk_event(event) {
                warn!(error = %e, "Failed to record risk event");
            }
            return Ok(PrimaryOutcome::Rejected {
                risk_score: assessment.risk_score,
            });
        }

        // -- Execute --
        let execution = self.engine.execute(&strategy).await;
        let tx_hashes: Vec<String> = execution
            .actions
            .iter()
            .flat_map(|a| a.tx_hashes.iter().map(|h| format!("{h:?}")))
            .collect();
        let outcome = StrategyOutcome {
            success: execution.success,
            risk_score: assessment.risk_score,
            expected_apr: strategy.expected_outcome.apr,
            deployed_amount: execution.success.then_some(plan.amount_human),
            tx_hashes,
            error: execution.error.clone(),
        };
        if let Err(e) = self.knowledge.add_outcome(&strategy, outcome) {
            warn!(error = %e, "Failed to record strategy outcome");
        }

        if execution.success {
            info!(
                strategy = %plan.strategy_key,
                amount = %plan.amount_human,
                risk_score = assessment.risk_score,
                txs = execution.transactions_submitted(),
                "Strategy executed"
            );
        } else {
            error!(strategy = %plan.strategy_key, error = ?execution.error, "Strategy execution failed");
        }

        Ok(PrimaryOutcome::Executed {
            success: execution.success,
            risk_score: assessment.risk_score,
            expected_apr: strategy.expected_outcome.apr,
            deployed_amount: if execution.success { plan.amount_human } else { Decimal::ZERO },
        })
    }

    /// Vault address the primary flow operates on.
    pub fn primary_vault(&self) -> Address {
        self.engine.book().base_vault
    }
}

fn skipped(reason: SkipReason) -> PrimaryOutcome {
    PrimaryOutcome::Skipped { reason }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
