//! Strategy drafting.
//!
//! A [`StrategyPlanner`] turns the current market picture and recent
//! history into a draft [`Strategy`]. The draft is untrusted: it is
//! validated here and the orchestrator replaces its actions before
//! anything reaches the chain.

pub mod openai;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map};
use std::collections::BTreeMap;

use crate::storage::knowledge::HistoricalContext;
use crate::types::{Action, ActionType, ExpectedOutcome, OptimizerError, Strategy, StrategyDraft};

/// Market picture handed to the planner.
#[derive(Debug, Clone, Serialize)]
pub struct MarketContext {
    /// Fractional APY per strategy key (`aave_usdc` -> 0.06).
    pub opportunities: BTreeMap<String, f64>,
    pub best_strategy: String,
    pub best_apy: f64,
    /// Primary vault asset symbol.
    pub asset: String,
    pub idle_balance: Decimal,
    pub total_assets: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait StrategyPlanner: Send + Sync {
    async fn generate_strategy(&self, market: &MarketContext, history: &HistoricalContext) -> Result<Strategy>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Deterministic draft: supply into the best-yielding market.
pub fn baseline_strategy(market: &MarketContext) -> Strategy {
    let mut params = Map::new();
    params.insert("strategy".into(), json!(market.best_strategy));
    Strategy {
        strategy_type: "yield_optimization".into(),
        target_protocol: market.best_strategy.clone(),
        actions: vec![Action::new(ActionType::DeployToStrategy, params)],
        expected_outcome: ExpectedOutcome {
            apr: market.best_apy,
            risk_level: "low".into(),
        },
        vault_address: None,
    }
}

/// Planner used when no LLM is configured.
pub struct BaselinePlanner;

#[async_trait]
impl StrategyPlanner for BaselinePlanner {
    async fn generate_strategy(&self, market: &MarketContext, _history: &HistoricalContext) -> Result<Strategy> {
        Ok(baseline_strategy(market))
    }

    fn name(&self) -> &str {
        "baseline"
    }
}

// ---------------------------------------------------------------------------
// Prompt and response handling
// ---------------------------------------------------------------------------

pub fn system_prompt() -> &'static str {
    "You are a DeFi yield strategist for a pooled custodial vault. \
     You only propose supplying into audited lending markets and you answer \
     with a single JSON object and nothing else."
}

pub fn format_prompt(market: &MarketContext, history: &HistoricalContext) -> String {
    let market_json = serde_json::to_string_pretty(market).unwrap_or_default();
    let history_json = serde_json::to_string_pretty(history).unwrap_or_default();
    let action_types: Vec<&str> = ActionType::ALL.iter().map(ActionType::as_str).collect();

    format!(
        "Based on the following market data and historical context, generate a DeFi strategy.\n\n\
         MARKET DATA:\n{market_json}\n\n\
         HISTORICAL CONTEXT:\n{history_json}\n\n\
         The strategy must maximise yield while staying safe, reflect current market \
         conditions, avoid protocols with recent risk events, and be executable within \
         current gas constraints.\n\n\
         Allowed action_type values: {}.\n\
         `target_protocol` must be one of the market keys above. \
         `expected_outcome.apr` is a fraction (0.06 for 6%).\n\n\
         Respond with JSON of exactly this shape:\n\
         {{\n  \"strategy_type\": \"string\",\n  \"target_protocol\": \"string\",\n  \
         \"actions\": [{{\"action_type\": \"string\", \"parameters\": {{}}}}],\n  \
         \"expected_outcome\": {{\"apr\": 0.0, \"risk_level\": \"string\"}}\n}}\n",
        action_types.join(", ")
    )
}

/// The outermost `{...}` span of `text`, for models that wrap JSON in prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse model output into a validated strategy.
pub fn parse_strategy(text: &str) -> Result<Strategy, OptimizerError> {
    let draft: StrategyDraft = match serde_json::from_str(text.trim()) {
        Ok(d) => d,
        Err(_) => {
            let body = extract_json(text)
                .ok_or_else(|| OptimizerError::StrategyFormat("no JSON object in response".into()))?;
            serde_json::from_str(body).map_err(|e| OptimizerError::StrategyFormat(e.to_string()))?
        }
    };
    Strategy::try_from(draft).map_err(|e| match e {
        OptimizerError::Validation(msg) => OptimizerError::StrategyFormat(msg),
        other => other,
    })
}
