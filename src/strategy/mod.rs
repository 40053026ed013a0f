//! Strategy enrichment.
//!
//! Planner drafts carry intent only: a target protocol and an expected
//! outcome. Before scoring, the draft's actions are replaced with one
//! concrete `deploy_to_strategy` sized from the vault's idle balance and
//! pointed at a contract from the contract book.

use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use serde_json::{json, Map};
use tracing::{info, warn};

use crate::engine::contracts::ContractBook;
use crate::types::{from_base_units, to_base_units, Action, ActionType, Strategy, VaultBalance};

pub const ENRICHED_STRATEGY_TYPE: &str = "vault_yield_optimization";

/// A sized deposit into one strategy contract.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentPlan {
    pub strategy_key: String,
    pub strategy_address: Address,
    pub vault: Address,
    pub asset_symbol: String,
    /// Base units of the vault asset.
    pub amount: U256,
    pub amount_human: Decimal,
    /// Fractional APY of the chosen market.
    pub target_apy: f64,
}

/// Size a deposit of `fraction` of idle funds into the strategy named
/// `strategy_key`. `None` when that strategy has no deployed contract.
pub fn plan_deployment(
    balance: &VaultBalance,
    fraction: Decimal,
    strategy_key: &str,
    target_apy: f64,
    asset_symbol: &str,
    book: &ContractBook,
) -> Option<DeploymentPlan> {
    let Some(contract) = book.strategy(strategy_key) else {
        warn!(strategy = %strategy_key, "No deployed contract for strategy");
        return None;
    };

    let wanted = balance.idle_human() * fraction;
    let amount = to_base_units(wanted, balance.decimals).unwrap_or_default();
    let amount_human = from_base_units(amount, balance.decimals).unwrap_or_default();

    info!(
        strategy = %strategy_key,
        contract = ?contract.address,
        amount = %amount_human,
        asset = %asset_symbol,
        "Planning deployment"
    );

    Some(DeploymentPlan {
        strategy_key: strategy_key.to_string(),
        strategy_address: contract.address,
        vault: balance.vault,
        asset_symbol: asset_symbol.to_string(),
        amount,
        amount_human,
        target_apy,
    })
}

/// Replace the draft's actions with the planned deposit.
pub fn enrich(mut draft: Strategy, plan: &DeploymentPlan) -> Strategy {
    let mut params = Map::new();
    params.insert("vault_address".into(), json!(format!("{:?}", plan.vault)));
    params.insert("token".into(), json!(plan.asset_symbol));
    params.insert("amount".into(), json!(plan.amount.to_string()));
    params.insert("strategy".into(), json!(format!("{:?}", plan.strategy_address)));
    params.insert("target_apy".into(), json!(plan.target_apy));

    draft.actions = vec![Action::new(ActionType::DeployToStrategy, params)];
    draft.strategy_type = ENRICHED_STRATEGY_TYPE.to_string();
    draft.vault_address = Some(format!("{:?}", plan.vault));
    draft
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContractsConfig, StrategyContractConfig};
    use crate::engine::actions::ActionCall;
    use crate::chain::Chain;
    use crate::types::ExpectedOutcome;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    const VAULT: Address = Address::repeat_byte(0x22);

    fn make_book() -> ContractBook {
        let cfg = ContractsConfig {
            royalty_wrapper: format!("{:?}", Address::repeat_byte(0x11)),
            base_vault: format!("{:?}", VAULT),
            usdc: format!("{:?}", Address::repeat_byte(0x33)),
            strategies: HashMap::from([(
                "aave_usdc".to_string(),
                StrategyContractConfig {
                    address: Some(format!("{:?}", Address::repeat_byte(0x44))),
                    address_env: None,
                    chain: Chain::Ethereum,
                },
            )]),
            deposit_proxy: None,
        };
        ContractBook::from_config(&cfg).unwrap()
    }

    fn make_balance(idle: u64) -> VaultBalance {
        VaultBalance {
            vault: VAULT,
            asset: Address::repeat_byte(0x33),
            decimals: 6,
            total_assets: U256::from(idle),
            total_supply: U256::from(idle),
            idle: U256::from(idle),
            deployed: U256::zero(),
        }
    }

    fn make_draft() -> Strategy {
        Strategy {
            strategy_type: "yield_optimization".into(),
            target_protocol: "aave".into(),
            actions: vec![],
            expected_outcome: ExpectedOutcome {
                apr: 0.06,
                risk_level: "low".into(),
            },
            vault_address: None,
        }
    }

    #[test]
    fn test_plan_deploys_eighty_percent() {
        let plan = plan_deployment(&make_balance(1_000_000_000), dec!(0.8), "aave_usdc", 0.06, "USDC", &make_book()).unwrap();
        assert_eq!(plan.amount, U256::from(800_000_000u64));
        assert_eq!(plan.amount_human, dec!(800));
        assert_eq!(plan.strategy_address, Address::repeat_byte(0x44));
    }

    #[test]
    fn test_plan_truncates_dust() {
        let plan = plan_deployment(&make_balance(1_000_001), dec!(0.8), "aave_usdc", 0.06, "USDC", &make_book()).unwrap();
        assert_eq!(plan.amount, U256::from(800_000u64));
    }

    #[test]
    fn test_plan_without_contract() {
        assert!(plan_deployment(&make_balance(1_000_000_000), dec!(0.8), "compound_usdc", 0.05, "USDC", &make_book()).is_none());
    }

    #[test]
    fn test_enrich_replaces_actions() {
        let book = make_book();
        let plan = plan_deployment(&make_balance(1_000_000_000), dec!(0.8), "aave_usdc", 0.06, "USDC", &book).unwrap();
        let mut draft = make_draft();
        draft.actions.push(Action::new(ActionType::EmergencyExit, Map::new()));

        let s = enrich(draft, &plan);
        assert_eq!(s.strategy_type, ENRICHED_STRATEGY_TYPE);
        assert_eq!(s.target_protocol, "aave");
        assert_eq!(s.actions.len(), 1);
        assert_eq!(s.actions[0].action_type, ActionType::DeployToStrategy);
        assert_eq!(s.actions[0].param_str("amount"), Some("800000000"));
        assert_eq!(s.vault_address.as_deref(), Some(format!("{:?}", VAULT).as_str()));

        // The enriched action must parse into a concrete call.
        match ActionCall::parse(&s.actions[0], &book).unwrap() {
            ActionCall::DeployToStrategy { vault, strategy, amount } => {
                assert_eq!(vault, VAULT);
                assert_eq!(strategy, Address::repeat_byte(0x44));
                assert_eq!(amount, U256::from(800_000_000u64));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }
}
