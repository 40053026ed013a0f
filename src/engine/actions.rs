//! Typed action dispatch.
//!
//! Each [`Action`] is parsed into an [`ActionCall`] before any network
//! I/O. Parsing checks every address and amount, so a malformed strategy
//! fails as a `Validation` error with nothing submitted. A parsed call
//! expands into the concrete contract calls the engine submits.

use ethers::types::{Address, Bytes, U256};
use serde_json::{Map, Value};

use crate::chain::{abi, Chain};
use crate::engine::contracts::ContractBook;
use crate::types::{Action, ActionType, OptimizerError};

/// One transaction to build, sign and submit.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCall {
    pub chain: Chain,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Gas table entry used for the limit.
    pub gas_key: ActionType,
    pub label: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionCall {
    ClaimAndOptimize {
        wrapper: Address,
        royalty_vault: Address,
        tokens: Vec<Address>,
    },
    DeployToStrategy {
        vault: Address,
        strategy: Address,
        amount: U256,
    },
    Rebalance {
        vault: Address,
        current: Address,
        target: Address,
        amount: U256,
    },
    Harvest {
        vault: Address,
        strategy: Address,
    },
    EmergencyExit {
        wrapper: Address,
        royalty_vault: Address,
    },
    CrossChainDeploy {
        vault: Address,
        target_chain_id: U256,
        amount: U256,
        strategy_data: Bytes,
    },
    /// Enabled by the vault owner on-chain; nothing for us to send.
    EnableOptimization { royalty_vault: Address },
    ClaimEnhancedRoyalties {
        wrapper: Address,
        royalty_vault: Address,
        tokens: Vec<Address>,
    },
}

impl ActionCall {
    pub fn parse(action: &Action, book: &ContractBook) -> Result<Self, OptimizerError> {
        let p = Params {
            action_type: action.action_type,
            map: &action.parameters,
        };

        let call = match action.action_type {
            ActionType::ClaimAndOptimize => ActionCall::ClaimAndOptimize {
                wrapper: p.optional_address("wrapper_contract")?.unwrap_or(book.royalty_wrapper),
                royalty_vault: p.address("royalty_vault")?,
                tokens: p.address_list("tokens")?.unwrap_or_else(|| vec![book.usdc]),
            },
            ActionType::DeployToStrategy => ActionCall::DeployToStrategy {
                vault: p.vault(book)?,
                strategy: p.address("strategy")?,
                amount: p.amount("amount")?,
            },
            ActionType::RebalanceStrategies => ActionCall::Rebalance {
                vault: p.vault(book)?,
                current: p.address("current_strategy")?,
                target: p.address("target_strategy")?,
                amount: p.optional_amount("amount")?.unwrap_or_default(),
            },
            ActionType::HarvestStrategy => ActionCall::Harvest {
                vault: p.vault(book)?,
                strategy: p.address("strategy")?,
            },
            ActionType::EmergencyExit => ActionCall::EmergencyExit {
                wrapper: p.optional_address("wrapper_contract")?.unwrap_or(book.royalty_wrapper),
                royalty_vault: p.address("royalty_vault")?,
            },
            ActionType::CrossChainDeploy => ActionCall::CrossChainDeploy {
                vault: p.vault(book)?,
                target_chain_id: p.amount_either("chain_id", "target_chain_id")?,
                amount: p.amount("amount")?,
                strategy_data: p.bytes("strategy_data")?,
            },
            ActionType::EnableYieldOptimization => ActionCall::EnableOptimization {
                royalty_vault: p.address("royalty_vault")?,
            },
            ActionType::ClaimEnhancedRoyalties => ActionCall::ClaimEnhancedRoyalties {
                wrapper: p.optional_address("wrapper_contract")?.unwrap_or(book.royalty_wrapper),
                royalty_vault: p.address("royalty_vault")?,
                tokens: p.address_list("tokens")?.unwrap_or_else(|| vec![book.usdc]),
            },
        };
        Ok(call)
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            ActionCall::ClaimAndOptimize { .. } => ActionType::ClaimAndOptimize,
            ActionCall::DeployToStrategy { .. } => ActionType::DeployToStrategy,
            ActionCall::Rebalance { .. } => ActionType::RebalanceStrategies,
            ActionCall::Harvest { .. } => ActionType::HarvestStrategy,
            ActionCall::EmergencyExit { .. } => ActionType::EmergencyExit,
            ActionCall::CrossChainDeploy { .. } => ActionType::CrossChainDeploy,
            ActionCall::EnableOptimization { .. } => ActionType::EnableYieldOptimization,
            ActionCall::ClaimEnhancedRoyalties { .. } => ActionType::ClaimEnhancedRoyalties,
        }
    }

    /// Expand into contract calls, in submission order.
    pub fn calls(&self, book: &ContractBook, bridge_fee: U256) -> Vec<ContractCall> {
        let empty = Bytes::new();
        match self {
            ActionCall::ClaimAndOptimize { wrapper, royalty_vault, tokens } => vec![ContractCall {
                chain: Chain::Story,
                to: *wrapper,
                data: abi::claim_and_optimize(*royalty_vault, tokens),
                value: U256::zero(),
                gas_key: ActionType::ClaimAndOptimize,
                label: "claimAndOptimize",
            }],
            ActionCall::DeployToStrategy { vault, strategy, amount } => vec![ContractCall {
                chain: book.chain_for_strategy(*strategy),
                to: *vault,
                data: abi::deposit_to_strategy(*strategy, *amount, &empty),
                value: U256::zero(),
                gas_key: ActionType::DeployToStrategy,
                label: "depositToStrategy",
            }],
            ActionCall::Rebalance { vault, current, target, amount } => vec![
                ContractCall {
                    chain: book.chain_for_strategy(*current),
                    to: *vault,
                    data: abi::harvest_strategy(*current, &empty),
                    value: U256::zero(),
                    gas_key: ActionType::HarvestStrategy,
                    label: "harvestStrategy",
                },
                ContractCall {
                    chain: book.chain_for_strategy(*target),
                    to: *vault,
                    data: abi::deposit_to_strategy(*target, *amount, &empty),
                    value: U256::zero(),
                    gas_key: ActionType::DeployToStrategy,
                    label: "depositToStrategy",
                },
            ],
            ActionCall::Harvest { vault, strategy } => vec![ContractCall {
                chain: book.chain_for_strategy(*strategy),
                to: *vault,
                data: abi::harvest_strategy(*strategy, &empty),
                value: U256::zero(),
                gas_key: ActionType::HarvestStrategy,
                label: "harvestStrategy",
            }],
            ActionCall::EmergencyExit { wrapper, royalty_vault } => vec![ContractCall {
                chain: Chain::Story,
                to: *wrapper,
                data: abi::emergency_exit(*royalty_vault),
                value: U256::zero(),
                gas_key: ActionType::EmergencyExit,
                label: "emergencyExit",
            }],
            ActionCall::CrossChainDeploy {
                vault,
                target_chain_id,
                amount,
                strategy_data,
            } => vec![ContractCall {
                chain: Chain::Story,
                to: *vault,
                data: abi::deploy_to_chain(*target_chain_id, *amount, strategy_data),
                value: bridge_fee,
                gas_key: ActionType::CrossChainDeploy,
                label: "deployToChain",
            }],
            ActionCall::EnableOptimization { .. } => Vec::new(),
            ActionCall::ClaimEnhancedRoyalties { wrapper, royalty_vault, tokens } => vec![ContractCall {
                chain: Chain::Story,
                to: *wrapper,
                data: abi::claim_enhanced_revenue(*royalty_vault, tokens),
                value: U256::zero(),
                gas_key: ActionType::ClaimEnhancedRoyalties,
                label: "claimEnhancedRevenue",
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter extraction
// ---------------------------------------------------------------------------

struct Params<'a> {
    action_type: ActionType,
    map: &'a Map<String, Value>,
}

impl Params<'_> {
    fn invalid(&self, key: &str, what: impl std::fmt::Display) -> OptimizerError {
        OptimizerError::Validation(format!("{}: parameter '{key}' {what}", self.action_type))
    }

    fn optional_address(&self, key: &str) -> Result<Option<Address>, OptimizerError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<Address>()
                .map(Some)
                .map_err(|_| self.invalid(key, format!("is not an address: '{s}'"))),
            Some(other) => Err(self.invalid(key, format!("is not an address: {other}"))),
        }
    }

    fn address(&self, key: &str) -> Result<Address, OptimizerError> {
        self.optional_address(key)?
            .ok_or_else(|| self.invalid(key, "is required"))
    }

    /// `vault` or `vault_address`, defaulting to the primary vault.
    fn vault(&self, book: &ContractBook) -> Result<Address, OptimizerError> {
        match self.optional_address("vault")? {
            Some(v) => Ok(v),
            None => Ok(self.optional_address("vault_address")?.unwrap_or(book.base_vault)),
        }
    }

    fn address_list(&self, key: &str) -> Result<Option<Vec<Address>>, OptimizerError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .and_then(|s| s.trim().parse::<Address>().ok())
                        .ok_or_else(|| self.invalid(key, format!("contains a non-address: {item}")))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(other) => Err(self.invalid(key, format!("is not a list: {other}"))),
        }
    }

    /// Base-unit integer given as a JSON integer or a decimal/hex string.
    fn optional_amount(&self, key: &str) -> Result<Option<U256>, OptimizerError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|v| Some(U256::from(v)))
                .ok_or_else(|| self.invalid(key, format!("must be a non-negative integer, got {n}"))),
            Some(Value::String(s)) => {
                let s = s.trim();
                let parsed = match s.strip_prefix("0x") {
                    Some(hex) => U256::from_str_radix(hex, 16).ok(),
                    None => U256::from_dec_str(s).ok(),
                };
                parsed
                    .map(Some)
                    .ok_or_else(|| self.invalid(key, format!("is not an integer amount: '{s}'")))
            }
            Some(other) => Err(self.invalid(key, format!("is not an amount: {other}"))),
        }
    }

    fn amount(&self, key: &str) -> Result<U256, OptimizerError> {
        self.optional_amount(key)?
            .ok_or_else(|| self.invalid(key, "is required"))
    }

    /// `key`, or `alias` when `key` is absent.
    fn amount_either(&self, key: &str, alias: &str) -> Result<U256, OptimizerError> {
        match self.optional_amount(key)? {
            Some(v) => Ok(v),
            None => self
                .optional_amount(alias)?
                .ok_or_else(|| self.invalid(key, "is required")),
        }
    }

    fn bytes(&self, key: &str) -> Result<Bytes, OptimizerError> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(Bytes::new()),
            Some(Value::String(s)) if s.is_empty() || s == "0x" => Ok(Bytes::new()),
            Some(Value::String(s)) => s
                .parse::<Bytes>()
                .map_err(|_| self.invalid(key, "is not hex bytes")),
            Some(other) => Err(self.invalid(key, format!("is not hex bytes: {other}"))),
        }
    }
}
