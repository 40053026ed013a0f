//! Immutable contract address book, loaded once at startup.

use ethers::types::Address;
use std::collections::BTreeMap;

use crate::chain::Chain;
use crate::config::{parse_address, ContractsConfig};
use crate::types::OptimizerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyContract {
    pub address: Address,
    pub chain: Chain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractBook {
    pub royalty_wrapper: Address,
    pub base_vault: Address,
    pub usdc: Address,
    /// Deployed strategies keyed by strategy name (`aave_usdc`).
    pub strategies: BTreeMap<String, StrategyContract>,
}

impl ContractBook {
    pub fn from_config(cfg: &ContractsConfig) -> Result<Self, OptimizerError> {
        let mut strategies = BTreeMap::new();
        for (name, entry) in &cfg.strategies {
            // Strategies without an address are known but not yet deployed.
            if let Some(addr) = entry.resolve_address() {
                let address = parse_address(&format!("contracts.strategies.{name}"), &addr)?;
                strategies.insert(
                    name.clone(),
                    StrategyContract {
                        address,
                        chain: entry.chain,
                    },
                );
            }
        }

        Ok(Self {
            royalty_wrapper: parse_address("contracts.royalty_wrapper", &cfg.royalty_wrapper)?,
            base_vault: parse_address("contracts.base_vault", &cfg.base_vault)?,
            usdc: parse_address("contracts.usdc", &cfg.usdc)?,
            strategies,
        })
    }

    pub fn strategy(&self, name: &str) -> Option<StrategyContract> {
        self.strategies.get(name).copied()
    }

    /// Chain hosting a strategy contract. Unknown addresses route to Ethereum.
    pub fn chain_for_strategy(&self, address: Address) -> Chain {
        self.strategies
            .values()
            .find(|s| s.address == address)
            .map_or(Chain::Ethereum, |s| s.chain)
    }

    /// Every configured contract with the chain it lives on.
    pub fn all(&self) -> Vec<(String, Chain, Address)> {
        let mut out = vec![
            ("royalty_wrapper".to_string(), Chain::Story, self.royalty_wrapper),
            ("base_vault".to_string(), Chain::Ethereum, self.base_vault),
            ("usdc".to_string(), Chain::Ethereum, self.usdc),
        ];
        out.extend(
            self.strategies
                .iter()
                .map(|(name, s)| (name.clone(), s.chain, s.address)),
        );
        out
    }
}
