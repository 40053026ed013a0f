//! Chain access.
//!
//! The engine, registry and market-data providers talk to chains only
//! through the [`ChainClient`] trait. [`evm::EvmClient`] is the live
//! ethers-backed implementation, [`simulated::SimulatedChain`] the
//! in-memory one used for dry runs and tests.

pub mod abi;
pub mod evm;
pub mod simulated;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Chain identifiers
// ---------------------------------------------------------------------------

/// The fixed set of chains the optimizer routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Hosts the royalty wrapper and IP royalty vaults.
    Story,
    /// Hosts the primary vault and strategy contracts.
    Ethereum,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Story => write!(f, "story"),
            Chain::Ethereum => write!(f, "ethereum"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("RPC error on {chain}: {message}")]
    Rpc { chain: Chain, message: String },

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Transaction {0:?} reverted")]
    Reverted(H256),

    #[error("No receipt for {tx:?} after {secs}s")]
    Timeout { tx: H256, secs: u64 },

    #[error("Malformed return data: {0}")]
    Decode(String),

    #[error("No client configured for {0}")]
    NotConfigured(Chain),
}

impl ChainError {
    pub fn rpc(chain: Chain, err: impl fmt::Display) -> Self {
        ChainError::Rpc {
            chain,
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Minimal receipt view the engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub success: bool,
    pub gas_used: U256,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain(&self) -> Chain;

    /// Address transactions are signed with, if a key is loaded.
    fn signer(&self) -> Option<Address>;

    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn gas_price(&self) -> Result<U256, ChainError>;

    /// Pending transaction count, used as the next nonce.
    async fn transaction_count(&self, address: Address) -> Result<U256, ChainError>;

    async fn balance(&self, address: Address) -> Result<U256, ChainError>;

    async fn code(&self, address: Address) -> Result<Bytes, ChainError>;

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError>;

    /// Sign and broadcast. Returns the transaction hash.
    async fn send_transaction(&self, tx: TransactionRequest) -> Result<H256, ChainError>;

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, ChainError>;
}

/// Clients keyed by chain.
pub type ChainMap = BTreeMap<Chain, Arc<dyn ChainClient>>;
