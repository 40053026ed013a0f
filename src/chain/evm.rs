//! Live EVM client backed by an ethers HTTP provider and a local wallet.

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, TransactionRequest, H256, U256};
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;
use tracing::{debug, info};

use super::{Chain, ChainClient, ChainError, Receipt};
use crate::types::OptimizerError;

pub struct EvmClient {
    chain: Chain,
    chain_id: u64,
    provider: Provider<Http>,
    wallet: Option<LocalWallet>,
}

impl EvmClient {
    /// Connect to `rpc_url`, reading the chain id once.
    ///
    /// An unreachable endpoint or a malformed key is a configuration
    /// error: nothing can run without them.
    pub async fn connect(
        chain: Chain,
        rpc_url: &str,
        signing_key: Option<&SecretString>,
    ) -> Result<Self, OptimizerError> {
        let provider = Provider::<Http>::try_from(rpc_url).map_err(|e| {
            OptimizerError::Configuration(format!("invalid RPC URL for {chain}: {e}"))
        })?;

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| OptimizerError::Configuration(format!("{chain} RPC unreachable: {e}")))?
            .as_u64();

        let wallet = match signing_key {
            Some(key) => Some(
                LocalWallet::from_str(key.expose_secret().trim())
                    .map_err(|e| OptimizerError::Configuration(format!("invalid signing key: {e}")))?
                    .with_chain_id(chain_id),
            ),
            None => None,
        };

        info!(
            chain = %chain,
            chain_id,
            signer = ?wallet.as_ref().map(|w| w.address()),
            "Connected to chain"
        );

        Ok(Self {
            chain,
            chain_id,
            provider,
            wallet,
        })
    }

    fn rpc(&self, err: impl std::fmt::Display) -> ChainError {
        ChainError::rpc(self.chain, err)
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn signer(&self) -> Option<Address> {
        self.wallet.as_ref().map(|w| w.address())
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let n = self.provider.get_block_number().await.map_err(|e| self.rpc(e))?;
        Ok(n.as_u64())
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        self.provider.get_gas_price().await.map_err(|e| self.rpc(e))
    }

    async fn transaction_count(&self, address: Address) -> Result<U256, ChainError> {
        self.provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| self.rpc(e))
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(|e| self.rpc(e))
    }

    async fn code(&self, address: Address) -> Result<Bytes, ChainError> {
        self.provider
            .get_code(address, None)
            .await
            .map_err(|e| self.rpc(e))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider.call(&tx, None).await.map_err(|e| self.rpc(e))
    }

    async fn send_transaction(&self, mut tx: TransactionRequest) -> Result<H256, ChainError> {
        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| ChainError::Signing(format!("no signing key loaded for {}", self.chain)))?;

        tx.chain_id = Some(self.chain_id.into());
        if tx.from.is_none() {
            tx.from = Some(wallet.address());
        }

        let typed: TypedTransaction = tx.into();
        let sig = wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        let raw = typed.rlp_signed(&sig);

        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| self.rpc(e))?;
        let tx_hash = pending.tx_hash();
        debug!(chain = %self.chain, tx = ?tx_hash, "Raw transaction broadcast");
        Ok(tx_hash)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.rpc(e))?;

        // A receipt without a block number is still pending.
        Ok(receipt.and_then(|r| {
            r.block_number.map(|block| Receipt {
                tx_hash,
                block_number: block.as_u64(),
                success: r.status.map_or(false, |s| s.as_u64() == 1),
                gas_used: r.gas_used.unwrap_or_default(),
            })
        }))
    }
}
