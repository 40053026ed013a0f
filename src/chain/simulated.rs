//! In-memory chain for dry runs and tests.
//!
//! Calls are answered from scripted responses, every submitted
//! transaction is recorded, and each head-block query mines one block so
//! confirmation polling always makes progress.

use async_trait::async_trait;
use ethers::types::{Address, Bytes, NameOrAddress, TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::abi;
use super::{Chain, ChainClient, ChainError, Receipt};

/// Scripted outcome for an upcoming submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionFault {
    /// Mined normally.
    Accept,
    /// The node refuses the transaction.
    Reject,
    /// Mined with failure status.
    Revert,
    /// Accepted but never mined.
    Drop,
}

#[derive(Default)]
struct SimState {
    head: u64,
    gas_price: U256,
    unreachable: bool,
    nonces: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    code: HashMap<Address, Bytes>,
    exact_calls: HashMap<(Address, Vec<u8>), Bytes>,
    selector_calls: HashMap<(Address, [u8; 4]), Bytes>,
    faults: VecDeque<SubmissionFault>,
    submitted: Vec<TransactionRequest>,
    receipts: HashMap<H256, Receipt>,
    sweeps: HashMap<(Address, [u8; 4]), Sweep>,
}

/// Token movement applied when a matching call is mined successfully.
#[derive(Debug, Clone, Copy)]
struct Sweep {
    token: Address,
    from: Address,
    to: Address,
}

impl SimState {
    fn token_balance(&self, token: Address, holder: Address) -> U256 {
        self.exact_calls
            .get(&(token, abi::balance_of(holder).to_vec()))
            .and_then(|b| abi::decode_uint(b).ok())
            .unwrap_or_default()
    }

    fn set_token_balance(&mut self, token: Address, holder: Address, amount: U256) {
        self.exact_calls
            .insert((token, abi::balance_of(holder).to_vec()), abi::encode_uint(amount));
    }

    /// Move the sender's whole token balance; a vault also grows its total assets.
    fn apply_sweep(&mut self, sweep: Sweep) {
        let amount = self.token_balance(sweep.token, sweep.from);
        if amount.is_zero() {
            return;
        }
        let credited = self.token_balance(sweep.token, sweep.to) + amount;
        self.set_token_balance(sweep.token, sweep.from, U256::zero());
        self.set_token_balance(sweep.token, sweep.to, credited);

        let total_assets = (sweep.to, abi::selector(abi::TOTAL_ASSETS));
        if let Some(total) = self.selector_calls.get(&total_assets).and_then(|b| abi::decode_uint(b).ok()) {
            self.selector_calls.insert(total_assets, abi::encode_uint(total + amount));
        }
    }
}

pub struct SimulatedChain {
    chain: Chain,
    chain_id: u64,
    signer: Option<Address>,
    state: Mutex<SimState>,
}

const CONTRACT_STUB: &[u8] = &[0x60, 0x80, 0x60, 0x40];

impl SimulatedChain {
    pub fn new(chain: Chain) -> Self {
        let chain_id = match chain {
            Chain::Story => 1514,
            Chain::Ethereum => 1,
        };
        Self {
            chain,
            chain_id,
            signer: None,
            state: Mutex::new(SimState {
                head: 1_000,
                gas_price: U256::from(20_000_000_000u64),
                ..SimState::default()
            }),
        }
    }

    pub fn with_signer(mut self, signer: Address) -> Self {
        self.signer = Some(signer);
        self
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        // A poisoned lock only means a test panicked mid-update.
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    // -- Scripting ----------------------------------------------------------

    pub fn set_gas_price(&self, price: U256) {
        self.with_state(|s| s.gas_price = price);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.with_state(|s| s.unreachable = unreachable);
    }

    pub fn set_native_balance(&self, address: Address, amount: U256) {
        self.with_state(|s| {
            s.balances.insert(address, amount);
        });
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.with_state(|s| {
            s.code.insert(address, code);
        });
    }

    /// Answer `call(to, calldata)` with `response`.
    pub fn set_call_response(&self, to: Address, calldata: Bytes, response: Bytes) {
        self.with_state(|s| {
            s.exact_calls.insert((to, calldata.to_vec()), response);
        });
    }

    /// Answer any call to `to` with the given function selector.
    pub fn set_selector_response(&self, to: Address, signature: &str, response: Bytes) {
        let sel = abi::selector(signature);
        self.with_state(|s| {
            s.selector_calls.insert((to, sel), response);
        });
    }

    /// Deploy an ERC-20 with zero balances for every holder.
    pub fn set_erc20(&self, token: Address, name: &str, symbol: &str, decimals: u8, total_supply: U256) {
        self.set_code(token, Bytes::from_static(CONTRACT_STUB));
        self.set_selector_response(token, abi::NAME, abi::encode_string(name));
        self.set_selector_response(token, abi::SYMBOL, abi::encode_string(symbol));
        self.set_selector_response(token, abi::DECIMALS, abi::encode_uint(U256::from(decimals)));
        self.set_selector_response(token, abi::TOTAL_SUPPLY, abi::encode_uint(total_supply));
        self.set_selector_response(token, abi::BALANCE_OF, abi::encode_uint(U256::zero()));
    }

    pub fn set_token_balance(&self, token: Address, holder: Address, amount: U256) {
        self.set_call_response(token, abi::balance_of(holder), abi::encode_uint(amount));
    }

    /// Deploy an ERC-4626 vault over `asset` whose idle holdings are
    /// `idle` and whose total assets are `total_assets`.
    pub fn set_vault(&self, vault: Address, asset: Address, total_assets: U256, idle: U256) {
        self.set_code(vault, Bytes::from_static(CONTRACT_STUB));
        self.set_selector_response(vault, abi::TOTAL_ASSETS, abi::encode_uint(total_assets));
        self.set_selector_response(vault, abi::TOTAL_SUPPLY, abi::encode_uint(total_assets));
        self.set_selector_response(vault, abi::ASSET, abi::encode_address(asset));
        self.set_token_balance(asset, vault, idle);
    }

    /// Deploy a deposit proxy holding `pending` of `token`. A mined
    /// `autoDeposit()` moves its whole balance into `vault`.
    pub fn set_deposit_proxy(&self, proxy: Address, token: Address, vault: Address, pending: U256) {
        self.set_code(proxy, Bytes::from_static(CONTRACT_STUB));
        self.set_token_balance(token, proxy, pending);
        self.with_state(|s| {
            s.sweeps.insert(
                (proxy, abi::selector(abi::AUTO_DEPOSIT)),
                Sweep {
                    token,
                    from: proxy,
                    to: vault,
                },
            );
        });
    }

    /// Queue outcomes for the next submissions, in order.
    pub fn script_faults(&self, faults: impl IntoIterator<Item = SubmissionFault>) {
        self.with_state(|s| s.faults.extend(faults));
    }

    // -- Inspection ---------------------------------------------------------

    /// Every transaction handed to `send_transaction`, including rejected ones.
    pub fn submitted(&self) -> Vec<TransactionRequest> {
        self.with_state(|s| s.submitted.clone())
    }

    pub fn submission_count(&self) -> usize {
        self.with_state(|s| s.submitted.len())
    }

    pub fn head(&self) -> u64 {
        self.with_state(|s| s.head)
    }

    fn check_reachable(&self, s: &SimState) -> Result<(), ChainError> {
        if s.unreachable {
            Err(ChainError::rpc(self.chain, "connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn signer(&self) -> Option<Address> {
        self.signer
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.with_state(|s| self.check_reachable(s))?;
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.with_state(|s| {
            self.check_reachable(s)?;
            s.head += 1;
            Ok(s.head)
        })
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        self.with_state(|s| {
            self.check_reachable(s)?;
            Ok(s.gas_price)
        })
    }

    async fn transaction_count(&self, address: Address) -> Result<U256, ChainError> {
        self.with_state(|s| {
            self.check_reachable(s)?;
            Ok(U256::from(s.nonces.get(&address).copied().unwrap_or(0)))
        })
    }

    async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        self.with_state(|s| {
            self.check_reachable(s)?;
            Ok(s.balances.get(&address).copied().unwrap_or_default())
        })
    }

    async fn code(&self, address: Address) -> Result<Bytes, ChainError> {
        self.with_state(|s| {
            self.check_reachable(s)?;
            Ok(s.code.get(&address).cloned().unwrap_or_default())
        })
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.with_state(|s| {
            self.check_reachable(s)?;
            if let Some(resp) = s.exact_calls.get(&(to, data.to_vec())) {
                return Ok(resp.clone());
            }
            let sel: Option<[u8; 4]> = data.get(..4).and_then(|b| b.try_into().ok());
            sel.and_then(|sel| s.selector_calls.get(&(to, sel)).cloned())
                .ok_or_else(|| ChainError::rpc(self.chain, "execution reverted"))
        })
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<H256, ChainError> {
        self.with_state(|s| {
            self.check_reachable(s)?;
            s.submitted.push(tx.clone());
            let fault = s.faults.pop_front();
            if fault == Some(SubmissionFault::Reject) {
                return Err(ChainError::rpc(self.chain, "transaction underpriced"));
            }

            let sender = tx.from.or(self.signer).unwrap_or_default();
            *s.nonces.entry(sender).or_insert(0) += 1;

            let seed = format!("{}:{}:{:?}", self.chain, s.submitted.len(), tx.to);
            let tx_hash = H256::from(keccak256(seed.as_bytes()));

            if fault != Some(SubmissionFault::Drop) {
                if fault != Some(SubmissionFault::Revert) {
                    let to = recipient(&tx).unwrap_or_default();
                    let sel: Option<[u8; 4]> = tx.data.as_ref().and_then(|d| d.get(..4)).and_then(|b| b.try_into().ok());
                    if let Some(sweep) = sel.and_then(|sel| s.sweeps.get(&(to, sel)).copied()) {
                        s.apply_sweep(sweep);
                    }
                }
                s.head += 1;
                s.receipts.insert(
                    tx_hash,
                    Receipt {
                        tx_hash,
                        block_number: s.head,
                        success: fault != Some(SubmissionFault::Revert),
                        gas_used: tx.gas.unwrap_or_default(),
                    },
                );
            }
            Ok(tx_hash)
        })
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, ChainError> {
        self.with_state(|s| {
            self.check_reachable(s)?;
            Ok(s.receipts.get(&tx_hash).cloned())
        })
    }
}

/// Recipient of a recorded transaction, if it was a plain address.
pub fn recipient(tx: &TransactionRequest) -> Option<Address> {
    match tx.to.as_ref()? {
        NameOrAddress::Address(a) => Some(*a),
        NameOrAddress::Name(_) => None,
    }
}
