//! Calldata builders and return-data decoders for the contracts we touch.

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;

use super::ChainError;

pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

pub fn selector(signature: &str) -> [u8; 4] {
    id(signature)
}

fn address_array(tokens: &[Address]) -> Token {
    Token::Array(tokens.iter().copied().map(Token::Address).collect())
}

// ---------------------------------------------------------------------------
// Royalty wrapper
// ---------------------------------------------------------------------------

pub const CLAIM_AND_OPTIMIZE: &str = "claimAndOptimize(address,address[])";
pub const EMERGENCY_EXIT: &str = "emergencyExit(address)";
pub const CLAIM_ENHANCED_REVENUE: &str = "claimEnhancedRevenue(address,address[])";

pub fn claim_and_optimize(royalty_vault: Address, tokens: &[Address]) -> Bytes {
    encode_call(
        CLAIM_AND_OPTIMIZE,
        &[Token::Address(royalty_vault), address_array(tokens)],
    )
}

pub fn emergency_exit(royalty_vault: Address) -> Bytes {
    encode_call(EMERGENCY_EXIT, &[Token::Address(royalty_vault)])
}

pub fn claim_enhanced_revenue(royalty_vault: Address, tokens: &[Address]) -> Bytes {
    encode_call(
        CLAIM_ENHANCED_REVENUE,
        &[Token::Address(royalty_vault), address_array(tokens)],
    )
}

// ---------------------------------------------------------------------------
// Base vault
// ---------------------------------------------------------------------------

pub const DEPOSIT_TO_STRATEGY: &str = "depositToStrategy(address,uint256,bytes)";
pub const HARVEST_STRATEGY: &str = "harvestStrategy(address,bytes)";
pub const DEPLOY_TO_CHAIN: &str = "deployToChain(uint256,uint256,bytes)";
pub const TOTAL_ASSETS: &str = "totalAssets()";
pub const ASSET: &str = "asset()";

pub fn deposit_to_strategy(strategy: Address, amount: U256, data: &Bytes) -> Bytes {
    encode_call(
        DEPOSIT_TO_STRATEGY,
        &[
            Token::Address(strategy),
            Token::Uint(amount),
            Token::Bytes(data.to_vec()),
        ],
    )
}

pub fn harvest_strategy(strategy: Address, data: &Bytes) -> Bytes {
    encode_call(
        HARVEST_STRATEGY,
        &[Token::Address(strategy), Token::Bytes(data.to_vec())],
    )
}

pub fn deploy_to_chain(chain_id: U256, amount: U256, strategy_data: &Bytes) -> Bytes {
    encode_call(
        DEPLOY_TO_CHAIN,
        &[
            Token::Uint(chain_id),
            Token::Uint(amount),
            Token::Bytes(strategy_data.to_vec()),
        ],
    )
}

pub fn total_assets() -> Bytes {
    encode_call(TOTAL_ASSETS, &[])
}

pub fn asset() -> Bytes {
    encode_call(ASSET, &[])
}

/// Strategy contracts expose their deployed position as `getBalance()`.
pub const GET_BALANCE: &str = "getBalance()";

pub fn get_balance() -> Bytes {
    encode_call(GET_BALANCE, &[])
}

// ---------------------------------------------------------------------------
// Deposit proxy
// ---------------------------------------------------------------------------

/// Forwards the proxy's whole USDC balance into the vault it points at.
pub const AUTO_DEPOSIT: &str = "autoDeposit()";

pub fn auto_deposit() -> Bytes {
    encode_call(AUTO_DEPOSIT, &[])
}

// ---------------------------------------------------------------------------
// ERC-20
// ---------------------------------------------------------------------------

pub const NAME: &str = "name()";
pub const SYMBOL: &str = "symbol()";
pub const DECIMALS: &str = "decimals()";
pub const TOTAL_SUPPLY: &str = "totalSupply()";
pub const BALANCE_OF: &str = "balanceOf(address)";

pub fn name() -> Bytes {
    encode_call(NAME, &[])
}

pub fn symbol() -> Bytes {
    encode_call(SYMBOL, &[])
}

pub fn decimals() -> Bytes {
    encode_call(DECIMALS, &[])
}

pub fn total_supply() -> Bytes {
    encode_call(TOTAL_SUPPLY, &[])
}

pub fn balance_of(holder: Address) -> Bytes {
    encode_call(BALANCE_OF, &[Token::Address(holder)])
}

// ---------------------------------------------------------------------------
// Lending markets
// ---------------------------------------------------------------------------

pub const AAVE_GET_RESERVE_DATA: &str = "getReserveData(address)";
pub const COMET_GET_UTILIZATION: &str = "getUtilization()";
pub const COMET_GET_SUPPLY_RATE: &str = "getSupplyRate(uint256)";
pub const COMET_GET_BORROW_RATE: &str = "getBorrowRate(uint256)";
pub const COMET_TOTAL_BORROW: &str = "totalBorrow()";

pub fn aave_get_reserve_data(asset: Address) -> Bytes {
    encode_call(AAVE_GET_RESERVE_DATA, &[Token::Address(asset)])
}

pub fn comet_get_utilization() -> Bytes {
    encode_call(COMET_GET_UTILIZATION, &[])
}

pub fn comet_get_supply_rate(utilization: U256) -> Bytes {
    encode_call(COMET_GET_SUPPLY_RATE, &[Token::Uint(utilization)])
}

pub fn comet_get_borrow_rate(utilization: U256) -> Bytes {
    encode_call(COMET_GET_BORROW_RATE, &[Token::Uint(utilization)])
}

pub fn comet_total_borrow() -> Bytes {
    encode_call(COMET_TOTAL_BORROW, &[])
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub fn decode_string(data: &Bytes) -> Result<String, ChainError> {
    let tokens = abi::decode(&[ParamType::String], data)
        .map_err(|e| ChainError::Decode(e.to_string()))?;
    match tokens.into_iter().next() {
        Some(Token::String(s)) => Ok(s),
        other => Err(ChainError::Decode(format!("expected string, got {other:?}"))),
    }
}

pub fn decode_uint(data: &Bytes) -> Result<U256, ChainError> {
    word(data, 0)
}

pub fn decode_address(data: &Bytes) -> Result<Address, ChainError> {
    word_address(data, 0)
}

/// The `index`-th 32-byte word of a static tuple return.
pub fn word(data: &Bytes, index: usize) -> Result<U256, ChainError> {
    let start = index * 32;
    let slice = data.get(start..start + 32).ok_or_else(|| {
        ChainError::Decode(format!("return data has {} bytes, need word {index}", data.len()))
    })?;
    Ok(U256::from_big_endian(slice))
}

pub fn word_address(data: &Bytes, index: usize) -> Result<Address, ChainError> {
    let start = index * 32;
    let slice = data.get(start + 12..start + 32).ok_or_else(|| {
        ChainError::Decode(format!("return data has {} bytes, need word {index}", data.len()))
    })?;
    Ok(Address::from_slice(slice))
}

/// Encoders for return values, used by the simulated chain.
pub fn encode_string(value: &str) -> Bytes {
    Bytes::from(abi::encode(&[Token::String(value.to_string())]))
}

pub fn encode_uint(value: U256) -> Bytes {
    Bytes::from(abi::encode(&[Token::Uint(value)]))
}

pub fn encode_address(value: Address) -> Bytes {
    Bytes::from(abi::encode(&[Token::Address(value)]))
}

pub fn encode_words(words: &[U256]) -> Bytes {
    let tokens: Vec<Token> = words.iter().copied().map(Token::Uint).collect();
    Bytes::from(abi::encode(&tokens))
}
