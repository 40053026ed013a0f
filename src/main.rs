//! VAULTKEEPER: risk-gated yield optimizer for a pooled custodial vault.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! connects to both chains (or builds simulated ones for a dry run),
//! restores state from disk and runs the optimization loop with
//! graceful shutdown.
//!
//! `connect` and `disconnect` edit the user vault registry and exit
//! without running a cycle.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ethers::types::{Address, Bytes, U256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use vaultkeeper::chain::evm::EvmClient;
use vaultkeeper::chain::simulated::SimulatedChain;
use vaultkeeper::chain::{Chain, ChainClient, ChainMap};
use vaultkeeper::config::{self, parse_address, AppConfig};
use vaultkeeper::data::aave::{encode_reserve_data, percent_to_ray, AaveV3Provider};
use vaultkeeper::data::compound::{percent_to_per_second, CometMarket, CompoundV3Provider};
use vaultkeeper::data::defillama::DefiLlamaProvider;
use vaultkeeper::data::{asset_decimals, default_assets, MarketDataProvider};
use vaultkeeper::chain::abi;
use vaultkeeper::engine::contracts::ContractBook;
use vaultkeeper::engine::executor::{ExecutionEngine, ExecutionSettings};
use vaultkeeper::engine::orchestrator::{Orchestrator, OrchestratorSettings, Persistence};
use vaultkeeper::engine::registry::VaultRegistry;
use vaultkeeper::llm::openai::OpenAiPlanner;
use vaultkeeper::llm::{BaselinePlanner, StrategyPlanner};
use vaultkeeper::risk::activity::EtherscanClient;
use vaultkeeper::risk::{AnomalyDetector, IsolationForestDetector, RiskScorer};
use vaultkeeper::storage::{self, knowledge::KnowledgeBase};
use vaultkeeper::types::{to_base_units, AgentState, OptimizerError};

const BANNER: &str = r#"
 __     __          _ _   _  __
 \ \   / /_ _ _   _| | |_| |/ /___  ___ _ __   ___ _ __
  \ \ / / _` | | | | | __| ' // _ \/ _ \ '_ \ / _ \ '__|
   \ V / (_| | |_| | | |_| . \  __/  __/ |_) |  __/ |
    \_/ \__,_|\__,_|_|\__|_|\_\___|\___| .__/ \___|_|
                                       |_|
  Risk-gated yield optimizer for pooled vaults
  v0.1.0
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Run a single cycle and exit.
    Once,
    /// Cycle every `optimization_interval_secs` until Ctrl+C.
    Continuous,
}

#[derive(Debug, Parser)]
#[command(name = "vaultkeeper", version, about = "Risk-gated yield optimizer for pooled vaults")]
struct Cli {
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[arg(long, value_enum, default_value_t = Mode::Once)]
    mode: Mode,

    /// Use in-memory chains instead of the configured RPC endpoints.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect a user's royalty vault for optimization.
    Connect {
        #[arg(long)]
        vault: String,
        #[arg(long)]
        user: String,
    },
    /// Remove a user's royalty vault from the registry.
    Disconnect {
        #[arg(long)]
        vault: String,
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cfg = config::AppConfig::load(&cli.config)?;
    init_logging();

    println!("{BANNER}");
    let dry_run = cli.dry_run || cfg.agent.dry_run;
    info!(
        agent_name = %cfg.agent.name,
        interval_secs = cfg.agent.optimization_interval_secs,
        mode = ?cli.mode,
        dry_run,
        "VAULTKEEPER starting up"
    );

    cfg.validate(!dry_run)?;
    let book = ContractBook::from_config(&cfg.contracts)?;

    // -- Chains ----------------------------------------------------------

    let chains = if dry_run {
        warn!("Dry run: using simulated chains, nothing reaches a real network");
        simulated_chains(&cfg, &book)?
    } else {
        live_chains(&cfg).await?
    };
    let ethereum = chains
        .get(&Chain::Ethereum)
        .cloned()
        .ok_or_else(|| OptimizerError::Configuration("ethereum chain missing".into()))?;
    let story = chains
        .get(&Chain::Story)
        .cloned()
        .ok_or_else(|| OptimizerError::Configuration("story chain missing".into()))?;

    let engine = ExecutionEngine::new(chains, book, ExecutionSettings::from_config(&cfg.execution)?);
    let health = engine.health_check().await;
    for chain in &health.chains {
        info!(
            chain = %chain.chain,
            connected = chain.connected,
            chain_id = ?chain.chain_id,
            head = ?chain.head_block,
            signer = ?chain.signer,
            "Chain health"
        );
    }
    if !health.all_connected() {
        return Err(OptimizerError::Configuration("chain health probe failed".into()).into());
    }

    // -- Restore or create state -----------------------------------------

    let state = match storage::load_state(Some(&cfg.storage.state_file))? {
        Some(s) => {
            info!(
                cycles = s.cycle_count,
                executed = s.strategies_executed,
                deployed = %s.total_deployed,
                "Resumed from saved state"
            );
            s
        }
        None => {
            info!("Fresh start");
            AgentState::new()
        }
    };

    let mut registry = VaultRegistry::new(story);
    if let Some(snapshot) = storage::load_registry(Some(&cfg.storage.registry_file))? {
        registry.restore(snapshot);
        info!(vaults = registry.stats().total_vaults, "Vault registry restored");
    }

    // -- Components ------------------------------------------------------

    let scorer = RiskScorer::new(build_detector(&cfg), &cfg.risk.protocol_addresses);
    let planner = build_planner(&cfg)?;
    let providers = build_providers(&cfg, &ethereum)?;
    let knowledge = KnowledgeBase::open(&cfg.storage.knowledge_dir)?;

    info!(
        planner = planner.name(),
        providers = providers.len(),
        threshold = cfg.risk.acceptance_threshold,
        "Components ready"
    );

    let mut orchestrator = Orchestrator::new(
        engine,
        scorer,
        registry,
        planner,
        providers,
        knowledge,
        OrchestratorSettings::from_config(&cfg),
    )
    .with_state(state)
    .with_persistence(Persistence {
        state_file: Some(cfg.storage.state_file.clone()),
        registry_file: Some(cfg.storage.registry_file.clone()),
    });

    if let Some(command) = cli.command {
        return run_command(&mut orchestrator, command).await;
    }

    // -- Main loop -------------------------------------------------------

    let outcome = match cli.mode {
        Mode::Once => orchestrator.run_once().await,
        Mode::Continuous => {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received, finishing current cycle");
                    let _ = tx.send(true);
                }
            });
            info!(
                interval_secs = cfg.agent.optimization_interval_secs,
                "Entering main loop. Press Ctrl+C to stop."
            );
            orchestrator.run_continuous(rx).await;
            Ok(())
        }
    };

    let state = orchestrator.state();
    info!(
        cycles = state.cycle_count,
        executed = state.strategies_executed,
        rejected = state.strategies_rejected,
        failed = state.cycles_failed,
        deployed = %state.total_deployed,
        swept = %state.total_swept,
        "VAULTKEEPER shut down."
    );

    outcome.context("Single cycle did not complete")?;
    Ok(())
}

async fn run_command(orchestrator: &mut Orchestrator, command: Command) -> Result<()> {
    match command {
        Command::Connect { vault, user } => {
            let vault = parse_address("--vault", &vault)?;
            let user = parse_address("--user", &user)?;
            let conn = orchestrator
                .connect_user_vault(vault, user, None)
                .await
                .context("Failed to connect vault")?;
            info!(
                vault = ?vault,
                user = ?user,
                name = %conn.vault_info.name,
                ownership_pct = format!("{:.2}", conn.ownership_percentage),
                "Vault registered"
            );
        }
        Command::Disconnect { vault, user } => {
            let vault = parse_address("--vault", &vault)?;
            let user = parse_address("--user", &user)?;
            orchestrator
                .disconnect_user_vault(vault, user)
                .context("Failed to disconnect vault")?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

async fn live_chains(cfg: &AppConfig) -> Result<ChainMap> {
    let key = cfg.signing_key();
    let mut chains: ChainMap = BTreeMap::new();
    for (chain, endpoint) in [(Chain::Story, &cfg.chains.story), (Chain::Ethereum, &cfg.chains.ethereum)] {
        let client = EvmClient::connect(chain, &endpoint.resolve_rpc_url(), key.as_ref())
            .await
            .with_context(|| format!("Failed to connect to {chain}"))?;
        chains.insert(chain, Arc::new(client));
    }
    Ok(chains)
}

/// In-memory chains seeded with the configured contracts, an idle primary
/// vault and plausible lending rates.
fn simulated_chains(cfg: &AppConfig, book: &ContractBook) -> Result<ChainMap> {
    let signer = Address::from_low_u64_be(0xd1);
    let gas_budget = U256::exp10(19);
    let stub = Bytes::from_static(&[0x60, 0x80]);

    let story = Arc::new(SimulatedChain::new(Chain::Story).with_signer(signer));
    let ethereum = Arc::new(SimulatedChain::new(Chain::Ethereum).with_signer(signer));
    story.set_native_balance(signer, gas_budget);
    ethereum.set_native_balance(signer, gas_budget);

    let idle = to_base_units(cfg.agent.dry_run_vault_balance, 6).unwrap_or_default();
    ethereum.set_erc20(book.usdc, "USD Coin", "USDC", 6, idle);
    ethereum.set_vault(book.base_vault, book.usdc, idle, idle);
    story.set_code(book.royalty_wrapper, stub.clone());
    if let Some(proxy) = &cfg.contracts.deposit_proxy {
        let proxy = parse_address("contracts.deposit_proxy", proxy)?;
        ethereum.set_deposit_proxy(proxy, book.usdc, book.base_vault, U256::zero());
    }
    for (_, chain, address) in book.all() {
        let client = if chain == Chain::Story { &story } else { &ethereum };
        client.set_code(address, stub.clone());
    }

    if let Some(aave) = cfg.providers.aave.as_ref().filter(|a| a.enabled) {
        let pool = parse_address("providers.aave.pool_address", &aave.pool_address)?;
        for (asset, supply_pct) in default_assets().into_iter().zip([6.0, 5.5, 2.0]) {
            let a_token = Address::from_low_u64_be(asset.address.to_low_u64_be() ^ 0xa);
            let debt_token = Address::from_low_u64_be(asset.address.to_low_u64_be() ^ 0xd);
            let unit = U256::exp10(asset.decimals as usize);
            ethereum.set_call_response(
                pool,
                abi::aave_get_reserve_data(asset.address),
                encode_reserve_data(percent_to_ray(supply_pct), percent_to_ray(supply_pct * 1.4), a_token, debt_token),
            );
            ethereum.set_erc20(a_token, "aToken", "aTKN", asset.decimals as u8, U256::from(5_000_000u64) * unit);
            ethereum.set_erc20(debt_token, "debt", "vDEBT", asset.decimals as u8, U256::from(3_500_000u64) * unit);
        }
    }
    if let Some(compound) = cfg.providers.compound.as_ref().filter(|c| c.enabled) {
        for (symbol, comet) in &compound.comets {
            let comet = parse_address(&format!("providers.compound.comets.{symbol}"), comet)?;
            let unit = U256::exp10(asset_decimals(symbol) as usize);
            ethereum.set_selector_response(comet, abi::COMET_GET_UTILIZATION, abi::encode_uint(U256::exp10(17) * U256::from(7u8)));
            ethereum.set_selector_response(comet, abi::COMET_GET_SUPPLY_RATE, abi::encode_uint(percent_to_per_second(4.5)));
            ethereum.set_selector_response(comet, abi::COMET_GET_BORROW_RATE, abi::encode_uint(percent_to_per_second(6.5)));
            ethereum.set_selector_response(comet, abi::TOTAL_SUPPLY, abi::encode_uint(U256::from(2_000_000u64) * unit));
            ethereum.set_selector_response(comet, abi::COMET_TOTAL_BORROW, abi::encode_uint(U256::from(1_400_000u64) * unit));
        }
    }

    let mut chains: ChainMap = BTreeMap::new();
    chains.insert(Chain::Story, story);
    chains.insert(Chain::Ethereum, ethereum);
    Ok(chains)
}

/// Isolation forest over Etherscan activity, or `None` when either half
/// is unavailable.
fn build_detector(cfg: &AppConfig) -> Option<Box<dyn AnomalyDetector>> {
    let key = cfg
        .risk
        .etherscan_api_key_env
        .as_deref()
        .and_then(|env| std::env::var(env).ok())
        .filter(|k| !k.is_empty());
    let Some(key) = key else {
        warn!("No Etherscan API key configured, risk scoring degrades to moderate");
        return None;
    };

    let source = match EtherscanClient::new(key, cfg.risk.etherscan_chain_id) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Etherscan client unavailable");
            return None;
        }
    };
    match IsolationForestDetector::load(&cfg.risk.model_path, Box::new(source)) {
        Ok(d) => Some(Box::new(d)),
        Err(e) => {
            warn!(path = %cfg.risk.model_path, error = %e, "Risk model failed to load");
            None
        }
    }
}

fn build_planner(cfg: &AppConfig) -> Result<Box<dyn StrategyPlanner>> {
    let api_key = std::env::var(&cfg.llm.api_key_env).unwrap_or_default();
    if api_key.is_empty() {
        warn!("No LLM API key configured, using baseline planner");
        return Ok(Box::new(BaselinePlanner));
    }

    match cfg.llm.provider.as_str() {
        "openai" => {
            info!(model = %cfg.llm.model, "Using OpenAI strategy planner");
            Ok(Box::new(OpenAiPlanner::new(
                api_key,
                Some(cfg.llm.model.clone()),
                Some(cfg.llm.max_tokens),
                Some(cfg.llm.temperature),
            )?))
        }
        other => {
            warn!(provider = other, "Unknown LLM provider, using baseline planner");
            Ok(Box::new(BaselinePlanner))
        }
    }
}

fn build_providers(cfg: &AppConfig, ethereum: &Arc<dyn ChainClient>) -> Result<Vec<Box<dyn MarketDataProvider>>> {
    let mut providers: Vec<Box<dyn MarketDataProvider>> = Vec::new();

    if let Some(aave) = cfg.providers.aave.as_ref().filter(|a| a.enabled) {
        let pool = parse_address("providers.aave.pool_address", &aave.pool_address)?;
        providers.push(Box::new(AaveV3Provider::new(ethereum.clone(), pool, default_assets())));
    }
    if let Some(compound) = cfg.providers.compound.as_ref().filter(|c| c.enabled) {
        let mut markets = Vec::new();
        for (symbol, comet) in &compound.comets {
            markets.push(CometMarket {
                symbol: symbol.to_uppercase(),
                comet: parse_address(&format!("providers.compound.comets.{symbol}"), comet)?,
                decimals: asset_decimals(symbol),
            });
        }
        providers.push(Box::new(CompoundV3Provider::new(ethereum.clone(), markets)));
    }
    if let Some(llama) = cfg.providers.defillama.as_ref().filter(|d| d.enabled) {
        providers.push(Box::new(DefiLlamaProvider::new(llama.protocols.clone())?));
    }

    if providers.is_empty() {
        warn!("No market data providers enabled, every cycle will skip");
    }
    Ok(providers)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vaultkeeper=info"));

    let json_logging = std::env::var("VAULTKEEPER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
