//! Vault registry: user-owned vault tokens connected for optimization.
//!
//! Connections are keyed by user address, each user owning a list of
//! vaults. Only this module mutates the collection.

use chrono::{DateTime, Duration, Utc};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{abi, ChainClient, ChainError};
use crate::types::{u256_to_f64, VaultConnection, VaultInfo};

/// Name fragments that mark a token as a likely royalty vault.
const ROYALTY_KEYWORDS: [&str; 4] = ["royalty", "vault", "ip", "story"];

pub const DEFAULT_COOLDOWN_SECS: i64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No contract deployed at {0:?}")]
    NoContract(Address),

    #[error("{address:?} is not a token contract: {reason}")]
    NotAToken { address: Address, reason: String },

    #[error("{user:?} holds no balance of vault {vault:?}")]
    NoBalance { vault: Address, user: Address },

    #[error("No connections for user {0:?}")]
    UnknownUser(Address),

    #[error("Vault {vault:?} is not connected for user {user:?}")]
    NotConnected { vault: Address, user: Address },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Result of a balance check for one user and vault.
#[derive(Debug, Clone, PartialEq)]
pub struct Ownership {
    pub owns: bool,
    pub balance: U256,
    pub total_supply: U256,
    pub ownership_pct: f64,
}

/// Fields `update_status` may change. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub last_optimized: Option<DateTime<Utc>>,
    pub optimization_enabled: Option<bool>,
    pub metadata: Option<Map<String, Value>>,
}

impl StatusUpdate {
    pub fn optimized_at(at: DateTime<Utc>) -> Self {
        Self {
            last_optimized: Some(at),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_users: usize,
    pub total_vaults: usize,
    pub optimization_enabled: usize,
    pub recently_optimized: usize,
    pub awaiting_optimization: usize,
}

/// Serializable registry contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub connections: BTreeMap<Address, Vec<VaultConnection>>,
}

pub struct VaultRegistry {
    chain: Arc<dyn ChainClient>,
    connections: BTreeMap<Address, Vec<VaultConnection>>,
    cooldown: Duration,
}

impl VaultRegistry {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self::with_cooldown(chain, Duration::seconds(DEFAULT_COOLDOWN_SECS))
    }

    pub fn with_cooldown(chain: Arc<dyn ChainClient>, cooldown: Duration) -> Self {
        Self {
            chain,
            connections: BTreeMap::new(),
            cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    // -- Chain reads --------------------------------------------------------

    /// Check that `vault` hosts code and answers the ERC-20 metadata reads.
    pub async fn validate(&self, vault: Address) -> Result<VaultInfo, RegistryError> {
        let code = self.chain.code(vault).await?;
        if code.is_empty() {
            return Err(RegistryError::NoContract(vault));
        }

        let not_token = |e: ChainError| RegistryError::NotAToken {
            address: vault,
            reason: e.to_string(),
        };
        let name = self.read_string(vault, abi::name()).await.map_err(not_token)?;
        let symbol = self.read_string(vault, abi::symbol()).await.map_err(not_token)?;
        let total_supply = self
            .chain
            .call(vault, abi::total_supply())
            .await
            .and_then(|b| abi::decode_uint(&b))
            .map_err(not_token)?;

        let lowered = name.to_lowercase();
        let is_likely_royalty = ROYALTY_KEYWORDS.iter().any(|k| lowered.contains(k));
        if !is_likely_royalty {
            debug!(vault = ?vault, name = %name, "Token name does not look like a royalty vault");
        }

        Ok(VaultInfo {
            address: vault,
            name,
            symbol,
            total_supply,
            is_likely_royalty,
        })
    }

    async fn read_string(&self, to: Address, data: ethers::types::Bytes) -> Result<String, ChainError> {
        let raw = self.chain.call(to, data).await?;
        abi::decode_string(&raw)
    }

    pub async fn check_ownership(&self, vault: Address, user: Address) -> Result<Ownership, RegistryError> {
        let balance = abi::decode_uint(&self.chain.call(vault, abi::balance_of(user)).await?)?;
        let total_supply = abi::decode_uint(&self.chain.call(vault, abi::total_supply()).await?)?;
        let ownership_pct = if total_supply.is_zero() {
            0.0
        } else {
            u256_to_f64(balance) / u256_to_f64(total_supply) * 100.0
        };
        Ok(Ownership {
            owns: !balance.is_zero(),
            balance,
            total_supply,
            ownership_pct,
        })
    }

    // -- Mutation -----------------------------------------------------------

    /// Validate, confirm a positive balance, then upsert the connection.
    /// The registry is untouched when any step fails.
    pub async fn connect(
        &mut self,
        vault: Address,
        user: Address,
        metadata: Option<Map<String, Value>>,
    ) -> Result<VaultConnection, RegistryError> {
        let info = self.validate(vault).await?;
        let ownership = self.check_ownership(vault, user).await?;
        if !ownership.owns {
            warn!(vault = ?vault, user = ?user, "Connect refused, user holds no vault tokens");
            return Err(RegistryError::NoBalance { vault, user });
        }

        let connection = VaultConnection {
            vault_address: vault,
            user_address: user,
            connected_at: Utc::now(),
            user_balance: ownership.balance,
            ownership_percentage: ownership.ownership_pct,
            vault_info: info,
            optimization_enabled: true,
            last_optimized: None,
            metadata: metadata.unwrap_or_default(),
        };

        let vaults = self.connections.entry(user).or_default();
        match vaults.iter_mut().find(|c| c.vault_address == vault) {
            Some(existing) => {
                // Keep the optimization history of the earlier connection.
                let last_optimized = existing.last_optimized;
                *existing = VaultConnection {
                    last_optimized,
                    ..connection.clone()
                };
            }
            None => vaults.push(connection.clone()),
        }

        info!(
            vault = ?vault,
            user = ?user,
            name = %connection.vault_info.name,
            ownership_pct = format!("{:.2}", connection.ownership_percentage),
            "Vault connected"
        );
        Ok(connection)
    }

    pub fn disconnect(&mut self, vault: Address, user: Address) -> Result<(), RegistryError> {
        let vaults = self
            .connections
            .get_mut(&user)
            .ok_or(RegistryError::UnknownUser(user))?;
        let before = vaults.len();
        vaults.retain(|c| c.vault_address != vault);
        if vaults.len() == before {
            return Err(RegistryError::NotConnected { vault, user });
        }
        if vaults.is_empty() {
            self.connections.remove(&user);
        }
        info!(vault = ?vault, user = ?user, "Vault disconnected");
        Ok(())
    }

    pub fn update_status(&mut self, vault: Address, user: Address, update: StatusUpdate) -> Result<(), RegistryError> {
        let conn = self
            .connections
            .get_mut(&user)
            .ok_or(RegistryError::UnknownUser(user))?
            .iter_mut()
            .find(|c| c.vault_address == vault)
            .ok_or(RegistryError::NotConnected { vault, user })?;

        if let Some(at) = update.last_optimized {
            conn.last_optimized = Some(at);
        }
        if let Some(enabled) = update.optimization_enabled {
            conn.optimization_enabled = enabled;
        }
        if let Some(meta) = update.metadata {
            conn.metadata.extend(meta);
        }
        Ok(())
    }

    // -- Queries ------------------------------------------------------------

    pub fn optimization_candidates(&self) -> Vec<VaultConnection> {
        self.candidates_at(Utc::now())
    }

    /// Enabled connections whose cooldown has elapsed at `now`.
    pub fn candidates_at(&self, now: DateTime<Utc>) -> Vec<VaultConnection> {
        self.connections
            .values()
            .flatten()
            .filter(|c| c.is_due(now, self.cooldown))
            .cloned()
            .collect()
    }

    pub fn user_vaults(&self, user: Address) -> &[VaultConnection] {
        self.connections.get(&user).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_connections(&self) -> Vec<VaultConnection> {
        self.connections.values().flatten().cloned().collect()
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> RegistryStats {
        let all: Vec<&VaultConnection> = self.connections.values().flatten().collect();
        let day_ago = now - Duration::hours(24);
        RegistryStats {
            total_users: self.connections.len(),
            total_vaults: all.len(),
            optimization_enabled: all.iter().filter(|c| c.optimization_enabled).count(),
            recently_optimized: all
                .iter()
                .filter(|c| c.last_optimized.is_some_and(|t| t > day_ago))
                .count(),
            awaiting_optimization: all.iter().filter(|c| c.is_due(now, self.cooldown)).count(),
        }
    }

    // -- Persistence --------------------------------------------------------

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            connections: self.connections.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: RegistrySnapshot) {
        self.connections = snapshot.connections;
        self.connections.retain(|_, v| !v.is_empty());
    }
}
