//! Persistence layer.
//!
//! Agent state and the vault registry are saved as JSON files after every
//! cycle. The append-only knowledge logs live in [`knowledge`].

pub mod knowledge;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::engine::registry::RegistrySnapshot;
use crate::types::AgentState;

/// Default state file path.
const DEFAULT_STATE_FILE: &str = "vaultkeeper_state.json";

/// Default registry file path.
const DEFAULT_REGISTRY_FILE: &str = "vaultkeeper_vaults.json";

fn write_json<T: Serialize>(value: &T, path: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialise")?;
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
    }
    // Write beside the target, then rename over it.
    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).context(format!("Failed to write {tmp}"))?;
    std::fs::rename(&tmp, path).context(format!("Failed to replace {path}"))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &str) -> Result<Option<T>> {
    if !Path::new(path).exists() {
        return Ok(None);
    }
    let json = std::fs::read_to_string(path).context(format!("Failed to read {path}"))?;
    let value = serde_json::from_str(&json).context(format!("Failed to parse {path}"))?;
    Ok(Some(value))
}

/// Save agent state to a JSON file.
pub fn save_state(state: &AgentState, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    write_json(state, path).context("Failed to save agent state")?;
    debug!(path, cycle_count = state.cycle_count, "State saved");
    Ok(())
}

/// Load agent state from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_state(path: Option<&str>) -> Result<Option<AgentState>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let Some(state) = read_json::<AgentState>(path)? else {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    };

    info!(
        path,
        cycle_count = state.cycle_count,
        executed = state.strategies_executed,
        total_deployed = %state.total_deployed,
        "State loaded from disk"
    );
    Ok(Some(state))
}

/// Delete the state file (for testing or reset).
pub fn delete_state(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete state file {path}"))?;
    }
    Ok(())
}

pub fn save_registry(snapshot: &RegistrySnapshot, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_REGISTRY_FILE);
    write_json(snapshot, path).context("Failed to save vault registry")?;
    debug!(path, users = snapshot.connections.len(), "Registry saved");
    Ok(())
}

pub fn load_registry(path: Option<&str>) -> Result<Option<RegistrySnapshot>> {
    let path = path.unwrap_or(DEFAULT_REGISTRY_FILE);
    let snapshot = read_json::<RegistrySnapshot>(path)?;
    if let Some(s) = &snapshot {
        info!(path, users = s.connections.len(), "Vault registry loaded");
    }
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
