//! Connected vaults flowing through the optimization cycle.

use chrono::Utc;
use ethers::types::{Address, U256};

use vaultkeeper::engine::orchestrator::Persistence;
use vaultkeeper::engine::registry::{RegistryError, StatusUpdate};
use vaultkeeper::storage;

use crate::mock_market::*;

const ROYALTY_VAULT: Address = Address::repeat_byte(0x71);
const OTHER_VAULT: Address = Address::repeat_byte(0x72);
const ALICE: Address = Address::repeat_byte(0xa1);
const BOB: Address = Address::repeat_byte(0xb0);

fn seed_vault(h: &Harness, vault: Address, holders: &[(Address, u64)]) {
    h.story.set_erc20(vault, "Story IP Royalty Vault", "RVT", 18, U256::from(1_000u64));
    for (holder, amount) in holders {
        h.story.set_token_balance(vault, *holder, U256::from(*amount));
    }
}

#[tokio::test]
async fn test_connected_vaults_processed_once_per_cooldown() {
    let mut h = Scenario::default().build();
    seed_vault(&h, ROYALTY_VAULT, &[(ALICE, 600), (BOB, 400)]);

    let registry = h.orchestrator.registry_mut();
    registry.connect(ROYALTY_VAULT, ALICE, None).await.unwrap();
    registry.connect(ROYALTY_VAULT, BOB, None).await.unwrap();

    let first = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(first.connected_processed, 2);
    assert_eq!(first.connected_succeeded, 2);
    assert!(h
        .orchestrator
        .registry()
        .all_connections()
        .iter()
        .all(|c| c.last_optimized.is_some()));

    // Still inside the one-hour cooldown.
    let second = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(second.connected_processed, 0);

    // The connected pipeline never touches either chain.
    assert_eq!(h.story.submission_count(), 0);
}

#[tokio::test]
async fn test_disabled_vault_is_skipped() {
    let mut h = Scenario::default().build();
    seed_vault(&h, ROYALTY_VAULT, &[(ALICE, 10)]);
    seed_vault(&h, OTHER_VAULT, &[(ALICE, 10)]);

    let registry = h.orchestrator.registry_mut();
    registry.connect(ROYALTY_VAULT, ALICE, None).await.unwrap();
    registry.connect(OTHER_VAULT, ALICE, None).await.unwrap();
    registry
        .update_status(
            OTHER_VAULT,
            ALICE,
            StatusUpdate {
                optimization_enabled: Some(false),
                ..Default::default()
            },
        )
        .unwrap();

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.connected_processed, 1);
    let stats = h.orchestrator.registry().stats();
    assert_eq!(stats.total_vaults, 2);
    assert_eq!(stats.optimization_enabled, 1);
    assert_eq!(stats.recently_optimized, 1);
}

#[tokio::test]
async fn test_connected_vaults_processed_when_primary_skips() {
    let mut h = Scenario {
        idle_usdc: 10,
        ..Default::default()
    }
    .build();
    seed_vault(&h, ROYALTY_VAULT, &[(ALICE, 1)]);
    h.orchestrator
        .registry_mut()
        .connect(ROYALTY_VAULT, ALICE, None)
        .await
        .unwrap();

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.connected_succeeded, 1);
    assert_eq!(h.ethereum.submission_count(), 0);
}

#[tokio::test]
async fn test_registry_survives_restart() {
    let path = std::env::temp_dir()
        .join(format!("vaultkeeper_registry_{}.json", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .into_owned();

    let mut h = Scenario::default().build();
    seed_vault(&h, ROYALTY_VAULT, &[(ALICE, 5)]);
    h.orchestrator
        .registry_mut()
        .connect(ROYALTY_VAULT, ALICE, None)
        .await
        .unwrap();
    let at = Utc::now();
    h.orchestrator
        .registry_mut()
        .update_status(ROYALTY_VAULT, ALICE, StatusUpdate::optimized_at(at))
        .unwrap();
    storage::save_registry(&h.orchestrator.registry().snapshot(), Some(&path)).unwrap();

    let mut restarted = Scenario::default().build();
    let snapshot = storage::load_registry(Some(&path)).unwrap().unwrap();
    restarted.orchestrator.registry_mut().restore(snapshot);

    let vaults = restarted.orchestrator.registry().user_vaults(ALICE);
    assert_eq!(vaults.len(), 1);
    assert_eq!(vaults[0].last_optimized, Some(at));
    // Cooldown carries over.
    assert!(restarted.orchestrator.registry().optimization_candidates().is_empty());

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_connect_and_disconnect_persist_registry() {
    let temp = |tag: &str| {
        std::env::temp_dir()
            .join(format!("vaultkeeper_{tag}_{}.json", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    };
    let registry_file = temp("vaults");
    let state_file = temp("state");

    let h = Scenario::default().build();
    seed_vault(&h, ROYALTY_VAULT, &[(ALICE, 5)]);
    let mut orchestrator = h.orchestrator.with_persistence(Persistence {
        state_file: Some(state_file.clone()),
        registry_file: Some(registry_file.clone()),
    });

    // Refused connections leave nothing on disk.
    let err = orchestrator.connect_user_vault(ROYALTY_VAULT, BOB, None).await.unwrap_err();
    assert!(matches!(err, RegistryError::NoBalance { .. }));
    assert!(storage::load_registry(Some(&registry_file)).unwrap().is_none());

    let conn = orchestrator.connect_user_vault(ROYALTY_VAULT, ALICE, None).await.unwrap();
    assert_eq!(conn.user_balance, U256::from(5u64));
    let mut reloaded = Scenario::default().build();
    reloaded
        .orchestrator
        .registry_mut()
        .restore(storage::load_registry(Some(&registry_file)).unwrap().unwrap());
    assert_eq!(reloaded.orchestrator.registry().user_vaults(ALICE).len(), 1);
    // Only the registry is written.
    assert!(storage::load_state(Some(&state_file)).unwrap().is_none());

    orchestrator.disconnect_user_vault(ROYALTY_VAULT, ALICE).unwrap();
    let snapshot = storage::load_registry(Some(&registry_file)).unwrap().unwrap();
    let mut emptied = Scenario::default().build();
    emptied.orchestrator.registry_mut().restore(snapshot);
    assert_eq!(emptied.orchestrator.registry().stats().total_vaults, 0);

    assert!(matches!(
        orchestrator.disconnect_user_vault(ROYALTY_VAULT, ALICE),
        Err(RegistryError::UnknownUser(_))
    ));

    let _ = std::fs::remove_file(&registry_file);
}
