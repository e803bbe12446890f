//! Provider failures, retries and cancellation.

use std::sync::Arc;
use std::time::Duration;

use key_wallet::{ChainKind, Network, ScriptType, derive_address};
use wallet_sync::test_utils::{MockProvider, ProviderCall};
use wallet_sync::{
    ChainProvider, ExhaustedPolicy, ProviderError, RetryPolicy, SyncConfig, SyncEngine, SyncError,
};
use wallet_test_utils::{assert_error_contains, confirmed_at, funding_tx, test_account};

fn funded_provider(account: &key_wallet::AccountDescriptor, indices: &[u32]) -> Arc<MockProvider> {
    funded(MockProvider::new(), account, indices)
}

fn funded(
    provider: MockProvider,
    account: &key_wallet::AccountDescriptor,
    indices: &[u32],
) -> Arc<MockProvider> {
    for index in indices {
        let script = derive_address(account, ChainKind::Receive, *index).unwrap().script_pubkey;
        provider.add_transaction(funding_tx(&script, 10_000, index + 1), confirmed_at(300, 1_000));
    }
    Arc::new(provider)
}

fn engine(provider: &Arc<MockProvider>, retry: RetryPolicy) -> SyncEngine {
    let provider: Arc<dyn ChainProvider> = provider.clone();
    SyncEngine::new(provider, SyncConfig::new().with_batch_size(4).with_retry(retry)).unwrap()
}

fn no_backoff() -> RetryPolicy {
    RetryPolicy::default().with_backoff(Duration::ZERO)
}

#[tokio::test]
async fn test_transient_failure_keeps_discovered_addresses() {
    let account = test_account(11, Network::Regtest, ScriptType::P2shP2wpkh);
    let provider = funded_provider(&account, &[0, 5, 9]);
    let reference = engine(&funded_provider(&account, &[0, 5, 9]), no_backoff())
        .sync(&account)
        .await
        .unwrap();

    let engine = engine(&provider, no_backoff());
    provider.fail_next_history(1);
    provider.fail_next_transactions(1);
    let snapshot = engine.sync(&account).await.unwrap();

    assert_eq!(*snapshot, *reference);
    assert!(snapshot.warnings.is_empty());
    let used: Vec<u32> = snapshot.receive.used.iter().map(|a| a.index).collect();
    assert_eq!(used, vec![0, 5, 9]);
    let reinits = provider.calls().iter().filter(|c| matches!(c, ProviderCall::Initialize)).count();
    assert_eq!(reinits, 3);
}

#[tokio::test]
async fn test_failed_reinitialize_leaves_stale_snapshot() {
    let account = test_account(12, Network::Regtest, ScriptType::P2wpkh);
    let provider = funded_provider(&account, &[0]);
    let engine = engine(&provider, no_backoff());

    let good = engine.sync(&account).await.unwrap();

    provider.fail_initialize(true);
    provider.fail_next_history(1);
    let err = engine.sync(&account).await.unwrap_err();

    assert!(matches!(err, SyncError::ProviderUnavailable(ProviderError::Connection(_))));
    assert_eq!(err.category(), "provider");
    assert_eq!(engine.last_snapshot(&account.id()), Some(good));
    assert!(matches!(engine.last_error(&account.id()), Some(SyncError::ProviderUnavailable(_))));

    // the provider recovers and the next sync clears the error
    provider.fail_initialize(false);
    engine.sync(&account).await.unwrap();
    assert!(engine.last_error(&account.id()).is_none());
}

#[tokio::test]
async fn test_initial_connection_failure() {
    let account = test_account(13, Network::Regtest, ScriptType::P2wpkh);
    let provider = funded_provider(&account, &[]);
    provider.fail_initialize(true);
    let engine = engine(&provider, no_backoff());

    assert_error_contains!(engine.sync(&account).await, "injected initialize failure");
    assert!(engine.last_snapshot(&account.id()).is_none());
}

#[tokio::test]
async fn test_fail_policy_surfaces_exhaustion() {
    let account = test_account(14, Network::Regtest, ScriptType::P2wpkh);
    let provider = funded_provider(&account, &[0]);
    provider.fail_next_history(4);
    let engine = engine(&provider, no_backoff().with_on_exhausted(ExhaustedPolicy::Fail));

    let err = engine.sync(&account).await.unwrap_err();
    assert!(matches!(err, SyncError::ProviderUnavailable(ProviderError::Timeout(_))));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_reconciliation_failures_are_retried_then_surfaced() {
    let account = test_account(15, Network::Regtest, ScriptType::P2wpkh);
    let provider = funded_provider(&account, &[0]);
    provider.fail_next_utxos(5);
    let engine = engine(&provider, no_backoff().with_max_attempts(3));

    let err = engine.sync(&account).await.unwrap_err();
    assert!(matches!(err, SyncError::ProviderUnavailable(_)));

    // two faults remain: the first two attempts of the next sync absorb them
    let snapshot = engine.sync(&account).await.unwrap();
    assert_eq!(snapshot.total_balance(), 10_000);
}

#[tokio::test]
async fn test_shutdown_cancels_running_sync() {
    let account = test_account(16, Network::Regtest, ScriptType::P2wpkh);
    let provider = funded(
        MockProvider::new().with_delay(Duration::from_millis(50)),
        &account,
        &[0, 1, 2, 3, 4, 5],
    );
    let engine = engine(&provider, no_backoff());

    let running = {
        let engine = engine.clone();
        let account = account.clone();
        tokio::spawn(async move { engine.sync(&account).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.shutdown();

    let result = running.await.unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert!(engine.last_snapshot(&account.id()).is_none());
    assert!(matches!(engine.sync(&account).await, Err(SyncError::Cancelled)));
}

#[test]
fn test_invalid_account_file_is_a_config_error() {
    let err = wallet_sync::config::parse_accounts(r#"{"name": "x", "network": "regtest"}"#).unwrap_err();
    assert_eq!(err.category(), "config");
}
