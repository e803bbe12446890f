//! Per-account sync orchestration.
//!
//! [`SyncEngine`] runs scan, reconciliation and snapshot building for an
//! account and keeps the last good snapshot and last error per account. At
//! most one sync per account is in flight: a request for an account that is
//! already syncing waits for the running sync and receives its result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use bitcoin::Txid;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use key_wallet::{AccountDescriptor, AccountId};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{ProviderError, SyncError, SyncResult};
use crate::labels::{LabelStore, NoLabels};
use crate::provider::ChainProvider;
use crate::reconciler::TransactionReconciler;
use crate::retry::RetryGovernor;
use crate::scanner::GapLimitScanner;
use crate::snapshot::{AccountSnapshot, AccountSnapshotBuilder};

/// Confirmation targets, in blocks, behind [`FeeRates`].
pub const FEE_TARGET_FASTEST: u16 = 1;
pub const FEE_TARGET_HALF_HOUR: u16 = 3;
pub const FEE_TARGET_HOUR: u16 = 6;

/// Fee rates in sat/vB. `None` where the provider has no estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeeRates {
    pub fastest: Option<f64>,
    pub half_hour: Option<f64>,
    pub hour: Option<f64>,
}

pub type SyncOutcome = SyncResult<Arc<AccountSnapshot>>;

type InFlight = Shared<BoxFuture<'static, SyncOutcome>>;

struct Inner {
    provider: Arc<dyn ChainProvider>,
    config: SyncConfig,
    labels: Arc<dyn LabelStore>,
    initialized: OnceCell<()>,
    in_flight: Mutex<HashMap<AccountId, InFlight>>,
    snapshots: RwLock<HashMap<AccountId, Arc<AccountSnapshot>>>,
    errors: RwLock<HashMap<AccountId, SyncError>>,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(provider: Arc<dyn ChainProvider>, config: SyncConfig) -> SyncResult<Self> {
        Self::with_label_store(provider, config, Arc::new(NoLabels))
    }

    pub fn with_label_store(
        provider: Arc<dyn ChainProvider>,
        config: SyncConfig,
        labels: Arc<dyn LabelStore>,
    ) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                provider,
                config,
                labels,
                initialized: OnceCell::new(),
                in_flight: Mutex::new(HashMap::new()),
                snapshots: RwLock::new(HashMap::new()),
                errors: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn provider(&self) -> &Arc<dyn ChainProvider> {
        &self.inner.provider
    }

    /// Sync one account, joining a sync of the same account already in
    /// flight.
    pub async fn sync(&self, descriptor: &AccountDescriptor) -> SyncOutcome {
        let id = descriptor.id();
        let shared = {
            let mut in_flight = self.inner.in_flight();
            match in_flight.get(&id) {
                Some(running) => {
                    debug!("Joining in-flight sync of '{}'", descriptor.name());
                    running.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let descriptor = descriptor.clone();
                    let shared = async move { inner.sync_and_record(descriptor).await }.boxed().shared();
                    in_flight.insert(id, shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    /// Sync several accounts concurrently. Results are in input order.
    pub async fn sync_all(&self, descriptors: &[AccountDescriptor]) -> Vec<SyncOutcome> {
        join_all(descriptors.iter().map(|descriptor| self.sync(descriptor))).await
    }

    /// Last successful snapshot, kept when later syncs fail.
    pub fn last_snapshot(&self, id: &AccountId) -> Option<Arc<AccountSnapshot>> {
        read(&self.inner.snapshots).get(id).cloned()
    }

    /// Error of the latest sync, if it failed.
    pub fn last_error(&self, id: &AccountId) -> Option<SyncError> {
        read(&self.inner.errors).get(id).cloned()
    }

    pub async fn estimate_fees(&self) -> SyncResult<FeeRates> {
        self.inner.ensure_initialized().await?;
        Ok(FeeRates {
            fastest: self.inner.estimate_fee(FEE_TARGET_FASTEST).await?,
            half_hour: self.inner.estimate_fee(FEE_TARGET_HALF_HOUR).await?,
            hour: self.inner.estimate_fee(FEE_TARGET_HOUR).await?,
        })
    }

    /// Submit a raw transaction. A refusal is returned verbatim as
    /// [`SyncError::BroadcastRejected`].
    pub async fn broadcast(&self, raw_tx_hex: &str) -> SyncResult<Txid> {
        self.inner.ensure_initialized().await?;
        let provider = self.inner.provider.as_ref();
        let governor = RetryGovernor::new(provider, &self.inner.config.retry);
        match governor.run("broadcast", move || provider.broadcast(raw_tx_hex)).await {
            Ok(txid) => {
                info!("Broadcast transaction {}", txid);
                Ok(txid)
            }
            Err(SyncError::ProviderUnavailable(ProviderError::Rejected(reason))) => {
                warn!("Broadcast rejected: {}", reason);
                Err(SyncError::BroadcastRejected(reason))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn is_confirmed(&self, txid: &Txid) -> SyncResult<bool> {
        self.inner.ensure_initialized().await?;
        let provider = self.inner.provider.as_ref();
        let governor = RetryGovernor::new(provider, &self.inner.config.retry);
        governor.run("confirmation lookup", move || provider.is_confirmed(txid)).await
    }

    /// Cancel running syncs and refuse new ones.
    pub fn shutdown(&self) {
        info!("Shutting down sync engine");
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<AccountId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn ensure_initialized(&self) -> SyncResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                info!("Initializing {} provider", self.provider.name());
                self.provider.initialize().await.map_err(SyncError::ProviderUnavailable)
            })
            .await
            .map(|_| ())
    }

    async fn estimate_fee(&self, target: u16) -> SyncResult<Option<f64>> {
        let provider = self.provider.as_ref();
        let governor = RetryGovernor::new(provider, &self.config.retry);
        governor.run("fee estimate", move || provider.estimate_fee(target)).await
    }

    async fn sync_and_record(self: Arc<Self>, descriptor: AccountDescriptor) -> SyncOutcome {
        let id = descriptor.id();
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SyncError::Cancelled),
            result = self.run_sync(&descriptor) => result,
        };

        match &result {
            Ok(snapshot) => {
                info!(
                    "Synced '{}' in {:?}: {} transactions, {} unspent outputs, balance {} sat, {} warnings",
                    descriptor.name(),
                    started.elapsed(),
                    snapshot.transactions.len(),
                    snapshot.utxos.len(),
                    snapshot.total_balance(),
                    snapshot.warnings.len()
                );
                write(&self.snapshots).insert(id, Arc::clone(snapshot));
                write(&self.errors).remove(&id);
            }
            Err(e) => {
                warn!("Sync of '{}' failed ({}): {}", descriptor.name(), e.category(), e);
                write(&self.errors).insert(id, e.clone());
            }
        }

        self.in_flight().remove(&id);
        result
    }

    async fn run_sync(&self, descriptor: &AccountDescriptor) -> SyncOutcome {
        self.ensure_initialized().await?;
        let provider = self.provider.as_ref();
        let governor = RetryGovernor::new(provider, &self.config.retry);
        let tip_height = governor.run("tip height", move || provider.tip_height()).await?;

        let scan = GapLimitScanner::new(descriptor, provider, &self.config)
            .with_cancellation(self.shutdown.child_token())
            .scan()
            .await?;
        self.check_cancelled()?;

        let outcome = TransactionReconciler::new(provider, &self.config)
            .reconcile(&scan, descriptor.network())
            .await?;
        self.check_cancelled()?;

        let keys = AccountSnapshotBuilder::label_keys(&scan, &outcome);
        let labels = self.labels.lookup(&keys).await;

        let snapshot = AccountSnapshotBuilder::new(descriptor, scan, outcome)
            .with_labels(labels)
            .with_tip_height(tip_height)
            .build();
        Ok(Arc::new(snapshot))
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::test_utils::{MockProvider, ProviderCall};
    use key_wallet::{ChainKind, Network, ScriptType, derive_address};
    use std::time::Duration;
    use wallet_test_utils::{confirmed_at, funding_tx, test_account};

    fn config() -> SyncConfig {
        SyncConfig::new().with_retry(RetryPolicy::default().with_backoff(Duration::ZERO))
    }

    fn engine(provider: &Arc<MockProvider>) -> SyncEngine {
        SyncEngine::new(Arc::clone(provider) as Arc<dyn ChainProvider>, config()).unwrap()
    }

    #[tokio::test]
    async fn test_initializes_once() {
        let provider = Arc::new(MockProvider::new());
        let engine = engine(&provider);
        let account = test_account(1, Network::Regtest, ScriptType::P2wpkh);

        engine.sync(&account).await.unwrap();
        engine.sync(&account).await.unwrap();
        let inits = provider.calls().iter().filter(|c| matches!(c, ProviderCall::Initialize)).count();
        assert_eq!(inits, 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_recorded() {
        let provider = Arc::new(MockProvider::new());
        let account = test_account(1, Network::Regtest, ScriptType::P2wpkh);
        let script = derive_address(&account, ChainKind::Receive, 0).unwrap().script_pubkey;
        provider.add_transaction(funding_tx(&script, 5_000, 1), confirmed_at(700_000, 1_600_000_000));

        let engine = engine(&provider);
        let snapshot = engine.sync(&account).await.unwrap();
        assert_eq!(snapshot.total_balance(), 5_000);
        assert_eq!(snapshot.tip_height, Some(800_000));
        assert_eq!(engine.last_snapshot(&account.id()), Some(snapshot));
        assert!(engine.last_error(&account.id()).is_none());
    }

    #[tokio::test]
    async fn test_fee_rates_use_three_targets() {
        let provider = Arc::new(MockProvider::new());
        provider.set_fee_rate(1, 25.0);
        provider.set_fee_rate(6, 4.5);
        let engine = engine(&provider);

        let rates = engine.estimate_fees().await.unwrap();
        assert_eq!(
            rates,
            FeeRates {
                fastest: Some(25.0),
                half_hour: Some(4.5),
                hour: Some(4.5),
            }
        );
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_syncs() {
        let provider = Arc::new(MockProvider::new());
        let engine = engine(&provider);
        engine.shutdown();
        assert!(engine.is_shut_down());

        let account = test_account(1, Network::Regtest, ScriptType::P2wpkh);
        let result = engine.sync(&account).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(matches!(engine.last_error(&account.id()), Some(SyncError::Cancelled)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let provider: Arc<dyn ChainProvider> = Arc::new(MockProvider::new());
        let result = SyncEngine::new(provider, SyncConfig::new().with_batch_size(0));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
