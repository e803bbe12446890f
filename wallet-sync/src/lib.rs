//! Watch-only account synchronization for Bitcoin HD wallets.
//!
//! This library reconstructs the on-chain state of an account from its
//! extended public keys and a remote blockchain data provider:
//!
//! - Walk receive and change chains under a gap limit, in batches
//! - Fetch histories, transactions and unspent outputs over Electrum or Esplora
//! - Resolve inputs against previous outputs to compute fees and ownership
//! - Assemble a deterministic snapshot with balances, addresses and history
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wallet_sync::{ProviderConfig, SyncConfig, SyncEngine};
//! use wallet_sync::config::parse_accounts;
//! use wallet_sync::provider;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let accounts = parse_accounts(&std::fs::read_to_string("accounts.json")?)?;
//!     let provider = provider::from_config(&ProviderConfig::esplora_default(accounts[0].network()))?;
//!
//!     let engine = SyncEngine::new(provider, SyncConfig::new())?;
//!     for result in engine.sync_all(&accounts).await {
//!         let snapshot = result?;
//!         println!("{}: {} sat", snapshot.account_name, snapshot.total_balance());
//!     }
//!     Ok(())
//! }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod config;
pub mod engine;
pub mod error;
pub mod labels;
pub mod logging;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod scanner;
pub mod snapshot;

// Re-export main types for convenience
pub use config::{ProviderConfig, SyncConfig};
pub use engine::{FeeRates, SyncEngine, SyncOutcome};
pub use error::{
    LoggingError, LoggingResult, ProviderError, ProviderResult, ReconcileError, SyncError,
    SyncResult,
};
pub use labels::{InMemoryLabelStore, LabelKey, LabelMap, LabelStore, NoLabels};
pub use logging::{init_logging, LogFileConfig, LoggingConfig, LoggingGuard};
pub use provider::{ChainProvider, ElectrumProtocol, ElectrumProvider, EsploraProvider};
pub use retry::{ExhaustedPolicy, RetryGovernor, RetryPolicy};
pub use snapshot::{AccountSnapshot, AccountSnapshotBuilder, AddressSet, SyncWarning};

pub use key_wallet;
pub use key_wallet::{AccountDescriptor, AccountId, Network};

/// Current version of the wallet-sync library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
