//! Blockchain data providers.
//!
//! A [`ChainProvider`] answers the questions a sync asks about the chain:
//! which transactions touched a script, what a transaction looks like and
//! where it is confirmed, which outputs of a script are unspent. Scanning and
//! reconciliation only ever talk to this trait, so swapping providers never
//! changes their results.

pub mod electrum;
pub mod esplora;

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{OutPoint, Transaction, Txid};
use key_wallet::{ScriptHash, TxStatus};

use crate::config::ProviderConfig;
use crate::error::{ProviderResult, SyncError};

pub use electrum::{ElectrumProtocol, ElectrumProvider};
pub use esplora::EsploraProvider;

/// Transactions touching one script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHistory {
    pub script_hash: ScriptHash,
    pub txids: Vec<Txid>,
}

/// A transaction with its confirmation status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEntry {
    pub txid: Txid,
    pub transaction: Transaction,
    pub status: TxStatus,
}

/// An output the provider reports as unspent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderUtxo {
    pub outpoint: OutPoint,
    /// Value in satoshis
    pub value: u64,
    /// Confirmation height, `None` while in the mempool
    pub height: Option<u32>,
}

/// Unspent outputs of one script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptUtxos {
    pub script_hash: ScriptHash,
    pub utxos: Vec<ProviderUtxo>,
}

/// Blockchain data source.
///
/// Batch methods take any number of keys. Transactions the provider does not
/// know are left out of [`ChainProvider::get_transaction_batch`] results
/// rather than failing the whole batch.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// (Re)establish the connection and learn the chain tip.
    async fn initialize(&self) -> ProviderResult<()>;

    /// Height of the best block known to the provider
    async fn tip_height(&self) -> ProviderResult<u32>;

    async fn get_history_batch(&self, keys: &[ScriptHash]) -> ProviderResult<Vec<ScriptHistory>>;

    async fn get_transaction_batch(&self, txids: &[Txid])
    -> ProviderResult<Vec<TransactionEntry>>;

    async fn get_utxo_batch(&self, keys: &[ScriptHash]) -> ProviderResult<Vec<ScriptUtxos>>;

    /// Fee rate in sat/vB for confirmation within `target_blocks`, `None`
    /// when the provider has no estimate.
    async fn estimate_fee(&self, target_blocks: u16) -> ProviderResult<Option<f64>>;

    /// Submit a raw transaction and return its txid.
    async fn broadcast(&self, raw_tx_hex: &str) -> ProviderResult<Txid>;

    async fn is_confirmed(&self, txid: &Txid) -> ProviderResult<bool>;
}

/// Build the provider described by `config`. The connection is opened
/// lazily by [`ChainProvider::initialize`].
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn ChainProvider>, SyncError> {
    match config {
        ProviderConfig::Electrum {
            host,
            port,
            protocol,
            proxy,
            timeout,
        } => Ok(Arc::new(
            ElectrumProvider::new(format!("{}:{}", host, port), *timeout)
                .with_protocol(*protocol)
                .with_proxy(proxy.clone()),
        )),
        ProviderConfig::Esplora {
            base_url,
            timeout,
        } => Ok(Arc::new(EsploraProvider::new(base_url, *timeout)?)),
    }
}
