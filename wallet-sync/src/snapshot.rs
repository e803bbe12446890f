//! The account view handed to callers after a sync.

use std::fmt;

use bitcoin::{Network, Txid};
use key_wallet::{
    AccountBalance, AccountDescriptor, AccountId, ChainKind, DerivedAddress, TransactionRecord,
    Utxo, sort_history,
};

use crate::error::{ProviderError, ReconcileError};
use crate::labels::{LabelKey, LabelMap};
use crate::reconciler::{ReconcileOutcome, UtxoDiscrepancy};
use crate::scanner::ScanResult;

/// Addresses of one chain, each list sorted by derivation index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    pub used: Vec<DerivedAddress>,
    pub unused: Vec<DerivedAddress>,
}

impl AddressSet {
    pub fn len(&self) -> usize {
        self.used.len() + self.unused.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something the caller should know about a snapshot that still succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncWarning {
    /// Transaction left out of records, UTXOs and balance
    IncompleteReconciliation(ReconcileError),
    /// Scan cycle counted as empty after its retries ran out. Addresses in
    /// it may have history the snapshot does not show.
    DegradedCycle {
        cycle: u32,
        error: ProviderError,
    },
    /// Provider unspent listing disagrees with the reconciled set
    UtxoMismatch(UtxoDiscrepancy),
}

impl fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncWarning::IncompleteReconciliation(e) => write!(f, "incomplete reconciliation: {}", e),
            SyncWarning::DegradedCycle {
                cycle,
                error,
            } => write!(f, "scan cycle {} treated as empty: {}", cycle, error),
            SyncWarning::UtxoMismatch(d) => write!(
                f,
                "unspent output {} differs: local {:?}, provider {:?}",
                d.outpoint, d.local_value, d.provider_value
            ),
        }
    }
}

/// Reconstructed state of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub account_id: AccountId,
    pub account_name: String,
    pub network: Network,
    pub receive: AddressSet,
    pub change: AddressSet,
    /// Unspent outputs in outpoint order
    pub utxos: Vec<Utxo>,
    pub balance: AccountBalance,
    /// Complete records in history order
    pub transactions: Vec<TransactionRecord>,
    pub warnings: Vec<SyncWarning>,
    pub cycles: u32,
    /// Chain height reported by the provider during the sync
    pub tip_height: Option<u32>,
}

impl AccountSnapshot {
    pub fn addresses(&self, chain: ChainKind) -> &AddressSet {
        match chain {
            ChainKind::Receive => &self.receive,
            ChainKind::Change => &self.change,
        }
    }

    /// Lowest unused receive address.
    pub fn next_receive_address(&self) -> Option<&DerivedAddress> {
        self.receive.unused.first()
    }

    pub fn next_change_address(&self) -> Option<&DerivedAddress> {
        self.change.unused.first()
    }

    pub fn transaction(&self, txid: &Txid) -> Option<&TransactionRecord> {
        self.transactions.iter().find(|record| record.txid == *txid)
    }

    pub fn total_balance(&self) -> u64 {
        self.balance.total()
    }

    /// No transaction was left out and no cycle was degraded.
    pub fn is_complete(&self) -> bool {
        !self.warnings.iter().any(|warning| {
            matches!(
                warning,
                SyncWarning::IncompleteReconciliation(_) | SyncWarning::DegradedCycle { .. }
            )
        })
    }

    pub fn incomplete_transactions(&self) -> impl Iterator<Item = &ReconcileError> {
        self.warnings.iter().filter_map(|warning| match warning {
            SyncWarning::IncompleteReconciliation(e) => Some(e),
            _ => None,
        })
    }
}

/// Assembles a snapshot from scan and reconciliation results. Pure: the
/// same inputs always build the same snapshot.
pub struct AccountSnapshotBuilder<'a> {
    descriptor: &'a AccountDescriptor,
    scan: ScanResult,
    outcome: ReconcileOutcome,
    labels: LabelMap,
    tip_height: Option<u32>,
}

impl<'a> AccountSnapshotBuilder<'a> {
    pub fn new(descriptor: &'a AccountDescriptor, scan: ScanResult, outcome: ReconcileOutcome) -> Self {
        Self {
            descriptor,
            scan,
            outcome,
            labels: LabelMap::new(),
            tip_height: None,
        }
    }

    pub fn with_labels(mut self, labels: LabelMap) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_tip_height(mut self, tip_height: u32) -> Self {
        self.tip_height = Some(tip_height);
        self
    }

    /// Keys worth asking a label store about.
    pub fn label_keys(scan: &ScanResult, outcome: &ReconcileOutcome) -> Vec<LabelKey> {
        let addresses = scan.addresses().map(|derived| LabelKey::Address(derived.address.to_string()));
        let transactions = outcome.records.iter().map(|record| LabelKey::Transaction(record.txid));
        let outputs = outcome.utxos.outpoints().map(|outpoint| LabelKey::Output(*outpoint));
        addresses.chain(transactions).chain(outputs).collect()
    }

    pub fn build(self) -> AccountSnapshot {
        let Self {
            descriptor,
            scan,
            outcome,
            labels,
            tip_height,
        } = self;

        let address_set = |used: Vec<DerivedAddress>, unused: Vec<DerivedAddress>| AddressSet {
            used: sorted_by_index(used, &labels),
            unused: sorted_by_index(unused, &labels),
        };
        let receive = address_set(scan.receive.used, scan.receive.unused);
        let change = address_set(scan.change.used, scan.change.unused);

        let balance = outcome.utxos.balance();
        let utxos = outcome
            .utxos
            .into_vec()
            .into_iter()
            .map(|mut utxo| {
                merge_labels(&mut utxo.labels, &labels, &LabelKey::Output(utxo.outpoint));
                merge_labels(&mut utxo.labels, &labels, &LabelKey::Address(utxo.address.to_string()));
                utxo
            })
            .collect();

        let mut transactions = outcome.records;
        for record in &mut transactions {
            merge_labels(&mut record.labels, &labels, &LabelKey::Transaction(record.txid));
        }
        sort_history(&mut transactions);

        let warnings = scan
            .degraded
            .into_iter()
            .map(|degraded| SyncWarning::DegradedCycle {
                cycle: degraded.cycle,
                error: degraded.error,
            })
            .chain(outcome.failures.into_iter().map(SyncWarning::IncompleteReconciliation))
            .chain(outcome.discrepancies.into_iter().map(SyncWarning::UtxoMismatch))
            .collect();

        AccountSnapshot {
            account_id: descriptor.id(),
            account_name: descriptor.name().to_string(),
            network: descriptor.network(),
            receive,
            change,
            utxos,
            balance,
            transactions,
            warnings,
            cycles: scan.cycles,
            tip_height,
        }
    }
}

fn sorted_by_index(mut addresses: Vec<DerivedAddress>, labels: &LabelMap) -> Vec<DerivedAddress> {
    addresses.sort_by_key(|derived| derived.index);
    for derived in &mut addresses {
        let key = LabelKey::Address(derived.address.to_string());
        merge_labels(&mut derived.labels, labels, &key);
    }
    addresses
}

fn merge_labels(target: &mut Vec<String>, labels: &LabelMap, key: &LabelKey) {
    for label in labels.get(key).into_iter().flatten() {
        if !target.contains(label) {
            target.push(label.clone());
        }
    }
}
