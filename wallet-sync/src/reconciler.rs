//! Reconciliation of scanned histories into transaction records and UTXOs.
//!
//! Fetching and reconciling are separate steps. [`TransactionReconciler`]
//! downloads every transaction in the scan, the previous transactions its
//! inputs refer to and the provider's unspent listing; [`reconcile`] then
//! turns that data into records without further I/O.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use bitcoin::{Address, Network, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use key_wallet::{
    ChainKind, RecordInput, RecordOutput, ScriptHash, TransactionRecord, TxDirection, Utxo,
    UtxoSet, sort_history,
};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{ReconcileError, SyncResult};
use crate::provider::{ChainProvider, ProviderUtxo, TransactionEntry};
use crate::retry::RetryGovernor;
use crate::scanner::ScanResult;

/// Raw provider data for one account.
#[derive(Debug, Clone, Default)]
pub struct FetchedTransactions {
    /// Transactions in the scanned histories, with their status
    pub transactions: BTreeMap<Txid, TransactionEntry>,
    /// Transactions fetched only to resolve inputs
    pub parents: BTreeMap<Txid, Transaction>,
    /// Provider unspent listing per used address
    pub reported_utxos: BTreeMap<ScriptHash, Vec<ProviderUtxo>>,
}

impl FetchedTransactions {
    fn previous_output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        let tx = self
            .transactions
            .get(&outpoint.txid)
            .map(|entry| &entry.transaction)
            .or_else(|| self.parents.get(&outpoint.txid))?;
        tx.output.get(outpoint.vout as usize)
    }
}

/// A provider unspent listing that disagrees with the reconciled set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoDiscrepancy {
    pub outpoint: OutPoint,
    /// Value in the reconciled set, `None` if absent there
    pub local_value: Option<u64>,
    /// Value reported by the provider, `None` if not listed
    pub provider_value: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Complete records in history order
    pub records: Vec<TransactionRecord>,
    pub failures: Vec<ReconcileError>,
    pub utxos: UtxoSet,
    pub discrepancies: Vec<UtxoDiscrepancy>,
}

struct Owner<'a> {
    chain: ChainKind,
    index: u32,
    address: &'a Address,
}

/// Locking scripts of every scanned address.
struct AddressSpace<'a> {
    network: Network,
    owners: HashMap<&'a ScriptBuf, Owner<'a>>,
}

impl<'a> AddressSpace<'a> {
    fn new(scan: &'a ScanResult, network: Network) -> Self {
        let owners = scan
            .addresses()
            .map(|derived| {
                (
                    &derived.script_pubkey,
                    Owner {
                        chain: derived.chain,
                        index: derived.index,
                        address: &derived.address,
                    },
                )
            })
            .collect();
        Self {
            network,
            owners,
        }
    }

    fn owner(&self, script: &ScriptBuf) -> Option<&Owner<'a>> {
        self.owners.get(script)
    }

    fn address(&self, script: &ScriptBuf) -> Option<Address> {
        match self.owner(script) {
            Some(owner) => Some(owner.address.clone()),
            None => Address::from_script(script, self.network).ok(),
        }
    }
}

pub struct TransactionReconciler<'a> {
    provider: &'a dyn ChainProvider,
    config: &'a SyncConfig,
}

impl<'a> TransactionReconciler<'a> {
    pub fn new(provider: &'a dyn ChainProvider, config: &'a SyncConfig) -> Self {
        Self {
            provider,
            config,
        }
    }

    /// Fetch and reconcile everything `scan` found.
    pub async fn reconcile(&self, scan: &ScanResult, network: Network) -> SyncResult<ReconcileOutcome> {
        let fetched = self.fetch(scan).await?;
        Ok(reconcile(scan, &fetched, network))
    }

    pub async fn fetch(&self, scan: &ScanResult) -> SyncResult<FetchedTransactions> {
        let governor = RetryGovernor::new(self.provider, &self.config.retry);
        let mut fetched = FetchedTransactions::default();

        let txids: Vec<Txid> = scan.txids.iter().copied().collect();
        for entry in self.fetch_transactions(&governor, &txids).await? {
            fetched.transactions.insert(entry.txid, entry);
        }

        let missing_parents: Vec<Txid> = fetched
            .transactions
            .values()
            .filter(|entry| !entry.transaction.is_coinbase())
            .flat_map(|entry| entry.transaction.input.iter().map(|input| input.previous_output.txid))
            .filter(|txid| !fetched.transactions.contains_key(txid))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !missing_parents.is_empty() {
            debug!("Fetching {} previous transactions", missing_parents.len());
            for entry in self.fetch_transactions(&governor, &missing_parents).await? {
                fetched.parents.insert(entry.txid, entry.transaction);
            }
        }

        let keys: Vec<ScriptHash> = scan.history.keys().copied().collect();
        for chunk in keys.chunks(self.config.tx_batch_size) {
            let provider = self.provider;
            let listings = governor.run("utxo batch", move || provider.get_utxo_batch(chunk)).await?;
            for listing in listings {
                fetched.reported_utxos.entry(listing.script_hash).or_default().extend(listing.utxos);
            }
        }

        Ok(fetched)
    }

    async fn fetch_transactions(
        &self,
        governor: &RetryGovernor<'_>,
        txids: &[Txid],
    ) -> SyncResult<Vec<TransactionEntry>> {
        let mut entries = Vec::with_capacity(txids.len());
        for chunk in txids.chunks(self.config.tx_batch_size) {
            let provider = self.provider;
            let batch = governor
                .run("transaction batch", move || provider.get_transaction_batch(chunk))
                .await?;
            entries.extend(batch);
        }
        Ok(entries)
    }
}

/// Turn fetched data into records, UTXOs and failures.
///
/// Every fetched transaction marks the outpoints it spends, complete or not.
/// Only complete transactions produce records and UTXOs.
pub fn reconcile(scan: &ScanResult, fetched: &FetchedTransactions, network: Network) -> ReconcileOutcome {
    let space = AddressSpace::new(scan, network);
    let mut outcome = ReconcileOutcome::default();

    for txid in &scan.txids {
        if !fetched.transactions.contains_key(txid) {
            warn!("Transaction {} is listed in a history but could not be fetched", txid);
            outcome.failures.push(ReconcileError::MissingTransaction {
                txid: *txid,
            });
        }
    }

    let spent: HashSet<OutPoint> = fetched
        .transactions
        .values()
        .filter(|entry| !entry.transaction.is_coinbase())
        .flat_map(|entry| entry.transaction.input.iter().map(|input| input.previous_output))
        .collect();

    for entry in fetched.transactions.values() {
        match build_record(entry, fetched, &space) {
            Ok(record) => {
                collect_utxos(&record, entry, &spent, &mut outcome.utxos);
                outcome.records.push(record);
            }
            Err(e) => {
                warn!("Incomplete reconciliation: {}", e);
                outcome.failures.push(e);
            }
        }
    }

    sort_history(&mut outcome.records);
    outcome.discrepancies = compare_utxos(&outcome.utxos, scan, &fetched.reported_utxos);
    outcome
}

fn build_record(
    entry: &TransactionEntry,
    fetched: &FetchedTransactions,
    space: &AddressSpace<'_>,
) -> Result<TransactionRecord, ReconcileError> {
    let tx = &entry.transaction;
    let txid = entry.txid;
    let is_coinbase = tx.is_coinbase();

    let mut inputs = Vec::with_capacity(tx.input.len());
    if !is_coinbase {
        for input in &tx.input {
            let outpoint = input.previous_output;
            let prevout = fetched.previous_output(&outpoint).ok_or(
                ReconcileError::UnresolvedPrevout {
                    txid,
                    outpoint,
                },
            )?;
            inputs.push(RecordInput {
                previous_output: outpoint,
                address: space.address(&prevout.script_pubkey),
                value: prevout.value.to_sat(),
                is_mine: space.owner(&prevout.script_pubkey).is_some(),
            });
        }
    }

    let outputs: Vec<RecordOutput> = tx
        .output
        .iter()
        .enumerate()
        .map(|(vout, output)| RecordOutput {
            vout: vout as u32,
            address: space.address(&output.script_pubkey),
            script_pubkey: output.script_pubkey.clone(),
            value: output.value.to_sat(),
            owner: space.owner(&output.script_pubkey).map(|owner| (owner.chain, owner.index)),
        })
        .collect();

    let input_total: u64 = inputs.iter().map(|input| input.value).sum();
    let output_total: u64 = outputs.iter().map(|output| output.value).sum();
    let fee = if is_coinbase {
        0
    } else {
        input_total.checked_sub(output_total).ok_or(ReconcileError::NegativeFee {
            txid,
            inputs: input_total,
            outputs: output_total,
        })?
    };

    let owned_in: u64 = inputs.iter().filter(|input| input.is_mine).map(|input| input.value).sum();
    let owned_out: u64 =
        outputs.iter().filter(|output| output.is_mine()).map(|output| output.value).sum();
    let direction = TxDirection::classify(
        inputs.iter().any(|input| input.is_mine),
        outputs.iter().all(RecordOutput::is_mine),
    );

    Ok(TransactionRecord {
        txid,
        inputs,
        outputs,
        status: entry.status,
        fee,
        vsize: tx.vsize() as u64,
        net_amount: (i128::from(owned_out) - i128::from(owned_in)) as i64,
        direction,
        labels: Vec::new(),
        is_coinbase,
    })
}

fn collect_utxos(
    record: &TransactionRecord,
    entry: &TransactionEntry,
    spent: &HashSet<OutPoint>,
    utxos: &mut UtxoSet,
) {
    for output in &record.outputs {
        let (Some((chain, index)), Some(address)) = (output.owner, output.address.as_ref()) else {
            continue;
        };
        let outpoint = OutPoint::new(record.txid, output.vout);
        if spent.contains(&outpoint) {
            continue;
        }
        let Some(txout) = entry.transaction.output.get(output.vout as usize) else {
            continue;
        };
        let mut utxo =
            Utxo::new(outpoint, txout.clone(), address.clone(), chain, index, record.status);
        utxo.is_coinbase = record.is_coinbase;
        utxos.add(utxo);
    }
}

/// Differences between the reconciled set and the provider listing, limited
/// to the addresses that were listed.
fn compare_utxos(
    utxos: &UtxoSet,
    scan: &ScanResult,
    reported: &BTreeMap<ScriptHash, Vec<ProviderUtxo>>,
) -> Vec<UtxoDiscrepancy> {
    let listed_scripts: HashSet<&ScriptBuf> = scan
        .used_addresses()
        .filter(|derived| reported.contains_key(&derived.script_hash()))
        .map(|derived| &derived.script_pubkey)
        .collect();
    let local: BTreeMap<OutPoint, u64> = utxos
        .iter()
        .filter(|utxo| listed_scripts.contains(&utxo.txout.script_pubkey))
        .map(|utxo| (utxo.outpoint, utxo.value()))
        .collect();
    let remote: BTreeMap<OutPoint, u64> = reported
        .values()
        .flatten()
        .map(|utxo| (utxo.outpoint, utxo.value))
        .collect();

    let outpoints: BTreeSet<&OutPoint> = local.keys().chain(remote.keys()).collect();
    outpoints
        .into_iter()
        .filter_map(|outpoint| {
            let local_value = local.get(outpoint).copied();
            let provider_value = remote.get(outpoint).copied();
            (local_value != provider_value).then_some(UtxoDiscrepancy {
                outpoint: *outpoint,
                local_value,
                provider_value,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::scanner::GapLimitScanner;
    use crate::test_utils::{MockProvider, ProviderCall};
    use key_wallet::{AccountDescriptor, ScriptType, TxStatus, derive_address};
    use std::time::Duration;
    use wallet_test_utils::{
        TestTransactionBuilder, confirmed_at, foreign_script, funding_tx, test_account, unknown_txid,
    };

    struct Fixture {
        account: AccountDescriptor,
        provider: MockProvider,
        config: SyncConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                account: test_account(3, Network::Regtest, ScriptType::P2wpkh),
                provider: MockProvider::new(),
                config: SyncConfig::new()
                    .with_batch_size(5)
                    .with_retry(RetryPolicy::default().with_backoff(Duration::ZERO)),
            }
        }

        fn script(&self, chain: ChainKind, index: u32) -> ScriptBuf {
            derive_address(&self.account, chain, index).unwrap().script_pubkey
        }

        fn fund(&self, index: u32, sats: u64, tag: u32) -> Transaction {
            let tx = funding_tx(&self.script(ChainKind::Receive, index), sats, tag);
            self.provider.add_transaction(tx.clone(), confirmed_at(600_000 + tag, 1_500_000_000));
            tx
        }

        async fn run(&self) -> (ScanResult, ReconcileOutcome) {
            let scan =
                GapLimitScanner::new(&self.account, &self.provider, &self.config).scan().await.unwrap();
            let outcome = TransactionReconciler::new(&self.provider, &self.config)
                .reconcile(&scan, Network::Regtest)
                .await
                .unwrap();
            (scan, outcome)
        }
    }

    #[tokio::test]
    async fn test_fee_from_resolved_inputs() {
        let f = Fixture::new();
        let a = f.fund(0, 50_000, 1);
        let b = f.fund(1, 30_000, 2);
        let spend = TestTransactionBuilder::new()
            .spend_output(&a, 0)
            .spend_output(&b, 0)
            .pay_to_script(&foreign_script(9), 70_000)
            .pay_to_script(&f.script(ChainKind::Change, 0), 9_000)
            .build();
        let spend_txid = f.provider.add_transaction(spend, TxStatus::Unconfirmed);

        let (scan, outcome) = f.run().await;
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(scan.change.used.len(), 1);

        let record = &outcome.records[0];
        assert_eq!(record.txid, spend_txid);
        assert_eq!(record.fee, 1_000);
        assert_eq!(record.direction, TxDirection::Sent);
        assert_eq!(record.net_amount, 9_000 - 80_000);
        assert_eq!(record.outputs[1].owner, Some((ChainKind::Change, 0)));
        assert!(record.outputs[1].is_change());

        assert_eq!(outcome.utxos.len(), 1);
        assert_eq!(outcome.utxos.total_balance(), 9_000);
        assert_eq!(outcome.utxos.balance().unconfirmed, 9_000);
        assert!(outcome.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_input_is_reported_not_dropped() {
        let f = Fixture::new();
        f.fund(0, 10_000, 1);
        let orphan = TestTransactionBuilder::new()
            .spend(OutPoint::new(unknown_txid(0xab), 0))
            .pay_to_script(&f.script(ChainKind::Receive, 1), 20_000)
            .build();
        let orphan_txid = f.provider.add_transaction(orphan, confirmed_at(600_010, 1_500_000_100));

        let (_, outcome) = f.run().await;

        assert_eq!(
            outcome.failures,
            vec![ReconcileError::UnresolvedPrevout {
                txid: orphan_txid,
                outpoint: OutPoint::new(unknown_txid(0xab), 0),
            }]
        );
        assert!(outcome.records.iter().all(|r| r.txid != orphan_txid));
        assert_eq!(outcome.utxos.total_balance(), 10_000);
        // the provider still lists the orphan's output
        assert_eq!(outcome.discrepancies.len(), 1);
        assert_eq!(outcome.discrepancies[0].provider_value, Some(20_000));
        assert_eq!(outcome.discrepancies[0].local_value, None);
    }

    #[tokio::test]
    async fn test_negative_fee_is_a_failure() {
        let f = Fixture::new();
        let parent = f.fund(0, 10_000, 1);
        let child = TestTransactionBuilder::new()
            .spend_output(&parent, 0)
            .pay_to_script(&f.script(ChainKind::Receive, 1), 20_000)
            .build();
        let child_txid = f.provider.add_transaction(child, TxStatus::Unconfirmed);

        let (_, outcome) = f.run().await;
        assert_eq!(
            outcome.failures,
            vec![ReconcileError::NegativeFee {
                txid: child_txid,
                inputs: 10_000,
                outputs: 20_000,
            }]
        );
        // the parent output is still spent by the incomplete child
        assert!(outcome.utxos.is_empty());
    }

    #[tokio::test]
    async fn test_missing_transaction_is_reported() {
        let f = Fixture::new();
        let tx = f.fund(0, 10_000, 1);
        f.provider.hide_transaction(tx.compute_txid());

        let (_, outcome) = f.run().await;
        assert_eq!(
            outcome.failures,
            vec![ReconcileError::MissingTransaction {
                txid: tx.compute_txid(),
            }]
        );
        assert!(outcome.records.is_empty());
    }

    #[tokio::test]
    async fn test_coinbase_and_self_transfer() {
        let f = Fixture::new();
        let coinbase = f.fund(0, 50_000, 1);
        let shuffle = TestTransactionBuilder::new()
            .spend_output(&coinbase, 0)
            .pay_to_script(&f.script(ChainKind::Receive, 1), 30_000)
            .pay_to_script(&f.script(ChainKind::Change, 0), 19_500)
            .build();
        f.provider.add_transaction(shuffle, TxStatus::Unconfirmed);

        let (_, outcome) = f.run().await;
        let coinbase_record =
            outcome.records.iter().find(|r| r.txid == coinbase.compute_txid()).unwrap();
        assert!(coinbase_record.is_coinbase);
        assert_eq!(coinbase_record.fee, 0);
        assert_eq!(coinbase_record.direction, TxDirection::Received);
        assert_eq!(coinbase_record.net_amount, 50_000);

        let moved = &outcome.records[0];
        assert_eq!(moved.direction, TxDirection::Moved);
        assert_eq!(moved.fee, 500);
        assert_eq!(moved.net_amount, -500);
        assert_eq!(outcome.utxos.total_balance(), 49_500);
    }

    #[tokio::test]
    async fn test_coinbase_utxo_is_flagged() {
        let f = Fixture::new();
        let coinbase = f.fund(0, 50_000, 1);
        let (_, outcome) = f.run().await;
        let utxo = outcome.utxos.get(&OutPoint::new(coinbase.compute_txid(), 0)).unwrap();
        assert!(utxo.is_coinbase);
        assert_eq!(utxo.chain, ChainKind::Receive);
        assert_eq!(utxo.index, 0);
    }

    #[tokio::test]
    async fn test_transaction_fetches_are_chunked() {
        let mut f = Fixture::new();
        f.config = f.config.clone().with_tx_batch_size(2);
        for index in 0..5 {
            f.fund(index, 1_000, index + 1);
        }
        let (_, outcome) = f.run().await;
        assert_eq!(outcome.records.len(), 5);

        let batches: Vec<usize> = f
            .provider
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ProviderCall::Transactions(txids) => Some(txids.len()),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_provider_listing_mismatch() {
        let f = Fixture::new();
        let tx = f.fund(0, 10_000, 1);
        let key = ScriptHash::from_script(&f.script(ChainKind::Receive, 0));
        f.provider.report_utxos(
            key,
            vec![ProviderUtxo {
                outpoint: OutPoint::new(tx.compute_txid(), 0),
                value: 9_999,
                height: Some(600_001),
            }],
        );

        let (_, outcome) = f.run().await;
        assert_eq!(
            outcome.discrepancies,
            vec![UtxoDiscrepancy {
                outpoint: OutPoint::new(tx.compute_txid(), 0),
                local_value: Some(10_000),
                provider_value: Some(9_999),
            }]
        );
        // the reconciled set wins
        assert_eq!(outcome.utxos.total_balance(), 10_000);
    }
}
