//! In-memory chain provider for tests.
//!
//! Histories and unspent outputs are computed from the stored transactions
//! at query time: a transaction belongs to a script's history when one of
//! its outputs pays the script or one of its inputs spends a stored output
//! that did.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{OutPoint, Transaction, Txid};
use key_wallet::{ScriptHash, TxStatus};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{ChainProvider, ProviderUtxo, ScriptHistory, ScriptUtxos, TransactionEntry};

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Initialize,
    TipHeight,
    History(Vec<ScriptHash>),
    Transactions(Vec<Txid>),
    Utxos(Vec<ScriptHash>),
    EstimateFee(u16),
    Broadcast(String),
    IsConfirmed(Txid),
}

#[derive(Default)]
struct Faults {
    history: u32,
    transactions: u32,
    utxos: u32,
    initialize: bool,
    broadcast: Option<String>,
}

struct State {
    tip: u32,
    order: Vec<Txid>,
    transactions: HashMap<Txid, (Transaction, TxStatus)>,
    hidden: HashSet<Txid>,
    reported_utxos: HashMap<ScriptHash, Vec<ProviderUtxo>>,
    fee_rates: BTreeMap<u16, f64>,
    faults: Faults,
    calls: Vec<ProviderCall>,
}

pub struct MockProvider {
    state: Mutex<State>,
    delay: Option<Duration>,
    reversed: bool,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tip: 800_000,
                order: Vec::new(),
                transactions: HashMap::new(),
                hidden: HashSet::new(),
                reported_utxos: HashMap::new(),
                fee_rates: BTreeMap::new(),
                faults: Faults::default(),
                calls: Vec::new(),
            }),
            delay: None,
            reversed: false,
        }
    }

    /// Delay every history call, so concurrent syncs overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer batch calls in reverse request order.
    pub fn with_reversed_responses(mut self) -> Self {
        self.reversed = true;
        self
    }

    fn answer<T>(&self, mut items: Vec<T>) -> Vec<T> {
        if self.reversed {
            items.reverse();
        }
        items
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_tip(&self, tip: u32) {
        self.state().tip = tip;
    }

    /// Store `tx`. Re-adding a transaction only updates its status.
    pub fn add_transaction(&self, tx: Transaction, status: TxStatus) -> Txid {
        let txid = tx.compute_txid();
        let mut state = self.state();
        if state.transactions.insert(txid, (tx, status)).is_none() {
            state.order.push(txid);
        }
        txid
    }

    pub fn set_status(&self, txid: Txid, status: TxStatus) {
        if let Some(entry) = self.state().transactions.get_mut(&txid) {
            entry.1 = status;
        }
    }

    /// Keep `txid` in histories but leave it out of transaction lookups.
    pub fn hide_transaction(&self, txid: Txid) {
        self.state().hidden.insert(txid);
    }

    /// Report `utxos` for `script_hash` instead of the computed ones.
    pub fn report_utxos(&self, script_hash: ScriptHash, utxos: Vec<ProviderUtxo>) {
        self.state().reported_utxos.insert(script_hash, utxos);
    }

    pub fn set_fee_rate(&self, target: u16, sat_per_vb: f64) {
        self.state().fee_rates.insert(target, sat_per_vb);
    }

    /// Fail the next `count` history calls with a timeout.
    pub fn fail_next_history(&self, count: u32) {
        self.state().faults.history = count;
    }

    pub fn fail_next_transactions(&self, count: u32) {
        self.state().faults.transactions = count;
    }

    pub fn fail_next_utxos(&self, count: u32) {
        self.state().faults.utxos = count;
    }

    /// Make every `initialize` call fail until switched off again.
    pub fn fail_initialize(&self, fail: bool) {
        self.state().faults.initialize = fail;
    }

    pub fn reject_broadcast(&self, reason: impl Into<String>) {
        self.state().faults.broadcast = Some(reason.into());
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Calls other than `Initialize` and `TipHeight`, i.e. the scan itself.
    pub fn scan_calls(&self) -> Vec<ProviderCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, ProviderCall::Initialize | ProviderCall::TipHeight))
            .collect()
    }
}

impl State {
    fn record(&mut self, call: ProviderCall) {
        self.calls.push(call);
    }

    fn take_fault(counter: &mut u32, what: &str) -> ProviderResult<()> {
        if *counter > 0 {
            *counter -= 1;
            return Err(ProviderError::Timeout(format!("injected {} failure", what)));
        }
        Ok(())
    }

    fn output_script_hash(&self, outpoint: &OutPoint) -> Option<ScriptHash> {
        let (tx, _) = self.transactions.get(&outpoint.txid)?;
        let output = tx.output.get(outpoint.vout as usize)?;
        Some(ScriptHash::from_script(&output.script_pubkey))
    }

    fn history(&self, key: &ScriptHash) -> Vec<Txid> {
        self.order
            .iter()
            .filter(|txid| {
                let Some((tx, _)) = self.transactions.get(*txid) else {
                    return false;
                };
                tx.output.iter().any(|o| ScriptHash::from_script(&o.script_pubkey) == *key)
                    || tx.input.iter().any(|i| {
                        self.output_script_hash(&i.previous_output).as_ref() == Some(key)
                    })
            })
            .copied()
            .collect()
    }

    fn spent(&self) -> HashSet<OutPoint> {
        self.transactions
            .values()
            .flat_map(|(tx, _)| tx.input.iter().map(|i| i.previous_output))
            .collect()
    }

    fn utxos(&self, key: &ScriptHash) -> Vec<ProviderUtxo> {
        if let Some(reported) = self.reported_utxos.get(key) {
            return reported.clone();
        }
        let spent = self.spent();
        let mut utxos = Vec::new();
        for txid in &self.order {
            let Some((tx, status)) = self.transactions.get(txid) else {
                continue;
            };
            for (vout, output) in tx.output.iter().enumerate() {
                let outpoint = OutPoint::new(*txid, vout as u32);
                if ScriptHash::from_script(&output.script_pubkey) == *key
                    && !spent.contains(&outpoint)
                {
                    utxos.push(ProviderUtxo {
                        outpoint,
                        value: output.value.to_sat(),
                        height: status.height(),
                    });
                }
            }
        }
        utxos
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn initialize(&self) -> ProviderResult<()> {
        let mut state = self.state();
        state.record(ProviderCall::Initialize);
        if state.faults.initialize {
            return Err(ProviderError::Connection("injected initialize failure".to_string()));
        }
        Ok(())
    }

    async fn tip_height(&self) -> ProviderResult<u32> {
        let mut state = self.state();
        state.record(ProviderCall::TipHeight);
        Ok(state.tip)
    }

    async fn get_history_batch(&self, keys: &[ScriptHash]) -> ProviderResult<Vec<ScriptHistory>> {
        let result: ProviderResult<Vec<ScriptHistory>> = {
            let mut state = self.state();
            state.record(ProviderCall::History(keys.to_vec()));
            State::take_fault(&mut state.faults.history, "history").map(|()| {
                keys.iter()
                    .map(|key| ScriptHistory {
                        script_hash: *key,
                        txids: state.history(key),
                    })
                    .collect()
            })
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        result.map(|histories| self.answer(histories))
    }

    async fn get_transaction_batch(
        &self,
        txids: &[Txid],
    ) -> ProviderResult<Vec<TransactionEntry>> {
        let mut state = self.state();
        state.record(ProviderCall::Transactions(txids.to_vec()));
        State::take_fault(&mut state.faults.transactions, "transaction")?;
        let entries = txids
            .iter()
            .filter(|txid| !state.hidden.contains(*txid))
            .filter_map(|txid| {
                state.transactions.get(txid).map(|(tx, status)| TransactionEntry {
                    txid: *txid,
                    transaction: tx.clone(),
                    status: *status,
                })
            })
            .collect();
        Ok(self.answer(entries))
    }

    async fn get_utxo_batch(&self, keys: &[ScriptHash]) -> ProviderResult<Vec<ScriptUtxos>> {
        let mut state = self.state();
        state.record(ProviderCall::Utxos(keys.to_vec()));
        State::take_fault(&mut state.faults.utxos, "utxo")?;
        let listings = keys
            .iter()
            .map(|key| ScriptUtxos {
                script_hash: *key,
                utxos: state.utxos(key),
            })
            .collect();
        Ok(self.answer(listings))
    }

    async fn estimate_fee(&self, target_blocks: u16) -> ProviderResult<Option<f64>> {
        let mut state = self.state();
        state.record(ProviderCall::EstimateFee(target_blocks));
        Ok(state.fee_rates.range(target_blocks..).next().map(|(_, rate)| *rate))
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> ProviderResult<Txid> {
        let mut state = self.state();
        state.record(ProviderCall::Broadcast(raw_tx_hex.to_string()));
        if let Some(reason) = state.faults.broadcast.clone() {
            return Err(ProviderError::Rejected(reason));
        }
        let bytes = hex::decode(raw_tx_hex)
            .map_err(|e| ProviderError::Rejected(format!("TX decode failed: {}", e)))?;
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| ProviderError::Rejected(format!("TX decode failed: {}", e)))?;
        let txid = tx.compute_txid();
        if state.transactions.insert(txid, (tx, TxStatus::Unconfirmed)).is_none() {
            state.order.push(txid);
        }
        Ok(txid)
    }

    async fn is_confirmed(&self, txid: &Txid) -> ProviderResult<bool> {
        let mut state = self.state();
        state.record(ProviderCall::IsConfirmed(*txid));
        Ok(state.transactions.get(txid).is_some_and(|(_, status)| status.is_confirmed()))
    }
}
