//! Transaction records for reconstructed accounts
//!
//! A [`TransactionRecord`] is the reconciled view of one transaction as seen
//! by a single account: which inputs and outputs belong to it, what it paid
//! in fees and how it moved the account balance.

use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

use bitcoin::{Address, BlockHash, OutPoint, ScriptBuf, Txid};

use crate::address::ChainKind;

/// Confirmation status reported by the data provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// In the mempool
    Unconfirmed,
    /// Included in a block
    Confirmed {
        height: u32,
        block_hash: Option<BlockHash>,
        /// Block timestamp in seconds since the epoch
        block_time: Option<u64>,
    },
}

impl TxStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TxStatus::Confirmed { .. })
    }

    pub fn height(&self) -> Option<u32> {
        match self {
            TxStatus::Confirmed { height, .. } => Some(*height),
            TxStatus::Unconfirmed => None,
        }
    }

    pub fn block_time(&self) -> Option<u64> {
        match self {
            TxStatus::Confirmed { block_time, .. } => *block_time,
            TxStatus::Unconfirmed => None,
        }
    }

    /// Calculate the number of confirmations based on current chain height
    pub fn confirmations(&self, current_height: u32) -> u32 {
        match self.height() {
            // The including block counts as the first confirmation
            Some(tx_height) if current_height >= tx_height => current_height - tx_height + 1,
            _ => 0,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStatus::Unconfirmed => f.write_str("unconfirmed"),
            TxStatus::Confirmed { height, .. } => write!(f, "confirmed at {}", height),
        }
    }
}

/// How a transaction moved value relative to the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxDirection {
    /// None of the inputs belong to the account
    Received,
    /// Some inputs belong to the account and value left it
    Sent,
    /// Inputs and every output belong to the account
    Moved,
}

impl TxDirection {
    /// Classify a transaction from its ownership flags.
    pub fn classify(any_input_owned: bool, all_outputs_owned: bool) -> Self {
        match (any_input_owned, all_outputs_owned) {
            (false, _) => TxDirection::Received,
            (true, true) => TxDirection::Moved,
            (true, false) => TxDirection::Sent,
        }
    }
}

impl fmt::Display for TxDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxDirection::Received => f.write_str("received"),
            TxDirection::Sent => f.write_str("sent"),
            TxDirection::Moved => f.write_str("moved"),
        }
    }
}

/// A resolved input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInput {
    /// Outpoint being spent
    pub previous_output: OutPoint,
    /// Address of the spent output, if it encodes to one
    pub address: Option<Address>,
    /// Value of the spent output in satoshis
    pub value: u64,
    /// Whether the spent output belonged to the account
    pub is_mine: bool,
}

/// An output with its ownership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutput {
    pub vout: u32,
    /// Address of the output, if it encodes to one
    pub address: Option<Address>,
    pub script_pubkey: ScriptBuf,
    /// Value in satoshis
    pub value: u64,
    /// Chain and index of the owning account address
    pub owner: Option<(ChainKind, u32)>,
}

impl RecordOutput {
    pub fn is_mine(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_change(&self) -> bool {
        matches!(self.owner, Some((ChainKind::Change, _)))
    }
}

/// Transaction record with full details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Transaction ID
    pub txid: Txid,
    /// Inputs with their resolved previous outputs (empty for coinbase)
    pub inputs: Vec<RecordInput>,
    pub outputs: Vec<RecordOutput>,
    pub status: TxStatus,
    /// Sum of inputs minus sum of outputs, zero for coinbase
    pub fee: u64,
    /// Virtual size in vbytes
    pub vsize: u64,
    /// Net amount for this account
    pub net_amount: i64,
    pub direction: TxDirection,
    /// Transaction labels
    pub labels: Vec<String>,
    pub is_coinbase: bool,
}

impl TransactionRecord {
    /// Fee rate in sat/vB
    pub fn fee_rate(&self) -> f64 {
        if self.vsize == 0 {
            return 0.0;
        }
        self.fee as f64 / self.vsize as f64
    }

    /// Check if the transaction is confirmed (has at least 1 confirmation)
    pub fn is_confirmed(&self) -> bool {
        self.status.is_confirmed()
    }

    pub fn height(&self) -> Option<u32> {
        self.status.height()
    }

    /// Calculate the number of confirmations based on current chain height
    pub fn confirmations(&self, current_height: u32) -> u32 {
        self.status.confirmations(current_height)
    }

    /// Check if this is an incoming transaction (positive net amount)
    pub fn is_incoming(&self) -> bool {
        self.net_amount > 0
    }

    /// Check if this is an outgoing transaction (negative net amount)
    pub fn is_outgoing(&self) -> bool {
        self.net_amount < 0
    }

    /// Get the absolute value of the net amount
    pub fn amount(&self) -> u64 {
        self.net_amount.unsigned_abs()
    }

    /// Value received by account addresses
    pub fn owned_output_value(&self) -> u64 {
        self.outputs.iter().filter(|o| o.is_mine()).map(|o| o.value).sum()
    }

    /// Value spent from account addresses
    pub fn owned_input_value(&self) -> u64 {
        self.inputs.iter().filter(|i| i.is_mine).map(|i| i.value).sum()
    }
}

/// History order: mempool transactions first, then confirmed ones newest
/// first by block time. Confirmed transactions without a block time come
/// after every timed one, newest first by height. Ties are broken by txid.
pub fn history_order(a: &TransactionRecord, b: &TransactionRecord) -> Ordering {
    status_order(&a.status, &b.status).then_with(|| a.txid.cmp(&b.txid))
}

fn status_order(a: &TxStatus, b: &TxStatus) -> Ordering {
    match (a, b) {
        (TxStatus::Unconfirmed, TxStatus::Unconfirmed) => Ordering::Equal,
        (TxStatus::Unconfirmed, TxStatus::Confirmed { .. }) => Ordering::Less,
        (TxStatus::Confirmed { .. }, TxStatus::Unconfirmed) => Ordering::Greater,
        (
            TxStatus::Confirmed {
                height: ha,
                block_time: ta,
                ..
            },
            TxStatus::Confirmed {
                height: hb,
                block_time: tb,
                ..
            },
        ) => {
            match (ta, tb) {
                (Some(ta), Some(tb)) => tb.cmp(ta),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => hb.cmp(ha),
            }
        }
    }
}

/// Sort records into history order.
pub fn sort_history(records: &mut [TransactionRecord]) {
    records.sort_by(history_order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn record(txid_byte: u8, status: TxStatus) -> TransactionRecord {
        TransactionRecord {
            txid: Txid::from_byte_array([txid_byte; 32]),
            inputs: Vec::new(),
            outputs: Vec::new(),
            status,
            fee: 0,
            vsize: 0,
            net_amount: 0,
            direction: TxDirection::Received,
            labels: Vec::new(),
            is_coinbase: false,
        }
    }

    fn confirmed(height: u32, block_time: Option<u64>) -> TxStatus {
        TxStatus::Confirmed {
            height,
            block_hash: None,
            block_time,
        }
    }

    #[test]
    fn test_history_order_unconfirmed_then_newest() {
        let a = record(0xaa, TxStatus::Unconfirmed);
        let b = record(0xbb, confirmed(10, Some(100)));
        let c = record(0xcc, confirmed(11, Some(200)));

        let mut records = vec![b.clone(), a.clone(), c.clone()];
        sort_history(&mut records);
        let ids: Vec<Txid> = records.iter().map(|r| r.txid).collect();
        assert_eq!(ids, vec![a.txid, c.txid, b.txid]);
    }

    #[test]
    fn test_history_order_ties() {
        let low = record(0x01, confirmed(5, Some(100)));
        let high = record(0x02, confirmed(5, Some(100)));
        assert_eq!(history_order(&low, &high), Ordering::Less);

        let older = record(0x03, confirmed(4, None));
        let newer = record(0x04, confirmed(9, None));
        assert_eq!(history_order(&newer, &older), Ordering::Less);

        let m1 = record(0x09, TxStatus::Unconfirmed);
        let m2 = record(0x08, TxStatus::Unconfirmed);
        assert_eq!(history_order(&m2, &m1), Ordering::Less);
    }

    #[test]
    fn test_equal_block_time_ignores_height() {
        let first = record(0x01, confirmed(900, Some(100)));
        let second = record(0x02, confirmed(901, Some(100)));
        assert_eq!(history_order(&first, &second), Ordering::Less);
    }

    #[test]
    fn test_mixed_block_times_sort_the_same_from_any_start() {
        let timed_old = record(0x01, confirmed(10, Some(100)));
        let untimed = record(0x02, confirmed(5, None));
        let timed_new = record(0x03, confirmed(3, Some(200)));
        let mempool = record(0x04, TxStatus::Unconfirmed);
        let untimed_high = record(0x05, confirmed(8, None));
        let expected = vec![
            mempool.txid,
            timed_new.txid,
            timed_old.txid,
            untimed_high.txid,
            untimed.txid,
        ];

        let all = [timed_old, untimed, timed_new, mempool, untimed_high];
        let mut orders = vec![vec![0usize]];
        for next in 1..all.len() {
            orders = orders
                .into_iter()
                .flat_map(|order| {
                    (0..=order.len()).map(move |at| {
                        let mut order = order.clone();
                        order.insert(at, next);
                        order
                    })
                })
                .collect();
        }
        assert_eq!(orders.len(), 120);

        for order in orders {
            let mut records: Vec<TransactionRecord> =
                order.iter().map(|i| all[*i].clone()).collect();
            sort_history(&mut records);
            let ids: Vec<Txid> = records.iter().map(|r| r.txid).collect();
            assert_eq!(ids, expected, "start order {:?}", order);
        }
    }

    #[test]
    fn test_direction_classification() {
        assert_eq!(TxDirection::classify(false, true), TxDirection::Received);
        assert_eq!(TxDirection::classify(false, false), TxDirection::Received);
        assert_eq!(TxDirection::classify(true, true), TxDirection::Moved);
        assert_eq!(TxDirection::classify(true, false), TxDirection::Sent);
    }

    #[test]
    fn test_confirmations_and_fee_rate() {
        let mut r = record(1, confirmed(100, None));
        assert_eq!(r.confirmations(100), 1);
        assert_eq!(r.confirmations(109), 10);
        assert_eq!(r.confirmations(50), 0);

        r.fee = 1_410;
        r.vsize = 141;
        assert!((r.fee_rate() - 10.0).abs() < f64::EPSILON);
        assert_eq!(record(2, TxStatus::Unconfirmed).fee_rate(), 0.0);
    }
}
