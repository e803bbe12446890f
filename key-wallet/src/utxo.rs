//! UTXO tracking for reconstructed accounts
//!
//! This module provides the unspent output set that a sync builds from the
//! reconciled transaction history, together with its balance split.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;

use bitcoin::{Address, OutPoint, TxOut};

use crate::address::ChainKind;
use crate::transaction_record::TxStatus;

/// Coinbase outputs need this many confirmations before they can be spent
pub const COINBASE_MATURITY: u32 = 100;

/// Unspent Transaction Output
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Utxo {
    /// The outpoint (txid + vout)
    pub outpoint: OutPoint,
    /// The transaction output
    pub txout: TxOut,
    /// The address this UTXO belongs to
    pub address: Address,
    /// Chain of the owning address
    pub chain: ChainKind,
    /// Derivation index of the owning address
    pub index: u32,
    /// Confirmation status of the creating transaction
    pub status: TxStatus,
    /// Whether this is from a coinbase transaction
    pub is_coinbase: bool,
    /// Labels attached to the outpoint
    pub labels: Vec<String>,
}

impl Utxo {
    /// Create a new UTXO
    pub fn new(
        outpoint: OutPoint,
        txout: TxOut,
        address: Address,
        chain: ChainKind,
        index: u32,
        status: TxStatus,
    ) -> Self {
        Self {
            outpoint,
            txout,
            address,
            chain,
            index,
            status,
            is_coinbase: false,
            labels: Vec::new(),
        }
    }

    /// Get the value of this UTXO in satoshis
    pub fn value(&self) -> u64 {
        self.txout.value.to_sat()
    }

    pub fn is_confirmed(&self) -> bool {
        self.status.is_confirmed()
    }

    /// Block height where this UTXO was created
    pub fn height(&self) -> Option<u32> {
        self.status.height()
    }

    /// Check if this UTXO is mature enough for spending
    pub fn is_mature(&self, current_height: u32) -> bool {
        if !self.is_coinbase {
            return true;
        }
        match self.height() {
            Some(height) => current_height >= height + COINBASE_MATURITY,
            None => false,
        }
    }
}

impl Ord for Utxo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.outpoint.cmp(&other.outpoint)
    }
}

impl PartialOrd for Utxo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Balance of an account in satoshis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountBalance {
    /// Value locked in confirmed outputs
    pub confirmed: u64,
    /// Value locked in mempool outputs
    pub unconfirmed: u64,
}

impl AccountBalance {
    pub fn total(&self) -> u64 {
        self.confirmed + self.unconfirmed
    }
}

/// UTXO set management
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    /// UTXOs indexed by outpoint
    utxos: BTreeMap<OutPoint, Utxo>,
    balance: AccountBalance,
}

impl UtxoSet {
    /// Create a new empty UTXO set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a UTXO to the set, replacing any previous entry for its outpoint
    pub fn add(&mut self, utxo: Utxo) {
        if self.utxos.contains_key(&utxo.outpoint) {
            self.remove(&utxo.outpoint);
        }
        let value = utxo.value();
        if utxo.is_confirmed() {
            self.balance.confirmed += value;
        } else {
            self.balance.unconfirmed += value;
        }
        self.utxos.insert(utxo.outpoint, utxo);
    }

    /// Remove a UTXO from the set
    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        let utxo = self.utxos.remove(outpoint)?;
        let value = utxo.value();
        if utxo.is_confirmed() {
            self.balance.confirmed = self.balance.confirmed.saturating_sub(value);
        } else {
            self.balance.unconfirmed = self.balance.unconfirmed.saturating_sub(value);
        }
        Some(utxo)
    }

    /// Get a UTXO by outpoint
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    /// Get a mutable UTXO by outpoint
    pub fn get_mut(&mut self, outpoint: &OutPoint) -> Option<&mut Utxo> {
        self.utxos.get_mut(outpoint)
    }

    /// Check if a UTXO exists
    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }

    /// Iterate UTXOs in outpoint order
    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.values()
    }

    /// Outpoints in the set, in order
    pub fn outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.utxos.keys()
    }

    /// Get UTXOs for a specific address
    pub fn for_address(&self, address: &Address) -> Vec<&Utxo> {
        self.utxos.values().filter(|u| &u.address == address).collect()
    }

    pub fn balance(&self) -> AccountBalance {
        self.balance
    }

    /// Sum of all UTXO values
    pub fn total_balance(&self) -> u64 {
        self.balance.total()
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn into_vec(self) -> Vec<Utxo> {
        self.utxos.into_values().collect()
    }
}

impl FromIterator<Utxo> for UtxoSet {
    fn from_iter<I: IntoIterator<Item = Utxo>>(iter: I) -> Self {
        let mut set = UtxoSet::new();
        for utxo in iter {
            set.add(utxo);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, Network, PubkeyHash, Txid};

    fn test_utxo(value: u64, vout: u32, status: TxStatus) -> Utxo {
        let address = Address::p2pkh(PubkeyHash::from_byte_array([vout as u8; 20]), Network::Regtest);
        let txout = TxOut {
            value: Amount::from_sat(value),
            script_pubkey: address.script_pubkey(),
        };
        let outpoint = OutPoint::new(Txid::from_byte_array([1; 32]), vout);
        Utxo::new(outpoint, txout, address, ChainKind::Receive, vout, status)
    }

    fn confirmed(height: u32) -> TxStatus {
        TxStatus::Confirmed {
            height,
            block_hash: None,
            block_time: None,
        }
    }

    #[test]
    fn test_utxo_set_balances() {
        let mut set = UtxoSet::new();
        set.add(test_utxo(100_000, 0, confirmed(10)));
        set.add(test_utxo(200_000, 1, TxStatus::Unconfirmed));

        assert_eq!(set.len(), 2);
        assert_eq!(set.balance().confirmed, 100_000);
        assert_eq!(set.balance().unconfirmed, 200_000);
        assert_eq!(set.total_balance(), 300_000);

        let removed = set.remove(&test_utxo(0, 0, TxStatus::Unconfirmed).outpoint).unwrap();
        assert_eq!(removed.value(), 100_000);
        assert_eq!(set.balance().confirmed, 0);
        assert_eq!(set.total_balance(), 200_000);
    }

    #[test]
    fn test_re_adding_outpoint_does_not_double_count() {
        let mut set = UtxoSet::new();
        set.add(test_utxo(5_000, 3, TxStatus::Unconfirmed));
        set.add(test_utxo(5_000, 3, confirmed(7)));
        assert_eq!(set.len(), 1);
        assert_eq!(set.balance(), AccountBalance { confirmed: 5_000, unconfirmed: 0 });
    }

    #[test]
    fn test_coinbase_maturity() {
        let mut utxo = test_utxo(50, 0, confirmed(1_000));
        utxo.is_coinbase = true;
        assert!(!utxo.is_mature(1_050));
        assert!(utxo.is_mature(1_100));

        let mut pending = test_utxo(50, 0, TxStatus::Unconfirmed);
        pending.is_coinbase = true;
        assert!(!pending.is_mature(u32::MAX / 2));
    }

    #[test]
    fn test_iteration_is_outpoint_ordered() {
        let set: UtxoSet = [2, 0, 1]
            .into_iter()
            .map(|vout| test_utxo(1, vout, TxStatus::Unconfirmed))
            .collect();
        let vouts: Vec<u32> = set.iter().map(|u| u.outpoint.vout).collect();
        assert_eq!(vouts, vec![0, 1, 2]);
    }
}
