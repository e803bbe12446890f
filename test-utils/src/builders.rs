//! Test data builders for creating test objects

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    WPubkeyHash, Witness,
};

/// Builder for creating test transactions
pub struct TestTransactionBuilder {
    version: Version,
    lock_time: LockTime,
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
}

impl Default for TestTransactionBuilder {
    fn default() -> Self {
        Self {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            inputs: vec![],
            outputs: vec![],
        }
    }
}

impl TestTransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a coinbase transaction. `tag` keeps txids of otherwise
    /// identical coinbases apart.
    pub fn coinbase(height: u32, tag: u32) -> Self {
        let script_sig =
            Builder::new().push_int(height as i64).push_int(tag as i64).into_script();
        let mut builder = Self::default();
        builder.inputs.push(TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
        builder
    }

    /// Spend an existing outpoint
    pub fn spend(mut self, outpoint: OutPoint) -> Self {
        self.inputs.push(TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        });
        self
    }

    /// Spend output `vout` of `tx`
    pub fn spend_output(self, tx: &Transaction, vout: u32) -> Self {
        self.spend(OutPoint::new(tx.compute_txid(), vout))
    }

    pub fn pay_to_script(mut self, script: &Script, sats: u64) -> Self {
        self.outputs.push(TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: script.to_owned(),
        });
        self
    }

    pub fn pay(self, address: &Address, sats: u64) -> Self {
        self.pay_to_script(&address.script_pubkey(), sats)
    }

    pub fn build(self) -> Transaction {
        Transaction {
            version: self.version,
            lock_time: self.lock_time,
            input: self.inputs,
            output: self.outputs,
        }
    }
}

/// Coinbase paying `sats` to `script`
pub fn funding_tx(script: &Script, sats: u64, tag: u32) -> Transaction {
    TestTransactionBuilder::coinbase(100, tag).pay_to_script(script, sats).build()
}

/// Native segwit script owned by nobody in the test accounts
pub fn foreign_script(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([seed; 20]))
}

/// Txid that no test chain knows about
pub fn unknown_txid(byte: u8) -> Txid {
    Txid::from_byte_array([byte; 32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coinbase_builder() {
        let a = TestTransactionBuilder::coinbase(10, 1).build();
        let b = TestTransactionBuilder::coinbase(10, 2).build();
        assert!(a.is_coinbase());
        assert_ne!(a.compute_txid(), b.compute_txid());
    }

    #[test]
    fn test_spend_builder() {
        let parent = funding_tx(&foreign_script(1), 5_000, 0);
        let child = TestTransactionBuilder::new()
            .spend_output(&parent, 0)
            .pay_to_script(&foreign_script(2), 4_000)
            .build();
        assert!(!child.is_coinbase());
        assert_eq!(child.input[0].previous_output.txid, parent.compute_txid());
        assert_eq!(child.output[0].value, Amount::from_sat(4_000));
    }
}
