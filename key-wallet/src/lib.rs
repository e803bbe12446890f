//! Key Wallet Library
//!
//! This library provides the network-free half of watch-only account
//! synchronization for Bitcoin: account descriptors built from extended
//! public keys (BIP32 and SLIP-132 encodings), deterministic address
//! derivation for single-key and sorted-multisig accounts, provider lookup
//! keys, gap limit tracking and the UTXO and transaction record types that
//! make up an account snapshot.

extern crate alloc;

pub mod address;
pub mod derivation;
pub mod descriptor;
pub mod error;
pub mod extended_key;
pub mod gap_limit;
pub mod script_hash;
pub mod transaction_record;
pub mod utxo;

pub use bitcoin;

pub use address::{ChainKind, CosignerPath, DerivedAddress};
pub use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpub};
pub use bitcoin::{Address, Network};
pub use derivation::{derive_address, sorted_multisig_script, AddressDeriver};
pub use descriptor::{AccountDescriptor, AccountId, CosignerKey, PathConvention, ScriptType};
pub use error::{Error, Result};
pub use extended_key::{parse_extended_pubkey, parse_extended_pubkey_for};
pub use gap_limit::{GapLimit, GapLimitManager, GapLimitStage, DEFAULT_GAP_LIMIT};
pub use script_hash::ScriptHash;
pub use transaction_record::{
    history_order, sort_history, RecordInput, RecordOutput, TransactionRecord, TxDirection,
    TxStatus,
};
pub use utxo::{AccountBalance, Utxo, UtxoSet};
