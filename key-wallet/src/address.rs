//! Derived account addresses

use core::fmt;

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::{Address, ScriptBuf};

use crate::descriptor::PathConvention;
use crate::script_hash::ScriptHash;

/// The two address chains below an account key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainKind {
    /// External chain, handed out to payers
    Receive,
    /// Internal chain, used for change outputs
    Change,
}

impl ChainKind {
    /// Branch number of this chain under the given convention.
    pub fn branch(self, convention: PathConvention) -> u32 {
        match (self, convention) {
            (ChainKind::Receive, PathConvention::Standard) => 0,
            (ChainKind::Change, PathConvention::Standard) => 1,
            (ChainKind::Receive, PathConvention::Alternate) => 10,
            (ChainKind::Change, PathConvention::Alternate) => 11,
        }
    }

    pub fn is_change(self) -> bool {
        self == ChainKind::Change
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKind::Receive => f.write_str("receive"),
            ChainKind::Change => f.write_str("change"),
        }
    }
}

/// Full derivation path of an address for one cosigner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CosignerPath {
    /// Master key fingerprint of the cosigner
    pub fingerprint: Fingerprint,
    /// Path from that master key down to the address key
    pub path: DerivationPath,
}

/// An address regenerated from an account descriptor.
///
/// Only `used` and `labels` carry information that is not a pure function of
/// (descriptor, chain, index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    /// Chain the address belongs to
    pub chain: ChainKind,
    /// Child index on the chain
    pub index: u32,
    /// Encoded address
    pub address: Address,
    /// Locking script
    pub script_pubkey: ScriptBuf,
    /// Per-cosigner derivation paths, in descriptor order
    pub paths: Vec<CosignerPath>,
    /// Whether the chain has seen a transaction touching this address
    pub used: bool,
    /// Free-text labels from the label store
    pub labels: Vec<String>,
}

impl DerivedAddress {
    /// Lookup key of this address at the data provider.
    pub fn script_hash(&self) -> ScriptHash {
        ScriptHash::from_script(&self.script_pubkey)
    }

    /// Path relative to the account key, e.g. `m/0/7`.
    pub fn relative_path(&self, convention: PathConvention) -> String {
        format!("m/{}/{}", self.chain.branch(convention), self.index)
    }

    pub fn mark_used(mut self, used: bool) -> Self {
        self.used = used;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }
}

impl fmt::Display for DerivedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} #{})", self.address, self.chain, self.index)
    }
}
