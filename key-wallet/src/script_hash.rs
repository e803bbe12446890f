//! Provider lookup keys
//!
//! Data providers index outputs by the sha256 of their locking script.
//! Electrum hex encodes the digest in reversed byte order; Esplora's
//! `/scripthash` endpoints take it in forward order.

use core::fmt;
use core::str::FromStr;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Address, Script};

use crate::error::{Error, Result};

/// Lookup key of a locking script.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptHash([u8; 32]);

impl ScriptHash {
    /// Hash a locking script.
    pub fn from_script(script: &Script) -> Self {
        let mut bytes = sha256::Hash::hash(script.as_bytes()).to_byte_array();
        bytes.reverse();
        ScriptHash(bytes)
    }

    /// Hash the locking script of an address.
    pub fn for_address(address: &Address) -> Self {
        Self::from_script(&address.script_pubkey())
    }

    /// Bytes in the order they are displayed.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Electrum encoding: the digest in reversed byte order.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Esplora encoding: the plain sha256 digest of the script.
    pub fn to_forward_hex(&self) -> String {
        let mut forward = self.0;
        forward.reverse();
        hex::encode(forward)
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHash({})", self.to_hex())
    }
}

impl FromStr for ScriptHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidScript(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidScript(format!("script hash '{}' is not 32 bytes", s)))?;
        Ok(ScriptHash(bytes))
    }
}
