//! Error types for the key-wallet library

use core::fmt;

use std::error;

/// Result type alias for key-wallet operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur while building descriptors or deriving addresses.
///
/// Every variant is a permanent failure: the same input always fails the
/// same way, so none of them is ever retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// BIP32 related error
    Bip32(String),
    /// Extended public key could not be decoded
    InvalidExtendedKey(String),
    /// Extended key encodes a different network than the account
    NetworkMismatch(String),
    /// Invalid derivation path or child index
    InvalidDerivationPath(String),
    /// Descriptor parameters are inconsistent
    InvalidDescriptor(String),
    /// Locking script could not be turned into an address
    InvalidScript(String),
    /// Invalid address
    InvalidAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bip32(e) => write!(f, "BIP32 error: {}", e),
            Error::InvalidExtendedKey(s) => write!(f, "Invalid extended key: {}", s),
            Error::NetworkMismatch(s) => write!(f, "Network mismatch: {}", s),
            Error::InvalidDerivationPath(s) => write!(f, "Invalid derivation path: {}", s),
            Error::InvalidDescriptor(s) => write!(f, "Invalid descriptor: {}", s),
            Error::InvalidScript(s) => write!(f, "Invalid script: {}", s),
            Error::InvalidAddress(s) => write!(f, "Invalid address: {}", s),
        }
    }
}

impl error::Error for Error {}

impl From<bitcoin::bip32::Error> for Error {
    fn from(e: bitcoin::bip32::Error) -> Self {
        Error::Bip32(e.to_string())
    }
}
