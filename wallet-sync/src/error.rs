//! Error types for account synchronization.

use bitcoin::{OutPoint, Txid};
use thiserror::Error;

/// Main error type for a sync run.
///
/// Cloneable so a coalesced sync can hand the same failure to every waiter.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Invalid derivation: {0}")]
    InvalidDerivation(#[from] key_wallet::Error),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(#[from] ProviderError),

    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(String),
}

impl SyncError {
    /// Returns a static string representing the error category based on the variant
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::InvalidDerivation(_) => "derivation",
            SyncError::ProviderUnavailable(_) => "provider",
            SyncError::BroadcastRejected(_) => "broadcast",
            SyncError::Cancelled => "cancelled",
            SyncError::Config(_) => "config",
            SyncError::Logging(_) => "logging",
        }
    }

    /// Whether running the same sync again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ProviderUnavailable(e) => e.is_transient(),
            SyncError::Cancelled => true,
            _ => false,
        }
    }
}

impl From<LoggingError> for SyncError {
    fn from(err: LoggingError) -> Self {
        SyncError::Logging(err.to_string())
    }
}

/// Failures of a single provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The provider understood the request and refused it
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    /// Transient failures are worth a reconnect and another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Connection(_) | ProviderError::Timeout(_) | ProviderError::Protocol(_)
        )
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        ProviderError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Protocol(format!("malformed response: {}", err))
    }
}

/// A transaction that could not be turned into a complete record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("Transaction {txid}: previous output {outpoint} could not be resolved")]
    UnresolvedPrevout { txid: Txid, outpoint: OutPoint },

    #[error("Transaction {txid}: outputs ({outputs} sat) exceed inputs ({inputs} sat)")]
    NegativeFee { txid: Txid, inputs: u64, outputs: u64 },

    #[error("Transaction {txid} is in the address history but the provider did not return it")]
    MissingTransaction { txid: Txid },
}

impl ReconcileError {
    pub fn txid(&self) -> Txid {
        match self {
            ReconcileError::UnresolvedPrevout { txid, .. }
            | ReconcileError::NegativeFee { txid, .. }
            | ReconcileError::MissingTransaction { txid } => *txid,
        }
    }
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),

    #[error("Log archiving failed: {0}")]
    ArchiveFailed(String),
}

/// Type alias for sync results.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Type alias for provider call results.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;
