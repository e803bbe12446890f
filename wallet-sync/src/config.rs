//! Engine, provider and account file configuration.

use std::path::Path;
use std::time::Duration;

use key_wallet::gap_limit::MAX_GAP_LIMIT;
use key_wallet::{AccountDescriptor, CosignerKey, Network, PathConvention, ScriptType};
use serde::Deserialize;

use crate::error::SyncError;
use crate::provider::electrum::ElectrumProtocol;
use crate::retry::RetryPolicy;

pub const DEFAULT_GAP_LIMIT: u32 = key_wallet::DEFAULT_GAP_LIMIT;
pub const DEFAULT_BATCH_SIZE: u32 = 10;
pub const DEFAULT_TX_BATCH_SIZE: usize = 50;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Scan and reconciliation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Consecutive unused addresses that end a chain.
    pub gap_limit: u32,

    /// Addresses derived and queried per chain per cycle.
    pub batch_size: u32,

    /// Transactions requested per provider call during reconciliation.
    pub tx_batch_size: usize,

    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            gap_limit: DEFAULT_GAP_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            tx_batch_size: DEFAULT_TX_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self {
        self.gap_limit = gap_limit;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_tx_batch_size(mut self, size: usize) -> Self {
        self.tx_batch_size = size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.gap_limit == 0 || self.gap_limit > MAX_GAP_LIMIT {
            return Err(SyncError::Config(format!(
                "gap_limit must be between 1 and {}, got {}",
                MAX_GAP_LIMIT, self.gap_limit
            )));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be > 0".to_string()));
        }
        if self.tx_batch_size == 0 {
            return Err(SyncError::Config("tx_batch_size must be > 0".to_string()));
        }
        if self.retry.max_attempts_per_cycle == 0 {
            return Err(SyncError::Config("max_attempts_per_cycle must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Where chain data comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderConfig {
    Electrum {
        host: String,
        port: u16,
        protocol: ElectrumProtocol,
        /// SOCKS5 proxy as `host:port`. Onion hosts fall back to local Tor.
        proxy: Option<String>,
        timeout: Duration,
    },
    Esplora {
        base_url: String,
        timeout: Duration,
    },
}

impl ProviderConfig {
    /// Public Electrum server for `network`, or a local one for test networks.
    pub fn electrum_default(network: Network) -> Self {
        Self::electrum_default_with(network, ElectrumProtocol::Tcp)
    }

    pub fn electrum_default_with(network: Network, protocol: ElectrumProtocol) -> Self {
        let tls = protocol == ElectrumProtocol::Tls;
        let (host, port) = match network {
            Network::Bitcoin => ("electrum.blockstream.info", if tls { 50002 } else { 50001 }),
            Network::Testnet => ("electrum.blockstream.info", if tls { 60002 } else { 60001 }),
            Network::Signet => ("127.0.0.1", if tls { 60602 } else { 60601 }),
            _ => ("127.0.0.1", if tls { 60402 } else { 60401 }),
        };
        ProviderConfig::Electrum {
            host: host.to_string(),
            port,
            protocol,
            proxy: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn esplora_default(network: Network) -> Self {
        let base_url = match network {
            Network::Bitcoin => "https://blockstream.info/api",
            Network::Testnet => "https://blockstream.info/testnet/api",
            Network::Signet => "https://mempool.space/signet/api",
            _ => "http://127.0.0.1:3002",
        };
        ProviderConfig::Esplora {
            base_url: base_url.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build from the CLI's `--provider` and optional `--server` values.
    /// For Electrum the server is `host:port`, for Esplora a base URL.
    pub fn from_args(kind: &str, server: Option<&str>, network: Network) -> Result<Self, SyncError> {
        match (kind, server) {
            ("electrum", None) => Ok(Self::electrum_default(network)),
            ("electrum", Some(server)) => {
                let (host, port) = server.rsplit_once(':').ok_or_else(|| {
                    SyncError::Config(format!("electrum server '{}' must be host:port", server))
                })?;
                let port = port
                    .parse()
                    .map_err(|_| SyncError::Config(format!("invalid port in '{}'", server)))?;
                Ok(ProviderConfig::Electrum {
                    host: host.to_string(),
                    port,
                    protocol: ElectrumProtocol::Tcp,
                    proxy: None,
                    timeout: DEFAULT_TIMEOUT,
                })
            }
            ("esplora", None) => Ok(Self::esplora_default(network)),
            ("esplora", Some(url)) => Ok(ProviderConfig::Esplora {
                base_url: url.to_string(),
                timeout: DEFAULT_TIMEOUT,
            }),
            (other, _) => Err(SyncError::Config(format!("unknown provider '{}'", other))),
        }
    }

    /// Switch an Electrum config to `new_protocol`. A default server moves
    /// to its port for that protocol. Esplora configs are returned as is.
    pub fn with_electrum_protocol(self, network: Network, new_protocol: ElectrumProtocol) -> Self {
        match self {
            ProviderConfig::Electrum {
                host,
                port,
                proxy,
                timeout,
                ..
            } => {
                let defaults = (
                    Self::electrum_default(network),
                    Self::electrum_default_with(network, new_protocol),
                );
                let port = match defaults {
                    (
                        ProviderConfig::Electrum {
                            host: default_host,
                            port: default_port,
                            ..
                        },
                        ProviderConfig::Electrum {
                            port: new_port,
                            ..
                        },
                    ) if default_host == host && default_port == port => new_port,
                    _ => port,
                };
                ProviderConfig::Electrum {
                    host,
                    port,
                    protocol: new_protocol,
                    proxy,
                    timeout,
                }
            }
            esplora => esplora,
        }
    }

    /// Route Electrum connections through a SOCKS5 proxy.
    pub fn with_proxy(mut self, new_proxy: Option<String>) -> Self {
        if let ProviderConfig::Electrum {
            proxy,
            ..
        } = &mut self
        {
            *proxy = new_proxy;
        }
        self
    }

    pub fn with_timeout(mut self, new_timeout: Duration) -> Self {
        match &mut self {
            ProviderConfig::Electrum {
                timeout,
                ..
            }
            | ProviderConfig::Esplora {
                timeout,
                ..
            } => *timeout = new_timeout,
        }
        self
    }
}

/// Network names accepted in account files and on the command line.
pub fn parse_network(name: &str) -> Result<Network, SyncError> {
    match name.to_ascii_lowercase().as_str() {
        "bitcoin" | "mainnet" | "main" => Ok(Network::Bitcoin),
        "testnet" | "testnet3" | "test" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(SyncError::Config(format!("unknown network '{}'", other))),
    }
}

/// One cosigner entry of an account file.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyEntry {
    pub xpub: String,
    pub fingerprint: String,
    pub derivation: String,
}

/// Account as exported by the wallet.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountEntry {
    pub name: String,
    pub network: String,
    pub script_type: String,
    #[serde(default = "default_required")]
    pub required: usize,
    #[serde(default)]
    pub alternate_derivation: bool,
    pub keys: Vec<KeyEntry>,
}

fn default_required() -> usize {
    1
}

impl AccountEntry {
    pub fn to_descriptor(&self) -> Result<AccountDescriptor, SyncError> {
        let network = parse_network(&self.network)?;
        let script_type: ScriptType = self.script_type.parse()?;
        let convention = if self.alternate_derivation {
            PathConvention::Alternate
        } else {
            PathConvention::Standard
        };
        let keys = self
            .keys
            .iter()
            .map(|k| CosignerKey::from_strings(&k.xpub, &k.fingerprint, &k.derivation, network))
            .collect::<key_wallet::Result<Vec<_>>>()?;

        let descriptor = if script_type.is_multisig() {
            AccountDescriptor::multisig(
                self.name.clone(),
                network,
                script_type,
                self.required,
                keys,
                convention,
            )?
        } else {
            let [key] = <[CosignerKey; 1]>::try_from(keys).map_err(|keys| {
                SyncError::Config(format!(
                    "account '{}': {} needs exactly one key, got {}",
                    self.name,
                    script_type,
                    keys.len()
                ))
            })?;
            AccountDescriptor::single_key(self.name.clone(), network, script_type, key, convention)?
        };
        Ok(descriptor)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AccountFile {
    Many(Vec<AccountEntry>),
    One(AccountEntry),
}

/// Parse an account file holding either one account object or an array.
pub fn parse_accounts(json: &str) -> Result<Vec<AccountDescriptor>, SyncError> {
    let entries = match serde_json::from_str::<AccountFile>(json)
        .map_err(|e| SyncError::Config(format!("invalid account file: {}", e)))?
    {
        AccountFile::Many(entries) => entries,
        AccountFile::One(entry) => vec![entry],
    };
    if entries.is_empty() {
        return Err(SyncError::Config("account file lists no accounts".to_string()));
    }
    entries.iter().map(AccountEntry::to_descriptor).collect()
}

pub fn load_accounts(path: &Path) -> Result<Vec<AccountDescriptor>, SyncError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    parse_accounts(&json)
}
