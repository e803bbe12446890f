//! Account descriptors
//!
//! An [`AccountDescriptor`] is everything needed to regenerate an account's
//! address space: the script variant, the cosigner keys with their origin
//! information, the signing threshold, the network and the path convention.
//! Descriptors are immutable once built; only the display name can change.

use core::fmt;
use core::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::Network;

use crate::error::{Error, Result};
use crate::extended_key::{ensure_network, parse_extended_pubkey_for};

/// Largest quorum whose sorted-multisig script still fits a P2SH redeem script.
pub const MAX_COSIGNERS: usize = 15;

/// Output script variants supported for accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScriptType {
    /// Legacy single-key pay-to-pubkey-hash
    P2pkh,
    /// Nested segwit single-key
    P2shP2wpkh,
    /// Native segwit single-key
    P2wpkh,
    /// Legacy multisig
    P2sh,
    /// Nested segwit multisig
    P2shP2wsh,
    /// Native segwit multisig
    P2wsh,
}

impl ScriptType {
    /// Whether this variant locks funds to a threshold-of-N script.
    pub fn is_multisig(self) -> bool {
        matches!(self, ScriptType::P2sh | ScriptType::P2shP2wsh | ScriptType::P2wsh)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2shP2wpkh => "p2sh-p2wpkh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2shP2wsh => "p2sh-p2wsh",
            ScriptType::P2wsh => "p2wsh",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "p2pkh" => Ok(ScriptType::P2pkh),
            "p2sh-p2wpkh" | "p2sh_p2wpkh" => Ok(ScriptType::P2shP2wpkh),
            "p2wpkh" => Ok(ScriptType::P2wpkh),
            "p2sh" => Ok(ScriptType::P2sh),
            "p2sh-p2wsh" | "p2sh_p2wsh" => Ok(ScriptType::P2shP2wsh),
            "p2wsh" => Ok(ScriptType::P2wsh),
            other => Err(Error::InvalidDescriptor(format!("unknown script type '{}'", other))),
        }
    }
}

/// Branch numbering used below the account key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum PathConvention {
    /// `0/i` for receive, `1/i` for change
    #[default]
    Standard,
    /// `10/i` for receive, `11/i` for change, used by accounts imported from
    /// custodians that reserve the low branches
    Alternate,
}

/// One cosigner's account-level extended public key with its origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CosignerKey {
    /// Account-level extended public key
    pub xpub: Xpub,
    /// Fingerprint of the master key on the originating device
    pub fingerprint: Fingerprint,
    /// Path from the master key to `xpub`
    pub origin_path: DerivationPath,
}

impl CosignerKey {
    pub fn new(xpub: Xpub, fingerprint: Fingerprint, origin_path: DerivationPath) -> Self {
        Self {
            xpub,
            fingerprint,
            origin_path,
        }
    }

    /// Build a cosigner key from its textual export format.
    pub fn from_strings(
        xpub: &str,
        fingerprint: &str,
        origin_path: &str,
        network: Network,
    ) -> Result<Self> {
        let xpub = parse_extended_pubkey_for(xpub, network)?;
        let fingerprint = Fingerprint::from_str(fingerprint.trim())
            .map_err(|e| Error::InvalidDescriptor(format!("fingerprint '{}': {}", fingerprint, e)))?;
        let origin_path = DerivationPath::from_str(origin_path.trim())
            .map_err(|e| Error::InvalidDerivationPath(format!("'{}': {}", origin_path, e)))?;
        Ok(Self::new(xpub, fingerprint, origin_path))
    }
}

/// Stable identifier of an account, derived from the descriptor content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId([u8; 16]);

impl AccountId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Immutable description of a watch-only account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDescriptor {
    name: String,
    network: Network,
    script_type: ScriptType,
    required_signers: usize,
    keys: Vec<CosignerKey>,
    convention: PathConvention,
    id: AccountId,
}

impl AccountDescriptor {
    /// Create a single-key account.
    pub fn single_key(
        name: impl Into<String>,
        network: Network,
        script_type: ScriptType,
        key: CosignerKey,
        convention: PathConvention,
    ) -> Result<Self> {
        if script_type.is_multisig() {
            return Err(Error::InvalidDescriptor(format!(
                "{} needs a multisig quorum",
                script_type
            )));
        }
        Self::build(name.into(), network, script_type, 1, vec![key], convention)
    }

    /// Create a threshold-of-N quorum account.
    pub fn multisig(
        name: impl Into<String>,
        network: Network,
        script_type: ScriptType,
        required_signers: usize,
        keys: Vec<CosignerKey>,
        convention: PathConvention,
    ) -> Result<Self> {
        if !script_type.is_multisig() {
            return Err(Error::InvalidDescriptor(format!(
                "{} cannot hold a multisig quorum",
                script_type
            )));
        }
        if keys.is_empty() || keys.len() > MAX_COSIGNERS {
            return Err(Error::InvalidDescriptor(format!(
                "quorum must have between 1 and {} keys, got {}",
                MAX_COSIGNERS,
                keys.len()
            )));
        }
        if required_signers == 0 || required_signers > keys.len() {
            return Err(Error::InvalidDescriptor(format!(
                "threshold {} is not satisfiable with {} keys",
                required_signers,
                keys.len()
            )));
        }
        for (i, key) in keys.iter().enumerate() {
            if keys[..i].iter().any(|other| other.xpub == key.xpub) {
                return Err(Error::InvalidDescriptor(format!(
                    "cosigner key {} appears twice",
                    key.fingerprint
                )));
            }
        }
        Self::build(name.into(), network, script_type, required_signers, keys, convention)
    }

    fn build(
        name: String,
        network: Network,
        script_type: ScriptType,
        required_signers: usize,
        keys: Vec<CosignerKey>,
        convention: PathConvention,
    ) -> Result<Self> {
        for key in &keys {
            ensure_network(&key.xpub, network)?;
        }
        let id = compute_id(network, script_type, required_signers, &keys, convention);
        Ok(Self {
            name,
            network,
            script_type,
            required_signers,
            keys,
            convention,
            id,
        })
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the account. The name does not take part in the account id.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn required_signers(&self) -> usize {
        self.required_signers
    }

    pub fn keys(&self) -> &[CosignerKey] {
        &self.keys
    }

    pub fn convention(&self) -> PathConvention {
        self.convention
    }

    pub fn is_multisig(&self) -> bool {
        self.script_type.is_multisig()
    }
}

fn compute_id(
    network: Network,
    script_type: ScriptType,
    required_signers: usize,
    keys: &[CosignerKey],
    convention: PathConvention,
) -> AccountId {
    // Cosigner order does not change addresses (keys are sorted in the
    // script), so it must not change the id either.
    let mut encoded_keys: Vec<String> = keys
        .iter()
        .map(|k| format!("{}:{}:{}", k.xpub, k.fingerprint, k.origin_path))
        .collect();
    encoded_keys.sort();

    let preimage = format!(
        "{}|{}|{}|{:?}|{}",
        network,
        script_type,
        required_signers,
        convention,
        encoded_keys.join(",")
    );
    let digest = sha256::Hash::hash(preimage.as_bytes()).to_byte_array();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    AccountId(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::bip32::Xpriv;
    use bitcoin::secp256k1::Secp256k1;

    fn key(seed: u8, network: Network) -> CosignerKey {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, &[seed; 32]).unwrap();
        let path = DerivationPath::from_str("m/48'/1'/0'/2'").unwrap();
        let account = master.derive_priv(&secp, &path).unwrap();
        CosignerKey::new(Xpub::from_priv(&secp, &account), master.fingerprint(&secp), path)
    }

    #[test]
    fn test_script_type_round_trip() {
        for st in [
            ScriptType::P2pkh,
            ScriptType::P2shP2wpkh,
            ScriptType::P2wpkh,
            ScriptType::P2sh,
            ScriptType::P2shP2wsh,
            ScriptType::P2wsh,
        ] {
            assert_eq!(st.as_str().parse::<ScriptType>().unwrap(), st);
        }
        assert!("p2tr".parse::<ScriptType>().is_err());
    }

    #[test]
    fn test_single_key_rejects_multisig_script() {
        let err = AccountDescriptor::single_key(
            "a",
            Network::Testnet,
            ScriptType::P2wsh,
            key(1, Network::Testnet),
            PathConvention::Standard,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn test_multisig_threshold_validation() {
        let keys = vec![key(1, Network::Testnet), key(2, Network::Testnet)];
        assert!(AccountDescriptor::multisig(
            "vault",
            Network::Testnet,
            ScriptType::P2wsh,
            3,
            keys.clone(),
            PathConvention::Standard
        )
        .is_err());
        assert!(AccountDescriptor::multisig(
            "vault",
            Network::Testnet,
            ScriptType::P2wsh,
            0,
            keys.clone(),
            PathConvention::Standard
        )
        .is_err());
        assert!(AccountDescriptor::multisig(
            "vault",
            Network::Testnet,
            ScriptType::P2wsh,
            2,
            keys,
            PathConvention::Standard
        )
        .is_ok());
    }

    #[test]
    fn test_duplicate_cosigner_rejected() {
        let k = key(7, Network::Testnet);
        let err = AccountDescriptor::multisig(
            "dup",
            Network::Testnet,
            ScriptType::P2wsh,
            1,
            vec![k.clone(), k],
            PathConvention::Standard,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn test_key_network_must_match_account() {
        let err = AccountDescriptor::single_key(
            "a",
            Network::Bitcoin,
            ScriptType::P2wpkh,
            key(1, Network::Testnet),
            PathConvention::Standard,
        )
        .unwrap_err();
        assert!(matches!(err, Error::NetworkMismatch(_)));
    }

    #[test]
    fn test_id_ignores_name_and_cosigner_order() {
        let a = key(1, Network::Testnet);
        let b = key(2, Network::Testnet);
        let mut first = AccountDescriptor::multisig(
            "first",
            Network::Testnet,
            ScriptType::P2wsh,
            2,
            vec![a.clone(), b.clone()],
            PathConvention::Standard,
        )
        .unwrap();
        let second = AccountDescriptor::multisig(
            "second",
            Network::Testnet,
            ScriptType::P2wsh,
            2,
            vec![b.clone(), a.clone()],
            PathConvention::Standard,
        )
        .unwrap();
        assert_eq!(first.id(), second.id());

        first.set_name("renamed");
        assert_eq!(first.name(), "renamed");
        assert_eq!(first.id(), second.id());

        let alternate = AccountDescriptor::multisig(
            "alt",
            Network::Testnet,
            ScriptType::P2wsh,
            2,
            vec![a, b],
            PathConvention::Alternate,
        )
        .unwrap();
        assert_ne!(first.id(), alternate.id());
    }
}
