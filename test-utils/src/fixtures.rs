//! Common test fixtures and constants

use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{BlockHash, Network};
use key_wallet::transaction_record::TxStatus;
use key_wallet::{AccountDescriptor, CosignerKey, PathConvention, ScriptType};

/// BIP84 reference account key (`abandon ... about` mnemonic, m/84'/0'/0')
pub const BIP84_ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

/// Master fingerprint of the BIP84 reference wallet
pub const BIP84_FINGERPRINT: &str = "73c5da0a";

/// Deterministic account key derived from a one-byte seed.
pub fn test_key(seed: u8, network: Network, origin: &str) -> CosignerKey {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(network, &[seed; 32]).unwrap();
    let path = DerivationPath::from_str(origin).unwrap();
    let account = master.derive_priv(&secp, &path).unwrap();
    CosignerKey::new(Xpub::from_priv(&secp, &account), master.fingerprint(&secp), path)
}

/// Deterministic cosigner key on the BIP48 multisig path
pub fn test_cosigner(seed: u8, network: Network) -> CosignerKey {
    test_key(seed, network, "m/48'/1'/0'/2'")
}

/// Single-key account over a seeded key
pub fn test_account(seed: u8, network: Network, script_type: ScriptType) -> AccountDescriptor {
    AccountDescriptor::single_key(
        format!("account-{}", seed),
        network,
        script_type,
        test_key(seed, network, "m/84'/1'/0'"),
        PathConvention::Standard,
    )
    .unwrap()
}

/// Quorum account over seeded cosigner keys
pub fn multisig_account(
    network: Network,
    script_type: ScriptType,
    required: usize,
    seeds: &[u8],
) -> AccountDescriptor {
    let keys = seeds.iter().map(|seed| test_cosigner(*seed, network)).collect();
    AccountDescriptor::multisig(
        "vault",
        network,
        script_type,
        required,
        keys,
        PathConvention::Standard,
    )
    .unwrap()
}

/// Block hash with every byte set to `byte`
pub fn test_block_hash(byte: u8) -> BlockHash {
    use bitcoin::hashes::Hash;
    BlockHash::from_byte_array([byte; 32])
}

/// Confirmed status with a block time
pub fn confirmed_at(height: u32, block_time: u64) -> TxStatus {
    TxStatus::Confirmed {
        height,
        block_hash: Some(test_block_hash((height % 251) as u8)),
        block_time: Some(block_time),
    }
}
