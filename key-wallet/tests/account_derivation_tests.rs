//! Account derivation tests

use std::str::FromStr;

use key_wallet::bitcoin::bip32::Xpriv;
use key_wallet::bitcoin::secp256k1::Secp256k1;
use key_wallet::{
    AccountDescriptor, ChainKind, CosignerKey, DerivationPath, Error, Fingerprint, Network,
    PathConvention, ScriptHash, ScriptType, Xpub, derive_address, parse_extended_pubkey,
};
use test_case::test_case;

const BIP84_ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

fn bip84_key() -> CosignerKey {
    CosignerKey::new(
        parse_extended_pubkey(BIP84_ZPUB).unwrap(),
        Fingerprint::from_str("73c5da0a").unwrap(),
        DerivationPath::from_str("m/84'/0'/0'").unwrap(),
    )
}

fn cosigner(seed: u8, network: Network) -> CosignerKey {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(network, &[seed; 32]).unwrap();
    let path = DerivationPath::from_str("m/48'/0'/0'/2'").unwrap();
    let account = master.derive_priv(&secp, &path).unwrap();
    CosignerKey::new(Xpub::from_priv(&secp, &account), master.fingerprint(&secp), path)
}

#[test_case(ScriptType::P2pkh, "1" ; "legacy")]
#[test_case(ScriptType::P2shP2wpkh, "3" ; "nested segwit")]
#[test_case(ScriptType::P2wpkh, "bc1q" ; "native segwit")]
fn test_single_key_address_prefixes(script_type: ScriptType, prefix: &str) {
    let account = AccountDescriptor::single_key(
        "single",
        Network::Bitcoin,
        script_type,
        bip84_key(),
        PathConvention::Standard,
    )
    .unwrap();
    for index in 0..3 {
        let derived = derive_address(&account, ChainKind::Receive, index).unwrap();
        assert!(derived.address.to_string().starts_with(prefix), "{}", derived.address);
        assert_eq!(derived.script_pubkey, derived.address.script_pubkey());
        assert_eq!(derived.script_hash(), ScriptHash::for_address(&derived.address));
    }
}

#[test_case(ScriptType::P2sh, "3" ; "legacy multisig")]
#[test_case(ScriptType::P2shP2wsh, "3" ; "nested segwit multisig")]
#[test_case(ScriptType::P2wsh, "bc1q" ; "native segwit multisig")]
fn test_multisig_address_prefixes(script_type: ScriptType, prefix: &str) {
    let keys = vec![
        cosigner(11, Network::Bitcoin),
        cosigner(12, Network::Bitcoin),
        cosigner(13, Network::Bitcoin),
    ];
    let account = AccountDescriptor::multisig(
        "vault",
        Network::Bitcoin,
        script_type,
        2,
        keys,
        PathConvention::Standard,
    )
    .unwrap();
    let derived = derive_address(&account, ChainKind::Change, 0).unwrap();
    assert!(derived.address.to_string().starts_with(prefix), "{}", derived.address);
    assert_eq!(derived.paths.len(), 3);
    for path in &derived.paths {
        assert_eq!(path.path, DerivationPath::from_str("m/48'/0'/0'/2'/1/0").unwrap());
    }
}

#[test]
fn test_bip84_receive_and_change() {
    let account = AccountDescriptor::single_key(
        "bip84",
        Network::Bitcoin,
        ScriptType::P2wpkh,
        bip84_key(),
        PathConvention::Standard,
    )
    .unwrap();

    let receive = derive_address(&account, ChainKind::Receive, 0).unwrap();
    assert_eq!(receive.address.to_string(), "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
    assert_eq!(receive.relative_path(account.convention()), "m/0/0");

    let change = derive_address(&account, ChainKind::Change, 0).unwrap();
    assert_eq!(change.address.to_string(), "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el");
}

#[test]
fn test_testnet_account_rejects_mainnet_key() {
    let err = AccountDescriptor::single_key(
        "wrong network",
        Network::Testnet,
        ScriptType::P2wpkh,
        bip84_key(),
        PathConvention::Standard,
    )
    .unwrap_err();
    assert!(matches!(err, Error::NetworkMismatch(_)));
}

#[test]
fn test_hardened_index_is_rejected() {
    let account = AccountDescriptor::single_key(
        "bip84",
        Network::Bitcoin,
        ScriptType::P2wpkh,
        bip84_key(),
        PathConvention::Standard,
    )
    .unwrap();
    let err = derive_address(&account, ChainKind::Change, 0x8000_0000).unwrap_err();
    assert!(matches!(err, Error::InvalidDerivationPath(_)));
    assert!(derive_address(&account, ChainKind::Change, 0x7fff_ffff).is_ok());
}
