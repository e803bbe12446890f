//! Extended public key parsing
//!
//! Hardware signers export account keys with SLIP-132 version bytes
//! (`ypub`, `zpub`, `Zpub`, ...) that only hint at the script type. The
//! key material is identical to a plain `xpub`/`tpub`, so parsing swaps the
//! version bytes for the BIP32 ones before decoding.

use bitcoin::base58;
use bitcoin::bip32::Xpub;
use bitcoin::{Network, NetworkKind};

use crate::error::{Error, Result};

/// Length of a serialized BIP32 extended key.
const EXTENDED_KEY_LEN: usize = 78;

const XPUB: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const TPUB: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];

/// Mainnet public version bytes accepted in place of `xpub`.
const MAINNET_VERSIONS: [[u8; 4]; 5] = [
    XPUB,
    [0x04, 0x9d, 0x7c, 0xb2], // ypub
    [0x04, 0xb2, 0x47, 0x46], // zpub
    [0x02, 0x95, 0xb4, 0x3f], // Ypub
    [0x02, 0xaa, 0x7e, 0xd3], // Zpub
];

/// Test network public version bytes accepted in place of `tpub`.
const TESTNET_VERSIONS: [[u8; 4]; 5] = [
    TPUB,
    [0x04, 0x4a, 0x52, 0x62], // upub
    [0x04, 0x5f, 0x1c, 0xf6], // vpub
    [0x02, 0x42, 0x89, 0xef], // Upub
    [0x02, 0x57, 0x54, 0x83], // Vpub
];

/// Parse an extended public key in BIP32 or SLIP-132 encoding.
pub fn parse_extended_pubkey(encoded: &str) -> Result<Xpub> {
    let mut data = base58::decode_check(encoded.trim())
        .map_err(|e| Error::InvalidExtendedKey(e.to_string()))?;
    if data.len() != EXTENDED_KEY_LEN {
        return Err(Error::InvalidExtendedKey(format!(
            "expected {} bytes, got {}",
            EXTENDED_KEY_LEN,
            data.len()
        )));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&data[..4]);
    let normalized = if MAINNET_VERSIONS.contains(&version) {
        XPUB
    } else if TESTNET_VERSIONS.contains(&version) {
        TPUB
    } else {
        return Err(Error::InvalidExtendedKey(format!(
            "unknown version bytes {}",
            hex::encode(version)
        )));
    };
    data[..4].copy_from_slice(&normalized);

    Ok(Xpub::decode(&data)?)
}

/// Parse an extended public key and require it to belong to `network`.
pub fn parse_extended_pubkey_for(encoded: &str, network: Network) -> Result<Xpub> {
    let xpub = parse_extended_pubkey(encoded)?;
    ensure_network(&xpub, network)?;
    Ok(xpub)
}

/// Check that a decoded key was encoded for `network`.
pub(crate) fn ensure_network(xpub: &Xpub, network: Network) -> Result<()> {
    let expected = NetworkKind::from(network);
    if xpub.network != expected {
        return Err(Error::NetworkMismatch(format!(
            "key is encoded for {:?}, account is on {}",
            xpub.network, network
        )));
    }
    Ok(())
}
