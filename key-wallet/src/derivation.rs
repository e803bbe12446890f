//! Address derivation
//!
//! Maps (descriptor, chain, index) to a [`DerivedAddress`] without touching
//! the network. Single-key accounts derive one child key; quorum accounts
//! derive the same relative path from every cosigner key and lock funds to a
//! sorted threshold-of-N script.

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{self, Secp256k1, VerifyOnly};
use bitcoin::{Address, CompressedPublicKey, PublicKey, ScriptBuf};

use crate::address::{ChainKind, CosignerPath, DerivedAddress};
use crate::descriptor::{AccountDescriptor, ScriptType};
use crate::error::{Error, Result};

/// Derives addresses for one account.
pub struct AddressDeriver<'a> {
    descriptor: &'a AccountDescriptor,
    secp: Secp256k1<VerifyOnly>,
}

impl<'a> AddressDeriver<'a> {
    pub fn new(descriptor: &'a AccountDescriptor) -> Self {
        Self {
            descriptor,
            secp: Secp256k1::verification_only(),
        }
    }

    pub fn descriptor(&self) -> &AccountDescriptor {
        self.descriptor
    }

    /// Derive the address at `index` on `chain`.
    pub fn derive(&self, chain: ChainKind, index: u32) -> Result<DerivedAddress> {
        let relative = [
            normal_child(chain.branch(self.descriptor.convention()))?,
            normal_child(index)?,
        ];

        let mut paths = Vec::with_capacity(self.descriptor.keys().len());
        let mut pubkeys = Vec::with_capacity(self.descriptor.keys().len());
        for key in self.descriptor.keys() {
            let child: Xpub = key.xpub.derive_pub(&self.secp, &relative)?;
            pubkeys.push(child.public_key);
            paths.push(CosignerPath {
                fingerprint: key.fingerprint,
                path: key.origin_path.extend(relative),
            });
        }

        let address = self.address_for(&pubkeys)?;
        let script_pubkey = address.script_pubkey();
        Ok(DerivedAddress {
            chain,
            index,
            address,
            script_pubkey,
            paths,
            used: false,
            labels: Vec::new(),
        })
    }

    /// Derive `count` consecutive addresses starting at `start`.
    pub fn derive_range(
        &self,
        chain: ChainKind,
        start: u32,
        count: u32,
    ) -> Result<Vec<DerivedAddress>> {
        let end = start.checked_add(count).ok_or_else(|| {
            Error::InvalidDerivationPath(format!("range {}+{} overflows", start, count))
        })?;
        (start..end).map(|index| self.derive(chain, index)).collect()
    }

    fn address_for(&self, pubkeys: &[secp256k1::PublicKey]) -> Result<Address> {
        let network = self.descriptor.network();
        let script_type = self.descriptor.script_type();

        if !script_type.is_multisig() {
            let key = CompressedPublicKey(pubkeys[0]);
            return Ok(match script_type {
                ScriptType::P2pkh => Address::p2pkh(key.pubkey_hash(), network),
                ScriptType::P2shP2wpkh => Address::p2shwpkh(&key, network),
                _ => Address::p2wpkh(&key, network),
            });
        }

        let script = sorted_multisig_script(self.descriptor.required_signers(), pubkeys);
        match script_type {
            ScriptType::P2sh => {
                Address::p2sh(&script, network).map_err(|e| Error::InvalidScript(e.to_string()))
            }
            ScriptType::P2shP2wsh => Ok(Address::p2shwsh(&script, network)),
            _ => Ok(Address::p2wsh(&script, network)),
        }
    }
}

/// Derive a single address. Prefer [`AddressDeriver`] for batches.
pub fn derive_address(
    descriptor: &AccountDescriptor,
    chain: ChainKind,
    index: u32,
) -> Result<DerivedAddress> {
    AddressDeriver::new(descriptor).derive(chain, index)
}

/// `OP_m <keys sorted by serialization> OP_n OP_CHECKMULTISIG` (BIP67).
pub fn sorted_multisig_script(required: usize, pubkeys: &[secp256k1::PublicKey]) -> ScriptBuf {
    let mut sorted = pubkeys.to_vec();
    sorted.sort_by_key(|pk| pk.serialize());

    let mut builder = Builder::new().push_int(required as i64);
    for pk in &sorted {
        builder = builder.push_key(&PublicKey::new(*pk));
    }
    builder.push_int(sorted.len() as i64).push_opcode(OP_CHECKMULTISIG).into_script()
}

fn normal_child(index: u32) -> Result<ChildNumber> {
    ChildNumber::from_normal_idx(index)
        .map_err(|_| Error::InvalidDerivationPath(format!("index {} is out of range", index)))
}
