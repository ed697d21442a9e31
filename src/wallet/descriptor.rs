//! WalletDescriptor - the public half of a wallet, attached to a key record.

use std::str::FromStr;
use std::sync::OnceLock;

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use miniscript::descriptor::{
    Descriptor, DescriptorPublicKey, DescriptorType, SinglePubKey,
};
use miniscript::ForEachKey;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{SignerError, SignerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    P2pkh,
    P2wpkh,
    P2shP2wpkh,
    P2tr,
    P2sh,
    P2wsh,
    P2shP2wsh,
    Bare,
}

impl ScriptType {
    pub fn of(desc: &Descriptor<DescriptorPublicKey>) -> Self {
        match desc.desc_type() {
            DescriptorType::Pkh => ScriptType::P2pkh,
            DescriptorType::Wpkh => ScriptType::P2wpkh,
            DescriptorType::ShWpkh => ScriptType::P2shP2wpkh,
            DescriptorType::Tr => ScriptType::P2tr,
            DescriptorType::Sh | DescriptorType::ShSortedMulti => ScriptType::P2sh,
            DescriptorType::Wsh | DescriptorType::WshSortedMulti => ScriptType::P2wsh,
            DescriptorType::ShWsh | DescriptorType::ShWshSortedMulti => ScriptType::P2shP2wsh,
            #[allow(unreachable_patterns)]
            _ => ScriptType::Bare,
        }
    }
}

/// Stored alongside the seed once an import succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletDescriptor {
    pub label: Option<String>,
    pub script_type: ScriptType,
    /// `M` of an `M`-of-`N` policy, when the export states one.
    pub threshold: Option<usize>,
    pub cosigners: usize,
    /// Origin path of this key inside the descriptor.
    pub origin_path: String,
    pub descriptor: String,
    pub change_descriptor: Option<String>,
}

impl WalletDescriptor {
    /// Receive descriptor followed by change descriptor(s), with multipath keys split.
    pub fn descriptors(&self) -> SignerResult<Vec<Descriptor<DescriptorPublicKey>>> {
        let mut out = split_multipath(parse_descriptor(&self.descriptor)?)?;
        if let Some(change) = &self.change_descriptor {
            out.extend(split_multipath(parse_descriptor(change)?)?);
        }
        Ok(out)
    }
}

pub fn parse_descriptor(raw: &str) -> SignerResult<Descriptor<DescriptorPublicKey>> {
    let desc = Descriptor::<DescriptorPublicKey>::from_str(raw.trim())
        .map_err(|e| SignerError::malformed(format!("descriptor: {e}")))?;
    desc.sanity_check()
        .map_err(|e| SignerError::malformed(format!("descriptor: {e}")))?;
    Ok(desc)
}

fn split_multipath(
    desc: Descriptor<DescriptorPublicKey>,
) -> SignerResult<Vec<Descriptor<DescriptorPublicKey>>> {
    desc.into_single_descriptors()
        .map_err(|e| SignerError::malformed(format!("descriptor: {e}")))
}

/// One key as it appears in a descriptor, reduced to what ownership checks need.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Extended { origin: Option<(Fingerprint, DerivationPath)>, xpub: Xpub },
    Single { origin: Option<(Fingerprint, DerivationPath)>, key: SinglePubKey },
}

impl KeyMaterial {
    pub fn origin(&self) -> Option<&(Fingerprint, DerivationPath)> {
        match self {
            KeyMaterial::Extended { origin, .. } | KeyMaterial::Single { origin, .. } => origin.as_ref(),
        }
    }
}

pub fn descriptor_keys(desc: &Descriptor<DescriptorPublicKey>) -> Vec<KeyMaterial> {
    let mut keys = Vec::new();
    desc.for_each_key(|pk| {
        keys.push(match pk {
            DescriptorPublicKey::Single(single) => KeyMaterial::Single {
                origin: single.origin.clone(),
                key: single.key.clone(),
            },
            DescriptorPublicKey::XPub(x) => KeyMaterial::Extended { origin: x.origin.clone(), xpub: x.xkey },
            DescriptorPublicKey::MultiXPub(x) => {
                KeyMaterial::Extended { origin: x.origin.clone(), xpub: x.xkey }
            }
        });
        true
    });
    keys
}

/// `M` of the first `multi`/`sortedmulti` fragment, if the descriptor has one.
pub fn multisig_threshold(desc: &Descriptor<DescriptorPublicKey>) -> Option<usize> {
    static MULTI: OnceLock<Regex> = OnceLock::new();
    let re = MULTI.get_or_init(|| Regex::new(r"(?:sorted)?multi(?:_a)?\((\d+),").expect("static multi pattern"));
    re.captures(&desc.to_string()).and_then(|caps| caps[1].parse().ok())
}

/// BDK wallet exports only carry the receive descriptor; change is the `/1/*` sibling.
pub fn sibling_change(receive: &str) -> Option<String> {
    let body = receive.split('#').next().unwrap_or(receive);
    if body.contains("/0/*") {
        Some(body.replace("/0/*", "/1/*"))
    } else {
        None
    }
}
