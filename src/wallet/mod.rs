//! Wallet Importer - attaches an externally built wallet to a key record.
//!
//! ```text
//! export blob ──→ parse_export ──→ receive / change descriptors
//!                                        │
//!               seed ──→ xpub at origin ─┤ must agree for every key
//!                                        │ carrying our fingerprint
//!                                        ▼
//!                     KeyRecord.wallet  (write_if_version)
//! ```

mod descriptor;
mod export;
mod slip132;

pub use descriptor::{descriptor_keys, parse_descriptor, KeyMaterial, ScriptType, WalletDescriptor};
pub use export::{parse_export, ParsedExport};
pub use slip132::parse_xpub;

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::NetworkKind;
use miniscript::descriptor::SinglePubKey;
use tracing::{info, warn};

use crate::error::{SignerError, SignerResult};
use crate::keys::{format_path, KeyManager, KeyRecord};

#[derive(Clone)]
pub struct WalletImporter {
    keys: KeyManager,
}

impl WalletImporter {
    pub fn new(keys: KeyManager) -> Self {
        Self { keys }
    }

    pub fn import(&self, name: &str, blob: &[u8]) -> SignerResult<WalletDescriptor> {
        let mut stored = self.keys.load(name)?;
        let network = stored.record.network()?;
        let parsed = parse_export(blob, network)?;

        let origin = self.check_ownership(&stored.record, &parsed)?;
        let keys = descriptor_keys(&parsed.receive);
        let wallet = WalletDescriptor {
            label: parsed.label.clone(),
            script_type: ScriptType::of(&parsed.receive),
            threshold: parsed.threshold,
            cosigners: keys.len(),
            origin_path: format_path(&origin),
            descriptor: parsed.receive.to_string(),
            change_descriptor: parsed.change.as_ref().map(|d| d.to_string()),
        };

        if stored.record.wallet.is_some() {
            warn!(key = %name, "replacing previously imported wallet");
        }
        stored.record.wallet = Some(wallet.clone());
        let version = self.keys.save(&stored.record, stored.version)?;
        info!(
            key = %name,
            version,
            script_type = ?wallet.script_type,
            cosigners = wallet.cosigners,
            "wallet imported"
        );
        Ok(wallet)
    }

    /// Every key carrying this record's fingerprint must be derivable from
    /// the seed, and at least one such key must exist. Returns its origin path.
    fn check_ownership(&self, record: &KeyRecord, parsed: &ParsedExport) -> SignerResult<DerivationPath> {
        let secp = Secp256k1::new();
        let ours = record.fingerprint()?;
        let kind = NetworkKind::from(record.network()?);

        let mut matched: Option<DerivationPath> = None;
        let all_keys = std::iter::once(&parsed.receive)
            .chain(parsed.change.iter())
            .flat_map(descriptor_keys);

        for key in all_keys {
            if let KeyMaterial::Extended { xpub, .. } = &key {
                if xpub.network != kind {
                    return Err(SignerError::malformed(format!(
                        "extended key {xpub} does not belong to network {}",
                        record.network
                    )));
                }
            }
            let Some((fingerprint, path)) = key.origin() else { continue };
            if *fingerprint != ours {
                continue;
            }
            let derived = self.keys.xpub_at(&secp, record, path)?;
            let consistent = match &key {
                KeyMaterial::Extended { xpub, .. } => {
                    xpub.public_key == derived.public_key && xpub.chain_code == derived.chain_code
                }
                KeyMaterial::Single { key: SinglePubKey::FullKey(pk), .. } => pk.inner == derived.public_key,
                KeyMaterial::Single { key: SinglePubKey::XOnly(xonly), .. } => {
                    *xonly == derived.public_key.x_only_public_key().0
                }
            };
            if !consistent {
                return Err(mismatch(ours, path));
            }
            if matched.is_none() {
                matched = Some(path.clone());
            }
        }

        matched.ok_or_else(|| {
            SignerError::malformed(format!("no key in the wallet export carries fingerprint {ours}"))
        })
    }
}

fn mismatch(fingerprint: Fingerprint, path: &DerivationPath) -> SignerError {
    SignerError::malformed(format!(
        "key [{fingerprint}{}] in the wallet export does not match this seed",
        format_path(path).trim_start_matches('m')
    ))
}
