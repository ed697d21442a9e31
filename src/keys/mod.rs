//! Key Manager - creates master keys and derives from them. Private material
//! never crosses the request boundary.
//!
//! ```text
//! OS entropy (32 bytes)
//!     │
//!     └── BIP39 seed ──→ master Xpriv (fingerprint)
//!                            │
//!                            ├── account path (BIP48) ──→ xpub handed to cosigners
//!                            └── any PSBT origin path ──→ SigningKey (request-scoped)
//! ```

mod record;

pub use record::KeyRecord;

use record::ErasedXpriv;

use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};
use bitcoin::Network;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::entropy::{EntropySource, SEED_ENTROPY_LEN};
use crate::error::{SignerError, SignerResult};
use crate::store::{KeyStore, Version};

/// What `create_key` hands back. Public material only.
#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub name: String,
    pub network: String,
    pub fingerprint: String,
    pub account_path: String,
    pub xpub: String,
    /// `[fingerprint/path]xpub`, ready to paste into a descriptor.
    pub descriptor_key: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtendedPublicKey {
    pub name: String,
    pub fingerprint: String,
    pub path: String,
    pub xpub: String,
    pub descriptor_key: String,
}

/// A record on loan for one request, with the version it was read at.
#[derive(Debug)]
pub struct StoredKey {
    pub record: KeyRecord,
    pub version: Version,
}

/// Private scalar for one input. Erased when dropped.
pub(crate) struct SigningKey {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

#[derive(Clone)]
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    entropy: Arc<dyn EntropySource>,
    network: Network,
    account_path: DerivationPath,
}

impl KeyManager {
    pub fn new(
        store: Arc<dyn KeyStore>,
        entropy: Arc<dyn EntropySource>,
        network: Network,
        account_path: DerivationPath,
    ) -> Self {
        Self { store, entropy, network, account_path }
    }

    pub fn create_key(&self, name: &str) -> SignerResult<KeySummary> {
        validate_name(name)?;

        let mut entropy = Zeroizing::new([0u8; SEED_ENTROPY_LEN]);
        self.entropy.fill(entropy.as_mut_slice())?;
        let record = KeyRecord::generate(name, entropy.as_slice(), self.network, &self.account_path)?;
        drop(entropy);

        let summary = self.summarize(&record)?;
        self.store.create_if_absent(name, &record.to_bytes()?)?;
        info!(key = %name, fingerprint = %record.fingerprint, "key created");
        Ok(summary)
    }

    /// Extended public key at `path` (default: the record's account path).
    pub fn get_xpub(&self, name: &str, path: Option<&str>) -> SignerResult<ExtendedPublicKey> {
        let stored = self.load(name)?;
        let path = match path {
            Some(raw) => parse_path(raw)?,
            None => stored.record.account_path()?,
        };
        let secp = Secp256k1::new();
        let xpub = self.xpub_at(&secp, &stored.record, &path)?;
        let fingerprint = stored.record.fingerprint()?;
        debug!(key = %name, path = %format_path(&path), "xpub derived");
        Ok(ExtendedPublicKey {
            name: name.to_string(),
            fingerprint: fingerprint.to_string(),
            path: format_path(&path),
            xpub: xpub.to_string(),
            descriptor_key: descriptor_key(fingerprint, &path, &xpub),
        })
    }

    pub fn load(&self, name: &str) -> SignerResult<StoredKey> {
        validate_name(name)?;
        let stored = self.store.read(name)?;
        let record = KeyRecord::from_bytes(&stored.bytes)?;
        if record.name != name {
            return Err(SignerError::internal(format!(
                "record stored under {name} is named {}",
                record.name
            )));
        }
        Ok(StoredKey { record, version: stored.version })
    }

    /// Conditional overwrite; the record's entropy is carried over untouched.
    pub(crate) fn save(&self, record: &KeyRecord, expected: Version) -> SignerResult<Version> {
        Ok(self.store.write_if_version(&record.name, &record.to_bytes()?, expected)?)
    }

    pub fn xpub_at<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        record: &KeyRecord,
        path: &DerivationPath,
    ) -> SignerResult<Xpub> {
        let derived = derive_private(secp, record, path)?;
        Ok(Xpub::from_priv(secp, &derived))
    }

    pub(crate) fn derive_signing_key<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        record: &KeyRecord,
        path: &DerivationPath,
    ) -> SignerResult<SigningKey> {
        let derived = derive_private(secp, record, path)?;
        let secret = derived.private_key;
        Ok(SigningKey { public: secret.public_key(secp), secret })
    }

    fn summarize(&self, record: &KeyRecord) -> SignerResult<KeySummary> {
        let secp = Secp256k1::new();
        let path = record.account_path()?;
        let xpub = self.xpub_at(&secp, record, &path)?;
        let fingerprint = record.fingerprint()?;
        Ok(KeySummary {
            name: record.name.clone(),
            network: record.network.clone(),
            fingerprint: fingerprint.to_string(),
            account_path: format_path(&path),
            xpub: xpub.to_string(),
            descriptor_key: descriptor_key(fingerprint, &path, &xpub),
            created_at: record.created_at.clone(),
        })
    }
}

fn derive_private<C: Signing>(
    secp: &Secp256k1<C>,
    record: &KeyRecord,
    path: &DerivationPath,
) -> SignerResult<ErasedXpriv> {
    record
        .master_xpriv()?
        .derive_priv(secp, path)
        .map(ErasedXpriv)
        .map_err(|e| SignerError::malformed(format!("cannot derive {}: {e}", format_path(path))))
}

/// Accepts `m`, `m/0/0`, `0/0`, with `'` or `h` hardened markers.
pub fn parse_path(raw: &str) -> SignerResult<DerivationPath> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "m" || trimmed == "m/" {
        return Ok(DerivationPath::master());
    }
    let body = trimmed.strip_prefix("m/").unwrap_or(trimmed);
    let mut steps = Vec::new();
    for part in body.split('/') {
        let step = ChildNumber::from_str(part)
            .map_err(|e| SignerError::malformed(format!("invalid derivation path {raw}: {e}")))?;
        steps.push(step);
    }
    Ok(DerivationPath::from(steps))
}

/// `m/48'/0'/0'/2'` style, independent of the library's display conventions.
pub fn format_path(path: &DerivationPath) -> String {
    let mut out = String::from("m");
    for step in path.as_ref() {
        match step {
            ChildNumber::Normal { index } => out.push_str(&format!("/{index}")),
            ChildNumber::Hardened { index } => out.push_str(&format!("/{index}'")),
        }
    }
    out
}

pub fn descriptor_key(fingerprint: Fingerprint, path: &DerivationPath, xpub: &Xpub) -> String {
    let origin = format_path(path);
    let suffix = origin.strip_prefix('m').unwrap_or(&origin);
    format!("[{fingerprint}{suffix}]{xpub}")
}

fn validate_name(name: &str) -> SignerResult<()> {
    static NAME: OnceLock<Regex> = OnceLock::new();
    let re = NAME.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("static key name pattern")
    });
    if re.is_match(name) {
        Ok(())
    } else {
        Err(SignerError::malformed(format!("invalid key name: {name:?}")))
    }
}
