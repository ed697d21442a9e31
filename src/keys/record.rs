//! KeyRecord - the unit of custody, as persisted in the key store.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{SignerError, SignerResult};
use crate::wallet::WalletDescriptor;

/// Persisted record. `entropy` is written once at creation and never leaves
/// this type; everything else is public derived state.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyRecord {
    #[zeroize(skip)]
    pub name: String,
    entropy: String,
    #[zeroize(skip)]
    pub network: String,
    #[zeroize(skip)]
    pub fingerprint: String,
    #[zeroize(skip)]
    pub account_path: String,
    #[zeroize(skip)]
    pub created_at: String,
    #[zeroize(skip)]
    #[serde(default)]
    pub wallet: Option<WalletDescriptor>,
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("name", &self.name)
            .field("network", &self.network)
            .field("fingerprint", &self.fingerprint)
            .field("account_path", &self.account_path)
            .field("wallet", &self.wallet.as_ref().map(|w| &w.descriptor))
            .finish_non_exhaustive()
    }
}

impl KeyRecord {
    /// Build a fresh record from raw entropy. The caller's buffer is not retained.
    pub(crate) fn generate(
        name: &str,
        entropy: &[u8],
        network: Network,
        account_path: &DerivationPath,
    ) -> SignerResult<Self> {
        let mut record = Self {
            name: name.to_string(),
            entropy: hex::encode(entropy),
            network: network.to_core_arg().to_string(),
            fingerprint: String::new(),
            account_path: super::format_path(account_path),
            created_at: chrono::Utc::now().to_rfc3339(),
            wallet: None,
        };
        let secp = bitcoin::secp256k1::Secp256k1::signing_only();
        record.fingerprint = record.master_xpriv()?.fingerprint(&secp).to_string();
        Ok(record)
    }

    pub fn network(&self) -> SignerResult<Network> {
        Network::from_core_arg(&self.network)
            .map_err(|e| SignerError::internal(format!("record {}: network: {e}", self.name)))
    }

    pub fn fingerprint(&self) -> SignerResult<Fingerprint> {
        Fingerprint::from_str(&self.fingerprint)
            .map_err(|e| SignerError::internal(format!("record {}: fingerprint: {e}", self.name)))
    }

    pub fn account_path(&self) -> SignerResult<DerivationPath> {
        super::parse_path(&self.account_path)
            .map_err(|e| SignerError::internal(format!("record {}: account path: {e}", self.name)))
    }

    /// Master extended private key. Recomputed on every call and never cached.
    pub(crate) fn master_xpriv(&self) -> SignerResult<ErasedXpriv> {
        let entropy = Zeroizing::new(
            hex::decode(&self.entropy)
                .map_err(|e| SignerError::internal(format!("record {}: entropy: {e}", self.name)))?,
        );
        let mnemonic = Mnemonic::from_entropy(&entropy)
            .map_err(|e| SignerError::internal(format!("record {}: mnemonic: {e}", self.name)))?;
        let seed = Zeroizing::new(mnemonic.to_seed(""));
        Xpriv::new_master(self.network()?, seed.as_slice())
            .map(ErasedXpriv)
            .map_err(|e| SignerError::internal(format!("record {}: master key: {e}", self.name)))
    }

    pub(crate) fn to_bytes(&self) -> SignerResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SignerError::internal(format!("encode record: {e}")))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> SignerResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SignerError::internal(format!("decode record: {e}")))
    }
}

/// Extended private key whose scalar is erased when dropped.
pub(crate) struct ErasedXpriv(pub(crate) Xpriv);

impl Deref for ErasedXpriv {
    type Target = Xpriv;

    fn deref(&self) -> &Xpriv {
        &self.0
    }
}

impl ErasedXpriv {
    fn erase(&mut self) {
        self.0.private_key.non_secure_erase();
    }
}

impl Drop for ErasedXpriv {
    fn drop(&mut self) {
        self.erase();
    }
}
