//! Request Dispatcher - the four operations behind one entry point.
//!
//! | Operation | Component | Success |
//! |-----------|-----------|---------|
//! | `CreateKey` | [`KeyManager::create_key`] | 201 |
//! | `GetXpub` | [`KeyManager::get_xpub`] | 200 |
//! | `ImportWallet` | [`WalletImporter::import`] | 200 |
//! | `SignPsbt` | [`PsbtSigner::sign`] | 200 |
//!
//! Failures become `{"error", "message", "retryable"}` with the status from
//! [`ErrorKind::status_code`]. No state is kept between calls.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::config::SignerConfig;
use crate::entropy::EntropySource;
use crate::error::{SignerError, SignerResult};
use crate::keys::{format_path, KeyManager};
use crate::psbt::{Encoding, PsbtSigner, SignOptions};
use crate::store::KeyStore;
use crate::wallet::WalletImporter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateKey { name: String },
    GetXpub { name: String, path: Option<String> },
    ImportWallet { name: String, blob: Vec<u8> },
    SignPsbt { name: String, psbt: Vec<u8>, strict: bool },
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::CreateKey { .. } => "create_key",
            Operation::GetXpub { .. } => "get_xpub",
            Operation::ImportWallet { .. } => "import_wallet",
            Operation::SignPsbt { .. } => "sign_psbt",
        }
    }

    pub fn key_name(&self) -> &str {
        match self {
            Operation::CreateKey { name }
            | Operation::GetXpub { name, .. }
            | Operation::ImportWallet { name, .. }
            | Operation::SignPsbt { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn error(err: &SignerError) -> Self {
        let kind = err.kind();
        Self {
            status: kind.status_code(),
            body: json!({
                "error": kind.as_str(),
                "message": err.to_string(),
                "retryable": kind.is_retryable(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    keys: KeyManager,
    importer: WalletImporter,
    signer: PsbtSigner,
}

impl Dispatcher {
    pub fn new(config: &SignerConfig, store: Arc<dyn KeyStore>, entropy: Arc<dyn EntropySource>) -> Self {
        let keys = KeyManager::new(store, entropy, config.network, config.account_path.clone());
        info!(
            network = %config.network,
            account_path = %format_path(&config.account_path),
            max_spend = ?config.policy.max_spend_per_tx,
            halt_all = config.policy.halt_all,
            "dispatcher ready"
        );
        Self {
            importer: WalletImporter::new(keys.clone()),
            signer: PsbtSigner::new(keys.clone(), config.policy.clone()),
            keys,
        }
    }

    pub fn dispatch(&self, op: Operation) -> Reply {
        let label = op.label();
        let name = op.key_name().to_string();
        debug!(op = label, key = %name, "dispatching");
        match self.run(op) {
            Ok(reply) => reply,
            Err(err) => {
                if err.kind().status_code() >= 500 {
                    error!(op = label, key = %name, error = %err, "operation failed");
                } else {
                    info!(op = label, key = %name, error = %err, "operation refused");
                }
                Reply::error(&err)
            }
        }
    }

    fn run(&self, op: Operation) -> SignerResult<Reply> {
        match op {
            Operation::CreateKey { name } => {
                let summary = self.keys.create_key(&name)?;
                Ok(Reply { status: 201, body: to_json(&summary)? })
            }
            Operation::GetXpub { name, path } => {
                let xpub = self.keys.get_xpub(&name, path.as_deref())?;
                Ok(Reply { status: 200, body: to_json(&xpub)? })
            }
            Operation::ImportWallet { name, blob } => {
                let wallet = self.importer.import(&name, &blob)?;
                Ok(Reply { status: 200, body: json!({ "key_name": name, "wallet": to_json(&wallet)? }) })
            }
            Operation::SignPsbt { name, psbt, strict } => {
                let outcome = self.signer.sign(&name, &psbt, SignOptions { strict })?;
                let text = match outcome.encoding {
                    Encoding::Base64 => String::from_utf8(outcome.psbt)
                        .map_err(|e| SignerError::internal(format!("base64 output: {e}")))?,
                    Encoding::Binary => BASE64.encode(&outcome.psbt),
                };
                Ok(Reply {
                    status: 200,
                    body: json!({
                        "key_name": name,
                        "psbt": text,
                        "encoding": outcome.encoding,
                        "report": to_json(&outcome.report)?,
                    }),
                })
            }
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> SignerResult<Value> {
    serde_json::to_value(value).map_err(|e| SignerError::internal(format!("encode reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::OsEntropy;
    use crate::store::MemoryStore;
    use bitcoin::Network;

    fn dispatcher() -> Dispatcher {
        let config = SignerConfig::new(Network::Regtest);
        Dispatcher::new(&config, Arc::new(MemoryStore::new()), Arc::new(OsEntropy))
    }

    #[test]
    fn create_then_duplicate() {
        let d = dispatcher();
        let first = d.dispatch(Operation::CreateKey { name: "alpha".into() });
        assert_eq!(first.status, 201);
        assert!(first.body["xpub"].as_str().unwrap().starts_with("tpub"));

        let second = d.dispatch(Operation::CreateKey { name: "alpha".into() });
        assert_eq!(second.status, 409);
        assert_eq!(second.body["error"], "already_exists");
        assert_eq!(second.body["retryable"], false);
    }

    #[test]
    fn errors_map_to_status_codes() {
        let d = dispatcher();
        let missing = d.dispatch(Operation::GetXpub { name: "ghost".into(), path: None });
        assert_eq!(missing.status, 404);
        assert_eq!(missing.body["error"], "not_found");

        d.dispatch(Operation::CreateKey { name: "alpha".into() });
        let bad_path = d.dispatch(Operation::GetXpub { name: "alpha".into(), path: Some("m/x".into()) });
        assert_eq!(bad_path.status, 400);

        let no_wallet = d.dispatch(Operation::SignPsbt { name: "alpha".into(), psbt: b"cHNidP8=".to_vec(), strict: false });
        assert_eq!(no_wallet.status, 412);
        assert_eq!(no_wallet.body["error"], "no_wallet_attached");

        let bad_blob = d.dispatch(Operation::ImportWallet { name: "alpha".into(), blob: b"nonsense".to_vec() });
        assert_eq!(bad_blob.status, 400);
    }

    #[test]
    fn xpub_reply_is_stable() {
        let d = dispatcher();
        d.dispatch(Operation::CreateKey { name: "alpha".into() });
        let op = Operation::GetXpub { name: "alpha".into(), path: Some("m/0/0".into()) };
        let a = d.dispatch(op.clone());
        let b = d.dispatch(op);
        assert!(a.is_success());
        assert_eq!(a, b);
        assert_eq!(a.body["path"], "m/0/0");
    }
}
