//! Spend policy - checks run against a PSBT before any key is touched.
//!
//! | Policy | Refuses when |
//! |--------|--------------|
//! | [`AndonPolicy`] | the halt flag is set |
//! | [`ValuePolicy`] | value leaving the wallet exceeds `max_spend_per_tx` |
//!
//! Every policy runs; violations are reported together.

mod andon;
mod value;

pub use andon::AndonPolicy;
pub use value::ValuePolicy;

use bitcoin::Psbt;
use tracing::warn;

use crate::error::{SignerError, SignerResult};
use crate::wallet::WalletDescriptor;

/// Addresses scanned per descriptor when deciding whether an output is ours.
pub const DEFAULT_LOOKAHEAD: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Satoshis allowed to leave the wallet in one transaction. `None` = unlimited.
    pub max_spend_per_tx: Option<u64>,
    pub halt_all: bool,
    pub lookahead: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { max_spend_per_tx: None, halt_all: false, lookahead: DEFAULT_LOOKAHEAD }
    }
}

pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, psbt: &Psbt) -> Result<(), String>;
}

pub struct PolicySet {
    policies: Vec<Box<dyn Policy>>,
}

impl PolicySet {
    pub fn new(config: &PolicyConfig, wallet: &WalletDescriptor) -> SignerResult<Self> {
        let mut policies: Vec<Box<dyn Policy>> = vec![Box::new(AndonPolicy::new(config.halt_all))];
        if let Some(limit) = config.max_spend_per_tx {
            let value = ValuePolicy::new(wallet, limit, config.lookahead)
                .map_err(|e| SignerError::internal(format!("stored wallet descriptor: {e}")))?;
            policies.push(Box::new(value));
        }
        Ok(Self { policies })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn check(&self, psbt: &Psbt) -> SignerResult<()> {
        let violations: Vec<String> = self
            .policies
            .iter()
            .filter_map(|p| p.check(psbt).err().map(|reason| (p.name(), reason)))
            .map(|(name, reason)| {
                warn!(policy = name, %reason, "policy refused transaction");
                reason
            })
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SignerError::PolicyViolation(violations))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, Psbt, ScriptBuf, Transaction, TxIn, TxOut};

    use crate::wallet::{ScriptType, WalletDescriptor};

    pub const TPUB: &str = "tpubDDYkZojQFQjht8Tm4jsS3iuEmKjTiEGjG6KnuFNKKJb5A6ZUCUZKdvLdSDWofKi4ToRCwb9poe1XdqfUnP4jaJjCB2Zwv11ZLgSbnZSNecE";

    pub fn wallet() -> WalletDescriptor {
        WalletDescriptor {
            label: Some("alice".into()),
            script_type: ScriptType::P2wpkh,
            threshold: None,
            cosigners: 1,
            origin_path: "m/84'/1'/0'".into(),
            descriptor: format!("wpkh([c258d2e4/84h/1h/0h]{TPUB}/0/*)"),
            change_descriptor: Some(format!("wpkh([c258d2e4/84h/1h/0h]{TPUB}/1/*)")),
        }
    }

    pub fn foreign_script(tag: u8) -> ScriptBuf {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend_from_slice(&[tag; 20]);
        ScriptBuf::from_bytes(bytes)
    }

    pub fn psbt_paying(outputs: Vec<(ScriptBuf, u64)>) -> Psbt {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn::default()],
            output: outputs
                .into_iter()
                .map(|(script_pubkey, sats)| TxOut { value: Amount::from_sat(sats), script_pubkey })
                .collect(),
        };
        Psbt::from_unsigned_tx(tx).expect("unsigned tx")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn default_config_only_runs_andon() {
        let set = PolicySet::new(&PolicyConfig::default(), &wallet()).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.check(&psbt_paying(vec![(foreign_script(1), 10_000_000)])).is_ok());
    }

    #[test]
    fn violations_are_collected() {
        let config = PolicyConfig { max_spend_per_tx: Some(1_000), halt_all: true, ..Default::default() };
        let set = PolicySet::new(&config, &wallet()).unwrap();
        match set.check(&psbt_paying(vec![(foreign_script(1), 5_000)])) {
            Err(SignerError::PolicyViolation(reasons)) => assert_eq!(reasons.len(), 2),
            other => panic!("expected policy violation, got {other:?}"),
        }
    }
}
