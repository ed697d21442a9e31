//! PSBT Signer - adds this key's signatures to the inputs it owns.
//!
//! ```text
//! bytes ──→ decode ──→ prev-tx check ──→ spend policy ──→ per input:
//!                                                          finalized?  → skipped
//!                                                          not ours?   → skipped
//!                                                          signed?     → already_signed
//!                                                          otherwise   → sign (sighash by script type)
//! ```
//!
//! Inputs belonging to other cosigners are never touched: the reply is the
//! request's bytes with only the new signature entries spliced in. Signing is
//! deterministic (RFC 6979 ECDSA, Schnorr without aux randomness), so a PSBT
//! signed twice is byte-identical to one signed once.

mod codec;
mod input;

pub use codec::{decode, encode, Encoding};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ErrorKind, SignerError, SignerResult};
use crate::keys::KeyManager;
use crate::policy::{PolicyConfig, PolicySet};
use codec::{decode_raw, splice_inputs, wrap};
use input::{signature_pairs, InputStatus, Session};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignOptions {
    /// Fail the whole request if any owned input cannot be signed.
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InputFailure {
    pub index: usize,
    pub error: ErrorKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SignReport {
    pub signed: Vec<usize>,
    pub already_signed: Vec<usize>,
    pub skipped: Vec<usize>,
    pub failed: Vec<InputFailure>,
}

impl SignReport {
    pub fn owned(&self) -> usize {
        self.signed.len() + self.already_signed.len() + self.failed.len()
    }
}

#[derive(Debug, Clone)]
pub struct SignOutcome {
    /// Re-serialized PSBT, in the encoding it arrived in.
    pub psbt: Vec<u8>,
    pub encoding: Encoding,
    pub report: SignReport,
}

#[derive(Clone)]
pub struct PsbtSigner {
    keys: KeyManager,
    policy: PolicyConfig,
}

impl PsbtSigner {
    pub fn new(keys: KeyManager, policy: PolicyConfig) -> Self {
        Self { keys, policy }
    }

    pub fn sign(&self, name: &str, bytes: &[u8], options: SignOptions) -> SignerResult<SignOutcome> {
        let stored = self.keys.load(name)?;
        let wallet = stored
            .record
            .wallet
            .as_ref()
            .ok_or_else(|| SignerError::NoWalletAttached(name.to_string()))?;

        let (mut psbt, encoding, raw) = decode_raw(bytes)?;
        check_previous_transactions(&psbt)?;
        PolicySet::new(&self.policy, wallet)?.check(&psbt)?;

        let session = Session::new(&self.keys, &stored.record, &psbt)?;
        let mut report = SignReport::default();
        let mut first_failure = None;
        let mut additions = vec![Vec::new(); psbt.inputs.len()];

        for (index, input) in psbt.inputs.iter_mut().enumerate() {
            let before = input.clone();
            match session.sign_input(input, index) {
                Ok(InputStatus::NotOurs | InputStatus::Finalized) => report.skipped.push(index),
                Ok(InputStatus::AlreadySigned) => report.already_signed.push(index),
                Ok(InputStatus::Signed(_)) => {
                    additions[index] = signature_pairs(&before, input);
                    report.signed.push(index);
                }
                Err(err) => {
                    warn!(key = %name, input = index, error = %err, "input not signed");
                    if options.strict {
                        return Err(err);
                    }
                    report.failed.push(InputFailure { index, error: err.kind(), reason: err.to_string() });
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }
        drop(session);

        if report.owned() == 0 {
            return Err(SignerError::NothingToSign(name.to_string()));
        }
        if report.signed.is_empty() && report.already_signed.is_empty() {
            if let Some(err) = first_failure {
                return Err(err);
            }
        }

        info!(
            key = %name,
            inputs = psbt.inputs.len(),
            signed = report.signed.len(),
            already_signed = report.already_signed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "psbt signed"
        );
        let signed = splice_inputs(&raw, &additions)?;
        if bitcoin::Psbt::deserialize(&signed).ok().as_ref() != Some(&psbt) {
            return Err(SignerError::internal("spliced PSBT does not match the signed inputs"));
        }
        Ok(SignOutcome { psbt: wrap(signed, encoding), encoding, report })
    }
}

/// A full previous transaction must be the one the input actually spends.
fn check_previous_transactions(psbt: &bitcoin::Psbt) -> SignerResult<()> {
    for (index, (input, txin)) in psbt.inputs.iter().zip(&psbt.unsigned_tx.input).enumerate() {
        if let Some(prev) = &input.non_witness_utxo {
            if prev.compute_txid() != txin.previous_output.txid {
                return Err(SignerError::malformed(format!(
                    "input {index}: previous transaction does not match the spent outpoint"
                )));
            }
        }
    }
    Ok(())
}
