//! Per-input signing: ownership, sighash selection, signature placement.
//!
//! | Spent script | Sighash | Signature slot |
//! |--------------|---------|----------------|
//! | P2PKH, P2PK, P2SH (legacy redeem) | legacy | `partial_sigs` |
//! | P2WPKH, P2SH-P2WPKH | BIP 143 | `partial_sigs` |
//! | P2WSH, P2SH-P2WSH | BIP 143, witness script | `partial_sigs` |
//! | P2TR key path | BIP 341, tweaked key | `tap_key_sig` |
//! | P2TR script path | BIP 341, per leaf | `tap_script_sigs` |

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::psbt::Input;
use bitcoin::secp256k1::{All, Keypair, Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::TapLeafHash;
use bitcoin::{ecdsa, taproot, EcdsaSighashType, Script, TapSighashType, Transaction, TxOut};

use super::codec::RawPair;
use crate::error::{SignerError, SignerResult};
use crate::keys::{format_path, KeyManager, KeyRecord, SigningKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputStatus {
    /// No derivation entry names this key, or the declared key is not ours.
    NotOurs,
    Finalized,
    AlreadySigned,
    Signed(usize),
}

/// Everything the per-input signer needs, detached from the PSBT being mutated.
pub(crate) struct Session<'a> {
    secp: Secp256k1<All>,
    keys: &'a KeyManager,
    record: &'a KeyRecord,
    fingerprint: Fingerprint,
    tx: Transaction,
    /// Previous outputs of every input, when all are known. Taproot needs them.
    prevouts: Option<Vec<TxOut>>,
}

struct EcdsaOwner {
    key: SigningKey,
}

struct TapOwner {
    xonly: XOnlyPublicKey,
    leaves: Vec<TapLeafHash>,
    key: SigningKey,
}

impl<'a> Session<'a> {
    pub(crate) fn new(keys: &'a KeyManager, record: &'a KeyRecord, psbt: &bitcoin::Psbt) -> SignerResult<Self> {
        let tx = psbt.unsigned_tx.clone();
        let prevouts = psbt
            .inputs
            .iter()
            .enumerate()
            .map(|(index, input)| spent_output(&tx, input, index).ok())
            .collect::<Option<Vec<_>>>();
        Ok(Self { secp: Secp256k1::new(), keys, record, fingerprint: record.fingerprint()?, tx, prevouts })
    }

    pub(crate) fn sign_input(&self, input: &mut Input, index: usize) -> SignerResult<InputStatus> {
        if input.final_script_sig.is_some() || input.final_script_witness.is_some() {
            return Ok(InputStatus::Finalized);
        }
        let ecdsa_owners = self.ecdsa_owners(input)?;
        let tap_owners = self.tap_owners(input)?;
        if ecdsa_owners.is_empty() && tap_owners.is_empty() {
            return Ok(InputStatus::NotOurs);
        }

        // Signatures land in `staged` and reach the PSBT only if every owner succeeds.
        let mut staged = input.clone();
        let mut added = 0;
        if !ecdsa_owners.is_empty() {
            added += self.sign_ecdsa(&mut staged, index, &ecdsa_owners)?;
        }
        if !tap_owners.is_empty() {
            added += self.sign_taproot(&mut staged, index, &tap_owners)?;
        }
        *input = staged;
        Ok(if added == 0 { InputStatus::AlreadySigned } else { InputStatus::Signed(added) })
    }

    fn derive(&self, path: &DerivationPath) -> SignerResult<SigningKey> {
        self.keys.derive_signing_key(&self.secp, self.record, path)
    }

    fn ecdsa_owners(&self, input: &Input) -> SignerResult<Vec<EcdsaOwner>> {
        let mut owners = Vec::new();
        for (declared, (fingerprint, path)) in &input.bip32_derivation {
            if *fingerprint != self.fingerprint {
                continue;
            }
            let key = self.derive(path)?;
            if key.public == *declared {
                owners.push(EcdsaOwner { key });
            } else {
                tracing::debug!(path = %format_path(path), "declared key differs from derived key");
            }
        }
        Ok(owners)
    }

    fn tap_owners(&self, input: &Input) -> SignerResult<Vec<TapOwner>> {
        let mut owners = Vec::new();
        for (xonly, (leaves, (fingerprint, path))) in &input.tap_key_origins {
            if *fingerprint != self.fingerprint {
                continue;
            }
            let key = self.derive(path)?;
            if key.public.x_only_public_key().0 == *xonly {
                owners.push(TapOwner { xonly: *xonly, leaves: leaves.clone(), key });
            }
        }
        Ok(owners)
    }

    fn sign_ecdsa(&self, input: &mut Input, index: usize, owners: &[EcdsaOwner]) -> SignerResult<usize> {
        let pending: Vec<&EcdsaOwner> = owners
            .iter()
            .filter(|o| !input.partial_sigs.contains_key(&bitcoin::PublicKey::new(o.key.public)))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let sighash_type = match input.sighash_type {
            Some(ty) => ty
                .ecdsa_hash_ty()
                .map_err(|e| SignerError::malformed(format!("input {index}: sighash type: {e}")))?,
            None => EcdsaSighashType::All,
        };
        let single = matches!(sighash_type, EcdsaSighashType::Single | EcdsaSighashType::SinglePlusAnyoneCanPay);
        if single && index >= self.tx.output.len() {
            return Err(SignerError::malformed(format!(
                "input {index}: SIGHASH_SINGLE without a matching output"
            )));
        }
        let msg = self.ecdsa_message(input, index, sighash_type)?;
        for owner in &pending {
            let signature = self.secp.sign_ecdsa(&msg, &owner.key.secret);
            input
                .partial_sigs
                .insert(bitcoin::PublicKey::new(owner.key.public), ecdsa::Signature { signature, sighash_type });
        }
        Ok(pending.len())
    }

    fn ecdsa_message(&self, input: &Input, index: usize, ty: EcdsaSighashType) -> SignerResult<Message> {
        let prev = spent_output(&self.tx, input, index)?;
        let spk = prev.script_pubkey.as_script();
        let cache = SighashCache::new(&self.tx);

        let digest = if spk.is_p2wpkh() {
            self.p2wpkh(cache, index, spk, &prev, ty)?
        } else if spk.is_p2wsh() {
            let ws = witness_script(input, index, spk)?;
            self.p2wsh(cache, index, ws, &prev, ty)?
        } else if spk.is_p2sh() {
            let redeem = input
                .redeem_script
                .as_deref()
                .ok_or_else(|| unsupported(index, "p2sh input without redeem script"))?;
            if redeem.to_p2sh() != prev.script_pubkey {
                return Err(SignerError::malformed(format!("input {index}: redeem script does not match output")));
            }
            if redeem.is_p2wpkh() {
                self.p2wpkh(cache, index, redeem, &prev, ty)?
            } else if redeem.is_p2wsh() {
                let ws = witness_script(input, index, redeem)?;
                self.p2wsh(cache, index, ws, &prev, ty)?
            } else {
                legacy(cache, input, index, redeem, ty)?
            }
        } else if spk.is_p2pkh() || spk.is_p2pk() {
            legacy(cache, input, index, spk, ty)?
        } else if spk.is_p2tr() {
            return Err(unsupported(index, "taproot output listed with an ECDSA derivation"));
        } else {
            return Err(unsupported(index, "unrecognised output script"));
        };
        Ok(Message::from_digest(digest))
    }

    fn p2wpkh(
        &self,
        mut cache: SighashCache<&Transaction>,
        index: usize,
        spk: &Script,
        prev: &TxOut,
        ty: EcdsaSighashType,
    ) -> SignerResult<[u8; 32]> {
        cache
            .p2wpkh_signature_hash(index, spk, prev.value, ty)
            .map(|h| h.to_byte_array())
            .map_err(|e| SignerError::malformed(format!("input {index}: sighash: {e}")))
    }

    fn p2wsh(
        &self,
        mut cache: SighashCache<&Transaction>,
        index: usize,
        witness_script: &Script,
        prev: &TxOut,
        ty: EcdsaSighashType,
    ) -> SignerResult<[u8; 32]> {
        cache
            .p2wsh_signature_hash(index, witness_script, prev.value, ty)
            .map(|h| h.to_byte_array())
            .map_err(|e| SignerError::malformed(format!("input {index}: sighash: {e}")))
    }

    fn sign_taproot(&self, input: &mut Input, index: usize, owners: &[TapOwner]) -> SignerResult<usize> {
        let prev = spent_output(&self.tx, input, index)?;
        if !prev.script_pubkey.is_p2tr() {
            return Err(unsupported(index, "taproot derivation on a non-taproot output"));
        }
        let sighash_type = match input.sighash_type {
            Some(ty) => ty
                .taproot_hash_ty()
                .map_err(|e| SignerError::malformed(format!("input {index}: sighash type: {e}")))?,
            None => TapSighashType::Default,
        };
        let prevouts = self.prevouts.as_deref().ok_or_else(|| {
            SignerError::malformed(format!("input {index}: taproot signing needs every input's previous output"))
        })?;
        let prevouts = Prevouts::All(prevouts);
        let mut cache = SighashCache::new(&self.tx);
        let mut added = 0;

        for owner in owners {
            let keypair = Keypair::from_secret_key(&self.secp, &owner.key.secret);
            if owner.leaves.is_empty() {
                if input.tap_internal_key != Some(owner.xonly) {
                    return Err(unsupported(index, "key-path origin is not the internal key"));
                }
                if input.tap_key_sig.is_some() {
                    continue;
                }
                let tweaked = keypair.tap_tweak(&self.secp, input.tap_merkle_root).to_inner();
                if prev.script_pubkey.as_bytes()[2..] != tweaked.x_only_public_key().0.serialize() {
                    return Err(unsupported(index, "tweaked internal key does not match the output key"));
                }
                let sighash = cache
                    .taproot_key_spend_signature_hash(index, &prevouts, sighash_type)
                    .map_err(|e| SignerError::malformed(format!("input {index}: sighash: {e}")))?;
                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = self.secp.sign_schnorr_no_aux_rand(&msg, &tweaked);
                input.tap_key_sig = Some(taproot::Signature { signature, sighash_type });
                added += 1;
            } else {
                for leaf in &owner.leaves {
                    if input.tap_script_sigs.contains_key(&(owner.xonly, *leaf)) {
                        continue;
                    }
                    let sighash = cache
                        .taproot_script_spend_signature_hash(index, &prevouts, *leaf, sighash_type)
                        .map_err(|e| SignerError::malformed(format!("input {index}: sighash: {e}")))?;
                    let msg = Message::from_digest(sighash.to_byte_array());
                    let signature = self.secp.sign_schnorr_no_aux_rand(&msg, &keypair);
                    input
                        .tap_script_sigs
                        .insert((owner.xonly, *leaf), taproot::Signature { signature, sighash_type });
                    added += 1;
                }
            }
        }
        Ok(added)
    }
}

const PSBT_IN_PARTIAL_SIG: u8 = 0x02;
const PSBT_IN_TAP_KEY_SIG: u8 = 0x13;
const PSBT_IN_TAP_SCRIPT_SIG: u8 = 0x14;

/// Raw key-value pairs for the signatures present in `after` but not in `before`.
pub(crate) fn signature_pairs(before: &Input, after: &Input) -> Vec<RawPair> {
    let mut pairs = Vec::new();
    for (pk, sig) in &after.partial_sigs {
        if !before.partial_sigs.contains_key(pk) {
            let mut key = vec![PSBT_IN_PARTIAL_SIG];
            key.extend(pk.to_bytes());
            pairs.push((key, sig.to_vec()));
        }
    }
    if let (None, Some(sig)) = (&before.tap_key_sig, &after.tap_key_sig) {
        pairs.push((vec![PSBT_IN_TAP_KEY_SIG], sig.to_vec()));
    }
    for ((xonly, leaf), sig) in &after.tap_script_sigs {
        if !before.tap_script_sigs.contains_key(&(*xonly, *leaf)) {
            let mut key = vec![PSBT_IN_TAP_SCRIPT_SIG];
            key.extend_from_slice(&xonly.serialize());
            key.extend_from_slice(&leaf.to_byte_array());
            pairs.push((key, sig.to_vec()));
        }
    }
    pairs
}

fn legacy(
    cache: SighashCache<&Transaction>,
    input: &Input,
    index: usize,
    script_code: &Script,
    ty: EcdsaSighashType,
) -> SignerResult<[u8; 32]> {
    if input.non_witness_utxo.is_none() {
        return Err(SignerError::malformed(format!(
            "input {index}: legacy input needs the full previous transaction"
        )));
    }
    cache
        .legacy_signature_hash(index, script_code, ty.to_u32())
        .map(|h| h.to_byte_array())
        .map_err(|e| SignerError::malformed(format!("input {index}: sighash: {e}")))
}

fn witness_script<'i>(input: &'i Input, index: usize, program: &Script) -> SignerResult<&'i Script> {
    let ws = input
        .witness_script
        .as_deref()
        .ok_or_else(|| unsupported(index, "p2wsh input without witness script"))?;
    if ws.to_p2wsh().as_script() != program {
        return Err(SignerError::malformed(format!("input {index}: witness script does not match output")));
    }
    Ok(ws)
}

/// The output this input spends, from `witness_utxo` or the full previous transaction.
pub(crate) fn spent_output(tx: &Transaction, input: &Input, index: usize) -> SignerResult<TxOut> {
    if let Some(out) = &input.witness_utxo {
        return Ok(out.clone());
    }
    if let Some(prev_tx) = &input.non_witness_utxo {
        let vout = tx
            .input
            .get(index)
            .map(|txin| txin.previous_output.vout as usize)
            .ok_or_else(|| SignerError::malformed(format!("input {index} missing from transaction")))?;
        return prev_tx
            .output
            .get(vout)
            .cloned()
            .ok_or_else(|| SignerError::malformed(format!("input {index}: previous output {vout} missing")));
    }
    Err(SignerError::malformed(format!("input {index} carries no previous output")))
}

fn unsupported(index: usize, reason: &str) -> SignerError {
    SignerError::UnsupportedScript { index, reason: reason.to_string() }
}
