//! Shared fixtures: key managers over either store, and PSBTs funded from
//! real descriptors so derivation metadata matches what wallets produce.

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, EcdsaSighashType, NetworkKind, OutPoint, Psbt, ScriptBuf, TapSighashType, Transaction, TxIn, TxOut,
};
use miniscript::descriptor::{DefiniteDescriptorKey, Descriptor, DescriptorPublicKey};
use miniscript::psbt::PsbtInputExt;

use keywarden::keys::parse_path;
use keywarden::{EntropySource, KeyManager, KeyStore, MemoryStore, Network, SignerResult};

/// Deterministic entropy: every key gets `seed` repeated.
pub struct Fixed(pub u8);

impl EntropySource for Fixed {
    fn fill(&self, buf: &mut [u8]) -> SignerResult<()> {
        buf.fill(self.0);
        Ok(())
    }
}

pub fn manager_over(store: Arc<dyn KeyStore>) -> KeyManager {
    KeyManager::new(store, Arc::new(Fixed(0x5a)), Network::Regtest, parse_path("m/48'/1'/0'/2'").unwrap())
}

pub fn manager() -> KeyManager {
    manager_over(Arc::new(MemoryStore::new()))
}

/// `[fingerprint/path]tpub` for a key the signer does not hold.
pub fn cosigner_key(seed: u8, path: &str) -> String {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(NetworkKind::Test, &[seed; 32]).unwrap();
    let path = parse_path(path).unwrap();
    let xpub = Xpub::from_priv(&secp, &master.derive_priv(&secp, &path).unwrap());
    keywarden::keys::descriptor_key(master.fingerprint(&secp), &path, &xpub)
}

pub fn definite(desc: &str, index: u32) -> Descriptor<DefiniteDescriptorKey> {
    Descriptor::<DescriptorPublicKey>::from_str(desc)
        .unwrap()
        .at_derivation_index(index)
        .unwrap()
}

pub struct Spend {
    pub desc: Descriptor<DefiniteDescriptorKey>,
    pub sats: u64,
    /// Carry the full previous transaction instead of only the spent output.
    pub legacy: bool,
}

impl Spend {
    pub fn segwit(desc: Descriptor<DefiniteDescriptorKey>, sats: u64) -> Self {
        Self { desc, sats, legacy: false }
    }

    pub fn legacy(desc: Descriptor<DefiniteDescriptorKey>, sats: u64) -> Self {
        Self { desc, sats, legacy: true }
    }
}

pub fn foreign_script(tag: u8) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend_from_slice(&[tag; 20]);
    ScriptBuf::from_bytes(bytes)
}

/// One funding transaction per spend, all spent into a single output.
pub fn build_psbt(spends: &[Spend], outputs: Vec<(ScriptBuf, u64)>) -> Psbt {
    let prevs: Vec<Transaction> = spends
        .iter()
        .enumerate()
        .map(|(i, spend)| Transaction {
            version: Version::TWO,
            lock_time: LockTime::from_consensus(i as u32 + 1),
            input: vec![TxIn::default()],
            output: vec![TxOut { value: Amount::from_sat(spend.sats), script_pubkey: spend.desc.script_pubkey() }],
        })
        .collect();

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: prevs
            .iter()
            .map(|prev| TxIn {
                previous_output: OutPoint { txid: prev.compute_txid(), vout: 0 },
                ..Default::default()
            })
            .collect(),
        output: outputs
            .into_iter()
            .map(|(script_pubkey, sats)| TxOut { value: Amount::from_sat(sats), script_pubkey })
            .collect(),
    };

    let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
    for (input, (spend, prev)) in psbt.inputs.iter_mut().zip(spends.iter().zip(prevs)) {
        if spend.legacy {
            input.non_witness_utxo = Some(prev);
        } else {
            input.witness_utxo = Some(prev.output[0].clone());
        }
        input.update_with_descriptor_unchecked(&spend.desc).unwrap();
    }
    psbt
}

fn spent(psbt: &Psbt, index: usize) -> TxOut {
    let input = &psbt.inputs[index];
    match (&input.witness_utxo, &input.non_witness_utxo) {
        (Some(out), _) => out.clone(),
        (None, Some(prev)) => prev.output[psbt.unsigned_tx.input[index].previous_output.vout as usize].clone(),
        (None, None) => panic!("input {index} has no previous output"),
    }
}

/// Checks every partial signature on `index` against an independently
/// computed sighash. Returns how many were checked.
pub fn verify_ecdsa(psbt: &Psbt, index: usize) -> usize {
    let secp = Secp256k1::verification_only();
    let input = &psbt.inputs[index];
    let prev = spent(psbt, index);
    let mut cache = SighashCache::new(&psbt.unsigned_tx);

    let digest: [u8; 32] = if let Some(ws) = &input.witness_script {
        cache.p2wsh_signature_hash(index, ws, prev.value, EcdsaSighashType::All).unwrap().to_byte_array()
    } else if let Some(redeem) = input.redeem_script.as_ref().filter(|r| r.is_p2wpkh()) {
        cache.p2wpkh_signature_hash(index, redeem, prev.value, EcdsaSighashType::All).unwrap().to_byte_array()
    } else if prev.script_pubkey.is_p2wpkh() {
        cache
            .p2wpkh_signature_hash(index, &prev.script_pubkey, prev.value, EcdsaSighashType::All)
            .unwrap()
            .to_byte_array()
    } else {
        let code = input.redeem_script.clone().unwrap_or(prev.script_pubkey.clone());
        cache.legacy_signature_hash(index, &code, EcdsaSighashType::All.to_u32()).unwrap().to_byte_array()
    };
    let msg = Message::from_digest(digest);
    for (pk, sig) in &input.partial_sigs {
        assert_eq!(sig.sighash_type, EcdsaSighashType::All);
        secp.verify_ecdsa(&msg, &sig.signature, &pk.inner).expect("valid ECDSA signature");
    }
    input.partial_sigs.len()
}

/// Verifies the key-path signature on `index` against the output key.
pub fn verify_taproot_key_path(psbt: &Psbt, index: usize) {
    let secp = Secp256k1::verification_only();
    let prevouts: Vec<TxOut> = (0..psbt.inputs.len()).map(|i| spent(psbt, i)).collect();
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(index, &Prevouts::All(&prevouts), TapSighashType::Default)
        .unwrap();
    let sig = psbt.inputs[index].tap_key_sig.as_ref().expect("key-path signature");
    let output_key = XOnlyPublicKey::from_slice(&prevouts[index].script_pubkey.as_bytes()[2..]).unwrap();
    secp.verify_schnorr(&sig.signature, &Message::from_digest(sighash.to_byte_array()), &output_key)
        .expect("valid Schnorr signature");
}
