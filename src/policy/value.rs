use std::collections::{BTreeSet, HashSet};

use bitcoin::bip32::ChildNumber;
use bitcoin::{Psbt, ScriptBuf};
use miniscript::descriptor::{Descriptor, DescriptorPublicKey};
use tracing::{debug, warn};

use super::Policy;
use crate::error::SignerResult;
use crate::wallet::WalletDescriptor;

/// Caps the value a single transaction may send outside the wallet.
/// Outputs paying the wallet's own receive or change scripts are not spend.
pub struct ValuePolicy {
    max_spend_per_tx: u64,
    descriptors: Vec<Descriptor<DescriptorPublicKey>>,
    known: HashSet<ScriptBuf>,
}

impl ValuePolicy {
    pub fn new(wallet: &WalletDescriptor, max_spend_per_tx: u64, lookahead: u32) -> SignerResult<Self> {
        let descriptors = wallet.descriptors()?;
        let mut known = HashSet::new();
        for desc in &descriptors {
            for index in 0..lookahead {
                if let Some(script) = script_at(desc, index) {
                    known.insert(script);
                }
                if !desc.has_wildcard() {
                    break;
                }
            }
        }
        Ok(Self { max_spend_per_tx, descriptors, known })
    }

    fn is_mine(&self, script: &ScriptBuf, hinted: &BTreeSet<u32>) -> bool {
        if self.known.contains(script) {
            return true;
        }
        hinted.iter().any(|&index| {
            self.descriptors.iter().any(|desc| script_at(desc, index).as_ref() == Some(script))
        })
    }
}

fn script_at(desc: &Descriptor<DescriptorPublicKey>, index: u32) -> Option<ScriptBuf> {
    desc.at_derivation_index(index).ok().map(|d| d.script_pubkey())
}

/// Final unhardened step of each derivation path the PSBT declares for an output.
fn hinted_indices(psbt: &Psbt, output: usize) -> BTreeSet<u32> {
    let Some(meta) = psbt.outputs.get(output) else { return BTreeSet::new() };
    let ecdsa = meta.bip32_derivation.values().map(|(_, path)| path);
    let taproot = meta.tap_key_origins.values().map(|(_, (_, path))| path);
    ecdsa
        .chain(taproot)
        .filter_map(|path| match path.as_ref().last() {
            Some(ChildNumber::Normal { index }) => Some(*index),
            _ => None,
        })
        .collect()
}

impl Policy for ValuePolicy {
    fn name(&self) -> &'static str {
        "value"
    }

    fn check(&self, psbt: &Psbt) -> Result<(), String> {
        let mut total: u64 = 0;
        for (index, txout) in psbt.unsigned_tx.output.iter().enumerate() {
            if self.is_mine(&txout.script_pubkey, &hinted_indices(psbt, index)) {
                continue;
            }
            total = total.saturating_add(txout.value.to_sat());
        }
        debug!(total, limit = self.max_spend_per_tx, "value leaving wallet");
        if total <= self.max_spend_per_tx {
            Ok(())
        } else {
            warn!(total, limit = self.max_spend_per_tx, "spend exceeds policy limit");
            Err(format!(
                "transaction spends {total} sat, above the limit of {} sat",
                self.max_spend_per_tx
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::testing::*;
    use bitcoin::bip32::{DerivationPath, Fingerprint};
    use bitcoin::secp256k1::PublicKey;
    use std::str::FromStr;

    fn own_script(chain: u32, index: u32) -> ScriptBuf {
        let descriptors = wallet().descriptors().unwrap();
        script_at(&descriptors[chain as usize], index).unwrap()
    }

    #[test]
    fn conformant_spend_is_allowed() {
        let policy = ValuePolicy::new(&wallet(), 50_000, 10).unwrap();
        let psbt = psbt_paying(vec![(foreign_script(1), 20_000), (own_script(1, 3), 900_000)]);
        assert!(policy.check(&psbt).is_ok());
    }

    #[test]
    fn oversized_spend_is_refused() {
        let policy = ValuePolicy::new(&wallet(), 50_000, 10).unwrap();
        let psbt = psbt_paying(vec![(foreign_script(1), 30_000), (foreign_script(2), 30_000)]);
        let reason = policy.check(&psbt).unwrap_err();
        assert!(reason.contains("60000"), "{reason}");
    }

    #[test]
    fn change_beyond_lookahead_counts_with_a_hint() {
        let policy = ValuePolicy::new(&wallet(), 50_000, 5).unwrap();
        let change = own_script(1, 250);
        let mut psbt = psbt_paying(vec![(foreign_script(1), 20_000), (change, 900_000)]);
        assert!(policy.check(&psbt).is_err());

        let key = PublicKey::from_str("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798").unwrap();
        let path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(84).unwrap(),
            ChildNumber::from_hardened_idx(1).unwrap(),
            ChildNumber::from_hardened_idx(0).unwrap(),
            ChildNumber::from_normal_idx(1).unwrap(),
            ChildNumber::from_normal_idx(250).unwrap(),
        ]);
        psbt.outputs[1]
            .bip32_derivation
            .insert(key, (Fingerprint::from_str("c258d2e4").unwrap(), path));
        assert!(policy.check(&psbt).is_ok());
    }
}
