//! Randomness Source - where new key material comes from.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{SignerError, SignerResult};

/// Bytes of entropy behind every new key (a 24-word BIP39 mnemonic).
pub const SEED_ENTROPY_LEN: usize = 32;

pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> SignerResult<()>;
}

/// Operating-system CSPRNG (getrandom under the hood).
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> SignerResult<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| SignerError::internal(format!("entropy source: {e}")))?;
        if buf.iter().all(|&b| b == 0) {
            return Err(SignerError::internal("entropy source returned an all-zero buffer"));
        }
        Ok(())
    }
}
