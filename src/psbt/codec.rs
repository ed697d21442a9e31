//! PSBT wire forms: raw BIP174 bytes or base64 text. Replies use the form
//! the request arrived in.
//!
//! Signed PSBTs are produced by splicing new key-value pairs into the input
//! maps of the bytes received, so every map the signer did not touch (and the
//! order of entries inside touched maps) comes back exactly as it arrived.
//!
//! ```text
//! magic | global map 00 | input 0 .. [new pairs] 00 | input 1 .. 00 | outputs ..
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bitcoin::consensus::encode::{deserialize_partial, serialize, VarInt};
use bitcoin::Psbt;
use serde::Serialize;

use crate::error::{SignerError, SignerResult};

const MAGIC: &[u8; 5] = b"psbt\xff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Binary,
    Base64,
}

/// One raw key-value pair: key (type byte + key data) and value.
pub(crate) type RawPair = (Vec<u8>, Vec<u8>);

pub fn decode(bytes: &[u8]) -> SignerResult<(Psbt, Encoding)> {
    decode_raw(bytes).map(|(psbt, encoding, _)| (psbt, encoding))
}

/// Like [`decode`], also returning the BIP174 bytes the PSBT was parsed from.
pub(crate) fn decode_raw(bytes: &[u8]) -> SignerResult<(Psbt, Encoding, Vec<u8>)> {
    if bytes.starts_with(MAGIC) {
        return parse(bytes).map(|psbt| (psbt, Encoding::Binary, bytes.to_vec()));
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|_| SignerError::malformed("PSBT is neither binary nor base64 text"))?;
    let compact: String = text.split_whitespace().collect();
    let raw = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| SignerError::malformed(format!("PSBT base64: {e}")))?;
    if !raw.starts_with(MAGIC) {
        return Err(SignerError::malformed("PSBT magic bytes missing"));
    }
    let psbt = parse(&raw)?;
    Ok((psbt, Encoding::Base64, raw))
}

pub fn encode(psbt: &Psbt, encoding: Encoding) -> Vec<u8> {
    wrap(psbt.serialize(), encoding)
}

pub(crate) fn wrap(raw: Vec<u8>, encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Binary => raw,
        Encoding::Base64 => BASE64.encode(raw).into_bytes(),
    }
}

/// Inserts `additions[i]` just before the terminator of input map `i`.
/// Every other byte of `raw` is copied through unchanged.
pub(crate) fn splice_inputs(raw: &[u8], additions: &[Vec<RawPair>]) -> SignerResult<Vec<u8>> {
    let mut terminators = Vec::with_capacity(additions.len());
    let mut pos = map_terminator(raw, MAGIC.len())? + 1;
    for _ in additions {
        let end = map_terminator(raw, pos)?;
        terminators.push(end);
        pos = end + 1;
    }

    let mut out = Vec::with_capacity(raw.len() + 128 * additions.len());
    let mut copied = 0;
    for (&end, pairs) in terminators.iter().zip(additions) {
        out.extend_from_slice(&raw[copied..end]);
        for (key, value) in pairs {
            out.extend(serialize(&VarInt(key.len() as u64)));
            out.extend_from_slice(key);
            out.extend(serialize(&VarInt(value.len() as u64)));
            out.extend_from_slice(value);
        }
        copied = end;
    }
    out.extend_from_slice(&raw[copied..]);
    Ok(out)
}

/// Offset of the `0x00` byte that closes the map starting at `pos`.
fn map_terminator(raw: &[u8], mut pos: usize) -> SignerResult<usize> {
    loop {
        let key_len = compact_size(raw, &mut pos)?;
        if key_len == 0 {
            return Ok(pos - 1);
        }
        pos = advance(raw, pos, key_len)?;
        let value_len = compact_size(raw, &mut pos)?;
        pos = advance(raw, pos, value_len)?;
    }
}

fn compact_size(raw: &[u8], pos: &mut usize) -> SignerResult<u64> {
    let rest = raw.get(*pos..).ok_or_else(truncated)?;
    let (VarInt(n), used) = deserialize_partial::<VarInt>(rest)
        .map_err(|e| SignerError::internal(format!("PSBT map: {e}")))?;
    *pos += used;
    Ok(n)
}

fn advance(raw: &[u8], pos: usize, len: u64) -> SignerResult<usize> {
    usize::try_from(len)
        .ok()
        .and_then(|len| pos.checked_add(len))
        .filter(|&end| end <= raw.len())
        .ok_or_else(truncated)
}

fn truncated() -> SignerError {
    SignerError::internal("PSBT map runs past the end of the buffer")
}

fn parse(raw: &[u8]) -> SignerResult<Psbt> {
    Psbt::deserialize(raw).map_err(|e| SignerError::malformed(format!("PSBT: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Transaction, TxIn, TxOut};

    fn sample() -> Psbt {
        Psbt::from_unsigned_tx(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn::default()],
            output: vec![TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() }],
        })
        .unwrap()
    }

    #[test]
    fn encoding_is_detected_and_preserved() {
        let psbt = sample();
        let binary = encode(&psbt, Encoding::Binary);
        let (decoded, enc) = decode(&binary).unwrap();
        assert_eq!(enc, Encoding::Binary);
        assert_eq!(decoded, psbt);

        let text = encode(&psbt, Encoding::Base64);
        assert!(text.starts_with(b"cHNidP8"));
        let (decoded, enc) = decode(&text).unwrap();
        assert_eq!(enc, Encoding::Base64);
        assert_eq!(encode(&decoded, enc), text);
    }

    #[test]
    fn base64_tolerates_line_breaks() {
        let mut text = encode(&sample(), Encoding::Base64);
        text.insert(10, b'\n');
        text.push(b'\n');
        assert!(decode(&text).is_ok());
    }

    /// Global map with two unknown entries in non-canonical order (0xa1 before 0xa0).
    fn with_unordered_globals(psbt: &Psbt) -> Vec<u8> {
        let canonical = psbt.serialize();
        let end = map_terminator(&canonical, MAGIC.len()).unwrap();
        let mut raw = canonical[..end].to_vec();
        raw.extend_from_slice(&[0x01, 0xa1, 0x01, 0xbb, 0x01, 0xa0, 0x01, 0xaa]);
        raw.extend_from_slice(&canonical[end..]);
        raw
    }

    #[test]
    fn splice_keeps_untouched_bytes() {
        let raw = with_unordered_globals(&sample());
        let (parsed, _, kept) = decode_raw(&raw).unwrap();
        assert_eq!(kept, raw);
        // Re-serializing would sort the unknown entries.
        assert_ne!(parsed.serialize(), raw);

        let pair = (vec![0xf0, 0x01], vec![0x02, 0x03]);
        let spliced = splice_inputs(&raw, &[vec![pair]]).unwrap();
        assert_eq!(spliced.len(), raw.len() + 6);

        let input_end = map_terminator(&raw, map_terminator(&raw, MAGIC.len()).unwrap() + 1).unwrap();
        assert_eq!(spliced[..input_end], raw[..input_end]);
        assert_eq!(spliced[input_end..input_end + 6], [0x02, 0xf0, 0x01, 0x02, 0x02, 0x03]);
        assert_eq!(spliced[input_end + 6..], raw[input_end..]);

        let reparsed = Psbt::deserialize(&spliced).unwrap();
        assert_eq!(reparsed.inputs[0].unknown.len(), 1);
    }

    #[test]
    fn splice_without_additions_is_identity() {
        let raw = with_unordered_globals(&sample());
        assert_eq!(splice_inputs(&raw, &[Vec::new()]).unwrap(), raw);
    }

    #[test]
    fn garbage_is_malformed() {
        for bytes in [&b"psbt\xff\x00"[..], &b"not a psbt"[..], &b"aGVsbG8="[..], &[0xff, 0x00][..]] {
            assert!(matches!(decode(bytes), Err(SignerError::MalformedInput(_))));
        }
    }
}
