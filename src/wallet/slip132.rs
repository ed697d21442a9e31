//! SLIP-132 version bytes. Some wallets export `Zpub`/`Ypub`/`vpub`... to
//! signal the script type; descriptors want plain `xpub`/`tpub`.

use bitcoin::base58;
use bitcoin::bip32::Xpub;

use crate::error::{SignerError, SignerResult};

const XPUB: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const TPUB: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];

const MAINNET_ALIASES: [[u8; 4]; 5] = [
    XPUB,
    [0x04, 0x9d, 0x7c, 0xb2], // ypub
    [0x04, 0xb2, 0x47, 0x46], // zpub
    [0x02, 0x95, 0xb4, 0x3f], // Ypub
    [0x02, 0xaa, 0x7e, 0xd3], // Zpub
];

const TESTNET_ALIASES: [[u8; 4]; 5] = [
    TPUB,
    [0x04, 0x4a, 0x52, 0x62], // upub
    [0x04, 0x5f, 0x1c, 0xf6], // vpub
    [0x02, 0x42, 0x89, 0xef], // Upub
    [0x02, 0x57, 0x54, 0x83], // Vpub
];

/// Parse any SLIP-132 flavoured extended public key as a plain `Xpub`.
pub fn parse_xpub(encoded: &str) -> SignerResult<Xpub> {
    let mut data = base58::decode_check(encoded.trim())
        .map_err(|e| SignerError::malformed(format!("extended key {encoded}: {e}")))?;
    if data.len() != 78 {
        return Err(SignerError::malformed(format!(
            "extended key {encoded}: expected 78 bytes, got {}",
            data.len()
        )));
    }
    let version: [u8; 4] = [data[0], data[1], data[2], data[3]];
    let canonical = if MAINNET_ALIASES.contains(&version) {
        XPUB
    } else if TESTNET_ALIASES.contains(&version) {
        TPUB
    } else {
        return Err(SignerError::malformed(format!(
            "extended key {encoded}: unknown version bytes {}",
            hex::encode(version)
        )));
    };
    data[..4].copy_from_slice(&canonical);
    Xpub::decode(&data).map_err(|e| SignerError::malformed(format!("extended key {encoded}: {e}")))
}
