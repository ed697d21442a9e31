//! Wallet-export grammars.
//!
//! | Grammar | Recognised by | Notes |
//! |---------|---------------|-------|
//! | BlueWallet / Coldcard multisig setup file | `Policy:` or `XXXXXXXX: xpub` lines | SLIP-132 keys normalized |
//! | BDK JSON wallet export | leading `{` | `descriptor`, `label`, `blockheight` |
//! | Bare output descriptor | anything else | optional second line = change |
//!
//! Blobs may arrive raw or base64 encoded.

use std::str::FromStr;
use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::{Network, NetworkKind};
use miniscript::descriptor::{Descriptor, DescriptorPublicKey};
use regex::Regex;
use serde::Deserialize;

use super::descriptor::{multisig_threshold, parse_descriptor, sibling_change};
use super::slip132::parse_xpub;
use crate::error::{SignerError, SignerResult};
use crate::keys::{format_path, parse_path};

/// Descriptors recovered from an export, before any ownership check.
#[derive(Debug, Clone)]
pub struct ParsedExport {
    pub label: Option<String>,
    pub threshold: Option<usize>,
    pub receive: Descriptor<DescriptorPublicKey>,
    pub change: Option<Descriptor<DescriptorPublicKey>>,
}

pub fn parse_export(blob: &[u8], network: Network) -> SignerResult<ParsedExport> {
    let text = decode_text(blob)?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SignerError::malformed("empty wallet export"));
    }
    if trimmed.starts_with('{') {
        parse_json_export(trimmed)
    } else if looks_like_multisig_file(trimmed) {
        parse_multisig_file(trimmed, network)
    } else {
        parse_bare_descriptors(trimmed)
    }
}

fn decode_text(blob: &[u8]) -> SignerResult<String> {
    if let Ok(text) = std::str::from_utf8(blob) {
        if text.contains(':') || text.contains('(') || text.contains('{') {
            return Ok(text.to_string());
        }
        let compact: String = text.split_whitespace().collect();
        if let Ok(decoded) = BASE64.decode(compact.as_bytes()) {
            return String::from_utf8(decoded)
                .map_err(|_| SignerError::malformed("base64 wallet export is not UTF-8 text"));
        }
        return Ok(text.to_string());
    }
    Err(SignerError::malformed("wallet export is neither UTF-8 text nor base64"))
}

struct Patterns {
    name: Regex,
    policy: Regex,
    derivation: Regex,
    format: Regex,
    key: Regex,
    key_derivation_comment: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        name: Regex::new(r"^Name:\s*(.+)$").expect("name pattern"),
        policy: Regex::new(r"^Policy:\s*(\d+)\s+of\s+(\d+)$").expect("policy pattern"),
        derivation: Regex::new(r"^Derivation:\s*(\S+)$").expect("derivation pattern"),
        format: Regex::new(r"^Format:\s*(\S+)$").expect("format pattern"),
        key: Regex::new(r"^([A-Fa-f0-9]{8}):\s*(\S+)$").expect("key pattern"),
        key_derivation_comment: Regex::new(r"(?i)^#\s*derivation:\s*(\S+)$").expect("comment pattern"),
    })
}

fn looks_like_multisig_file(text: &str) -> bool {
    let p = patterns();
    text.lines().map(str::trim).any(|l| p.policy.is_match(l) || p.key.is_match(l))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultisigFormat {
    P2wsh,
    P2shP2wsh,
    P2sh,
}

impl MultisigFormat {
    fn parse(raw: &str) -> SignerResult<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "P2WSH" => Ok(MultisigFormat::P2wsh),
            "P2SH-P2WSH" | "P2WSH-P2SH" => Ok(MultisigFormat::P2shP2wsh),
            "P2SH" => Ok(MultisigFormat::P2sh),
            other => Err(SignerError::malformed(format!("unsupported multisig format {other}"))),
        }
    }

    fn wrap(self, inner: &str) -> String {
        match self {
            MultisigFormat::P2wsh => format!("wsh({inner})"),
            MultisigFormat::P2shP2wsh => format!("sh(wsh({inner}))"),
            MultisigFormat::P2sh => format!("sh({inner})"),
        }
    }
}

struct Cosigner {
    fingerprint: Fingerprint,
    path: DerivationPath,
    xpub: String,
}

fn parse_multisig_file(text: &str, network: Network) -> SignerResult<ParsedExport> {
    let p = patterns();
    let mut label = None;
    let mut policy: Option<(usize, usize)> = None;
    let mut derivation: Option<DerivationPath> = None;
    let mut format = MultisigFormat::P2wsh;
    let mut pending_derivation: Option<DerivationPath> = None;
    let mut cosigners = Vec::new();
    let expected_kind = NetworkKind::from(network);

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            if let Some(caps) = p.key_derivation_comment.captures(line) {
                pending_derivation = Some(parse_path(&caps[1])?);
            }
            continue;
        }
        if let Some(caps) = p.name.captures(line) {
            label = Some(caps[1].trim().to_string());
        } else if let Some(caps) = p.policy.captures(line) {
            let m: usize = caps[1].parse().map_err(|_| SignerError::malformed("policy threshold"))?;
            let n: usize = caps[2].parse().map_err(|_| SignerError::malformed("policy size"))?;
            policy = Some((m, n));
        } else if let Some(caps) = p.derivation.captures(line) {
            derivation = Some(parse_path(&caps[1])?);
        } else if let Some(caps) = p.format.captures(line) {
            format = MultisigFormat::parse(&caps[1])?;
        } else if let Some(caps) = p.key.captures(line) {
            let fingerprint = Fingerprint::from_str(&caps[1].to_ascii_lowercase())
                .map_err(|e| SignerError::malformed(format!("fingerprint {}: {e}", &caps[1])))?;
            let xpub = parse_xpub(&caps[2])?;
            if xpub.network != expected_kind {
                return Err(SignerError::malformed(format!(
                    "key {fingerprint} is not for network {network}"
                )));
            }
            let path = pending_derivation
                .take()
                .or_else(|| derivation.clone())
                .ok_or_else(|| SignerError::malformed(format!("no derivation path for key {fingerprint}")))?;
            cosigners.push(Cosigner { fingerprint, path, xpub: xpub.to_string() });
        } else {
            return Err(SignerError::malformed(format!(
                "unrecognised line {} in multisig setup file",
                lineno + 1
            )));
        }
    }

    let (threshold, total) = policy.ok_or_else(|| SignerError::malformed("missing Policy line"))?;
    if cosigners.len() != total {
        return Err(SignerError::malformed(format!(
            "policy declares {total} keys but {} were listed",
            cosigners.len()
        )));
    }
    if threshold == 0 || threshold > total {
        return Err(SignerError::malformed(format!("invalid policy {threshold} of {total}")));
    }

    let build = |chain: u32| {
        let keys: Vec<String> = cosigners
            .iter()
            .map(|c| {
                let origin = format_path(&c.path);
                let suffix = origin.strip_prefix('m').unwrap_or(&origin);
                format!("[{}{}]{}/{chain}/*", c.fingerprint, suffix, c.xpub)
            })
            .collect();
        format.wrap(&format!("sortedmulti({threshold},{})", keys.join(",")))
    };

    Ok(ParsedExport {
        label,
        threshold: Some(threshold),
        receive: parse_descriptor(&build(0))?,
        change: Some(parse_descriptor(&build(1))?),
    })
}

#[derive(Deserialize)]
struct JsonExport {
    descriptor: String,
    #[serde(default)]
    change_descriptor: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    blockheight: Option<u32>,
}

fn parse_json_export(text: &str) -> SignerResult<ParsedExport> {
    let export: JsonExport = serde_json::from_str(text)
        .map_err(|e| SignerError::malformed(format!("wallet export JSON: {e}")))?;
    let receive = parse_descriptor(&export.descriptor)?;
    let change = match export.change_descriptor.or_else(|| sibling_change(&export.descriptor)) {
        Some(change) => Some(parse_descriptor(&change)?),
        None => None,
    };
    Ok(ParsedExport {
        label: export.label.filter(|l| !l.is_empty()),
        threshold: multisig_threshold(&receive),
        receive,
        change,
    })
}

fn parse_bare_descriptors(text: &str) -> SignerResult<ParsedExport> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    let (receive, change) = match lines.as_slice() {
        [receive] => (
            parse_descriptor(receive)?,
            sibling_change(receive).map(|c| parse_descriptor(&c)).transpose()?,
        ),
        [receive, change] => (parse_descriptor(receive)?, Some(parse_descriptor(change)?)),
        _ => return Err(SignerError::malformed("expected one or two descriptor lines")),
    };
    Ok(ParsedExport { label: None, threshold: multisig_threshold(&receive), receive, change })
}
