//! Error taxonomy shared by every operation.

use crate::store::StoreError;
use serde::Serialize;
use thiserror::Error;

pub type SignerResult<T> = Result<T, SignerError>;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("version conflict on {name}: expected version {expected}")]
    Conflict { name: String, expected: u64 },

    #[error("no wallet attached to key {0}")]
    NoWalletAttached(String),

    #[error("no input in the PSBT belongs to key {0}")]
    NothingToSign(String),

    #[error("input {index}: unsupported script: {reason}")]
    UnsupportedScript { index: usize, reason: String },

    #[error("transaction refused by policy: {}", .0.join("; "))]
    PolicyViolation(Vec<String>),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification reported across the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    MalformedInput,
    Conflict,
    NoWalletAttached,
    NothingToSign,
    UnsupportedScript,
    PolicyViolation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::MalformedInput => "malformed_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NoWalletAttached => "no_wallet_attached",
            ErrorKind::NothingToSign => "nothing_to_sign",
            ErrorKind::UnsupportedScript => "unsupported_script",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::Internal => "internal",
        }
    }

    /// Only lost races and unavailable collaborators are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::Internal)
    }

    /// HTTP-style status code for the request boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::MalformedInput => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::NoWalletAttached => 412,
            ErrorKind::NothingToSign => 422,
            ErrorKind::UnsupportedScript => 422,
            ErrorKind::PolicyViolation => 403,
            ErrorKind::Internal => 500,
        }
    }
}

impl SignerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignerError::NotFound(_) => ErrorKind::NotFound,
            SignerError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            SignerError::MalformedInput(_) => ErrorKind::MalformedInput,
            SignerError::Conflict { .. } => ErrorKind::Conflict,
            SignerError::NoWalletAttached(_) => ErrorKind::NoWalletAttached,
            SignerError::NothingToSign(_) => ErrorKind::NothingToSign,
            SignerError::UnsupportedScript { .. } => ErrorKind::UnsupportedScript,
            SignerError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            SignerError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        SignerError::MalformedInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SignerError::Internal(msg.into())
    }
}

impl From<StoreError> for SignerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => SignerError::NotFound(name),
            StoreError::AlreadyExists(name) => SignerError::AlreadyExists(name),
            StoreError::Conflict { name, expected } => SignerError::Conflict { name, expected },
            StoreError::Backend(msg) => SignerError::Internal(format!("key store: {msg}")),
        }
    }
}
