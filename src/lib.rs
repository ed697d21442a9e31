//! Keywarden: custodial signing backend for HD Bitcoin wallets.
//!
//! # Architecture
//!
//! ```text
//! request ──→ Dispatcher
//!               │
//!               ├── KeyManager      create_key, get_xpub
//!               ├── WalletImporter  import (BlueWallet / Coldcard / BDK / descriptor)
//!               └── PsbtSigner      sign (spend policy, then per-input sighash)
//!                        │
//!                        ▼
//!               KeyStore (versioned, conditional writes) + EntropySource
//! ```
//!
//! # Operations
//!
//! | Operation | Method | Description |
//! |-----------|--------|-------------|
//! | create key | `keys.create_key(name)` | New seed, returns account xpub |
//! | get xpub | `keys.get_xpub(name, path)` | Deterministic public derivation |
//! | import wallet | `importer.import(name, blob)` | Attach a watch-only descriptor |
//! | sign | `signer.sign(name, psbt, options)` | Sign the inputs this key owns |
//!
//! # Features
//!
//! - `server` (default) - axum HTTP adapter, signal handling, and the `keywarden` binary
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use keywarden::{Dispatcher, FileStore, Operation, OsEntropy, SignerConfig};
//!
//! let config = SignerConfig::from_env()?;
//! let store = FileStore::open(&config.data_dir)?;
//! let dispatcher = Dispatcher::new(&config, Arc::new(store), Arc::new(OsEntropy));
//!
//! let reply = dispatcher.dispatch(Operation::CreateKey { name: "alpha".into() });
//! assert_eq!(reply.status, 201);
//! ```

pub mod config;
pub mod dispatch;
pub mod entropy;
pub mod error;
pub mod keys;
pub mod logging;
pub mod policy;
pub mod psbt;
pub mod store;
pub mod wallet;

#[cfg(feature = "server")]
pub mod runtime;
#[cfg(feature = "server")]
pub mod server;

pub use config::{ConfigError, SignerConfig};
pub use dispatch::{Dispatcher, Operation, Reply};
pub use entropy::{EntropySource, OsEntropy};
pub use error::{ErrorKind, SignerError, SignerResult};
pub use keys::{ExtendedPublicKey, KeyManager, KeyRecord, KeySummary};
pub use policy::PolicyConfig;
pub use psbt::{PsbtSigner, SignOptions, SignOutcome, SignReport};
pub use store::{FileStore, KeyStore, MemoryStore, StoreError};
pub use wallet::{WalletDescriptor, WalletImporter};

#[cfg(feature = "server")]
pub use runtime::{install_signal_handlers, Shutdown};

pub use bitcoin::Network;
