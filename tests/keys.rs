//! Key lifecycle over both stores: creation races, persistence, import conflicts.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::TempDir;

use common::*;
use keywarden::store::{StoreResult, Version, Versioned};
use keywarden::{ErrorKind, FileStore, KeyStore, MemoryStore, SignerError, WalletImporter};

fn race_create(store: Arc<dyn KeyStore>, racers: usize) -> Vec<Result<String, ErrorKind>> {
    let barrier = Arc::new(Barrier::new(racers));
    let handles: Vec<_> = (0..racers)
        .map(|seed| {
            let keys = keywarden::KeyManager::new(
                store.clone(),
                Arc::new(Fixed(seed as u8 + 1)),
                keywarden::Network::Regtest,
                keywarden::keys::parse_path("m/48'/1'/0'/2'").unwrap(),
            );
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                keys.create_key("beta").map(|s| s.fingerprint).map_err(|e| e.kind())
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn assert_single_winner(store: Arc<dyn KeyStore>) {
    let results = race_create(store.clone(), 8);
    let winners: Vec<&String> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "{results:?}");
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|kind| *kind == ErrorKind::AlreadyExists));

    // The stored seed is the winner's, not a mix of racers.
    let stored = manager_over(store).load("beta").unwrap();
    assert_eq!(&stored.record.fingerprint, winners[0]);
    assert_eq!(stored.version, 1);
}

#[test]
fn concurrent_create_in_memory_has_one_winner() {
    assert_single_winner(Arc::new(MemoryStore::new()));
}

#[test]
fn concurrent_create_on_disk_has_one_winner() {
    let dir = TempDir::new().unwrap();
    assert_single_winner(Arc::new(FileStore::open(dir.path()).unwrap()));
}

#[test]
fn duplicate_create_leaves_original_untouched() {
    let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
    let keys = manager_over(store.clone());
    let first = keys.create_key("alpha").unwrap();
    let before = store.read("alpha").unwrap();

    let other = keywarden::KeyManager::new(
        store.clone(),
        Arc::new(Fixed(0x11)),
        keywarden::Network::Regtest,
        keywarden::keys::parse_path("m/48'/1'/0'/2'").unwrap(),
    );
    assert!(matches!(other.create_key("alpha"), Err(SignerError::AlreadyExists(_))));
    assert_eq!(store.read("alpha").unwrap(), before);
    assert_eq!(keys.get_xpub("alpha", None).unwrap().xpub, first.xpub);
}

#[test]
fn keys_survive_reopening_the_store() {
    let dir = TempDir::new().unwrap();
    let created = manager_over(Arc::new(FileStore::open(dir.path()).unwrap()))
        .create_key("gamma")
        .unwrap();

    let reopened = manager_over(Arc::new(FileStore::open(dir.path()).unwrap()));
    let xpub = reopened.get_xpub("gamma", None).unwrap();
    assert_eq!(xpub.xpub, created.xpub);
    assert_eq!(xpub.fingerprint, created.fingerprint);
}

#[test]
fn invalid_names_are_rejected() {
    let keys = manager();
    for name in ["", "../escape", "has space", "a/b"] {
        assert_eq!(keys.create_key(name).unwrap_err().kind(), ErrorKind::MalformedInput, "{name:?}");
    }
}

/// Lets a competing writer in between the importer's read and its write.
struct Interloper {
    inner: MemoryStore,
    armed: AtomicBool,
}

impl KeyStore for Interloper {
    fn create_if_absent(&self, name: &str, bytes: &[u8]) -> StoreResult<Version> {
        self.inner.create_if_absent(name, bytes)
    }

    fn read(&self, name: &str) -> StoreResult<Versioned> {
        self.inner.read(name)
    }

    fn write_if_version(&self, name: &str, bytes: &[u8], expected: Version) -> StoreResult<Version> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let current = self.inner.read(name)?;
            self.inner.write_if_version(name, &current.bytes, current.version)?;
        }
        self.inner.write_if_version(name, bytes, expected)
    }
}

fn multisig_export(keys: &keywarden::KeyManager, name: &str) -> String {
    let ours = keys.get_xpub(name, None).unwrap();
    let cosigner = cosigner_key(4, "m/48'/1'/0'/2'");
    format!("wsh(sortedmulti(1,{}/0/*,{}/0/*))", ours.descriptor_key, cosigner)
}

#[test]
fn import_racing_a_writer_conflicts() {
    let store = Arc::new(Interloper { inner: MemoryStore::new(), armed: AtomicBool::new(false) });
    let keys = manager_over(store.clone());
    keys.create_key("alpha").unwrap();
    let blob = multisig_export(&keys, "alpha");

    store.armed.store(true, Ordering::SeqCst);
    let err = WalletImporter::new(keys.clone()).import("alpha", blob.as_bytes()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.kind().is_retryable());
    assert!(keys.load("alpha").unwrap().record.wallet.is_none());

    // A retry reads the new version and goes through.
    let wallet = WalletImporter::new(keys.clone()).import("alpha", blob.as_bytes()).unwrap();
    assert_eq!(keys.load("alpha").unwrap().record.wallet, Some(wallet));
}

#[test]
fn import_of_foreign_wallet_attaches_nothing() {
    let keys = manager();
    keys.create_key("alpha").unwrap();
    let blob = format!(
        "wsh(sortedmulti(1,{}/0/*,{}/0/*))",
        cosigner_key(4, "m/48'/1'/0'/2'"),
        cosigner_key(5, "m/48'/1'/0'/2'")
    );
    let err = WalletImporter::new(keys.clone()).import("alpha", blob.as_bytes()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
    let stored = keys.load("alpha").unwrap();
    assert!(stored.record.wallet.is_none());
    assert_eq!(stored.version, 1);
}

#[test]
fn reimport_replaces_the_wallet() {
    let keys = manager();
    keys.create_key("alpha").unwrap();
    let importer = WalletImporter::new(keys.clone());
    importer.import("alpha", multisig_export(&keys, "alpha").as_bytes()).unwrap();

    let single = format!("wpkh({}/0/*)", keys.get_xpub("alpha", Some("m/84'/1'/0'")).unwrap().descriptor_key);
    let wallet = importer.import("alpha", single.as_bytes()).unwrap();
    let stored = keys.load("alpha").unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.record.wallet, Some(wallet));
}

#[test]
fn invalid_names_never_reach_the_store() {
    let dir = TempDir::new().unwrap();
    let keys = manager_over(Arc::new(FileStore::open(dir.path().join("keys")).unwrap()));
    std::fs::write(dir.path().join("evil.json"), b"not a record").unwrap();

    let importer = WalletImporter::new(keys.clone());
    let signer = keywarden::PsbtSigner::new(keys.clone(), keywarden::PolicyConfig::default());
    for name in ["../evil", "a/b", ""] {
        let err = importer.import(name, b"wpkh(02aabb)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInput, "import {name:?}");
        assert!(!err.kind().is_retryable());

        let err = signer.sign(name, b"cHNidP8=", keywarden::SignOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInput, "sign {name:?}");

        let err = keys.get_xpub(name, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInput, "xpub {name:?}");
    }
}
