//! FileStore - one JSON envelope per key in a data directory.
//!
//! Create-if-absent publishes a fully written temp file with `hard_link`, which
//! fails atomically when the name is taken. Conditional writes take a
//! `<name>.lock` file (`create_new`), compare versions, then `rename` a temp
//! file over the record. Readers never observe a half-written record.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{KeyStore, StoreError, StoreResult, Version, Versioned};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: Version,
    data: String,
}

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| backend("mkdir", &root, e))?;
        Ok(Self { root })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.lock"))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(".{name}.{}.{n}.tmp", std::process::id()))
    }

    fn write_temp(&self, name: &str, bytes: &[u8], version: Version) -> StoreResult<PathBuf> {
        let envelope = Envelope { version, data: BASE64.encode(bytes) };
        let encoded = serde_json::to_vec(&envelope)
            .map_err(|e| StoreError::Backend(format!("encode {name}: {e}")))?;
        let tmp = self.temp_path(name);
        let mut file = File::create(&tmp).map_err(|e| backend("create", &tmp, e))?;
        file.write_all(&encoded).map_err(|e| backend("write", &tmp, e))?;
        file.sync_all().map_err(|e| backend("sync", &tmp, e))?;
        Ok(tmp)
    }

    fn load(&self, name: &str) -> StoreResult<Versioned> {
        let path = self.record_path(name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(backend("read", &path, e)),
        };
        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Backend(format!("corrupt record {name}: {e}")))?;
        let bytes = BASE64
            .decode(envelope.data)
            .map_err(|e| StoreError::Backend(format!("corrupt record {name}: {e}")))?;
        Ok(Versioned { bytes, version: envelope.version })
    }
}

impl KeyStore for FileStore {
    fn create_if_absent(&self, name: &str, bytes: &[u8]) -> StoreResult<Version> {
        let tmp = self.write_temp(name, bytes, 1)?;
        let target = self.record_path(name);
        let linked = fs::hard_link(&tmp, &target);
        if let Err(e) = fs::remove_file(&tmp) {
            warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
        }
        match linked {
            Ok(()) => {
                debug!(key = %name, "record created");
                Ok(1)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(name.to_string()))
            }
            Err(e) => Err(backend("link", &target, e)),
        }
    }

    fn read(&self, name: &str) -> StoreResult<Versioned> {
        self.load(name)
    }

    fn write_if_version(&self, name: &str, bytes: &[u8], expected: Version) -> StoreResult<Version> {
        let _lock = match WriteLock::acquire(self.lock_path(name)) {
            Ok(lock) => lock,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Another writer is mid-flight; whatever it writes invalidates `expected`.
                return Err(StoreError::Conflict { name: name.to_string(), expected });
            }
            Err(e) => return Err(backend("lock", &self.lock_path(name), e)),
        };

        let current = self.load(name)?;
        if current.version != expected {
            return Err(StoreError::Conflict { name: name.to_string(), expected });
        }

        let next = expected + 1;
        let tmp = self.write_temp(name, bytes, next)?;
        let target = self.record_path(name);
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(backend("rename", &target, e));
        }
        debug!(key = %name, version = next, "record updated");
        Ok(next)
    }
}

/// Exclusive per-key writer lock, released on drop.
struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    fn acquire(path: PathBuf) -> io::Result<Self> {
        OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(Self { path })
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release write lock");
        }
    }
}

fn backend(op: &str, path: &Path, err: io::Error) -> StoreError {
    StoreError::Backend(format!("{op} {}: {err}", path.display()))
}
