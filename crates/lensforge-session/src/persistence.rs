//! Durable key-value persistence.
//!
//! [`PersistenceHandler`] is the only component that touches storage. It
//! serializes values to JSON, optionally gzips them, and hands the bytes to
//! a [`StorageBackend`]: an in-memory map, one file per key, or the remote
//! key-value placeholder that rejects every call.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use lensforge_core::config::{BackendKind, PersistenceConfig};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors that can occur during persistence operations.
///
/// A missing key is not an error; `load` returns `Ok(None)` for it.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Storage backend '{backend}' is not implemented")]
    NotImplemented { backend: &'static str },

    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Raw byte storage keyed by string.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Replace the value stored under `key`.
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Read the value under `key`, `None` if absent.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.read(key).await?.is_some())
    }
}

/// In-process storage, lost on exit.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }
}

/// One file per key at `<root>/<key>.json`.
///
/// The root directory is created on first write. Writes go to a temporary
/// file in the same directory and are renamed over the target, so readers
/// never see a partial value.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let target = self.path_for(key);
        let tmp = self.root.join(format!(".{}.{}.tmp", key, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                if key.starts_with(prefix) {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }
}

/// Placeholder for a remote key-value store. Every call fails.
#[derive(Debug, Default)]
pub struct RedisBackend;

impl RedisBackend {
    fn unsupported<T>() -> Result<T> {
        Err(PersistenceError::NotImplemented { backend: "redis" })
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn write(&self, _key: &str, _bytes: Vec<u8>) -> Result<()> {
        Self::unsupported()
    }

    async fn read(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Self::unsupported()
    }

    async fn remove(&self, _key: &str) -> Result<bool> {
        Self::unsupported()
    }

    async fn keys(&self, _prefix: &str) -> Result<Vec<String>> {
        Self::unsupported()
    }

    async fn contains(&self, _key: &str) -> Result<bool> {
        Self::unsupported()
    }
}

/// JSON + optional gzip on top of a [`StorageBackend`].
pub struct PersistenceHandler {
    backend: Box<dyn StorageBackend>,
    compression: bool,
}

impl PersistenceHandler {
    /// Build the backend selected by configuration.
    pub fn new(config: &PersistenceConfig) -> Self {
        let backend: Box<dyn StorageBackend> = match config.backend {
            BackendKind::Memory => Box::new(MemoryBackend::new()),
            BackendKind::File => Box::new(FileBackend::new(&config.location)),
            BackendKind::Redis => Box::new(RedisBackend),
        };
        Self::with_backend(backend, config.compression)
    }

    pub fn with_backend(backend: Box<dyn StorageBackend>, compression: bool) -> Self {
        Self {
            backend,
            compression,
        }
    }

    /// In-memory handler without compression.
    pub fn in_memory() -> Self {
        Self::with_backend(Box::new(MemoryBackend::new()), false)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        validate_key(key)?;
        let json = serde_json::to_vec(value)?;
        let bytes = if self.compression {
            gzip(&json)?
        } else {
            json
        };
        tracing::trace!(key, bytes = bytes.len(), backend = self.backend.name(), "save");
        self.backend.write(key, bytes).await
    }

    /// Load and decode `key`.
    ///
    /// Only a missing key yields `Ok(None)`; undecodable content is an error.
    /// Gzipped values are recognized by their magic bytes, so values written
    /// under either compression setting can be read back.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        validate_key(key)?;
        let Some(bytes) = self.backend.read(key).await? else {
            return Ok(None);
        };
        let json = if bytes.starts_with(&GZIP_MAGIC) {
            gunzip(&bytes)?
        } else {
            bytes
        };
        Ok(Some(serde_json::from_slice(&json)?))
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.backend.remove(key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.backend.keys(prefix).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.backend.contains(key).await
    }

    /// Hex SHA-256 of the canonical JSON of `value`.
    ///
    /// Canonical means object keys are sorted, so equal values hash equally
    /// regardless of field declaration order.
    pub fn checksum<T: Serialize + ?Sized>(value: &T) -> Result<String> {
        let canonical = serde_json::to_value(value)?;
        let bytes = serde_json::to_vec(&canonical)?;
        let digest = Sha256::digest(&bytes);
        Ok(format!("{:x}", digest))
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\'])
        || key.contains("..")
    {
        return Err(PersistenceError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| PersistenceError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| PersistenceError::Compression(e.to_string()))
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PersistenceError::Compression(e.to_string()))?;
    Ok(out)
}
