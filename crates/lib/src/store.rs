//! Key/value persistence that survives process restarts.
//!
//! Values are JSON. [`FileStore`] keeps one file per key in the storage directory;
//! [`MemoryStore`] keeps everything in memory (tests, or when no directory is usable).

use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Current session snapshot.
pub const SESSION_KEY: &str = "willow_chat_state";
/// Append-only transcript log across resets.
pub const TRANSCRIPT_KEY: &str = "willow_transcript";
/// Append-only list of captured leads.
pub const LEADS_KEY: &str = "willow_leads";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid json: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable key/value storage. Implementations must never panic on I/O failure.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read the value under `key`; `None` when nothing is stored.
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value under `key`.
    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Remove the value under `key`. Clearing a missing key is not an error.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;

    /// Edit the JSON array under `key` in place and write it back, returning `edit`'s result.
    /// A missing or non-array value starts as an empty list. The read, the edit and the write
    /// happen as one step: no other `update` on the same key can interleave.
    async fn update<R, F>(&self, key: &str, edit: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Vec<Value>) -> R + Send + 'static;

    /// Push `item` onto the JSON array under `key` (created when missing).
    async fn append(&self, key: &str, item: Value) -> Result<(), StoreError> {
        self.update(key, move |list| list.push(item)).await
    }
}

/// Load and deserialize the value under `key`.
pub async fn load_typed<S, T>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    S: Store + ?Sized,
    T: DeserializeOwned,
{
    match store.load(key).await? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

/// Serialize `value` and store it under `key`.
pub async fn save_typed<S, T>(store: &S, key: &str, value: &T) -> Result<(), StoreError>
where
    S: Store + ?Sized,
    T: Serialize + ?Sized,
{
    let v = serde_json::to_value(value)?;
    store.save(key, &v).await
}

/// Store backed by a directory: `<dir>/<key>.json`, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir` as the storage directory; it is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn lock_path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!(".{}.lock", key))
    }
}

fn read_json(path: &Path) -> Result<Option<Value>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(s) if s.trim().is_empty() => Ok(None),
        Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json_atomic(dir: &Path, path: &Path, value: &Value) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
    let bytes = serde_json::to_vec(value)?;
    let result = (|| -> Result<(), StoreError> {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Hold an exclusive advisory lock on `lock_path` while running `f`.
fn with_lock<T>(
    dir: &Path,
    lock_path: &Path,
    f: impl FnOnce() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    std::fs::create_dir_all(dir)?;
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)?;
    lock.lock_exclusive()?;
    let out = f();
    let _ = lock.unlock();
    out
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

#[async_trait]
impl Store for FileStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key);
        blocking(move || read_json(&path)).await
    }

    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let lock_path = self.lock_path_for(key);
        let value = value.clone();
        blocking(move || with_lock(&dir, &lock_path, || write_json_atomic(&dir, &path, &value)))
            .await
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    /// Runs under the key's lock, so separate processes sharing the directory serialize.
    async fn update<R, F>(&self, key: &str, edit: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Vec<Value>) -> R + Send + 'static,
    {
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let lock_path = self.lock_path_for(key);
        blocking(move || {
            with_lock(&dir, &lock_path, || {
                let mut list = match read_json(&path)? {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                let out = edit(&mut list);
                write_json_atomic(&dir, &path, &Value::Array(list))?;
                Ok(out)
            })
        })
        .await
    }
}

/// In-memory store. Can be marked unavailable to exercise persistence failures.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, Value>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every operation fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("quota exceeded".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check()?;
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .write()
            .await
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn update<R, F>(&self, key: &str, edit: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Vec<Value>) -> R + Send + 'static,
    {
        self.check()?;
        let mut g = self.inner.write().await;
        let mut list = match g.remove(key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        let out = edit(&mut list);
        g.insert(key.to_string(), Value::Array(list));
        Ok(out)
    }
}
