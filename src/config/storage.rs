//! Persistent Storage
//!
//! Every durable piece of state (server registry, last session, scheduled
//! connections) lives in its own JSON document under the data directory.
//! Documents are rewritten in full on every mutation.
//! Data location: `~/.tether` unless overridden.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Current on-disk document version
pub const STORE_VERSION: u32 = 1;

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the default data directory (`~/.tether`)
pub fn data_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".tether"))
        .ok_or(StorageError::NoDataDir)
}

/// Get the log directory under a data directory
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    data: &'a T,
}

/// A single JSON document on disk
///
/// Writes go to a temp file that is renamed over the target, so a crash mid-write
/// leaves the previous document intact. Concurrent saves are serialized.
pub struct JsonStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Create a store for an explicit file path
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    /// Create a store for `file_name` inside `dir`
    pub fn in_dir(dir: &Path, file_name: &str) -> Self {
        Self::with_path(dir.join(file_name))
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load the document
    ///
    /// Returns the default value if the file doesn't exist. A corrupted file is
    /// backed up and replaced by the default value.
    pub async fn load(&self) -> Result<T, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        match serde_json::from_str::<Envelope<T>>(&contents) {
            Ok(envelope) => {
                if envelope.version > STORE_VERSION {
                    return Err(StorageError::VersionTooNew {
                        found: envelope.version,
                        supported: STORE_VERSION,
                    });
                }
                Ok(envelope.data)
            }
            Err(e) => {
                tracing::warn!("Store {:?} corrupted: {}", self.path, e);

                match self.backup().await {
                    Ok(backup_path) => {
                        tracing::warn!(
                            "Corrupted store backed up to {:?}, using defaults",
                            backup_path
                        );
                    }
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted store: {}", backup_err);
                    }
                }

                Ok(T::default())
            }
        }
    }

    /// Save the document, replacing whatever is on disk
    pub async fn save(&self, value: &T) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&EnvelopeRef {
            version: STORE_VERSION,
            data: value,
        })?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Delete the document. Missing files are not an error.
    pub async fn remove(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Check if the document exists on disk
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Get document path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the current document next to itself with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
