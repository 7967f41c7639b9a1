// shared-types-rs/src/storage.rs
// Key/value persistence behind the version store and the run ledger.
//
// Implementation notes:
// - Keys are `namespace/name`; every segment is restricted to [A-Za-z0-9._-].
// - MemoryKvStore backs tests; FileKvStore keeps one JSON document per key.
// - FileKvStore::put_many writes a journal first and replays it on open, so a
//   batch is either fully visible or not at all after a crash. A batch that
//   fails while the process is alive is rolled back from its pre-images.
// - FileKvStore readers share a lock that writers hold exclusively, so a
//   reader never observes a half-applied batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::ErrorClass;

const JOURNAL_FILE: &str = ".journal";
const JOURNAL_TMP_FILE: &str = ".journal.tmp";
const DOC_SUFFIX: &str = ".json";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("journal replay failed: {0}")]
    Journal(String),
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Storage
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Write every entry or none of them.
    async fn put_many(&self, entries: Vec<(String, Vec<u8>)>) -> StorageResult<()>;

    /// All entries whose key starts with `prefix`, sorted by key.
    async fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;
}

pub fn validate_key(key: &str) -> StorageResult<()> {
    let valid_segment = |seg: &str| {
        !seg.is_empty()
            && !seg.starts_with('.')
            && seg
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    };
    if key.split('/').all(valid_segment) {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

pub fn encode_json<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(value)?)
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> StorageResult<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    store.put(key, encode_json(value)?).await
}

pub async fn list_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &str,
) -> StorageResult<Vec<T>> {
    store
        .list_prefix(prefix)
        .await?
        .into_iter()
        .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(StorageError::from))
        .collect()
}

/// In-process store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_many(&self, entries: Vec<(String, Vec<u8>)>) -> StorageResult<()> {
        for (key, _) in &entries {
            validate_key(key)?;
        }
        let mut guard = self.entries.write().await;
        guard.extend(entries);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let guard = self.entries.read().await;
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    key: String,
    value: Vec<u8>,
}

/// One JSON file per key under `root`, e.g. `versions/v1.0` ->
/// `<root>/versions/v1.0.json`.
#[derive(Debug)]
pub struct FileKvStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl FileKvStore {
    /// Open (or create) a store rooted at `root`, finishing any batch a
    /// previous process left in the journal.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let store = Self {
            root,
            lock: RwLock::new(()),
        };
        store.replay_journal().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        let mut segments = key.split('/').peekable();
        while let Some(seg) = segments.next() {
            if segments.peek().is_some() {
                path.push(seg);
            } else {
                path.push(format!("{seg}{DOC_SUFFIX}"));
            }
        }
        path
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn apply(&self, entries: &[JournalEntry]) -> StorageResult<()> {
        for entry in entries {
            Self::write_atomic(&self.path_for(&entry.key), &entry.value).await?;
        }
        Ok(())
    }

    async fn read_existing(path: &Path) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Put every key of a failed batch back the way it was.
    async fn restore(&self, pre_images: &[(PathBuf, Option<Vec<u8>>)]) -> StorageResult<()> {
        for (path, previous) in pre_images {
            match previous {
                Some(bytes) => Self::write_atomic(path, bytes).await?,
                None => match fs::remove_file(path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                },
            }
        }
        Ok(())
    }

    async fn replay_journal(&self) -> StorageResult<()> {
        let tmp = self.root.join(JOURNAL_TMP_FILE);
        if fs::try_exists(&tmp).await? {
            // Never committed; the batch it described was not applied.
            fs::remove_file(&tmp).await?;
        }

        let journal = self.root.join(JOURNAL_FILE);
        if !fs::try_exists(&journal).await? {
            return Ok(());
        }
        let raw = fs::read(&journal).await?;
        let entries: Vec<JournalEntry> =
            serde_json::from_slice(&raw).map_err(|e| StorageError::Journal(e.to_string()))?;
        tracing::warn!(
            root = %self.root.display(),
            entries = entries.len(),
            "replaying interrupted storage batch"
        );
        self.apply(&entries).await?;
        fs::remove_file(&journal).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let _guard = self.lock.read().await;
        Self::read_existing(&self.path_for(key)).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        let _guard = self.lock.write().await;
        Self::write_atomic(&self.path_for(key), &value).await
    }

    async fn put_many(&self, entries: Vec<(String, Vec<u8>)>) -> StorageResult<()> {
        for (key, _) in &entries {
            validate_key(key)?;
        }
        let entries: Vec<JournalEntry> = entries
            .into_iter()
            .map(|(key, value)| JournalEntry { key, value })
            .collect();

        let _guard = self.lock.write().await;
        let mut pre_images = Vec::with_capacity(entries.len());
        for entry in &entries {
            let path = self.path_for(&entry.key);
            let previous = Self::read_existing(&path).await?;
            pre_images.push((path, previous));
        }

        let tmp = self.root.join(JOURNAL_TMP_FILE);
        let journal = self.root.join(JOURNAL_FILE);
        fs::write(&tmp, serde_json::to_vec(&entries)?).await?;
        fs::rename(&tmp, &journal).await?;

        if let Err(err) = self.apply(&entries).await {
            // The journal stays put if the rollback fails too, so the next
            // open finishes the batch instead.
            self.restore(&pre_images).await?;
            fs::remove_file(&journal).await?;
            tracing::warn!(
                root = %self.root.display(),
                error = %err,
                "storage batch failed and was rolled back"
            );
            return Err(err);
        }
        fs::remove_file(&journal).await?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let (dir_part, name_prefix) = match prefix.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", prefix),
        };
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            validate_key(dir_part)?;
            self.root.join(dir_part)
        };
        let _guard = self.lock.read().await;
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(DOC_SUFFIX) else {
                continue;
            };
            if stem.starts_with('.') || !stem.starts_with(name_prefix) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let key = if dir_part.is_empty() {
                stem.to_string()
            } else {
                format!("{dir_part}/{stem}")
            };
            out.push((key, fs::read(entry.path()).await?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
