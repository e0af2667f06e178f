//! Durable key-value storage for the queue, drafts and cached region options.
//!
//! Components receive an `Arc<dyn KeyValueStore>` so the medium can be
//! swapped (memory, a directory on disk, platform secure storage) without
//! touching them.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::prelude::*;

use crate::config::RegionLevel;
use crate::error::*;

/// The single key holding every pending delta event.
pub const QUEUE_KEY: &str = "queue:delta-events";

pub fn draft_key(record_key: &str) -> String {
    format!("draft:{}", record_key)
}

pub fn options_key(cycle: &str, level: RegionLevel, parent_code: Option<&str>) -> String {
    format!(
        "options:{}:{}:{}",
        cycle,
        level.as_str(),
        parent_code.unwrap_or("root")
    )
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    /// Overwrites any previous value.
    fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> SyncResult<()>;
}

pub fn read_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> SyncResult<Option<T>> {
    match store.get(key)? {
        Some(raw) => {
            let value = serde_json::from_str(&raw).context(StorageFormatSnafu { key })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub fn write_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> SyncResult<()> {
    let raw = serde_json::to_string(value).context(StorageFormatSnafu { key })?;
    store.set(key, &raw)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn shared() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::default())
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.values
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// One file per key inside a directory.
///
/// Writes land in a temporary file first and are then renamed over the
/// target, so a reader never sees a partially written value.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> SyncResult<FileStore> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context(StorageIoSnafu {
            key: root.display().to_string(),
        })?;
        debug!("FileStore::open: using {:?}", root);
        Ok(FileStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", escape_key(key)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(StorageIoSnafu { key }),
        }
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        let target = self.path_for(key);
        let tmp = target.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).context(StorageIoSnafu { key })?;
        file.write_all(value.as_bytes())
            .context(StorageIoSnafu { key })?;
        // On disk before the rename, or a crash can leave an empty target.
        file.sync_all().context(StorageIoSnafu { key })?;
        drop(file);
        fs::rename(&tmp, &target).context(StorageIoSnafu { key })
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(StorageIoSnafu { key }),
        }
    }
}

// Alphanumerics and '-' are kept, every other byte becomes `_xx`, so two
// distinct keys never share a file name.
fn escape_key(key: &str) -> String {
    let mut res = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            res.push(b as char);
        } else {
            res.push_str(&format!("_{:02x}", b));
        }
    }
    res
}
