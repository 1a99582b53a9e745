//! Local key/value persistence for dashboards.
//!
//! Storage is synchronous: every local edit is written before the edit call
//! returns. Failures are reported as `QuotaExceeded` or `Security` and leave
//! the caller's in-memory state alone.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Synchronous string storage addressed by simple keys.
pub trait LocalStorage: Send + Sync {
    fn read(&self, key: &str) -> SyncResult<Option<String>>;

    fn write(&self, key: &str, value: &str) -> SyncResult<()>;

    /// Remove a key. Missing keys are not an error.
    fn remove(&self, key: &str) -> SyncResult<()>;
}

/// Keys map to file names, so only a safe character set is accepted.
fn check_key(key: &str) -> SyncResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::Security(format!("illegal storage key '{key}'")))
    }
}

/// One JSON file per key inside a directory.
pub struct FileStorage {
    dir: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    pub fn open(dir: impl AsRef<Path>, quota_bytes: Option<u64>) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| map_io(e, &dir))?;
        debug!(dir = %dir.display(), ?quota_bytes, "Opened local dashboard storage");
        Ok(Self { dir, quota_bytes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Bytes used by all stored files except `exclude`.
    fn usage_excluding(&self, exclude: &Path) -> SyncResult<u64> {
        let mut total = 0;
        for entry in fs::read_dir(&self.dir).map_err(|e| map_io(e, &self.dir))? {
            let entry = entry?;
            let path = entry.path();
            if path == exclude || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            total += entry.metadata()?.len();
        }
        Ok(total)
    }
}

impl LocalStorage for FileStorage {
    fn read(&self, key: &str) -> SyncResult<Option<String>> {
        check_key(key)?;
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io(e, &path)),
        }
    }

    fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        check_key(key)?;
        let path = self.path_for(key);

        if let Some(quota) = self.quota_bytes {
            let used = self.usage_excluding(&path)?;
            let needed = used + value.len() as u64;
            if needed > quota {
                warn!(key, used, needed, quota, "Local storage quota exceeded");
                return Err(SyncError::QuotaExceeded(format!(
                    "writing '{key}' needs {needed} bytes, quota is {quota}"
                )));
            }
        }

        // Write-then-rename so a failed write never leaves a truncated file.
        let tmp = self.dir.join(format!(".{key}.tmp"));
        let result = fs::File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(value.as_bytes())?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(map_io(e, &path));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        check_key(key)?;
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e, &path)),
        }
    }
}

fn map_io(e: std::io::Error, path: &Path) -> SyncError {
    match e.kind() {
        ErrorKind::PermissionDenied => SyncError::Security(format!("{}: {e}", path.display())),
        _ => SyncError::Io(e),
    }
}

/// In-process storage with an optional byte quota and a read-only switch.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<u64>,
    read_only: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Reject every write and remove with `Security`.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn used_bytes(&self) -> u64 {
        self.entries
            .lock()
            .values()
            .map(|v| v.len() as u64)
            .sum()
    }

    fn check_writable(&self) -> SyncResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            Err(SyncError::Security("storage is read-only".to_string()))
        } else {
            Ok(())
        }
    }
}

impl LocalStorage for MemoryStorage {
    fn read(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        self.check_writable()?;
        let mut entries = self.entries.lock();
        if let Some(quota) = self.quota_bytes {
            let used: u64 = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            if used + value.len() as u64 > quota {
                return Err(SyncError::QuotaExceeded(format!(
                    "writing '{key}' exceeds quota of {quota} bytes"
                )));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.check_writable()?;
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path(), None).unwrap();
        assert_eq!(storage.read("index").unwrap(), None);
        storage.write("index", "[1,2]").unwrap();
        assert_eq!(storage.read("index").unwrap().as_deref(), Some("[1,2]"));
        storage.remove("index").unwrap();
        storage.remove("index").unwrap();
        assert_eq!(storage.read("index").unwrap(), None);
    }

    #[test]
    fn test_file_storage_quota() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path(), Some(16)).unwrap();
        storage.write("a", "0123456789").unwrap();
        // Rewriting the same key only counts the new size.
        storage.write("a", "0123456789abcdef").unwrap();
        assert!(matches!(
            storage.write("b", "x"),
            Err(SyncError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn test_file_storage_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path(), None).unwrap();
        assert!(matches!(
            storage.write("../escape", "x"),
            Err(SyncError::Security(_))
        ));
        assert!(matches!(storage.read(".hidden"), Err(SyncError::Security(_))));
    }

    #[test]
    fn test_memory_storage_quota_and_read_only() {
        let storage = MemoryStorage::with_quota(8);
        storage.write("k", "1234").unwrap();
        assert!(matches!(
            storage.write("j", "12345"),
            Err(SyncError::QuotaExceeded(_))
        ));
        storage.set_read_only(true);
        assert!(matches!(storage.write("k", "1"), Err(SyncError::Security(_))));
        assert_eq!(storage.read("k").unwrap().as_deref(), Some("1234"));
        assert_eq!(storage.used_bytes(), 4);
    }
}
