//! Named blob persistence used for resolver statistics and other small
//! pieces of state that should survive a session.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};

pub trait KeyValueStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Vec<u8>>;
    fn set(&self, name: &str, value: &[u8]) -> Result<()>;
}

/// In-memory store; the default when the host application does not supply
/// its own.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    inner: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, name: &str) -> Result<Vec<u8>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("kvstore lock poisoned"))?;
        guard
            .get(name)
            .cloned()
            .with_context(|| format!("no such key: {name}"))
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("kvstore lock poisoned"))?;
        guard.insert(name.to_string(), value.to_vec());
        Ok(())
    }
}

/// Directory-backed store, one file per key. Writes go through a temporary
/// file renamed into place so a crash never leaves a half-written blob.
#[derive(Debug)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create kvstore dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name);
        fs::read(&path).with_context(|| format!("read {}", path.display()))
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryKvStore::new();
        assert!(store.get("missing").is_err());
        store.set("state", b"hello").unwrap();
        assert_eq!(store.get("state").unwrap(), b"hello");
        store.set("state", b"world").unwrap();
        assert_eq!(store.get("state").unwrap(), b"world");
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path()).unwrap();
        assert!(store.get("missing").is_err());
        store.set("resolver.state", b"{}").unwrap();
        assert_eq!(store.get("resolver.state").unwrap(), b"{}");
        // The temporary file must not linger after the rename.
        assert!(!dir.path().join("resolver.state.tmp").exists());
    }
}
