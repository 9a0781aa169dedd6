//! Durable key-value storage
//!
//! Every committed write lands here before the client sees a success
//! reply. Keys are stored by their 128-bit ring digest so replication
//! and hand-off can move entries without rehashing.

use crate::common::proto::{escape_value, unescape_value};
use crate::common::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Backing store behind the cache.
pub trait DurableStore: Send {
    /// Look up a value by hashed key.
    fn get(&self, hash: u128) -> Option<String>;

    /// Insert or overwrite. Returns `true` when the key already existed.
    fn put(&mut self, hash: u128, value: String) -> Result<bool>;

    /// Remove a key. Returns `true` when the key was present.
    fn delete(&mut self, hash: u128) -> Result<bool>;

    fn contains(&self, hash: u128) -> bool;

    /// All stored entries, ordered by digest.
    fn entries(&self) -> Vec<(u128, String)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// File-backed store: one `digest\tvalue` line per entry, values escaped
/// so the framing survives embedded newlines. The whole file is rewritten
/// through a temp file on every mutation, which is plenty for the data
/// sizes a single node holds and keeps recovery trivial.
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<u128, String>,
}

impl FileStore {
    /// Open (or create) the store file inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("store.tsv");
        let mut entries = BTreeMap::new();
        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            for (lineno, line) in contents.lines().enumerate() {
                if line.is_empty() {
                    continue;
                }
                let (hash, value) = line.split_once('\t').ok_or_else(|| {
                    Error::Internal(format!(
                        "{}:{}: malformed store entry",
                        path.display(),
                        lineno + 1
                    ))
                })?;
                let hash = u128::from_str_radix(hash, 16).map_err(|_| {
                    Error::Internal(format!(
                        "{}:{}: malformed key digest",
                        path.display(),
                        lineno + 1
                    ))
                })?;
                entries.insert(hash, unescape_value(value));
            }
        }
        Ok(Self { path, entries })
    }

    fn persist(&self) -> Result<()> {
        let tmp = self.path.with_extension("tsv.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for (hash, value) in &self.entries {
                writeln!(file, "{:032x}\t{}", hash, escape_value(value))?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn get(&self, hash: u128) -> Option<String> {
        self.entries.get(&hash).cloned()
    }

    fn put(&mut self, hash: u128, value: String) -> Result<bool> {
        let existed = self.entries.insert(hash, value).is_some();
        self.persist()?;
        Ok(existed)
    }

    fn delete(&mut self, hash: u128) -> Result<bool> {
        let existed = self.entries.remove(&hash).is_some();
        if existed {
            self.persist()?;
        }
        Ok(existed)
    }

    fn contains(&self, hash: u128) -> bool {
        self.entries.contains_key(&hash)
    }

    fn entries(&self) -> Vec<(u128, String)> {
        self.entries
            .iter()
            .map(|(h, v)| (*h, v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemStore {
    entries: BTreeMap<u128, String>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemStore {
    fn get(&self, hash: u128) -> Option<String> {
        self.entries.get(&hash).cloned()
    }

    fn put(&mut self, hash: u128, value: String) -> Result<bool> {
        Ok(self.entries.insert(hash, value).is_some())
    }

    fn delete(&mut self, hash: u128) -> Result<bool> {
        Ok(self.entries.remove(&hash).is_some())
    }

    fn contains(&self, hash: u128) -> bool {
        self.entries.contains_key(&hash)
    }

    fn entries(&self) -> Vec<(u128, String)> {
        self.entries
            .iter()
            .map(|(h, v)| (*h, v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        assert!(!store.put(1, "one".into()).unwrap());
        assert!(store.put(1, "uno".into()).unwrap());
        assert_eq!(store.get(1), Some("uno".into()));

        assert!(store.delete(1).unwrap());
        assert!(!store.delete(1).unwrap());
        assert_eq!(store.get(1), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.put(7, "seven".into()).unwrap();
            store.put(42, "line one\nline two".into()).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(7), Some("seven".into()));
        assert_eq!(store.get(42), Some("line one\nline two".into()));
    }

    #[test]
    fn test_entries_ordered_by_digest() {
        let mut store = MemStore::new();
        store.put(30, "c".into()).unwrap();
        store.put(10, "a".into()).unwrap();
        store.put(20, "b".into()).unwrap();
        let digests: Vec<u128> = store.entries().iter().map(|(h, _)| *h).collect();
        assert_eq!(digests, vec![10, 20, 30]);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("store.tsv"), "not a store line\n").unwrap();
        assert!(FileStore::open(dir.path()).is_err());
    }
}
