//! The on-disk key/value store backing the light client's trust
//! anchor across runs.
//!
//! The format is a flat file of length-prefixed records, rewritten
//! whole on every mutation; the working set is a handful of small
//! keys, so simplicity wins over write amplification here.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use parking_lot::Mutex;

use crate::diode::error::*;

const DB_FILE: &str = "diode.db";

/// A process-wide store of small binary records.
pub struct Store {
    path: PathBuf,
    records: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl Store {
    /// Opens (or creates) the store under the given directory.
    ///
    /// A file that fails to parse is treated as absent; the caller
    /// falls back to built-in defaults for any record it misses.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).wrapped(ErrorKind::Transport)?;
        let path = dir.join(DB_FILE);
        let records = match fs::read(&path) {
            Ok(raw) => match parse_records(&raw) {
                Some(records) => records,
                None => {
                    warn!("store {} is corrupt, resetting", path.display());
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.records.lock().get(key).cloned()
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut records = self.records.lock();
        records.insert(key.to_vec(), value.to_vec());
        self.flush(&records)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut records = self.records.lock();
        if records.remove(key).is_some() {
            self.flush(&records)?;
        }
        Ok(())
    }

    fn flush(&self, records: &HashMap<Vec<u8>, Vec<u8>>) -> Result<()> {
        let mut buf = Vec::new();
        for (key, value) in records.iter() {
            buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value);
        }
        fs::write(&self.path, &buf).wrapped(ErrorKind::Transport)
    }
}

fn parse_records(raw: &[u8]) -> Option<HashMap<Vec<u8>, Vec<u8>>> {
    let mut records = HashMap::new();
    let mut pos = 0;
    while pos < raw.len() {
        let key_len = u16::from_be_bytes(raw.get(pos..pos + 2)?.try_into().ok()?) as usize;
        pos += 2;
        let key = raw.get(pos..pos + key_len)?.to_vec();
        pos += key_len;
        let value_len = u32::from_be_bytes(raw.get(pos..pos + 4)?.try_into().ok()?) as usize;
        pos += 4;
        let value = raw.get(pos..pos + value_len)?.to_vec();
        pos += value_len;
        records.insert(key, value);
    }
    Some(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scratch_dir() -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("zener-store-{}-{}", std::process::id(), n))
    }

    #[test]
    fn test_put_get_across_reopen() {
        let dir = scratch_dir();
        {
            let store = Store::open(&dir).expect("open");
            store.put(b"alpha", &[1, 2, 3]).expect("put");
            store.put(b"beta", &[]).expect("put");
        }
        let store = Store::open(&dir).expect("reopen");
        assert_eq!(store.get(b"alpha"), Some(vec![1, 2, 3]));
        assert_eq!(store.get(b"beta"), Some(vec![]));
        assert_eq!(store.get(b"gamma"), None);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = scratch_dir();
        let store = Store::open(&dir).expect("open");
        store.put(b"alpha", &[9]).expect("put");
        store.delete(b"alpha").expect("delete");
        store.delete(b"alpha").expect("second delete");
        assert_eq!(store.get(b"alpha"), None);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_file_resets() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DB_FILE), [0xff, 0xff, 0x00]).unwrap();
        let store = Store::open(&dir).expect("open");
        assert_eq!(store.get(b"anything"), None);
        fs::remove_dir_all(&dir).ok();
    }
}
