//! Host key/value storage. One integer (the last allocated asynchronous
//! operation handle) must survive process restarts so handles never
//! recycle; everything else in the crate is in-memory only.

use crate::err::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Key used for the persisted last-allocated handle.
pub const VAR_NEXT_HANDLE: &str = "PsiFS$AsyncLastHandle";

/// A string-to-integer variable store.
pub trait SysVarStore {
    fn read_int(&self, name: &str) -> Option<i64>;
    fn write_int(&mut self, name: &str, value: i64) -> Result<()>;
}

/// Volatile store, for tests and for callers that accept handle reuse
/// across restarts.
#[derive(Default)]
pub struct MemStore {
    vars: BTreeMap<String, i64>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }
}

impl SysVarStore for MemStore {
    fn read_int(&self, name: &str) -> Option<i64> {
        self.vars.get(name).copied()
    }

    fn write_int(&mut self, name: &str, value: i64) -> Result<()> {
        self.vars.insert(name.to_string(), value);
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct VarFile {
    vars: BTreeMap<String, i64>,
}

/// Store backed by a JSON file, rewritten on each update.
pub struct JsonFileStore {
    path: PathBuf,
    cached: VarFile,
}

impl JsonFileStore {
    pub fn open(path: PathBuf) -> JsonFileStore {
        let cached = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        JsonFileStore { path, cached }
    }
}

impl SysVarStore for JsonFileStore {
    fn read_int(&self, name: &str) -> Option<i64> {
        self.cached.vars.get(name).copied()
    }

    fn write_int(&mut self, name: &str, value: i64) -> Result<()> {
        self.cached.vars.insert(name.to_string(), value);
        let bytes =
            serde_json::to_vec(&self.cached).map_err(|e| Error::Host(e.to_string()))?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_round_trips() {
        let mut store = MemStore::new();
        assert_eq!(store.read_int(VAR_NEXT_HANDLE), None);
        store.write_int(VAR_NEXT_HANDLE, 42).unwrap();
        assert_eq!(store.read_int(VAR_NEXT_HANDLE), Some(42));
    }

    #[test]
    fn json_store_survives_reopen() {
        let mut path = std::env::temp_dir();
        path.push(format!("psifs-sysvar-test-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);

        {
            let mut store = JsonFileStore::open(path.clone());
            store.write_int(VAR_NEXT_HANDLE, 7).unwrap();
        }
        {
            let store = JsonFileStore::open(path.clone());
            assert_eq!(store.read_int(VAR_NEXT_HANDLE), Some(7));
        }
        let _ = fs::remove_file(&path);
    }
}

// Shared-ownership forwarding, as for the other service seams.
impl<T: SysVarStore> SysVarStore for std::rc::Rc<std::cell::RefCell<T>> {
    fn read_int(&self, name: &str) -> Option<i64> {
        self.borrow().read_int(name)
    }

    fn write_int(&mut self, name: &str, value: i64) -> Result<()> {
        self.borrow_mut().write_int(name, value)
    }
}
