//! In-memory index used to diff a directory tree against a previous
//! backup. The walk phase adds every entry; the diff phase checks entries
//! streamed from the previous archive against the index and marks the
//! ones that need no fresh copy; the copy phase enumerates whatever is
//! still live. Clones share the underlying store so suboperations see
//! their parent's index.

use crate::err::{Error, Result};
use crate::fs::{FsInfo, ObjectType};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Outcome of checking one entry against the index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BackTreeResult {
    /// Present with the same date stamp.
    Same,
    /// The checked entry is newer than the indexed one, or holds data
    /// the index has never seen.
    Newer,
    /// Present, but the checked entry is older than the indexed one.
    Older,
    /// Already consumed.
    Missing,
}

struct Node {
    info: FsInfo,
    live: bool,
}

struct Store {
    // Keyed by name for the check/ignore lookups; BTreeMap keeps
    // enumeration deterministic.
    nodes: BTreeMap<String, Node>,
}

/// A shared handle onto a backup index.
#[derive(Clone)]
pub struct BackTree {
    store: Rc<RefCell<Store>>,
}

impl std::fmt::Debug for BackTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BackTree")
    }
}

fn entry_date(info: &FsInfo) -> u64 {
    info.date().map(|d| d.as_cs()).unwrap_or(0)
}

impl BackTree {
    pub fn create() -> BackTree {
        BackTree {
            store: Rc::new(RefCell::new(Store {
                nodes: BTreeMap::new(),
            })),
        }
    }

    /// Another handle onto the same index.
    pub fn clone_handle(&self) -> BackTree {
        self.clone()
    }

    /// Number of live file entries and their total size. Directories
    /// count as entries of size zero.
    pub fn count(&self) -> (u32, u32) {
        let store = self.store.borrow();
        let mut files = 0u32;
        let mut size = 0u32;
        for node in store.nodes.values().filter(|n| n.live) {
            files += 1;
            if node.info.obj_type != ObjectType::Dir {
                size = size.saturating_add(node.info.size);
            }
        }
        (files, size)
    }

    /// Record an entry seen in the directory walk.
    pub fn add(&self, info: &FsInfo) -> Result<()> {
        if info.name.is_empty() {
            return Err(Error::BadParms);
        }
        self.store.borrow_mut().nodes.insert(
            info.name.clone(),
            Node {
                info: info.clone(),
                live: true,
            },
        );
        Ok(())
    }

    /// Compare an entry from the previous backup against the index. An
    /// entry the index has never seen holds data the live tree cannot
    /// reproduce, so it reads as newer than anything indexed; an entry
    /// that has been consumed reads as missing.
    pub fn check(&self, info: &FsInfo) -> BackTreeResult {
        let store = self.store.borrow();
        match store.nodes.get(&info.name) {
            Some(node) if node.live => {
                let indexed = entry_date(&node.info);
                let checked = entry_date(info);
                if checked == indexed {
                    BackTreeResult::Same
                } else if indexed < checked {
                    BackTreeResult::Newer
                } else {
                    BackTreeResult::Older
                }
            }
            Some(_) => BackTreeResult::Missing,
            None => BackTreeResult::Newer,
        }
    }

    /// Mark an entry as needing no fresh copy. Unknown entries are
    /// recorded as consumed so a later check reports them missing.
    pub fn ignore(&self, info: &FsInfo) -> Result<()> {
        let mut store = self.store.borrow_mut();
        match store.nodes.get_mut(&info.name) {
            Some(node) => node.live = false,
            None => {
                store.nodes.insert(
                    info.name.clone(),
                    Node {
                        info: info.clone(),
                        live: false,
                    },
                );
            }
        }
        Ok(())
    }

    /// The next live entry, or `None` when every entry has been consumed.
    pub fn enumerate(&self) -> Option<FsInfo> {
        self.store
            .borrow()
            .nodes
            .values()
            .find(|n| n.live)
            .map(|n| n.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{DateStamp, FileAttr};

    fn info(name: &str, date_cs: u64, size: u32) -> FsInfo {
        let stamp = DateStamp::from_cs(date_cs);
        FsInfo {
            name: name.to_string(),
            load_addr: 0xfffffd00 | stamp.high,
            exec_addr: stamp.low,
            size,
            attr: FileAttr::OWNER_READ,
            obj_type: ObjectType::File,
        }
    }

    #[test]
    fn add_then_check_is_same() {
        let tree = BackTree::create();
        let a = info("a", 100, 10);
        tree.add(&a).unwrap();
        assert_eq!(tree.check(&a), BackTreeResult::Same);
    }

    #[test]
    fn ignore_makes_an_entry_missing() {
        let tree = BackTree::create();
        let a = info("a", 100, 10);
        tree.add(&a).unwrap();
        tree.ignore(&a).unwrap();
        assert_eq!(tree.check(&a), BackTreeResult::Missing);
        assert_eq!(tree.enumerate(), None);
    }

    #[test]
    fn newer_and_older_compare_dates() {
        let tree = BackTree::create();
        tree.add(&info("a", 100, 10)).unwrap();
        assert_eq!(tree.check(&info("a", 200, 10)), BackTreeResult::Newer);
        assert_eq!(tree.check(&info("a", 50, 10)), BackTreeResult::Older);
    }

    #[test]
    fn unknown_entries_read_as_newer_until_ignored() {
        let tree = BackTree::create();
        assert_eq!(tree.check(&info("b", 100, 10)), BackTreeResult::Newer);
        tree.ignore(&info("b", 100, 10)).unwrap();
        assert_eq!(tree.check(&info("b", 100, 10)), BackTreeResult::Missing);
        // Tombstones never surface through enumeration.
        assert_eq!(tree.enumerate(), None);
        assert_eq!(tree.count(), (0, 0));
    }

    #[test]
    fn clones_share_the_store() {
        let tree = BackTree::create();
        let clone = tree.clone_handle();
        clone.add(&info("a", 100, 10)).unwrap();
        assert_eq!(tree.check(&info("a", 100, 10)), BackTreeResult::Same);
        assert_eq!(tree.count(), (1, 10));
    }

    #[test]
    fn count_skips_consumed_entries_and_directories() {
        let tree = BackTree::create();
        tree.add(&info("a", 1, 10)).unwrap();
        tree.add(&info("b", 1, 20)).unwrap();
        let dir = FsInfo {
            name: "d".to_string(),
            obj_type: ObjectType::Dir,
            size: 999,
            ..FsInfo::default()
        };
        tree.add(&dir).unwrap();
        assert_eq!(tree.count(), (3, 30));
        tree.ignore(&info("a", 1, 10)).unwrap();
        assert_eq!(tree.count(), (2, 20));
    }
}
