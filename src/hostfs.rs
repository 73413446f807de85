//! Host-side filesystem seam for the operation engine: the local halves
//! of file transfers, the shutdown/restart log files, and the catalogue
//! writes applied once a transfer completes. Behind a trait so the
//! engine can be driven against an in-memory filesystem in tests.

use crate::err::{Error, Result};
use crate::fs::{DateStamp, FileAttr, FsInfo, ObjectType};
use crate::uid;
use log::debug;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Handle for an open host file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HostHandle(pub u32);

pub trait HostFs {
    /// Catalogue details for a path. A missing object reports
    /// `ObjectType::NotFound` rather than an error.
    fn info(&mut self, path: &str) -> Result<FsInfo>;

    /// Delete an object, forcing past any lock. Missing objects and
    /// failures are ignored; wipes are used to discard partial output.
    fn wipe(&mut self, path: &str);

    fn create_dir(&mut self, path: &str) -> Result<()>;

    fn open_in(&mut self, path: &str) -> Result<HostHandle>;
    fn open_out(&mut self, path: &str) -> Result<HostHandle>;

    /// Open a task log for writing, appending when requested.
    fn open_log(&mut self, path: &str, append: bool) -> Result<HostHandle>;

    /// Read exactly `length` bytes. A short read is an end-of-file error.
    fn read(&mut self, handle: HostHandle, length: usize) -> Result<Vec<u8>>;

    fn write(&mut self, handle: HostHandle, data: &[u8]) -> Result<()>;

    fn close(&mut self, handle: HostHandle) -> Result<()>;

    /// Apply load and execution addresses to a written object.
    fn set_stamp(&mut self, path: &str, load: u32, exec: u32) -> Result<()>;

    /// Apply attributes to a written object.
    fn set_attr(&mut self, path: &str, attr: FileAttr) -> Result<()>;

    /// Whole contents of a file (the restart log).
    fn read_all(&mut self, path: &str) -> Result<Vec<u8>>;
}

/// `std::fs`-backed host filesystem. Load and execution addresses have no
/// native representation on the host, so applied stamps are remembered
/// for the life of the process and merged into catalogue reads;
/// attributes map onto the read-only permission bit.
pub struct StdHostFs {
    next: u32,
    open: HashMap<HostHandle, File>,
    stamps: HashMap<String, (u32, u32)>,
}

impl StdHostFs {
    pub fn new() -> StdHostFs {
        StdHostFs {
            next: 0,
            open: HashMap::new(),
            stamps: HashMap::new(),
        }
    }

    fn insert(&mut self, file: File) -> HostHandle {
        self.next += 1;
        let handle = HostHandle(self.next);
        self.open.insert(handle, file);
        handle
    }

    fn file(&mut self, handle: HostHandle) -> Result<&mut File> {
        self.open.get_mut(&handle).ok_or(Error::BadParms)
    }
}

impl Default for StdHostFs {
    fn default() -> StdHostFs {
        StdHostFs::new()
    }
}

fn mtime_stamp(meta: &std::fs::Metadata) -> DateStamp {
    let secs = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    DateStamp::from_sibo(secs as u32)
}

impl HostFs for StdHostFs {
    fn info(&mut self, path: &str) -> Result<FsInfo> {
        let meta = match std::fs::metadata(Path::new(path)) {
            Ok(meta) => meta,
            Err(_) => {
                return Ok(FsInfo {
                    name: path.to_string(),
                    obj_type: ObjectType::NotFound,
                    ..FsInfo::default()
                })
            }
        };
        let (load, exec) = match self.stamps.get(path) {
            Some(&(load, exec)) => (load, exec),
            None => {
                let date = mtime_stamp(&meta);
                (
                    0xfff0_0000 | (uid::TYPE_DATA << 8) | (date.high & 0xff),
                    date.low,
                )
            }
        };
        let mut attr = FileAttr::OWNER_READ | FileAttr::PUBLIC_READ;
        if meta.permissions().readonly() {
            attr |= FileAttr::LOCKED;
        } else {
            attr |= FileAttr::OWNER_WRITE | FileAttr::PUBLIC_WRITE;
        }
        Ok(FsInfo {
            name: path.to_string(),
            load_addr: load,
            exec_addr: exec,
            size: meta.len() as u32,
            attr,
            obj_type: if meta.is_dir() {
                ObjectType::Dir
            } else {
                ObjectType::File
            },
        })
    }

    fn wipe(&mut self, path: &str) {
        self.stamps.remove(path);
        let p = Path::new(path);
        let result = if p.is_dir() {
            std::fs::remove_dir_all(p)
        } else {
            std::fs::remove_file(p)
        };
        if let Err(err) = result {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!("wipe '{}' failed: {}", path, err);
            }
        }
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        std::fs::create_dir_all(Path::new(path))?;
        Ok(())
    }

    fn open_in(&mut self, path: &str) -> Result<HostHandle> {
        let file = File::open(Path::new(path))?;
        Ok(self.insert(file))
    }

    fn open_out(&mut self, path: &str) -> Result<HostHandle> {
        let file = File::create(Path::new(path))?;
        Ok(self.insert(file))
    }

    fn open_log(&mut self, path: &str, append: bool) -> Result<HostHandle> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(Path::new(path))?;
        Ok(self.insert(file))
    }

    fn read(&mut self, handle: HostHandle, length: usize) -> Result<Vec<u8>> {
        let file = self.file(handle)?;
        let mut buf = vec![0u8; length];
        file.read_exact(&mut buf).map_err(|_| Error::Eof)?;
        Ok(buf)
    }

    fn write(&mut self, handle: HostHandle, data: &[u8]) -> Result<()> {
        let file = self.file(handle)?;
        file.write_all(data)?;
        Ok(())
    }

    fn close(&mut self, handle: HostHandle) -> Result<()> {
        self.open.remove(&handle).ok_or(Error::BadParms)?;
        Ok(())
    }

    fn set_stamp(&mut self, path: &str, load: u32, exec: u32) -> Result<()> {
        self.stamps.insert(path.to_string(), (load, exec));
        Ok(())
    }

    fn set_attr(&mut self, path: &str, attr: FileAttr) -> Result<()> {
        let meta = std::fs::metadata(Path::new(path))?;
        let mut perms = meta.permissions();
        perms.set_readonly(!attr.contains(FileAttr::OWNER_WRITE));
        std::fs::set_permissions(Path::new(path), perms)?;
        Ok(())
    }

    fn read_all(&mut self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(Path::new(path))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> String {
        let mut p = std::env::temp_dir();
        p.push(format!("psifs-hostfs-{}-{}", std::process::id(), name));
        p.to_string_lossy().into_owned()
    }

    #[test]
    fn round_trip_write_read() {
        let mut fs = StdHostFs::new();
        let path = temp_path("rw");
        let h = fs.open_out(&path).unwrap();
        fs.write(h, b"Hello").unwrap();
        fs.close(h).unwrap();

        let info = fs.info(&path).unwrap();
        assert_eq!(info.obj_type, ObjectType::File);
        assert_eq!(info.size, 5);

        let h = fs.open_in(&path).unwrap();
        assert_eq!(fs.read(h, 5).unwrap(), b"Hello".to_vec());
        assert_eq!(fs.read(h, 1), Err(Error::Eof));
        fs.close(h).unwrap();
        fs.wipe(&path);
        assert_eq!(fs.info(&path).unwrap().obj_type, ObjectType::NotFound);
    }

    #[test]
    fn stamps_are_remembered() {
        let mut fs = StdHostFs::new();
        let path = temp_path("stamp");
        let h = fs.open_out(&path).unwrap();
        fs.close(h).unwrap();
        fs.set_stamp(&path, 0xfff15800, 0x1234).unwrap();
        let info = fs.info(&path).unwrap();
        assert_eq!(info.load_addr, 0xfff15800);
        assert_eq!(info.exec_addr, 0x1234);
        fs.wipe(&path);
    }

    #[test]
    fn log_append_accumulates() {
        let mut fs = StdHostFs::new();
        let path = temp_path("log");
        let h = fs.open_log(&path, false).unwrap();
        fs.write(h, b"one\n").unwrap();
        fs.close(h).unwrap();
        let h = fs.open_log(&path, true).unwrap();
        fs.write(h, b"two\n").unwrap();
        fs.close(h).unwrap();
        assert_eq!(fs.read_all(&path).unwrap(), b"one\ntwo\n".to_vec());
        fs.wipe(&path);
    }
}

// Shared-ownership forwarding, as for the other service seams.
impl<T: HostFs> HostFs for std::rc::Rc<std::cell::RefCell<T>> {
    fn info(&mut self, path: &str) -> Result<FsInfo> {
        self.borrow_mut().info(path)
    }

    fn wipe(&mut self, path: &str) {
        self.borrow_mut().wipe(path)
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        self.borrow_mut().create_dir(path)
    }

    fn open_in(&mut self, path: &str) -> Result<HostHandle> {
        self.borrow_mut().open_in(path)
    }

    fn open_out(&mut self, path: &str) -> Result<HostHandle> {
        self.borrow_mut().open_out(path)
    }

    fn open_log(&mut self, path: &str, append: bool) -> Result<HostHandle> {
        self.borrow_mut().open_log(path, append)
    }

    fn read(&mut self, handle: HostHandle, length: usize) -> Result<Vec<u8>> {
        self.borrow_mut().read(handle, length)
    }

    fn write(&mut self, handle: HostHandle, data: &[u8]) -> Result<()> {
        self.borrow_mut().write(handle, data)
    }

    fn close(&mut self, handle: HostHandle) -> Result<()> {
        self.borrow_mut().close(handle)
    }

    fn set_stamp(&mut self, path: &str, load: u32, exec: u32) -> Result<()> {
        self.borrow_mut().set_stamp(path, load, exec)
    }

    fn set_attr(&mut self, path: &str, attr: FileAttr) -> Result<()> {
        self.borrow_mut().set_attr(path, attr)
    }

    fn read_all(&mut self, path: &str) -> Result<Vec<u8>> {
        self.borrow_mut().read_all(path)
    }
}
