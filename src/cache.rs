//! Seam to the filing-system cache layer. The operation engine drives
//! remote transfers through the cache rather than the raw dispatcher so
//! that open files and recently read catalogue entries stay coherent with
//! the filer's view. The cache itself lives with the filing-system entry
//! points; only its command surface is needed here.

use crate::err::{Error, Result};
use crate::fs::{DateStamp, FileAttr, FsInfo, OpenMode, RemoteHandle};

/// Commands accepted by the cache layer.
#[derive(Clone, Debug)]
pub enum CacheCmd {
    /// Read the catalogue entry for a path.
    Info { path: String },
    /// Enumerate a directory. At most `size` entries fit the caller's
    /// buffer; `offset` resumes a previous enumeration.
    Enumerate {
        path: String,
        pattern: String,
        offset: usize,
        size: usize,
    },
    Open {
        path: String,
        mode: OpenMode,
    },
    Close {
        handle: RemoteHandle,
    },
    Read {
        handle: RemoteHandle,
        offset: u32,
        length: usize,
    },
    Write {
        handle: RemoteHandle,
        offset: u32,
        data: Vec<u8>,
    },
    Extent {
        handle: RemoteHandle,
        size: u32,
    },
    Access {
        path: String,
        attr: FileAttr,
    },
    MkDir {
        path: String,
    },
    Remove {
        path: String,
    },
    Stamp {
        path: String,
        load: u32,
        exec: u32,
    },
}

/// Discriminant of a cache command, kept by operations to interpret the
/// matching reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CacheCmdKind {
    Info,
    Enumerate,
    Open,
    Close,
    Read,
    Write,
    Extent,
    Access,
    MkDir,
    Remove,
    Stamp,
}

impl CacheCmd {
    pub fn kind(&self) -> CacheCmdKind {
        match self {
            CacheCmd::Info { .. } => CacheCmdKind::Info,
            CacheCmd::Enumerate { .. } => CacheCmdKind::Enumerate,
            CacheCmd::Open { .. } => CacheCmdKind::Open,
            CacheCmd::Close { .. } => CacheCmdKind::Close,
            CacheCmd::Read { .. } => CacheCmdKind::Read,
            CacheCmd::Write { .. } => CacheCmdKind::Write,
            CacheCmd::Extent { .. } => CacheCmdKind::Extent,
            CacheCmd::Access { .. } => CacheCmdKind::Access,
            CacheCmd::MkDir { .. } => CacheCmdKind::MkDir,
            CacheCmd::Remove { .. } => CacheCmdKind::Remove,
            CacheCmd::Stamp { .. } => CacheCmdKind::Stamp,
        }
    }
}

/// Replies from the cache layer.
#[derive(Clone, Debug)]
pub enum CacheReply {
    Done,
    Info {
        info: FsInfo,
    },
    /// Entries read, plus the offset to resume from (`None` when the
    /// enumeration is complete).
    Enumerate {
        entries: Vec<FsInfo>,
        resume: Option<usize>,
    },
    Open {
        handle: RemoteHandle,
    },
    Read {
        data: Vec<u8>,
    },
}

impl CacheReply {
    pub fn into_info(self) -> Result<FsInfo> {
        match self {
            CacheReply::Info { info } => Ok(info),
            _ => Err(Error::BadParms),
        }
    }

    pub fn into_handle(self) -> Result<RemoteHandle> {
        match self {
            CacheReply::Open { handle } => Ok(handle),
            _ => Err(Error::BadParms),
        }
    }

    pub fn into_data(self) -> Result<Vec<u8>> {
        match self {
            CacheReply::Read { data } => Ok(data),
            _ => Err(Error::BadParms),
        }
    }
}

/// The cache service seam. Submission never blocks; exactly one
/// completion is delivered per submission, drained by the engine's poll
/// loop.
pub trait CacheService {
    fn submit(&mut self, token: u64, cmd: CacheCmd) -> Result<()>;
    fn poll(&mut self) -> Option<(u64, Result<CacheReply>)>;
}

/// The date stamp a cache `Stamp` command applies for the given type and
/// date, mirroring how the dispatcher synthesises catalogue addresses.
pub fn stamp_words(date: DateStamp, file_type: u32) -> (u32, u32) {
    (
        0xfff0_0000 | (file_type << 8) | (date.high & 0xff),
        date.low,
    )
}

// Shared-ownership forwarding, as for the other service seams.
impl<T: CacheService> CacheService for std::rc::Rc<std::cell::RefCell<T>> {
    fn submit(&mut self, token: u64, cmd: CacheCmd) -> Result<()> {
        self.borrow_mut().submit(token, cmd)
    }

    fn poll(&mut self) -> Option<(u64, Result<CacheReply>)> {
        self.borrow_mut().poll()
    }
}
