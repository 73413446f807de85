//! Seam to the tar archiver used by backups. Handles are opaque; the
//! operation engine only orchestrates which entry of which archive moves
//! where, and paces long copies through repeated `continue_work` slices.
//! Parsing and producing the archive bytes is the archiver's business.

use crate::err::Result;
use crate::fs::FsInfo;

/// Handle for an open tar stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TarHandle(pub u32);

/// Progress of pending archive work, in abstract units.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TarPosition {
    pub done: u32,
    pub remain: u32,
    pub step: u32,
}

pub trait TarService {
    /// Open an existing archive for reading.
    fn open_in(&mut self, path: &str) -> Result<TarHandle>;

    /// Open an archive for writing, optionally appending to an existing
    /// one.
    fn open_out(&mut self, path: &str, append: bool) -> Result<TarHandle>;

    /// Details of the current entry of an input archive, or `None` at the
    /// end of the archive.
    fn info(&mut self, handle: TarHandle) -> Result<Option<FsInfo>>;

    /// Schedule copying the current entry of `src` to `dest` and advance
    /// `src` past it. The copy itself is completed by `continue_work`.
    fn copy(&mut self, src: TarHandle, dest: TarHandle) -> Result<()>;

    /// Skip the current entry of an input archive.
    fn skip(&mut self, handle: TarHandle) -> Result<()>;

    /// Schedule adding the file at `src_path` to `dest` under
    /// `entry_name`.
    fn add(&mut self, src_path: &str, entry_name: &str, dest: TarHandle) -> Result<()>;

    /// Reading position within an input archive, in progress units.
    fn position(&mut self, handle: TarHandle) -> Result<TarPosition>;

    /// Perform a bounded slice of the pending work on the stream and
    /// report what remains.
    fn continue_work(&mut self, handle: TarHandle) -> Result<TarPosition>;

    /// Duplicate a handle onto the same underlying stream. A clone is
    /// closed independently of its source.
    fn clone_handle(&mut self, handle: TarHandle) -> Result<TarHandle>;

    /// Close a handle. The underlying stream is finished when its last
    /// handle closes.
    fn close(&mut self, handle: TarHandle) -> Result<()>;
}

// Shared-ownership forwarding, as for the other service seams.
impl<T: TarService> TarService for std::rc::Rc<std::cell::RefCell<T>> {
    fn open_in(&mut self, path: &str) -> Result<TarHandle> {
        self.borrow_mut().open_in(path)
    }

    fn open_out(&mut self, path: &str, append: bool) -> Result<TarHandle> {
        self.borrow_mut().open_out(path, append)
    }

    fn info(&mut self, handle: TarHandle) -> Result<Option<FsInfo>> {
        self.borrow_mut().info(handle)
    }

    fn copy(&mut self, src: TarHandle, dest: TarHandle) -> Result<()> {
        self.borrow_mut().copy(src, dest)
    }

    fn skip(&mut self, handle: TarHandle) -> Result<()> {
        self.borrow_mut().skip(handle)
    }

    fn add(&mut self, src_path: &str, entry_name: &str, dest: TarHandle) -> Result<()> {
        self.borrow_mut().add(src_path, entry_name, dest)
    }

    fn position(&mut self, handle: TarHandle) -> Result<TarPosition> {
        self.borrow_mut().position(handle)
    }

    fn continue_work(&mut self, handle: TarHandle) -> Result<TarPosition> {
        self.borrow_mut().continue_work(handle)
    }

    fn clone_handle(&mut self, handle: TarHandle) -> Result<TarHandle> {
        self.borrow_mut().clone_handle(handle)
    }

    fn close(&mut self, handle: TarHandle) -> Result<()> {
        self.borrow_mut().close(handle)
    }
}
