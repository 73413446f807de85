//! In-memory collaborators for driving the engine without hardware: a
//! scriptable wire link, cache, archiver, host filesystem and clock.
//! Shared by the crate's unit tests, the integration scenarios, and any
//! embedder that wants to exercise call sequences.

use crate::cache::{CacheCmd, CacheCmdKind, CacheReply, CacheService};
use crate::clock::{Clock, Ticks};
use crate::err::{Error, Result};
use crate::fs::{FsInfo, ObjectType};
use crate::hostfs::{HostFs, HostHandle};
use crate::tar::{TarHandle, TarPosition, TarService};
use crate::wire::{
    MachineInfo, NcpApp, NcpCmd, NcpReply, Rfsv16Cmd, Rfsv16Reply, Rfsv32Cmd, Rfsv32Reply,
    WireLink, WireReply,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// A clock the test advances by hand.
#[derive(Clone)]
pub struct MockClock {
    now: Rc<Cell<Ticks>>,
}

impl MockClock {
    pub fn new() -> MockClock {
        MockClock {
            now: Rc::new(Cell::new(0)),
        }
    }

    pub fn advance(&self, cs: u32) {
        self.now.set(self.now.get().wrapping_add(cs));
    }

    pub fn set(&self, now: Ticks) {
        self.now.set(now);
    }

    pub fn get(&self) -> Ticks {
        self.now.get()
    }
}

impl Default for MockClock {
    fn default() -> MockClock {
        MockClock::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Ticks {
        self.now.get()
    }
}

/// One open remote file on the mock link.
struct MockRemoteFile {
    path: String,
    pos: usize,
}

/// A scriptable serial link. Submissions are answered from in-memory
/// state and queued; `poll` releases one completion at a time, so the
/// engine's pump sees the same interleaving a real link would produce.
pub struct MockLink {
    pub era: bool,
    pub sibo: bool,
    pub ncp: bool,
    pub escape: bool,
    /// Human-readable record of every wire command submitted.
    pub log: Vec<String>,

    // Remote filing state, keyed by wire-format path.
    pub files: HashMap<String, Vec<u8>>,
    pub dirs: HashMap<String, Vec<crate::wire::EraEntry>>,
    pub sibo_dirs: HashMap<String, Vec<crate::wire::SiboEntry>>,

    // Task-control state.
    pub tasks_by_drive: HashMap<u8, Vec<NcpApp>>,
    pub cmd_lines: HashMap<Vec<u8>, (Vec<u8>, Vec<u8>)>,
    /// Liveness probes remaining before a stopped task reports gone.
    pub stop_polls: HashMap<Vec<u8>, u32>,
    /// Failures remaining before an exec of the named program succeeds.
    pub exec_failures: HashMap<Vec<u8>, u32>,
    pub execs: Vec<(Vec<u8>, Vec<u8>)>,
    pub stops: Vec<Vec<u8>>,
    pub machine_type: u32,
    pub machine_info: MachineInfo,
    pub unique_id: u64,
    pub owner: Vec<u8>,

    queue: VecDeque<(u64, Result<WireReply>)>,
    open_dirs: HashMap<u32, VecDeque<crate::wire::EraEntry>>,
    open_sibo_dirs: HashMap<u32, VecDeque<crate::wire::SiboEntry>>,
    open_files: HashMap<u32, MockRemoteFile>,
    next_handle: u32,
}

impl MockLink {
    pub fn new() -> MockLink {
        MockLink {
            era: false,
            sibo: false,
            ncp: false,
            escape: false,
            log: Vec::new(),
            files: HashMap::new(),
            dirs: HashMap::new(),
            sibo_dirs: HashMap::new(),
            tasks_by_drive: HashMap::new(),
            cmd_lines: HashMap::new(),
            stop_polls: HashMap::new(),
            exec_failures: HashMap::new(),
            execs: Vec::new(),
            stops: Vec::new(),
            machine_type: crate::wire::MACHINE_TYPE_S5,
            machine_info: MachineInfo::default(),
            unique_id: 0x1122_3344_5566_7788,
            owner: b"Owner".to_vec(),
            queue: VecDeque::new(),
            open_dirs: HashMap::new(),
            open_sibo_dirs: HashMap::new(),
            open_files: HashMap::new(),
            next_handle: 0,
        }
    }

    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn push(&mut self, token: u64, result: Result<WireReply>) {
        self.queue.push_back((token, result));
    }

    fn era_reply(&mut self, cmd: &Rfsv32Cmd) -> Result<Rfsv32Reply> {
        match cmd {
            Rfsv32Cmd::OpenDir { pattern, .. } => {
                let key = pattern.trim_end_matches("\\*").to_string();
                let entries = self.dirs.get(&key).cloned().ok_or(Error::NotFound)?;
                let handle = self.handle();
                self.open_dirs.insert(handle, entries.into());
                Ok(Rfsv32Reply::OpenDir { handle })
            }
            Rfsv32Cmd::ReadDir { handle, size } => {
                let queue = self.open_dirs.get_mut(handle).ok_or(Error::BadParms)?;
                if queue.is_empty() {
                    return Err(Error::Eof);
                }
                let take = (*size).min(queue.len()).max(1);
                let batch: Vec<_> = queue.drain(..take.min(queue.len())).collect();
                Ok(Rfsv32Reply::ReadDir { entries: batch })
            }
            Rfsv32Cmd::CloseHandle { handle } => {
                self.open_dirs.remove(handle);
                self.open_files.remove(handle);
                Ok(Rfsv32Reply::Done)
            }
            Rfsv32Cmd::OpenFile { name, .. } => {
                if !self.files.contains_key(name) {
                    return Err(Error::NotFound);
                }
                let handle = self.handle();
                self.open_files.insert(
                    handle,
                    MockRemoteFile {
                        path: name.clone(),
                        pos: 0,
                    },
                );
                Ok(Rfsv32Reply::OpenFile { handle })
            }
            Rfsv32Cmd::ReplaceFile { name, .. } => {
                self.files.insert(name.clone(), Vec::new());
                let handle = self.handle();
                self.open_files.insert(
                    handle,
                    MockRemoteFile {
                        path: name.clone(),
                        pos: 0,
                    },
                );
                Ok(Rfsv32Reply::OpenFile { handle })
            }
            Rfsv32Cmd::ReadFile { handle, length } => {
                let file = self.open_files.get_mut(handle).ok_or(Error::BadParms)?;
                let content = self.files.get(&file.path).ok_or(Error::NotFound)?;
                let end = (file.pos + length).min(content.len());
                let data = content[file.pos..end].to_vec();
                file.pos = end;
                Ok(Rfsv32Reply::ReadFile { data })
            }
            Rfsv32Cmd::WriteFile { handle, data } => {
                let file = self.open_files.get_mut(handle).ok_or(Error::BadParms)?;
                let content = self.files.entry(file.path.clone()).or_default();
                content.extend_from_slice(data);
                file.pos = content.len();
                Ok(Rfsv32Reply::Done)
            }
            Rfsv32Cmd::Volume { .. } => Ok(Rfsv32Reply::Volume {
                volume: crate::wire::EraVolume {
                    name: "Internal".to_string(),
                    media_rom: false,
                    free: 1_000_000,
                    size: 2_000_000,
                },
            }),
            _ => Ok(Rfsv32Reply::Done),
        }
    }

    fn sibo_reply(&mut self, cmd: &Rfsv16Cmd) -> Result<Rfsv16Reply> {
        match cmd {
            Rfsv16Cmd::FOpen { name, mode } => {
                if mode.contains(crate::wire::SiboMode::DIRECTORY_RECORD) {
                    let key = String::from_utf8_lossy(name)
                        .trim_end_matches('\\')
                        .to_string();
                    let entries = self.sibo_dirs.get(&key).cloned().ok_or(Error::NotFound)?;
                    let handle = self.handle();
                    self.open_sibo_dirs.insert(handle, entries.into());
                    Ok(Rfsv16Reply::FOpen { handle })
                } else {
                    let path = String::from_utf8_lossy(name).to_string();
                    if !self.files.contains_key(&path) {
                        self.files.insert(path.clone(), Vec::new());
                    }
                    let handle = self.handle();
                    self.open_files
                        .insert(handle, MockRemoteFile { path, pos: 0 });
                    Ok(Rfsv16Reply::FOpen { handle })
                }
            }
            Rfsv16Cmd::FDirRead { handle, size } => {
                let queue = self.open_sibo_dirs.get_mut(handle).ok_or(Error::BadParms)?;
                if queue.is_empty() {
                    return Err(Error::Eof);
                }
                let take = (*size).min(queue.len()).max(1);
                let batch: Vec<_> = queue.drain(..take.min(queue.len())).collect();
                Ok(Rfsv16Reply::FDirRead { entries: batch })
            }
            Rfsv16Cmd::FClose { handle } => {
                self.open_sibo_dirs.remove(handle);
                self.open_files.remove(handle);
                Ok(Rfsv16Reply::Done)
            }
            Rfsv16Cmd::FRead { handle, length } => {
                let file = self.open_files.get_mut(handle).ok_or(Error::BadParms)?;
                let content = self.files.get(&file.path).ok_or(Error::NotFound)?;
                let end = (file.pos + length).min(content.len());
                let data = content[file.pos..end].to_vec();
                file.pos = end;
                Ok(Rfsv16Reply::FRead { data })
            }
            Rfsv16Cmd::FWrite { handle, data } => {
                let file = self.open_files.get_mut(handle).ok_or(Error::BadParms)?;
                let content = self.files.entry(file.path.clone()).or_default();
                content.extend_from_slice(data);
                file.pos = content.len();
                Ok(Rfsv16Reply::Done)
            }
            _ => Ok(Rfsv16Reply::Done),
        }
    }

    fn ncp_reply(&mut self, cmd: &NcpCmd) -> Result<NcpReply> {
        match cmd {
            NcpCmd::GetUniqueId { .. } => Ok(NcpReply::GetUniqueId { id: self.unique_id }),
            NcpCmd::GetMachineType => Ok(NcpReply::GetMachineType {
                machine_type: self.machine_type,
            }),
            NcpCmd::GetMachineInfo => Ok(NcpReply::GetMachineInfo {
                info: self.machine_info.clone(),
            }),
            NcpCmd::QueryDrive { drive, size } => {
                let apps = self.tasks_by_drive.get(drive).cloned().unwrap_or_default();
                if apps.len() > *size {
                    Err(Error::TooManyTasks)
                } else {
                    Ok(NcpReply::QueryDrive { apps })
                }
            }
            NcpCmd::GetCmdLine { name } => match self.cmd_lines.get(name) {
                Some((name, args)) => Ok(NcpReply::GetCmdLine {
                    name: name.clone(),
                    args: args.clone(),
                }),
                None => Err(Error::NotFound),
            },
            NcpCmd::StopProgram { name } => {
                self.stops.push(name.clone());
                Ok(NcpReply::Done)
            }
            NcpCmd::ProgRunning { name } => {
                let polls = self.stop_polls.entry(name.clone()).or_insert(0);
                if *polls > 0 {
                    *polls -= 1;
                    Ok(NcpReply::ProgRunning { running: true })
                } else {
                    Ok(NcpReply::ProgRunning { running: false })
                }
            }
            NcpCmd::ExecProgram { name, args } => {
                self.execs.push((name.clone(), args.clone()));
                match self.exec_failures.get_mut(name) {
                    Some(count) if *count > 0 => {
                        *count -= 1;
                        Err(Error::NotFound)
                    }
                    _ => Ok(NcpReply::Done),
                }
            }
            NcpCmd::SetTime { .. } => Ok(NcpReply::Done),
            NcpCmd::GetOwnerInfo => Ok(NcpReply::GetOwnerInfo {
                info: self.owner.clone(),
            }),
        }
    }
}

impl Default for MockLink {
    fn default() -> MockLink {
        MockLink::new()
    }
}

impl WireLink for MockLink {
    fn era_present(&self) -> bool {
        self.era
    }

    fn sibo_present(&self) -> bool {
        self.sibo
    }

    fn ncp_present(&self) -> bool {
        self.ncp
    }

    fn submit_era(&mut self, token: u64, cmd: Rfsv32Cmd) -> Result<()> {
        self.log.push(format!("era {:?}", cmd));
        let reply = self.era_reply(&cmd).map(WireReply::Era);
        self.push(token, reply);
        Ok(())
    }

    fn submit_sibo(&mut self, token: u64, cmd: Rfsv16Cmd) -> Result<()> {
        self.log.push(format!("sibo {:?}", cmd));
        let reply = self.sibo_reply(&cmd).map(WireReply::Sibo);
        self.push(token, reply);
        Ok(())
    }

    fn submit_ncp(&mut self, token: u64, cmd: NcpCmd) -> Result<()> {
        self.log.push(format!("ncp {:?}", cmd));
        let reply = self.ncp_reply(&cmd).map(WireReply::Ncp);
        self.push(token, reply);
        Ok(())
    }

    fn poll(&mut self) -> Option<(u64, Result<WireReply>)> {
        self.queue.pop_front()
    }

    fn escape_pending(&mut self) -> bool {
        self.escape
    }
}

/// An in-memory cache layer over a scripted remote filing tree. In the
/// default mode every submission is answered immediately; with `manual`
/// set, commands queue until `release_one` lets the next one through,
/// so a test can interleave its own calls between completions.
pub struct MockCache {
    /// Catalogue entries by path.
    pub infos: HashMap<String, FsInfo>,
    /// File contents by path.
    pub contents: HashMap<String, Vec<u8>>,
    /// Directory listings by path.
    pub listings: HashMap<String, Vec<FsInfo>>,
    /// Record of submitted command kinds.
    pub log: Vec<CacheCmdKind>,
    /// Requested read lengths, in order.
    pub read_lengths: Vec<usize>,
    /// Handles passed to close commands, in order.
    pub closed: Vec<u32>,
    /// Data written through write commands, by path.
    pub written: HashMap<String, Vec<u8>>,
    /// Fail the Nth read (1-based) with the given error.
    pub fail_read: Option<(u32, Error)>,
    /// Hold submissions until released.
    pub manual: bool,
    reads_seen: u32,
    held: VecDeque<(u64, CacheCmd)>,
    queue: VecDeque<(u64, Result<CacheReply>)>,
    open: HashMap<u32, String>,
    next_handle: u32,
}

impl MockCache {
    pub fn new() -> MockCache {
        MockCache {
            infos: HashMap::new(),
            contents: HashMap::new(),
            listings: HashMap::new(),
            log: Vec::new(),
            read_lengths: Vec::new(),
            closed: Vec::new(),
            written: HashMap::new(),
            fail_read: None,
            manual: false,
            reads_seen: 0,
            held: VecDeque::new(),
            queue: VecDeque::new(),
            open: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Answer the oldest held command. Returns false when none are held.
    pub fn release_one(&mut self) -> bool {
        match self.held.pop_front() {
            Some((token, cmd)) => {
                let reply = self.reply(&cmd);
                self.queue.push_back((token, reply));
                true
            }
            None => false,
        }
    }

    /// Script a file with the given content, catalogued with the default
    /// stamped addresses.
    pub fn add_file(&mut self, path: &str, content: &[u8]) {
        let leaf = path
            .rsplit(crate::fs::CHAR_SEPARATOR)
            .next()
            .unwrap_or(path)
            .to_string();
        self.infos.insert(
            path.to_string(),
            FsInfo {
                name: leaf,
                load_addr: 0xfffffd4f,
                exec_addr: 0x1234_5678,
                size: content.len() as u32,
                attr: crate::fs::FileAttr::OWNER_READ | crate::fs::FileAttr::OWNER_WRITE,
                obj_type: ObjectType::File,
            },
        );
        self.contents.insert(path.to_string(), content.to_vec());
    }

    fn reply(&mut self, cmd: &CacheCmd) -> Result<CacheReply> {
        match cmd {
            CacheCmd::Info { path } => Ok(CacheReply::Info {
                info: self.infos.get(path).cloned().unwrap_or_else(|| FsInfo {
                    name: path.clone(),
                    obj_type: ObjectType::NotFound,
                    ..FsInfo::default()
                }),
            }),
            CacheCmd::Enumerate { path, size, .. } => {
                let all = self.listings.get(path).cloned().ok_or(Error::NotFound)?;
                if all.len() > *size {
                    Ok(CacheReply::Enumerate {
                        entries: Vec::new(),
                        resume: Some(all.len()),
                    })
                } else {
                    Ok(CacheReply::Enumerate {
                        entries: all,
                        resume: None,
                    })
                }
            }
            CacheCmd::Open { path, .. } => {
                self.next_handle += 1;
                self.open.insert(self.next_handle, path.clone());
                self.contents.entry(path.clone()).or_default();
                Ok(CacheReply::Open {
                    handle: crate::fs::RemoteHandle(self.next_handle),
                })
            }
            CacheCmd::Close { handle } => {
                self.closed.push(handle.0);
                self.open.remove(&handle.0);
                Ok(CacheReply::Done)
            }
            CacheCmd::Read {
                handle,
                offset,
                length,
            } => {
                self.reads_seen += 1;
                self.read_lengths.push(*length);
                if let Some((nth, err)) = &self.fail_read {
                    if self.reads_seen == *nth {
                        return Err(err.clone());
                    }
                }
                let path = self.open.get(&handle.0).ok_or(Error::BadParms)?;
                let content = self.contents.get(path).ok_or(Error::NotFound)?;
                let start = (*offset as usize).min(content.len());
                let end = (start + length).min(content.len());
                Ok(CacheReply::Read {
                    data: content[start..end].to_vec(),
                })
            }
            CacheCmd::Write { handle, data, .. } => {
                let path = self.open.get(&handle.0).ok_or(Error::BadParms)?.clone();
                self.written.entry(path).or_default().extend_from_slice(data);
                Ok(CacheReply::Done)
            }
            CacheCmd::Extent { .. }
            | CacheCmd::Access { .. }
            | CacheCmd::MkDir { .. }
            | CacheCmd::Remove { .. }
            | CacheCmd::Stamp { .. } => Ok(CacheReply::Done),
        }
    }
}

impl Default for MockCache {
    fn default() -> MockCache {
        MockCache::new()
    }
}

impl CacheService for MockCache {
    fn submit(&mut self, token: u64, cmd: CacheCmd) -> Result<()> {
        self.log.push(cmd.kind());
        if self.manual {
            self.held.push_back((token, cmd));
        } else {
            let reply = self.reply(&cmd);
            self.queue.push_back((token, reply));
        }
        Ok(())
    }

    fn poll(&mut self) -> Option<(u64, Result<CacheReply>)> {
        self.queue.pop_front()
    }
}

enum MockStreamKind {
    Input,
    Output,
}

struct MockStream {
    path: String,
    kind: MockStreamKind,
    entries: VecDeque<FsInfo>,
    total: u32,
    pending: u32,
}

/// An in-memory archiver. Input streams are scripted entry lists; copies
/// and adds record events and leave a configurable number of work slices
/// for `continue_work`.
pub struct MockTar {
    /// Entries streamed when an archive at the given path is opened.
    pub archives: HashMap<String, Vec<FsInfo>>,
    /// Work slices pending after each copy or add.
    pub work_per_entry: u32,
    /// Event log: "open_in path", "copy src dest name", "skip name",
    /// "add src name dest", "close path".
    pub events: Vec<String>,
    streams: HashMap<u32, Rc<RefCell<MockStream>>>,
    next_handle: u32,
}

impl MockTar {
    pub fn new() -> MockTar {
        MockTar {
            archives: HashMap::new(),
            work_per_entry: 1,
            events: Vec::new(),
            streams: HashMap::new(),
            next_handle: 0,
        }
    }

    fn insert(&mut self, stream: MockStream) -> TarHandle {
        self.next_handle += 1;
        self.streams
            .insert(self.next_handle, Rc::new(RefCell::new(stream)));
        TarHandle(self.next_handle)
    }

    fn stream(&self, handle: TarHandle) -> Result<Rc<RefCell<MockStream>>> {
        self.streams.get(&handle.0).cloned().ok_or(Error::BadParms)
    }
}

impl Default for MockTar {
    fn default() -> MockTar {
        MockTar::new()
    }
}

impl TarService for MockTar {
    fn open_in(&mut self, path: &str) -> Result<TarHandle> {
        let entries = self.archives.get(path).cloned().ok_or(Error::NotFound)?;
        self.events.push(format!("open_in {}", path));
        let total = entries.len() as u32;
        Ok(self.insert(MockStream {
            path: path.to_string(),
            kind: MockStreamKind::Input,
            entries: entries.into(),
            total,
            pending: 0,
        }))
    }

    fn open_out(&mut self, path: &str, append: bool) -> Result<TarHandle> {
        self.events.push(format!("open_out {} append={}", path, append));
        Ok(self.insert(MockStream {
            path: path.to_string(),
            kind: MockStreamKind::Output,
            entries: VecDeque::new(),
            total: 0,
            pending: 0,
        }))
    }

    fn info(&mut self, handle: TarHandle) -> Result<Option<FsInfo>> {
        let stream = self.stream(handle)?;
        let stream = stream.borrow();
        match stream.kind {
            MockStreamKind::Input => Ok(stream.entries.front().cloned()),
            MockStreamKind::Output => Err(Error::BadParms),
        }
    }

    fn copy(&mut self, src: TarHandle, dest: TarHandle) -> Result<()> {
        let src_rc = self.stream(src)?;
        let dest_rc = self.stream(dest)?;
        let entry = src_rc
            .borrow_mut()
            .entries
            .pop_front()
            .ok_or(Error::Eof)?;
        // The pending work lives with the source stream: the completion
        // suboperation drives a clone of the source handle.
        src_rc.borrow_mut().pending = self.work_per_entry;
        let event = format!(
            "copy {} {} {}",
            src_rc.borrow().path,
            dest_rc.borrow().path,
            entry.name
        );
        self.events.push(event);
        Ok(())
    }

    fn skip(&mut self, handle: TarHandle) -> Result<()> {
        let stream = self.stream(handle)?;
        let entry = stream.borrow_mut().entries.pop_front().ok_or(Error::Eof)?;
        self.events.push(format!("skip {}", entry.name));
        Ok(())
    }

    fn add(&mut self, src_path: &str, entry_name: &str, dest: TarHandle) -> Result<()> {
        let stream = self.stream(dest)?;
        let mut stream = stream.borrow_mut();
        stream.pending = self.work_per_entry;
        self.events
            .push(format!("add {} {} {}", src_path, entry_name, stream.path));
        Ok(())
    }

    fn position(&mut self, handle: TarHandle) -> Result<TarPosition> {
        let stream = self.stream(handle)?;
        let stream = stream.borrow();
        let remaining = stream.entries.len() as u32;
        Ok(TarPosition {
            done: stream.total - remaining,
            remain: remaining,
            step: 1,
        })
    }

    fn continue_work(&mut self, handle: TarHandle) -> Result<TarPosition> {
        let stream = self.stream(handle)?;
        let mut stream = stream.borrow_mut();
        if stream.pending > 0 {
            stream.pending -= 1;
        }
        Ok(TarPosition {
            done: self.work_per_entry - stream.pending,
            remain: stream.pending,
            step: 1,
        })
    }

    fn clone_handle(&mut self, handle: TarHandle) -> Result<TarHandle> {
        let stream = self.stream(handle)?;
        self.next_handle += 1;
        self.streams.insert(self.next_handle, stream);
        Ok(TarHandle(self.next_handle))
    }

    fn close(&mut self, handle: TarHandle) -> Result<()> {
        if let Some(stream) = self.streams.remove(&handle.0) {
            self.events.push(format!("close {}", stream.borrow().path));
        }
        Ok(())
    }
}

struct MemOpenFile {
    path: String,
    pos: usize,
}

/// An in-memory host filesystem.
pub struct MemHostFs {
    pub files: HashMap<String, Vec<u8>>,
    pub dirs: Vec<String>,
    pub stamps: HashMap<String, (u32, u32)>,
    pub attrs: HashMap<String, crate::fs::FileAttr>,
    /// Record of wiped paths.
    pub wiped: Vec<String>,
    open: HashMap<u32, MemOpenFile>,
    next_handle: u32,
}

impl MemHostFs {
    pub fn new() -> MemHostFs {
        MemHostFs {
            files: HashMap::new(),
            dirs: Vec::new(),
            stamps: HashMap::new(),
            attrs: HashMap::new(),
            wiped: Vec::new(),
            open: HashMap::new(),
            next_handle: 0,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.iter().any(|d| d == path)
    }
}

impl Default for MemHostFs {
    fn default() -> MemHostFs {
        MemHostFs::new()
    }
}

impl HostFs for MemHostFs {
    fn info(&mut self, path: &str) -> Result<FsInfo> {
        if let Some(content) = self.files.get(path) {
            let (load, exec) = self
                .stamps
                .get(path)
                .copied()
                .unwrap_or((0xfffffd00, 0));
            Ok(FsInfo {
                name: path.to_string(),
                load_addr: load,
                exec_addr: exec,
                size: content.len() as u32,
                attr: self
                    .attrs
                    .get(path)
                    .copied()
                    .unwrap_or(crate::fs::FileAttr::OWNER_READ | crate::fs::FileAttr::OWNER_WRITE),
                obj_type: ObjectType::File,
            })
        } else if self.dirs.iter().any(|d| d == path) {
            Ok(FsInfo {
                name: path.to_string(),
                obj_type: ObjectType::Dir,
                ..FsInfo::default()
            })
        } else {
            Ok(FsInfo {
                name: path.to_string(),
                obj_type: ObjectType::NotFound,
                ..FsInfo::default()
            })
        }
    }

    fn wipe(&mut self, path: &str) {
        self.wiped.push(path.to_string());
        self.files.remove(path);
        self.stamps.remove(path);
        self.attrs.remove(path);
        self.dirs.retain(|d| d != path);
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        if !self.dirs.iter().any(|d| d == path) {
            self.dirs.push(path.to_string());
        }
        Ok(())
    }

    fn open_in(&mut self, path: &str) -> Result<HostHandle> {
        if !self.files.contains_key(path) {
            return Err(Error::NotFound);
        }
        self.next_handle += 1;
        self.open.insert(
            self.next_handle,
            MemOpenFile {
                path: path.to_string(),
                pos: 0,
            },
        );
        Ok(HostHandle(self.next_handle))
    }

    fn open_out(&mut self, path: &str) -> Result<HostHandle> {
        self.files.insert(path.to_string(), Vec::new());
        self.next_handle += 1;
        self.open.insert(
            self.next_handle,
            MemOpenFile {
                path: path.to_string(),
                pos: 0,
            },
        );
        Ok(HostHandle(self.next_handle))
    }

    fn open_log(&mut self, path: &str, append: bool) -> Result<HostHandle> {
        if !append || !self.files.contains_key(path) {
            self.files.insert(path.to_string(), Vec::new());
        }
        self.next_handle += 1;
        let pos = self.files.get(path).map(|c| c.len()).unwrap_or(0);
        self.open.insert(
            self.next_handle,
            MemOpenFile {
                path: path.to_string(),
                pos,
            },
        );
        Ok(HostHandle(self.next_handle))
    }

    fn read(&mut self, handle: HostHandle, length: usize) -> Result<Vec<u8>> {
        let file = self.open.get_mut(&handle.0).ok_or(Error::BadParms)?;
        let content = self.files.get(&file.path).ok_or(Error::NotFound)?;
        if content.len() < file.pos + length {
            return Err(Error::Eof);
        }
        let data = content[file.pos..file.pos + length].to_vec();
        file.pos += length;
        Ok(data)
    }

    fn write(&mut self, handle: HostHandle, data: &[u8]) -> Result<()> {
        let file = self.open.get_mut(&handle.0).ok_or(Error::BadParms)?;
        let content = self.files.get_mut(&file.path).ok_or(Error::NotFound)?;
        content.extend_from_slice(data);
        file.pos = content.len();
        Ok(())
    }

    fn close(&mut self, handle: HostHandle) -> Result<()> {
        self.open.remove(&handle.0).ok_or(Error::BadParms)?;
        Ok(())
    }

    fn set_stamp(&mut self, path: &str, load: u32, exec: u32) -> Result<()> {
        self.stamps.insert(path.to_string(), (load, exec));
        Ok(())
    }

    fn set_attr(&mut self, path: &str, attr: crate::fs::FileAttr) -> Result<()> {
        self.attrs.insert(path.to_string(), attr);
        Ok(())
    }

    fn read_all(&mut self, path: &str) -> Result<Vec<u8>> {
        self.files.get(path).cloned().ok_or(Error::NotFound)
    }
}
