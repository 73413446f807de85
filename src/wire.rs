//! The two wire-protocol command vocabularies (RFSV32 for ERA devices,
//! RFSV16 for SIBO devices) and the task-control channel (NCP), as tagged
//! command/reply types, plus the link seam the dispatcher drives. The
//! byte-level encodings of these commands live with the link
//! implementation, not here.
//!
//! Strings on the 32-bit wire are wide text, carried here as `String`;
//! strings on the 16-bit wire and the task-control channel are raw device
//! bytes in code page 850.

use crate::err::Result;
use crate::fs::{EraAttr, EraTime, SiboAttr};
use crate::uid::UidTriple;
use bitflags::bitflags;

/// Largest slice moved by one 32-bit read or write request.
pub const RFSV32_MAX_TRANSFER: usize = 2048;
/// Largest slice moved by one 16-bit read or write request.
pub const RFSV16_MAX_TRANSFER: usize = 848;

bitflags! {
    /// EPOC32 file open mode bits.
    pub struct EraMode: u32 {
        const SHARE_ANY = 0x0001;
        const SHARE_EXCLUSIVE = 0x0002;
        const BINARY = 0x0004;
        const READ_WRITE = 0x0008;
    }
}

bitflags! {
    /// EPOC16 file open mode bits.
    pub struct SiboMode: u32 {
        const OPEN_EXISTING = 0x0000;
        const OVERWRITE = 0x0001;
        const BINARY_STREAM = 0x0010;
        const READ_WRITE = 0x0020;
        const RANDOM_ACCESS = 0x0040;
        const SHARE = 0x0080;
        const DIRECTORY_RECORD = 0x0100;
        /// Volume-label bit for attribute writes.
        const VOLUME = 0x0200;
    }
}

/// A directory entry as delivered by the 32-bit wire.
#[derive(Clone, Debug, Default)]
pub struct EraEntry {
    pub name: String,
    pub size: u32,
    pub attributes: EraAttr,
    pub modified: EraTime,
    pub uid: UidTriple,
}

/// A directory entry as delivered by the 16-bit wire.
#[derive(Clone, Debug)]
pub struct SiboEntry {
    pub name: Vec<u8>,
    pub size: u32,
    pub attributes: SiboAttr,
    /// Seconds since 1970.
    pub modified: u32,
}

/// Volume details from a 32-bit volume query.
#[derive(Clone, Debug, Default)]
pub struct EraVolume {
    pub name: String,
    pub media_rom: bool,
    pub free: u64,
    pub size: u64,
}

/// Device details from a 16-bit device status query.
#[derive(Clone, Debug)]
pub struct SiboDevice {
    pub name: Vec<u8>,
    pub media_rom: bool,
    pub free: u32,
    pub size: u32,
}

/// Commands understood by the 32-bit remote file server.
#[derive(Clone, Debug)]
pub enum Rfsv32Cmd {
    Volume { drive: u8 },
    SetVolumeLabel { drive: u8, name: String },
    OpenDir { attributes: EraAttr, pattern: String },
    ReadDir { handle: u32, size: usize },
    CloseHandle { handle: u32 },
    RemoteEntry { name: String },
    MkDirAll { name: String },
    Delete { name: String },
    RmDir { name: String },
    Rename { src: String, dest: String },
    SetAtt { name: String, set: EraAttr, clear: EraAttr },
    SetModified { name: String, modified: EraTime },
    OpenFile { mode: EraMode, name: String },
    ReplaceFile { mode: EraMode, name: String },
    SeekFile { handle: u32, offset: u32 },
    ReadFile { handle: u32, length: usize },
    WriteFile { handle: u32, data: Vec<u8> },
    SetSize { handle: u32, size: u32 },
    Flush { handle: u32 },
}

/// Replies from the 32-bit remote file server.
#[derive(Clone, Debug)]
pub enum Rfsv32Reply {
    Done,
    Volume { volume: EraVolume },
    OpenDir { handle: u32 },
    ReadDir { entries: Vec<EraEntry> },
    RemoteEntry { entry: EraEntry },
    OpenFile { handle: u32 },
    ReadFile { data: Vec<u8> },
}

/// Commands understood by the 16-bit remote file server.
#[derive(Clone, Debug)]
pub enum Rfsv16Cmd {
    StatusDevice { name: Vec<u8> },
    FOpen { mode: SiboMode, name: Vec<u8> },
    FDirRead { handle: u32, size: usize },
    FClose { handle: u32 },
    FInfo { name: Vec<u8> },
    MkDir { name: Vec<u8> },
    Delete { name: Vec<u8> },
    Rename { src: Vec<u8>, dest: Vec<u8> },
    SfStat { name: Vec<u8>, set: SiboAttr, mask: SiboAttr },
    SfDate { name: Vec<u8>, modified: u32 },
    FSeek { handle: u32, offset: u32 },
    FRead { handle: u32, length: usize },
    FWrite { handle: u32, data: Vec<u8> },
    FSetEof { handle: u32, size: u32 },
    FFlush { handle: u32 },
}

/// Replies from the 16-bit remote file server.
#[derive(Clone, Debug)]
pub enum Rfsv16Reply {
    Done,
    StatusDevice { device: SiboDevice },
    FOpen { handle: u32 },
    FDirRead { entries: Vec<SiboEntry> },
    FInfo { entry: SiboEntry },
    FRead { data: Vec<u8> },
}

/// Machine type codes reported by the task-control channel.
pub const MACHINE_TYPE_S3: u32 = 3;
pub const MACHINE_TYPE_S3A: u32 = 4;
pub const MACHINE_TYPE_SIENNA: u32 = 5;
pub const MACHINE_TYPE_S3C: u32 = 6;
pub const MACHINE_TYPE_S5: u32 = 32;

/// Power supply details within the machine information block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SupplyInfo {
    pub main_status: u32,
    pub main_mv: u32,
    pub main_mv_max: u32,
    pub backup_status: u32,
    pub backup_mv: u32,
    pub backup_mv_max: u32,
    pub external: bool,
}

/// Time details within the machine information block.
#[derive(Clone, Debug, Default)]
pub struct MachineTime {
    pub home_time: EraTime,
    pub zone_offset: i32,
    pub dst: bool,
}

/// The machine information block from the task-control channel.
#[derive(Clone, Debug, Default)]
pub struct MachineInfo {
    pub machine_uid: u64,
    pub machine_name: String,
    pub language: u32,
    pub rom_major: u32,
    pub rom_minor: u32,
    pub rom_build: u32,
    pub supply: SupplyInfo,
    pub time: MachineTime,
}

/// A task with files open, as reported by a drive query. Strings are raw
/// device bytes.
#[derive(Clone, Debug, Default)]
pub struct NcpApp {
    pub name: Vec<u8>,
    pub args: Vec<u8>,
}

/// Commands understood by the task-control channel.
#[derive(Clone, Debug)]
pub enum NcpCmd {
    GetUniqueId { name: Vec<u8> },
    GetMachineType,
    GetMachineInfo,
    /// Report tasks with files open on one drive; at most `size` entries
    /// may still be accepted by the caller.
    QueryDrive { drive: u8, size: usize },
    GetCmdLine { name: Vec<u8> },
    StopProgram { name: Vec<u8> },
    ProgRunning { name: Vec<u8> },
    ExecProgram { name: Vec<u8>, args: Vec<u8> },
    SetTime { time: MachineTime },
    GetOwnerInfo,
}

/// Replies from the task-control channel.
#[derive(Clone, Debug)]
pub enum NcpReply {
    Done,
    GetUniqueId { id: u64 },
    GetMachineType { machine_type: u32 },
    GetMachineInfo { info: MachineInfo },
    QueryDrive { apps: Vec<NcpApp> },
    GetCmdLine { name: Vec<u8>, args: Vec<u8> },
    ProgRunning { running: bool },
    GetOwnerInfo { info: Vec<u8> },
}

/// A reply from any of the three wire services.
#[derive(Clone, Debug)]
pub enum WireReply {
    Era(Rfsv32Reply),
    Sibo(Rfsv16Reply),
    Ncp(NcpReply),
}

/// The serial-link seam. Submission never blocks; completions are
/// drained by the engine's poll loop and routed by token. Exactly one
/// completion is delivered per submission.
pub trait WireLink {
    /// Is the 32-bit remote file server connected.
    fn era_present(&self) -> bool;
    /// Is the 16-bit remote file server connected.
    fn sibo_present(&self) -> bool;
    /// Is the task-control channel connected.
    fn ncp_present(&self) -> bool;

    fn submit_era(&mut self, token: u64, cmd: Rfsv32Cmd) -> Result<()>;
    fn submit_sibo(&mut self, token: u64, cmd: Rfsv16Cmd) -> Result<()>;
    fn submit_ncp(&mut self, token: u64, cmd: NcpCmd) -> Result<()>;

    /// Drain one completion, if any are ready.
    fn poll(&mut self) -> Option<(u64, Result<WireReply>)>;

    /// Has the host raised an escape condition. Only consulted by
    /// blocking submissions that opted in.
    fn escape_pending(&mut self) -> bool {
        false
    }
}

// Shared-ownership forwarding so a caller can keep a handle on the link
// it hands to the engine (used by the in-memory test links).
impl<T: WireLink> WireLink for std::rc::Rc<std::cell::RefCell<T>> {
    fn era_present(&self) -> bool {
        self.borrow().era_present()
    }

    fn sibo_present(&self) -> bool {
        self.borrow().sibo_present()
    }

    fn ncp_present(&self) -> bool {
        self.borrow().ncp_present()
    }

    fn submit_era(&mut self, token: u64, cmd: Rfsv32Cmd) -> Result<()> {
        self.borrow_mut().submit_era(token, cmd)
    }

    fn submit_sibo(&mut self, token: u64, cmd: Rfsv16Cmd) -> Result<()> {
        self.borrow_mut().submit_sibo(token, cmd)
    }

    fn submit_ncp(&mut self, token: u64, cmd: NcpCmd) -> Result<()> {
        self.borrow_mut().submit_ncp(token, cmd)
    }

    fn poll(&mut self) -> Option<(u64, Result<WireReply>)> {
        self.borrow_mut().poll()
    }

    fn escape_pending(&mut self) -> bool {
        self.borrow_mut().escape_pending()
    }
}
