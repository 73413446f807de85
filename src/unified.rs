//! Unified remote file access: a protocol-agnostic façade over the two
//! remote file servers (32-bit ERA and 16-bit SIBO) and the task-control
//! channel. Each unified command owns a small sub-state machine driving
//! the wire round trips it needs; completion is reported exactly once per
//! submission through the engine's completion queue.

use crate::clock::{ticks_since, Ticks};
use crate::code;
use crate::err::{Error, Result};
use crate::fs::{
    DateStamp, EraAttr, FileAttr, FsInfo, ObjectType, OpenMode, RemoteHandle, SiboAttr,
};
use crate::name;
use crate::timer::{TimerQueue, TimerToken};
use crate::uid;
use crate::wildcard;
use crate::wire::{
    EraEntry, EraMode, EraVolume, NcpApp, NcpCmd, NcpReply, Rfsv16Cmd, Rfsv16Reply,
    Rfsv32Cmd, Rfsv32Reply, SiboDevice, SiboEntry, SiboMode, SupplyInfo, WireLink, WireReply,
    MACHINE_TYPE_S3, MACHINE_TYPE_S3A, MACHINE_TYPE_S3C, MACHINE_TYPE_S5, MACHINE_TYPE_SIENNA,
    RFSV16_MAX_TRANSFER, RFSV32_MAX_TRANSFER,
};
use log::debug;
use std::collections::HashMap;

// Minimum size of the shared scratch buffer; growth doubles.
const MIN_BUFFER: usize = 4096;

// Date stamps produced by interactive filer copies, and the catalogue
// addresses they map onto.
const DEAD16: DateStamp = DateStamp {
    high: 0x4f,
    low: 0xd2a7_f450,
};
const DEAD32: DateStamp = DateStamp {
    high: 0x8b,
    low: 0x87b2_6778,
};
const DEAD_LOAD: u32 = 0xdead_dead;
const DEAD_EXEC: u32 = 0xdead_dead;

// Task stop/start pacing (centi-seconds).
const STOP_TIMEOUT: u32 = 2000;
const STOP_DELAY: u32 = 50;
const START_DELAY: u32 = 500;

/// Destination of a unified completion.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Client {
    /// An asynchronous operation identified by handle.
    AsyncOp(u32),
    /// A foreground waiter identified by slot.
    Foreground(u32),
}

/// Action prefix applied when starting a task on a file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StartAction {
    /// Start the task with its bare argument string.
    Default,
    /// Ask the task to open the named file.
    Open,
    /// Ask the task to create the named file.
    Create,
}

impl StartAction {
    fn prefix(self) -> Option<char> {
        match self {
            StartAction::Default => None,
            StartAction::Open => Some('O'),
            StartAction::Create => Some('C'),
        }
    }
}

/// The unified command vocabulary.
#[derive(Clone, Debug)]
pub enum UnifiedCmd {
    Drive { drive: char },
    Name { drive: char, name: String },
    List { path: String, size: usize },
    Info { path: String },
    MkDir { path: String },
    Remove { path: String },
    RmDir { path: String },
    Rename { src: String, dest: String },
    Access { path: String, attr: FileAttr },
    Stamp { path: String, date: DateStamp },
    Open { path: String, mode: OpenMode },
    Close { handle: RemoteHandle },
    Seek { handle: RemoteHandle, offset: u32 },
    Read { handle: RemoteHandle, length: usize },
    Write { handle: RemoteHandle, data: Vec<u8> },
    Zero { handle: RemoteHandle, length: usize },
    Size { handle: RemoteHandle, size: u32 },
    Flush { handle: RemoteHandle },
    Machine,
    Tasks { size: usize },
    Detail { name: String },
    Stop { name: String },
    Start { name: String, args: String, action: StartAction },
    Power,
    RTime,
    WTime { date: DateStamp },
    Owner,
}

/// Discriminant of a unified command, kept by callers that need to
/// interpret the matching reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnifiedCmdKind {
    Drive,
    Name,
    List,
    Info,
    MkDir,
    Remove,
    RmDir,
    Rename,
    Access,
    Stamp,
    Open,
    Close,
    Seek,
    Read,
    Write,
    Zero,
    Size,
    Flush,
    Machine,
    Tasks,
    Detail,
    Stop,
    Start,
    Power,
    RTime,
    WTime,
    Owner,
}

impl UnifiedCmd {
    pub fn kind(&self) -> UnifiedCmdKind {
        match self {
            UnifiedCmd::Drive { .. } => UnifiedCmdKind::Drive,
            UnifiedCmd::Name { .. } => UnifiedCmdKind::Name,
            UnifiedCmd::List { .. } => UnifiedCmdKind::List,
            UnifiedCmd::Info { .. } => UnifiedCmdKind::Info,
            UnifiedCmd::MkDir { .. } => UnifiedCmdKind::MkDir,
            UnifiedCmd::Remove { .. } => UnifiedCmdKind::Remove,
            UnifiedCmd::RmDir { .. } => UnifiedCmdKind::RmDir,
            UnifiedCmd::Rename { .. } => UnifiedCmdKind::Rename,
            UnifiedCmd::Access { .. } => UnifiedCmdKind::Access,
            UnifiedCmd::Stamp { .. } => UnifiedCmdKind::Stamp,
            UnifiedCmd::Open { .. } => UnifiedCmdKind::Open,
            UnifiedCmd::Close { .. } => UnifiedCmdKind::Close,
            UnifiedCmd::Seek { .. } => UnifiedCmdKind::Seek,
            UnifiedCmd::Read { .. } => UnifiedCmdKind::Read,
            UnifiedCmd::Write { .. } => UnifiedCmdKind::Write,
            UnifiedCmd::Zero { .. } => UnifiedCmdKind::Zero,
            UnifiedCmd::Size { .. } => UnifiedCmdKind::Size,
            UnifiedCmd::Flush { .. } => UnifiedCmdKind::Flush,
            UnifiedCmd::Machine => UnifiedCmdKind::Machine,
            UnifiedCmd::Tasks { .. } => UnifiedCmdKind::Tasks,
            UnifiedCmd::Detail { .. } => UnifiedCmdKind::Detail,
            UnifiedCmd::Stop { .. } => UnifiedCmdKind::Stop,
            UnifiedCmd::Start { .. } => UnifiedCmdKind::Start,
            UnifiedCmd::Power => UnifiedCmdKind::Power,
            UnifiedCmd::RTime => UnifiedCmdKind::RTime,
            UnifiedCmd::WTime { .. } => UnifiedCmdKind::WTime,
            UnifiedCmd::Owner => UnifiedCmdKind::Owner,
        }
    }
}

/// Details for one drive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DriveDetails {
    pub present: bool,
    pub rom: bool,
    pub name: String,
    pub free: u64,
    pub size: u64,
    pub id: u64,
}

/// Details for the remote machine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MachineDetails {
    pub machine_type: u32,
    pub name: String,
    pub id: u64,
    pub language: u32,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_build: u32,
}

/// One task with open files, decoded into host strings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskDetail {
    pub name: String,
    pub args: String,
}

/// Power supply details.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PowerDetails {
    pub supply: SupplyInfo,
}

/// Replies to unified commands.
#[derive(Clone, Debug, PartialEq)]
pub enum UnifiedReply {
    Done,
    Drive { drive: DriveDetails },
    List { entries: Vec<FsInfo> },
    Info { info: FsInfo },
    Open { handle: RemoteHandle },
    Read { data: Vec<u8> },
    Machine { machine: MachineDetails },
    Tasks { tasks: Vec<TaskDetail> },
    Detail { task: TaskDetail },
    Power { power: PowerDetails },
    RTime { date: DateStamp },
    Owner { info: String },
}

/// Construct catalogue load and execution addresses from a file type and
/// date stamp. The two interactive-filer-copy sentinel dates both map to
/// the dead-address pair.
pub fn load_exec(file_type: u32, date: DateStamp) -> (u32, u32) {
    if date == DEAD16 || date == DEAD32 {
        (DEAD_LOAD, DEAD_EXEC)
    } else {
        (
            0xfff0_0000 | ((file_type & 0xfff) << 8) | (date.high & 0xff),
            date.low,
        )
    }
}

/// Translate an entry name (a single leaf) from wide wire text.
fn era_leaf_to_host(text: &str) -> Result<String> {
    code::era_to_latin1(text).map(|t| name::swap_leaf(&t))
}

/// Translate an entry name (a single leaf) from 16-bit wire bytes.
fn sibo_leaf_to_host(bytes: &[u8]) -> Result<String> {
    code::cp850_to_latin1(bytes).map(|t| name::swap_leaf(&t))
}

fn bytes_as_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Convert an ERA directory entry to the host shape.
fn era_info_to_host(era: &EraEntry) -> Result<FsInfo> {
    let name = era_leaf_to_host(&era.name)?;
    let file_type = uid::map_type(&name, Some(&era.uid));
    let (load_addr, exec_addr) = load_exec(file_type, DateStamp::from_era(era.modified));
    Ok(FsInfo {
        name,
        load_addr,
        exec_addr,
        size: era.size,
        attr: FileAttr::from_era(era.attributes),
        obj_type: if era.attributes.contains(EraAttr::DIRECTORY) {
            ObjectType::Dir
        } else {
            ObjectType::File
        },
    })
}

/// Convert a SIBO directory entry to the host shape.
fn sibo_info_to_host(sibo: &SiboEntry) -> Result<FsInfo> {
    let name = sibo_leaf_to_host(&sibo.name)?;
    let file_type = uid::map_type(&name, None);
    let (load_addr, exec_addr) = load_exec(file_type, DateStamp::from_sibo(sibo.modified));
    Ok(FsInfo {
        name,
        load_addr,
        exec_addr,
        size: sibo.size,
        attr: FileAttr::from_sibo(sibo.attributes),
        obj_type: if sibo.attributes.contains(SiboAttr::DIRECTORY) {
            ObjectType::Dir
        } else {
            ObjectType::File
        },
    })
}

fn machine_type_name(machine_type: u32) -> String {
    match machine_type {
        MACHINE_TYPE_S3 => "Psion Series 3".to_string(),
        MACHINE_TYPE_S3A => "Psion Series 3a, 3c or 3mx".to_string(),
        MACHINE_TYPE_SIENNA => "Psion Sienna".to_string(),
        MACHINE_TYPE_S3C => "Psion Series 3c".to_string(),
        MACHINE_TYPE_S5 => "Psion Series 5 or Geofox-One".to_string(),
        other => format!("unrecognised machine type ({})", other),
    }
}

// Sub-state of an in-flight command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    Single,
    DriveVolume,
    DriveId,
    ListOpen,
    ListRead,
    ListClose,
    Transfer,
    MachineType,
    MachineInfo,
    TasksQuery,
    Stop,
    StartExec,
    StartSettle,
    WTimeInfo,
    WTimeSet,
}

struct Pending {
    cmd: UnifiedCmd,
    client: Client,
    era: bool,
    phase: Phase,
    /// Error parked while a teardown round trip (directory close) runs.
    stored_err: Option<Error>,
    /// Bytes transferred so far, and the size of the chunk in flight.
    length: usize,
    chunk: usize,
    /// Remote directory handle being enumerated.
    dir_handle: Option<u32>,
    /// Accumulators for list and tasks.
    entries: Vec<FsInfo>,
    apps: Vec<NcpApp>,
    remain: usize,
    /// Data accumulated by a read.
    data: Vec<u8>,
    /// Partial drive and machine replies.
    drive: DriveDetails,
    machine: MachineDetails,
    /// Stop/start pacing.
    delay: bool,
    timeout: Ticks,
    /// Next drive letter for a 16-bit task query.
    task_drive: u8,
}

impl Pending {
    fn new(cmd: UnifiedCmd, client: Client, era: bool) -> Pending {
        Pending {
            cmd,
            client,
            era,
            phase: Phase::Single,
            stored_err: None,
            length: 0,
            chunk: 0,
            dir_handle: None,
            entries: Vec::new(),
            apps: Vec::new(),
            remain: 0,
            data: Vec::new(),
            drive: DriveDetails::default(),
            machine: MachineDetails::default(),
            delay: false,
            timeout: 0,
            task_drive: b'A',
        }
    }
}

enum Step {
    InFlight(Pending),
    Done(Pending, Result<UnifiedReply>),
}

/// The unified dispatcher.
pub struct Unified {
    active: bool,
    partial: bool,
    connected: bool,
    era: bool,
    next_id: u64,
    pending: HashMap<u64, Pending>,
    completed: Vec<(Client, Result<UnifiedReply>)>,
    scratch: Vec<u8>,
}

impl Unified {
    pub fn new() -> Unified {
        Unified {
            active: false,
            partial: false,
            connected: false,
            era: false,
            next_id: 0,
            pending: HashMap::new(),
            completed: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Start the dispatcher layer.
    pub fn start(&mut self) {
        if !self.active {
            debug!("starting unified layer");
            self.active = true;
        }
    }

    /// End the dispatcher layer. In-flight commands fail and the scratch
    /// buffer is released.
    pub fn end(&mut self) {
        if self.active {
            debug!("ending unified layer");
            let pending: Vec<u64> = self.pending.keys().copied().collect();
            for id in pending {
                if let Some(p) = self.pending.remove(&id) {
                    self.completed
                        .push((p.client, Err(Error::NoRemoteService)));
                }
            }
            self.scratch = Vec::new();
            self.partial = false;
            self.connected = false;
            self.active = false;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Refresh the connection state from the link. Returns true when the
    /// visible state changed.
    pub fn update(&mut self, link: &dyn WireLink) -> bool {
        let (partial, era) = if self.active && link.era_present() {
            (true, true)
        } else if self.active && link.sibo_present() {
            (true, false)
        } else {
            (false, self.era)
        };
        let connected = partial && link.ncp_present();
        let changed = partial != self.partial || connected != self.connected;
        if changed {
            debug!(
                "unified connection changed partial={} connected={} era={}",
                partial, connected, era
            );
        }
        self.partial = partial;
        self.connected = connected;
        self.era = era;
        changed
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_era(&self) -> bool {
        self.era
    }

    /// Render the connection state.
    pub fn status_report(&self) -> String {
        let family = if self.era { "EPOC" } else { "SIBO" };
        if self.connected {
            format!("Connected to all necessary {} servers.\n", family)
        } else if self.partial {
            format!("Connected to the {} remote file server only.\n", family)
        } else if self.active {
            "Not connected to all necessary remote servers.\n".to_string()
        } else {
            "High level link layers not active.\n".to_string()
        }
    }

    /// Validate a name through the connected variant's round trip.
    /// Callers compare the result with the input to detect names the
    /// remote cannot represent exactly.
    pub fn validate(&mut self, link: &dyn WireLink, path: &str) -> Result<String> {
        self.update(link);
        if !self.partial {
            return Err(Error::NoRemoteService);
        }
        if self.era {
            name::era_to_host(&name::host_to_era(path)?)
        } else {
            name::sibo_to_host(&name::host_to_sibo(path)?)
        }
    }

    /// Drain completions accumulated since the last call.
    pub fn take_completed(&mut self) -> Vec<(Client, Result<UnifiedReply>)> {
        std::mem::replace(&mut self.completed, Vec::new())
    }

    pub fn has_completed(&self) -> bool {
        !self.completed.is_empty()
    }

    fn ensure_scratch(&mut self, size: usize) {
        if self.scratch.len() < size {
            let mut new_size = MIN_BUFFER;
            while new_size < size {
                new_size <<= 1;
            }
            self.scratch = vec![0u8; new_size];
        }
    }

    fn needs_task_control(cmd: &UnifiedCmd) -> bool {
        matches!(
            cmd,
            UnifiedCmd::Machine
                | UnifiedCmd::Tasks { .. }
                | UnifiedCmd::Detail { .. }
                | UnifiedCmd::Stop { .. }
                | UnifiedCmd::Start { .. }
                | UnifiedCmd::Power
                | UnifiedCmd::RTime
                | UnifiedCmd::WTime { .. }
                | UnifiedCmd::Owner
        )
    }

    /// Enqueue one command. Control returns immediately; failures are
    /// reported through the completion queue like successes.
    pub fn submit(
        &mut self,
        link: &mut dyn WireLink,
        now: Ticks,
        cmd: UnifiedCmd,
        client: Client,
    ) -> Result<()> {
        self.update(link);
        if !self.partial {
            self.completed.push((client, Err(Error::NoRemoteService)));
            return Ok(());
        }
        if Self::needs_task_control(&cmd) && !self.connected {
            self.completed
                .push((client, Err(Error::RemoteNotSupported)));
            return Ok(());
        }

        self.next_id += 1;
        let id = self.next_id;
        let pending = Pending::new(cmd, client, self.era);
        match self.begin(link, now, id, pending) {
            Step::InFlight(p) => {
                self.pending.insert(id, p);
            }
            Step::Done(p, result) => self.completed.push((p.client, result)),
        }
        Ok(())
    }

    /// Route a wire completion to its in-flight command.
    pub fn on_wire(
        &mut self,
        link: &mut dyn WireLink,
        timer: &mut TimerQueue,
        now: Ticks,
        token: u64,
        result: Result<WireReply>,
    ) {
        let pending = match self.pending.remove(&token) {
            Some(p) => p,
            None => {
                debug!("unified completion for unknown token {}", token);
                return;
            }
        };
        match self.advance(link, timer, now, token, pending, Event::Wire(result)) {
            Step::InFlight(p) => {
                self.pending.insert(token, p);
            }
            Step::Done(p, result) => self.completed.push((p.client, result)),
        }
    }

    /// Route a timer expiry to its in-flight command.
    pub fn on_timer(
        &mut self,
        link: &mut dyn WireLink,
        timer: &mut TimerQueue,
        now: Ticks,
        token: u64,
    ) {
        let pending = match self.pending.remove(&token) {
            Some(p) => p,
            None => return,
        };
        match self.advance(link, timer, now, token, pending, Event::Timer) {
            Step::InFlight(p) => {
                self.pending.insert(token, p);
            }
            Step::Done(p, result) => self.completed.push((p.client, result)),
        }
    }
}

enum Event {
    Wire(Result<WireReply>),
    Timer,
}

// Submission helpers shared by begin and advance.
impl Unified {
    fn send_era(
        &mut self,
        link: &mut dyn WireLink,
        id: u64,
        p: Pending,
        cmd: Rfsv32Cmd,
    ) -> Step {
        match link.submit_era(id, cmd) {
            Ok(()) => Step::InFlight(p),
            Err(err) => Step::Done(p, Err(err)),
        }
    }

    fn send_sibo(
        &mut self,
        link: &mut dyn WireLink,
        id: u64,
        p: Pending,
        cmd: Rfsv16Cmd,
    ) -> Step {
        match link.submit_sibo(id, cmd) {
            Ok(()) => Step::InFlight(p),
            Err(err) => Step::Done(p, Err(err)),
        }
    }

    fn send_ncp(&mut self, link: &mut dyn WireLink, id: u64, p: Pending, cmd: NcpCmd) -> Step {
        match link.submit_ncp(id, cmd) {
            Ok(()) => Step::InFlight(p),
            Err(err) => Step::Done(p, Err(err)),
        }
    }
}

fn era_mode_for(mode: OpenMode) -> (bool, EraMode) {
    // (replace, mode bits)
    match mode {
        OpenMode::Out => (
            true,
            EraMode::SHARE_EXCLUSIVE | EraMode::BINARY | EraMode::READ_WRITE,
        ),
        OpenMode::In => (false, EraMode::SHARE_ANY | EraMode::BINARY),
        OpenMode::Up => (
            false,
            EraMode::SHARE_EXCLUSIVE | EraMode::BINARY | EraMode::READ_WRITE,
        ),
    }
}

fn sibo_mode_for(mode: OpenMode) -> SiboMode {
    match mode {
        OpenMode::Out => {
            SiboMode::OVERWRITE
                | SiboMode::BINARY_STREAM
                | SiboMode::READ_WRITE
                | SiboMode::RANDOM_ACCESS
        }
        OpenMode::In => {
            SiboMode::OPEN_EXISTING
                | SiboMode::BINARY_STREAM
                | SiboMode::RANDOM_ACCESS
                | SiboMode::SHARE
        }
        OpenMode::Up => {
            SiboMode::OPEN_EXISTING
                | SiboMode::BINARY_STREAM
                | SiboMode::READ_WRITE
                | SiboMode::RANDOM_ACCESS
        }
    }
}

// Encoding helpers. Program and task names are not always paths, so the
// path translation falls back to the raw text when it fails but the raw
// form is usable on the wire.
fn start_name_era(text: &str) -> String {
    name::host_to_era(text).unwrap_or_else(|_| text.to_string())
}

fn start_name_sibo(text: &str) -> Result<Vec<u8>> {
    match name::host_to_sibo(text) {
        Ok(path) => Ok(path.into_bytes()),
        Err(_) => code::ansi_to_cp850(text),
    }
}

fn task_args_to_host(era: bool, bytes: &[u8]) -> String {
    // Embedded paths are re-rendered into host form where possible, with
    // a fallback to the encoding-translated original.
    if era {
        name::era_to_host(&bytes_as_latin1(bytes))
            .unwrap_or_else(|_| bytes_as_latin1(bytes))
    } else {
        name::sibo_to_host(&bytes_as_latin1(bytes))
            .unwrap_or_else(|_| code::cp850_to_ansi(bytes).unwrap_or_else(|_| bytes_as_latin1(bytes)))
    }
}

impl Unified {
    fn begin(
        &mut self,
        link: &mut dyn WireLink,
        now: Ticks,
        id: u64,
        mut p: Pending,
    ) -> Step {
        let era = p.era;
        let step = match p.cmd.clone() {
            UnifiedCmd::Drive { drive } => {
                p.phase = Phase::DriveVolume;
                if era {
                    let drive_index = drive.to_ascii_uppercase() as u8 - b'A';
                    self.send_era(link, id, p, Rfsv32Cmd::Volume { drive: drive_index })
                } else {
                    let name = format!("{}:", drive.to_ascii_uppercase()).into_bytes();
                    self.send_sibo(link, id, p, Rfsv16Cmd::StatusDevice { name })
                }
            }

            UnifiedCmd::Name { drive, name: label } => {
                if era {
                    let drive_index = drive.to_ascii_uppercase() as u8 - b'A';
                    match code::latin1_to_era(&label) {
                        Ok(name) => self.send_era(
                            link,
                            id,
                            p,
                            Rfsv32Cmd::SetVolumeLabel {
                                drive: drive_index,
                                name,
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    let path = format!(
                        ":{}.$.{}",
                        drive.to_ascii_uppercase(),
                        name::swap_leaf(&label)
                    );
                    match name::host_to_sibo(&path) {
                        Ok(sibo) => self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::SfStat {
                                name: sibo.into_bytes(),
                                set: SiboAttr::VOLUME,
                                mask: SiboAttr::VOLUME,
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::List { path, size } => {
                p.phase = Phase::ListOpen;
                p.remain = size;
                if era {
                    let pattern = format!("{}.*", path);
                    match name::host_to_era(&pattern) {
                        Ok(pattern) => self.send_era(
                            link,
                            id,
                            p,
                            Rfsv32Cmd::OpenDir {
                                attributes: EraAttr::HIDDEN
                                    | EraAttr::SYSTEM
                                    | EraAttr::DIRECTORY
                                    | EraAttr::UID,
                                pattern,
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    match name::host_to_sibo(&path) {
                        Ok(mut sibo) => {
                            if !sibo.ends_with(name::REMOTE_SEPARATOR) {
                                sibo.push(name::REMOTE_SEPARATOR);
                            }
                            self.send_sibo(
                                link,
                                id,
                                p,
                                Rfsv16Cmd::FOpen {
                                    mode: SiboMode::DIRECTORY_RECORD,
                                    name: sibo.into_bytes(),
                                },
                            )
                        }
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::Info { path } => {
                if era {
                    match name::host_to_era(&path) {
                        Ok(name) => self.send_era(link, id, p, Rfsv32Cmd::RemoteEntry { name }),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    match name::host_to_sibo(&path) {
                        Ok(name) => self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::FInfo {
                                name: name.into_bytes(),
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::MkDir { path } => {
                if era {
                    match name::host_to_era(&path) {
                        Ok(mut name) => {
                            name.push(name::REMOTE_SEPARATOR);
                            self.send_era(link, id, p, Rfsv32Cmd::MkDirAll { name })
                        }
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    match name::host_to_sibo(&path) {
                        Ok(name) => self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::MkDir {
                                name: name.into_bytes(),
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::Remove { path } => {
                if era {
                    match name::host_to_era(&path) {
                        Ok(name) => self.send_era(link, id, p, Rfsv32Cmd::Delete { name }),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    match name::host_to_sibo(&path) {
                        Ok(name) => self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::Delete {
                                name: name.into_bytes(),
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::RmDir { path } => {
                if era {
                    match name::host_to_era(&path) {
                        Ok(mut name) => {
                            name.push(name::REMOTE_SEPARATOR);
                            self.send_era(link, id, p, Rfsv32Cmd::RmDir { name })
                        }
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    match name::host_to_sibo(&path) {
                        Ok(name) => self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::Delete {
                                name: name.into_bytes(),
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::Rename { src, dest } => {
                if era {
                    match name::host_to_era(&src).and_then(|s| {
                        name::host_to_era(&dest).map(|d| (s, d))
                    }) {
                        Ok((src, dest)) => {
                            self.send_era(link, id, p, Rfsv32Cmd::Rename { src, dest })
                        }
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    match name::host_to_sibo(&src).and_then(|s| {
                        name::host_to_sibo(&dest).map(|d| (s, d))
                    }) {
                        Ok((src, dest)) => self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::Rename {
                                src: src.into_bytes(),
                                dest: dest.into_bytes(),
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::Access { path, attr } => {
                if era {
                    let set = attr.to_era();
                    let clear = crate::fs::ERA_ATTR_MASK - set;
                    match name::host_to_era(&path) {
                        Ok(name) => {
                            self.send_era(link, id, p, Rfsv32Cmd::SetAtt { name, set, clear })
                        }
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    match name::host_to_sibo(&path) {
                        Ok(name) => self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::SfStat {
                                name: name.into_bytes(),
                                set: attr.to_sibo(),
                                mask: crate::fs::SIBO_ATTR_MASK,
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::Stamp { path, date } => {
                if era {
                    match name::host_to_era(&path) {
                        Ok(name) => self.send_era(
                            link,
                            id,
                            p,
                            Rfsv32Cmd::SetModified {
                                name,
                                modified: date.to_era(),
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    match name::host_to_sibo(&path) {
                        Ok(name) => self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::SfDate {
                                name: name.into_bytes(),
                                modified: date.to_sibo(),
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::Open { path, mode } => {
                if era {
                    let (replace, bits) = era_mode_for(mode);
                    match name::host_to_era(&path) {
                        Ok(name) => {
                            let cmd = if replace {
                                Rfsv32Cmd::ReplaceFile { mode: bits, name }
                            } else {
                                Rfsv32Cmd::OpenFile { mode: bits, name }
                            };
                            self.send_era(link, id, p, cmd)
                        }
                        Err(err) => Step::Done(p, Err(err)),
                    }
                } else {
                    match name::host_to_sibo(&path) {
                        Ok(name) => self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::FOpen {
                                mode: sibo_mode_for(mode),
                                name: name.into_bytes(),
                            },
                        ),
                        Err(err) => Step::Done(p, Err(err)),
                    }
                }
            }

            UnifiedCmd::Close { handle } => {
                if era {
                    self.send_era(link, id, p, Rfsv32Cmd::CloseHandle { handle: handle.0 })
                } else {
                    self.send_sibo(link, id, p, Rfsv16Cmd::FClose { handle: handle.0 })
                }
            }

            UnifiedCmd::Seek { handle, offset } => {
                if era {
                    self.send_era(
                        link,
                        id,
                        p,
                        Rfsv32Cmd::SeekFile {
                            handle: handle.0,
                            offset,
                        },
                    )
                } else {
                    self.send_sibo(
                        link,
                        id,
                        p,
                        Rfsv16Cmd::FSeek {
                            handle: handle.0,
                            offset,
                        },
                    )
                }
            }

            UnifiedCmd::Read { handle, length } => {
                p.phase = Phase::Transfer;
                let max = if era {
                    RFSV32_MAX_TRANSFER
                } else {
                    RFSV16_MAX_TRANSFER
                };
                let chunk = length.min(max);
                p.chunk = chunk;
                if era {
                    self.send_era(
                        link,
                        id,
                        p,
                        Rfsv32Cmd::ReadFile {
                            handle: handle.0,
                            length: chunk,
                        },
                    )
                } else {
                    self.send_sibo(
                        link,
                        id,
                        p,
                        Rfsv16Cmd::FRead {
                            handle: handle.0,
                            length: chunk,
                        },
                    )
                }
            }

            UnifiedCmd::Write { handle, data } => {
                p.phase = Phase::Transfer;
                let max = if era {
                    RFSV32_MAX_TRANSFER
                } else {
                    RFSV16_MAX_TRANSFER
                };
                let chunk = data.len().min(max);
                p.chunk = chunk;
                let slice = data[..chunk].to_vec();
                if era {
                    self.send_era(
                        link,
                        id,
                        p,
                        Rfsv32Cmd::WriteFile {
                            handle: handle.0,
                            data: slice,
                        },
                    )
                } else {
                    self.send_sibo(
                        link,
                        id,
                        p,
                        Rfsv16Cmd::FWrite {
                            handle: handle.0,
                            data: slice,
                        },
                    )
                }
            }

            UnifiedCmd::Zero { handle, length } => {
                p.phase = Phase::Transfer;
                let max = if era {
                    RFSV32_MAX_TRANSFER
                } else {
                    RFSV16_MAX_TRANSFER
                };
                let chunk = length.min(max);
                p.chunk = chunk;
                self.ensure_scratch(chunk);
                let slice = self.scratch[..chunk].to_vec();
                if era {
                    self.send_era(
                        link,
                        id,
                        p,
                        Rfsv32Cmd::WriteFile {
                            handle: handle.0,
                            data: slice,
                        },
                    )
                } else {
                    self.send_sibo(
                        link,
                        id,
                        p,
                        Rfsv16Cmd::FWrite {
                            handle: handle.0,
                            data: slice,
                        },
                    )
                }
            }

            UnifiedCmd::Size { handle, size } => {
                if era {
                    self.send_era(
                        link,
                        id,
                        p,
                        Rfsv32Cmd::SetSize {
                            handle: handle.0,
                            size,
                        },
                    )
                } else {
                    self.send_sibo(
                        link,
                        id,
                        p,
                        Rfsv16Cmd::FSetEof {
                            handle: handle.0,
                            size,
                        },
                    )
                }
            }

            UnifiedCmd::Flush { handle } => {
                if era {
                    self.send_era(link, id, p, Rfsv32Cmd::Flush { handle: handle.0 })
                } else {
                    self.send_sibo(link, id, p, Rfsv16Cmd::FFlush { handle: handle.0 })
                }
            }

            UnifiedCmd::Machine => {
                p.phase = Phase::MachineType;
                self.send_ncp(link, id, p, NcpCmd::GetMachineType)
            }

            UnifiedCmd::Tasks { size } => {
                p.phase = Phase::TasksQuery;
                p.remain = size;
                p.task_drive = b'A';
                self.send_ncp(
                    link,
                    id,
                    p,
                    NcpCmd::QueryDrive {
                        drive: b'A',
                        size,
                    },
                )
            }

            UnifiedCmd::Detail { name: task } => {
                let encoded = if era {
                    Ok(task.into_bytes())
                } else {
                    code::ansi_to_cp850(&task)
                };
                match encoded {
                    Ok(name) => self.send_ncp(link, id, p, NcpCmd::GetCmdLine { name }),
                    Err(err) => Step::Done(p, Err(err)),
                }
            }

            UnifiedCmd::Stop { name: task } => {
                p.phase = Phase::Stop;
                p.delay = true;
                p.timeout = now.wrapping_add(STOP_TIMEOUT);
                let encoded = if era {
                    Ok(task.into_bytes())
                } else {
                    code::ansi_to_cp850(&task)
                };
                match encoded {
                    Ok(name) => self.send_ncp(link, id, p, NcpCmd::StopProgram { name }),
                    Err(err) => Step::Done(p, Err(err)),
                }
            }

            UnifiedCmd::Start {
                name: task,
                args,
                action,
            } => {
                p.phase = Phase::StartExec;
                p.delay = false;
                let name = if era {
                    start_name_era(&task).into_bytes()
                } else {
                    match start_name_sibo(&task) {
                        Ok(name) => name,
                        Err(err) => return Step::Done(p, Err(err)),
                    }
                };
                let mut args = if era {
                    start_name_era(&args).into_bytes()
                } else {
                    match start_name_sibo(&args) {
                        Ok(args) => args,
                        Err(err) => return Step::Done(p, Err(err)),
                    }
                };
                if let Some(prefix) = action.prefix() {
                    let mut quoted = Vec::with_capacity(args.len() + 3);
                    quoted.push(prefix as u8);
                    quoted.push(b'"');
                    quoted.extend_from_slice(&args);
                    quoted.push(b'"');
                    args = quoted;
                }
                self.send_ncp(link, id, p, NcpCmd::ExecProgram { name, args })
            }

            UnifiedCmd::Power | UnifiedCmd::RTime => {
                if !era {
                    Step::Done(p, Err(Error::BadUnifiedOp))
                } else {
                    self.send_ncp(link, id, p, NcpCmd::GetMachineInfo)
                }
            }

            UnifiedCmd::WTime { .. } => {
                if !era {
                    Step::Done(p, Err(Error::BadUnifiedOp))
                } else {
                    p.phase = Phase::WTimeInfo;
                    self.send_ncp(link, id, p, NcpCmd::GetMachineInfo)
                }
            }

            UnifiedCmd::Owner => self.send_ncp(link, id, p, NcpCmd::GetOwnerInfo),
        };
        step
    }
}

// Reply decoding: one step of the sub-state machine per completion.
impl Unified {
    fn advance(
        &mut self,
        link: &mut dyn WireLink,
        timer: &mut TimerQueue,
        now: Ticks,
        id: u64,
        p: Pending,
        event: Event,
    ) -> Step {
        match event {
            Event::Timer => self.advance_timer(link, timer, now, id, p),
            Event::Wire(Err(err)) => self.advance_error(link, id, p, err),
            Event::Wire(Ok(reply)) => self.advance_reply(link, timer, now, id, p, reply),
        }
    }

    fn advance_timer(
        &mut self,
        link: &mut dyn WireLink,
        _timer: &mut TimerQueue,
        now: Ticks,
        id: u64,
        mut p: Pending,
    ) -> Step {
        match p.phase {
            Phase::Stop => {
                // The settling delay between liveness probes has passed.
                if ticks_since(now, p.timeout) >= 0 {
                    return Step::Done(p, Ok(UnifiedReply::Done));
                }
                p.delay = false;
                let name = match &p.cmd {
                    UnifiedCmd::Stop { name } => {
                        if p.era {
                            Ok(name.clone().into_bytes())
                        } else {
                            code::ansi_to_cp850(name)
                        }
                    }
                    _ => Err(Error::BadUnifiedOp),
                };
                match name {
                    Ok(name) => self.send_ncp(link, id, p, NcpCmd::ProgRunning { name }),
                    Err(err) => Step::Done(p, Err(err)),
                }
            }
            Phase::StartSettle => Step::Done(p, Ok(UnifiedReply::Done)),
            _ => Step::InFlight(p),
        }
    }

    fn advance_error(
        &mut self,
        link: &mut dyn WireLink,
        id: u64,
        mut p: Pending,
        err: Error,
    ) -> Step {
        match p.phase {
            // A failed enumeration still closes the directory; the error
            // is parked until the close completes. End-of-enumeration is
            // not an error at all.
            Phase::ListRead => {
                p.stored_err = if err == Error::Eof { None } else { Some(err) };
                p.phase = Phase::ListClose;
                let handle = p.dir_handle.unwrap_or(0);
                if p.era {
                    self.send_era(link, id, p, Rfsv32Cmd::CloseHandle { handle })
                } else {
                    self.send_sibo(link, id, p, Rfsv16Cmd::FClose { handle })
                }
            }
            Phase::DriveVolume => match err {
                Error::DriveEmpty | Error::RemoteNotReady | Error::RemoteNotSupported => {
                    Step::Done(
                        p,
                        Ok(UnifiedReply::Drive {
                            drive: DriveDetails::default(),
                        }),
                    )
                }
                other => Step::Done(p, Err(other)),
            },
            Phase::DriveId => match err {
                // Valid drive but unable to read the unique identifier.
                Error::RemoteNotSupported => {
                    p.drive.id = 0;
                    let drive = std::mem::take(&mut p.drive);
                    Step::Done(p, Ok(UnifiedReply::Drive { drive }))
                }
                Error::DriveEmpty | Error::RemoteNotReady => Step::Done(
                    p,
                    Ok(UnifiedReply::Drive {
                        drive: DriveDetails::default(),
                    }),
                ),
                other => Step::Done(p, Err(other)),
            },
            _ => Step::Done(p, Err(err)),
        }
    }

    fn advance_reply(
        &mut self,
        link: &mut dyn WireLink,
        timer: &mut TimerQueue,
        now: Ticks,
        id: u64,
        mut p: Pending,
        reply: WireReply,
    ) -> Step {
        match p.phase {
            Phase::DriveVolume => {
                let decoded = match reply {
                    WireReply::Era(Rfsv32Reply::Volume { volume }) => decode_era_volume(&volume),
                    WireReply::Sibo(Rfsv16Reply::StatusDevice { device }) => {
                        decode_sibo_device(&device)
                    }
                    _ => Err(Error::BadParms),
                };
                match decoded {
                    Ok(drive) => {
                        p.drive = drive;
                        p.phase = Phase::DriveId;
                        if !self.connected {
                            p.drive.id = 0;
                            let drive = std::mem::take(&mut p.drive);
                            return Step::Done(p, Ok(UnifiedReply::Drive { drive }));
                        }
                        let letter = match &p.cmd {
                            UnifiedCmd::Drive { drive } => drive.to_ascii_uppercase(),
                            _ => 'A',
                        };
                        let name = format!("{}:", letter).into_bytes();
                        self.send_ncp(link, id, p, NcpCmd::GetUniqueId { name })
                    }
                    Err(err) => Step::Done(p, Err(err)),
                }
            }

            Phase::DriveId => match reply {
                WireReply::Ncp(NcpReply::GetUniqueId { id: unique }) => {
                    p.drive.id = unique;
                    let drive = std::mem::take(&mut p.drive);
                    Step::Done(p, Ok(UnifiedReply::Drive { drive }))
                }
                _ => Step::Done(p, Err(Error::BadParms)),
            },

            Phase::ListOpen => {
                let handle = match reply {
                    WireReply::Era(Rfsv32Reply::OpenDir { handle }) => handle,
                    WireReply::Sibo(Rfsv16Reply::FOpen { handle }) => handle,
                    _ => return Step::Done(p, Err(Error::BadParms)),
                };
                p.dir_handle = Some(handle);
                p.phase = Phase::ListRead;
                let size = p.remain;
                if p.era {
                    self.send_era(link, id, p, Rfsv32Cmd::ReadDir { handle, size })
                } else {
                    self.send_sibo(link, id, p, Rfsv16Cmd::FDirRead { handle, size })
                }
            }

            Phase::ListRead => {
                let converted: Result<Vec<FsInfo>> = match &reply {
                    WireReply::Era(Rfsv32Reply::ReadDir { entries }) => {
                        if entries.len() > p.remain {
                            Err(Error::Buffer)
                        } else {
                            entries.iter().map(era_info_to_host).collect()
                        }
                    }
                    WireReply::Sibo(Rfsv16Reply::FDirRead { entries }) => {
                        if entries.len() > p.remain {
                            Err(Error::Buffer)
                        } else {
                            entries.iter().map(sibo_info_to_host).collect()
                        }
                    }
                    _ => Err(Error::BadParms),
                };
                match converted {
                    Ok(batch) => {
                        p.remain -= batch.len();
                        p.entries.extend(batch);
                        let handle = p.dir_handle.unwrap_or(0);
                        let size = p.remain;
                        if p.era {
                            self.send_era(link, id, p, Rfsv32Cmd::ReadDir { handle, size })
                        } else {
                            self.send_sibo(link, id, p, Rfsv16Cmd::FDirRead { handle, size })
                        }
                    }
                    Err(err) => self.advance_error(link, id, p, err),
                }
            }

            Phase::ListClose => match p.stored_err.take() {
                Some(err) => Step::Done(p, Err(err)),
                None => {
                    let mut entries = std::mem::replace(&mut p.entries, Vec::new());
                    entries.sort_by(|a, b| wildcard::cmp_nocase(&a.name, &b.name));
                    Step::Done(p, Ok(UnifiedReply::List { entries }))
                }
            },

            Phase::Transfer => self.advance_transfer(link, id, p, reply),

            Phase::MachineType => match reply {
                WireReply::Ncp(NcpReply::GetMachineType { machine_type }) => {
                    p.machine.machine_type = machine_type;
                    p.machine.name = machine_type_name(machine_type);
                    if p.era {
                        p.phase = Phase::MachineInfo;
                        self.send_ncp(link, id, p, NcpCmd::GetMachineInfo)
                    } else {
                        let machine = std::mem::take(&mut p.machine);
                        Step::Done(p, Ok(UnifiedReply::Machine { machine }))
                    }
                }
                _ => Step::Done(p, Err(Error::BadParms)),
            },

            Phase::MachineInfo => match reply {
                WireReply::Ncp(NcpReply::GetMachineInfo { info }) => {
                    p.machine.id = info.machine_uid;
                    p.machine.language = info.language;
                    p.machine.version_major = info.rom_major;
                    p.machine.version_minor = info.rom_minor;
                    p.machine.version_build = info.rom_build;
                    if !info.machine_name.is_empty() {
                        match code::ansi_to_latin1(&info.machine_name) {
                            Ok(name) => p.machine.name = name,
                            Err(err) => return Step::Done(p, Err(err)),
                        }
                    }
                    let machine = std::mem::take(&mut p.machine);
                    Step::Done(p, Ok(UnifiedReply::Machine { machine }))
                }
                _ => Step::Done(p, Err(Error::BadParms)),
            },

            Phase::TasksQuery => match reply {
                WireReply::Ncp(NcpReply::QueryDrive { apps }) => {
                    if apps.len() > p.remain {
                        return Step::Done(p, Err(Error::TooManyTasks));
                    }
                    p.remain -= apps.len();
                    p.apps.extend(apps);
                    if !p.era && p.task_drive < b'Z' {
                        p.task_drive += 1;
                        let cmd = NcpCmd::QueryDrive {
                            drive: p.task_drive,
                            size: p.remain,
                        };
                        self.send_ncp(link, id, p, cmd)
                    } else {
                        let era = p.era;
                        let mut tasks = Vec::with_capacity(p.apps.len());
                        for app in &p.apps {
                            let name = if era {
                                bytes_as_latin1(&app.name)
                            } else {
                                code::cp850_to_ansi(&app.name)
                                    .unwrap_or_else(|_| bytes_as_latin1(&app.name))
                            };
                            tasks.push(TaskDetail {
                                name,
                                args: task_args_to_host(era, &app.args),
                            });
                        }
                        Step::Done(p, Ok(UnifiedReply::Tasks { tasks }))
                    }
                }
                _ => Step::Done(p, Err(Error::BadParms)),
            },

            Phase::Stop => match reply {
                WireReply::Ncp(NcpReply::Done) | WireReply::Ncp(NcpReply::ProgRunning { .. })
                    if ticks_since(now, p.timeout) >= 0 =>
                {
                    // Ran out of patience; report the stop as issued.
                    Step::Done(p, Ok(UnifiedReply::Done))
                }
                WireReply::Ncp(NcpReply::Done) => {
                    // The stop request itself completed; probe for the
                    // task going away.
                    self.advance_timer(link, timer, now, id, p)
                }
                WireReply::Ncp(NcpReply::ProgRunning { running }) => {
                    if running {
                        p.delay = true;
                        timer.schedule(now.wrapping_add(STOP_DELAY), TimerToken::Unified(id));
                        Step::InFlight(p)
                    } else {
                        Step::Done(p, Ok(UnifiedReply::Done))
                    }
                }
                _ => Step::Done(p, Err(Error::BadParms)),
            },

            Phase::StartExec => {
                p.delay = true;
                p.phase = Phase::StartSettle;
                timer.schedule(now.wrapping_add(START_DELAY), TimerToken::Unified(id));
                Step::InFlight(p)
            }

            Phase::StartSettle => Step::InFlight(p),

            Phase::WTimeInfo => match reply {
                WireReply::Ncp(NcpReply::GetMachineInfo { info }) => {
                    let date = match &p.cmd {
                        UnifiedCmd::WTime { date } => *date,
                        _ => return Step::Done(p, Err(Error::BadUnifiedOp)),
                    };
                    // Replace only the home time, preserving the zone
                    // fields the device reported.
                    let mut time = info.time;
                    time.home_time = date.to_era();
                    p.phase = Phase::WTimeSet;
                    self.send_ncp(link, id, p, NcpCmd::SetTime { time })
                }
                _ => Step::Done(p, Err(Error::BadParms)),
            },

            Phase::WTimeSet => Step::Done(p, Ok(UnifiedReply::Done)),

            Phase::Single => {
                let result = decode_single(&p, reply);
                Step::Done(p, result)
            }
        }
    }

    fn advance_transfer(
        &mut self,
        link: &mut dyn WireLink,
        id: u64,
        mut p: Pending,
        reply: WireReply,
    ) -> Step {
        let max = if p.era {
            RFSV32_MAX_TRANSFER
        } else {
            RFSV16_MAX_TRANSFER
        };
        match p.cmd.clone() {
            UnifiedCmd::Read { handle, length } => {
                let chunk = match reply {
                    WireReply::Era(Rfsv32Reply::ReadFile { data }) => data,
                    WireReply::Sibo(Rfsv16Reply::FRead { data }) => data,
                    _ => return Step::Done(p, Err(Error::BadParms)),
                };
                let got = chunk.len();
                p.data.extend_from_slice(&chunk);
                if got != 0 && p.data.len() < length {
                    let next = max.min(length - p.data.len());
                    p.chunk = next;
                    if p.era {
                        self.send_era(
                            link,
                            id,
                            p,
                            Rfsv32Cmd::ReadFile {
                                handle: handle.0,
                                length: next,
                            },
                        )
                    } else {
                        self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::FRead {
                                handle: handle.0,
                                length: next,
                            },
                        )
                    }
                } else {
                    let data = std::mem::replace(&mut p.data, Vec::new());
                    Step::Done(p, Ok(UnifiedReply::Read { data }))
                }
            }

            UnifiedCmd::Write { handle, data } => {
                p.length += p.chunk;
                if p.length < data.len() {
                    let next = max.min(data.len() - p.length);
                    p.chunk = next;
                    let slice = data[p.length..p.length + next].to_vec();
                    if p.era {
                        self.send_era(
                            link,
                            id,
                            p,
                            Rfsv32Cmd::WriteFile {
                                handle: handle.0,
                                data: slice,
                            },
                        )
                    } else {
                        self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::FWrite {
                                handle: handle.0,
                                data: slice,
                            },
                        )
                    }
                } else {
                    Step::Done(p, Ok(UnifiedReply::Done))
                }
            }

            UnifiedCmd::Zero { handle, length } => {
                p.length += p.chunk;
                if p.length < length {
                    let next = max.min(length - p.length);
                    p.chunk = next;
                    self.ensure_scratch(next);
                    let slice = self.scratch[..next].to_vec();
                    if p.era {
                        self.send_era(
                            link,
                            id,
                            p,
                            Rfsv32Cmd::WriteFile {
                                handle: handle.0,
                                data: slice,
                            },
                        )
                    } else {
                        self.send_sibo(
                            link,
                            id,
                            p,
                            Rfsv16Cmd::FWrite {
                                handle: handle.0,
                                data: slice,
                            },
                        )
                    }
                } else {
                    Step::Done(p, Ok(UnifiedReply::Done))
                }
            }

            _ => Step::Done(p, Err(Error::BadParms)),
        }
    }
}

fn decode_era_volume(volume: &EraVolume) -> Result<DriveDetails> {
    Ok(DriveDetails {
        present: true,
        rom: volume.media_rom,
        name: era_leaf_to_host(&volume.name)?,
        free: volume.free,
        size: volume.size,
        id: 0,
    })
}

fn decode_sibo_device(device: &SiboDevice) -> Result<DriveDetails> {
    Ok(DriveDetails {
        present: true,
        rom: device.media_rom,
        name: sibo_leaf_to_host(&device.name)?,
        free: u64::from(device.free),
        size: u64::from(device.size),
        id: 0,
    })
}

fn decode_single(p: &Pending, reply: WireReply) -> Result<UnifiedReply> {
    match (&p.cmd, reply) {
        (UnifiedCmd::Info { .. }, WireReply::Era(Rfsv32Reply::RemoteEntry { entry })) => {
            Ok(UnifiedReply::Info {
                info: era_info_to_host(&entry)?,
            })
        }
        (UnifiedCmd::Info { path }, WireReply::Sibo(Rfsv16Reply::FInfo { entry })) => {
            let mut info = sibo_info_to_host(&entry)?;
            // The 16-bit wire folds case; preserve the leaf name the
            // caller asked about.
            if let Some(leaf) = path.rsplit(crate::fs::CHAR_SEPARATOR).next() {
                if !leaf.is_empty() && !leaf.starts_with(crate::fs::CHAR_DISC) {
                    info.name = leaf.to_string();
                }
            }
            Ok(UnifiedReply::Info { info })
        }
        (UnifiedCmd::Open { .. }, WireReply::Era(Rfsv32Reply::OpenFile { handle })) => {
            Ok(UnifiedReply::Open {
                handle: RemoteHandle(handle),
            })
        }
        (UnifiedCmd::Open { .. }, WireReply::Sibo(Rfsv16Reply::FOpen { handle })) => {
            Ok(UnifiedReply::Open {
                handle: RemoteHandle(handle),
            })
        }
        (UnifiedCmd::Power, WireReply::Ncp(NcpReply::GetMachineInfo { info })) => {
            Ok(UnifiedReply::Power {
                power: PowerDetails {
                    supply: info.supply,
                },
            })
        }
        (UnifiedCmd::RTime, WireReply::Ncp(NcpReply::GetMachineInfo { info })) => {
            Ok(UnifiedReply::RTime {
                date: DateStamp::from_era(info.time.home_time),
            })
        }
        (UnifiedCmd::Owner, WireReply::Ncp(NcpReply::GetOwnerInfo { info })) => {
            let text = if p.era {
                code::ansi_to_latin1(&bytes_as_latin1(&info))?
            } else {
                code::cp850_to_latin1(&info)?
            };
            Ok(UnifiedReply::Owner { info: text })
        }
        (UnifiedCmd::Detail { .. }, WireReply::Ncp(NcpReply::GetCmdLine { name, args })) => {
            Ok(UnifiedReply::Detail {
                task: TaskDetail {
                    name: task_args_to_host(p.era, &name),
                    args: task_args_to_host(p.era, &args),
                },
            })
        }
        (_, WireReply::Era(Rfsv32Reply::Done))
        | (_, WireReply::Sibo(Rfsv16Reply::Done))
        | (_, WireReply::Ncp(NcpReply::Done)) => Ok(UnifiedReply::Done),
        _ => Err(Error::BadParms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLink;
    use crate::wire::{EraEntry, SiboEntry};

    struct Rig {
        unified: Unified,
        link: MockLink,
        timer: TimerQueue,
        now: Ticks,
        done: Vec<(Client, Result<UnifiedReply>)>,
    }

    impl Rig {
        fn new(era: bool, sibo: bool, ncp: bool) -> Rig {
            let mut link = MockLink::new();
            link.era = era;
            link.sibo = sibo;
            link.ncp = ncp;
            let mut unified = Unified::new();
            unified.start();
            let mut timer = TimerQueue::new();
            timer.start();
            Rig {
                unified,
                link,
                timer,
                now: 0,
                done: Vec::new(),
            }
        }

        fn submit(&mut self, cmd: UnifiedCmd) {
            self.unified
                .submit(&mut self.link, self.now, cmd, Client::Foreground(1))
                .unwrap();
            self.pump();
        }

        /// Drain wire completions and due timers until quiescent.
        fn pump(&mut self) {
            loop {
                let mut progressed = false;
                while let Some((token, result)) = self.link.poll() {
                    self.unified
                        .on_wire(&mut self.link, &mut self.timer, self.now, token, result);
                    progressed = true;
                }
                for token in self.timer.expire(self.now) {
                    if let TimerToken::Unified(id) = token {
                        self.unified
                            .on_timer(&mut self.link, &mut self.timer, self.now, id);
                        progressed = true;
                    }
                }
                self.done.extend(self.unified.take_completed());
                if !progressed {
                    break;
                }
            }
        }

        fn advance(&mut self, cs: u32) {
            self.now = self.now.wrapping_add(cs);
            self.pump();
        }

        fn result(&mut self) -> Result<UnifiedReply> {
            assert_eq!(self.done.len(), 1, "expected one completion");
            self.done.remove(0).1
        }
    }

    fn era_entry(name: &str, size: u32) -> EraEntry {
        EraEntry {
            name: name.to_string(),
            size,
            attributes: EraAttr::empty(),
            modified: crate::fs::EraTime::default(),
            uid: crate::uid::UidTriple::default(),
        }
    }

    #[test]
    fn no_service_fails_immediately() {
        let mut rig = Rig::new(false, false, false);
        rig.submit(UnifiedCmd::Machine);
        assert_eq!(rig.result(), Err(Error::NoRemoteService));
    }

    #[test]
    fn task_control_commands_need_the_control_channel() {
        let mut rig = Rig::new(true, false, false);
        rig.submit(UnifiedCmd::Tasks { size: 4 });
        assert_eq!(rig.result(), Err(Error::RemoteNotSupported));
    }

    #[test]
    fn list_enumerates_and_sorts_case_insensitively() {
        let mut rig = Rig::new(true, false, true);
        rig.link.dirs.insert(
            "C:\\Docs".to_string(),
            vec![
                era_entry("zebra.txt", 1),
                era_entry("Apple.txt", 2),
                era_entry("mango.txt", 3),
            ],
        );
        rig.submit(UnifiedCmd::List {
            path: ":C.$.Docs".to_string(),
            size: 8,
        });
        let entries = match rig.result() {
            Ok(UnifiedReply::List { entries }) => entries,
            other => panic!("unexpected {:?}", other),
        };
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Apple/txt", "mango/txt", "zebra/txt"]);
        // The directory handle is always closed, even at the end of the
        // enumeration.
        assert!(rig.link.log.iter().any(|l| l.contains("CloseHandle")));
    }

    #[test]
    fn read_transfers_in_bounded_chunks() {
        let mut rig = Rig::new(true, false, true);
        rig.link.files.insert("C:\\big".to_string(), vec![7u8; 5000]);
        rig.submit(UnifiedCmd::Open {
            path: ":C.$.big".to_string(),
            mode: OpenMode::In,
        });
        let handle = match rig.result() {
            Ok(UnifiedReply::Open { handle }) => handle,
            other => panic!("unexpected {:?}", other),
        };
        rig.submit(UnifiedCmd::Read {
            handle,
            length: 5000,
        });
        let data = match rig.result() {
            Ok(UnifiedReply::Read { data }) => data,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(data.len(), 5000);
        let reads = rig
            .link
            .log
            .iter()
            .filter(|l| l.contains("ReadFile"))
            .count();
        assert_eq!(reads, 3); // 2048 + 2048 + 904
    }

    #[test]
    fn short_read_ends_the_transfer() {
        let mut rig = Rig::new(true, false, true);
        rig.link.files.insert("C:\\small".to_string(), vec![1u8; 3000]);
        rig.submit(UnifiedCmd::Open {
            path: ":C.$.small".to_string(),
            mode: OpenMode::In,
        });
        let handle = match rig.result() {
            Ok(UnifiedReply::Open { handle }) => handle,
            other => panic!("unexpected {:?}", other),
        };
        rig.submit(UnifiedCmd::Read {
            handle,
            length: 5000,
        });
        match rig.result() {
            Ok(UnifiedReply::Read { data }) => assert_eq!(data.len(), 3000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tasks_on_the_16_bit_wire_scan_every_drive() {
        let mut rig = Rig::new(false, true, true);
        rig.link.tasks_by_drive.insert(
            b'C',
            vec![
                NcpApp {
                    name: b"WORD".to_vec(),
                    args: b"C:\\LETTER.TXT".to_vec(),
                },
                NcpApp {
                    name: b"SHEET".to_vec(),
                    args: b"C:\\COSTS.SPR".to_vec(),
                },
            ],
        );
        rig.link.tasks_by_drive.insert(
            b'D',
            vec![NcpApp {
                name: b"AGENDA".to_vec(),
                args: b"D:\\DIARY.AGN".to_vec(),
            }],
        );
        rig.submit(UnifiedCmd::Tasks { size: 4 });
        let tasks = match rig.result() {
            Ok(UnifiedReply::Tasks { tasks }) => tasks,
            other => panic!("unexpected {:?}", other),
        };
        // Insertion order, not name order.
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].name, "WORD");
        assert_eq!(tasks[0].args, ":C.$.LETTER/TXT");
        assert_eq!(tasks[2].name, "AGENDA");
        let queries = rig
            .link
            .log
            .iter()
            .filter(|l| l.contains("QueryDrive"))
            .count();
        assert_eq!(queries, 26);
    }

    #[test]
    fn tasks_overflow_reports_too_many() {
        let mut rig = Rig::new(false, true, true);
        rig.link.tasks_by_drive.insert(
            b'C',
            (0..5)
                .map(|i| NcpApp {
                    name: format!("APP{}", i).into_bytes(),
                    args: Vec::new(),
                })
                .collect(),
        );
        rig.submit(UnifiedCmd::Tasks { size: 4 });
        assert_eq!(rig.result(), Err(Error::TooManyTasks));
    }

    #[test]
    fn stop_polls_until_the_task_is_gone() {
        let mut rig = Rig::new(true, false, true);
        rig.link.stop_polls.insert(b"WORD".to_vec(), 2);
        rig.submit(UnifiedCmd::Stop {
            name: "WORD".to_string(),
        });
        // Two liveness probes report running, each followed by a delay.
        assert!(rig.done.is_empty());
        rig.advance(60);
        assert!(rig.done.is_empty());
        rig.advance(60);
        assert!(matches!(rig.result(), Ok(UnifiedReply::Done)));
        assert_eq!(rig.link.stops, vec![b"WORD".to_vec()]);
    }

    #[test]
    fn start_settles_before_reporting_success() {
        let mut rig = Rig::new(true, false, true);
        rig.submit(UnifiedCmd::Start {
            name: "Word".to_string(),
            args: ":C.$.letter".to_string(),
            action: StartAction::Open,
        });
        assert!(rig.done.is_empty());
        rig.advance(499);
        assert!(rig.done.is_empty());
        rig.advance(2);
        assert!(matches!(rig.result(), Ok(UnifiedReply::Done)));
        // The action prefix quotes the argument.
        let (_, args) = rig.link.execs[0].clone();
        assert_eq!(args, b"O\"C:\\letter\"".to_vec());
    }

    #[test]
    fn drive_reads_volume_then_unique_id() {
        let mut rig = Rig::new(true, false, true);
        rig.submit(UnifiedCmd::Drive { drive: 'c' });
        let drive = match rig.result() {
            Ok(UnifiedReply::Drive { drive }) => drive,
            other => panic!("unexpected {:?}", other),
        };
        assert!(drive.present);
        assert_eq!(drive.name, "Internal");
        assert_eq!(drive.id, 0x1122_3344_5566_7788);
    }

    #[test]
    fn drive_without_task_control_reports_zero_id() {
        let mut rig = Rig::new(true, false, false);
        rig.submit(UnifiedCmd::Drive { drive: 'C' });
        let drive = match rig.result() {
            Ok(UnifiedReply::Drive { drive }) => drive,
            other => panic!("unexpected {:?}", other),
        };
        assert!(drive.present);
        assert_eq!(drive.id, 0);
    }

    #[test]
    fn machine_reads_type_then_info() {
        let mut rig = Rig::new(true, false, true);
        rig.link.machine_type = crate::wire::MACHINE_TYPE_S5;
        rig.link.machine_info.machine_uid = 42;
        rig.submit(UnifiedCmd::Machine);
        let machine = match rig.result() {
            Ok(UnifiedReply::Machine { machine }) => machine,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(machine.id, 42);
        assert_eq!(machine.name, "Psion Series 5 or Geofox-One");
    }

    #[test]
    fn info_on_sibo_preserves_the_requested_leaf() {
        let mut rig = Rig::new(false, true, true);
        // The mock only answers directory and file commands it knows, so
        // drive the decode path directly.
        let pending = Pending::new(
            UnifiedCmd::Info {
                path: ":C.$.Docs.Letter/Txt".to_string(),
            },
            Client::Foreground(1),
            false,
        );
        let reply = decode_single(
            &pending,
            WireReply::Sibo(Rfsv16Reply::FInfo {
                entry: SiboEntry {
                    name: b"LETTER.TXT".to_vec(),
                    size: 10,
                    attributes: SiboAttr::WRITEABLE,
                    modified: 0,
                },
            }),
        )
        .unwrap();
        match reply {
            UnifiedReply::Info { info } => assert_eq!(info.name, "Letter/Txt"),
            other => panic!("unexpected {:?}", other),
        }
        let _ = rig;
    }

    #[test]
    fn load_exec_synthesis() {
        let date = DateStamp {
            high: 0x4f,
            low: 0x1234_5678,
        };
        let (load, exec) = load_exec(0x158, date);
        assert_eq!(load, 0xfff1_584f);
        assert_eq!(exec, 0x1234_5678);

        // Both sentinel dates collapse to the dead pair.
        assert_eq!(load_exec(0x158, DEAD16), (0xdead_dead, 0xdead_dead));
        assert_eq!(load_exec(0xffd, DEAD32), (0xdead_dead, 0xdead_dead));

        // Injectivity away from the sentinels: distinct types and dates
        // give distinct pairs.
        let a = load_exec(0x158, DateStamp { high: 1, low: 2 });
        let b = load_exec(0x159, DateStamp { high: 1, low: 2 });
        let c = load_exec(0x158, DateStamp { high: 1, low: 3 });
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn validate_round_trips_per_variant() {
        let mut rig = Rig::new(true, false, false);
        let ok = rig
            .unified
            .validate(&rig.link, ":C.$.Documents.letter/txt")
            .unwrap();
        assert_eq!(ok, ":C.$.Documents.letter/txt");
        assert!(rig
            .unified
            .validate(&rig.link, ":C.$.bad\"name")
            .is_err());

        let mut rig16 = Rig::new(false, true, false);
        let folded = rig16.unified.validate(&rig16.link, ":C.$.docs").unwrap();
        assert_eq!(folded, ":C.$.DOCS");
    }
}
