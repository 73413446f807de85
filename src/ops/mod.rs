//! Asynchronous remote operations: a cooperative, hierarchical scheduler
//! that drives multi-step remote procedures as composable state machines.
//! Each operation walks the same five stages (initialise, process, abort,
//! pre-finalise, post-finalise); suspends by leaving a sub-request, a
//! child operation, a response prompt or a pause outstanding; and is
//! re-entered by the engine pump when the corresponding completion
//! arrives.

mod backup;
mod install;
mod progress;
mod restart;
mod shutdown;
mod tarcomp;
mod transfer;

use crate::backtree::BackTree;
use crate::cache::{CacheCmd, CacheCmdKind, CacheReply, CacheService};
use crate::clock::{ticks_since, Clock, Ticks};
use crate::err::{Error, Result};
use crate::frac::{Frac, FRAC_ZERO};
use crate::fs::{FsInfo, RemoteHandle, CHAR_DISC, FS_NAME};
use crate::hostfs::{HostFs, HostHandle};
use crate::idle::IdleTracker;
use crate::pollword::{ChangeMask, PollwordBus};
use crate::sysvar::{SysVarStore, VAR_NEXT_HANDLE};
use crate::tar::{TarHandle, TarService};
use crate::timer::{TimerQueue, TimerToken};
use crate::unified::{Client, TaskDetail, Unified, UnifiedCmd, UnifiedCmdKind, UnifiedReply};
use crate::wildcard;
use crate::wire::WireLink;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Handle identifying a live asynchronous operation. Handles are unique
/// for the lifetime of the process and never recycled.
pub type AsyncHandle = u32;

/// The reserved handle that is never allocated.
pub const ASYNC_INVALID: AsyncHandle = 0;

// Buffer growth starting points.
const MIN_TASKS: usize = 4;
const MIN_FILES: usize = 4;
/// Block size for file transfers.
const COPY_SIZE: usize = 4096;

// Delays between successive suboperations (centi-seconds).
const TAR_DELAY: u32 = 1;
const CLOSE_DELAY: u32 = 100;

// Weighting for the progress units of different work.
const FILE_WEIGHT: u32 = 2 * 1024 * 10;
const FILE_SIZE_WEIGHT: u32 = 10;
const TAR_WEIGHT: u32 = 1024;
const TAR_SIZE_WEIGHT: u32 = 1;

/// The kind of an operation with its parameter block. The backup-list,
/// backup-prev, backup-copy, tar-complete and find kinds are spawned
/// internally by composite operations but may also be started directly.
#[derive(Clone, Debug)]
pub enum OpKind {
    /// Stop every task matching a pattern, logging what was stopped.
    Shutdown {
        path: String,
        pattern: String,
        append: bool,
    },
    /// Restart the tasks recorded in a log file.
    Restart { path: String, remove: bool },
    /// Copy a remote object to a host file or directory.
    Read { src: String, dest: String },
    /// Copy a host object to the remote device.
    Write {
        src: String,
        dest: String,
        remove: bool,
    },
    /// Back up a remote directory tree into a tar archive, reusing
    /// unchanged entries from a previous backup.
    Backup {
        src: String,
        dest: String,
        prev: String,
        scrap: String,
        temp: String,
    },
    /// Write a file to the remote device and start it.
    WriteStart {
        src: String,
        dest: String,
        exe: String,
        remove: bool,
    },
    /// Install a package, installing the installer first if absent.
    Install {
        pckg_src: String,
        pckg_dest: String,
        inst_exe: String,
        inst_src: String,
        inst_dest: String,
        inst_remove: bool,
        pckg_remove: bool,
    },
    /// Walk a remote directory tree into a backup index.
    BackupList {
        tree: BackTree,
        src: String,
        sub: String,
    },
    /// Stream the previous backup, diffing against the index.
    BackupPrev {
        tree: BackTree,
        src: String,
        dest: String,
        prev: String,
        scrap: String,
    },
    /// Read every still-live indexed file into the new backup.
    BackupCopy {
        tree: BackTree,
        src: String,
        dest: String,
        temp: String,
    },
    /// Drive a pending archive transfer to completion.
    TarComplete {
        handle: TarHandle,
        status: Status,
        detail: String,
    },
    /// Find an object across drives; `drive` reports where it was found,
    /// or the wildcard if nowhere.
    Find { path: String, drive: char },
}

/// Compact operation code used for stage dispatch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum OpCode {
    Shutdown,
    Restart,
    Read,
    Write,
    Backup,
    WriteStart,
    Install,
    BackupList,
    BackupPrev,
    BackupCopy,
    TarComplete,
    Find,
}

impl OpKind {
    fn code(&self) -> OpCode {
        match self {
            OpKind::Shutdown { .. } => OpCode::Shutdown,
            OpKind::Restart { .. } => OpCode::Restart,
            OpKind::Read { .. } => OpCode::Read,
            OpKind::Write { .. } => OpCode::Write,
            OpKind::Backup { .. } => OpCode::Backup,
            OpKind::WriteStart { .. } => OpCode::WriteStart,
            OpKind::Install { .. } => OpCode::Install,
            OpKind::BackupList { .. } => OpCode::BackupList,
            OpKind::BackupPrev { .. } => OpCode::BackupPrev,
            OpKind::BackupCopy { .. } => OpCode::BackupCopy,
            OpKind::TarComplete { .. } => OpCode::TarComplete,
            OpKind::Find { .. } => OpCode::Find,
        }
    }
}

/// Status of an operation. Only the four wait statuses accept an
/// external response; success, error and aborted are terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    Busy,
    Paused,
    Delegate,
    WaitCopy,
    WaitRestart,
    WaitNewer,
    WaitRead,
    Success,
    Error,
    Aborted,
    ProgList,
    ProgDetail,
    ProgClose,
    ProgOpen,
    FileOpen,
    FileClose,
    FileRead,
    FileMkDir,
    FileDelete,
    FileWrite,
    CatRead,
    CatWrite,
    TarKeep,
    TarScrap,
    TarSkip,
    TarAdd,
    TarExtract,
}

impl Status {
    pub fn is_done(self) -> bool {
        matches!(self, Status::Success | Status::Error | Status::Aborted)
    }

    fn is_idle(self) -> bool {
        self == Status::Busy
    }

    pub fn is_paused(self) -> bool {
        self == Status::Paused
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Status::WaitCopy | Status::WaitRestart | Status::WaitNewer | Status::WaitRead
        )
    }
}

/// Responses that answer a wait status.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Response {
    Continue,
    Copy,
    Skip,
    Retry,
    /// Proceed and suppress further prompts for this operation tree.
    Quiet,
}

/// The stages of processing an operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Stage {
    Initialise,
    Process,
    Abort,
    PreFinalise,
    PostFinalise,
}

/// Progress snapshot returned by `Engine::progress`.
#[derive(Clone, Debug)]
pub struct OpProgress {
    pub status: Status,
    pub description: String,
    pub detail: Option<String>,
    pub error: Option<String>,
    /// Centi-seconds of work performed so far.
    pub taken: u32,
    /// Smoothed estimate of centi-seconds remaining; zero while the
    /// estimate is still unreliable or once the operation is done.
    pub remain: u32,
}

pub(crate) struct OpData {
    handle: AsyncHandle,
    kind: OpKind,
    status: Status,
    initialised: bool,
    finalised: bool,
    abort: bool,
    pause: bool,
    threaded: bool,
    recurse: bool,
    suspend: bool,
    suspended: bool,
    response: Response,
    quiet: bool,
    detail: String,
    /// The active error, consumed at the next stage entry.
    err: Option<Error>,
    /// Error parked while a teardown sub-request runs.
    stored_err: Option<Error>,
    /// Error displayed alongside a wait prompt.
    wait_err: Option<Error>,
    time_acc: u32,
    time_done: u32,
    time_start: Ticks,
    time_running: bool,
    frac_done: Frac,
    frac_step: Frac,
    pretty: progress::Pretty,
    parent: Option<AsyncHandle>,
    child: Option<AsyncHandle>,
    // Per-kind working state.
    index: u32,
    num: u32,
    info: FsInfo,
    host: Option<HostHandle>,
    remote: Option<RemoteHandle>,
    tree: Option<BackTree>,
    dest_tar: Option<TarHandle>,
    prev_tar: Option<TarHandle>,
    scrap_tar: Option<TarHandle>,
    last_cache: Option<CacheCmdKind>,
    cache_reply: Option<CacheReply>,
    last_unified: Option<UnifiedCmdKind>,
    unified_reply: Option<UnifiedReply>,
    tasks: Vec<TaskDetail>,
    tasks_size: usize,
    entries: Vec<FsInfo>,
    enum_size: usize,
    restart_list: Vec<(String, String)>,
    current_task: (String, String),
    cursor: usize,
    existing: crate::fs::ObjectType,
    xfer_offset: u32,
    xfer_len: usize,
}

impl OpData {
    fn new(handle: AsyncHandle, kind: OpKind, parent: Option<AsyncHandle>, quiet: bool) -> OpData {
        OpData {
            handle,
            kind,
            status: Status::Busy,
            initialised: false,
            finalised: false,
            abort: false,
            pause: false,
            threaded: false,
            recurse: false,
            suspend: false,
            suspended: false,
            response: Response::Continue,
            quiet,
            detail: String::new(),
            err: None,
            stored_err: None,
            wait_err: None,
            time_acc: 0,
            time_done: 0,
            time_start: 0,
            time_running: false,
            frac_done: FRAC_ZERO,
            frac_step: FRAC_ZERO,
            pretty: progress::Pretty::default(),
            parent,
            child: None,
            index: 0,
            num: 0,
            info: FsInfo::default(),
            host: None,
            remote: None,
            tree: None,
            dest_tar: None,
            prev_tar: None,
            scrap_tar: None,
            last_cache: None,
            cache_reply: None,
            last_unified: None,
            unified_reply: None,
            tasks: Vec::new(),
            tasks_size: 0,
            entries: Vec::new(),
            enum_size: 0,
            restart_list: Vec::new(),
            current_task: (String::new(), String::new()),
            cursor: 0,
            existing: crate::fs::ObjectType::NotFound,
            xfer_offset: 0,
            xfer_len: 0,
        }
    }

    /// Park the active error (or the supplied one) so a teardown
    /// sub-request can run; an already-parked error is never displaced.
    fn store_error(&mut self, err: Option<Error>) {
        if self.stored_err.is_some() {
            self.err = None;
        } else if let Some(e) = self.err.take() {
            self.stored_err = Some(e);
        } else if let Some(e) = err {
            self.stored_err = Some(e);
        }
    }

    /// Surface a parked error, which takes precedence over the error of
    /// the teardown that just completed.
    fn restore_error(&mut self, err: Option<Error>) -> Option<Error> {
        match self.stored_err.take() {
            Some(stored) => Some(stored),
            None => err,
        }
    }
}

/// Generate a tidied version of an application name: strip any process
/// number, trailing separator and application extension, then keep the
/// leaf.
fn tidy_app(src: &str) -> String {
    let mut path = src.to_string();
    if let Some(pos) = path.rfind('$') {
        if path[pos + 1..]
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_digit())
        {
            path.truncate(pos);
        }
    }
    if path.ends_with(crate::fs::CHAR_SEPARATOR) {
        path.pop();
    }
    if path.len() >= 4 && wildcard::matches("/app", &path[path.len() - 4..]) {
        let len = path.len() - 4;
        path.truncate(len);
    }
    match path.rfind(crate::fs::CHAR_SEPARATOR) {
        Some(pos) if pos + 1 < path.len() => path[pos + 1..].to_string(),
        _ => path,
    }
}

/// Generate a tidied version of an arguments string, prefixing bare
/// remote paths with the filing system name.
fn tidy_args(src: &str) -> String {
    if src.starts_with(CHAR_DISC) {
        format!("{}{}", FS_NAME, src)
    } else {
        src.to_string()
    }
}

/// A completion delivered to an operation.
enum Delivery {
    Cache(CacheReply),
    Unified(UnifiedReply),
    Timer,
    Child,
    Failed(Error),
}

/// The engine owning all link-layer state: the dispatcher, timer queue,
/// notification bus, idle tracker and the table of live operations.
pub struct Engine {
    clock: Box<dyn Clock>,
    link: Box<dyn WireLink>,
    cache: Box<dyn CacheService>,
    tar: Box<dyn TarService>,
    hostfs: Box<dyn HostFs>,
    sysvar: Box<dyn SysVarStore>,
    pub(crate) unified: Unified,
    timer: TimerQueue,
    pollword: PollwordBus,
    idle: IdleTracker,
    ops: HashMap<AsyncHandle, OpData>,
    /// Flat list of live operations in creation order.
    order: Vec<AsyncHandle>,
    /// While non-zero, background cache updates are suspended.
    cache_disable: u32,
    fore_results: HashMap<u32, Result<UnifiedReply>>,
    next_fore: u32,
}

impl Engine {
    pub fn new(
        clock: Box<dyn Clock>,
        link: Box<dyn WireLink>,
        cache: Box<dyn CacheService>,
        tar: Box<dyn TarService>,
        hostfs: Box<dyn HostFs>,
        sysvar: Box<dyn SysVarStore>,
    ) -> Engine {
        let mut unified = Unified::new();
        let mut timer = TimerQueue::new();
        timer.start();
        unified.start();
        Engine {
            clock,
            link,
            cache,
            tar,
            hostfs,
            sysvar,
            unified,
            timer,
            pollword: PollwordBus::new(),
            idle: IdleTracker::new(),
            ops: HashMap::new(),
            order: Vec::new(),
            cache_disable: 0,
            fore_results: HashMap::new(),
            next_fore: 0,
        }
    }

    fn now(&self) -> Ticks {
        self.clock.now()
    }

    fn op(&self, handle: AsyncHandle) -> Result<&OpData> {
        self.ops.get(&handle).ok_or(Error::BadAsyncHandle)
    }

    fn op_mut(&mut self, handle: AsyncHandle) -> Result<&mut OpData> {
        self.ops.get_mut(&handle).ok_or(Error::BadAsyncHandle)
    }

    /// The notification bus, for client registration.
    pub fn pollword(&mut self) -> &mut PollwordBus {
        &mut self.pollword
    }

    /// The idle tracker, for disconnect and throttle policy.
    pub fn idle(&self) -> &IdleTracker {
        &self.idle
    }

    /// Are background cache updates currently suspended.
    pub fn cache_suspended(&self) -> bool {
        self.cache_disable != 0
    }

    /// Number of live operations (including finished ones whose parent
    /// has not yet consumed their result).
    pub fn live_operations(&self) -> usize {
        self.ops.len()
    }

    /// Check that the flat operation list and the parent/child forest
    /// agree; used by tests and debug assertions.
    pub fn tree_consistent(&self) -> bool {
        if self.order.len() != self.ops.len() {
            return false;
        }
        for (h, op) in &self.ops {
            if !self.order.contains(h) {
                return false;
            }
            if let Some(parent) = op.parent {
                match self.ops.get(&parent) {
                    Some(p) if p.child == Some(*h) => (),
                    _ => return false,
                }
            }
            if let Some(child) = op.child {
                match self.ops.get(&child) {
                    Some(c) if c.parent == Some(*h) || c.parent.is_none() => (),
                    _ => return false,
                }
            }
        }
        true
    }

    // ----- public operation API -----

    /// Start a root operation. At least the initialise stage runs before
    /// control returns.
    pub fn start(&mut self, kind: OpKind) -> Result<AsyncHandle> {
        debug!("async start {:?}", kind.code());
        self.new_op(None, kind)
    }

    /// Request abort of an operation and all of its descendants.
    pub fn end(&mut self, handle: AsyncHandle) -> Result<()> {
        debug!("async end handle={}", handle);
        self.op(handle)?;
        self.abort_op(handle)
    }

    /// Read the progress of an operation: status and descriptions follow
    /// the most informative still-running descendant when the operation
    /// delegates, timings always describe the whole tree.
    pub fn progress(&mut self, handle: AsyncHandle) -> Result<OpProgress> {
        self.op(handle)?;
        let now = self.now();
        let (taken, mut remain) = self.compute_time(handle, now);
        {
            let op = self.op_mut(handle)?;
            progress::pretty_time(op, taken, &mut remain);
        }
        let root_done = self.op(handle)?.status.is_done();
        if root_done {
            remain = 0;
        }
        let mut h = handle;
        if !root_done {
            loop {
                let op = self.op(h)?;
                match op.child {
                    Some(child) if op.recurse && !self.op(child)?.status.is_done() => h = child,
                    _ => break,
                }
            }
        }
        let op = self.op(h)?;
        let (description, detail, error) = describe(op);
        Ok(OpProgress {
            status: op.status,
            description,
            detail,
            error,
            taken,
            remain,
        })
    }

    /// Answer a wait prompt on the operation, or on its deepest waiting
    /// descendant.
    pub fn respond(&mut self, handle: AsyncHandle, response: Response) -> Result<()> {
        debug!("async respond handle={} response={:?}", handle, response);
        let mut h = handle;
        self.op(h)?;
        loop {
            let op = self.op(h)?;
            if op.status.is_waiting() {
                break;
            }
            match op.child {
                Some(child) => h = child,
                None => return Ok(()),
            }
        }
        let op = self.op_mut(h)?;
        op.response = response;
        op.status = Status::Busy;
        self.process(h)
    }

    /// Flag the operation and all descendants to pause at the next stage
    /// boundary.
    pub fn pause(&mut self, handle: AsyncHandle) -> Result<()> {
        debug!("async pause handle={}", handle);
        let mut h = Some(handle);
        self.op(handle)?;
        while let Some(current) = h {
            let op = self.op_mut(current)?;
            op.pause = true;
            h = op.child;
        }
        Ok(())
    }

    /// Clear the pause flags and resume the paused descendant, if any.
    pub fn resume(&mut self, handle: AsyncHandle) -> Result<()> {
        debug!("async resume handle={}", handle);
        let mut h = Some(handle);
        self.op(handle)?;
        while let Some(current) = h {
            let op = self.op_mut(current)?;
            if op.status.is_paused() {
                break;
            }
            op.pause = false;
            h = op.child;
        }
        if let Some(current) = h {
            let op = self.op_mut(current)?;
            op.pause = false;
            op.status = Status::Busy;
            self.process(current)?;
        }
        Ok(())
    }

    /// Render the state of every root operation and its suboperations.
    pub fn status_report(&self) -> String {
        let mut out = String::new();
        for &h in &self.order {
            if let Some(op) = self.ops.get(&h) {
                if op.parent.is_none() {
                    self.status_recurse(&mut out, op, 0);
                }
            }
        }
        out
    }

    fn status_recurse(&self, out: &mut String, op: &OpData, level: u32) {
        if level == 0 {
            let _ = write!(out, "Asynchronous operation");
        } else {
            let _ = write!(out, "... Using suboperation");
        }
        let _ = write!(out, " {:010} ", op.handle);
        let _ = write!(out, "{}", summarise(&op.kind));
        let (description, detail, error) = describe(op);
        let _ = write!(out, " ({}", description);
        if let Some(detail) = detail {
            let _ = write!(out, " - {}", detail);
        }
        if let Some(error) = error {
            let _ = write!(out, " / {}", error);
        }
        if !op.initialised {
            let _ = write!(out, ", not initialised");
        }
        if op.finalised {
            let _ = write!(out, ", finalised");
        }
        let _ = writeln!(out, ").");
        if let Some(child) = op.child {
            if let Some(child_op) = self.ops.get(&child) {
                if child_op.parent == Some(op.handle) {
                    self.status_recurse(out, child_op, level + 1);
                }
            }
        }
    }

    // ----- the pump -----

    /// Progress outstanding work: expire timers, drain the wire link and
    /// the cache, and re-enter every operation whose completion arrived.
    /// Call from the host's cooperative loop.
    pub fn poll(&mut self) -> Result<()> {
        loop {
            let now = self.now();
            if self.unified.update(&*self.link) {
                self.pollword.update(ChangeMask::LINK_STATE);
            }

            let fired = self.timer.expire(now);
            let mut wire = Vec::new();
            while let Some(completion) = self.link.poll() {
                wire.push(completion);
            }
            let mut cache_done = Vec::new();
            while let Some(completion) = self.cache.poll() {
                cache_done.push(completion);
            }
            let unified_done = self.unified.take_completed();

            if fired.is_empty() && wire.is_empty() && cache_done.is_empty() && unified_done.is_empty()
            {
                return Ok(());
            }

            for token in fired {
                match token {
                    TimerToken::Unified(id) => {
                        self.unified
                            .on_timer(&mut *self.link, &mut self.timer, now, id)
                    }
                    TimerToken::AsyncOp(handle) => self.deliver(handle, Delivery::Timer),
                    TimerToken::Foreground(slot) => {
                        self.fore_results.insert(slot, Ok(UnifiedReply::Done));
                    }
                }
            }
            for (token, result) in wire {
                self.unified
                    .on_wire(&mut *self.link, &mut self.timer, now, token, result);
            }
            for (client, result) in unified_done {
                match client {
                    Client::AsyncOp(handle) => {
                        let delivery = match result {
                            Ok(reply) => Delivery::Unified(reply),
                            Err(err) => Delivery::Failed(err),
                        };
                        self.deliver(handle, delivery);
                    }
                    Client::Foreground(slot) => {
                        self.fore_results.insert(slot, result);
                    }
                }
            }
            for (token, result) in cache_done {
                let delivery = match result {
                    Ok(reply) => Delivery::Cache(reply),
                    Err(err) => Delivery::Failed(err),
                };
                self.deliver(token as AsyncHandle, delivery);
            }
        }
    }

    /// Submit a unified command and spin the pump until it completes,
    /// optionally honouring the host escape signal.
    pub fn unified_blocking(
        &mut self,
        cmd: UnifiedCmd,
        escape: bool,
    ) -> Result<UnifiedReply> {
        self.next_fore += 1;
        let slot = self.next_fore;
        let now = self.now();
        self.unified
            .submit(&mut *self.link, now, cmd, Client::Foreground(slot))?;
        loop {
            self.poll()?;
            if let Some(result) = self.fore_results.remove(&slot) {
                return result;
            }
            if escape && self.link.escape_pending() {
                return Err(Error::Escape);
            }
        }
    }

    /// Wait for the given number of centi-seconds by spinning the pump.
    pub fn delay_blocking(&mut self, delay: u32, escape: bool) -> Result<()> {
        self.next_fore += 1;
        let slot = self.next_fore;
        let deadline = self.now().wrapping_add(delay);
        self.timer.schedule(deadline, TimerToken::Foreground(slot));
        loop {
            self.poll()?;
            if self.fore_results.remove(&slot).is_some() {
                return Ok(());
            }
            if escape && self.link.escape_pending() {
                return Err(Error::Escape);
            }
        }
    }

    /// Validate a name through the connected variant's round trip.
    pub fn validate_path(&mut self, path: &str) -> Result<String> {
        self.unified.validate(&*self.link, path)
    }

    /// Render the connection state of the dispatcher layer.
    pub fn link_status_report(&self) -> String {
        self.unified.status_report()
    }

    /// Tear the engine down. Fails while notification clients remain
    /// registered. Every outstanding operation is aborted and the pump
    /// is driven once to let teardown sub-requests land; operations
    /// whose collaborators never answer stay in the table and are
    /// dropped with it.
    pub fn finalise(&mut self) -> Result<()> {
        self.pollword.pre_finalise()?;
        let all: Vec<AsyncHandle> = self.order.clone();
        for handle in all {
            if self.ops.contains_key(&handle) {
                self.abort_op(handle)?;
            }
        }
        self.poll()?;
        self.unified.end();
        self.timer.end();
        self.poll()
    }

    // ----- completion delivery -----

    fn deliver(&mut self, handle: AsyncHandle, delivery: Delivery) {
        let op = match self.ops.get_mut(&handle) {
            Some(op) => op,
            None => {
                debug!("completion for unknown operation {}", handle);
                return;
            }
        };
        // Ignore the result if not expected: nothing is outstanding for
        // a finished or idle operation.
        if op.status.is_done() || op.status.is_idle() {
            return;
        }
        match delivery {
            Delivery::Cache(reply) => op.cache_reply = Some(reply),
            Delivery::Unified(reply) => op.unified_reply = Some(reply),
            Delivery::Timer | Delivery::Child => (),
            Delivery::Failed(err) => {
                if op.err.is_none() {
                    op.err = Some(err);
                }
            }
        }
        op.status = Status::Busy;
        if let Err(err) = self.process(handle) {
            warn!("asynchronous operation {} scheduler error: {}", handle, err);
        }
    }

    // ----- scheduler -----

    /// Progress the specified operation as far as possible. Invocations
    /// while the operation is already being processed are recorded by
    /// the caller having mutated status, and picked up when the outer
    /// frame loops.
    fn process(&mut self, handle: AsyncHandle) -> Result<()> {
        {
            let op = self.op_mut(handle)?;
            if op.threaded {
                debug!("async process handle={} (threaded)", handle);
                return Ok(());
            }
            op.threaded = true;
        }
        let result = self.process_inner(handle);
        if let Some(op) = self.ops.get_mut(&handle) {
            op.threaded = false;
        }
        result
    }

    fn process_inner(&mut self, handle: AsyncHandle) -> Result<()> {
        debug!("async process handle={}", handle);

        // Keep processing until no more actions are possible.
        loop {
            let op = self.op(handle)?;
            if !op.status.is_idle() {
                break;
            }
            // Pause at the stage boundary.
            if op.pause {
                self.pollword.update(ChangeMask::ASYNC_STATE);
                self.op_mut(handle)?.status = Status::Paused;
                self.update_suspend(handle)?;
                self.stop_time(handle)?;
                return Ok(());
            }
            let stage = if !self.op(handle)?.initialised {
                self.idle.start();
                self.op_mut(handle)?.initialised = true;
                Stage::Initialise
            } else if self.op(handle)?.abort {
                Stage::Abort
            } else {
                Stage::Process
            };
            self.process_op(handle, stage)?;
        }

        // Special case if just finished.
        let (done, finalised) = {
            let op = self.op(handle)?;
            (op.status.is_done(), op.finalised)
        };
        if done && !finalised {
            let now = self.now();
            self.idle.end(now);
            self.op_mut(handle)?.finalised = true;
            self.process_op(handle, Stage::PreFinalise)?;

            // Notify any parent, folding this operation's time into it.
            let (parent, time_acc, child_err) = {
                let op = self.op(handle)?;
                (op.parent, op.time_acc, op.err.clone())
            };
            if let Some(parent) = parent {
                if let Ok(parent_op) = self.op_mut(parent) {
                    parent_op.time_acc += time_acc;
                }
                let delivery = match child_err {
                    Some(err) => Delivery::Failed(err),
                    None => Delivery::Child,
                };
                self.deliver(parent, delivery);
            }
        }

        // Delete the operation if aborted and done.
        let gone = {
            let op = self.op(handle)?;
            op.abort && op.status.is_done()
        };
        if gone {
            self.process_op(handle, Stage::PostFinalise)?;
            self.free(handle);
        }
        Ok(())
    }

    /// Progress the operation by a single stage.
    fn process_op(&mut self, handle: AsyncHandle, stage: Stage) -> Result<()> {
        debug!("async process op handle={} stage={:?}", handle, stage);

        self.pollword.update(ChangeMask::ASYNC_STATE);
        if self.op(handle)?.status.is_done() {
            self.pollword.update(ChangeMask::ASYNC_END);
        }

        self.start_time(handle)?;

        // Activate any error recorded by a completion.
        let err = self.op_mut(handle)?.err.take();

        let code = self.op(handle)?.kind.code();
        let stage_result = match code {
            OpCode::Shutdown => shutdown::stage(self, handle, err, stage),
            OpCode::Restart => restart::stage(self, handle, err, stage),
            OpCode::Read => transfer::read_stage(self, handle, err, stage),
            OpCode::Write => transfer::write_stage(self, handle, err, stage),
            OpCode::Backup => backup::backup_stage(self, handle, err, stage),
            OpCode::WriteStart => install::write_start_stage(self, handle, err, stage),
            OpCode::Install => install::install_stage(self, handle, err, stage),
            OpCode::BackupList => backup::list_stage(self, handle, err, stage),
            OpCode::BackupPrev => backup::prev_stage(self, handle, err, stage),
            OpCode::BackupCopy => backup::copy_stage(self, handle, err, stage),
            OpCode::TarComplete => tarcomp::stage(self, handle, err, stage),
            OpCode::Find => install::find_stage(self, handle, err, stage),
        };

        // Record any error produced; errors never propagate out of the
        // scheduler.
        if let Err(err) = stage_result {
            debug!("async op {} error: {}", handle, err);
            let op = self.op_mut(handle)?;
            op.status = Status::Error;
            op.err = Some(err);
        }

        self.update_suspend(handle)?;

        let stop = {
            let op = self.op(handle)?;
            op.status.is_done()
                || op.status.is_paused()
                || op.status.is_waiting()
                || op.child.is_some()
        };
        if stop {
            self.stop_time(handle)?;
        }
        Ok(())
    }

    /// Suspend or resume background cache updates for this operation.
    fn update_suspend(&mut self, handle: AsyncHandle) -> Result<()> {
        let (suspend, suspended) = {
            let op = self.op(handle)?;
            let suspend = op.suspend
                && !op.status.is_done()
                && !op.status.is_paused()
                && !op.status.is_waiting()
                && op.child.is_none();
            (suspend, op.suspended)
        };
        if suspend != suspended {
            if suspend {
                self.cache_disable += 1;
            } else {
                self.cache_disable -= 1;
            }
            self.op_mut(handle)?.suspended = suspend;
        }
        Ok(())
    }

    // ----- creation, abort, destruction -----

    /// Create a new operation, optionally as the child of a parent, and
    /// start processing it. An existing child of the parent is aborted
    /// first.
    fn new_op(&mut self, parent: Option<AsyncHandle>, kind: OpKind) -> Result<AsyncHandle> {
        if let Some(parent) = parent {
            if let Some(existing) = self.op(parent)?.child {
                self.abort_op(existing)?;
            }
        }

        // Allocate a unique handle, skipping the reserved value even
        // across wrap-around, and persist the last allocation.
        let last = self
            .sysvar
            .read_int(VAR_NEXT_HANDLE)
            .unwrap_or(i64::from(ASYNC_INVALID));
        let mut handle = (last as u32).wrapping_add(1);
        if handle == ASYNC_INVALID {
            handle = handle.wrapping_add(1);
        }
        self.sysvar.write_int(VAR_NEXT_HANDLE, i64::from(handle))?;

        let quiet = match parent {
            Some(parent) => self.op(parent)?.quiet,
            None => false,
        };
        debug!("async new handle={} parent={:?}", handle, parent);
        let op = OpData::new(handle, kind, parent, quiet);
        self.ops.insert(handle, op);
        self.order.push(handle);
        if let Some(parent) = parent {
            self.op_mut(parent)?.child = Some(handle);
        }

        self.process(handle)?;
        Ok(handle)
    }

    /// Abort an operation: flag it, swallow any pending prompt, detach
    /// it from its parent, abort its children, then let the regular
    /// stage machinery clean up.
    fn abort_op(&mut self, handle: AsyncHandle) -> Result<()> {
        debug!("async abort handle={}", handle);
        {
            let op = self.op_mut(handle)?;
            op.abort = true;
            op.pause = false;
            if op.status.is_paused() {
                op.status = Status::Busy;
            }
            if op.status.is_waiting() {
                op.status = Status::Busy;
                op.response = Response::Continue;
            }
        }
        if let Some(parent) = self.op_mut(handle)?.parent.take() {
            if let Ok(parent_op) = self.op_mut(parent) {
                parent_op.child = None;
            }
        }
        if let Some(child) = self.op(handle)?.child {
            let op = self.op_mut(handle)?;
            if !op.status.is_done() {
                op.status = Status::Busy;
            }
            self.abort_op(child)?;
        }
        self.process(handle)
    }

    /// Destroy an operation record.
    fn free(&mut self, handle: AsyncHandle) {
        debug!("async free handle={}", handle);
        self.ops.remove(&handle);
        self.order.retain(|&h| h != handle);
    }

    // ----- timing -----

    fn start_time(&mut self, handle: AsyncHandle) -> Result<()> {
        let now = self.now();
        let op = self.op_mut(handle)?;
        if !op.time_running {
            op.time_start = now;
            op.time_running = true;
        }
        Ok(())
    }

    fn stop_time(&mut self, handle: AsyncHandle) -> Result<()> {
        let now = self.now();
        let op = self.op_mut(handle)?;
        if op.time_running {
            op.time_running = false;
            op.time_acc = op
                .time_acc
                .wrapping_add(ticks_since(now, op.time_start).max(0) as u32);
        }
        Ok(())
    }

    /// Mark progress: `done` and `remain` are abstract units for the
    /// whole operation, `step` the units covered by the current step.
    fn mark(&mut self, handle: AsyncHandle, done: u32, remain: u32, step: u32) -> Result<()> {
        if remain < step {
            return Err(Error::BadParms);
        }
        let now = self.now();
        let op = self.op_mut(handle)?;
        op.frac_done = Frac::create(done, done + remain);
        op.frac_step = Frac::create(step, done + remain);
        op.time_done = op.time_acc;
        if op.time_running {
            op.time_done = op
                .time_done
                .wrapping_add(ticks_since(now, op.time_start).max(0) as u32);
        }
        Ok(())
    }

    fn compute_time(&self, handle: AsyncHandle, now: Ticks) -> (u32, u32) {
        let op = match self.ops.get(&handle) {
            Some(op) => op,
            None => return (0, 0),
        };
        progress::compute_time(&self.ops, op, now)
    }

    // ----- sub-request submission helpers for the stage handlers -----

    fn cache_submit(&mut self, handle: AsyncHandle, cmd: CacheCmd) -> Result<()> {
        self.op_mut(handle)?.last_cache = Some(cmd.kind());
        self.cache.submit(u64::from(handle), cmd)
    }

    fn unified_submit(&mut self, handle: AsyncHandle, cmd: UnifiedCmd) -> Result<()> {
        self.op_mut(handle)?.last_unified = Some(cmd.kind());
        let now = self.now();
        self.unified
            .submit(&mut *self.link, now, cmd, Client::AsyncOp(handle))
    }

    fn timer_submit(&mut self, handle: AsyncHandle, delay: u32) {
        let deadline = self.now().wrapping_add(delay);
        self.timer.schedule(deadline, TimerToken::AsyncOp(handle));
    }

    /// Set the detail string for an operation involving an application.
    fn detail_app(&mut self, handle: AsyncHandle, app: &str, args: &str) -> Result<()> {
        let app = tidy_app(app);
        let args = tidy_args(args);
        let op = self.op_mut(handle)?;
        op.detail = if app != args && !args.is_empty() {
            format!("{} {}", app, args)
        } else {
            app
        };
        Ok(())
    }
}

/// Map a status to its description, detail and error text.
fn describe(op: &OpData) -> (String, Option<String>, Option<String>) {
    let detail = Some(op.detail.clone()).filter(|d| !d.is_empty());
    match op.status {
        Status::Success => ("Completed successfully".to_string(), None, None),
        Status::Error => (
            "Aborted due to error".to_string(),
            None,
            Some(
                op.err
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
        ),
        Status::Aborted => ("Aborted".to_string(), None, None),
        Status::Busy => ("Processing".to_string(), None, None),
        Status::Delegate => ("Delegating".to_string(), None, None),
        Status::WaitCopy => ("Copy file".to_string(), detail, None),
        Status::WaitRestart => (
            "Error when starting".to_string(),
            detail,
            op.wait_err.as_ref().map(|e| e.to_string()),
        ),
        Status::WaitNewer => ("Previous backup is newer".to_string(), detail, None),
        Status::WaitRead => (
            "Error when reading".to_string(),
            detail,
            op.wait_err.as_ref().map(|e| e.to_string()),
        ),
        Status::Paused => ("Paused".to_string(), None, None),
        Status::ProgList => ("Enumerating open files".to_string(), None, None),
        Status::ProgDetail => ("Reading command line".to_string(), detail, None),
        Status::ProgClose => ("Terminating".to_string(), detail, None),
        Status::ProgOpen => ("Starting".to_string(), detail, None),
        Status::FileOpen => ("Opening".to_string(), detail, None),
        Status::FileClose => ("Closing".to_string(), detail, None),
        Status::FileRead => ("Reading".to_string(), detail, None),
        Status::FileMkDir => ("Creating directory".to_string(), detail, None),
        Status::FileDelete => ("Deleting".to_string(), detail, None),
        Status::FileWrite => ("Writing".to_string(), detail, None),
        Status::CatRead => ("Reading details".to_string(), detail, None),
        Status::CatWrite => ("Writing details".to_string(), detail, None),
        Status::TarKeep => ("Keeping".to_string(), detail, None),
        Status::TarScrap => ("Scrapping".to_string(), detail, None),
        Status::TarSkip => ("Skipping".to_string(), detail, None),
        Status::TarAdd => ("Adding".to_string(), detail, None),
        Status::TarExtract => ("Extracting".to_string(), detail, None),
    }
}

/// One-line summary of an operation's parameters for the status report.
fn summarise(kind: &OpKind) -> String {
    match kind {
        OpKind::Shutdown {
            path,
            pattern,
            append,
        } => {
            let mut s = format!("shutting files '{}',", pattern);
            if *append {
                s.push_str(" appending");
            }
            let _ = write!(s, " to '{}'", path);
            s
        }
        OpKind::Restart { path, remove } => {
            let mut s = format!("restarting files from '{}'", path);
            if *remove {
                s.push_str(", to be deleted");
            }
            s
        }
        OpKind::Read { src, dest } => format!("reading '{}' as '{}'", src, dest),
        OpKind::Write { src, dest, remove } => {
            let mut s = format!("writing '{}' as '{}'", src, dest);
            if *remove {
                s.push_str(", deleting source");
            }
            s
        }
        OpKind::Backup {
            src,
            dest,
            prev,
            temp,
            ..
        } => {
            let mut s = format!("backup '{}'", src);
            if !prev.is_empty() {
                let _ = write!(s, " from '{}'", prev);
            }
            let _ = write!(s, " to '{}' using '{}'", dest, temp);
            s
        }
        OpKind::WriteStart {
            src,
            dest,
            exe,
            remove,
        } => {
            let mut s = format!("writing and starting '{}' as '{}'", src, dest);
            if !exe.is_empty() {
                let _ = write!(s, " executing '{}'", exe);
            }
            if *remove {
                s.push_str(", deleting source");
            }
            s
        }
        OpKind::Install {
            pckg_src,
            pckg_dest,
            inst_exe,
            inst_src,
            inst_dest,
            inst_remove,
            pckg_remove,
        } => {
            let mut s = format!(
                "installing '{}' as '{}' using '{}' from '{}' as '{}'",
                pckg_src, pckg_dest, inst_exe, inst_src, inst_dest
            );
            if *inst_remove {
                s.push_str(", deleting installer source");
            }
            if *pckg_remove {
                s.push_str(", deleting package source");
            }
            s
        }
        OpKind::BackupList { src, sub, .. } => {
            format!("listing backup files from '{}' in '{}'", src, sub)
        }
        OpKind::BackupPrev {
            prev, dest, scrap, ..
        } => {
            let mut s = format!("processing previous backup '{}' to '{}'", prev, dest);
            if !scrap.is_empty() {
                let _ = write!(s, ", scrap to '{}'", scrap);
            }
            s
        }
        OpKind::BackupCopy {
            src, dest, temp, ..
        } => format!(
            "copying backup files from '{}' to '{}' using '{}'",
            src, dest, temp
        ),
        OpKind::TarComplete { .. } => "tar file operation".to_string(),
        OpKind::Find { path, .. } => format!("finding file '{}'", path),
    }
}
