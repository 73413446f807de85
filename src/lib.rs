//! Core of a host-to-handheld remote link for SIBO and EPOC devices.
//!
//! Two subsystems do the heavy lifting: the unified command dispatcher
//! ([`unified`]) masks the difference between the 16-bit and 32-bit wire
//! protocols behind a single command vocabulary, and the asynchronous
//! operation engine ([`ops`]) drives long-running procedures — backups,
//! installs, bulk transfers, task shutdown and restart — as cooperative,
//! hierarchical state machines over that vocabulary.
//!
//! Everything hangs off an [`ops::Engine`] value; the serial link, the
//! filing-system cache, the archiver, the host filesystem and the
//! key/value store are supplied as trait objects at construction, and a
//! single `poll` call pumps all outstanding work. There are no threads
//! and no globals.

pub mod backtree;
pub mod cache;
pub mod clock;
pub mod code;
pub mod err;
pub mod frac;
pub mod fs;
pub mod hostfs;
pub mod idle;
pub mod mock;
pub mod name;
pub mod ops;
pub mod pollword;
pub mod sysvar;
pub mod tar;
pub mod timer;
pub mod uid;
pub mod unified;
pub mod wildcard;
pub mod wire;

pub use crate::err::{Error, Result};
pub use crate::ops::{AsyncHandle, Engine, OpKind, OpProgress, Response, Status, ASYNC_INVALID};
pub use crate::unified::{UnifiedCmd, UnifiedReply};
