//! Portable filing-system types shared by the dispatcher and the
//! operation engine: object types, attribute sets and their mappings onto
//! the two wire variants, open modes, catalogue entries, and date stamps
//! with conversions between the three time bases involved (host
//! centi-seconds since 1900, ERA microseconds since year 0, SIBO seconds
//! since 1970).

use bitflags::bitflags;

/// Maximum length accepted for a path in any representation.
pub const MAX_PATH: usize = 256;

/// Character conventions of host (RISC OS style) paths.
pub const CHAR_DISC: char = ':';
pub const CHAR_SEPARATOR: char = '.';
pub const CHAR_ROOT: char = '$';
pub const CHAR_EXTENSION: char = '/';
/// Drive letter wildcard used by find operations.
pub const CHAR_DRIVE_ALL: char = '@';
pub const DRIVE_FIRST: char = 'A';
pub const DRIVE_LAST: char = 'Z';

/// Filing system name used when rendering remote paths for humans.
pub const FS_NAME: &str = "PsiFS";

/// The type of a catalogue object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObjectType {
    NotFound,
    File,
    Dir,
}

impl Default for ObjectType {
    fn default() -> ObjectType {
        ObjectType::NotFound
    }
}

bitflags! {
    /// Host-side attribute bits.
    #[derive(Default)]
    pub struct FileAttr: u32 {
        const OWNER_READ = 0x01;
        const OWNER_WRITE = 0x02;
        const LOCKED = 0x08;
        const PUBLIC_READ = 0x10;
        const PUBLIC_WRITE = 0x20;
    }
}

bitflags! {
    /// ERA (EPOC32) file attribute bits.
    #[derive(Default)]
    pub struct EraAttr: u32 {
        const READ_ONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE = 0x0020;
        /// Request UIDs when enumerating a directory.
        const UID = 0x1000_0000;
    }
}

bitflags! {
    /// SIBO (EPOC16) file attribute bits.
    #[derive(Default)]
    pub struct SiboAttr: u32 {
        const WRITEABLE = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const VOLUME = 0x0008;
        const DIRECTORY = 0x0010;
        const MODIFIED = 0x0020;
    }
}

/// Portion of the ERA attribute space that attribute writes may touch.
pub const ERA_ATTR_MASK: EraAttr = EraAttr::READ_ONLY;
/// Portion of the SIBO attribute space that attribute writes may touch.
pub const SIBO_ATTR_MASK: SiboAttr = SiboAttr::WRITEABLE;

impl FileAttr {
    /// Translate remote ERA attributes into the host attribute space.
    pub fn from_era(era: EraAttr) -> FileAttr {
        let mut attr = FileAttr::OWNER_READ | FileAttr::PUBLIC_READ;
        if era.contains(EraAttr::READ_ONLY) {
            attr |= FileAttr::LOCKED;
        } else {
            attr |= FileAttr::OWNER_WRITE | FileAttr::PUBLIC_WRITE;
        }
        attr
    }

    /// Translate remote SIBO attributes into the host attribute space.
    pub fn from_sibo(sibo: SiboAttr) -> FileAttr {
        let mut attr = FileAttr::OWNER_READ | FileAttr::PUBLIC_READ;
        if sibo.contains(SiboAttr::WRITEABLE) {
            attr |= FileAttr::OWNER_WRITE | FileAttr::PUBLIC_WRITE;
        } else {
            attr |= FileAttr::LOCKED;
        }
        attr
    }

    /// The ERA attribute bits to set for these host attributes.
    pub fn to_era(self) -> EraAttr {
        if self.contains(FileAttr::OWNER_WRITE) {
            EraAttr::empty()
        } else {
            EraAttr::READ_ONLY
        }
    }

    /// The SIBO attribute bits to set for these host attributes.
    pub fn to_sibo(self) -> SiboAttr {
        if self.contains(FileAttr::OWNER_WRITE) {
            SiboAttr::WRITEABLE
        } else {
            SiboAttr::empty()
        }
    }
}

/// Modes for opening a remote file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Create or replace for writing.
    Out,
    /// Open existing for shared reading.
    In,
    /// Open existing for exclusive update.
    Up,
}

/// Handle for an open remote file or directory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RemoteHandle(pub u32);

/// A date stamp in host representation: centi-seconds since 00:00:00
/// 1 Jan 1900, 40 bits split over a low word and the low byte of a high
/// word.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DateStamp {
    pub high: u32,
    pub low: u32,
}

// Days from 1 Jan year 0 to 1 Jan 1900 in the proleptic Gregorian
// calendar, and the SIBO epoch offset in seconds (1900 to 1970).
const ERA_EPOCH_DAYS: u64 = 693_961;
const ERA_EPOCH_CS: u64 = ERA_EPOCH_DAYS * 24 * 60 * 60 * 100;
const SIBO_EPOCH_SECS: u64 = 2_208_988_800;

/// An ERA time stamp: microseconds since 1 Jan year 0, as two words.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EraTime {
    pub high: u32,
    pub low: u32,
}

impl EraTime {
    pub fn as_micros(self) -> u64 {
        (u64::from(self.high) << 32) | u64::from(self.low)
    }

    pub fn from_micros(micros: u64) -> EraTime {
        EraTime {
            high: (micros >> 32) as u32,
            low: micros as u32,
        }
    }
}

impl DateStamp {
    pub fn as_cs(self) -> u64 {
        (u64::from(self.high & 0xff) << 32) | u64::from(self.low)
    }

    pub fn from_cs(cs: u64) -> DateStamp {
        DateStamp {
            high: ((cs >> 32) & 0xff) as u32,
            low: cs as u32,
        }
    }

    /// Convert an ERA time stamp. Times before 1900 clamp to zero.
    pub fn from_era(time: EraTime) -> DateStamp {
        let cs = (time.as_micros() / 10_000).saturating_sub(ERA_EPOCH_CS);
        DateStamp::from_cs(cs)
    }

    /// Convert back to an ERA time stamp.
    pub fn to_era(self) -> EraTime {
        EraTime::from_micros((self.as_cs() + ERA_EPOCH_CS) * 10_000)
    }

    /// Convert a SIBO time stamp (seconds since 1970).
    pub fn from_sibo(secs: u32) -> DateStamp {
        DateStamp::from_cs((u64::from(secs) + SIBO_EPOCH_SECS) * 100)
    }

    /// Convert back to a SIBO time stamp. Times before 1970 clamp to zero.
    pub fn to_sibo(self) -> u32 {
        (self.as_cs() / 100).saturating_sub(SIBO_EPOCH_SECS) as u32
    }
}

/// A catalogue entry in host representation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FsInfo {
    pub name: String,
    pub load_addr: u32,
    pub exec_addr: u32,
    pub size: u32,
    pub attr: FileAttr,
    pub obj_type: ObjectType,
}

impl FsInfo {
    /// The date stamp encoded in the load and execution addresses, if the
    /// object is stamped.
    pub fn date(&self) -> Option<DateStamp> {
        if self.load_addr & 0xfff0_0000 == 0xfff0_0000 {
            Some(DateStamp {
                high: self.load_addr & 0xff,
                low: self.exec_addr,
            })
        } else {
            None
        }
    }

    /// The file type encoded in the load address, if the object is
    /// stamped.
    pub fn file_type(&self) -> Option<u32> {
        if self.load_addr & 0xfff0_0000 == 0xfff0_0000 {
            Some((self.load_addr >> 8) & 0xfff)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_round_trips_through_era() {
        let writable = FileAttr::from_era(EraAttr::empty());
        assert!(writable.contains(FileAttr::OWNER_WRITE));
        assert_eq!(writable.to_era(), EraAttr::empty());

        let locked = FileAttr::from_era(EraAttr::READ_ONLY);
        assert!(locked.contains(FileAttr::LOCKED));
        assert!(!locked.contains(FileAttr::OWNER_WRITE));
        assert_eq!(locked.to_era(), EraAttr::READ_ONLY);
    }

    #[test]
    fn attr_round_trips_through_sibo() {
        let writable = FileAttr::from_sibo(SiboAttr::WRITEABLE);
        assert_eq!(writable.to_sibo(), SiboAttr::WRITEABLE);
        let locked = FileAttr::from_sibo(SiboAttr::empty());
        assert_eq!(locked.to_sibo(), SiboAttr::empty());
    }

    #[test]
    fn sibo_dates_round_trip() {
        for &secs in &[0u32, 1, 1_000_000_000, 0x7fff_ffff] {
            let stamp = DateStamp::from_sibo(secs);
            assert_eq!(stamp.to_sibo(), secs);
        }
    }

    #[test]
    fn era_dates_round_trip_to_cs_precision() {
        let time = EraTime::from_micros((ERA_EPOCH_CS + 123_456_789) * 10_000);
        let stamp = DateStamp::from_era(time);
        assert_eq!(stamp.as_cs(), 123_456_789);
        assert_eq!(stamp.to_era(), time);
    }

    #[test]
    fn epoch_bases_agree() {
        // 1 Jan 1970 in both remote bases maps to the same host stamp.
        let sibo = DateStamp::from_sibo(0);
        let era = DateStamp::from_era(EraTime::from_micros(
            (ERA_EPOCH_CS + SIBO_EPOCH_SECS * 100) * 10_000,
        ));
        assert_eq!(sibo, era);
    }

    #[test]
    fn stamped_info_exposes_type_and_date() {
        let info = FsInfo {
            load_addr: 0xfff1_5800 | 0x4f,
            exec_addr: 0x1234_5678,
            ..FsInfo::default()
        };
        assert_eq!(info.file_type(), Some(0x158));
        assert_eq!(
            info.date(),
            Some(DateStamp {
                high: 0x4f,
                low: 0x1234_5678
            })
        );

        let unstamped = FsInfo {
            load_addr: 0x8000,
            ..FsInfo::default()
        };
        assert_eq!(unstamped.file_type(), None);
    }
}
