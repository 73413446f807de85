//! File-type synthesis. The 32-bit wire supplies a UID triple per entry;
//! the 16-bit wire has none, so the extension decides. Unrecognised
//! objects fall back to the plain data type.

use crate::fs::CHAR_EXTENSION;

/// The UID triple carried by EPOC32 files.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct UidTriple {
    pub uid1: u32,
    pub uid2: u32,
    pub uid3: u32,
}

// Host file types allocated for handheld documents.
pub const TYPE_DATA: u32 = 0xffd;
pub const TYPE_TEXT: u32 = 0xfff;
pub const TYPE_WORD: u32 = 0x158;
pub const TYPE_SHEET: u32 = 0x159;
pub const TYPE_RECORD: u32 = 0x15a;
pub const TYPE_AGENDA: u32 = 0x15b;
pub const TYPE_SKETCH: u32 = 0x15c;
pub const TYPE_OPL: u32 = 0x15d;
pub const TYPE_APP: u32 = 0x15e;
pub const TYPE_SIS: u32 = 0x155;

// Application UIDs (third word of the triple) for the standard document
// types.
const UID3_WORD: u32 = 0x1000_007f;
const UID3_SHEET: u32 = 0x1000_0088;
const UID3_RECORD: u32 = 0x1000_007e;
const UID3_AGENDA: u32 = 0x1000_0084;
const UID3_SKETCH: u32 = 0x1000_007d;
const UID3_OPL: u32 = 0x1000_0085;
// First word of the triple for native applications and install packages.
const UID1_APP: u32 = 0x1000_007a;
const UID2_SIS: u32 = 0x1000_006d;

fn extension(name: &str) -> Option<&str> {
    name.rsplit(CHAR_EXTENSION)
        .next()
        .filter(|ext| ext.len() < name.len())
}

/// Derive the host file type for an entry from its UID triple if one is
/// present, otherwise from its name.
pub fn map_type(name: &str, uid: Option<&UidTriple>) -> u32 {
    if let Some(uid) = uid {
        match uid.uid3 {
            UID3_WORD => return TYPE_WORD,
            UID3_SHEET => return TYPE_SHEET,
            UID3_RECORD => return TYPE_RECORD,
            UID3_AGENDA => return TYPE_AGENDA,
            UID3_SKETCH => return TYPE_SKETCH,
            UID3_OPL => return TYPE_OPL,
            _ => (),
        }
        if uid.uid1 == UID1_APP {
            return TYPE_APP;
        }
        if uid.uid2 == UID2_SIS {
            return TYPE_SIS;
        }
    }
    match extension(name).map(|e| e.to_ascii_lowercase()) {
        Some(ref e) if e == "txt" => TYPE_TEXT,
        Some(ref e) if e == "wrd" => TYPE_WORD,
        Some(ref e) if e == "spr" => TYPE_SHEET,
        Some(ref e) if e == "dbf" => TYPE_RECORD,
        Some(ref e) if e == "agn" => TYPE_AGENDA,
        Some(ref e) if e == "pic" => TYPE_SKETCH,
        Some(ref e) if e == "opl" || e == "opo" => TYPE_OPL,
        Some(ref e) if e == "app" || e == "img" => TYPE_APP,
        Some(ref e) if e == "sis" => TYPE_SIS,
        _ => TYPE_DATA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_wins_over_extension() {
        let uid = UidTriple {
            uid3: UID3_WORD,
            ..UidTriple::default()
        };
        assert_eq!(map_type("letter/txt", Some(&uid)), TYPE_WORD);
    }

    #[test]
    fn extension_decides_without_uid() {
        assert_eq!(map_type("letter/txt", None), TYPE_TEXT);
        assert_eq!(map_type("notes/wrd", None), TYPE_WORD);
        assert_eq!(map_type("Install/sis", None), TYPE_SIS);
        assert_eq!(map_type("plain", None), TYPE_DATA);
    }
}
