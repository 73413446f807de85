//! Character-set translation for text crossing the link. Host strings
//! are Latin-1 representable. The 32-bit wire carries wide (Unicode)
//! text; the 16-bit wire carries code page 850 bytes, with task names on
//! the task-control channel in ANSI (Windows-1252). Call sites fall back
//! to the untranslated bytes when a translation fails but the raw form
//! fits the destination.

use crate::err::{Error, Result};
use lazy_static::lazy_static;
use std::collections::HashMap;

/// Code page 850 upper half, in Unicode.
#[rustfmt::skip]
const CP850_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å',
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', 'ø', '£', 'Ø', '×', 'ƒ',
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '®', '¬', '½', '¼', '¡', '«', '»',
    '░', '▒', '▓', '│', '┤', 'Á', 'Â', 'À', '©', '╣', '║', '╗', '╝', '¢', '¥', '┐',
    '└', '┴', '┬', '├', '─', '┼', 'ã', 'Ã', '╚', '╔', '╩', '╦', '╠', '═', '╬', '¤',
    'ð', 'Ð', 'Ê', 'Ë', 'È', 'ı', 'Í', 'Î', 'Ï', '┘', '┌', '█', '▄', '¦', 'Ì', '▀',
    'Ó', 'ß', 'Ô', 'Ò', 'õ', 'Õ', 'µ', 'þ', 'Þ', 'Ú', 'Û', 'Ù', 'ý', 'Ý', '¯', '´',
    '\u{ad}', '±', '‗', '¾', '¶', '§', '÷', '¸', '°', '¨', '·', '¹', '³', '²', '■', '\u{a0}',
];

/// Windows-1252 0x80..0x9f, in Unicode. Unassigned positions keep their
/// control-character identity.
#[rustfmt::skip]
const ANSI_HIGH: [char; 32] = [
    '€', '\u{81}', '‚', 'ƒ', '„', '…', '†', '‡', 'ˆ', '‰', 'Š', '‹', 'Œ', '\u{8d}', 'Ž', '\u{8f}',
    '\u{90}', '\u{2018}', '\u{2019}', '\u{201c}', '\u{201d}', '•', '–', '—', '˜', '™', 'š', '›', 'œ', '\u{9d}', 'ž', 'Ÿ',
];

lazy_static! {
    static ref CP850_REVERSE: HashMap<char, u8> = {
        let mut map = HashMap::new();
        for (i, &c) in CP850_HIGH.iter().enumerate() {
            map.insert(c, 0x80 + i as u8);
        }
        map
    };
    static ref ANSI_REVERSE: HashMap<char, u8> = {
        let mut map = HashMap::new();
        for (i, &c) in ANSI_HIGH.iter().enumerate() {
            map.insert(c, 0x80 + i as u8);
        }
        map
    };
}

fn is_latin1(c: char) -> bool {
    (c as u32) < 0x100
}

/// Translate wide text from the 32-bit wire into the host character set.
pub fn era_to_latin1(text: &str) -> Result<String> {
    if text.chars().all(is_latin1) {
        Ok(text.to_string())
    } else {
        Err(Error::BadName)
    }
}

/// Translate host text for the 32-bit wire.
pub fn latin1_to_era(text: &str) -> Result<String> {
    era_to_latin1(text)
}

fn cp850_decode(byte: u8) -> char {
    if byte < 0x80 {
        byte as char
    } else {
        CP850_HIGH[(byte - 0x80) as usize]
    }
}

/// Translate code page 850 bytes from the 16-bit wire into the host
/// character set.
pub fn cp850_to_latin1(bytes: &[u8]) -> Result<String> {
    let decoded: String = bytes.iter().map(|&b| cp850_decode(b)).collect();
    if decoded.chars().all(is_latin1) {
        Ok(decoded)
    } else {
        Err(Error::BadName)
    }
}

/// Translate host text into code page 850 bytes for the 16-bit wire.
pub fn latin1_to_cp850(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            if (c as u32) < 0x80 {
                Ok(c as u8)
            } else {
                CP850_REVERSE.get(&c).copied().ok_or(Error::BadName)
            }
        })
        .collect()
}

fn ansi_decode(byte: u8) -> char {
    if (0x80..0xa0).contains(&byte) {
        ANSI_HIGH[(byte - 0x80) as usize]
    } else {
        byte as char
    }
}

fn ansi_encode(c: char) -> Result<u8> {
    let code = c as u32;
    if code < 0x80 || (0xa0..0x100).contains(&code) {
        Ok(code as u8)
    } else {
        ANSI_REVERSE.get(&c).copied().ok_or(Error::BadName)
    }
}

/// Translate code page 850 bytes into ANSI text (task names on the
/// 16-bit task-control channel).
pub fn cp850_to_ansi(bytes: &[u8]) -> Result<String> {
    let decoded: String = bytes.iter().map(|&b| cp850_decode(b)).collect();
    if decoded.chars().all(|c| ansi_encode(c).is_ok()) {
        Ok(decoded)
    } else {
        Err(Error::BadName)
    }
}

/// Translate ANSI text into code page 850 bytes.
pub fn ansi_to_cp850(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            if (c as u32) < 0x80 {
                Ok(c as u8)
            } else {
                CP850_REVERSE.get(&c).copied().ok_or(Error::BadName)
            }
        })
        .collect()
}

/// Translate ANSI text into the host character set.
pub fn ansi_to_latin1(text: &str) -> Result<String> {
    if text.chars().all(is_latin1) {
        Ok(text.to_string())
    } else {
        Err(Error::BadName)
    }
}

/// Translate code page 850 bytes into the host character set, falling
/// back to the raw bytes when the strict translation fails.
pub fn cp850_to_latin1_lossy(bytes: &[u8]) -> String {
    cp850_to_latin1(bytes).unwrap_or_else(|_| bytes.iter().map(|&b| b as char).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_is_unchanged_everywhere() {
        assert_eq!(era_to_latin1("Sheet.app").unwrap(), "Sheet.app");
        assert_eq!(cp850_to_latin1(b"HELLO.TXT").unwrap(), "HELLO.TXT");
        assert_eq!(latin1_to_cp850("HELLO").unwrap(), b"HELLO".to_vec());
        assert_eq!(cp850_to_ansi(b"Word").unwrap(), "Word");
    }

    #[test]
    fn accented_characters_round_trip_through_cp850() {
        let bytes = latin1_to_cp850("déjà vu").unwrap();
        assert_eq!(cp850_to_latin1(&bytes).unwrap(), "déjà vu");
    }

    #[test]
    fn wide_text_fails_latin1() {
        assert_eq!(era_to_latin1("snowman \u{2603}"), Err(Error::BadName));
    }

    #[test]
    fn box_drawing_fails_latin1_but_not_raw_fallback() {
        // 0xB3 is a box-drawing character in code page 850.
        assert_eq!(cp850_to_latin1(&[0x41, 0xb3]), Err(Error::BadName));
        assert_eq!(cp850_to_latin1_lossy(&[0x41, 0xb3]), "A\u{b3}");
    }

    #[test]
    fn ansi_quotes_translate_to_cp850_only_when_possible() {
        // Curly quotes exist in ANSI but not in code page 850.
        assert!(ansi_to_cp850("\u{2018}x\u{2019}").is_err());
        assert_eq!(ansi_to_latin1("café").unwrap(), "café");
    }
}
