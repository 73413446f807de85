//! Path translation between the host representation and the two remote
//! representations. Host paths look like `:C.$.Documents.letter/txt`;
//! ERA paths look like `C:\Documents\letter.txt`; SIBO paths are the same
//! shape restricted to upper-case 8.3 components. Each direction enforces
//! the reserved-character and length rules of its destination, so a
//! round trip detects names the remote cannot represent.

use crate::err::{Error, Result};
use crate::fs::{CHAR_DISC, CHAR_ROOT, CHAR_SEPARATOR, DRIVE_FIRST, DRIVE_LAST, MAX_PATH};

/// Separator used by both remote representations.
pub const REMOTE_SEPARATOR: char = '\\';

// Characters which may never appear in a remote path component.
// Wildcards are deliberately permitted; directory enumeration passes
// match patterns through the same translation.
const ERA_RESERVED: &[char] = &['\\', ':', '"', '<', '>', '|'];

fn parse_drive(c: char) -> Result<char> {
    let upper = c.to_ascii_uppercase();
    if (DRIVE_FIRST..=DRIVE_LAST).contains(&upper) {
        Ok(upper)
    } else {
        Err(Error::BadName)
    }
}

/// Split a host path into its drive letter and components. The path must
/// be rooted: `:drive.$[.component]*`.
fn parse_host(path: &str) -> Result<(char, Vec<&str>)> {
    let mut chars = path.chars();
    if chars.next() != Some(CHAR_DISC) {
        return Err(Error::BadName);
    }
    let drive = parse_drive(chars.next().ok_or(Error::BadName)?)?;
    let rest = chars.as_str();
    let mut components = rest.split(CHAR_SEPARATOR);
    match components.next() {
        Some("") => (),
        _ => return Err(Error::BadName),
    }
    if components.next() != Some(&CHAR_ROOT.to_string()[..]) {
        return Err(Error::BadName);
    }
    let mut out = Vec::new();
    for component in components {
        if component.is_empty() {
            return Err(Error::BadName);
        }
        out.push(component);
    }
    Ok((drive, out))
}

/// Swap the extension and separator characters within one leaf name, the
/// same exchange the per-component translation applies to whole paths.
pub fn swap_leaf(leaf: &str) -> String {
    swap_component(leaf)
}

/// Swap the extension and separator characters within one component.
fn swap_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            crate::fs::CHAR_EXTENSION => '.',
            '.' => crate::fs::CHAR_EXTENSION,
            other => other,
        })
        .collect()
}

/// Convert a host path to ERA format.
pub fn host_to_era(path: &str) -> Result<String> {
    let (drive, components) = parse_host(path)?;
    let mut out = format!("{}:", drive);
    for component in &components {
        let swapped = swap_component(component);
        if swapped.chars().any(|c| ERA_RESERVED.contains(&c)) {
            return Err(Error::BadName);
        }
        out.push(REMOTE_SEPARATOR);
        out.push_str(&swapped);
    }
    if out.len() > MAX_PATH {
        return Err(Error::BadName);
    }
    Ok(out)
}

/// Convert an ERA path back to host format.
pub fn era_to_host(path: &str) -> Result<String> {
    let mut chars = path.chars();
    let drive = parse_drive(chars.next().ok_or(Error::BadName)?)?;
    if chars.next() != Some(':') {
        return Err(Error::BadName);
    }
    let rest = chars.as_str();
    let mut out = format!("{}{}{}{}", CHAR_DISC, drive, CHAR_SEPARATOR, CHAR_ROOT);
    if rest.is_empty() {
        return Ok(out);
    }
    let mut components = rest.split(REMOTE_SEPARATOR);
    match components.next() {
        Some("") => (),
        _ => return Err(Error::BadName),
    }
    for component in components {
        if component.is_empty() {
            continue;
        }
        let swapped = swap_component(component);
        if swapped.contains(CHAR_SEPARATOR) || swapped.contains(CHAR_DISC) {
            return Err(Error::BadName);
        }
        out.push(CHAR_SEPARATOR);
        out.push_str(&swapped);
    }
    if out.len() > MAX_PATH {
        return Err(Error::BadName);
    }
    Ok(out)
}

// Characters valid in a SIBO 8.3 component, besides letters and digits.
const SIBO_EXTRA: &[char] = &['$', '_', '&', '#', '%', '~', '-', '\'', '@', '!', '(', ')'];

fn sibo_component_ok(component: &str, wildcards: bool) -> bool {
    let mut parts = component.splitn(2, '.');
    let name = parts.next().unwrap_or("");
    let ext = parts.next();

    let valid = |s: &str, max: usize| {
        !s.is_empty()
            && s.len() <= max
            && s.chars().all(|c| {
                c.is_ascii_alphanumeric()
                    || SIBO_EXTRA.contains(&c)
                    || (wildcards && (c == '*' || c == '?'))
            })
    };

    // A bare "*" matches name and extension together.
    if wildcards && component == "*" {
        return true;
    }
    valid(name, 8) && ext.map_or(true, |e| valid(e, 3))
}

/// Convert a host path to SIBO format. Components must reduce to valid
/// upper-case 8.3 names.
pub fn host_to_sibo(path: &str) -> Result<String> {
    let (drive, components) = parse_host(path)?;
    let mut out = format!("{}:", drive);
    for component in &components {
        let swapped = swap_component(component).to_ascii_uppercase();
        if !sibo_component_ok(&swapped, true) {
            return Err(Error::BadName);
        }
        out.push(REMOTE_SEPARATOR);
        out.push_str(&swapped);
    }
    if out.len() > MAX_PATH {
        return Err(Error::BadName);
    }
    Ok(out)
}

/// Convert a SIBO path back to host format.
pub fn sibo_to_host(path: &str) -> Result<String> {
    let host = era_to_host(path)?;
    // Re-validate each component against the 8.3 rules so the round trip
    // is an 8.3 filter.
    let mut components = host.split(CHAR_SEPARATOR).skip(2);
    if !components.all(|c| sibo_component_ok(&swap_component(c).to_ascii_uppercase(), true)) {
        return Err(Error::BadName);
    }
    Ok(host.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn era_round_trip() {
        let host = ":C.$.Documents.letter/txt";
        let era = host_to_era(host).unwrap();
        assert_eq!(era, "C:\\Documents\\letter.txt");
        assert_eq!(era_to_host(&era).unwrap(), host);
    }

    #[test]
    fn era_root_only() {
        assert_eq!(host_to_era(":D.$").unwrap(), "D:");
        assert_eq!(era_to_host("D:").unwrap(), ":D.$");
    }

    #[test]
    fn era_rejects_reserved_characters() {
        assert_eq!(host_to_era(":C.$.bad\"name"), Err(Error::BadName));
        assert_eq!(host_to_era(":C.$.bad<name"), Err(Error::BadName));
        // Wildcards pass through for enumeration match patterns.
        assert_eq!(host_to_era(":C.$.dir.*").unwrap(), "C:\\dir\\*");
    }

    #[test]
    fn unrooted_paths_are_rejected() {
        assert_eq!(host_to_era("C.$.x"), Err(Error::BadName));
        assert_eq!(host_to_era(":C.x"), Err(Error::BadName));
        assert_eq!(host_to_era(":9.$.x"), Err(Error::BadName));
    }

    #[test]
    fn sibo_round_trip_uppercases() {
        let host = ":C.$.docs.letter/txt";
        let sibo = host_to_sibo(host).unwrap();
        assert_eq!(sibo, "C:\\DOCS\\LETTER.TXT");
        assert_eq!(sibo_to_host(&sibo).unwrap(), ":C.$.DOCS.LETTER/TXT");
    }

    #[test]
    fn sibo_enforces_eight_three() {
        assert!(host_to_sibo(":C.$.reasonable").is_err()); // nine characters
        assert!(host_to_sibo(":C.$.NAME/LONG").is_err()); // four-char extension
        assert!(host_to_sibo(":C.$.NAME8888/EXT").is_ok());
    }

    #[test]
    fn validation_is_idempotent() {
        let paths = [
            ":C.$.Documents.letter/txt",
            ":C.$.docs",
            ":D.$",
            ":C.$.A.B.C/D",
        ];
        for p in &paths {
            let once = era_to_host(&host_to_era(p).unwrap()).unwrap();
            let twice = era_to_host(&host_to_era(&once).unwrap()).unwrap();
            assert_eq!(once, twice);

            let once16 = sibo_to_host(&host_to_sibo(p).unwrap()).unwrap();
            let twice16 = sibo_to_host(&host_to_sibo(&once16).unwrap()).unwrap();
            assert_eq!(once16, twice16);
        }
    }
}
