//! ### Guest path translation
//!
//! Pure functions converting between guest path syntax (drive letter,
//! backslash separators, restricted character set) and host path syntax.
//!
//! The safety property everything else leans on: a resolved path is a list
//! of plain name components below a drive root.  `..` is folded away here,
//! and an attempt to climb above the root resolves to `None` rather than
//! being clamped, so a confined path can be built by simple joining.

use std::path::{Path,PathBuf};
use log::debug;

/// Guest strings are NUL terminated and use a restricted character set.
/// Take bytes up to the NUL, map anything outside printable ASCII to `_`,
/// and map the host separator `/` to `_` so a guest name can never smuggle
/// a host path component boundary.
pub fn normalize_guest_chars(bytes: &[u8]) -> String {
    let mut ans = String::new();
    for b in bytes {
        match b {
            0 => break,
            b'/' => ans.push('_'),
            0x20..=0x7e => ans.push(*b as char),
            _ => ans.push('_')
        }
    }
    ans
}

/// Split a leading drive designator off a guest path.
/// `C:\FOO` gives `(Some(2),"\FOO")`; a path with no designator gives `(None,path)`.
pub fn split_drive(path: &str) -> (Option<usize>,&str) {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1]==b':' && bytes[0].is_ascii_alphabetic() {
        let idx = bytes[0].to_ascii_uppercase() as usize - 'A' as usize;
        return (Some(idx),&path[2..]);
    }
    (None,path)
}

/// Resolve a guest path part against a base directory (both drive-relative),
/// folding `.` and `..`.  A leading `\` restarts at the drive root.  Returns
/// the component list below the drive root, or None if the path tries to
/// climb above it.
pub fn resolve_components(base: &[String],part: &str) -> Option<Vec<String>> {
    let mut comps: Vec<String> = match part.starts_with('\\') {
        true => Vec::new(),
        false => base.to_vec()
    };
    for seg in part.split('\\') {
        match seg {
            "" | "." => continue,
            ".." => {
                if comps.pop().is_none() {
                    debug!("path climbs above the drive root");
                    return None;
                }
            },
            name => comps.push(name.to_string())
        }
    }
    Some(comps)
}

/// components back to guest syntax, always rooted: `\FOO\BAR.TXT`
pub fn to_guest_path(comps: &[String]) -> String {
    match comps.is_empty() {
        true => "\\".to_string(),
        false => comps.iter().fold(String::new(),|acc,c| acc + "\\" + c)
    }
}

/// split the last component off, giving (directory components, file name)
pub fn split_leaf(comps: &[String]) -> (Vec<String>,String) {
    match comps.split_last() {
        Some((leaf,dir)) => (dir.to_vec(),leaf.clone()),
        None => (Vec::new(),String::new())
    }
}

/// Join components onto a host root, matching existing entries without
/// regard to case (the guest has no notion of case, most hosts do).
/// Components with no existing match are joined verbatim, so the result
/// is also usable for paths about to be created.
pub fn resolve_on_host(root: &Path,comps: &[String]) -> PathBuf {
    let mut ans = root.to_path_buf();
    for comp in comps {
        let exact = ans.join(comp);
        if exact.exists() {
            ans = exact;
            continue;
        }
        let mut matched = false;
        if let Ok(listing) = std::fs::read_dir(&ans) {
            for entry in listing.flatten() {
                let name = entry.file_name();
                if let Some(name) = name.to_str() {
                    if name.eq_ignore_ascii_case(comp) {
                        ans = ans.join(name);
                        matched = true;
                        break;
                    }
                }
            }
        }
        if !matched {
            ans = exact;
        }
    }
    ans
}
