//! # `stbridge` main library
//!
//! This library serves directories of the host's filesystem to a vintage Atari
//! as GEMDOS drives.  The guest runs a small resident driver that forwards GEMDOS
//! calls over the ACSI bus; this library is the other end of that conversation.
//!
//! ## Architecture
//!
//! The bridge is built around three layers:
//! * `bus::Channel` abstracts the physical bus: one full-duplex exchange at a time,
//!   plus out-of-band signals the device raises when it wants the protocol to advance
//! * `transport::DataTransport` moves framed, chunked payloads across the channel,
//!   enforcing the guest DMA engine's size and alignment rules, and keeps a snapshot
//!   of the last response so a failed transmission can be replayed verbatim
//! * `gemdos::Server` decodes one GEMDOS opcode per command, executes it against
//!   the host filesystem, and stages the reply through the transport
//!
//! The bus is half duplex and the guest blocks on every call, so exactly one
//! command is in flight at any time and no locking is needed anywhere.
//!
//! ## Drives
//!
//! Each served drive maps a guest drive letter (C: through P:) to a host root
//! directory.  Guest paths are confined to that root; a path that resolves outside
//! it is refused rather than clamped.  Drives A: and B: belong to the guest's own
//! floppies and are never claimed.

pub mod bus;
pub mod transport;
pub mod gemdos;

type DYNERR = Box<dyn std::error::Error>;
type STDRESULT = Result<(),Box<dyn std::error::Error>>;

/// Parse a drive mapping of the form `C=/some/path` or `D=/some/path:ro`.
/// Returns (drive index, host root, read only).
pub fn parse_drive_spec(spec: &str) -> Result<(usize,std::path::PathBuf,bool),DYNERR> {
    let (letter,rest) = match spec.split_once('=') {
        Some((l,r)) => (l,r),
        None => return Err(Box::new(gemdos::types::CommandError::BadDriveSpec))
    };
    if letter.len() != 1 {
        return Err(Box::new(gemdos::types::CommandError::BadDriveSpec));
    }
    let letter = letter.chars().next().unwrap().to_ascii_uppercase();
    if !('C'..='P').contains(&letter) {
        log::error!("drive letter must be C through P, got {}",letter);
        return Err(Box::new(gemdos::types::CommandError::BadDriveSpec));
    }
    let (path,read_only) = match rest.strip_suffix(":ro") {
        Some(p) => (p,true),
        None => (rest,false)
    };
    if path.is_empty() {
        return Err(Box::new(gemdos::types::CommandError::BadDriveSpec));
    }
    Ok((letter as usize - 'A' as usize,std::path::PathBuf::from(path),read_only))
}

/// Load drive mappings from a JSON file of the form
/// `{"C": {"root": "/some/path"}, "D": {"root": "/other", "read_only": true}}`.
pub fn load_drive_map(path: &str) -> Result<Vec<(usize,std::path::PathBuf,bool)>,DYNERR> {
    let txt = std::fs::read_to_string(path)?;
    let obj: serde_json::Value = serde_json::from_str(&txt)?;
    let map = match obj.as_object() {
        Some(m) => m,
        None => return Err(Box::new(gemdos::types::CommandError::BadDriveSpec))
    };
    let mut ans = Vec::new();
    for (letter,val) in map {
        let root = match val.get("root").and_then(|v| v.as_str()) {
            Some(r) => r,
            None => return Err(Box::new(gemdos::types::CommandError::BadDriveSpec))
        };
        let ro = val.get("read_only").and_then(|v| v.as_bool()).unwrap_or(false);
        let spec = match ro {
            true => format!("{}={}:ro",letter,root),
            false => format!("{}={}",letter,root)
        };
        ans.push(parse_drive_spec(&spec)?);
    }
    Ok(ans)
}

#[test]
fn test_drive_spec() {
    let (idx,root,ro) = parse_drive_spec("C=/tmp/shared").expect("parse failed");
    assert_eq!(idx,2);
    assert_eq!(root,std::path::PathBuf::from("/tmp/shared"));
    assert_eq!(ro,false);
    let (idx,_root,ro) = parse_drive_spec("p=/mnt/cd:ro").expect("parse failed");
    assert_eq!(idx,15);
    assert_eq!(ro,true);
    assert!(parse_drive_spec("A=/tmp").is_err());
    assert!(parse_drive_spec("CD=/tmp").is_err());
    assert!(parse_drive_spec("no-equals").is_err());
}
