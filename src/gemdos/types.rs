//! ### GEMDOS types
//!
//! Status bytes, attribute bits, and the opcode enumeration shared by the
//! dispatch and the handlers.

use num_derive::FromPrimitive;

/// Status bytes returned to the guest.  The legacy errors are the low byte
/// of the two's complement TOS error number; the small positive values are
/// meta codes of the bridge protocol.  Success values share the space:
/// several opcodes return a handle or drive index as the status.
pub mod status {
    pub const OK: u8 = 0x00;
    /// all requested bytes moved by Fread/Fwrite
    pub const ALL_TRANSFERRED: u8 = 0x01;
    /// fewer bytes moved than requested, count readable via LastIoCount
    pub const PARTIAL_TRANSFER: u8 = 0x02;
    /// not an error: this bridge does not own the path/drive/handle,
    /// the guest driver should fall through to its native handler
    pub const NOT_HANDLED: u8 = 0x7f;
    /// -33
    pub const FILE_NOT_FOUND: u8 = 0xdf;
    /// -34
    pub const PATH_NOT_FOUND: u8 = 0xde;
    /// -35
    pub const NO_MORE_HANDLES: u8 = 0xdd;
    /// -36
    pub const ACCESS_DENIED: u8 = 0xdc;
    /// -37
    pub const INVALID_HANDLE: u8 = 0xdb;
    /// -46
    pub const INVALID_DRIVE: u8 = 0xd2;
    /// -49
    pub const NO_MORE_FILES: u8 = 0xcf;
    /// -65
    pub const INTERNAL: u8 = 0xbf;

    /// short name for log lines
    pub fn describe(stat: u8) -> &'static str {
        match stat {
            OK => "OK",
            ALL_TRANSFERRED => "all transferred",
            PARTIAL_TRANSFER => "partial transfer",
            NOT_HANDLED => "not handled",
            FILE_NOT_FOUND => "file not found",
            PATH_NOT_FOUND => "path not found",
            NO_MORE_HANDLES => "no more handles",
            ACCESS_DENIED => "access denied",
            INVALID_HANDLE => "invalid handle",
            INVALID_DRIVE => "invalid drive",
            NO_MORE_FILES => "no more files",
            INTERNAL => "internal error",
            _ => "(value)"
        }
    }

    /// Map an unexpected host I/O error onto the closest legacy status.
    pub fn from_io(err: &std::io::Error) -> u8 {
        match err.kind() {
            std::io::ErrorKind::NotFound => FILE_NOT_FOUND,
            std::io::ErrorKind::PermissionDenied => ACCESS_DENIED,
            _ => INTERNAL
        }
    }
}

/// file attribute bits in directory records and Fattrib/Fsfirst calls
pub mod attrib {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;

    /// render the attribute bits for log lines
    pub fn to_string(attr: u8) -> String {
        let mut ans = String::new();
        for (bit,name) in [(READ_ONLY,"RO "),(HIDDEN,"HID "),(SYSTEM,"SYS "),
            (VOLUME,"VOL "),(DIRECTORY,"DIR "),(ARCHIVE,"ARC ")] {
            if attr & bit != 0 {
                ans += name;
            }
        }
        match ans.is_empty() {
            true => "(none)".to_string(),
            false => ans.trim_end().to_string()
        }
    }
}

/// Opcodes served by the bridge.  The classic calls keep their GEMDOS trap
/// numbers; values 0x60 and up are bridge extensions the guest driver uses
/// for bookkeeping the traps cannot express.
#[derive(FromPrimitive,PartialEq,Eq,Clone,Copy,Debug)]
pub enum Op {
    Dsetdrv = 0x0e,
    Dgetdrv = 0x19,
    Dfree = 0x36,
    Dcreate = 0x39,
    Ddelete = 0x3a,
    Dsetpath = 0x3b,
    Fcreate = 0x3c,
    Fopen = 0x3d,
    Fclose = 0x3e,
    Fread = 0x3f,
    Fwrite = 0x40,
    Fdelete = 0x41,
    Fseek = 0x42,
    Fattrib = 0x43,
    Dgetpath = 0x47,
    Fsfirst = 0x4e,
    Fsnext = 0x4f,
    Frename = 0x56,
    Fdatime = 0x57,
    /// release the search slot after the last Fsnext
    FsnextRelease = 0x5f,
    /// reset bridge tables, sent when the guest driver installs
    Initialize = 0x60,
    /// return the identity string so the guest's bus scan can find us
    Identify = 0x61,
    /// current position in an open file
    Ftell = 0x62,
    /// count of bytes moved by the last Fread/Fwrite on a handle
    LastIoCount = 0x63,
    /// count of bytes between position and end of file
    BytesToEof = 0x64,
    /// BIOS: bitmap of mounted drives
    Drvmap = 0x70,
    /// BIOS: bitmap of drives with changed media
    Mediach = 0x71,
    /// BIOS: BIOS parameter block for a drive
    Getbpb = 0x72
}

/// Enumerates command level errors.  The `Display` trait will print the long message.
#[derive(thiserror::Error,Debug)]
pub enum CommandError {
    #[error("drive spec must look like C=/host/path or C=/host/path:ro")]
    BadDriveSpec,
    #[error("command could not be interpreted")]
    InvalidCommand
}

#[test]
fn test_attrib_string() {
    assert_eq!(attrib::to_string(0),"(none)");
    assert_eq!(attrib::to_string(attrib::READ_ONLY | attrib::DIRECTORY),"RO DIR");
}
