//! ## GEMDOS module
//!
//! The guest's resident driver forwards GEMDOS traps to the bridge as short
//! command frames; this module is the dispatcher that turns each frame into
//! host filesystem work and a staged reply.  One command per invocation, one
//! status byte per command, no exceptions.
//!
//! A status deserves a word: `NOT_HANDLED` is not a failure.  It tells the
//! guest driver "this path/drive/handle is not mine, fall through to the
//! native handler".  Genuine failures travel as the legacy error bytes.
//!
//! The server owns three bounded tables that persist across commands: the
//! drive configuration (16 slots, letters A through P), the open file table
//! (40 slots, the slot index is the guest's handle), and the search table
//! (32 paginated directory searches keyed by guest DTA address).

pub mod types;
pub mod pack;
pub mod path;
pub mod find;
mod files;

use std::path::{Path,PathBuf};
use log::{debug,error};
use num_traits::FromPrimitive;
use types::{status,Op};
use files::FileSlot;
use find::{FindSlot,NameMap};
use crate::bus::{CommandFrame,MOD_HOSTED_DISK};
use crate::transport::DataTransport;
use crate::{DYNERR,STDRESULT};

/// drive letters A through P
pub const MAX_DRIVES: usize = 16;
/// capacity of the open file table
pub const MAX_FILES: usize = 40;
/// Fread/Fwrite byte count cap, 254 sectors
pub const MAX_IO_BYTES: usize = 254*512;
/// answer to the guest's bus scan
pub const IDENTITY: &str = "stbridge hosted disk";

/// Configuration and state for one guest drive letter.
pub struct DriveSlot {
    enabled: bool,
    read_only: bool,
    host_root: PathBuf,
    /// current directory as components below the root
    current_path: Vec<String>,
    media_changed: bool,
    names: NameMap
}

impl DriveSlot {
    fn new() -> Self {
        Self {
            enabled: false,
            read_only: false,
            host_root: PathBuf::new(),
            current_path: Vec::new(),
            media_changed: false,
            names: NameMap::new()
        }
    }
}

/// The primary interface for serving GEMDOS calls.
/// Owns the transport, which owns the channel.
pub struct Server {
    trans: DataTransport,
    drives: Vec<DriveSlot>,
    files: Vec<FileSlot>,
    finds: Vec<FindSlot>,
    current_drive: usize
}

impl Server {
    pub fn new(trans: DataTransport) -> Self {
        Self {
            trans,
            drives: (0..MAX_DRIVES).map(|_| DriveSlot::new()).collect(),
            files: (0..MAX_FILES).map(|_| FileSlot::new()).collect(),
            finds: (0..find::MAX_FIND_SLOTS).map(|_| FindSlot::new()).collect(),
            current_drive: 2
        }
    }
    /// Serve `host_root` as the drive at `index` (2 = C).  Drives 0 and 1
    /// belong to the guest's floppies and are refused here.
    pub fn set_drive(&mut self,index: usize,host_root: &Path,read_only: bool) -> STDRESULT {
        if index < 2 || index >= MAX_DRIVES {
            return Err(Box::new(types::CommandError::BadDriveSpec));
        }
        if !host_root.is_dir() {
            error!("drive root {} is not a directory",host_root.display());
            return Err(Box::new(types::CommandError::BadDriveSpec));
        }
        let slot = &mut self.drives[index];
        slot.enabled = true;
        slot.read_only = read_only;
        slot.host_root = host_root.to_path_buf();
        slot.current_path = Vec::new();
        slot.media_changed = true;
        slot.names.clear();
        debug!("drive {}: serving {}{}",(b'A'+index as u8) as char,host_root.display(),
            match read_only { true => " (read only)", false => "" });
        Ok(())
    }
    /// Stop serving the drive at `index`, e.g. when the medium goes away.
    pub fn remove_drive(&mut self,index: usize) {
        if index < MAX_DRIVES && self.drives[index].enabled {
            self.drives[index] = DriveSlot::new();
            self.drives[index].media_changed = true;
        }
    }

    /// Wait for the device to announce a command, pull the frame, run it,
    /// and send the reply.  Returns whether a command was handled.
    pub fn poll(&mut self,timeout_ms: u64) -> Result<bool,DYNERR> {
        match self.trans.wait_for_command(timeout_ms)? {
            Some(_header) => {
                let raw = self.trans.fetch_command()?;
                self.process_command(&raw)?;
                Ok(true)
            },
            None => Ok(false)
        }
    }

    /// Decode and execute one raw command frame, then send data and status.
    /// A frame that is not addressed to the hosted disk service is ignored
    /// without a reply.
    pub fn process_command(&mut self,raw: &[u8]) -> STDRESULT {
        let frame = CommandFrame::from_slice(raw)?;
        if !frame.is_marked() || frame.module() != MOD_HOSTED_DISK {
            debug!("frame not addressed to the hosted disk service");
            return Ok(());
        }
        self.trans.clear(true);
        match Op::from_u8(frame.opcode()) {
            Some(Op::Dsetdrv) => self.dsetdrv(&frame),
            Some(Op::Dgetdrv) => self.dgetdrv(),
            Some(Op::Dsetpath) => self.dsetpath(),
            Some(Op::Dgetpath) => self.dgetpath(&frame),
            Some(Op::Dfree) => self.dfree(&frame),
            Some(Op::Dcreate) => self.dcreate(),
            Some(Op::Ddelete) => self.ddelete(),
            Some(Op::Fsfirst) => self.fsfirst(),
            Some(Op::Fsnext) => self.fsnext(&frame),
            Some(Op::FsnextRelease) => self.fsnext_release(&frame),
            Some(Op::Fcreate) => self.fcreate(),
            Some(Op::Fopen) => self.fopen(),
            Some(Op::Fclose) => self.fclose(&frame),
            Some(Op::Fread) => self.fread(&frame),
            Some(Op::Fwrite) => self.fwrite(&frame),
            Some(Op::Fdelete) => self.fdelete(),
            Some(Op::Frename) => self.frename(),
            Some(Op::Fattrib) => self.fattrib(),
            Some(Op::Fseek) => self.fseek(&frame),
            Some(Op::Ftell) => self.ftell(&frame),
            Some(Op::Fdatime) => self.fdatime(&frame),
            Some(Op::LastIoCount) => self.last_io_count(&frame),
            Some(Op::BytesToEof) => self.bytes_to_eof(&frame),
            Some(Op::Drvmap) => self.drvmap(),
            Some(Op::Mediach) => self.mediach(),
            Some(Op::Getbpb) => self.getbpb(&frame),
            Some(Op::Initialize) => self.initialize(),
            Some(Op::Identify) => self.identify(),
            None => {
                debug!("opcode {:02x} is not served here",frame.opcode());
                self.trans.set_status(status::NOT_HANDLED);
            }
        }
        let (stat,_) = self.trans.status();
        debug!("opcode {:02x} done, status {:02x} ({})",frame.opcode(),stat,status::describe(stat));
        self.trans.send_data_and_status(false)
    }

    /// Replay the last response verbatim; called when the device reports the
    /// guest missed it.  The filesystem operation is not re-run.
    pub fn resend_last(&mut self) -> STDRESULT {
        self.trans.send_data_and_status(true)
    }

    //----------- path plumbing -----------

    /// Resolve a guest path to its drive and the confined component list.
    /// None means the path is not ours: bad or floppy drive, disabled drive,
    /// or a path that climbs out of the root.
    fn create_host_path(&self,guest: &str) -> Option<(usize,Vec<String>)> {
        let (maybe_drive,rest) = path::split_drive(guest);
        let drive = maybe_drive.unwrap_or(self.current_drive);
        if drive < 2 || drive >= MAX_DRIVES || !self.drives[drive].enabled {
            return None;
        }
        let comps = path::resolve_components(&self.drives[drive].current_path,rest)?;
        Some((drive,comps))
    }

    /// Host path for confined components, expanding any `~` short names the
    /// search machinery handed out earlier.
    fn host_path(&self,drive: usize,comps: &[String]) -> PathBuf {
        let names = &self.drives[drive].names;
        let mut expanded: Vec<String> = Vec::new();
        let mut key_comps: Vec<String> = Vec::new();
        for comp in comps {
            let key = path::to_guest_path(&key_comps);
            let actual = match comp.contains('~') {
                true => match names.host_name(&key,comp) {
                    Some(h) => h.clone(),
                    None => comp.clone()
                },
                false => comp.clone()
            };
            expanded.push(actual);
            key_comps.push(comp.clone());
        }
        path::resolve_on_host(&self.drives[drive].host_root,&expanded)
    }

    fn recv_guest_path(&mut self) -> Option<String> {
        match self.trans.recv_data(512) {
            Ok(data) => Some(path::normalize_guest_chars(&data)),
            Err(e) => {
                debug!("failed to receive path payload: {}",e);
                self.trans.set_status(status::INTERNAL);
                None
            }
        }
    }

    fn drives_bitmap(&self) -> u16 {
        let mut ans = 0;
        for i in 0..MAX_DRIVES {
            if self.drives[i].enabled {
                ans |= 1 << i;
            }
        }
        ans
    }

    /// translate the 0 = current, else drive+1 convention of Dfree/Dgetpath
    fn param_drive(&self,param: u8) -> usize {
        match param {
            0 => self.current_drive,
            d => (d-1) as usize % MAX_DRIVES
        }
    }

    //----------- drive and directory calls -----------

    fn dsetdrv(&mut self,frame: &CommandFrame) {
        // returns the bitmap of mounted drives on success, and tracks the
        // current drive even when it is a floppy we do not handle
        let new_drive = frame.params().u8() as usize;
        if new_drive >= MAX_DRIVES {
            debug!("drive index {} out of range",new_drive);
            self.trans.set_status(status::NOT_HANDLED);
            return;
        }
        if new_drive < 2 {
            self.current_drive = new_drive;
            debug!("drive {} is a floppy, tracked but not handled",new_drive);
            self.trans.set_status(status::NOT_HANDLED);
            return;
        }
        if self.drives[new_drive].enabled {
            self.current_drive = new_drive;
            let drives = self.drives_bitmap();
            self.trans.add_word(drives);
            self.trans.pad_to_mul16();
            self.trans.set_status(status::OK);
            return;
        }
        debug!("drive {} not enabled",new_drive);
        self.trans.set_status(status::NOT_HANDLED);
    }

    fn dgetdrv(&mut self) {
        if self.drives[self.current_drive].enabled {
            self.trans.set_status(self.current_drive as u8);
            return;
        }
        self.trans.set_status(status::NOT_HANDLED);
    }

    fn dsetpath(&mut self) {
        if !self.drives[self.current_drive].enabled {
            self.trans.set_status(status::NOT_HANDLED);
            return;
        }
        let new_path = match self.recv_guest_path() {
            Some(p) => p,
            None => return
        };
        let (drive,comps) = match self.create_host_path(&new_path) {
            Some(ans) => ans,
            None => {
                debug!("{} is not ours",new_path);
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        let host = self.host_path(drive,&comps);
        if !host.is_dir() {
            debug!("{} -> {} does not exist",new_path,host.display());
            self.trans.set_status(status::PATH_NOT_FOUND);
            return;
        }
        if drive != self.current_drive {
            debug!("current drive changes to {}",(b'A'+drive as u8) as char);
            self.current_drive = drive;
        }
        debug!("current path on {} is now {}",(b'A'+drive as u8) as char,path::to_guest_path(&comps));
        self.drives[drive].current_path = comps;
        self.trans.set_status(status::OK);
    }

    fn dgetpath(&mut self,frame: &CommandFrame) {
        let which = self.param_drive(frame.params().u8());
        if !self.drives[which].enabled {
            self.trans.set_status(status::NOT_HANDLED);
            return;
        }
        let guest = path::to_guest_path(&self.drives[which].current_path);
        // Dgetpath returns the empty string for the root, not a lone separator
        let guest = match guest.as_str() {
            "\\" => "",
            p => p
        };
        self.trans.add_c_string(guest,true);
        self.trans.set_status(status::OK);
    }

    fn dfree(&mut self,frame: &CommandFrame) {
        let which = self.param_drive(frame.params().u8());
        if !self.drives[which].enabled {
            self.trans.set_status(status::NOT_HANDLED);
            return;
        }
        let (mut free,total,bsize) = match host_fs_stats(&self.drives[which].host_root) {
            Some(stats) => stats,
            None => {
                error!("filesystem statistics failed for {}",self.drives[which].host_root.display());
                (0,0,512)
            }
        };
        if self.drives[which].read_only {
            free = 0; // a read only drive has no free space worth reporting
        }
        self.trans.add_dword(u32::try_from(free).unwrap_or(u32::MAX));
        self.trans.add_dword(u32::try_from(total).unwrap_or(u32::MAX));
        self.trans.add_dword(512);
        self.trans.add_dword(u32::try_from(bsize/512).unwrap_or(1));
        self.trans.set_status(status::OK);
    }

    fn dcreate(&mut self) {
        let guest = match self.recv_guest_path() {
            Some(p) => p,
            None => return
        };
        let (drive,comps) = match self.create_host_path(&guest) {
            Some(ans) => ans,
            None => {
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        if self.drives[drive].read_only {
            self.trans.set_status(status::ACCESS_DENIED);
            return;
        }
        let host = self.host_path(drive,&comps);
        match std::fs::create_dir(&host) {
            Ok(()) => {
                debug!("created {}",host.display());
                self.trans.set_status(status::OK);
            },
            Err(e) => {
                debug!("mkdir {} failed: {}",host.display(),e);
                match e.kind() {
                    std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::PermissionDenied =>
                        self.trans.set_status(status::ACCESS_DENIED),
                    _ => self.trans.set_status(status::INTERNAL)
                }
            }
        }
    }

    fn ddelete(&mut self) {
        let guest = match self.recv_guest_path() {
            Some(p) => p,
            None => return
        };
        let (drive,comps) = match self.create_host_path(&guest) {
            Some(ans) => ans,
            None => {
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        if self.drives[drive].read_only {
            self.trans.set_status(status::ACCESS_DENIED);
            return;
        }
        let host = self.host_path(drive,&comps);
        match std::fs::remove_dir(&host) {
            Ok(()) => {
                debug!("removed {}",host.display());
                self.trans.set_status(status::OK);
            },
            Err(e) => {
                debug!("rmdir {} failed: {}",host.display(),e);
                match e.kind() {
                    std::io::ErrorKind::NotFound => self.trans.set_status(status::PATH_NOT_FOUND),
                    std::io::ErrorKind::PermissionDenied => self.trans.set_status(status::ACCESS_DENIED),
                    // a populated directory refuses deletion, the guest sees that as access denied
                    _ => self.trans.set_status(status::ACCESS_DENIED)
                }
            }
        }
    }

    //----------- BIOS level calls -----------

    fn drvmap(&mut self) {
        let drives = self.drives_bitmap();
        self.trans.add_word(drives);
        self.trans.pad_to_mul16();
        self.trans.set_status(status::OK);
    }

    fn mediach(&mut self) {
        let mut bits: u16 = 0;
        for i in 2..MAX_DRIVES {
            if self.drives[i].media_changed {
                bits |= 1 << i;
            }
        }
        self.trans.add_word(bits);
        self.trans.pad_to_mul16();
        self.trans.set_status(status::OK);
    }

    fn getbpb(&mut self,frame: &CommandFrame) {
        let drive = frame.params().u8() as usize;
        if drive >= MAX_DRIVES {
            self.trans.set_status(status::NOT_HANDLED);
            return;
        }
        self.drives[drive].media_changed = false;
        if !self.drives[drive].enabled {
            for _ in 0..9 {
                self.trans.add_word(0);
            }
            self.trans.pad_to_mul16();
            self.trans.set_status(status::NOT_HANDLED);
            return;
        }
        // There is no real medium behind a hosted drive, so fabricate a
        // stable geometry: 512 byte sectors, 4 sector clusters, 16-bit FAT.
        self.trans.add_word(512);           // bytes per sector
        self.trans.add_word(4);             // sectors per cluster
        self.trans.add_word(4*512);         // bytes per cluster
        self.trans.add_word(32);            // root directory sectors
        self.trans.add_word(8192);          // sectors per FAT
        self.trans.add_word(1000+8192);     // first sector of second FAT
        self.trans.add_word(1000+2*8192);   // first data sector
        self.trans.add_word(32000);         // clusters on disk
        self.trans.add_word(1);             // bit 0 set: 16-bit FAT
        self.trans.pad_to_mul16();
        self.trans.set_status(status::OK);
    }

    //----------- bridge extensions -----------

    fn initialize(&mut self) {
        debug!("guest driver installed, resetting tables");
        for slot in self.files.iter_mut() {
            slot.reset();
        }
        for slot in self.finds.iter_mut() {
            slot.clear();
        }
        for drive in self.drives.iter_mut() {
            drive.current_path = Vec::new();
        }
        self.trans.set_status(status::OK);
    }

    fn identify(&mut self) {
        self.trans.add_c_string(IDENTITY,false);
        self.trans.add_zeros_until(512);
        self.trans.set_status(status::OK);
    }
}

/// Free and total block counts and the block size of the filesystem holding
/// `path`, by way of statvfs.  None if the host call fails.
fn host_fs_stats(path: &Path) -> Option<(u64,u64,u64)> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut svfs: libc::statvfs = unsafe { std::mem::zeroed() };
    match unsafe { libc::statvfs(cpath.as_ptr(),&mut svfs) } {
        0 => Some((svfs.f_bfree as u64,svfs.f_blocks as u64,svfs.f_bsize as u64)),
        _ => None
    }
}
