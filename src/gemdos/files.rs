//! ### File handle operations
//!
//! The open file table and every call that works through a handle.  The
//! guest's handle is simply the slot index; an occupied slot owns the host
//! file exclusively until Fclose, so nothing else may reposition it between
//! calls.  A handle we are not tracking always answers `NOT_HANDLED` so the
//! guest driver can route it to the native filesystem instead.

use std::io::{Read,Seek,SeekFrom,Write};
use log::{debug,warn};
use super::{Server,MAX_FILES,MAX_IO_BYTES};
use super::types::status;
use super::pack;
use crate::bus::CommandFrame;

/// One entry of the open file table.  The `Option` is the occupancy marker:
/// a slot with no host file is free.
pub struct FileSlot {
    host: Option<std::fs::File>,
    host_path: std::path::PathBuf,
    last_io_count: u32
}

impl FileSlot {
    pub fn new() -> Self {
        Self { host: None, host_path: std::path::PathBuf::new(), last_io_count: 0 }
    }
    pub fn reset(&mut self) {
        self.host = None; // closes the file
        self.host_path = std::path::PathBuf::new();
        self.last_io_count = 0;
    }
    pub fn is_free(&self) -> bool {
        self.host.is_none()
    }
}

impl Server {
    fn free_file_slot(&self) -> Option<usize> {
        self.files.iter().position(|f| f.is_free())
    }
    /// slot index for a guest handle, None if we are not tracking it
    fn handle_slot(&self,handle: u8) -> Option<usize> {
        let idx = handle as usize;
        match idx < MAX_FILES && !self.files[idx].is_free() {
            true => Some(idx),
            false => None
        }
    }

    pub(super) fn fcreate(&mut self) {
        let payload = match self.trans.recv_data(512) {
            Ok(d) => d,
            Err(e) => {
                debug!("failed to receive Fcreate payload: {}",e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        let attribs = payload[0];
        let guest = super::path::normalize_guest_chars(&payload[1..]);
        let (drive,comps) = match self.create_host_path(&guest) {
            Some(ans) => ans,
            None => {
                debug!("{} is not ours",guest);
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        if self.drives[drive].read_only {
            debug!("{} refused, drive is read only",guest);
            self.trans.set_status(status::ACCESS_DENIED);
            return;
        }
        let index = match self.free_file_slot() {
            Some(i) => i,
            None => {
                debug!("{} refused, file table is full",guest);
                self.trans.set_status(status::NO_MORE_HANDLES);
                return;
            }
        };
        let host = self.host_path(drive,&comps);
        // create or truncate, then keep a read/update handle
        let file = match std::fs::OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&host) {
            Ok(f) => f,
            Err(e) => {
                debug!("create {} failed: {}",host.display(),e);
                self.trans.set_status(status::ACCESS_DENIED);
                return;
            }
        };
        if attribs != 0 {
            // the old bridge never applied creation attributes either; keep
            // the gap visible rather than half-supporting it
            warn!("Fcreate attributes {:02x} requested but attribute setting is not implemented",attribs);
        }
        debug!("created {} as handle {}",host.display(),index);
        self.files[index].host = Some(file);
        self.files[index].host_path = host;
        self.files[index].last_io_count = 0;
        self.trans.set_status(index as u8);
    }

    pub(super) fn fopen(&mut self) {
        let payload = match self.trans.recv_data(512) {
            Ok(d) => d,
            Err(e) => {
                debug!("failed to receive Fopen payload: {}",e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        let mode = payload[0] & 0x07;
        let guest = super::path::normalize_guest_chars(&payload[1..]);
        let (drive,comps) = match self.create_host_path(&guest) {
            Some(ans) => ans,
            None => {
                debug!("{} is not ours",guest);
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        let write_requested = mode==1 || mode==2;
        if write_requested && self.drives[drive].read_only {
            debug!("{} open for write refused, drive is read only",guest);
            self.trans.set_status(status::ACCESS_DENIED);
            return;
        }
        let index = match self.free_file_slot() {
            Some(i) => i,
            None => {
                debug!("{} refused, file table is full",guest);
                self.trans.set_status(status::NO_MORE_HANDLES);
                return;
            }
        };
        let host = self.host_path(drive,&comps);
        if !write_requested && !host.is_file() {
            debug!("{} -> {} does not exist",guest,host.display());
            self.trans.set_status(status::FILE_NOT_FOUND);
            return;
        }
        // opening for write must not truncate, and must not create either:
        // only Fcreate brings files into being
        let file = match std::fs::OpenOptions::new().read(true).write(write_requested).open(&host) {
            Ok(f) => f,
            Err(e) => {
                debug!("open {} failed: {}",host.display(),e);
                self.trans.set_status(status::ACCESS_DENIED);
                return;
            }
        };
        debug!("opened {} (mode {}) as handle {}",host.display(),mode,index);
        self.files[index].host = Some(file);
        self.files[index].host_path = host;
        self.files[index].last_io_count = 0;
        self.trans.set_status(index as u8);
    }

    pub(super) fn fclose(&mut self,frame: &CommandFrame) {
        let handle = frame.params().u8();
        let index = match self.handle_slot(handle) {
            Some(i) => i,
            None => {
                debug!("handle {} is not ours",handle);
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        debug!("closing handle {}",handle);
        self.files[index].reset();
        self.trans.set_status(status::OK);
    }

    pub(super) fn fread(&mut self,frame: &CommandFrame) {
        let mut params = frame.params();
        let handle = params.u8();
        let byte_count = params.u24() as usize;
        let seek_offset = params.i8();
        let index = match self.handle_slot(handle) {
            Some(i) => i,
            None => {
                debug!("handle {} is not ours",handle);
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        if byte_count > MAX_IO_BYTES {
            debug!("refusing to read {} bytes in one call",byte_count);
            self.trans.set_status(status::INTERNAL);
            return;
        }
        let file = self.files[index].host.as_mut().expect("unreachable");
        if seek_offset != 0 {
            if let Err(e) = file.seek(SeekFrom::Current(seek_offset as i64)) {
                debug!("pre-read seek of {} failed: {}",seek_offset,e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        }
        // host reads the exact requested count, only the wire gets padded
        let mut data = vec![0;byte_count];
        let mut moved = 0;
        loop {
            match file.read(&mut data[moved..]) {
                Ok(0) => break,
                Ok(n) => moved += n,
                Err(e) => {
                    debug!("read on handle {} failed after {} bytes: {}",handle,moved,e);
                    break;
                }
            }
            if moved==byte_count {
                break;
            }
        }
        self.trans.add_bytes(&data[0..moved],false);
        self.trans.pad_to_mul16();
        self.files[index].last_io_count = moved as u32;
        if moved==byte_count {
            self.trans.set_status(status::ALL_TRANSFERRED);
        } else {
            debug!("only {} of {} bytes read",moved,byte_count);
            self.trans.set_status(status::PARTIAL_TRANSFER);
        }
    }

    pub(super) fn fwrite(&mut self,frame: &CommandFrame) {
        let mut params = frame.params();
        let handle = params.u8();
        let byte_count = params.u24() as usize;
        let index = match self.handle_slot(handle) {
            Some(i) => i,
            None => {
                debug!("handle {} is not ours",handle);
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        if byte_count > MAX_IO_BYTES {
            debug!("refusing to write {} bytes in one call",byte_count);
            self.trans.set_status(status::INTERNAL);
            return;
        }
        // the guest DMA ships a multiple of 16, the host write uses the
        // exact requested count
        let wire_count = byte_count + match byte_count % 16 {
            0 => 0,
            m => 16-m
        };
        let data = match self.trans.recv_data(wire_count) {
            Ok(d) => d,
            Err(e) => {
                debug!("failed to receive write data: {}",e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        let file = self.files[index].host.as_mut().expect("unreachable");
        let mut moved = 0;
        loop {
            match file.write(&data[moved..byte_count]) {
                Ok(0) => break,
                Ok(n) => moved += n,
                Err(e) => {
                    debug!("write on handle {} failed after {} bytes: {}",handle,moved,e);
                    break;
                }
            }
            if moved==byte_count {
                break;
            }
        }
        self.files[index].last_io_count = moved as u32;
        if moved==byte_count {
            self.trans.set_status(status::ALL_TRANSFERRED);
        } else {
            debug!("only {} of {} bytes written",moved,byte_count);
            self.trans.set_status(status::PARTIAL_TRANSFER);
        }
    }

    /// count of bytes moved by the last Fread/Fwrite, for the guest to pick
    /// up after a partial transfer status
    pub(super) fn last_io_count(&mut self,frame: &CommandFrame) {
        let handle = frame.params().u8();
        let index = match self.handle_slot(handle) {
            Some(i) => i,
            None => {
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        self.trans.add_dword(self.files[index].last_io_count);
        self.trans.pad_to_mul16();
        self.trans.set_status(status::OK);
    }

    pub(super) fn fseek(&mut self,frame: &CommandFrame) {
        let mut params = frame.params();
        let offset = params.u32();
        let handle = params.u8();
        let seek_mode = params.u8();
        let index = match self.handle_slot(handle) {
            Some(i) => i,
            None => {
                debug!("handle {} is not ours",handle);
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        let file = self.files[index].host.as_mut().expect("unreachable");
        let target = match seek_mode {
            0 => SeekFrom::Start(offset as u64),
            1 => SeekFrom::Current(offset as i32 as i64),
            2 => SeekFrom::End(offset as i32 as i64),
            _ => SeekFrom::Start(offset as u64)
        };
        let pos = match file.seek(target) {
            Ok(p) => p,
            Err(e) => {
                debug!("seek to {:?} failed: {}",target,e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        let to_end = match byte_count_to_eof(file) {
            Ok(n) => n,
            Err(e) => {
                debug!("probing end of file failed: {}",e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        debug!("handle {} now at {}, {} bytes to end",handle,pos,to_end);
        self.trans.add_dword(u32::try_from(pos).unwrap_or(u32::MAX));
        self.trans.add_dword(u32::try_from(to_end).unwrap_or(u32::MAX));
        self.trans.pad_to_mul16();
        self.trans.set_status(status::OK);
    }

    pub(super) fn ftell(&mut self,frame: &CommandFrame) {
        let handle = frame.params().u8();
        let index = match self.handle_slot(handle) {
            Some(i) => i,
            None => {
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        let file = self.files[index].host.as_mut().expect("unreachable");
        let pos = match file.stream_position() {
            Ok(p) => p,
            Err(e) => {
                debug!("stream position failed: {}",e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        self.trans.add_dword(u32::try_from(pos).unwrap_or(u32::MAX));
        self.trans.pad_to_mul16();
        self.trans.set_status(status::OK);
    }

    pub(super) fn bytes_to_eof(&mut self,frame: &CommandFrame) {
        let handle = frame.params().u8();
        let index = match self.handle_slot(handle) {
            Some(i) => i,
            None => {
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        let file = self.files[index].host.as_mut().expect("unreachable");
        let to_end = match byte_count_to_eof(file) {
            Ok(n) => n,
            Err(e) => {
                debug!("probing end of file failed: {}",e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        self.trans.add_dword(u32::try_from(to_end).unwrap_or(u32::MAX));
        self.trans.pad_to_mul16();
        self.trans.set_status(status::OK);
    }

    pub(super) fn fdatime(&mut self,frame: &CommandFrame) {
        let mut params = frame.params();
        let param = params.u8();
        let handle = param & 0x7f;
        let set_not_get = param & 0x80 != 0;
        let guest_time = params.u16();
        let guest_date = params.u16();
        let index = match self.handle_slot(handle) {
            Some(i) => i,
            None => {
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        if set_not_get {
            let ndt = match pack::unpack_datetime(guest_date,guest_time) {
                Some(ndt) => ndt,
                None => {
                    debug!("guest sent unpackable datetime {:04x} {:04x}",guest_date,guest_time);
                    self.trans.set_status(status::INTERNAL);
                    return;
                }
            };
            let stamp = pack::system_from_datetime(ndt);
            let times = std::fs::FileTimes::new().set_accessed(stamp).set_modified(stamp);
            // the slot's handle may be read only, stamp through a fresh write handle
            let res = std::fs::OpenOptions::new().write(true).open(&self.files[index].host_path)
                .and_then(|f| f.set_times(times));
            if let Err(e) = res {
                debug!("setting times on {} failed: {}",self.files[index].host_path.display(),e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        } else {
            let mtime = match std::fs::metadata(&self.files[index].host_path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    debug!("reading times on {} failed: {}",self.files[index].host_path.display(),e);
                    self.trans.set_status(status::INTERNAL);
                    return;
                }
            };
            let ndt = pack::datetime_from_system(mtime);
            self.trans.add_word(pack::pack_time(Some(ndt)));
            self.trans.add_word(pack::pack_date(Some(ndt)));
            self.trans.pad_to_mul16();
        }
        self.trans.set_status(status::OK);
    }

    pub(super) fn fdelete(&mut self) {
        let guest = match self.recv_guest_path() {
            Some(p) => p,
            None => return
        };
        let (drive,comps) = match self.create_host_path(&guest) {
            Some(ans) => ans,
            None => {
                debug!("{} is not ours",guest);
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        if self.drives[drive].read_only {
            debug!("{} refused, drive is read only",guest);
            self.trans.set_status(status::ACCESS_DENIED);
            return;
        }
        let host = self.host_path(drive,&comps);
        match std::fs::remove_file(&host) {
            Ok(()) => {
                debug!("deleted {}",host.display());
                self.trans.set_status(status::OK);
            },
            Err(e) => {
                debug!("unlink {} failed: {}",host.display(),e);
                self.trans.set_status(status::from_io(&e));
            }
        }
    }

    pub(super) fn frename(&mut self) {
        let payload = match self.trans.recv_data(512) {
            Ok(d) => d,
            Err(e) => {
                debug!("failed to receive Frename payload: {}",e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        // two NUL terminated names back to back
        let mut rdr = crate::bus::Reader::new(&payload);
        let old_guest = super::path::normalize_guest_chars(rdr.c_string_bytes());
        let new_guest = super::path::normalize_guest_chars(rdr.c_string_bytes());
        let old_resolved = self.create_host_path(&old_guest);
        let new_resolved = self.create_host_path(&new_guest);
        let ((old_drive,old_comps),(new_drive,new_comps)) = match (old_resolved,new_resolved) {
            (Some(o),Some(n)) => (o,n),
            _ => {
                debug!("{} or {} is not ours",old_guest,new_guest);
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        if self.drives[old_drive].read_only || self.drives[new_drive].read_only {
            debug!("rename refused, drive is read only");
            self.trans.set_status(status::ACCESS_DENIED);
            return;
        }
        let old_host = self.host_path(old_drive,&old_comps);
        let new_host = self.host_path(new_drive,&new_comps);
        debug!("rename {} -> {}",old_host.display(),new_host.display());
        match std::fs::rename(&old_host,&new_host) {
            Ok(()) => self.trans.set_status(status::OK),
            Err(e) => {
                debug!("rename failed: {}",e);
                self.trans.set_status(status::ACCESS_DENIED);
            }
        }
    }

    pub(super) fn fattrib(&mut self) {
        let payload = match self.trans.recv_data(512) {
            Ok(d) => d,
            Err(e) => {
                debug!("failed to receive Fattrib payload: {}",e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        let set_not_inquire = payload[0] != 0;
        let new_attr = payload[1];
        let guest = super::path::normalize_guest_chars(&payload[2..]);
        let (drive,comps) = match self.create_host_path(&guest) {
            Some(ans) => ans,
            None => {
                self.trans.set_status(status::NOT_HANDLED);
                return;
            }
        };
        let host = self.host_path(drive,&comps);
        let meta = match std::fs::metadata(&host) {
            Ok(m) => m,
            Err(e) => {
                debug!("stat {} failed: {}",host.display(),e);
                self.trans.set_status(status::INTERNAL);
                return;
            }
        };
        let hidden = comps.last().map(|c| c.starts_with('.')).unwrap_or(false);
        let old_attr = pack::attributes_to_guest(meta.permissions().readonly(),meta.is_dir(),hidden);
        if set_not_inquire {
            // deliberately not supported: report the old attributes rather
            // than pretend the change happened
            warn!("Fattrib set ({}) requested on {} but attribute setting is not implemented",
                super::types::attrib::to_string(new_attr),host.display());
        }
        self.trans.set_status(old_attr);
    }
}

/// Bytes between the current position and end of file, leaving the
/// position where it was.
fn byte_count_to_eof(file: &mut std::fs::File) -> Result<u64,std::io::Error> {
    let current = file.stream_position()?;
    let end = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(current))?;
    Ok(end - current)
}
