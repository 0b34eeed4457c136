//! ### Directory search
//!
//! Fsfirst builds the complete list of matching entries up front and parks it
//! in a search slot keyed by the guest supplied DTA address; Fsnext then pages
//! fixed 23-byte records out of the slot.  This module holds the slot type,
//! the record encoder, the host directory walk, and the 8.3 name shortening
//! that makes host names presentable to the guest.

use std::collections::HashMap;
use std::path::Path;
use globset::GlobBuilder;
use log::{debug,warn};
use super::types::attrib;
use super::pack;
use crate::DYNERR;

/// attribute byte, packed time, packed date, 32-bit size, 14 name bytes
pub const DIR_RECORD_SIZE: usize = 23;
/// capacity of the search slot table
pub const MAX_FIND_SLOTS: usize = 32;
/// A search that matches more host entries than this is truncated.
/// The bound exists only to keep a runaway directory from pinning memory.
pub const MAX_FIND_ENTRIES: usize = 4096;
/// volume label reported for a root directory search
pub const VOLUME_LABEL: &str = "STBRIDGE";

/// One directory entry in the legacy fixed-width form.
pub struct DirRecord {
    pub attr: u8,
    pub time: u16,
    pub date: u16,
    pub size: u32,
    /// 8.3 name, NUL padded on the wire
    pub name: String
}

impl DirRecord {
    pub fn pack(&self) -> [u8;DIR_RECORD_SIZE] {
        let mut ans = [0;DIR_RECORD_SIZE];
        ans[0] = self.attr;
        ans[1..3].copy_from_slice(&self.time.to_be_bytes());
        ans[3..5].copy_from_slice(&self.date.to_be_bytes());
        ans[5..9].copy_from_slice(&self.size.to_be_bytes());
        for (i,b) in self.name.bytes().take(13).enumerate() {
            ans[9+i] = b;
        }
        ans
    }
}

/// One paginated search session.  `dta` is the guest's correlation key,
/// 0 marks the slot free.
#[derive(Clone)]
pub struct FindSlot {
    pub dta: u32,
    pub count: usize,
    pub buffer: Vec<u8>
}

impl FindSlot {
    pub fn new() -> Self {
        Self { dta: 0, count: 0, buffer: Vec::new() }
    }
    pub fn clear(&mut self) {
        self.dta = 0;
        self.count = 0;
        self.buffer = Vec::new();
    }
    pub fn is_free(&self) -> bool {
        self.dta == 0
    }
    pub fn add(&mut self,rec: &DirRecord) {
        self.buffer.extend_from_slice(&rec.pack());
        self.count += 1;
    }
}

/// index of the slot already tracking this DTA
pub fn slot_by_dta(slots: &[FindSlot],dta: u32) -> Option<usize> {
    slots.iter().position(|s| !s.is_free() && s.dta==dta)
}

pub fn free_slot(slots: &[FindSlot]) -> Option<usize> {
    slots.iter().position(|s| s.is_free())
}

/// Short name book-keeping for one drive.  Host names that do not fit the
/// 8.3 mold are shortened with a `~` counter per directory, and the mapping
/// is remembered both ways so a later guest path using the short form can be
/// expanded back to the host name.
pub struct NameMap {
    /// (directory key, short name) -> host name
    expand: HashMap<(String,String),String>,
    /// (directory key, host name lower) -> short name
    shorten: HashMap<(String,String),String>
}

impl NameMap {
    pub fn new() -> Self {
        Self { expand: HashMap::new(), shorten: HashMap::new() }
    }
    pub fn clear(&mut self) {
        self.expand.clear();
        self.shorten.clear();
    }
    /// host name already a valid guest name, i.e. 8.3 uppercase-able ASCII
    fn fits(name: &str) -> bool {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() > 2 {
            return false;
        }
        let base = parts[0];
        let ext = match parts.len() {
            1 => "",
            _ => parts[1]
        };
        if base.is_empty() || base.len() > 8 || ext.len() > 3 {
            return false;
        }
        name.chars().all(|c| c.is_ascii_graphic() && c != '/' && c != '\\' && c != '*' && c != '?')
    }
    fn strip(part: &str,cap: usize) -> String {
        part.to_uppercase().chars()
            .filter(|c| c.is_ascii_graphic() && !"./\\*?:;<>|\"[]=,+".contains(*c))
            .take(cap)
            .collect()
    }
    /// Short form of a host name within `dir_key`, creating and recording a
    /// `~` alias if the name does not fit.
    pub fn short_name(&mut self,dir_key: &str,host_name: &str) -> String {
        let lower_key = (dir_key.to_string(),host_name.to_lowercase());
        if let Some(short) = self.shorten.get(&lower_key) {
            return short.clone();
        }
        if Self::fits(host_name) {
            let short = host_name.to_uppercase();
            self.shorten.insert(lower_key,short.clone());
            return short;
        }
        let (base,ext) = match host_name.rsplit_once('.') {
            Some((b,x)) => (Self::strip(b,8),Self::strip(x,3)),
            None => (Self::strip(host_name,8),String::new())
        };
        let mut n = 1;
        loop {
            let tag = format!("~{}",n);
            let head: String = base.chars().take(8 - tag.len()).collect();
            let short = match ext.is_empty() {
                true => format!("{}{}",head,tag),
                false => format!("{}{}.{}",head,tag,ext)
            };
            let skey = (dir_key.to_string(),short.clone());
            if !self.expand.contains_key(&skey) {
                self.expand.insert(skey,host_name.to_string());
                self.shorten.insert(lower_key,short.clone());
                return short;
            }
            n += 1;
        }
    }
    /// host name behind a previously issued `~` alias
    pub fn host_name(&self,dir_key: &str,short: &str) -> Option<&String> {
        self.expand.get(&(dir_key.to_string(),short.to_uppercase()))
    }
}

/// Should an entry with these attributes appear in a search asking for
/// `wanted`?  Plain files always match; directory, hidden, and system
/// entries appear only when their bit was asked for.
fn attrib_match(entry_attr: u8,wanted: u8) -> bool {
    for special in [attrib::DIRECTORY,attrib::HIDDEN,attrib::SYSTEM,attrib::VOLUME] {
        if entry_attr & special != 0 && wanted & special == 0 {
            return false;
        }
    }
    true
}

/// Walk `host_dir` and fill `slot` with every entry matching the guest
/// wildcard `pattern` and the attribute request.  `dir_key` identifies the
/// directory inside `names`.  A root directory search asking for the volume
/// bit is given a synthetic label record first.
pub fn build_find_storage(slot: &mut FindSlot,names: &mut NameMap,host_dir: &Path,
        dir_key: &str,pattern: &str,attribs: u8,is_root: bool) -> Result<(),DYNERR> {
    slot.clear();
    // `*.*` means everything in guest usage, even names with no dot
    let matcher = match pattern {
        "*.*" | "*" | "" => None,
        p => Some(GlobBuilder::new(p).case_insensitive(true).build()?.compile_matcher())
    };
    if is_root && attribs & attrib::VOLUME != 0 {
        slot.add(&DirRecord {
            attr: attrib::VOLUME,
            time: 0,
            date: 0,
            size: 0,
            name: VOLUME_LABEL.to_string()
        });
    }
    let mut found: Vec<DirRecord> = Vec::new();
    for entry in std::fs::read_dir(host_dir)? {
        let entry = entry?;
        let host_name = match entry.file_name().into_string() {
            Ok(s) => s,
            Err(_) => {
                debug!("skipping undecodable host name in {}",host_dir.display());
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!("skipping {}: {}",host_name,e);
                continue;
            }
        };
        let short = names.short_name(dir_key,&host_name);
        if let Some(m) = &matcher {
            if !m.is_match(&short) && !m.is_match(&host_name) {
                continue;
            }
        }
        let entry_attr = pack::attributes_to_guest(
            meta.permissions().readonly(),
            meta.is_dir(),
            host_name.starts_with('.'));
        if !attrib_match(entry_attr,attribs) {
            continue;
        }
        let (time,date) = match meta.modified() {
            Ok(st) => {
                let ndt = pack::datetime_from_system(st);
                (pack::pack_time(Some(ndt)),pack::pack_date(Some(ndt)))
            },
            Err(_) => (0,0)
        };
        let size = match meta.is_dir() {
            true => 0,
            false => u32::try_from(meta.len()).unwrap_or(u32::MAX)
        };
        found.push(DirRecord { attr: entry_attr, time, date, size, name: short });
        if slot.count + found.len() >= MAX_FIND_ENTRIES {
            warn!("search in {} truncated at {} entries",host_dir.display(),MAX_FIND_ENTRIES);
            break;
        }
    }
    // host listing order is arbitrary, give the guest something stable
    found.sort_by(|a,b| a.name.cmp(&b.name));
    for rec in &found {
        slot.add(rec);
    }
    Ok(())
}

/// records per transfer block: a 2-byte leading count, then whole records
const RECORDS_PER_BLOCK: usize = (512-2)/DIR_RECORD_SIZE;

impl super::Server {
    pub(super) fn fsfirst(&mut self) {
        let payload = match self.trans.recv_data(512) {
            Ok(d) => d,
            Err(e) => {
                debug!("failed to receive Fsfirst payload: {}",e);
                self.trans.set_status(super::types::status::INTERNAL);
                return;
            }
        };
        let mut rdr = crate::bus::Reader::new(&payload);
        let dta = rdr.u32();
        let attribs = rdr.u8();
        let search = super::path::normalize_guest_chars(rdr.c_string_bytes());
        debug!("Fsfirst({:08x}): {} wanting {}",dta,search,attrib::to_string(attribs));
        let (drive,comps) = match self.create_host_path(&search) {
            Some(ans) => ans,
            None => {
                debug!("{} is not ours",search);
                self.trans.set_status(super::types::status::NOT_HANDLED);
                return;
            }
        };
        let (dir_comps,pattern) = super::path::split_leaf(&comps);
        let pattern = match pattern.is_empty() {
            true => "*.*".to_string(),
            false => pattern
        };
        let host_dir = self.host_path(drive,&dir_comps);
        let dir_key = super::path::to_guest_path(&dir_comps);
        let mut temp = FindSlot::new();
        if let Err(e) = build_find_storage(&mut temp,&mut self.drives[drive].names,
                &host_dir,&dir_key,&pattern,attribs,dir_comps.is_empty()) {
            debug!("search in {} failed: {}",host_dir.display(),e);
            self.trans.set_status(super::types::status::FILE_NOT_FOUND);
            return;
        }
        debug!("search in {} matched {} entries",host_dir.display(),temp.count);
        let index = match slot_by_dta(&self.finds,dta) {
            Some(i) => {
                debug!("DTA {:08x} already has a slot, reusing",dta);
                i
            },
            None => match free_slot(&self.finds) {
                Some(i) => i,
                None => {
                    debug!("search table is full");
                    self.trans.set_status(super::types::status::NO_MORE_FILES);
                    return;
                }
            }
        };
        temp.dta = dta;
        self.finds[index] = temp;
        self.trans.set_status(super::types::status::OK);
    }

    pub(super) fn fsnext(&mut self,frame: &crate::bus::CommandFrame) {
        let mut params = frame.params();
        let dta = params.u32();
        let dir_index = params.u16() as usize;
        let index = match slot_by_dta(&self.finds,dta) {
            Some(i) => i,
            None => {
                debug!("Fsnext({:08x}): no search slot for this DTA",dta);
                self.trans.set_status(super::types::status::NO_MORE_FILES);
                return;
            }
        };
        let remaining = self.finds[index].count.saturating_sub(dir_index);
        if remaining==0 {
            debug!("Fsnext({:08x}): exhausted, releasing slot",dta);
            self.finds[index].clear();
            self.trans.set_status(super::types::status::NO_MORE_FILES);
            return;
        }
        let to_send = usize::min(remaining,RECORDS_PER_BLOCK);
        debug!("Fsnext({:08x}): sending {} records from index {}",dta,to_send,dir_index);
        self.trans.add_word(to_send as u16);
        let beg = dir_index*DIR_RECORD_SIZE;
        let end = beg + to_send*DIR_RECORD_SIZE;
        let block = self.finds[index].buffer[beg..end].to_vec();
        self.trans.add_bytes(&block,true);
        self.trans.set_status(super::types::status::OK);
    }

    /// the guest is done paging, release the slot whether or not it ran dry
    pub(super) fn fsnext_release(&mut self,frame: &crate::bus::CommandFrame) {
        let dta = frame.params().u32();
        let index = match slot_by_dta(&self.finds,dta) {
            Some(i) => i,
            None => {
                debug!("release({:08x}): no search slot for this DTA",dta);
                self.trans.set_status(super::types::status::INVALID_HANDLE);
                return;
            }
        };
        self.finds[index].clear();
        self.trans.set_status(super::types::status::OK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let rec = DirRecord {
            attr: attrib::DIRECTORY,
            time: 0x1234,
            date: 0x5678,
            size: 0x01020304,
            name: "GAMES".to_string()
        };
        let bytes = rec.pack();
        assert_eq!(bytes.len(),DIR_RECORD_SIZE);
        assert_eq!(bytes[0],attrib::DIRECTORY);
        assert_eq!(&bytes[1..3],&[0x12,0x34]);
        assert_eq!(&bytes[3..5],&[0x56,0x78]);
        assert_eq!(&bytes[5..9],&[1,2,3,4]);
        assert_eq!(&bytes[9..14],b"GAMES");
        assert_eq!(&bytes[14..],&[0;9]);
    }

    #[test]
    fn short_names() {
        let mut names = NameMap::new();
        assert_eq!(names.short_name("\\","HELLO.TXT"),"HELLO.TXT");
        assert_eq!(names.short_name("\\","readme.md"),"README.MD");
        let s1 = names.short_name("\\","a rather long name.txt");
        assert_eq!(s1,"ARATHE~1.TXT");
        let s2 = names.short_name("\\","a rather long novel.txt");
        assert_eq!(s2,"ARATHE~2.TXT");
        // stable on repeat
        assert_eq!(names.short_name("\\","a rather long name.txt"),"ARATHE~1.TXT");
        assert_eq!(names.host_name("\\","ARATHE~2.TXT"),Some(&"a rather long novel.txt".to_string()));
        assert_eq!(names.host_name("\\","ARATHE~9.TXT"),None);
    }

    #[test]
    fn attrib_filtering() {
        assert!(attrib_match(0,0));
        assert!(attrib_match(attrib::ARCHIVE,0));
        assert!(!attrib_match(attrib::DIRECTORY,0));
        assert!(attrib_match(attrib::DIRECTORY,attrib::DIRECTORY));
        assert!(!attrib_match(attrib::HIDDEN,attrib::DIRECTORY));
        assert!(attrib_match(attrib::HIDDEN,attrib::HIDDEN | attrib::DIRECTORY));
    }

    #[test]
    fn storage_build() {
        let dir = tempfile::tempdir().expect("no temp dir");
        std::fs::write(dir.path().join("ALPHA.TXT"),b"aaa").expect("write failed");
        std::fs::write(dir.path().join("beta.doc"),b"bb").expect("write failed");
        std::fs::create_dir(dir.path().join("SUB")).expect("mkdir failed");
        let mut names = NameMap::new();
        let mut slot = FindSlot::new();
        build_find_storage(&mut slot,&mut names,dir.path(),"\\","*.*",0,false).expect("walk failed");
        assert_eq!(slot.count,2); // no directory bit requested
        build_find_storage(&mut slot,&mut names,dir.path(),"\\","*.*",attrib::DIRECTORY,false).expect("walk failed");
        assert_eq!(slot.count,3);
        build_find_storage(&mut slot,&mut names,dir.path(),"\\","*.TXT",0,false).expect("walk failed");
        assert_eq!(slot.count,1);
        assert_eq!(&slot.buffer[9..18],b"ALPHA.TXT");
    }
}
