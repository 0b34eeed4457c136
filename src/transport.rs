//! ## Transport module
//!
//! Moves structured payloads across the half-duplex channel.  The outgoing
//! payload is staged in a scratch buffer by the `add_*` appenders, then
//! `send_data_and_status` streams it to the guest in 512-byte chunks, each
//! chunk gated by a flow-control signal from the device.  Incoming parameter
//! payloads are pulled by `recv_data` with the same chunking in the other
//! direction.
//!
//! The guest side DMA engine imposes the rules enforced here: transfer
//! lengths padded to multiples of 16, chunks of at most 512 bytes, whole
//! payloads capped at 16 MiB, and word-aligned (even) chunk totals.
//!
//! Immediately before the first physical byte of a response goes out, the
//! whole response is snapshotted.  If the device reports that the guest
//! missed the response, the caller replays the snapshot verbatim with
//! `send_data_and_status(true)`; the filesystem operation that produced it
//! is never re-run.

use log::{debug,error};
use crate::bus::{Channel,Select,Signal};
use crate::bus::{CTRL_FRAME_SIZE,CTRL_DATA_WRITE,CTRL_DATA_READ,CTRL_SEND_STATUS,DATA_MARKER,WAIT_TIMEOUT_MS};
use crate::{DYNERR,STDRESULT};

/// Bulk transfers move at most this many payload bytes per exchange.
pub const CHUNK_SIZE: usize = 512;
/// No single logical payload may exceed this (24-bit length field).
pub const MAX_PAYLOAD: usize = 0xffffff;
/// Capacity of the outgoing scratch buffer.
pub const BUFFER_SIZE: usize = 1024*1024;
/// status placeholder sent in a write-direction control frame
const STATUS_INVALID: u8 = 0xff;

/// Enumerates transport errors.  The `Display` trait will print the long message.
#[derive(thiserror::Error,Debug)]
pub enum Error {
    #[error("timed out waiting for bus signal")]
    SignalTimeout,
    #[error("payload exceeds transfer limit")]
    Oversize,
    #[error("nothing was snapshotted for retry")]
    NoSnapshot
}

/// Direction of the data phase, from the guest's point of view:
/// `Read` means the guest reads from us, `Write` means it writes to us.
#[derive(PartialEq,Eq,Clone,Copy,Debug)]
pub enum Direction {
    Unknown,
    Read,
    Write
}

/// Owned copy of a fully assembled response, taken just before transmission
/// so a missed response can be replayed without re-running the operation
/// that produced it (which may not be idempotent, e.g. file creation).
#[derive(Clone)]
pub struct RetrySnapshot {
    direction: Direction,
    bytes: Vec<u8>,
    status_was_set: bool,
    status: u8
}

/// Owns the channel and the staging buffers for one bus target.
pub struct DataTransport {
    com: Box<dyn Channel>,
    select: Select,
    buffer: Vec<u8>,
    status: u8,
    status_was_set: bool,
    direction: Direction,
    snapshot: Option<RetrySnapshot>,
    dump_next: bool
}

impl DataTransport {
    /// Create a transport serving `select` over the given channel.
    /// The transport takes ownership of the channel.
    pub fn new(com: Box<dyn Channel>,select: Select) -> Self {
        Self {
            com,
            select,
            buffer: Vec::with_capacity(CHUNK_SIZE),
            status: 0,
            status_was_set: false,
            direction: Direction::Unknown,
            snapshot: None,
            dump_next: false
        }
    }
    /// Reset the staged payload and status.  The direction is reset only if
    /// `clear_direction`; a failed write transfer keeps its direction so a
    /// subsequent retry still knows the data phase already happened.
    pub fn clear(&mut self,clear_direction: bool) {
        self.buffer.clear();
        self.status = 0;
        self.status_was_set = false;
        if clear_direction {
            self.direction = Direction::Read;
        }
        self.dump_next = false;
    }
    pub fn set_status(&mut self,stat: u8) {
        self.status = stat;
        self.status_was_set = true;
    }
    pub fn status(&self) -> (u8,bool) {
        (self.status,self.status_was_set)
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    /// count of bytes staged so far
    pub fn count(&self) -> usize {
        self.buffer.len()
    }
    /// staged bytes, mainly for inspection by tests
    pub fn staged(&self) -> &[u8] {
        &self.buffer
    }
    fn grow_check(&self,add: usize) {
        // callers size their payloads against MAX_IO_BYTES and sector counts,
        // so running out of scratch space is a bug, not a runtime condition
        assert!(self.buffer.len() + add <= BUFFER_SIZE,"transfer buffer overflow");
    }
    pub fn add_byte(&mut self,val: u8) {
        self.grow_check(1);
        self.buffer.push(val);
    }
    pub fn add_word(&mut self,val: u16) {
        self.grow_check(2);
        self.buffer.extend_from_slice(&val.to_be_bytes());
    }
    pub fn add_dword(&mut self,val: u32) {
        self.grow_check(4);
        self.buffer.extend_from_slice(&val.to_be_bytes());
    }
    pub fn add_bytes(&mut self,data: &[u8],pad_to_mul16: bool) {
        self.grow_check(data.len());
        self.buffer.extend_from_slice(data);
        if pad_to_mul16 {
            self.pad_to_mul16();
        }
    }
    /// append the string bytes plus a NUL terminator
    pub fn add_c_string(&mut self,data: &str,pad_to_mul16: bool) {
        self.grow_check(data.len()+1);
        self.buffer.extend_from_slice(data.as_bytes());
        self.buffer.push(0);
        if pad_to_mul16 {
            self.pad_to_mul16();
        }
    }
    /// Zero-fill up to the next multiple of 16 bytes.  Idempotent.
    pub fn pad_to_mul16(&mut self) {
        let m = self.buffer.len() % 16;
        if m != 0 {
            self.grow_check(16-m);
            self.buffer.resize(self.buffer.len() + 16 - m,0);
        }
    }
    /// zero-fill until the staged count reaches `final_count`
    pub fn add_zeros_until(&mut self,final_count: usize) {
        if final_count > self.buffer.len() {
            self.grow_check(final_count - self.buffer.len());
            self.buffer.resize(final_count,0);
        }
    }
    /// log a hex dump of the next outgoing payload
    pub fn dump_once(&mut self) {
        self.dump_next = true;
    }
    fn dump_data(&self) {
        debug!("outgoing payload: {} bytes",self.buffer.len());
        for row in self.buffer.chunks(32) {
            debug!("{}",hex::encode(row));
        }
    }

    /// Pull `count` parameter bytes from the guest.  This announces a write
    /// data phase to the device, then exchanges chunks of up to 512 bytes,
    /// each gated on a write-more-data signal.  On timeout the transfer state
    /// is cleared, the direction is kept for a possible retry, and the
    /// timeout is returned as an error.
    pub fn recv_data(&mut self,count: usize) -> Result<Vec<u8>,DYNERR> {
        self.direction = Direction::Write;
        if count > MAX_PAYLOAD {
            error!("refusing to receive more than 16 MiB");
            return Err(Box::new(Error::Oversize));
        }
        let mut ctrl = [0;CTRL_FRAME_SIZE];
        ctrl[3] = CTRL_DATA_WRITE;
        ctrl[4] = (count >> 16) as u8;
        ctrl[5] = (count >> 8) as u8;
        ctrl[6] = count as u8;
        ctrl[7] = STATUS_INVALID; // real status follows on the status phase
        self.com.transact(self.select,&ctrl)?;

        let mut dest: Vec<u8> = Vec::with_capacity(count);
        let mut remaining = count;
        while remaining > 0 {
            let sub = usize::min(remaining,CHUNK_SIZE);
            let header = self.com.wait_for_signal(self.select,Signal::WriteMoreData,WAIT_TIMEOUT_MS)?;
            if header.is_none() {
                debug!("write-more-data signal never came, aborting transfer");
                self.clear(false);
                return Err(Box::new(Error::SignalTimeout));
            }
            let tx = vec![0;sub+4];
            let rx = self.com.transact(self.select,&tx)?;
            dest.extend_from_slice(&rx[2..2+sub]); // skip the sequence header
            remaining -= sub;
        }
        Ok(dest)
    }

    /// Send the staged response.  For a write-direction command only the
    /// status byte goes out (the data phase already ran in `recv_data`).
    /// For a read-direction command a control frame announces length and
    /// status, the payload streams out in gated chunks, and the status byte
    /// follows separately once the device raises get-status.  If neither data
    /// nor status was staged, nothing is sent at all.
    ///
    /// With `from_retry` the previously captured snapshot is replayed
    /// verbatim in place of the live buffer.
    pub fn send_data_and_status(&mut self,from_retry: bool) -> STDRESULT {
        if from_retry {
            let snap = match self.snapshot.clone() {
                Some(s) => s,
                None => {
                    error!("retry requested but nothing was snapshotted");
                    return Err(Box::new(Error::NoSnapshot));
                }
            };
            debug!("replaying snapshotted response: {} bytes, status {:02x}",snap.bytes.len(),snap.status);
            self.direction = snap.direction;
            self.buffer = snap.bytes;
            self.status_was_set = snap.status_was_set;
            self.status = snap.status;
        } else {
            self.snapshot = Some(RetrySnapshot {
                direction: self.direction,
                bytes: self.buffer.clone(),
                status_was_set: self.status_was_set,
                status: self.status
            });
        }

        if self.direction == Direction::Write {
            let res = self.send_status_phase();
            if res.is_ok() {
                self.clear(true);
            }
            return res;
        }

        if self.buffer.is_empty() && !self.status_was_set {
            // command was not for us and produced nothing, stay silent
            return Ok(());
        }

        if self.dump_next {
            self.dump_data();
            self.dump_next = false;
        }

        if self.buffer.len() > MAX_PAYLOAD {
            error!("refusing to send more than 16 MiB");
            return Err(Box::new(Error::Oversize));
        }
        let count = self.buffer.len();
        let mut ctrl = [0;CTRL_FRAME_SIZE];
        ctrl[3] = CTRL_DATA_READ;
        ctrl[4] = (count >> 16) as u8;
        ctrl[5] = (count >> 8) as u8;
        ctrl[6] = count as u8;
        ctrl[7] = self.status;
        self.com.transact(self.select,&ctrl)?;

        self.send_chunks()?;
        let res = self.send_status_phase();
        if res.is_ok() {
            self.clear(true);
        }
        res
    }

    /// stream the staged buffer in gated chunks, rounding odd totals up to
    /// the next word since the bus moves 16-bit words
    fn send_chunks(&mut self) -> STDRESULT {
        let mut data = self.buffer.clone();
        if data.len() % 2 != 0 {
            data.push(0);
        }
        let mut offset = 0;
        while offset < data.len() {
            let header = self.com.wait_for_signal(self.select,Signal::ReadMoreData,WAIT_TIMEOUT_MS)?;
            if header.is_none() {
                debug!("read-more-data signal never came, aborting transfer");
                self.clear(true);
                return Err(Box::new(Error::SignalTimeout));
            }
            let sub = usize::min(data.len()-offset,CHUNK_SIZE);
            let mut tx: Vec<u8> = Vec::with_capacity(sub+4);
            tx.push(0);
            tx.push(DATA_MARKER);
            tx.extend_from_slice(&data[offset..offset+sub]);
            tx.extend_from_slice(&[0,0]); // terminating zero word
            self.com.transact(self.select,&tx)?;
            offset += sub;
        }
        Ok(())
    }

    /// wait for the device to ask for status, then transmit the status byte
    fn send_status_phase(&mut self) -> STDRESULT {
        let header = self.com.wait_for_signal(self.select,Signal::GetStatus,WAIT_TIMEOUT_MS)?;
        if header.is_none() {
            debug!("get-status signal never came, dropping status {:02x}",self.status);
            self.clear(true);
            return Err(Box::new(Error::SignalTimeout));
        }
        let mut tx = [0;CTRL_FRAME_SIZE];
        tx[1] = CTRL_SEND_STATUS;
        tx[2] = self.status;
        self.com.transact(self.select,&tx)?;
        Ok(())
    }

    /// Wait for the device to announce a waiting command frame.
    /// Returns the signal header, or None on timeout.
    pub fn wait_for_command(&mut self,timeout_ms: u64) -> Result<Option<[u8;crate::bus::SIGNAL_HEADER_SIZE]>,DYNERR> {
        self.com.wait_for_signal(self.select,Signal::Command,timeout_ms)
    }

    /// Clock in the announced command frame (2-byte sequence header skipped).
    pub fn fetch_command(&mut self) -> Result<Vec<u8>,DYNERR> {
        let tx = vec![0;crate::bus::CMD_FRAME_SIZE+2];
        let rx = self.com.transact(self.select,&tx)?;
        Ok(rx[2..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SIGNAL_HEADER_SIZE;

    /// channel that accepts anything and never signals
    struct NullChannel {}
    impl Channel for NullChannel {
        fn transact(&mut self,_s: Select,tx: &[u8]) -> Result<Vec<u8>,DYNERR> {
            Ok(vec![0;tx.len()])
        }
        fn wait_for_signal(&mut self,_s: Select,_sig: Signal,_t: u64) -> Result<Option<[u8;SIGNAL_HEADER_SIZE]>,DYNERR> {
            Ok(None)
        }
    }

    fn transport() -> DataTransport {
        DataTransport::new(Box::new(NullChannel{}),Select::Disk)
    }

    #[test]
    fn big_endian_appenders() {
        let mut trans = transport();
        trans.add_byte(0x12);
        trans.add_word(0x3456);
        trans.add_dword(0x789abcde);
        assert_eq!(trans.staged(),&[0x12,0x34,0x56,0x78,0x9a,0xbc,0xde]);
        assert_eq!(trans.count(),7);
    }

    #[test]
    fn c_string_includes_terminator() {
        let mut trans = transport();
        trans.add_c_string("HELLO",false);
        assert_eq!(trans.staged(),b"HELLO\0");
    }

    #[test]
    fn pad_is_idempotent() {
        let mut trans = transport();
        trans.pad_to_mul16();
        assert_eq!(trans.count(),0);
        trans.add_bytes(&[1,2,3],false);
        trans.pad_to_mul16();
        assert_eq!(trans.count(),16);
        trans.pad_to_mul16();
        assert_eq!(trans.count(),16);
        assert_eq!(&trans.staged()[3..],&[0;13]);
    }

    #[test]
    fn zeros_until() {
        let mut trans = transport();
        trans.add_byte(0xaa);
        trans.add_zeros_until(8);
        assert_eq!(trans.staged(),&[0xaa,0,0,0,0,0,0,0]);
        trans.add_zeros_until(4); // never shrinks
        assert_eq!(trans.count(),8);
    }

    #[test]
    fn clear_direction_policy() {
        let mut trans = transport();
        assert_eq!(trans.direction(),Direction::Unknown);
        trans.clear(true);
        assert_eq!(trans.direction(),Direction::Read);
        let _ = trans.recv_data(4); // times out, keeps direction
        assert_eq!(trans.direction(),Direction::Write);
        assert_eq!(trans.count(),0);
    }
}
