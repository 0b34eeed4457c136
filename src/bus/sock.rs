//! ### Socket channel
//!
//! A `Channel` running over a Unix domain socket, standing in for the real bus
//! interface so the bridge can be exercised on a plain PC.  The peer is a
//! device emulator (usually a test harness) that speaks a simple lock-step
//! framing:
//!
//! * us -> peer: `[len u16 BE][tx bytes]`, answered by exactly `len` rx bytes
//! * peer -> us, only while we are waiting for a signal: `[code u8][8 header bytes]`
//!
//! The peer must never send anything unsolicited outside a signal wait; the
//! bus is half duplex and so is this stand-in.

use std::io::{Read,Write};
use std::os::unix::net::{UnixListener,UnixStream};
use std::time::Duration;
use log::{debug,warn};
use crate::DYNERR;
use super::{Channel,Error,Select,Signal,SIGNAL_HEADER_SIZE};

pub struct SocketChannel {
    stream: UnixStream
}

impl SocketChannel {
    /// Bind `path` and block until the device emulator connects.
    pub fn listen(path: &str) -> Result<Self,DYNERR> {
        if std::fs::metadata(path).is_ok() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        debug!("listening on {}",path);
        let (stream,_addr) = listener.accept()?;
        debug!("device emulator connected");
        Ok(Self { stream })
    }
    /// Connect to a device emulator that is already listening on `path`.
    pub fn connect(path: &str) -> Result<Self,DYNERR> {
        let stream = UnixStream::connect(path)?;
        Ok(Self { stream })
    }
    fn read_exact_timeout(&mut self,buf: &mut [u8],timeout_ms: u64) -> Result<bool,DYNERR> {
        self.stream.set_read_timeout(Some(Duration::from_millis(timeout_ms)))?;
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind()==std::io::ErrorKind::WouldBlock || e.kind()==std::io::ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(Box::new(e))
        }
    }
}

impl Channel for SocketChannel {
    fn transact(&mut self,_select: Select,tx: &[u8]) -> Result<Vec<u8>,DYNERR> {
        let len = tx.len();
        if len > u16::MAX as usize {
            return Err(Box::new(Error::LengthMismatch));
        }
        self.stream.write_all(&(len as u16).to_be_bytes())?;
        self.stream.write_all(tx)?;
        let mut rx = vec![0;len];
        // a transact has no timeout of its own, but a vanished peer should not hang us forever
        if !self.read_exact_timeout(&mut rx,5000)? {
            return Err(Box::new(Error::Closed));
        }
        Ok(rx)
    }
    fn wait_for_signal(&mut self,_select: Select,signal: Signal,timeout_ms: u64) -> Result<Option<[u8;SIGNAL_HEADER_SIZE]>,DYNERR> {
        let mut code = [0;1];
        if !self.read_exact_timeout(&mut code,timeout_ms)? {
            return Ok(None);
        }
        let mut header = [0;SIGNAL_HEADER_SIZE];
        if !self.read_exact_timeout(&mut header,timeout_ms)? {
            return Ok(None);
        }
        match Signal::from_code(code[0]) {
            Some(got) if got==signal => Ok(Some(header)),
            Some(got) => {
                warn!("waited for {:?} but device raised {:?}",signal,got);
                Ok(None)
            },
            None => {
                warn!("device raised unknown signal {:02x}",code[0]);
                Ok(None)
            }
        }
    }
}
