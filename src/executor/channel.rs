//! Control channel framing between the executor and the container.
//!
//! Host → container: 4-byte requests `u16 pid, u8 op, u8 pad`. A Create
//! request carries the sandbox's descriptors as `SCM_RIGHTS`.
//!
//! Container → host: 8-byte status records `u16 pid, u16 pad, i32 status`.

use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use tokio::io::Interest;
use tokio::net::UnixStream;

pub const REQUEST_SIZE: usize = 4;
pub const STATUS_SIZE: usize = 8;

/// Status records buffered per read by the Receiver.
pub const RECEIVE_BUFFER_RECORDS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Create = 0,
    Kill = 1,
    Suspend = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub pid: u16,
    pub op: Op,
}

impl Request {
    pub fn new(pid: u16, op: Op) -> Self {
        Self { pid, op }
    }

    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let pid = self.pid.to_le_bytes();
        [pid[0], pid[1], self.op as u8, 0]
    }

    pub fn decode(buf: &[u8; REQUEST_SIZE]) -> Option<Self> {
        let pid = u16::from_le_bytes([buf[0], buf[1]]);
        let op = match buf[2] {
            0 => Op::Create,
            1 => Op::Kill,
            2 => Op::Suspend,
            _ => return None,
        };
        Some(Self { pid, op })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub pid: u16,
    /// POSIX wait status of the sandboxed process.
    pub status: i32,
}

impl StatusRecord {
    pub fn encode(&self) -> [u8; STATUS_SIZE] {
        let mut buf = [0u8; STATUS_SIZE];
        buf[0..2].copy_from_slice(&self.pid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.status.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            pid: u16::from_le_bytes([buf[0], buf[1]]),
            status: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Parses every complete record in `buf[..len]`, moves the trailing partial
/// record (if any) to the front of `buf`, and returns the new length.
pub fn drain_records(buf: &mut [u8], len: usize, mut f: impl FnMut(StatusRecord)) -> usize {
    let complete = len - len % STATUS_SIZE;
    for chunk in buf[..complete].chunks_exact(STATUS_SIZE) {
        f(StatusRecord::decode(chunk));
    }
    buf.copy_within(complete..len, 0);
    len - complete
}

/// Writes `data` to a stream socket, attaching `fds` to the first byte.
///
/// The descriptors stay owned by the caller; the kernel duplicates them into
/// the message.
pub async fn send_with_fds(stream: &UnixStream, data: &[u8], fds: &[RawFd]) -> io::Result<()> {
    let mut sent = 0;
    let mut with_fds = !fds.is_empty();

    while sent < data.len() {
        stream.writable().await?;

        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&data[sent..])];
            let rights = [ControlMessage::ScmRights(fds)];
            let cmsgs: &[ControlMessage<'_>] = if with_fds { &rights } else { &[] };
            sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None)
                .map_err(io::Error::from)
        });

        match result {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                sent += n;
                with_fds = false;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
