//! A scripted stand-in for the container binary.
//!
//! The fake speaks the control protocol over one end of a socket pair and
//! runs each created process as a thread executing a test script in place
//! of the sandboxed program.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{IoSliceMut, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;
use std::os::unix::net::UnixStream as StdStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

use gatehouse::config::ExecutorConfig;
use gatehouse::executor::channel::{Op, Request, StatusRecord, REQUEST_SIZE};
use gatehouse::image::{ImageDir, MANIFEST_FILE, STATE_FILE, TEXT_FILE};
use gatehouse::packet::{self, Packet, HEADER_SIZE};
use gatehouse::runtime::image_info::{StackVars, IMAGE_INFO_SIZE};
use gatehouse::runtime::ImageInfo;
use gatehouse::Executor;

/// How a scripted program ends.
#[derive(Debug, Clone, Copy)]
pub enum Exit {
    Code(i32),
    Signal(i32),
}

impl Exit {
    fn wait_status(self) -> i32 {
        match self {
            Exit::Code(code) => (code & 0xff) << 8,
            Exit::Signal(signal) => signal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Kill,
    Suspend,
}

pub type Script = Arc<dyn Fn(&mut Sandbox) -> Exit + Send + Sync>;

#[derive(Default)]
struct Signals {
    killed: AtomicBool,
    suspended: AtomicBool,
}

/// What a scripted program sees of its sandbox.
pub struct Sandbox {
    pub info: ImageInfo,
    /// State, text and (when requested) debug descriptors.
    pub fds: Vec<OwnedFd>,
    input: StdStream,
    output: File,
    signals: Arc<Signals>,
}

impl Sandbox {
    pub fn write_packet(&mut self, packet: &Packet) {
        self.write_raw(packet.as_bytes());
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        let _ = self.output.write_all(bytes);
    }

    /// Blocks for the next packet from the host. `None` once the input is
    /// closed.
    pub fn read_packet(&mut self) -> Option<Packet> {
        let mut buf = vec![0u8; HEADER_SIZE];
        self.input.read_exact(&mut buf).ok()?;
        let size = packet::peek_size(&buf) as usize;
        buf.resize(size, 0);
        self.input.read_exact(&mut buf[HEADER_SIZE..]).ok()?;
        Packet::parse(buf).ok()
    }

    pub fn write_debug(&mut self, text: &str) {
        let fd = self.fds.get(2).expect("no debug descriptor");
        let mut file = File::from(fd.try_clone().unwrap());
        file.write_all(text.as_bytes()).unwrap();
    }

    /// Records how far the program got, the way the loader does before a
    /// suspended program exits.
    pub fn write_stack_vars(&self, vars: StackVars) {
        let state = File::from(self.fds[0].try_clone().unwrap());
        state.write_all_at(&vars.encode(), 0).unwrap();
    }

    /// Waits until the host kills or suspends the program.
    pub fn wait_signal(&self) -> Signal {
        loop {
            if self.signals.killed.load(Ordering::Acquire) {
                return Signal::Kill;
            }
            if self.signals.suspended.load(Ordering::Acquire) {
                return Signal::Suspend;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Waits until the host kills the program, ignoring suspension.
    pub fn wait_kill(&self) {
        while !self.signals.killed.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

struct Running {
    signals: Arc<Signals>,
    input: StdStream,
}

/// Container side of the control connection.
pub struct FakeContainer {
    control: StdStream,
    thread: Option<JoinHandle<()>>,
}

impl FakeContainer {
    /// Starts the fake and an executor connected to it.
    pub fn start(max_procs: usize, script: Script) -> (Executor, FakeContainer) {
        let (host, container) = StdStream::pair().unwrap();
        host.set_nonblocking(true).unwrap();
        let host = tokio::net::UnixStream::from_std(host).unwrap();

        let config = ExecutorConfig {
            max_procs,
            ..Default::default()
        };
        let executor = Executor::with_stream(host, &config).unwrap();
        let control = container.try_clone().unwrap();
        let thread = thread::spawn(move || serve(container, script));
        (
            executor,
            FakeContainer {
                control,
                thread: Some(thread),
            },
        )
    }

    /// Drops the control connection as a crashing container would. Running
    /// programs are killed and their statuses never reach the executor.
    pub fn hang_up(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }

    /// Waits for the fake to see the executor hang up.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

fn serve(control: StdStream, script: Script) {
    let writer = Arc::new(Mutex::new(control.try_clone().unwrap()));
    let running: Arc<Mutex<HashMap<u16, Running>>> = Arc::default();
    let mut sandboxes = Vec::new();

    while let Some((request, fds)) = read_request(&control) {
        match request.op {
            Op::Create => {
                let mut fds = fds.into_iter();
                let input = StdStream::from(fds.next().expect("create without input"));
                let output = File::from(fds.next().expect("create without output"));
                let signals = Arc::new(Signals::default());
                running.lock().unwrap().insert(
                    request.pid,
                    Running {
                        signals: signals.clone(),
                        input: input.try_clone().unwrap(),
                    },
                );
                let script = script.clone();
                let writer = writer.clone();
                let running = running.clone();
                sandboxes.push(thread::spawn(move || {
                    run_sandbox(request.pid, input, output, signals, script, writer, running)
                }));
            }
            Op::Kill => {
                if let Some(proc) = running.lock().unwrap().get(&request.pid) {
                    proc.signals.killed.store(true, Ordering::Release);
                    let _ = proc.input.shutdown(Shutdown::Both);
                }
            }
            Op::Suspend => {
                if let Some(proc) = running.lock().unwrap().get(&request.pid) {
                    proc.signals.suspended.store(true, Ordering::Release);
                }
            }
        }
    }

    // The executor hung up: terminate everything, then hang up in turn.
    for proc in running.lock().unwrap().values() {
        proc.signals.killed.store(true, Ordering::Release);
        let _ = proc.input.shutdown(Shutdown::Both);
    }
    for sandbox in sandboxes {
        let _ = sandbox.join();
    }
    let _ = control.shutdown(Shutdown::Both);
}

fn run_sandbox(
    pid: u16,
    input: StdStream,
    output: File,
    signals: Arc<Signals>,
    script: Script,
    writer: Arc<Mutex<StdStream>>,
    running: Arc<Mutex<HashMap<u16, Running>>>,
) {
    let exit = match read_image(&input) {
        Some((info, fds)) => {
            let mut sandbox = Sandbox {
                info,
                fds,
                input,
                output,
                signals: signals.clone(),
            };
            let exit = script(&mut sandbox);
            // Closes the output and debug pipes before the status is sent.
            drop(sandbox);
            exit
        }
        None => {
            drop(output);
            Exit::Signal(libc::SIGKILL)
        }
    };

    let exit = if signals.killed.load(Ordering::Acquire) {
        Exit::Signal(libc::SIGKILL)
    } else {
        exit
    };

    running.lock().unwrap().remove(&pid);
    let record = StatusRecord {
        pid,
        status: exit.wait_status(),
    };
    let _ = writer.lock().unwrap().write_all(&record.encode());
}

/// Reads one request and the descriptors attached to it.
fn read_request(control: &StdStream) -> Option<(Request, Vec<OwnedFd>)> {
    let mut buf = [0u8; REQUEST_SIZE];
    let (n, fds) = recv_with_fds(control.as_raw_fd(), &mut buf)?;
    if n == 0 {
        return None;
    }
    let mut reader = control;
    reader.read_exact(&mut buf[n..]).ok()?;
    Some((Request::decode(&buf)?, fds))
}

/// Reads the image header the host sends before any packet.
fn read_image(input: &StdStream) -> Option<(ImageInfo, Vec<OwnedFd>)> {
    let mut buf = [0u8; IMAGE_INFO_SIZE];
    let (n, fds) = recv_with_fds(input.as_raw_fd(), &mut buf)?;
    if n == 0 {
        return None;
    }
    let mut reader = input;
    reader.read_exact(&mut buf[n..]).ok()?;
    Some((ImageInfo::decode(&buf)?, fds))
}

/// Receives into `buf` along with any `SCM_RIGHTS` descriptors.
pub fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> Option<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut space = nix::cmsg_space!([RawFd; 4]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut space), MsgFlags::MSG_CMSG_CLOEXEC).ok()?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().ok()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: the kernel installed these descriptors for us alone.
            fds.extend(
                received
                    .into_iter()
                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
            );
        }
    }
    Some((msg.bytes, fds))
}

pub const MANIFEST: &str = r#"
page_size = 4096
text_size = 4096
stack_size = 65536
globals_size = 16
mem_size = 65536
max_mem_size = 131072
entry_addr = 64
"#;

/// Writes a minimal image directory.
pub fn write_image(dir: &Path, manifest: &str) -> ImageDir {
    fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    fs::write(dir.join(TEXT_FILE), vec![0u8; 4096]).unwrap();
    fs::write(dir.join(STATE_FILE), vec![0u8; 65536 + 65536]).unwrap();
    ImageDir::open(dir).unwrap()
}
