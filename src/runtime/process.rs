use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::fcntl::OFlag;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::unix::pipe;
use tokio::net::UnixStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debug;
use super::image_info::{
    time_mask, ImageInfo, Layout, INIT_ROUTINE_ENTER, INIT_ROUTINE_RESUME, LAYOUT_RANDOM_SIZE,
    MAGIC_1, MAGIC_2, SEED_SIZE,
};
use super::serve::ServeLoop;
use super::status::{self, Outcome};
use super::{Policy, ProgramCode, ProgramState, MAX_MEMORY_SIZE, MAX_STACK_SIZE};
use crate::error::{Error, Result};
use crate::executor::channel;
use crate::executor::{ExecutionRecord, KillRequest, Shared};
use crate::service::ServiceRegistry;
use crate::snapshot::{Buffers, FLAG_TERMINATED};
use crate::trap::TrapId;

/// Host ends of the program's I/O.
pub(crate) struct Pipes {
    /// Packets and the image header go to the program through this socket.
    pub input: UnixStream,
    /// Packets from the program.
    pub output: pipe::Receiver,
}

/// Kill and suspend requests for one execution record.
pub(crate) struct Control {
    shared: Arc<Shared>,
    record: Arc<ExecutionRecord>,
}

impl Control {
    pub(crate) fn id(&self) -> u16 {
        self.record.slot()
    }

    pub(crate) async fn kill(&self) {
        if !self.record.mark_killed() {
            return;
        }
        debug!("Killing process {}", self.id());
        let req = KillRequest::Kill(self.record.clone());
        if self.shared.kill_tx.send(req).await.is_err() {
            debug!("Executor gone, kill of process {} not sent", self.id());
        }
    }

    /// Kill from a synchronous context. Falls back to a task when the
    /// queue is full.
    fn kill_nowait(&self) {
        if !self.record.mark_killed() {
            return;
        }
        match self
            .shared
            .kill_tx
            .try_send(KillRequest::Kill(self.record.clone()))
        {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(req)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let kill_tx = self.shared.kill_tx.clone();
                    runtime.spawn(async move {
                        let _ = kill_tx.send(req).await;
                    });
                }
            }
        }
    }

    pub(crate) async fn request_suspend(&self) {
        if !self.record.mark_suspended() {
            return;
        }
        let req = KillRequest::Suspend(self.record.clone());
        if self.shared.kill_tx.send(req).await.is_err() {
            debug!("Executor gone, suspend of process {} not sent", self.id());
        }
    }

    /// Waits for the wait status, or for the executor to die.
    async fn wait_status(&self) -> Result<i32> {
        tokio::select! {
            biased;
            status = self.record.wait() => status,
            _ = self.shared.recv_closed.cancelled() => {
                self.record.lose();
                self.record.wait().await
            }
        }
    }
}

/// A sandboxed program instance.
///
/// Lifecycle: [`start`](Process::start) once, then [`serve`](Process::serve)
/// until the program stops. [`suspend`](Process::suspend) and
/// [`kill`](Process::kill) may be called at any time from any task.
/// Dropping the process kills it.
pub struct Process {
    control: Control,
    pipes: tokio::sync::Mutex<Pipes>,
    debug: Mutex<Option<JoinHandle<io::Result<()>>>>,
    suspend: CancellationToken,
    started: AtomicBool,
}

impl Process {
    pub(crate) fn new(
        shared: Arc<Shared>,
        record: Arc<ExecutionRecord>,
        input: UnixStream,
        output: pipe::Receiver,
    ) -> Self {
        Self {
            control: Control { shared, record },
            pipes: tokio::sync::Mutex::new(Pipes { input, output }),
            debug: Mutex::new(None),
            suspend: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Id of the process within its executor.
    pub fn id(&self) -> u16 {
        self.control.id()
    }

    /// Hands the program image to the sandbox. Nothing changes on failure.
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        code: &dyn ProgramCode,
        state: &dyn ProgramState,
        policy: Policy,
    ) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::Internal(format!(
                "process {} already started",
                self.id()
            )));
        }
        if self.control.shared.is_closed() {
            return Err(Error::ExecutorDead);
        }
        validate(code, state)?;

        let mut random = [0u8; LAYOUT_RANDOM_SIZE + SEED_SIZE];
        let needed = if code.random_seed() {
            random.len()
        } else {
            LAYOUT_RANDOM_SIZE
        };
        OsRng
            .try_fill_bytes(&mut random[..needed])
            .map_err(|e| Error::Internal(format!("reading random bytes: {e}")))?;

        let mut layout_random = [0u8; LAYOUT_RANDOM_SIZE];
        layout_random.copy_from_slice(&random[..LAYOUT_RANDOM_SIZE]);
        let layout = Layout::randomize(code.page_size(), state.text_addr(), &layout_random);

        let mut seed = [0u8; SEED_SIZE];
        seed.copy_from_slice(&random[LAYOUT_RANDOM_SIZE..]);

        let stack_unused = state.stack_size() - state.stack_usage();
        let info = ImageInfo {
            magic1: MAGIC_1,
            page_size: code.page_size(),
            text_addr: layout.text_addr,
            stack_addr: layout.stack_addr,
            heap_addr: layout.heap_addr,
            random: seed,
            text_size: code.text_size(),
            stack_size: state.stack_size(),
            stack_unused,
            globals_size: state.globals_size(),
            init_memory_size: state.mem_size(),
            grow_memory_size: state.max_mem_size(),
            init_routine: if stack_unused == state.stack_size() {
                INIT_ROUTINE_ENTER
            } else {
                INIT_ROUTINE_RESUME
            },
            start_addr: state.start_addr(),
            entry_addr: state.entry_addr(),
            time_mask: time_mask(policy.time_resolution),
            monotonic_time: state.monotonic_time(),
            magic2: MAGIC_2,
        };

        let state_fd = state.begin_mutation(layout.text_addr)?;

        let (debug_write, copier) = match policy.debug_log {
            Some(log) => {
                let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
                let reader = pipe::Receiver::from_owned_fd(read_end)?;
                (Some(write_end), Some(debug::spawn_copier(reader, log)))
            }
            None => (None, None),
        };

        let mut fds = vec![state_fd.as_raw_fd(), code.text_fd().as_raw_fd()];
        if let Some(fd) = &debug_write {
            fds.push(fd.as_raw_fd());
        }

        let header = info.encode();
        let pipes = self.pipes.lock().await;
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.control.shared.send_closed.cancelled() => Err(Error::ExecutorDead),
            _ = self.control.shared.recv_closed.cancelled() => Err(Error::ExecutorDead),
            sent = channel::send_with_fds(&pipes.input, &header, &fds) => {
                sent.map_err(Error::from)
            }
        };
        drop(pipes);
        drop(debug_write);
        drop(state_fd);

        if let Err(e) = sent {
            if let Some(copier) = copier {
                copier.abort();
            }
            return Err(e);
        }

        *self.debug.lock().unwrap_or_else(|e| e.into_inner()) = copier;
        self.started.store(true, Ordering::Release);
        debug!(
            "Started process {} ({})",
            self.id(),
            if info.is_resume() { "resume" } else { "enter" }
        );
        Ok(())
    }

    /// Runs the program until it stops and reports how it stopped.
    ///
    /// Cancelling `cancel` suspends the program. With `buffers`, the
    /// snapshot I/O is restored before the program runs and replaced with
    /// the I/O still in flight when it stops.
    pub async fn serve(
        &self,
        cancel: &CancellationToken,
        registry: &dyn ServiceRegistry,
        mut buffers: Option<&mut Buffers>,
    ) -> Result<Outcome> {
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::Internal(format!(
                "process {} has not been started",
                self.id()
            )));
        }

        let mut pipes = self.pipes.lock().await;
        let mut serve_loop =
            match ServeLoop::start(&self.control, registry, cancel, buffers.as_deref_mut()).await
            {
                Ok(serve_loop) => serve_loop,
                Err(e) => {
                    self.control.kill().await;
                    let _ = self.control.wait_status().await;
                    return Err(e);
                }
            };

        let looped = serve_loop.run(&mut pipes, cancel, &self.suspend).await;
        if let Err(e) = &looped {
            warn!("Serving process {} failed: {e}", self.id());
            self.control.kill().await;
        }

        let status = self.control.wait_status().await;

        let copier = self.debug.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(copier) = copier {
            if status.is_ok() {
                match copier.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Debug log of process {} failed: {e}", self.id()),
                    Err(e) => warn!("Debug log copier of process {} failed: {e}", self.id()),
                }
            } else {
                copier.abort();
            }
        }

        let decoded =
            status.and_then(|s| status::decode(s, self.control.record.kill_requested()));
        let suspended = matches!(&decoded, Ok(o) if o.trap == TrapId::Suspended);

        match serve_loop.finish(suspended).await {
            Ok(mut in_flight) => {
                if let Some(buffers) = buffers {
                    if !suspended {
                        in_flight.flags |= FLAG_TERMINATED;
                    }
                    *buffers = in_flight;
                }
            }
            Err(e) if suspended => return Err(e),
            Err(e) => warn!("Stopping services of process {} failed: {e}", self.id()),
        }

        let outcome = match looped {
            Ok(()) => decoded?,
            Err(Error::BadProgram(msg)) => {
                decoded?;
                info!("Process {} violated the ABI: {msg}", self.id());
                Outcome::trap(TrapId::AbiViolation)
            }
            Err(e) => return Err(e),
        };
        debug!("Process {} stopped: {}", self.id(), outcome.trap);
        Ok(outcome)
    }

    /// Asks the program to suspend itself. Does not wait.
    pub fn suspend(&self) {
        self.suspend.cancel();
    }

    /// Terminates the program. Repeated calls have no further effect.
    pub async fn kill(&self) {
        self.control.kill().await;
    }

    /// Kills the program and releases its pipes.
    pub async fn close(self) {
        self.control.kill().await;
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(copier) = self
            .debug
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            copier.abort();
        }
        self.control.kill_nowait();
    }
}

fn validate(code: &dyn ProgramCode, state: &dyn ProgramState) -> Result<()> {
    let page = code.page_size();
    if page == 0 || !page.is_power_of_two() {
        return Err(Error::BadProgram(format!(
            "page size {page} is not a power of two"
        )));
    }
    if code.text_size() % page != 0 {
        return Err(Error::BadProgram(format!(
            "text size {} is not page-aligned",
            code.text_size()
        )));
    }
    if state.stack_size() % page != 0 {
        return Err(Error::BadProgram(format!(
            "stack size {} is not page-aligned",
            state.stack_size()
        )));
    }
    if state.stack_usage() > state.stack_size() {
        return Err(Error::BadProgram(format!(
            "stack usage {} exceeds stack size {}",
            state.stack_usage(),
            state.stack_size()
        )));
    }
    if state.mem_size() > state.max_mem_size() {
        return Err(Error::BadProgram(format!(
            "memory size {} exceeds its maximum {}",
            state.mem_size(),
            state.max_mem_size()
        )));
    }
    if state.max_mem_size() > MAX_MEMORY_SIZE {
        return Err(Error::ResourceLimit(format!(
            "memory size limit {} exceeds {MAX_MEMORY_SIZE}",
            state.max_mem_size()
        )));
    }
    if state.stack_size() > MAX_STACK_SIZE {
        return Err(Error::ResourceLimit(format!(
            "stack size {} exceeds {MAX_STACK_SIZE}",
            state.stack_size()
        )));
    }
    Ok(())
}
