//! Executor: one control connection to a container, multiplexing many
//! sandboxed processes.
//!
//! Two long-lived tasks own the connection. The [`sender::Sender`] writes
//! create, kill and suspend requests; the [`receiver::Receiver`] reads wait
//! statuses and hands them to the matching [`ExecutionRecord`]. Both share
//! the live map (id → record) and the id pool.

pub mod channel;
pub mod container;
mod idpool;
pub mod record;
mod receiver;
mod sender;

pub use container::Connection;
pub use idpool::{IdPool, MAX_PROCS};
pub use record::ExecutionRecord;

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, OnceLock};

use nix::fcntl::OFlag;
use tokio::net::unix::pipe;
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::runtime::Process;
use receiver::Receiver;
use sender::{ExecRequest, Sender, KILL_QUEUE_LEN};

pub(crate) use sender::KillRequest;

/// Records of processes admitted by the Sender and not yet reported on by
/// the Receiver. The lock is never held across I/O.
pub(crate) type LiveMap = Arc<Mutex<HashMap<u16, Arc<ExecutionRecord>>>>;

/// An acquired id that goes back to the pool on drop, unless ownership has
/// moved to the live map.
pub struct SlotLease {
    pool: IdPool,
    slot: u16,
    held: bool,
}

impl SlotLease {
    async fn acquire(pool: &IdPool, cancel: &CancellationToken) -> Result<Self> {
        let slot = pool.acquire(cancel).await?;
        Ok(Self {
            pool: pool.clone(),
            slot,
            held: true,
        })
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// The Receiver (or the Sender's failure path) now releases the slot.
    pub(crate) fn into_live_map(mut self) {
        self.held = false;
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if self.held {
            self.pool.release(self.slot);
        }
    }
}

pub(crate) struct Shared {
    exec_tx: mpsc::Sender<ExecRequest>,
    pub(crate) kill_tx: mpsc::Sender<KillRequest>,
    pool: IdPool,
    pub(crate) send_closed: CancellationToken,
    pub(crate) recv_closed: CancellationToken,
    closing: CancellationToken,
    cgroup: Option<Arc<OwnedFd>>,
    death: Arc<OnceLock<Error>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// True once either half of the control connection has shut down.
    pub(crate) fn is_closed(&self) -> bool {
        self.send_closed.is_cancelled() || self.recv_closed.is_cancelled()
    }
}

/// Handle to a running executor. Clones share the same connection.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    /// Connects to the container selected by `config`, spawning it if
    /// neither an inherited socket nor a daemon socket is configured.
    pub async fn new(config: &ExecutorConfig) -> Result<Self> {
        let max_procs = config.effective_max_procs()?;
        let connection = Connection::from_config(config);
        info!("Connecting to container: {}", connection.description());

        let cgroup = container::open_process_cgroup(&config.container)?;
        let (stream, child) = connection.connect().await?;
        Self::start(stream, max_procs, cgroup, child)
    }

    /// Runs an executor over an already connected control socket.
    pub fn with_stream(stream: UnixStream, config: &ExecutorConfig) -> Result<Self> {
        let max_procs = config.effective_max_procs()?;
        let cgroup = container::open_process_cgroup(&config.container)?;
        Self::start(stream, max_procs, cgroup, None)
    }

    fn start(
        stream: UnixStream,
        max_procs: usize,
        cgroup: Option<Arc<OwnedFd>>,
        child: Option<Child>,
    ) -> Result<Self> {
        let pool = IdPool::new(max_procs)?;
        let (exec_tx, exec_rx) = mpsc::channel(1);
        let (kill_tx, kill_rx) = mpsc::channel(KILL_QUEUE_LEN);
        let live = LiveMap::default();
        let send_closed = CancellationToken::new();
        let recv_closed = CancellationToken::new();
        let closing = CancellationToken::new();
        let death = Arc::new(OnceLock::new());

        let (reader, writer) = stream.into_split();

        tokio::spawn(
            Sender {
                writer,
                exec_rx,
                kill_rx,
                live: live.clone(),
                pool: pool.clone(),
                send_closed: send_closed.clone(),
            }
            .run(),
        );
        tokio::spawn(
            Receiver {
                reader,
                live,
                pool: pool.clone(),
                recv_closed: recv_closed.clone(),
            }
            .run(),
        );

        let reaper = child.map(|child| {
            container::watch(child, closing.clone(), send_closed.clone(), death.clone())
        });

        info!("Executor started with {max_procs} process slots");

        Ok(Self {
            shared: Arc::new(Shared {
                exec_tx,
                kill_tx,
                pool,
                send_closed,
                recv_closed,
                closing,
                cgroup,
                death,
                reaper: Mutex::new(reaper),
            }),
        })
    }

    /// Admits a new sandboxed process. The returned [`Process`] must be
    /// started before it does anything.
    pub async fn new_process(&self, cancel: &CancellationToken) -> Result<Process> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(Error::ExecutorDead);
        }

        let lease = tokio::select! {
            biased;
            _ = shared.send_closed.cancelled() => return Err(Error::ExecutorDead),
            _ = shared.recv_closed.cancelled() => return Err(Error::ExecutorDead),
            lease = SlotLease::acquire(&shared.pool, cancel) => lease?,
        };
        let slot = lease.slot();

        let (host_input, sandbox_input) = std::os::unix::net::UnixStream::pair()?;
        host_input.set_nonblocking(true)?;
        let host_input = UnixStream::from_std(host_input)?;

        let (output_read, output_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        let output = pipe::Receiver::from_owned_fd(output_read)?;

        let record = Arc::new(ExecutionRecord::new(slot));
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = ExecRequest {
            record: record.clone(),
            lease,
            input: OwnedFd::from(sandbox_input),
            output: output_write,
            cgroup: shared.cgroup.clone(),
            reply: reply_tx,
        };

        // A request dropped on any of these paths returns its slot.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = shared.send_closed.cancelled() => return Err(Error::ExecutorDead),
            _ = shared.recv_closed.cancelled() => return Err(Error::ExecutorDead),
            sent = shared.exec_tx.send(req) => sent.map_err(|_| Error::ExecutorDead)?,
        }

        reply_rx.await.map_err(|_| Error::ExecutorDead)??;
        debug!("Admitted process {slot}");

        Ok(Process::new(shared.clone(), record, host_input, output))
    }

    /// Asks the container to terminate every process and waits for the
    /// connection to wind down.
    pub async fn close(&self) -> Result<()> {
        let shared = &self.shared;
        shared.closing.cancel();

        tokio::select! {
            _ = shared.send_closed.cancelled() => {}
            _ = shared.kill_tx.send(KillRequest::Shutdown) => {}
        }
        shared.send_closed.cancelled().await;
        shared.recv_closed.cancelled().await;

        let reaper = shared
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reaper) = reaper {
            reaper
                .await
                .map_err(|e| Error::Internal(format!("container reaper: {e}")))?;
        }

        info!("Executor closed");
        match shared.death.get() {
            Some(_) => Err(Error::ExecutorDead),
            None => Ok(()),
        }
    }

    /// True once either half of the control connection has shut down.
    pub fn is_dead(&self) -> bool {
        self.shared.is_closed()
    }

    /// Completes when the container stops reporting statuses.
    pub async fn dead(&self) {
        self.shared.recv_closed.cancelled().await
    }

    /// Why the container died, if it did so unexpectedly.
    pub fn death_cause(&self) -> Option<&Error> {
        self.shared.death.get()
    }

    pub fn capacity(&self) -> usize {
        self.shared.pool.capacity()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::channel::{Op, Request, StatusRecord, REQUEST_SIZE};
    use super::*;

    fn executor_config(max_procs: usize) -> ExecutorConfig {
        ExecutorConfig {
            max_procs,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_slot_lease_releases_on_drop() {
        let pool = IdPool::new(1).unwrap();
        let cancel = CancellationToken::new();

        let lease = SlotLease::acquire(&pool, &cancel).await.unwrap();
        assert_eq!(pool.try_acquire(), None);
        drop(lease);
        assert_eq!(pool.try_acquire(), Some(0));
    }

    #[tokio::test]
    async fn test_slot_lease_handed_to_live_map() {
        let pool = IdPool::new(1).unwrap();
        let cancel = CancellationToken::new();

        let lease = SlotLease::acquire(&pool, &cancel).await.unwrap();
        lease.into_live_map();
        assert_eq!(pool.try_acquire(), None);
    }

    #[tokio::test]
    async fn test_max_procs_limit() {
        let (host, _peer) = UnixStream::pair().unwrap();
        assert!(matches!(
            Executor::with_stream(host, &executor_config(MAX_PROCS + 1)),
            Err(Error::Config(_))
        ));

        let (host, _peer) = UnixStream::pair().unwrap();
        let executor = Executor::with_stream(host, &executor_config(0)).unwrap();
        assert_eq!(executor.capacity(), MAX_PROCS);
    }

    #[tokio::test]
    async fn test_new_process_sends_create() {
        let (host, mut peer) = UnixStream::pair().unwrap();
        let executor = Executor::with_stream(host, &executor_config(4)).unwrap();
        let cancel = CancellationToken::new();

        let process = executor.new_process(&cancel).await.unwrap();

        let mut buf = [0u8; REQUEST_SIZE];
        peer.read_exact(&mut buf).await.unwrap();
        let req = Request::decode(&buf).unwrap();
        assert_eq!(req.op, Op::Create);
        assert_eq!(req.pid, process.id());
    }

    #[tokio::test]
    async fn test_status_delivery_frees_slot() {
        use tokio::io::AsyncWriteExt;

        let (host, mut peer) = UnixStream::pair().unwrap();
        let executor = Executor::with_stream(host, &executor_config(1)).unwrap();
        let cancel = CancellationToken::new();

        let process = executor.new_process(&cancel).await.unwrap();
        let mut buf = [0u8; REQUEST_SIZE];
        peer.read_exact(&mut buf).await.unwrap();

        let status = StatusRecord {
            pid: process.id(),
            status: 0,
        };
        peer.write_all(&status.encode()).await.unwrap();
        drop(process);

        let again = tokio::time::timeout(Duration::from_secs(5), executor.new_process(&cancel))
            .await
            .expect("slot should be released after the status arrives")
            .unwrap();
        assert_eq!(again.id(), 0);
    }

    #[tokio::test]
    async fn test_new_process_cancelled_while_pool_empty() {
        let (host, _peer) = UnixStream::pair().unwrap();
        let executor = Executor::with_stream(host, &executor_config(1)).unwrap();
        let cancel = CancellationToken::new();

        let _first = executor.new_process(&cancel).await.unwrap();

        let waiter = CancellationToken::new();
        let canceller = waiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert!(matches!(
            executor.new_process(&waiter).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_executor_dead_after_peer_closes() {
        let (host, peer) = UnixStream::pair().unwrap();
        let executor = Executor::with_stream(host, &executor_config(2)).unwrap();
        drop(peer);

        tokio::time::timeout(Duration::from_secs(5), executor.dead())
            .await
            .expect("receiver should observe EOF");
        assert!(executor.is_dead());
    }

    #[tokio::test]
    async fn test_new_process_fails_once_receiver_stopped() {
        let (host, peer) = UnixStream::pair().unwrap();
        let executor = Executor::with_stream(host, &executor_config(2)).unwrap();
        drop(peer);

        tokio::time::timeout(Duration::from_secs(5), executor.dead())
            .await
            .expect("receiver should observe EOF");
        // Only the read half knows; the sender has written nothing yet.
        assert!(!executor.shared.send_closed.is_cancelled());
        assert!(matches!(
            executor.new_process(&CancellationToken::new()).await,
            Err(Error::ExecutorDead)
        ));
    }

    #[tokio::test]
    async fn test_close_shuts_down_write_half() {
        let (host, mut peer) = UnixStream::pair().unwrap();
        let executor = Executor::with_stream(host, &executor_config(2)).unwrap();

        let closer = executor.clone();
        let close = tokio::spawn(async move { closer.close().await });

        // The container side sees EOF, then hangs up in turn.
        let mut buf = [0u8; 16];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        drop(peer);

        close.await.unwrap().unwrap();
        assert!(executor.is_dead());
        assert!(matches!(
            executor.new_process(&CancellationToken::new()).await,
            Err(Error::ExecutorDead)
        ));
    }
}
