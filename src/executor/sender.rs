use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::channel::{self, Op, Request};
use super::idpool::IdPool;
use super::record::ExecutionRecord;
use super::{LiveMap, SlotLease};
use crate::error::{Error, Result};

/// Capacity of the kill-request queue. Requesters wait when it is full.
pub const KILL_QUEUE_LEN: usize = 16;

/// Admission of a new process, handed from `Executor::new_process` to the
/// Sender.
pub struct ExecRequest {
    pub record: Arc<ExecutionRecord>,
    pub lease: SlotLease,
    /// Sandbox end of the input socket pair.
    pub input: OwnedFd,
    /// Write end of the output pipe.
    pub output: OwnedFd,
    pub cgroup: Option<Arc<OwnedFd>>,
    pub reply: oneshot::Sender<Result<()>>,
}

#[derive(Debug)]
pub enum KillRequest {
    Kill(Arc<ExecutionRecord>),
    Suspend(Arc<ExecutionRecord>),
    /// Shut down the write half; the container then terminates everything.
    Shutdown,
}

/// Owns the write half of the control channel.
pub struct Sender {
    pub writer: OwnedWriteHalf,
    pub exec_rx: mpsc::Receiver<ExecRequest>,
    pub kill_rx: mpsc::Receiver<KillRequest>,
    pub live: LiveMap,
    pub pool: IdPool,
    pub send_closed: CancellationToken,
}

impl Sender {
    pub async fn run(mut self) {
        if let Err(e) = self.serve().await {
            error!("Control channel write failed: {e}");
        }

        if let Err(e) = self.writer.shutdown().await {
            debug!("Control channel shutdown: {e}");
        }
        self.send_closed.cancel();
        info!("Executor sender stopped");
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.send_closed.cancelled() => {
                    info!("Send side closed, stopping sender");
                    return Ok(());
                }
                req = self.kill_rx.recv() => match req {
                    Some(KillRequest::Shutdown) | None => {
                        info!("Executor shutdown requested");
                        return Ok(());
                    }
                    Some(KillRequest::Kill(record)) => self.signal(&record, Op::Kill).await?,
                    Some(KillRequest::Suspend(record)) => self.signal(&record, Op::Suspend).await?,
                },
                req = self.exec_rx.recv() => match req {
                    Some(req) => self.create(req).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn create(&mut self, req: ExecRequest) -> Result<()> {
        let ExecRequest {
            record,
            lease,
            input,
            output,
            cgroup,
            reply,
        } = req;
        let slot = record.slot();

        // The record must be visible to the Receiver before the container can
        // answer the Create.
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slot, record.clone());
        lease.into_live_map();

        let mut fds: Vec<RawFd> = vec![input.as_raw_fd(), output.as_raw_fd()];
        if let Some(cgroup) = &cgroup {
            fds.push(cgroup.as_raw_fd());
        }

        let bytes = Request::new(slot, Op::Create).encode();
        let result = channel::send_with_fds(self.writer.as_ref(), &bytes, &fds).await;

        // Our copies of the in-flight descriptors are released here; the
        // container holds its own.
        drop(input);
        drop(output);
        drop(cgroup);

        match result {
            Ok(()) => {
                debug!("Sent create request for process {slot}");
                let _ = reply.send(Ok(()));
                Ok(())
            }
            Err(e) => {
                let removed = self
                    .live
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&slot);
                if removed.is_some() {
                    record.lose();
                    self.pool.release(slot);
                }
                let _ = reply.send(Err(Error::ExecutorDead));
                Err(e.into())
            }
        }
    }

    async fn signal(&mut self, record: &Arc<ExecutionRecord>, op: Op) -> Result<()> {
        let slot = record.slot();

        let live = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&slot)
            .is_some_and(|r| Arc::ptr_eq(r, record));
        if !live {
            debug!("Process {slot} already gone, dropping {op:?} request");
            return Ok(());
        }

        self.writer
            .write_all(&Request::new(slot, op).encode())
            .await?;
        debug!("Sent {op:?} request for process {slot}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    use super::*;
    use crate::executor::channel::REQUEST_SIZE;

    fn sender(writer: OwnedWriteHalf, live: LiveMap) -> Sender {
        let (_exec_tx, exec_rx) = mpsc::channel(1);
        let (_kill_tx, kill_rx) = mpsc::channel(1);
        Sender {
            writer,
            exec_rx,
            kill_rx,
            live,
            pool: IdPool::new(1).unwrap(),
            send_closed: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_kill_for_reused_slot_is_dropped() {
        let (host, mut peer) = UnixStream::pair().unwrap();
        let (_reader, writer) = host.into_split();

        // Slot 0 went to a new process after the old one finished.
        let stale = Arc::new(ExecutionRecord::new(0));
        let current = Arc::new(ExecutionRecord::new(0));
        let live = LiveMap::default();
        live.lock().unwrap().insert(0, current.clone());

        let mut sender = sender(writer, live);
        sender.signal(&stale, Op::Kill).await.unwrap();
        sender.signal(&current, Op::Suspend).await.unwrap();
        drop(sender);

        let mut sent = Vec::new();
        peer.read_to_end(&mut sent).await.unwrap();
        assert_eq!(sent.len(), REQUEST_SIZE);
        let mut buf = [0u8; REQUEST_SIZE];
        buf.copy_from_slice(&sent);
        assert_eq!(Request::decode(&buf), Some(Request::new(0, Op::Suspend)));
    }

    #[tokio::test]
    async fn test_signal_for_finished_process_is_dropped() {
        let (host, mut peer) = UnixStream::pair().unwrap();
        let (_reader, writer) = host.into_split();

        let finished = Arc::new(ExecutionRecord::new(0));
        let mut sender = sender(writer, LiveMap::default());
        sender.signal(&finished, Op::Kill).await.unwrap();
        drop(sender);

        let mut sent = Vec::new();
        peer.read_to_end(&mut sent).await.unwrap();
        assert!(sent.is_empty());
    }
}
