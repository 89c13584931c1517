use tokio::io::AsyncReadExt;
use tokio::net::unix::OwnedReadHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{self, StatusRecord, RECEIVE_BUFFER_RECORDS, STATUS_SIZE};
use super::idpool::IdPool;
use super::LiveMap;

/// Owns the read half of the control channel and delivers wait statuses.
pub struct Receiver {
    pub reader: OwnedReadHalf,
    pub live: LiveMap,
    pub pool: IdPool,
    pub recv_closed: CancellationToken,
}

impl Receiver {
    pub async fn run(mut self) {
        let mut buf = vec![0u8; RECEIVE_BUFFER_RECORDS * STATUS_SIZE];
        let mut len = 0;

        loop {
            match self.reader.read(&mut buf[len..]).await {
                Ok(0) => {
                    info!("Control channel closed by container");
                    break;
                }
                Ok(n) => {
                    len = channel::drain_records(&mut buf, len + n, |rec| self.deliver(rec));
                }
                Err(e) => {
                    error!("Control channel read failed: {e}");
                    break;
                }
            }
        }

        if len > 0 {
            debug!("Discarding {len} trailing bytes of a partial status record");
        }

        // Nobody will report on the remaining processes anymore.
        let orphans: Vec<_> = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, record)| record)
            .collect();
        for record in orphans {
            record.lose();
            self.pool.release(record.slot());
        }

        self.recv_closed.cancel();
        info!("Executor receiver stopped");
    }

    fn deliver(&self, rec: StatusRecord) {
        let record = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&rec.pid);

        match record {
            Some(record) => {
                debug!("Process {} exited with status {:#x}", rec.pid, rec.status);
                record.finalize(rec.status);
                self.pool.release(rec.pid);
            }
            None => warn!("Status record for unknown process {}", rec.pid),
        }
    }
}
