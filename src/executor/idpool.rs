/// Bounded allocator of process ids.
///
/// Ids `0..capacity` circulate through an mpsc channel whose capacity equals
/// the pool size, so releasing never blocks. Acquisition waits for a free id.
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Upper bound of the pool size (and of `max_procs`).
pub const MAX_PROCS: usize = 16384;

#[derive(Clone)]
pub struct IdPool {
    free_tx: mpsc::Sender<u16>,
    free_rx: Arc<Mutex<mpsc::Receiver<u16>>>,
    capacity: usize,
}

impl IdPool {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_PROCS {
            return Err(Error::Config(format!(
                "id pool capacity {capacity} is outside 1..={MAX_PROCS}"
            )));
        }

        let (free_tx, free_rx) = mpsc::channel(capacity);
        for id in 0..capacity {
            // Cannot fail: the channel has room for every id.
            let _ = free_tx.try_send(id as u16);
        }

        Ok(Self {
            free_tx,
            free_rx: Arc::new(Mutex::new(free_rx)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for a free id.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<u16> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            id = async {
                let mut rx = self.free_rx.lock().await;
                rx.recv().await
            } => id.ok_or(Error::ExecutorDead),
        }
    }

    /// Returns an id without waiting, or `None` when all are in use.
    pub fn try_acquire(&self) -> Option<u16> {
        let mut rx = self.free_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Makes `id` available again. Must be called once per acquired id.
    pub fn release(&self, id: u16) {
        if let Err(e) = self.free_tx.try_send(id) {
            tracing::error!("Id pool overflow while releasing {id}: {e}");
        }
    }
}
