/// Per-process state shared between the executor tasks and the facade.
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::sync::watch;

use crate::error::{Error, Result};

pub const ID_FINALIZED: i32 = -1;
pub const ID_KILLED: i32 = -2;
pub const ID_SUSPENDED: i32 = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Pending,
    Exited(i32),
    /// The control channel closed before a status arrived.
    Lost,
}

/// Live execution record of one sandboxed process.
///
/// `id` holds the slot number while the process is live and one of the
/// sentinels once a kill, a suspension or the final status has been
/// recorded. The slot itself never changes and is returned to the id pool by
/// the Receiver.
#[derive(Debug)]
pub struct ExecutionRecord {
    slot: u16,
    id: AtomicI32,
    dead: watch::Sender<Delivery>,
}

impl ExecutionRecord {
    pub fn new(slot: u16) -> Self {
        let (dead, _) = watch::channel(Delivery::Pending);
        Self {
            slot,
            id: AtomicI32::new(i32::from(slot)),
            dead,
        }
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn id(&self) -> i32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn kill_requested(&self) -> bool {
        self.id() == ID_KILLED
    }

    /// Moves a live or suspending record to `Killed`. Returns false if a kill
    /// was already requested or the status has been delivered.
    pub fn mark_killed(&self) -> bool {
        self.id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                (id >= 0 || id == ID_SUSPENDED).then_some(ID_KILLED)
            })
            .is_ok()
    }

    /// Moves a live record to `Suspended`. Returns false if it was already
    /// sentineled.
    pub fn mark_suspended(&self) -> bool {
        self.id
            .compare_exchange(
                i32::from(self.slot),
                ID_SUSPENDED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Records the wait status and fires the `dead` signal. Called once, by
    /// the Receiver, after removing the record from the live map.
    pub fn finalize(&self, status: i32) {
        let _ = self
            .id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                (id >= 0 || id == ID_SUSPENDED).then_some(ID_FINALIZED)
            });
        self.dead.send_replace(Delivery::Exited(status));
    }

    /// Fires the `dead` signal without a status (executor died).
    pub fn lose(&self) {
        self.dead.send_if_modified(|d| {
            if *d == Delivery::Pending {
                *d = Delivery::Lost;
                true
            } else {
                false
            }
        });
    }

    pub fn is_dead(&self) -> bool {
        *self.dead.borrow() != Delivery::Pending
    }

    /// Waits for the wait status.
    pub async fn wait(&self) -> Result<i32> {
        let mut rx = self.dead.subscribe();
        let delivery = *rx
            .wait_for(|d| *d != Delivery::Pending)
            .await
            .map_err(|_| Error::ExecutorDead)?;

        match delivery {
            Delivery::Exited(status) => Ok(status),
            Delivery::Lost | Delivery::Pending => Err(Error::ExecutorDead),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_kill_is_idempotent() {
        let rec = ExecutionRecord::new(5);
        assert_eq!(rec.id(), 5);
        assert!(rec.mark_killed());
        assert!(!rec.mark_killed());
        assert!(rec.kill_requested());
    }

    #[test]
    fn test_suspend_then_kill() {
        let rec = ExecutionRecord::new(0);
        assert!(rec.mark_suspended());
        assert!(!rec.mark_suspended());
        assert_eq!(rec.id(), ID_SUSPENDED);
        assert!(rec.mark_killed());
        assert_eq!(rec.id(), ID_KILLED);
    }

    #[test]
    fn test_finalize_keeps_killed() {
        let rec = ExecutionRecord::new(3);
        rec.mark_killed();
        rec.finalize(9);
        assert!(rec.kill_requested());
        assert!(rec.is_dead());
    }

    #[test]
    fn test_finalize_live() {
        let rec = ExecutionRecord::new(3);
        rec.finalize(0);
        assert_eq!(rec.id(), ID_FINALIZED);
        assert!(!rec.mark_killed());
        assert!(!rec.mark_suspended());
    }

    #[tokio::test]
    async fn test_wait_receives_status() {
        let rec = Arc::new(ExecutionRecord::new(1));
        let waiter = {
            let rec = rec.clone();
            tokio::spawn(async move { rec.wait().await })
        };
        tokio::task::yield_now().await;
        rec.finalize(0x0900);
        assert_eq!(waiter.await.unwrap().unwrap(), 0x0900);
    }

    #[tokio::test]
    async fn test_wait_after_lost() {
        let rec = ExecutionRecord::new(1);
        rec.lose();
        assert!(matches!(rec.wait().await, Err(Error::ExecutorDead)));
    }

    #[tokio::test]
    async fn test_lose_does_not_override_status() {
        let rec = ExecutionRecord::new(1);
        rec.finalize(0);
        rec.lose();
        assert_eq!(rec.wait().await.unwrap(), 0);
    }
}
