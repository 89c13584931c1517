pub mod origin;
pub mod registry;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::packet::{Packet, MAX_PACKET_SIZE};

pub use origin::Origin;
pub use registry::Registry;

/// The service exists and accepts packets.
pub const FLAG_AVAILABLE: u8 = 1;

/// Availability of a service as reported to the program by discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub flags: u8,
    /// Largest packet the program may send to the service.
    pub max_send_size: u32,
}

impl ServiceState {
    pub fn available(max_send_size: u32) -> Self {
        Self {
            flags: FLAG_AVAILABLE,
            max_send_size,
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_available(&self) -> bool {
        self.flags & FLAG_AVAILABLE != 0
    }
}

/// Per-program server settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Upper bound of any packet sent to the program.
    pub max_send_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_send_size: MAX_PACKET_SIZE as u32,
        }
    }
}

/// Persisted state of one discovered service, carried in snapshot buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub name: String,
    pub buffer: Vec<u8>,
}

/// Settings for one service instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Packet code assigned to the service by discovery.
    pub code: i16,
    pub max_send_size: u32,
    /// Reports failures detected outside `handle`, e.g. by a background pump.
    pub errors: mpsc::Sender<Error>,
}

/// What `ServiceRegistry::create_server` hands to the serve loop.
pub struct ServerHandle {
    pub server: Box<dyn InstanceServer>,
    /// States of services restored from a snapshot, in code order.
    pub initial: Vec<ServiceState>,
    /// Asynchronous service failures. A `BadProgram` error terminates the
    /// program with an ABI violation.
    pub errors: mpsc::Receiver<Error>,
}

/// Source of the services a program can discover.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Creates the server for one program run, restoring `previous`
    /// services (codes 0, 1, ... in order) when resuming.
    async fn create_server(
        &self,
        cancel: &CancellationToken,
        config: &ServerConfig,
        previous: &[ServiceSnapshot],
    ) -> Result<ServerHandle>;
}

/// The service side of one program run.
///
/// Calls are made sequentially by the serve loop, so packets for a service
/// are handled in the order the program sent them.
#[async_trait]
pub trait InstanceServer: Send {
    /// Starts restored services. `send` queues packets to the program.
    async fn start(&mut self, send: &mpsc::Sender<Packet>) -> Result<()>;

    /// Assigns the next codes to `names` and reports their states.
    async fn discover(
        &mut self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<Vec<ServiceState>>;

    /// Handles a packet addressed to a discovered service. A returned packet
    /// is sent to the program ahead of anything queued later.
    async fn handle(
        &mut self,
        cancel: &CancellationToken,
        send: &mpsc::Sender<Packet>,
        packet: Packet,
    ) -> Result<Option<Packet>>;

    /// Stops every service. With `suspend`, their state is returned for
    /// the snapshot; otherwise the result is empty.
    async fn shutdown(&mut self, suspend: bool) -> Result<Vec<ServiceSnapshot>>;
}

/// A named service that can be instantiated for each program.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Creates an instance, restoring `snapshot` if the program is resumed.
    fn create_instance(
        &self,
        config: &InstanceConfig,
        snapshot: Option<&[u8]>,
    ) -> Result<Box<dyn ServiceInstance>>;
}

#[async_trait]
pub trait ServiceInstance: Send {
    /// Resumes background activity of a restored instance.
    async fn start(&mut self, _send: &mpsc::Sender<Packet>) -> Result<()> {
        Ok(())
    }

    async fn handle(
        &mut self,
        send: &mpsc::Sender<Packet>,
        packet: Packet,
    ) -> Result<Option<Packet>>;

    /// Stops the instance; with `suspend`, returns its persistent state.
    async fn shutdown(&mut self, suspend: bool) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_state_flags() {
        assert!(ServiceState::available(1024).is_available());
        assert!(!ServiceState::unavailable().is_available());
        assert_eq!(ServiceState::unavailable().max_send_size, 0);
    }

    #[test]
    fn test_server_config_default() {
        assert_eq!(ServerConfig::default().max_send_size, 65536);
    }
}
