//! Default service registry: a set of named services, instantiated per
//! program in discovery order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    InstanceConfig, InstanceServer, ServerConfig, ServerHandle, Service, ServiceInstance,
    ServiceRegistry, ServiceSnapshot, ServiceState,
};
use crate::error::{Error, Result};
use crate::packet::Packet;

const ERROR_QUEUE_LEN: usize = 8;

#[derive(Default)]
pub struct Registry {
    services: Vec<Arc<dyn Service>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service. A later registration with the same name replaces the
    /// earlier one.
    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.services.retain(|s| s.name() != service.name());
        self.services.push(service);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.iter().find(|s| s.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl ServiceRegistry for Registry {
    async fn create_server(
        &self,
        _cancel: &CancellationToken,
        config: &ServerConfig,
        previous: &[ServiceSnapshot],
    ) -> Result<ServerHandle> {
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_QUEUE_LEN);
        let mut server = RegistryServer {
            services: self.services.clone(),
            config: *config,
            errors: errors_tx,
            slots: Vec::new(),
        };

        let mut initial = Vec::with_capacity(previous.len());
        for snapshot in previous {
            initial.push(server.add(&snapshot.name, Some(&snapshot.buffer))?);
        }

        Ok(ServerHandle {
            server: Box::new(server),
            initial,
            errors: errors_rx,
        })
    }
}

/// A discovered name; unknown names occupy a code without an instance.
struct Slot {
    name: String,
    instance: Option<Box<dyn ServiceInstance>>,
}

pub struct RegistryServer {
    services: Vec<Arc<dyn Service>>,
    config: ServerConfig,
    errors: mpsc::Sender<Error>,
    slots: Vec<Slot>,
}

impl RegistryServer {
    fn add(&mut self, name: &str, snapshot: Option<&[u8]>) -> Result<ServiceState> {
        let code = i16::try_from(self.slots.len())
            .map_err(|_| Error::BadProgram("too many services discovered".into()))?;

        let service = self.services.iter().find(|s| s.name() == name);
        let (instance, state) = match service {
            Some(service) => {
                let config = InstanceConfig {
                    code,
                    max_send_size: self.config.max_send_size,
                    errors: self.errors.clone(),
                };
                let instance = service.create_instance(&config, snapshot)?;
                (
                    Some(instance),
                    ServiceState::available(self.config.max_send_size),
                )
            }
            None => (None, ServiceState::unavailable()),
        };

        debug!("Service {name:?} assigned code {code} (available: {})", state.is_available());
        self.slots.push(Slot {
            name: name.to_string(),
            instance,
        });
        Ok(state)
    }
}

#[async_trait]
impl InstanceServer for RegistryServer {
    async fn start(&mut self, send: &mpsc::Sender<Packet>) -> Result<()> {
        for slot in &mut self.slots {
            if let Some(instance) = &mut slot.instance {
                instance.start(send).await?;
            }
        }
        Ok(())
    }

    async fn discover(
        &mut self,
        _cancel: &CancellationToken,
        names: &[String],
    ) -> Result<Vec<ServiceState>> {
        names.iter().map(|name| self.add(name, None)).collect()
    }

    async fn handle(
        &mut self,
        _cancel: &CancellationToken,
        send: &mpsc::Sender<Packet>,
        packet: Packet,
    ) -> Result<Option<Packet>> {
        let code = packet.code();
        let slot = usize::try_from(code)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .ok_or_else(|| Error::BadProgram(format!("packet for undiscovered code {code}")))?;

        match &mut slot.instance {
            Some(instance) => instance.handle(send, packet).await,
            None => Err(Error::BadProgram(format!(
                "packet for unavailable service {:?}",
                slot.name
            ))),
        }
    }

    async fn shutdown(&mut self, suspend: bool) -> Result<Vec<ServiceSnapshot>> {
        let mut persisted = Vec::new();
        for slot in &mut self.slots {
            let buffer = match &mut slot.instance {
                Some(instance) => instance.shutdown(suspend).await?,
                None => Vec::new(),
            };
            if suspend {
                // Unavailable services are kept too, so codes stay stable.
                persisted.push(ServiceSnapshot {
                    name: slot.name.clone(),
                    buffer,
                });
            }
        }
        Ok(persisted)
    }
}
