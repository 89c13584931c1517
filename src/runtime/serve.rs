//! The packet pump between a running program and its services.

use std::collections::VecDeque;
use std::io;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::process::{Control, Pipes};
use crate::error::{Error, Result};
use crate::packet::{self, Packet, CODE_SERVICES, MAX_PACKET_SIZE};
use crate::service::{InstanceServer, ServerConfig, ServiceRegistry, ServiceSnapshot};
use crate::snapshot::Buffers;

/// Packets services may queue before they have to wait for the program.
pub const SEND_QUEUE_LEN: usize = 64;

pub(crate) struct ServeLoop<'a> {
    control: &'a Control,
    server: Box<dyn InstanceServer>,
    errors: mpsc::Receiver<Error>,
    send_tx: mpsc::Sender<Packet>,
    send_rx: mpsc::Receiver<Packet>,
    /// Replies produced by the loop itself, sent before queued packets.
    replies: VecDeque<Packet>,
    /// Number of codes assigned so far.
    discovered: usize,
    /// Bytes being written to the program, and how many already were.
    pending: Vec<u8>,
    written: usize,
    /// Bytes read from the program that do not form a packet yet.
    read_buf: Vec<u8>,
    suspending: bool,
    input_closed: bool,
}

impl<'a> ServeLoop<'a> {
    /// Creates the service server, restoring the services and I/O of
    /// `buffers` if given.
    pub(crate) async fn start(
        control: &'a Control,
        registry: &dyn ServiceRegistry,
        cancel: &CancellationToken,
        buffers: Option<&mut Buffers>,
    ) -> Result<ServeLoop<'a>> {
        let previous: &[ServiceSnapshot] = buffers
            .as_deref()
            .map(|b| b.services.as_slice())
            .unwrap_or(&[]);
        let handle = registry
            .create_server(cancel, &ServerConfig::default(), previous)
            .await?;

        let (pending, read_buf) = match buffers {
            Some(b) => (std::mem::take(&mut b.input), std::mem::take(&mut b.output)),
            None => (Vec::new(), Vec::new()),
        };

        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_LEN);
        let mut serve_loop = ServeLoop {
            control,
            server: handle.server,
            errors: handle.errors,
            send_tx,
            send_rx,
            replies: VecDeque::new(),
            discovered: handle.initial.len(),
            pending,
            written: 0,
            read_buf,
            suspending: false,
            input_closed: false,
        };
        serve_loop.server.start(&serve_loop.send_tx).await?;
        Ok(serve_loop)
    }

    /// Pumps packets until the program closes its output. Cancellation and
    /// `suspend` request a suspension and keep pumping.
    pub(crate) async fn run(
        &mut self,
        pipes: &mut Pipes,
        cancel: &CancellationToken,
        suspend: &CancellationToken,
    ) -> Result<()> {
        let mut chunk = vec![0u8; MAX_PACKET_SIZE];

        loop {
            while let Some(packet) = packet::take_packet(&mut self.read_buf)? {
                self.dispatch(cancel, packet).await?;
            }

            if self.written == self.pending.len() {
                self.pending.clear();
                self.written = 0;
                if let Some(reply) = self.replies.pop_front() {
                    self.pending = reply.into_bytes();
                }
            }
            let want_write = !self.input_closed && self.written < self.pending.len();
            let want_packet = !self.input_closed && self.pending.is_empty();

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.suspending => {
                    self.begin_suspend("serve cancelled").await;
                }
                _ = suspend.cancelled(), if !self.suspending => {
                    self.begin_suspend("suspend requested").await;
                }
                Some(err) = self.errors.recv() => return Err(err),
                read = pipes.output.read(&mut chunk) => match read? {
                    0 => {
                        debug!("Process {} closed its output", self.control.id());
                        return Ok(());
                    }
                    n => self.read_buf.extend_from_slice(&chunk[..n]),
                },
                ready = pipes.input.writable(), if want_write => {
                    ready?;
                    self.try_write(&pipes.input)?;
                }
                Some(packet) = self.send_rx.recv(), if want_packet => {
                    self.pending = packet.into_bytes();
                }
            }
        }
    }

    async fn begin_suspend(&mut self, reason: &str) {
        debug!("Suspending process {}: {reason}", self.control.id());
        self.suspending = true;
        self.control.request_suspend().await;
    }

    fn try_write(&mut self, input: &UnixStream) -> Result<()> {
        match input.try_write(&self.pending[self.written..]) {
            Ok(n) => self.written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!("Process {} closed its input", self.control.id());
                self.input_closed = true;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn dispatch(&mut self, cancel: &CancellationToken, packet: Packet) -> Result<()> {
        let code = packet.code();

        if code == CODE_SERVICES {
            let names = packet::parse_discovery(&packet)?;
            let states = self.server.discover(cancel, &names).await?;
            if states.len() != names.len() {
                return Err(Error::Internal(format!(
                    "discovery returned {} states for {} services",
                    states.len(),
                    names.len()
                )));
            }
            self.discovered += names.len();
            let entries: Vec<(u8, u32)> =
                states.iter().map(|s| (s.flags, s.max_send_size)).collect();
            self.replies.push_back(packet::discovery_reply(&entries));
            return Ok(());
        }

        if code < 0 || code as usize >= self.discovered {
            return Err(Error::BadProgram(format!(
                "packet for undiscovered service code {code}"
            )));
        }

        if let Some(reply) = self.server.handle(cancel, &self.send_tx, packet).await? {
            self.replies.push_back(reply);
        }
        Ok(())
    }

    /// Stops the services and collects what is still in flight.
    pub(crate) async fn finish(mut self, suspend: bool) -> Result<Buffers> {
        let services = self.server.shutdown(suspend).await?;

        let mut input = self.pending.split_off(self.written);
        for reply in self.replies.drain(..) {
            input.extend_from_slice(reply.as_bytes());
        }
        while let Ok(packet) = self.send_rx.try_recv() {
            input.extend_from_slice(packet.as_bytes());
        }

        Ok(Buffers {
            flags: 0,
            input,
            output: std::mem::take(&mut self.read_buf),
            services,
        })
    }
}
