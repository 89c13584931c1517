//! The `origin` service: the program's standard byte stream.
//!
//! Data the program writes on stream 0 goes to the output sink. Input is
//! pumped to the program as data packets, as far as the flow credit it has
//! granted allows, and ends with an empty data packet.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{InstanceConfig, Service, ServiceInstance};
use crate::error::{Error, Result};
use crate::packet::{self, Domain, Packet, DATA_HEADER_SIZE};

pub const ORIGIN_NAME: &str = "origin";

const STREAM_ID: i32 = 0;

const FLAG_INPUT_EOF: u8 = 1;
const FLAG_INPUT_ENDED: u8 = 2;
const SNAPSHOT_HEADER_SIZE: usize = 9;

pub type InputSource = Box<dyn AsyncRead + Send + Unpin>;

pub struct Origin {
    input: Mutex<Option<InputSource>>,
    output: mpsc::Sender<Vec<u8>>,
}

impl Origin {
    /// `input` is handed to the first instance created; later instances see
    /// an empty input stream.
    pub fn new(input: Option<InputSource>, output: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            input: Mutex::new(input),
            output,
        }
    }
}

impl Service for Origin {
    fn name(&self) -> &str {
        ORIGIN_NAME
    }

    fn create_instance(
        &self,
        config: &InstanceConfig,
        snapshot: Option<&[u8]>,
    ) -> Result<Box<dyn ServiceInstance>> {
        let state = match snapshot {
            Some(buf) => InputState::decode(buf)?,
            None => InputState::default(),
        };
        let reader = self.input.lock().unwrap_or_else(|e| e.into_inner()).take();

        Ok(Box::new(OriginInstance {
            code: config.code,
            max_data: (config.max_send_size as usize).saturating_sub(DATA_HEADER_SIZE).max(1),
            errors: config.errors.clone(),
            output: self.output.clone(),
            state: Arc::new(Mutex::new(state)),
            credit_added: Arc::new(Notify::new()),
            reader,
            pump: None,
        }))
    }
}

/// Input progress shared between the instance and its pump.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct InputState {
    /// Read from the source but not yet sent.
    pending: Vec<u8>,
    credit: u64,
    eof: bool,
    /// The end-of-stream packet has been sent.
    ended: bool,
}

impl InputState {
    fn encode(&self) -> Vec<u8> {
        let mut flags = 0;
        if self.eof {
            flags |= FLAG_INPUT_EOF;
        }
        if self.ended {
            flags |= FLAG_INPUT_ENDED;
        }
        let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + self.pending.len());
        buf.push(flags);
        buf.extend_from_slice(&self.credit.to_le_bytes());
        buf.extend_from_slice(&self.pending);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Ok(Self::default());
        }
        if buf.len() < SNAPSHOT_HEADER_SIZE {
            return Err(Error::BadProgram("truncated origin service state".into()));
        }
        let mut credit = [0u8; 8];
        credit.copy_from_slice(&buf[1..SNAPSHOT_HEADER_SIZE]);
        Ok(Self {
            pending: buf[SNAPSHOT_HEADER_SIZE..].to_vec(),
            credit: u64::from_le_bytes(credit),
            eof: buf[0] & FLAG_INPUT_EOF != 0,
            ended: buf[0] & FLAG_INPUT_ENDED != 0,
        })
    }

    fn has_work(&self) -> bool {
        !self.ended && (self.credit > 0 || !self.pending.is_empty() || self.eof)
    }
}

struct OriginInstance {
    code: i16,
    max_data: usize,
    errors: mpsc::Sender<Error>,
    output: mpsc::Sender<Vec<u8>>,
    state: Arc<Mutex<InputState>>,
    credit_added: Arc<Notify>,
    reader: Option<InputSource>,
    pump: Option<JoinHandle<()>>,
}

impl OriginInstance {
    fn ensure_pump(&mut self, send: &mpsc::Sender<Packet>) {
        if self.pump.is_some() {
            return;
        }
        let pump = Pump {
            code: self.code,
            max_data: self.max_data,
            reader: self.reader.take(),
            state: self.state.clone(),
            credit_added: self.credit_added.clone(),
            send: send.clone(),
            errors: self.errors.clone(),
        };
        self.pump = Some(tokio::spawn(pump.run()));
    }

    async fn write_output(output: &mpsc::Sender<Vec<u8>>, packet: &Packet) -> Result<()> {
        let (stream, _note, data) = packet::parse_data(packet)?;
        if stream != STREAM_ID {
            return Err(Error::BadProgram(format!("origin has no stream {stream}")));
        }
        if data.is_empty() {
            debug!("Program closed its origin output");
            return Ok(());
        }
        if output.send(data.to_vec()).await.is_err() {
            debug!("Origin output sink is gone, discarding {} bytes", data.len());
        }
        Ok(())
    }

    fn add_credit(&self, packet: &Packet) -> Result<()> {
        let flows = packet::parse_flows(packet)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for (stream, increment) in flows {
            if stream != STREAM_ID {
                return Err(Error::BadProgram(format!("origin has no stream {stream}")));
            }
            if increment < 0 {
                return Err(Error::BadProgram(format!(
                    "negative flow increment {increment}"
                )));
            }
            state.credit += increment as u64;
        }
        drop(state);
        self.credit_added.notify_one();
        Ok(())
    }
}

#[async_trait]
impl ServiceInstance for OriginInstance {
    async fn start(&mut self, send: &mpsc::Sender<Packet>) -> Result<()> {
        let has_work = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .has_work();
        if has_work {
            self.ensure_pump(send);
        }
        Ok(())
    }

    async fn handle(
        &mut self,
        send: &mpsc::Sender<Packet>,
        packet: Packet,
    ) -> Result<Option<Packet>> {
        match packet.domain() {
            Domain::Data => Self::write_output(&self.output, &packet).await?,
            Domain::Flow => {
                self.add_credit(&packet)?;
                self.ensure_pump(send);
            }
            domain => {
                return Err(Error::BadProgram(format!(
                    "origin does not accept {domain:?} packets"
                )))
            }
        }
        Ok(None)
    }

    async fn shutdown(&mut self, suspend: bool) -> Result<Vec<u8>> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        if !suspend {
            return Ok(Vec::new());
        }
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .encode())
    }
}

/// Background task feeding input to the program.
///
/// It may be aborted at any await point; bytes leave `pending` only once a
/// queue slot is reserved, so nothing is lost.
struct Pump {
    code: i16,
    max_data: usize,
    reader: Option<InputSource>,
    state: Arc<Mutex<InputState>>,
    credit_added: Arc<Notify>,
    send: mpsc::Sender<Packet>,
    errors: mpsc::Sender<Error>,
}

enum Step {
    Read,
    WaitCredit,
    Send,
    Done,
}

impl Pump {
    async fn run(mut self) {
        let mut buf = vec![0u8; self.max_data];
        loop {
            match self.next_step() {
                Step::Done => return,
                Step::WaitCredit => self.credit_added.notified().await,
                Step::Read => {
                    let n = match self.reader.as_mut() {
                        Some(reader) => match reader.read(&mut buf).await {
                            Ok(n) => n,
                            Err(e) => {
                                warn!("Origin input read failed: {e}");
                                let _ = self.errors.try_send(Error::Io(e));
                                return;
                            }
                        },
                        None => 0,
                    };
                    let mut state = self.lock();
                    if n == 0 {
                        state.eof = true;
                    } else {
                        state.pending.extend_from_slice(&buf[..n]);
                    }
                }
                Step::Send => {
                    let Ok(permit) = self.send.reserve().await else {
                        return;
                    };
                    let packet = {
                        let mut state = self.lock();
                        if state.pending.is_empty() {
                            state.ended = true;
                            packet::data_packet(self.code, STREAM_ID, 0, &[])
                        } else {
                            let n = state
                                .pending
                                .len()
                                .min(self.max_data)
                                .min(usize::try_from(state.credit).unwrap_or(usize::MAX));
                            let chunk: Vec<u8> = state.pending.drain(..n).collect();
                            state.credit -= n as u64;
                            packet::data_packet(self.code, STREAM_ID, 0, &chunk)
                        }
                    };
                    permit.send(packet);
                }
            }
        }
    }

    fn next_step(&self) -> Step {
        let state = self.lock();
        if state.ended {
            Step::Done
        } else if state.pending.is_empty() && state.eof {
            Step::Send
        } else if state.pending.is_empty() {
            Step::Read
        } else if state.credit == 0 {
            Step::WaitCredit
        } else {
            Step::Send
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InputState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
