//! Snapshot metadata and I/O buffers, stored as WebAssembly custom
//! sections.
//!
//! `gate.snapshot`: LEB128 `flags`, `trap`, `result`, `monotonic_time`,
//! breakpoint count and breakpoints.
//!
//! `gate.buffer`: LEB128 `flags`, input length and bytes, output length and
//! bytes, service count, then per service its name and buffer, each
//! length-prefixed.

use std::borrow::Cow;
use std::fmt;

use wasm_encoder::{CustomSection, Encode, Module, Section};
use wasmparser::{Parser, Payload};

use crate::error::{Error, Result};
use crate::service::ServiceSnapshot;
use crate::trap::{ProgramResult, TrapId};

pub const SECTION_SNAPSHOT: &str = "gate.snapshot";
pub const SECTION_BUFFER: &str = "gate.buffer";

/// The program terminated; the state is kept for inspection only.
pub const FLAG_TERMINATED: u64 = 1;

pub const WASM_HEADER: [u8; 8] = *b"\0asm\x01\0\0\0";

/// Program I/O in flight when the program stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffers {
    pub flags: u64,
    /// Bytes queued for the program but not yet delivered.
    pub input: Vec<u8>,
    /// Bytes the program wrote that were not yet handled.
    pub output: Vec<u8>,
    pub services: Vec<ServiceSnapshot>,
}

impl Buffers {
    pub fn is_terminated(&self) -> bool {
        self.flags & FLAG_TERMINATED != 0
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.output.is_empty() && self.services.is_empty()
    }
}

/// Where and how a program stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub flags: u64,
    pub trap: TrapId,
    pub result: ProgramResult,
    pub monotonic_time: u64,
    pub breakpoints: Vec<u64>,
}

impl Snapshot {
    pub fn new(trap: TrapId, result: ProgramResult, monotonic_time: u64) -> Self {
        let flags = if trap == TrapId::Suspended {
            0
        } else {
            FLAG_TERMINATED
        };
        Self {
            flags,
            trap,
            result,
            monotonic_time,
            breakpoints: Vec::new(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.flags & FLAG_TERMINATED != 0
    }
}

/// Builds a module holding only the snapshot sections.
pub fn encode_module(snapshot: &Snapshot, buffers: &Buffers) -> Vec<u8> {
    let mut module = Module::new();
    for section in sections(snapshot, buffers) {
        module.section(&section);
    }
    module.finish()
}

/// Appends the snapshot sections to an encoded module.
pub fn append_sections(module: &mut Vec<u8>, snapshot: &Snapshot, buffers: &Buffers) {
    for section in sections(snapshot, buffers) {
        module.push(section.id());
        section.encode(module);
    }
}

fn sections(snapshot: &Snapshot, buffers: &Buffers) -> [CustomSection<'static>; 2] {
    let mut payload = Vec::new();
    snapshot.flags.encode(&mut payload);
    (snapshot.trap as u64).encode(&mut payload);
    u64::from(snapshot.result.code()).encode(&mut payload);
    snapshot.monotonic_time.encode(&mut payload);
    (snapshot.breakpoints.len() as u64).encode(&mut payload);
    for offset in &snapshot.breakpoints {
        offset.encode(&mut payload);
    }
    let snapshot_section = CustomSection {
        name: Cow::Borrowed(SECTION_SNAPSHOT),
        data: Cow::Owned(payload),
    };

    let mut payload = Vec::new();
    buffers.flags.encode(&mut payload);
    write_bytes(&mut payload, &buffers.input);
    write_bytes(&mut payload, &buffers.output);
    (buffers.services.len() as u64).encode(&mut payload);
    for service in &buffers.services {
        write_bytes(&mut payload, service.name.as_bytes());
        write_bytes(&mut payload, &service.buffer);
    }
    let buffer_section = CustomSection {
        name: Cow::Borrowed(SECTION_BUFFER),
        data: Cow::Owned(payload),
    };

    [snapshot_section, buffer_section]
}

/// Scans a module for the snapshot sections.
pub fn read_sections(module: &[u8]) -> Result<(Option<Snapshot>, Option<Buffers>)> {
    let mut snapshot = None;
    let mut buffers = None;

    for payload in Parser::new(0).parse_all(module) {
        match payload.map_err(bad)? {
            Payload::CustomSection(section) if section.name() == SECTION_SNAPSHOT => {
                snapshot = Some(read_snapshot(&mut Reader::new(section.data()))?);
            }
            Payload::CustomSection(section) if section.name() == SECTION_BUFFER => {
                buffers = Some(read_buffers(&mut Reader::new(section.data()))?);
            }
            _ => {}
        }
    }

    Ok((snapshot, buffers))
}

fn read_snapshot(r: &mut Reader<'_>) -> Result<Snapshot> {
    let flags = r.uleb()?;
    let trap = u8::try_from(r.uleb()?)
        .ok()
        .and_then(TrapId::from_u8)
        .ok_or_else(|| bad("snapshot trap id out of range"))?;
    let result = u32::try_from(r.uleb()?)
        .map(ProgramResult::new)
        .map_err(|_| bad("snapshot result out of range"))?;
    let monotonic_time = r.uleb()?;
    let count = r.uleb()?;
    let mut breakpoints = Vec::new();
    for _ in 0..count {
        breakpoints.push(r.uleb()?);
    }
    Ok(Snapshot {
        flags,
        trap,
        result,
        monotonic_time,
        breakpoints,
    })
}

fn read_buffers(r: &mut Reader<'_>) -> Result<Buffers> {
    let flags = r.uleb()?;
    let input = r.bytes()?.to_vec();
    let output = r.bytes()?.to_vec();
    let count = r.uleb()?;
    let mut services = Vec::new();
    for _ in 0..count {
        let name = std::str::from_utf8(r.bytes()?)
            .map_err(|_| bad("service name is not UTF-8"))?
            .to_string();
        let buffer = r.bytes()?.to_vec();
        services.push(ServiceSnapshot { name, buffer });
    }
    Ok(Buffers {
        flags,
        input,
        output,
        services,
    })
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    (bytes.len() as u64).encode(out);
    out.extend_from_slice(bytes);
}

fn bad(msg: impl fmt::Display) -> Error {
    Error::BadProgram(format!("snapshot: {msg}"))
}

/// Field reader for section payloads.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn byte(&mut self) -> Result<u8> {
        let (&b, rest) = self.buf.split_first().ok_or_else(|| bad("unexpected end"))?;
        self.buf = rest;
        Ok(b)
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = usize::try_from(self.uleb()?).map_err(|_| bad("length overflow"))?;
        if len > self.buf.len() {
            return Err(bad("unexpected end"));
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn uleb(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let b = self.byte()?;
            if shift >= 64 || (shift == 63 && b > 1) {
                return Err(bad("LEB128 overflow"));
            }
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_uleb() {
        let mut out = Vec::new();
        624485u64.encode(&mut out);
        assert_eq!(out, [0xe5, 0x8e, 0x26]);
        assert_eq!(Reader::new(&out).uleb().unwrap(), 624485);

        let mut out = Vec::new();
        u64::MAX.encode(&mut out);
        assert_eq!(Reader::new(&out).uleb().unwrap(), u64::MAX);

        assert!(Reader::new(&[0xff; 11]).uleb().is_err());
    }

    #[test]
    fn test_sections_survive_module() {
        let snapshot = Snapshot {
            flags: 0,
            trap: TrapId::Suspended,
            result: ProgramResult::SUCCESS,
            monotonic_time: 123_456_789,
            breakpoints: vec![16, 300],
        };
        let buffers = Buffers {
            flags: 0,
            input: b"in".to_vec(),
            output: vec![1, 2, 3],
            services: vec![ServiceSnapshot {
                name: "origin".into(),
                buffer: vec![0; 9],
            }],
        };

        let module = encode_module(&snapshot, &buffers);
        let (s, b) = read_sections(&module).unwrap();
        assert_eq!(s, Some(snapshot));
        assert_eq!(b, Some(buffers));
    }

    #[test]
    fn test_other_sections_are_skipped() {
        let mut module = Module::new();
        // One `() -> ()` function type.
        module.section(&wasm_encoder::RawSection {
            id: 1,
            data: &[1, 0x60, 0, 0],
        });
        module.section(&CustomSection {
            name: Cow::Borrowed("name"),
            data: Cow::Borrowed(&b"whatever"[..]),
        });
        let mut module = module.finish();
        assert_eq!(module[..WASM_HEADER.len()], WASM_HEADER);

        let snapshot = Snapshot::new(TrapId::Exit, ProgramResult::FAILURE, 5);
        append_sections(&mut module, &snapshot, &Buffers::default());

        let (s, b) = read_sections(&module).unwrap();
        let s = s.unwrap();
        assert!(s.is_terminated());
        assert_eq!(s.result.value(), 1);
        assert!(b.unwrap().is_empty());
    }

    #[test]
    fn test_module_without_sections() {
        let (s, b) = read_sections(&WASM_HEADER).unwrap();
        assert!(s.is_none() && b.is_none());
    }

    #[test]
    fn test_truncated_module_rejected() {
        let module = encode_module(
            &Snapshot::new(TrapId::Suspended, ProgramResult::SUCCESS, 1),
            &Buffers::default(),
        );
        assert!(read_sections(&module[..module.len() - 1]).is_err());
        assert!(read_sections(b"\0asx").is_err());
    }
}
