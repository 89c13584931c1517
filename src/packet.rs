//! Packets exchanged with a running program.
//!
//! Every packet starts with an 8-byte little-endian header: `u32 size`
//! (header included), `i16 code`, `u8 domain`, `u8 index`. Code -1 addresses
//! the services discovery; non-negative codes address discovered services.

use std::fmt;

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 8;
pub const MAX_PACKET_SIZE: usize = 65536;

/// Code of the services discovery call.
pub const CODE_SERVICES: i16 = -1;

const OFFSET_SIZE: usize = 0;
const OFFSET_CODE: usize = 4;
const OFFSET_DOMAIN: usize = 6;

/// Stream id and note precede the bytes of a data packet.
pub const DATA_HEADER_SIZE: usize = HEADER_SIZE + 8;
const FLOW_ENTRY_SIZE: usize = 8;
const SERVICE_STATE_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Domain {
    Call = 0,
    Info = 1,
    Flow = 2,
    Data = 3,
}

impl Domain {
    fn from_u8(v: u8) -> Option<Domain> {
        match v {
            0 => Some(Domain::Call),
            1 => Some(Domain::Info),
            2 => Some(Domain::Flow),
            3 => Some(Domain::Data),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Packet(Vec<u8>);

impl Packet {
    /// Builds a packet around `payload`.
    pub fn new(code: i16, domain: Domain, payload: &[u8]) -> Self {
        let size = HEADER_SIZE + payload.len();
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&(size as u32).to_le_bytes());
        buf.extend_from_slice(&code.to_le_bytes());
        buf.push(domain as u8);
        buf.push(0);
        buf.extend_from_slice(payload);
        Self(buf)
    }

    /// Validates a packet received from a program.
    pub fn parse(buf: Vec<u8>) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::BadProgram(format!(
                "packet of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let size = peek_size(&buf) as usize;
        if size != buf.len() {
            return Err(Error::BadProgram(format!(
                "packet size field {size} does not match length {}",
                buf.len()
            )));
        }
        if Domain::from_u8(buf[OFFSET_DOMAIN]).is_none() {
            return Err(Error::BadProgram(format!(
                "unknown packet domain {}",
                buf[OFFSET_DOMAIN]
            )));
        }
        Ok(Self(buf))
    }

    pub fn code(&self) -> i16 {
        i16::from_le_bytes([self.0[OFFSET_CODE], self.0[OFFSET_CODE + 1]])
    }

    pub fn domain(&self) -> Domain {
        Domain::from_u8(self.0[OFFSET_DOMAIN]).unwrap_or(Domain::Call)
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[HEADER_SIZE..]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == HEADER_SIZE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.0.len())
            .field("code", &self.code())
            .field("domain", &self.domain())
            .finish()
    }
}

/// Reads the size field of a buffered header.
pub fn peek_size(header: &[u8]) -> u32 {
    u32::from_le_bytes([
        header[OFFSET_SIZE],
        header[OFFSET_SIZE + 1],
        header[OFFSET_SIZE + 2],
        header[OFFSET_SIZE + 3],
    ])
}

/// Splits the first complete packet off `buf`, if there is one.
pub fn take_packet(buf: &mut Vec<u8>) -> Result<Option<Packet>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let size = peek_size(buf) as usize;
    if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(Error::BadProgram(format!("packet size {size} out of range")));
    }
    if buf.len() < size {
        return Ok(None);
    }
    let rest = buf.split_off(size);
    let packet = std::mem::replace(buf, rest);
    Packet::parse(packet).map(Some)
}

/// Builds a data packet. Empty `data` marks the end of the stream.
pub fn data_packet(code: i16, stream: i32, note: i32, data: &[u8]) -> Packet {
    let mut payload = Vec::with_capacity(8 + data.len());
    payload.extend_from_slice(&stream.to_le_bytes());
    payload.extend_from_slice(&note.to_le_bytes());
    payload.extend_from_slice(data);
    Packet::new(code, Domain::Data, &payload)
}

/// Stream id, note and bytes of a data packet.
pub fn parse_data(packet: &Packet) -> Result<(i32, i32, &[u8])> {
    let payload = packet.payload();
    if payload.len() < 8 {
        return Err(Error::BadProgram("truncated data packet".into()));
    }
    let stream = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let note = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Ok((stream, note, &payload[8..]))
}

pub fn flow_packet(code: i16, flows: &[(i32, i32)]) -> Packet {
    let mut payload = Vec::with_capacity(flows.len() * FLOW_ENTRY_SIZE);
    for (stream, increment) in flows {
        payload.extend_from_slice(&stream.to_le_bytes());
        payload.extend_from_slice(&increment.to_le_bytes());
    }
    Packet::new(code, Domain::Flow, &payload)
}

/// `(stream id, increment)` pairs of a flow packet.
pub fn parse_flows(packet: &Packet) -> Result<Vec<(i32, i32)>> {
    let payload = packet.payload();
    if payload.len() % FLOW_ENTRY_SIZE != 0 {
        return Err(Error::BadProgram("flow packet has a partial entry".into()));
    }
    Ok(payload
        .chunks_exact(FLOW_ENTRY_SIZE)
        .map(|c| {
            (
                i32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                i32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            )
        })
        .collect())
}

/// Service names of a discovery call: `u16 count`, `count` name lengths,
/// then the names back to back.
pub fn parse_discovery(packet: &Packet) -> Result<Vec<String>> {
    if packet.domain() != Domain::Call {
        return Err(Error::BadProgram(
            "services discovery must be a call".into(),
        ));
    }
    let payload = packet.payload();
    if payload.len() < 2 {
        return Err(Error::BadProgram("truncated services discovery".into()));
    }
    let count = usize::from(u16::from_le_bytes([payload[0], payload[1]]));
    let lengths = payload
        .get(2..2 + count)
        .ok_or_else(|| Error::BadProgram("truncated service name lengths".into()))?;

    let mut names = Vec::with_capacity(count);
    let mut pos = 2 + count;
    for &len in lengths {
        let len = usize::from(len);
        let raw = payload
            .get(pos..pos + len)
            .ok_or_else(|| Error::BadProgram("truncated service name".into()))?;
        let name = std::str::from_utf8(raw)
            .map_err(|_| Error::BadProgram("service name is not UTF-8".into()))?;
        if name.is_empty() {
            return Err(Error::BadProgram("empty service name".into()));
        }
        names.push(name.to_string());
        pos += len;
    }
    Ok(names)
}

/// Encodes a discovery call for `names`. Used by programs, and by tests
/// standing in for them.
pub fn discovery_packet(names: &[&str]) -> Packet {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(names.len() as u16).to_le_bytes());
    payload.extend(names.iter().map(|n| n.len() as u8));
    for name in names {
        payload.extend_from_slice(name.as_bytes());
    }
    Packet::new(CODE_SERVICES, Domain::Call, &payload)
}

/// Reply to a discovery call: `u16 count`, 6 pad bytes, then per service
/// `u8 flags`, 3 pad bytes, `u32 max_send_size`.
pub fn discovery_reply(states: &[(u8, u32)]) -> Packet {
    let mut payload = Vec::with_capacity(8 + states.len() * SERVICE_STATE_SIZE);
    payload.extend_from_slice(&(states.len() as u16).to_le_bytes());
    payload.extend_from_slice(&[0; 6]);
    for (flags, max_send_size) in states {
        payload.extend_from_slice(&[*flags, 0, 0, 0]);
        payload.extend_from_slice(&max_send_size.to_le_bytes());
    }
    Packet::new(CODE_SERVICES, Domain::Call, &payload)
}

/// Decodes a discovery reply into `(flags, max_send_size)` pairs.
pub fn parse_discovery_reply(packet: &Packet) -> Result<Vec<(u8, u32)>> {
    let payload = packet.payload();
    if payload.len() < 8 {
        return Err(Error::BadProgram("truncated discovery reply".into()));
    }
    let count = usize::from(u16::from_le_bytes([payload[0], payload[1]]));
    let entries = &payload[8..];
    if entries.len() != count * SERVICE_STATE_SIZE {
        return Err(Error::BadProgram("discovery reply length mismatch".into()));
    }
    Ok(entries
        .chunks_exact(SERVICE_STATE_SIZE)
        .map(|c| (c[0], u32::from_le_bytes([c[4], c[5], c[6], c[7]])))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let p = Packet::new(3, Domain::Flow, b"abcd");
        assert_eq!(p.as_bytes()[..8], [12, 0, 0, 0, 3, 0, 2, 0]);
        assert_eq!(p.code(), 3);
        assert_eq!(p.domain(), Domain::Flow);
        assert_eq!(p.payload(), b"abcd");
    }

    #[test]
    fn test_take_packet_waits_for_complete_packet() {
        let p = data_packet(0, 0, 0, b"hello");
        let mut buf = p.as_bytes()[..10].to_vec();
        assert_eq!(take_packet(&mut buf).unwrap(), None);

        buf.extend_from_slice(&p.as_bytes()[10..]);
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(take_packet(&mut buf).unwrap(), Some(p));
        assert_eq!(buf, vec![1, 2]);
    }

    #[test]
    fn test_take_packet_rejects_bad_sizes() {
        let mut buf = vec![4, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(take_packet(&mut buf), Err(Error::BadProgram(_))));

        let mut buf = vec![0, 0, 2, 0, 0, 0, 0, 0];
        assert!(matches!(take_packet(&mut buf), Err(Error::BadProgram(_))));
    }

    #[test]
    fn test_unknown_domain_rejected() {
        let mut bytes = Packet::new(0, Domain::Call, &[]).into_bytes();
        bytes[OFFSET_DOMAIN] = 9;
        assert!(matches!(Packet::parse(bytes), Err(Error::BadProgram(_))));
    }

    #[test]
    fn test_discovery() {
        let p = discovery_packet(&["origin", "gate.io/random"]);
        assert_eq!(
            parse_discovery(&p).unwrap(),
            vec!["origin".to_string(), "gate.io/random".to_string()]
        );

        let truncated = Packet::new(CODE_SERVICES, Domain::Call, &[2, 0, 6]);
        assert!(parse_discovery(&truncated).is_err());

        let wrong_domain = Packet::new(CODE_SERVICES, Domain::Info, &p.payload()[..]);
        assert!(parse_discovery(&wrong_domain).is_err());
    }

    #[test]
    fn test_discovery_reply_layout() {
        let reply = discovery_reply(&[(1, 65536), (0, 0)]);
        assert_eq!(reply.len(), HEADER_SIZE + 8 + 16);
        assert_eq!(&reply.payload()[0..2], &[2, 0]);
        assert_eq!(
            parse_discovery_reply(&reply).unwrap(),
            vec![(1, 65536), (0, 0)]
        );
    }

    #[test]
    fn test_data_and_flow() {
        let p = data_packet(2, 0, 7, b"xyz");
        assert_eq!(parse_data(&p).unwrap(), (0, 7, &b"xyz"[..]));

        let f = flow_packet(2, &[(0, 4096), (1, -1)]);
        assert_eq!(parse_flows(&f).unwrap(), vec![(0, 4096), (1, -1)]);

        let bad = Packet::new(2, Domain::Flow, &[0; 5]);
        assert!(parse_flows(&bad).is_err());
    }
}
