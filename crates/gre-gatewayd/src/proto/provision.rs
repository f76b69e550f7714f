//! Forwarding processor provisioning protocol.
//!
//! A message is an 8-byte header followed by `count` sub-messages:
//!
//! ```text
//! header:      type u8 | count u8 | reserved u16 | length u32 (whole message)
//! sub-message: sub_type u8 | error u8 | length u16 (header included) | body
//! ```
//!
//! Session bodies are 56 bytes, tunnel bodies 16 bytes. Over a byte stream
//! the header's `length` delimits messages.

use std::fmt;
use std::net::Ipv4Addr;

use byteorder::{ByteOrder, NetworkEndian};
use gre_types::{FiveTuple, IpProtocol};

use crate::error::{GatewayError, Result};
use crate::store::{EgressKind, TunnelKind, TunnelSpec, VrfId};

pub const HEADER_LEN: usize = 8;
pub const SUB_HEADER_LEN: usize = 4;
pub const SESSION_BODY_LEN: usize = 56;
pub const TUNNEL_BODY_LEN: usize = 16;

/// Direction of a provisioning message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Reply = 2,
}

impl MessageKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Reply),
            _ => None,
        }
    }
}

/// Sub-message operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubType {
    AddGreSession = 1,
    DelGreSession = 2,
    AddTunnel = 3,
    DelTunnel = 4,
}

impl SubType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SubType::AddGreSession),
            2 => Some(SubType::DelGreSession),
            3 => Some(SubType::AddTunnel),
            4 => Some(SubType::DelTunnel),
            _ => None,
        }
    }

    pub const fn is_session(&self) -> bool {
        matches!(self, SubType::AddGreSession | SubType::DelGreSession)
    }
}

impl fmt::Display for SubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubType::AddGreSession => "ADD_GRE_SESSION",
            SubType::DelGreSession => "DEL_GRE_SESSION",
            SubType::AddTunnel => "ADD_TUNNEL",
            SubType::DelTunnel => "DEL_TUNNEL",
        };
        f.write_str(s)
    }
}

/// Ingress tunnel fields of a session sub-message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressInfo {
    pub vrf: VrfId,
    pub key: u32,
    pub local_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub peer_key: u32,
}

/// Egress fields of a session sub-message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgressInfo {
    pub kind: EgressKind,
    pub vrf: VrfId,
    pub local_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
}

/// Body of ADD_GRE_SESSION / DEL_GRE_SESSION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBody {
    /// Session id, echoed in the reply.
    pub context: u32,
    pub ingress: IngressInfo,
    pub egress: EgressInfo,
    pub tuple: FiveTuple,
}

/// Sub-message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubBody {
    Session(SessionBody),
    Tunnel(TunnelSpec),
}

/// One sub-message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubMessage {
    pub sub_type: SubType,
    /// Zero on success in replies; always zero in requests.
    pub error: u8,
    pub body: SubBody,
}

impl SubMessage {
    pub fn session(sub_type: SubType, body: SessionBody) -> Self {
        Self {
            sub_type,
            error: 0,
            body: SubBody::Session(body),
        }
    }

    pub fn tunnel(sub_type: SubType, tunnel: TunnelSpec) -> Self {
        Self {
            sub_type,
            error: 0,
            body: SubBody::Tunnel(tunnel),
        }
    }

    pub fn encoded_len(&self) -> usize {
        SUB_HEADER_LEN
            + match self.body {
                SubBody::Session(_) => SESSION_BODY_LEN,
                SubBody::Tunnel(_) => TUNNEL_BODY_LEN,
            }
    }

    pub fn is_success(&self) -> bool {
        self.error == 0
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let len = self.encoded_len();
        out.resize(start + len, 0);
        let buf = &mut out[start..];
        buf[0] = self.sub_type as u8;
        buf[1] = self.error;
        NetworkEndian::write_u16(&mut buf[2..4], len as u16);
        let body = &mut buf[SUB_HEADER_LEN..];
        match &self.body {
            SubBody::Session(s) => encode_session(s, body),
            SubBody::Tunnel(t) => encode_tunnel(t, body),
        }
    }

    /// Decodes the sub-message at the start of `buf`, returning it and its
    /// length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < SUB_HEADER_LEN {
            return Err(GatewayError::malformed("sub-message header truncated"));
        }
        let sub_type = SubType::from_u8(buf[0])
            .ok_or_else(|| GatewayError::malformed(format!("unknown sub-message type {}", buf[0])))?;
        let error = buf[1];
        let len = usize::from(NetworkEndian::read_u16(&buf[2..4]));
        let body_len = if sub_type.is_session() {
            SESSION_BODY_LEN
        } else {
            TUNNEL_BODY_LEN
        };
        if len < SUB_HEADER_LEN + body_len || len > buf.len() {
            return Err(GatewayError::malformed(format!(
                "{} length {} invalid",
                sub_type, len
            )));
        }
        let body = &buf[SUB_HEADER_LEN..len];
        let body = if sub_type.is_session() {
            SubBody::Session(decode_session(body)?)
        } else {
            SubBody::Tunnel(decode_tunnel(body)?)
        };
        Ok((
            SubMessage {
                sub_type,
                error,
                body,
            },
            len,
        ))
    }
}

fn ip(buf: &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(NetworkEndian::read_u32(buf))
}

fn put_ip(buf: &mut [u8], addr: Ipv4Addr) {
    NetworkEndian::write_u32(buf, u32::from(addr));
}

fn egress_kind_to_u8(kind: EgressKind) -> u8 {
    match kind {
        EgressKind::Ipip => 1,
        EgressKind::Native => 2,
    }
}

fn tunnel_kind_to_u8(kind: TunnelKind) -> u8 {
    match kind {
        TunnelKind::Gre => 1,
        TunnelKind::Ipip => 2,
    }
}

fn encode_session(s: &SessionBody, b: &mut [u8]) {
    NetworkEndian::write_u32(&mut b[0..4], s.context);
    NetworkEndian::write_u32(&mut b[4..8], s.ingress.vrf.0);
    NetworkEndian::write_u32(&mut b[8..12], s.ingress.key);
    put_ip(&mut b[12..16], s.ingress.local_ip);
    put_ip(&mut b[16..20], s.ingress.peer_ip);
    NetworkEndian::write_u32(&mut b[20..24], s.ingress.peer_key);
    b[24] = egress_kind_to_u8(s.egress.kind);
    NetworkEndian::write_u32(&mut b[28..32], s.egress.vrf.0);
    put_ip(&mut b[32..36], s.egress.local_ip);
    put_ip(&mut b[36..40], s.egress.peer_ip);
    b[40] = s.tuple.protocol.value();
    NetworkEndian::write_u16(&mut b[44..46], s.tuple.src_port);
    NetworkEndian::write_u16(&mut b[46..48], s.tuple.dst_port);
    put_ip(&mut b[48..52], s.tuple.src_ip);
    put_ip(&mut b[52..56], s.tuple.dst_ip);
}

fn decode_session(b: &[u8]) -> Result<SessionBody> {
    let kind = match b[24] {
        1 => EgressKind::Ipip,
        2 => EgressKind::Native,
        other => return Err(GatewayError::malformed(format!("unknown egress kind {}", other))),
    };
    Ok(SessionBody {
        context: NetworkEndian::read_u32(&b[0..4]),
        ingress: IngressInfo {
            vrf: VrfId(NetworkEndian::read_u32(&b[4..8])),
            key: NetworkEndian::read_u32(&b[8..12]),
            local_ip: ip(&b[12..16]),
            peer_ip: ip(&b[16..20]),
            peer_key: NetworkEndian::read_u32(&b[20..24]),
        },
        egress: EgressInfo {
            kind,
            vrf: VrfId(NetworkEndian::read_u32(&b[28..32])),
            local_ip: ip(&b[32..36]),
            peer_ip: ip(&b[36..40]),
        },
        tuple: FiveTuple {
            protocol: IpProtocol(b[40]),
            src_port: NetworkEndian::read_u16(&b[44..46]),
            dst_port: NetworkEndian::read_u16(&b[46..48]),
            src_ip: ip(&b[48..52]),
            dst_ip: ip(&b[52..56]),
        },
    })
}

fn encode_tunnel(t: &TunnelSpec, b: &mut [u8]) {
    b[0] = tunnel_kind_to_u8(t.kind);
    NetworkEndian::write_u32(&mut b[4..8], t.vrf.0);
    put_ip(&mut b[8..12], t.local_ip);
    put_ip(&mut b[12..16], t.peer_ip);
}

fn decode_tunnel(b: &[u8]) -> Result<TunnelSpec> {
    let kind = match b[0] {
        1 => TunnelKind::Gre,
        2 => TunnelKind::Ipip,
        other => return Err(GatewayError::malformed(format!("unknown tunnel kind {}", other))),
    };
    Ok(TunnelSpec {
        kind,
        vrf: VrfId(NetworkEndian::read_u32(&b[4..8])),
        local_ip: ip(&b[8..12]),
        peer_ip: ip(&b[12..16]),
    })
}

/// Writes a message header at the start of `buf`.
pub fn write_header(buf: &mut [u8], kind: MessageKind, count: u8, length: u32) {
    buf[0] = kind as u8;
    buf[1] = count;
    buf[2] = 0;
    buf[3] = 0;
    NetworkEndian::write_u32(&mut buf[4..8], length);
}

/// Length of the complete message at the start of `buf`, once its header
/// has arrived.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    (buf.len() >= HEADER_LEN).then(|| NetworkEndian::read_u32(&buf[4..8]) as usize)
}

/// A decoded provisioning message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionMessage {
    pub kind: MessageKind,
    pub subs: Vec<SubMessage>,
}

impl ProvisionMessage {
    pub fn new(kind: MessageKind, subs: Vec<SubMessage>) -> Self {
        Self { kind, subs }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0; HEADER_LEN];
        for sub in &self.subs {
            sub.encode(&mut out);
        }
        let len = out.len() as u32;
        write_header(&mut out, self.kind, self.subs.len() as u8, len);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(GatewayError::malformed("provisioning header truncated"));
        }
        let kind = MessageKind::from_u8(buf[0])
            .ok_or_else(|| GatewayError::malformed(format!("unknown message kind {}", buf[0])))?;
        let count = usize::from(buf[1]);
        let length = NetworkEndian::read_u32(&buf[4..8]) as usize;
        if length < HEADER_LEN || length > buf.len() {
            return Err(GatewayError::malformed(format!(
                "provisioning length {} invalid for {} bytes",
                length,
                buf.len()
            )));
        }

        let mut rest = &buf[HEADER_LEN..length];
        let mut subs = Vec::with_capacity(count);
        for _ in 0..count {
            let (sub, used) = SubMessage::decode(rest)?;
            subs.push(sub);
            rest = &rest[used..];
        }
        if !rest.is_empty() {
            return Err(GatewayError::malformed(format!(
                "{} trailing bytes after {} sub-messages",
                rest.len(),
                count
            )));
        }
        Ok(Self { kind, subs })
    }
}
