//! Gateway signaling messages.
//!
//! Every message is 44 bytes in network byte order:
//!
//! ```text
//!  0 type      1 profile   2 error     3 flags
//!  4 length (u16)          6 reserved (u16)
//!  8 message id (u32)
//! 12 protocol  13..16 reserved
//! 16 src port (u16)       18 dst port (u16)
//! 20 src ip (u32)
//! 24 dst ip (u32)
//! 28 gateway key (u32)
//! 32 engine key (u32)
//! 36 gateway tunnel ip (u32)
//! 40 engine tunnel ip (u32)
//! ```
//!
//! A datagram carries one or more messages back to back; each message's
//! `length` says where the next one starts.

use std::fmt;
use std::net::Ipv4Addr;

use byteorder::{ByteOrder, NetworkEndian};
use gre_types::{FiveTuple, IpProtocol};

use crate::error::{GatewayError, Result};

/// Encoded size of one message.
pub const MESSAGE_LEN: usize = 44;

/// Signaling message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    SessionInitReq = 1,
    Transmit = 2,
    SessionEndReq = 3,
    Done = 4,
    ErrReq = 5,
    Err = 6,
    Hello = 7,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::SessionInitReq,
        MessageType::Transmit,
        MessageType::SessionEndReq,
        MessageType::Done,
        MessageType::ErrReq,
        MessageType::Err,
        MessageType::Hello,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| *t as u8 == value)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            MessageType::SessionInitReq => "SESSION_INIT_REQ",
            MessageType::Transmit => "TRANSMIT",
            MessageType::SessionEndReq => "SESSION_END_REQ",
            MessageType::Done => "DONE",
            MessageType::ErrReq => "ERR_REQ",
            MessageType::Err => "ERR",
            MessageType::Hello => "HELLO",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure code carried in the `error` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    SessionExists = 1,
    NoPolicy = 2,
    NoProcessor = 3,
    ResourceUnavailable = 4,
    ProcessorFailure = 5,
    NoSession = 6,
    Malformed = 7,
    Internal = 8,
}

impl ErrorCode {
    /// Decodes a code; anything unknown reads as `Internal`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::SessionExists,
            2 => ErrorCode::NoPolicy,
            3 => ErrorCode::NoProcessor,
            4 => ErrorCode::ResourceUnavailable,
            5 => ErrorCode::ProcessorFailure,
            6 => ErrorCode::NoSession,
            7 => ErrorCode::Malformed,
            _ => ErrorCode::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::SessionExists => "session exists",
            ErrorCode::NoPolicy => "no policy",
            ErrorCode::NoProcessor => "no processor",
            ErrorCode::ResourceUnavailable => "resource unavailable",
            ErrorCode::ProcessorFailure => "processor failure",
            ErrorCode::NoSession => "no session",
            ErrorCode::Malformed => "malformed",
            ErrorCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// One decoded signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalMessage {
    pub msg_type: MessageType,
    pub profile: u8,
    pub error: ErrorCode,
    pub flags: u8,
    pub msg_id: u32,
    pub tuple: FiveTuple,
    /// Key chosen by the gateway.
    pub gw_key: u32,
    /// Ingress key allocated by the engine.
    pub engine_key: u32,
    /// Gateway tunnel endpoint; unspecified means the datagram source.
    pub gw_tunnel_ip: Ipv4Addr,
    pub engine_tunnel_ip: Ipv4Addr,
}

impl SignalMessage {
    /// A message with no flow or tunnel information.
    pub fn new(msg_type: MessageType, msg_id: u32) -> Self {
        Self {
            msg_type,
            profile: 0,
            error: ErrorCode::Ok,
            flags: 0,
            msg_id,
            tuple: FiveTuple::empty(),
            gw_key: 0,
            engine_key: 0,
            gw_tunnel_ip: Ipv4Addr::UNSPECIFIED,
            engine_tunnel_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// A reply to `self`, keeping its flow, profile and tunnel fields.
    pub fn reply(&self, msg_type: MessageType, error: ErrorCode) -> Self {
        Self {
            msg_type,
            error,
            ..*self
        }
    }

    /// Appends the encoded message to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + MESSAGE_LEN, 0);
        let buf = &mut out[start..];
        buf[0] = self.msg_type as u8;
        buf[1] = self.profile;
        buf[2] = self.error as u8;
        buf[3] = self.flags;
        NetworkEndian::write_u16(&mut buf[4..6], MESSAGE_LEN as u16);
        NetworkEndian::write_u32(&mut buf[8..12], self.msg_id);
        buf[12] = self.tuple.protocol.value();
        NetworkEndian::write_u16(&mut buf[16..18], self.tuple.src_port);
        NetworkEndian::write_u16(&mut buf[18..20], self.tuple.dst_port);
        NetworkEndian::write_u32(&mut buf[20..24], u32::from(self.tuple.src_ip));
        NetworkEndian::write_u32(&mut buf[24..28], u32::from(self.tuple.dst_ip));
        NetworkEndian::write_u32(&mut buf[28..32], self.gw_key);
        NetworkEndian::write_u32(&mut buf[32..36], self.engine_key);
        NetworkEndian::write_u32(&mut buf[36..40], u32::from(self.gw_tunnel_ip));
        NetworkEndian::write_u32(&mut buf[40..44], u32::from(self.engine_tunnel_ip));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESSAGE_LEN);
        self.encode(&mut out);
        out
    }

    /// Decodes the message at the start of `buf`.
    ///
    /// Returns the message and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < MESSAGE_LEN {
            return Err(GatewayError::malformed(format!(
                "signaling message truncated: {} bytes",
                buf.len()
            )));
        }
        let length = usize::from(NetworkEndian::read_u16(&buf[4..6]));
        if length < MESSAGE_LEN || length > buf.len() {
            return Err(GatewayError::malformed(format!(
                "signaling length {} invalid for {} available bytes",
                length,
                buf.len()
            )));
        }
        let msg_type = MessageType::from_u8(buf[0])
            .ok_or_else(|| GatewayError::malformed(format!("unknown message type {}", buf[0])))?;

        let tuple = FiveTuple {
            protocol: IpProtocol(buf[12]),
            src_port: NetworkEndian::read_u16(&buf[16..18]),
            dst_port: NetworkEndian::read_u16(&buf[18..20]),
            src_ip: Ipv4Addr::from(NetworkEndian::read_u32(&buf[20..24])),
            dst_ip: Ipv4Addr::from(NetworkEndian::read_u32(&buf[24..28])),
        };
        let msg = SignalMessage {
            msg_type,
            profile: buf[1],
            error: ErrorCode::from_u8(buf[2]),
            flags: buf[3],
            msg_id: NetworkEndian::read_u32(&buf[8..12]),
            tuple,
            gw_key: NetworkEndian::read_u32(&buf[28..32]),
            engine_key: NetworkEndian::read_u32(&buf[32..36]),
            gw_tunnel_ip: Ipv4Addr::from(NetworkEndian::read_u32(&buf[36..40])),
            engine_tunnel_ip: Ipv4Addr::from(NetworkEndian::read_u32(&buf[40..44])),
        };
        Ok((msg, length))
    }
}

/// Iterates the messages of one datagram.
///
/// Stops after the first malformed message; everything behind it is
/// unframed.
pub struct Messages<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> Messages<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl Iterator for Messages<'_> {
    type Item = Result<SignalMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        match SignalMessage::decode(self.buf) {
            Ok((msg, used)) => {
                self.buf = &self.buf[used..];
                Some(Ok(msg))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
