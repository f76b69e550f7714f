//! Client flow identity.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// IP protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpProtocol(pub u8);

impl IpProtocol {
    pub const ICMP: Self = IpProtocol(1);
    pub const TCP: Self = IpProtocol(6);
    pub const UDP: Self = IpProtocol(17);
    pub const GRE: Self = IpProtocol(47);

    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IpProtocol::ICMP => write!(f, "icmp"),
            IpProtocol::TCP => write!(f, "tcp"),
            IpProtocol::UDP => write!(f, "udp"),
            IpProtocol::GRE => write!(f, "gre"),
            IpProtocol(other) => write!(f, "{}", other),
        }
    }
}

impl FromStr for IpProtocol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(IpProtocol::ICMP),
            "tcp" => Ok(IpProtocol::TCP),
            "udp" => Ok(IpProtocol::UDP),
            "gre" => Ok(IpProtocol::GRE),
            other => other
                .parse::<u8>()
                .map(IpProtocol)
                .map_err(|_| ParseError::InvalidProtocol(s.to_string())),
        }
    }
}

/// Client 5-tuple as signaled by a GRE gateway.
///
/// Ordering is lexicographic over (protocol, src, dst, ports) so the tuple can
/// key ordered indexes directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FiveTuple {
    pub protocol: IpProtocol,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FiveTuple {
    pub fn new(
        protocol: IpProtocol,
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Self {
        Self {
            protocol,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    /// The all-zero tuple, used by messages that carry no flow (HELLO).
    pub const fn empty() -> Self {
        Self {
            protocol: IpProtocol(0),
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}
