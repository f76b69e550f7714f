//! IPv4 prefix type with safe parsing and subnet matching.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 prefix in CIDR notation (e.g., 10.0.0.0/24).
///
/// The stored address keeps whatever host bits it was created with so that
/// `to_string()` round-trips configuration input; matching always masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Prefix {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Prefix {
    /// Creates a new prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length exceeds 32.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum 32",
                prefix_len
            )));
        }
        Ok(Ipv4Prefix {
            address,
            prefix_len,
        })
    }

    /// Creates a /32 host prefix.
    pub const fn host(address: Ipv4Addr) -> Self {
        Ipv4Prefix {
            address,
            prefix_len: 32,
        }
    }

    /// Returns the address this prefix was created with.
    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns the netmask as a host-order integer.
    pub const fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len as u32)
        }
    }

    /// Returns the network address (host bits cleared).
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask())
    }

    /// Returns true if `addr` falls inside this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(addr) & self.mask()) == (u32::from(self.address) & self.mask())
    }

    /// Returns true if this is a host route (/32).
    pub const fn is_host_route(&self) -> bool {
        self.prefix_len == 32
    }

    /// Returns true if this is the default route (0.0.0.0/0).
    pub const fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A bare address is accepted as a host prefix.
        let (addr_str, len_str) = s.rsplit_once('/').unwrap_or((s, "32"));

        let address: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        Ipv4Prefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Prefix {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Prefix> for String {
    fn from(prefix: Ipv4Prefix) -> Self {
        prefix.to_string()
    }
}
