//! Common value types for the GRE tunnel gateway control plane.
//!
//! - [`Ipv4Prefix`]: IPv4 network prefixes (CIDR notation) with subnet matching
//! - [`FiveTuple`]: client flow identity carried in gateway signaling
//! - [`IpProtocol`]: IP protocol numbers

mod ip;
mod tuple;

pub use ip::Ipv4Prefix;
pub use tuple::{FiveTuple, IpProtocol};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid IP protocol: {0}")]
    InvalidProtocol(String),
}
