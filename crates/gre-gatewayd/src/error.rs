//! Error types for the gateway engine.
//!
//! Every variant belongs to one class of the engine's error taxonomy
//! (resource exhaustion, lookup failure, admission failure, allocation
//! failure, processor failure, collaborator inconsistency). Errors that can
//! be surfaced to a gateway convert into a signaling [`ErrorCode`].

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::proto::signaling::ErrorCode;
use crate::store::{DpId, InterfaceKey, VrfId};

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Which session index rejected an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIndex {
    /// VRF index keyed by ingress tunnel key.
    VrfKey,
    /// GRE gateway index keyed by client 5-tuple.
    Gateway,
    /// IPIP gateway index keyed by client 5-tuple.
    IpipGateway,
    /// User policy index keyed by client 5-tuple.
    User,
}

impl std::fmt::Display for SessionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionIndex::VrfKey => "vrf-key",
            SessionIndex::Gateway => "gateway",
            SessionIndex::IpipGateway => "ipip-gateway",
            SessionIndex::User => "user",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the gateway engine.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// VRF lookup failed.
    #[error("VRF {0} not found")]
    VrfNotFound(VrfId),

    /// VRF already exists.
    #[error("VRF {0} already exists")]
    VrfExists(VrfId),

    /// GRE gateway lookup failed.
    #[error("GRE gateway {ip} not found in VRF {vrf}")]
    GatewayNotFound { vrf: VrfId, ip: Ipv4Addr },

    /// IPIP gateway lookup failed.
    #[error("IPIP gateway {ip} not found in VRF {vrf}")]
    IpipGatewayNotFound { vrf: VrfId, ip: Ipv4Addr },

    /// IPIP gateway already exists.
    #[error("IPIP gateway {ip} already exists in VRF {vrf}")]
    IpipGatewayExists { vrf: VrfId, ip: Ipv4Addr },

    /// User policy lookup failed.
    #[error("User policy '{0}' not found")]
    UserNotFound(String),

    /// User policy already exists.
    #[error("User policy '{0}' already exists")]
    UserExists(String),

    /// Forwarding processor lookup failed.
    #[error("Processor {0} not found")]
    ProcessorNotFound(DpId),

    /// Forwarding processor already exists.
    #[error("Processor {0} already exists")]
    ProcessorExists(DpId),

    /// Forwarding processor is not up or has no live connection.
    #[error("Processor {0} is not accepting work")]
    ProcessorUnavailable(DpId),

    /// Interface lookup failed.
    #[error("Interface {0} not found")]
    InterfaceNotFound(InterfaceKey),

    /// Interface already exists.
    #[error("Interface {0} already exists")]
    InterfaceExists(InterfaceKey),

    /// A session with the same identity exists in one of its indexes.
    #[error("Session already present in {index} index")]
    DuplicateSession { index: SessionIndex },

    /// The VRF already holds its configured maximum of sessions.
    #[error("VRF {0} session limit reached")]
    SessionLimit(VrfId),

    /// Every tunnel key in the VRF's range is taken.
    #[error("VRF {0} tunnel key range exhausted")]
    KeysExhausted(VrfId),

    /// No user policy matched the client.
    #[error("No user policy matches {0}")]
    NoPolicy(Ipv4Addr),

    /// No forwarding processor offers both ingress and egress interfaces.
    #[error("No forwarding processor available for VRF {ingress} -> {egress}")]
    NoProcessor { ingress: VrfId, egress: VrfId },

    /// Wire message could not be decoded.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Thread could not be started.
    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (unexpected state such as a corrupt index).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Creates a malformed-message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Maps the error onto the failure code reported to a gateway.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            GatewayError::DuplicateSession { .. } => ErrorCode::SessionExists,
            GatewayError::NoPolicy(_)
            | GatewayError::UserNotFound(_)
            | GatewayError::VrfNotFound(_)
            | GatewayError::IpipGatewayNotFound { .. } => ErrorCode::NoPolicy,
            GatewayError::NoProcessor { .. }
            | GatewayError::ProcessorNotFound(_)
            | GatewayError::InterfaceNotFound(_) => ErrorCode::NoProcessor,
            GatewayError::SessionLimit(_) | GatewayError::KeysExhausted(_) => {
                ErrorCode::ResourceUnavailable
            }
            GatewayError::ProcessorUnavailable(_) => ErrorCode::ProcessorFailure,
            GatewayError::Malformed(_) => ErrorCode::Malformed,
            _ => ErrorCode::Internal,
        }
    }
}
