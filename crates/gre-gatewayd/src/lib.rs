//! GRE Tunnel Gateway Daemon - control-plane engine
//!
//! gre-gatewayd admits client flows signaled by GRE gateways, handling:
//! - Per-VRF UDP signaling with GRE gateways
//! - Policy matching and forwarding processor selection
//! - Tunnel key allocation and session lifecycle
//! - Session provisioning over TCP to forwarding processors
//! - Host route and next-hop programming through the routing service
//! - Cascading cleanup when configuration is withdrawn

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod dpclient;
pub mod engine;
pub mod error;
pub mod keyalloc;
pub mod management;
pub mod outbox;
pub mod processor_link;
pub mod proto;
pub mod receive;
pub mod routing;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use config::{BootstrapConfig, DaemonConfig, EngineConfig};
pub use engine::Engine;
pub use error::{GatewayError, Result};
pub use management::{InterfaceSpec, IpipSpec, ProcessorSpec, UserSpec, VrfSpec};
pub use processor_link::{LinkOptions, ProcessorEvents, ProcessorLink};
pub use session::{SessionOrch, SessionOrchCallbacks, SessionOrchConfig};
pub use stats::EngineStats;
pub use store::{DpId, GatewayKey, InterfaceKey, SessionId, VrfId};
