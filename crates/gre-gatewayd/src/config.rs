//! Engine and daemon configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::management::{InterfaceSpec, IpipSpec, ProcessorSpec, UserSpec, VrfSpec};
use crate::proto::signaling::MESSAGE_LEN;
use crate::session::SessionOrchConfig;
use crate::store::DpId;

/// Tuning of the receive pipeline and the outbound buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub receive_threads: usize,
    pub worker_threads: usize,
    /// Receive buffers in the shared pool.
    pub buffer_count: usize,
    /// Bytes per receive buffer.
    pub buffer_size: usize,
    pub poll_timeout_ms: u64,
    pub max_signal_datagram: usize,
    pub processor_send_buffer: usize,
    pub max_submessages: u8,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            receive_threads: 2,
            worker_threads: 4,
            buffer_count: 1024,
            buffer_size: 2048,
            poll_timeout_ms: 100,
            max_signal_datagram: 1400,
            processor_send_buffer: 8192,
            max_submessages: 255,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.receive_threads == 0 {
            return Err(GatewayError::config("receive_threads must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(GatewayError::config("worker_threads must be at least 1"));
        }
        if self.buffer_count == 0 {
            return Err(GatewayError::config("buffer_count must be at least 1"));
        }
        if self.buffer_size < MESSAGE_LEN {
            return Err(GatewayError::config(format!(
                "buffer_size {} is smaller than one signaling message ({MESSAGE_LEN})",
                self.buffer_size
            )));
        }
        if self.max_signal_datagram < MESSAGE_LEN {
            return Err(GatewayError::config(format!(
                "max_signal_datagram {} is smaller than one signaling message ({MESSAGE_LEN})",
                self.max_signal_datagram
            )));
        }
        if self.max_submessages == 0 {
            return Err(GatewayError::config("max_submessages must be at least 1"));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn orch_config(&self) -> SessionOrchConfig {
        SessionOrchConfig {
            max_signal_datagram: self.max_signal_datagram,
            processor_send_buffer: self.processor_send_buffer,
            max_submessages: self.max_submessages,
        }
    }
}

/// Static management records applied at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootstrapConfig {
    pub vrfs: Vec<VrfSpec>,
    pub ipip_gateways: Vec<IpipSpec>,
    pub users: Vec<UserSpec>,
    pub processors: Vec<ProcessorSpec>,
    pub interfaces: Vec<InterfaceSpec>,
}

impl BootstrapConfig {
    /// Interfaces belonging to processor `dp`.
    pub fn interfaces_of(&self, dp: DpId) -> impl Iterator<Item = &InterfaceSpec> {
        self.interfaces.iter().filter(move |i| i.dp == dp)
    }
}

/// The daemon's configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub bootstrap: BootstrapConfig,
}

impl DaemonConfig {
    /// Reads and validates a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: DaemonConfig = serde_yaml::from_str(text)
            .map_err(|e| GatewayError::config(format!("invalid configuration: {e}")))?;
        config.engine.validate()?;
        Ok(config)
    }
}
