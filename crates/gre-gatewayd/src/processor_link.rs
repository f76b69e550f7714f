//! TCP connection manager for forwarding processors.
//!
//! One thread per processor connects, reports the connection to the
//! engine, then reads length-framed provisioning replies until the peer
//! goes away. Losing the connection is reported as a shutdown and the
//! thread reconnects after a pause.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dpclient::{ProcessorTransport, TcpTransport};
use crate::error::{GatewayError, Result};
use crate::proto::provision::{frame_len, HEADER_LEN};
use crate::session::SessionOrch;
use crate::store::DpId;

/// Largest provisioning message accepted from a processor.
const MAX_FRAME: usize = 1 << 20;

/// Connection events delivered to the engine.
pub trait ProcessorEvents: Send + Sync {
    fn connected(&self, dp: DpId, transport: Arc<dyn ProcessorTransport>) -> Result<()>;

    fn established(&self, dp: DpId) -> Result<()>;

    fn message(&self, dp: DpId, bytes: &[u8]);

    fn shutdown(&self, dp: DpId);
}

impl ProcessorEvents for SessionOrch {
    fn connected(&self, dp: DpId, transport: Arc<dyn ProcessorTransport>) -> Result<()> {
        self.processor_connected(dp, transport)
    }

    fn established(&self, dp: DpId) -> Result<()> {
        self.processor_established(dp)
    }

    fn message(&self, dp: DpId, bytes: &[u8]) {
        self.on_processor_message(dp, bytes);
    }

    fn shutdown(&self, dp: DpId) {
        if let Err(e) = self.processor_shutdown(dp) {
            debug!(dp = %dp, error = %e, "Shutdown for unknown processor");
        }
    }
}

/// Link settings.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    /// Pause between connection attempts.
    pub retry: Duration,
    /// How often a blocked read checks for shutdown.
    pub poll: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            retry: Duration::from_secs(2),
            poll: Duration::from_millis(200),
        }
    }
}

/// Connection manager of one processor.
pub struct ProcessorLink {
    dp: DpId,
    addr: SocketAddr,
    events: Arc<dyn ProcessorEvents>,
    stop: Arc<AtomicBool>,
    options: LinkOptions,
}

impl ProcessorLink {
    /// Starts the link thread.
    pub fn spawn(
        dp: DpId,
        addr: SocketAddr,
        events: Arc<dyn ProcessorEvents>,
        stop: Arc<AtomicBool>,
        options: LinkOptions,
    ) -> Result<JoinHandle<()>> {
        let link = Self {
            dp,
            addr,
            events,
            stop,
            options,
        };
        let name = format!("link-{dp}");
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || link.run())
            .map_err(|source| GatewayError::Spawn { name, source })
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(&self) {
        info!(dp = %self.dp, addr = %self.addr, "Processor link started");
        while !self.stopped() {
            match TcpStream::connect_timeout(&self.addr, self.options.retry) {
                Ok(stream) => {
                    match self.serve(stream) {
                        Ok(()) => info!(dp = %self.dp, "Processor connection closed"),
                        Err(e) => warn!(dp = %self.dp, error = %e, "Processor connection lost"),
                    }
                    self.events.shutdown(self.dp);
                }
                Err(e) => debug!(dp = %self.dp, addr = %self.addr, error = %e, "Connect failed"),
            }
            self.pause();
        }
        info!(dp = %self.dp, "Processor link stopped");
    }

    fn pause(&self) {
        let step = self.options.poll.min(self.options.retry);
        let mut waited = Duration::ZERO;
        while waited < self.options.retry && !self.stopped() {
            thread::sleep(step);
            waited += step;
        }
    }

    /// Runs one connection until EOF, error or shutdown.
    fn serve(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.options.poll))?;
        let writer = stream.try_clone()?;
        self.events
            .connected(self.dp, Arc::new(TcpTransport::new(writer)))?;
        self.events.established(self.dp)?;

        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; 64 * 1024];
        while !self.stopped() {
            let n = match stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            pending.extend_from_slice(&chunk[..n]);

            while let Some(len) = frame_len(&pending) {
                if !(HEADER_LEN..=MAX_FRAME).contains(&len) {
                    return Err(GatewayError::malformed(format!(
                        "provisioning frame length {len}"
                    )));
                }
                if pending.len() < len {
                    break;
                }
                let frame: Vec<u8> = pending.drain(..len).collect();
                self.events.message(self.dp, &frame);
            }
        }
        Ok(())
    }
}
