//! Receive threads.
//!
//! Each thread owns a `mio::Poll` over the VRF sockets the scheduler gave
//! it. Readiness is edge-triggered, so a ready socket is read until it
//! would block. If the buffer pool runs dry mid-drain the socket is marked
//! starved and retried on a short poll timeout instead of waiting for an
//! edge that will not come.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferPool, Custody};
use crate::dispatch::Dispatcher;
use crate::error::{GatewayError, Result};
use crate::scheduler::{AffinityRequest, ReceiveSlot, Scheduler};
use crate::session::SessionOrch;
use crate::store::VrfId;

const WAKE: Token = Token(0);
const STARVED_RETRY: Duration = Duration::from_millis(1);

/// Receive-side counters shared by all receive threads.
#[derive(Debug, Default)]
pub struct ReceiveStats {
    pub datagrams: AtomicU64,
    pub starved: AtomicU64,
    pub errors: AtomicU64,
}

/// Everything a receive thread needs.
#[derive(Clone)]
pub struct ReceiveContext {
    pub pool: Arc<BufferPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub orch: Arc<SessionOrch>,
    pub stats: Arc<ReceiveStats>,
    pub stop: Arc<AtomicBool>,
    pub poll_timeout: Duration,
}

struct Attached {
    vrf: VrfId,
    socket: Arc<UdpSocket>,
}

/// A receive thread that has not been started yet.
pub struct Receiver {
    slot: Arc<ReceiveSlot>,
    poll: Poll,
}

impl Receiver {
    pub fn new(id: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE)?;
        Ok(Self {
            slot: Arc::new(ReceiveSlot::new(id, waker)),
            poll,
        })
    }

    pub fn slot(&self) -> &Arc<ReceiveSlot> {
        &self.slot
    }

    pub fn spawn(self, ctx: ReceiveContext) -> Result<JoinHandle<()>> {
        let name = format!("receive-{}", self.slot.id());
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut thread = ReceiveThread {
                    slot: self.slot,
                    poll: self.poll,
                    ctx,
                    sockets: HashMap::new(),
                    tokens: HashMap::new(),
                    starved: HashSet::new(),
                    next_token: 1,
                };
                thread.run();
            })
            .map_err(|source| GatewayError::Spawn { name, source })
    }
}

struct ReceiveThread {
    slot: Arc<ReceiveSlot>,
    poll: Poll,
    ctx: ReceiveContext,
    sockets: HashMap<Token, Attached>,
    tokens: HashMap<VrfId, Token>,
    starved: HashSet<Token>,
    next_token: usize,
}

impl ReceiveThread {
    fn id(&self) -> usize {
        self.slot.id()
    }

    fn run(&mut self) {
        info!(thread = self.id(), "Receive thread started");
        let mut events = Events::with_capacity(64);
        let mut failed = false;

        while !self.ctx.stop.load(Ordering::Acquire) {
            if self.slot.is_retiring() {
                info!(thread = self.id(), "Receive thread retired");
                break;
            }
            self.service_requests();
            let timeout = if self.starved.is_empty() {
                self.ctx.poll_timeout
            } else {
                STARVED_RETRY
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(thread = self.id(), error = %e, "Poll failed, receive thread exiting");
                failed = true;
                break;
            }

            let mut ready: Vec<Token> = events
                .iter()
                .map(|e| e.token())
                .filter(|t| *t != WAKE)
                .collect();
            ready.extend(self.starved.drain());
            for token in ready {
                self.drain(token);
            }
        }

        self.shutdown(failed || self.slot.is_retiring());
        info!(thread = self.id(), "Receive thread stopped");
    }

    fn service_requests(&mut self) {
        for request in self.slot.take_requests() {
            match request {
                AffinityRequest::Attach { vrf, socket } => self.attach(vrf, socket),
                AffinityRequest::Detach { vrf } => self.detach(vrf),
            }
        }
    }

    fn attach(&mut self, vrf: VrfId, socket: Arc<UdpSocket>) {
        let token = Token(self.next_token);
        self.next_token += 1;
        let fd = socket.as_raw_fd();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            error!(thread = self.id(), vrf = %vrf, error = %e, "Failed to register VRF socket");
            return;
        }
        self.tokens.insert(vrf, token);
        self.sockets.insert(token, Attached { vrf, socket });
        self.ctx.orch.set_vrf_owner(vrf, Some(self.id()));
        // Datagrams that arrived before registration produce no edge.
        self.drain(token);
        debug!(thread = self.id(), vrf = %vrf, "Reading VRF socket");
    }

    fn detach(&mut self, vrf: VrfId) {
        let Some(token) = self.tokens.remove(&vrf) else {
            return;
        };
        self.starved.remove(&token);
        if let Some(attached) = self.sockets.remove(&token) {
            let fd = attached.socket.as_raw_fd();
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                warn!(thread = self.id(), vrf = %vrf, error = %e, "Failed to deregister VRF socket");
            }
        }
        self.ctx.orch.set_vrf_owner(vrf, None);
        debug!(thread = self.id(), vrf = %vrf, "Stopped reading VRF socket");
    }

    /// Reads `token`'s socket until it would block or the pool runs dry.
    fn drain(&mut self, token: Token) {
        let Some(attached) = self.sockets.get(&token) else {
            return;
        };
        let vrf = attached.vrf;
        let socket = Arc::clone(&attached.socket);
        loop {
            let Some(mut buffer) = self.ctx.pool.acquire(Custody::Receive) else {
                self.ctx.stats.starved.fetch_add(1, Ordering::Relaxed);
                trace!(thread = self.id(), vrf = %vrf, "Buffer pool empty, pausing socket");
                self.starved.insert(token);
                return;
            };
            match socket.recv_from(buffer.space()) {
                Ok((len, SocketAddr::V4(src))) => {
                    buffer.fill(len, vrf, src);
                    self.ctx.stats.datagrams.fetch_add(1, Ordering::Relaxed);
                    self.ctx.dispatcher.dispatch(buffer);
                }
                Ok((_, SocketAddr::V6(src))) => {
                    debug!(vrf = %vrf, source = %src, "IPv6 signaling ignored");
                    self.ctx.pool.release(buffer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ctx.pool.release(buffer);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.ctx.pool.release(buffer);
                }
                Err(e) => {
                    self.ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(thread = self.id(), vrf = %vrf, error = %e, "Receive failed");
                    self.ctx.pool.release(buffer);
                    return;
                }
            }
        }
    }

    /// Deregisters every socket. A thread that died on its own or was
    /// retired hands its sockets, queued attaches included, to the surviving
    /// threads.
    fn shutdown(&mut self, handoff: bool) {
        let attached: Vec<(VrfId, Arc<UdpSocket>)> = self
            .sockets
            .drain()
            .map(|(_, a)| (a.vrf, a.socket))
            .collect();
        for (_, socket) in &attached {
            let fd = socket.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        self.tokens.clear();
        self.starved.clear();

        if handoff {
            for vrf in self.ctx.scheduler.migrate(self.id(), attached) {
                self.ctx.orch.set_vrf_owner(vrf, None);
            }
        }
    }
}
