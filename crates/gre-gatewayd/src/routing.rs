//! Routing and next-hop service boundary.
//!
//! Requests are fire-and-forget. Each carries a [`RoutingContext`] that the
//! service hands back with its reply through
//! [`SessionOrch::on_routing_reply`](crate::session::SessionOrch::on_routing_reply).
//! Replies may arrive after the object they refer to has started going
//! away; the store resolves them against the object's current state.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gre_types::Ipv4Prefix;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::session::SessionOrch;
use crate::store::{InterfaceKey, RouteKey, VrfId};

/// What a routing request is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingContext {
    /// The next hop of an interface.
    NextHop(InterfaceKey),
    /// An interface or client route.
    Route(RouteKey),
}

impl fmt::Display for RoutingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingContext::NextHop(i) => write!(f, "next-hop {}", i),
            RoutingContext::Route(r) => write!(f, "route {}", r),
        }
    }
}

/// Requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingOp {
    CreateNextHop,
    DeleteNextHop,
    AddRoute,
    DeleteRoute,
}

/// Outcome of one routing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingReply {
    pub ctx: RoutingContext,
    pub op: RoutingOp,
    pub ok: bool,
}

/// Asynchronous next-hop and route programming.
pub trait RoutingService: Send + Sync {
    fn create_next_hop(&self, ctx: RoutingContext, vrf: VrfId, ip: Ipv4Addr);

    fn delete_next_hop(&self, ctx: RoutingContext, vrf: VrfId, ip: Ipv4Addr);

    fn add_route(&self, ctx: RoutingContext, vrf: VrfId, prefix: Ipv4Prefix, via: Ipv4Addr);

    fn delete_route(&self, ctx: RoutingContext, vrf: VrfId, prefix: Ipv4Prefix);
}

/// Routing service that accepts every request and acknowledges it from a
/// dedicated event thread.
///
/// Stands in for an external routing daemon when the engine runs alone.
pub struct ChannelRouting {
    tx: Mutex<Sender<RoutingReply>>,
    rx: Mutex<Option<Receiver<RoutingReply>>>,
}

impl Default for ChannelRouting {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRouting {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(Some(rx)),
        }
    }

    fn ack(&self, ctx: RoutingContext, op: RoutingOp) {
        debug!(ctx = %ctx, ?op, "Routing request accepted");
        if self.tx.lock().send(RoutingReply { ctx, op, ok: true }).is_err() {
            warn!(ctx = %ctx, "Routing event thread gone, reply lost");
        }
    }

    /// Starts the thread delivering replies to `orch`. Can be called once.
    pub fn spawn_events(
        &self,
        orch: Arc<SessionOrch>,
        stop: Arc<AtomicBool>,
        poll: Duration,
    ) -> Result<JoinHandle<()>> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| GatewayError::internal("routing event thread already running"))?;
        thread::Builder::new()
            .name("routing-events".to_string())
            .spawn(move || {
                info!("Routing event thread started");
                loop {
                    match rx.recv_timeout(poll) {
                        Ok(reply) => orch.on_routing_reply(reply),
                        Err(RecvTimeoutError::Timeout) => {
                            if stop.load(Ordering::Acquire) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Routing event thread stopped");
            })
            .map_err(|source| GatewayError::Spawn {
                name: "routing-events".to_string(),
                source,
            })
    }
}

impl RoutingService for ChannelRouting {
    fn create_next_hop(&self, ctx: RoutingContext, _vrf: VrfId, _ip: Ipv4Addr) {
        self.ack(ctx, RoutingOp::CreateNextHop);
    }

    fn delete_next_hop(&self, ctx: RoutingContext, _vrf: VrfId, _ip: Ipv4Addr) {
        self.ack(ctx, RoutingOp::DeleteNextHop);
    }

    fn add_route(&self, ctx: RoutingContext, _vrf: VrfId, _prefix: Ipv4Prefix, _via: Ipv4Addr) {
        self.ack(ctx, RoutingOp::AddRoute);
    }

    fn delete_route(&self, ctx: RoutingContext, _vrf: VrfId, _prefix: Ipv4Prefix) {
        self.ack(ctx, RoutingOp::DeleteRoute);
    }
}
