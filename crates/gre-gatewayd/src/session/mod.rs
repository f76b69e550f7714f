//! Signaling state machine.
//!
//! [`SessionOrch`] owns the session store and talks to the three peers of
//! the engine: gateways (signaling replies through each VRF's outbox),
//! forwarding processors (provisioning through their clients) and the
//! routing service. Entry points are called from worker threads (one
//! datagram at a time), from processor connection threads and from the
//! management thread.

mod admission;
mod teardown;

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::dpclient::{ProcessorClient, ProcessorTransport};
use crate::error::{GatewayError, Result};
use crate::management::InterfaceSpec;
use crate::outbox::{GatewayOutbox, SignalingTransport};
use crate::proto::provision::{MessageKind, ProvisionMessage, SubBody, SubMessage, SubType};
use crate::proto::signaling::{MessageType, Messages, SignalMessage};
use crate::routing::{RoutingContext, RoutingOp, RoutingReply, RoutingService};
use crate::store::{
    DpId, GatewayKey, GatewayState, GreGateway, InterfaceKey, ProcessorState, SessionStore,
    StoreAction, VrfId,
};

pub(crate) use teardown::Notify;

/// Callbacks for integration with the receive side of the engine.
pub trait SessionOrchCallbacks: Send + Sync {
    /// A VRF with a signaling address was added; open and attach its socket.
    fn on_vrf_added(&self, _vrf: VrfId, _listen: SocketAddrV4) -> Result<()> {
        Ok(())
    }

    /// A VRF is going away; stop reading its socket.
    fn on_vrf_removed(&self, _vrf: VrfId) {}
}

/// Default no-op callbacks.
struct NoOpCallbacks;
impl SessionOrchCallbacks for NoOpCallbacks {}

/// Configuration for SessionOrch.
#[derive(Debug, Clone)]
pub struct SessionOrchConfig {
    /// Largest signaling datagram sent to a gateway.
    pub max_signal_datagram: usize,
    /// Size of each processor's coalescing buffer.
    pub processor_send_buffer: usize,
    /// Sub-messages per provisioning message.
    pub max_submessages: u8,
}

impl Default for SessionOrchConfig {
    fn default() -> Self {
        Self {
            max_signal_datagram: 1400,
            processor_send_buffer: 8192,
            max_submessages: 255,
        }
    }
}

/// Statistics for SessionOrch operations.
#[derive(Debug, Default)]
pub struct SessionOrchStats {
    pub datagrams: AtomicU64,
    pub datagrams_dropped: AtomicU64,
    pub malformed: AtomicU64,
    /// Received messages, indexed by type value.
    pub messages: [AtomicU64; 8],
    pub sessions_created: AtomicU64,
    pub sessions_rejected: AtomicU64,
    pub sessions_cleared: AtomicU64,
    pub provision_adds: AtomicU64,
    pub provision_deletes: AtomicU64,
    pub processor_failures: AtomicU64,
}

impl SessionOrchStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Connections and outboxes touched while handling one event. Flushed
/// once the event is done.
#[derive(Default)]
pub struct Batch {
    processors: Vec<Arc<ProcessorClient>>,
    outboxes: Vec<Arc<GatewayOutbox>>,
}

impl Batch {
    pub fn touch_processor(&mut self, client: &Arc<ProcessorClient>) {
        if !self.processors.iter().any(|c| Arc::ptr_eq(c, client)) {
            self.processors.push(Arc::clone(client));
        }
    }

    pub fn touch_outbox(&mut self, outbox: &Arc<GatewayOutbox>) {
        if !self.outboxes.iter().any(|o| Arc::ptr_eq(o, outbox)) {
            self.outboxes.push(Arc::clone(outbox));
        }
    }

    /// Sends everything buffered on the touched connections.
    pub fn flush(self) {
        for client in self.processors {
            if let Err(e) = client.flush() {
                debug!(dp = %client.dp(), error = %e, "Provisioning flush failed");
            }
        }
        for outbox in self.outboxes {
            outbox.flush();
        }
    }
}

/// Where a signaling datagram came from.
#[derive(Clone)]
pub(crate) struct Origin {
    pub vrf: VrfId,
    pub src: SocketAddrV4,
    pub outbox: Arc<GatewayOutbox>,
}

impl Origin {
    pub fn gateway(&self) -> GatewayKey {
        GatewayKey::new(self.vrf, *self.src.ip())
    }

    pub fn reply(&self, msg: &SignalMessage, batch: &mut Batch) {
        self.outbox.push(self.src, msg);
        batch.touch_outbox(&self.outbox);
    }
}

/// SessionOrch - the session admission and teardown engine.
pub struct SessionOrch {
    config: SessionOrchConfig,
    store: SessionStore,
    routing: Arc<dyn RoutingService>,
    signaling: Arc<dyn SignalingTransport>,
    callbacks: Arc<dyn SessionOrchCallbacks>,
    stats: SessionOrchStats,
    /// Interfaces to re-add once their earlier incarnation is gone.
    restores: Mutex<BTreeMap<InterfaceKey, InterfaceSpec>>,
}

impl std::fmt::Debug for SessionOrch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrch")
            .field("config", &self.config)
            .field("vrfs", &self.store.vrfs.len())
            .field("sessions", &self.store.sessions.len())
            .finish()
    }
}

impl SessionOrch {
    /// Creates a new SessionOrch with the given configuration and peers.
    pub fn new(
        config: SessionOrchConfig,
        routing: Arc<dyn RoutingService>,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Self {
        Self {
            config,
            store: SessionStore::new(),
            routing,
            signaling,
            callbacks: Arc::new(NoOpCallbacks),
            stats: SessionOrchStats::default(),
            restores: Mutex::new(BTreeMap::new()),
        }
    }

    /// Sets the callbacks.
    pub fn with_callbacks(mut self, callbacks: Arc<dyn SessionOrchCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SessionOrchConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Returns the statistics.
    pub fn stats(&self) -> &SessionOrchStats {
        &self.stats
    }

    /// Handles one signaling datagram received on `vrf`'s socket.
    pub fn handle_datagram(&self, vrf: VrfId, src: SocketAddrV4, data: &[u8]) {
        SessionOrchStats::bump(&self.stats.datagrams);
        let outbox = self
            .store
            .vrfs
            .lookup(&vrf, |v| v.is_usable().then(|| Arc::clone(&v.outbox)))
            .flatten();
        let Some(outbox) = outbox else {
            warn!(vrf = %vrf, gateway = %src, "Datagram for unknown VRF dropped");
            SessionOrchStats::bump(&self.stats.datagrams_dropped);
            return;
        };
        let origin = Origin { vrf, src, outbox };

        // The gateway is only recorded once it sends something well formed.
        let mut admitted = None;
        let mut batch = Batch::default();
        for msg in Messages::new(data) {
            match msg {
                Ok(msg) => {
                    if !*admitted.get_or_insert_with(|| self.touch_gateway(&origin)) {
                        SessionOrchStats::bump(&self.stats.datagrams_dropped);
                        break;
                    }
                    if let Some(counter) = self.stats.messages.get(msg.msg_type as usize) {
                        SessionOrchStats::bump(counter);
                    }
                    self.set_gateway_state(&origin.gateway(), GatewayState::Up);
                    self.handle_message(&origin, &msg, &mut batch);
                }
                Err(e) => {
                    warn!(vrf = %vrf, gateway = %src, error = %e, "Malformed signaling");
                    SessionOrchStats::bump(&self.stats.malformed);
                    self.set_gateway_state(&origin.gateway(), GatewayState::Fail);
                }
            }
        }
        batch.flush();
    }

    fn handle_message(&self, origin: &Origin, msg: &SignalMessage, batch: &mut Batch) {
        trace!(
            vrf = %origin.vrf,
            gateway = %origin.src,
            msg_type = %msg.msg_type,
            msg_id = msg.msg_id,
            tuple = %msg.tuple,
            "Signaling message"
        );
        match msg.msg_type {
            MessageType::SessionInitReq => self.session_init(origin, msg, batch),
            MessageType::SessionEndReq | MessageType::ErrReq => self.session_end(origin, msg, batch),
            MessageType::Hello => {
                origin.reply(&msg.reply(MessageType::Hello, msg.error), batch);
            }
            MessageType::Transmit | MessageType::Done | MessageType::Err => {
                debug!(gateway = %origin.src, msg_type = %msg.msg_type, "Gateway acknowledgement");
            }
        }
    }

    /// Records the gateway a datagram came from, creating it on first
    /// contact. Returns false if the gateway is being removed.
    fn touch_gateway(&self, origin: &Origin) -> bool {
        let key = origin.gateway();
        let port = origin.src.port();
        let known = self
            .store
            .gateways
            .lookup(&key, |g| (g.accepts_sessions(), g.port == port));
        match known {
            Some((false, _)) => {
                debug!(gateway = %key, "Datagram from gateway being removed dropped");
                false
            }
            Some((true, true)) => true,
            Some((true, false)) => {
                self.store.gateways.update(&key, |g| g.port = port);
                true
            }
            None => {
                if self.store.gateways.add(key, GreGateway::new(key, port)).is_ok() {
                    info!(gateway = %key, port, "Gateway discovered");
                }
                true
            }
        }
    }

    fn set_gateway_state(&self, key: &GatewayKey, state: GatewayState) {
        self.store.gateways.update(key, |g| {
            if g.state != state && g.state != GatewayState::Down {
                debug!(gateway = %key, from = %g.state, to = %state, "Gateway state change");
                g.state = state;
            }
        });
    }

    /// Client of `dp` if the processor currently accepts work.
    pub(crate) fn live_client(&self, dp: DpId) -> Option<Arc<ProcessorClient>> {
        self.store
            .processors
            .lookup(&dp, |p| p.is_live().then(|| Arc::clone(&p.client)))
            .flatten()
    }

    pub(crate) fn vrf_outbox(&self, vrf: VrfId) -> Option<Arc<GatewayOutbox>> {
        self.store.vrfs.lookup(&vrf, |v| Arc::clone(&v.outbox))
    }

    pub(crate) fn new_outbox(&self, vrf: VrfId) -> Arc<GatewayOutbox> {
        Arc::new(GatewayOutbox::new(
            vrf,
            Arc::clone(&self.signaling),
            self.config.max_signal_datagram,
        ))
    }

    pub(crate) fn new_client(&self, dp: DpId) -> Arc<ProcessorClient> {
        Arc::new(ProcessorClient::new(
            dp,
            self.config.processor_send_buffer,
            self.config.max_submessages,
        ))
    }

    pub(crate) fn routing(&self) -> &dyn RoutingService {
        self.routing.as_ref()
    }

    pub(crate) fn callbacks(&self) -> &dyn SessionOrchCallbacks {
        self.callbacks.as_ref()
    }

    /// Carries out follow-up work from a store mutation.
    pub(crate) fn apply(&self, actions: Vec<StoreAction>, batch: &mut Batch) {
        for action in actions {
            match action {
                StoreAction::InstallRoute {
                    key,
                    next_hop,
                    interface,
                } => {
                    debug!(route = %key, interface = %interface, "Installing route");
                    self.routing
                        .add_route(RoutingContext::Route(key), key.vrf, key.prefix, next_hop);
                }
                StoreAction::RemoveRoute { key } => {
                    debug!(route = %key, "Removing route");
                    self.routing
                        .delete_route(RoutingContext::Route(key), key.vrf, key.prefix);
                }
                StoreAction::DeleteNextHop { interface, vrf, ip } => {
                    self.routing
                        .delete_next_hop(RoutingContext::NextHop(interface), vrf, ip);
                }
                StoreAction::AddTunnel { dp, tunnel } => {
                    self.provision(dp, SubMessage::tunnel(SubType::AddTunnel, tunnel), batch);
                }
                StoreAction::DelTunnel { dp, tunnel } => {
                    self.provision(dp, SubMessage::tunnel(SubType::DelTunnel, tunnel), batch);
                }
            }
        }
    }

    fn provision(&self, dp: DpId, sub: SubMessage, batch: &mut Batch) {
        let Some(client) = self.live_client(dp) else {
            debug!(dp = %dp, sub_type = %sub.sub_type, "Processor not live, skipping");
            return;
        };
        match client.enqueue(MessageKind::Request, &sub) {
            Ok(()) => batch.touch_processor(&client),
            Err(e) => warn!(dp = %dp, sub_type = %sub.sub_type, error = %e, "Provisioning failed"),
        }
    }

    /// A processor connection came up.
    pub fn processor_connected(&self, dp: DpId, transport: Arc<dyn ProcessorTransport>) -> Result<()> {
        let client = self
            .store
            .processors
            .update(&dp, |p| {
                p.state = ProcessorState::Connected;
                Arc::clone(&p.client)
            })
            .ok_or(GatewayError::ProcessorNotFound(dp))?;
        client.attach(transport);
        info!(dp = %dp, "Processor connected");
        Ok(())
    }

    /// A connected processor is ready for provisioning.
    pub fn processor_established(&self, dp: DpId) -> Result<()> {
        let state = self
            .store
            .processors
            .update(&dp, |p| {
                if p.client.is_connected() {
                    p.state = ProcessorState::Up;
                }
                p.state
            })
            .ok_or(GatewayError::ProcessorNotFound(dp))?;
        if state != ProcessorState::Up {
            return Err(GatewayError::ProcessorUnavailable(dp));
        }
        info!(dp = %dp, "Processor established");
        Ok(())
    }

    /// Handles a provisioning message received from a processor.
    pub fn on_processor_message(&self, dp: DpId, bytes: &[u8]) {
        let msg = match ProvisionMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(dp = %dp, error = %e, "Malformed provisioning message");
                return;
            }
        };
        if msg.kind != MessageKind::Reply {
            warn!(dp = %dp, "Unexpected provisioning request from processor");
            return;
        }

        let mut batch = Batch::default();
        for sub in &msg.subs {
            match sub.body {
                SubBody::Session(body) => {
                    self.session_reply(dp, sub.sub_type, sub.is_success(), body.context, &mut batch)
                }
                SubBody::Tunnel(tunnel) => {
                    if !sub.is_success() {
                        warn!(dp = %dp, sub_type = %sub.sub_type, peer = %tunnel.peer_ip, vrf = %tunnel.vrf, error = sub.error, "Tunnel provisioning rejected");
                    }
                }
            }
        }
        batch.flush();
    }

    /// Handles a routing service reply.
    pub fn on_routing_reply(&self, reply: RoutingReply) {
        let mut batch = Batch::default();
        let actions = match (reply.ctx, reply.op) {
            (RoutingContext::NextHop(iface), RoutingOp::CreateNextHop) => {
                self.store.next_hop_created(&iface, reply.ok)
            }
            (RoutingContext::NextHop(iface), RoutingOp::DeleteNextHop) => {
                self.store.next_hop_deleted(&iface);
                Vec::new()
            }
            (RoutingContext::Route(route), RoutingOp::AddRoute) => {
                self.store.route_programmed(&route, true, reply.ok)
            }
            (RoutingContext::Route(route), RoutingOp::DeleteRoute) => {
                self.store.route_programmed(&route, false, reply.ok)
            }
            (ctx, op) => {
                warn!(ctx = %ctx, ?op, "Routing reply does not match its context");
                Vec::new()
            }
        };
        self.apply(actions, &mut batch);
        batch.flush();
        self.resume_restores();
    }

    pub(crate) fn restores(&self) -> &Mutex<BTreeMap<InterfaceKey, InterfaceSpec>> {
        &self.restores
    }

    /// A processor reports an IPIP gateway reachable or unreachable.
    pub fn set_ipip_reachable(&self, dp: DpId, vrf: VrfId, ip: Ipv4Addr, reachable: bool) -> Result<()> {
        let key = GatewayKey::new(vrf, ip);
        let mut g = self.store.write_all();
        if !g.processors.contains_key(&dp) {
            return Err(GatewayError::ProcessorNotFound(dp));
        }
        let ipip = g
            .ipips
            .get_mut(&key)
            .ok_or(GatewayError::IpipGatewayNotFound { vrf, ip })?;
        if reachable {
            ipip.reachable.insert(dp);
        } else {
            ipip.reachable.remove(&dp);
        }
        let count = ipip.reachability();
        if let Some(p) = g.processors.get_mut(&dp) {
            if reachable {
                p.ipip_reachable.insert(key);
            } else {
                p.ipip_reachable.remove(&key);
            }
        }
        debug!(dp = %dp, ipip = %key, reachable, count, "IPIP reachability");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
