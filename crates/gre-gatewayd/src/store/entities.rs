//! Entities held by the session store.
//!
//! Entities refer to each other by key, never by pointer. The store is the
//! only owner; a session's references to its VRF, gateway, policy,
//! processor, interfaces and route are plain keys resolved through the
//! store's tables.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use gre_common::{HasRefCount, OrderedMap, RefCounted};
use gre_types::{FiveTuple, Ipv4Prefix};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::dpclient::ProcessorClient;
use crate::outbox::GatewayOutbox;

/// Ingress tunnel key, unique per VRF.
pub type TunnelKey = u32;

/// Routing instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VrfId(pub u32);

impl fmt::Display for VrfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Forwarding processor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DpId(pub u32);

impl fmt::Display for DpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dp{}", self.0)
    }
}

/// Session identifier. Also used as the provisioning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A peer (GRE or IPIP gateway) inside a VRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayKey {
    pub vrf: VrfId,
    pub ip: Ipv4Addr,
}

impl GatewayKey {
    pub const fn new(vrf: VrfId, ip: Ipv4Addr) -> Self {
        Self { vrf, ip }
    }
}

impl fmt::Display for GatewayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@vrf{}", self.ip, self.vrf)
    }
}

/// An interface of a forwarding processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceKey {
    pub dp: DpId,
    pub ifindex: u32,
}

impl InterfaceKey {
    pub const fn new(dp: DpId, ifindex: u32) -> Self {
        Self { dp, ifindex }
    }
}

impl fmt::Display for InterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/if{}", self.dp, self.ifindex)
    }
}

/// A route, keyed by VRF and destination prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub vrf: VrfId,
    pub prefix: Ipv4Prefix,
}

impl RouteKey {
    pub const fn host(vrf: VrfId, ip: Ipv4Addr) -> Self {
        Self {
            vrf,
            prefix: Ipv4Prefix::host(ip),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@vrf{}", self.prefix, self.vrf)
    }
}

/// Session and active-session counts kept on every entity a session
/// references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    /// Registered sessions.
    pub sessions: u64,
    /// Sessions in state UP.
    pub active: u64,
}

impl SessionCounters {
    pub fn add(&mut self, active: bool) {
        self.sessions += 1;
        if active {
            self.active += 1;
        }
    }

    pub fn remove(&mut self, active: bool) {
        self.sessions = self.sessions.saturating_sub(1);
        if active {
            self.active = self.active.saturating_sub(1);
        }
    }

    pub fn activate(&mut self) {
        self.active += 1;
    }

    pub fn deactivate(&mut self) {
        self.active = self.active.saturating_sub(1);
    }
}

/// Inclusive tunnel key range of a VRF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub start: TunnelKey,
    pub end: TunnelKey,
}

impl KeyRange {
    pub const fn new(start: TunnelKey, end: TunnelKey) -> Self {
        Self { start, end }
    }

    pub const fn contains(&self, key: TunnelKey) -> bool {
        key >= self.start && key <= self.end
    }

    pub const fn size(&self) -> u64 {
        (self.end as u64) - (self.start as u64) + 1
    }
}

/// A routing instance with its signaling socket and tunnel key namespace.
#[derive(Debug)]
pub struct Vrf {
    pub id: VrfId,
    pub name: String,
    /// Address the signaling socket listens on, if any.
    pub listen: Option<SocketAddrV4>,
    pub keys: KeyRange,
    /// Next candidate key.
    pub cursor: TunnelKey,
    /// Limit on active sessions keyed in this VRF.
    pub max_sessions: u64,
    /// Every session using this VRF for ingress or egress.
    pub counters: SessionCounters,
    /// Sessions holding a key from this VRF's range.
    pub keyed: SessionCounters,
    /// Ingress key index.
    pub sessions: OrderedMap<TunnelKey, SessionId>,
    /// Receive thread currently reading this VRF's socket.
    pub owner: Option<usize>,
    pub outbox: Arc<GatewayOutbox>,
    pub deleting: bool,
}

impl Vrf {
    pub fn is_usable(&self) -> bool {
        !self.deleting
    }
}

/// GRE gateway liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Init,
    Up,
    Down,
    Fail,
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GatewayState::Init => "init",
            GatewayState::Up => "up",
            GatewayState::Down => "down",
            GatewayState::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// A remote GRE peer signaling sessions to a VRF.
#[derive(Debug)]
pub struct GreGateway {
    pub key: GatewayKey,
    pub state: GatewayState,
    /// Source port of the last datagram received from the gateway.
    pub port: u16,
    pub counters: SessionCounters,
    pub sessions: OrderedMap<FiveTuple, SessionId>,
}

impl GreGateway {
    pub fn new(key: GatewayKey, port: u16) -> Self {
        Self {
            key,
            state: GatewayState::Init,
            port,
            counters: SessionCounters::default(),
            sessions: OrderedMap::new(),
        }
    }

    pub fn address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.key.ip, self.port)
    }

    pub fn accepts_sessions(&self) -> bool {
        !matches!(self.state, GatewayState::Down)
    }
}

/// An IP-in-IP egress peer.
#[derive(Debug)]
pub struct IpipGateway {
    pub key: GatewayKey,
    /// Processors currently reporting the peer reachable.
    pub reachable: BTreeSet<DpId>,
    pub counters: SessionCounters,
    pub sessions: OrderedMap<FiveTuple, SessionId>,
    pub deleting: bool,
}

impl IpipGateway {
    pub fn new(key: GatewayKey) -> Self {
        Self {
            key,
            reachable: BTreeSet::new(),
            counters: SessionCounters::default(),
            sessions: OrderedMap::new(),
            deleting: false,
        }
    }

    pub fn reachability(&self) -> usize {
        self.reachable.len()
    }
}

/// Subnet rule selecting how a client's traffic leaves the engine.
#[derive(Debug)]
pub struct UserPolicy {
    pub name: String,
    pub prefix: Ipv4Prefix,
    /// Restricts the policy to sessions signaled on this VRF.
    pub ingress_vrf: Option<VrfId>,
    pub egress_vrf: VrfId,
    /// IPIP gateway in the egress VRF, or native forwarding when absent.
    pub ipip: Option<Ipv4Addr>,
    pub counters: SessionCounters,
    pub sessions: OrderedMap<FiveTuple, SessionId>,
    pub deleting: bool,
}

impl UserPolicy {
    pub fn matches(&self, vrf: VrfId, client: Ipv4Addr) -> bool {
        !self.deleting
            && self.prefix.contains(client)
            && self.ingress_vrf.map_or(true, |v| v == vrf)
    }

    pub fn ipip_key(&self) -> Option<GatewayKey> {
        self.ipip.map(|ip| GatewayKey::new(self.egress_vrf, ip))
    }
}

/// Forwarding processor liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    /// Configured, never connected.
    Init,
    /// Transport connected, not yet established.
    Connected,
    /// Accepting provisioning.
    Up,
    /// Connection lost.
    Down,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessorState::Init => "init",
            ProcessorState::Connected => "connected",
            ProcessorState::Up => "up",
            ProcessorState::Down => "down",
        };
        f.write_str(s)
    }
}

/// Tunnel kinds a processor is asked to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TunnelKind {
    Gre,
    Ipip,
}

/// A tunnel endpoint pair on a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelSpec {
    pub kind: TunnelKind,
    pub vrf: VrfId,
    pub local_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
}

/// A forwarding processor record.
#[derive(Debug)]
pub struct Processor {
    pub id: DpId,
    pub name: String,
    pub state: ProcessorState,
    pub client: Arc<ProcessorClient>,
    pub interfaces: OrderedMap<InterfaceKey, ()>,
    pub tunnels: OrderedMap<TunnelSpec, RefCounted>,
    /// IPIP gateways this processor reports reachable.
    pub ipip_reachable: BTreeSet<GatewayKey>,
    pub counters: SessionCounters,
}

impl Processor {
    pub fn is_live(&self) -> bool {
        self.state == ProcessorState::Up && self.client.is_connected()
    }
}

/// Progress of an asynchronous next-hop or route request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgrammingState {
    Pending,
    Ready,
    Failed,
    Deleting,
}

/// An interface of a forwarding processor.
#[derive(Debug)]
pub struct Interface {
    pub key: InterfaceKey,
    pub vrf: VrfId,
    pub ip: Ipv4Addr,
    pub admin_up: bool,
    /// Only sessions of this policy may use the interface.
    pub policy: Option<String>,
    pub next_hop: ProgrammingState,
    /// The interface's own host route.
    pub route: Option<RouteKey>,
    /// Routes using this interface as next hop.
    pub routes: OrderedMap<RouteKey, ()>,
    /// Sessions depending on this interface.
    pub sessions: OrderedMap<SessionId, ()>,
    pub counters: SessionCounters,
    pub removing: bool,
}

impl Interface {
    pub fn is_usable(&self) -> bool {
        self.admin_up && !self.removing && self.next_hop == ProgrammingState::Ready
    }

    pub fn serves(&self, vrf: VrfId, policy: &str) -> bool {
        self.vrf == vrf
            && self.is_usable()
            && self.policy.as_deref().map_or(true, |p| p == policy)
    }
}

/// Whether a route is an interface's own address or steers a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Interface,
    Client,
}

/// A route programmed through the routing service.
#[derive(Debug)]
pub struct Route {
    pub key: RouteKey,
    pub kind: RouteKind,
    pub interface: InterfaceKey,
    pub next_hop: Ipv4Addr,
    pub state: ProgrammingState,
    /// Re-install once the in-flight delete completes.
    pub revive: bool,
    /// The delete request has been issued.
    pub delete_sent: bool,
    pub refs: RefCounted,
}

impl HasRefCount for Route {
    fn refs(&self) -> &RefCounted {
        &self.refs
    }

    fn refs_mut(&mut self) -> &mut RefCounted {
        &mut self.refs
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Registered, waiting for the processor to confirm the add.
    Init,
    Up,
    /// Teardown requested, waiting for the processor to confirm the delete.
    Down,
    /// Admission or provisioning failed.
    Fail,
    /// Removed from every index; the handle is stale.
    Cleared,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::Up => "up",
            SessionState::Down => "down",
            SessionState::Fail => "fail",
            SessionState::Cleared => "cleared",
        };
        f.write_str(s)
    }
}

/// Ingress (gateway-facing) half of a session's tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressTunnel {
    pub key: TunnelKey,
    /// Ingress interface address.
    pub local_ip: Ipv4Addr,
    /// Gateway tunnel endpoint.
    pub peer_ip: Ipv4Addr,
    /// Key chosen by the gateway.
    pub peer_key: u32,
}

/// Egress encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressKind {
    Ipip,
    Native,
}

/// Egress half of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgressTunnel {
    pub kind: EgressKind,
    pub vrf: VrfId,
    pub local_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
}

/// Reply owed to a gateway once the processor confirms a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingReply {
    /// SESSION_END_REQ is answered with DONE.
    Done(u32),
    /// ERR_REQ is answered with ERR carrying OK.
    ErrAck(u32),
}

/// A GRE tunnel session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub tuple: FiveTuple,
    pub vrf: VrfId,
    pub gateway: Ipv4Addr,
    /// Where signaling replies go.
    pub reply_to: SocketAddrV4,
    pub user: String,
    pub ipip: Option<GatewayKey>,
    pub processor: DpId,
    pub ingress_if: InterfaceKey,
    pub egress_if: InterfaceKey,
    pub ingress: IngressTunnel,
    pub egress: EgressTunnel,
    pub client_route: Option<RouteKey>,
    /// Interface owning the client route, if distinct from the session's own.
    pub route_if: Option<InterfaceKey>,
    pub init_msg_id: u32,
    pub last_msg_id: Option<u32>,
    pub pending_reply: Option<PendingReply>,
}

impl Session {
    pub fn gateway_key(&self) -> GatewayKey {
        GatewayKey::new(self.vrf, self.gateway)
    }

    /// VRFs whose counters track this session.
    pub fn vrfs(&self) -> BTreeSet<VrfId> {
        [self.vrf, self.egress.vrf].into_iter().collect()
    }

    /// Interfaces whose counters and session index track this session.
    pub fn interfaces(&self) -> BTreeSet<InterfaceKey> {
        [Some(self.ingress_if), Some(self.egress_if), self.route_if]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn gre_tunnel(&self) -> TunnelSpec {
        TunnelSpec {
            kind: TunnelKind::Gre,
            vrf: self.vrf,
            local_ip: self.ingress.local_ip,
            peer_ip: self.ingress.peer_ip,
        }
    }

    pub fn ipip_tunnel(&self) -> Option<TunnelSpec> {
        match self.egress.kind {
            EgressKind::Ipip => Some(TunnelSpec {
                kind: TunnelKind::Ipip,
                vrf: self.egress.vrf,
                local_ip: self.egress.local_ip,
                peer_ip: self.egress.peer_ip,
            }),
            EgressKind::Native => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Up
    }
}

/// Shared handle to a session. The mutex serializes signaling and
/// processor replies for the session.
pub type SessionHandle = Arc<Mutex<Session>>;
