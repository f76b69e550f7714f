//! Point-in-time snapshots of engine state.
//!
//! Plain serializable values; formatting is left to whoever consumes them.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;

use gre_types::{FiveTuple, Ipv4Prefix};
use serde::Serialize;

use crate::dpclient::ClientStats;
use crate::proto::signaling::MessageType;
use crate::session::SessionOrch;
use crate::store::{
    DpId, GatewayState, GreGateway, Interface, IpipGateway, Processor, ProcessorState,
    ProgrammingState, Route, RouteKind, Session, SessionId, SessionState, UserPolicy, Vrf, VrfId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VrfStats {
    pub id: VrfId,
    pub name: String,
    pub listen: Option<SocketAddrV4>,
    pub key_start: u32,
    pub key_end: u32,
    pub cursor: u32,
    pub max_sessions: u64,
    pub sessions: u64,
    pub active: u64,
    /// Active sessions counted against `max_sessions`.
    pub keyed_active: u64,
    pub receive_thread: Option<usize>,
    pub datagrams_sent: u64,
    pub send_errors: u64,
}

impl From<&Vrf> for VrfStats {
    fn from(v: &Vrf) -> Self {
        Self {
            id: v.id,
            name: v.name.clone(),
            listen: v.listen,
            key_start: v.keys.start,
            key_end: v.keys.end,
            cursor: v.cursor,
            max_sessions: v.max_sessions,
            sessions: v.counters.sessions,
            active: v.counters.active,
            keyed_active: v.keyed.active,
            receive_thread: v.owner,
            datagrams_sent: v.outbox.sent(),
            send_errors: v.outbox.errors(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub vrf: VrfId,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub state: GatewayState,
    pub sessions: u64,
    pub active: u64,
}

impl From<&GreGateway> for GatewayStats {
    fn from(g: &GreGateway) -> Self {
        Self {
            vrf: g.key.vrf,
            ip: g.key.ip,
            port: g.port,
            state: g.state,
            sessions: g.counters.sessions,
            active: g.counters.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpipStats {
    pub vrf: VrfId,
    pub ip: Ipv4Addr,
    pub reachability: usize,
    pub sessions: u64,
    pub active: u64,
}

impl From<&IpipGateway> for IpipStats {
    fn from(g: &IpipGateway) -> Self {
        Self {
            vrf: g.key.vrf,
            ip: g.key.ip,
            reachability: g.reachability(),
            sessions: g.counters.sessions,
            active: g.counters.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub name: String,
    pub prefix: Ipv4Prefix,
    pub ingress_vrf: Option<VrfId>,
    pub egress_vrf: VrfId,
    pub ipip: Option<Ipv4Addr>,
    pub sessions: u64,
    pub active: u64,
}

impl From<&UserPolicy> for UserStats {
    fn from(u: &UserPolicy) -> Self {
        Self {
            name: u.name.clone(),
            prefix: u.prefix,
            ingress_vrf: u.ingress_vrf,
            egress_vrf: u.egress_vrf,
            ipip: u.ipip,
            sessions: u.counters.sessions,
            active: u.counters.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub id: DpId,
    pub name: String,
    pub state: ProcessorState,
    pub connected: bool,
    pub interfaces: usize,
    pub tunnels: usize,
    pub sessions: u64,
    pub active: u64,
    pub client: ClientStats,
}

impl From<&Processor> for ProcessorStats {
    fn from(p: &Processor) -> Self {
        Self {
            id: p.id,
            name: p.name.clone(),
            state: p.state,
            connected: p.client.is_connected(),
            interfaces: p.interfaces.len(),
            tunnels: p.tunnels.len(),
            sessions: p.counters.sessions,
            active: p.counters.active,
            client: p.client.stats(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceStats {
    pub dp: DpId,
    pub ifindex: u32,
    pub vrf: VrfId,
    pub ip: Ipv4Addr,
    pub admin_up: bool,
    pub policy: Option<String>,
    pub next_hop: ProgrammingState,
    pub routes: usize,
    pub sessions: u64,
    pub active: u64,
    pub removing: bool,
}

impl From<&Interface> for InterfaceStats {
    fn from(i: &Interface) -> Self {
        Self {
            dp: i.key.dp,
            ifindex: i.key.ifindex,
            vrf: i.vrf,
            ip: i.ip,
            admin_up: i.admin_up,
            policy: i.policy.clone(),
            next_hop: i.next_hop,
            routes: i.routes.len(),
            sessions: i.counters.sessions,
            active: i.counters.active,
            removing: i.removing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteStats {
    pub vrf: VrfId,
    pub prefix: Ipv4Prefix,
    pub kind: RouteKind,
    pub state: ProgrammingState,
    pub dp: DpId,
    pub ifindex: u32,
    pub next_hop: Ipv4Addr,
    pub refs: u32,
}

impl From<&Route> for RouteStats {
    fn from(r: &Route) -> Self {
        Self {
            vrf: r.key.vrf,
            prefix: r.key.prefix,
            kind: r.kind,
            state: r.state,
            dp: r.interface.dp,
            ifindex: r.interface.ifindex,
            next_hop: r.next_hop,
            refs: r.refs.count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: u32,
    pub state: SessionState,
    pub tuple: FiveTuple,
    pub vrf: VrfId,
    pub gateway: Ipv4Addr,
    pub user: String,
    pub processor: DpId,
    pub key: u32,
    pub peer_key: u32,
    pub egress_vrf: VrfId,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.0,
            state: s.state,
            tuple: s.tuple,
            vrf: s.vrf,
            gateway: s.gateway,
            user: s.user.clone(),
            processor: s.processor,
            key: s.ingress.key,
            peer_key: s.ingress.peer_key,
            egress_vrf: s.egress.vrf,
        }
    }
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub datagrams_received: u64,
    pub datagrams_dropped: u64,
    pub malformed: u64,
    /// Messages received, by type name.
    pub messages: BTreeMap<String, u64>,
    pub sessions_created: u64,
    pub sessions_rejected: u64,
    pub sessions_cleared: u64,
    pub provision_adds: u64,
    pub provision_deletes: u64,
    pub processor_failures: u64,
    pub buffers_total: usize,
    pub buffers_in_use: usize,
    /// Buffers waiting in worker queues.
    pub queued: usize,
}

/// Everything the engine knows, at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub counters: EngineCounters,
    pub vrfs: Vec<VrfStats>,
    pub gateways: Vec<GatewayStats>,
    pub ipip_gateways: Vec<IpipStats>,
    pub users: Vec<UserStats>,
    pub processors: Vec<ProcessorStats>,
    pub interfaces: Vec<InterfaceStats>,
    pub routes: Vec<RouteStats>,
    pub sessions: usize,
}

impl SessionOrch {
    /// Counters maintained by the state machine.
    pub fn counters(&self) -> EngineCounters {
        let st = self.stats();
        let load = |c: &std::sync::atomic::AtomicU64| c.load(Ordering::Relaxed);
        let messages = MessageType::ALL
            .iter()
            .filter_map(|t| {
                st.messages
                    .get(*t as usize)
                    .map(|c| (t.as_str().to_string(), load(c)))
            })
            .collect();
        EngineCounters {
            datagrams_received: load(&st.datagrams),
            datagrams_dropped: load(&st.datagrams_dropped),
            malformed: load(&st.malformed),
            messages,
            sessions_created: load(&st.sessions_created),
            sessions_rejected: load(&st.sessions_rejected),
            sessions_cleared: load(&st.sessions_cleared),
            provision_adds: load(&st.provision_adds),
            provision_deletes: load(&st.provision_deletes),
            processor_failures: load(&st.processor_failures),
            ..EngineCounters::default()
        }
    }

    /// Snapshot of every table.
    pub fn snapshot(&self) -> EngineStats {
        let store = self.store();
        EngineStats {
            counters: self.counters(),
            vrfs: store.vrfs.read().values().map(VrfStats::from).collect(),
            gateways: store.gateways.read().values().map(GatewayStats::from).collect(),
            ipip_gateways: store.ipips.read().values().map(IpipStats::from).collect(),
            users: store.users.read().values().map(UserStats::from).collect(),
            processors: store
                .processors
                .read()
                .values()
                .map(ProcessorStats::from)
                .collect(),
            interfaces: store
                .interfaces
                .read()
                .values()
                .map(InterfaceStats::from)
                .collect(),
            routes: store.routes.read().values().map(RouteStats::from).collect(),
            sessions: store.sessions.len(),
        }
    }

    pub fn lookup_session(&self, id: SessionId) -> Option<SessionInfo> {
        self.store().session(id).map(|h| SessionInfo::from(&*h.lock()))
    }
}
