//! Session store.
//!
//! One ordered table per entity type, each behind its own read/write lock.
//! Operations that span tables take [`SessionStore::write_all`], which
//! acquires every write lock in the fixed order
//! VRF, gateway, IPIP gateway, user, processor, interface, route, session.
//! Callers that also hold a session's mutex must take it before any table
//! lock.

mod entities;

pub use entities::*;

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gre_common::{OrderedMap, RefCounted};
use gre_types::FiveTuple;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, warn};

use crate::error::{GatewayError, Result, SessionIndex};
use crate::keyalloc;

/// An ordered, lock-protected entity table.
pub struct Table<K, V> {
    name: &'static str,
    map: RwLock<OrderedMap<K, V>>,
}

impl<K: Ord + Clone, V> Table<K, V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            map: RwLock::new(OrderedMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Adds an entry. Returns the value back if the key is taken.
    pub fn add(&self, key: K, value: V) -> std::result::Result<(), V> {
        self.map.write().insert_new(key, value).map_err(|(_, v)| v)
    }

    /// Runs `f` on the entry under the read lock.
    pub fn lookup<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.map.read().get(key).map(f)
    }

    /// Runs `f` on the entry under the write lock.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.map.write().get_mut(key).map(f)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn first(&self) -> Option<K> {
        self.map.read().first().map(|(k, _)| k.clone())
    }

    /// Key following `key` in table order.
    pub fn next(&self, key: &K) -> Option<K> {
        self.map.read().next(key).map(|(k, _)| k.clone())
    }

    /// Removes an entry. `None` means the key was not present.
    pub fn delete(&self, key: &K) -> Option<V> {
        self.map.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.map.read().keys().cloned().collect()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, OrderedMap<K, V>> {
        self.map.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, OrderedMap<K, V>> {
        self.map.write()
    }
}

impl<K, V> fmt::Debug for Table<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("name", &self.name).finish()
    }
}

/// Follow-up work produced by a store mutation, carried out by the caller
/// after every lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAction {
    InstallRoute {
        key: RouteKey,
        interface: InterfaceKey,
        next_hop: Ipv4Addr,
    },
    RemoveRoute {
        key: RouteKey,
    },
    DeleteNextHop {
        interface: InterfaceKey,
        vrf: VrfId,
        ip: Ipv4Addr,
    },
    AddTunnel {
        dp: DpId,
        tunnel: TunnelSpec,
    },
    DelTunnel {
        dp: DpId,
        tunnel: TunnelSpec,
    },
}

/// Every table write-locked in global order.
pub struct StoreGuard<'a> {
    pub vrfs: RwLockWriteGuard<'a, OrderedMap<VrfId, Vrf>>,
    pub gateways: RwLockWriteGuard<'a, OrderedMap<GatewayKey, GreGateway>>,
    pub ipips: RwLockWriteGuard<'a, OrderedMap<GatewayKey, IpipGateway>>,
    pub users: RwLockWriteGuard<'a, OrderedMap<String, UserPolicy>>,
    pub processors: RwLockWriteGuard<'a, OrderedMap<DpId, Processor>>,
    pub interfaces: RwLockWriteGuard<'a, OrderedMap<InterfaceKey, Interface>>,
    pub routes: RwLockWriteGuard<'a, OrderedMap<RouteKey, Route>>,
    pub sessions: RwLockWriteGuard<'a, OrderedMap<SessionId, SessionHandle>>,
}

/// The process-wide entity store.
#[derive(Debug)]
pub struct SessionStore {
    pub vrfs: Table<VrfId, Vrf>,
    pub gateways: Table<GatewayKey, GreGateway>,
    pub ipips: Table<GatewayKey, IpipGateway>,
    pub users: Table<String, UserPolicy>,
    pub processors: Table<DpId, Processor>,
    pub interfaces: Table<InterfaceKey, Interface>,
    pub routes: Table<RouteKey, Route>,
    pub sessions: Table<SessionId, SessionHandle>,
    next_session: AtomicU32,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            vrfs: Table::new("vrf"),
            gateways: Table::new("gateway"),
            ipips: Table::new("ipip-gateway"),
            users: Table::new("user"),
            processors: Table::new("processor"),
            interfaces: Table::new("interface"),
            routes: Table::new("route"),
            sessions: Table::new("session"),
            next_session: AtomicU32::new(1),
        }
    }

    /// Takes every write lock in global order.
    pub fn write_all(&self) -> StoreGuard<'_> {
        StoreGuard {
            vrfs: self.vrfs.write(),
            gateways: self.gateways.write(),
            ipips: self.ipips.write(),
            users: self.users.write(),
            processors: self.processors.write(),
            interfaces: self.interfaces.write(),
            routes: self.routes.write(),
            sessions: self.sessions.write(),
        }
    }

    /// Hands out an unused session id. Zero is never issued.
    pub fn next_session_id(&self) -> SessionId {
        loop {
            let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
            if id.0 != 0 && !self.sessions.contains(&id) {
                return id;
            }
        }
    }

    pub fn session(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.lookup(&id, Arc::clone)
    }

    /// Session registered under `tuple` at gateway `gw`.
    pub fn gateway_session(&self, gw: &GatewayKey, tuple: &FiveTuple) -> Option<SessionId> {
        self.gateways
            .lookup(gw, |g| g.sessions.get(tuple).copied())
            .flatten()
    }

    /// Session holding ingress key `key` in `vrf`.
    pub fn vrf_session(&self, vrf: VrfId, key: TunnelKey) -> Option<SessionId> {
        self.vrfs
            .lookup(&vrf, |v| v.sessions.get(&key).copied())
            .flatten()
    }

    /// Registers a fully resolved session in every index.
    ///
    /// Allocates the ingress key, then links the session into the VRF key
    /// index, the gateway, IPIP gateway and user tuple indexes. If any
    /// insert fails the earlier ones are undone and nothing is left behind.
    /// On success the session is counted along its reference chain and holds
    /// its client route and processor tunnels.
    pub fn register_session(
        &self,
        handle: &SessionHandle,
        session: &mut Session,
    ) -> Result<Vec<StoreAction>> {
        let mut g = self.write_all();
        g.validate_references(session)?;

        let vrf = g
            .vrfs
            .get_mut(&session.vrf)
            .ok_or(GatewayError::VrfNotFound(session.vrf))?;
        session.ingress.key = keyalloc::generate_key(vrf)?;

        if let Err(err) = g.link(session) {
            if let Some(vrf) = g.vrfs.get_mut(&session.vrf) {
                keyalloc::release(vrf, session.ingress.key);
            }
            return Err(err);
        }

        let mut actions = Vec::new();
        g.acquire_client_route(session, &mut actions);
        g.acquire_tunnels(session, &mut actions);
        g.count(session, true, false);
        if g.sessions.insert_new(session.id, Arc::clone(handle)).is_err() {
            error!(session = %session.id, "Session id reused");
        }
        Ok(actions)
    }

    /// Removes a session from every index and drops everything it holds.
    pub fn unregister_session(&self, session: &Session, was_active: bool) -> Vec<StoreAction> {
        let mut g = self.write_all();
        let mut actions = Vec::new();

        for index in [
            SessionIndex::VrfKey,
            SessionIndex::Gateway,
            SessionIndex::IpipGateway,
            SessionIndex::User,
        ] {
            if !g.unlink(session, index) && (index != SessionIndex::IpipGateway || session.ipip.is_some())
            {
                warn!(session = %session.id, index = %index, "Session missing from index");
            }
        }
        if let Some(vrf) = g.vrfs.get_mut(&session.vrf) {
            keyalloc::release(vrf, session.ingress.key);
        }

        g.count(session, false, was_active);
        g.release_client_route(session, &mut actions);
        g.release_tunnels(session, &mut actions);
        g.sessions.remove(&session.id);
        actions
    }

    /// Moves a session into or out of the active count.
    pub fn set_session_active(&self, session: &Session, active: bool) {
        let mut g = self.write_all();
        g.for_each_counter(session, |c| {
            if active {
                c.activate()
            } else {
                c.deactivate()
            }
        });
    }

    /// Session ids in the ingress key index of `vrf`.
    pub fn vrf_session_ids(&self, vrf: VrfId) -> Vec<SessionId> {
        self.vrfs
            .lookup(&vrf, |v| v.sessions.values().copied().collect())
            .unwrap_or_default()
    }

    /// Sessions whose egress leaves through `vrf`.
    pub fn egress_session_ids(&self, vrf: VrfId) -> Vec<SessionId> {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();
        handles
            .into_iter()
            .filter_map(|h| {
                let s = h.lock();
                (s.egress.vrf == vrf && s.vrf != vrf).then_some(s.id)
            })
            .collect()
    }

    pub fn gateway_session_ids(&self, key: &GatewayKey) -> Vec<SessionId> {
        self.gateways
            .lookup(key, |g| g.sessions.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn ipip_session_ids(&self, key: &GatewayKey) -> Vec<SessionId> {
        self.ipips
            .lookup(key, |g| g.sessions.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn user_session_ids(&self, name: &str) -> Vec<SessionId> {
        self.users
            .lookup(&name.to_string(), |u| u.sessions.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn interface_session_ids(&self, key: &InterfaceKey) -> Vec<SessionId> {
        self.interfaces
            .lookup(key, |i| i.sessions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Sessions using any interface of `dp`.
    pub fn processor_session_ids(&self, dp: DpId) -> Vec<SessionId> {
        let interfaces: Vec<InterfaceKey> = self
            .processors
            .lookup(&dp, |p| p.interfaces.keys().copied().collect())
            .unwrap_or_default();
        let ids: BTreeSet<SessionId> = interfaces
            .iter()
            .flat_map(|i| self.interface_session_ids(i))
            .collect();
        ids.into_iter().collect()
    }

    /// Applies a next-hop or route programming outcome for a route.
    pub fn route_programmed(&self, key: &RouteKey, added: bool, ok: bool) -> Vec<StoreAction> {
        let mut g = self.write_all();
        let mut actions = Vec::new();
        let Some(route) = g.routes.get_mut(key) else {
            debug!(route = %key, "Reply for unknown route ignored");
            return actions;
        };

        match (added, route.state) {
            (true, ProgrammingState::Pending) => {
                route.state = if ok {
                    ProgrammingState::Ready
                } else {
                    warn!(route = %key, "Route install failed");
                    ProgrammingState::Failed
                };
            }
            (true, ProgrammingState::Deleting) if !route.delete_sent => {
                if ok {
                    route.delete_sent = true;
                    actions.push(StoreAction::RemoveRoute { key: *key });
                } else {
                    g.drop_route(key);
                }
            }
            (false, ProgrammingState::Deleting) if route.delete_sent => {
                if route.revive {
                    route.revive = false;
                    route.delete_sent = false;
                    route.state = ProgrammingState::Pending;
                    actions.push(StoreAction::InstallRoute {
                        key: *key,
                        interface: route.interface,
                        next_hop: route.next_hop,
                    });
                } else {
                    if !ok {
                        warn!(route = %key, "Route delete failed, forgetting route");
                    }
                    g.drop_route(key);
                }
            }
            (added, state) => {
                debug!(route = %key, added, ?state, "Stale route reply ignored");
            }
        }
        actions
    }

    /// Applies the outcome of a next-hop creation for an interface.
    ///
    /// On success the interface's own host route is requested.
    pub fn next_hop_created(&self, key: &InterfaceKey, ok: bool) -> Vec<StoreAction> {
        let mut g = self.write_all();
        let mut actions = Vec::new();
        let Some(iface) = g.interfaces.get_mut(key) else {
            debug!(interface = %key, "Next-hop reply for unknown interface ignored");
            return actions;
        };
        if iface.next_hop != ProgrammingState::Pending {
            debug!(interface = %key, state = ?iface.next_hop, "Stale next-hop reply ignored");
            return actions;
        }

        if iface.removing {
            if ok {
                iface.next_hop = ProgrammingState::Deleting;
                actions.push(StoreAction::DeleteNextHop {
                    interface: *key,
                    vrf: iface.vrf,
                    ip: iface.ip,
                });
            } else {
                iface.next_hop = ProgrammingState::Failed;
                g.finalize_interface(key);
            }
            return actions;
        }

        if !ok {
            warn!(interface = %key, "Next-hop creation failed");
            iface.next_hop = ProgrammingState::Failed;
            return actions;
        }

        iface.next_hop = ProgrammingState::Ready;
        let route_key = RouteKey::host(iface.vrf, iface.ip);
        let next_hop = iface.ip;
        let mut refs = RefCounted::new();
        let _ = refs.acquire();
        let route = Route {
            key: route_key,
            kind: RouteKind::Interface,
            interface: *key,
            next_hop,
            state: ProgrammingState::Pending,
            revive: false,
            delete_sent: false,
            refs,
        };
        if g.routes.insert_new(route_key, route).is_err() {
            warn!(interface = %key, route = %route_key, "Interface route already present");
            return actions;
        }
        if let Some(iface) = g.interfaces.get_mut(key) {
            iface.route = Some(route_key);
            iface.routes.insert(route_key, ());
        }
        actions.push(StoreAction::InstallRoute {
            key: route_key,
            interface: *key,
            next_hop,
        });
        actions
    }

    /// Applies the outcome of a next-hop deletion.
    pub fn next_hop_deleted(&self, key: &InterfaceKey) {
        let mut g = self.write_all();
        match g.interfaces.get_mut(key) {
            Some(iface) if iface.next_hop == ProgrammingState::Deleting => {
                iface.next_hop = ProgrammingState::Failed;
                g.finalize_interface(key);
            }
            _ => debug!(interface = %key, "Stale next-hop delete reply ignored"),
        }
    }

    /// Marks an interface for removal and releases its own resources.
    ///
    /// The entry disappears once no route and no next hop is outstanding.
    /// Sessions must already be gone.
    pub fn begin_interface_removal(&self, key: &InterfaceKey) -> Result<Vec<StoreAction>> {
        let mut g = self.write_all();
        let mut actions = Vec::new();
        let iface = g
            .interfaces
            .get_mut(key)
            .ok_or(GatewayError::InterfaceNotFound(*key))?;
        iface.removing = true;
        if !iface.sessions.is_empty() {
            warn!(interface = %key, sessions = iface.sessions.len(), "Interface still has sessions");
        }
        let own_route = iface.route.take();
        let (vrf, ip) = (iface.vrf, iface.ip);
        match iface.next_hop {
            ProgrammingState::Ready => {
                iface.next_hop = ProgrammingState::Deleting;
                actions.push(StoreAction::DeleteNextHop {
                    interface: *key,
                    vrf,
                    ip,
                });
            }
            // The create reply finishes the job.
            ProgrammingState::Pending | ProgrammingState::Deleting => {}
            ProgrammingState::Failed => {}
        }
        if let Some(route_key) = own_route {
            g.release_route(&route_key, &mut actions);
        }
        g.finalize_interface(key);
        Ok(actions)
    }

    /// Drops every tunnel of a processor without provisioning.
    pub fn clear_tunnels(&self, dp: DpId) {
        self.processors.update(&dp, |p| p.tunnels.clear());
    }
}

impl StoreGuard<'_> {
    /// Checks that everything a new session refers to is alive.
    fn validate_references(&self, s: &Session) -> Result<()> {
        for vrf in s.vrfs() {
            match self.vrfs.get(&vrf) {
                Some(v) if v.is_usable() => {}
                _ => return Err(GatewayError::VrfNotFound(vrf)),
            }
        }
        match self.gateways.get(&s.gateway_key()) {
            Some(g) if g.accepts_sessions() => {}
            _ => {
                return Err(GatewayError::GatewayNotFound {
                    vrf: s.vrf,
                    ip: s.gateway,
                })
            }
        }
        if let Some(key) = s.ipip {
            match self.ipips.get(&key) {
                Some(i) if !i.deleting => {}
                _ => {
                    return Err(GatewayError::IpipGatewayNotFound {
                        vrf: key.vrf,
                        ip: key.ip,
                    })
                }
            }
        }
        match self.users.get(&s.user) {
            Some(u) if !u.deleting => {}
            _ => return Err(GatewayError::UserNotFound(s.user.clone())),
        }
        match self.processors.get(&s.processor) {
            Some(p) if p.is_live() => {}
            Some(_) => return Err(GatewayError::ProcessorUnavailable(s.processor)),
            None => return Err(GatewayError::ProcessorNotFound(s.processor)),
        }
        for key in [s.ingress_if, s.egress_if] {
            match self.interfaces.get(&key) {
                Some(i) if i.is_usable() => {}
                _ => return Err(GatewayError::InterfaceNotFound(key)),
            }
        }
        Ok(())
    }

    /// Inserts the session into its four indexes, all or nothing.
    fn link(&mut self, s: &Session) -> Result<()> {
        let mut linked = Vec::with_capacity(4);
        for index in [
            SessionIndex::VrfKey,
            SessionIndex::Gateway,
            SessionIndex::IpipGateway,
            SessionIndex::User,
        ] {
            let inserted = match index {
                SessionIndex::VrfKey => self
                    .vrfs
                    .get_mut(&s.vrf)
                    .map(|v| v.sessions.insert_new(s.ingress.key, s.id).is_ok()),
                SessionIndex::Gateway => self
                    .gateways
                    .get_mut(&s.gateway_key())
                    .map(|g| g.sessions.insert_new(s.tuple, s.id).is_ok()),
                SessionIndex::IpipGateway => match s.ipip {
                    Some(key) => self
                        .ipips
                        .get_mut(&key)
                        .map(|g| g.sessions.insert_new(s.tuple, s.id).is_ok()),
                    None => continue,
                },
                SessionIndex::User => self
                    .users
                    .get_mut(&s.user)
                    .map(|u| u.sessions.insert_new(s.tuple, s.id).is_ok()),
            };

            if inserted != Some(true) {
                for done in linked.into_iter().rev() {
                    self.unlink(s, done);
                }
                debug!(session = %s.id, index = %index, tuple = %s.tuple, "Session insert rolled back");
                return Err(match inserted {
                    Some(_) => GatewayError::DuplicateSession { index },
                    None => GatewayError::internal(format!("{index} owner vanished under lock")),
                });
            }
            linked.push(index);
        }
        Ok(())
    }

    /// Removes the session from one index if it is the registered owner.
    fn unlink(&mut self, s: &Session, index: SessionIndex) -> bool {
        fn remove_if<K: Ord>(map: &mut OrderedMap<K, SessionId>, key: &K, id: SessionId) -> bool {
            if map.get(key) == Some(&id) {
                map.remove(key);
                true
            } else {
                false
            }
        }

        match index {
            SessionIndex::VrfKey => self
                .vrfs
                .get_mut(&s.vrf)
                .is_some_and(|v| remove_if(&mut v.sessions, &s.ingress.key, s.id)),
            SessionIndex::Gateway => self
                .gateways
                .get_mut(&s.gateway_key())
                .is_some_and(|g| remove_if(&mut g.sessions, &s.tuple, s.id)),
            SessionIndex::IpipGateway => s.ipip.is_some_and(|key| {
                self.ipips
                    .get_mut(&key)
                    .is_some_and(|g| remove_if(&mut g.sessions, &s.tuple, s.id))
            }),
            SessionIndex::User => self
                .users
                .get_mut(&s.user)
                .is_some_and(|u| remove_if(&mut u.sessions, &s.tuple, s.id)),
        }
    }

    fn for_each_counter(&mut self, s: &Session, mut f: impl FnMut(&mut SessionCounters)) {
        if let Some(v) = self.vrfs.get_mut(&s.vrf) {
            f(&mut v.keyed);
        }
        for vrf in s.vrfs() {
            if let Some(v) = self.vrfs.get_mut(&vrf) {
                f(&mut v.counters);
            }
        }
        if let Some(g) = self.gateways.get_mut(&s.gateway_key()) {
            f(&mut g.counters);
        }
        if let Some(g) = s.ipip.and_then(|key| self.ipips.get_mut(&key)) {
            f(&mut g.counters);
        }
        if let Some(u) = self.users.get_mut(&s.user) {
            f(&mut u.counters);
        }
        if let Some(p) = self.processors.get_mut(&s.processor) {
            f(&mut p.counters);
        }
        for key in s.interfaces() {
            if let Some(i) = self.interfaces.get_mut(&key) {
                f(&mut i.counters);
            }
        }
    }

    /// Counts (or uncounts) the session along its chain and maintains the
    /// interfaces' dependency indexes.
    fn count(&mut self, s: &Session, add: bool, active: bool) {
        self.for_each_counter(s, |c| {
            if add {
                c.add(active)
            } else {
                c.remove(active)
            }
        });
        for key in s.interfaces() {
            if let Some(i) = self.interfaces.get_mut(&key) {
                if add {
                    i.sessions.insert(s.id, ());
                } else {
                    i.sessions.remove(&s.id);
                }
            }
        }
    }

    /// Takes a reference on the client's reverse route, creating it if
    /// needed.
    fn acquire_client_route(&mut self, s: &mut Session, actions: &mut Vec<StoreAction>) {
        let same_path = s.egress.kind == EgressKind::Native
            && s.egress.vrf == s.vrf
            && s.tuple.src_ip == s.gateway;
        if same_path {
            return;
        }

        let key = RouteKey::host(s.egress.vrf, s.tuple.src_ip);
        if let Some(route) = self.routes.get_mut(&key) {
            let _ = route.refs.acquire();
            match route.state {
                ProgrammingState::Deleting if route.delete_sent => route.revive = true,
                ProgrammingState::Deleting => route.state = ProgrammingState::Pending,
                ProgrammingState::Failed => {
                    route.state = ProgrammingState::Pending;
                    actions.push(StoreAction::InstallRoute {
                        key,
                        interface: route.interface,
                        next_hop: route.next_hop,
                    });
                }
                ProgrammingState::Pending | ProgrammingState::Ready => {}
            }
            if route.interface != s.egress_if && route.interface != s.ingress_if {
                s.route_if = Some(route.interface);
            }
            s.client_route = Some(key);
            return;
        }

        let Some(next_hop) = self.interfaces.get(&s.egress_if).map(|i| i.ip) else {
            return;
        };
        let mut refs = RefCounted::new();
        let _ = refs.acquire();
        let route = Route {
            key,
            kind: RouteKind::Client,
            interface: s.egress_if,
            next_hop,
            state: ProgrammingState::Pending,
            revive: false,
            delete_sent: false,
            refs,
        };
        if self.routes.insert_new(key, route).is_ok() {
            if let Some(i) = self.interfaces.get_mut(&s.egress_if) {
                i.routes.insert(key, ());
            }
            s.client_route = Some(key);
            actions.push(StoreAction::InstallRoute {
                key,
                interface: s.egress_if,
                next_hop,
            });
        }
    }

    fn release_client_route(&mut self, s: &Session, actions: &mut Vec<StoreAction>) {
        if let Some(key) = s.client_route {
            self.release_route(&key, actions);
        }
    }

    /// Drops one reference; the last one starts the route's removal.
    fn release_route(&mut self, key: &RouteKey, actions: &mut Vec<StoreAction>) {
        let Some(route) = self.routes.get_mut(key) else {
            warn!(route = %key, "Released route not found");
            return;
        };
        match route.refs.release() {
            Ok(release) if release.is_last() => {}
            Ok(_) => return,
            Err(e) => {
                error!(route = %key, error = %e, "Route reference count corrupt");
                return;
            }
        }
        route.revive = false;
        let state = route.state;
        match state {
            ProgrammingState::Ready => {
                route.state = ProgrammingState::Deleting;
                route.delete_sent = true;
                actions.push(StoreAction::RemoveRoute { key: *key });
            }
            // The install reply triggers the delete.
            ProgrammingState::Pending => {
                route.state = ProgrammingState::Deleting;
                route.delete_sent = false;
            }
            ProgrammingState::Failed => self.drop_route(key),
            ProgrammingState::Deleting => {}
        }
    }

    /// Forgets a route and finishes its interface's removal if that was the
    /// last thing holding it.
    fn drop_route(&mut self, key: &RouteKey) {
        if let Some(route) = self.routes.remove(key) {
            if let Some(iface) = self.interfaces.get_mut(&route.interface) {
                iface.routes.remove(key);
            }
            self.finalize_interface(&route.interface);
        }
    }

    fn finalize_interface(&mut self, key: &InterfaceKey) {
        let done = self.interfaces.get(key).is_some_and(|i| {
            i.removing
                && i.routes.is_empty()
                && matches!(i.next_hop, ProgrammingState::Failed)
        });
        if done {
            self.interfaces.remove(key);
            if let Some(p) = self.processors.get_mut(&key.dp) {
                p.interfaces.remove(key);
            }
            debug!(interface = %key, "Interface removed");
        }
    }

    fn acquire_tunnels(&mut self, s: &Session, actions: &mut Vec<StoreAction>) {
        let Some(p) = self.processors.get_mut(&s.processor) else {
            return;
        };
        for tunnel in std::iter::once(s.gre_tunnel()).chain(s.ipip_tunnel()) {
            if !p.tunnels.contains_key(&tunnel) {
                p.tunnels.insert(tunnel, RefCounted::new());
            }
            if let Ok(true) = p.tunnels.acquire(&tunnel) {
                actions.push(StoreAction::AddTunnel { dp: p.id, tunnel });
            }
        }
    }

    fn release_tunnels(&mut self, s: &Session, actions: &mut Vec<StoreAction>) {
        let Some(p) = self.processors.get_mut(&s.processor) else {
            return;
        };
        for tunnel in std::iter::once(s.gre_tunnel()).chain(s.ipip_tunnel()) {
            match p.tunnels.release(&tunnel) {
                Ok(r) if r.is_last() => {
                    p.tunnels.remove(&tunnel);
                    actions.push(StoreAction::DelTunnel { dp: p.id, tunnel });
                }
                Ok(_) => {}
                // Tunnels are dropped wholesale when a processor goes away.
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests;
