//! Management entry points.
//!
//! `add_*`, `delete_*` and `lookup_*` per entity type, plus the events the
//! processor connection manager reports. Called from a single management
//! thread; deletions cascade to every session that depends on the removed
//! entity before the entity itself goes away.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use gre_common::OrderedMap;
use gre_types::Ipv4Prefix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::proto::signaling::ErrorCode;
use crate::routing::RoutingContext;
use crate::session::{Batch, Notify, SessionOrch};
use crate::stats::{
    GatewayStats, InterfaceStats, IpipStats, ProcessorStats, RouteStats, UserStats, VrfStats,
};
use crate::store::{
    DpId, GatewayKey, GatewayState, GreGateway, Interface, InterfaceKey, IpipGateway, KeyRange,
    Processor, ProcessorState, ProgrammingState, RouteKey, SessionCounters, UserPolicy, Vrf, VrfId,
};

fn default_key_start() -> u32 {
    1
}

fn default_key_end() -> u32 {
    0x00ff_ffff
}

fn default_true() -> bool {
    true
}

/// VRF record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VrfSpec {
    pub id: VrfId,
    #[serde(default)]
    pub name: String,
    /// Signaling address; VRFs without one only carry egress traffic.
    #[serde(default)]
    pub listen: Option<SocketAddrV4>,
    #[serde(default = "default_key_start")]
    pub key_start: u32,
    #[serde(default = "default_key_end")]
    pub key_end: u32,
    /// Defaults to the size of the key range.
    #[serde(default)]
    pub max_sessions: Option<u64>,
}

/// IPIP gateway record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpipSpec {
    pub vrf: VrfId,
    pub ip: Ipv4Addr,
}

/// User policy record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSpec {
    pub name: String,
    pub prefix: Ipv4Prefix,
    #[serde(default)]
    pub ingress_vrf: Option<VrfId>,
    pub egress_vrf: VrfId,
    #[serde(default)]
    pub ipip: Option<Ipv4Addr>,
}

/// Forwarding processor record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorSpec {
    pub id: DpId,
    #[serde(default)]
    pub name: String,
    /// Where the processor listens for provisioning connections.
    #[serde(default)]
    pub address: Option<SocketAddr>,
}

/// Processor interface record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceSpec {
    pub dp: DpId,
    pub ifindex: u32,
    pub vrf: VrfId,
    pub ip: Ipv4Addr,
    #[serde(default = "default_true")]
    pub admin_up: bool,
    #[serde(default)]
    pub policy: Option<String>,
}

impl InterfaceSpec {
    pub fn key(&self) -> InterfaceKey {
        InterfaceKey::new(self.dp, self.ifindex)
    }
}

impl SessionOrch {
    pub fn add_vrf(&self, spec: &VrfSpec) -> Result<()> {
        if spec.key_start > spec.key_end {
            return Err(GatewayError::config(format!(
                "VRF {}: key range {}..={} is empty",
                spec.id, spec.key_start, spec.key_end
            )));
        }
        let keys = KeyRange::new(spec.key_start, spec.key_end);
        let max_sessions = spec.max_sessions.unwrap_or_else(|| keys.size());
        let vrf = Vrf {
            id: spec.id,
            name: spec.name.clone(),
            listen: spec.listen,
            keys,
            cursor: keys.start,
            max_sessions,
            counters: SessionCounters::default(),
            keyed: SessionCounters::default(),
            sessions: OrderedMap::new(),
            owner: None,
            outbox: self.new_outbox(spec.id),
            deleting: false,
        };
        self.store()
            .vrfs
            .add(spec.id, vrf)
            .map_err(|_| GatewayError::VrfExists(spec.id))?;

        if let Some(listen) = spec.listen {
            if let Err(e) = self.callbacks().on_vrf_added(spec.id, listen) {
                self.store().vrfs.delete(&spec.id);
                return Err(e);
            }
        }
        info!(vrf = %spec.id, name = %spec.name, listen = ?spec.listen, keys = keys.size(), "VRF added");
        Ok(())
    }

    /// Removes a VRF with everything inside it.
    pub fn delete_vrf(&self, id: VrfId) -> Result<()> {
        self.store()
            .vrfs
            .update(&id, |v| v.deleting = true)
            .ok_or(GatewayError::VrfNotFound(id))?;
        self.callbacks().on_vrf_removed(id);

        let store = self.store();
        let mut batch = Batch::default();
        self.drain_sessions(
            "vrf",
            || store.vrf_session_ids(id),
            Notify::Silent,
            &mut batch,
        );
        self.drain_sessions(
            "egress vrf",
            || store.egress_session_ids(id),
            Notify::Peer(ErrorCode::NoPolicy),
            &mut batch,
        );

        for key in store.gateways.keys().into_iter().filter(|k| k.vrf == id) {
            store.gateways.delete(&key);
        }
        for key in store.ipips.keys().into_iter().filter(|k| k.vrf == id) {
            self.forget_ipip(&key);
        }
        let interfaces: Vec<InterfaceKey> = store
            .interfaces
            .read()
            .values()
            .filter(|i| i.vrf == id && !i.removing)
            .map(|i| i.key)
            .collect();
        for key in interfaces {
            match store.begin_interface_removal(&key) {
                Ok(actions) => self.apply(actions, &mut batch),
                Err(e) => warn!(vrf = %id, interface = %key, error = %e, "Interface removal failed"),
            }
        }
        batch.flush();

        if let Some(vrf) = store.vrfs.delete(&id) {
            vrf.outbox.flush();
        }
        info!(vrf = %id, "VRF deleted");
        Ok(())
    }

    pub fn lookup_vrf(&self, id: VrfId) -> Option<VrfStats> {
        self.store().vrfs.lookup(&id, |e| VrfStats::from(e))
    }

    /// Records the receive thread reading a VRF's socket.
    pub fn set_vrf_owner(&self, id: VrfId, owner: Option<usize>) {
        self.store().vrfs.update(&id, |v| v.owner = owner);
    }

    /// Declares a gateway ahead of its first datagram.
    pub fn add_gateway(&self, vrf: VrfId, ip: Ipv4Addr, port: u16) -> Result<()> {
        if !self.store().vrfs.contains(&vrf) {
            return Err(GatewayError::VrfNotFound(vrf));
        }
        let key = GatewayKey::new(vrf, ip);
        if self.store().gateways.add(key, GreGateway::new(key, port)).is_err() {
            debug!(gateway = %key, "Gateway already known");
        }
        Ok(())
    }

    /// Removes a gateway and silently drops its sessions.
    pub fn delete_gateway(&self, vrf: VrfId, ip: Ipv4Addr) -> Result<()> {
        let key = GatewayKey::new(vrf, ip);
        let store = self.store();
        store
            .gateways
            .update(&key, |g| g.state = GatewayState::Down)
            .ok_or(GatewayError::GatewayNotFound { vrf, ip })?;
        let mut batch = Batch::default();
        self.drain_sessions(
            "gateway",
            || store.gateway_session_ids(&key),
            Notify::Silent,
            &mut batch,
        );
        batch.flush();
        store.gateways.delete(&key);
        info!(gateway = %key, "Gateway deleted");
        Ok(())
    }

    pub fn lookup_gateway(&self, vrf: VrfId, ip: Ipv4Addr) -> Option<GatewayStats> {
        self.store()
            .gateways
            .lookup(&GatewayKey::new(vrf, ip), |e| GatewayStats::from(e))
    }

    pub fn add_ipip_gateway(&self, spec: &IpipSpec) -> Result<()> {
        if !self.store().vrfs.contains(&spec.vrf) {
            return Err(GatewayError::VrfNotFound(spec.vrf));
        }
        let key = GatewayKey::new(spec.vrf, spec.ip);
        self.store()
            .ipips
            .add(key, IpipGateway::new(key))
            .map_err(|_| GatewayError::IpipGatewayExists {
                vrf: spec.vrf,
                ip: spec.ip,
            })?;
        info!(ipip = %key, "IPIP gateway added");
        Ok(())
    }

    pub fn delete_ipip_gateway(&self, vrf: VrfId, ip: Ipv4Addr) -> Result<()> {
        let key = GatewayKey::new(vrf, ip);
        let store = self.store();
        store
            .ipips
            .update(&key, |g| g.deleting = true)
            .ok_or(GatewayError::IpipGatewayNotFound { vrf, ip })?;
        let mut batch = Batch::default();
        self.drain_sessions(
            "ipip gateway",
            || store.ipip_session_ids(&key),
            Notify::Peer(ErrorCode::NoPolicy),
            &mut batch,
        );
        batch.flush();
        self.forget_ipip(&key);
        info!(ipip = %key, "IPIP gateway deleted");
        Ok(())
    }

    pub fn lookup_ipip_gateway(&self, vrf: VrfId, ip: Ipv4Addr) -> Option<IpipStats> {
        self.store()
            .ipips
            .lookup(&GatewayKey::new(vrf, ip), |e| IpipStats::from(e))
    }

    fn forget_ipip(&self, key: &GatewayKey) {
        let mut g = self.store().write_all();
        g.ipips.remove(key);
        for p in g.processors.values_mut() {
            p.ipip_reachable.remove(key);
        }
    }

    pub fn add_user(&self, spec: &UserSpec) -> Result<()> {
        if !self.store().vrfs.contains(&spec.egress_vrf) {
            return Err(GatewayError::VrfNotFound(spec.egress_vrf));
        }
        let user = UserPolicy {
            name: spec.name.clone(),
            prefix: spec.prefix,
            ingress_vrf: spec.ingress_vrf,
            egress_vrf: spec.egress_vrf,
            ipip: spec.ipip,
            counters: SessionCounters::default(),
            sessions: OrderedMap::new(),
            deleting: false,
        };
        self.store()
            .users
            .add(spec.name.clone(), user)
            .map_err(|_| GatewayError::UserExists(spec.name.clone()))?;
        info!(user = %spec.name, prefix = %spec.prefix, egress_vrf = %spec.egress_vrf, ipip = ?spec.ipip, "User policy added");
        Ok(())
    }

    pub fn delete_user(&self, name: &str) -> Result<()> {
        let store = self.store();
        let key = name.to_string();
        store
            .users
            .update(&key, |u| u.deleting = true)
            .ok_or_else(|| GatewayError::UserNotFound(key.clone()))?;
        let mut batch = Batch::default();
        self.drain_sessions(
            "user",
            || store.user_session_ids(name),
            Notify::Peer(ErrorCode::NoPolicy),
            &mut batch,
        );
        batch.flush();
        store.users.delete(&key);
        info!(user = %name, "User policy deleted");
        Ok(())
    }

    pub fn lookup_user(&self, name: &str) -> Option<UserStats> {
        self.store().users.lookup(&name.to_string(), |e| UserStats::from(e))
    }

    pub fn add_processor(&self, spec: &ProcessorSpec) -> Result<()> {
        let processor = Processor {
            id: spec.id,
            name: spec.name.clone(),
            state: ProcessorState::Init,
            client: self.new_client(spec.id),
            interfaces: OrderedMap::new(),
            tunnels: OrderedMap::new(),
            ipip_reachable: Default::default(),
            counters: SessionCounters::default(),
        };
        self.store()
            .processors
            .add(spec.id, processor)
            .map_err(|_| GatewayError::ProcessorExists(spec.id))?;
        info!(dp = %spec.id, name = %spec.name, address = ?spec.address, "Processor added");
        Ok(())
    }

    pub fn delete_processor(&self, dp: DpId) -> Result<()> {
        self.processor_shutdown(dp)?;
        self.store().processors.delete(&dp);
        info!(dp = %dp, "Processor deleted");
        Ok(())
    }

    pub fn lookup_processor(&self, dp: DpId) -> Option<ProcessorStats> {
        self.store().processors.lookup(&dp, |e| ProcessorStats::from(e))
    }

    /// A processor connection went away.
    ///
    /// Its sessions fail, its tunnels and reachability reports are
    /// forgotten and its interfaces are removed.
    pub fn processor_shutdown(&self, dp: DpId) -> Result<()> {
        let store = self.store();
        let client = store
            .processors
            .update(&dp, |p| {
                p.state = ProcessorState::Down;
                Arc::clone(&p.client)
            })
            .ok_or(GatewayError::ProcessorNotFound(dp))?;
        client.detach();

        let mut batch = Batch::default();
        self.drain_sessions(
            "processor",
            || store.processor_session_ids(dp),
            Notify::Peer(ErrorCode::ProcessorFailure),
            &mut batch,
        );

        {
            let mut g = store.write_all();
            let reported = g
                .processors
                .get_mut(&dp)
                .map(|p| std::mem::take(&mut p.ipip_reachable))
                .unwrap_or_default();
            for key in reported {
                if let Some(ipip) = g.ipips.get_mut(&key) {
                    ipip.reachable.remove(&dp);
                }
            }
        }
        store.clear_tunnels(dp);

        let interfaces: Vec<InterfaceKey> = store
            .processors
            .lookup(&dp, |p| p.interfaces.keys().copied().collect())
            .unwrap_or_default();
        for key in interfaces {
            match store.begin_interface_removal(&key) {
                Ok(actions) => self.apply(actions, &mut batch),
                Err(e) => debug!(interface = %key, error = %e, "Interface already gone"),
            }
        }
        batch.flush();
        info!(dp = %dp, "Processor down");
        Ok(())
    }

    pub fn add_interface(&self, spec: &InterfaceSpec) -> Result<()> {
        let key = spec.key();
        {
            let mut g = self.store().write_all();
            if !g.vrfs.get(&spec.vrf).is_some_and(|v| v.is_usable()) {
                return Err(GatewayError::VrfNotFound(spec.vrf));
            }
            let processor = g
                .processors
                .get_mut(&spec.dp)
                .ok_or(GatewayError::ProcessorNotFound(spec.dp))?;
            if processor.interfaces.contains_key(&key) {
                return Err(GatewayError::InterfaceExists(key));
            }
            let iface = Interface {
                key,
                vrf: spec.vrf,
                ip: spec.ip,
                admin_up: spec.admin_up,
                policy: spec.policy.clone(),
                next_hop: ProgrammingState::Pending,
                route: None,
                routes: OrderedMap::new(),
                sessions: OrderedMap::new(),
                counters: SessionCounters::default(),
                removing: false,
            };
            if g.interfaces.insert_new(key, iface).is_err() {
                return Err(GatewayError::InterfaceExists(key));
            }
            if let Some(p) = g.processors.get_mut(&spec.dp) {
                p.interfaces.insert(key, ());
            }
        }
        self.routing()
            .create_next_hop(RoutingContext::NextHop(key), spec.vrf, spec.ip);
        info!(interface = %key, vrf = %spec.vrf, ip = %spec.ip, policy = ?spec.policy, "Interface added");
        Ok(())
    }

    /// Re-adds configured interfaces, typically after their processor came
    /// back. An interface whose earlier removal is still waiting on the
    /// routing service is re-added once that removal completes.
    pub fn restore_interfaces<'a>(&self, specs: impl IntoIterator<Item = &'a InterfaceSpec>) {
        let mut parked = false;
        for spec in specs {
            let key = spec.key();
            match self.add_interface(spec) {
                Ok(()) => {}
                Err(GatewayError::InterfaceExists(_)) => {
                    let removing = self
                        .store()
                        .interfaces
                        .lookup(&key, |i| i.removing)
                        .unwrap_or(false);
                    if removing {
                        info!(interface = %key, "Interface restore waits for its removal");
                        self.restores().lock().insert(key, spec.clone());
                        parked = true;
                    }
                }
                Err(e) => warn!(interface = %key, error = %e, "Failed to restore interface"),
            }
        }
        // The removal may have finished while the specs were parked.
        if parked {
            self.resume_restores();
        }
    }

    /// Re-adds parked interfaces whose removal has finished.
    pub(crate) fn resume_restores(&self) {
        let ready: Vec<InterfaceSpec> = {
            let mut restores = self.restores().lock();
            if restores.is_empty() {
                return;
            }
            let store = self.store();
            let gone: Vec<InterfaceKey> = restores
                .keys()
                .filter(|key| !store.interfaces.contains(key))
                .copied()
                .collect();
            gone.iter().filter_map(|key| restores.remove(key)).collect()
        };
        for spec in ready {
            match self.add_interface(&spec) {
                Ok(()) => info!(interface = %spec.key(), "Interface restored"),
                Err(e) => warn!(interface = %spec.key(), error = %e, "Failed to restore interface"),
            }
        }
    }

    /// Interfaces waiting for their removal to finish before being re-added.
    pub fn pending_restores(&self) -> Vec<InterfaceKey> {
        self.restores().lock().keys().copied().collect()
    }

    /// Changes an interface's administrative state. Going down fails every
    /// session using the interface.
    pub fn set_interface_admin(&self, key: InterfaceKey, up: bool) -> Result<()> {
        let store = self.store();
        let was_up = store
            .interfaces
            .update(&key, |i| std::mem::replace(&mut i.admin_up, up))
            .ok_or(GatewayError::InterfaceNotFound(key))?;
        if was_up && !up {
            let mut batch = Batch::default();
            self.drain_sessions(
                "interface",
                || store.interface_session_ids(&key),
                Notify::Peer(ErrorCode::NoProcessor),
                &mut batch,
            );
            batch.flush();
        }
        info!(interface = %key, up, "Interface admin state");
        Ok(())
    }

    pub fn delete_interface(&self, key: InterfaceKey) -> Result<()> {
        let store = self.store();
        store
            .interfaces
            .update(&key, |i| i.removing = true)
            .ok_or(GatewayError::InterfaceNotFound(key))?;
        let mut batch = Batch::default();
        self.drain_sessions(
            "interface",
            || store.interface_session_ids(&key),
            Notify::Peer(ErrorCode::NoProcessor),
            &mut batch,
        );
        let actions = store.begin_interface_removal(&key)?;
        self.apply(actions, &mut batch);
        batch.flush();
        info!(interface = %key, "Interface removal started");
        Ok(())
    }

    pub fn lookup_interface(&self, key: InterfaceKey) -> Option<InterfaceStats> {
        self.store().interfaces.lookup(&key, |e| InterfaceStats::from(e))
    }

    pub fn lookup_route(&self, key: RouteKey) -> Option<RouteStats> {
        self.store().routes.lookup(&key, |e| RouteStats::from(e))
    }
}
