//! SESSION_INIT_REQ handling: policy match, processor selection and
//! registration.

use std::net::Ipv4Addr;
use std::sync::Arc;

use gre_types::FiveTuple;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Batch, Origin, SessionOrch, SessionOrchStats};
use crate::error::{GatewayError, Result};
use crate::proto::provision::{
    EgressInfo, IngressInfo, MessageKind, SessionBody, SubMessage, SubType,
};
use crate::proto::signaling::{ErrorCode, MessageType, SignalMessage};
use crate::store::{
    DpId, EgressKind, EgressTunnel, GatewayKey, IngressTunnel, InterfaceKey, Session, SessionId,
    SessionState, VrfId,
};

/// The user policy chosen for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PolicyMatch {
    pub name: String,
    pub egress_vrf: VrfId,
    pub ipip: Option<GatewayKey>,
}

/// Processor and interfaces carrying a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataPath {
    pub dp: DpId,
    pub ingress_if: InterfaceKey,
    pub ingress_ip: Ipv4Addr,
    pub egress_if: InterfaceKey,
    pub egress_ip: Ipv4Addr,
}

/// Provisioning body describing `s`.
pub(crate) fn session_body(s: &Session) -> SessionBody {
    SessionBody {
        context: s.id.0,
        ingress: IngressInfo {
            vrf: s.vrf,
            key: s.ingress.key,
            local_ip: s.ingress.local_ip,
            peer_ip: s.ingress.peer_ip,
            peer_key: s.ingress.peer_key,
        },
        egress: EgressInfo {
            kind: s.egress.kind,
            vrf: s.egress.vrf,
            local_ip: s.egress.local_ip,
            peer_ip: s.egress.peer_ip,
        },
        tuple: s.tuple,
    }
}

impl SessionOrch {
    pub(super) fn session_init(&self, origin: &Origin, msg: &SignalMessage, batch: &mut Batch) {
        let gw = origin.gateway();
        let existing = self
            .store
            .gateway_session(&gw, &msg.tuple)
            .and_then(|id| self.store.session(id));
        if let Some(handle) = existing {
            let s = handle.lock();
            if s.state != SessionState::Cleared {
                if s.init_msg_id == msg.msg_id {
                    debug!(session = %s.id, msg_id = msg.msg_id, "Duplicate init ignored");
                } else {
                    debug!(session = %s.id, tuple = %msg.tuple, "Session already exists");
                    SessionOrchStats::bump(&self.stats.sessions_rejected);
                    origin.reply(&msg.reply(MessageType::Err, ErrorCode::SessionExists), batch);
                }
                return;
            }
        }

        match self.admit(origin, msg, batch) {
            Ok(id) => {
                SessionOrchStats::bump(&self.stats.sessions_created);
                debug!(session = %id, gateway = %gw, tuple = %msg.tuple, "Session admitted");
            }
            Err(e) => {
                SessionOrchStats::bump(&self.stats.sessions_rejected);
                let code = e.error_code();
                if code == ErrorCode::Internal {
                    warn!(gateway = %gw, tuple = %msg.tuple, error = %e, "Session admission failed");
                } else {
                    debug!(gateway = %gw, tuple = %msg.tuple, error = %e, code = %code, "Session rejected");
                }
                origin.reply(&msg.reply(MessageType::Err, code), batch);
            }
        }
    }

    /// Creates, registers and provisions a new session.
    fn admit(&self, origin: &Origin, msg: &SignalMessage, batch: &mut Batch) -> Result<SessionId> {
        let policy = self.match_policy(origin.vrf, &msg.tuple)?;
        let path = self.select_processor(origin.vrf, &policy)?;
        let peer_ip = if msg.gw_tunnel_ip.is_unspecified() {
            *origin.src.ip()
        } else {
            msg.gw_tunnel_ip
        };

        let session = Session {
            id: self.store.next_session_id(),
            state: SessionState::Init,
            tuple: msg.tuple,
            vrf: origin.vrf,
            gateway: *origin.src.ip(),
            reply_to: origin.src,
            user: policy.name.clone(),
            ipip: policy.ipip,
            processor: path.dp,
            ingress_if: path.ingress_if,
            egress_if: path.egress_if,
            ingress: IngressTunnel {
                key: 0,
                local_ip: path.ingress_ip,
                peer_ip,
                peer_key: msg.gw_key,
            },
            egress: EgressTunnel {
                kind: if policy.ipip.is_some() {
                    EgressKind::Ipip
                } else {
                    EgressKind::Native
                },
                vrf: policy.egress_vrf,
                local_ip: path.egress_ip,
                peer_ip: policy.ipip.map_or(Ipv4Addr::UNSPECIFIED, |k| k.ip),
            },
            client_route: None,
            route_if: None,
            init_msg_id: msg.msg_id,
            last_msg_id: None,
            pending_reply: None,
        };

        let handle = Arc::new(Mutex::new(session));
        let mut s = handle.lock();
        let actions = self.store.register_session(&handle, &mut s)?;
        // Tunnels are queued ahead of the session that needs them.
        self.apply(actions, batch);

        let sub = SubMessage::session(SubType::AddGreSession, session_body(&s));
        let queued = self
            .live_client(s.processor)
            .ok_or(GatewayError::ProcessorUnavailable(s.processor))
            .and_then(|client| client.enqueue(MessageKind::Request, &sub).map(|()| client));
        match queued {
            Ok(client) => {
                batch.touch_processor(&client);
                SessionOrchStats::bump(&self.stats.provision_adds);
                info!(
                    session = %s.id,
                    vrf = %s.vrf,
                    key = s.ingress.key,
                    user = %s.user,
                    dp = %s.processor,
                    "Session created"
                );
                Ok(s.id)
            }
            Err(e) => {
                let dp = s.processor;
                s.state = SessionState::Fail;
                self.clear(&mut s, batch);
                warn!(dp = %dp, error = %e, "Provisioning add failed");
                Err(GatewayError::ProcessorUnavailable(dp))
            }
        }
    }

    /// First user policy, in table order, that matches the client and can
    /// take the flow.
    pub(crate) fn match_policy(&self, vrf: VrfId, tuple: &FiveTuple) -> Result<PolicyMatch> {
        let candidates: Vec<PolicyMatch> = self
            .store
            .users
            .read()
            .values()
            .filter(|u| u.matches(vrf, tuple.src_ip) && !u.sessions.contains_key(tuple))
            .map(|u| PolicyMatch {
                name: u.name.clone(),
                egress_vrf: u.egress_vrf,
                ipip: u.ipip_key(),
            })
            .collect();

        for candidate in candidates {
            let Some(key) = candidate.ipip else {
                return Ok(candidate);
            };
            let usable = self
                .store
                .ipips
                .lookup(&key, |g| {
                    !g.deleting && g.reachability() > 0 && !g.sessions.contains_key(tuple)
                })
                .unwrap_or(false);
            if usable {
                return Ok(candidate);
            }
            debug!(user = %candidate.name, ipip = %key, "IPIP gateway unusable, trying next policy");
        }
        Err(GatewayError::NoPolicy(tuple.src_ip))
    }

    /// First live processor, in table order, with usable interfaces in
    /// both the ingress and the egress VRF.
    pub(crate) fn select_processor(&self, ingress: VrfId, policy: &PolicyMatch) -> Result<DataPath> {
        let candidates: Vec<(DpId, Vec<InterfaceKey>)> = self
            .store
            .processors
            .read()
            .values()
            .filter(|p| p.is_live())
            .filter(|p| policy.ipip.map_or(true, |k| p.ipip_reachable.contains(&k)))
            .map(|p| (p.id, p.interfaces.keys().copied().collect()))
            .collect();

        let interfaces = self.store.interfaces.read();
        for (dp, keys) in candidates {
            let find = |vrf: VrfId| {
                keys.iter().find_map(|k| {
                    interfaces
                        .get(k)
                        .filter(|i| i.serves(vrf, &policy.name))
                        .map(|i| (i.key, i.ip))
                })
            };
            if let (Some((ingress_if, ingress_ip)), Some((egress_if, egress_ip))) =
                (find(ingress), find(policy.egress_vrf))
            {
                return Ok(DataPath {
                    dp,
                    ingress_if,
                    ingress_ip,
                    egress_if,
                    egress_ip,
                });
            }
        }
        Err(GatewayError::NoProcessor {
            ingress,
            egress: policy.egress_vrf,
        })
    }
}
