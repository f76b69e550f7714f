//! Recording peers and a ready-made topology for unit tests.
//!
//! Topology: VRF 1 (access, keys 100..=199) with gateway 203.0.113.1,
//! VRF 2 (core), processor dp1 with interface 1 in VRF 1 and interface 2
//! in VRF 2, and one user policy for 10.0.0.0/8 leaving through VRF 2.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use gre_types::{FiveTuple, IpProtocol, Ipv4Prefix};
use parking_lot::Mutex;

use crate::dpclient::ProcessorTransport;
use crate::management::{InterfaceSpec, ProcessorSpec, UserSpec, VrfSpec};
use crate::outbox::SignalingTransport;
use crate::proto::provision::{MessageKind, ProvisionMessage, SubBody, SubMessage, SubType};
use crate::proto::signaling::{ErrorCode, MessageType, Messages, SignalMessage};
use crate::routing::{RoutingContext, RoutingOp, RoutingReply, RoutingService};
use crate::session::{SessionOrch, SessionOrchConfig};
use crate::store::{DpId, GatewayKey, InterfaceKey, SessionId, VrfId};

pub const ACCESS: VrfId = VrfId(1);
pub const CORE: VrfId = VrfId(2);
pub const DP: DpId = DpId(1);
pub const GW: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);
pub const GW_PORT: u16 = 2152;
pub const ACCESS_IF: InterfaceKey = InterfaceKey::new(DpId(1), 1);
pub const CORE_IF: InterfaceKey = InterfaceKey::new(DpId(1), 2);

/// Routing service that holds requests until the test answers them.
#[derive(Default)]
pub struct RecordingRouting {
    pub requests: Mutex<Vec<(RoutingContext, RoutingOp)>>,
}

impl RecordingRouting {
    fn push(&self, ctx: RoutingContext, op: RoutingOp) {
        self.requests.lock().push((ctx, op));
    }

    pub fn take(&self) -> Vec<(RoutingContext, RoutingOp)> {
        std::mem::take(&mut *self.requests.lock())
    }

    /// Answers every request, including the ones the answers trigger.
    pub fn ack_all(&self, orch: &SessionOrch) {
        loop {
            let pending = self.take();
            if pending.is_empty() {
                return;
            }
            for (ctx, op) in pending {
                orch.on_routing_reply(RoutingReply { ctx, op, ok: true });
            }
        }
    }
}

impl RoutingService for RecordingRouting {
    fn create_next_hop(&self, ctx: RoutingContext, _vrf: VrfId, _ip: Ipv4Addr) {
        self.push(ctx, RoutingOp::CreateNextHop);
    }

    fn delete_next_hop(&self, ctx: RoutingContext, _vrf: VrfId, _ip: Ipv4Addr) {
        self.push(ctx, RoutingOp::DeleteNextHop);
    }

    fn add_route(&self, ctx: RoutingContext, _vrf: VrfId, _prefix: Ipv4Prefix, _via: Ipv4Addr) {
        self.push(ctx, RoutingOp::AddRoute);
    }

    fn delete_route(&self, ctx: RoutingContext, _vrf: VrfId, _prefix: Ipv4Prefix) {
        self.push(ctx, RoutingOp::DeleteRoute);
    }
}

/// Processor transport keeping every message sent.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTransport {
    /// Decoded sub-messages sent since the last call.
    pub fn take_subs(&self) -> Vec<SubMessage> {
        std::mem::take(&mut *self.sent.lock())
            .iter()
            .flat_map(|m| ProvisionMessage::decode(m).unwrap().subs)
            .collect()
    }
}

impl ProcessorTransport for RecordingTransport {
    fn send(&self, message: &[u8]) -> io::Result<()> {
        self.sent.lock().push(message.to_vec());
        Ok(())
    }
}

/// Signaling transport keeping every datagram sent.
#[derive(Default)]
pub struct RecordingSignaling {
    pub sent: Mutex<Vec<(VrfId, SocketAddrV4, Vec<u8>)>>,
}

impl RecordingSignaling {
    /// Decoded messages sent since the last call.
    pub fn take(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock())
            .iter()
            .flat_map(|(_, _, d)| Messages::new(d).map(|m| m.unwrap()).collect::<Vec<_>>())
            .collect()
    }
}

impl SignalingTransport for RecordingSignaling {
    fn send_to(&self, vrf: VrfId, dest: SocketAddrV4, datagram: &[u8]) -> io::Result<()> {
        self.sent.lock().push((vrf, dest, datagram.to_vec()));
        Ok(())
    }
}

pub struct Harness {
    pub orch: SessionOrch,
    pub routing: Arc<RecordingRouting>,
    pub signaling: Arc<RecordingSignaling>,
    pub transport: Arc<RecordingTransport>,
}

pub fn vrf_spec(id: VrfId) -> VrfSpec {
    VrfSpec {
        id,
        name: format!("vrf{id}"),
        listen: None,
        key_start: 100,
        key_end: 199,
        max_sessions: None,
    }
}

pub fn interface_spec(key: InterfaceKey, vrf: VrfId, ip: Ipv4Addr) -> InterfaceSpec {
    InterfaceSpec {
        dp: key.dp,
        ifindex: key.ifindex,
        vrf,
        ip,
        admin_up: true,
        policy: None,
    }
}

pub fn tuple(n: u8) -> FiveTuple {
    FiveTuple::new(
        IpProtocol::TCP,
        Ipv4Addr::new(10, 0, 0, n),
        40000 + u16::from(n),
        Ipv4Addr::new(192, 0, 2, 80),
        80,
    )
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SessionOrchConfig::default())
    }

    pub fn with_config(config: SessionOrchConfig) -> Self {
        let routing = Arc::new(RecordingRouting::default());
        let signaling = Arc::new(RecordingSignaling::default());
        let transport = Arc::new(RecordingTransport::default());
        let orch = SessionOrch::new(config, routing.clone(), signaling.clone());

        orch.add_vrf(&vrf_spec(ACCESS)).unwrap();
        orch.add_vrf(&vrf_spec(CORE)).unwrap();
        orch.add_processor(&ProcessorSpec {
            id: DP,
            name: "dp1".to_string(),
            address: None,
        })
        .unwrap();
        orch.processor_connected(DP, transport.clone()).unwrap();
        orch.processor_established(DP).unwrap();
        orch.add_interface(&interface_spec(ACCESS_IF, ACCESS, Ipv4Addr::new(192, 0, 2, 1)))
            .unwrap();
        orch.add_interface(&interface_spec(CORE_IF, CORE, Ipv4Addr::new(198, 51, 100, 1)))
            .unwrap();
        orch.add_user(&UserSpec {
            name: "default".to_string(),
            prefix: "10.0.0.0/8".parse().unwrap(),
            ingress_vrf: None,
            egress_vrf: CORE,
            ipip: None,
        })
        .unwrap();
        routing.ack_all(&orch);

        Self {
            orch,
            routing,
            signaling,
            transport,
        }
    }

    pub fn gw_addr() -> SocketAddrV4 {
        SocketAddrV4::new(GW, GW_PORT)
    }

    pub fn send(&self, msgs: &[SignalMessage]) {
        let mut data = Vec::new();
        for msg in msgs {
            msg.encode(&mut data);
        }
        self.orch.handle_datagram(ACCESS, Self::gw_addr(), &data);
    }

    pub fn init_msg(n: u8) -> SignalMessage {
        let mut msg = SignalMessage::new(MessageType::SessionInitReq, u32::from(n));
        msg.tuple = tuple(n);
        msg.gw_key = 5000 + u32::from(n);
        msg
    }

    pub fn end_msg(n: u8, msg_id: u32) -> SignalMessage {
        let mut msg = SignalMessage::new(MessageType::SessionEndReq, msg_id);
        msg.tuple = tuple(n);
        msg
    }

    /// Session registered for flow `n` at the test gateway.
    pub fn session_id(&self, n: u8) -> Option<SessionId> {
        self.orch
            .store()
            .gateway_session(&GatewayKey::new(ACCESS, GW), &tuple(n))
    }

    /// Answers every pending session sub-message with `error`.
    pub fn reply_sessions(&self, error: u8) -> Vec<SubMessage> {
        let subs = self.transport.take_subs();
        let replies: Vec<SubMessage> = subs
            .iter()
            .filter(|s| s.sub_type.is_session())
            .map(|s| SubMessage { error, ..*s })
            .collect();
        if !replies.is_empty() {
            let bytes = ProvisionMessage::new(MessageKind::Reply, replies).to_bytes();
            self.orch.on_processor_message(DP, &bytes);
        }
        subs
    }

    /// Admits flow `n` and brings the session up.
    pub fn establish(&self, n: u8) -> SessionId {
        self.send(&[Self::init_msg(n)]);
        self.reply_sessions(0);
        self.routing.ack_all(&self.orch);
        let id = self.session_id(n).unwrap();
        let transmit = self.signaling.take();
        assert!(transmit
            .iter()
            .any(|m| m.msg_type == MessageType::Transmit && m.tuple == tuple(n)));
        id
    }
}

/// Session sub-messages of `sub_type` among `subs`.
pub fn sessions_of(subs: &[SubMessage], sub_type: SubType) -> Vec<u32> {
    subs.iter()
        .filter(|s| s.sub_type == sub_type)
        .filter_map(|s| match s.body {
            SubBody::Session(b) => Some(b.context),
            SubBody::Tunnel(_) => None,
        })
        .collect()
}

/// Messages of `msg_type` and their error codes.
pub fn codes_of(msgs: &[SignalMessage], msg_type: MessageType) -> Vec<ErrorCode> {
    msgs.iter()
        .filter(|m| m.msg_type == msg_type)
        .map(|m| m.error)
        .collect()
}
