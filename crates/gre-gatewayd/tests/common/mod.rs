//! Recording peers for integration tests
//!
//! Stand-ins for the routing service, the processor connection and the
//! gateway sockets that keep everything the engine sends.

#![allow(dead_code)]

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use gre_gatewayd::dpclient::ProcessorTransport;
use gre_gatewayd::outbox::SignalingTransport;
use gre_gatewayd::proto::provision::{MessageKind, ProvisionMessage, SubBody, SubMessage, SubType};
use gre_gatewayd::proto::signaling::{MessageType, Messages, SignalMessage};
use gre_gatewayd::routing::{RoutingContext, RoutingOp, RoutingReply, RoutingService};
use gre_gatewayd::{
    DpId, InterfaceKey, InterfaceSpec, ProcessorSpec, SessionOrch, SessionOrchConfig, UserSpec,
    VrfId, VrfSpec,
};
use gre_types::{FiveTuple, IpProtocol, Ipv4Prefix};
use parking_lot::Mutex;

pub const ACCESS: VrfId = VrfId(1);
pub const CORE: VrfId = VrfId(2);
pub const DP: DpId = DpId(1);
pub const GW: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);
pub const ACCESS_IF: InterfaceKey = InterfaceKey::new(DpId(1), 1);
pub const CORE_IF: InterfaceKey = InterfaceKey::new(DpId(1), 2);

#[derive(Default)]
pub struct RecordingRouting {
    requests: Mutex<Vec<(RoutingContext, RoutingOp)>>,
}

impl RecordingRouting {
    pub fn take(&self) -> Vec<(RoutingContext, RoutingOp)> {
        std::mem::take(&mut *self.requests.lock())
    }

    /// Answers every request until the engine stops asking.
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
        self.requests.lock().push((ctx, RoutingOp::CreateNextHop));
    }

    fn delete_next_hop(&self, ctx: RoutingContext, _vrf: VrfId, _ip: Ipv4Addr) {
        self.requests.lock().push((ctx, RoutingOp::DeleteNextHop));
    }

    fn add_route(&self, ctx: RoutingContext, _vrf: VrfId, _prefix: Ipv4Prefix, _via: Ipv4Addr) {
        self.requests.lock().push((ctx, RoutingOp::AddRoute));
    }

    fn delete_route(&self, ctx: RoutingContext, _vrf: VrfId, _prefix: Ipv4Prefix) {
        self.requests.lock().push((ctx, RoutingOp::DeleteRoute));
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTransport {
    pub fn take_subs(&self) -> Vec<SubMessage> {
        std::mem::take(&mut *self.sent.lock())
            .iter()
            .flat_map(|m| ProvisionMessage::decode(m).expect("valid provisioning").subs)
            .collect()
    }
}

impl ProcessorTransport for RecordingTransport {
    fn send(&self, message: &[u8]) -> io::Result<()> {
        self.sent.lock().push(message.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<(VrfId, SocketAddrV4, Vec<u8>)>>,
}

impl RecordingSignaling {
    pub fn take(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock())
            .iter()
            .flat_map(|(_, _, d)| {
                Messages::new(d)
                    .map(|m| m.expect("valid signaling"))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn datagrams(&self) -> usize {
        self.sent.lock().len()
    }
}

impl SignalingTransport for RecordingSignaling {
    fn send_to(&self, vrf: VrfId, dest: SocketAddrV4, datagram: &[u8]) -> io::Result<()> {
        self.sent.lock().push((vrf, dest, datagram.to_vec()));
        Ok(())
    }
}

/// A session orch with two VRFs, one processor and one catch-all user.
pub struct Topology {
    pub orch: SessionOrch,
    pub routing: Arc<RecordingRouting>,
    pub signaling: Arc<RecordingSignaling>,
    pub transport: Arc<RecordingTransport>,
}

impl Topology {
    pub fn new() -> Self {
        let routing = Arc::new(RecordingRouting::default());
        let signaling = Arc::new(RecordingSignaling::default());
        let transport = Arc::new(RecordingTransport::default());
        let orch = SessionOrch::new(
            SessionOrchConfig::default(),
            routing.clone(),
            signaling.clone(),
        );

        for (id, name) in [(ACCESS, "access"), (CORE, "core")] {
            orch.add_vrf(&VrfSpec {
                id,
                name: name.to_string(),
                listen: None,
                key_start: 1000,
                key_end: 1999,
                max_sessions: None,
            })
            .expect("add vrf");
        }
        orch.add_processor(&ProcessorSpec {
            id: DP,
            name: "dp1".to_string(),
            address: None,
        })
        .expect("add processor");
        orch.processor_connected(DP, transport.clone()).expect("connect");
        orch.processor_established(DP).expect("establish");
        for (key, vrf, ip) in [
            (ACCESS_IF, ACCESS, Ipv4Addr::new(192, 0, 2, 1)),
            (CORE_IF, CORE, Ipv4Addr::new(198, 51, 100, 1)),
        ] {
            orch.add_interface(&InterfaceSpec {
                dp: DP,
                ifindex: key.ifindex,
                vrf,
                ip,
                admin_up: true,
                policy: None,
            })
            .expect("add interface");
        }
        orch.add_user(&UserSpec {
            name: "subscribers".to_string(),
            prefix: "10.0.0.0/8".parse().expect("prefix"),
            ingress_vrf: Some(ACCESS),
            egress_vrf: CORE,
            ipip: None,
        })
        .expect("add user");
        routing.ack_all(&orch);

        Self {
            orch,
            routing,
            signaling,
            transport,
        }
    }

    pub fn gateway() -> SocketAddrV4 {
        SocketAddrV4::new(GW, 2152)
    }

    pub fn send(&self, msgs: &[SignalMessage]) {
        let mut data = Vec::new();
        for msg in msgs {
            msg.encode(&mut data);
        }
        self.orch.handle_datagram(ACCESS, Self::gateway(), &data);
    }

    /// Answers every pending session sub-message successfully.
    pub fn confirm(&self) -> Vec<SubMessage> {
        let subs = self.transport.take_subs();
        let sessions: Vec<SubMessage> = subs
            .iter()
            .filter(|s| s.sub_type.is_session())
            .copied()
            .collect();
        if !sessions.is_empty() {
            let reply = ProvisionMessage::new(MessageKind::Reply, sessions).to_bytes();
            self.orch.on_processor_message(DP, &reply);
        }
        self.routing.ack_all(&self.orch);
        subs
    }
}

pub fn flow(n: u16) -> FiveTuple {
    FiveTuple::new(
        IpProtocol::UDP,
        Ipv4Addr::new(10, 1, (n >> 8) as u8, n as u8),
        5000 + n,
        Ipv4Addr::new(192, 0, 2, 53),
        53,
    )
}

pub fn init(n: u16) -> SignalMessage {
    let mut msg = SignalMessage::new(MessageType::SessionInitReq, u32::from(n));
    msg.tuple = flow(n);
    msg.gw_key = 0x10000 + u32::from(n);
    msg
}

pub fn end(n: u16, msg_id: u32) -> SignalMessage {
    let mut msg = SignalMessage::new(MessageType::SessionEndReq, msg_id);
    msg.tuple = flow(n);
    msg
}

pub fn count(msgs: &[SignalMessage], msg_type: MessageType) -> usize {
    msgs.iter().filter(|m| m.msg_type == msg_type).count()
}

pub fn count_subs(subs: &[SubMessage], sub_type: SubType) -> usize {
    subs.iter().filter(|s| s.sub_type == sub_type).count()
}

pub fn session_context(sub: &SubMessage) -> Option<u32> {
    match sub.body {
        SubBody::Session(b) => Some(b.context),
        SubBody::Tunnel(_) => None,
    }
}
