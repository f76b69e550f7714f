use std::net::Ipv4Addr;

use pretty_assertions::assert_eq;

use crate::management::{IpipSpec, UserSpec};
use crate::proto::provision::{MessageKind, ProvisionMessage, SubBody, SubType};
use crate::proto::signaling::{ErrorCode, MessageType, SignalMessage};
use crate::routing::RoutingOp;
use crate::store::{EgressKind, GatewayState, ProcessorState, SessionState, VrfId};
use crate::testutil::*;

fn key_of(h: &Harness, n: u8) -> u32 {
    let id = h.session_id(n).unwrap();
    h.orch.lookup_session(id).unwrap().key
}

#[test]
fn test_init_provisions_tunnel_before_session() {
    let h = Harness::new();
    h.send(&[Harness::init_msg(1)]);

    let subs = h.transport.take_subs();
    let types: Vec<SubType> = subs.iter().map(|s| s.sub_type).collect();
    assert_eq!(types, vec![SubType::AddTunnel, SubType::AddGreSession]);
    match subs[0].body {
        SubBody::Tunnel(t) => {
            assert_eq!(t.local_ip, Ipv4Addr::new(192, 0, 2, 1));
            assert_eq!(t.peer_ip, GW);
        }
        SubBody::Session(_) => panic!("expected tunnel"),
    }
    let SubBody::Session(body) = subs[1].body else {
        panic!("expected session");
    };
    assert_eq!(body.ingress.key, 100);
    assert_eq!(body.ingress.peer_key, 5001);
    assert_eq!(body.egress.vrf, CORE);
    assert_eq!(body.egress.kind, EgressKind::Native);

    // Nothing is said to the gateway until the processor answers.
    assert!(h.signaling.take().is_empty());
    let id = h.session_id(1).unwrap();
    assert_eq!(h.orch.lookup_session(id).unwrap().state, SessionState::Init);
    assert_eq!(h.orch.lookup_vrf(ACCESS).unwrap().sessions, 1);
    assert_eq!(h.orch.lookup_vrf(ACCESS).unwrap().active, 0);
}

#[test]
fn test_add_confirmation_transmits() {
    let h = Harness::new();
    h.send(&[Harness::init_msg(1)]);
    h.reply_sessions(0);

    let msgs = h.signaling.take();
    assert_eq!(msgs.len(), 1);
    let transmit = msgs[0];
    assert_eq!(transmit.msg_type, MessageType::Transmit);
    assert_eq!(transmit.msg_id, 1);
    assert_eq!(transmit.engine_key, 100);
    assert_eq!(transmit.gw_key, 5001);
    assert_eq!(transmit.engine_tunnel_ip, Ipv4Addr::new(192, 0, 2, 1));

    for vrf in [ACCESS, CORE] {
        let stats = h.orch.lookup_vrf(vrf).unwrap();
        assert_eq!((stats.sessions, stats.active), (1, 1));
    }
    assert_eq!(h.orch.lookup_user("default").unwrap().active, 1);
    assert_eq!(h.orch.lookup_processor(DP).unwrap().active, 1);
    assert_eq!(h.orch.lookup_interface(ACCESS_IF).unwrap().active, 1);
    assert_eq!(h.orch.lookup_gateway(ACCESS, GW).unwrap().state, GatewayState::Up);
}

#[test]
fn test_duplicate_init() {
    let h = Harness::new();
    h.establish(1);

    // Same message id: a retransmission, dropped silently.
    h.send(&[Harness::init_msg(1)]);
    assert!(h.signaling.take().is_empty());

    let mut again = Harness::init_msg(1);
    again.msg_id = 99;
    h.send(&[again]);
    let msgs = h.signaling.take();
    assert_eq!(codes_of(&msgs, MessageType::Err), vec![ErrorCode::SessionExists]);
    assert_eq!(msgs[0].msg_id, 99);
    assert!(h.transport.take_subs().is_empty());
}

#[test]
fn test_no_policy_for_client() {
    let h = Harness::new();
    let mut msg = Harness::init_msg(1);
    msg.tuple.src_ip = Ipv4Addr::new(172, 16, 0, 1);
    h.send(&[msg]);

    assert_eq!(
        codes_of(&h.signaling.take(), MessageType::Err),
        vec![ErrorCode::NoPolicy]
    );
    assert_eq!(h.orch.counters().sessions_rejected, 1);
}

#[test]
fn test_no_processor_without_egress_interface() {
    let h = Harness::new();
    h.orch.set_interface_admin(CORE_IF, false).unwrap();
    h.send(&[Harness::init_msg(1)]);

    assert_eq!(
        codes_of(&h.signaling.take(), MessageType::Err),
        vec![ErrorCode::NoProcessor]
    );
    assert!(h.session_id(1).is_none());
}

#[test]
fn test_session_limit() {
    let h = Harness::new();
    h.orch.store().vrfs.update(&ACCESS, |v| v.max_sessions = 1);
    h.establish(1);
    h.send(&[Harness::init_msg(2)]);

    assert_eq!(
        codes_of(&h.signaling.take(), MessageType::Err),
        vec![ErrorCode::ResourceUnavailable]
    );
}

#[test]
fn test_pending_sessions_do_not_consume_limit() {
    let h = Harness::new();
    h.orch.store().vrfs.update(&ACCESS, |v| v.max_sessions = 1);
    h.send(&[Harness::init_msg(1), Harness::init_msg(2)]);

    assert!(h.signaling.take().is_empty());
    let subs = h.transport.take_subs();
    assert_eq!(sessions_of(&subs, SubType::AddGreSession).len(), 2);
    let stats = h.orch.lookup_vrf(ACCESS).unwrap();
    assert_eq!((stats.sessions, stats.keyed_active), (2, 0));
}

#[test]
fn test_egress_sessions_do_not_consume_limit() {
    let h = Harness::new();
    h.orch.store().vrfs.update(&CORE, |v| v.max_sessions = 1);
    h.establish(1);
    let core = h.orch.lookup_vrf(CORE).unwrap();
    assert_eq!((core.sessions, core.active, core.keyed_active), (1, 1, 0));

    // A session keyed in CORE still fits under its limit.
    let mut data = Vec::new();
    Harness::init_msg(2).encode(&mut data);
    h.orch.handle_datagram(CORE, Harness::gw_addr(), &data);
    assert!(codes_of(&h.signaling.take(), MessageType::Err).is_empty());
    let subs = h.transport.take_subs();
    assert_eq!(sessions_of(&subs, SubType::AddGreSession).len(), 1);
}

#[test]
fn test_processor_rejects_add() {
    let h = Harness::new();
    h.send(&[Harness::init_msg(1)]);
    h.reply_sessions(5);

    let msgs = h.signaling.take();
    assert_eq!(codes_of(&msgs, MessageType::Err), vec![ErrorCode::ProcessorFailure]);
    assert_eq!(msgs[0].msg_id, 1);
    assert!(h.session_id(1).is_none());
    assert_eq!(h.orch.counters().processor_failures, 1);

    // The rejected session's tunnel is withdrawn and its key reused.
    let subs = h.transport.take_subs();
    assert_eq!(subs.iter().filter(|s| s.sub_type == SubType::DelTunnel).count(), 1);
    h.establish(2);
    assert_eq!(key_of(&h, 2), 100);
}

#[test]
fn test_end_waits_for_processor() {
    let h = Harness::new();
    let id = h.establish(1);

    h.send(&[Harness::end_msg(1, 77)]);
    let subs = h.transport.take_subs();
    assert_eq!(sessions_of(&subs, SubType::DelGreSession), vec![id.0]);
    assert!(h.signaling.take().is_empty());
    assert_eq!(h.orch.lookup_vrf(ACCESS).unwrap().active, 0);

    // Retransmitted END while the delete is in flight.
    h.send(&[Harness::end_msg(1, 77)]);
    assert!(h.signaling.take().is_empty());
    assert!(h.transport.take_subs().is_empty());

    let del = ProvisionMessage::new(MessageKind::Reply, subs).to_bytes();
    h.orch.on_processor_message(DP, &del);

    let msgs = h.signaling.take();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_type, MessageType::Done);
    assert_eq!(msgs[0].msg_id, 77);
    assert!(h.orch.lookup_session(id).is_none());
    assert_eq!(h.orch.lookup_vrf(ACCESS).unwrap().sessions, 0);
    assert_eq!(h.orch.lookup_processor(DP).unwrap().tunnels, 0);

    let subs = h.transport.take_subs();
    assert_eq!(subs.iter().filter(|s| s.sub_type == SubType::DelTunnel).count(), 1);
    assert!(h
        .routing
        .take()
        .iter()
        .any(|(_, op)| *op == RoutingOp::DeleteRoute));

    h.send(&[Harness::end_msg(1, 78)]);
    assert_eq!(
        codes_of(&h.signaling.take(), MessageType::Err),
        vec![ErrorCode::NoSession]
    );
}

#[test]
fn test_err_req_is_acknowledged() {
    let h = Harness::new();
    h.establish(1);
    let mut msg = Harness::end_msg(1, 31);
    msg.msg_type = MessageType::ErrReq;
    h.send(&[msg]);
    h.reply_sessions(0);

    let msgs = h.signaling.take();
    assert_eq!(codes_of(&msgs, MessageType::Err), vec![ErrorCode::Ok]);
    assert_eq!(msgs[0].msg_id, 31);
}

#[test]
fn test_end_before_add_confirmed() {
    let h = Harness::new();
    h.send(&[Harness::init_msg(1)]);
    h.send(&[Harness::end_msg(1, 2)]);

    // Both the add and the delete are answered; the late add is stale.
    h.reply_sessions(0);
    let msgs = h.signaling.take();
    let types: Vec<MessageType> = msgs.iter().map(|m| m.msg_type).collect();
    assert_eq!(types, vec![MessageType::Done]);
    assert!(h.session_id(1).is_none());
}

#[test]
fn test_freed_key_is_reused() {
    let h = Harness::new();
    h.establish(1);
    h.establish(2);
    assert_eq!(key_of(&h, 2), 101);

    h.send(&[Harness::end_msg(1, 50)]);
    h.reply_sessions(0);
    h.signaling.take();

    h.establish(3);
    assert_eq!(key_of(&h, 3), 100);
}

#[test]
fn test_hello_and_malformed() {
    let h = Harness::new();
    let mut data = Vec::new();
    SignalMessage::new(MessageType::Hello, 5).encode(&mut data);
    h.orch.handle_datagram(ACCESS, Harness::gw_addr(), &data);

    let msgs = h.signaling.take();
    assert_eq!(msgs.len(), 1);
    assert_eq!((msgs[0].msg_type, msgs[0].msg_id), (MessageType::Hello, 5));
    assert_eq!(h.orch.lookup_gateway(ACCESS, GW).unwrap().state, GatewayState::Up);

    data.extend_from_slice(&[0xff; 10]);
    h.orch.handle_datagram(ACCESS, Harness::gw_addr(), &data);
    assert_eq!(h.orch.counters().malformed, 1);
    assert_eq!(h.orch.lookup_gateway(ACCESS, GW).unwrap().state, GatewayState::Fail);
}

#[test]
fn test_junk_does_not_create_gateway() {
    let h = Harness::new();
    h.orch.handle_datagram(ACCESS, Harness::gw_addr(), &[0xff; 10]);

    assert_eq!(h.orch.counters().malformed, 1);
    assert!(h.orch.lookup_gateway(ACCESS, GW).is_none());
    assert!(h.signaling.take().is_empty());

    // The first well-formed message records it.
    let mut data = Vec::new();
    SignalMessage::new(MessageType::Hello, 1).encode(&mut data);
    h.orch.handle_datagram(ACCESS, Harness::gw_addr(), &data);
    assert_eq!(h.orch.lookup_gateway(ACCESS, GW).unwrap().state, GatewayState::Up);
}

#[test]
fn test_datagram_for_unknown_vrf_dropped() {
    let h = Harness::new();
    h.orch.handle_datagram(VrfId(9), Harness::gw_addr(), &[0u8; 44]);
    assert_eq!(h.orch.counters().datagrams_dropped, 1);
    assert!(h.orch.lookup_gateway(VrfId(9), GW).is_none());
}

#[test]
fn test_processor_shutdown_fails_sessions() {
    let h = Harness::new();
    h.establish(1);
    h.establish(2);

    h.orch.processor_shutdown(DP).unwrap();
    let msgs = h.signaling.take();
    assert_eq!(
        codes_of(&msgs, MessageType::ErrReq),
        vec![ErrorCode::ProcessorFailure, ErrorCode::ProcessorFailure]
    );
    // The connection is gone, nothing is provisioned.
    assert!(h.transport.take_subs().is_empty());

    let dp = h.orch.lookup_processor(DP).unwrap();
    assert_eq!(dp.state, ProcessorState::Down);
    assert_eq!((dp.sessions, dp.tunnels), (0, 0));

    h.routing.ack_all(&h.orch);
    assert!(h.orch.lookup_interface(ACCESS_IF).is_none());
    assert!(h.orch.lookup_interface(CORE_IF).is_none());
    assert!(h.orch.store().routes.is_empty());
    assert_eq!(h.orch.lookup_processor(DP).unwrap().interfaces, 0);
}

#[test]
fn test_user_delete_notifies_gateway() {
    let h = Harness::new();
    let id = h.establish(1);

    h.orch.delete_user("default").unwrap();
    assert_eq!(
        codes_of(&h.signaling.take(), MessageType::ErrReq),
        vec![ErrorCode::NoPolicy]
    );
    let subs = h.transport.take_subs();
    assert_eq!(sessions_of(&subs, SubType::DelGreSession), vec![id.0]);
    assert!(h.orch.lookup_session(id).is_none());

    // The late delete confirmation finds nothing.
    h.orch.on_processor_message(
        DP,
        &ProvisionMessage::new(MessageKind::Reply, subs).to_bytes(),
    );
    assert!(h.signaling.take().is_empty());
}

#[test]
fn test_gateway_delete_is_silent() {
    let h = Harness::new();
    h.establish(1);
    h.orch.delete_gateway(ACCESS, GW).unwrap();

    assert!(h.signaling.take().is_empty());
    assert_eq!(
        sessions_of(&h.transport.take_subs(), SubType::DelGreSession).len(),
        1
    );
    assert!(h.orch.lookup_gateway(ACCESS, GW).is_none());
    assert_eq!(h.orch.lookup_vrf(ACCESS).unwrap().sessions, 0);
}

#[test]
fn test_egress_vrf_delete() {
    let h = Harness::new();
    h.establish(1);
    h.orch.delete_vrf(CORE).unwrap();

    assert_eq!(
        codes_of(&h.signaling.take(), MessageType::ErrReq),
        vec![ErrorCode::NoPolicy]
    );
    assert!(h.orch.lookup_vrf(CORE).is_none());
    assert_eq!(h.orch.lookup_vrf(ACCESS).unwrap().sessions, 0);
    h.routing.ack_all(&h.orch);
    assert!(h.orch.lookup_interface(CORE_IF).is_none());
    assert!(h.orch.lookup_interface(ACCESS_IF).is_some());
}

#[test]
fn test_ipip_policy_needs_reachable_gateway() {
    let h = Harness::new();
    let ipip = Ipv4Addr::new(198, 51, 100, 200);
    h.orch.delete_user("default").unwrap();
    h.orch
        .add_ipip_gateway(&IpipSpec { vrf: CORE, ip: ipip })
        .unwrap();
    h.orch
        .add_user(&UserSpec {
            name: "tunneled".to_string(),
            prefix: "10.0.0.0/24".parse().unwrap(),
            ingress_vrf: Some(ACCESS),
            egress_vrf: CORE,
            ipip: Some(ipip),
        })
        .unwrap();

    h.send(&[Harness::init_msg(1)]);
    assert_eq!(
        codes_of(&h.signaling.take(), MessageType::Err),
        vec![ErrorCode::NoPolicy]
    );

    h.orch.set_ipip_reachable(DP, CORE, ipip, true).unwrap();
    h.send(&[Harness::init_msg(2)]);
    let subs = h.reply_sessions(0);
    assert_eq!(subs.iter().filter(|s| s.sub_type == SubType::AddTunnel).count(), 2);
    let body = subs
        .iter()
        .find_map(|s| match s.body {
            SubBody::Session(b) => Some(b),
            SubBody::Tunnel(_) => None,
        })
        .unwrap();
    assert_eq!(body.egress.kind, EgressKind::Ipip);
    assert_eq!(body.egress.peer_ip, ipip);
    assert_eq!(
        codes_of(&h.signaling.take(), MessageType::Transmit),
        vec![ErrorCode::Ok]
    );
    assert_eq!(h.orch.lookup_ipip_gateway(CORE, ipip).unwrap().active, 1);

    h.orch.delete_ipip_gateway(CORE, ipip).unwrap();
    assert_eq!(
        codes_of(&h.signaling.take(), MessageType::ErrReq),
        vec![ErrorCode::NoPolicy]
    );
    assert!(h.orch.lookup_ipip_gateway(CORE, ipip).is_none());
    assert_eq!(h.orch.lookup_user("tunneled").unwrap().sessions, 0);
}
