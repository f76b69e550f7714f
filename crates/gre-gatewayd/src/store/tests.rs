use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;
use crate::testutil::*;

fn fixture() -> Harness {
    let h = Harness::new();
    h.orch.add_gateway(ACCESS, GW, GW_PORT).unwrap();
    h
}

fn session(id: u32, src_port: u16) -> SessionHandle {
    let mut tuple = tuple(1);
    tuple.src_port = src_port;
    Arc::new(Mutex::new(Session {
        id: SessionId(id),
        state: SessionState::Init,
        tuple,
        vrf: ACCESS,
        gateway: GW,
        reply_to: SocketAddrV4::new(GW, GW_PORT),
        user: "default".to_string(),
        ipip: None,
        processor: DP,
        ingress_if: ACCESS_IF,
        egress_if: CORE_IF,
        ingress: IngressTunnel {
            key: 0,
            local_ip: Ipv4Addr::new(192, 0, 2, 1),
            peer_ip: GW,
            peer_key: 0,
        },
        egress: EgressTunnel {
            kind: EgressKind::Native,
            vrf: CORE,
            local_ip: Ipv4Addr::new(198, 51, 100, 1),
            peer_ip: Ipv4Addr::UNSPECIFIED,
        },
        client_route: None,
        route_if: None,
        init_msg_id: 1,
        last_msg_id: None,
        pending_reply: None,
    }))
}

fn register(store: &SessionStore, handle: &SessionHandle) -> Result<Vec<StoreAction>> {
    let mut s = handle.lock();
    store.register_session(handle, &mut s)
}

fn unregister(store: &SessionStore, handle: &SessionHandle) -> Vec<StoreAction> {
    let s = handle.lock();
    store.unregister_session(&s, s.is_active())
}

fn client_route() -> RouteKey {
    RouteKey::host(CORE, tuple(1).src_ip)
}

#[test]
fn test_register_links_every_index() {
    let h = fixture();
    let store = h.orch.store();
    let handle = session(10, 1000);
    let actions = register(store, &handle).unwrap();

    let s = handle.lock().clone();
    assert_eq!(s.ingress.key, 100);
    assert_eq!(store.vrf_session(ACCESS, 100), Some(s.id));
    assert_eq!(
        store.gateway_session(&GatewayKey::new(ACCESS, GW), &s.tuple),
        Some(s.id)
    );
    assert_eq!(store.user_session_ids("default"), vec![s.id]);
    assert_eq!(store.interface_session_ids(&ACCESS_IF), vec![s.id]);
    assert_eq!(store.processor_session_ids(DP), vec![s.id]);
    assert_eq!(s.client_route, Some(client_route()));

    assert_eq!(
        actions,
        vec![
            StoreAction::InstallRoute {
                key: client_route(),
                interface: CORE_IF,
                next_hop: Ipv4Addr::new(198, 51, 100, 1),
            },
            StoreAction::AddTunnel {
                dp: DP,
                tunnel: s.gre_tunnel(),
            },
        ]
    );
}

#[test]
fn test_failed_insert_rolls_back() {
    let h = fixture();
    let store = h.orch.store();
    let handle = session(10, 1000);
    let tuple = handle.lock().tuple;
    store.users.update(&"default".to_string(), |u| {
        u.sessions.insert(tuple, SessionId(999));
    });

    let err = register(store, &handle).unwrap_err();
    assert!(matches!(
        err,
        GatewayError::DuplicateSession {
            index: SessionIndex::User
        }
    ));
    assert_eq!(store.vrf_session(ACCESS, 100), None);
    assert_eq!(store.gateway_session(&GatewayKey::new(ACCESS, GW), &tuple), None);
    assert_eq!(store.vrfs.lookup(&ACCESS, |v| v.cursor), Some(100));
    assert_eq!(store.vrfs.lookup(&ACCESS, |v| v.counters), Some(SessionCounters::default()));
    assert!(store.routes.lookup(&client_route(), |_| ()).is_none());
    assert!(store.session(SessionId(10)).is_none());
}

#[test]
fn test_register_rejects_dead_references() {
    let h = fixture();
    let store = h.orch.store();
    store.interfaces.update(&CORE_IF, |i| i.admin_up = false);
    assert!(matches!(
        register(store, &session(10, 1000)),
        Err(GatewayError::InterfaceNotFound(key)) if key == CORE_IF
    ));

    store.interfaces.update(&CORE_IF, |i| i.admin_up = true);
    store.users.update(&"default".to_string(), |u| u.deleting = true);
    assert!(matches!(
        register(store, &session(10, 1000)),
        Err(GatewayError::UserNotFound(_))
    ));
}

#[test]
fn test_counters_are_symmetric() {
    let h = fixture();
    let store = h.orch.store();
    let a = session(10, 1000);
    let b = session(11, 1001);
    register(store, &a).unwrap();
    register(store, &b).unwrap();
    {
        let mut s = a.lock();
        s.state = SessionState::Up;
        store.set_session_active(&s, true);
    }

    let counters = |store: &SessionStore| {
        (
            store.vrfs.lookup(&ACCESS, |v| v.counters).unwrap(),
            store.vrfs.lookup(&CORE, |v| v.counters).unwrap(),
            store.users.lookup(&"default".to_string(), |u| u.counters).unwrap(),
            store.processors.lookup(&DP, |p| p.counters).unwrap(),
            store.interfaces.lookup(&CORE_IF, |i| i.counters).unwrap(),
        )
    };
    let (access, core, user, dp, iface) = counters(store);
    for c in [access, core, user, dp, iface] {
        assert_eq!(c, SessionCounters { sessions: 2, active: 1 });
    }

    unregister(store, &a);
    unregister(store, &b);
    let (access, core, user, dp, iface) = counters(store);
    for c in [access, core, user, dp, iface] {
        assert_eq!(c, SessionCounters::default());
    }
    assert!(store.sessions.is_empty());
}

#[test]
fn test_shared_route_and_tunnel() {
    let h = fixture();
    let store = h.orch.store();
    let a = session(10, 1000);
    let b = session(11, 1001);
    let first = register(store, &a).unwrap();
    let second = register(store, &b).unwrap();
    assert_eq!(first.len(), 2);
    assert!(second.is_empty());
    assert_eq!(store.routes.lookup(&client_route(), |r| r.refs.count()), Some(2));

    assert!(unregister(store, &a).is_empty());
    let tunnel = a.lock().gre_tunnel();
    // The route is still pending; its install reply triggers the delete.
    assert_eq!(
        unregister(store, &b),
        vec![StoreAction::DelTunnel { dp: DP, tunnel }]
    );
    assert_eq!(
        store.route_programmed(&client_route(), true, true),
        vec![StoreAction::RemoveRoute { key: client_route() }]
    );
    assert!(store.route_programmed(&client_route(), false, true).is_empty());
    assert!(store.routes.lookup(&client_route(), |_| ()).is_none());
}

#[test]
fn test_route_revived_during_delete() {
    let h = fixture();
    let store = h.orch.store();
    let a = session(10, 1000);
    register(store, &a).unwrap();
    store.route_programmed(&client_route(), true, true);
    let actions = unregister(store, &a);
    assert!(actions.contains(&StoreAction::RemoveRoute { key: client_route() }));

    // A new session needs the route while its delete is in flight.
    let b = session(11, 1001);
    let actions = register(store, &b).unwrap();
    assert!(!actions
        .iter()
        .any(|a| matches!(a, StoreAction::InstallRoute { .. })));

    assert_eq!(
        store.route_programmed(&client_route(), false, true),
        vec![StoreAction::InstallRoute {
            key: client_route(),
            interface: CORE_IF,
            next_hop: Ipv4Addr::new(198, 51, 100, 1),
        }]
    );
    assert_eq!(
        store.routes.lookup(&client_route(), |r| r.state),
        Some(ProgrammingState::Pending)
    );
}

#[test]
fn test_interface_removal_waits_for_route() {
    let h = fixture();
    let store = h.orch.store();
    let own = RouteKey::host(ACCESS, Ipv4Addr::new(192, 0, 2, 1));
    let actions = store.begin_interface_removal(&ACCESS_IF).unwrap();
    assert_eq!(
        actions,
        vec![
            StoreAction::DeleteNextHop {
                interface: ACCESS_IF,
                vrf: ACCESS,
                ip: Ipv4Addr::new(192, 0, 2, 1),
            },
            StoreAction::RemoveRoute { key: own },
        ]
    );

    store.next_hop_deleted(&ACCESS_IF);
    assert!(store.interfaces.contains(&ACCESS_IF));
    store.route_programmed(&own, false, true);
    assert!(!store.interfaces.contains(&ACCESS_IF));
    assert_eq!(store.processors.lookup(&DP, |p| p.interfaces.len()), Some(1));
}

#[test]
fn test_session_ids_skip_taken() {
    let h = fixture();
    let store = h.orch.store();
    let first = store.next_session_id();
    assert_ne!(first.0, 0);
    let handle = session(first.0 + 1, 1000);
    register(store, &handle).unwrap();
    assert_eq!(store.next_session_id(), SessionId(first.0 + 2));
}
