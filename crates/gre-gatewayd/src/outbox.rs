//! Outbound signaling toward GRE gateways.
//!
//! Replies for one gateway are packed into a single datagram. A change of
//! destination or a message that would overflow the datagram flushes what
//! is buffered first.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::proto::signaling::{SignalMessage, MESSAGE_LEN};
use crate::store::VrfId;

/// Sends signaling datagrams on a VRF's socket.
pub trait SignalingTransport: Send + Sync {
    fn send_to(&self, vrf: VrfId, dest: SocketAddrV4, datagram: &[u8]) -> io::Result<()>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSignaling;

impl SignalingTransport for NullSignaling {
    fn send_to(&self, _vrf: VrfId, _dest: SocketAddrV4, _datagram: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Opens a non-blocking UDP socket for a VRF's signaling address.
pub fn bind_signaling_socket(addr: SocketAddrV4) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    Ok(socket.into())
}

/// Signaling over the VRFs' own UDP sockets.
#[derive(Default)]
pub struct UdpSignaling {
    sockets: RwLock<HashMap<VrfId, Arc<UdpSocket>>>,
}

impl UdpSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, vrf: VrfId, socket: Arc<UdpSocket>) {
        self.sockets.write().insert(vrf, socket);
    }

    pub fn unregister(&self, vrf: VrfId) -> Option<Arc<UdpSocket>> {
        self.sockets.write().remove(&vrf)
    }

    pub fn socket(&self, vrf: VrfId) -> Option<Arc<UdpSocket>> {
        self.sockets.read().get(&vrf).cloned()
    }
}

impl fmt::Debug for UdpSignaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSignaling")
            .field("sockets", &self.sockets.read().len())
            .finish()
    }
}

impl SignalingTransport for UdpSignaling {
    fn send_to(&self, vrf: VrfId, dest: SocketAddrV4, datagram: &[u8]) -> io::Result<()> {
        let socket = self.socket(vrf).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, format!("VRF {vrf} has no socket"))
        })?;
        socket.send_to(datagram, dest).map(|_| ())
    }
}

struct Pending {
    dest: Option<SocketAddrV4>,
    bytes: Vec<u8>,
    count: usize,
}

/// Coalescing reply buffer of one VRF.
pub struct GatewayOutbox {
    vrf: VrfId,
    max_datagram: usize,
    transport: Arc<dyn SignalingTransport>,
    pending: Mutex<Pending>,
    sent: AtomicU64,
    errors: AtomicU64,
}

impl fmt::Debug for GatewayOutbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayOutbox")
            .field("vrf", &self.vrf)
            .field("max_datagram", &self.max_datagram)
            .finish()
    }
}

impl GatewayOutbox {
    pub fn new(vrf: VrfId, transport: Arc<dyn SignalingTransport>, max_datagram: usize) -> Self {
        let max_datagram = max_datagram.max(MESSAGE_LEN);
        Self {
            vrf,
            max_datagram,
            transport,
            pending: Mutex::new(Pending {
                dest: None,
                bytes: Vec::with_capacity(max_datagram),
                count: 0,
            }),
            sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn vrf(&self) -> VrfId {
        self.vrf
    }

    /// Queues a message for `dest`.
    pub fn push(&self, dest: SocketAddrV4, msg: &SignalMessage) {
        let mut pending = self.pending.lock();
        let switch = pending.dest.is_some_and(|d| d != dest);
        if switch || pending.bytes.len() + MESSAGE_LEN > self.max_datagram {
            self.send_locked(&mut pending);
        }
        pending.dest = Some(dest);
        msg.encode(&mut pending.bytes);
        pending.count += 1;
        trace!(vrf = %self.vrf, gateway = %dest, msg_type = %msg.msg_type, "Queued signaling reply");
    }

    pub fn flush(&self) {
        let mut pending = self.pending.lock();
        self.send_locked(&mut pending);
    }

    /// Datagrams sent so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn send_locked(&self, pending: &mut Pending) {
        let Some(dest) = pending.dest else {
            return;
        };
        if pending.bytes.is_empty() {
            return;
        }
        match self.transport.send_to(self.vrf, dest, &pending.bytes) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                debug!(vrf = %self.vrf, gateway = %dest, messages = pending.count, "Sent signaling datagram");
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(vrf = %self.vrf, gateway = %dest, error = %e, "Signaling send failed");
            }
        }
        pending.bytes.clear();
        pending.count = 0;
        pending.dest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::signaling::{MessageType, Messages};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(SocketAddrV4, Vec<u8>)>>,
    }

    impl SignalingTransport for Capture {
        fn send_to(&self, _vrf: VrfId, dest: SocketAddrV4, datagram: &[u8]) -> io::Result<()> {
            self.sent.lock().push((dest, datagram.to_vec()));
            Ok(())
        }
    }

    fn gw(n: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, n), 2152)
    }

    #[test]
    fn test_same_gateway_is_coalesced() {
        let capture = Arc::new(Capture::default());
        let outbox = GatewayOutbox::new(VrfId(1), capture.clone(), 1400);
        outbox.push(gw(1), &SignalMessage::new(MessageType::Transmit, 1));
        outbox.push(gw(1), &SignalMessage::new(MessageType::Done, 2));
        outbox.flush();

        let sent = capture.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(Messages::new(&sent[0].1).count(), 2);
    }

    #[test]
    fn test_destination_change_flushes() {
        let capture = Arc::new(Capture::default());
        let outbox = GatewayOutbox::new(VrfId(1), capture.clone(), 1400);
        outbox.push(gw(1), &SignalMessage::new(MessageType::Hello, 1));
        outbox.push(gw(2), &SignalMessage::new(MessageType::Hello, 2));
        outbox.flush();

        let dests: Vec<_> = capture.sent.lock().iter().map(|(d, _)| *d).collect();
        assert_eq!(dests, vec![gw(1), gw(2)]);
    }

    #[test]
    fn test_overflow_flushes() {
        let capture = Arc::new(Capture::default());
        let outbox = GatewayOutbox::new(VrfId(1), capture.clone(), 2 * MESSAGE_LEN);
        for id in 0..5 {
            outbox.push(gw(1), &SignalMessage::new(MessageType::Err, id));
        }
        outbox.flush();

        let sizes: Vec<_> = capture.sent.lock().iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![88, 88, 44]);
        assert_eq!(outbox.sent(), 3);
    }

    #[test]
    fn test_empty_flush_sends_nothing() {
        let capture = Arc::new(Capture::default());
        let outbox = GatewayOutbox::new(VrfId(1), capture.clone(), 1400);
        outbox.flush();
        assert!(capture.sent.lock().is_empty());
    }

    #[test]
    fn test_udp_signaling_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = match receiver.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => unreachable!(),
        };
        let signaling = UdpSignaling::new();
        let socket = bind_signaling_socket(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        signaling.register(VrfId(3), Arc::new(socket));

        signaling.send_to(VrfId(3), dest, b"ping").unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(signaling.send_to(VrfId(4), dest, b"x").is_err());
    }
}
