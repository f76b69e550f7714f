//! Forwarding processor client.
//!
//! Each processor connection has one coalescing send buffer. Sub-messages
//! are appended until the buffer would overflow, the message kind changes
//! or the sub-message count saturates; then the buffered message is sent
//! and a new one started. Workers flush explicitly once they finish a
//! datagram.

use std::fmt;
use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{GatewayError, Result};
use crate::proto::provision::{self, MessageKind, SubMessage, HEADER_LEN};
use crate::store::DpId;

/// A message-oriented connection to a forwarding processor.
pub trait ProcessorTransport: Send + Sync {
    /// Sends one complete provisioning message.
    fn send(&self, message: &[u8]) -> io::Result<()>;
}

/// Transport over a TCP stream.
pub struct TcpTransport {
    stream: Mutex<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }
}

impl ProcessorTransport for TcpTransport {
    fn send(&self, message: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(message)?;
        stream.flush()
    }
}

struct SendBuffer {
    kind: Option<MessageKind>,
    count: u8,
    bytes: Vec<u8>,
}

impl SendBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            kind: None,
            count: 0,
            bytes: Vec::with_capacity(capacity),
        }
    }

    fn reset(&mut self) {
        self.kind = None;
        self.count = 0;
        self.bytes.clear();
    }
}

/// Provisioning counters of one processor connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub sub_messages_sent: u64,
    pub send_errors: u64,
    /// Sub-messages lost to a failed send or a dropped connection.
    pub sub_messages_dropped: u64,
}

/// Outbound side of one forwarding processor.
pub struct ProcessorClient {
    dp: DpId,
    capacity: usize,
    max_subs: u8,
    transport: RwLock<Option<Arc<dyn ProcessorTransport>>>,
    buffer: Mutex<SendBuffer>,
    messages_sent: AtomicU64,
    sub_messages_sent: AtomicU64,
    send_errors: AtomicU64,
    sub_messages_dropped: AtomicU64,
}

impl fmt::Debug for ProcessorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorClient")
            .field("dp", &self.dp)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ProcessorClient {
    /// Creates a disconnected client.
    ///
    /// `capacity` is the largest message sent in one go and must hold at
    /// least a header and one session sub-message.
    pub fn new(dp: DpId, capacity: usize, max_subs: u8) -> Self {
        let min = HEADER_LEN + provision::SUB_HEADER_LEN + provision::SESSION_BODY_LEN;
        let capacity = capacity.max(min);
        Self {
            dp,
            capacity,
            max_subs: max_subs.max(1),
            transport: RwLock::new(None),
            buffer: Mutex::new(SendBuffer::new(capacity)),
            messages_sent: AtomicU64::new(0),
            sub_messages_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            sub_messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn dp(&self) -> DpId {
        self.dp
    }

    pub fn is_connected(&self) -> bool {
        self.transport.read().is_some()
    }

    /// Binds the client to a live connection.
    pub fn attach(&self, transport: Arc<dyn ProcessorTransport>) {
        self.buffer.lock().reset();
        *self.transport.write() = Some(transport);
    }

    /// Drops the connection and anything still buffered.
    pub fn detach(&self) {
        *self.transport.write() = None;
        let mut buffer = self.buffer.lock();
        if buffer.count > 0 {
            warn!(dp = %self.dp, dropped = buffer.count, "Discarding buffered sub-messages");
            self.sub_messages_dropped
                .fetch_add(u64::from(buffer.count), Ordering::Relaxed);
        }
        buffer.reset();
    }

    /// Appends a sub-message, flushing first if it does not fit.
    pub fn enqueue(&self, kind: MessageKind, sub: &SubMessage) -> Result<()> {
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or(GatewayError::ProcessorUnavailable(self.dp))?;

        let mut buffer = self.buffer.lock();
        let needs_flush = buffer.count > 0
            && (buffer.kind != Some(kind)
                || buffer.bytes.len() + sub.encoded_len() > self.capacity
                || buffer.count >= self.max_subs);
        if needs_flush {
            // On failure the buffered sub-messages of other sessions are gone
            // too. Those sessions fail once the connection is reported down.
            self.send_locked(&mut buffer, transport.as_ref())?;
        }

        if buffer.count == 0 {
            buffer.bytes.clear();
            buffer.bytes.resize(HEADER_LEN, 0);
            buffer.kind = Some(kind);
        }
        sub.encode(&mut buffer.bytes);
        buffer.count += 1;
        trace!(dp = %self.dp, sub_type = %sub.sub_type, count = buffer.count, "Queued sub-message");
        Ok(())
    }

    /// Sends the buffered message, if any.
    pub fn flush(&self) -> Result<()> {
        let transport = self.transport.read().clone();
        let mut buffer = self.buffer.lock();
        if buffer.count == 0 {
            return Ok(());
        }
        match transport {
            Some(transport) => self.send_locked(&mut buffer, transport.as_ref()),
            None => {
                self.sub_messages_dropped
                    .fetch_add(u64::from(buffer.count), Ordering::Relaxed);
                buffer.reset();
                Err(GatewayError::ProcessorUnavailable(self.dp))
            }
        }
    }

    /// Number of sub-messages waiting in the buffer.
    pub fn pending(&self) -> usize {
        usize::from(self.buffer.lock().count)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            sub_messages_sent: self.sub_messages_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            sub_messages_dropped: self.sub_messages_dropped.load(Ordering::Relaxed),
        }
    }

    fn send_locked(&self, buffer: &mut SendBuffer, transport: &dyn ProcessorTransport) -> Result<()> {
        let kind = buffer.kind.unwrap_or(MessageKind::Request);
        let count = buffer.count;
        let len = buffer.bytes.len() as u32;
        provision::write_header(&mut buffer.bytes, kind, count, len);
        let result = transport.send(&buffer.bytes);
        buffer.reset();
        match result {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.sub_messages_sent
                    .fetch_add(u64::from(count), Ordering::Relaxed);
                debug!(dp = %self.dp, count, bytes = len, "Flushed provisioning message");
                Ok(())
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                self.sub_messages_dropped
                    .fetch_add(u64::from(count), Ordering::Relaxed);
                warn!(dp = %self.dp, error = %e, dropped = count, "Provisioning send failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::provision::{ProvisionMessage, SubType};
    use crate::store::{TunnelKind, TunnelSpec, VrfId};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl ProcessorTransport for Capture {
        fn send(&self, message: &[u8]) -> io::Result<()> {
            self.sent.lock().push(message.to_vec());
            Ok(())
        }
    }

    fn tunnel(n: u8) -> SubMessage {
        SubMessage::tunnel(
            SubType::AddTunnel,
            TunnelSpec {
                kind: TunnelKind::Gre,
                vrf: VrfId(1),
                local_ip: Ipv4Addr::new(192, 0, 2, 1),
                peer_ip: Ipv4Addr::new(198, 51, 100, n),
            },
        )
    }

    fn client(capacity: usize, max_subs: u8) -> (ProcessorClient, Arc<Capture>) {
        let capture = Arc::new(Capture::default());
        let client = ProcessorClient::new(DpId(1), capacity, max_subs);
        client.attach(capture.clone());
        (client, capture)
    }

    #[test]
    fn test_enqueue_requires_connection() {
        let client = ProcessorClient::new(DpId(1), 1024, 8);
        let err = client.enqueue(MessageKind::Request, &tunnel(1)).unwrap_err();
        assert!(matches!(err, GatewayError::ProcessorUnavailable(DpId(1))));
    }

    #[test]
    fn test_coalesces_until_flush() {
        let (client, capture) = client(1024, 8);
        for n in 1..=3 {
            client.enqueue(MessageKind::Request, &tunnel(n)).unwrap();
        }
        assert!(capture.sent.lock().is_empty());
        client.flush().unwrap();

        let sent = capture.sent.lock();
        assert_eq!(sent.len(), 1);
        let msg = ProvisionMessage::decode(&sent[0]).unwrap();
        assert_eq!(msg.subs.len(), 3);
        assert_eq!(client.stats().sub_messages_sent, 3);
    }

    #[test]
    fn test_flushes_when_count_saturates() {
        let (client, capture) = client(4096, 2);
        for n in 1..=5 {
            client.enqueue(MessageKind::Request, &tunnel(n)).unwrap();
        }
        assert_eq!(capture.sent.lock().len(), 2);
        assert_eq!(client.pending(), 1);
    }

    #[test]
    fn test_flushes_before_overflow() {
        // Room for a header and exactly three tunnel sub-messages.
        let (client, capture) = client(HEADER_LEN + 3 * 20, 255);
        for n in 1..=4 {
            client.enqueue(MessageKind::Request, &tunnel(n)).unwrap();
        }
        let sent = capture.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), HEADER_LEN + 3 * 20);
        assert_eq!(client.pending(), 1);
    }

    #[test]
    fn test_kind_change_flushes() {
        let (client, capture) = client(4096, 255);
        client.enqueue(MessageKind::Request, &tunnel(1)).unwrap();
        client.enqueue(MessageKind::Reply, &tunnel(2)).unwrap();
        assert_eq!(capture.sent.lock().len(), 1);
        client.flush().unwrap();
        let sent = capture.sent.lock();
        assert_eq!(sent[1][0], MessageKind::Reply as u8);
    }

    struct Broken;

    impl ProcessorTransport for Broken {
        fn send(&self, _message: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }
    }

    #[test]
    fn test_failed_flush_counts_dropped_subs() {
        let client = ProcessorClient::new(DpId(1), 4096, 2);
        client.attach(Arc::new(Broken));
        client.enqueue(MessageKind::Request, &tunnel(1)).unwrap();
        client.enqueue(MessageKind::Request, &tunnel(2)).unwrap();

        let err = client.enqueue(MessageKind::Request, &tunnel(3)).unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
        assert_eq!(client.pending(), 0);
        let stats = client.stats();
        assert_eq!((stats.send_errors, stats.sub_messages_dropped), (1, 2));
        assert_eq!(stats.sub_messages_sent, 0);
    }

    #[test]
    fn test_detach_discards_buffer() {
        let (client, capture) = client(4096, 255);
        client.enqueue(MessageKind::Request, &tunnel(1)).unwrap();
        client.detach();
        assert!(!client.is_connected());
        assert_eq!(client.pending(), 0);
        assert!(capture.sent.lock().is_empty());
        assert_eq!(client.stats().sub_messages_dropped, 1);
    }
}
