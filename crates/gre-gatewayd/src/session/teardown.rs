//! Session teardown: gateway-requested ends, processor confirmations and
//! cascades triggered by removal of an entity sessions depend on.

use tracing::{debug, error, info, warn};

use super::admission::session_body;
use super::{Batch, Origin, SessionOrch, SessionOrchStats};
use crate::proto::provision::{MessageKind, SubMessage, SubType};
use crate::proto::signaling::{ErrorCode, MessageType, SignalMessage};
use crate::store::{DpId, PendingReply, Session, SessionId, SessionState};

/// How a cascade informs the gateway owning a torn-down session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notify {
    /// The gateway or its VRF is gone; nobody to tell.
    Silent,
    /// Tell the gateway why.
    Peer(ErrorCode),
}

/// Signaling message addressed to the gateway of `s`.
fn to_gateway(s: &Session, msg_type: MessageType, msg_id: u32, code: ErrorCode) -> SignalMessage {
    let mut msg = SignalMessage::new(msg_type, msg_id);
    msg.error = code;
    msg.tuple = s.tuple;
    msg.gw_key = s.ingress.peer_key;
    msg.engine_key = s.ingress.key;
    msg.gw_tunnel_ip = s.ingress.peer_ip;
    msg.engine_tunnel_ip = s.ingress.local_ip;
    msg
}

fn pending_reply(s: &Session, reply: PendingReply) -> SignalMessage {
    match reply {
        PendingReply::Done(id) => to_gateway(s, MessageType::Done, id, ErrorCode::Ok),
        PendingReply::ErrAck(id) => to_gateway(s, MessageType::Err, id, ErrorCode::Ok),
    }
}

impl SessionOrch {
    /// SESSION_END_REQ and ERR_REQ.
    pub(super) fn session_end(&self, origin: &Origin, msg: &SignalMessage, batch: &mut Batch) {
        let handle = self
            .store
            .gateway_session(&origin.gateway(), &msg.tuple)
            .and_then(|id| self.store.session(id));
        let Some(handle) = handle else {
            debug!(gateway = %origin.src, tuple = %msg.tuple, "End for unknown session");
            origin.reply(&msg.reply(MessageType::Err, ErrorCode::NoSession), batch);
            return;
        };

        let mut s = handle.lock();
        if s.state == SessionState::Cleared {
            origin.reply(&msg.reply(MessageType::Err, ErrorCode::NoSession), batch);
            return;
        }
        if s.state == SessionState::Down || s.last_msg_id == Some(msg.msg_id) {
            debug!(session = %s.id, msg_id = msg.msg_id, "Repeated end ignored");
            return;
        }

        let reply = match msg.msg_type {
            MessageType::ErrReq => PendingReply::ErrAck(msg.msg_id),
            _ => PendingReply::Done(msg.msg_id),
        };
        s.last_msg_id = Some(msg.msg_id);
        s.pending_reply = Some(reply);
        s.reply_to = origin.src;
        self.begin_delete(&mut s, batch);
        if s.state == SessionState::Cleared {
            origin.reply(&pending_reply(&s, reply), batch);
        }
    }

    /// Moves a session to DOWN and asks its processor to delete it. Without
    /// a live processor the session is cleared on the spot.
    fn begin_delete(&self, s: &mut Session, batch: &mut Batch) {
        let was_active = s.is_active();
        s.state = SessionState::Down;
        if was_active {
            self.store.set_session_active(s, false);
        }

        let sub = SubMessage::session(SubType::DelGreSession, session_body(s));
        let queued = self
            .live_client(s.processor)
            .map(|client| client.enqueue(MessageKind::Request, &sub).map(|()| client));
        match queued {
            Some(Ok(client)) => {
                batch.touch_processor(&client);
                SessionOrchStats::bump(&self.stats.provision_deletes);
                debug!(session = %s.id, dp = %s.processor, "Session delete requested");
            }
            Some(Err(e)) => {
                warn!(session = %s.id, dp = %s.processor, error = %e, "Provisioning delete failed");
                self.clear(s, batch);
            }
            None => self.clear(s, batch),
        }
    }

    /// Processor confirmation of a session add or delete.
    pub(super) fn session_reply(
        &self,
        dp: DpId,
        sub_type: SubType,
        ok: bool,
        context: u32,
        batch: &mut Batch,
    ) {
        let id = SessionId(context);
        let Some(handle) = self.store.session(id) else {
            debug!(dp = %dp, session = %id, sub_type = %sub_type, "Reply for unknown session");
            return;
        };
        let mut s = handle.lock();
        if s.processor != dp {
            warn!(dp = %dp, session = %id, owner = %s.processor, "Reply from foreign processor");
            return;
        }

        match (sub_type, s.state) {
            (SubType::AddGreSession, SessionState::Init) if ok => {
                s.state = SessionState::Up;
                self.store.set_session_active(&s, true);
                let msg = to_gateway(&s, MessageType::Transmit, s.init_msg_id, ErrorCode::Ok);
                self.reply_to_gateway(&s, &msg, batch);
                debug!(session = %id, key = s.ingress.key, "Session up");
            }
            (SubType::AddGreSession, SessionState::Init) => {
                SessionOrchStats::bump(&self.stats.processor_failures);
                warn!(dp = %dp, session = %id, "Processor rejected session");
                s.state = SessionState::Fail;
                let msg = to_gateway(
                    &s,
                    MessageType::Err,
                    s.init_msg_id,
                    ErrorCode::ProcessorFailure,
                );
                self.reply_to_gateway(&s, &msg, batch);
                self.clear(&mut s, batch);
            }
            (SubType::DelGreSession, SessionState::Down) => {
                if !ok {
                    SessionOrchStats::bump(&self.stats.processor_failures);
                    warn!(dp = %dp, session = %id, "Processor failed to delete session");
                }
                if let Some(reply) = s.pending_reply.take() {
                    self.reply_to_gateway(&s, &pending_reply(&s, reply), batch);
                }
                self.clear(&mut s, batch);
            }
            (sub_type, state) => {
                debug!(session = %id, sub_type = %sub_type, state = %state, ok, "Stale processor reply ignored");
            }
        }
    }

    fn reply_to_gateway(&self, s: &Session, msg: &SignalMessage, batch: &mut Batch) {
        match self.vrf_outbox(s.vrf) {
            Some(outbox) => {
                outbox.push(s.reply_to, msg);
                batch.touch_outbox(&outbox);
            }
            None => debug!(session = %s.id, vrf = %s.vrf, "No outbox, reply dropped"),
        }
    }

    /// Removes the session from every index and releases what it holds.
    /// The handle stays valid but is marked CLEARED.
    pub(crate) fn clear(&self, s: &mut Session, batch: &mut Batch) {
        if s.state == SessionState::Cleared {
            return;
        }
        let actions = self.store.unregister_session(s, s.is_active());
        s.state = SessionState::Cleared;
        SessionOrchStats::bump(&self.stats.sessions_cleared);
        self.apply(actions, batch);
        debug!(session = %s.id, "Session cleared");
    }

    /// Tears down the given sessions, notifying their gateways as asked.
    /// Returns how many were cleared.
    pub(crate) fn teardown_sessions(
        &self,
        ids: &[SessionId],
        notify: Notify,
        batch: &mut Batch,
    ) -> usize {
        let mut cleared = 0;
        for id in ids {
            let Some(handle) = self.store.session(*id) else {
                continue;
            };
            let mut s = handle.lock();
            if s.state == SessionState::Cleared {
                continue;
            }

            if s.state != SessionState::Down {
                if let Some(client) = self.live_client(s.processor) {
                    let sub = SubMessage::session(SubType::DelGreSession, session_body(&s));
                    match client.enqueue(MessageKind::Request, &sub) {
                        Ok(()) => {
                            batch.touch_processor(&client);
                            SessionOrchStats::bump(&self.stats.provision_deletes);
                        }
                        Err(e) => {
                            warn!(session = %id, dp = %s.processor, error = %e, "Provisioning delete failed")
                        }
                    }
                }
            }

            if let Notify::Peer(code) = notify {
                let msg = match (s.state, s.pending_reply) {
                    (SessionState::Up, _) => {
                        Some(to_gateway(&s, MessageType::ErrReq, s.init_msg_id, code))
                    }
                    (SessionState::Down, Some(reply)) => Some(pending_reply(&s, reply)),
                    (SessionState::Down, None) => None,
                    _ => Some(to_gateway(&s, MessageType::Err, s.init_msg_id, code)),
                };
                if let Some(msg) = msg {
                    self.reply_to_gateway(&s, &msg, batch);
                }
            }

            self.clear(&mut s, batch);
            cleared += 1;
        }
        cleared
    }

    /// Repeats `teardown_sessions` over `collect()` until nothing is left.
    pub(crate) fn drain_sessions(
        &self,
        what: &str,
        mut collect: impl FnMut() -> Vec<SessionId>,
        notify: Notify,
        batch: &mut Batch,
    ) -> usize {
        let mut total = 0;
        loop {
            let ids = collect();
            if ids.is_empty() {
                break;
            }
            let cleared = self.teardown_sessions(&ids, notify, batch);
            if cleared == 0 {
                error!(what, remaining = ids.len(), "Sessions stuck in index");
                break;
            }
            total += cleared;
        }
        if total > 0 {
            info!(what, sessions = total, "Sessions torn down");
        }
        total
    }
}
