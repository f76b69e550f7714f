//! VRF to receive-thread affinity.
//!
//! Each VRF socket is read by exactly one receive thread. New sockets go
//! to the live thread owning the fewest. Threads learn about changes
//! through a request queue and a poll waker, and apply them between polls.
//!
//! A thread that dies or is retired hands every VRF it still owns to the
//! others, including attaches queued after it last looked at its queue.
//! The owners lock orders placement against retirement.

use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::store::VrfId;

/// A change to a receive thread's socket set.
#[derive(Debug)]
pub enum AffinityRequest {
    Attach { vrf: VrfId, socket: Arc<UdpSocket> },
    Detach { vrf: VrfId },
}

/// Scheduler-side view of one receive thread.
#[derive(Debug)]
pub struct ReceiveSlot {
    id: usize,
    alive: AtomicBool,
    retiring: AtomicBool,
    owned: AtomicUsize,
    requests: Mutex<VecDeque<AffinityRequest>>,
    waker: mio::Waker,
}

impl ReceiveSlot {
    pub fn new(id: usize, waker: mio::Waker) -> Self {
        Self {
            id,
            alive: AtomicBool::new(true),
            retiring: AtomicBool::new(false),
            owned: AtomicUsize::new(0),
            requests: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Set once the thread has been told to hand its sockets over and exit.
    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }

    fn accepts_sockets(&self) -> bool {
        self.is_alive() && !self.is_retiring()
    }

    /// Sockets assigned to the thread.
    pub fn owned(&self) -> usize {
        self.owned.load(Ordering::Relaxed)
    }

    fn push(&self, request: AffinityRequest) {
        self.requests.lock().push_back(request);
        self.wake();
    }

    /// Interrupts the thread's current poll.
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(thread = self.id, error = %e, "Failed to wake receive thread");
        }
    }

    /// Takes every pending request.
    pub fn take_requests(&self) -> Vec<AffinityRequest> {
        self.requests.lock().drain(..).collect()
    }
}

/// Assigns VRF sockets to receive threads.
#[derive(Debug, Default)]
pub struct Scheduler {
    slots: RwLock<Vec<Arc<ReceiveSlot>>>,
    owners: Mutex<HashMap<VrfId, usize>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_slot(&self, slot: Arc<ReceiveSlot>) {
        self.slots.write().push(slot);
    }

    /// Interrupts every receive thread's poll.
    pub fn wake_all(&self) {
        for slot in self.slots.read().iter() {
            slot.wake();
        }
    }

    /// Receive thread currently owning `vrf`.
    pub fn owner(&self, vrf: VrfId) -> Option<usize> {
        self.owners.lock().get(&vrf).copied()
    }

    fn least_loaded(&self) -> Option<Arc<ReceiveSlot>> {
        self.slots
            .read()
            .iter()
            .filter(|s| s.accepts_sockets())
            .min_by_key(|s| (s.owned(), s.id))
            .cloned()
    }

    fn slot(&self, id: usize) -> Option<Arc<ReceiveSlot>> {
        self.slots.read().iter().find(|s| s.id == id).cloned()
    }

    /// Hands `socket` to the least loaded live receive thread.
    pub fn attach(&self, vrf: VrfId, socket: Arc<UdpSocket>) -> Result<usize> {
        let mut owners = self.owners.lock();
        if let Some(id) = owners.get(&vrf) {
            return Err(GatewayError::internal(format!(
                "VRF {vrf} already attached to receive thread {id}"
            )));
        }
        let slot = self
            .least_loaded()
            .ok_or_else(|| GatewayError::internal("no live receive thread"))?;
        slot.owned.fetch_add(1, Ordering::Relaxed);
        owners.insert(vrf, slot.id);
        slot.push(AffinityRequest::Attach { vrf, socket });
        debug!(vrf = %vrf, thread = slot.id, "VRF socket attached");
        Ok(slot.id)
    }

    /// Stops reading `vrf`'s socket. Returns false if it was not attached.
    pub fn detach(&self, vrf: VrfId) -> bool {
        let Some(id) = self.owners.lock().remove(&vrf) else {
            return false;
        };
        if let Some(slot) = self.slot(id) {
            let _ = slot
                .owned
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
            slot.push(AffinityRequest::Detach { vrf });
        }
        debug!(vrf = %vrf, thread = id, "VRF socket detached");
        true
    }

    /// Marks receive thread `id` for shutdown.
    ///
    /// The thread takes no new sockets from now on. At its next wake-up it
    /// exits and migrates what it owns. Fails if no other thread could take
    /// the sockets over.
    pub fn retire(&self, id: usize) -> Result<()> {
        let _owners = self.owners.lock();
        let slots = self.slots.read();
        let slot = slots
            .iter()
            .find(|s| s.id == id && s.accepts_sockets())
            .ok_or_else(|| GatewayError::internal(format!("receive thread {id} is not running")))?;
        if !slots.iter().any(|s| s.id != id && s.accepts_sockets()) {
            return Err(GatewayError::internal(format!(
                "receive thread {id} is the last live receive thread"
            )));
        }
        slot.retiring.store(true, Ordering::Release);
        slot.wake();
        info!(thread = id, owned = slot.owned(), "Receive thread retiring");
        Ok(())
    }

    /// Takes receive thread `from` out of service and moves its sockets to
    /// the others.
    ///
    /// `sockets` are the ones the thread had attached. Requests still in its
    /// queue are applied on top, so an attach that raced with the thread's
    /// exit is migrated too. Returns the VRFs that could not be placed.
    pub fn migrate(&self, from: usize, mut sockets: Vec<(VrfId, Arc<UdpSocket>)>) -> Vec<VrfId> {
        {
            let mut owners = self.owners.lock();
            if let Some(slot) = self.slot(from) {
                slot.alive.store(false, Ordering::Release);
                slot.owned.store(0, Ordering::Relaxed);
                for request in slot.take_requests() {
                    match request {
                        AffinityRequest::Attach { vrf, socket } => sockets.push((vrf, socket)),
                        AffinityRequest::Detach { vrf } => sockets.retain(|(v, _)| *v != vrf),
                    }
                }
            }
            sockets.retain(|(vrf, _)| owners.get(vrf) == Some(&from));
            for (vrf, _) in &sockets {
                owners.remove(vrf);
            }
        }

        let mut orphaned = Vec::new();
        for (vrf, socket) in sockets {
            match self.attach(vrf, socket) {
                Ok(to) => info!(vrf = %vrf, from, to, "VRF socket migrated"),
                Err(_) => orphaned.push(vrf),
            }
        }
        if !orphaned.is_empty() {
            warn!(from, vrfs = orphaned.len(), "No receive thread left for VRF sockets");
        }
        orphaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn slot(id: usize) -> Arc<ReceiveSlot> {
        let poll = mio::Poll::new().unwrap();
        let waker = mio::Waker::new(poll.registry(), mio::Token(0)).unwrap();
        Arc::new(ReceiveSlot::new(id, waker))
    }

    fn socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap())
    }

    #[test]
    fn test_attach_balances_threads() {
        let scheduler = Scheduler::new();
        scheduler.add_slot(slot(0));
        scheduler.add_slot(slot(1));

        let placed: Vec<usize> = (1..=4)
            .map(|v| scheduler.attach(VrfId(v), socket()).unwrap())
            .collect();
        assert_eq!(placed, vec![0, 1, 0, 1]);
        assert!(scheduler.attach(VrfId(1), socket()).is_err());
    }

    #[test]
    fn test_detach_queues_request() {
        let scheduler = Scheduler::new();
        let s0 = slot(0);
        scheduler.add_slot(s0.clone());
        scheduler.attach(VrfId(7), socket()).unwrap();
        assert!(scheduler.detach(VrfId(7)));
        assert!(!scheduler.detach(VrfId(7)));

        let requests = s0.take_requests();
        assert_eq!(requests.len(), 2);
        assert!(matches!(requests[1], AffinityRequest::Detach { vrf: VrfId(7) }));
        assert_eq!(s0.owned(), 0);
    }

    #[test]
    fn test_migrate_moves_sockets() {
        let scheduler = Scheduler::new();
        let s0 = slot(0);
        scheduler.add_slot(s0.clone());
        scheduler.add_slot(slot(1));
        let sock = socket();
        assert_eq!(scheduler.attach(VrfId(1), sock.clone()).unwrap(), 0);

        let orphaned = scheduler.migrate(0, vec![(VrfId(1), sock)]);
        assert!(orphaned.is_empty());
        assert_eq!(scheduler.owner(VrfId(1)), Some(1));
        assert!(!s0.is_alive());
    }

    #[test]
    fn test_migrate_picks_up_queued_attach() {
        let scheduler = Scheduler::new();
        let s0 = slot(0);
        scheduler.add_slot(s0.clone());
        scheduler.add_slot(slot(1));
        let sock = socket();
        assert_eq!(scheduler.attach(VrfId(1), sock.clone()).unwrap(), 0);
        assert_eq!(scheduler.attach(VrfId(2), socket()).unwrap(), 1);
        // Thread 0 has applied its queue and is about to exit when another
        // VRF lands on it.
        assert_eq!(s0.take_requests().len(), 1);
        assert_eq!(scheduler.attach(VrfId(3), socket()).unwrap(), 0);

        let orphaned = scheduler.migrate(0, vec![(VrfId(1), sock)]);
        assert!(orphaned.is_empty());
        assert_eq!(scheduler.owner(VrfId(1)), Some(1));
        assert_eq!(scheduler.owner(VrfId(3)), Some(1));
        assert!(s0.take_requests().is_empty());
    }

    #[test]
    fn test_migrate_honours_queued_detach() {
        let scheduler = Scheduler::new();
        let s0 = slot(0);
        scheduler.add_slot(s0.clone());
        let s1 = slot(1);
        scheduler.add_slot(s1.clone());
        scheduler.attach(VrfId(4), socket()).unwrap();
        assert!(scheduler.detach(VrfId(4)));

        assert!(scheduler.migrate(0, Vec::new()).is_empty());
        assert_eq!(scheduler.owner(VrfId(4)), None);
        assert!(s1.take_requests().is_empty());
    }

    #[test]
    fn test_retired_thread_takes_no_new_sockets() {
        let scheduler = Scheduler::new();
        let s0 = slot(0);
        scheduler.add_slot(s0.clone());
        scheduler.add_slot(slot(1));
        scheduler.retire(0).unwrap();
        assert!(s0.is_retiring());

        let placed: Vec<usize> = (1..=3)
            .map(|v| scheduler.attach(VrfId(v), socket()).unwrap())
            .collect();
        assert_eq!(placed, vec![1, 1, 1]);
        assert!(scheduler.retire(0).is_err());
        // The survivor cannot retire as well.
        assert!(scheduler.retire(1).is_err());
    }

    #[test]
    fn test_migrate_without_survivors() {
        let scheduler = Scheduler::new();
        scheduler.add_slot(slot(0));
        let sock = socket();
        scheduler.attach(VrfId(2), sock.clone()).unwrap();
        assert_eq!(scheduler.migrate(0, vec![(VrfId(2), sock)]), vec![VrfId(2)]);
        assert_eq!(scheduler.owner(VrfId(2)), None);
    }
}
