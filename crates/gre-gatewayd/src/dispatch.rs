//! Hands received datagrams to worker queues.
//!
//! The dispatcher first tries every queue without blocking and gives the
//! buffer to the first one it can lock. Only if all of them are busy does
//! it block, on the queue holding the fewest buffers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::buffer::{Buffer, BufferPool, Custody};

/// Inbound queue of one worker.
#[derive(Debug)]
pub struct WorkQueue {
    id: usize,
    queue: Mutex<VecDeque<Buffer>>,
    ready: Condvar,
    depth: AtomicUsize,
    closed: AtomicBool,
}

impl WorkQueue {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            depth: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Buffers waiting in the queue.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn lock(&self) -> MutexGuard<'_, VecDeque<Buffer>> {
        self.queue.lock()
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, VecDeque<Buffer>>> {
        self.queue.try_lock()
    }

    fn push_locked(&self, queue: &mut VecDeque<Buffer>, mut buffer: Buffer) {
        buffer.custody = Custody::Queue(self.id);
        queue.push_back(buffer);
        self.depth.store(queue.len(), Ordering::Relaxed);
    }

    /// Stops the worker once the queue is drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.queue.lock();
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for work and takes everything queued.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop_batch(&self, timeout: Duration) -> Option<Vec<Buffer>> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            if self.is_closed() {
                return None;
            }
            self.ready.wait_for(&mut queue, timeout);
        }
        if queue.is_empty() && self.is_closed() {
            return None;
        }
        let batch: Vec<Buffer> = queue.drain(..).collect();
        self.depth.store(0, Ordering::Relaxed);
        Some(batch)
    }
}

/// Spreads buffers over the worker queues.
#[derive(Debug)]
pub struct Dispatcher {
    queues: Vec<Arc<WorkQueue>>,
    pool: Arc<BufferPool>,
}

impl Dispatcher {
    pub fn new(queues: Vec<Arc<WorkQueue>>, pool: Arc<BufferPool>) -> Self {
        Self { queues, pool }
    }

    pub fn queues(&self) -> &[Arc<WorkQueue>] {
        &self.queues
    }

    /// Total buffers waiting across all queues.
    pub fn queued(&self) -> usize {
        self.queues.iter().map(|q| q.depth()).sum()
    }

    /// Queues `buffer` and wakes the chosen worker. Returns its index, or
    /// `None` if there are no workers and the buffer went back to the pool.
    pub fn dispatch(&self, buffer: Buffer) -> Option<usize> {
        let mut least: Option<&Arc<WorkQueue>> = None;
        for queue in &self.queues {
            if let Some(mut guard) = queue.try_lock() {
                queue.push_locked(&mut guard, buffer);
                drop(guard);
                queue.ready.notify_one();
                trace!(worker = queue.id, "Dispatched without contention");
                return Some(queue.id);
            }
            if least.map_or(true, |l| queue.depth() < l.depth()) {
                least = Some(queue);
            }
        }

        let Some(queue) = least else {
            warn!("No worker queues, datagram dropped");
            self.pool.release(buffer);
            return None;
        };
        let mut guard = queue.lock();
        queue.push_locked(&mut guard, buffer);
        drop(guard);
        queue.ready.notify_one();
        trace!(worker = queue.id, "Dispatched to least loaded queue");
        Some(queue.id)
    }
}
