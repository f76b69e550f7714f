//! Worker threads running the signaling state machine.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::buffer::{BufferPool, Custody};
use crate::dispatch::WorkQueue;
use crate::error::{GatewayError, Result};
use crate::session::SessionOrch;

/// Starts a worker draining `queue` into `orch`.
///
/// The thread exits once the queue is closed and empty.
pub fn spawn(
    queue: Arc<WorkQueue>,
    pool: Arc<BufferPool>,
    orch: Arc<SessionOrch>,
    idle: Duration,
) -> Result<JoinHandle<()>> {
    let name = format!("worker-{}", queue.id());
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || run(&queue, &pool, &orch, idle))
        .map_err(|source| GatewayError::Spawn { name, source })
}

fn run(queue: &WorkQueue, pool: &BufferPool, orch: &SessionOrch, idle: Duration) {
    let id = queue.id();
    info!(worker = id, "Worker started");
    let mut handled = 0u64;
    while let Some(batch) = queue.pop_batch(idle) {
        for mut buffer in batch {
            buffer.custody = Custody::Processing(id);
            if let Some(src) = buffer.src {
                orch.handle_datagram(buffer.vrf, src, buffer.payload());
                handled += 1;
            }
            pool.release(buffer);
        }
    }
    debug!(worker = id, handled, "Worker queue closed");
    info!(worker = id, "Worker stopped");
}
