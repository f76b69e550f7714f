//! Engine assembly and thread lifecycle.
//!
//! [`Engine`] wires the receive threads, the dispatcher, the worker pool
//! and the session orch together. Threads start in [`Engine::start`] and
//! stop cooperatively in [`Engine::shutdown`]: receive threads first so
//! nothing new is queued, then the workers once their queues are drained.

use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::buffer::BufferPool;
use crate::config::{BootstrapConfig, EngineConfig};
use crate::dispatch::{Dispatcher, WorkQueue};
use crate::error::{GatewayError, Result};
use crate::outbox::{bind_signaling_socket, SignalingTransport, UdpSignaling};
use crate::receive::{ReceiveContext, ReceiveStats, Receiver};
use crate::routing::RoutingService;
use crate::scheduler::Scheduler;
use crate::session::{SessionOrch, SessionOrchCallbacks};
use crate::stats::EngineStats;
use crate::store::VrfId;
use crate::worker;

/// Opens VRF sockets and hands them to the receive threads.
struct SocketHooks {
    scheduler: Arc<Scheduler>,
    sockets: Arc<UdpSignaling>,
}

impl SessionOrchCallbacks for SocketHooks {
    fn on_vrf_added(&self, vrf: VrfId, listen: SocketAddrV4) -> Result<()> {
        let socket = Arc::new(bind_signaling_socket(listen)?);
        self.sockets.register(vrf, Arc::clone(&socket));
        if let Err(e) = self.scheduler.attach(vrf, socket) {
            self.sockets.unregister(vrf);
            return Err(e);
        }
        info!(vrf = %vrf, listen = %listen, "Signaling socket open");
        Ok(())
    }

    fn on_vrf_removed(&self, vrf: VrfId) {
        self.scheduler.detach(vrf);
        if self.sockets.unregister(vrf).is_some() {
            info!(vrf = %vrf, "Signaling socket closed");
        }
    }
}

#[derive(Default)]
struct Threads {
    receive: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// The tunnel gateway engine.
pub struct Engine {
    config: EngineConfig,
    orch: Arc<SessionOrch>,
    pool: Arc<BufferPool>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    sockets: Arc<UdpSignaling>,
    receive_stats: Arc<ReceiveStats>,
    stop: Arc<AtomicBool>,
    receivers: Mutex<Vec<Receiver>>,
    threads: Mutex<Threads>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("orch", &self.orch)
            .finish()
    }
}

impl Engine {
    /// Creates an engine replying to gateways over the VRF sockets.
    pub fn new(config: EngineConfig, routing: Arc<dyn RoutingService>) -> Result<Self> {
        Self::build(config, routing, None)
    }

    /// Creates an engine sending signaling replies through `signaling`
    /// instead of the VRF sockets.
    pub fn with_signaling(
        config: EngineConfig,
        routing: Arc<dyn RoutingService>,
        signaling: Arc<dyn SignalingTransport>,
    ) -> Result<Self> {
        Self::build(config, routing, Some(signaling))
    }

    fn build(
        config: EngineConfig,
        routing: Arc<dyn RoutingService>,
        signaling: Option<Arc<dyn SignalingTransport>>,
    ) -> Result<Self> {
        config.validate()?;

        let scheduler = Arc::new(Scheduler::new());
        let receivers = (0..config.receive_threads)
            .map(Receiver::new)
            .collect::<Result<Vec<_>>>()?;
        for receiver in &receivers {
            scheduler.add_slot(Arc::clone(receiver.slot()));
        }

        let sockets = Arc::new(UdpSignaling::new());
        let signaling = signaling
            .unwrap_or_else(|| Arc::clone(&sockets) as Arc<dyn SignalingTransport>);
        let hooks = Arc::new(SocketHooks {
            scheduler: Arc::clone(&scheduler),
            sockets: Arc::clone(&sockets),
        });
        let orch = Arc::new(
            SessionOrch::new(config.orch_config(), routing, signaling).with_callbacks(hooks),
        );

        let pool = Arc::new(BufferPool::new(config.buffer_count, config.buffer_size));
        let queues = (0..config.worker_threads)
            .map(|i| Arc::new(WorkQueue::new(i)))
            .collect();
        let dispatcher = Arc::new(Dispatcher::new(queues, Arc::clone(&pool)));

        Ok(Self {
            config,
            orch,
            pool,
            dispatcher,
            scheduler,
            sockets,
            receive_stats: Arc::new(ReceiveStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
            receivers: Mutex::new(receivers),
            threads: Mutex::new(Threads::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn orch(&self) -> &Arc<SessionOrch> {
        &self.orch
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Signaling socket of `vrf`, once the VRF has one.
    pub fn socket(&self, vrf: VrfId) -> Option<Arc<UdpSocket>> {
        self.sockets.socket(vrf)
    }

    /// Applies static management records.
    pub fn apply_bootstrap(&self, bootstrap: &BootstrapConfig) -> Result<()> {
        for vrf in &bootstrap.vrfs {
            self.orch.add_vrf(vrf)?;
        }
        for ipip in &bootstrap.ipip_gateways {
            self.orch.add_ipip_gateway(ipip)?;
        }
        for user in &bootstrap.users {
            self.orch.add_user(user)?;
        }
        for processor in &bootstrap.processors {
            self.orch.add_processor(processor)?;
        }
        for interface in &bootstrap.interfaces {
            self.orch.add_interface(interface)?;
        }
        info!(
            vrfs = bootstrap.vrfs.len(),
            users = bootstrap.users.len(),
            processors = bootstrap.processors.len(),
            interfaces = bootstrap.interfaces.len(),
            "Bootstrap applied"
        );
        Ok(())
    }

    /// Starts the worker and receive threads.
    pub fn start(&self) -> Result<()> {
        let receivers: Vec<Receiver> = std::mem::take(&mut *self.receivers.lock());
        if receivers.is_empty() {
            return Err(GatewayError::internal("engine already started"));
        }
        let mut threads = self.threads.lock();

        for queue in self.dispatcher.queues() {
            threads.workers.push(worker::spawn(
                Arc::clone(queue),
                Arc::clone(&self.pool),
                Arc::clone(&self.orch),
                self.config.poll_timeout(),
            )?);
        }

        let ctx = ReceiveContext {
            pool: Arc::clone(&self.pool),
            dispatcher: Arc::clone(&self.dispatcher),
            scheduler: Arc::clone(&self.scheduler),
            orch: Arc::clone(&self.orch),
            stats: Arc::clone(&self.receive_stats),
            stop: Arc::clone(&self.stop),
            poll_timeout: self.config.poll_timeout(),
        };
        for receiver in receivers {
            threads.receive.push(receiver.spawn(ctx.clone())?);
        }

        info!(
            receive_threads = threads.receive.len(),
            workers = threads.workers.len(),
            buffers = self.pool.total(),
            "Engine started"
        );
        Ok(())
    }

    /// Stops every thread and waits for them to exit.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let mut threads = self.threads.lock();

        self.scheduler.wake_all();
        for handle in threads.receive.drain(..) {
            if handle.join().is_err() {
                error!("Receive thread panicked");
            }
        }

        for queue in self.dispatcher.queues() {
            queue.close();
        }
        for handle in threads.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("Engine stopped");
    }

    /// Engine counters and per-entity snapshots.
    pub fn stats(&self) -> EngineStats {
        let mut stats = self.orch.snapshot();
        let counters = &mut stats.counters;
        counters.datagrams_received = self
            .receive_stats
            .datagrams
            .load(Ordering::Relaxed);
        counters.buffers_total = self.pool.total();
        counters.buffers_in_use = self.pool.in_use();
        counters.queued = self.dispatcher.queued();
        stats
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let running = {
            let threads = self.threads.lock();
            !threads.receive.is_empty() || !threads.workers.is_empty()
        };
        if running {
            self.shutdown();
        }
    }
}
