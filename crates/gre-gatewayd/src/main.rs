//! GRE Tunnel Gateway Daemon Entry Point

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use gre_gatewayd::dpclient::ProcessorTransport;
use gre_gatewayd::routing::ChannelRouting;
use gre_gatewayd::{
    BootstrapConfig, DaemonConfig, DpId, Engine, LinkOptions, ProcessorEvents, ProcessorLink,
    SessionOrch,
};

/// GRE/IP-in-IP tunnel gateway control plane
#[derive(Parser, Debug)]
#[command(name = "gre-gatewayd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Overrides the file.
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Number of receive threads
    #[arg(long)]
    receive_threads: Option<usize>,

    /// Number of worker threads
    #[arg(long)]
    worker_threads: Option<usize>,
}

/// Processor events that also restore the processor's configured
/// interfaces once its connection is established again.
struct DaemonEvents {
    orch: Arc<SessionOrch>,
    bootstrap: Arc<BootstrapConfig>,
}

impl ProcessorEvents for DaemonEvents {
    fn connected(
        &self,
        dp: DpId,
        transport: Arc<dyn ProcessorTransport>,
    ) -> gre_gatewayd::Result<()> {
        self.orch.connected(dp, transport)
    }

    fn established(&self, dp: DpId) -> gre_gatewayd::Result<()> {
        self.orch.established(dp)?;
        self.orch.restore_interfaces(self.bootstrap.interfaces_of(dp));
        Ok(())
    }

    fn message(&self, dp: DpId, bytes: &[u8]) {
        self.orch.message(dp, bytes);
    }

    fn shutdown(&self, dp: DpId) {
        self.orch.shutdown(dp);
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.engine.log_level = level.clone();
    }
    if let Some(n) = args.receive_threads {
        config.engine.receive_threads = n;
    }
    if let Some(n) = args.worker_threads {
        config.engine.worker_threads = n;
    }
    config.engine.validate()?;
    Ok(config)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to wait for SIGINT");
    }
}

fn run(config: DaemonConfig, stop: &Arc<AtomicBool>) -> anyhow::Result<(Engine, Vec<JoinHandle<()>>)> {
    let routing = Arc::new(ChannelRouting::new());
    let engine = Engine::new(config.engine.clone(), routing.clone())?;
    let orch = Arc::clone(engine.orch());

    let mut threads = vec![routing.spawn_events(
        Arc::clone(&orch),
        Arc::clone(stop),
        engine.config().poll_timeout(),
    )?];

    engine
        .apply_bootstrap(&config.bootstrap)
        .context("applying bootstrap configuration")?;
    engine.start()?;

    let bootstrap = Arc::new(config.bootstrap);
    let events: Arc<dyn ProcessorEvents> = Arc::new(DaemonEvents {
        orch,
        bootstrap: Arc::clone(&bootstrap),
    });
    for processor in &bootstrap.processors {
        let Some(addr) = processor.address else {
            debug!(dp = %processor.id, "Processor has no address, not connecting");
            continue;
        };
        threads.push(ProcessorLink::spawn(
            processor.id,
            addr,
            Arc::clone(&events),
            Arc::clone(stop),
            LinkOptions::default(),
        )?);
    }
    Ok((engine, threads))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gre-gatewayd: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.engine.log_level);

    info!(
        receive_threads = config.engine.receive_threads,
        worker_threads = config.engine.worker_threads,
        "Starting gre-gatewayd"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (engine, threads) = match run(config, &stop) {
        Ok(started) => started,
        Err(e) => {
            error!("Failed to start: {e:#}");
            stop.store(true, Ordering::Release);
            return ExitCode::FAILURE;
        }
    };

    wait_for_signal().await;

    info!("Shutting down");
    stop.store(true, Ordering::Release);
    engine.shutdown();
    for handle in threads {
        if handle.join().is_err() {
            error!("Thread panicked during shutdown");
        }
    }
    let counters = engine.stats().counters;
    info!(
        sessions_created = counters.sessions_created,
        sessions_cleared = counters.sessions_cleared,
        "gre-gatewayd stopped"
    );
    ExitCode::SUCCESS
}
