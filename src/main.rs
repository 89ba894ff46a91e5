//! netdeps daemon entry point.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio_util::sync::CancellationToken;

use netdeps::cache::StateCache;
use netdeps::capture::PnetOpener;
use netdeps::config::Config;
use netdeps::dispatcher::{Dispatcher, DispatcherOptions};
use netdeps::graph::{GraphSink, Neo4jSink};
use netdeps::ledger::FlowLedger;
use netdeps::monitor::{FlowProcessor, MonitorContext, MonitorRegistry};
use netdeps::runtime::{ContainerRuntime, DockerRuntime};
use netdeps::veth::CommandVethResolver;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;

    // Each monitor pins a blocking thread for its lifetime.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(cfg.max_blocking_threads)
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    info!(
        "Starting netdeps: graph={} veth_tool={}",
        cfg.neo4j_uri, cfg.veth_tool
    );
    let hostname = cfg.resolve_hostname();

    // Graph store
    let sink: Arc<dyn GraphSink> = Arc::new(
        Neo4jSink::connect(&cfg.neo4j_uri, &cfg.neo4j_user, &cfg.neo4j_password)
            .await
            .context("graph store unavailable")?,
    );

    // Container Runtime (Docker)
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let veths = Arc::new(CommandVethResolver::new(cfg.veth_tool.clone()));
    let cache = Arc::new(StateCache::new(Arc::clone(&runtime), veths));
    let ledger = Arc::new(FlowLedger::new());

    let monitors = MonitorRegistry::new(MonitorContext {
        cache: Arc::clone(&cache),
        processor: FlowProcessor::new(
            Arc::clone(&cache),
            Arc::clone(&ledger),
            Arc::clone(&sink),
            cfg.retry_policy(),
        ),
        opener: Arc::new(PnetOpener::new(cfg.capture_read_timeout())),
        buffer: cfg.capture_buffer,
    });

    let mut dispatcher = Dispatcher::new(
        Arc::clone(&cache),
        Arc::clone(&sink),
        monitors,
        DispatcherOptions {
            hostname,
            retry: cfg.retry_policy(),
            reconnect_delay: cfg.reconnect_delay(),
            keep_monitor_on_disconnect: cfg.keep_monitor_on_disconnect,
        },
    );

    // Without an initial view there is nothing to monitor.
    dispatcher
        .bootstrap()
        .await
        .context("initial load from container runtime failed")?;

    let cancel = CancellationToken::new();
    let dispatcher_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(runtime, cancel).await })
    };

    // Graceful Shutdown
    let mut sigterm = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    cancel.cancel();
    if let Err(e) = dispatcher_handle.await {
        error!("Dispatcher task failed: {}", e);
    }

    if cfg.drop_graph_on_exit {
        info!(
            "Dropping graph ({} flows recorded, {} external endpoints)",
            ledger.flow_count(),
            ledger.external_count()
        );
        if let Err(e) = sink.drop_all().await {
            error!("Failed to drop graph: {}", e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}
