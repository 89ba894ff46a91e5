//! Per-container traffic monitors.
//!
//! Each monitor is a blocking capture thread reading frames from the
//! container's veth, feeding a bounded channel drained by an async task that
//! turns new flows into dependency edges. The [`MonitorRegistry`] owns one
//! cancellation token per container; cancelling it stops both halves and
//! drops the capture handle.
//!
//! A capture thread occupies a slot of the runtime's blocking pool until its
//! monitor stops, so the pool size bounds the number of concurrent monitors.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::StateCache;
use crate::capture::{parse_frame, CaptureError, CaptureOpener, Observation};
use crate::graph::{Dependency, Endpoint, GraphSink};
use crate::ledger::{FlowKey, FlowLedger};
use crate::retry::RetryPolicy;
use crate::types::ContainerId;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("source address {0} does not belong to a known container")]
    UnknownSource(Ipv4Addr),
}

/// What a monitor captures: resolved once, when it is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub container_id: ContainerId,
    pub veth: String,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// The flow was already recorded.
    Duplicate,
    ContainerEdge,
    /// `registered` is set when this flow also created the external node.
    ExternalEdge { registered: bool },
}

/// Turns observations into graph facts, shared by every monitor.
#[derive(Clone)]
pub struct FlowProcessor {
    cache: Arc<StateCache>,
    ledger: Arc<FlowLedger>,
    sink: Arc<dyn GraphSink>,
    retry: RetryPolicy,
}

impl FlowProcessor {
    pub fn new(
        cache: Arc<StateCache>,
        ledger: Arc<FlowLedger>,
        sink: Arc<dyn GraphSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            ledger,
            sink,
            retry,
        }
    }

    pub async fn process(&self, obs: Observation) -> Result<FlowOutcome, MonitorError> {
        let key = FlowKey::new(obs.src, obs.dst);
        if !self.ledger.record_flow(key) {
            return Ok(FlowOutcome::Duplicate);
        }
        debug!("new flow {}", key);

        let source = self
            .cache
            .container_by_ip(obs.src)
            .await
            .ok_or(MonitorError::UnknownSource(obs.src))?;

        if let Some(target) = self.cache.container_by_ip(obs.dst).await {
            info!("Adding dependency: {} -> {}", source.name, target.name);
            self.emit_edge(Dependency {
                source: source.id,
                target: Endpoint::Container(target.id),
                content: obs.content,
            })
            .await;
            return Ok(FlowOutcome::ContainerEdge);
        }

        let registered = self.ledger.register_external(obs.dst);
        if registered {
            let result = self
                .retry
                .run("insert non-container", || self.sink.insert_external(obs.dst))
                .await;
            if let Err(e) = result {
                error!("Failed to register non-container {}: {}", obs.dst, e);
            }
        }
        info!("Adding dependency: {} -> {}", source.name, obs.dst);
        self.emit_edge(Dependency {
            source: source.id,
            target: Endpoint::External(obs.dst),
            content: obs.content,
        })
        .await;
        Ok(FlowOutcome::ExternalEdge { registered })
    }

    async fn emit_edge(&self, dependency: Dependency) {
        let result = self
            .retry
            .run("add dependency", || self.sink.add_dependency(&dependency))
            .await;
        if let Err(e) = result {
            error!("Dropping dependency {:?}: {}", dependency, e);
        }
    }
}

/// Everything a monitor needs besides its target.
#[derive(Clone)]
pub struct MonitorContext {
    pub cache: Arc<StateCache>,
    pub processor: FlowProcessor,
    pub opener: Arc<dyn CaptureOpener>,
    /// Depth of the channel between the capture thread and the processor.
    pub buffer: usize,
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct MonitorRegistry {
    ctx: MonitorContext,
    running: HashMap<ContainerId, MonitorHandle>,
}

impl MonitorRegistry {
    pub fn new(ctx: MonitorContext) -> Self {
        Self {
            ctx,
            running: HashMap::new(),
        }
    }

    /// Starts a monitor using the veth and IP currently cached for `id`.
    /// Returns `false` when either is unknown.
    pub async fn start_for(&mut self, id: &str) -> bool {
        let veth = self.ctx.cache.veth_of(id).await;
        let ip = self.ctx.cache.ip_of(id).await;
        match (veth, ip) {
            (Some(veth), Some(ip)) => {
                self.start(MonitorTarget {
                    container_id: id.to_string(),
                    veth,
                    ip,
                });
                true
            }
            (veth, ip) => {
                warn!(
                    "Cannot monitor {}: veth={:?} ip={:?}",
                    id,
                    veth.as_deref(),
                    ip
                );
                false
            }
        }
    }

    /// Starts a monitor, replacing any monitor already running for the
    /// container.
    pub fn start(&mut self, target: MonitorTarget) {
        if let Some(previous) = self.running.remove(&target.container_id) {
            info!("Replacing monitor for {}", target.container_id);
            previous.cancel.cancel();
        }
        info!(
            "Starting monitor for {} on {} ({})",
            target.container_id, target.veth, target.ip
        );
        let cancel = CancellationToken::new();
        let id = target.container_id.clone();
        let task = tokio::spawn(run_monitor(self.ctx.clone(), target, cancel.clone()));
        self.running.insert(id, MonitorHandle { cancel, task });
    }

    /// Cancels the container's monitor and waits for it to release its
    /// capture. Returns `false` if none was registered.
    pub async fn stop(&mut self, id: &str) -> bool {
        let Some(handle) = self.running.remove(id) else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            error!("Monitor task for {} failed: {}", id, e);
        }
        info!("Stopped monitor for {}", id);
        true
    }

    pub async fn stop_all(&mut self) {
        let handles: Vec<_> = self.running.drain().collect();
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                error!("Monitor task for {} failed: {}", id, e);
            }
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running
            .get(id)
            .map_or(false, |handle| !handle.task.is_finished())
    }

    pub fn running_ids(&self) -> Vec<ContainerId> {
        self.running
            .iter()
            .filter(|(_, handle)| !handle.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl Drop for MonitorRegistry {
    fn drop(&mut self) {
        for handle in self.running.values() {
            handle.cancel.cancel();
        }
    }
}

async fn run_monitor(ctx: MonitorContext, target: MonitorTarget, cancel: CancellationToken) {
    // Releases the capture thread if this task is aborted.
    let _guard = cancel.clone().drop_guard();
    let (tx, mut rx) = mpsc::channel(ctx.buffer.max(1));
    let capture = {
        let opener = Arc::clone(&ctx.opener);
        let veth = target.veth.clone();
        let ip = target.ip;
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || capture_loop(opener, veth, ip, tx, cancel))
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(obs) => {
                    if let Err(e) = ctx.processor.process(obs).await {
                        error!("Monitor for {} stopped: {}", target.container_id, e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // The processor may have stopped first; release the capture thread too.
    cancel.cancel();
    drop(rx);
    match capture.await {
        Ok(Ok(())) => debug!("capture for {} finished", target.container_id),
        Ok(Err(e)) => error!(
            "Capture for {} on {} failed: {}",
            target.container_id, target.veth, e
        ),
        Err(e) => error!("Capture thread for {} panicked: {}", target.container_id, e),
    }
}

fn capture_loop(
    opener: Arc<dyn CaptureOpener>,
    veth: String,
    ip: Ipv4Addr,
    tx: mpsc::Sender<Observation>,
    cancel: CancellationToken,
) -> Result<(), CaptureError> {
    let mut source = opener.open(&veth)?;
    info!(
        "Capturing egress traffic of {} on {}",
        ip,
        source.interface_name()
    );

    while !cancel.is_cancelled() {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(CaptureError::Closed) => {
                info!("Capture on {} closed", veth);
                break;
            }
            Err(e) => return Err(e),
        };
        let Some(obs) = parse_frame(&frame) else {
            continue;
        };
        // The veth also carries traffic addressed to the container.
        if obs.src != ip {
            continue;
        }
        if tx.blocking_send(obs).is_err() {
            break;
        }
    }
    Ok(())
}
