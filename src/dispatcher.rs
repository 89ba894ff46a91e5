//! Event dispatcher.
//!
//! Applies runtime events to the state cache one at a time, in arrival order,
//! mirrors container lifecycle into the graph and starts or stops traffic
//! monitors. A step that still fails after retries aborts only the event it
//! belongs to; the cache keeps whatever was committed before the failure.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, StateCache};
use crate::graph::{ContainerNode, GraphSink, SinkError};
use crate::monitor::MonitorRegistry;
use crate::retry::RetryPolicy;
use crate::runtime::ContainerRuntime;
use crate::types::{EventAction, EventKind, RuntimeEvent};
use crate::veth::VethError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("network event for `{0}` carries no container id")]
    MissingContainer(String),
    #[error("no details cached for container `{0}`")]
    MissingDetails(String),
    #[error("{0} containers could not be reconciled")]
    ResyncIncomplete(usize),
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub hostname: String,
    pub retry: RetryPolicy,
    pub reconnect_delay: Duration,
    /// Keep capturing after a container leaves a network; otherwise its
    /// monitor is stopped and restarted on the next connect.
    pub keep_monitor_on_disconnect: bool,
}

pub struct Dispatcher {
    cache: Arc<StateCache>,
    sink: Arc<dyn GraphSink>,
    monitors: MonitorRegistry,
    options: DispatcherOptions,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<StateCache>,
        sink: Arc<dyn GraphSink>,
        monitors: MonitorRegistry,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            cache,
            sink,
            monitors,
            options,
        }
    }

    pub fn monitors(&self) -> &MonitorRegistry {
        &self.monitors
    }

    /// Loads the initial view of running containers, writes every container
    /// node and starts a monitor for each container with a veth and an IP.
    ///
    /// Unlike event handling, a failure here is returned to the caller: the
    /// daemon cannot do anything useful without an initial view.
    pub async fn bootstrap(&mut self) -> Result<(), DispatchError> {
        self.options
            .retry
            .run("initial load", || self.cache.refresh_all(false))
            .await?;

        let mut ids: Vec<_> = self.cache.container_ids().await.into_iter().collect();
        ids.sort();
        for id in &ids {
            self.insert_container(id).await?;
        }
        for id in &ids {
            self.monitors.start_for(id).await;
        }
        info!(
            "Bootstrapped {} containers, {} monitors running",
            ids.len(),
            self.monitors.running_ids().len()
        );
        Ok(())
    }

    /// Consumes runtime events until `cancel` fires. When the stream breaks
    /// the dispatcher waits, resyncs the cache against the runtime and
    /// subscribes again. Every monitor is stopped before returning.
    pub async fn run(&mut self, runtime: Arc<dyn ContainerRuntime>, cancel: CancellationToken) {
        'outer: loop {
            let mut stream = runtime.events();
            info!("Listening for runtime events...");

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break 'outer,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        if let Err(e) = self.handle(&event).await {
                            error!(
                                "Skipping {:?}/{:?} event for {}: {}",
                                event.kind, event.action, event.actor_id, e
                            );
                        }
                    }
                    Some(Err(e)) => {
                        error!("Error in runtime event stream: {}", e);
                        break;
                    }
                    None => break,
                }
            }

            warn!(
                "Runtime event stream ended. Reconnecting in {:?}...",
                self.options.reconnect_delay
            );
            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                _ = sleep(self.options.reconnect_delay) => {}
            }
            if let Err(e) = self.resync().await {
                error!("Resync after reconnect failed: {}", e);
            }
        }

        info!("Stopping all monitors");
        self.monitors.stop_all().await;
    }

    pub async fn handle(&mut self, event: &RuntimeEvent) -> Result<(), DispatchError> {
        let id = event.actor_id.as_str();
        match (&event.kind, &event.action) {
            (EventKind::Network, EventAction::Create) => {
                info!("Network created: {}", id);
                self.refresh_network(id).await
            }
            (EventKind::Network, EventAction::Destroy) => {
                info!("Network destroyed: {}", id);
                self.cache.remove_network(id).await;
                Ok(())
            }
            (EventKind::Network, EventAction::Connect) => {
                let container = required_container(event)?;
                info!("Network connected: {} <- {}", id, container);
                self.network_connected(id, container).await
            }
            (EventKind::Network, EventAction::Disconnect) => {
                let container = required_container(event)?;
                info!("Network disconnected: {} -x {}", id, container);
                self.network_disconnected(id, container).await
            }
            (EventKind::Container, EventAction::Create) => {
                info!("Container created: {}", id);
                self.refresh_container(id).await?;
                self.insert_container(id).await
            }
            (EventKind::Container, EventAction::Start) => {
                info!("Container started: {}", id);
                self.container_started(id).await
            }
            (EventKind::Container, EventAction::Stop) => {
                info!("Container stopped: {}", id);
                self.refresh_container(id).await?;
                self.update_container(id).await
            }
            (EventKind::Container, EventAction::Destroy) => {
                info!("Container destroyed: {}", id);
                self.container_destroyed(id).await
            }
            (kind, action) => {
                debug!("Ignoring {:?}/{:?} event for {}", kind, action, id);
                Ok(())
            }
        }
    }

    async fn network_connected(
        &mut self,
        network: &str,
        container: &str,
    ) -> Result<(), DispatchError> {
        self.refresh_network(network).await?;
        self.refresh_container(container).await?;
        self.refresh_veth(container).await?;
        self.upsert_container(container).await?;
        self.monitors.start_for(container).await;
        Ok(())
    }

    async fn network_disconnected(
        &mut self,
        network: &str,
        container: &str,
    ) -> Result<(), DispatchError> {
        self.refresh_network(network).await?;
        self.refresh_container(container).await?;
        if !self.options.keep_monitor_on_disconnect {
            self.monitors.stop(container).await;
        }
        Ok(())
    }

    async fn container_started(&mut self, id: &str) -> Result<(), DispatchError> {
        self.refresh_container(id).await?;
        self.upsert_container(id).await?;

        // The connect event usually starts the monitor; cover runtimes that
        // only expose the veth once the container is running.
        if !self.monitors.is_running(id) {
            match self.cache.refresh_veth(id).await {
                Ok(()) => {
                    self.monitors.start_for(id).await;
                }
                Err(CacheError::Veth(VethError::NotFound(_))) => {
                    debug!("No veth for started container {}", id);
                }
                Err(e) => warn!("Failed to look up veth of {}: {}", id, e),
            }
        }
        Ok(())
    }

    async fn container_destroyed(&mut self, id: &str) -> Result<(), DispatchError> {
        self.monitors.stop(id).await;
        self.cache.purge_container(id).await;
        self.options
            .retry
            .run("delete container", || self.sink.delete_container(id))
            .await?;
        Ok(())
    }

    /// Reloads the full view after a broken event stream and reconciles the
    /// graph and the monitors with it. A container that fails to reconcile is
    /// logged and skipped; the rest are still processed.
    async fn resync(&mut self) -> Result<(), DispatchError> {
        let before = self.cache.container_ids().await;
        self.options
            .retry
            .run("resync", || self.cache.refresh_all(true))
            .await?;
        let after = self.cache.container_ids().await;

        let mut gone: Vec<_> = before.difference(&after).cloned().collect();
        gone.sort();
        let mut present: Vec<_> = after.into_iter().collect();
        present.sort();

        let mut failed = 0;
        for id in &gone {
            info!("Container {} vanished while disconnected", id);
            if let Err(e) = self.container_destroyed(id).await {
                error!("Failed to remove vanished container {}: {}", id, e);
                failed += 1;
            }
        }
        for id in &present {
            if let Err(e) = self.upsert_container(id).await {
                error!("Failed to reconcile container {}: {}", id, e);
                failed += 1;
            }
            if !self.monitors.is_running(id) {
                self.monitors.start_for(id).await;
            }
        }

        if failed > 0 {
            return Err(DispatchError::ResyncIncomplete(failed));
        }
        Ok(())
    }

    async fn refresh_container(&self, id: &str) -> Result<(), DispatchError> {
        self.options
            .retry
            .run("refresh container", || self.cache.refresh_container(id))
            .await?;
        Ok(())
    }

    async fn refresh_network(&self, id: &str) -> Result<(), DispatchError> {
        self.options
            .retry
            .run("refresh network", || self.cache.refresh_network(id))
            .await?;
        Ok(())
    }

    async fn refresh_veth(&self, id: &str) -> Result<(), DispatchError> {
        self.options
            .retry
            .run("refresh veth", || self.cache.refresh_veth(id))
            .await?;
        Ok(())
    }

    async fn container_node(&self, id: &str) -> Result<ContainerNode, DispatchError> {
        let details = self
            .cache
            .details(id)
            .await
            .ok_or_else(|| DispatchError::MissingDetails(id.to_string()))?;
        let ip = self.cache.ip_of(id).await;
        Ok(ContainerNode::from_details(&details, ip, &self.options.hostname))
    }

    async fn insert_container(&self, id: &str) -> Result<(), DispatchError> {
        let node = self.container_node(id).await?;
        self.options
            .retry
            .run("insert container", || self.sink.insert_container(&node))
            .await?;
        self.cache.mark_in_graph(id).await;
        Ok(())
    }

    async fn update_container(&self, id: &str) -> Result<(), DispatchError> {
        let node = self.container_node(id).await?;
        self.options
            .retry
            .run("update container", || self.sink.update_container(&node))
            .await?;
        Ok(())
    }

    /// Inserts the node if it is not in the graph yet, then updates it.
    async fn upsert_container(&self, id: &str) -> Result<(), DispatchError> {
        if !self.cache.is_in_graph(id).await {
            self.insert_container(id).await?;
        }
        self.update_container(id).await
    }
}

fn required_container(event: &RuntimeEvent) -> Result<&str, DispatchError> {
    event
        .container_attribute()
        .ok_or_else(|| DispatchError::MissingContainer(event.actor_id.clone()))
}
