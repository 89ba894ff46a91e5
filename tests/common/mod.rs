#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::udp::MutableUdpPacket;
use pnet::util::MacAddr;

use netdeps::cache::StateCache;
use netdeps::capture::{CaptureError, CaptureOpener, CaptureSource};
use netdeps::dispatcher::{Dispatcher, DispatcherOptions};
use netdeps::graph::{ContainerNode, Dependency, Endpoint, GraphSink, SinkError};
use netdeps::ledger::FlowLedger;
use netdeps::monitor::{FlowProcessor, MonitorContext, MonitorRegistry};
use netdeps::retry::RetryPolicy;
use netdeps::runtime::{ContainerRuntime, EventStream, RuntimeError};
use netdeps::types::{
    ContainerDetails, ContainerId, ContainerStatus, ContainerSummary, EventAction, EventKind,
    NetworkId, NetworkInfo, RuntimeEvent,
};
use netdeps::veth::{VethError, VethResolver};

pub const HOSTNAME: &str = "test-host";

// ---------------------------------------------------------------------------
// Runtime

#[derive(Default)]
struct RuntimeState {
    containers: BTreeMap<ContainerId, ContainerDetails>,
    networks: BTreeMap<NetworkId, NetworkInfo>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    queued: Mutex<Vec<RuntimeEvent>>,
    subscriptions: AtomicUsize,
    open_from: Mutex<Option<usize>>,
}

impl FakeRuntime {
    pub fn add_container(&self, id: &str, status: ContainerStatus) {
        self.state.lock().unwrap().containers.insert(
            id.to_string(),
            ContainerDetails {
                id: id.to_string(),
                name: format!("{id}-name"),
                status,
                ports: Vec::new(),
            },
        );
    }

    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.status = status;
        }
    }

    /// Removes the container and detaches it from every network.
    pub fn remove_container(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.containers.remove(id);
        for network in state.networks.values_mut() {
            network.endpoints.remove(id);
        }
    }

    pub fn add_network(&self, id: &str) {
        self.state.lock().unwrap().networks.insert(
            id.to_string(),
            NetworkInfo {
                id: id.to_string(),
                name: id.to_string(),
                endpoints: HashMap::new(),
            },
        );
    }

    pub fn remove_network(&self, id: &str) {
        self.state.lock().unwrap().networks.remove(id);
    }

    pub fn connect(&self, network: &str, container: &str, ip: &str) {
        if let Some(n) = self.state.lock().unwrap().networks.get_mut(network) {
            n.endpoints
                .insert(container.to_string(), format!("{ip}/24"));
        }
    }

    pub fn disconnect(&self, network: &str, container: &str) {
        if let Some(n) = self.state.lock().unwrap().networks.get_mut(network) {
            n.endpoints.remove(container);
        }
    }

    pub fn container_ids(&self) -> HashSet<ContainerId> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    /// Subscriptions from the `n`th on (0-based) stay open after their
    /// queued events, like a live daemon stream.
    pub fn keep_stream_open_from(&self, n: usize) {
        *self.open_from.lock().unwrap() = Some(n);
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Events handed out by the next call to `events()`.
    pub fn queue_events(&self, events: Vec<RuntimeEvent>) {
        self.queued.lock().unwrap().extend(events);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| all || c.status == ContainerStatus::Running)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                status: c.status,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkId>, RuntimeError> {
        Ok(self.state.lock().unwrap().networks.keys().cloned().collect())
    }

    async fn inspect_network(&self, id: &str) -> Result<NetworkInfo, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .networks
            .get(id)
            .cloned()
            .ok_or(RuntimeError::MissingId("network"))
    }

    fn events(&self) -> EventStream {
        let n = self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let events: Vec<_> = self.queued.lock().unwrap().drain(..).collect();
        let queued = stream::iter(events.into_iter().map(Ok));
        match *self.open_from.lock().unwrap() {
            Some(from) if n >= from => queued.chain(stream::pending()).boxed(),
            _ => queued.boxed(),
        }
    }
}

pub fn container_event(action: EventAction, id: &str) -> RuntimeEvent {
    RuntimeEvent::new(EventKind::Container, action, id)
}

pub fn network_event(action: EventAction, network: &str, container: &str) -> RuntimeEvent {
    RuntimeEvent::new(EventKind::Network, action, network).with_attribute("container", container)
}

// ---------------------------------------------------------------------------
// Veth tool

#[derive(Default)]
pub struct FakeVeths {
    table: Mutex<HashMap<ContainerId, String>>,
}

impl FakeVeths {
    pub fn set(&self, container: &str, veth: &str) {
        self.table
            .lock()
            .unwrap()
            .insert(container.to_string(), veth.to_string());
    }
}

#[async_trait]
impl VethResolver for FakeVeths {
    async fn veth_table(&self) -> Result<HashMap<ContainerId, String>, VethError> {
        Ok(self.table.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Graph sink

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Insert(ContainerNode),
    Update(ContainerNode),
    Delete(String),
    External(Ipv4Addr),
    Dependency(Dependency),
    DropAll,
}

/// Records every successful call; `fail_next` makes the following calls fail.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    fail_next: AtomicUsize,
}

impl RecordingSink {
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&SinkCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                SinkCall::Dependency(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn externals(&self) -> Vec<Ipv4Addr> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                SinkCall::External(ip) => Some(*ip),
                _ => None,
            })
            .collect()
    }

    pub fn deletes_of(&self, id: &str) -> usize {
        self.count(|c| matches!(c, SinkCall::Delete(d) if d == id))
    }

    fn record(&self, call: SinkCall) -> Result<(), SinkError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Rejected(format!("injected failure for {call:?}")));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl GraphSink for RecordingSink {
    async fn insert_container(&self, node: &ContainerNode) -> Result<(), SinkError> {
        self.record(SinkCall::Insert(node.clone()))
    }

    async fn update_container(&self, node: &ContainerNode) -> Result<(), SinkError> {
        self.record(SinkCall::Update(node.clone()))
    }

    async fn delete_container(&self, id: &str) -> Result<(), SinkError> {
        self.record(SinkCall::Delete(id.to_string()))
    }

    async fn insert_external(&self, ip: Ipv4Addr) -> Result<(), SinkError> {
        self.record(SinkCall::External(ip))
    }

    async fn add_dependency(&self, dependency: &Dependency) -> Result<(), SinkError> {
        self.record(SinkCall::Dependency(dependency.clone()))
    }

    async fn drop_all(&self) -> Result<(), SinkError> {
        self.record(SinkCall::DropAll)
    }
}

pub fn container_edge(dependency: &Dependency) -> Option<(&str, &str)> {
    match &dependency.target {
        Endpoint::Container(target) => Some((dependency.source.as_str(), target.as_str())),
        Endpoint::External(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Capture

/// Hands out scripted frames per interface. Once a script is exhausted the
/// source either closes or, with `hold_open`, idles until cancelled.
#[derive(Default)]
pub struct FakeOpener {
    scripts: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    opened: Mutex<Vec<String>>,
    hold_open: bool,
}

impl FakeOpener {
    pub fn holding_open() -> Self {
        Self {
            hold_open: true,
            ..Default::default()
        }
    }

    pub fn script(&self, interface: &str, frames: Vec<Vec<u8>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(interface.to_string(), frames);
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl CaptureOpener for FakeOpener {
    fn open(&self, interface: &str) -> Result<Box<dyn CaptureSource>, CaptureError> {
        let frames = self
            .scripts
            .lock()
            .unwrap()
            .remove(interface)
            .ok_or_else(|| CaptureError::InterfaceNotFound(interface.to_string()))?;
        self.opened.lock().unwrap().push(interface.to_string());
        Ok(Box::new(ScriptedSource {
            interface: interface.to_string(),
            frames: frames.into(),
            hold_open: self.hold_open,
        }))
    }
}

struct ScriptedSource {
    interface: String,
    frames: VecDeque<Vec<u8>>,
    hold_open: bool,
}

impl CaptureSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if self.hold_open => {
                std::thread::sleep(Duration::from_millis(5));
                Ok(None)
            }
            None => Err(CaptureError::Closed),
        }
    }

    fn interface_name(&self) -> &str {
        &self.interface
    }
}

pub fn udp_frame(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    const ETH_LEN: usize = 14;
    const IP_LEN: usize = 20;
    let udp_len = 8 + payload.len();
    let mut buf = vec![0u8; ETH_LEN + IP_LEN + udp_len];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
        eth.set_source(MacAddr::new(2, 0, 0, 0, 0, 1));
        eth.set_destination(MacAddr::new(2, 0, 0, 0, 0, 2));
        eth.set_ethertype(EtherTypes::Ipv4);
    }
    {
        let mut ip = MutableIpv4Packet::new(&mut buf[ETH_LEN..]).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length((IP_LEN + udp_len) as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(src);
        ip.set_destination(dst);
    }
    {
        let mut udp = MutableUdpPacket::new(&mut buf[ETH_LEN + IP_LEN..]).unwrap();
        udp.set_source(40000);
        udp.set_destination(8080);
        udp.set_length(udp_len as u16);
        udp.set_payload(payload);
    }
    buf
}

// ---------------------------------------------------------------------------
// Wiring

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub veths: Arc<FakeVeths>,
    pub sink: Arc<RecordingSink>,
    pub opener: Arc<FakeOpener>,
    pub cache: Arc<StateCache>,
    pub ledger: Arc<FlowLedger>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_opener(FakeOpener::default())
    }

    pub fn with_opener(opener: FakeOpener) -> Self {
        let runtime = Arc::new(FakeRuntime::default());
        let veths = Arc::new(FakeVeths::default());
        let cache = Arc::new(StateCache::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&veths) as Arc<dyn VethResolver>,
        ));
        Self {
            runtime,
            veths,
            sink: Arc::new(RecordingSink::default()),
            opener: Arc::new(opener),
            cache,
            ledger: Arc::new(FlowLedger::new()),
        }
    }

    pub fn retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::ZERO)
    }

    pub fn processor(&self) -> FlowProcessor {
        FlowProcessor::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.ledger),
            Arc::clone(&self.sink) as Arc<dyn GraphSink>,
            Self::retry(),
        )
    }

    pub fn registry(&self) -> MonitorRegistry {
        MonitorRegistry::new(MonitorContext {
            cache: Arc::clone(&self.cache),
            processor: self.processor(),
            opener: Arc::clone(&self.opener) as Arc<dyn CaptureOpener>,
            buffer: 16,
        })
    }

    pub fn dispatcher(&self, keep_monitor_on_disconnect: bool) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.sink) as Arc<dyn GraphSink>,
            self.registry(),
            DispatcherOptions {
                hostname: HOSTNAME.to_string(),
                retry: Self::retry(),
                reconnect_delay: Duration::from_millis(10),
                keep_monitor_on_disconnect,
            },
        )
    }

    /// Adds a running container attached to `network` with `ip` and `veth`.
    pub fn running_container(&self, id: &str, network: &str, ip: &str, veth: &str) {
        self.runtime.add_container(id, ContainerStatus::Running);
        self.runtime.connect(network, id, ip);
        self.veths.set(id, veth);
    }
}

/// Polls `cond` until it holds or two seconds pass.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
