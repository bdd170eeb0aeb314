use log::{debug, error, info, warn};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use crate::config::ProtocolConfig;
use crate::network::{FrameRelay, InterfaceEndpoint};
use crate::{NetworkId, RouterId};
use super::frame;
use super::lsdb::{LinkStateDatabase, LsdbSummary};
use super::messages::{AdvertisedLink, ControlFrame, HelloMessage, LinkStateUpdate, ProtocolMessage};
use super::neighbor::{AdjacencyState, Neighbor, NeighborTable};
use super::routing_table::{RoutingEntry, RoutingTable};
use super::{spf, task_manager};

/// Everything a router's tasks share, behind one lock.
#[derive(Debug, Default)]
pub struct RouterState {
    pub neighbors: NeighborTable,
    pub lsdb: LinkStateDatabase,
    pub routing_table: RoutingTable,
    /// Sequence of the last self-originated update.
    pub sequence: u64,
}

/// A frame handed to the router by the fabric.
#[derive(Debug)]
pub struct InboundFrame {
    pub frame: Vec<u8>,
    pub from: RouterId,
}

pub struct Router {
    id: RouterId,
    interface: Arc<dyn InterfaceEndpoint>,
    config: ProtocolConfig,
    relay: Weak<dyn FrameRelay>,
    state: RwLock<RouterState>,
    inject_tx: mpsc::Sender<InboundFrame>,
    inject_rx: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
    spf_tx: mpsc::Sender<()>,
    spf_rx: Mutex<Option<mpsc::Receiver<()>>>,
    /// Held for a whole SPF run so an older result never lands last.
    spf_lock: Mutex<()>,
    table_tx: watch::Sender<Vec<RoutingEntry>>,
    shutdown_tx: broadcast::Sender<()>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.id)
            .field("interface", &self.interface_name())
            .field("address", &self.address())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(
        id: RouterId,
        interface: Arc<dyn InterfaceEndpoint>,
        config: ProtocolConfig,
        relay: Weak<dyn FrameRelay>,
    ) -> Arc<Self> {
        let (inject_tx, inject_rx) = mpsc::channel(config.inject_queue_depth.max(1));
        let (spf_tx, spf_rx) = mpsc::channel(1);
        let (table_tx, _) = watch::channel(Vec::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            id,
            interface,
            config,
            relay,
            state: RwLock::new(RouterState::default()),
            inject_tx,
            inject_rx: Mutex::new(Some(inject_rx)),
            spf_tx,
            spf_rx: Mutex::new(Some(spf_rx)),
            spf_lock: Mutex::new(()),
            table_tx,
            shutdown_tx,
            task_handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> Ipv4Addr {
        self.interface.local_address()
    }

    pub fn network(&self) -> NetworkId {
        self.interface.local_network()
    }

    pub fn interface_name(&self) -> &str {
        self.interface.name()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn interface(&self) -> &Arc<dyn InterfaceEndpoint> {
        &self.interface
    }

    pub(crate) fn state(&self) -> &RwLock<RouterState> {
        &self.state
    }

    pub async fn add_directly_connected_route(&self) {
        let mut state = self.state.write().await;
        state.routing_table.set_direct(self.network(), self.interface_name());
    }

    /// Launches the read loop, Hello, aging and SPF tasks. A router that has
    /// been stopped cannot be started again.
    pub async fn start(self: &Arc<Self>) {
        let (Some(inject_rx), Some(spf_rx)) = (self.inject_rx.lock().await.take(), self.spf_rx.lock().await.take()) else {
            warn!("Router {} was already started", self.id);
            return;
        };
        self.running.store(true, Ordering::Relaxed);

        self.add_directly_connected_route().await;
        self.publish_table().await;
        self.originate_lsu().await;

        let handles = task_manager::start_tasks(self, inject_rx, spf_rx);
        self.task_handles.lock().await.extend(handles);

        info!(
            "Router {} started on {} with address {} ({})",
            self.id,
            self.interface_name(),
            self.address(),
            self.network()
        );
    }

    /// Signals every task, waits for all of them, then closes the interface.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Router {} task ended abnormally: {}", self.id, e);
            }
        }

        self.interface.close().await;
        info!("Router {} stopped", self.id);
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Routing table snapshots, published after every change.
    pub fn subscribe_routes(&self) -> watch::Receiver<Vec<RoutingEntry>> {
        self.table_tx.subscribe()
    }

    /// Queues a frame as if it had arrived on the interface from `from`.
    /// Never blocks; returns `false` when the frame could not be queued.
    pub fn inject_frame(&self, frame: Vec<u8>, from: &str) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.inject_tx.try_send(InboundFrame { frame, from: from.to_string() }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Router {} inject queue full, dropping frame from {}", self.id, from);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub async fn add_peer(&self, peer_id: &str, peer_address: Ipv4Addr) {
        self.add_peer_with_metric(peer_id, peer_address, self.config.default_link_metric)
            .await;
    }

    pub async fn add_peer_with_metric(&self, peer_id: &str, peer_address: Ipv4Addr, metric: u32) {
        let state = {
            let mut state = self.state.write().await;
            state.neighbors.add_peer(peer_id, peer_address, metric)
        };
        info!(
            "Router {} configured peer {} at {} (metric {}, {:?})",
            self.id, peer_id, peer_address, metric, state
        );

        if self.is_running() {
            self.send_hello(peer_id, peer_address).await;
        }
    }

    /// Drops a configured peer and withdraws everything learned through it.
    pub async fn remove_peer(&self, peer_id: &str) -> bool {
        let removed = {
            let mut state = self.state.write().await;
            state.neighbors.remove_peer(peer_id)
        };
        let Some(neighbor) = removed else {
            return false;
        };
        info!("Router {} removed peer {} ({:?} -> Down)", self.id, peer_id, neighbor.state);

        if neighbor.state >= AdjacencyState::TwoWay {
            self.reoriginate().await;
        }
        true
    }

    pub async fn routing_table(&self) -> Vec<RoutingEntry> {
        self.state.read().await.routing_table.snapshot()
    }

    pub async fn neighbors(&self) -> Vec<Neighbor> {
        self.state.read().await.neighbors.iter().cloned().collect()
    }

    pub async fn link_state_database(&self) -> Vec<LsdbSummary> {
        self.state.read().await.lsdb.summary(Instant::now())
    }

    /// Rebuilds the Protocol-sourced routes from the current database and
    /// publishes the table if it changed. Returns whether it changed.
    pub(crate) async fn compute_shortest_paths(&self) -> bool {
        let _run = self.spf_lock.lock().await;
        let routes = {
            let state = self.state.read().await;
            spf::compute_routes(&self.id, &state.lsdb, &state.neighbors, self.interface_name())
        };

        let changed = {
            let mut state = self.state.write().await;
            state.routing_table.replace_protocol_routes(routes)
        };

        if changed {
            self.publish_table().await;
        } else {
            debug!("Router {} SPF run left the routing table unchanged", self.id);
        }
        changed
    }

    async fn publish_table(&self) {
        let snapshot = self.routing_table().await;
        info!("Router {} routing table ({} entries):", self.id, snapshot.len());
        for entry in &snapshot {
            info!(
                "  {} via {} dev {} metric {} [{:?}]",
                entry.network, entry.next_hop, entry.out_interface, entry.metric, entry.source
            );
        }
        self.table_tx.send_replace(snapshot);
    }

    /// Requests a recomputation. Bursts collapse into one run.
    pub fn schedule_spf(&self) {
        let _ = self.spf_tx.try_send(());
    }

    /// Builds a new self-originated update from the Full neighbors, installs
    /// it locally and returns it.
    pub async fn originate_lsu(&self) -> LinkStateUpdate {
        let mut state = self.state.write().await;
        state.sequence += 1;

        let links = state
            .neighbors
            .full()
            .map(|n| AdvertisedLink {
                neighbor_id: n.peer_router_id.clone(),
                metric: n.metric,
            })
            .collect();
        let update = LinkStateUpdate {
            origin: self.id.clone(),
            sequence: state.sequence,
            links,
            networks: vec![self.network()],
            age: 0,
        };

        state.lsdb.install(update.clone(), None, Instant::now());
        debug!(
            "Router {} originated LSU seq {} with {} links",
            self.id,
            update.sequence,
            update.links.len()
        );
        update
    }

    /// Originates, floods to every Full neighbor and schedules SPF.
    pub async fn reoriginate(&self) {
        let update = self.originate_lsu().await;
        self.flood(&update, None).await;
        self.schedule_spf();
    }

    pub async fn flood(&self, update: &LinkStateUpdate, except: Option<&str>) {
        let targets: Vec<(RouterId, Ipv4Addr)> = {
            let state = self.state.read().await;
            state
                .neighbors
                .full()
                .filter(|n| Some(n.peer_router_id.as_str()) != except)
                .map(|n| (n.peer_router_id.clone(), n.peer_address))
                .collect()
        };

        for (peer_id, address) in targets {
            debug!("Router {} flooding LSU {}#{} to {}", self.id, update.origin, update.sequence, peer_id);
            self.send_control(address, ProtocolMessage::LinkStateUpdate(update.clone()))
                .await;
        }
    }

    pub async fn send_hello(&self, peer_id: &str, peer_address: Ipv4Addr) {
        let seen = self.state.read().await.neighbors.seen();
        let hello = HelloMessage {
            router_id: self.id.clone(),
            interface_name: self.interface_name().to_string(),
            address: self.address(),
            hello_interval_ms: self.config.hello_interval_ms,
            dead_interval_ms: self.config.dead_interval_ms,
            seen,
        };
        if !self.send_control(peer_address, ProtocolMessage::Hello(hello)).await {
            debug!("Router {} hello to {} at {} not delivered", self.id, peer_id, peer_address);
        }
    }

    pub async fn send_control(&self, destination: Ipv4Addr, message: ProtocolMessage) -> bool {
        let control = ControlFrame {
            sender: self.id.clone(),
            message,
        };
        match frame::encode_control(self.address(), destination, &control) {
            Ok(bytes) => self.relay(destination, bytes).await,
            Err(e) => {
                warn!("Router {} failed to encode control frame: {}", self.id, e);
                false
            }
        }
    }

    /// Hands a frame to the fabric for delivery to the router at `next_hop`.
    pub async fn relay(&self, next_hop: Ipv4Addr, frame: Vec<u8>) -> bool {
        match self.relay.upgrade() {
            Some(relay) => relay.relay_frame(&self.id, next_hop, frame).await,
            None => {
                debug!("Router {} has no fabric to relay through", self.id);
                false
            }
        }
    }
}
