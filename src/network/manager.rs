use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::config::ProtocolConfig;
use crate::error::ManagerError;
use crate::events::NetworkEvent;
use crate::protocol::{AdjacencyState, LsdbSummary, Neighbor, Router, RoutingEntry};
use crate::{NetworkId, RouterId};
use super::interface::{FrameRelay, InterfaceFactory};

const EVENT_CAPACITY: usize = 256;
/// Default networks are carved out of 10.0.0.0/16, one /24 per router.
const MAX_DEFAULT_INDEX: u32 = 255;

/// A simulated physical link between two routers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    #[serde(rename = "router1Id")]
    pub router_a: RouterId,
    #[serde(rename = "router2Id")]
    pub router_b: RouterId,
    pub metric: u32,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn involves(&self, router_id: &str) -> bool {
        self.router_a == router_id || self.router_b == router_id
    }

    pub fn joins(&self, a: &str, b: &str) -> bool {
        (self.router_a == a && self.router_b == b) || (self.router_a == b && self.router_b == a)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterInfo {
    pub id: RouterId,
    pub interface_name: String,
    pub address: Ipv4Addr,
    pub network: NetworkId,
    pub running: bool,
    pub route_count: usize,
    pub full_neighbors: Vec<RouterId>,
}

/// Registry of live routers and the links between them. Also the only path
/// a frame can take from one router to another.
pub struct Manager {
    config: ProtocolConfig,
    factory: Arc<dyn InterfaceFactory>,
    routers: RwLock<HashMap<RouterId, Arc<Router>>>,
    connections: RwLock<HashMap<String, Connection>>,
    events: broadcast::Sender<NetworkEvent>,
    /// Next index for default ids and subnets; also serializes creation.
    next_index: Mutex<u32>,
    self_ref: Weak<Manager>,
}

impl Manager {
    pub fn new(config: ProtocolConfig, factory: Arc<dyn InterfaceFactory>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|self_ref| Self {
            config,
            factory,
            routers: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            events,
            next_index: Mutex::new(1),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: NetworkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Creates, registers and starts a router. Omitted parameters get
    /// defaults: `router{n}`, `tun{n}` and `10.0.{n}.1/24`, with `n` chosen
    /// so that none of the defaulted values is already in use.
    pub async fn create_and_start_router(
        &self,
        id: Option<RouterId>,
        interface_name: Option<String>,
        network: Option<NetworkId>,
        mtu: Option<usize>,
    ) -> Result<Arc<Router>, ManagerError> {
        let mut next_index = self.next_index.lock().await;

        let (id, interface_name, address, index) = {
            let routers = self.routers.read().await;
            if let Some(id) = &id {
                if routers.contains_key(id) {
                    return Err(ManagerError::DuplicateRouter(id.clone()));
                }
            }

            let index = if id.is_none() || network.is_none() || interface_name.is_none() {
                Some(allocate_index(
                    &routers,
                    *next_index,
                    id.is_none(),
                    interface_name.is_none(),
                    network.is_none(),
                )?)
            } else {
                None
            };
            let slot = index.unwrap_or(*next_index);

            let id = id.unwrap_or_else(|| format!("router{}", slot));
            let interface_name = interface_name.unwrap_or_else(|| format!("tun{}", slot));
            let network = match network {
                Some(network) => network,
                None => default_network(slot)?,
            };
            let address = interface_address(network)?;

            if let Some(owner) = routers.values().find(|r| r.address() == address.addr()) {
                return Err(ManagerError::AddressInUse {
                    address: address.addr(),
                    owner: owner.id().to_string(),
                });
            }
            (id, interface_name, address, index)
        };

        let mtu = mtu.unwrap_or(self.config.default_mtu);
        let endpoint = self.factory.create(&interface_name, address, mtu).await?;

        let relay: Weak<dyn FrameRelay> = self.self_ref.clone();
        let router = Router::new(id.clone(), endpoint, self.config.clone(), relay);
        self.routers.write().await.insert(id.clone(), router.clone());

        router.start().await;
        self.spawn_route_forwarder(&router);

        if let Some(index) = index {
            *next_index = index + 1;
        }
        drop(next_index);

        info!(router = %id, interface = %interface_name, %address, "router created");
        self.emit(NetworkEvent::RouterCreated {
            id,
            interface_name,
            address: address.addr(),
        });
        Ok(router)
    }

    /// Republishes the router's table snapshots as events until it stops.
    fn spawn_route_forwarder(&self, router: &Arc<Router>) {
        let mut updates = router.subscribe_routes();
        let mut shutdown = router.subscribe_shutdown();
        let events = self.events.clone();
        let router_id = router.id().to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let table = updates.borrow_and_update().clone();
                        let _ = events.send(NetworkEvent::RoutingTableUpdated {
                            router_id: router_id.clone(),
                            table,
                        });
                    }
                }
            }
            debug!(router = %router_id, "route forwarder finished");
        });
    }

    /// Unregisters the router, stops it, releases its interface and drops
    /// every connection it was part of.
    pub async fn stop_and_remove_router(&self, id: &str) -> Result<(), ManagerError> {
        let router = self
            .routers
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ManagerError::UnknownRouter(id.to_string()))?;

        router.stop().await;
        self.factory.release(router.interface_name()).await;

        let removed: Vec<Connection> = {
            let mut connections = self.connections.write().await;
            let ids: Vec<String> = connections
                .values()
                .filter(|c| c.involves(id))
                .map(|c| c.id.clone())
                .collect();
            ids.iter().filter_map(|cid| connections.remove(cid)).collect()
        };
        for connection in removed {
            info!(connection = %connection.id, router = %id, "connection removed with router");
            self.emit(NetworkEvent::ConnectionDeleted {
                connection_id: connection.id,
            });
        }

        info!(router = %id, "router removed");
        self.emit(NetworkEvent::RouterDeleted { id: id.to_string() });
        Ok(())
    }

    pub async fn add_connection(&self, a: &str, b: &str) -> Result<Connection, ManagerError> {
        self.add_connection_with_metric(a, b, self.config.default_link_metric)
            .await
    }

    /// Links two routers and registers each as the other's peer.
    pub async fn add_connection_with_metric(
        &self,
        a: &str,
        b: &str,
        metric: u32,
    ) -> Result<Connection, ManagerError> {
        if a == b {
            return Err(ManagerError::SelfConnection(a.to_string()));
        }

        let (router_a, router_b) = {
            let routers = self.routers.read().await;
            let router_a = routers
                .get(a)
                .cloned()
                .ok_or_else(|| ManagerError::UnknownRouter(a.to_string()))?;
            let router_b = routers
                .get(b)
                .cloned()
                .ok_or_else(|| ManagerError::UnknownRouter(b.to_string()))?;
            (router_a, router_b)
        };

        let connection = {
            let mut connections = self.connections.write().await;
            if connections.values().any(|c| c.joins(a, b)) {
                return Err(ManagerError::DuplicateConnection(a.to_string(), b.to_string()));
            }
            let connection = Connection {
                id: Uuid::new_v4().to_string(),
                router_a: a.to_string(),
                router_b: b.to_string(),
                metric,
                created_at: Utc::now(),
            };
            connections.insert(connection.id.clone(), connection.clone());
            connection
        };

        router_a
            .add_peer_with_metric(router_b.id(), router_b.address(), metric)
            .await;
        router_b
            .add_peer_with_metric(router_a.id(), router_a.address(), metric)
            .await;

        info!(connection = %connection.id, %a, %b, metric, "connection created");
        self.emit(NetworkEvent::ConnectionCreated {
            connection: connection.clone(),
        });
        Ok(connection)
    }

    /// Deletes the link record. The two routers notice through Hello
    /// timeouts, since frames stop crossing the removed link.
    pub async fn remove_connection(&self, connection_id: &str) -> Result<Connection, ManagerError> {
        let connection = self
            .connections
            .write()
            .await
            .remove(connection_id)
            .ok_or_else(|| ManagerError::UnknownConnection(connection_id.to_string()))?;

        info!(
            connection = %connection.id,
            a = %connection.router_a,
            b = %connection.router_b,
            "connection removed"
        );
        self.emit(NetworkEvent::ConnectionDeleted {
            connection_id: connection.id.clone(),
        });
        Ok(connection)
    }

    /// Delivers `frame` to the router that owns `next_hop`, provided a
    /// connection joins it to `source`.
    pub async fn relay_frame(&self, source: &str, next_hop: Ipv4Addr, frame: Vec<u8>) -> bool {
        let target = {
            let routers = self.routers.read().await;
            routers
                .values()
                .find(|r| r.id() != source && r.address() == next_hop)
                .cloned()
        };
        let Some(target) = target else {
            debug!(%source, %next_hop, "no router owns relay target");
            return false;
        };

        let linked = self
            .connections
            .read()
            .await
            .values()
            .any(|c| c.joins(source, target.id()));
        if !linked {
            debug!(%source, target = %target.id(), "no connection to relay across");
            return false;
        }

        let delivered = target.inject_frame(frame, source);
        if !delivered {
            warn!(%source, target = %target.id(), "relay delivery failed");
        }
        delivered
    }

    pub async fn router(&self, id: &str) -> Option<Arc<Router>> {
        self.routers.read().await.get(id).cloned()
    }

    pub async fn list_routers(&self) -> Vec<RouterInfo> {
        let mut routers: Vec<Arc<Router>> = self.routers.read().await.values().cloned().collect();
        routers.sort_by(|a, b| a.id().cmp(b.id()));

        let mut infos = Vec::with_capacity(routers.len());
        for router in routers {
            let neighbors = router.neighbors().await;
            infos.push(RouterInfo {
                id: router.id().to_string(),
                interface_name: router.interface_name().to_string(),
                address: router.address(),
                network: router.network(),
                running: router.is_running(),
                route_count: router.routing_table().await.len(),
                full_neighbors: neighbors
                    .into_iter()
                    .filter(|n| n.state == AdjacencyState::Full)
                    .map(|n| n.peer_router_id)
                    .collect(),
            });
        }
        infos
    }

    pub async fn list_connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> = self.connections.read().await.values().cloned().collect();
        connections.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        connections
    }

    pub async fn routing_table(&self, id: &str) -> Result<Vec<RoutingEntry>, ManagerError> {
        Ok(self.require(id).await?.routing_table().await)
    }

    pub async fn neighbors(&self, id: &str) -> Result<Vec<Neighbor>, ManagerError> {
        Ok(self.require(id).await?.neighbors().await)
    }

    pub async fn link_state_database(&self, id: &str) -> Result<Vec<LsdbSummary>, ManagerError> {
        Ok(self.require(id).await?.link_state_database().await)
    }

    async fn require(&self, id: &str) -> Result<Arc<Router>, ManagerError> {
        self.router(id)
            .await
            .ok_or_else(|| ManagerError::UnknownRouter(id.to_string()))
    }

    /// Stops and removes every router.
    pub async fn shutdown(&self) {
        let ids: Vec<RouterId> = self.routers.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_and_remove_router(&id).await {
                warn!(router = %id, error = %e, "failed to remove router during shutdown");
            }
        }
    }
}

#[async_trait]
impl FrameRelay for Manager {
    async fn relay_frame(&self, source: &str, next_hop: Ipv4Addr, frame: Vec<u8>) -> bool {
        Manager::relay_frame(self, source, next_hop, frame).await
    }
}

/// First index at or after `start` whose default id, interface name and
/// subnet are all free.
fn allocate_index(
    routers: &HashMap<RouterId, Arc<Router>>,
    start: u32,
    needs_id: bool,
    needs_interface: bool,
    needs_network: bool,
) -> Result<u32, ManagerError> {
    for index in start..=MAX_DEFAULT_INDEX {
        let id_free = !needs_id || !routers.contains_key(&format!("router{}", index));
        let interface_free = !needs_interface || {
            let candidate = format!("tun{}", index);
            !routers.values().any(|r| r.interface_name() == candidate)
        };
        let network_free = !needs_network || {
            let candidate = default_network(index)?;
            !routers.values().any(|r| overlaps(&candidate, &r.network()))
        };
        if id_free && interface_free && network_free {
            return Ok(index);
        }
    }
    Err(ManagerError::SubnetsExhausted)
}

fn default_network(index: u32) -> Result<Ipv4Net, ManagerError> {
    let octet = u8::try_from(index).map_err(|_| ManagerError::SubnetsExhausted)?;
    Ipv4Net::new(Ipv4Addr::new(10, 0, octet, 1), 24).map_err(|_| ManagerError::SubnetsExhausted)
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Resolves the interface address for `network`. A CIDR written with its
/// network or broadcast address gets the first usable host instead.
fn interface_address(network: Ipv4Net) -> Result<Ipv4Net, ManagerError> {
    let addr = network.addr();
    let usable = network.prefix_len() >= 31 || (addr != network.network() && addr != network.broadcast());
    if usable {
        return Ok(network);
    }
    let host = network
        .hosts()
        .next()
        .ok_or(ManagerError::InvalidNetwork(network))?;
    Ipv4Net::new(host, network.prefix_len()).map_err(|_| ManagerError::InvalidNetwork(network))
}
