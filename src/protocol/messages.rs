use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use crate::{NetworkId, RouterId};

/// Payload of every control frame. `sender` is the router that put the frame
/// on the wire, which differs from an LSU's origin when it is being flooded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    pub sender: RouterId,
    pub message: ProtocolMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    Hello(HelloMessage),
    LinkStateUpdate(LinkStateUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub router_id: RouterId,
    pub interface_name: String,
    pub address: Ipv4Addr,
    pub hello_interval_ms: u64,
    pub dead_interval_ms: u64,
    /// Neighbors this router has heard from; seeing ourselves here confirms
    /// two-way connectivity.
    pub seen: Vec<RouterId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedLink {
    pub neighbor_id: RouterId,
    pub metric: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStateUpdate {
    pub origin: RouterId,
    pub sequence: u64,
    pub links: Vec<AdvertisedLink>,
    pub networks: Vec<NetworkId>,
    /// Seconds since origination, as seen by the sender.
    pub age: u32,
}

impl LinkStateUpdate {
    pub fn lists(&self, neighbor_id: &str) -> Option<u32> {
        self.links
            .iter()
            .find(|link| link.neighbor_id == neighbor_id)
            .map(|link| link.metric)
    }
}
