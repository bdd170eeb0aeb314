use serde::Serialize;
use std::net::Ipv4Addr;

use crate::RouterId;
use crate::network::Connection;
use crate::protocol::RoutingEntry;

/// Notifications published by the manager for a presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkEvent {
    RouterCreated {
        #[serde(rename = "routerId")]
        id: RouterId,
        #[serde(rename = "interfaceName")]
        interface_name: String,
        address: Ipv4Addr,
    },
    RouterDeleted {
        #[serde(rename = "routerId")]
        id: RouterId,
    },
    ConnectionCreated {
        connection: Connection,
    },
    ConnectionDeleted {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    RoutingTableUpdated {
        #[serde(rename = "routerId")]
        router_id: RouterId,
        table: Vec<RoutingEntry>,
    },
}

impl NetworkEvent {
    pub fn router_id(&self) -> Option<&str> {
        match self {
            NetworkEvent::RouterCreated { id, .. } | NetworkEvent::RouterDeleted { id } => Some(id),
            NetworkEvent::RoutingTableUpdated { router_id, .. } => Some(router_id),
            NetworkEvent::ConnectionCreated { .. } | NetworkEvent::ConnectionDeleted { .. } => None,
        }
    }
}
