pub mod algorithms;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod protocol;

pub type RouterId = String;
pub type NetworkId = ipnet::Ipv4Net;

pub use config::{ConnectionSpec, ProtocolConfig, RouterSpec, TopologyConfig};
pub use error::{FrameError, InterfaceError, ManagerError};
pub use events::NetworkEvent;
pub use network::{
    Connection, FrameRelay, HostPort, InterfaceEndpoint, InterfaceFactory, Manager, MemoryInterface,
    MemoryInterfaceFactory, RouterInfo,
};
pub use protocol::{AdjacencyState, NextHop, RouteSource, Router, RoutingEntry};
