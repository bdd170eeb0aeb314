use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use ipnet::Ipv4Net;
use crate::NetworkId;
use crate::error::InterfaceError;

/// A virtual network device a router is bound to.
#[async_trait]
pub trait InterfaceEndpoint: Send + Sync {
    /// Waits for the next frame. `None` once the device is closed.
    async fn read_frame(&self) -> Option<Vec<u8>>;

    async fn write_frame(&self, frame: &[u8]) -> Result<usize, InterfaceError>;

    async fn close(&self);

    fn name(&self) -> &str;

    fn local_address(&self) -> Ipv4Addr;

    fn local_network(&self) -> NetworkId;

    fn mtu(&self) -> usize;
}

/// Creates and releases endpoints on behalf of the manager.
#[async_trait]
pub trait InterfaceFactory: Send + Sync {
    /// `address` carries the interface address together with its prefix.
    async fn create(
        &self,
        name: &str,
        address: Ipv4Net,
        mtu: usize,
    ) -> Result<Arc<dyn InterfaceEndpoint>, InterfaceError>;

    async fn release(&self, name: &str);
}

/// Moves a frame from one router toward the router owning `next_hop`.
#[async_trait]
pub trait FrameRelay: Send + Sync {
    async fn relay_frame(&self, source: &str, next_hop: Ipv4Addr, frame: Vec<u8>) -> bool;
}
