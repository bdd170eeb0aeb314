//! In-process interface endpoints. Each endpoint has a host side, the
//! `HostPort`, which plays the part of the operating system: it can push
//! frames into the router and collect the frames the router writes out.

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use ipnet::Ipv4Net;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use crate::NetworkId;
use crate::error::InterfaceError;
use super::interface::{InterfaceEndpoint, InterfaceFactory};

pub struct MemoryInterface {
    name: String,
    address: Ipv4Addr,
    network: NetworkId,
    mtu: usize,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: watch::Sender<bool>,
}

pub struct HostPort {
    name: String,
    to_router: mpsc::Sender<Vec<u8>>,
    from_router: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: watch::Receiver<bool>,
}

impl MemoryInterface {
    /// Builds an endpoint and the host port wired to it. Both directions
    /// buffer up to `queue_depth` frames.
    pub fn pair(name: &str, address: Ipv4Net, mtu: usize, queue_depth: usize) -> (Arc<Self>, Arc<HostPort>) {
        let (to_router, inbound) = mpsc::channel(queue_depth);
        let (outbound, from_router) = mpsc::channel(queue_depth);
        let (closed, closed_rx) = watch::channel(false);

        let interface = Arc::new(Self {
            name: name.to_string(),
            address: address.addr(),
            network: address.trunc(),
            mtu,
            inbound: Mutex::new(inbound),
            outbound,
            closed,
        });
        let port = Arc::new(HostPort {
            name: name.to_string(),
            to_router,
            from_router: Mutex::new(from_router),
            closed: closed_rx,
        });
        (interface, port)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl InterfaceEndpoint for MemoryInterface {
    async fn read_frame(&self) -> Option<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }
        let closing = async move {
            while !*closed.borrow_and_update() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
        };
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            frame = inbound.recv() => frame,
            _ = closing => None,
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<usize, InterfaceError> {
        if self.is_closed() {
            return Err(InterfaceError::Closed(self.name.clone()));
        }
        if frame.len() > self.mtu {
            return Err(InterfaceError::FrameTooLarge {
                name: self.name.clone(),
                len: frame.len(),
                mtu: self.mtu,
            });
        }
        match self.outbound.try_send(frame.to_vec()) {
            Ok(()) => Ok(frame.len()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(InterfaceError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("host side of {} is not draining frames", self.name),
            ))),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(InterfaceError::Closed(self.name.clone())),
        }
    }

    async fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Interface {} closed", self.name);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn local_address(&self) -> Ipv4Addr {
        self.address
    }

    fn local_network(&self) -> NetworkId {
        self.network
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl HostPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivers a frame to the router as if the host had written it.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), InterfaceError> {
        if *self.closed.borrow() {
            return Err(InterfaceError::Closed(self.name.clone()));
        }
        self.to_router
            .send(frame)
            .await
            .map_err(|_| InterfaceError::Closed(self.name.clone()))
    }

    /// Next frame the router wrote to its interface.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.from_router.lock().await.recv().await
    }

    pub async fn try_recv(&self) -> Option<Vec<u8>> {
        self.from_router.lock().await.try_recv().ok()
    }
}

/// Hands out memory endpoints and keeps their host ports reachable by
/// interface name.
pub struct MemoryInterfaceFactory {
    queue_depth: usize,
    ports: RwLock<HashMap<String, Arc<HostPort>>>,
}

impl MemoryInterfaceFactory {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            ports: RwLock::new(HashMap::new()),
        }
    }

    pub async fn host_port(&self, name: &str) -> Option<Arc<HostPort>> {
        self.ports.read().await.get(name).cloned()
    }
}

impl Default for MemoryInterfaceFactory {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl InterfaceFactory for MemoryInterfaceFactory {
    async fn create(
        &self,
        name: &str,
        address: Ipv4Net,
        mtu: usize,
    ) -> Result<Arc<dyn InterfaceEndpoint>, InterfaceError> {
        let mut ports = self.ports.write().await;
        if ports.contains_key(name) {
            return Err(InterfaceError::AlreadyExists(name.to_string()));
        }
        let (interface, port) = MemoryInterface::pair(name, address, mtu, self.queue_depth);
        ports.insert(name.to_string(), port);
        debug!("Created memory interface {} with address {}", name, address);
        Ok(interface)
    }

    async fn release(&self, name: &str) {
        if self.ports.write().await.remove(name).is_some() {
            debug!("Released memory interface {}", name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn frames_cross_in_both_directions() {
        let (iface, port) = MemoryInterface::pair("tun1", cidr("10.0.1.1/24"), 1500, 8);
        assert_eq!(iface.local_address(), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(iface.local_network(), cidr("10.0.1.0/24"));

        port.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(iface.read_frame().await, Some(vec![1, 2, 3]));

        assert_eq!(iface.write_frame(&[4, 5]).await.unwrap(), 2);
        assert_eq!(port.recv().await, Some(vec![4, 5]));
        assert_eq!(port.try_recv().await, None);
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (iface, _port) = MemoryInterface::pair("tun1", cidr("10.0.1.1/24"), 576, 8);
        let err = iface.write_frame(&vec![0u8; 600]).await.unwrap_err();
        assert!(matches!(err, InterfaceError::FrameTooLarge { len: 600, mtu: 576, .. }));
    }

    #[tokio::test]
    async fn close_wakes_a_pending_reader() {
        let (iface, port) = MemoryInterface::pair("tun1", cidr("10.0.1.1/24"), 1500, 8);
        let reader = {
            let iface = iface.clone();
            tokio::spawn(async move { iface.read_frame().await })
        };
        tokio::task::yield_now().await;

        iface.close().await;
        assert_eq!(reader.await.unwrap(), None);
        assert!(matches!(iface.write_frame(&[1]).await, Err(InterfaceError::Closed(_))));
        assert!(port.send(vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn factory_rejects_duplicate_names() {
        let factory = MemoryInterfaceFactory::new(8);
        factory.create("tun1", cidr("10.0.1.1/24"), 1500).await.unwrap();
        assert!(matches!(
            factory.create("tun1", cidr("10.0.2.1/24"), 1500).await,
            Err(InterfaceError::AlreadyExists(_))
        ));
        assert!(factory.host_port("tun1").await.is_some());

        factory.release("tun1").await;
        assert!(factory.host_port("tun1").await.is_none());
        factory.create("tun1", cidr("10.0.2.1/24"), 1500).await.unwrap();
    }
}
