use std::net::Ipv4Addr;

use crate::{NetworkId, RouterId};

/// Failures of a virtual interface endpoint.
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("interface {0} is closed")]
    Closed(String),

    #[error("interface {0} already exists")]
    AlreadyExists(String),

    #[error("frame of {len} bytes exceeds MTU {mtu} on {name}")]
    FrameTooLarge { name: String, len: usize, mtu: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("not an IPv4 frame (version {0})")]
    NotIpv4(u8),

    #[error("invalid IPv4 header: {0}")]
    BadHeader(&'static str),

    #[error("payload of {0} bytes does not fit in one frame")]
    Oversized(usize),

    #[error("control payload: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors returned synchronously by management operations. None of them
/// leave partial state behind.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("router {0} already exists")]
    DuplicateRouter(RouterId),

    #[error("router {0} not found")]
    UnknownRouter(RouterId),

    #[error("cannot connect router {0} to itself")]
    SelfConnection(RouterId),

    #[error("connection between {0} and {1} already exists")]
    DuplicateConnection(RouterId, RouterId),

    #[error("connection {0} not found")]
    UnknownConnection(String),

    #[error("address {address} is already owned by router {owner}")]
    AddressInUse { address: Ipv4Addr, owner: RouterId },

    #[error("invalid network {0}: no usable host address")]
    InvalidNetwork(NetworkId),

    #[error("default subnet pool exhausted")]
    SubnetsExhausted,

    #[error("interface error: {0}")]
    Interface(#[from] InterfaceError),
}
