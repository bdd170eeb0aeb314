//! IPv4 framing for everything a router reads from or writes to its
//! interface. Control traffic rides on an experimental IP protocol number
//! with a JSON payload; everything else is treated as data.

use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use std::net::Ipv4Addr;

use super::messages::ControlFrame;
use crate::error::FrameError;

pub const CONTROL_PROTOCOL: IpNextHeaderProtocol = IpNextHeaderProtocol(253);
pub const IPV4_HEADER_LEN: usize = 20;
pub const DEFAULT_TTL: u8 = 64;
/// Control frames only ever cross a single link.
pub const CONTROL_TTL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub ttl: u8,
    pub protocol: IpNextHeaderProtocol,
    pub identification: u16,
}

#[derive(Debug, Clone)]
pub enum Frame<'a> {
    Control {
        header: Ipv4Header,
        control: ControlFrame,
    },
    Data {
        header: Ipv4Header,
        payload: &'a [u8],
    },
}

pub fn encode_ipv4(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: IpNextHeaderProtocol,
    ttl: u8,
    identification: u16,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let total_len = IPV4_HEADER_LEN + payload.len();
    if total_len > u16::MAX as usize {
        return Err(FrameError::Oversized(payload.len()));
    }

    let mut buffer = vec![0u8; total_len];
    let mut packet =
        MutableIpv4Packet::new(&mut buffer).ok_or(FrameError::Truncated(total_len))?;
    packet.set_version(4);
    packet.set_header_length(5);
    packet.set_total_length(total_len as u16);
    packet.set_identification(identification);
    packet.set_ttl(ttl);
    packet.set_next_level_protocol(protocol);
    packet.set_source(source);
    packet.set_destination(destination);
    packet.set_payload(payload);
    let checksum = ipv4::checksum(&packet.to_immutable());
    packet.set_checksum(checksum);

    Ok(buffer)
}

pub fn encode_control(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    control: &ControlFrame,
) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(control)?;
    encode_ipv4(source, destination, CONTROL_PROTOCOL, CONTROL_TTL, 0, &payload)
}

/// Validates the IPv4 header and returns it with the payload it bounds.
pub fn parse_header(frame: &[u8]) -> Result<(Ipv4Header, &[u8]), FrameError> {
    if frame.len() < IPV4_HEADER_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    let packet = Ipv4Packet::new(frame).ok_or(FrameError::Truncated(frame.len()))?;

    let version = packet.get_version();
    if version != 4 {
        return Err(FrameError::NotIpv4(version));
    }
    let header_len = packet.get_header_length() as usize * 4;
    if header_len < IPV4_HEADER_LEN {
        return Err(FrameError::BadHeader("header length below 20 bytes"));
    }
    if header_len > frame.len() {
        return Err(FrameError::BadHeader("header length beyond frame"));
    }
    let total_len = packet.get_total_length() as usize;
    if total_len < header_len {
        return Err(FrameError::BadHeader("total length shorter than header"));
    }
    if total_len > frame.len() {
        return Err(FrameError::BadHeader("total length beyond frame"));
    }

    let header = Ipv4Header {
        source: packet.get_source(),
        destination: packet.get_destination(),
        ttl: packet.get_ttl(),
        protocol: packet.get_next_level_protocol(),
        identification: packet.get_identification(),
    };
    Ok((header, &frame[header_len..total_len]))
}

pub fn decode(frame: &[u8]) -> Result<Frame<'_>, FrameError> {
    let (header, payload) = parse_header(frame)?;
    if header.protocol == CONTROL_PROTOCOL {
        let control: ControlFrame = serde_json::from_slice(payload)?;
        Ok(Frame::Control { header, control })
    } else {
        Ok(Frame::Data { header, payload })
    }
}

/// Decrements the TTL in place and refreshes the header checksum. Returns
/// `None` when the frame must be dropped instead of forwarded.
pub fn decrement_ttl(frame: &mut [u8]) -> Option<u8> {
    let mut packet = MutableIpv4Packet::new(frame)?;
    let ttl = packet.get_ttl();
    if ttl <= 1 {
        return None;
    }
    packet.set_ttl(ttl - 1);
    let checksum = ipv4::checksum(&packet.to_immutable());
    packet.set_checksum(checksum);
    Some(ttl - 1)
}

/// Builds the echo reply for an ICMP echo request addressed to `local`.
pub fn echo_reply(header: &Ipv4Header, payload: &[u8], local: Ipv4Addr) -> Option<Vec<u8>> {
    if header.protocol != IpNextHeaderProtocols::Icmp || header.destination != local {
        return None;
    }
    let request = IcmpPacket::new(payload)?;
    if request.get_icmp_type() != IcmpTypes::EchoRequest || payload.len() < 8 {
        return None;
    }

    let mut reply = payload.to_vec();
    {
        let mut icmp_reply = MutableIcmpPacket::new(&mut reply)?;
        icmp_reply.set_icmp_type(IcmpTypes::EchoReply);
        icmp_reply.set_checksum(0);
        let checksum = icmp::checksum(&icmp_reply.to_immutable());
        icmp_reply.set_checksum(checksum);
    }

    encode_ipv4(
        local,
        header.source,
        IpNextHeaderProtocols::Icmp,
        DEFAULT_TTL,
        header.identification,
        &reply,
    )
    .ok()
}
