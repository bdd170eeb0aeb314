use log::{debug, info, warn};
use tokio::time::Instant;
use crate::protocol::frame::{self, Frame, Ipv4Header};
use super::messages::{ControlFrame, HelloMessage, LinkStateUpdate, ProtocolMessage};
use super::neighbor::{AdjacencyState, HelloOutcome};
use super::router::Router;
use super::routing_table::NextHop;

/// Where a data frame entered the router.
#[derive(Debug, Clone, Copy)]
enum Source {
    /// Read from the router's own interface.
    Host,
    /// Relayed by the fabric from a neighboring router.
    Peer,
    /// Generated by the router itself.
    Local,
}

/// Dispatches one frame. `from` is the router that relayed it, or `None`
/// when it was read from the interface.
pub async fn handle_frame(router: &Router, frame: Vec<u8>, from: Option<&str>) {
    let decoded = match frame::decode(&frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Router {} dropping malformed frame from {}: {}", router.id(), from.unwrap_or("host"), e);
            return;
        }
    };

    match decoded {
        Frame::Control { control, .. } => match from {
            Some(from) if from == control.sender => handle_control(router, control).await,
            Some(from) => warn!(
                "Router {} dropping control frame claiming sender {} relayed by {}",
                router.id(),
                control.sender,
                from
            ),
            None => debug!("Router {} ignoring control frame written by the host", router.id()),
        },
        Frame::Data { header, payload } => {
            let reply = frame::echo_reply(&header, payload, router.address());
            let source = match from {
                Some(_) => Source::Peer,
                None => Source::Host,
            };
            handle_data(router, frame, header, reply, source).await;
        }
    }
}

async fn handle_control(router: &Router, control: ControlFrame) {
    match control.message {
        ProtocolMessage::Hello(hello) => handle_hello(router, hello).await,
        ProtocolMessage::LinkStateUpdate(update) => {
            handle_link_state_update(router, &control.sender, update).await
        }
    }
}

async fn handle_hello(router: &Router, hello: HelloMessage) {
    if hello.router_id == router.id() {
        return;
    }

    let config = router.config();
    if hello.hello_interval_ms != config.hello_interval_ms || hello.dead_interval_ms != config.dead_interval_ms {
        warn!(
            "Router {} ignoring hello from {}: timers {}/{} ms do not match {}/{} ms",
            router.id(),
            hello.router_id,
            hello.hello_interval_ms,
            hello.dead_interval_ms,
            config.hello_interval_ms,
            config.dead_interval_ms
        );
        return;
    }

    let lists_us = hello.seen.iter().any(|id| id == router.id());
    let outcome = {
        let mut state = router.state().write().await;
        state
            .neighbors
            .on_hello(&hello.router_id, hello.address, lists_us, Instant::now())
    };
    debug!("Router {} hello from {} ({:?})", router.id(), hello.router_id, outcome);

    match outcome {
        HelloOutcome::Unknown => {
            debug!("Router {} ignoring hello from unconfigured router {}", router.id(), hello.router_id);
            return;
        }
        HelloOutcome::Unchanged(_) => {}
        HelloOutcome::Transition { from, to: AdjacencyState::TwoWay } => {
            info!("Router {} neighbor {} {:?} -> TwoWay", router.id(), hello.router_id, from);
            exchange_database(router, &hello).await;
        }
        HelloOutcome::Transition { from, to } if from >= AdjacencyState::TwoWay => {
            warn!(
                "Router {} neighbor {} no longer lists us ({:?} -> {:?})",
                router.id(),
                hello.router_id,
                from,
                to
            );
            router.reoriginate().await;
        }
        HelloOutcome::Transition { from, to } => {
            info!("Router {} neighbor {} {:?} -> {:?}", router.id(), hello.router_id, from, to);
        }
    }

    // Answer right away so the peer does not wait a full interval to see us
    if !lists_us {
        router.send_hello(&hello.router_id, hello.address).await;
    }
}

/// Sends our whole database to a neighbor that just reached TwoWay, then
/// declares the adjacency Full and advertises it.
async fn exchange_database(router: &Router, hello: &HelloMessage) {
    let updates = router.state().read().await.lsdb.aged_updates(Instant::now());
    debug!(
        "Router {} sending {} LSUs to {} for database exchange",
        router.id(),
        updates.len(),
        hello.router_id
    );
    for update in updates {
        router
            .send_control(hello.address, ProtocolMessage::LinkStateUpdate(update))
            .await;
    }

    let promoted = {
        let mut state = router.state().write().await;
        state.neighbors.set_state(&hello.router_id, AdjacencyState::Full)
    };
    if promoted {
        info!("Router {} adjacency with {} is Full", router.id(), hello.router_id);
        router.reoriginate().await;
    }
}

async fn handle_link_state_update(router: &Router, sender: &str, update: LinkStateUpdate) {
    if update.origin == router.id() {
        let bumped = {
            let mut state = router.state().write().await;
            if update.sequence > state.sequence {
                state.sequence = update.sequence;
                true
            } else {
                false
            }
        };
        if bumped {
            info!(
                "Router {} saw its own LSU with newer seq {}, re-originating",
                router.id(),
                update.sequence
            );
            router.reoriginate().await;
        }
        return;
    }

    let accepted = {
        let mut state = router.state().write().await;
        if state.neighbors.get(sender).is_none() {
            debug!("Router {} ignoring LSU relayed by unconfigured router {}", router.id(), sender);
            return;
        }
        state
            .lsdb
            .install(update.clone(), Some(sender.to_string()), Instant::now())
    };

    if accepted {
        debug!(
            "Router {} accepted LSU {}#{} from {}",
            router.id(),
            update.origin,
            update.sequence,
            sender
        );
        router.flood(&update, Some(sender)).await;
        router.schedule_spf();
    } else {
        debug!(
            "Router {} ignoring stale LSU {}#{} from {}",
            router.id(),
            update.origin,
            update.sequence,
            sender
        );
    }
}

async fn handle_data(
    router: &Router,
    frame: Vec<u8>,
    header: Ipv4Header,
    echo_reply: Option<Vec<u8>>,
    source: Source,
) {
    if header.destination == router.address() {
        match echo_reply {
            Some(reply) => {
                debug!("Router {} answering echo request from {}", router.id(), header.source);
                if let Ok((reply_header, _)) = frame::parse_header(&reply) {
                    forward(router, reply, reply_header, Source::Local).await;
                }
            }
            None => deliver_local(router, &frame).await,
        }
        return;
    }

    forward(router, frame, header, source).await;
}

async fn forward(router: &Router, mut frame: Vec<u8>, header: Ipv4Header, source: Source) {
    let route = router
        .state()
        .read()
        .await
        .routing_table
        .lookup(header.destination)
        .cloned();

    let Some(route) = route else {
        warn!(
            "Router {} has no route to {}, dropping frame from {}",
            router.id(),
            header.destination,
            header.source
        );
        return;
    };

    match route.next_hop {
        NextHop::Local => {
            debug!(
                "Router {} delivering frame for {} to {} ({:?})",
                router.id(),
                header.destination,
                route.out_interface,
                source
            );
            deliver_local(router, &frame).await;
        }
        NextHop::Address(next_hop) => {
            if !matches!(source, Source::Local) && frame::decrement_ttl(&mut frame).is_none() {
                warn!(
                    "Router {} TTL expired for frame {} -> {}",
                    router.id(),
                    header.source,
                    header.destination
                );
                return;
            }
            debug!("Router {} forwarding frame for {} via {}", router.id(), header.destination, next_hop);
            if !router.relay(next_hop, frame).await {
                warn!("Router {} could not relay frame for {} to {}", router.id(), header.destination, next_hop);
            }
        }
    }
}

async fn deliver_local(router: &Router, frame: &[u8]) {
    if let Err(e) = router.interface().write_frame(frame).await {
        warn!("Router {} dropping frame, interface write failed: {}", router.id(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::network::{FrameRelay, HostPort, MemoryInterface};
    use async_trait::async_trait;
    use pnet::packet::ip::IpNextHeaderProtocols;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Weak};

    /// Fabric stand-in that keeps every control frame a router sends.
    #[derive(Default)]
    struct RecordingRelay {
        sent: std::sync::Mutex<Vec<(Ipv4Addr, ControlFrame)>>,
    }

    impl RecordingRelay {
        fn take(&self) -> Vec<(Ipv4Addr, ControlFrame)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl FrameRelay for RecordingRelay {
        async fn relay_frame(&self, _source: &str, next_hop: Ipv4Addr, frame: Vec<u8>) -> bool {
            if let Ok(Frame::Control { control, .. }) = frame::decode(&frame) {
                self.sent.lock().unwrap().push((next_hop, control));
            }
            true
        }
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn router_with_relay(relay: &Arc<RecordingRelay>) -> (Arc<Router>, Arc<HostPort>) {
        let (iface, port) = MemoryInterface::pair("tun1", "10.0.1.1/24".parse().unwrap(), 1500, 16);
        let relay: Arc<dyn FrameRelay> = relay.clone();
        let relay: Weak<dyn FrameRelay> = Arc::downgrade(&relay);
        (Router::new("r1".into(), iface, ProtocolConfig::fast(), relay), port)
    }

    fn hello_from(router: &Router, peer: &str, address: Ipv4Addr, seen: &[&str]) -> Vec<u8> {
        let control = ControlFrame {
            sender: peer.into(),
            message: ProtocolMessage::Hello(HelloMessage {
                router_id: peer.into(),
                interface_name: "tun9".into(),
                address,
                hello_interval_ms: router.config().hello_interval_ms,
                dead_interval_ms: router.config().dead_interval_ms,
                seen: seen.iter().map(|s| s.to_string()).collect(),
            }),
        };
        frame::encode_control(address, router.address(), &control).unwrap()
    }

    fn lsu_from(router: &Router, sender: &str, origin: &str, sequence: u64) -> Vec<u8> {
        let control = ControlFrame {
            sender: sender.into(),
            message: ProtocolMessage::LinkStateUpdate(LinkStateUpdate {
                origin: origin.into(),
                sequence,
                links: Vec::new(),
                networks: vec!["10.0.9.0/24".parse().unwrap()],
                age: 0,
            }),
        };
        frame::encode_control(addr("10.0.9.1"), router.address(), &control).unwrap()
    }

    async fn make_full(router: &Router, peer: &str, address: Ipv4Addr) {
        router.add_peer(peer, address).await;
        handle_frame(router, hello_from(router, peer, address, &["r1"]), Some(peer)).await;
    }

    fn updates_to(sent: &[(Ipv4Addr, ControlFrame)], address: Ipv4Addr) -> Vec<&LinkStateUpdate> {
        sent.iter()
            .filter(|(to, _)| *to == address)
            .filter_map(|(_, control)| match &control.message {
                ProtocolMessage::LinkStateUpdate(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn hello_with_other_timers_is_ignored() {
        let relay = Arc::new(RecordingRelay::default());
        let (router, _port) = router_with_relay(&relay);
        router.add_peer("r2", addr("10.0.2.1")).await;

        let control = ControlFrame {
            sender: "r2".into(),
            message: ProtocolMessage::Hello(HelloMessage {
                router_id: "r2".into(),
                interface_name: "tun2".into(),
                address: addr("10.0.2.1"),
                hello_interval_ms: router.config().hello_interval_ms * 2,
                dead_interval_ms: router.config().dead_interval_ms,
                seen: vec!["r1".into()],
            }),
        };
        let hello = frame::encode_control(addr("10.0.2.1"), router.address(), &control).unwrap();
        handle_frame(&router, hello, Some("r2")).await;

        let neighbors = router.neighbors().await;
        assert_eq!(neighbors[0].state, AdjacencyState::Init);
        assert!(neighbors[0].last_hello.is_none());
        assert!(relay.take().is_empty());
    }

    #[tokio::test]
    async fn two_way_hello_exchanges_database_and_goes_full() {
        let relay = Arc::new(RecordingRelay::default());
        let (router, _port) = router_with_relay(&relay);
        router.originate_lsu().await;
        router.add_peer("r2", addr("10.0.2.1")).await;

        // r2 has not heard us yet: we stay Init and answer at once
        handle_frame(&router, hello_from(&router, "r2", addr("10.0.2.1"), &[]), Some("r2")).await;
        assert_eq!(router.neighbors().await[0].state, AdjacencyState::Init);
        let sent = relay.take();
        assert!(matches!(
            sent.as_slice(),
            [(to, ControlFrame { message: ProtocolMessage::Hello(hello), .. })]
                if *to == addr("10.0.2.1") && hello.seen == vec!["r2".to_string()]
        ));

        handle_frame(&router, hello_from(&router, "r2", addr("10.0.2.1"), &["r1"]), Some("r2")).await;
        assert_eq!(router.neighbors().await[0].state, AdjacencyState::Full);

        let sent = relay.take();
        let updates = updates_to(&sent, addr("10.0.2.1"));
        let sequences: Vec<u64> = updates.iter().map(|u| u.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert!(updates.iter().all(|u| u.origin == "r1"));
        assert_eq!(updates[1].lists("r2"), Some(1));
    }

    #[tokio::test]
    async fn updates_are_flooded_to_full_neighbors_except_the_sender() {
        let relay = Arc::new(RecordingRelay::default());
        let (router, _port) = router_with_relay(&relay);
        make_full(&router, "r2", addr("10.0.2.1")).await;
        make_full(&router, "r3", addr("10.0.3.1")).await;
        router.add_peer("r4", addr("10.0.4.1")).await;
        relay.take();

        handle_frame(&router, lsu_from(&router, "r2", "r9", 1), Some("r2")).await;

        let sent = relay.take();
        assert!(updates_to(&sent, addr("10.0.2.1")).is_empty());
        assert!(updates_to(&sent, addr("10.0.4.1")).is_empty());
        let to_r3 = updates_to(&sent, addr("10.0.3.1"));
        assert_eq!(to_r3.len(), 1);
        assert_eq!(to_r3[0].origin, "r9");

        let summary = router.link_state_database().await;
        let entry = summary.iter().find(|e| e.origin == "r9").unwrap();
        assert_eq!(entry.learned_from.as_deref(), Some("r2"));

        // the same copy arriving over another link is not flooded again
        handle_frame(&router, lsu_from(&router, "r3", "r9", 1), Some("r3")).await;
        assert!(relay.take().is_empty());
    }

    #[tokio::test]
    async fn newer_copy_of_own_update_moves_sequence_past_it() {
        let relay = Arc::new(RecordingRelay::default());
        let (router, _port) = router_with_relay(&relay);
        make_full(&router, "r2", addr("10.0.2.1")).await;
        let before = router.state().read().await.sequence;
        relay.take();

        handle_frame(&router, lsu_from(&router, "r2", "r1", before + 10), Some("r2")).await;

        let sequence = router.state().read().await.sequence;
        assert_eq!(sequence, before + 11);
        assert_eq!(router.state().read().await.lsdb.sequence_of("r1"), Some(before + 11));
        let sent = relay.take();
        let flooded = updates_to(&sent, addr("10.0.2.1"));
        assert_eq!(flooded.len(), 1);
        assert_eq!(flooded[0].sequence, before + 11);

        // our current update coming back changes nothing
        handle_frame(&router, lsu_from(&router, "r2", "r1", sequence), Some("r2")).await;
        assert_eq!(router.state().read().await.sequence, sequence);
        assert!(relay.take().is_empty());
    }

    #[tokio::test]
    async fn control_frame_from_unexpected_relayer_is_dropped() {
        let relay = Arc::new(RecordingRelay::default());
        let (router, _port) = router_with_relay(&relay);
        router.add_peer("r2", addr("10.0.2.1")).await;

        handle_frame(&router, hello_from(&router, "r2", addr("10.0.2.1"), &["r1"]), Some("r3")).await;

        assert_eq!(router.neighbors().await[0].state, AdjacencyState::Init);
        assert!(relay.take().is_empty());
    }

    #[tokio::test]
    async fn host_frame_for_attached_network_is_written_to_interface() {
        let relay = Arc::new(RecordingRelay::default());
        let (router, port) = router_with_relay(&relay);
        router.add_directly_connected_route().await;

        let data = frame::encode_ipv4(
            addr("10.0.1.2"),
            addr("10.0.1.5"),
            IpNextHeaderProtocols::Udp,
            frame::DEFAULT_TTL,
            0,
            b"local",
        )
        .unwrap();
        handle_frame(&router, data.clone(), None).await;

        assert_eq!(port.try_recv().await, Some(data));
    }
}
