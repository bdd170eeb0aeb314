use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;
use crate::RouterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AdjacencyState {
    Down,
    Init,
    TwoWay,
    Full,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbor {
    pub peer_router_id: RouterId,
    pub peer_address: Ipv4Addr,
    pub state: AdjacencyState,
    pub metric: u32,
    pub last_hello_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_hello: Option<Instant>,
}

impl Neighbor {
    pub fn new(peer_router_id: RouterId, peer_address: Ipv4Addr, metric: u32) -> Self {
        Self {
            peer_router_id,
            peer_address,
            state: AdjacencyState::Init,
            metric,
            last_hello_at: None,
            last_hello: None,
        }
    }

    /// A neighbor that was never heard from cannot time out.
    pub fn is_dead(&self, now: Instant, dead_interval: Duration) -> bool {
        self.last_hello
            .map(|seen| now.saturating_duration_since(seen) >= dead_interval)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloOutcome {
    /// Sender is not a configured peer.
    Unknown,
    Unchanged(AdjacencyState),
    Transition {
        from: AdjacencyState,
        to: AdjacencyState,
    },
}

/// Statically configured peers of one router, keyed by router id.
#[derive(Debug, Clone, Default)]
pub struct NeighborTable {
    neighbors: BTreeMap<RouterId, Neighbor>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer or revives a Down one. Returns the state it now has.
    pub fn add_peer(&mut self, peer_id: &str, address: Ipv4Addr, metric: u32) -> AdjacencyState {
        let neighbor = self
            .neighbors
            .entry(peer_id.to_string())
            .or_insert_with(|| Neighbor::new(peer_id.to_string(), address, metric));
        neighbor.peer_address = address;
        neighbor.metric = metric;
        if neighbor.state == AdjacencyState::Down {
            neighbor.state = AdjacencyState::Init;
        }
        neighbor.state
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> Option<Neighbor> {
        self.neighbors.remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&Neighbor> {
        self.neighbors.get(peer_id)
    }

    pub fn set_state(&mut self, peer_id: &str, state: AdjacencyState) -> bool {
        match self.neighbors.get_mut(peer_id) {
            Some(neighbor) => {
                neighbor.state = state;
                true
            }
            None => false,
        }
    }

    pub fn on_hello(
        &mut self,
        peer_id: &str,
        address: Ipv4Addr,
        lists_us: bool,
        now: Instant,
    ) -> HelloOutcome {
        let Some(neighbor) = self.neighbors.get_mut(peer_id) else {
            return HelloOutcome::Unknown;
        };

        neighbor.peer_address = address;
        neighbor.last_hello = Some(now);
        neighbor.last_hello_at = Some(Utc::now());

        let from = neighbor.state;
        let to = match (from, lists_us) {
            (AdjacencyState::Down, false) => AdjacencyState::Init,
            (AdjacencyState::Down | AdjacencyState::Init, true) => AdjacencyState::TwoWay,
            (AdjacencyState::TwoWay | AdjacencyState::Full, false) => AdjacencyState::Init,
            (state, _) => state,
        };

        if from == to {
            HelloOutcome::Unchanged(to)
        } else {
            neighbor.state = to;
            HelloOutcome::Transition { from, to }
        }
    }

    /// Moves every timed-out neighbor to Down and returns them with the state
    /// they held before.
    pub fn expire(&mut self, now: Instant, dead_interval: Duration) -> Vec<(RouterId, AdjacencyState)> {
        let mut expired = Vec::new();
        for (id, neighbor) in self.neighbors.iter_mut() {
            if neighbor.state != AdjacencyState::Down && neighbor.is_dead(now, dead_interval) {
                expired.push((id.clone(), neighbor.state));
                neighbor.state = AdjacencyState::Down;
            }
        }
        expired
    }

    /// Ids advertised in our Hello: peers we currently hear.
    pub fn seen(&self) -> Vec<RouterId> {
        self.neighbors
            .values()
            .filter(|n| n.state != AdjacencyState::Down && n.last_hello.is_some())
            .map(|n| n.peer_router_id.clone())
            .collect()
    }

    pub fn full(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors
            .values()
            .filter(|n| n.state == AdjacencyState::Full)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.values()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 1);

    #[test]
    fn hello_drives_the_adjacency_up() {
        let mut table = NeighborTable::new();
        assert_eq!(table.add_peer("r2", PEER, 1), AdjacencyState::Init);

        let now = Instant::now();
        assert_eq!(table.on_hello("r2", PEER, false, now), HelloOutcome::Unchanged(AdjacencyState::Init));
        assert_eq!(table.seen(), vec!["r2".to_string()]);
        assert_eq!(
            table.on_hello("r2", PEER, true, now),
            HelloOutcome::Transition { from: AdjacencyState::Init, to: AdjacencyState::TwoWay }
        );
        assert_eq!(table.on_hello("r9", PEER, true, now), HelloOutcome::Unknown);
    }

    #[test]
    fn losing_the_reverse_listing_demotes_to_init() {
        let mut table = NeighborTable::new();
        table.add_peer("r2", PEER, 1);
        let now = Instant::now();
        table.on_hello("r2", PEER, true, now);
        table.set_state("r2", AdjacencyState::Full);

        assert_eq!(
            table.on_hello("r2", PEER, false, now),
            HelloOutcome::Transition { from: AdjacencyState::Full, to: AdjacencyState::Init }
        );
        assert_eq!(table.full().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_neighbors_expire() {
        let mut table = NeighborTable::new();
        table.add_peer("r2", PEER, 1);
        table.add_peer("r3", Ipv4Addr::new(10, 0, 3, 1), 1);
        table.on_hello("r2", PEER, true, Instant::now());
        table.set_state("r2", AdjacencyState::Full);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(table.expire(Instant::now(), Duration::from_secs(4)).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = table.expire(Instant::now(), Duration::from_secs(4));
        assert_eq!(expired, vec![("r2".to_string(), AdjacencyState::Full)]);
        assert_eq!(table.get("r2").unwrap().state, AdjacencyState::Down);
        // never heard, so never expires
        assert_eq!(table.get("r3").unwrap().state, AdjacencyState::Init);

        assert_eq!(table.add_peer("r2", PEER, 1), AdjacencyState::Init);
    }
}
