use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use crate::NetworkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NextHop {
    Local,
    Address(Ipv4Addr),
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextHop::Local => write!(f, "self"),
            NextHop::Address(addr) => write!(f, "{}", addr),
        }
    }
}

impl Serialize for NextHop {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteSource {
    Direct,
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingEntry {
    pub network: NetworkId,
    pub next_hop: NextHop,
    pub out_interface: String,
    pub metric: u32,
    pub source: RouteSource,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: BTreeMap<NetworkId, RoutingEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the entry for a locally configured network, replacing
    /// whatever was stored for it.
    pub fn set_direct(&mut self, network: NetworkId, interface: &str) {
        let network = network.trunc();
        self.entries.insert(
            network,
            RoutingEntry {
                network,
                next_hop: NextHop::Local,
                out_interface: interface.to_string(),
                metric: 0,
                source: RouteSource::Direct,
            },
        );
    }

    /// Swaps the whole Protocol-sourced subset for `routes`. Direct entries
    /// are kept and win over a learned route for the same network. Returns
    /// whether the Protocol subset changed.
    pub fn replace_protocol_routes(&mut self, routes: Vec<RoutingEntry>) -> bool {
        let before: Vec<RoutingEntry> = self.protocol_routes().cloned().collect();

        self.entries.retain(|_, entry| entry.source != RouteSource::Protocol);
        for mut route in routes {
            route.source = RouteSource::Protocol;
            self.entries.entry(route.network).or_insert(route);
        }

        let after: Vec<RoutingEntry> = self.protocol_routes().cloned().collect();
        before != after
    }

    pub fn protocol_routes(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries
            .values()
            .filter(|e| e.source == RouteSource::Protocol)
    }

    pub fn get(&self, network: &NetworkId) -> Option<&RoutingEntry> {
        self.entries.get(network)
    }

    /// Longest-prefix match.
    pub fn lookup(&self, target: Ipv4Addr) -> Option<&RoutingEntry> {
        let mut best_route = None;
        let mut longest_prefix = 0;

        for (network, entry) in &self.entries {
            if network.contains(&target) && (best_route.is_none() || network.prefix_len() > longest_prefix) {
                longest_prefix = network.prefix_len();
                best_route = Some(entry);
            }
        }

        best_route
    }

    pub fn snapshot(&self) -> Vec<RoutingEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> NetworkId {
        s.parse().unwrap()
    }

    fn learned(network: &str, via: [u8; 4], metric: u32) -> RoutingEntry {
        RoutingEntry {
            network: net(network),
            next_hop: NextHop::Address(Ipv4Addr::from(via)),
            out_interface: "tun1".into(),
            metric,
            source: RouteSource::Protocol,
        }
    }

    #[test]
    fn direct_route_is_idempotent() {
        let mut table = RoutingTable::new();
        table.set_direct(net("10.0.1.1/24"), "tun1");
        table.set_direct(net("10.0.1.1/24"), "tun1");

        assert_eq!(table.len(), 1);
        let entry = table.get(&net("10.0.1.0/24")).unwrap();
        assert_eq!(entry.metric, 0);
        assert_eq!(entry.next_hop, NextHop::Local);
        assert_eq!(entry.source, RouteSource::Direct);
    }

    #[test]
    fn protocol_routes_are_swapped_as_a_set() {
        let mut table = RoutingTable::new();
        table.set_direct(net("10.0.1.0/24"), "tun1");

        assert!(table.replace_protocol_routes(vec![
            learned("10.0.2.0/24", [10, 0, 2, 1], 1),
            learned("10.0.3.0/24", [10, 0, 2, 1], 2),
            learned("10.0.1.0/24", [10, 0, 2, 1], 1),
        ]));
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(&net("10.0.1.0/24")).unwrap().source, RouteSource::Direct);

        assert!(!table.replace_protocol_routes(vec![
            learned("10.0.2.0/24", [10, 0, 2, 1], 1),
            learned("10.0.3.0/24", [10, 0, 2, 1], 2),
        ]));

        assert!(table.replace_protocol_routes(vec![learned("10.0.2.0/24", [10, 0, 2, 1], 1)]));
        assert!(table.get(&net("10.0.3.0/24")).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn lookup_prefers_longest_prefix() {
        let mut table = RoutingTable::new();
        table.set_direct(net("10.0.0.0/16"), "tun1");
        table.replace_protocol_routes(vec![learned("10.0.5.0/24", [10, 0, 2, 1], 3)]);

        assert_eq!(table.lookup("10.0.5.9".parse().unwrap()).unwrap().metric, 3);
        assert_eq!(table.lookup("10.0.7.9".parse().unwrap()).unwrap().metric, 0);
        assert!(table.lookup("192.168.1.1".parse().unwrap()).is_none());
    }

    #[test]
    fn next_hop_serializes_as_text() {
        let json = serde_json::to_value(learned("10.0.2.0/24", [10, 0, 2, 1], 1)).unwrap();
        assert_eq!(json["nextHop"], "10.0.2.1");
        assert_eq!(json["network"], "10.0.2.0/24");
        assert_eq!(serde_json::to_value(NextHop::Local).unwrap(), "self");
    }
}
