use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use crate::NetworkId;
use crate::algorithms::calculate_shortest_paths;
use super::lsdb::LinkStateDatabase;
use super::neighbor::NeighborTable;
use super::routing_table::{NextHop, RouteSource, RoutingEntry};

/// Derives the Protocol-sourced routes of `local_id` from its database.
/// Networks the local router advertises itself are left to its Direct
/// entries.
pub fn compute_routes(
    local_id: &str,
    lsdb: &LinkStateDatabase,
    neighbors: &NeighborTable,
    out_interface: &str,
) -> Vec<RoutingEntry> {
    let paths = calculate_shortest_paths(lsdb.updates(), local_id);
    let local_networks: Vec<NetworkId> = lsdb
        .get(local_id)
        .map(|entry| entry.update.networks.iter().map(|n| n.trunc()).collect())
        .unwrap_or_default();

    // network -> (metric, first hop id, first hop address)
    let mut best: BTreeMap<NetworkId, (u32, String, Ipv4Addr)> = BTreeMap::new();

    for (origin, path) in &paths {
        let Some(first_hop) = &path.first_hop else {
            continue;
        };
        let Some(hop_address) = neighbors.get(first_hop).map(|n| n.peer_address) else {
            continue;
        };
        let Some(entry) = lsdb.get(origin) else {
            continue;
        };

        for network in &entry.update.networks {
            let network = network.trunc();
            if local_networks.contains(&network) {
                continue;
            }
            let candidate = (path.cost, first_hop.clone(), hop_address);
            let better = best
                .get(&network)
                .map(|(metric, hop, _)| (candidate.0, &candidate.1) < (*metric, hop))
                .unwrap_or(true);
            if better {
                best.insert(network, candidate);
            }
        }
    }

    best.into_iter()
        .map(|(network, (metric, _, address))| RoutingEntry {
            network,
            next_hop: NextHop::Address(address),
            out_interface: out_interface.to_string(),
            metric,
            source: RouteSource::Protocol,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AdjacencyState, AdvertisedLink, LinkStateUpdate};
    use tokio::time::Instant;

    fn lsu(origin: &str, links: &[(&str, u32)], networks: &[&str]) -> LinkStateUpdate {
        LinkStateUpdate {
            origin: origin.into(),
            sequence: 1,
            links: links
                .iter()
                .map(|(id, metric)| AdvertisedLink { neighbor_id: id.to_string(), metric: *metric })
                .collect(),
            networks: networks.iter().map(|n| n.parse().unwrap()).collect(),
            age: 0,
        }
    }

    fn chain() -> (LinkStateDatabase, NeighborTable) {
        let now = Instant::now();
        let mut db = LinkStateDatabase::new();
        db.install(lsu("a", &[("b", 2)], &["10.0.1.0/24"]), None, now);
        db.install(lsu("b", &[("a", 2), ("c", 3)], &["10.0.2.0/24"]), Some("b".into()), now);
        db.install(lsu("c", &[("b", 3)], &["10.0.3.0/24"]), Some("b".into()), now);

        let mut neighbors = NeighborTable::new();
        neighbors.add_peer("b", Ipv4Addr::new(10, 0, 2, 1), 2);
        neighbors.set_state("b", AdjacencyState::Full);
        (db, neighbors)
    }

    #[test]
    fn routes_point_at_the_first_hop() {
        let (db, neighbors) = chain();
        let routes = compute_routes("a", &db, &neighbors, "tun1");

        assert_eq!(routes.len(), 2);
        let to_c = routes.iter().find(|r| r.network == "10.0.3.0/24".parse().unwrap()).unwrap();
        assert_eq!(to_c.next_hop, NextHop::Address(Ipv4Addr::new(10, 0, 2, 1)));
        assert_eq!(to_c.metric, 5);
        assert_eq!(to_c.out_interface, "tun1");
    }

    #[test]
    fn recomputation_is_idempotent() {
        let (db, neighbors) = chain();
        let first = compute_routes("a", &db, &neighbors, "tun1");
        let second = compute_routes("a", &db, &neighbors, "tun1");
        assert_eq!(first, second);
    }

    #[test]
    fn unreachable_origins_contribute_nothing() {
        let (mut db, neighbors) = chain();
        // b stops listing c, so the a-b-c path is gone
        let update = LinkStateUpdate { sequence: 2, ..lsu("b", &[("a", 2)], &["10.0.2.0/24"]) };
        db.install(update, Some("b".into()), Instant::now());

        let routes = compute_routes("a", &db, &neighbors, "tun1");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].network, "10.0.2.0/24".parse().unwrap());
    }
}
