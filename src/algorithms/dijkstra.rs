use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::cmp::Ordering;
use crate::RouterId;
use crate::protocol::LinkStateUpdate;

/// Best known path from the SPF root to one router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortestPath {
    pub cost: u32,
    /// Neighbor of the root the path leaves through; `None` for the root.
    pub first_hop: Option<RouterId>,
    pub path: Vec<RouterId>,
}

#[derive(Debug, PartialEq, Eq)]
struct State {
    cost: u32,
    first_hop: RouterId,
    router: RouterId,
    path: Vec<RouterId>,
}

impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap; equal costs prefer the smaller first hop
        other
            .cost
            .cmp(&self.cost)
            .then_with(|| other.first_hop.cmp(&self.first_hop))
            .then_with(|| other.router.cmp(&self.router))
    }
}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Adjacency list holding only links advertised by both ends. The cost of
/// an edge is the metric its tail advertises.
pub fn mutual_edges<'a, I>(updates: I) -> HashMap<RouterId, Vec<(RouterId, u32)>>
where
    I: IntoIterator<Item = &'a LinkStateUpdate>,
{
    let by_origin: HashMap<&str, &LinkStateUpdate> = updates
        .into_iter()
        .map(|lsu| (lsu.origin.as_str(), lsu))
        .collect();

    let mut graph: HashMap<RouterId, Vec<(RouterId, u32)>> = HashMap::new();
    for (origin, lsu) in &by_origin {
        for link in &lsu.links {
            let reverse = by_origin
                .get(link.neighbor_id.as_str())
                .and_then(|peer| peer.lists(origin));
            if reverse.is_some() {
                graph
                    .entry(origin.to_string())
                    .or_default()
                    .push((link.neighbor_id.clone(), link.metric));
            }
        }
    }
    graph
}

/// Single-source shortest paths over the mutual-edge graph. Routers that
/// cannot be reached are absent from the result.
pub fn calculate_shortest_paths<'a, I>(updates: I, source: &str) -> BTreeMap<RouterId, ShortestPath>
where
    I: IntoIterator<Item = &'a LinkStateUpdate>,
{
    let graph = mutual_edges(updates);
    let mut settled: BTreeMap<RouterId, ShortestPath> = BTreeMap::new();
    let mut distances: HashMap<RouterId, (u32, RouterId)> = HashMap::new();
    let mut heap = BinaryHeap::new();

    distances.insert(source.to_string(), (0, String::new()));
    heap.push(State {
        cost: 0,
        first_hop: String::new(),
        router: source.to_string(),
        path: vec![source.to_string()],
    });

    while let Some(State { cost, first_hop, router, path }) = heap.pop() {
        if settled.contains_key(&router) {
            continue;
        }
        settled.insert(
            router.clone(),
            ShortestPath {
                cost,
                first_hop: if router == source { None } else { Some(first_hop.clone()) },
                path: path.clone(),
            },
        );

        let Some(edges) = graph.get(&router) else {
            continue;
        };
        for (neighbor, link_cost) in edges {
            if settled.contains_key(neighbor) {
                continue;
            }
            let new_cost = cost.saturating_add(*link_cost);
            let hop = if router == source { neighbor.clone() } else { first_hop.clone() };

            let better = match distances.get(neighbor) {
                None => true,
                Some((best, best_hop)) => new_cost < *best || (new_cost == *best && hop < *best_hop),
            };
            if better {
                distances.insert(neighbor.clone(), (new_cost, hop.clone()));
                let mut new_path = path.clone();
                new_path.push(neighbor.clone());
                heap.push(State {
                    cost: new_cost,
                    first_hop: hop,
                    router: neighbor.clone(),
                    path: new_path,
                });
            }
        }
    }

    settled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AdvertisedLink;

    fn lsu(origin: &str, links: &[(&str, u32)]) -> LinkStateUpdate {
        LinkStateUpdate {
            origin: origin.into(),
            sequence: 1,
            links: links
                .iter()
                .map(|(id, metric)| AdvertisedLink { neighbor_id: id.to_string(), metric: *metric })
                .collect(),
            networks: vec![],
            age: 0,
        }
    }

    #[test]
    fn chain_costs_are_summed() {
        let db = vec![
            lsu("a", &[("b", 2)]),
            lsu("b", &[("a", 2), ("c", 3)]),
            lsu("c", &[("b", 3)]),
        ];
        let paths = calculate_shortest_paths(&db, "a");

        assert_eq!(paths["a"].cost, 0);
        assert_eq!(paths["a"].first_hop, None);
        assert_eq!(paths["c"].cost, 5);
        assert_eq!(paths["c"].first_hop.as_deref(), Some("b"));
        assert_eq!(paths["c"].path, vec!["a", "b", "c"]);
    }

    #[test]
    fn one_sided_links_are_ignored() {
        let db = vec![
            lsu("a", &[("b", 1), ("c", 1)]),
            lsu("b", &[("a", 1)]),
            lsu("c", &[]),
        ];
        let paths = calculate_shortest_paths(&db, "a");

        assert!(paths.contains_key("b"));
        assert!(!paths.contains_key("c"));
    }

    #[test]
    fn equal_cost_ties_prefer_smallest_first_hop() {
        // a reaches d through b or c at the same cost
        let db = vec![
            lsu("a", &[("c", 1), ("b", 1)]),
            lsu("b", &[("a", 1), ("d", 1)]),
            lsu("c", &[("a", 1), ("d", 1)]),
            lsu("d", &[("c", 1), ("b", 1)]),
        ];
        for _ in 0..5 {
            let paths = calculate_shortest_paths(&db, "a");
            assert_eq!(paths["d"].cost, 2);
            assert_eq!(paths["d"].first_hop.as_deref(), Some("b"));
        }
    }

    #[test]
    fn cheaper_longer_path_wins() {
        let db = vec![
            lsu("a", &[("b", 10), ("c", 1)]),
            lsu("b", &[("a", 10), ("c", 1)]),
            lsu("c", &[("a", 1), ("b", 1)]),
        ];
        let paths = calculate_shortest_paths(&db, "a");
        assert_eq!(paths["b"].cost, 2);
        assert_eq!(paths["b"].first_hop.as_deref(), Some("c"));
    }

    #[test]
    fn root_without_advertisement_reaches_nothing() {
        let db = vec![lsu("b", &[("c", 1)]), lsu("c", &[("b", 1)])];
        let paths = calculate_shortest_paths(&db, "a");
        assert_eq!(paths.len(), 1);
        assert!(paths.contains_key("a"));
    }
}
