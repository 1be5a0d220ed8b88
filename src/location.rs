//! Spatial placement machinery: a symmetric Euclidean-distance graph over
//! every registered client and chunk server, plus the per-client priority
//! table derived from it. Ported field-for-field from the Master's
//! `LocationGraph`/`ClientServerPriority` classes.

use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::protocol::{GraphData, GraphEdge, GraphNode, Location, NodeType, SpaceInfo};

fn euclidean(a: Location, b: Location) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

#[derive(Debug, Clone)]
pub struct ServerDistance {
    pub server_id: String,
    pub distance: f64,
    pub space_available: u64,
}

struct GraphInner {
    nodes: HashMap<String, Location>,
    node_types: HashMap<String, NodeType>,
    space_info: HashMap<String, SpaceInfo>,
    distances: HashMap<String, HashMap<String, f64>>,
}

/// Note: this lock is always the innermost lock relative to whichever of
/// the Master's four ordered locks (chunk-server/client/replication-queue/
/// file-metadata) triggered a graph update, per §5.
pub struct LocationGraph {
    inner: Mutex<GraphInner>,
}

impl Default for LocationGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationGraph {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GraphInner {
                nodes: HashMap::new(),
                node_types: HashMap::new(),
                space_info: HashMap::new(),
                distances: HashMap::new(),
            }),
        }
    }

    pub async fn add_node(&self, id: &str, location: Location, node_type: NodeType) {
        let mut inner = self.inner.lock().await;
        inner.nodes.insert(id.to_string(), location);
        inner.node_types.insert(id.to_string(), node_type);
        inner.recompute_distances_for(id);
    }

    pub async fn remove_node(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        inner.nodes.remove(id);
        inner.node_types.remove(id);
        inner.space_info.remove(id);
        inner.distances.remove(id);
        for others in inner.distances.values_mut() {
            others.remove(id);
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.nodes.contains_key(id)
    }

    pub async fn update_space_info(&self, id: &str, info: SpaceInfo) {
        let mut inner = self.inner.lock().await;
        if inner.nodes.contains_key(id) {
            inner.space_info.insert(id.to_string(), info);
        }
    }

    pub async fn distance(&self, a: &str, b: &str) -> Option<f64> {
        let inner = self.inner.lock().await;
        inner.distances.get(a).and_then(|m| m.get(b)).copied()
    }

    /// Ranks every currently-registered chunk server by ascending distance
    /// from `client_id`, tie-broken by descending available space.
    pub async fn get_nearest_chunk_servers(&self, client_id: &str, k: usize) -> Vec<ServerDistance> {
        let inner = self.inner.lock().await;
        let Some(distances) = inner.distances.get(client_id) else {
            return Vec::new();
        };
        let mut ranked: Vec<ServerDistance> = distances
            .iter()
            .filter(|(id, _)| inner.node_types.get(*id) == Some(&NodeType::ChunkServer))
            .map(|(id, dist)| ServerDistance {
                server_id: id.clone(),
                distance: *dist,
                space_available: inner
                    .space_info
                    .get(id)
                    .map(|s| s.available)
                    .unwrap_or(0),
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap()
                .then_with(|| b.space_available.cmp(&a.space_available))
        });
        ranked.truncate(k);
        ranked
    }

    pub async fn get_graph_data(&self, active_clients: &[String]) -> GraphData {
        let inner = self.inner.lock().await;
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut seen_pairs = HashSet::new();
        for (id, location) in &inner.nodes {
            nodes.push(GraphNode {
                id: id.clone(),
                node_type: inner.node_types.get(id).copied().unwrap_or(NodeType::Client),
                location: *location,
                space_info: inner.space_info.get(id).copied(),
            });
            if let Some(neighbors) = inner.distances.get(id) {
                for (other, distance) in neighbors {
                    let pair = if id < other {
                        (id.clone(), other.clone())
                    } else {
                        (other.clone(), id.clone())
                    };
                    if seen_pairs.insert(pair) {
                        edges.push(GraphEdge {
                            source: id.clone(),
                            target: other.clone(),
                            distance: *distance,
                        });
                    }
                }
            }
        }
        GraphData {
            nodes,
            edges,
            active_clients: active_clients.to_vec(),
            client_priorities: None,
        }
    }
}

impl GraphInner {
    fn recompute_distances_for(&mut self, id: &str) {
        let location = self.nodes[id];
        let mut row = HashMap::new();
        for (other_id, other_location) in &self.nodes {
            if other_id == id {
                continue;
            }
            let d = euclidean(location, *other_location);
            row.insert(other_id.clone(), d);
            self.distances
                .entry(other_id.clone())
                .or_default()
                .insert(id.to_string(), d);
        }
        self.distances.insert(id.to_string(), row);
    }
}

/// Per-client cache of chunk servers ranked by distance, recomputed on
/// every chunk-server heartbeat (§3).
pub struct ClientPriorityTable {
    inner: Mutex<HashMap<String, Vec<ServerDistance>>>,
}

impl Default for ClientPriorityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientPriorityTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn update_priorities(
        &self,
        client_id: &str,
        location: Location,
        servers: &[(String, Location, SpaceInfo)],
    ) {
        let mut ranked: Vec<ServerDistance> = servers
            .iter()
            .map(|(id, loc, space)| ServerDistance {
                server_id: id.clone(),
                distance: euclidean(location, *loc),
                space_available: space.available,
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap()
                .then_with(|| b.space_available.cmp(&a.space_available))
        });
        self.inner
            .lock()
            .await
            .insert(client_id.to_string(), ranked);
    }

    pub async fn remove_client(&self, client_id: &str) {
        self.inner.lock().await.remove(client_id);
    }

    /// Returns server ids from the priority list, in order, excluding
    /// `exclude`, up to `needed` entries.
    pub async fn get_priority_servers(
        &self,
        client_id: &str,
        exclude: &HashSet<String>,
        needed: usize,
    ) -> Vec<String> {
        let inner = self.inner.lock().await;
        match inner.get(client_id) {
            Some(ranked) => ranked
                .iter()
                .map(|sd| sd.server_id.clone())
                .filter(|id| !exclude.contains(id))
                .take(needed)
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn snapshot_ids(&self, client_id: &str) -> Option<Vec<String>> {
        self.inner
            .lock()
            .await
            .get(client_id)
            .map(|ranked| ranked.iter().map(|sd| sd.server_id.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ranks_servers_by_ascending_distance_then_descending_space() {
        let graph = LocationGraph::new();
        graph.add_node("c1", (0.0, 0.0), NodeType::Client).await;
        graph.add_node("a", (1.0, 0.0), NodeType::ChunkServer).await;
        graph.add_node("b", (100.0, 99.0), NodeType::ChunkServer).await;
        graph.add_node("d", (100.0, 100.0), NodeType::ChunkServer).await;
        graph
            .update_space_info(
                "b",
                SpaceInfo {
                    total: 100,
                    used: 0,
                    available: 50,
                },
            )
            .await;
        graph
            .update_space_info(
                "d",
                SpaceInfo {
                    total: 100,
                    used: 0,
                    available: 90,
                },
            )
            .await;

        let ranked = graph.get_nearest_chunk_servers("c1", 3).await;
        let ids: Vec<&str> = ranked.iter().map(|sd| sd.server_id.as_str()).collect();
        assert_eq!(ids[0], "a");

        let graph2 = LocationGraph::new();
        graph2.add_node("c2", (100.0, 100.0), NodeType::Client).await;
        graph2.add_node("a", (1.0, 0.0), NodeType::ChunkServer).await;
        graph2
            .add_node("b", (100.0, 99.0), NodeType::ChunkServer)
            .await;
        graph2
            .add_node("d", (100.0, 100.0), NodeType::ChunkServer)
            .await;
        let ranked2 = graph2.get_nearest_chunk_servers("c2", 3).await;
        let ids2: Vec<&str> = ranked2.iter().map(|sd| sd.server_id.as_str()).collect();
        assert_eq!(ids2[0], "d");
        assert_eq!(ids2[1], "b");
    }

    #[tokio::test]
    async fn remove_node_drops_it_from_every_neighbor_row() {
        let graph = LocationGraph::new();
        graph.add_node("a", (0.0, 0.0), NodeType::ChunkServer).await;
        graph.add_node("b", (1.0, 1.0), NodeType::ChunkServer).await;
        graph.remove_node("a").await;
        assert!(!graph.contains("a").await);
        assert_eq!(graph.distance("b", "a").await, None);
    }
}
