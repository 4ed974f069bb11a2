//! A single HNSW graph level: a per-node, lockable neighbour list.

use parking_lot::RwLock;

/// Dense internal index into the graph's node arrays. Distinct from the
/// external `u64` vector id — `graph.rs` maintains the mapping.
pub type NodeId = usize;

/// Per-node neighbour lists for one graph level.
pub struct Layer {
    neighbors: Vec<RwLock<Vec<NodeId>>>,
}

impl Layer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            neighbors: Vec::new(),
        }
    }

    /// Grows the layer so that node `id` has a neighbour list, if it
    /// doesn't already.
    pub fn ensure_capacity(&mut self, id: NodeId) {
        if id >= self.neighbors.len() {
            self.neighbors.resize_with(id + 1, || RwLock::new(Vec::new()));
        }
    }

    #[must_use]
    pub fn get_neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors[id].read().clone()
    }

    pub fn set_neighbors(&self, id: NodeId, neighbors: Vec<NodeId>) {
        *self.neighbors[id].write() = neighbors;
    }

    pub fn add_neighbor(&self, id: NodeId, neighbor: NodeId) {
        let mut list = self.neighbors[id].write();
        if !list.contains(&neighbor) {
            list.push(neighbor);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Snapshots every node's neighbour list, for persistence.
    #[must_use]
    pub fn to_vecs(&self) -> Vec<Vec<NodeId>> {
        self.neighbors.iter().map(|n| n.read().clone()).collect()
    }

    /// Rebuilds a layer from a snapshot produced by [`Layer::to_vecs`].
    #[must_use]
    pub fn from_vecs(vecs: Vec<Vec<NodeId>>) -> Self {
        Self {
            neighbors: vecs.into_iter().map(RwLock::new).collect(),
        }
    }
}

impl Default for Layer {
    fn default() -> Self {
        Self::new()
    }
}
