//! Mesh node registry.
//!
//! Nodes live in an arena with a separate id index, and each slot carries its
//! own atomic load counter. Reservation is a compare-and-swap on that counter,
//! so concurrent placements can never push a node past its capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;

use crate::distribution::types::{MeshNode, NodeId};
use crate::error::{DropError, DropResult};
use crate::location::Coordinates;

/// Read access to mesh nodes plus capacity reservation.
pub trait NodeRegistry: Send + Sync {
    /// Snapshot of a node, if registered.
    fn get(&self, node_id: &str) -> DropResult<Option<MeshNode>>;

    /// Snapshots of every online node.
    fn online_nodes(&self) -> DropResult<Vec<MeshNode>>;

    /// Atomically take one capacity slot on a node.
    fn try_reserve_slot(&self, node_id: &str) -> DropResult<()>;

    /// Return a slot taken with [`NodeRegistry::try_reserve_slot`].
    fn release_slot(&self, node_id: &str) -> DropResult<()>;
}

/// Load and capacity live outside the record lock.
#[derive(Debug)]
struct NodeSlot {
    record: RwLock<MeshNode>,
    load: AtomicU32,
    capacity: u32,
}

impl NodeSlot {
    fn snapshot(&self) -> DropResult<MeshNode> {
        let record = self
            .record
            .read()
            .map_err(|_| DropError::Internal("node record lock poisoned".to_string()))?;
        let mut node = record.clone();
        node.current_load = self.load.load(Ordering::Acquire);
        node.capacity = self.capacity;
        Ok(node)
    }
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Arc<NodeSlot>>,
    index: HashMap<NodeId, usize>,
}

/// Process-local registry.
#[derive(Debug, Default)]
pub struct InMemoryNodeRegistry {
    arena: RwLock<Arena>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, node_id: &str) -> DropResult<Option<Arc<NodeSlot>>> {
        let arena = self
            .arena
            .read()
            .map_err(|_| DropError::Internal("registry lock poisoned".to_string()))?;
        Ok(arena
            .index
            .get(node_id)
            .map(|&idx| Arc::clone(&arena.slots[idx])))
    }

    fn require_slot(&self, node_id: &str) -> DropResult<Arc<NodeSlot>> {
        self.slot(node_id)?
            .ok_or_else(|| DropError::NodeNotFound(node_id.to_string()))
    }

    fn update(&self, node_id: &str, f: impl FnOnce(&mut MeshNode)) -> DropResult<()> {
        let slot = self.require_slot(node_id)?;
        let mut record = slot
            .record
            .write()
            .map_err(|_| DropError::Internal("node record lock poisoned".to_string()))?;
        f(&mut *record);
        Ok(())
    }

    /// Add a node. Its initial load is taken from `node.current_load`.
    pub fn register(&self, node: MeshNode) -> DropResult<()> {
        if node.current_load > node.capacity {
            return Err(DropError::InvalidInput(format!(
                "node {} load {} exceeds capacity {}",
                node.id, node.current_load, node.capacity
            )));
        }

        let mut arena = self
            .arena
            .write()
            .map_err(|_| DropError::Internal("registry lock poisoned".to_string()))?;
        if arena.index.contains_key(&node.id) {
            return Err(DropError::InvalidInput(format!(
                "node {} is already registered",
                node.id
            )));
        }

        let id = node.id.clone();
        let slot = NodeSlot {
            load: AtomicU32::new(node.current_load),
            capacity: node.capacity,
            record: RwLock::new(node),
        };
        let idx = arena.slots.len();
        arena.slots.push(Arc::new(slot));
        arena.index.insert(id.clone(), idx);

        tracing::debug!(node_id = %id, "Registered mesh node");
        Ok(())
    }

    /// Mark a node online or offline. Going online refreshes `last_seen`.
    pub fn set_online(&self, node_id: &str, online: bool) -> DropResult<()> {
        self.update(node_id, |node| {
            node.is_online = online;
            if online {
                node.last_seen = Utc::now();
            }
        })
    }

    pub fn set_location(&self, node_id: &str, location: Coordinates) -> DropResult<()> {
        self.update(node_id, |node| {
            node.last_known_location = Some(location);
            node.last_seen = Utc::now();
        })
    }

    pub fn set_trust(&self, node_id: &str, trust_score: f64) -> DropResult<()> {
        self.update(node_id, |node| node.trust_score = trust_score.clamp(0.0, 1.0))
    }

    /// Current load of a node.
    pub fn load(&self, node_id: &str) -> DropResult<u32> {
        Ok(self.require_slot(node_id)?.load.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.arena.read().map(|a| a.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeRegistry for InMemoryNodeRegistry {
    fn get(&self, node_id: &str) -> DropResult<Option<MeshNode>> {
        self.slot(node_id)?.map(|slot| slot.snapshot()).transpose()
    }

    fn online_nodes(&self) -> DropResult<Vec<MeshNode>> {
        let slots: Vec<Arc<NodeSlot>> = {
            let arena = self
                .arena
                .read()
                .map_err(|_| DropError::Internal("registry lock poisoned".to_string()))?;
            arena.slots.clone()
        };

        let mut nodes = Vec::with_capacity(slots.len());
        for slot in slots {
            let node = slot.snapshot()?;
            if node.is_online {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    fn try_reserve_slot(&self, node_id: &str) -> DropResult<()> {
        let slot = self.require_slot(node_id)?;
        let capacity = slot.capacity;
        slot.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                (load < capacity).then_some(load + 1)
            })
            .map(|_| ())
            .map_err(|_| DropError::CapacityExceeded {
                node_id: node_id.to_string(),
                capacity,
            })
    }

    fn release_slot(&self, node_id: &str) -> DropResult<()> {
        let slot = self.require_slot(node_id)?;
        if slot
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                load.checked_sub(1)
            })
            .is_err()
        {
            tracing::warn!(node_id, "Released a slot on a node with no load");
        }
        Ok(())
    }
}
