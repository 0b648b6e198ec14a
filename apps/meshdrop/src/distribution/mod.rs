//! Fragment distribution and collection.
//!
//! - `types`: drops, fragments, nodes and operation results
//! - `registry`: node records with atomic capacity slots
//! - `scoring`: strategy-based node ranking
//! - `transport`: the delivery seam to mesh nodes
//! - `coordinator`: the drop lifecycle

pub mod coordinator;
pub mod registry;
pub mod scoring;
pub mod transport;
pub mod types;

pub use coordinator::Coordinator;
pub use registry::{InMemoryNodeRegistry, NodeRegistry};
pub use scoring::{ScoredNode, rank_nodes, score_node, select_nodes};
pub use transport::{LoopbackTransport, MeshTransport, TransportError};
pub use types::{
    CollectionResult, CreateDropRequest, DeadDrop, DistributionResult, DistributionStatus,
    DropHealth, DropId, DropStatus, Fragment, FragmentHolder, MeshNode, NodeAssignment, NodeId,
    TargetLocation,
};
