//! Node ranking for fragment placement.

use rand::Rng;

use crate::config::DistributionStrategy;
use crate::distribution::types::MeshNode;
use crate::location::Coordinates;

/// Bonus scale for spare capacity, added under every strategy.
const LOAD_BONUS: f64 = 10.0;

/// A candidate node with its placement score.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: MeshNode,
    pub score: f64,
}

fn reliability_score(node: &MeshNode) -> f64 {
    node.trust_score * 100.0
}

fn locality_score(node: &MeshNode, target: &Coordinates) -> f64 {
    node.last_known_location
        .map_or(0.0, |location| 100.0 / (1.0 + location.distance_km(target)))
}

fn load_bonus(node: &MeshNode) -> f64 {
    if node.capacity == 0 {
        return 0.0;
    }
    LOAD_BONUS * (1.0 - f64::from(node.current_load) / f64::from(node.capacity))
}

/// Score a single node under `strategy`.
pub fn score_node<R: Rng>(
    node: &MeshNode,
    strategy: DistributionStrategy,
    target: &Coordinates,
    rng: &mut R,
) -> f64 {
    let base = match strategy {
        DistributionStrategy::ReliabilityFirst => reliability_score(node),
        DistributionStrategy::LocalityFirst => locality_score(node, target),
        DistributionStrategy::Random => rng.gen_range(0.0..100.0),
        DistributionStrategy::Balanced => {
            0.6 * reliability_score(node) + 0.4 * locality_score(node, target)
        }
    };
    base + load_bonus(node)
}

/// Rank online nodes with spare capacity, best first.
pub fn rank_nodes<R: Rng>(
    nodes: &[MeshNode],
    strategy: DistributionStrategy,
    target: &Coordinates,
    rng: &mut R,
) -> Vec<ScoredNode> {
    let mut scored: Vec<ScoredNode> = nodes
        .iter()
        .filter(|node| node.is_online && node.has_capacity())
        .map(|node| ScoredNode {
            score: score_node(node, strategy, target, rng),
            node: node.clone(),
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// The top `count` nodes in rank order.
pub fn select_nodes<R: Rng>(
    nodes: &[MeshNode],
    strategy: DistributionStrategy,
    target: &Coordinates,
    count: usize,
    rng: &mut R,
) -> Vec<MeshNode> {
    rank_nodes(nodes, strategy, target, rng)
        .into_iter()
        .take(count)
        .map(|scored| scored.node)
        .collect()
}
