//! Delivery of sealed fragments to mesh nodes.
//!
//! The physical short-range radio is outside this crate. [`MeshTransport`] is
//! the seam; [`LoopbackTransport`] delivers in-process for tests and the
//! simulator.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

/// Delivery failure reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(String),

    #[error("node {node_id} rejected the payload: {reason}")]
    Rejected { node_id: String, reason: String },

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Sends opaque payloads to nodes. Callers apply their own timeout.
pub trait MeshTransport: Send + Sync {
    fn send(
        &self,
        node_id: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// In-process transport recording every delivery.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    deliveries: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    unreachable: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every send, e.g. to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make sends to `node_id` fail (or succeed again).
    pub fn set_unreachable(&self, node_id: &str, unreachable: bool) {
        let mut set = self
            .unreachable
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if unreachable {
            set.insert(node_id.to_string());
        } else {
            set.remove(node_id);
        }
    }

    /// Payloads delivered to `node_id`, oldest first.
    pub fn delivered_to(&self, node_id: &str) -> Vec<Vec<u8>> {
        self.deliveries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of successful deliveries.
    pub fn delivery_count(&self) -> usize {
        self.deliveries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    fn is_unreachable(&self, node_id: &str) -> bool {
        self.unreachable
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(node_id)
    }
}

impl MeshTransport for LoopbackTransport {
    async fn send(&self, node_id: &str, payload: &[u8]) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.is_unreachable(node_id) {
            return Err(TransportError::Unreachable(node_id.to_string()));
        }

        self.deliveries
            .lock()
            .map_err(|_| TransportError::Io("delivery log lock poisoned".to_string()))?
            .entry(node_id.to_string())
            .or_default()
            .push(payload.to_vec());
        Ok(())
    }
}
