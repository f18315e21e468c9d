//! Connection types for the pipeline.

use crate::core::error::NodeId;
use serde::{Deserialize, Serialize};

/// An endpoint of a connection (node + port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// The node ID.
    pub node_id: NodeId,
    /// The port name on that node.
    pub port: String,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(node_id: NodeId, port: impl Into<String>) -> Self {
        Self {
            node_id,
            port: port.into(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node_id, self.port)
    }
}

/// A binding from a producer's output to a consumer's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Producer endpoint (output port).
    pub from: Endpoint,
    /// Consumer endpoint (input port).
    pub to: Endpoint,
}

impl Connection {
    /// Create a new connection.
    pub fn new(from: Endpoint, to: Endpoint) -> Self {
        Self { from, to }
    }
}
