//! Error types for Strata.
//!
//! Uses thiserror for structured errors with context. Errors carry the node
//! and port they concern so a failed update can be traced back to the stage
//! that caused it.

use crate::core::region::Region;
use crate::execution::events::EventKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a stage in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a node ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Top-level error type for Strata.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors related to pipeline structure.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphError {
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Port '{port}' not found on node {node_id}")]
    PortNotFound { node_id: NodeId, port: String },

    #[error("Port '{port}' on node {node_id} is already connected")]
    PortAlreadyConnected { node_id: NodeId, port: String },

    #[error("Cycle detected in pipeline involving nodes: {nodes:?}")]
    CycleDetected { nodes: Vec<NodeId> },

    #[error("Node {node_id} does not hold a stage of type {expected}")]
    StageTypeMismatch { node_id: NodeId, expected: String },
}

/// Errors surfaced by an update.
///
/// None of these are recovered inside the engine. Whatever the variant, the
/// output that failed keeps the buffered region, pipeline time and value it
/// had before the call.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Invalid region: {reason}")]
    InvalidRegion { reason: String },

    #[error("Missing input '{port}' for node {node_id}")]
    MissingInput { node_id: NodeId, port: String },

    #[error("Region {requested} on node {node_id} port '{port}' lies outside {largest}")]
    RegionOutsideBounds {
        node_id: NodeId,
        port: String,
        requested: Region,
        largest: Region,
    },

    #[error("Unknown feature '{name}'")]
    UnknownFeature { name: String },

    #[error("Execution of node {node_id} was aborted")]
    Aborted { node_id: NodeId },

    #[error("Listener for {kind:?} on node {node_id} failed: {message}")]
    ListenerFailure {
        node_id: NodeId,
        kind: EventKind,
        message: String,
    },

    #[error("Invalid schedule: {reason}")]
    InvalidSchedule { reason: String },

    #[error("Node {node_id} execution failed: {error}")]
    Execution { node_id: NodeId, error: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl PipelineError {
    /// Get the node ID that caused this error, if applicable.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            PipelineError::MissingInput { node_id, .. }
            | PipelineError::RegionOutsideBounds { node_id, .. }
            | PipelineError::Aborted { node_id }
            | PipelineError::ListenerFailure { node_id, .. }
            | PipelineError::Execution { node_id, .. } => Some(*node_id),
            PipelineError::Graph(GraphError::NodeNotFound(node_id)) => Some(*node_id),
            _ => None,
        }
    }

    /// Whether retrying the same update without changing anything can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Aborted { .. } | PipelineError::ListenerFailure { .. }
        )
    }
}

/// Result type alias for Strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

/// Result type alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Result type alias for pipeline updates.
pub type PipelineResult<T> = Result<T, PipelineError>;
