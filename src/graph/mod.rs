//! Graph module for managing pipelines.
//!
//! A pipeline is a directed acyclic graph where nodes are stages and edges
//! bind a producer's output to a consumer's input.

pub mod structure;
pub mod connection;
pub mod serialization;

// Re-export commonly used types
pub use structure::{InputSlot, OutputSlot, Pipeline, StageNode};
pub use connection::{Connection, Endpoint};
pub use serialization::{InputSnapshot, OutputSnapshot, PipelineSnapshot, StageSnapshot};
