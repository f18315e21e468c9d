//! Core types and traits for the Strata pipeline engine.
//!
//! This module contains the foundational pieces the pipeline is built from:
//! - Region algebra over N-dimensional index boxes
//! - The logical clock behind staleness decisions
//! - Value types and output information
//! - Data objects (versioned stage outputs)
//! - The ProcessObject trait and stage metadata
//! - Error types
//! - Information and execution contexts

pub mod region;
pub mod time;
pub mod types;
pub mod data;
pub mod error;
pub mod context;
pub mod node;

// Re-export commonly used types
pub use region::{bounding_union, contains, crop_to_largest, intersect, Region};
pub use time::TimeStamp;
pub use types::{ArrayBuffer, DataValue, ImageInformation};
pub use data::DataObject;
pub use error::{GraphError, NodeId, PipelineError, StrataError};
pub use context::{ExecutionContext, InformationContext};
pub use node::{PortDefinition, ProcessObject, StageKind, StageMetadata};
