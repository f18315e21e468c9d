//! # Strata - Demand-driven Array Pipelines
//!
//! Strata is a pipeline engine for multi-dimensional arrays. Stages are
//! connected into a graph and nothing is computed until a consumer asks for
//! an output. Only the requested sub-region is computed, and only when
//! something upstream changed since it was last produced.
//!
//! ## Features
//!
//! - **Region negotiation**: each stage maps a requested output region onto
//!   the input regions it needs, so a request for a corner of an image only
//!   reads that corner (plus any halo) from upstream
//! - **Staleness tracking**: a process-wide logical clock decides which
//!   outputs are out of date; repeated requests are free
//! - **Multi-resolution pyramids**: shrink schedules and a pyramid stage whose
//!   levels are independently requested and cached
//! - **Observers**: per-stage event channels for start, progress, iteration,
//!   end and abort events
//! - **Data parallelism**: stages split their work across rayon workers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use strata::prelude::*;
//!
//! let image = ArrayBuffer::from_fn(Region::from_size([64, 64]), |idx| idx[0] as f32)?;
//!
//! let mut pipeline = Pipeline::new();
//! let source = pipeline.add_stage(ArraySource::new(image));
//! let pyramid = pipeline.add_stage(MultiResolutionPyramid::new(2));
//! pipeline.connect(source, "output", pyramid, "input")?;
//!
//! pipeline.configure::<MultiResolutionPyramid, _, _>(pyramid, |p| p.set_number_of_levels(3))?;
//!
//! // Only the top-left quarter of the coarsest level
//! let report = pipeline.update_region(pyramid, "level_0", Region::new([0, 0], [8, 8]))?;
//! println!("{} outputs executed", report.stats.outputs_executed);
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: regions, data objects, the logical clock, the
//!   [`ProcessObject`](core::node::ProcessObject) trait and error types
//! - [`graph`]: the pipeline arena, bindings and snapshots
//! - [`execution`]: the update engine and event channels
//! - [`filters`]: shrink schedules and the built-in stages
//!
//! ## Writing a Stage
//!
//! ```rust,ignore
//! use strata::prelude::*;
//!
//! struct Negate;
//!
//! impl ProcessObject for Negate {
//!     fn metadata(&self) -> StageMetadata {
//!         StageMetadata::builder("negate", "Negate")
//!             .kind(StageKind::Transform)
//!             .input(PortDefinition::new("input"))
//!             .output(PortDefinition::new("output"))
//!             .build()
//!     }
//!
//!     fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
//!         let input = ctx.input_array(0)?;
//!         let buffer = ctx.generate_buffer(|idx| -input.get(idx).unwrap_or(0.0))?;
//!         Ok(buffer.into())
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod execution;
pub mod filters;
pub mod graph;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use strata::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::data::DataObject;
    pub use crate::core::region::{bounding_union, contains, crop_to_largest, intersect, Region};
    pub use crate::core::time::TimeStamp;
    pub use crate::core::types::{ArrayBuffer, DataValue, ImageInformation};

    // Stage trait and metadata
    pub use crate::core::node::{PortDefinition, ProcessObject, StageKind, StageMetadata};

    // Contexts
    pub use crate::core::context::{ExecutionContext, InformationContext};

    // Errors
    pub use crate::core::error::{
        GraphError, GraphResult, NodeId, PipelineError, PipelineResult, StrataError, StrataResult,
    };

    // Graph
    pub use crate::graph::connection::{Connection, Endpoint};
    pub use crate::graph::serialization::PipelineSnapshot;
    pub use crate::graph::structure::Pipeline;

    // Execution
    pub use crate::execution::engine::{ExecutionOptions, UpdateReport, UpdateStats};
    pub use crate::execution::events::{AbortFlag, Event, EventKind, EventPayload, ListenerId};

    // Schedules
    pub use crate::filters::schedule::{Schedule, ScheduleBuilder};

    // Built-in stages
    pub use crate::filters::builtin::{
        // Sources
        ArraySource, FunctionSource, ImageSource,
        // Transforms
        CombineStage, MeanSmoothing, PointwiseStage, ShrinkStage,
        // Multi-level
        MultiResolutionPyramid,
        // Statistics
        StatisticFeature, StatisticsStage,
    };
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
