//! The ProcessObject trait and stage metadata.
//!
//! A stage is described by a small capability interface rather than a class
//! hierarchy: it declares its ports, derives output information from its
//! inputs, maps an output region onto the input regions it needs, and
//! computes one output at a time.

use crate::core::context::{ExecutionContext, InformationContext};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::region::Region;
use crate::core::types::{DataValue, ImageInformation};
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Capability set a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Produces data without inputs (arrays, files, generators)
    Source,
    /// One input, one output
    Transform,
    /// Several inputs, one output
    Combine,
    /// One input, one output per schedule level
    MultiLevel,
    /// Scalar measurements over an input
    Statistics,
}

impl StageKind {
    /// Get the display name for this kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            StageKind::Source => "Source",
            StageKind::Transform => "Transform",
            StageKind::Combine => "Combine",
            StageKind::MultiLevel => "Multi-level",
            StageKind::Statistics => "Statistics",
        }
    }
}

/// A named input or output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    /// Port name, unique among the stage's inputs (or outputs)
    pub name: String,
    /// Human readable description
    pub description: String,
    /// Whether an input may stay unbound
    pub optional: bool,
}

impl PortDefinition {
    /// A required port.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            optional: false,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the port optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Metadata describing a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetadata {
    /// Identifier of the stage type (e.g., "shrink")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Capability set
    pub kind: StageKind,
    /// Input slots, in order
    pub inputs: Vec<PortDefinition>,
    /// Output slots, in order
    pub outputs: Vec<PortDefinition>,
}

impl StageMetadata {
    /// Create a new metadata builder.
    pub fn builder(id: impl Into<String>, name: impl Into<String>) -> StageMetadataBuilder {
        StageMetadataBuilder::new(id, name)
    }

    /// Position of the input named `name`.
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    /// Position of the output named `name`.
    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }
}

/// Builder for StageMetadata.
pub struct StageMetadataBuilder {
    id: String,
    name: String,
    kind: StageKind,
    inputs: Vec<PortDefinition>,
    outputs: Vec<PortDefinition>,
}

impl StageMetadataBuilder {
    /// Create a new builder with required fields.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: StageKind::Transform,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Set the kind.
    pub fn kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add an input port.
    pub fn input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    /// Add an output port.
    pub fn output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }

    /// Build the metadata.
    pub fn build(self) -> StageMetadata {
        StageMetadata {
            id: self.id,
            name: self.name,
            kind: self.kind,
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}

/// Upcast helper so the pipeline can hand out typed access to a stage.
pub trait AsAny: Any {
    /// Borrow as `Any`.
    fn as_any(&self) -> &dyn Any;
    /// Borrow mutably as `Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A pipeline stage.
///
/// Implementations must be pure functions of their inputs and configuration:
/// the pipeline only re-executes a stage when its configuration or something
/// upstream has been modified.
pub trait ProcessObject: AsAny + Send + Sync {
    /// Ports and identity of this stage.
    fn metadata(&self) -> StageMetadata;

    /// Describe every output from the inputs' information.
    ///
    /// The default copies the information of input 0 to each output, which
    /// suits stages that keep the geometry of their input.
    fn generate_output_information(
        &self,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<ImageInformation>> {
        let info = ctx.input_information(0)?.clone();
        let outputs = self.metadata().outputs.len();
        Ok(vec![info; outputs])
    }

    /// Region needed on each input to produce `region` on `output`.
    ///
    /// Returns one entry per input slot; `None` for unbound optional inputs.
    /// The default asks every bound input for the same region.
    fn required_input_regions(
        &self,
        output: usize,
        region: &Region,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<Option<Region>>> {
        let _ = output;
        Ok((0..ctx.input_count())
            .map(|i| ctx.is_bound(i).then(|| region.clone()))
            .collect())
    }

    /// Compute the output `ctx.output_index()` over at least `ctx.output_region()`.
    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue>;
}

/// Helper for stages whose computation failed for a stage-specific reason.
pub fn execution_error(ctx: &ExecutionContext<'_>, error: impl ToString) -> PipelineError {
    PipelineError::Execution {
        node_id: ctx.node_id(),
        error: error.to_string(),
    }
}
