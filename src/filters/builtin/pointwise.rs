//! Sample-wise transform: PointwiseStage

use crate::core::context::ExecutionContext;
use crate::core::error::PipelineResult;
use crate::core::node::{execution_error, PortDefinition, ProcessObject, StageKind, StageMetadata};
use crate::core::region::contains;
use crate::core::types::{ArrayBuffer, DataValue};
use std::sync::Arc;

/// Applies a numeric kernel to every sample.
///
/// Output geometry equals input geometry, and each output region needs
/// exactly the same region of the input.
#[derive(Clone)]
pub struct PointwiseStage {
    name: String,
    function: Arc<dyn Fn(f32) -> f32 + Send + Sync>,
}

impl std::fmt::Debug for PointwiseStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointwiseStage").field("name", &self.name).finish()
    }
}

impl PointwiseStage {
    /// Apply `function` to every sample.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(f32) -> f32 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            function: Arc::new(function),
        }
    }

    /// Copy samples through unchanged.
    pub fn identity() -> Self {
        Self::new("identity", |v| v)
    }

    /// Replace the kernel.
    pub fn set_function<F>(&mut self, function: F)
    where
        F: Fn(f32) -> f32 + Send + Sync + 'static,
    {
        self.function = Arc::new(function);
    }

    /// Name of the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ProcessObject for PointwiseStage {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("pointwise", self.name.clone())
            .kind(StageKind::Transform)
            .input(PortDefinition::new("input"))
            .output(PortDefinition::new("output").with_description("Transformed samples"))
            .build()
    }

    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
        let region = ctx.output_region().clone();
        let input = ctx.input_array(0)?;
        if !contains(input.region(), &region) {
            return Err(execution_error(
                ctx,
                format!("input holds {} but {} is needed", input.region(), region),
            ));
        }

        let function = &self.function;
        let lines = ctx.map_lines(region.line_count(), |line| {
            let start = region.line_start(line);
            input
                .region()
                .offset_of(&start)
                .map(|offset| {
                    input.data()[offset..offset + region.line_length()]
                        .iter()
                        .map(|&v| function(v))
                        .collect()
                })
                .unwrap_or_default()
        })?;
        Ok(ArrayBuffer::from_lines(region, lines)?.into())
    }
}
