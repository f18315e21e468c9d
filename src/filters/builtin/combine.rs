//! Two-input sample-wise combination: CombineStage

use crate::core::context::{ExecutionContext, InformationContext};
use crate::core::error::PipelineResult;
use crate::core::node::{execution_error, PortDefinition, ProcessObject, StageKind, StageMetadata};
use crate::core::region::{contains, intersect};
use crate::core::types::{ArrayBuffer, DataValue, ImageInformation};
use std::sync::Arc;

/// Combines two inputs sample by sample.
///
/// The output covers the overlap of both inputs' largest regions and takes
/// its spacing and origin from the left input.
#[derive(Clone)]
pub struct CombineStage {
    name: String,
    function: Arc<dyn Fn(f32, f32) -> f32 + Send + Sync>,
}

impl std::fmt::Debug for CombineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombineStage").field("name", &self.name).finish()
    }
}

impl CombineStage {
    /// Combine with `function(left, right)`.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(f32, f32) -> f32 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            function: Arc::new(function),
        }
    }

    /// `left + right`
    pub fn add() -> Self {
        Self::new("add", |a, b| a + b)
    }

    /// `left - right`
    pub fn subtract() -> Self {
        Self::new("subtract", |a, b| a - b)
    }

    /// `left * right`
    pub fn multiply() -> Self {
        Self::new("multiply", |a, b| a * b)
    }

    /// Replace the kernel.
    pub fn set_function<F>(&mut self, function: F)
    where
        F: Fn(f32, f32) -> f32 + Send + Sync + 'static,
    {
        self.function = Arc::new(function);
    }
}

impl ProcessObject for CombineStage {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("combine", self.name.clone())
            .kind(StageKind::Combine)
            .input(PortDefinition::new("left"))
            .input(PortDefinition::new("right"))
            .output(PortDefinition::new("output").with_description("Combined samples"))
            .build()
    }

    fn generate_output_information(
        &self,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<ImageInformation>> {
        let left = ctx.input_information(0)?;
        let right = ctx.input_information(1)?;
        let mut info = left.clone();
        info.largest_possible_region =
            intersect(&left.largest_possible_region, &right.largest_possible_region);
        Ok(vec![info])
    }

    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
        let region = ctx.output_region().clone();
        let left = ctx.input_array(0)?;
        let right = ctx.input_array(1)?;
        for input in [left, right] {
            if !contains(input.region(), &region) {
                return Err(execution_error(
                    ctx,
                    format!("input holds {} but {} is needed", input.region(), region),
                ));
            }
        }

        let function = &self.function;
        let lines = ctx.map_lines(region.line_count(), |line| {
            let start = region.line_start(line);
            let len = region.line_length();
            match (left.region().offset_of(&start), right.region().offset_of(&start)) {
                (Some(a), Some(b)) => left.data()[a..a + len]
                    .iter()
                    .zip(&right.data()[b..b + len])
                    .map(|(&l, &r)| function(l, r))
                    .collect(),
                _ => Vec::new(),
            }
        })?;
        Ok(ArrayBuffer::from_lines(region, lines)?.into())
    }
}
