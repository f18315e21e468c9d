//! In-memory sources: ArraySource, FunctionSource

use crate::core::context::{ExecutionContext, InformationContext};
use crate::core::error::PipelineResult;
use crate::core::node::{execution_error, PortDefinition, ProcessObject, StageKind, StageMetadata};
use crate::core::types::{ArrayBuffer, DataValue, ImageInformation};
use std::sync::Arc;

/// Serves samples from a buffer held in memory.
///
/// Only the requested region is copied out on each execution.
#[derive(Debug, Clone)]
pub struct ArraySource {
    buffer: Arc<ArrayBuffer>,
    spacing: Option<Vec<f64>>,
    origin: Option<Vec<f64>>,
}

impl ArraySource {
    /// Serve `buffer` with unit spacing and zero origin.
    pub fn new(buffer: ArrayBuffer) -> Self {
        Self {
            buffer: Arc::new(buffer),
            spacing: None,
            origin: None,
        }
    }

    /// Set the physical spacing.
    pub fn with_spacing(mut self, spacing: impl Into<Vec<f64>>) -> Self {
        self.spacing = Some(spacing.into());
        self
    }

    /// Set the physical origin.
    pub fn with_origin(mut self, origin: impl Into<Vec<f64>>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Replace the served buffer.
    pub fn set_buffer(&mut self, buffer: ArrayBuffer) {
        self.buffer = Arc::new(buffer);
    }

    /// The served buffer.
    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }
}

impl ProcessObject for ArraySource {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("array_source", "Array Source")
            .kind(StageKind::Source)
            .output(PortDefinition::new("output").with_description("Samples of the held buffer"))
            .build()
    }

    fn generate_output_information(
        &self,
        _ctx: &InformationContext,
    ) -> PipelineResult<Vec<ImageInformation>> {
        let mut info = ImageInformation::new(self.buffer.region().clone());
        if let Some(spacing) = &self.spacing {
            info.spacing = spacing.clone();
        }
        if let Some(origin) = &self.origin {
            info.origin = origin.clone();
        }
        Ok(vec![info])
    }

    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
        let region = ctx.output_region();
        let buffer = self.buffer.extract(region).ok_or_else(|| {
            execution_error(ctx, format!("{} lies outside the held buffer", region))
        })?;
        ctx.report_progress(1.0)?;
        Ok(buffer.into())
    }
}

/// Generates samples from a function of the index.
#[derive(Clone)]
pub struct FunctionSource {
    information: ImageInformation,
    function: Arc<dyn Fn(&[i64]) -> f32 + Send + Sync>,
}

impl std::fmt::Debug for FunctionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionSource")
            .field("information", &self.information)
            .finish()
    }
}

impl FunctionSource {
    /// Evaluate `function` at every index of the requested region.
    pub fn new<F>(information: ImageInformation, function: F) -> Self
    where
        F: Fn(&[i64]) -> f32 + Send + Sync + 'static,
    {
        Self {
            information,
            function: Arc::new(function),
        }
    }

    /// Change the described output.
    pub fn set_information(&mut self, information: ImageInformation) {
        self.information = information;
    }

    /// Replace the generating function.
    pub fn set_function<F>(&mut self, function: F)
    where
        F: Fn(&[i64]) -> f32 + Send + Sync + 'static,
    {
        self.function = Arc::new(function);
    }
}

impl ProcessObject for FunctionSource {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("function_source", "Function Source")
            .kind(StageKind::Source)
            .output(PortDefinition::new("output").with_description("Generated samples"))
            .build()
    }

    fn generate_output_information(
        &self,
        _ctx: &InformationContext,
    ) -> PipelineResult<Vec<ImageInformation>> {
        Ok(vec![self.information.clone()])
    }

    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
        let function = &self.function;
        Ok(ctx.generate_buffer(|idx| function(idx))?.into())
    }
}
