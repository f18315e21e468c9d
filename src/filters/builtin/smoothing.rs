//! Neighborhood mean: MeanSmoothing

use crate::core::context::{ExecutionContext, InformationContext};
use crate::core::error::PipelineResult;
use crate::core::node::{PortDefinition, ProcessObject, StageKind, StageMetadata};
use crate::core::region::{crop_to_largest, Region};
use crate::core::types::DataValue;

/// Box mean over a `(2r + 1)` window per axis.
///
/// Each output region needs the input padded by the radius, cropped at the
/// input borders. Windows are clipped at the borders too, so edge samples
/// average fewer neighbors.
#[derive(Debug, Clone)]
pub struct MeanSmoothing {
    radius: Vec<i64>,
}

impl MeanSmoothing {
    /// Smooth with `radius[j]` samples on each side of axis `j`.
    ///
    /// Missing axes get radius 0; negative radii are treated as 0.
    pub fn new(radius: impl Into<Vec<i64>>) -> Self {
        let mut stage = Self { radius: Vec::new() };
        stage.set_radius(radius);
        stage
    }

    /// Change the radius.
    pub fn set_radius(&mut self, radius: impl Into<Vec<i64>>) {
        self.radius = radius.into().into_iter().map(|r| r.max(0)).collect();
    }

    /// Current radius.
    pub fn radius(&self) -> &[i64] {
        &self.radius
    }
}

impl ProcessObject for MeanSmoothing {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("mean_smoothing", "Mean Smoothing")
            .kind(StageKind::Transform)
            .input(PortDefinition::new("input"))
            .output(PortDefinition::new("output").with_description("Smoothed samples"))
            .build()
    }

    fn required_input_regions(
        &self,
        _output: usize,
        region: &Region,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<Option<Region>>> {
        let largest = &ctx.input_information(0)?.largest_possible_region;
        Ok(vec![Some(crop_to_largest(&region.padded(&self.radius), largest))])
    }

    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
        let input = ctx.input_array(0)?;
        let radius = &self.radius;
        let window_size: Vec<i64> = (0..ctx.output_region().dimension())
            .map(|j| 2 * radius.get(j).copied().unwrap_or(0) + 1)
            .collect();

        let buffer = ctx.generate_buffer(|idx| {
            let start: Vec<i64> = idx
                .iter()
                .enumerate()
                .map(|(j, &i)| i - radius.get(j).copied().unwrap_or(0))
                .collect();
            input
                .mean_over(&Region::new(start, window_size.clone()))
                .unwrap_or(0.0)
        })?;
        Ok(buffer.into())
    }
}
