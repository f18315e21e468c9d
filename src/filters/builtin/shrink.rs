//! Integer-factor reduction: ShrinkStage

use crate::core::context::{ExecutionContext, InformationContext};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::node::{PortDefinition, ProcessObject, StageKind, StageMetadata};
use crate::core::region::{crop_to_largest, Region};
use crate::core::types::{DataValue, ImageInformation};

/// Reduces resolution by an integer factor per axis.
///
/// Output sample `o` is the mean of the input block `[o*f, o*f + f)` on each
/// axis, clipped to the input's largest region: a box smoothing followed by
/// subsampling. Spacing grows by `f` and the origin moves by
/// `(f - 1) / 2 * spacing` so the physical center of each block is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShrinkStage {
    factors: Vec<u32>,
}

impl ShrinkStage {
    /// Shrink axis `j` by `factors[j]`. Missing axes are not shrunk and
    /// factors below 1 are raised to 1.
    pub fn new(factors: impl Into<Vec<u32>>) -> Self {
        let mut stage = Self { factors: Vec::new() };
        stage.set_factors(factors);
        stage
    }

    /// Change the factors.
    pub fn set_factors(&mut self, factors: impl Into<Vec<u32>>) {
        self.factors = factors.into().into_iter().map(|f| f.max(1)).collect();
    }

    /// Current factors.
    pub fn factors(&self) -> &[u32] {
        &self.factors
    }

    fn factor(&self, axis: usize) -> i64 {
        self.factors.get(axis).copied().unwrap_or(1) as i64
    }

    /// Geometry of the output given the input's.
    pub fn shrink_information(&self, input: &ImageInformation) -> ImageInformation {
        let largest = &input.largest_possible_region;
        let dim = largest.dimension();
        let mut index = Vec::with_capacity(dim);
        let mut size = Vec::with_capacity(dim);
        let mut spacing = Vec::with_capacity(dim);
        let mut origin = Vec::with_capacity(dim);

        for j in 0..dim {
            let f = self.factor(j);
            let in_spacing = input.spacing.get(j).copied().unwrap_or(1.0);
            let in_origin = input.origin.get(j).copied().unwrap_or(0.0);
            index.push(largest.index()[j].div_euclid(f));
            size.push(if largest.size()[j] == 0 { 0 } else { (largest.size()[j] / f).max(1) });
            spacing.push(in_spacing * f as f64);
            origin.push(in_origin + (f - 1) as f64 / 2.0 * in_spacing);
        }

        ImageInformation {
            largest_possible_region: Region::new(index, size),
            spacing,
            origin,
        }
    }

    /// Input samples covering the blocks of `region`, before cropping.
    fn block_span(&self, region: &Region) -> Region {
        let dim = region.dimension();
        let index = (0..dim).map(|j| region.index()[j] * self.factor(j)).collect::<Vec<_>>();
        let size = (0..dim).map(|j| region.size()[j] * self.factor(j)).collect::<Vec<_>>();
        Region::new(index, size)
    }
}

impl ProcessObject for ShrinkStage {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("shrink", "Shrink")
            .kind(StageKind::Transform)
            .input(PortDefinition::new("input"))
            .output(PortDefinition::new("output").with_description("Reduced samples"))
            .build()
    }

    fn generate_output_information(
        &self,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<ImageInformation>> {
        Ok(vec![self.shrink_information(ctx.input_information(0)?)])
    }

    fn required_input_regions(
        &self,
        _output: usize,
        region: &Region,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<Option<Region>>> {
        let largest = &ctx.input_information(0)?.largest_possible_region;
        Ok(vec![Some(crop_to_largest(&self.block_span(region), largest))])
    }

    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
        let input = ctx.input_array(0)?;
        let factors: Vec<i64> = (0..ctx.output_region().dimension())
            .map(|j| self.factor(j))
            .collect();

        let buffer = ctx.generate_buffer(|idx| {
            let start: Vec<i64> = idx.iter().zip(&factors).map(|(&o, &f)| o * f).collect();
            input
                .mean_over(&Region::new(start, factors.clone()))
                .unwrap_or(f32::NAN)
        })?;

        if buffer.data().iter().any(|v| v.is_nan()) {
            return Err(PipelineError::Execution {
                node_id: ctx.node_id(),
                error: format!("input {} does not cover every block", input.region()),
            });
        }
        Ok(buffer.into())
    }
}
