//! Multi-resolution pyramid: one reduced output per schedule level

use super::shrink::ShrinkStage;
use crate::core::context::{ExecutionContext, InformationContext};
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::node::{PortDefinition, ProcessObject, StageKind, StageMetadata};
use crate::core::region::Region;
use crate::core::types::{DataValue, ImageInformation};
use crate::filters::schedule::{Schedule, ScheduleBuilder};
use log::debug;

/// Default number of levels for a new pyramid.
pub const DEFAULT_LEVELS: usize = 2;

/// Produces one output per schedule level, `level_0` being the coarsest.
///
/// Every level is computed by its own [`ShrinkStage`] from the single input,
/// so levels are independently requested and cached. Changing the number of
/// levels changes the set of outputs; consumers of removed levels are
/// unbound by [`Pipeline::configure`](crate::graph::structure::Pipeline::configure).
#[derive(Debug, Clone)]
pub struct MultiResolutionPyramid {
    num_axes: usize,
    schedule: Schedule,
    levels: Vec<ShrinkStage>,
}

impl MultiResolutionPyramid {
    /// A pyramid over `num_axes`-dimensional input with [`DEFAULT_LEVELS`] levels.
    pub fn new(num_axes: usize) -> Self {
        let mut pyramid = Self {
            num_axes,
            schedule: Schedule::default(),
            levels: Vec::new(),
        };
        pyramid.set_number_of_levels(DEFAULT_LEVELS);
        pyramid
    }

    fn install(&mut self, schedule: Schedule) {
        self.levels = schedule
            .rows()
            .iter()
            .map(|row| ShrinkStage::new(row.clone()))
            .collect();
        debug!("Pyramid schedule:\n{}", schedule);
        self.schedule = schedule;
    }

    /// Use `levels` levels, halving every axis per level.
    pub fn set_number_of_levels(&mut self, levels: usize) {
        self.install(ScheduleBuilder::build_from_level_count(levels, self.num_axes));
    }

    /// Keep the level count and restart the halving from `factors`.
    pub fn set_starting_shrink_factors(&mut self, factors: &[u32]) -> PipelineResult<()> {
        if factors.len() != self.num_axes {
            return Err(PipelineError::InvalidSchedule {
                reason: format!(
                    "{} starting factors given for {} axes",
                    factors.len(),
                    self.num_axes
                ),
            });
        }
        let levels = self.number_of_levels();
        self.install(ScheduleBuilder::build_from_start_factors(factors, levels));
        Ok(())
    }

    /// Same starting factor on every axis.
    pub fn set_starting_shrink_factor(&mut self, factor: u32) {
        let levels = self.number_of_levels();
        let start = vec![factor; self.num_axes];
        self.install(ScheduleBuilder::build_from_start_factors(&start, levels));
    }

    /// Replace the schedule with an explicit table.
    ///
    /// The table must have one row per level and one column per axis.
    /// Non-positive entries are raised to 1.
    pub fn set_schedule(&mut self, table: &[Vec<i64>]) -> PipelineResult<()> {
        let schedule = ScheduleBuilder::from_table(table)?;
        schedule.check_shape(self.number_of_levels(), self.num_axes)?;
        self.install(schedule);
        Ok(())
    }

    /// Current schedule.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Number of levels, and of outputs.
    pub fn number_of_levels(&self) -> usize {
        self.schedule.num_levels()
    }

    /// Factors of the coarsest level.
    pub fn starting_shrink_factors(&self) -> &[u32] {
        self.schedule.level(0).unwrap_or_default()
    }

    /// Dimension the pyramid expects of its input.
    pub fn num_axes(&self) -> usize {
        self.num_axes
    }

    fn level(&self, output: usize) -> PipelineResult<&ShrinkStage> {
        self.levels.get(output).ok_or_else(|| PipelineError::InvalidSchedule {
            reason: format!("no level {} in a {}-level pyramid", output, self.levels.len()),
        })
    }
}

impl ProcessObject for MultiResolutionPyramid {
    fn metadata(&self) -> StageMetadata {
        let mut builder = StageMetadata::builder("multi_resolution_pyramid", "Multi-Resolution Pyramid")
            .kind(StageKind::MultiLevel)
            .input(PortDefinition::new("input"));
        for (k, row) in self.schedule.rows().iter().enumerate() {
            builder = builder.output(
                PortDefinition::new(format!("level_{}", k))
                    .with_description(format!("Shrunk by {:?}", row)),
            );
        }
        builder.build()
    }

    fn generate_output_information(
        &self,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<ImageInformation>> {
        let input = ctx.input_information(0)?;
        if input.dimension() != self.num_axes {
            return Err(PipelineError::InvalidSchedule {
                reason: format!(
                    "pyramid is configured for {} axes but the input has {}",
                    self.num_axes,
                    input.dimension()
                ),
            });
        }
        Ok(self
            .levels
            .iter()
            .map(|level| level.shrink_information(input))
            .collect())
    }

    fn required_input_regions(
        &self,
        output: usize,
        region: &Region,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<Option<Region>>> {
        self.level(output)?.required_input_regions(0, region, ctx)
    }

    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
        let level = self.level(ctx.output_index())?;
        level.generate_data(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::NodeId;
    use crate::core::types::ArrayBuffer;
    use crate::filters::builtin::ArraySource;
    use crate::graph::structure::Pipeline;

    fn pyramid_over(size: [i64; 2], levels: usize) -> (Pipeline, NodeId, NodeId) {
        let buffer = ArrayBuffer::from_fn(Region::from_size(size), |idx| idx[0] as f32).unwrap();
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(buffer).with_spacing([1.0, 2.0]));
        let mut pyramid = MultiResolutionPyramid::new(2);
        pyramid.set_number_of_levels(levels);
        let pyr = pipeline.add_stage(pyramid);
        pipeline.connect(src, "output", pyr, "input").unwrap();
        (pipeline, src, pyr)
    }

    #[test]
    fn test_default_schedule() {
        let pyramid = MultiResolutionPyramid::new(3);
        assert_eq!(pyramid.number_of_levels(), 2);
        assert_eq!(pyramid.schedule().rows(), &[vec![2, 2, 2], vec![1, 1, 1]]);
        assert_eq!(pyramid.metadata().outputs.len(), 2);
        assert_eq!(pyramid.metadata().kind, StageKind::MultiLevel);
    }

    #[test]
    fn test_level_geometry() {
        let (pipeline, _, pyr) = pyramid_over([16, 10], 3);
        pipeline.update_output_information(pyr).unwrap();

        let level_0 = pipeline.data(pyr, "level_0").unwrap().information().unwrap();
        assert_eq!(level_0.largest_possible_region, Region::from_size([4, 2]));
        assert_eq!(level_0.spacing, vec![4.0, 8.0]);

        let level_1 = pipeline.data(pyr, "level_1").unwrap().information().unwrap();
        assert_eq!(level_1.largest_possible_region, Region::from_size([8, 5]));
        assert_eq!(level_1.spacing, vec![2.0, 4.0]);

        let level_2 = pipeline.data(pyr, "level_2").unwrap().information().unwrap();
        assert_eq!(level_2.largest_possible_region, Region::from_size([16, 10]));
    }

    #[test]
    fn test_finest_level_is_full_resolution() {
        let (pipeline, _, pyr) = pyramid_over([6, 6], 3);
        let report = pipeline.request_update(pyr, "level_2").unwrap();
        let data = pipeline.data(pyr, "level_2").unwrap();
        assert_eq!(data.buffered_region(), data.largest_possible_region());
        assert_eq!(report.output.as_array().unwrap().get(&[5, 0]), Some(5.0));
    }

    #[test]
    fn test_levels_cache_independently() {
        let (pipeline, _, pyr) = pyramid_over([8, 8], 2);

        let coarse = pipeline.request_update(pyr, "level_0").unwrap();
        assert_eq!(coarse.stats.outputs_executed, 2);
        let values = coarse.output.as_array().unwrap();
        assert_eq!(values.region(), &Region::from_size([4, 4]));
        assert_eq!(values.get(&[1, 3]), Some(2.5));

        let fine = pipeline.request_update(pyr, "level_1").unwrap();
        assert_eq!(fine.stats.outputs_executed, 1);

        let again = pipeline.request_update(pyr, "level_0").unwrap();
        assert_eq!(again.stats.outputs_executed, 0);
    }

    #[test]
    fn test_level_count_change_keeps_levels_updatable() {
        let (mut pipeline, _, pyr) = pyramid_over([16, 16], 2);
        let before = pipeline.request_update(pyr, "level_0").unwrap();
        assert_eq!(before.output.region(), Region::from_size([8, 8]));

        pipeline
            .configure::<MultiResolutionPyramid, _, _>(pyr, |p| p.set_number_of_levels(3))
            .unwrap();

        let coarse = pipeline.request_update(pyr, "level_0").unwrap();
        assert_eq!(coarse.output.region(), Region::from_size([4, 4]));
        let fine = pipeline.request_update(pyr, "level_2").unwrap();
        assert_eq!(fine.output.region(), Region::from_size([16, 16]));
    }

    #[test]
    fn test_starting_factors() {
        let mut pyramid = MultiResolutionPyramid::new(3);
        pyramid.set_number_of_levels(4);
        pyramid.set_starting_shrink_factors(&[8, 4, 2]).unwrap();
        assert_eq!(
            pyramid.schedule().rows(),
            &[vec![8, 4, 2], vec![4, 2, 1], vec![2, 1, 1], vec![1, 1, 1]]
        );
        assert!(pyramid.schedule().is_downward_divisible());
        assert_eq!(pyramid.starting_shrink_factors(), &[8, 4, 2]);

        assert!(matches!(
            pyramid.set_starting_shrink_factors(&[2, 2]),
            Err(PipelineError::InvalidSchedule { .. })
        ));

        pyramid.set_starting_shrink_factor(3);
        assert_eq!(pyramid.schedule().level(1), Some(&[1u32, 1, 1][..]));
    }

    #[test]
    fn test_explicit_schedule_clamps_zeros() {
        let mut pyramid = MultiResolutionPyramid::new(2);
        pyramid.set_schedule(&[vec![0, 4], vec![2, 0]]).unwrap();
        let rows = pyramid.schedule().rows();
        assert!(rows.iter().flatten().all(|&f| f >= 1));
        assert_eq!(rows[0], vec![1, 4]);
    }

    #[test]
    fn test_explicit_schedule_row_mismatch() {
        let mut pyramid = MultiResolutionPyramid::new(2);
        let table = vec![vec![4, 4], vec![2, 2], vec![1, 1]];
        assert!(matches!(
            pyramid.set_schedule(&table),
            Err(PipelineError::InvalidSchedule { .. })
        ));

        // Reconcile by changing the level count first
        pyramid.set_number_of_levels(3);
        pyramid.set_schedule(&table).unwrap();
        assert_eq!(pyramid.number_of_levels(), 3);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ArraySource::new(
            ArrayBuffer::new(Region::from_size([4]), 0.0).unwrap(),
        ));
        let pyr = pipeline.add_stage(MultiResolutionPyramid::new(2));
        pipeline.connect(src, "output", pyr, "input").unwrap();
        assert!(matches!(
            pipeline.request_update(pyr, "level_0"),
            Err(PipelineError::InvalidSchedule { .. })
        ));
    }
}
