//! Whole-image measurements: StatisticsStage and named feature access

use crate::core::context::{ExecutionContext, InformationContext};
use crate::core::error::{NodeId, PipelineError, PipelineResult};
use crate::core::node::{execution_error, PortDefinition, ProcessObject, StageKind, StageMetadata};
use crate::core::region::Region;
use crate::core::types::{ArrayBuffer, DataValue, ImageInformation};
use crate::graph::structure::Pipeline;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A scalar measurement over every sample of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticFeature {
    /// Arithmetic mean
    Mean,
    /// Smallest sample
    Minimum,
    /// Largest sample
    Maximum,
    /// Sum of all samples
    Sum,
    /// Unbiased sample variance; 0 for fewer than two samples
    Variance,
    /// Square root of the variance
    Sigma,
}

impl StatisticFeature {
    /// Every feature, in output order.
    pub const ALL: [StatisticFeature; 6] = [
        StatisticFeature::Mean,
        StatisticFeature::Minimum,
        StatisticFeature::Maximum,
        StatisticFeature::Sum,
        StatisticFeature::Variance,
        StatisticFeature::Sigma,
    ];

    /// Output port name.
    pub fn name(&self) -> &'static str {
        match self {
            StatisticFeature::Mean => "mean",
            StatisticFeature::Minimum => "minimum",
            StatisticFeature::Maximum => "maximum",
            StatisticFeature::Sum => "sum",
            StatisticFeature::Variance => "variance",
            StatisticFeature::Sigma => "sigma",
        }
    }
}

impl fmt::Display for StatisticFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StatisticFeature {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        StatisticFeature::ALL
            .into_iter()
            .find(|feature| feature.name() == lower)
            .ok_or_else(|| PipelineError::UnknownFeature { name: s.to_string() })
    }
}

#[derive(Debug, Clone, Copy)]
struct Moments {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl Moments {
    fn of(buffer: &ArrayBuffer) -> Self {
        buffer.data().iter().fold(
            Moments {
                count: 0,
                sum: 0.0,
                sum_sq: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            },
            |m, &v| {
                let v = v as f64;
                Moments {
                    count: m.count + 1,
                    sum: m.sum + v,
                    sum_sq: m.sum_sq + v * v,
                    min: m.min.min(v),
                    max: m.max.max(v),
                }
            },
        )
    }

    fn variance(&self) -> f64 {
        if self.count <= 1 {
            return 0.0;
        }
        let n = self.count as f64;
        ((self.sum_sq - self.sum * self.sum / n) / (n - 1.0)).max(0.0)
    }

    fn feature(&self, feature: StatisticFeature) -> f64 {
        match feature {
            StatisticFeature::Mean => self.sum / self.count as f64,
            StatisticFeature::Minimum => self.min,
            StatisticFeature::Maximum => self.max,
            StatisticFeature::Sum => self.sum,
            StatisticFeature::Variance => self.variance(),
            StatisticFeature::Sigma => self.variance().sqrt(),
        }
    }
}

/// Computes [`StatisticFeature`]s over the whole input.
///
/// Each feature is its own scalar output named after the feature, so a
/// consumer can depend on just the measurement it needs. Every output needs
/// the input's entire largest region.
#[derive(Debug, Clone, Default)]
pub struct StatisticsStage;

impl StatisticsStage {
    /// Create the stage.
    pub fn new() -> Self {
        Self
    }
}

impl ProcessObject for StatisticsStage {
    fn metadata(&self) -> StageMetadata {
        let mut builder = StageMetadata::builder("statistics", "Statistics")
            .kind(StageKind::Statistics)
            .input(PortDefinition::new("input"));
        for feature in StatisticFeature::ALL {
            builder = builder.output(PortDefinition::new(feature.name()));
        }
        builder.build()
    }

    fn generate_output_information(
        &self,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<ImageInformation>> {
        ctx.input_information(0)?;
        Ok(vec![ImageInformation::scalar(); StatisticFeature::ALL.len()])
    }

    fn required_input_regions(
        &self,
        _output: usize,
        _region: &Region,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<Option<Region>>> {
        Ok(vec![Some(ctx.input_information(0)?.largest_possible_region.clone())])
    }

    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
        let feature = StatisticFeature::ALL
            .get(ctx.output_index())
            .copied()
            .ok_or_else(|| execution_error(ctx, "no such statistic"))?;
        let moments = Moments::of(ctx.input_array(0)?);
        if moments.count == 0 {
            return Err(execution_error(ctx, "input holds no samples"));
        }
        ctx.check_abort()?;
        Ok(DataValue::Scalar(moments.feature(feature)))
    }
}

impl Pipeline {
    /// Update and return feature `name` of the statistics stage `id`.
    ///
    /// Fails with `UnknownFeature` when `name` is not a [`StatisticFeature`].
    pub fn get_feature(&self, id: NodeId, name: &str) -> PipelineResult<f64> {
        let feature: StatisticFeature = name.parse()?;
        self.stage::<StatisticsStage>(id)?;
        let report = self.request_update(id, feature.name())?;
        report.output.as_scalar().ok_or_else(|| PipelineError::Execution {
            node_id: id,
            error: format!("feature '{}' is not a scalar", feature),
        })
    }
}
