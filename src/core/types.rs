//! Value types that flow through the pipeline.
//!
//! A stage output holds a [`DataValue`]: either an N-dimensional sample
//! buffer over a region or a single scalar measurement. [`ImageInformation`]
//! is the metadata a stage can describe about an output before computing it.

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::region::{contains, intersect, Region};
use serde::{Deserialize, Serialize};

/// Output information: everything known about an output without its samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInformation {
    /// The maximal extent the output could ever hold.
    pub largest_possible_region: Region,
    /// Physical distance between samples, per axis.
    pub spacing: Vec<f64>,
    /// Physical position of index zero, per axis.
    pub origin: Vec<f64>,
}

impl ImageInformation {
    /// Information with unit spacing and zero origin.
    pub fn new(largest_possible_region: Region) -> Self {
        let dim = largest_possible_region.dimension();
        Self {
            largest_possible_region,
            spacing: vec![1.0; dim],
            origin: vec![0.0; dim],
        }
    }

    /// Information for a scalar output.
    pub fn scalar() -> Self {
        Self::new(Region::scalar())
    }

    /// Set the spacing.
    pub fn with_spacing(mut self, spacing: impl Into<Vec<f64>>) -> Self {
        self.spacing = spacing.into();
        self
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: impl Into<Vec<f64>>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Number of axes.
    pub fn dimension(&self) -> usize {
        self.largest_possible_region.dimension()
    }
}

/// Dense `f32` samples over a region, axis 0 varying fastest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayBuffer {
    region: Region,
    data: Vec<f32>,
}

impl ArrayBuffer {
    /// Allocate a buffer filled with `fill`.
    pub fn new(region: Region, fill: f32) -> PipelineResult<Self> {
        region.validate()?;
        let len = region.num_pixels() as usize;
        Ok(Self {
            region,
            data: vec![fill; len],
        })
    }

    /// Wrap existing samples.
    pub fn from_vec(region: Region, data: Vec<f32>) -> PipelineResult<Self> {
        region.validate()?;
        if data.len() as u64 != region.num_pixels() {
            return Err(PipelineError::InvalidRegion {
                reason: format!(
                    "region {} holds {} samples but {} were supplied",
                    region,
                    region.num_pixels(),
                    data.len()
                ),
            });
        }
        Ok(Self { region, data })
    }

    /// Build a buffer by evaluating `f` at every index of `region`.
    pub fn from_fn<F>(region: Region, f: F) -> PipelineResult<Self>
    where
        F: Fn(&[i64]) -> f32,
    {
        region.validate()?;
        let mut data = Vec::with_capacity(region.num_pixels() as usize);
        for line in 0..region.line_count() {
            let mut idx = region.line_start(line);
            for _ in 0..region.line_length() {
                data.push(f(&idx));
                if let Some(first) = idx.first_mut() {
                    *first += 1;
                }
            }
        }
        Ok(Self { region, data })
    }

    /// Assemble a buffer from lines produced along axis 0.
    pub fn from_lines(region: Region, lines: Vec<Vec<f32>>) -> PipelineResult<Self> {
        let data = lines.into_iter().flatten().collect();
        Self::from_vec(region, data)
    }

    /// The region covered by this buffer.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Raw samples.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Raw samples, mutably.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sample at `idx`, if inside the buffer.
    pub fn get(&self, idx: &[i64]) -> Option<f32> {
        self.region.offset_of(idx).map(|o| self.data[o])
    }

    /// Overwrite the sample at `idx`. Returns false when `idx` is outside.
    pub fn set(&mut self, idx: &[i64], value: f32) -> bool {
        match self.region.offset_of(idx) {
            Some(o) => {
                self.data[o] = value;
                true
            }
            None => false,
        }
    }

    /// Mean of the samples in `window` clipped to this buffer.
    ///
    /// Returns `None` when the clipped window holds no samples.
    pub fn mean_over(&self, window: &Region) -> Option<f32> {
        let window = intersect(&self.region, window);
        if window.is_empty() {
            return None;
        }
        let mut sum = 0.0f64;
        for line in 0..window.line_count() {
            let offset = self.region.offset_of(&window.line_start(line))?;
            sum += self.data[offset..offset + window.line_length()]
                .iter()
                .map(|&v| v as f64)
                .sum::<f64>();
        }
        Some((sum / window.num_pixels() as f64) as f32)
    }

    /// Copy out the samples of `region`, which must lie inside this buffer.
    pub fn extract(&self, region: &Region) -> Option<ArrayBuffer> {
        if !contains(&self.region, region) {
            return None;
        }
        if region == &self.region {
            return Some(self.clone());
        }
        let mut data = Vec::with_capacity(region.num_pixels() as usize);
        for line in 0..region.line_count() {
            let start = region.line_start(line);
            let offset = self.region.offset_of(&start)?;
            data.extend_from_slice(&self.data[offset..offset + region.line_length()]);
        }
        Some(ArrayBuffer {
            region: region.clone(),
            data,
        })
    }
}

/// The value held by an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DataValue {
    /// Sample buffer
    Array(ArrayBuffer),
    /// Single measurement
    Scalar(f64),
}

impl DataValue {
    /// The region this value covers.
    pub fn region(&self) -> Region {
        match self {
            DataValue::Array(buffer) => buffer.region().clone(),
            DataValue::Scalar(_) => Region::scalar(),
        }
    }

    /// Try to get this value as an array.
    pub fn as_array(&self) -> Option<&ArrayBuffer> {
        if let DataValue::Array(buffer) = self {
            Some(buffer)
        } else {
            None
        }
    }

    /// Try to get this value as a scalar.
    pub fn as_scalar(&self) -> Option<f64> {
        if let DataValue::Scalar(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    /// Type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::Array(_) => "Array",
            DataValue::Scalar(_) => "Scalar",
        }
    }
}

impl From<ArrayBuffer> for DataValue {
    fn from(buffer: ArrayBuffer) -> Self {
        DataValue::Array(buffer)
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Scalar(v)
    }
}
