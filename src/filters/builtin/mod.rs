//! Built-in stages.
//!
//! Sources, sample-wise transforms, neighborhood and reduction stages, the
//! multi-resolution pyramid and whole-image statistics.

mod combine;
mod io;
mod pointwise;
mod pyramid;
mod shrink;
mod smoothing;
mod source;
mod statistics;

pub use combine::CombineStage;
pub use io::{save_array_as_image, ImageSource};
pub use pointwise::PointwiseStage;
pub use pyramid::{MultiResolutionPyramid, DEFAULT_LEVELS};
pub use shrink::ShrinkStage;
pub use smoothing::MeanSmoothing;
pub use source::{ArraySource, FunctionSource};
pub use statistics::{StatisticFeature, StatisticsStage};
