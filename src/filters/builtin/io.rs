//! Image I/O: ImageSource and saving buffers as images

use crate::core::context::{ExecutionContext, InformationContext};
use crate::core::error::{NodeId, PipelineError, PipelineResult, StrataError, StrataResult};
use crate::core::node::{PortDefinition, ProcessObject, StageKind, StageMetadata};
use crate::core::region::Region;
use crate::core::types::{ArrayBuffer, DataValue, ImageInformation};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum ImageOrigin {
    File(PathBuf),
    Memory(Arc<DynamicImage>),
}

/// Reads a 2-D grayscale image.
///
/// For files only the header is read while information propagates; pixels
/// are decoded when the stage executes. Samples are luminance in `[0, 1]`,
/// indexed `[x, y]`.
#[derive(Debug, Clone)]
pub struct ImageSource {
    origin: ImageOrigin,
}

impl ImageSource {
    /// Read the image at `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            origin: ImageOrigin::File(path.into()),
        }
    }

    /// Serve an already decoded image.
    pub fn from_image(image: DynamicImage) -> Self {
        Self {
            origin: ImageOrigin::Memory(Arc::new(image)),
        }
    }

    /// Read a different file.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.origin = ImageOrigin::File(path.into());
    }

    /// The file path, when reading from disk.
    pub fn path(&self) -> Option<&Path> {
        match &self.origin {
            ImageOrigin::File(path) => Some(path),
            ImageOrigin::Memory(_) => None,
        }
    }

    fn dimensions(&self, node_id: NodeId) -> PipelineResult<(u32, u32)> {
        match &self.origin {
            ImageOrigin::File(path) => {
                image::image_dimensions(path).map_err(|e| read_error(node_id, path, e))
            }
            ImageOrigin::Memory(image) => Ok((image.width(), image.height())),
        }
    }
}

fn read_error(node_id: NodeId, path: &Path, error: image::ImageError) -> PipelineError {
    PipelineError::Execution {
        node_id,
        error: format!("Failed to read image {}: {}", path.display(), error),
    }
}

impl ProcessObject for ImageSource {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("image_source", "Image Source")
            .kind(StageKind::Source)
            .output(PortDefinition::new("output").with_description("Luminance samples"))
            .build()
    }

    fn generate_output_information(
        &self,
        ctx: &InformationContext,
    ) -> PipelineResult<Vec<ImageInformation>> {
        let (width, height) = self.dimensions(ctx.node_id())?;
        Ok(vec![ImageInformation::new(Region::from_size([
            width as i64,
            height as i64,
        ]))])
    }

    fn generate_data(&self, ctx: &mut ExecutionContext<'_>) -> PipelineResult<DataValue> {
        let luma: ImageBuffer<Luma<f32>, Vec<f32>> = match &self.origin {
            ImageOrigin::File(path) => image::open(path)
                .map_err(|e| read_error(ctx.node_id(), path, e))?
                .to_luma32f(),
            ImageOrigin::Memory(image) => image.to_luma32f(),
        };

        let (width, height) = luma.dimensions();
        let largest = Region::from_size([width as i64, height as i64]);
        if ctx.output_information().largest_possible_region != largest {
            return Err(PipelineError::Execution {
                node_id: ctx.node_id(),
                error: format!("Image changed size to {} since it was described", largest),
            });
        }

        let buffer = ctx.generate_buffer(|idx| luma.get_pixel(idx[0] as u32, idx[1] as u32).0[0])?;
        Ok(buffer.into())
    }
}

/// Write a 2-D buffer as an 8-bit grayscale image.
///
/// Samples are clamped to `[0, 1]` and scaled to `0..=255`. The format is
/// chosen from the file extension.
pub fn save_array_as_image(buffer: &ArrayBuffer, path: impl AsRef<Path>) -> StrataResult<()> {
    let region = buffer.region();
    if region.dimension() != 2 {
        return Err(StrataError::Other(format!(
            "Only 2-D buffers can be saved as images, got {} axes",
            region.dimension()
        )));
    }
    let (x0, y0) = (region.index()[0], region.index()[1]);
    let (width, height) = (region.size()[0] as u32, region.size()[1] as u32);

    let image = GrayImage::from_fn(width, height, |x, y| {
        let value = buffer
            .get(&[x0 + x as i64, y0 + y as i64])
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        Luma([(value * 255.0).round() as u8])
    });
    image.save(path.as_ref())?;
    info!("Saved {}x{} image to {}", width, height, path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::structure::Pipeline;

    fn gradient() -> GrayImage {
        GrayImage::from_fn(6, 4, |x, y| Luma([(x * 40 + y) as u8]))
    }

    #[test]
    fn test_image_source_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradient.png");
        gradient().save(&path).unwrap();

        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ImageSource::from_path(&path));
        pipeline.update_output_information(src).unwrap();
        assert_eq!(
            pipeline.data(src, "output").unwrap().largest_possible_region(),
            Some(Region::from_size([6, 4]))
        );

        let report = pipeline
            .update_region(src, "output", Region::new([2, 1], [2, 2]))
            .unwrap();
        let out = report.output.as_array().unwrap();
        assert!((out.get(&[3, 2]).unwrap() - 122.0 / 255.0).abs() < 1e-6);
        assert_eq!(out.region(), &Region::new([2, 1], [2, 2]));
    }

    #[test]
    fn test_missing_file_fails_during_information() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ImageSource::from_path("/nonexistent/strata.png"));
        let result = pipeline.request_update(src, "output");
        assert!(matches!(result, Err(PipelineError::Execution { .. })));
    }

    #[test]
    fn test_image_source_from_memory() {
        let mut pipeline = Pipeline::new();
        let src = pipeline.add_stage(ImageSource::from_image(DynamicImage::ImageLuma8(gradient())));
        let report = pipeline.request_update(src, "output").unwrap();
        let out = report.output.as_array().unwrap();
        assert_eq!(out.len(), 24);
        assert_eq!(out.get(&[0, 0]), Some(0.0));
    }

    #[test]
    fn test_save_array_as_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let buffer = ArrayBuffer::from_fn(Region::new([1, 1], [3, 2]), |idx| {
            if idx[0] == 1 {
                1.0
            } else {
                0.0
            }
        })
        .unwrap();
        save_array_as_image(&buffer, &path).unwrap();

        let saved = image::open(&path).unwrap().to_luma8();
        assert_eq!(saved.dimensions(), (3, 2));
        assert_eq!(saved.get_pixel(0, 0).0[0], 255);
        assert_eq!(saved.get_pixel(1, 1).0[0], 0);

        let volume = ArrayBuffer::new(Region::from_size([2, 2, 2]), 0.0).unwrap();
        assert!(save_array_as_image(&volume, &path).is_err());
    }
}
