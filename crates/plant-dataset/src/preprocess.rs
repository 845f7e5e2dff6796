//! Image decoding and preprocessing.
//!
//! Every image goes through the same steps: decode, convert to 8-bit RGB,
//! resize to the exact target size with bilinear (triangle) filtering, then
//! scale into `[0, 1]`. Mean/std normalization happens on the model side
//! (see [`IMAGENET_MEAN`] / [`IMAGENET_STD`]).

use image::imageops::{self, FilterType};
use image::{ImageReader, RgbImage};
use plant_core::{Error, ImageDimensions, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// ImageNet normalization means [R, G, B]
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet normalization standard deviations [R, G, B]
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Filter used for every resize in the pipeline.
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// A decoded image as a row-major `(H, W, 3)` f32 tensor in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTensor {
    pub height: u32,
    pub width: u32,
    pub data: Vec<f32>,
}

impl ImageTensor {
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let data = image.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        Self {
            height,
            width,
            data,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.height as usize, self.width as usize, 3]
    }

    /// Channel-first copy `(3, H, W)`, the layout convolution layers expect.
    pub fn to_chw(&self) -> Vec<f32> {
        let plane = self.height as usize * self.width as usize;
        let mut chw = vec![0.0; plane * 3];
        for (i, pixel) in self.data.chunks_exact(3).enumerate() {
            for c in 0..3 {
                chw[c * plane + i] = pixel[c];
            }
        }
        chw
    }
}

/// Decodes and resizes images to a fixed target size
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    target: ImageDimensions,
}

impl ImagePreprocessor {
    pub fn new(target: ImageDimensions) -> Self {
        Self { target }
    }

    pub fn target(&self) -> ImageDimensions {
        self.target
    }

    /// Decodes a file into 8-bit RGB. Any failure is a `CorruptSample`.
    pub fn decode(&self, path: &Path) -> Result<RgbImage> {
        let reader = ImageReader::open(path)
            .map_err(|e| Error::corrupt_sample(path, e))?
            .with_guessed_format()
            .map_err(|e| Error::corrupt_sample(path, e))?;

        let image = reader.decode().map_err(|e| Error::corrupt_sample(path, e))?;
        Ok(image.to_rgb8())
    }

    /// Resizes to the exact target size, ignoring aspect ratio.
    pub fn resize(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        if width == self.target.width && height == self.target.height {
            return image.clone();
        }
        imageops::resize(image, self.target.width, self.target.height, RESIZE_FILTER)
    }

    /// Decode + resize, without augmentation.
    pub fn load(&self, path: &Path) -> Result<RgbImage> {
        let image = self.decode(path)?;
        Ok(self.resize(&image))
    }

    /// Decode + resize + scale, ready for inference.
    pub fn load_tensor(&self, path: &Path) -> Result<ImageTensor> {
        Ok(ImageTensor::from_rgb(&self.load(path)?))
    }
}
