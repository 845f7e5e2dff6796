//! Stochastic augmentation for the training split.
//!
//! The pipeline never owns a random generator. Callers pass one in, which
//! lets the loader derive a generator per sample and keep results
//! independent of how decoding is scheduled.

use image::{imageops, Rgb, RgbImage};
use plant_core::AugmentationConfig;
use rand::Rng;

/// Augmentation pipeline for plant images
#[derive(Debug, Clone)]
pub struct AugmentationPipeline {
    config: AugmentationConfig,
}

impl AugmentationPipeline {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Applies flip, rotation and colour jitter in that order.
    pub fn augment<R: Rng + ?Sized>(&self, image: RgbImage, rng: &mut R) -> RgbImage {
        if !self.config.enabled {
            return image;
        }

        let mut augmented = image;

        if self.config.horizontal_flip && rng.gen_bool(0.5) {
            augmented = imageops::flip_horizontal(&augmented);
        }

        if self.config.rotation_range > 0.0 {
            let range = self.config.rotation_range;
            let angle = rng.gen_range(-range..=range);
            augmented = rotate(&augmented, angle);
        }

        let brightness = sample_factor(rng, self.config.brightness_range);
        let contrast = sample_factor(rng, self.config.contrast_range);
        let saturation = sample_factor(rng, self.config.saturation_range);

        if brightness != 1.0 {
            adjust_brightness(&mut augmented, brightness);
        }
        if contrast != 1.0 {
            adjust_contrast(&mut augmented, contrast);
        }
        if saturation != 1.0 {
            adjust_saturation(&mut augmented, saturation);
        }

        augmented
    }
}

fn sample_factor<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (f32, f32)) -> f32 {
    if lo >= hi {
        lo
    } else {
        rng.gen_range(lo..=hi)
    }
}

/// Rotates about the image centre by `degrees`, keeping the canvas size.
/// Uncovered corners are filled with black; sampling is bilinear.
pub fn rotate(image: &RgbImage, degrees: f32) -> RgbImage {
    if degrees.abs() < f32::EPSILON {
        return image.clone();
    }

    let (width, height) = image.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    RgbImage::from_fn(width, height, |x, y| {
        // Inverse mapping: find the source pixel that lands on (x, y)
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;
        sample_bilinear(image, sx, sy)
    })
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    if x < -0.5 || y < -0.5 || x > width as f32 - 0.5 || y > height as f32 - 0.5 {
        return Rgb([0, 0, 0]);
    }
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

fn luminance(pixel: &Rgb<u8>) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

fn blend(value: u8, reference: f32, factor: f32) -> u8 {
    (reference + factor * (value as f32 - reference)).round().clamp(0.0, 255.0) as u8
}

pub fn adjust_brightness(image: &mut RgbImage, factor: f32) {
    for pixel in image.pixels_mut() {
        for c in 0..3 {
            pixel[c] = blend(pixel[c], 0.0, factor);
        }
    }
}

/// Blends every pixel with the mean grey level of the whole image.
pub fn adjust_contrast(image: &mut RgbImage, factor: f32) {
    let total = (image.width() * image.height()).max(1) as f32;
    let mean = image.pixels().map(luminance).sum::<f32>() / total;

    for pixel in image.pixels_mut() {
        for c in 0..3 {
            pixel[c] = blend(pixel[c], mean, factor);
        }
    }
}

/// Blends every pixel with its own grey level.
pub fn adjust_saturation(image: &mut RgbImage, factor: f32) {
    for pixel in image.pixels_mut() {
        let gray = luminance(pixel);
        for c in 0..3 {
            pixel[c] = blend(pixel[c], gray, factor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn create_test_image() -> RgbImage {
        RgbImage::from_fn(32, 32, |x, y| {
            if x < 16 && y < 16 {
                Rgb([255u8, 0u8, 0u8])
            } else if x >= 16 && y < 16 {
                Rgb([0u8, 255u8, 0u8])
            } else if x < 16 {
                Rgb([0u8, 0u8, 255u8])
            } else {
                Rgb([255u8, 255u8, 0u8])
            }
        })
    }

    #[test]
    fn test_same_seed_same_output() {
        let pipeline = AugmentationPipeline::new(AugmentationConfig::default());
        let image = create_test_image();

        let a = pipeline.augment(image.clone(), &mut ChaCha8Rng::seed_from_u64(9));
        let b = pipeline.augment(image.clone(), &mut ChaCha8Rng::seed_from_u64(9));

        assert_eq!(a, b);
        assert_eq!(a.dimensions(), image.dimensions());
    }

    #[test]
    fn test_disabled_is_identity() {
        let pipeline = AugmentationPipeline::new(AugmentationConfig::disabled());
        let image = create_test_image();

        let out = pipeline.augment(image.clone(), &mut ChaCha8Rng::seed_from_u64(1));
        assert_eq!(out, image);
    }

    #[test]
    fn test_rotate_180_mirrors_corners() {
        let image = create_test_image();
        let rotated = rotate(&image, 180.0);

        assert_eq!(rotated.dimensions(), image.dimensions());
        assert_eq!(rotated.get_pixel(0, 0), image.get_pixel(31, 31));
        assert_eq!(rotated.get_pixel(31, 0), image.get_pixel(0, 31));
    }

    #[test]
    fn test_rotate_fills_corners_with_black() {
        let image = RgbImage::from_pixel(20, 20, Rgb([200, 200, 200]));
        let rotated = rotate(&image, 45.0);

        assert_eq!(*rotated.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*rotated.get_pixel(10, 10), Rgb([200, 200, 200]));
    }

    #[test]
    fn test_colour_adjustments() {
        let mut image = RgbImage::from_pixel(2, 2, Rgb([100, 50, 200]));

        adjust_brightness(&mut image, 2.0);
        assert_eq!(*image.get_pixel(0, 0), Rgb([200, 100, 255]));

        let mut flat = RgbImage::from_pixel(2, 2, Rgb([100, 100, 100]));
        adjust_contrast(&mut flat, 1.5);
        assert_eq!(*flat.get_pixel(1, 1), Rgb([100, 100, 100]));

        let mut colour = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        adjust_saturation(&mut colour, 0.0);
        let p = colour.get_pixel(0, 0);
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
    }
}
