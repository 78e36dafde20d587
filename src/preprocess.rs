//! Deterministic pixel pipeline that makes receipt photos easier to read for OCR.
//!
//! Stage order is fixed: grayscale, polarity correction, blur, contrast/gamma,
//! sharpen, upscale. Each stage assumes the output of the previous one.

use crate::config::PreprocessConfig;
use crate::types::{PreprocessedImage, ValidatedImage};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 3x3 sharpen kernel `[-1 -1 -1; -1 12 -1; -1 -1 -1]` pre-divided by its sum (4).
pub const SHARPEN_KERNEL: [f32; 9] = [
    -0.25, -0.25, -0.25, //
    -0.25, 3.0, -0.25, //
    -0.25, -0.25, -0.25,
];

/// Pixel primitives the preprocessor is built from. Swappable for another imaging library.
pub trait PixelOps: Send + Sync {
    fn grayscale(&self, image: &DynamicImage) -> GrayImage;
    fn invert(&self, image: &mut GrayImage);
    fn blur(&self, image: &GrayImage, sigma: f32) -> GrayImage;
    /// Replace every intensity `v` with `lut[v]`.
    fn map_intensity(&self, image: &mut GrayImage, lut: &[u8; 256]);
    fn convolve3x3(&self, image: &GrayImage, kernel: &[f32; 9]) -> GrayImage;
    fn resize(&self, image: &GrayImage, width: u32, height: u32) -> GrayImage;
}

/// `PixelOps` backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCrateOps;

impl PixelOps for ImageCrateOps {
    fn grayscale(&self, image: &DynamicImage) -> GrayImage {
        image.to_luma8()
    }

    fn invert(&self, image: &mut GrayImage) {
        imageops::invert(image);
    }

    fn blur(&self, image: &GrayImage, sigma: f32) -> GrayImage {
        if sigma <= 0.0 {
            return image.clone();
        }
        imageops::blur(image, sigma)
    }

    fn map_intensity(&self, image: &mut GrayImage, lut: &[u8; 256]) {
        for pixel in image.pixels_mut() {
            pixel.0[0] = lut[pixel.0[0] as usize];
        }
    }

    fn convolve3x3(&self, image: &GrayImage, kernel: &[f32; 9]) -> GrayImage {
        let (width, height) = image.dimensions();
        let mut out = GrayImage::new(width, height);
        if width == 0 || height == 0 {
            return out;
        }
        // Border pixels read their nearest in-bounds neighbour.
        let at = |x: i64, y: i64| -> f32 {
            let cx = x.clamp(0, i64::from(width) - 1) as u32;
            let cy = y.clamp(0, i64::from(height) - 1) as u32;
            f32::from(image.get_pixel(cx, cy).0[0])
        };
        for y in 0..height {
            for x in 0..width {
                let (xi, yi) = (i64::from(x), i64::from(y));
                let mut acc = 0.0f32;
                for (k, weight) in kernel.iter().enumerate() {
                    let dx = (k % 3) as i64 - 1;
                    let dy = (k / 3) as i64 - 1;
                    acc += weight * at(xi + dx, yi + dy);
                }
                out.put_pixel(x, y, Luma([acc.round().clamp(0.0, 255.0) as u8]));
            }
        }
        out
    }

    fn resize(&self, image: &GrayImage, width: u32, height: u32) -> GrayImage {
        imageops::resize(image, width, height, FilterType::CatmullRom)
    }
}

/// Receives every preprocessed image, for debugging what the engine actually sees.
pub trait DiagnosticHook: Send + Sync {
    fn on_preprocessed(&self, filename: &str, image: &PreprocessedImage);
}

/// Writes each preprocessed image as `preprocessed_<name>_<millis>.png` into a directory.
#[derive(Debug, Clone)]
pub struct DirectoryDump {
    dir: PathBuf,
}

impl DirectoryDump {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DiagnosticHook for DirectoryDump {
    fn on_preprocessed(&self, filename: &str, image: &PreprocessedImage) {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("receipt");
        let path = self.dir.join(format!(
            "preprocessed_{}_{}.png",
            stem,
            chrono::Utc::now().timestamp_millis()
        ));
        let result = std::fs::create_dir_all(&self.dir)
            .map_err(|e| e.to_string())
            .and_then(|_| image.pixels().save(&path).map_err(|e| e.to_string()));
        match result {
            Ok(()) => tracing::debug!(path = %path.display(), "saved diagnostic image"),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to save diagnostic image"
            ),
        }
    }
}

pub struct ImagePreprocessor {
    config: PreprocessConfig,
    ops: Arc<dyn PixelOps>,
    diagnostics: Option<Arc<dyn DiagnosticHook>>,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self {
            config,
            ops: Arc::new(ImageCrateOps),
            diagnostics: None,
        }
    }

    pub fn with_ops(mut self, ops: Arc<dyn PixelOps>) -> Self {
        self.ops = ops;
        self
    }

    pub fn with_diagnostics(mut self, hook: Arc<dyn DiagnosticHook>) -> Self {
        self.diagnostics = Some(hook);
        self
    }

    /// Never fails: pathological input yields degraded output, judged downstream.
    pub fn preprocess(&self, input: &ValidatedImage) -> PreprocessedImage {
        let cfg = &self.config;
        let ops = self.ops.as_ref();

        let mut gray = ops.grayscale(&input.image);

        if is_dark_background(&gray, cfg.corner_inset, cfg.dark_background_threshold) {
            ops.invert(&mut gray);
            tracing::info!(file = %input.filename, "dark background detected, image inverted");
        }

        let mut gray = ops.blur(&gray, cfg.blur_sigma);
        ops.map_intensity(&mut gray, &contrast_gamma_lut(cfg.contrast_gain, cfg.gamma));
        let gray = ops.convolve3x3(&gray, &SHARPEN_KERNEL);

        let (w, h) = gray.dimensions();
        let factor = capped_upscale(w, h, cfg.upscale_factor, cfg.max_output_pixels);
        let gray = if factor == 1 {
            gray
        } else {
            ops.resize(&gray, w.saturating_mul(factor), h.saturating_mul(factor))
        };

        let out = PreprocessedImage::new(gray);
        if let Some(hook) = &self.diagnostics {
            hook.on_preprocessed(&input.filename, &out);
        }
        out
    }
}

/// Largest factor up to `factor` whose output stays within `max_pixels`; at least 1.
pub fn capped_upscale(width: u32, height: u32, factor: u32, max_pixels: u64) -> u32 {
    let area = u64::from(width) * u64::from(height);
    (1..=factor.max(1))
        .rev()
        .find(|&f| {
            area.checked_mul(u64::from(f) * u64::from(f))
                .is_some_and(|n| n <= max_pixels)
        })
        .unwrap_or(1)
}

/// Average of the four corner samples (`inset` px from each edge) below `threshold`.
pub fn is_dark_background(image: &GrayImage, inset: u32, threshold: u8) -> bool {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return false;
    }
    let near_x = inset.min(width - 1);
    let far_x = width.saturating_sub(inset).min(width - 1);
    let near_y = inset.min(height - 1);
    let far_y = height.saturating_sub(inset).min(height - 1);
    let sum: u32 = [
        (near_x, near_y),
        (far_x, near_y),
        (near_x, far_y),
        (far_x, far_y),
    ]
    .iter()
    .map(|&(x, y)| u32::from(image.get_pixel(x, y).0[0]))
    .sum();
    sum / 4 < u32::from(threshold)
}

/// Gain (saturating) followed by gamma, as a lookup table over 0..=255.
pub fn contrast_gamma_lut(gain: f32, gamma: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        let boosted = (v as f32 * gain).round().clamp(0.0, 255.0);
        let corrected = if boosted <= 0.0 {
            0.0
        } else {
            255.0 * (boosted / 255.0).powf(gamma)
        };
        *slot = corrected.round().clamp(0.0, 255.0) as u8;
    }
    lut
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::Mutex;

    fn validated(image: DynamicImage) -> ValidatedImage {
        ValidatedImage {
            image,
            filename: "receipt.png".into(),
            warnings: vec![],
        }
    }

    fn receipt_like(background: u8, ink: u8) -> DynamicImage {
        let mut img = RgbImage::from_pixel(60, 40, Rgb([background; 3]));
        for x in 15..45 {
            for y in 18..22 {
                img.put_pixel(x, y, Rgb([ink; 3]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn corner_average_decides_polarity() {
        assert!(is_dark_background(&GrayImage::from_pixel(50, 50, Luma([20])), 10, 128));
        assert!(!is_dark_background(&GrayImage::from_pixel(50, 50, Luma([230])), 10, 128));
        // boundary: 128 is not dark
        assert!(!is_dark_background(&GrayImage::from_pixel(50, 50, Luma([128])), 10, 128));
    }

    #[test]
    fn tiny_images_sample_inside_bounds() {
        assert!(is_dark_background(&GrayImage::from_pixel(3, 2, Luma([0])), 10, 128));
        assert!(!is_dark_background(&GrayImage::from_pixel(1, 1, Luma([255])), 10, 128));
    }

    #[test]
    fn lut_saturates_and_keeps_black() {
        let lut = contrast_gamma_lut(1.5, 0.8);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[255], 255);
        assert_eq!(lut[200], 255);
        assert!(lut[50] > 75);
        assert!(lut.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn sharpen_leaves_flat_regions_unchanged() {
        let flat = GrayImage::from_pixel(8, 8, Luma([90]));
        let out = ImageCrateOps.convolve3x3(&flat, &SHARPEN_KERNEL);
        assert!(out.pixels().all(|p| p.0[0] == 90));
    }

    #[test]
    fn output_is_single_channel_and_upscaled() {
        let pre = ImagePreprocessor::new(PreprocessConfig::default());
        let out = pre.preprocess(&validated(receipt_like(240, 20)));
        assert_eq!((out.width(), out.height()), (120, 80));
    }

    #[test]
    fn upscale_backs_off_to_fit_output_budget() {
        assert_eq!(capped_upscale(4000, 3000, 2, 64_000_000), 2);
        assert_eq!(capped_upscale(6000, 6000, 2, 64_000_000), 1);
        assert_eq!(capped_upscale(100, 100, 4, 90_000), 3);
        assert_eq!(capped_upscale(100, 100, 0, 1), 1);

        let config = PreprocessConfig {
            max_output_pixels: 60 * 40,
            ..PreprocessConfig::default()
        };
        let out = ImagePreprocessor::new(config).preprocess(&validated(receipt_like(240, 20)));
        assert_eq!((out.width(), out.height()), (60, 40));
    }

    #[test]
    fn same_input_gives_identical_output() {
        let pre = ImagePreprocessor::new(PreprocessConfig::default());
        let input = validated(receipt_like(240, 20));
        assert_eq!(pre.preprocess(&input), pre.preprocess(&input));
    }

    #[test]
    fn dark_background_is_inverted_light_is_not() {
        let pre = ImagePreprocessor::new(PreprocessConfig::default());
        let light = pre.preprocess(&validated(receipt_like(240, 20)));
        let dark = pre.preprocess(&validated(receipt_like(20, 240)));
        // both should end up light at the corners, dark where the ink was
        for out in [&light, &dark] {
            assert!(out.pixels().get_pixel(2, 2).0[0] > 200);
            assert!(out.pixels().get_pixel(60, 40).0[0] < 80);
        }
    }

    struct Recorder(Mutex<Vec<(String, u32)>>);

    impl DiagnosticHook for Recorder {
        fn on_preprocessed(&self, filename: &str, image: &PreprocessedImage) {
            self.0.lock().unwrap().push((filename.to_string(), image.width()));
        }
    }

    #[test]
    fn diagnostic_hook_sees_final_image() {
        let recorder = Arc::new(Recorder(Mutex::new(vec![])));
        let pre =
            ImagePreprocessor::new(PreprocessConfig::default()).with_diagnostics(recorder.clone());
        pre.preprocess(&validated(receipt_like(240, 20)));
        assert_eq!(*recorder.0.lock().unwrap(), vec![("receipt.png".to_string(), 120)]);
    }

    #[test]
    fn directory_dump_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let dump = DirectoryDump::new(dir.path().join("debug"));
        let img = PreprocessedImage::new(GrayImage::from_pixel(4, 4, Luma([255])));
        dump.on_preprocessed("shop.jpg", &img);
        let written: Vec<_> = std::fs::read_dir(dump.dir()).unwrap().flatten().collect();
        assert_eq!(written.len(), 1);
        let name = written[0].file_name().into_string().unwrap();
        assert!(name.starts_with("preprocessed_shop_") && name.ends_with(".png"));
    }
}
