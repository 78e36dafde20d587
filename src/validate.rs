//! Upload checks that run before any pixel work. No I/O.

use crate::config::ValidationConfig;
use crate::error::InvalidImageError;
use crate::types::{RawImage, ReceiptWarning, ValidatedImage};
use image::{ImageError, ImageReader, Limits};
use std::io::Cursor;

pub struct ImageValidator {
    config: ValidationConfig,
}

impl ImageValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Fail-fast checks in fixed order; resolution is advisory only.
    pub fn validate(&self, raw: &RawImage) -> Result<ValidatedImage, InvalidImageError> {
        if raw.is_empty() {
            return Err(InvalidImageError::EmptyPayload);
        }

        let content_type = normalize_content_type(&raw.content_type);
        if !self
            .config
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&content_type))
        {
            return Err(InvalidImageError::UnsupportedFormat {
                content_type: raw.content_type.clone(),
            });
        }

        if raw.len() > self.config.max_upload_bytes {
            return Err(InvalidImageError::PayloadTooLarge {
                size: raw.len(),
                max: self.config.max_upload_bytes,
            });
        }

        let (width, height) = ImageReader::new(Cursor::new(&raw.bytes))
            .with_guessed_format()
            .map_err(corrupt)?
            .into_dimensions()
            .map_err(corrupt)?;
        if width == 0 || height == 0 {
            return Err(InvalidImageError::CorruptImage {
                reason: "image has no pixels".to_string(),
            });
        }
        if width > self.config.max_image_width
            || height > self.config.max_image_height
            || u64::from(width) * u64::from(height) > self.config.max_pixel_area
        {
            return Err(InvalidImageError::DimensionsTooLarge { width, height });
        }

        let mut reader = ImageReader::new(Cursor::new(&raw.bytes))
            .with_guessed_format()
            .map_err(corrupt)?;
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.config.max_image_width);
        limits.max_image_height = Some(self.config.max_image_height);
        limits.max_alloc = Some(self.config.max_decode_bytes);
        reader.limits(limits);
        let image = reader.decode().map_err(|e| match e {
            ImageError::Limits(_) => InvalidImageError::DimensionsTooLarge { width, height },
            other => corrupt(other),
        })?;

        let mut warnings = Vec::new();
        if u64::from(width) * u64::from(height) < self.config.min_pixel_area {
            tracing::warn!(
                file = %raw.filename,
                width,
                height,
                "low resolution image"
            );
            warnings.push(ReceiptWarning::LowResolution);
        }

        Ok(ValidatedImage {
            image,
            filename: raw.filename.clone(),
            warnings,
        })
    }
}

fn corrupt(e: impl std::fmt::Display) -> InvalidImageError {
    InvalidImageError::CorruptImage {
        reason: e.to_string(),
    }
}

/// `"Image/PNG; charset=binary"` -> `"image/png"`.
fn normalize_content_type(declared: &str) -> String {
    declared
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([250, 250, 250]));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn validator() -> ImageValidator {
        ImageValidator::new(ValidationConfig::default())
    }

    #[test]
    fn empty_payload_is_rejected_first() {
        let raw = RawImage::new(vec![], "text/plain", "empty.txt");
        assert_eq!(validator().validate(&raw).unwrap_err(), InvalidImageError::EmptyPayload);
    }

    #[test]
    fn unsupported_content_type_is_rejected_before_size() {
        let raw = RawImage::new(vec![0u8; 11 * 1024 * 1024], "image/gif", "big.gif");
        assert!(matches!(
            validator().validate(&raw),
            Err(InvalidImageError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn oversized_payload_is_rejected_before_decoding() {
        let raw = RawImage::new(vec![0u8; 10 * 1024 * 1024 + 1], "image/jpeg", "big.jpg");
        assert_eq!(
            validator().validate(&raw).unwrap_err(),
            InvalidImageError::PayloadTooLarge {
                size: 10 * 1024 * 1024 + 1,
                max: 10 * 1024 * 1024
            }
        );
    }

    #[test]
    fn undecodable_bytes_are_corrupt() {
        let raw = RawImage::new(b"definitely not a png".to_vec(), "image/png", "x.png");
        assert!(matches!(
            validator().validate(&raw),
            Err(InvalidImageError::CorruptImage { .. })
        ));
    }

    #[test]
    fn content_type_parameters_and_case_are_ignored() {
        let raw = RawImage::new(png_bytes(600, 600), "Image/PNG; charset=binary", "ok.png");
        let validated = validator().validate(&raw).unwrap();
        assert!(validated.warnings.is_empty());
        assert_eq!(validated.filename, "ok.png");
    }

    #[test]
    fn small_image_passes_with_low_resolution_warning() {
        let raw = RawImage::new(png_bytes(400, 300), "image/png", "small.png");
        let validated = validator().validate(&raw).unwrap();
        assert_eq!(validated.warnings, vec![ReceiptWarning::LowResolution]);
    }

    #[test]
    fn payload_at_exactly_the_size_cap_passes_the_size_check() {
        let max = ValidationConfig::default().max_upload_bytes;
        let raw = RawImage::new(vec![0u8; max], "image/png", "zeros.png");
        assert!(matches!(
            validator().validate(&raw),
            Err(InvalidImageError::CorruptImage { .. })
        ));
    }

    #[test]
    fn area_equal_to_floor_has_no_warning() {
        let raw = RawImage::new(png_bytes(500, 500), "image/png", "square.png");
        assert!(validator().validate(&raw).unwrap().warnings.is_empty());

        let raw = RawImage::new(png_bytes(500, 499), "image/png", "short.png");
        assert_eq!(
            validator().validate(&raw).unwrap().warnings,
            vec![ReceiptWarning::LowResolution]
        );
    }

    #[test]
    fn oversized_dimensions_are_rejected_from_the_header() {
        let config = ValidationConfig {
            max_image_width: 100,
            ..ValidationConfig::default()
        };
        let raw = RawImage::new(png_bytes(101, 20), "image/png", "wide.png");
        assert_eq!(
            ImageValidator::new(config).validate(&raw).unwrap_err(),
            InvalidImageError::DimensionsTooLarge {
                width: 101,
                height: 20
            }
        );
    }

    #[test]
    fn pixel_area_cap_is_inclusive() {
        let config = ValidationConfig {
            max_pixel_area: 600 * 600,
            ..ValidationConfig::default()
        };
        let validator = ImageValidator::new(config);
        assert!(validator
            .validate(&RawImage::new(png_bytes(600, 600), "image/png", "ok.png"))
            .is_ok());
        assert!(matches!(
            validator.validate(&RawImage::new(png_bytes(600, 601), "image/png", "big.png")),
            Err(InvalidImageError::DimensionsTooLarge { .. })
        ));
    }
}
