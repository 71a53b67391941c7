//! In-crate test doubles for the detector and encoder capabilities.

use crate::pipeline::{DetectError, Detector, EncodeError, Encoder};
use crate::types::{BoundingBox, Detection, Encoding};
use image::RgbImage;
use std::collections::VecDeque;

/// Returns the same detections for every image, filtered by confidence.
pub struct FixedDetector {
    detections: Vec<Detection>,
    failure: Option<String>,
    last_min_confidence: Option<f32>,
}

impl FixedDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections, failure: None, last_min_confidence: None }
    }

    pub fn failing(reason: &str) -> Self {
        Self { detections: Vec::new(), failure: Some(reason.to_string()), last_min_confidence: None }
    }

    pub fn last_min_confidence(&self) -> Option<f32> {
        self.last_min_confidence
    }
}

impl Detector for FixedDetector {
    fn detect(&mut self, _image: &RgbImage, min_confidence: f32) -> Result<Vec<Detection>, DetectError> {
        self.last_min_confidence = Some(min_confidence);
        if let Some(reason) = &self.failure {
            return Err(DetectError::InvalidImage(reason.clone()));
        }
        Ok(self
            .detections
            .iter()
            .filter(|d| d.confidence >= min_confidence)
            .copied()
            .collect())
    }
}

/// Red value at pixel (0, 0) that makes [`PixelCountDetector`] reject the image.
pub const INVALID_IMAGE_MARKER: u8 = 255;

/// Reports as many full-frame faces as the red channel of pixel (0, 0).
///
/// Lets enrollment tests encode "how many faces" directly into a fixture image.
/// [`INVALID_IMAGE_MARKER`] yields `DetectError::InvalidImage` instead.
pub struct PixelCountDetector;

impl Detector for PixelCountDetector {
    fn detect(&mut self, image: &RgbImage, _min_confidence: f32) -> Result<Vec<Detection>, DetectError> {
        let marker = image.get_pixel(0, 0)[0];
        if marker == INVALID_IMAGE_MARKER {
            return Err(DetectError::InvalidImage("unsupported pixel layout".into()));
        }
        let count = marker as usize;
        let bbox = BoundingBox::new(0.0, 0.0, image.width() as f32, image.height() as f32);
        Ok(vec![Detection { bbox, confidence: 0.99 }; count])
    }
}

/// Hands out pre-scripted encodings in call order and records crop sizes.
pub struct ScriptedEncoder {
    dimension: usize,
    script: VecDeque<Result<Encoding, EncodeError>>,
    crop_sizes: Vec<(u32, u32)>,
}

impl ScriptedEncoder {
    pub fn new(dimension: usize, script: Vec<Result<Encoding, EncodeError>>) -> Self {
        Self { dimension, script: script.into(), crop_sizes: Vec::new() }
    }

    pub fn crop_sizes(&self) -> &[(u32, u32)] {
        &self.crop_sizes
    }
}

impl Encoder for ScriptedEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&mut self, crop: &RgbImage) -> Result<Encoding, EncodeError> {
        self.crop_sizes.push(crop.dimensions());
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(EncodeError::Failed("script exhausted".into())))
    }
}

/// Encodes a crop as its mean green and blue channel values scaled to [0, 1].
pub struct MeanColorEncoder;

impl Encoder for MeanColorEncoder {
    fn dimension(&self) -> usize {
        2
    }

    fn encode(&mut self, crop: &RgbImage) -> Result<Encoding, EncodeError> {
        let n = (crop.width() * crop.height()) as f32;
        if n == 0.0 {
            return Err(EncodeError::Rejected("empty crop".into()));
        }
        let (mut g, mut b) = (0.0f32, 0.0f32);
        for p in crop.pixels() {
            g += p[1] as f32;
            b += p[2] as f32;
        }
        Ok(Encoding::new(vec![g / n / 255.0, b / n / 255.0]))
    }
}
