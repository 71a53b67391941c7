//! Recognition pipeline: detect → crop → encode → match, one frame at a time.
//!
//! Per-face policy: a degenerate box is dropped, a crop the encoder rejects is
//! reported as unknown. Only collaborator failures abort the frame.

use crate::gallery::GalleryEntry;
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher};
use crate::types::{BoundingBox, Detection, Encoding, RecognitionResult, UNKNOWN_LABEL};
use image::RgbImage;
use thiserror::Error;

/// Default minimum detector confidence for a face to be considered.
pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("invalid input image: {0}")]
    InvalidImage(String),
    #[error("detector failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum EncodeError {
    /// This particular region cannot be encoded (too small, low quality).
    #[error("face region rejected: {0}")]
    Rejected(String),
    /// The encoder itself is unusable.
    #[error("encoder failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum FrameProcessingError {
    #[error("detection failed: {0}")]
    Detector(#[from] DetectError),
    #[error("encoding failed: {0}")]
    Encoder(String),
    #[error("encoder produced a {actual}-dimensional encoding, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Face detector capability.
///
/// Implementations may be stateful (inference sessions), hence `&mut self`.
pub trait Detector {
    /// Locate faces in `image`. Boxes are in the image's pixel coordinates and
    /// detections below `min_confidence` are already excluded.
    fn detect(&mut self, image: &RgbImage, min_confidence: f32)
        -> Result<Vec<Detection>, DetectError>;
}

/// Face encoder capability.
pub trait Encoder {
    /// Length of every encoding this encoder produces.
    fn dimension(&self) -> usize;

    fn encode(&mut self, crop: &RgbImage) -> Result<Encoding, EncodeError>;
}

/// Per-frame thresholds.
#[derive(Debug, Clone, Copy)]
pub struct FrameSettings {
    pub detection_confidence_min: f32,
    pub match_threshold: f32,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            detection_confidence_min: DEFAULT_DETECTION_CONFIDENCE,
            match_threshold: crate::matcher::DEFAULT_MATCH_THRESHOLD,
        }
    }
}

/// Crop `image` to `bbox` clamped to the image bounds.
///
/// Returns the crop together with the clamped box, or `None` for a zero-area region.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> Option<(RgbImage, BoundingBox)> {
    let rect = bbox.clamp_to(image.width(), image.height())?;
    let crop = image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
    Some((crop, rect.into()))
}

/// Run one frame through detection, encoding, and matching.
///
/// Emits one result per detection with a non-degenerate box, in detector order.
pub fn process_frame(
    image: &RgbImage,
    gallery: &[GalleryEntry],
    detector: &mut dyn Detector,
    encoder: &mut dyn Encoder,
    detection_confidence_min: f32,
    match_threshold: f32,
) -> Result<Vec<RecognitionResult>, FrameProcessingError> {
    let settings = FrameSettings {
        detection_confidence_min,
        match_threshold,
    };
    process_frame_with(&EuclideanMatcher, image, gallery, detector, encoder, settings)
}

/// [`process_frame`] with an explicit matching strategy.
pub fn process_frame_with(
    matcher: &dyn Matcher,
    image: &RgbImage,
    gallery: &[GalleryEntry],
    detector: &mut dyn Detector,
    encoder: &mut dyn Encoder,
    settings: FrameSettings,
) -> Result<Vec<RecognitionResult>, FrameProcessingError> {
    let detections = detector.detect(image, settings.detection_confidence_min)?;
    let expected_dim = encoder.dimension();

    let mut results = Vec::with_capacity(detections.len());

    for (idx, det) in detections.iter().enumerate() {
        let Some((crop, bbox)) = crop_face(image, &det.bbox) else {
            tracing::debug!(idx, bbox = ?det.bbox, "skipping degenerate detection");
            continue;
        };

        let outcome = match encoder.encode(&crop) {
            Ok(encoding) if !encoding.is_finite() => {
                tracing::warn!(idx, "encoder produced non-finite values; reporting unknown");
                MatchResult::Unknown
            }
            Ok(encoding) => {
                if encoding.len() != expected_dim {
                    return Err(FrameProcessingError::DimensionMismatch {
                        expected: expected_dim,
                        actual: encoding.len(),
                    });
                }
                if let Some(first) = gallery.first() {
                    if first.encoding.len() != encoding.len() {
                        return Err(FrameProcessingError::DimensionMismatch {
                            expected: first.encoding.len(),
                            actual: encoding.len(),
                        });
                    }
                }
                matcher.compare(&encoding, gallery, settings.match_threshold)
            }
            Err(EncodeError::Rejected(reason)) => {
                tracing::debug!(idx, %reason, "crop not encodable; reporting unknown");
                MatchResult::Unknown
            }
            Err(EncodeError::Failed(reason)) => {
                return Err(FrameProcessingError::Encoder(reason));
            }
        };

        results.push(RecognitionResult {
            bbox,
            label: outcome.label().to_string(),
            match_distance: outcome.distance(),
            detection_confidence: det.confidence,
        });
    }

    tracing::debug!(
        detections = detections.len(),
        reported = results.len(),
        known = results.iter().filter(|r| r.label != UNKNOWN_LABEL).count(),
        "frame processed"
    );

    Ok(results)
}

/// Detector and encoder bundled with the thresholds used for every frame.
pub struct RecognitionPipeline {
    detector: Box<dyn Detector + Send>,
    encoder: Box<dyn Encoder + Send>,
    matcher: Box<dyn Matcher + Send>,
    settings: FrameSettings,
}

impl RecognitionPipeline {
    pub fn new(
        detector: Box<dyn Detector + Send>,
        encoder: Box<dyn Encoder + Send>,
        settings: FrameSettings,
    ) -> Self {
        Self {
            detector,
            encoder,
            matcher: Box::new(EuclideanMatcher),
            settings,
        }
    }

    /// Replace the default Euclidean matcher.
    pub fn with_matcher(mut self, matcher: Box<dyn Matcher + Send>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn settings(&self) -> FrameSettings {
        self.settings
    }

    pub fn dimension(&self) -> usize {
        self.encoder.dimension()
    }

    /// Recognize every face in `image` against the current gallery contents.
    pub fn process_frame(
        &mut self,
        image: &RgbImage,
        gallery: &[GalleryEntry],
    ) -> Result<Vec<RecognitionResult>, FrameProcessingError> {
        process_frame_with(
            self.matcher.as_ref(),
            image,
            gallery,
            self.detector.as_mut(),
            self.encoder.as_mut(),
            self.settings,
        )
    }
}
