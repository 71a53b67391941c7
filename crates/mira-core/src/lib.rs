//! mira-core: Face gallery, matcher, and recognition pipeline.
//!
//! Detection and encoding models sit behind the [`Detector`] and [`Encoder`]
//! traits. With the `onnx` feature, SCRFD and ArcFace implementations run on
//! ONNX Runtime.

pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod types;

#[cfg(feature = "onnx")]
pub mod detector;
#[cfg(feature = "onnx")]
pub mod recognizer;

#[cfg(test)]
mod testing;

pub use gallery::{GalleryEntry, GalleryError, GalleryStore, IdentitySummary, ImportSummary, SkipReason};
pub use matcher::{match_encoding, EuclideanMatcher, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use pipeline::{
    process_frame, DetectError, Detector, EncodeError, Encoder, FrameProcessingError, FrameSettings,
    RecognitionPipeline, DEFAULT_DETECTION_CONFIDENCE,
};
pub use types::{BoundingBox, Detection, Encoding, RecognitionResult, UNKNOWN_LABEL};

#[cfg(feature = "onnx")]
pub use detector::ScrfdDetector;
#[cfg(feature = "onnx")]
pub use recognizer::ArcfaceEncoder;
