//! ArcFace face encoder via ONNX Runtime.
//!
//! Produces L2-normalized face encodings (512-dimensional for w600k_r50) from
//! face crops resized to the model's 112×112 input.

use crate::pipeline::{EncodeError, Encoder};
use crate::types::Encoding;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
/// Crops smaller than this on either side carry too little detail to encode.
const MIN_FACE_SIDE: u32 = 16;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download it from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<RecognizerError> for EncodeError {
    fn from(e: RecognizerError) -> Self {
        EncodeError::Failed(e.to_string())
    }
}

/// ArcFace-based face encoder.
pub struct ArcfaceEncoder {
    session: Session,
    dimension: usize,
}

impl ArcfaceEncoder {
    /// Load the ArcFace ONNX model; `dimension` is the expected encoding length.
    pub fn load(model_path: &Path, dimension: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            dimension,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session, dimension })
    }

    fn run(&mut self, crop: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        let input = preprocess(crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

impl Encoder for ArcfaceEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&mut self, crop: &RgbImage) -> Result<Encoding, EncodeError> {
        if crop.width() < MIN_FACE_SIDE || crop.height() < MIN_FACE_SIDE {
            return Err(EncodeError::Rejected(format!(
                "{}x{} crop is below the {MIN_FACE_SIDE}px minimum",
                crop.width(),
                crop.height()
            )));
        }

        let raw = self.run(crop)?;
        if raw.len() != self.dimension {
            return Err(EncodeError::Failed(format!(
                "expected {}-dim embedding, got {}",
                self.dimension,
                raw.len()
            )));
        }

        l2_normalize(raw)
            .map(Encoding::new)
            .ok_or_else(|| EncodeError::Rejected("degenerate embedding".into()))
    }
}

/// Resize a face crop to 112×112 and normalize into a NCHW float tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let resized = image::imageops::resize(crop, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

/// Scale to unit length; `None` when the norm is zero or not finite.
fn l2_normalize(raw: Vec<f32>) -> Option<Vec<f32>> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm == 0.0 {
        return None;
    }
    Some(raw.into_iter().map(|x| x / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(40, 60, Rgb([128, 128, 128]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = preprocess(&crop);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_keeps_rgb_order() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let tensor = preprocess(&crop);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        assert!(tensor[[0, 2, 5, 5]].abs() < 0.01);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_degenerate() {
        assert!(l2_normalize(vec![0.0, 0.0]).is_none());
        assert!(l2_normalize(vec![f32::NAN, 1.0]).is_none());
    }
}
