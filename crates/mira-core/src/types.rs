use serde::{Deserialize, Serialize};

/// Label reported for a face that matched no gallery identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Face encoding vector produced by an encoder model (512-dimensional for ArcFace).
///
/// Encodings are compared only by Euclidean distance; individual values carry
/// no other meaning. The values are fixed once the encoding is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encoding {
    values: Vec<f32>,
}

impl Encoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance to `other`, or `None` when the lengths differ.
    pub fn distance(&self, other: &Encoding) -> Option<f32> {
        if self.len() != other.len() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }
}

impl From<Vec<f32>> for Encoding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Axis-aligned face region in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Clamp the box to an image of `width` × `height` pixels.
    ///
    /// The start edge is floored and the end edge ceiled, so any box with a
    /// positive overlap yields at least one pixel. Returns `None` when the
    /// clamped region is empty or the box holds non-finite coordinates.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelRect> {
        if ![self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
        {
            return None;
        }

        let (w, h) = (width as f32, height as f32);
        let x0 = self.x.max(0.0).floor().min(w);
        let y0 = self.y.max(0.0).floor().min(h);
        let x1 = (self.x + self.width).min(w).ceil().max(0.0);
        let y1 = (self.y + self.height).min(h).ceil().max(0.0);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(PixelRect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Integer pixel rectangle fully inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<PixelRect> for BoundingBox {
    fn from(r: PixelRect) -> Self {
        BoundingBox::new(r.x as f32, r.y as f32, r.width as f32, r.height as f32)
    }
}

/// One face located by a detector within a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

/// Outcome for one detected face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    /// Detected region, clamped to the frame.
    pub bbox: BoundingBox,
    /// Matched identity name, or [`UNKNOWN_LABEL`].
    pub label: String,
    /// Distance to the matched gallery entry; absent for unknown faces.
    pub match_distance: Option<f32>,
    pub detection_confidence: f32,
}

impl RecognitionResult {
    pub fn is_known(&self) -> bool {
        self.match_distance.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_identical() {
        let a = Encoding::new(vec![0.25, -1.0, 3.0]);
        assert_eq!(a.distance(&a.clone()), Some(0.0));
    }

    #[test]
    fn test_distance_345() {
        let a = Encoding::new(vec![0.0, 0.0]);
        let b = Encoding::new(vec![3.0, 4.0]);
        assert!((a.distance(&b).unwrap() - 5.0).abs() < 1e-6);
        assert!((b.distance(&a).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_length_mismatch() {
        let a = Encoding::new(vec![1.0, 0.0]);
        let b = Encoding::new(vec![1.0, 0.0, 50.0]);
        assert_eq!(a.distance(&b), None);
        assert_eq!(b.distance(&a), None);
    }

    #[test]
    fn test_encoding_is_finite() {
        assert!(Encoding::new(vec![1.0, 2.0]).is_finite());
        assert!(!Encoding::new(vec![1.0, f32::NAN]).is_finite());
        assert!(!Encoding::new(vec![f32::INFINITY]).is_finite());
    }

    #[test]
    fn test_encoding_serializes_as_plain_array() {
        let e = Encoding::new(vec![0.5, -0.125]);
        assert_eq!(serde_json::to_string(&e).unwrap(), "[0.5,-0.125]");
    }

    #[test]
    fn test_clamp_inside() {
        let b = BoundingBox::new(10.0, 20.0, 30.0, 40.0);
        let r = b.clamp_to(100, 100).unwrap();
        assert_eq!(r, PixelRect { x: 10, y: 20, width: 30, height: 40 });
    }

    #[test]
    fn test_clamp_overflowing_edges() {
        // Detector boxes may spill past the frame on every side.
        let b = BoundingBox::new(-5.0, -3.0, 120.0, 50.0);
        let r = b.clamp_to(100, 40).unwrap();
        assert_eq!(r, PixelRect { x: 0, y: 0, width: 100, height: 40 });
    }

    #[test]
    fn test_clamp_fractional_keeps_pixel() {
        let b = BoundingBox::new(10.2, 10.2, 0.3, 0.3);
        let r = b.clamp_to(100, 100).unwrap();
        assert_eq!((r.width, r.height), (1, 1));
    }

    #[test]
    fn test_clamp_degenerate() {
        assert!(BoundingBox::new(10.0, 10.0, 0.0, 20.0).clamp_to(100, 100).is_none());
        assert!(BoundingBox::new(10.0, 10.0, -4.0, 20.0).clamp_to(100, 100).is_none());
        assert!(BoundingBox::new(200.0, 10.0, 20.0, 20.0).clamp_to(100, 100).is_none());
        assert!(BoundingBox::new(f32::NAN, 10.0, 20.0, 20.0).clamp_to(100, 100).is_none());
    }
}
