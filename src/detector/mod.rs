//! Detector - the seam between HTTP handling and the model runtime
//!
//! A detector is built once at startup and shared read-only between requests.
//! Swapping the runtime only means another `Detector` implementation.

pub mod postprocess;
pub mod preprocess;
pub mod yolo;

use std::path::PathBuf;
use std::time::Instant;

use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;

pub use yolo::{YoloDetector, YoloParams};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("labels file {0} contains no class names")]
    EmptyLabels(PathBuf),

    #[error("model declares no {0}")]
    MissingTensor(&'static str),

    #[error("onnx runtime: {0}")]
    Runtime(String),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("malformed tensor: {0}")]
    MalformedTensor(String),

    #[error("inference failed: {0}")]
    Runtime(String),
}

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Axis-aligned box in original image pixels, top-left origin
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            width: (x2 - x1).abs(),
            height: (y2 - y1).abs(),
        }
    }

    pub fn x2(&self) -> f32 {
        self.x + self.width
    }

    pub fn y2(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter_w = (self.x2().min(other.x2()) - self.x.max(other.x)).max(0.0);
        let inter_h = (self.y2().min(other.y2()) - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Clip to `[0, width] x [0, height]`
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self::from_corners(
            self.x.clamp(0.0, w),
            self.y.clamp(0.0, h),
            self.x2().clamp(0.0, w),
            self.y2().clamp(0.0, h),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: String,
    pub class_id: usize,
    /// 0.0 - 1.0
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Detections for one image
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    pub inference_ms: f64,
    pub image: ImageSize,
    /// PNG with the detections drawn in
    #[serde(skip)]
    pub annotated: Option<Vec<u8>>,
}

/// What is loaded, for logs and /health
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub classes: Vec<String>,
    pub input_size: u32,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// DETECTOR TRAIT
// ============================================================================

pub trait Detector: Send + Sync {
    /// Single forward pass. Results must not depend on earlier calls.
    fn detect(&self, image: &DynamicImage, confidence_threshold: f32) -> Result<Vec<Detection>, InferenceError>;

    fn info(&self) -> &ModelInfo;
}

/// Runs one timed inference and enforces the output invariants:
/// confidences in [0, 1], boxes inside the image.
pub fn infer(
    detector: &dyn Detector,
    image: &DynamicImage,
    confidence_threshold: f32,
) -> Result<DetectionResult, InferenceError> {
    let started = Instant::now();
    let raw = detector.detect(image, confidence_threshold)?;
    let inference_ms = started.elapsed().as_secs_f64() * 1000.0;

    let (width, height) = (image.width(), image.height());
    let mut detections = Vec::with_capacity(raw.len());
    for det in raw {
        if !det.confidence.is_finite() || !det.bbox.x.is_finite() || !det.bbox.y.is_finite()
            || !det.bbox.width.is_finite() || !det.bbox.height.is_finite()
        {
            return Err(InferenceError::MalformedTensor(format!(
                "non-finite values in detection for class {}",
                det.class_id
            )));
        }
        detections.push(Detection {
            bbox: det.bbox.clamped(width, height),
            confidence: det.confidence.clamp(0.0, 1.0),
            ..det
        });
    }

    tracing::debug!("{} detections in {:.1} ms", detections.len(), inference_ms);

    Ok(DetectionResult {
        detections,
        inference_ms,
        image: ImageSize { width, height },
        annotated: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        info: ModelInfo,
        out: Vec<Detection>,
    }

    impl Detector for Fixed {
        fn detect(&self, _image: &DynamicImage, _t: f32) -> Result<Vec<Detection>, InferenceError> {
            Ok(self.out.clone())
        }

        fn info(&self) -> &ModelInfo {
            &self.info
        }
    }

    fn info() -> ModelInfo {
        ModelInfo {
            name: "fixed".to_string(),
            path: "<memory>".to_string(),
            sha256: String::new(),
            classes: vec!["short".to_string()],
            input_size: 640,
            loaded_at: chrono::Utc::now(),
        }
    }

    fn detection(bbox: BoundingBox, confidence: f32) -> Detection {
        Detection { bbox, label: "short".to_string(), class_id: 0, confidence }
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::from_corners(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::from_corners(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(a.iou(&BoundingBox::from_corners(20.0, 20.0, 30.0, 30.0)), 0.0);
        assert_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_infer_clamps_output() {
        let detector = Fixed {
            info: info(),
            out: vec![detection(BoundingBox { x: -5.0, y: 10.0, width: 100.0, height: 100.0 }, 1.2)],
        };
        let image = DynamicImage::new_rgb8(40, 30);

        let result = infer(&detector, &image, 0.25).unwrap();
        let det = &result.detections[0];
        assert_eq!(det.confidence, 1.0);
        assert_eq!(det.bbox, BoundingBox { x: 0.0, y: 10.0, width: 40.0, height: 20.0 });
        assert_eq!(result.image, ImageSize { width: 40, height: 30 });
        assert!(result.inference_ms >= 0.0);
    }

    #[test]
    fn test_infer_rejects_nan() {
        let detector = Fixed {
            info: info(),
            out: vec![detection(BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 }, f32::NAN)],
        };
        let result = infer(&detector, &DynamicImage::new_rgb8(4, 4), 0.0);
        assert!(matches!(result, Err(InferenceError::MalformedTensor(_))));
    }
}
