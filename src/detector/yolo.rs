//! YOLO detector on ONNX Runtime
//!
//! Expects the Ultralytics ONNX export of the trained weights. Class names are
//! read from the `names` entry Ultralytics writes into the model metadata,
//! unless a labels file overrides them.

use std::path::Path;

use image::DynamicImage;
use once_cell::sync::Lazy;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::Mutex;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::postprocess::{self, DecodeParams};
use super::preprocess::Letterbox;
use super::{Detection, Detector, InferenceError, ModelInfo, ModelLoadError};

#[derive(Debug, Clone, Copy)]
pub struct YoloParams {
    pub input_size: u32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            iou_threshold: 0.45,
            max_detections: 300,
        }
    }
}

pub struct YoloDetector {
    /// `Session::run` needs exclusive access
    session: Mutex<Session>,
    output_name: String,
    params: YoloParams,
    info: ModelInfo,
}

impl YoloDetector {
    /// Reads, checksums and commits the model. Blocks until the session is ready.
    pub fn load(model_path: &Path, labels_path: Option<&Path>, params: YoloParams) -> Result<Self, ModelLoadError> {
        tracing::info!("Loading ONNX model from: {}", model_path.display());

        if !model_path.exists() {
            return Err(ModelLoadError::NotFound(model_path.to_path_buf()));
        }

        let model_bytes = std::fs::read(model_path).map_err(|source| ModelLoadError::Io {
            path: model_path.to_path_buf(),
            source,
        })?;
        let sha256 = format!("{:x}", Sha256::digest(&model_bytes));

        let session = Session::builder()
            .map_err(|e| ModelLoadError::Runtime(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| ModelLoadError::Runtime(format!("Failed to set optimization: {}", e)))?
            .commit_from_memory(&model_bytes)
            .map_err(|e| ModelLoadError::Runtime(format!("Failed to load model: {}", e)))?;

        if session.inputs.is_empty() {
            return Err(ModelLoadError::MissingTensor("inputs"));
        }
        let output_name = session.outputs.first()
            .map(|o| o.name.clone())
            .ok_or(ModelLoadError::MissingTensor("outputs"))?;

        let classes = match labels_path {
            Some(path) => read_labels(path)?,
            None => metadata_names(&session).unwrap_or_default(),
        };
        if classes.is_empty() {
            tracing::warn!("No class names found, detections will be labelled by class id");
        }

        let info = ModelInfo {
            name: model_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "model".to_string()),
            path: model_path.display().to_string(),
            sha256,
            classes,
            input_size: params.input_size,
            loaded_at: chrono::Utc::now(),
        };

        tracing::info!(
            "ONNX model loaded: {} ({} classes, sha256 {})",
            info.name,
            info.classes.len(),
            &info.sha256[..12]
        );

        Ok(Self {
            session: Mutex::new(session),
            output_name,
            params,
            info,
        })
    }
}

impl Detector for YoloDetector {
    fn detect(&self, image: &DynamicImage, confidence_threshold: f32) -> Result<Vec<Detection>, InferenceError> {
        let letterbox = Letterbox::fit(image.width(), image.height(), self.params.input_size);
        let input_tensor = Tensor::from_array(letterbox.to_tensor(image))
            .map_err(|e| InferenceError::MalformedTensor(format!("Tensor error: {}", e)))?;

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![input_tensor])
            .map_err(|e| InferenceError::Runtime(e.to_string()))?;

        let output = outputs.get(&self.output_name)
            .ok_or_else(|| InferenceError::MalformedTensor(format!("missing output {}", self.output_name)))?;

        let (shape, data) = output.try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::MalformedTensor(format!("Extract error: {}", e)))?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        postprocess::decode(
            data,
            &dims,
            &letterbox,
            DecodeParams {
                confidence_threshold,
                iou_threshold: self.params.iou_threshold,
                max_detections: self.params.max_detections,
            },
            &self.info.classes,
        )
    }

    fn info(&self) -> &ModelInfo {
        &self.info
    }
}

/// One class name per non-empty line, in class-id order
pub fn read_labels(path: &Path) -> Result<Vec<String>, ModelLoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let labels: Vec<String> = content
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    if labels.is_empty() {
        return Err(ModelLoadError::EmptyLabels(path.to_path_buf()));
    }
    Ok(labels)
}

fn metadata_names(session: &Session) -> Option<Vec<String>> {
    let metadata = session.metadata().ok()?;
    match metadata.custom("names") {
        Ok(Some(raw)) => parse_names(&raw),
        _ => None,
    }
}

/// Upper bound on class ids accepted from metadata
const MAX_CLASSES: usize = 10_000;

static NAMES_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\d+)\s*:\s*(?:'([^']*)'|"([^"]*)")"#).expect("names pattern is valid")
});

/// Parses the Ultralytics `names` metadata, a Python dict literal such as
/// `{0: 'missing_hole', 1: 'mouse_bite'}`. Ids missing from the dict get
/// `class_<id>` so indices stay aligned.
pub fn parse_names(raw: &str) -> Option<Vec<String>> {
    let pairs: Vec<(usize, String)> = NAMES_ENTRY
        .captures_iter(raw)
        .filter_map(|c| {
            let id: usize = c.get(1)?.as_str().parse().ok()?;
            if id >= MAX_CLASSES {
                return None;
            }
            let name = c.get(2).or_else(|| c.get(3))?.as_str().to_string();
            Some((id, name))
        })
        .collect();

    let count = pairs.iter().map(|(id, _)| id + 1).max()?;
    let mut names: Vec<String> = (0..count).map(|id| format!("class_{}", id)).collect();
    for (id, name) in pairs {
        names[id] = name;
    }
    Some(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_ultralytics_names() {
        let names = parse_names("{0: 'missing_hole', 1: 'mouse_bite', 2: 'open_circuit'}").unwrap();
        assert_eq!(names, vec!["missing_hole", "mouse_bite", "open_circuit"]);
    }

    #[test]
    fn test_parse_names_with_gaps_and_double_quotes() {
        let names = parse_names(r#"{0: "short", 2: "spur"}"#).unwrap();
        assert_eq!(names, vec!["short", "class_1", "spur"]);
    }

    #[test]
    fn test_parse_names_garbage() {
        assert!(parse_names("not a dict").is_none());
    }

    #[test]
    fn test_read_labels() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "missing_hole\n\n  short  \nspurious_copper").unwrap();

        let labels = read_labels(file.path()).unwrap();
        assert_eq!(labels, vec!["missing_hole", "short", "spurious_copper"]);
    }

    #[test]
    fn test_read_empty_labels() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(read_labels(file.path()), Err(ModelLoadError::EmptyLabels(_))));
    }

    #[test]
    fn test_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = YoloDetector::load(&dir.path().join("best.onnx"), None, YoloParams::default());
        assert!(matches!(result, Err(ModelLoadError::NotFound(_))));
    }
}
