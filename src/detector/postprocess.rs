//! YOLO output decoding and non-maximum suppression
//!
//! Handles the Ultralytics v8/v11 detection head: `[1, 4 + nc, N]` with rows
//! `cx, cy, w, h, score_0 .. score_nc`, scores already sigmoid-activated.
//! Some exports ship the transposed `[1, N, 4 + nc]`; the smaller axis is the
//! attribute axis.

use std::cmp::Ordering;

use super::preprocess::Letterbox;
use super::{BoundingBox, Detection, InferenceError};

#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

#[derive(Debug, Clone)]
struct Candidate {
    index: usize,
    class_id: usize,
    confidence: f32,
    bbox: BoundingBox,
}

pub fn decode(
    output: &[f32],
    shape: &[usize],
    letterbox: &Letterbox,
    params: DecodeParams,
    class_names: &[String],
) -> Result<Vec<Detection>, InferenceError> {
    let (rows, cols) = match shape {
        [1, rows, cols] => (*rows, *cols),
        _ => {
            return Err(InferenceError::MalformedTensor(format!(
                "expected output shape [1, 4 + classes, boxes], got {:?}",
                shape
            )))
        }
    };

    if output.len() != rows * cols {
        return Err(InferenceError::MalformedTensor(format!(
            "output holds {} values, shape {:?} needs {}",
            output.len(),
            shape,
            rows * cols
        )));
    }

    let channels_first = rows <= cols;
    let (attrs, boxes) = if channels_first { (rows, cols) } else { (cols, rows) };
    if attrs < 5 {
        return Err(InferenceError::MalformedTensor(format!(
            "output has {} attributes per box, need at least 5",
            attrs
        )));
    }

    let at = |i: usize, k: usize| {
        if channels_first { output[k * boxes + i] } else { output[i * attrs + k] }
    };

    let mut candidates = Vec::new();
    for i in 0..boxes {
        let (mut class_id, mut best) = (0usize, f32::NEG_INFINITY);
        for k in 4..attrs {
            let score = at(i, k);
            if score.is_nan() {
                return Err(InferenceError::MalformedTensor(format!("NaN score for box {}", i)));
            }
            if score > best {
                best = score;
                class_id = k - 4;
            }
        }

        if best < params.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));
        if ![cx, cy, w, h].iter().all(|v| v.is_finite()) {
            return Err(InferenceError::MalformedTensor(format!("non-finite box {}", i)));
        }

        let bbox = letterbox.restore(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
        if bbox.area() <= 0.0 {
            continue;
        }

        candidates.push(Candidate {
            index: i,
            class_id,
            confidence: best.clamp(0.0, 1.0),
            bbox,
        });
    }

    let kept = non_maximum_suppression(candidates, params.iou_threshold, params.max_detections);

    Ok(kept
        .into_iter()
        .map(|c| Detection {
            bbox: c.bbox,
            label: class_names
                .get(c.class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", c.class_id)),
            class_id: c.class_id,
            confidence: c.confidence,
        })
        .collect())
}

/// Per-class greedy NMS. Output is ordered by descending confidence, ties by
/// candidate index, so identical inputs always give identical outputs.
fn non_maximum_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32, max_detections: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
