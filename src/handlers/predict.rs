//! Prediction handlers (API mode)

use axum::{
    extract::{rejection::QueryRejection, Multipart, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::upload::{check_content_length, read_upload, run_detection};
use crate::detector::DetectionResult;
use crate::{AppError, AppResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct PredictQuery {
    /// Per-request override of the configured threshold
    pub confidence: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    #[serde(flatten)]
    pub result: DetectionResult,
    pub model: String,
}

/// Detect defects and return them as JSON
#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
pub async fn predict(
    State(state): State<AppState>,
    query: Result<Query<PredictQuery>, QueryRejection>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Json<PredictResponse>> {
    let threshold = resolve_threshold(&state, query)?;
    check_content_length(&headers, &state.policy)?;
    state.detector()?;

    let upload = read_upload(&mut multipart, &state.policy).await?;
    let detected = run_detection(&state, upload, threshold, false).await?;

    tracing::info!(
        "{}: {} detections in {:.1} ms",
        detected.decoded.filename,
        detected.result.detections.len(),
        detected.result.inference_ms
    );

    Ok(Json(PredictResponse {
        result: detected.result,
        model: detected.model,
    }))
}

/// Detect defects and return the annotated image as PNG
#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
pub async fn predict_image(
    State(state): State<AppState>,
    query: Result<Query<PredictQuery>, QueryRejection>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Response> {
    let threshold = resolve_threshold(&state, query)?;
    check_content_length(&headers, &state.policy)?;
    state.detector()?;

    let upload = read_upload(&mut multipart, &state.policy).await?;
    let detected = run_detection(&state, upload, threshold, true).await?;

    tracing::info!(
        "{}: {} detections annotated",
        detected.decoded.filename,
        detected.result.detections.len()
    );

    let png = detected
        .result
        .annotated
        .ok_or_else(|| AppError::InternalError("annotated image missing".to_string()))?;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

fn resolve_threshold(state: &AppState, query: Result<Query<PredictQuery>, QueryRejection>) -> AppResult<f32> {
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;

    match query.confidence {
        None => Ok(state.config.confidence_threshold),
        Some(c) if (0.0..=1.0).contains(&c) => Ok(c),
        Some(c) => Err(AppError::BadRequest(format!(
            "confidence must be between 0 and 1, got {}",
            c
        ))),
    }
}
