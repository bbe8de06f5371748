//! Health check handler

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::detector::ModelInfo;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<ModelInfo>,
}

/// 200 once the detector is loaded, 503 while it is still loading
pub async fn check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.detector() {
        Ok(detector) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                version: Some(env!("CARGO_PKG_VERSION")),
                timestamp: Some(chrono::Utc::now().timestamp()),
                model: Some(detector.info().clone()),
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "loading",
                version: None,
                timestamp: None,
                model: None,
            }),
        ),
    }
}
