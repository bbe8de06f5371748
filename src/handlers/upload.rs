//! Shared upload pipeline for the API and UI handlers
//!
//! Size is enforced three times: against the declared Content-Length before
//! anything is read, while the file part is streamed, and again by the
//! validator on the collected bytes.

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart},
    http::{header::CONTENT_LENGTH, HeaderMap, StatusCode},
};

use crate::detector::{self, DetectionResult};
use crate::validation::{DecodedImage, UploadPolicy, UploadedImage, ValidationError};
use crate::{AppError, AppResult, AppState, MULTIPART_OVERHEAD};

/// Multipart field carrying the image
pub const FILE_FIELD: &str = "file";

/// Output of one validated and inferred upload
pub struct Detected {
    pub decoded: DecodedImage,
    pub result: DetectionResult,
    pub model: String,
}

/// Rejects a request whose declared body cannot fit the file limit plus
/// multipart framing.
pub fn check_content_length(headers: &HeaderMap, policy: &UploadPolicy) -> AppResult<()> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(length) = declared {
        if length > policy.max_file_size.saturating_add(MULTIPART_OVERHEAD) {
            tracing::warn!("Rejected upload by Content-Length: {} bytes", length);
            return Err(ValidationError::TooLarge {
                size: length,
                limit: policy.max_file_size,
            }
            .into());
        }
    }
    Ok(())
}

/// Collects the `file` part, stopping as soon as it outgrows the limit
pub async fn read_upload(multipart: &mut Multipart, policy: &UploadPolicy) -> AppResult<UploadedImage> {
    while let Some(mut field) = multipart.next_field().await.map_err(|e| multipart_error(e, policy))? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let content_type = field.content_type().map(str::to_string);
        let filename = field.file_name().map(str::to_string);

        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, policy))? {
            policy.check_size((buf.len() + chunk.len()) as u64)?;
            buf.extend_from_slice(&chunk);
        }

        return Ok(UploadedImage {
            bytes: Bytes::from(buf),
            content_type,
            filename,
        });
    }

    Err(AppError::BadRequest(format!("Missing multipart field `{}`", FILE_FIELD)))
}

fn multipart_error(err: MultipartError, policy: &UploadPolicy) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        // body limit hit outside the file part, exact size unknown
        return ValidationError::TooLarge {
            size: policy.max_file_size.saturating_add(MULTIPART_OVERHEAD),
            limit: policy.max_file_size,
        }
        .into();
    }
    err.into()
}

/// Validates, infers and optionally annotates on the blocking pool
pub async fn run_detection(
    state: &AppState,
    upload: UploadedImage,
    confidence_threshold: f32,
    annotate: bool,
) -> AppResult<Detected> {
    let detector = state.detector()?;
    let policy = state.policy.clone();
    let annotator = state.annotator.clone();

    tokio::task::spawn_blocking(move || -> AppResult<Detected> {
        let decoded = policy.validate(&upload)?;
        tracing::debug!(
            "Accepted {} ({}, {}x{})",
            decoded.filename,
            decoded.mime_type,
            decoded.image.width(),
            decoded.image.height()
        );

        let mut result = detector::infer(detector.as_ref(), &decoded.image, confidence_threshold)?;
        if annotate {
            result.annotated = Some(annotator.render_png(&decoded.image, &result.detections)?);
        }

        Ok(Detected {
            decoded,
            result,
            model: detector.info().name.clone(),
        })
    })
    .await?
}
