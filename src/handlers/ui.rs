//! Browser upload form (UI mode)
//!
//! Server-rendered HTML, no session state. Both images are inlined as PNG data
//! URIs so the results page is self-contained.

use axum::{
    extract::{Multipart, State},
    http::HeaderMap,
    response::{Html, IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use pulldown_cmark::{html, CowStr, Event, Options, Parser, Tag};
use uuid::Uuid;

use super::upload::{check_content_length, read_upload, run_detection, Detected};
use crate::annotate::encode_png;
use crate::validation::ALLOWED_EXTENSIONS;
use crate::{AppError, AppResult, AppState};

const TITLE: &str = "PCB Defect Detector";

const STYLE: &str = "body{font-family:sans-serif;max-width:1100px;margin:2rem auto;padding:0 1rem}\
.images{display:flex;gap:1rem}.images figure{flex:1;margin:0}.images img{max-width:100%}\
table{border-collapse:collapse;margin-top:1rem}td,th{border:1px solid #ccc;padding:.3rem .6rem}\
.error{color:#b00020}.notice{color:#8a6d3b}.analysis{background:#f6f8fa;padding:1rem}";

pub async fn form(State(state): State<AppState>) -> Html<String> {
    Html(page(&upload_form(&state, None)))
}

#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    match detect(&state, &headers, &mut multipart).await {
        Ok(body) => Html(page(&format!("{}{}", upload_form(&state, None), body))).into_response(),
        Err(err) => {
            let (status, message) = err.status_and_message();
            (status, Html(page(&upload_form(&state, Some(&message))))).into_response()
        }
    }
}

async fn detect(state: &AppState, headers: &HeaderMap, multipart: &mut Multipart) -> AppResult<String> {
    check_content_length(headers, &state.policy)?;
    state.detector()?;

    let upload = read_upload(multipart, &state.policy).await?;
    let detected = run_detection(state, upload, state.config.confidence_threshold, true).await?;

    tracing::info!(
        "{}: {} detections",
        detected.decoded.filename,
        detected.result.detections.len()
    );

    let analysis = match (&state.analyst, detected.result.detections.is_empty()) {
        (Some(analyst), false) => Some(analyst.analyse(&detected.result.detections).await),
        _ => None,
    };
    let analysis_html = match analysis {
        None => String::new(),
        Some(Ok(markdown)) => format!("<h2>Details</h2><div class=\"analysis\">{}</div>", render_markdown(&markdown)),
        Some(Err(e)) => {
            tracing::warn!("Defect analysis failed: {}", e);
            "<p class=\"notice\">Defect analysis is unavailable right now.</p>".to_string()
        }
    };

    let results = render_results(detected).await?;
    Ok(format!("{}{}", results, analysis_html))
}

async fn render_results(detected: Detected) -> AppResult<String> {
    let Detected { decoded, result, .. } = detected;
    let annotated = result
        .annotated
        .as_deref()
        .ok_or_else(|| AppError::InternalError("annotated image missing".to_string()))?;

    // TIFF and BMP do not display everywhere, so the original is shown as PNG too
    let filename = decoded.filename.clone();
    let original = tokio::task::spawn_blocking(move || encode_png(&decoded.image)).await??;

    let mut html = format!(
        "<div class=\"images\">\
         <figure><img alt=\"original\" src=\"{}\"><figcaption>{}</figcaption></figure>\
         <figure><img alt=\"annotated\" src=\"{}\"><figcaption>Detections</figcaption></figure>\
         </div>",
        data_uri(&original),
        escape_html(&filename),
        data_uri(annotated),
    );

    if result.detections.is_empty() {
        html.push_str("<p>No PCB problems found.</p>");
        return Ok(html);
    }

    html.push_str("<table><thead><tr><th>#</th><th>Defect</th><th>Confidence</th><th>Box (x, y, w, h)</th></tr></thead><tbody>");
    for (i, det) in result.detections.iter().enumerate() {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{:.2}</td><td>{:.0}, {:.0}, {:.0}, {:.0}</td></tr>",
            i + 1,
            escape_html(&det.label),
            det.confidence,
            det.bbox.x,
            det.bbox.y,
            det.bbox.width,
            det.bbox.height,
        ));
    }
    html.push_str("</tbody></table>");
    html.push_str(&format!("<p>Inference took {:.1} ms.</p>", result.inference_ms));

    Ok(html)
}

fn upload_form(state: &AppState, error: Option<&str>) -> String {
    let accept: Vec<String> = ALLOWED_EXTENSIONS.iter().map(|e| format!(".{}", e)).collect();
    let error_html = error
        .map(|msg| format!("<p class=\"error\">{}</p>", escape_html(msg)))
        .unwrap_or_default();
    let status = if state.is_ready() { "" } else { "<p class=\"notice\">The model is still loading.</p>" };

    format!(
        "<form method=\"post\" enctype=\"multipart/form-data\">\
         <input type=\"file\" name=\"file\" accept=\"{}\" required> \
         <button type=\"submit\">Detect defects</button>\
         <small> up to {:.1} MB</small></form>{}{}",
        accept.join(","),
        state.policy.max_file_size as f64 / (1024.0 * 1024.0),
        status,
        error_html,
    )
}

fn page(body: &str) -> String {
    format!(
        "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"utf-8\">\
         <title>{title}</title><style>{STYLE}</style></head>\
         <body><h1>{title}</h1>{body}</body></html>",
        title = TITLE,
    )
}

fn data_uri(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Markdown to HTML for model-written text. Raw HTML is shown as text and
/// links are limited to http(s) and fragments.
fn render_markdown(markdown: &str) -> String {
    let events = Parser::new_ext(markdown, Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH).map(|event| {
        match event {
            Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
            Event::Start(Tag::Link { link_type, dest_url, title, id }) => Event::Start(Tag::Link {
                link_type,
                dest_url: safe_url(dest_url),
                title,
                id,
            }),
            Event::Start(Tag::Image { link_type, dest_url, title, id }) => Event::Start(Tag::Image {
                link_type,
                dest_url: safe_url(dest_url),
                title,
                id,
            }),
            other => other,
        }
    });

    let mut out = String::with_capacity(markdown.len() * 2);
    html::push_html(&mut out, events);
    out
}

fn safe_url(url: CowStr<'_>) -> CowStr<'_> {
    let lower = url.trim().to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with('#') {
        url
    } else {
        CowStr::Borrowed("#")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_table() {
        let html = render_markdown("| reference | severity |\n|---|---|\n| D1 | Class 3 |\n");
        assert!(html.contains("<table>"));
        assert!(html.contains("<th>reference</th>"));
        assert!(html.contains("<td>Class 3</td>"));
    }

    #[test]
    fn test_markdown_raw_html_is_text() {
        let html = render_markdown("before <script>alert(1)</script> after\n\n<div onclick=\"x\">block</div>\n");
        assert!(!html.contains("<script>"));
        assert!(!html.contains("<div"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_markdown_unsafe_links() {
        let html = render_markdown("[bad](javascript:alert(1)) [good](https://example.com/ipc)");
        assert!(!html.contains("javascript:"));
        assert!(html.contains("href=\"#\""));
        assert!(html.contains("href=\"https://example.com/ipc\""));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href='x'>&\"</a>"), "&lt;a href=&#39;x&#39;&gt;&amp;&quot;&lt;/a&gt;");
    }
}
