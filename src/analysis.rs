//! Defect Analyst - LLM commentary on detected PCB defects
//!
//! Sends the detections to an OpenAI-compatible chat endpoint and gets back a
//! Markdown table classifying each defect against IPC-A-610F. With a vector
//! store configured, matching passages from the standard are retrieved first
//! and handed to the model as sources.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AnalystConfig;
use crate::detector::Detection;

const SYSTEM_QA: &str = "You are an expert in electronic-assembly quality assurance and IPC-A-610F. \
Analyse detected PCB defects and suggest corrective actions.";

const TABLE_INSTRUCTIONS: &str = "For each defect provide: **reference**, **defect_type (IPC-A-610F)**, \
**severity (Class 1/2/3)**. Answer as a **GitHub-flavoured Markdown table** with headers.";

const SYSTEM_RAG: &str = "Produce a concise answer to the query based on the provided sources.";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no detections to analyse")]
    NoDetections,

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("model returned an empty answer")]
    EmptyAnswer,
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub data: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
pub struct SearchHit {
    pub file_id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub content: Vec<SearchContent>,
}

#[derive(Debug, Deserialize)]
pub struct SearchContent {
    #[serde(default)]
    pub text: String,
}

pub struct DefectAnalyst {
    config: AnalystConfig,
    http_client: reqwest::Client,
}

impl DefectAnalyst {
    pub fn new(config: AnalystConfig) -> Result<Self, AnalysisError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AnalysisError::Network(e.to_string()))?;

        Ok(Self { config, http_client })
    }

    pub fn uses_retrieval(&self) -> bool {
        self.config.vector_store_id.is_some()
    }

    /// Markdown answer for the given detections
    pub async fn analyse(&self, detections: &[Detection]) -> Result<String, AnalysisError> {
        let query = build_user_prompt(detections)?;

        match &self.config.vector_store_id {
            Some(store_id) => {
                let hits = self.search(store_id, &query).await?;
                tracing::debug!("Vector store returned {} passages", hits.data.len());
                let sources = format_sources(&hits);
                self.chat(
                    vec![
                        ChatMessage { role: "system", content: SYSTEM_RAG },
                        ChatMessage { role: "assistant", content: &sources },
                        ChatMessage { role: "user", content: &query },
                    ],
                    None,
                    None,
                )
                .await
            }
            None => {
                self.chat(
                    vec![
                        ChatMessage { role: "system", content: SYSTEM_QA },
                        ChatMessage { role: "user", content: &query },
                    ],
                    Some(0.2),
                    Some(600),
                )
                .await
            }
        }
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage<'_>>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<String, AnalysisError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature,
            max_tokens,
        };

        let response: ChatResponse = self.post_json(&url, &request).await?;

        let answer = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if answer.is_empty() {
            return Err(AnalysisError::EmptyAnswer);
        }
        Ok(answer)
    }

    async fn search(&self, store_id: &str, query: &str) -> Result<SearchResponse, AnalysisError> {
        let url = format!("{}/vector_stores/{}/search", self.config.base_url, store_id);
        self.post_json(&url, &SearchRequest { query }).await
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, AnalysisError>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let response = self.http_client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AnalysisError::Network(e.to_string()))?;

        if response.status().is_success() {
            response.json().await
                .map_err(|e| AnalysisError::Parse(e.to_string()))
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::error!("Analyst request failed ({}): {}", status, body);
            Err(AnalysisError::Server { status, body })
        }
    }
}

/// Detections as pretty JSON followed by the table instructions
pub fn build_user_prompt(detections: &[Detection]) -> Result<String, AnalysisError> {
    if detections.is_empty() {
        return Err(AnalysisError::NoDetections);
    }

    let pretty = serde_json::to_string_pretty(detections)
        .map_err(|e| AnalysisError::Parse(e.to_string()))?;

    Ok(format!(
        "PCB defects (JSON):\n```json\n{}\n```\n\n{}",
        pretty, TABLE_INSTRUCTIONS
    ))
}

/// Wraps retrieved passages in the `<sources>` block the answer prompt expects
pub fn format_sources(hits: &SearchResponse) -> String {
    let mut out = String::from("<sources>");
    for hit in &hits.data {
        out.push_str(&format!(
            "<result file_id='{}' file_name='{}'>",
            hit.file_id, hit.filename
        ));
        for part in &hit.content {
            out.push_str(&format!("<content>{}</content>", part.text));
        }
        out.push_str("</result>");
    }
    out.push_str("</sources>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::BoundingBox;
    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn detections() -> Vec<Detection> {
        vec![Detection {
            bbox: BoundingBox { x: 10.0, y: 20.0, width: 5.0, height: 6.0 },
            label: "missing_hole".to_string(),
            class_id: 0,
            confidence: 0.91,
        }]
    }

    #[test]
    fn test_prompt_contains_detections() {
        let prompt = build_user_prompt(&detections()).unwrap();
        assert!(prompt.starts_with("PCB defects (JSON):\n```json\n"));
        assert!(prompt.contains("\"label\": \"missing_hole\""));
        assert!(prompt.ends_with(TABLE_INSTRUCTIONS));
    }

    #[test]
    fn test_prompt_rejects_empty() {
        assert!(matches!(build_user_prompt(&[]), Err(AnalysisError::NoDetections)));
    }

    #[test]
    fn test_format_sources() {
        let hits: SearchResponse = serde_json::from_value(json!({
            "data": [{
                "file_id": "file-1",
                "filename": "ipc_a_610f.txt",
                "score": 0.8,
                "content": [{"type": "text", "text": "Solder bridging"}, {"type": "text", "text": "Class 3"}]
            }]
        }))
        .unwrap();

        assert_eq!(
            format_sources(&hits),
            "<sources><result file_id='file-1' file_name='ipc_a_610f.txt'>\
             <content>Solder bridging</content><content>Class 3</content></result></sources>"
        );
    }

    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    /// Local stand-in for the OpenAI API, records every request body
    async fn spawn_mock() -> (String, Seen) {
        let seen: Seen = Arc::default();

        async fn chat(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
            seen.lock().await.push(("chat".to_string(), body));
            Json(json!({"choices": [{"message": {"role": "assistant", "content": "  | ref | type |\n  "}}]}))
        }

        async fn search(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
            seen.lock().await.push(("search".to_string(), body));
            Json(json!({"data": [{"file_id": "f1", "filename": "ipc.txt", "content": [{"text": "bridging"}]}]}))
        }

        let app = Router::new()
            .route("/v1/chat/completions", post(chat))
            .route("/v1/vector_stores/vs_1/search", post(search))
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (format!("http://{}/v1", addr), seen)
    }

    fn analyst_config(base_url: String, vector_store_id: Option<&str>) -> AnalystConfig {
        AnalystConfig {
            api_key: "sk-test".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url,
            vector_store_id: vector_store_id.map(str::to_string),
            timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn test_direct_chat() {
        let (base_url, seen) = spawn_mock().await;
        let analyst = DefectAnalyst::new(analyst_config(base_url, None)).unwrap();

        let answer = analyst.analyse(&detections()).await.unwrap();
        assert_eq!(answer, "| ref | type |");

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        let (kind, body) = &seen[0];
        assert_eq!(kind, "chat");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 600);
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[tokio::test]
    async fn test_retrieval_chat() {
        let (base_url, seen) = spawn_mock().await;
        let analyst = DefectAnalyst::new(analyst_config(base_url, Some("vs_1"))).unwrap();
        assert!(analyst.uses_retrieval());

        analyst.analyse(&detections()).await.unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "search");
        let chat = &seen[1].1;
        assert_eq!(chat["messages"][1]["role"], "assistant");
        assert!(chat["messages"][1]["content"].as_str().unwrap().contains("<content>bridging</content>"));
        assert!(chat.get("temperature").is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let (base_url, _) = spawn_mock().await;
        let analyst = DefectAnalyst::new(analyst_config(base_url, Some("unknown_store"))).unwrap();

        match analyst.analyse(&detections()).await {
            Err(AnalysisError::Server { status, .. }) => assert_eq!(status, 404),
            other => panic!("Expected Server error, got {:?}", other),
        }
    }
}
