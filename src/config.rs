//! Configuration module

use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use axum::http::HeaderValue;
use thiserror::Error;
use validator::Validate;

/// 10 MB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

pub const SERVICE_TITLE: &str = "PCB Detector API";
pub const SERVICE_DESCRIPTION: &str = "Defect detection service for printed circuit boards";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("configuration out of range: {0}")]
    OutOfRange(String),
}

/// Which surface the process serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Api,
    Ui,
}

impl ServiceMode {
    pub fn default_port(&self) -> u16 {
        match self {
            ServiceMode::Api => 8000,
            ServiceMode::Ui => 8501,
        }
    }
}

impl FromStr for ServiceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(ServiceMode::Api),
            "ui" => Ok(ServiceMode::Ui),
            other => Err(format!("expected `api` or `ui`, got `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected `pretty` or `json`, got `{}`", other)),
        }
    }
}

/// Settings for the optional LLM defect analyst
#[derive(Debug, Clone)]
pub struct AnalystConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Enables retrieval over the IPC-A-610F vector store
    pub vector_store_id: Option<String>,
    pub timeout_seconds: u64,
}

/// Application configuration
#[derive(Debug, Clone, Validate)]
pub struct Config {
    /// API or interactive UI
    pub mode: ServiceMode,

    pub host: IpAddr,

    /// Server port
    pub port: u16,

    /// ONNX export of the trained weights
    pub model_path: PathBuf,

    /// Newline-separated class names, overrides the model metadata
    pub labels_path: Option<PathBuf>,

    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f32,

    #[validate(range(min = 0.0, max = 1.0))]
    pub iou_threshold: f32,

    #[validate(range(min = 1))]
    pub max_detections: usize,

    /// Square model input edge in pixels
    #[validate(range(min = 32, max = 4096))]
    pub input_size: u32,

    /// Upload limit in bytes
    #[validate(range(min = 1))]
    pub max_file_size: u64,

    /// CORS origins, `*` allows any
    pub allowed_origins: Vec<String>,

    pub log_level: String,

    pub log_format: LogFormat,

    /// Font used for annotation label text
    pub font_path: Option<PathBuf>,

    pub analyst: Option<AnalystConfig>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mode: ServiceMode = parse_or(&get, "SERVICE_MODE", ServiceMode::Api)?;

        let analyst = get("OPENAI_API_KEY")
            .map(|api_key| -> Result<AnalystConfig, ConfigError> {
                Ok(AnalystConfig {
                    api_key,
                    model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                    base_url: get("OPENAI_BASE_URL")
                        .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                        .trim_end_matches('/')
                        .to_string(),
                    vector_store_id: get("OPENAI_VECTOR_STORE_ID"),
                    timeout_seconds: parse_or(&get, "OPENAI_TIMEOUT_SECS", 60)?,
                })
            })
            .transpose()?;

        let allowed_origins: Vec<String> = get("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        for origin in &allowed_origins {
            if origin != "*" && HeaderValue::from_str(origin).is_err() {
                return Err(ConfigError::InvalidValue {
                    key: "ALLOWED_ORIGINS",
                    value: origin.clone(),
                    reason: "not a valid header value".to_string(),
                });
            }
        }

        let config = Self {
            mode,
            host: parse_or(&get, "HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: parse_or(&get, "PORT", mode.default_port())?,
            model_path: get("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("best.onnx")),
            labels_path: get("LABELS_PATH").map(PathBuf::from),
            confidence_threshold: parse_or(&get, "CONFIDENCE_THRESHOLD", 0.25)?,
            iou_threshold: parse_or(&get, "IOU_THRESHOLD", 0.45)?,
            max_detections: parse_or(&get, "MAX_DETECTIONS", 300)?,
            input_size: parse_or(&get, "INPUT_SIZE", 640)?,
            max_file_size: parse_or(&get, "MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE)?,
            allowed_origins,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()).to_lowercase(),
            log_format: parse_or(&get, "LOG_FORMAT", LogFormat::Pretty)?,
            font_path: get("FONT_PATH").map(PathBuf::from),
            analyst,
        };

        // NaN slips through range checks
        for (key, value) in [
            ("CONFIDENCE_THRESHOLD", config.confidence_threshold),
            ("IOU_THRESHOLD", config.iou_threshold),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    reason: "must be a number between 0 and 1".to_string(),
                });
            }
        }

        config
            .validate()
            .map_err(|e| ConfigError::OutOfRange(e.to_string()))?;

        if config.input_size % 32 != 0 {
            return Err(ConfigError::InvalidValue {
                key: "INPUT_SIZE",
                value: config.input_size.to_string(),
                reason: "must be a multiple of 32".to_string(),
            });
        }

        Ok(config)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*")
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
