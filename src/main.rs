//! PCB Defect Detector
//!
//! Serves a YOLO defect-detection model over HTTP, either as a JSON API or as
//! a browser upload form.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       PCB DETECTOR                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────────┐  │
//! │  │  Router    │──▶│  Upload    │──▶│  Detector            │  │
//! │  │  (Axum)    │   │  Validator │   │  (ONNX Runtime)      │  │
//! │  │  api | ui  │   └────────────┘   └──────────┬───────────┘  │
//! │  └─────┬──────┘                               ▼              │
//! │        │           ┌────────────┐   ┌──────────────────────┐ │
//! │        └──────────▶│ Annotator  │   │  Defect Analyst      │ │
//! │                    │ (imageproc)│   │  (optional, LLM)     │ │
//! │                    └────────────┘   └──────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod analysis;
mod annotate;
mod config;
mod detector;
mod error;
mod handlers;
mod validation;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{get, post},
};
use once_cell::sync::OnceCell;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
    compression::CompressionLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::analysis::DefectAnalyst;
use crate::annotate::Annotator;
use crate::config::{Config, LogFormat, ServiceMode};
use crate::detector::{Detector, YoloDetector, YoloParams};
use crate::validation::UploadPolicy;

pub use error::{AppError, AppResult};

/// Slack for multipart boundaries and part headers on top of the file limit
pub const MULTIPART_OVERHEAD: u64 = 16 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;

    init_tracing(&config);

    tracing::info!("PCB Detector starting in {:?} mode...", config.mode);
    tracing::info!("Model: {}", config.model_path.display());

    let annotator = Annotator::from_font_path(config.font_path.as_deref())
        .context("Failed to load annotation font")?;

    let analyst = match config.analyst.clone() {
        Some(analyst_config) => {
            let analyst = DefectAnalyst::new(analyst_config).context("Failed to create defect analyst")?;
            tracing::info!("Defect analyst enabled (retrieval: {})", analyst.uses_retrieval());
            Some(analyst)
        }
        None => None,
    };

    // Build application state
    let state = AppState::new(config.clone(), annotator, analyst);

    // Build router
    let app = create_router(state.clone());

    // Start server before the model is ready so /health can report 503
    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("🚀 Server listening on http://{}", addr);

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });

    // Load model
    let model_path = config.model_path.clone();
    let labels_path = config.labels_path.clone();
    let params = YoloParams {
        input_size: config.input_size,
        iou_threshold: config.iou_threshold,
        max_detections: config.max_detections,
    };
    let detector = tokio::task::spawn_blocking(move || {
        YoloDetector::load(&model_path, labels_path.as_deref(), params)
    })
    .await
    .context("Model loader panicked")?
    .context("Failed to load model")?;

    state.set_detector(Arc::new(detector));
    tracing::info!("Model ready, accepting predictions");

    server.await
        .context("Server task panicked")?
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("pcb_detector={0},tower_http={0}", config.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub policy: UploadPolicy,
    /// Set exactly once, when the model finishes loading
    detector: Arc<OnceCell<Arc<dyn Detector>>>,
    pub annotator: Arc<Annotator>,
    pub analyst: Option<Arc<DefectAnalyst>>,
}

impl AppState {
    pub fn new(config: Config, annotator: Annotator, analyst: Option<DefectAnalyst>) -> Self {
        Self {
            policy: UploadPolicy::new(config.max_file_size),
            config: Arc::new(config),
            detector: Arc::new(OnceCell::new()),
            annotator: Arc::new(annotator),
            analyst: analyst.map(Arc::new),
        }
    }

    pub fn set_detector(&self, detector: Arc<dyn Detector>) {
        if self.detector.set(detector).is_err() {
            tracing::warn!("Detector already initialized, ignoring second load");
        }
    }

    pub fn detector(&self) -> AppResult<Arc<dyn Detector>> {
        self.detector.get().cloned().ok_or(AppError::ModelNotReady)
    }

    pub fn is_ready(&self) -> bool {
        self.detector.get().is_some()
    }
}

/// Create the main router with all routes
fn create_router(state: AppState) -> Router {
    let config = state.config.clone();

    // Mode-specific routes
    let mode_routes = match config.mode {
        ServiceMode::Api => Router::new()
            .route("/", get(handlers::info::root))
            .route("/predict", post(handlers::predict::predict))
            .route("/predict-image", post(handlers::predict::predict_image)),
        ServiceMode::Ui => Router::new()
            .route("/", get(handlers::ui::form).post(handlers::ui::submit)),
    };

    let body_limit = usize::try_from(config.max_file_size.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);

    // Combine all routes
    Router::new()
        .route("/health", get(handlers::health::check))
        .merge(mode_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config))
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = if config.allows_any_origin() {
        AllowOrigin::from(Any)
    } else {
        let list: Vec<HeaderValue> = config.allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        AllowOrigin::list(list)
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}
