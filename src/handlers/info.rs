use axum::Json;
use serde::Serialize;

use crate::config::{SERVICE_DESCRIPTION, SERVICE_TITLE};

#[derive(Serialize)]
pub struct ServiceInfo {
    message: &'static str,
    version: &'static str,
    description: &'static str,
}

pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        message: SERVICE_TITLE,
        version: env!("CARGO_PKG_VERSION"),
        description: SERVICE_DESCRIPTION,
    })
}
