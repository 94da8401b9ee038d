use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `GET /api/v1/config` with credentials redacted.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config.redacted()
    })))
}

/// `PUT /api/v1/config` applies a partial update to the dispatch and
/// synthesis sections. Invalid updates leave the running config untouched.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;
    let updated = state.update_config(&json_str)?;
    info!(
        min_buffer_bytes = updated.dispatch.min_buffer_bytes,
        max_idle_interval_ms = updated.dispatch.max_idle_interval_ms,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated.redacted()
    })))
}
