use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/sessions`
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let mut sessions = state.sessions.snapshots();
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max_sessions": state.sessions.max_sessions(),
        "sessions": sessions
    })))
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let handle = state.sessions.get(&session_id)?;
    let snapshot = crate::audio::session::lock(&handle).snapshot();

    Ok(HttpResponse::Ok().json(snapshot))
}
