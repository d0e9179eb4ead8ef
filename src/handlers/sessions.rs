//! # Session REST API Handlers
//!
//! Thin HTTP layer over the session registry. Every response has its own typed record;
//! timestamps are unix seconds.
//!
//! ## Available Endpoints:
//! - `POST /api/v1/sessions` - Create a session
//! - `GET /api/v1/sessions/{id}` - Inspect a session
//! - `DELETE /api/v1/sessions/{id}` - End a session (idempotent)

use crate::error::AppResult;
use crate::session::{EndCause, SessionState};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::info;

/// Response for a newly created session.
#[derive(Debug, Serialize)]
pub struct SessionCreatedResponse {
    pub session_id: String,
    pub created_at: i64,
}

/// Response for a session lookup.
#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: SessionState,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_cause: Option<EndCause>,
}

/// Response for an ended session.
#[derive(Debug, Serialize)]
pub struct SessionEndedResponse {
    pub session_id: String,
    pub ended_at: i64,
}

/// Create a new active session.
///
/// ## Endpoint: `POST /api/v1/sessions`
///
/// ## Response (201):
/// ```json
/// { "session_id": "sess_4f1c...", "created_at": 1760781600 }
/// ```
/// 503 when the active-session cap is reached.
pub async fn create_session(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let session = state.registry.create()?;
    info!(session_id = %session.id, "Session created via API");

    Ok(HttpResponse::Created().json(SessionCreatedResponse {
        session_id: session.id,
        created_at: session.created_at.timestamp(),
    }))
}

/// ## Endpoint: `GET /api/v1/sessions/{id}`
///
/// ## Response (200):
/// ```json
/// { "session_id": "sess_4f1c...", "status": "ended", "created_at": 1760781600,
///   "ended_at": 1760781642, "end_cause": "client" }
/// ```
pub async fn get_session(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let session = state.registry.get(&path.into_inner())?;

    Ok(HttpResponse::Ok().json(SessionStatusResponse {
        session_id: session.id,
        status: session.state,
        created_at: session.created_at.timestamp(),
        ended_at: session.ended_at.map(|t| t.timestamp()),
        end_cause: session.end_cause,
    }))
}

/// End a session. Repeated calls return the original `ended_at`.
///
/// ## Endpoint: `DELETE /api/v1/sessions/{id}`
pub async fn end_session(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let session = state.registry.end(&path.into_inner())?;
    let ended_at = match session.ended_at {
        Some(ended_at) => ended_at.timestamp(),
        None => {
            return Err(crate::error::AppError::Internal(format!(
                "session {} has no end time after ending",
                session.id
            )))
        }
    };

    Ok(HttpResponse::Ok().json(SessionEndedResponse {
        session_id: session.id,
        ended_at,
    }))
}
