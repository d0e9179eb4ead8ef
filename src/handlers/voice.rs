//! # Voice Ingest Handlers
//!
//! ## Available Endpoints:
//! - `POST /api/v1/voice` - Submit one opaque voice payload
//! - `GET /api/v1/voice/{correlation_id}` - Poll the outcome of a submitted payload

use crate::error::{AppError, AppResult};
use crate::ingest::{self, AckStatus, IngestStatus};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct IngestQuery {
    /// Tags the correlation record; not validated against the registry
    pub session_id: Option<String>,
}

/// Synchronous acknowledgment of a submitted payload.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: AckStatus,
    pub message: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Current outcome of a submitted payload.
#[derive(Debug, Serialize)]
pub struct IngestStatusResponse {
    pub correlation_id: String,
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub payload_bytes: usize,
    pub received_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// Accept one payload and hand it to the processing sink.
///
/// ## Endpoint: `POST /api/v1/voice[?session_id=...]`
///
/// ## Response (200):
/// ```json
/// { "status": "accepted", "message": "voice payload accepted for processing",
///   "correlation_id": "corr_9a0e..." }
/// ```
/// Empty payloads are answered with 400 and oversized ones with 413.
pub async fn ingest_voice(
    state: web::Data<AppState>,
    query: web::Query<IngestQuery>,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    let session_id = query.into_inner().session_id.filter(|id| !id.is_empty());
    let result = ingest::submit(
        state.ingest.clone(),
        state.sink.clone(),
        body,
        session_id,
        state.config.server.max_payload_bytes,
    );
    state.record_ingest(result.is_ok());
    let ack = result?;

    Ok(HttpResponse::Ok().json(IngestResponse {
        status: ack.status,
        message: "voice payload accepted for processing".to_string(),
        correlation_id: ack.correlation_id,
        session_id: ack.session_id,
    }))
}

/// ## Endpoint: `GET /api/v1/voice/{correlation_id}`
pub async fn ingest_status(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let correlation_id = path.into_inner();
    let record = state
        .ingest
        .get(&correlation_id)
        .ok_or_else(|| AppError::NotFound(format!("correlation id not found: {}", correlation_id)))?;

    Ok(HttpResponse::Ok().json(IngestStatusResponse {
        correlation_id: record.correlation_id,
        status: record.status,
        session_id: record.session_id,
        message: record.message,
        payload_bytes: record.payload_bytes,
        received_at: record.received_at.timestamp(),
        completed_at: record.completed_at.map(|t| t.timestamp()),
    }))
}
