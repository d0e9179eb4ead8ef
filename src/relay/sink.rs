//! # Processing Sink
//!
//! The downstream voice pipeline is an external collaborator. The gateway only knows the
//! contract in [`FrameSink`]: hand it one frame, get back an optional reply frame or an
//! error. Both the stream relay and the ingest endpoint talk to the same sink.
//!
//! ## Implementations:
//! - [`HttpSink`]: the real relay; POSTs each frame to the configured downstream url
//! - [`EchoSink`]: **degraded fallback only**, used when no downstream is configured.
//!   It reflects every frame back verbatim so clients can exercise the transport, but
//!   no processing happens. Startup logs a warning and `/metrics` reports
//!   `gateway_sink_fallback 1` while it is active.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::{Frame, RelayError};
use actix_web::web::Bytes;

/// Metadata passed along with every frame handed to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkContext {
    /// Connection id for streamed frames, correlation id for ingested payloads
    pub correlation_id: String,
    /// Associated session, if any
    pub session_id: Option<String>,
    /// Position of the frame within its connection (0-based)
    pub sequence: u64,
}

/// Failures reported by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink refused the frame as invalid
    Rejected(String),
    /// The sink could not process the frame
    Failed(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Rejected(msg) => write!(f, "rejected by sink: {}", msg),
            SinkError::Failed(msg) => write!(f, "sink failure: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<SinkError> for RelayError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Rejected(_) => RelayError::Protocol(err.to_string()),
            SinkError::Failed(_) => RelayError::Internal(err.to_string()),
        }
    }
}

/// Downstream processing collaborator.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// True for the echo fallback.
    fn is_fallback(&self) -> bool {
        false
    }

    /// Process one frame. `Ok(None)` means the frame was consumed without a reply.
    async fn process(&self, ctx: &SinkContext, frame: Frame) -> Result<Option<Frame>, SinkError>;
}

/// Degraded fallback that reflects frames back unchanged.
#[derive(Debug, Default)]
pub struct EchoSink;

#[async_trait]
impl FrameSink for EchoSink {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn is_fallback(&self) -> bool {
        true
    }

    async fn process(&self, _ctx: &SinkContext, frame: Frame) -> Result<Option<Frame>, SinkError> {
        Ok(Some(frame))
    }
}

/// Forwards frames to the downstream pipeline over HTTP.
///
/// ## Wire contract:
/// - `POST <url>` with the frame as the body (`text/plain` for text frames,
///   `application/octet-stream` for binary frames)
/// - Headers `x-correlation-id`, `x-frame-seq` and, when known, `x-session-id`
/// - `204` or an empty `2xx` body: no reply
/// - `2xx` with a body: reply frame (text if the response content type is textual)
/// - `4xx`: the frame is rejected; anything else is a sink failure
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl FrameSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn process(&self, ctx: &SinkContext, frame: Frame) -> Result<Option<Frame>, SinkError> {
        let (body, content_type) = match frame {
            Frame::Text(text) => (reqwest::Body::from(text), "text/plain; charset=utf-8"),
            Frame::Binary(data) => (reqwest::Body::from(data), "application/octet-stream"),
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, content_type)
            .header("x-correlation-id", ctx.correlation_id.as_str())
            .header("x-frame-seq", ctx.sequence)
            .body(body);
        if let Some(session_id) = &ctx.session_id {
            request = request.header("x-session-id", session_id.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Failed(format!("downstream request failed: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(SinkError::Rejected(format!("downstream answered {}", status)));
        }
        if !status.is_success() {
            return Err(SinkError::Failed(format!("downstream answered {}", status)));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let textual = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map_or(false, is_textual);
        let body = response
            .bytes()
            .await
            .map_err(|e| SinkError::Failed(format!("failed to read downstream reply: {}", e)))?;

        debug!(
            correlation_id = %ctx.correlation_id,
            sequence = ctx.sequence,
            reply_bytes = body.len(),
            "Downstream reply received"
        );
        Ok(reply_frame(textual, body))
    }
}

fn is_textual(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    mime.starts_with("text/") || mime == "application/json"
}

fn reply_frame(textual: bool, body: Bytes) -> Option<Frame> {
    if body.is_empty() {
        return None;
    }
    if textual {
        match String::from_utf8(body.to_vec()) {
            Ok(text) => return Some(Frame::Text(text)),
            Err(_) => return Some(Frame::Binary(body)),
        }
    }
    Some(Frame::Binary(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SinkContext {
        SinkContext {
            correlation_id: "conn_1".to_string(),
            session_id: None,
            sequence: 0,
        }
    }

    #[tokio::test]
    async fn test_echo_sink_reflects_frames() {
        let sink = EchoSink;
        assert!(sink.is_fallback());
        let frame = Frame::Binary(Bytes::from_static(b"\x01\x02"));
        assert_eq!(sink.process(&ctx(), frame.clone()).await.unwrap(), Some(frame));
    }

    #[test]
    fn test_reply_frame_selection() {
        assert_eq!(reply_frame(true, Bytes::new()), None);
        assert_eq!(
            reply_frame(true, Bytes::from_static(b"{\"ok\":true}")),
            Some(Frame::Text("{\"ok\":true}".to_string()))
        );
        assert_eq!(
            reply_frame(false, Bytes::from_static(b"abc")),
            Some(Frame::Binary(Bytes::from_static(b"abc")))
        );
        // Invalid UTF-8 under a textual content type degrades to binary.
        assert_eq!(
            reply_frame(true, Bytes::from_static(&[0xff, 0xfe])),
            Some(Frame::Binary(Bytes::from_static(&[0xff, 0xfe])))
        );
    }

    #[test]
    fn test_textual_content_types() {
        assert!(is_textual("text/plain; charset=utf-8"));
        assert!(is_textual("application/json"));
        assert!(!is_textual("application/octet-stream"));
        assert!(!is_textual("audio/wav"));
    }

    #[test]
    fn test_sink_error_maps_to_relay_error() {
        let err: RelayError = SinkError::Rejected("bad frame".into()).into();
        assert!(matches!(err, RelayError::Protocol(_)));
        let err: RelayError = SinkError::Failed("timeout".into()).into();
        assert!(matches!(err, RelayError::Internal(_)));
    }
}
