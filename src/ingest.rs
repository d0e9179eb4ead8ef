//! # Voice Ingest
//!
//! Stateless request/response entry point: one bounded payload in, one acknowledgment
//! out. The payload is handed to the processing sink in the background and the caller
//! gets a correlation id it can poll with `GET /api/v1/voice/{correlation_id}`.
//!
//! Ingest neither requires nor creates a session. A supplied session id only tags the
//! correlation record.

use actix_web::web::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::relay::{Frame, FrameSink, SinkContext, SinkError};

/// Outcome of an ingested payload as seen by pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// Handed to the sink, no result yet
    Processing,
    /// The sink processed the payload
    Completed,
    /// The sink refused the payload
    Rejected,
    /// The sink failed
    Error,
}

/// Acknowledgment status returned synchronously by `POST /api/v1/voice`.
///
/// Payloads that fail validation never get an acknowledgment; they are answered with
/// the error envelope instead, and sink-side rejections show up when polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
}

/// Why a payload was refused before reaching the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    Empty,
    TooLarge { size: usize, limit: usize },
    /// Every in-flight slot is taken
    Saturated { in_flight: usize },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Empty => write!(f, "voice payload is empty"),
            IngestError::TooLarge { size, limit } => {
                write!(f, "voice payload of {} bytes exceeds the {} byte limit", size, limit)
            }
            IngestError::Saturated { in_flight } => {
                write!(f, "{} voice payloads already in flight, try again later", in_flight)
            }
        }
    }
}

impl std::error::Error for IngestError {}

/// One tracked ingest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestRecord {
    pub correlation_id: String,
    pub session_id: Option<String>,
    pub status: IngestStatus,
    pub message: Option<String>,
    pub payload_bytes: usize,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Synchronous acknowledgment for an accepted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestAck {
    pub status: AckStatus,
    pub correlation_id: String,
    pub session_id: Option<String>,
}

#[derive(Default)]
struct TrackerInner {
    records: HashMap<String, IngestRecord>,
    order: VecDeque<String>,
}

/// Bounded store of recent ingests.
///
/// At most `max_in_flight` payloads are with the sink at once. When the store is full
/// the oldest settled record is evicted; records still `Processing` are kept, so a
/// correlation id stays pollable until its outcome is known.
pub struct IngestTracker {
    inner: RwLock<TrackerInner>,
    capacity: usize,
    max_in_flight: usize,
    permits: Arc<Semaphore>,
}

impl IngestTracker {
    pub fn new(capacity: usize, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            inner: RwLock::new(TrackerInner::default()),
            capacity: capacity.max(1),
            max_in_flight,
            permits: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    fn begin(&self, session_id: Option<String>, payload_bytes: usize) -> IngestRecord {
        let record = IngestRecord {
            correlation_id: format!("corr_{}", Uuid::new_v4().simple()),
            session_id,
            status: IngestStatus::Processing,
            message: None,
            payload_bytes,
            received_at: Utc::now(),
            completed_at: None,
        };

        let mut inner = self.inner.write();
        while inner.order.len() >= self.capacity {
            let TrackerInner { records, order } = &mut *inner;
            let settled = order.iter().position(|id| {
                records
                    .get(id)
                    .map_or(true, |record| record.status != IngestStatus::Processing)
            });
            match settled.and_then(|pos| order.remove(pos)) {
                Some(oldest) => {
                    records.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(record.correlation_id.clone());
        inner.records.insert(record.correlation_id.clone(), record.clone());
        record
    }

    fn complete(&self, correlation_id: &str, status: IngestStatus, message: String) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.records.get_mut(correlation_id) {
            record.status = status;
            record.message = Some(message);
            record.completed_at = Some(Utc::now());
        }
    }

    pub fn get(&self, correlation_id: &str) -> Option<IngestRecord> {
        self.inner.read().records.get(correlation_id).cloned()
    }

    /// Payloads currently with the sink.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }
}

/// Check size bounds without touching the sink.
pub fn validate(payload: &[u8], limit: usize) -> Result<(), IngestError> {
    if payload.is_empty() {
        return Err(IngestError::Empty);
    }
    if payload.len() > limit {
        return Err(IngestError::TooLarge {
            size: payload.len(),
            limit,
        });
    }
    Ok(())
}

/// Accept one payload and hand it to the sink in the background.
///
/// ## Returns:
/// - **Ok(ack)**: `accepted`, with the correlation id to poll
/// - **Err(IngestError)**: the payload was refused and never reached the sink
pub fn submit(
    tracker: Arc<IngestTracker>,
    sink: Arc<dyn FrameSink>,
    payload: Bytes,
    session_id: Option<String>,
    limit: usize,
) -> Result<IngestAck, IngestError> {
    validate(&payload, limit)?;
    let permit = tracker
        .permits
        .clone()
        .try_acquire_owned()
        .map_err(|_| IngestError::Saturated {
            in_flight: tracker.max_in_flight,
        })?;

    let record = tracker.begin(session_id, payload.len());
    let ack = IngestAck {
        status: AckStatus::Accepted,
        correlation_id: record.correlation_id.clone(),
        session_id: record.session_id.clone(),
    };
    debug!(
        correlation_id = %record.correlation_id,
        session_id = ?record.session_id,
        payload_bytes = record.payload_bytes,
        "Voice payload accepted"
    );

    tokio::spawn(async move {
        let ctx = SinkContext {
            correlation_id: record.correlation_id.clone(),
            session_id: record.session_id.clone(),
            sequence: 0,
        };
        let (status, message) = match sink.process(&ctx, Frame::Binary(payload)).await {
            Ok(Some(reply)) => (
                IngestStatus::Completed,
                format!("processed by {} sink ({} byte reply)", sink.name(), reply.len()),
            ),
            Ok(None) => (IngestStatus::Completed, format!("processed by {} sink", sink.name())),
            Err(err @ SinkError::Rejected(_)) => (IngestStatus::Rejected, err.to_string()),
            Err(err @ SinkError::Failed(_)) => (IngestStatus::Error, err.to_string()),
        };

        match status {
            IngestStatus::Completed => {
                info!(correlation_id = %ctx.correlation_id, "Voice payload processed")
            }
            _ => warn!(correlation_id = %ctx.correlation_id, error = %message, "Voice payload not processed"),
        }
        tracker.complete(&ctx.correlation_id, status, message);
        drop(permit);
    });

    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::EchoSink;
    use async_trait::async_trait;
    use std::time::Duration;

    struct RejectingSink;

    #[async_trait]
    impl FrameSink for RejectingSink {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        async fn process(&self, _ctx: &SinkContext, _frame: Frame) -> Result<Option<Frame>, SinkError> {
            Err(SinkError::Rejected("unsupported codec".to_string()))
        }
    }

    async fn wait_for_result(tracker: &IngestTracker, id: &str) -> IngestRecord {
        for _ in 0..100 {
            let record = tracker.get(id).unwrap();
            if record.status != IngestStatus::Processing {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("ingest {} never completed", id);
    }

    #[test]
    fn test_validate_bounds() {
        assert_eq!(validate(b"", 10), Err(IngestError::Empty));
        assert_eq!(validate(b"0123456789a", 10), Err(IngestError::TooLarge { size: 11, limit: 10 }));
        assert!(validate(b"0123456789", 10).is_ok());
    }

    #[tokio::test]
    async fn test_submit_tracks_completion() {
        let tracker = Arc::new(IngestTracker::new(16, 4));
        let ack = submit(
            tracker.clone(),
            Arc::new(EchoSink),
            Bytes::from_static(b"pcm"),
            Some("sess_tag".to_string()),
            1024,
        )
        .unwrap();

        assert_eq!(ack.status, AckStatus::Accepted);
        assert!(ack.correlation_id.starts_with("corr_"));

        let record = wait_for_result(&tracker, &ack.correlation_id).await;
        assert_eq!(record.status, IngestStatus::Completed);
        assert_eq!(record.session_id.as_deref(), Some("sess_tag"));
        assert_eq!(record.payload_bytes, 3);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_sink_rejection_is_recorded() {
        let tracker = Arc::new(IngestTracker::new(16, 4));
        let ack = submit(tracker.clone(), Arc::new(RejectingSink), Bytes::from_static(b"x"), None, 1024).unwrap();

        let record = wait_for_result(&tracker, &ack.correlation_id).await;
        assert_eq!(record.status, IngestStatus::Rejected);
        assert!(record.message.unwrap().contains("unsupported codec"));
    }

    #[tokio::test]
    async fn test_invalid_payload_never_tracked() {
        let tracker = Arc::new(IngestTracker::new(16, 4));
        let result = submit(tracker.clone(), Arc::new(EchoSink), Bytes::new(), None, 1024);
        assert_eq!(result, Err(IngestError::Empty));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_tracker_evicts_oldest_settled_record() {
        let tracker = IngestTracker::new(2, 2);
        let pending = tracker.begin(None, 1);
        let settled = tracker.begin(None, 1);
        tracker.complete(&settled.correlation_id, IngestStatus::Completed, "ok".to_string());
        let newest = tracker.begin(None, 1);

        assert!(tracker.get(&pending.correlation_id).is_some());
        assert!(tracker.get(&settled.correlation_id).is_none());
        assert!(tracker.get(&newest.correlation_id).is_some());
        assert_eq!(tracker.len(), 2);
    }

    struct StalledSink;

    #[async_trait]
    impl FrameSink for StalledSink {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn process(&self, _ctx: &SinkContext, _frame: Frame) -> Result<Option<Frame>, SinkError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_in_flight_payloads_are_bounded() {
        let tracker = Arc::new(IngestTracker::new(16, 4));
        let sink: Arc<dyn FrameSink> = Arc::new(StalledSink);

        let mut accepted = Vec::new();
        let mut saturated = 0;
        for _ in 0..100 {
            match submit(tracker.clone(), sink.clone(), Bytes::from_static(b"pcm"), None, 1024) {
                Ok(ack) => accepted.push(ack.correlation_id),
                Err(IngestError::Saturated { in_flight }) => {
                    assert_eq!(in_flight, 4);
                    saturated += 1;
                }
                Err(other) => panic!("unexpected ingest error: {}", other),
            }
        }

        assert_eq!(accepted.len(), 4);
        assert_eq!(saturated, 96);
        assert_eq!(tracker.in_flight(), 4);
        for id in &accepted {
            assert_eq!(tracker.get(id).unwrap().status, IngestStatus::Processing);
        }
    }

    #[tokio::test]
    async fn test_completed_payload_frees_its_slot() {
        let tracker = Arc::new(IngestTracker::new(16, 1));
        let ack = submit(tracker.clone(), Arc::new(EchoSink), Bytes::from_static(b"a"), None, 1024).unwrap();
        wait_for_result(&tracker, &ack.correlation_id).await;

        for _ in 0..100 {
            if tracker.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(submit(tracker.clone(), Arc::new(EchoSink), Bytes::from_static(b"b"), None, 1024).is_ok());
    }
}
