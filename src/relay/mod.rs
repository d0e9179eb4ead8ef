//! # Stream Relay
//!
//! Manages one live duplex connection: inbound frames are forwarded, in arrival order,
//! to the processing sink and the sink's replies are written back to the client.
//!
//! ## Connection State Machine:
//! ```text
//! Open ──► Streaming ──► Closing ──► Closed
//!   │                                  ▲
//!   └──────── (unknown session) ───────┘
//! ```
//! - **Open**: Accepted; the optional session lookup runs here
//! - **Streaming**: Reading inbound frames, dispatching them, writing replies
//! - **Closing**: No more inbound frames are read; queued replies are flushed
//! - **Closed**: Terminal; the transport is released and a [`CloseReport`] is produced
//!
//! The relay core knows nothing about WebSockets. It is driven by any
//! `Stream` of inbound frames and any `Sink` of outbound frames, which is what lets the
//! tests run it over plain channels. `websocket.rs` adapts an actix WebSocket to it.

pub mod pipeline;
pub mod sink;

pub use pipeline::{Relay, RelaySettings};
pub use sink::{EchoSink, FrameSink, HttpSink, SinkContext, SinkError};

use actix_web::web::Bytes;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// One discrete unit of streamed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Control or metadata message
    Text(String),
    /// Audio chunk or other opaque data
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }
}

/// Lifecycle state of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Open,
    Streaming,
    Closing,
    Closed,
}

impl ConnState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnState) -> bool {
        matches!(
            (self, next),
            (ConnState::Open, ConnState::Streaming)
                | (ConnState::Open, ConnState::Closed)
                | (ConnState::Streaming, ConnState::Closing)
                | (ConnState::Closing, ConnState::Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Open => "open",
            ConnState::Streaming => "streaming",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        }
    }
}

/// Why a connection reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client signalled end-of-stream
    Normal,
    /// No inbound frame arrived within the idle window
    IdleTimeout,
    /// The associated session was ended while streaming
    SessionEnded,
    /// Malformed frame, invalid upgrade, unknown session, or frame rejected by the sink
    Protocol,
    /// Socket read or write failure
    Transport,
    /// The outbound buffer stayed full past the grace period
    Capacity,
    /// Unexpected sink or registry failure
    Internal,
}

impl CloseReason {
    pub const ALL: [CloseReason; 7] = [
        CloseReason::Normal,
        CloseReason::IdleTimeout,
        CloseReason::SessionEnded,
        CloseReason::Protocol,
        CloseReason::Transport,
        CloseReason::Capacity,
        CloseReason::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::SessionEnded => "session_ended",
            CloseReason::Protocol => "protocol",
            CloseReason::Transport => "transport",
            CloseReason::Capacity => "capacity",
            CloseReason::Internal => "internal",
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            CloseReason::Normal | CloseReason::IdleTimeout | CloseReason::SessionEnded
        )
    }
}

/// Connection-fatal failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    Protocol(String),
    Transport(String),
    Capacity(String),
    Internal(String),
}

impl RelayError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            RelayError::Protocol(_) => CloseReason::Protocol,
            RelayError::Transport(_) => CloseReason::Transport,
            RelayError::Capacity(_) => CloseReason::Capacity,
            RelayError::Internal(_) => CloseReason::Internal,
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            RelayError::Transport(msg) => write!(f, "transport error: {}", msg),
            RelayError::Capacity(msg) => write!(f, "capacity error: {}", msg),
            RelayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

/// Final account of a connection, reported once it is `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    pub connection_id: String,
    pub session_id: Option<String>,
    pub reason: CloseReason,
    pub detail: Option<String>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(ConnState::Open.can_transition_to(ConnState::Streaming));
        assert!(ConnState::Open.can_transition_to(ConnState::Closed));
        assert!(ConnState::Streaming.can_transition_to(ConnState::Closing));
        assert!(ConnState::Closing.can_transition_to(ConnState::Closed));

        assert!(!ConnState::Streaming.can_transition_to(ConnState::Closed));
        assert!(!ConnState::Closed.can_transition_to(ConnState::Open));
        assert!(!ConnState::Closing.can_transition_to(ConnState::Streaming));
    }

    #[test]
    fn test_error_reasons() {
        assert_eq!(RelayError::Transport("reset".into()).close_reason(), CloseReason::Transport);
        assert_eq!(RelayError::Capacity("full".into()).close_reason(), CloseReason::Capacity);
        assert!(CloseReason::Capacity.is_error());
        assert!(!CloseReason::IdleTimeout.is_error());
    }
}
