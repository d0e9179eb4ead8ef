//! # Session Management
//!
//! Tracks the lifecycle of client voice sessions. A session is created by a client
//! request, refreshed by the stream relay while a connection streams for it, and ended
//! either explicitly or by the registry's idle policy.
//!
//! ## Session Lifecycle:
//! 1. **Active**: Created, may be streamed for
//! 2. **Ended**: Terminal; `ended_at` is set exactly once and never changes
//!
//! Ended sessions are retained for the configured retention window (so repeated end
//! requests keep returning the same `ended_at`) and then purged by the reaper.

pub mod id;
pub mod reaper;
pub mod registry;

pub use registry::SessionRegistry;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Lifecycle state of a session. Transitions only `Active → Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Ended,
}

/// Why a session was ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCause {
    /// Explicit end request from a client
    Client,
    /// Ended by the registry's idle policy
    IdleTimeout,
}

impl EndCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndCause::Client => "client",
            EndCause::IdleTimeout => "idle_timeout",
        }
    }
}

/// A snapshot of one session record.
///
/// Snapshots are plain values: holding one never blocks the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub end_cause: Option<EndCause>,
}

impl Session {
    fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: SessionState::Active,
            created_at: now,
            ended_at: None,
            last_activity: now,
            end_cause: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Move to `Ended`. Returns false if the session had already ended, in which case
    /// nothing is changed.
    fn end(&mut self, now: DateTime<Utc>, cause: EndCause) -> bool {
        if self.state == SessionState::Ended {
            return false;
        }
        self.state = SessionState::Ended;
        self.ended_at = Some(now);
        self.end_cause = Some(cause);
        true
    }
}

/// Errors raised by the session registry. All of them are recoverable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No session with this id exists (never created, or already purged)
    NotFound(String),
    /// The id generator kept producing ids that are already in use
    IdCollision(String),
    /// The active-session cap was reached
    CapacityExhausted(usize),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "session not found: {}", id),
            RegistryError::IdCollision(id) => {
                write!(f, "could not generate a unique session id (last candidate {})", id)
            }
            RegistryError::CapacityExhausted(max) => {
                write!(f, "maximum number of active sessions ({}) reached", max)
            }
        }
    }
}

impl std::error::Error for RegistryError {}
