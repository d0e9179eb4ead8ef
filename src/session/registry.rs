//! # Session Registry
//!
//! Concurrency-safe store mapping session ids to session records.
//!
//! ## Locking discipline:
//! - The outer `RwLock<HashMap<..>>` guards membership only. It is held just long enough
//!   to insert, remove, or clone out the `Arc` of a record.
//! - Each record sits behind its own `Mutex`, so writes to one session serialize while
//!   reads and writes on different sessions proceed independently.
//! - Lock order is always map → record. No code path waits for the map lock while
//!   holding a record lock.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::id::IdGenerator;
use super::reaper::{RetentionPolicy, SweepReport};
use super::{EndCause, RegistryError, Session, SessionState};

/// How many times `create` asks the generator for a fresh id before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

type Record = Arc<Mutex<Session>>;

/// Counts of records currently held, for metrics and health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions currently active
    pub active: usize,
    /// Ended sessions still inside the retention window
    pub ended: usize,
    /// Sessions created since startup
    pub created_total: u64,
    /// Active → Ended transitions since startup, for any cause
    pub ended_total: u64,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Record>>,
    ids: Box<dyn IdGenerator>,
    active: AtomicUsize,
    /// Ended records not yet purged
    retained: AtomicUsize,
    max_active: usize,
    created_total: AtomicU64,
    ended_total: AtomicU64,
}

impl SessionRegistry {
    pub fn new(ids: Box<dyn IdGenerator>, max_active: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ids,
            active: AtomicUsize::new(0),
            retained: AtomicUsize::new(0),
            max_active,
            created_total: AtomicU64::new(0),
            ended_total: AtomicU64::new(0),
        }
    }

    /// Create a new `Active` session with a freshly generated id.
    ///
    /// ## Returns:
    /// - **Ok(session)**: The inserted record
    /// - **Err(CapacityExhausted)**: `max_active` sessions are already active
    /// - **Err(IdCollision)**: The generator repeated ids `MAX_ID_ATTEMPTS` times in a row
    pub fn create(&self) -> Result<Session, RegistryError> {
        // Reserve a slot first so concurrent creates cannot overshoot the cap.
        let previous = self.active.fetch_add(1, Ordering::AcqRel);
        if previous >= self.max_active {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(RegistryError::CapacityExhausted(self.max_active));
        }

        let mut last_candidate = String::new();
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = self.ids.next_id();
            let mut sessions = self.sessions.write();
            match sessions.entry(candidate.clone()) {
                Entry::Occupied(_) => {
                    debug!(session_id = %candidate, "Generated session id already in use, retrying");
                    last_candidate = candidate;
                }
                Entry::Vacant(slot) => {
                    let session = Session::new(candidate, Utc::now());
                    slot.insert(Arc::new(Mutex::new(session.clone())));
                    self.created_total.fetch_add(1, Ordering::AcqRel);
                    debug!(session_id = %session.id, "Session created");
                    return Ok(session);
                }
            }
        }

        self.active.fetch_sub(1, Ordering::AcqRel);
        Err(RegistryError::IdCollision(last_candidate))
    }

    /// Fetch the current record for `id`.
    pub fn get(&self, id: &str) -> Result<Session, RegistryError> {
        let record = self.record(id)?;
        let session = record.lock().clone();
        Ok(session)
    }

    /// End a session on client request.
    ///
    /// Idempotent: ending an already ended session returns the existing record,
    /// including its original `ended_at`.
    pub fn end(&self, id: &str) -> Result<Session, RegistryError> {
        self.end_with_cause(id, EndCause::Client, Utc::now())
    }

    fn end_with_cause(
        &self,
        id: &str,
        cause: EndCause,
        now: DateTime<Utc>,
    ) -> Result<Session, RegistryError> {
        let record = self.record(id)?;
        let mut session = record.lock();
        if session.end(now, cause) {
            self.mark_ended();
            info!(session_id = %id, cause = cause.as_str(), "Session ended");
        }
        Ok(session.clone())
    }

    /// Refresh `last_activity` for a session that is being streamed for.
    ///
    /// Only active sessions are touched. The returned snapshot tells the caller whether
    /// the session is still active.
    pub fn touch(&self, id: &str) -> Result<Session, RegistryError> {
        let record = self.record(id)?;
        let mut session = record.lock();
        if session.state == SessionState::Active {
            session.last_activity = Utc::now();
        }
        Ok(session.clone())
    }

    /// Apply the idle and retention policy as of `now`.
    ///
    /// ## What this does:
    /// 1. Ends active sessions whose last activity is older than the idle window
    /// 2. Purges ended sessions whose `ended_at` is older than the retention window
    pub fn sweep(&self, now: DateTime<Utc>, policy: &RetentionPolicy) -> SweepReport {
        let idle_cutoff = cutoff(now, policy.idle_timeout);
        let purge_cutoff = cutoff(now, policy.retention);

        let records: Vec<(String, Record)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();

        let mut report = SweepReport::default();
        let mut purge_candidates = Vec::new();

        for (id, record) in records {
            let mut session = record.lock();
            match session.state {
                SessionState::Active if session.last_activity <= idle_cutoff => {
                    if session.end(now, EndCause::IdleTimeout) {
                        self.mark_ended();
                        report.expired += 1;
                        info!(session_id = %id, "Session ended after idle timeout");
                    }
                }
                SessionState::Ended => {
                    if session.ended_at.map_or(false, |ended| ended <= purge_cutoff) {
                        purge_candidates.push(id);
                    }
                }
                SessionState::Active => {}
            }
        }

        if !purge_candidates.is_empty() {
            let mut sessions = self.sessions.write();
            for id in purge_candidates {
                if sessions.remove(&id).is_some() {
                    self.retained.fetch_sub(1, Ordering::AcqRel);
                    report.purged += 1;
                    debug!(session_id = %id, "Ended session purged after retention window");
                }
            }
        }

        report
    }

    /// Current number of active and retained ended sessions.
    ///
    /// `active` includes slots reserved by creates still in progress.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.active.load(Ordering::Acquire),
            ended: self.retained.load(Ordering::Acquire),
            created_total: self.created_total.load(Ordering::Acquire),
            ended_total: self.ended_total.load(Ordering::Acquire),
        }
    }

    fn mark_ended(&self) {
        self.retained.fetch_add(1, Ordering::AcqRel);
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.ended_total.fetch_add(1, Ordering::AcqRel);
    }

    fn record(&self, id: &str) -> Result<Record, RegistryError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}

/// `now - window`, clamped to the earliest representable instant.
fn cutoff(now: DateTime<Utc>, window: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
