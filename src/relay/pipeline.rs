//! The per-connection relay state machine.
//!
//! ## Pipeline:
//! ```text
//! inbound stream ─► reader ─► sink.process ─► bounded queue ─► writer ─► outbound sink
//! ```
//! - The reader handles one frame at a time, so frames reach the sink in arrival order
//!   and there is never more than one in-flight sink call per connection.
//! - The queue between reader and writer holds at most `outbound_capacity` replies.
//!   When it is full the reader waits on the queue instead of reading the next inbound
//!   frame, so a slow client throttles its own input.
//! - If the queue stays full longer than `backpressure_grace` the connection fails with
//!   a capacity error rather than buffering without bound.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sink::{FrameSink, SinkContext};
use super::{CloseReason, CloseReport, ConnState, Frame, RelayError};
use crate::session::SessionRegistry;

/// Timing and buffering knobs for one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Close the connection when no inbound frame arrives for this long
    pub idle_timeout: Duration,
    /// Maximum number of replies queued for the writer
    pub outbound_capacity: usize,
    /// How long the queue may stay full (and how long the final flush may take)
    pub backpressure_grace: Duration,
    /// How often the associated session is re-checked while no frames arrive
    pub session_check_interval: Duration,
}

/// Why the reader stopped.
enum Stop {
    EndOfStream,
    IdleTimeout,
    SessionEnded,
    WriterGone,
    Failed(RelayError),
}

/// One live relay connection.
pub struct Relay {
    connection_id: String,
    session_id: Option<String>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn FrameSink>,
    settings: RelaySettings,
    state: watch::Sender<ConnState>,
    opened_at: Instant,
}

impl Relay {
    /// Accept a connection in the `Open` state.
    ///
    /// When a session id is supplied it must name an active session. Otherwise the
    /// connection goes straight to `Closed` with a protocol error and the returned
    /// report explains why; nothing is ever forwarded to the sink.
    pub fn open(
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn FrameSink>,
        settings: RelaySettings,
        session_id: Option<String>,
    ) -> Result<Self, CloseReport> {
        let (state, _) = watch::channel(ConnState::Open);
        let relay = Self {
            connection_id: format!("conn_{}", Uuid::new_v4().simple()),
            session_id,
            registry,
            sink,
            settings,
            state,
            opened_at: Instant::now(),
        };

        if let Some(session_id) = &relay.session_id {
            let rejection = match relay.registry.get(session_id) {
                Ok(session) if session.is_active() => None,
                Ok(_) => Some(format!("session {} has ended", session_id)),
                Err(err) => Some(err.to_string()),
            };
            if let Some(detail) = rejection {
                return Err(relay.reject(RelayError::Protocol(detail)));
            }
        }

        debug!(
            connection_id = %relay.connection_id,
            session_id = ?relay.session_id,
            "Relay connection opened"
        );
        Ok(relay)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Observe state transitions.
    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.state.subscribe()
    }

    /// Stream until either side stops, then flush and close.
    ///
    /// `inbound` ending (`None`) is the client's end-of-stream; an `Err` item is a
    /// connection-fatal read failure. `outbound` is closed once every queued reply has
    /// been written.
    pub async fn run<I, O>(self, inbound: I, outbound: O) -> CloseReport
    where
        I: Stream<Item = Result<Frame, RelayError>> + Unpin,
        O: Sink<Frame, Error = RelayError> + Unpin,
    {
        self.transition(ConnState::Streaming);
        info!(
            connection_id = %self.connection_id,
            session_id = ?self.session_id,
            sink = self.sink.name(),
            "Relay streaming"
        );

        let frames_out = AtomicU64::new(0);
        let (queue_tx, queue_rx) = mpsc::channel(self.settings.outbound_capacity);

        let writer = write_outbound(queue_rx, outbound, &frames_out);
        tokio::pin!(writer);
        let mut write_error: Option<Option<RelayError>> = None;

        let (stop, frames_in) = {
            let reader = self.pump_inbound(inbound, queue_tx);
            tokio::pin!(reader);
            loop {
                tokio::select! {
                    outcome = &mut reader => break outcome,
                    // Only finishes early when a write fails.
                    error = &mut writer, if write_error.is_none() => write_error = Some(error),
                }
            }
        };

        // Closing: the queue sender is gone, so the writer drains what is left.
        let write_error = match write_error {
            Some(error) => error,
            None => match tokio::time::timeout(self.settings.backpressure_grace, &mut writer).await {
                Ok(error) => error,
                Err(_) => Some(RelayError::Capacity(
                    "queued frames could not be flushed before close".to_string(),
                )),
            },
        };

        let (reason, detail) = match (stop, write_error) {
            (Stop::Failed(err), _) => (err.close_reason(), Some(err.to_string())),
            (_, Some(err)) => (err.close_reason(), Some(err.to_string())),
            (Stop::EndOfStream, None) => (CloseReason::Normal, None),
            (Stop::IdleTimeout, None) => (
                CloseReason::IdleTimeout,
                Some(format!("no inbound frame within {:?}", self.settings.idle_timeout)),
            ),
            (Stop::SessionEnded, None) => (CloseReason::SessionEnded, Some("session ended".to_string())),
            (Stop::WriterGone, None) => (
                CloseReason::Transport,
                Some("outbound writer stopped".to_string()),
            ),
        };

        self.transition(ConnState::Closed);
        let report = self.report(reason, detail, frames_in, frames_out.load(Ordering::Acquire));
        if reason.is_error() {
            warn!(
                connection_id = %report.connection_id,
                session_id = ?report.session_id,
                reason = reason.as_str(),
                detail = ?report.detail,
                frames_in = report.frames_in,
                frames_out = report.frames_out,
                "Relay closed with error"
            );
        } else {
            info!(
                connection_id = %report.connection_id,
                session_id = ?report.session_id,
                reason = reason.as_str(),
                frames_in = report.frames_in,
                frames_out = report.frames_out,
                duration_ms = report.duration.as_millis() as u64,
                "Relay closed"
            );
        }
        report
    }

    async fn pump_inbound<I>(&self, mut inbound: I, queue: mpsc::Sender<Frame>) -> (Stop, u64)
    where
        I: Stream<Item = Result<Frame, RelayError>> + Unpin,
    {
        let mut frames_in = 0u64;
        let idle = tokio::time::sleep(self.settings.idle_timeout);
        tokio::pin!(idle);
        let mut session_check = tokio::time::interval(self.settings.session_check_interval);
        session_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        session_check.reset();

        let stop = loop {
            tokio::select! {
                biased;
                _ = queue.closed() => break Stop::WriterGone,
                _ = &mut idle => break Stop::IdleTimeout,
                _ = session_check.tick(), if self.session_id.is_some() => {
                    if !self.session_is_active() {
                        break Stop::SessionEnded;
                    }
                }
                next = inbound.next() => match next {
                    None => break Stop::EndOfStream,
                    Some(Err(err)) => break Stop::Failed(err),
                    Some(Ok(frame)) => {
                        let sequence = frames_in;
                        frames_in += 1;
                        if let Some(stop) = self.dispatch(sequence, frame, &queue).await {
                            break stop;
                        }
                        // Time spent waiting on backpressure is not idleness.
                        idle.as_mut().reset(tokio::time::Instant::now() + self.settings.idle_timeout);
                    }
                }
            }
        };

        self.transition(ConnState::Closing);
        (stop, frames_in)
    }

    /// Forward one frame and queue the reply. `Some` means the connection must close.
    async fn dispatch(&self, sequence: u64, frame: Frame, queue: &mpsc::Sender<Frame>) -> Option<Stop> {
        if let Some(session_id) = &self.session_id {
            match self.registry.touch(session_id) {
                Ok(session) if session.is_active() => {}
                _ => return Some(Stop::SessionEnded),
            }
        }

        let ctx = SinkContext {
            correlation_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
            sequence,
        };
        let reply = match self.sink.process(&ctx, frame).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return None,
            Err(err) => return Some(Stop::Failed(err.into())),
        };

        if queue.capacity() == 0 {
            debug!(connection_id = %self.connection_id, "Outbound buffer full, suspending inbound reads");
        }
        match tokio::time::timeout(self.settings.backpressure_grace, queue.send(reply)).await {
            Ok(Ok(())) => None,
            Ok(Err(_)) => Some(Stop::WriterGone),
            Err(_) => Some(Stop::Failed(RelayError::Capacity(format!(
                "outbound buffer of {} frames stayed full for {:?}",
                self.settings.outbound_capacity, self.settings.backpressure_grace
            )))),
        }
    }

    fn session_is_active(&self) -> bool {
        match &self.session_id {
            Some(id) => self.registry.get(id).map_or(false, |session| session.is_active()),
            None => true,
        }
    }

    fn transition(&self, next: ConnState) {
        let connection_id = &self.connection_id;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(connection_id = %connection_id, from = current.as_str(), to = next.as_str(), "Relay state change");
                *current = next;
                true
            } else {
                warn!(connection_id = %connection_id, from = current.as_str(), to = next.as_str(), "Ignoring invalid relay state change");
                false
            }
        });
    }

    fn reject(self, err: RelayError) -> CloseReport {
        self.transition(ConnState::Closed);
        warn!(
            connection_id = %self.connection_id,
            session_id = ?self.session_id,
            error = %err,
            "Relay connection rejected"
        );
        self.report(err.close_reason(), Some(err.to_string()), 0, 0)
    }

    fn report(&self, reason: CloseReason, detail: Option<String>, frames_in: u64, frames_out: u64) -> CloseReport {
        CloseReport {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
            reason,
            detail,
            frames_in,
            frames_out,
            duration: self.opened_at.elapsed(),
        }
    }
}

/// Write queued replies until the queue closes, then close the transport.
async fn write_outbound<O>(mut queue: mpsc::Receiver<Frame>, mut outbound: O, written: &AtomicU64) -> Option<RelayError>
where
    O: Sink<Frame, Error = RelayError> + Unpin,
{
    while let Some(frame) = queue.recv().await {
        if let Err(err) = outbound.send(frame).await {
            queue.close();
            return Some(err);
        }
        written.fetch_add(1, Ordering::AcqRel);
    }
    outbound.close().await.err()
}
