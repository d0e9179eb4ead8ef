//! # WebSocket Relay Endpoint
//!
//! Adapts an actix WebSocket connection to the transport-agnostic [`Relay`].
//! Clients connect to `/ws` (optionally `/ws?session_id=...`) and stream text or
//! binary frames; every reply from the processing sink is written back on the same
//! socket, in order.
//!
//! ## Actor Model:
//! Each connection is one `RelaySocket` actor. The relay itself runs as a separate task
//! and talks to the actor through two bounded channels:
//! - **inbound**: frames read from the socket, handed to the relay
//! - **outbound**: replies from the relay, written to the socket by the actor
//!
//! ## Backpressure:
//! When the inbound channel is full the actor suspends its own event processing with
//! `ctx.wait`, so no further frames are read from the socket. While suspended it keeps
//! draining the outbound channel; otherwise a full reply queue and a full inbound
//! channel would wait on each other.
//!
//! ## Close codes:
//! | Close reason                   | Code |
//! |--------------------------------|------|
//! | normal, session_ended          | 1000 |
//! | idle_timeout                   | 1001 |
//! | protocol                       | 1002 |
//! | unknown or ended session       | 1008 |
//! | internal                       | 1011 |
//! | capacity                       | 1013 |
//! | transport                      | none, the socket is gone |

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures_util::sink;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::relay::{CloseReason, CloseReport, Frame, Relay, RelayError};
use crate::state::AppState;

/// Largest close-frame description we send; the protocol caps the whole payload at 125 bytes.
const MAX_CLOSE_DESCRIPTION: usize = 120;

/// Extra time allowed after the client stops sending before the actor is torn down.
const FINISH_GRACE: Duration = Duration::from_secs(1);

/// Query parameters accepted on `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct RelayQuery {
    /// Attach the connection to an existing session
    pub session_id: Option<String>,
}

/// WebSocket actor bridging one connection to its relay.
pub struct RelaySocket {
    state: AppState,
    connection_id: String,
    /// Accepted relay (taken when the actor starts) or the rejection report
    opened: Option<Result<Relay, CloseReport>>,
    inbound: Option<mpsc::Sender<Result<Frame, RelayError>>>,
    outbound: Option<mpsc::Receiver<Frame>>,
    /// Whether the client sent a Close frame before its stream ended
    close_received: bool,
}

/// Sent by the relay task once the relay reached `Closed`.
#[derive(Message)]
#[rtype(result = "()")]
struct RelayClosed(CloseReport);

impl RelaySocket {
    pub fn new(state: AppState, opened: Result<Relay, CloseReport>) -> Self {
        let connection_id = match &opened {
            Ok(relay) => relay.connection_id().to_string(),
            Err(report) => report.connection_id.clone(),
        };
        Self {
            state,
            connection_id,
            opened: Some(opened),
            inbound: None,
            outbound: None,
            close_received: false,
        }
    }

    /// Start the relay task and the outbound pump.
    fn start_relay(&mut self, relay: Relay, ctx: &mut ws::WebsocketContext<Self>) {
        let config = &self.state.config.relay;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);
        // The relay's own queue is the real reply buffer; this hop only hands frames over.
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(1);
        self.inbound = Some(inbound_tx);
        self.outbound = Some(outbound_rx);

        let outbound = sink::unfold(outbound_tx, |tx, frame: Frame| async move {
            tx.send(frame)
                .await
                .map_err(|_| RelayError::Transport("websocket closed".to_string()))?;
            Ok::<_, RelayError>(tx)
        });

        self.state.record_relay_opened();
        let state = self.state.clone();
        let addr = ctx.address();
        actix_web::rt::spawn(async move {
            let report = relay.run(ReceiverStream::new(inbound_rx), Box::pin(outbound)).await;
            state.record_relay_closed(&report, true);
            addr.do_send(RelayClosed(report));
        });

        ctx.spawn(OutboundPump);

        let every = Duration::from_secs(self.state.config.relay.heartbeat_interval_secs);
        ctx.run_interval(every, |_, ctx| ctx.ping(b""));
    }

    /// Hand one inbound item to the relay, suspending reads while its channel is full.
    fn forward(&mut self, item: Result<Frame, RelayError>, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(tx) = &self.inbound else {
            return;
        };
        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                debug!(connection_id = %self.connection_id, "Inbound buffer full, pausing socket reads");
                let tx = tx.clone();
                ctx.wait(ForwardInbound {
                    send: Box::pin(async move {
                        let _ = tx.send(item).await;
                    }),
                });
            }
            // The relay stopped reading; it will report why.
            Err(TrySendError::Closed(_)) => self.inbound = None,
        }
    }

    /// Write every reply that is ready. `Ready` once the relay has dropped its end.
    fn drain_outbound(&mut self, ctx: &mut ws::WebsocketContext<Self>, task: &mut Context<'_>) -> Poll<()> {
        let Some(rx) = self.outbound.as_mut() else {
            return Poll::Ready(());
        };
        loop {
            match rx.poll_recv(task) {
                Poll::Ready(Some(frame)) => write_frame(ctx, frame),
                Poll::Ready(None) => {
                    self.outbound = None;
                    return Poll::Ready(());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        match self.opened.take() {
            Some(Ok(relay)) => self.start_relay(relay, ctx),
            Some(Err(report)) => {
                // Upgrade completed; close right away with a policy violation.
                self.state.record_relay_closed(&report, false);
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: report.detail.as_deref().map(close_description),
                }));
                ctx.stop();
            }
            None => ctx.stop(),
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!(connection_id = %self.connection_id, "WebSocket actor stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.forward(Ok(Frame::Text(text.to_string())), ctx),
            Ok(ws::Message::Binary(data)) => self.forward(Ok(Frame::Binary(data)), ctx),
            // Heartbeats are transport-level and do not count as activity.
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(connection_id = %self.connection_id, ?reason, "Client closed the stream");
                self.close_received = true;
                self.inbound = None;
            }
            Ok(ws::Message::Continuation(_)) => {
                self.forward(
                    Err(RelayError::Protocol("fragmented messages are not supported".to_string())),
                    ctx,
                );
                self.inbound = None;
            }
            Ok(ws::Message::Nop) => {}
            Err(ws::ProtocolError::Io(err)) => {
                debug!(connection_id = %self.connection_id, error = %err, "WebSocket read failed");
                self.forward(Err(RelayError::Transport(err.to_string())), ctx);
                self.inbound = None;
            }
            Err(err) => {
                warn!(connection_id = %self.connection_id, error = %err, "WebSocket protocol error");
                self.forward(Err(RelayError::Protocol(err.to_string())), ctx);
                self.inbound = None;
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // The socket read side is done; let the relay flush, then make sure we stop.
        if !self.close_received {
            // The peer vanished without a Close frame.
            self.forward(
                Err(RelayError::Transport("connection closed without a close frame".to_string())),
                ctx,
            );
        }
        self.inbound = None;
        let grace = self.state.config.relay_settings().backpressure_grace + FINISH_GRACE;
        ctx.run_later(grace, |act, ctx| {
            debug!(connection_id = %act.connection_id, "Stopping WebSocket actor after stream end");
            ctx.stop();
        });
    }
}

impl Handler<RelayClosed> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: RelayClosed, ctx: &mut Self::Context) {
        let report = msg.0;
        self.inbound = None;
        // Every reply was handed over before the relay finished.
        if let Some(mut rx) = self.outbound.take() {
            while let Ok(frame) = rx.try_recv() {
                write_frame(ctx, frame);
            }
        }

        if let Some(code) = close_code(report.reason) {
            ctx.close(Some(ws::CloseReason {
                code,
                description: report.detail.as_deref().map(close_description),
            }));
        }
        ctx.stop();
    }
}

/// Keeps replies flowing while the actor is otherwise idle.
struct OutboundPump;

impl ActorFuture<RelaySocket> for OutboundPump {
    type Output = ();

    fn poll(
        self: Pin<&mut Self>,
        act: &mut RelaySocket,
        ctx: &mut ws::WebsocketContext<RelaySocket>,
        task: &mut Context<'_>,
    ) -> Poll<()> {
        act.drain_outbound(ctx, task)
    }
}

/// Waits for inbound channel space while still writing replies.
struct ForwardInbound {
    send: Pin<Box<dyn Future<Output = ()>>>,
}

impl ActorFuture<RelaySocket> for ForwardInbound {
    type Output = ();

    fn poll(
        self: Pin<&mut Self>,
        act: &mut RelaySocket,
        ctx: &mut ws::WebsocketContext<RelaySocket>,
        task: &mut Context<'_>,
    ) -> Poll<()> {
        let _ = act.drain_outbound(ctx, task);
        self.get_mut().send.as_mut().poll(task)
    }
}

fn write_frame(ctx: &mut ws::WebsocketContext<RelaySocket>, frame: Frame) {
    match frame {
        Frame::Text(text) => ctx.text(text),
        Frame::Binary(data) => ctx.binary(data),
    }
}

/// WebSocket close code for a relay close reason.
pub fn close_code(reason: CloseReason) -> Option<ws::CloseCode> {
    match reason {
        CloseReason::Normal | CloseReason::SessionEnded => Some(ws::CloseCode::Normal),
        CloseReason::IdleTimeout => Some(ws::CloseCode::Away),
        CloseReason::Protocol => Some(ws::CloseCode::Protocol),
        CloseReason::Capacity => Some(ws::CloseCode::Again),
        CloseReason::Internal => Some(ws::CloseCode::Error),
        CloseReason::Transport => None,
    }
}

fn close_description(detail: &str) -> String {
    if detail.len() <= MAX_CLOSE_DESCRIPTION {
        return detail.to_string();
    }
    let mut end = MAX_CLOSE_DESCRIPTION;
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    detail[..end].to_string()
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Non-upgrade requests are answered with a 400 error envelope. An unknown or ended
/// `session_id` still completes the upgrade, then the socket is closed with code 1008
/// so browser clients can see why.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    ws::handshake(&req).map_err(|e| AppError::BadRequest(format!("Invalid WebSocket upgrade: {}", e)))?;

    let query = web::Query::<RelayQuery>::from_query(req.query_string())
        .map_err(|e| AppError::BadRequest(format!("Invalid query string: {}", e)))?
        .into_inner();
    let session_id = query.session_id.filter(|id| !id.is_empty());

    info!(
        peer = ?req.connection_info().peer_addr(),
        session_id = ?session_id,
        "New relay connection"
    );

    let opened = Relay::open(
        state.registry.clone(),
        state.sink.clone(),
        state.config.relay_settings(),
        session_id,
    );
    let socket = RelaySocket::new(state.get_ref().clone(), opened);

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(state.config.relay.max_frame_bytes)
        .start()
        .map_err(|e| AppError::BadRequest(format!("WebSocket upgrade failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use std::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    async fn start_server(state: AppState) -> (String, actix_web::dev::ServerHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let data = web::Data::new(state);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws", web::get().to(relay_websocket))
        })
        .workers(1)
        .listen(listener)
        .unwrap()
        .run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        (format!("ws://{}/ws", addr), handle)
    }

    /// Next non-heartbeat message from the server.
    async fn next_message<S>(socket: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for a message")
                .expect("socket ended")
                .expect("socket error");
            if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
                return msg;
            }
        }
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(close_code(CloseReason::Normal), Some(ws::CloseCode::Normal));
        assert_eq!(close_code(CloseReason::SessionEnded), Some(ws::CloseCode::Normal));
        assert_eq!(close_code(CloseReason::IdleTimeout), Some(ws::CloseCode::Away));
        assert_eq!(close_code(CloseReason::Capacity), Some(ws::CloseCode::Again));
        assert_eq!(close_code(CloseReason::Transport), None);
    }

    #[test]
    fn test_close_description_is_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let description = close_description(&long);
        assert!(description.len() <= MAX_CLOSE_DESCRIPTION);
        assert!(long.starts_with(&description));
    }

    #[actix_web::test]
    async fn test_echo_relay_preserves_frame_order() {
        let state = AppState::for_tests(AppConfig::default());
        let (url, handle) = start_server(state.clone()).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        for n in 1u8..=3 {
            socket.send(Message::Binary(vec![n])).await.unwrap();
        }
        socket.send(Message::Text("done".to_string())).await.unwrap();

        for n in 1u8..=3 {
            assert_eq!(next_message(&mut socket).await, Message::Binary(vec![n]));
        }
        assert_eq!(next_message(&mut socket).await, Message::Text("done".to_string()));

        socket.send(Message::Close(None)).await.unwrap();
        match next_message(&mut socket).await {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("expected close frame, got {:?}", other),
        }

        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_unknown_session_is_closed_with_policy_code() {
        let state = AppState::for_tests(AppConfig::default());
        let (url, handle) = start_server(state.clone()).await;
        let url = format!("{}?session_id=sess_unknown", url);
        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        match next_message(&mut socket).await {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1008);
                assert!(frame.reason.contains("sess_unknown"));
            }
            other => panic!("expected close frame, got {:?}", other),
        }

        let snapshot = state.metrics_snapshot();
        assert_eq!(snapshot.relay_closed.get(&CloseReason::Protocol), Some(&1));
        assert_eq!(snapshot.relay_active, 0);
        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_active_session_relay() {
        let state = AppState::for_tests(AppConfig::default());
        let session = state.registry.create().unwrap();
        let (url, handle) = start_server(state.clone()).await;
        let url = format!("{}?session_id={}", url, session.id);
        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        socket.send(Message::Text("hello".to_string())).await.unwrap();
        assert_eq!(next_message(&mut socket).await, Message::Text("hello".to_string()));

        state.registry.end(&session.id).unwrap();
        match next_message(&mut socket).await {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("expected close frame, got {:?}", other),
        }
        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_dropped_socket_is_transport_close() {
        let state = AppState::for_tests(AppConfig::default());
        let (url, handle) = start_server(state.clone()).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        socket.send(Message::Text("hello".to_string())).await.unwrap();
        assert_eq!(next_message(&mut socket).await, Message::Text("hello".to_string()));
        drop(socket);

        let mut closed = None;
        for _ in 0..300 {
            let snapshot = state.metrics_snapshot();
            if snapshot.relay_active == 0 {
                closed = Some(snapshot.relay_closed);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let closed = closed.expect("relay never closed after the socket dropped");
        assert_eq!(closed.get(&CloseReason::Transport), Some(&1));
        assert_eq!(closed.get(&CloseReason::Protocol), None);
        handle.stop(true).await;
    }

    #[actix_web::test]
    async fn test_plain_http_request_is_rejected() {
        let state = AppState::for_tests(AppConfig::default());
        let app = actix_web::test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/ws", web::get().to(relay_websocket)),
        )
        .await;
        let req = actix_web::test::TestRequest::get().uri("/ws").to_request();
        let resp = actix_web::test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }
}
