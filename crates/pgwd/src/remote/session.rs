//! The websocket session with the remote service.
//!
//! One [`RemoteSession`] task owns the connection for the life of the
//! daemon: connect, authenticate, serve, and on any failure tear the
//! connection down and retry after a fixed delay. Messages queued
//! while disconnected are dropped, not replayed; the once-per-second
//! update makes the current state redundant with anything missed.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pgw_protocol::{
    EncodedFrame, Encoding, InboundFrame, OutboundFrame, RemoteCommand, SendScope, ServerMessage,
};

use crate::config::GatewayConfig;
use crate::discovery::scan_inventory;
use crate::registry::RegistryHandle;
use crate::router::{Router, SessionDirective};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Owns the websocket connection to the remote service.
pub struct RemoteSession {
    config: Arc<GatewayConfig>,
    registry: RegistryHandle,
    router: Router,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
    cancel: CancellationToken,

    /// Whether to reconnect after the current connection ends. Cleared
    /// only by a credential rejection that forbids retrying.
    reconnect: bool,
    /// Channel settings from the most recent `channel_settings` frame,
    /// applied to channel-scoped sends.
    channel: Option<String>,
    token: Option<String>,
}

impl RemoteSession {
    pub fn new(
        config: Arc<GatewayConfig>,
        registry: RegistryHandle,
        router: Router,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            router,
            outbound,
            cancel,
            reconnect: true,
            channel: None,
            token: None,
        }
    }

    /// Runs the connect-serve-reconnect loop until cancelled or told
    /// not to retry.
    pub async fn run(mut self) {
        loop {
            self.drain_outbound();
            self.connect_and_serve().await;

            if self.cancel.is_cancelled() {
                break;
            }
            if !self.reconnect {
                warn!("Remote session stopping for good");
                break;
            }

            debug!(
                delay_secs = self.config.timing.reconnect_delay().as_secs(),
                "Reconnecting after delay"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.timing.reconnect_delay()) => {}
            }
        }
        info!("Remote session stopped");
    }

    /// Drops everything queued while the connection was down.
    fn drain_outbound(&mut self) {
        while let Ok(message) = self.outbound.try_recv() {
            debug!(
                action = message.action(),
                "Dropping message queued while disconnected"
            );
        }
    }

    /// One connection's lifetime: connect, authenticate, serve until
    /// the stream ends, errors, or goes silent past the liveness
    /// timeout.
    async fn connect_and_serve(&mut self) {
        let url = self.config.remote.endpoint_url();
        info!(url = %url, "Connecting to remote service");

        let (ws, _response) = match connect_async(&url).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "Remote connection failed");
                return;
            }
        };
        info!("Remote connection established");

        let (mut sink, mut stream) = ws.split();

        // Channel settings and encoding are per-connection.
        self.channel = None;
        self.token = None;
        let mut encoding = Encoding::default();
        let mut last_inbound = Instant::now();

        let credentials = self.config.credentials_document();
        self.send_message(&mut sink, encoding, ServerMessage::authenticate(credentials))
            .await;

        let mut telemetry = tokio::time::interval(self.config.timing.telemetry_interval());
        telemetry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            last_inbound = Instant::now();
                            encoding = encoding.observe_inbound(false);
                            match InboundFrame::decode_text(&text) {
                                Some(frame) => {
                                    self.handle_frame(&mut sink, encoding, frame).await;
                                }
                                None => debug!("Dropping undecodable text frame"),
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            last_inbound = Instant::now();
                            encoding = encoding.observe_inbound(true);
                            match InboundFrame::decode_binary(&bytes) {
                                Some(frame) => {
                                    self.handle_frame(&mut sink, encoding, frame).await;
                                }
                                None => debug!("Dropping undecodable binary frame"),
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("Remote service closed the connection");
                            return;
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "Remote stream error");
                            return;
                        }
                        None => {
                            warn!("Remote stream ended");
                            return;
                        }
                    }
                }

                message = self.outbound.recv() => {
                    match message {
                        Some(message) => self.send_message(&mut sink, encoding, message).await,
                        // All producers gone; the daemon is shutting down.
                        None => return,
                    }
                }

                _ = telemetry.tick() => {
                    let silence = last_inbound.elapsed();
                    if silence >= self.config.timing.liveness_timeout() {
                        warn!(
                            silent_secs = silence.as_secs(),
                            "No traffic from remote service, reconnecting"
                        );
                        return;
                    }

                    let inventory = scan_inventory().await;
                    self.registry.refresh_inventory(inventory).await;
                    if let Some(update) = self.registry.build_update().await {
                        self.send_message(&mut sink, encoding, ServerMessage::UpdateData(update))
                            .await;
                    }
                }
            }
        }
    }

    /// Classifies and dispatches one inbound frame, then applies
    /// whatever the dispatch asks of the session itself.
    async fn handle_frame(&mut self, sink: &mut WsSink, encoding: Encoding, frame: InboundFrame) {
        let command = RemoteCommand::parse(&frame);
        if command == RemoteCommand::Unrecognized {
            debug!(action = %frame.action, "Ignoring unrecognized remote command");
            return;
        }
        debug!(action = %frame.action, "Handling remote command");

        match self.router.dispatch(command).await {
            SessionDirective::None => {}
            SessionDirective::SendPong => {
                self.send_message(sink, encoding, ServerMessage::Pong).await;
            }
            SessionDirective::StoreChannel { channel, token } => {
                debug!(channel = channel.as_deref().unwrap_or("-"), "Stored channel settings");
                self.channel = channel;
                self.token = token;
            }
            SessionDirective::AuthOutcome { accepted, retry } => {
                if accepted {
                    info!("Authenticated with remote service");
                } else {
                    // Whether we try again is the service's call.
                    warn!(retry, "Remote service rejected credentials");
                    self.reconnect = retry;
                }
            }
        }
    }

    /// Assembles, encodes, and sends one message on the current
    /// connection. Failures are logged and the message is dropped.
    async fn send_message(&self, sink: &mut WsSink, encoding: Encoding, message: ServerMessage) {
        let action = message.action();
        let data = match message.data() {
            Ok(data) => data,
            Err(err) => {
                warn!(action, error = %err, "Dropping unrenderable message");
                return;
            }
        };

        let frame = match message.scope() {
            SendScope::Plain => OutboundFrame::new(action, data),
            SendScope::Channel => {
                OutboundFrame::scoped(action, data, self.channel.clone(), self.token.clone())
            }
        };

        let ws_message = match frame.encode(encoding) {
            Ok(EncodedFrame::Text(text)) => Message::Text(text),
            Ok(EncodedFrame::Binary(bytes)) => Message::Binary(bytes),
            Err(err) => {
                warn!(action, error = %err, "Dropping unencodable message");
                return;
            }
        };

        if let Err(err) = sink.send(ws_message).await {
            warn!(action, error = %err, "Remote send failed");
        }
    }
}
