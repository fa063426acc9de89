//! Persistent WebSocket connection with automatic reconnect.
//!
//! [`RelayClient::run`] drives everything on one task: it connects, then
//! multiplexes inbound frames, execution events, heartbeats, and the writer
//! task until the connection drops or shutdown is requested. After a drop
//! it waits out an exponential backoff and reconnects. Execution events are
//! drained while connecting and while waiting, so executions never block on
//! the transport.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::backoff::Backoff;
use super::manager::{RelayEvent, SessionManager};
use super::writer::run_writer;
use crate::config::ConnectionConfig;
use crate::models::execution::TransportState;
use crate::{AppError, Result};

/// Header carrying the relay identity on the handshake.
pub const AGENT_ID_HEADER: &str = "x-agent-id";

/// Capacity of the per-connection outbound queue.
const OUTBOUND_CAPACITY: usize = 256;

/// Time allowed for the close handshake on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Connection-level settings.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    /// WebSocket URL of the controller.
    pub url: String,
    /// Bearer token presented on the handshake.
    pub token: String,
    /// Relay identity.
    pub agent_id: String,
}

/// Owns the [`SessionManager`] and its transport.
#[derive(Debug)]
pub struct RelayClient {
    endpoint: RelayEndpoint,
    heartbeat_period: Duration,
    connect_timeout: Duration,
    backoff: Backoff,
    state: TransportState,
    manager: SessionManager,
    events_rx: mpsc::Receiver<RelayEvent>,
}

impl RelayClient {
    /// Build a client around a manager and the receiver its executions
    /// report to.
    #[must_use]
    pub fn new(
        endpoint: RelayEndpoint,
        connection: &ConnectionConfig,
        manager: SessionManager,
        events_rx: mpsc::Receiver<RelayEvent>,
    ) -> Self {
        Self {
            endpoint,
            heartbeat_period: connection.heartbeat_period(),
            connect_timeout: connection.connect_timeout(),
            backoff: Backoff::new(connection.reconnect_base(), connection.reconnect_max()),
            state: TransportState::Disconnected,
            manager,
            events_rx,
        }
    }

    /// Current transport state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Connect and serve until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Connection failures are retried forever; this only returns an error
    /// for unrecoverable local problems.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let span = info_span!("relay", agent_id = %self.endpoint.agent_id);
        async move {
            while !shutdown.is_cancelled() {
                self.state = TransportState::Connecting;
                info!(url = %self.endpoint.url, "connecting");

                let Some(connected) = self.connect_draining(&shutdown).await else {
                    break;
                };

                match connected {
                    Ok(ws) => {
                        self.state = TransportState::Connected;
                        self.backoff.reset();
                        info!("connected");

                        let end = self.serve(ws, &shutdown).await;
                        self.state = TransportState::Disconnected;
                        match end {
                            SessionEnd::Shutdown => {
                                info!("connection closed for shutdown");
                                return Ok(());
                            }
                            SessionEnd::Lost(reason) => {
                                warn!(reason, "connection lost");
                            }
                        }
                    }
                    Err(err) if !err.is_retryable() => {
                        self.state = TransportState::Disconnected;
                        self.manager.shutdown().await;
                        return Err(err);
                    }
                    Err(err) => {
                        self.state = TransportState::Disconnected;
                        warn!(error = %err, "connect failed");
                    }
                }

                let delay = self.backoff.next_delay();
                info!(delay_secs = delay.as_secs(), "reconnecting after backoff");
                if !self.wait_backoff(delay, &shutdown).await {
                    break;
                }
            }

            self.state = TransportState::Disconnected;
            self.manager.shutdown().await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn serve(&mut self, ws: WsStream, shutdown: &CancellationToken) -> SessionEnd {
        let (sink, mut stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer_cancel = CancellationToken::new();
        let mut writer: JoinHandle<Result<()>> =
            tokio::spawn(run_writer(sink, out_rx, writer_cancel.clone()));
        let mut writer_done = false;

        self.manager.attach(out_tx);
        self.manager.announce_status().await;

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat_period, self.heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let end = loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break SessionEnd::Shutdown,

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.manager.handle_text(&text).await,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "closed by server".to_owned(),
                            |f| format!("closed by server: {} {}", f.code, f.reason),
                        );
                        break SessionEnd::Lost(reason);
                    }
                    Some(Ok(Message::Binary(_))) => debug!("ignoring binary frame"),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break SessionEnd::Lost(err.to_string()),
                    None => break SessionEnd::Lost("stream ended".into()),
                },

                Some(event) = self.events_rx.recv() => self.manager.handle_event(event).await,

                _ = heartbeat.tick() => self.manager.send_heartbeat().await,

                result = &mut writer => {
                    writer_done = true;
                    let reason = match result {
                        Ok(Ok(())) => "writer stopped".to_owned(),
                        Ok(Err(err)) => err.to_string(),
                        Err(join_err) => join_err.to_string(),
                    };
                    break SessionEnd::Lost(reason);
                }
            }
        };

        match &end {
            SessionEnd::Shutdown => {
                self.manager.shutdown().await;
                self.manager.detach();
                writer_cancel.cancel();
                if !writer_done {
                    match tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await {
                        Ok(Ok(Err(err))) => warn!(error = %err, "close handshake failed"),
                        Ok(_) => {}
                        Err(_) => {
                            warn!("close handshake timed out");
                            writer.abort();
                        }
                    }
                }
            }
            SessionEnd::Lost(_) => {
                self.manager.on_transport_lost();
                if !writer_done {
                    writer.abort();
                }
            }
        }
        end
    }

    /// One connect attempt bounded by the connect timeout, applying
    /// execution events meanwhile. `None` if shutdown was requested.
    async fn connect_draining(&mut self, shutdown: &CancellationToken) -> Option<Result<WsStream>> {
        let limit = self.connect_timeout;
        let attempt = tokio::time::timeout(limit, connect(&self.endpoint));
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return None,
                result = &mut attempt => {
                    return Some(result.unwrap_or_else(|_elapsed| {
                        Err(AppError::Timeout(format!(
                            "connect did not complete within {}s",
                            limit.as_secs()
                        )))
                    }));
                }
                Some(event) = self.events_rx.recv() => self.manager.handle_event(event).await,
            }
        }
    }

    /// Sleep for `delay` while still applying execution events. Returns
    /// `false` if shutdown was requested.
    async fn wait_backoff(&mut self, delay: Duration, shutdown: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return false,
                () = &mut sleep => return true,
                Some(event) = self.events_rx.recv() => self.manager.handle_event(event).await,
            }
        }
    }
}

/// Open the WebSocket with identity headers.
async fn connect(endpoint: &RelayEndpoint) -> Result<WsStream> {
    let mut request = endpoint.url.as_str().into_client_request().map_err(|err| {
        AppError::Config(format!("invalid server url {}: {err}", endpoint.url))
    })?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", endpoint.token))
        .map_err(|err| AppError::Config(format!("invalid auth token: {err}")))?;
    let agent_id = HeaderValue::from_str(&endpoint.agent_id)
        .map_err(|err| AppError::Config(format!("invalid agent id: {err}")))?;
    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(AGENT_ID_HEADER, agent_id);

    let (ws, response) = tokio_tungstenite::connect_async(request).await?;
    debug!(status = %response.status(), "websocket handshake complete");
    Ok(ws)
}
