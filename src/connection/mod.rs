//! Collector connection
//!
//! Dials the collector, authenticates, and streams metrics until the
//! connection ends, then dials again. Failed attempts back off
//! exponentially; a clean close from the server reconnects at once with the
//! delay reset. The loop only stops for an installed update or an external
//! shutdown signal.

pub mod auth;
pub mod backoff;
pub mod dispatch;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::protocol::AuthMessage;
use crate::update::UpdateHandler;

pub use auth::authenticate;
pub use backoff::ReconnectBackoff;
pub use dispatch::{CommandDispatcher, Dispatch};
pub use session::Session;

pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Why the agent is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A new binary was installed and a restart requested
    Restarting,
    /// The process was asked to stop
    ShutdownSignal,
}

/// How a connection that did not fail came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server closed the stream
    Closed,
    /// The agent should stop
    Exit(ExitReason),
}

/// Observable connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Streaming,
    /// Peer closed cleanly; the next attempt starts with the initial delay
    Closed,
    /// Attempt failed; waiting out the backoff
    Errored,
    Stopped,
}

pub struct ConnectionManager {
    endpoint: String,
    auth: AuthMessage,
    auth_timeout: Duration,
    initial_reconnect: Duration,
    max_reconnect: Duration,
    collector: Arc<dyn MetricsCollector>,
    session: Session,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        config: &Config,
        version: &str,
        collector: Arc<dyn MetricsCollector>,
        updater: Arc<dyn UpdateHandler>,
    ) -> Self {
        let dispatcher = Arc::new(CommandDispatcher::new(collector.clone(), updater));
        let session = Session::new(
            collector.clone(),
            dispatcher,
            config.report.interval(),
            config.connection.ping_interval(),
        );
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            endpoint: config.server.ws_url(),
            auth: AuthMessage::new(&config.server.server_id, &config.server.token, version),
            auth_timeout: config.connection.auth_timeout(),
            initial_reconnect: config.connection.initial_reconnect(),
            max_reconnect: config.connection.max_reconnect(),
            collector,
            session,
            state,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Follow state changes, e.g. for health reporting
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Keep the agent connected until it has a reason to exit
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ExitReason {
        let mut backoff = ReconnectBackoff::new(self.initial_reconnect, self.max_reconnect);

        loop {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Stopped);
                return ExitReason::ShutdownSignal;
            }

            match self.connect_once(&mut shutdown).await {
                Ok(SessionEnd::Exit(reason)) => {
                    info!(reason = ?reason, "Connection manager stopping");
                    self.set_state(ConnectionState::Stopped);
                    return reason;
                }
                Ok(SessionEnd::Closed) => {
                    info!("Connection closed by collector, reconnecting");
                    self.set_state(ConnectionState::Closed);
                    backoff.reset();
                }
                Err(e) => {
                    self.set_state(ConnectionState::Errored);
                    match &e {
                        ConnectionError::Authentication(message) => {
                            error!(message = %message, "Collector rejected agent credentials");
                        }
                        _ => warn!(error = %e, "Connection failed"),
                    }

                    let delay = backoff.next_delay();
                    warn!(delay_secs = delay.as_secs(), "Reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_requested(&mut shutdown) => {
                            self.set_state(ConnectionState::Stopped);
                            return ExitReason::ShutdownSignal;
                        }
                    }
                }
            }
        }
    }

    /// One full connection: dial, authenticate, stream.
    ///
    /// Returns when the stream ends. Errors cover every way the attempt can
    /// fail before or during streaming.
    pub async fn connect_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ConnectionError> {
        info!(endpoint = %self.endpoint, "Connecting to collector");
        self.set_state(ConnectionState::Connecting);

        let (sink, stream) = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => {
                return Ok(SessionEnd::Exit(ExitReason::ShutdownSignal));
            }
            opened = self.open() => opened?,
        };

        self.set_state(ConnectionState::Streaming);
        self.session.run(sink, stream, shutdown).await
    }

    async fn open(&self) -> Result<(WsSink, WsSource), ConnectionError> {
        let (ws, _) = tokio::time::timeout(self.auth_timeout, connect_async(self.endpoint.as_str()))
            .await
            .map_err(|_| ConnectionError::Timeout("connect"))?
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let (mut sink, mut stream) = ws.split();

        self.set_state(ConnectionState::Authenticating);
        let response = authenticate(&mut sink, &mut stream, &self.auth, self.auth_timeout).await?;
        info!(server_id = %self.auth.server_id, "Authenticated with collector");

        if !response.ping_targets.is_empty() {
            info!(count = response.ping_targets.len(), "Received ping targets");
            self.collector.set_ping_targets(response.ping_targets);
        }

        Ok((sink, stream))
    }
}

type WsConnection =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsConnection, Message>;
type WsSource = SplitStream<WsConnection>;

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
