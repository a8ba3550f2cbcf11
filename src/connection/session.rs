//! Steady-state streaming for one authenticated connection
//!
//! The calling task is the only writer: it sends a `metrics` frame on every
//! report tick and a transport ping on every keepalive tick. A spawned
//! reader decodes inbound frames and hands them to the dispatcher; its
//! outcome comes back on a oneshot channel, consumed exactly once.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::dispatch::{CommandDispatcher, Dispatch};
use super::{shutdown_requested, ConnectionError, ExitReason, SessionEnd, WsError};
use crate::metrics::MetricsCollector;
use crate::protocol::{MetricsMessage, ServerResponse};

/// How the reader task finished
#[derive(Debug)]
enum ReaderOutcome {
    Closed,
    Exit(ExitReason),
    Failed(ConnectionError),
    /// Told to stop reading after the sender gave up on the connection
    Stopped,
}

/// Why the send loop returned
enum SendEnd {
    Reader(Option<ReaderOutcome>),
    Shutdown,
    WriteFailed(ConnectionError),
}

pub struct Session {
    collector: Arc<dyn MetricsCollector>,
    dispatcher: Arc<CommandDispatcher>,
    report_interval: Duration,
    ping_interval: Duration,
}

impl Session {
    pub fn new(
        collector: Arc<dyn MetricsCollector>,
        dispatcher: Arc<CommandDispatcher>,
        report_interval: Duration,
        ping_interval: Duration,
    ) -> Self {
        Self {
            collector,
            dispatcher,
            report_interval,
            ping_interval,
        }
    }

    /// Stream until the reader finishes, a write fails, or shutdown fires.
    ///
    /// A failed write never cancels a frame the reader is already handling:
    /// the reader is asked to stop at its next read and awaited, so an
    /// update in progress runs to completion and its outcome wins over the
    /// write error. Only the shutdown signal aborts the reader outright.
    pub async fn run<S, R>(
        &self,
        mut sink: S,
        stream: R,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ConnectionError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
        R: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
    {
        let (done_tx, mut done_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let dispatcher = self.dispatcher.clone();
        let reader = tokio::spawn(async move {
            let outcome = read_frames(stream, dispatcher, stop_rx).await;
            let _ = done_tx.send(outcome);
        });

        let result = match self.send_loop(&mut sink, &mut done_rx, shutdown).await {
            SendEnd::Reader(outcome) => reader_result(outcome),
            SendEnd::Shutdown => {
                info!("Shutdown requested, leaving stream");
                reader.abort();
                Ok(SessionEnd::Exit(ExitReason::ShutdownSignal))
            }
            SendEnd::WriteFailed(e) => {
                let _ = stop_tx.send(());
                match done_rx.await {
                    Ok(ReaderOutcome::Exit(reason)) => Ok(SessionEnd::Exit(reason)),
                    _ => Err(e),
                }
            }
        };

        if let Ok(SessionEnd::Exit(reason)) = &result {
            debug!(reason = ?reason, "Closing connection");
            let _ = sink.send(Message::Close(None)).await;
        }
        result
    }

    async fn send_loop<S>(
        &self,
        sink: &mut S,
        done: &mut oneshot::Receiver<ReaderOutcome>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SendEnd
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        // First report goes out one full period after auth, not immediately
        let start = Instant::now();
        let mut report = interval_at(start + self.report_interval, self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive = interval_at(start + self.ping_interval, self.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut *done => return SendEnd::Reader(outcome.ok()),
                _ = shutdown_requested(shutdown) => return SendEnd::Shutdown,
                _ = report.tick() => {
                    let snapshot = self.collector.collect().await;
                    let payload = match serde_json::to_string(&MetricsMessage::new(&snapshot)) {
                        Ok(payload) => payload,
                        Err(e) => return SendEnd::WriteFailed(e.into()),
                    };
                    if let Err(e) = sink.send(Message::Text(payload)).await {
                        return SendEnd::WriteFailed(ConnectionError::Transport(format!(
                            "send metrics: {}",
                            e
                        )));
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        return SendEnd::WriteFailed(ConnectionError::Transport(format!(
                            "send ping: {}",
                            e
                        )));
                    }
                }
            }
        }
    }
}

fn reader_result(outcome: Option<ReaderOutcome>) -> Result<SessionEnd, ConnectionError> {
    match outcome {
        Some(ReaderOutcome::Closed) => Ok(SessionEnd::Closed),
        Some(ReaderOutcome::Exit(reason)) => Ok(SessionEnd::Exit(reason)),
        Some(ReaderOutcome::Failed(e)) => Err(e),
        Some(ReaderOutcome::Stopped) | None => Err(ConnectionError::Transport(
            "reader task ended without an outcome".to_string(),
        )),
    }
}

/// Read and dispatch frames until the stream ends or `stop` fires.
///
/// `stop` is only checked while waiting for the next frame; a frame being
/// dispatched is always handled to the end.
async fn read_frames<R>(
    mut stream: R,
    dispatcher: Arc<CommandDispatcher>,
    mut stop: oneshot::Receiver<()>,
) -> ReaderOutcome
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop => return ReaderOutcome::Stopped,
            frame = stream.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                info!(frame = ?frame, "Collector closed the connection");
                return ReaderOutcome::Closed;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return ReaderOutcome::Failed(ConnectionError::Transport(e.to_string()))
            }
            None => {
                debug!("Inbound stream ended");
                return ReaderOutcome::Closed;
            }
        };

        let response: ServerResponse = match serde_json::from_str(&text) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Skipping malformed frame");
                continue;
            }
        };

        if let Dispatch::Exit(reason) = dispatcher.dispatch(response).await {
            return ReaderOutcome::Exit(reason);
        }
    }
}
