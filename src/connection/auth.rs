//! Authentication handshake
//!
//! One `auth` frame out, one reply in, bounded by the auth timeout. Nothing
//! else is written until the reply says `status = "ok"`.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::{ConnectionError, WsError};
use crate::protocol::{AuthMessage, ServerResponse};

/// Send credentials and wait for the collector's verdict.
///
/// Ping and pong frames received while waiting are skipped. The accepted
/// reply is returned so the caller can apply any ping targets it carries.
pub async fn authenticate<S, R>(
    sink: &mut S,
    stream: &mut R,
    auth: &AuthMessage,
    deadline: Duration,
) -> Result<ServerResponse, ConnectionError>
where
    S: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let payload = serde_json::to_string(auth)?;
    sink.send(Message::Text(payload))
        .await
        .map_err(|e| ConnectionError::Transport(format!("send auth: {}", e)))?;

    let reply = tokio::time::timeout(deadline, read_reply(stream))
        .await
        .map_err(|_| ConnectionError::Timeout("auth response"))??;

    let response: ServerResponse = serde_json::from_str(&reply)
        .map_err(|e| ConnectionError::Protocol(format!("malformed auth response: {}", e)))?;

    if !response.is_auth_ok() {
        return Err(ConnectionError::Authentication(response.message));
    }

    debug!(server_id = %auth.server_id, "Auth accepted");
    Ok(response)
}

async fn read_reply<R>(stream: &mut R) -> Result<String, ConnectionError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                return Err(ConnectionError::Protocol(format!(
                    "connection closed during auth: {:?}",
                    frame
                )))
            }
            Some(Ok(other)) => {
                return Err(ConnectionError::Protocol(format!(
                    "unexpected auth reply frame: {:?}",
                    other
                )))
            }
            Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
            None => {
                return Err(ConnectionError::Protocol(
                    "connection closed during auth".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use futures::stream;

    fn auth() -> AuthMessage {
        AuthMessage::new("srv-1", "tok", "1.2.0")
    }

    fn outbound() -> (
        impl Sink<Message, Error = WsError> + Unpin,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded();
        (tx.sink_map_err(|_| WsError::ConnectionClosed), rx)
    }

    fn replies(frames: Vec<Message>) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(frames.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_auth_ok_returns_targets() {
        let (mut sink, mut sent) = outbound();
        let mut inbound = replies(vec![
            Message::Ping(vec![1]),
            Message::Text(
                r#"{"type":"auth","status":"ok","ping_targets":[{"name":"gw","host":"10.0.0.1"}]}"#
                    .to_string(),
            ),
        ]);

        let response = authenticate(&mut sink, &mut inbound, &auth(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(response.ping_targets.len(), 1);

        match sent.try_recv().unwrap() {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "auth");
                assert_eq!(value["token"], "tok");
            }
            other => panic!("expected auth frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_token_sends_nothing_else() {
        let (mut sink, mut sent) = outbound();
        let mut inbound = replies(vec![Message::Text(
            r#"{"status":"fail","message":"bad token"}"#.to_string(),
        )]);

        let err = authenticate(&mut sink, &mut inbound, &auth(), Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectionError::Authentication(_)));
        assert!(err.to_string().contains("bad token"));

        drop(sink);
        let mut frames = Vec::new();
        while let Ok(frame) = sent.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 1, "only the auth frame may be sent");
    }

    #[tokio::test]
    async fn test_malformed_reply_is_protocol_error() {
        let (mut sink, _sent) = outbound();
        let mut inbound = replies(vec![Message::Text("not json".to_string())]);

        let err = authenticate(&mut sink, &mut inbound, &auth(), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));

        let mut inbound = replies(vec![Message::Binary(vec![0, 1])]);
        let err = authenticate(&mut sink, &mut inbound, &auth(), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (mut sink, _sent) = outbound();
        let mut inbound = stream::pending::<Result<Message, WsError>>();

        let err = authenticate(&mut sink, &mut inbound, &auth(), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)));
    }
}
