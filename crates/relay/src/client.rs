//! Per-client connection plumbing: send handle and read/write pumps.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use peerbeam_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT};
use peerbeam_protocol::events::{ClientEvent, ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::server::RelayServer;

/// Handle for sending events to one client.
///
/// Cloneable and cheap. Sends never block: a full buffer drops the event
/// with a warning, on the theory that a client too slow to drain 64
/// events is about to be dropped by the pong deadline anyway.
#[derive(Clone)]
pub struct ClientSender {
    tx: mpsc::Sender<WsMessage>,
}

impl ClientSender {
    pub(crate) fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }

    /// Serializes and queues a server event.
    pub fn send_event(&self, event: &ServerEvent) -> Result<(), SendError> {
        let json = event.to_json().map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping event");
            SendError
        })
    }

    /// Returns `true` if the write pump is still draining this channel.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send buffer is full or the client is gone.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Spawns the read and write pumps for one client connection.
///
/// The pumps stop when the socket closes, the pong deadline passes, or
/// the server shuts down. The read pump reports the disconnect so the
/// server can cascade room terminations.
pub(crate) fn spawn_pumps<S>(
    ws_stream: S,
    client_id: String,
    server: Arc<RelayServer>,
    sender: ClientSender,
    rx: mpsc::Receiver<WsMessage>,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
{
    let (ws_sink, ws_read) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    tokio::spawn(async move {
        read_pump(ws_read, &sender, &server, &client_id, cancel.clone()).await;
        // Stop the write pump too, then cascade the disconnect.
        cancel.cancel();
        server.handle_disconnect(&client_id).await;
    });
}

/// Write pump: drains the send channel and keeps the connection alive
/// with pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: parses client events and dispatches them to the server.
async fn read_pump<S>(
    mut stream: S,
    sender: &ClientSender,
    server: &Arc<RelayServer>,
    client_id: &str,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!(client_id, "pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!(
                                        client_id,
                                        "event exceeds max size ({} > {WS_MAX_MESSAGE_SIZE})",
                                        text.len(),
                                    );
                                    continue;
                                }
                                match ClientEvent::from_json(&text) {
                                    Ok(event) => server.handle_event(client_id, event).await,
                                    Err(e) => tracing::warn!(client_id, "bad event json: {e}"),
                                }
                            }
                            WsMessage::Binary(_) => {
                                // The relay never carries file bytes.
                                tracing::warn!(client_id, "binary frame dropped");
                            }
                            WsMessage::Pong(_) => {
                                got_pong = true;
                                pong_deadline.reset();
                            }
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::debug!(client_id, "received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(client_id, "read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
