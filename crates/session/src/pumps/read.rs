//! WebSocket read pump: parses server events and fans them out.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use peerbeam_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use peerbeam_protocol::events::ServerEvent;

use crate::events::EventBus;

/// Reads messages from the WebSocket and publishes parsed events to
/// the bus.
///
/// Any incoming message resets the pong deadline. If the relay stays
/// silent for [`WS_PONG_WAIT`] the connection is considered dead and
/// the loop exits, which closes the bus and ends every subscription.
pub(crate) async fn read_pump<S>(
    mut read: S,
    bus: EventBus<ServerEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, relay connection dead");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        // ANY incoming message resets the deadline.
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text(&text, &bus);
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {
                                warn!("unexpected binary frame from relay, dropping");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    bus.close();
}

fn handle_text(text: &str, bus: &EventBus<ServerEvent>) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    match ServerEvent::from_json(text) {
        Ok(event) => bus.publish(event),
        Err(e) => warn!("failed to parse server event: {e}"),
    }
}
