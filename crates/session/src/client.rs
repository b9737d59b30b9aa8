//! WebSocket client for the relay connection.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;

use peerbeam_protocol::constants::WS_MAX_MESSAGE_SIZE;
use peerbeam_protocol::events::{ClientEvent, ServerEvent};

use crate::error::SessionError;
use crate::events::{EventBus, Subscription};

/// WebSocket client connected to a relay.
///
/// Incoming [`ServerEvent`]s fan out to every subscription handed out
/// by [`RelayClient::subscribe`]. When the connection drops the bus
/// closes and all subscriptions end, which is how listeners observe
/// the disconnect.
pub struct RelayClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    bus: EventBus<ServerEvent>,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Connects to the relay at `url` (e.g. `ws://host:3001`).
    ///
    /// The `User-Agent` header carries the local platform and hostname;
    /// the relay derives the advertised device identity from it.
    pub async fn connect(url: &str) -> Result<Self, SessionError> {
        let mut request = url.into_client_request()?;
        if let Ok(ua) = HeaderValue::from_str(&user_agent()) {
            request.headers_mut().insert(USER_AGENT, ua);
        }

        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let bus = EventBus::new();
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let bus = bus.clone();
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::read::read_pump(read, bus, write_tx, cancel))
        };

        let ping_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::ping::ping_pump(write_tx, cancel))
        };

        Ok(Self {
            write_tx,
            bus,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
        })
    }

    /// Sends an event to the relay.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), SessionError> {
        let json = event.to_json()?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Registers a listener for incoming relay events.
    pub fn subscribe(&self) -> Subscription<ServerEvent> {
        self.bus.subscribe()
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self
            .write_tx
            .send(tungstenite::Message::Close(None))
            .await;
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}

/// `peerbeam/<version> (<os>; <hostname>)`, the shape the relay's
/// device classifier expects.
fn user_agent() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    format!(
        "peerbeam/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        host
    )
}
