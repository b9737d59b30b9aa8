//! Relay WebSocket server.
//!
//! Accepts client connections, assigns each an identity derived from the
//! handshake (random alias, User-Agent device class, source-address
//! group), and brokers room negotiation between them.
//!
//! Reason codes are layered here: a request against an established room
//! is refused with `HOST_BUSY` before the owner ever hears about it, and
//! a request against a room that already has a pending requester is
//! refused with `ROOM_FULL`. Everything else is forwarded.

use std::net::SocketAddr;
use std::sync::Arc;

use peerbeam_protocol::events::{ClientEvent, ServerEvent};
use peerbeam_protocol::ids::random_alias;
use peerbeam_protocol::types::{NetworkClient, RejectReason};
use peerbeam_protocol::constants::WS_MAX_MESSAGE_SIZE;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{self, ClientSender};
use crate::registry::{Client, Registry};
use crate::{RelayError, SEND_BUFFER_SIZE, identity};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { port: 0 }
    }
}

/// The rendezvous relay server.
pub struct RelayServer {
    port: u16,
    registry: Mutex<Registry>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            port: config.port,
            registry: Mutex::new(Registry::default()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Gracefully shuts down the server and every client pump.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), RelayError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("relay listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("relay shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection, registers the client and starts its
    /// pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let mut user_agent = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            |request: &Request, response: Response| {
                if let Some(value) = request
                    .headers()
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                {
                    user_agent = value.to_string();
                }
                Ok(response)
            },
            Some(ws_config),
        )
        .await?;

        let client_id = Uuid::new_v4().to_string();
        let device = identity::parse_user_agent(&user_agent);
        let info = NetworkClient {
            id: client_id.clone(),
            name: random_alias(),
            device_type: device.device_type,
            device_model: device.device_model,
        };
        let ip_group = identity::ip_group(peer_addr.ip());
        tracing::info!(%peer_addr, client_id, name = %info.name, "client connected");

        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let sender = ClientSender::new(tx);
        {
            let mut registry = self.registry.lock().await;
            registry.insert_client(Client {
                info,
                ip_group,
                own_room: None,
                rooms: Default::default(),
                sender: sender.clone(),
            });
        }

        client::spawn_pumps(
            ws_stream,
            client_id,
            Arc::clone(self),
            sender,
            rx,
            self.cancel.child_token(),
        );
        Ok(())
    }

    /// Dispatches one parsed client event.
    pub(crate) async fn handle_event(self: &Arc<Self>, client_id: &str, event: ClientEvent) {
        let mut registry = self.registry.lock().await;
        match event {
            ClientEvent::RoomCreate { room_id } => {
                self.on_room_create(&mut registry, client_id, &room_id);
            }
            ClientEvent::RoomRequest { room_id } => {
                self.on_room_request(&mut registry, client_id, &room_id);
            }
            ClientEvent::RoomRequestCancel { room_id } => {
                self.on_request_cancel(&mut registry, client_id, &room_id);
            }
            ClientEvent::NetworkRequest { client_id: target } => {
                match registry.own_room(&target) {
                    Some(room_id) => self.on_room_request(&mut registry, client_id, &room_id),
                    None => tracing::warn!(client_id, target, "request for unknown client"),
                }
            }
            ClientEvent::NetworkRequestCancel { client_id: target } => {
                match registry.own_room(&target) {
                    Some(room_id) => self.on_request_cancel(&mut registry, client_id, &room_id),
                    None => tracing::warn!(client_id, target, "cancel for unknown client"),
                }
            }
            ClientEvent::RoomAccept { room_id } => {
                self.on_room_accept(&mut registry, client_id, &room_id);
            }
            ClientEvent::RoomReject {
                room_id,
                user_id,
                reason,
            } => {
                self.on_room_reject(&mut registry, client_id, &room_id, &user_id, reason);
            }
            ClientEvent::RoomTerminate(room_id) => {
                self.on_room_terminate(&mut registry, client_id, &room_id);
            }
            ClientEvent::RoomMessage {
                room_id,
                encrypted_message,
            } => {
                self.on_room_message(&mut registry, client_id, &room_id, encrypted_message);
            }
            ClientEvent::RoomPublicKey {
                room_id,
                public_key,
            } => {
                let event = ServerEvent::RoomPublicKey {
                    room_id: room_id.clone(),
                    public_key,
                };
                self.forward_to_others(&registry, client_id, &room_id, &event);
            }
            ClientEvent::FileOffer { room_id, sdp } => {
                let event = ServerEvent::FileOffer {
                    room_id: room_id.clone(),
                    sdp,
                };
                self.forward_to_others(&registry, client_id, &room_id, &event);
            }
            ClientEvent::FileAnswer { room_id, sdp } => {
                self.forward_to_others(&registry, client_id, &room_id, &ServerEvent::FileAnswer { sdp });
            }
            ClientEvent::FileCandidate { room_id, candidate } => {
                self.forward_to_others(
                    &registry,
                    client_id,
                    &room_id,
                    &ServerEvent::FileCandidate { candidate },
                );
            }
            ClientEvent::Unknown => {
                tracing::warn!(client_id, "unknown event ignored");
            }
        }
    }

    /// Cascades a dropped connection: every room the client occupied is
    /// terminated for the remaining occupant, then the group is told the
    /// client left.
    pub(crate) async fn handle_disconnect(self: &Arc<Self>, client_id: &str) {
        let mut registry = self.registry.lock().await;
        let Some(removed) = registry.remove_client(client_id) else {
            return;
        };

        for room_id in &removed.rooms {
            if !registry.room_exists(room_id) {
                continue;
            }
            for occupant in registry.member_senders(room_id, Some(client_id)) {
                let _ = occupant.send_event(&ServerEvent::RoomTerminate);
            }
            if registry.room_owner(room_id).as_deref() == Some(client_id) {
                registry.delete_room(room_id);
            } else {
                registry.leave_room(room_id, client_id);
                registry.set_established(room_id, false);
            }
        }

        let leave = ServerEvent::NetworkLeave {
            client_id: client_id.to_string(),
        };
        for peer in registry.group_senders(&removed.ip_group, client_id) {
            let _ = peer.send_event(&leave);
        }
        tracing::info!(client_id, "client disconnected");
    }

    fn on_room_create(&self, registry: &mut Registry, client_id: &str, room_id: &str) {
        let Some(sender) = registry.sender(client_id) else {
            return;
        };
        if !registry.create_room(room_id, client_id) {
            tracing::warn!(client_id, room_id, "room id collision");
            let _ = sender.send_event(&ServerEvent::Error {
                messages: vec![format!("Room with ID \"{room_id}\" already exists.")],
            });
            return;
        }
        let _ = sender.send_event(&ServerEvent::RoomCreate {
            room_id: room_id.to_string(),
        });

        // Creating a room is the "I am reachable" announcement: the
        // creator gets a snapshot of its group, the group learns about
        // the creator.
        let Some(group) = registry.ip_group_of(client_id) else {
            return;
        };
        let clients = registry.group_clients(&group, client_id);
        let _ = sender.send_event(&ServerEvent::NetworkConnect { clients });
        if let Some(info) = registry.info(client_id) {
            for peer in registry.group_senders(&group, client_id) {
                let _ = peer.send_event(&ServerEvent::NetworkJoin {
                    client: info.clone(),
                });
            }
        }
        tracing::info!(client_id, room_id, "room created");
    }

    fn on_room_request(&self, registry: &mut Registry, requester: &str, room_id: &str) {
        let Some(sender) = registry.sender(requester) else {
            return;
        };
        if !registry.room_exists(room_id) {
            tracing::warn!(requester, room_id, "request for unknown room");
            return;
        }
        if registry.is_member(room_id, requester) {
            tracing::debug!(requester, room_id, "duplicate request ignored");
            return;
        }
        if registry.is_established(room_id) {
            let _ = sender.send_event(&ServerEvent::RoomReject {
                room_id: room_id.to_string(),
                reason: RejectReason::HostBusy,
            });
            tracing::info!(requester, room_id, "request refused, session busy");
            return;
        }
        if registry.member_count(room_id) >= 2 {
            let _ = sender.send_event(&ServerEvent::RoomReject {
                room_id: room_id.to_string(),
                reason: RejectReason::RoomFull,
            });
            tracing::info!(requester, room_id, "request refused, room full");
            return;
        }

        // The requester occupies the second slot while the owner decides.
        registry.join_room(room_id, requester);
        let event = ServerEvent::RoomRequest {
            room_id: room_id.to_string(),
            user_id: requester.to_string(),
        };
        for occupant in registry.member_senders(room_id, Some(requester)) {
            let _ = occupant.send_event(&event);
        }
        tracing::info!(requester, room_id, "join request forwarded");
    }

    fn on_request_cancel(&self, registry: &mut Registry, requester: &str, room_id: &str) {
        if !registry.is_member(room_id, requester) {
            return;
        }
        if registry.room_owner(room_id).as_deref() == Some(requester) {
            return;
        }
        // An accepted occupant leaves via terminate, not cancel.
        if registry.is_established(room_id) {
            return;
        }
        registry.leave_room(room_id, requester);
        let event = ServerEvent::RoomRequestCancel {
            room_id: room_id.to_string(),
            user_id: requester.to_string(),
        };
        for occupant in registry.member_senders(room_id, None) {
            let _ = occupant.send_event(&event);
        }
        tracing::info!(requester, room_id, "join request withdrawn");
    }

    fn on_room_accept(&self, registry: &mut Registry, accepter: &str, room_id: &str) {
        if registry.room_owner(room_id).as_deref() != Some(accepter) {
            tracing::warn!(accepter, room_id, "accept from non-owner ignored");
            return;
        }
        if registry.member_count(room_id) < 2 {
            tracing::debug!(room_id, "accept with no pending requester");
            return;
        }
        registry.set_established(room_id, true);
        let event = ServerEvent::RoomAccept {
            room_id: room_id.to_string(),
        };
        for occupant in registry.member_senders(room_id, None) {
            let _ = occupant.send_event(&event);
        }
        tracing::info!(room_id, "session established");
    }

    fn on_room_reject(
        &self,
        registry: &mut Registry,
        rejecter: &str,
        room_id: &str,
        user_id: &str,
        reason: RejectReason,
    ) {
        if registry.room_owner(room_id).as_deref() != Some(rejecter) {
            tracing::warn!(rejecter, room_id, "reject from non-owner ignored");
            return;
        }
        if !registry.is_member(room_id, user_id) {
            return;
        }
        registry.leave_room(room_id, user_id);
        if let Some(target) = registry.sender(user_id) {
            let _ = target.send_event(&ServerEvent::RoomReject {
                room_id: room_id.to_string(),
                reason,
            });
        }
        tracing::info!(room_id, user_id, reason = %reason, "request rejected");
    }

    fn on_room_terminate(&self, registry: &mut Registry, sender_id: &str, room_id: &str) {
        if !registry.is_member(room_id, sender_id) {
            return;
        }
        for occupant in registry.member_senders(room_id, None) {
            let _ = occupant.send_event(&ServerEvent::RoomTerminate);
        }
        // The room collapses back to just its owner.
        let owner = registry.room_owner(room_id);
        for member in registry.members(room_id) {
            if owner.as_deref() != Some(member.as_str()) {
                registry.leave_room(room_id, &member);
            }
        }
        registry.set_established(room_id, false);
        tracing::info!(room_id, "session terminated");
    }

    fn on_room_message(
        &self,
        registry: &mut Registry,
        sender_id: &str,
        room_id: &str,
        encrypted_message: String,
    ) {
        if !registry.is_member(room_id, sender_id) {
            return;
        }
        let event = ServerEvent::RoomMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            encrypted_message,
        };
        for occupant in registry.member_senders(room_id, Some(sender_id)) {
            let _ = occupant.send_event(&event);
        }
    }

    fn forward_to_others(
        &self,
        registry: &Registry,
        from: &str,
        room_id: &str,
        event: &ServerEvent,
    ) {
        if !registry.is_member(room_id, from) {
            tracing::debug!(from, room_id, "forward from non-member dropped");
            return;
        }
        for occupant in registry.member_senders(room_id, Some(from)) {
            let _ = occupant.send_event(event);
        }
    }
}
