//! Room session state machine.
//!
//! A session pairs with at most one peer at a time: it is either idle,
//! waiting on an outbound join request, or connected. The relay
//! enforces room occupancy on its side; this layer keeps the local
//! view consistent and applies the busy policy to inbound requests
//! that race past the relay's guards.
//!
//! State only advances on relay echoes. Accepting a request sends
//! `room:accept` and waits for the relay to broadcast it back, so both
//! occupants flip to connected through the same code path.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use peerbeam_protocol::events::{ClientEvent, ServerEvent};
use peerbeam_protocol::ids;
use peerbeam_protocol::types::{NetworkClient, RejectReason};

use crate::cipher::MessageCipher;
use crate::client::RelayClient;
use crate::error::SessionError;
use crate::events::{EventBus, Subscription};

/// Where an outbound join request was aimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// A room id shared out of band.
    Room(String),
    /// A client id discovered through address-group presence.
    Client(String),
}

/// Join lifecycle of the local client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    Requesting(RequestTarget),
    Connected { room_id: String },
}

/// A decrypted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub body: String,
}

/// High-level session events surfaced to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Our room id is claimed on the relay and reachable.
    RoomReady { room_id: String },
    /// A peer asks to join our room.
    RequestReceived { room_id: String, user_id: String },
    /// The pending requester withdrew.
    RequestCancelled { room_id: String, user_id: String },
    /// Both sides are paired; transfers may start.
    Established { room_id: String },
    /// Our outbound request was turned down.
    Rejected {
        room_id: String,
        reason: RejectReason,
    },
    /// The pairing (or a pending request) was torn down.
    Terminated,
    Chat(ChatMessage),
    PeerPublicKey { public_key: String },
    /// Transport signaling from the peer.
    OfferReceived { room_id: String, payload: Value },
    AnswerReceived { payload: Value },
    CandidateReceived { payload: Value },
    /// Address-group presence.
    NetworkSnapshot { clients: Vec<NetworkClient> },
    NetworkJoined { client: NetworkClient },
    NetworkLeft { client_id: String },
    /// Relay-side failure notice.
    RelayError { messages: Vec<String> },
    /// The relay connection is gone.
    RelayClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRequest {
    room_id: String,
    user_id: String,
}

struct RoomState {
    /// Our own claimed room id, if any. Survives session teardown so
    /// the room can be reused for the next pairing.
    room_id: Option<String>,
    join: JoinState,
    /// Inbound request awaiting an accept or reject verdict.
    pending: Option<PendingRequest>,
    /// Cancellation scope of the current pairing.
    scope: Option<CancellationToken>,
    peers: Vec<NetworkClient>,
}

/// Verdict on an inbound join request.
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    /// Hold as pending and surface to the application.
    Surface,
    /// Occupied; reject on the owner's behalf.
    Busy,
    /// Not a room we own.
    Ignore,
}

fn admit_request(state: &RoomState, room_id: &str) -> Admission {
    if state.room_id.as_deref() != Some(room_id) {
        return Admission::Ignore;
    }
    if state.pending.is_some() || state.join != JoinState::Idle {
        return Admission::Busy;
    }
    Admission::Surface
}

/// Drives the join lifecycle over a [`RelayClient`].
pub struct RoomSession {
    client: Arc<RelayClient>,
    cipher: Arc<dyn MessageCipher>,
    state: Mutex<RoomState>,
    events: EventBus<SessionEvent>,
    cancel: CancellationToken,
}

impl RoomSession {
    /// Creates a session on top of `client` and starts dispatching
    /// relay events. Chat payloads pass through `cipher`.
    pub fn new(client: Arc<RelayClient>, cipher: Arc<dyn MessageCipher>) -> Arc<Self> {
        let session = Arc::new(Self {
            state: Mutex::new(RoomState {
                room_id: None,
                join: JoinState::Idle,
                pending: None,
                scope: None,
                peers: Vec::new(),
            }),
            events: EventBus::new(),
            cancel: CancellationToken::new(),
            client,
            cipher,
        });

        let weak = Arc::downgrade(&session);
        let mut sub = session.client.subscribe();
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = sub.recv() => match event {
                        Some(e) => e,
                        None => {
                            if let Some(session) = weak.upgrade() {
                                session.on_relay_closed();
                            }
                            break;
                        }
                    },
                };
                let Some(session) = weak.upgrade() else { break };
                session.handle_server_event(event).await;
            }
        });

        session
    }

    fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a listener for session events.
    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.events.subscribe()
    }

    pub fn join_state(&self) -> JoinState {
        self.lock().join.clone()
    }

    /// Our own claimed room id, if [`create_room`](Self::create_room)
    /// has run.
    pub fn room_id(&self) -> Option<String> {
        self.lock().room_id.clone()
    }

    /// Clients currently visible in our address group.
    pub fn peers(&self) -> Vec<NetworkClient> {
        self.lock().peers.clone()
    }

    /// Cancellation scope of the current pairing, if connected.
    /// Transfer tasks tie their lifetime to it; it fires when the
    /// session ends for any reason.
    pub fn pairing_scope(&self) -> Option<CancellationToken> {
        self.lock().scope.clone()
    }

    /// Claims a fresh room id on the relay. Idempotent: once claimed,
    /// later calls return the same id without another round trip.
    pub async fn create_room(&self) -> Result<String, SessionError> {
        let (room_id, fresh) = {
            let mut state = self.lock();
            match &state.room_id {
                Some(id) => (id.clone(), false),
                None => {
                    let id = ids::room_id();
                    state.room_id = Some(id.clone());
                    (id, true)
                }
            }
        };
        if fresh {
            self.client
                .send(&ClientEvent::RoomCreate {
                    room_id: room_id.clone(),
                })
                .await?;
        }
        Ok(room_id)
    }

    /// Asks to join `room_id`. At most one outbound request may be in
    /// flight.
    pub async fn request_join(&self, room_id: &str) -> Result<(), SessionError> {
        self.begin_request(RequestTarget::Room(room_id.to_owned()))?;
        let sent = self
            .client
            .send(&ClientEvent::RoomRequest {
                room_id: room_id.to_owned(),
            })
            .await;
        if sent.is_err() {
            self.lock().join = JoinState::Idle;
        }
        sent
    }

    /// Asks to join the room of a client seen in our address group.
    /// The relay resolves the client to its room.
    pub async fn request_client(&self, client_id: &str) -> Result<(), SessionError> {
        self.begin_request(RequestTarget::Client(client_id.to_owned()))?;
        let sent = self
            .client
            .send(&ClientEvent::NetworkRequest {
                client_id: client_id.to_owned(),
            })
            .await;
        if sent.is_err() {
            self.lock().join = JoinState::Idle;
        }
        sent
    }

    fn begin_request(&self, target: RequestTarget) -> Result<(), SessionError> {
        let mut state = self.lock();
        match &state.join {
            JoinState::Idle => {
                state.join = JoinState::Requesting(target);
                Ok(())
            }
            JoinState::Requesting(_) => Err(SessionError::AlreadyConnecting),
            JoinState::Connected { .. } => {
                Err(SessionError::InvalidState("already paired with a peer"))
            }
        }
    }

    /// Withdraws the outbound join request.
    pub async fn cancel_request(&self) -> Result<(), SessionError> {
        let target = {
            let mut state = self.lock();
            match std::mem::replace(&mut state.join, JoinState::Idle) {
                JoinState::Requesting(target) => target,
                other => {
                    state.join = other;
                    return Err(SessionError::InvalidState("no join request in flight"));
                }
            }
        };
        let event = match target {
            RequestTarget::Room(room_id) => ClientEvent::RoomRequestCancel { room_id },
            RequestTarget::Client(client_id) => ClientEvent::NetworkRequestCancel { client_id },
        };
        self.client.send(&event).await
    }

    /// Accepts the pending inbound request. The state flips to
    /// connected when the relay echoes the accept back.
    pub async fn accept_request(&self) -> Result<(), SessionError> {
        let room_id = {
            let state = self.lock();
            match &state.pending {
                Some(p) => p.room_id.clone(),
                None => return Err(SessionError::InvalidState("no pending join request")),
            }
        };
        self.client.send(&ClientEvent::RoomAccept { room_id }).await
    }

    /// Rejects the pending inbound request.
    pub async fn reject_request(&self) -> Result<(), SessionError> {
        let pending = {
            let mut state = self.lock();
            state
                .pending
                .take()
                .ok_or(SessionError::InvalidState("no pending join request"))?
        };
        self.client
            .send(&ClientEvent::RoomReject {
                room_id: pending.room_id,
                user_id: pending.user_id,
                reason: RejectReason::HostRejected,
            })
            .await
    }

    /// Ends the current pairing. Teardown happens on the echoed
    /// terminate, for us and the peer alike.
    pub async fn terminate(&self) -> Result<(), SessionError> {
        let room_id = self.active_room()?;
        self.client.send(&ClientEvent::RoomTerminate(room_id)).await
    }

    /// Sends a chat message to the paired peer.
    pub async fn send_chat(&self, body: &str) -> Result<(), SessionError> {
        let room_id = self.active_room()?;
        let encrypted_message = self.cipher.encrypt(body)?;
        self.client
            .send(&ClientEvent::RoomMessage {
                room_id,
                encrypted_message,
            })
            .await
    }

    /// Shares our public key with the paired peer.
    pub async fn send_public_key(&self, public_key: &str) -> Result<(), SessionError> {
        let room_id = self.active_room()?;
        self.client
            .send(&ClientEvent::RoomPublicKey {
                room_id,
                public_key: public_key.to_owned(),
            })
            .await
    }

    /// Forwards a transport offer to the paired peer.
    pub async fn send_offer(&self, sdp: Value) -> Result<(), SessionError> {
        let room_id = self.active_room()?;
        self.client.send(&ClientEvent::FileOffer { room_id, sdp }).await
    }

    /// Forwards a transport answer to the paired peer.
    pub async fn send_answer(&self, sdp: Value) -> Result<(), SessionError> {
        let room_id = self.active_room()?;
        self.client.send(&ClientEvent::FileAnswer { room_id, sdp }).await
    }

    /// Forwards a transport candidate to the paired peer.
    pub async fn send_candidate(&self, candidate: Value) -> Result<(), SessionError> {
        let room_id = self.active_room()?;
        self.client
            .send(&ClientEvent::FileCandidate { room_id, candidate })
            .await
    }

    /// Stops dispatching relay events. Cancelling the root token also
    /// fires any pairing scope derived from it.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn active_room(&self) -> Result<String, SessionError> {
        match &self.lock().join {
            JoinState::Connected { room_id } => Ok(room_id.clone()),
            _ => Err(SessionError::InvalidState("not paired with a peer")),
        }
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::RoomCreate { room_id } => {
                debug!(room_id = %room_id, "room claimed");
                self.events.publish(SessionEvent::RoomReady { room_id });
            }
            ServerEvent::RoomRequest { room_id, user_id } => {
                self.on_request(room_id, user_id).await;
            }
            ServerEvent::RoomRequestCancel { room_id, user_id } => {
                let withdrawn = {
                    let mut state = self.lock();
                    match &state.pending {
                        Some(p) if p.user_id == user_id => {
                            state.pending = None;
                            true
                        }
                        _ => false,
                    }
                };
                if withdrawn {
                    self.events
                        .publish(SessionEvent::RequestCancelled { room_id, user_id });
                }
            }
            ServerEvent::RoomAccept { room_id } => self.on_accept(room_id),
            ServerEvent::RoomReject { room_id, reason } => {
                // An established guest can still be evicted: the relay
                // delivers the reject after membership is already gone.
                let ours = {
                    let mut state = self.lock();
                    let ours = match &state.join {
                        JoinState::Requesting(_) => true,
                        JoinState::Connected { room_id: current } => current == &room_id,
                        JoinState::Idle => false,
                    };
                    if ours {
                        if let Some(scope) = state.scope.take() {
                            scope.cancel();
                        }
                        state.join = JoinState::Idle;
                    }
                    ours
                };
                if ours {
                    self.events
                        .publish(SessionEvent::Rejected { room_id, reason });
                } else {
                    warn!(room_id = %room_id, "stale rejection, ignoring");
                }
            }
            ServerEvent::RoomTerminate => self.on_terminate(),
            ServerEvent::RoomMessage {
                id,
                sender_id,
                encrypted_message,
            } => match self.cipher.decrypt(&encrypted_message) {
                Ok(body) => {
                    self.events.publish(SessionEvent::Chat(ChatMessage {
                        id,
                        sender_id,
                        body,
                    }));
                }
                Err(e) => warn!("dropping chat message that failed to decrypt: {e}"),
            },
            ServerEvent::RoomPublicKey { public_key, .. } => {
                self.events
                    .publish(SessionEvent::PeerPublicKey { public_key });
            }
            ServerEvent::FileOffer { room_id, sdp } => {
                self.events.publish(SessionEvent::OfferReceived {
                    room_id,
                    payload: sdp,
                });
            }
            ServerEvent::FileAnswer { sdp } => {
                self.events
                    .publish(SessionEvent::AnswerReceived { payload: sdp });
            }
            ServerEvent::FileCandidate { candidate } => {
                self.events.publish(SessionEvent::CandidateReceived {
                    payload: candidate,
                });
            }
            ServerEvent::NetworkConnect { clients } => {
                self.lock().peers = clients.clone();
                self.events
                    .publish(SessionEvent::NetworkSnapshot { clients });
            }
            ServerEvent::NetworkJoin { client } => {
                {
                    let mut state = self.lock();
                    if !state.peers.iter().any(|c| c.id == client.id) {
                        state.peers.push(client.clone());
                    }
                }
                self.events.publish(SessionEvent::NetworkJoined { client });
            }
            ServerEvent::NetworkLeave { client_id } => {
                self.lock().peers.retain(|c| c.id != client_id);
                self.events
                    .publish(SessionEvent::NetworkLeft { client_id });
            }
            ServerEvent::Error { messages } => {
                warn!(?messages, "relay reported an error");
                self.events.publish(SessionEvent::RelayError { messages });
            }
            ServerEvent::Unknown => {}
        }
    }

    async fn on_request(&self, room_id: String, user_id: String) {
        let admission = {
            let mut state = self.lock();
            let admission = admit_request(&state, &room_id);
            if admission == Admission::Surface {
                state.pending = Some(PendingRequest {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                });
            }
            admission
        };
        match admission {
            Admission::Surface => {
                self.events
                    .publish(SessionEvent::RequestReceived { room_id, user_id });
            }
            Admission::Busy => {
                debug!(room_id = %room_id, user_id = %user_id, "occupied, rejecting on owner's behalf");
                let reject = ClientEvent::RoomReject {
                    room_id,
                    user_id,
                    reason: RejectReason::HostBusy,
                };
                if let Err(e) = self.client.send(&reject).await {
                    warn!("failed to send busy rejection: {e}");
                }
            }
            Admission::Ignore => {
                warn!(room_id = %room_id, "request for a room we do not own, ignoring");
            }
        }
    }

    fn on_accept(&self, room_id: String) {
        let established = {
            let mut state = self.lock();
            let ours = match (&state.join, &state.pending) {
                // Requester side: our outbound request was granted.
                (JoinState::Requesting(_), _) => true,
                // Owner side: echo of our own accept.
                (_, Some(p)) if p.room_id == room_id => true,
                _ => false,
            };
            if ours {
                state.pending = None;
                state.join = JoinState::Connected {
                    room_id: room_id.clone(),
                };
                state.scope = Some(self.cancel.child_token());
            }
            ours
        };
        if established {
            self.events.publish(SessionEvent::Established { room_id });
        } else {
            warn!(room_id = %room_id, "stale accept, ignoring");
        }
    }

    fn on_terminate(&self) {
        let ended = {
            let mut state = self.lock();
            let was_active = state.pending.is_some() || state.join != JoinState::Idle;
            if let Some(scope) = state.scope.take() {
                scope.cancel();
            }
            state.pending = None;
            state.join = JoinState::Idle;
            was_active
        };
        if ended {
            self.events.publish(SessionEvent::Terminated);
        }
    }

    fn on_relay_closed(&self) {
        {
            let mut state = self.lock();
            if let Some(scope) = state.scope.take() {
                scope.cancel();
            }
            state.pending = None;
            state.join = JoinState::Idle;
            state.room_id = None;
            state.peers.clear();
        }
        self.events.publish(SessionEvent::RelayClosed);
        self.events.close();
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
