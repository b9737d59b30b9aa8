//! Peer connection lifecycle.
//!
//! The offering side binds an ephemeral listener, mints a token, and
//! advertises one candidate per local address. The answering side buffers
//! candidates until the remote description is applied, then dials them in
//! arrival order and authenticates with the token. Once a stream is up,
//! reader and writer tasks multiplex frames between sub-channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelMessage, ChannelState, ChannelWriter, Outbound, SubChannel};
use crate::error::ChannelError;
use crate::signaling::{Candidate, DescriptionKind, SessionDescription};
use crate::wire::{Frame, FrameKind, read_frame, write_frame};
use crate::{
    ACCEPT_TIMEOUT, AUTH_OK, AUTH_REJECTED, AUTH_TIMEOUT, DIAL_TIMEOUT, OPEN_TIMEOUT,
    SOCKET_BUFFER_SIZE, token,
};

/// Queue depth for sub-channels opened by the remote peer.
const INCOMING_QUEUE: usize = 16;

/// Per-channel inbound message queue. A full queue stalls the connection
/// reader, which is the backpressure path toward the remote writer.
const INBOUND_QUEUE: usize = 32;

/// Which side of the negotiation this connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the offer and listens for the peer.
    Offerer,
    /// Consumes the offer and dials the advertised candidates.
    Answerer,
}

/// Observable connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// The established stream dropped.
    Disconnected,
    /// Negotiation gave up before a stream was established.
    Failed,
    /// Closed locally via [`PeerConnection::cleanup`]. Terminal.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation bookkeeping, only touched before the stream is up.
#[derive(Default)]
struct Negotiation {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    /// Candidates that arrived before the remote description.
    pending_candidates: Vec<Candidate>,
    /// Feeds the dial task once it is running.
    dial_tx: Option<mpsc::UnboundedSender<Candidate>>,
    /// Listener port on the offering side.
    listen_port: Option<u16>,
}

struct ChannelEntry {
    state: Arc<ChannelState>,
    inbound: mpsc::Sender<ChannelMessage>,
}

/// A direct connection to one peer, multiplexing labeled sub-channels.
pub struct PeerConnection {
    role: Role,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    negotiation: Mutex<Negotiation>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    pending_opens: Mutex<HashMap<String, oneshot::Sender<()>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    incoming_tx: mpsc::Sender<SubChannel>,
    incoming_rx: Mutex<Option<mpsc::Receiver<SubChannel>>>,
    /// First teardown wins; the state it applies is the final verdict.
    torn_down: AtomicBool,
}

impl PeerConnection {
    /// Create a connection in the given role. No I/O happens until the
    /// negotiation methods are called.
    pub fn new(role: Role, cancel: CancellationToken) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        Arc::new(Self {
            role,
            cancel,
            state_tx,
            negotiation: Mutex::new(Negotiation::default()),
            channels: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Bind the listener, mint a token and start accepting. Returns the
    /// offer to relay to the peer.
    pub async fn create_offer(self: &Arc<Self>) -> Result<SessionDescription, ChannelError> {
        if self.role != Role::Offerer {
            return Err(ChannelError::InvalidState(
                "only the offering side creates offers",
            ));
        }
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        let token = token::generate_token();
        let offer = SessionDescription {
            kind: DescriptionKind::Offer,
            token: token.clone(),
        };

        {
            let mut negotiation = self.negotiation.lock().map_err(poisoned)?;
            if negotiation.local_description.is_some() {
                return Err(ChannelError::InvalidState("offer already created"));
            }
            negotiation.local_description = Some(offer.clone());
            negotiation.listen_port = Some(port);
        }

        info!(port, "listening for peer");
        self.transition(ConnectionState::Connecting);
        tokio::spawn(self.clone().run_accept(listener, token));
        Ok(offer)
    }

    /// Build the answer that echoes the offer's token. Requires the remote
    /// description to be set first.
    pub fn create_answer(&self) -> Result<SessionDescription, ChannelError> {
        if self.role != Role::Answerer {
            return Err(ChannelError::InvalidState(
                "only the answering side creates answers",
            ));
        }
        let mut negotiation = self.negotiation.lock().map_err(poisoned)?;
        let offer = negotiation
            .remote_description
            .as_ref()
            .ok_or(ChannelError::InvalidState("no remote offer to answer"))?;
        let answer = SessionDescription {
            kind: DescriptionKind::Answer,
            token: offer.token.clone(),
        };
        negotiation.local_description = Some(answer.clone());
        Ok(answer)
    }

    /// One candidate per local IPv4 address, pointing at the listener.
    pub fn local_candidates(&self) -> Result<Vec<Candidate>, ChannelError> {
        let port = {
            let negotiation = self.negotiation.lock().map_err(poisoned)?;
            match negotiation.listen_port {
                Some(port) => port,
                None => return Ok(Vec::new()),
            }
        };

        let mut candidates = Vec::new();
        for iface in if_addrs::get_if_addrs()? {
            let ip = iface.ip();
            if ip.is_ipv4() {
                candidates.push(Candidate {
                    addr: format!("{ip}:{port}"),
                });
            }
        }
        if candidates.is_empty() {
            candidates.push(Candidate {
                addr: format!("127.0.0.1:{port}"),
            });
        }
        Ok(candidates)
    }

    /// Apply the description relayed from the peer.
    ///
    /// On the answering side this starts the dial task and flushes any
    /// candidates that arrived early. On the offering side it validates
    /// the echoed token.
    pub fn set_remote_description(
        self: &Arc<Self>,
        description: SessionDescription,
    ) -> Result<(), ChannelError> {
        match (self.role, description.kind) {
            (Role::Answerer, DescriptionKind::Offer) => {
                let (dial_tx, dial_rx) = mpsc::unbounded_channel();
                let token = description.token.clone();
                let buffered = {
                    let mut negotiation = self.negotiation.lock().map_err(poisoned)?;
                    if negotiation.remote_description.is_some() {
                        return Err(ChannelError::InvalidState("remote offer already set"));
                    }
                    negotiation.remote_description = Some(description);
                    negotiation.dial_tx = Some(dial_tx.clone());
                    std::mem::take(&mut negotiation.pending_candidates)
                };

                if !buffered.is_empty() {
                    debug!(count = buffered.len(), "flushing buffered candidates");
                }
                for candidate in buffered {
                    let _ = dial_tx.send(candidate);
                }
                tokio::spawn(self.clone().run_dial(dial_rx, token));
                Ok(())
            }
            (Role::Offerer, DescriptionKind::Answer) => {
                let mut negotiation = self.negotiation.lock().map_err(poisoned)?;
                match &negotiation.local_description {
                    Some(offer) if offer.token == description.token => {
                        negotiation.remote_description = Some(description);
                        Ok(())
                    }
                    Some(_) => Err(ChannelError::Signaling(
                        "answer token does not match the offer".into(),
                    )),
                    None => Err(ChannelError::InvalidState("no local offer yet")),
                }
            }
            _ => Err(ChannelError::Signaling(format!(
                "unexpected {:?} description for role {:?}",
                description.kind, self.role
            ))),
        }
    }

    /// Queue a candidate from the peer. Candidates that arrive before the
    /// remote description are buffered and flushed once it is applied.
    pub fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), ChannelError> {
        if self.role == Role::Offerer {
            trace!(addr = %candidate.addr, "offering side ignores candidates");
            return Ok(());
        }
        let mut negotiation = self.negotiation.lock().map_err(poisoned)?;
        match &negotiation.dial_tx {
            Some(dial_tx) => {
                let _ = dial_tx.send(candidate);
            }
            None => {
                trace!(addr = %candidate.addr, "buffering candidate until remote description");
                negotiation.pending_candidates.push(candidate);
            }
        }
        Ok(())
    }

    /// Open a sub-channel toward the peer and wait for its acknowledgment.
    pub async fn open_channel(&self, label: impl Into<String>) -> Result<SubChannel, ChannelError> {
        let label = label.into();
        let out_tx = self.outbound_tx()?;

        let (state, in_rx) = {
            let mut channels = self.channels.lock().map_err(poisoned)?;
            if channels.contains_key(&label) {
                return Err(ChannelError::AlreadyOpen(label));
            }
            let state = ChannelState::new(label.clone());
            let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
            channels.insert(
                label.clone(),
                ChannelEntry {
                    state: state.clone(),
                    inbound: in_tx,
                },
            );
            (state, in_rx)
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_opens
            .lock()
            .map_err(poisoned)?
            .insert(label.clone(), ack_tx);

        if out_tx.send(Outbound::control(Frame::open(&label))).is_err() {
            self.abort_open(&label);
            return Err(ChannelError::Closed);
        }

        let acked = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled),
            result = tokio::time::timeout(OPEN_TIMEOUT, ack_rx) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ChannelError::Closed),
                Err(_) => Err(ChannelError::Timeout("channel open")),
            },
        };
        if let Err(err) = acked {
            self.abort_open(&label);
            return Err(err);
        }

        debug!(label, "sub-channel open");
        Ok(SubChannel::new(ChannelWriter::new(state, out_tx), in_rx))
    }

    /// Stream of sub-channels the remote peer opened. Yields `None` after
    /// the first call.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<SubChannel>> {
        self.incoming_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == ConnectionState::Connected
    }

    /// Wait until the connection is established. Errors if it reaches a
    /// state it cannot connect from.
    pub async fn wait_connected(&self) -> Result<(), ChannelError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => return Err(ChannelError::ConnectionFailed),
                ConnectionState::Disconnected | ConnectionState::Closed => {
                    return Err(ChannelError::Closed);
                }
                ConnectionState::New | ConnectionState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(ChannelError::Closed);
            }
        }
    }

    /// Tear the connection down: stop the tasks, close every sub-channel
    /// and move to `Closed`. Safe to call more than once.
    pub fn cleanup(&self) {
        self.cancel.cancel();
        if let Ok(mut negotiation) = self.negotiation.lock() {
            negotiation.dial_tx = None;
            negotiation.pending_candidates.clear();
        }
        self.teardown(ConnectionState::Closed);
    }

    // ---- internals ----

    async fn run_accept(self: Arc<Self>, listener: TcpListener, expected_token: String) {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled),
            result = tokio::time::timeout(
                ACCEPT_TIMEOUT,
                accept_peer(&listener, &expected_token),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(ChannelError::Timeout("accept")),
            },
        };
        // One stream per connection.
        drop(listener);

        match result {
            Ok(stream) => self.attach(stream),
            Err(ChannelError::Cancelled) => {}
            Err(err) => {
                warn!(%err, "no peer connected");
                self.transition(ConnectionState::Failed);
            }
        }
    }

    async fn run_dial(self: Arc<Self>, mut dial_rx: mpsc::UnboundedReceiver<Candidate>, token: String) {
        self.transition(ConnectionState::Connecting);
        loop {
            let candidate = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                candidate = dial_rx.recv() => match candidate {
                    Some(candidate) => candidate,
                    None => break,
                },
            };
            match dial_candidate(&candidate, &token).await {
                Ok(stream) => {
                    info!(addr = %candidate.addr, "connected to peer");
                    self.attach(stream);
                    return;
                }
                Err(err) => {
                    debug!(addr = %candidate.addr, %err, "candidate failed");
                }
            }
        }
        warn!("every candidate failed");
        self.transition(ConnectionState::Failed);
    }

    fn attach(self: &Arc<Self>, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = Some(out_tx);
        }
        self.transition(ConnectionState::Connected);
        tokio::spawn(self.clone().run_writer(write_half, out_rx));
        tokio::spawn(self.clone().run_reader(read_half));
    }

    async fn run_reader(self: Arc<Self>, read_half: OwnedReadHalf) {
        let mut reader = BufReader::with_capacity(SOCKET_BUFFER_SIZE, read_half);
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.teardown(ConnectionState::Closed);
                    return;
                }
                result = read_frame(&mut reader) => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        debug!("peer closed the stream");
                        self.teardown(ConnectionState::Disconnected);
                        return;
                    }
                    Err(err) => {
                        warn!(%err, "peer stream read failed");
                        self.teardown(ConnectionState::Disconnected);
                        return;
                    }
                },
            };
            self.handle_frame(frame).await;
        }
    }

    async fn run_writer(
        self: Arc<Self>,
        write_half: OwnedWriteHalf,
        mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let mut writer = BufWriter::with_capacity(SOCKET_BUFFER_SIZE, write_half);
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = out_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let closes = item.frame.kind == FrameKind::Close;
            let label = item.frame.label.clone();
            if let Err(err) = write_frame(&mut writer, &item.frame).await {
                warn!(%err, "peer stream write failed");
                if let Some((state, amount)) = item.settle {
                    state.settle(amount);
                }
                self.teardown(ConnectionState::Disconnected);
                return;
            }
            if let Some((state, amount)) = item.settle {
                state.settle(amount);
            }
            if closes {
                self.remove_channel(&label);
            }

            // Flush when the queue momentarily drains instead of per frame.
            if out_rx.is_empty() {
                if let Err(err) = writer.flush().await {
                    warn!(%err, "peer stream flush failed");
                    self.teardown(ConnectionState::Disconnected);
                    return;
                }
            }
        }
        let _ = writer.flush().await;
        self.teardown(ConnectionState::Closed);
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame.kind {
            FrameKind::Open => {
                let label = frame.label;
                let channel = {
                    let out_tx = match self.outbound_tx() {
                        Ok(out_tx) => out_tx,
                        Err(_) => return,
                    };
                    let mut channels = match self.channels.lock() {
                        Ok(channels) => channels,
                        Err(_) => return,
                    };
                    if channels.contains_key(&label) {
                        trace!(label, "duplicate open ignored");
                        None
                    } else {
                        let state = ChannelState::new(label.clone());
                        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
                        channels.insert(
                            label.clone(),
                            ChannelEntry {
                                state: state.clone(),
                                inbound: in_tx,
                            },
                        );
                        Some(SubChannel::new(ChannelWriter::new(state, out_tx), in_rx))
                    }
                };

                if let Ok(out_tx) = self.outbound_tx() {
                    let _ = out_tx.send(Outbound::control(Frame::open_ack(&label)));
                }
                if let Some(channel) = channel {
                    debug!(label, "remote opened sub-channel");
                    if self.incoming_tx.send(channel).await.is_err() {
                        warn!(label, "incoming channel dropped, connection closing");
                    }
                }
            }
            FrameKind::OpenAck => {
                let ack_tx = self
                    .pending_opens
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&frame.label));
                match ack_tx {
                    Some(ack_tx) => {
                        let _ = ack_tx.send(());
                    }
                    None => trace!(label = frame.label, "unexpected open ack"),
                }
            }
            FrameKind::Text => match String::from_utf8(frame.payload) {
                Ok(text) => self.route(&frame.label, ChannelMessage::Text(text)).await,
                Err(_) => warn!(label = frame.label, "non-UTF-8 text frame dropped"),
            },
            FrameKind::Binary => {
                self.route(&frame.label, ChannelMessage::Binary(frame.payload))
                    .await;
            }
            FrameKind::Close => {
                self.remove_channel(&frame.label);
            }
        }
    }

    async fn route(&self, label: &str, message: ChannelMessage) {
        let inbound = self
            .channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(label).map(|entry| entry.inbound.clone()));
        match inbound {
            Some(inbound) => {
                if inbound.send(message).await.is_err() {
                    // Local consumer is gone. Close our side so the peer
                    // stops streaming into the void.
                    self.remove_channel(label);
                    if let Ok(out_tx) = self.outbound_tx() {
                        let _ = out_tx.send(Outbound::control(Frame::close(label)));
                    }
                }
            }
            None => trace!(label, "message for unknown channel dropped"),
        }
    }

    fn outbound_tx(&self) -> Result<mpsc::UnboundedSender<Outbound>, ChannelError> {
        self.outbound
            .lock()
            .map_err(poisoned)?
            .clone()
            .ok_or(ChannelError::InvalidState("connection is not established"))
    }

    fn remove_channel(&self, label: &str) {
        let entry = self
            .channels
            .lock()
            .ok()
            .and_then(|mut channels| channels.remove(label));
        if let Some(entry) = entry {
            entry.state.mark_closed();
            debug!(label, "sub-channel closed");
        }
    }

    fn abort_open(&self, label: &str) {
        if let Ok(mut pending) = self.pending_opens.lock() {
            pending.remove(label);
        }
        self.remove_channel(label);
    }

    fn teardown(&self, final_state: ConnectionState) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(role = ?self.role, "tearing down peer connection");
        let entries: Vec<ChannelEntry> = match self.channels.lock() {
            Ok(mut channels) => channels.drain().map(|(_, entry)| entry).collect(),
            Err(_) => Vec::new(),
        };
        for entry in &entries {
            entry.state.mark_closed();
        }
        if let Ok(mut pending) = self.pending_opens.lock() {
            pending.clear();
        }
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = None;
        }
        self.transition(final_state);
        // Stop the sibling pump as well.
        self.cancel.cancel();
    }

    fn transition(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next || *state == ConnectionState::Closed {
                return false;
            }
            // Disconnected and Failed only give way to Closed.
            if matches!(
                *state,
                ConnectionState::Disconnected | ConnectionState::Failed
            ) && next != ConnectionState::Closed
            {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(state = %next, "connection state changed");
        }
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> ChannelError {
    ChannelError::InvalidState("connection lock poisoned")
}

/// Accept until a dialer presents the right token. Bad dialers get
/// `AUTH_REJECTED` and the loop keeps listening.
async fn accept_peer(
    listener: &TcpListener,
    expected_token: &str,
) -> Result<TcpStream, ChannelError> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        debug!(%addr, "peer dialed in");

        let presented = match tokio::time::timeout(AUTH_TIMEOUT, read_token(&mut stream)).await {
            Ok(Ok(token)) => token,
            Ok(Err(err)) => {
                warn!(%addr, %err, "token read failed");
                continue;
            }
            Err(_) => {
                warn!(%addr, "token read timed out");
                continue;
            }
        };

        if !token::validate_token(expected_token, &presented) {
            warn!(%addr, "peer presented an invalid token");
            let _ = stream.write_u8(AUTH_REJECTED).await;
            continue;
        }

        stream.write_u8(AUTH_OK).await?;
        info!(%addr, "peer authenticated");
        return Ok(stream);
    }
}

async fn dial_candidate(candidate: &Candidate, token: &str) -> Result<TcpStream, ChannelError> {
    let addr: SocketAddr = candidate
        .addr
        .parse()
        .map_err(|_| ChannelError::Signaling(format!("bad candidate address: {}", candidate.addr)))?;

    let mut stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(ChannelError::Timeout("dial")),
    };

    stream.write_all(token.as_bytes()).await?;
    let verdict = match tokio::time::timeout(AUTH_TIMEOUT, stream.read_u8()).await {
        Ok(Ok(byte)) => byte,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(ChannelError::Timeout("auth")),
    };
    if verdict != AUTH_OK {
        return Err(ChannelError::AuthFailed("peer rejected the token".into()));
    }
    Ok(stream)
}

async fn read_token(stream: &mut TcpStream) -> Result<String, ChannelError> {
    // Tokens are fixed-length hex.
    let mut buf = [0u8; 32];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf.to_vec())
        .map_err(|_| ChannelError::Protocol("token is not valid UTF-8".into()))
}
