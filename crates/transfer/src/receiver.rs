use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use peerbeam_channel::{ChannelMessage, ChannelWriter, SubChannel};
use peerbeam_protocol::ControlMessage;
use peerbeam_protocol::types::FileMeta;

use crate::TransferError;
use crate::progress::SpeedMeter;

/// Capacity of the item event channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// Lifecycle of an inbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveStatus {
    Receiving,
    Done,
    Error,
}

/// View model of an inbound transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiveItem {
    pub id: String,
    pub meta: FileMeta,
    /// Floor of received over declared size; oversupplied bytes push
    /// this past 100, since the declared size is trusted as-is.
    pub progress: u8,
    pub speed_mbps: f64,
    pub status: ReceiveStatus,
}

/// A fully assembled transfer: declared metadata plus whatever bytes
/// actually arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub meta: FileMeta,
    pub bytes: Vec<u8>,
}

impl ReceivedFile {
    /// Writes the file into `dir` under its declared name, reduced to a
    /// plain file name first. Returns the written path.
    pub async fn save_to(&self, dir: &Path) -> Result<PathBuf, TransferError> {
        let name = sanitize_name(&self.meta.name)?;
        let path = dir.join(name);
        tokio::fs::write(&path, &self.bytes).await?;
        Ok(path)
    }
}

/// Strips any directory structure from a declared file name. Absolute
/// paths and traversal components never reach the filesystem.
fn sanitize_name(name: &str) -> Result<&str, TransferError> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .ok_or_else(|| TransferError::InvalidName(name.to_owned()))
}

/// Inbound transfer notifications.
#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    Added(ReceiveItem),
    Updated(ReceiveItem),
    /// The assembled file travels with the completion, not the item
    /// snapshots, so listing items stays cheap.
    Completed { id: String, file: ReceivedFile },
    Removed { id: String },
}

struct ReceiveTask {
    meta: FileMeta,
    received: u64,
    chunks: Vec<Vec<u8>>,
    meter: SpeedMeter,
}

struct ReceiverInner {
    /// In-flight accumulation, keyed by sub-channel label.
    tasks: HashMap<String, ReceiveTask>,
    /// Outbound halves of every tracked channel, for replies and cancel.
    channels: HashMap<String, ChannelWriter>,
    items: Vec<ReceiveItem>,
}

/// Accepts inbound sub-channels and assembles one file per channel.
pub struct Receiver {
    inner: Mutex<ReceiverInner>,
    events_tx: mpsc::Sender<ReceiveEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ReceiveEvent>>>,
    cancel: CancellationToken,
}

impl Receiver {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        Arc::new(Self {
            inner: Mutex::new(ReceiverInner {
                tasks: HashMap::new(),
                channels: HashMap::new(),
                items: Vec::new(),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Spawns the demux task over a connection's inbound channel stream
    /// (`PeerConnection::take_incoming`). Each accepted channel gets its
    /// own handler task.
    pub fn attach(self: &Arc<Self>, mut incoming: mpsc::Receiver<SubChannel>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let channel = tokio::select! {
                    _ = cancel.cancelled() => break,
                    channel = incoming.recv() => match channel {
                        Some(channel) => channel,
                        None => break,
                    },
                };
                let Some(receiver) = weak.upgrade() else { break };
                tokio::spawn(receiver.handle_channel(channel));
            }
        });
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ReceiveEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Snapshot of every item, in arrival order.
    pub fn items(&self) -> Vec<ReceiveItem> {
        self.lock().items.clone()
    }

    /// Aborts an in-progress transfer: tells the sender to stop, drops
    /// the buffered chunks and removes the item. A second cancel of the
    /// same id is a no-op.
    pub fn cancel(&self, id: &str) {
        let writer = {
            let mut inner = self.lock();
            if inner.tasks.remove(id).is_none() {
                return;
            }
            inner.items.retain(|item| item.id != id);
            inner.channels.get(id).cloned()
        };
        debug!(transfer = %id, "cancelling inbound transfer");
        if let Some(writer) = writer {
            let message = ControlMessage::Cancel { id: id.to_owned() };
            if let Ok(json) = message.to_json() {
                let _ = writer.send_text(json);
            }
        }
        self.emit(ReceiveEvent::Removed { id: id.to_owned() });
    }

    /// Closes every tracked channel and forgets all state. Idempotent.
    pub fn cleanup(&self) {
        let writers: Vec<ChannelWriter> = {
            let mut inner = self.lock();
            inner.tasks.clear();
            inner.items.clear();
            inner.channels.drain().map(|(_, writer)| writer).collect()
        };
        for writer in writers {
            writer.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReceiverInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_channel(self: Arc<Self>, mut channel: SubChannel) {
        let id = channel.label().to_owned();
        self.lock().channels.insert(id.clone(), channel.writer());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    channel.close();
                    self.lock().channels.remove(&id);
                    return;
                }
                message = channel.recv() => match message {
                    Some(ChannelMessage::Text(text)) => {
                        if self.on_control(&id, &text, &channel) {
                            return;
                        }
                    }
                    Some(ChannelMessage::Binary(chunk)) => self.on_chunk(&id, chunk),
                    None => {
                        self.on_closed(&id);
                        return;
                    }
                }
            }
        }
    }

    /// Returns true once this channel's lifecycle is over.
    fn on_control(&self, id: &str, text: &str, channel: &SubChannel) -> bool {
        let message = match ControlMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(transfer = %id, "dropping unparseable control message: {e}");
                return false;
            }
        };
        match message {
            ControlMessage::Meta { id: msg_id, meta } => {
                if msg_id != id {
                    warn!(transfer = %id, declared = %msg_id, "META id differs from channel label");
                }
                self.on_meta(id, meta);
                false
            }
            ControlMessage::Eof { .. } => {
                self.on_eof(id, channel);
                false
            }
            ControlMessage::Cancel { .. } => {
                debug!(transfer = %id, "sender cancelled transfer");
                self.discard(id);
                channel.close();
                self.lock().channels.remove(id);
                true
            }
            ControlMessage::Ack { .. } => {
                warn!(transfer = %id, "unexpected ACK on inbound channel");
                false
            }
        }
    }

    fn on_meta(&self, id: &str, meta: FileMeta) {
        let item = ReceiveItem {
            id: id.to_owned(),
            meta: meta.clone(),
            progress: 0,
            speed_mbps: 0.0,
            status: ReceiveStatus::Receiving,
        };
        {
            let mut inner = self.lock();
            if inner.tasks.contains_key(id) {
                warn!(transfer = %id, "duplicate META, restarting accumulation");
                inner.items.retain(|existing| existing.id != id);
            }
            inner.tasks.insert(id.to_owned(), ReceiveTask {
                meta,
                received: 0,
                chunks: Vec::new(),
                meter: SpeedMeter::new(),
            });
            inner.items.push(item.clone());
        }
        debug!(transfer = %id, name = %item.meta.name, size = item.meta.size, "inbound transfer started");
        self.emit(ReceiveEvent::Added(item));
    }

    fn on_chunk(&self, id: &str, chunk: Vec<u8>) {
        let updated = {
            let mut inner = self.lock();
            let Some(task) = inner.tasks.get_mut(id) else {
                trace!(transfer = %id, "chunk for unknown transfer dropped");
                return;
            };
            task.received += chunk.len() as u64;
            let speed = task.meter.record(chunk.len() as u64);
            task.chunks.push(chunk);
            let percent = progress_percent(task.received, task.meta.size);
            update_item(&mut inner, id, |item| {
                item.progress = percent;
                if let Some(mbps) = speed {
                    item.speed_mbps = mbps;
                }
            })
        };
        if let Some(item) = updated {
            self.emit(ReceiveEvent::Updated(item));
        }
    }

    fn on_eof(&self, id: &str, channel: &SubChannel) {
        let (item, file) = {
            let mut inner = self.lock();
            let Some(task) = inner.tasks.remove(id) else {
                warn!(transfer = %id, "EOF for unknown transfer ignored");
                return;
            };
            let file = ReceivedFile {
                meta: task.meta,
                bytes: task.chunks.concat(),
            };
            let item = update_item(&mut inner, id, |item| {
                item.status = ReceiveStatus::Done;
                item.progress = 100;
            });
            (item, file)
        };
        debug!(transfer = %id, bytes = file.bytes.len(), "inbound transfer complete");
        if let Some(item) = item {
            self.emit(ReceiveEvent::Updated(item));
        }
        self.emit(ReceiveEvent::Completed {
            id: id.to_owned(),
            file,
        });

        let ack = ControlMessage::Ack { id: id.to_owned() };
        match ack.to_json() {
            Ok(json) => {
                if channel.send_text(json).is_err() {
                    warn!(transfer = %id, "channel closed before ACK could be sent");
                }
            }
            Err(e) => warn!(transfer = %id, "cannot encode ACK: {e}"),
        }
    }

    /// Sender-side close. Mid-transfer this is a fault; after completion
    /// or cancel it is the expected end of the channel's life.
    fn on_closed(&self, id: &str) {
        let errored = {
            let mut inner = self.lock();
            inner.channels.remove(id);
            if inner.tasks.remove(id).is_some() {
                update_item(&mut inner, id, |item| item.status = ReceiveStatus::Error)
            } else {
                None
            }
        };
        if let Some(item) = errored {
            warn!(transfer = %item.id, "channel closed mid-transfer");
            self.emit(ReceiveEvent::Updated(item));
        }
    }

    /// Drops accumulated state for a transfer the sender walked away from.
    fn discard(&self, id: &str) {
        let existed = {
            let mut inner = self.lock();
            let had_task = inner.tasks.remove(id).is_some();
            let had_item = inner.items.iter().any(|item| item.id == id);
            inner.items.retain(|item| item.id != id);
            had_task || had_item
        };
        if existed {
            self.emit(ReceiveEvent::Removed { id: id.to_owned() });
        }
    }

    /// Events are advisory; a slow consumer loses updates, not files.
    fn emit(&self, event: ReceiveEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            trace!("receive event dropped: {e}");
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn progress_percent(received: u64, declared: u64) -> u8 {
    (received.saturating_mul(100) / declared.max(1)).min(u8::MAX as u64) as u8
}

fn update_item(
    inner: &mut ReceiverInner,
    id: &str,
    f: impl FnOnce(&mut ReceiveItem),
) -> Option<ReceiveItem> {
    let item = inner.items.iter_mut().find(|item| item.id == id)?;
    f(item);
    Some(item.clone())
}
