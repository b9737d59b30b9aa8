//! Labeled sub-channels multiplexed over one peer connection.
//!
//! A [`SubChannel`] owns the inbound side of a channel. [`ChannelWriter`]
//! is a cheap clone of the outbound side for tasks that only need to send.
//! Outbound messages are counted into a buffered-amount total the moment
//! they are queued and subtracted once the connection writer has pushed
//! them onto the socket, which is what [`ChannelWriter::buffered_amount_low`]
//! waits on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Notify, mpsc};

use crate::error::ChannelError;
use crate::wire::Frame;

/// A message received on a sub-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Shared per-channel bookkeeping between the handles and the connection
/// writer task.
pub(crate) struct ChannelState {
    label: String,
    buffered: AtomicU64,
    low_threshold: AtomicU64,
    drain: Notify,
    closed: AtomicBool,
}

impl ChannelState {
    pub(crate) fn new(label: String) -> Arc<Self> {
        Arc::new(Self {
            label,
            buffered: AtomicU64::new(0),
            low_threshold: AtomicU64::new(0),
            drain: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Called by the connection writer after a frame of this channel hit
    /// the socket. `amount` is exactly what the sender side added.
    pub(crate) fn settle(&self, amount: u64) {
        let prev = self.buffered.fetch_sub(amount, Ordering::Relaxed);
        let now = prev.saturating_sub(amount);
        if now <= self.low_threshold.load(Ordering::Relaxed) {
            self.drain.notify_waiters();
        }
    }

    /// Marks the channel unusable and wakes every waiter.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.drain.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// A frame queued for the connection writer, together with the channel
/// state to settle once it is on the wire.
pub(crate) struct Outbound {
    pub(crate) frame: Frame,
    pub(crate) settle: Option<(Arc<ChannelState>, u64)>,
}

impl Outbound {
    pub(crate) fn control(frame: Frame) -> Self {
        Self {
            frame,
            settle: None,
        }
    }
}

/// Clonable outbound handle to a sub-channel.
#[derive(Clone)]
pub struct ChannelWriter {
    state: Arc<ChannelState>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ChannelWriter {
    pub(crate) fn new(state: Arc<ChannelState>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { state, outbound }
    }

    pub fn label(&self) -> &str {
        self.state.label()
    }

    /// Queue a text message.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        let text = text.into();
        let amount = text.len() as u64;
        self.enqueue(Frame::text(self.label(), text), amount)
    }

    /// Queue a binary message.
    pub fn send_binary(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        let amount = payload.len() as u64;
        self.enqueue(Frame::binary(self.label(), payload), amount)
    }

    fn enqueue(&self, frame: Frame, amount: u64) -> Result<(), ChannelError> {
        if self.state.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.state.buffered.fetch_add(amount, Ordering::Relaxed);
        let outbound = Outbound {
            frame,
            settle: Some((self.state.clone(), amount)),
        };
        if self.outbound.send(outbound).is_err() {
            self.state.settle(amount);
            self.state.mark_closed();
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    /// Close the channel in both directions. Idempotent.
    pub fn close(&self) {
        if self.state.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self
            .outbound
            .send(Outbound::control(Frame::close(self.label())));
        self.state.drain.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Bytes queued but not yet written to the socket.
    pub fn buffered_amount(&self) -> u64 {
        self.state.buffered.load(Ordering::Relaxed)
    }

    /// Threshold for [`Self::buffered_amount_low`]. Defaults to zero.
    pub fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.state.low_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Wait until the buffered amount is at or below the configured
    /// threshold. Resolves immediately if it already is. Errors once the
    /// channel is closed, since a dead writer will never drain.
    pub async fn buffered_amount_low(&self) -> Result<(), ChannelError> {
        loop {
            let notified = self.state.drain.notified();
            tokio::pin!(notified);
            // Register before checking so a settle between the check and
            // the await cannot be missed.
            notified.as_mut().enable();

            let buffered = self.state.buffered.load(Ordering::Relaxed);
            if buffered <= self.state.low_threshold.load(Ordering::Relaxed) {
                return Ok(());
            }
            if self.state.is_closed() {
                return Err(ChannelError::Closed);
            }
            notified.await;
        }
    }
}

/// One open sub-channel: a writer plus the stream of inbound messages.
pub struct SubChannel {
    writer: ChannelWriter,
    inbound: mpsc::Receiver<ChannelMessage>,
}

impl SubChannel {
    pub(crate) fn new(writer: ChannelWriter, inbound: mpsc::Receiver<ChannelMessage>) -> Self {
        Self { writer, inbound }
    }

    pub fn label(&self) -> &str {
        self.writer.label()
    }

    /// Receive the next message. `None` once the channel is closed and
    /// every buffered message has been taken.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.inbound.recv().await
    }

    /// A clonable handle for tasks that only send.
    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.writer.send_text(text)
    }

    pub fn send_binary(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.writer.send_binary(payload)
    }

    pub fn close(&self) {
        self.writer.close();
    }

    pub fn buffered_amount(&self) -> u64 {
        self.writer.buffered_amount()
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.writer.set_buffered_amount_low_threshold(threshold);
    }

    pub async fn buffered_amount_low(&self) -> Result<(), ChannelError> {
        self.writer.buffered_amount_low().await
    }
}

impl Drop for SubChannel {
    fn drop(&mut self) {
        self.writer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameKind;

    fn writer_pair() -> (ChannelWriter, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = ChannelState::new("task-1".into());
        (ChannelWriter::new(state, tx), rx)
    }

    #[tokio::test]
    async fn send_counts_into_buffered_amount() {
        let (writer, mut rx) = writer_pair();
        writer.send_binary(vec![0u8; 100]).unwrap();
        writer.send_text("hello").unwrap();
        assert_eq!(writer.buffered_amount(), 105);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.frame.kind, FrameKind::Binary);
        let (state, amount) = first.settle.unwrap();
        state.settle(amount);
        assert_eq!(writer.buffered_amount(), 5);
    }

    #[tokio::test]
    async fn buffered_amount_low_wakes_on_settle() {
        let (writer, mut rx) = writer_pair();
        writer.set_buffered_amount_low_threshold(10);
        writer.send_binary(vec![0u8; 64]).unwrap();

        let waiter = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.buffered_amount_low().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let (state, amount) = rx.recv().await.unwrap().settle.unwrap();
        state.settle(amount);
        waiter.await.unwrap().unwrap();
        assert_eq!(writer.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn buffered_amount_low_resolves_immediately_when_drained() {
        let (writer, _rx) = writer_pair();
        writer.buffered_amount_low().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_sends() {
        let (writer, mut rx) = writer_pair();
        writer.close();
        writer.close();
        assert!(matches!(
            writer.send_text("late"),
            Err(ChannelError::Closed)
        ));

        let frame = rx.recv().await.unwrap().frame;
        assert_eq!(frame.kind, FrameKind::Close);
        // Second close queued nothing.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn waiter_errors_when_channel_closes() {
        let (writer, _rx) = writer_pair();
        writer.set_buffered_amount_low_threshold(0);
        writer.send_binary(vec![0u8; 32]).unwrap();

        let waiter = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.buffered_amount_low().await })
        };
        tokio::task::yield_now().await;
        writer.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn subchannel_receives_and_drains() {
        let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
        let state = ChannelState::new("task-2".into());
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut channel = SubChannel::new(ChannelWriter::new(state, tx), in_rx);
        drop(rx);

        in_tx
            .send(ChannelMessage::Text("meta".into()))
            .await
            .unwrap();
        in_tx
            .send(ChannelMessage::Binary(vec![1, 2, 3]))
            .await
            .unwrap();
        drop(in_tx);

        assert_eq!(
            channel.recv().await,
            Some(ChannelMessage::Text("meta".into()))
        );
        assert_eq!(
            channel.recv().await,
            Some(ChannelMessage::Binary(vec![1, 2, 3]))
        );
        assert_eq!(channel.recv().await, None);
    }
}
