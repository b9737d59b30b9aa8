//! Frame codec for the multiplexed peer stream.
//!
//! Every frame is length-prefixed and tagged with the label of the
//! sub-channel it belongs to:
//!
//! ```text
//! [4 bytes: frame length, big-endian]
//! [1 byte:  frame kind]
//! [2 bytes: label length, big-endian]
//! [label bytes (UTF-8)]
//! [payload bytes]
//! ```
//!
//! The frame length counts everything after the prefix itself.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME_SIZE;
use crate::error::ChannelError;

/// Fixed part of a frame after the length prefix: kind byte plus the
/// label-length field.
const FRAME_HEADER_LEN: usize = 3;

/// Discriminates what a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Request to open the labeled sub-channel.
    Open = 0x01,
    /// Acknowledges a previously received `Open`.
    OpenAck = 0x02,
    /// UTF-8 text message on an open sub-channel.
    Text = 0x03,
    /// Binary message on an open sub-channel.
    Binary = 0x04,
    /// Closes the labeled sub-channel in both directions.
    Close = 0x05,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Result<Self, ChannelError> {
        match byte {
            0x01 => Ok(FrameKind::Open),
            0x02 => Ok(FrameKind::OpenAck),
            0x03 => Ok(FrameKind::Text),
            0x04 => Ok(FrameKind::Binary),
            0x05 => Ok(FrameKind::Close),
            other => Err(ChannelError::Protocol(format!(
                "unknown frame kind 0x{other:02x}"
            ))),
        }
    }
}

/// One multiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub label: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn open(label: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Open,
            label: label.into(),
            payload: Vec::new(),
        }
    }

    pub fn open_ack(label: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::OpenAck,
            label: label.into(),
            payload: Vec::new(),
        }
    }

    pub fn text(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            label: label.into(),
            payload: text.into().into_bytes(),
        }
    }

    pub fn binary(label: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Binary,
            label: label.into(),
            payload,
        }
    }

    pub fn close(label: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Close,
            label: label.into(),
            payload: Vec::new(),
        }
    }
}

/// Write a single frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let label = frame.label.as_bytes();
    if label.len() > u16::MAX as usize {
        return Err(ChannelError::Protocol(format!(
            "label too long: {} bytes",
            label.len()
        )));
    }
    let frame_len = FRAME_HEADER_LEN + label.len() + frame.payload.len();
    if frame_len > MAX_FRAME_SIZE {
        return Err(ChannelError::Protocol(format!(
            "frame too large: {frame_len} bytes"
        )));
    }

    writer.write_u32(frame_len as u32).await?;
    writer.write_u8(frame.kind as u8).await?;
    writer.write_u16(label.len() as u16).await?;
    writer.write_all(label).await?;
    writer.write_all(&frame.payload).await?;
    Ok(())
}

/// Read a single frame. Returns `None` when the stream ends cleanly at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let frame_len = u32::from_be_bytes(len_buf) as usize;
    if frame_len < FRAME_HEADER_LEN {
        return Err(ChannelError::Protocol(format!(
            "frame length {frame_len} below minimum"
        )));
    }
    if frame_len > MAX_FRAME_SIZE {
        return Err(ChannelError::Protocol(format!(
            "frame too large: {frame_len} bytes"
        )));
    }

    let kind = FrameKind::from_byte(reader.read_u8().await?)?;
    let label_len = reader.read_u16().await? as usize;
    if FRAME_HEADER_LEN + label_len > frame_len {
        return Err(ChannelError::Protocol(format!(
            "label length {label_len} exceeds frame length {frame_len}"
        )));
    }

    let mut label_buf = vec![0u8; label_len];
    reader.read_exact(&mut label_buf).await?;
    let label = String::from_utf8(label_buf)
        .map_err(|_| ChannelError::Protocol("label is not valid UTF-8".into()))?;

    let mut payload = vec![0u8; frame_len - FRAME_HEADER_LEN - label_len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        kind,
        label,
        payload,
    }))
}
