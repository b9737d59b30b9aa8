use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use peerbeam_channel::{ChannelError, ChannelMessage, PeerConnection, SubChannel};
use peerbeam_protocol::ControlMessage;
use peerbeam_protocol::types::FileMeta;
use peerbeam_queue::{UploadError, UploadRequest};

use crate::CHUNK_SIZE;
use crate::progress::SpeedMeter;

/// Streams one file over a dedicated sub-channel labeled by the task id.
///
/// Declares the file with `META`, pumps binary chunks under
/// backpressure, then sends `EOF` and waits for the receiver's verdict:
/// `ACK` resolves, `CANCEL` reports a peer abort. The request's
/// cancellation token is observed at every chunk boundary, including
/// while suspended on backpressure.
pub async fn send_file(conn: &PeerConnection, request: &UploadRequest) -> Result<(), UploadError> {
    send_file_chunked(conn, request, CHUNK_SIZE).await
}

/// [`send_file`] with an explicit chunk size. The backpressure high
/// water mark is 4x the chunk, the drain threshold 2x.
pub async fn send_file_chunked(
    conn: &PeerConnection,
    request: &UploadRequest,
    chunk_size: usize,
) -> Result<(), UploadError> {
    let mut channel = conn
        .open_channel(request.id.clone())
        .await
        .map_err(transport)?;
    channel.set_buffered_amount_low_threshold(2 * chunk_size as u64);

    let meta = ControlMessage::Meta {
        id: request.id.clone(),
        meta: FileMeta {
            name: request.name.clone(),
            size: request.size,
            mime: request.mime.clone(),
        },
    };
    send_control(&channel, &meta)?;

    let mut file = tokio::fs::File::open(&request.path).await?;
    let total = request.size;
    let mut offset: u64 = 0;
    let mut meter = SpeedMeter::new();
    let mut buf = vec![0u8; chunk_size];

    while offset < total {
        if request.cancel.is_cancelled() {
            return abort(&channel, &request.id);
        }

        // Never read past the declared size; it is the receiver's
        // assembly contract.
        let want = chunk_size.min((total - offset) as usize);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            let _ = send_control(&channel, &ControlMessage::Cancel {
                id: request.id.clone(),
            });
            channel.close();
            return Err(UploadError::Transport("file truncated during upload".into()));
        }

        channel.send_binary(buf[..n].to_vec()).map_err(transport)?;
        offset += n as u64;

        let percent = ((offset * 100) / total.max(1)) as u8;
        (request.progress)(percent, meter.record(n as u64));

        if channel.buffered_amount() > 4 * chunk_size as u64 {
            tokio::select! {
                _ = request.cancel.cancelled() => {
                    return abort(&channel, &request.id);
                }
                drained = channel.buffered_amount_low() => drained.map_err(transport)?,
            }
        }
    }

    send_control(&channel, &ControlMessage::Eof {
        id: request.id.clone(),
    })?;
    debug!(task = %request.id, bytes = offset, "all chunks sent, awaiting receipt");

    // The receiver replies on the same channel once it has the file.
    loop {
        tokio::select! {
            _ = request.cancel.cancelled() => {
                return abort(&channel, &request.id);
            }
            message = channel.recv() => match message {
                Some(ChannelMessage::Text(text)) => match ControlMessage::from_json(&text) {
                    Ok(ControlMessage::Ack { .. }) => {
                        channel.close();
                        return Ok(());
                    }
                    Ok(ControlMessage::Cancel { .. }) => {
                        channel.close();
                        return Err(UploadError::PeerCancelled);
                    }
                    Ok(other) => {
                        warn!(task = %request.id, "unexpected control reply: {other:?}");
                    }
                    Err(e) => warn!(task = %request.id, "bad control reply: {e}"),
                },
                Some(ChannelMessage::Binary(_)) => {
                    warn!(task = %request.id, "unexpected binary reply");
                }
                None => {
                    return Err(UploadError::Transport(
                        "channel closed before acknowledgment".into(),
                    ));
                }
            }
        }
    }
}

fn send_control(channel: &SubChannel, message: &ControlMessage) -> Result<(), UploadError> {
    let json = message
        .to_json()
        .map_err(|e| UploadError::Transport(e.to_string()))?;
    channel.send_text(json).map_err(transport)
}

/// Tells the receiver to drop what it has, then reports a local cancel.
fn abort(channel: &SubChannel, id: &str) -> Result<(), UploadError> {
    let _ = send_control(channel, &ControlMessage::Cancel { id: id.to_owned() });
    channel.close();
    Err(UploadError::Cancelled)
}

fn transport(e: ChannelError) -> UploadError {
    UploadError::Transport(e.to_string())
}
