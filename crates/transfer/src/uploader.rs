use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use peerbeam_channel::PeerConnection;
use peerbeam_queue::{UploadError, UploadRequest, Uploader};

use crate::CHUNK_SIZE;
use crate::sender;

/// Bridges the upload queue onto a peer connection: every request is
/// streamed through its own sub-channel, so concurrent uploads
/// multiplex over the one underlying stream.
pub struct ChannelUploader {
    conn: Arc<PeerConnection>,
    chunk_size: usize,
}

impl ChannelUploader {
    pub fn new(conn: Arc<PeerConnection>) -> Self {
        Self::with_chunk_size(conn, CHUNK_SIZE)
    }

    pub fn with_chunk_size(conn: Arc<PeerConnection>, chunk_size: usize) -> Self {
        Self { conn, chunk_size }
    }
}

impl Uploader for ChannelUploader {
    fn upload(
        &self,
        request: UploadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + '_>> {
        Box::pin(async move {
            sender::send_file_chunked(&self.conn, &request, self.chunk_size).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use peerbeam_channel::{ChannelMessage, Role};
    use peerbeam_protocol::ControlMessage;
    use peerbeam_protocol::types::FileMeta;
    use peerbeam_queue::{QueueConfig, RetryPolicy, TaskOptions, UploadQueue, UploadStatus};

    use crate::receiver::{ReceiveEvent, ReceiveStatus, Receiver};
    use crate::sender::{send_file, send_file_chunked};

    async fn connected_pair() -> (Arc<PeerConnection>, Arc<PeerConnection>) {
        let offerer = PeerConnection::new(Role::Offerer, CancellationToken::new());
        let answerer = PeerConnection::new(Role::Answerer, CancellationToken::new());

        let offer = offerer.create_offer().await.unwrap();
        answerer.set_remote_description(offer).unwrap();
        let answer = answerer.create_answer().unwrap();
        offerer.set_remote_description(answer).unwrap();
        for candidate in offerer.local_candidates().unwrap() {
            answerer.add_remote_candidate(candidate).unwrap();
        }

        offerer.wait_connected().await.unwrap();
        answerer.wait_connected().await.unwrap();
        (offerer, answerer)
    }

    fn patterned_file(dir: &Path, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.join(name);
        std::fs::write(&path, &bytes).unwrap();
        (path, bytes)
    }

    fn request_for(id: &str, path: &Path, size: u64, cancel: CancellationToken) -> UploadRequest {
        UploadRequest {
            id: id.into(),
            path: path.to_path_buf(),
            name: path.file_name().unwrap().to_string_lossy().into_owned(),
            size,
            mime: String::new(),
            cancel,
            progress: Arc::new(|_, _| {}),
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<ReceiveEvent>) -> ReceiveEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for receive event")
            .expect("event stream ended")
    }

    async fn wait_receiver_status(receiver: &Receiver, id: &str, status: ReceiveStatus) {
        for _ in 0..400 {
            if receiver
                .items()
                .iter()
                .any(|item| item.id == id && item.status == status)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer {id} never reached {status:?}: {:?}", receiver.items());
    }

    #[tokio::test]
    async fn upload_streams_file_and_receiver_assembles_it() {
        let (offerer, answerer) = connected_pair().await;
        let receiver = Receiver::new();
        receiver.attach(answerer.take_incoming().unwrap());
        let mut events = receiver.take_events().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (path, bytes) = patterned_file(dir.path(), "photo.bin", 64 * 1024);

        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let mut request = request_for(
            "upload_ab1c2",
            &path,
            bytes.len() as u64,
            CancellationToken::new(),
        );
        request.progress = Arc::new(move |percent, _| sink.lock().unwrap().push(percent));

        send_file_chunked(&offerer, &request, 8 * 1024).await.unwrap();

        let file = loop {
            match next_event(&mut events).await {
                ReceiveEvent::Completed { id, file } => {
                    assert_eq!(id, "upload_ab1c2");
                    break file;
                }
                ReceiveEvent::Added(item) => assert_eq!(item.meta.name, "photo.bin"),
                _ => {}
            }
        };
        assert_eq!(file.bytes, bytes);

        let items = receiver.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ReceiveStatus::Done);
        assert_eq!(items[0].progress, 100);

        let reported = reported.lock().unwrap();
        assert_eq!(*reported.last().unwrap(), 100);
        assert!(reported.windows(2).all(|pair| pair[0] <= pair[1]));

        offerer.cleanup();
        answerer.cleanup();
    }

    #[tokio::test]
    async fn empty_file_completes_with_no_chunks() {
        let (offerer, answerer) = connected_pair().await;
        let receiver = Receiver::new();
        receiver.attach(answerer.take_incoming().unwrap());
        let mut events = receiver.take_events().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (path, _) = patterned_file(dir.path(), "empty.bin", 0);
        let request = request_for("upload_emp00", &path, 0, CancellationToken::new());

        send_file(&offerer, &request).await.unwrap();

        loop {
            if let ReceiveEvent::Completed { file, .. } = next_event(&mut events).await {
                assert!(file.bytes.is_empty());
                break;
            }
        }

        offerer.cleanup();
        answerer.cleanup();
    }

    #[tokio::test]
    async fn pre_cancelled_upload_aborts_and_receiver_discards() {
        let (offerer, answerer) = connected_pair().await;
        let receiver = Receiver::new();
        receiver.attach(answerer.take_incoming().unwrap());
        let mut events = receiver.take_events().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (path, bytes) = patterned_file(dir.path(), "never.bin", 32 * 1024);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = request_for("upload_pc1d3", &path, bytes.len() as u64, cancel);

        let result = send_file(&offerer, &request).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));

        // The receiver sees the declaration, then the retraction.
        let mut saw_added = false;
        loop {
            match next_event(&mut events).await {
                ReceiveEvent::Added(item) => {
                    assert_eq!(item.id, "upload_pc1d3");
                    saw_added = true;
                }
                ReceiveEvent::Removed { id } => {
                    assert_eq!(id, "upload_pc1d3");
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_added);
        assert!(receiver.items().is_empty());

        offerer.cleanup();
        answerer.cleanup();
    }

    #[tokio::test]
    async fn receiver_cancel_replies_cancel_to_sender() {
        let (offerer, answerer) = connected_pair().await;
        let receiver = Receiver::new();
        receiver.attach(answerer.take_incoming().unwrap());
        let mut events = receiver.take_events().unwrap();

        let mut channel = offerer.open_channel("upload_rcv01").await.unwrap();
        let meta = ControlMessage::Meta {
            id: "upload_rcv01".into(),
            meta: FileMeta {
                name: "big.bin".into(),
                size: 4096,
                mime: String::new(),
            },
        };
        channel.send_text(meta.to_json().unwrap()).unwrap();
        channel.send_binary(vec![7u8; 1024]).unwrap();

        loop {
            if matches!(next_event(&mut events).await, ReceiveEvent::Added(_)) {
                break;
            }
        }
        receiver.cancel("upload_rcv01");
        receiver.cancel("upload_rcv01"); // idempotent

        let reply = tokio::time::timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap();
        match reply {
            ChannelMessage::Text(text) => {
                let message = ControlMessage::from_json(&text).unwrap();
                assert_eq!(message, ControlMessage::Cancel {
                    id: "upload_rcv01".into(),
                });
            }
            other => panic!("expected CANCEL reply, got {other:?}"),
        }
        assert!(receiver.items().is_empty());

        offerer.cleanup();
        answerer.cleanup();
    }

    #[tokio::test]
    async fn peer_cancel_maps_to_peer_cancelled() {
        let (offerer, answerer) = connected_pair().await;
        let mut incoming = answerer.take_incoming().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (path, bytes) = patterned_file(dir.path(), "refused.bin", 16 * 1024);
        let request = request_for(
            "upload_ref44",
            &path,
            bytes.len() as u64,
            CancellationToken::new(),
        );

        let sender = tokio::spawn(async move { send_file(&offerer, &request).await });

        let mut channel = incoming.recv().await.unwrap();
        assert_eq!(channel.label(), "upload_ref44");
        // First message is the declaration; refuse the transfer outright.
        loop {
            match channel.recv().await.unwrap() {
                ChannelMessage::Text(text) => {
                    assert!(matches!(
                        ControlMessage::from_json(&text).unwrap(),
                        ControlMessage::Meta { .. }
                    ));
                    break;
                }
                ChannelMessage::Binary(_) => panic!("chunk before META"),
            }
        }
        let refuse = ControlMessage::Cancel {
            id: "upload_ref44".into(),
        };
        channel.send_text(refuse.to_json().unwrap()).unwrap();

        let result = sender.await.unwrap();
        assert!(matches!(result, Err(UploadError::PeerCancelled)));

        answerer.cleanup();
    }

    #[tokio::test]
    async fn channel_close_mid_transfer_marks_error() {
        let (offerer, answerer) = connected_pair().await;
        let receiver = Receiver::new();
        receiver.attach(answerer.take_incoming().unwrap());

        let channel = offerer.open_channel("upload_die55").await.unwrap();
        let meta = ControlMessage::Meta {
            id: "upload_die55".into(),
            meta: FileMeta {
                name: "half.bin".into(),
                size: 2048,
                mime: String::new(),
            },
        };
        channel.send_text(meta.to_json().unwrap()).unwrap();
        channel.send_binary(vec![9u8; 1024]).unwrap();

        wait_receiver_status(&receiver, "upload_die55", ReceiveStatus::Receiving).await;
        channel.close();

        wait_receiver_status(&receiver, "upload_die55", ReceiveStatus::Error).await;

        offerer.cleanup();
        answerer.cleanup();
    }

    #[tokio::test]
    async fn uploader_drives_queue_to_done() {
        let (offerer, answerer) = connected_pair().await;
        let receiver = Receiver::new();
        receiver.attach(answerer.take_incoming().unwrap());
        let mut events = receiver.take_events().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (path, bytes) = patterned_file(dir.path(), "queued.bin", 256 * 1024);

        let uploader = Arc::new(ChannelUploader::with_chunk_size(
            Arc::clone(&offerer),
            16 * 1024,
        ));
        let queue = UploadQueue::new(uploader, QueueConfig::default(), RetryPolicy::default());

        let ids = queue.add_files(&[path], TaskOptions::default()).await;
        assert_eq!(ids.len(), 1);

        for _ in 0..400 {
            if queue
                .items()
                .iter()
                .any(|item| item.id == ids[0] && item.status == UploadStatus::Done)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let item = queue.items().into_iter().next().unwrap();
        assert_eq!(item.status, UploadStatus::Done);
        assert_eq!(item.progress, 100);

        let file = loop {
            if let ReceiveEvent::Completed { file, .. } = next_event(&mut events).await {
                break file;
            }
        };
        assert_eq!(file.bytes, bytes);
        assert_eq!(file.meta.name, "queued.bin");

        offerer.cleanup();
        answerer.cleanup();
    }
}
