fn main() {
    println!("Run `cargo test -p e2e` to execute the end-to-end scenarios.");
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use peerbeam_channel::{PeerConnection, Role, SessionDescription};
    use peerbeam_protocol::types::RejectReason;
    use peerbeam_queue::{QueueConfig, RetryPolicy, TaskOptions, UploadQueue, UploadStatus};
    use peerbeam_relay::{RelayConfig, RelayServer};
    use peerbeam_session::{
        PlaintextCipher, RelayClient, RoomSession, SessionEvent, Subscription,
    };
    use peerbeam_transfer::{ChannelUploader, ReceiveEvent, ReceiveStatus, Receiver};

    async fn start_relay() -> (Arc<RelayServer>, String) {
        let server = RelayServer::new(RelayConfig::default());
        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            runner.run().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let port = server.port().await;
        assert!(port > 0);
        (server, format!("ws://127.0.0.1:{port}"))
    }

    async fn connect_session(url: &str) -> Arc<RoomSession> {
        let client = Arc::new(RelayClient::connect(url).await.unwrap());
        RoomSession::new(client, Arc::new(PlaintextCipher))
    }

    /// Receives events until `pred` matches, skipping presence noise.
    async fn wait_for<F>(sub: &mut Subscription<SessionEvent>, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        for _ in 0..32 {
            let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
        panic!("expected event never arrived");
    }

    async fn create_room_ready(
        session: &RoomSession,
        sub: &mut Subscription<SessionEvent>,
    ) -> String {
        let room_id = session.create_room().await.unwrap();
        wait_for(sub, |e| matches!(e, SessionEvent::RoomReady { .. })).await;
        room_id
    }

    async fn establish(
        host: &RoomSession,
        host_sub: &mut Subscription<SessionEvent>,
        guest: &RoomSession,
        guest_sub: &mut Subscription<SessionEvent>,
    ) -> String {
        let room = create_room_ready(host, host_sub).await;
        guest.request_join(&room).await.unwrap();
        wait_for(host_sub, |e| matches!(e, SessionEvent::RequestReceived { .. })).await;
        host.accept_request().await.unwrap();
        wait_for(host_sub, |e| matches!(e, SessionEvent::Established { .. })).await;
        wait_for(guest_sub, |e| matches!(e, SessionEvent::Established { .. })).await;
        room
    }

    /// Negotiates a direct transport between two paired sessions over
    /// the relay's signaling path. Host offers, guest answers.
    async fn negotiate_transport(
        host: &RoomSession,
        host_sub: &mut Subscription<SessionEvent>,
        guest: &RoomSession,
        guest_sub: &mut Subscription<SessionEvent>,
    ) -> (Arc<PeerConnection>, Arc<PeerConnection>) {
        let offerer = PeerConnection::new(Role::Offerer, CancellationToken::new());
        let answerer = PeerConnection::new(Role::Answerer, CancellationToken::new());

        let offer = offerer.create_offer().await.unwrap();
        host.send_offer(serde_json::to_value(&offer).unwrap())
            .await
            .unwrap();

        let payload = match wait_for(guest_sub, |e| {
            matches!(e, SessionEvent::OfferReceived { .. })
        })
        .await
        {
            SessionEvent::OfferReceived { payload, .. } => payload,
            _ => unreachable!(),
        };
        let remote: SessionDescription = serde_json::from_value(payload).unwrap();
        answerer.set_remote_description(remote).unwrap();
        let answer = answerer.create_answer().unwrap();
        guest
            .send_answer(serde_json::to_value(&answer).unwrap())
            .await
            .unwrap();

        let payload = match wait_for(host_sub, |e| {
            matches!(e, SessionEvent::AnswerReceived { .. })
        })
        .await
        {
            SessionEvent::AnswerReceived { payload } => payload,
            _ => unreachable!(),
        };
        let remote: SessionDescription = serde_json::from_value(payload).unwrap();
        offerer.set_remote_description(remote).unwrap();

        for candidate in offerer.local_candidates().unwrap() {
            host.send_candidate(serde_json::to_value(&candidate).unwrap())
                .await
                .unwrap();
        }

        // The guest dials candidates as they arrive.
        loop {
            tokio::select! {
                connected = answerer.wait_connected() => {
                    connected.unwrap();
                    break;
                }
                event = guest_sub.recv() => match event {
                    Some(SessionEvent::CandidateReceived { payload }) => {
                        answerer
                            .add_remote_candidate(serde_json::from_value(payload).unwrap())
                            .unwrap();
                    }
                    Some(_) => {}
                    None => panic!("session event bus closed during negotiation"),
                }
            }
        }
        offerer.wait_connected().await.unwrap();

        (offerer, answerer)
    }

    fn patterned_file(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.join(name);
        std::fs::write(&path, &bytes).unwrap();
        (path, bytes)
    }

    async fn wait_queue_status(queue: &UploadQueue, id: &str, status: UploadStatus) {
        for _ in 0..600 {
            if queue
                .items()
                .iter()
                .any(|item| item.id == id && item.status == status)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status:?}: {:?}", queue.items());
    }

    #[tokio::test]
    async fn scenario_a_pairing_then_ten_megabyte_transfer() {
        let (_server, url) = start_relay().await;
        let host = connect_session(&url).await;
        let guest = connect_session(&url).await;
        let mut host_sub = host.subscribe();
        let mut guest_sub = guest.subscribe();

        establish(&host, &mut host_sub, &guest, &mut guest_sub).await;
        let (offerer, answerer) =
            negotiate_transport(&host, &mut host_sub, &guest, &mut guest_sub).await;

        let receiver = Receiver::new();
        receiver.attach(answerer.take_incoming().unwrap());
        let mut receive_events = receiver.take_events().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let size = 10 * 1024 * 1024;
        let (path, bytes) = patterned_file(dir.path(), "payload.bin", size);

        let uploader = Arc::new(ChannelUploader::new(Arc::clone(&offerer)));
        let queue = UploadQueue::new(uploader, QueueConfig::default(), RetryPolicy::default());
        let ids = queue.add_files(&[path], TaskOptions::default()).await;

        wait_queue_status(&queue, &ids[0], UploadStatus::Done).await;
        let sent = queue.items().into_iter().next().unwrap();
        assert_eq!(sent.progress, 100);

        let file = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), receive_events.recv())
                .await
                .expect("timed out waiting for receive event")
                .expect("receive event stream ended");
            if let ReceiveEvent::Completed { file, .. } = event {
                break file;
            }
        };
        assert_eq!(file.meta.name, "payload.bin");
        assert_eq!(file.meta.size, size as u64);
        assert_eq!(file.bytes.len(), bytes.len());
        assert!(file.bytes == bytes, "assembled bytes differ from source");

        let items = receiver.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ReceiveStatus::Done);
        assert_eq!(items[0].progress, 100);

        offerer.cleanup();
        answerer.cleanup();
    }

    #[tokio::test]
    async fn scenario_b_busy_room_rejects_without_prompting_owner() {
        let (_server, url) = start_relay().await;
        let host = connect_session(&url).await;
        let guest = connect_session(&url).await;
        let mut host_sub = host.subscribe();
        let mut guest_sub = guest.subscribe();

        let room = establish(&host, &mut host_sub, &guest, &mut guest_sub).await;

        let third = connect_session(&url).await;
        let mut third_sub = third.subscribe();
        third.request_join(&room).await.unwrap();

        let rejection = wait_for(&mut third_sub, |e| {
            matches!(e, SessionEvent::Rejected { .. })
        })
        .await;
        match rejection {
            SessionEvent::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::HostBusy);
            }
            _ => unreachable!(),
        }

        // The owner never saw a prompt for the doomed request.
        let prompted = tokio::time::timeout(Duration::from_millis(300), async {
            loop {
                match host_sub.recv().await {
                    Some(SessionEvent::RequestReceived { .. }) => break,
                    Some(_) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        assert!(prompted.is_err(), "owner was prompted for a busy-room request");
    }

    #[tokio::test]
    async fn scenario_c_receiver_cancel_settles_queue_item_cancelled() {
        let (_server, url) = start_relay().await;
        let host = connect_session(&url).await;
        let guest = connect_session(&url).await;
        let mut host_sub = host.subscribe();
        let mut guest_sub = guest.subscribe();

        establish(&host, &mut host_sub, &guest, &mut guest_sub).await;
        let (offerer, answerer) =
            negotiate_transport(&host, &mut host_sub, &guest, &mut guest_sub).await;

        let receiver = Receiver::new();
        receiver.attach(answerer.take_incoming().unwrap());
        let mut receive_events = receiver.take_events().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let (path, _) = patterned_file(dir.path(), "cancelme.bin", 4 * 1024 * 1024);

        // Small chunks keep the transfer in flight long enough to cancel.
        let uploader = Arc::new(ChannelUploader::with_chunk_size(
            Arc::clone(&offerer),
            8 * 1024,
        ));
        let queue = UploadQueue::new(uploader, QueueConfig::default(), RetryPolicy::default());
        let ids = queue.add_files(&[path], TaskOptions::default()).await;

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), receive_events.recv())
                .await
                .expect("timed out waiting for receive event")
                .expect("receive event stream ended");
            if let ReceiveEvent::Added(item) = event {
                assert_eq!(item.id, ids[0]);
                break;
            }
        }
        receiver.cancel(&ids[0]);

        // Peer-initiated cancel settles the item, it is never an error.
        wait_queue_status(&queue, &ids[0], UploadStatus::Cancelled).await;
        assert!(receiver.items().is_empty());

        offerer.cleanup();
        answerer.cleanup();
    }

    #[tokio::test]
    async fn occupancy_never_exceeds_two_parties() {
        let (_server, url) = start_relay().await;
        let host = connect_session(&url).await;
        let mut host_sub = host.subscribe();
        let room = create_room_ready(&host, &mut host_sub).await;

        let first = connect_session(&url).await;
        let mut first_sub = first.subscribe();
        first.request_join(&room).await.unwrap();
        wait_for(&mut host_sub, |e| {
            matches!(e, SessionEvent::RequestReceived { .. })
        })
        .await;

        // A second requester while the first is pending fills the room.
        let second = connect_session(&url).await;
        let mut second_sub = second.subscribe();
        second.request_join(&room).await.unwrap();
        match wait_for(&mut second_sub, |e| {
            matches!(e, SessionEvent::Rejected { .. })
        })
        .await
        {
            SessionEvent::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::RoomFull);
            }
            _ => unreachable!(),
        }

        host.accept_request().await.unwrap();
        wait_for(&mut first_sub, |e| matches!(e, SessionEvent::Established { .. })).await;

        // And once established, any further request bounces as busy.
        let third = connect_session(&url).await;
        let mut third_sub = third.subscribe();
        third.request_join(&room).await.unwrap();
        match wait_for(&mut third_sub, |e| {
            matches!(e, SessionEvent::Rejected { .. })
        })
        .await
        {
            SessionEvent::Rejected { reason, .. } => {
                assert_eq!(reason, RejectReason::HostBusy);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn presence_flows_to_group_members() {
        let (_server, url) = start_relay().await;
        let first = connect_session(&url).await;
        let mut first_sub = first.subscribe();
        create_room_ready(&first, &mut first_sub).await;

        // A second host on the same network appears in the first's view.
        let second = connect_session(&url).await;
        let mut second_sub = second.subscribe();
        create_room_ready(&second, &mut second_sub).await;

        let joined = wait_for(&mut first_sub, |e| {
            matches!(e, SessionEvent::NetworkJoined { .. })
        })
        .await;
        let client_id = match joined {
            SessionEvent::NetworkJoined { client } => client.id,
            _ => unreachable!(),
        };
        assert!(first.peers().iter().any(|peer| peer.id == client_id));

        // The second host's own snapshot lists the first.
        wait_for(&mut second_sub, |e| {
            matches!(e, SessionEvent::NetworkSnapshot { clients } if !clients.is_empty())
        })
        .await;

        // Leaving propagates.
        second.close();
        drop(second);
        let left = wait_for(&mut first_sub, |e| {
            matches!(e, SessionEvent::NetworkLeft { .. })
        })
        .await;
        match left {
            SessionEvent::NetworkLeft { client_id: gone } => assert_eq!(gone, client_id),
            _ => unreachable!(),
        }
        assert!(first.peers().iter().all(|peer| peer.id != client_id));
    }
}
