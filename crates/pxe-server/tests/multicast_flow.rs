//! Multicast session driven through the UDP control channel.

use imaging_store::{ImageRecord, InMemoryStore, ParticipantStatus, SessionStatus};
use pxe_server::multicast::{
    ControlServer, MulticastEngine, MulticastEvent, MulticastOptions, RecordingSink, SessionId, StartRequest,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const CHUNK: usize = 1024;
const CHUNKS: usize = 8;

struct Harness {
    _images: tempfile::TempDir,
    store: InMemoryStore,
    sink: RecordingSink,
    engine: Arc<MulticastEngine>,
    control: SocketAddr,
    image: Vec<u8>,
    task: tokio::task::JoinHandle<()>,
}

async fn harness(throttle: Duration) -> Harness {
    let images = tempfile::tempdir().unwrap();
    let image: Vec<u8> = (0..CHUNK * CHUNKS).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(images.path().join("debian.img"), &image).unwrap();

    let store = InMemoryStore::new();
    store.add_image(ImageRecord {
        id: "debian".to_string(),
        filename: "debian.img".to_string(),
        size: 0,
    });
    let sink = RecordingSink::new();
    let options = MulticastOptions {
        images_dir: images.path().to_path_buf(),
        chunk_size: CHUNK,
        throttle,
        ..MulticastOptions::default()
    };
    let engine = Arc::new(MulticastEngine::new(
        options,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
    ));

    let server = ControlServer::new(Arc::clone(&engine), 9000);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let control = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = server.serve(socket).await;
    });

    Harness {
        _images: images,
        store,
        sink,
        engine,
        control,
        image,
        task,
    }
}

async fn wait_for<F>(engine: &MulticastEngine, id: &SessionId, mut done: F)
where
    F: FnMut(&pxe_server::multicast::SessionSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(snapshot) = engine.session(id).await {
                if done(&snapshot) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_clients_join_over_udp_and_receive_image() {
    let h = harness(Duration::ZERO).await;
    let id = SessionId::from("lab-rollout");
    let mut events = h.engine.subscribe();
    h.engine.prepare_session(id.clone(), None, None).await.unwrap();

    let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client_a
        .send_to(br#"{"type":"join","sessionId":"lab-rollout","clientId":"a","deviceId":"node-a"}"#, h.control)
        .await
        .unwrap();
    client_b
        .send_to(br#"{"type":"join","sessionId":"lab-rollout","clientId":"b","deviceId":"node-b"}"#, h.control)
        .await
        .unwrap();
    wait_for(&h.engine, &id, |s| s.clients.len() == 2).await;

    h.engine
        .start_session(StartRequest {
            session_id: id.clone(),
            image_id: "debian".to_string(),
            multicast_address: None,
            port: None,
        })
        .await
        .unwrap();
    let transmission = h.engine.begin_transmission(&id).await.unwrap();
    transmission.await.unwrap();

    let snapshot = h.engine.session(&id).await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Completed);
    assert_eq!(snapshot.total_chunks as usize, CHUNKS);
    assert_eq!(snapshot.bytes_sent as usize, h.image.len());
    assert!(snapshot.clients.iter().all(|c| c.status == ParticipantStatus::Completed));

    let packets = h.sink.data_packets();
    assert_eq!(packets.len(), CHUNKS);
    assert!(packets.iter().all(|p| p.verify()));
    let reassembled: Vec<u8> = packets.iter().flat_map(|p| p.payload.clone()).collect();
    assert_eq!(reassembled, h.image);

    let participants = h.store.participants("lab-rollout");
    assert_eq!(participants.len(), 2);
    assert_eq!(participants[0].device_id, "node-a");

    let mut joined = 0;
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            MulticastEvent::ClientJoined { .. } => joined += 1,
            MulticastEvent::SessionCompleted { .. } => completed = true,
            _ => {}
        }
    }
    assert_eq!(joined, 2);
    assert!(completed);
    h.task.abort();
}

#[tokio::test]
async fn test_nack_over_udp_repairs_chunk() {
    let h = harness(Duration::from_millis(100)).await;
    let id = SessionId::from("repair");
    h.engine.prepare_session(id.clone(), None, None).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(br#"{"type":"join","sessionId":"repair","clientId":"c1"}"#, h.control)
        .await
        .unwrap();
    wait_for(&h.engine, &id, |s| s.clients.len() == 1).await;

    h.engine
        .start_session(StartRequest {
            session_id: id.clone(),
            image_id: "debian".to_string(),
            multicast_address: None,
            port: None,
        })
        .await
        .unwrap();
    let transmission = h.engine.begin_transmission(&id).await.unwrap();

    client
        .send_to(br#"{"type":"nack","sessionId":"repair","clientId":"c1","chunkIndex":0}"#, h.control)
        .await
        .unwrap();
    client
        .send_to(br#"{"type":"ack","sessionId":"repair","clientId":"c1","chunkIndex":0}"#, h.control)
        .await
        .unwrap();
    wait_for(&h.engine, &id, |s| s.clients[0].acked_chunks == 1).await;

    transmission.await.unwrap();
    let repaired = h.sink.data_packets().iter().filter(|p| p.chunk_index == 0).count();
    assert_eq!(repaired, 2);
    assert_eq!(
        h.engine.session(&id).await.unwrap().status,
        SessionStatus::Completed
    );
    h.task.abort();
}
