//! End-to-end transfer tests: a real Uploader against a real FileServer
//! over loopback TCP, with an in-memory object store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use framesync::codec::{read_frame, write_frame};
use framesync::config::{SenderCfg, ServerCfg};
use framesync::protocol::{Code, InitUpload, Message, Upload, UploadComplete, UploadContinue};
use framesync::receiver::FileServer;
use framesync::retry::RetryPolicy;
use framesync::sender::Uploader;
use framesync::store::{DeviceIdentity, IngestRecord, MemoryStore, StaticDirectory};

struct TestServer {
    addr: String,
    store: Arc<MemoryStore>,
    ingest_rx: mpsc::Receiver<IngestRecord>,
    shutdown: watch::Sender<bool>,
}

async fn start_server() -> TestServer {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(StaticDirectory::permissive(DeviceIdentity {
        owner_id: 7,
        profiles: vec!["cam-0".into()],
    }));
    let (ingest_tx, ingest_rx) = mpsc::channel(64);
    let cfg = ServerCfg {
        addr: "127.0.0.1:0".into(),
        session_timeout: Duration::from_secs(10),
        storage_retry: RetryPolicy::new(2, Duration::from_millis(5), 2),
        ..ServerCfg::default()
    };
    let server = FileServer::bind(cfg, store.clone(), directory, ingest_tx)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.run(shutdown_rx));
    TestServer {
        addr,
        store,
        ingest_rx,
        shutdown,
    }
}

fn sender_cfg(dir: &Path, servers: Vec<String>) -> SenderCfg {
    SenderCfg {
        device_id: "aa:bb:cc:dd:ee:ff".into(),
        target: dir.to_path_buf(),
        backups: servers,
        chunk_size: 1024,
        scan_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        retry_interval: Duration::from_millis(50),
        retries_per_server: 2,
        // keep the test quiet; usage reporting has its own unit tests
        usage_interval: Duration::ZERO,
        ..SenderCfg::default()
    }
}

/// Poll until the store holds `want` objects or the deadline passes.
async fn wait_for_objects(store: &MemoryStore, want: usize, deadline: Duration) {
    let start = tokio::time::Instant::now();
    while store.len() < want {
        assert!(
            start.elapsed() < deadline,
            "timed out: {} of {} objects stored",
            store.len(),
            want
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_file_transfer() {
    let mut server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let content = pattern(10_500);
    let path = dir.path().join("frame-0001.jpg");
    std::fs::write(&path, &content).unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let _uploader = Uploader::start(
        sender_cfg(dir.path(), vec![server.addr.clone()]),
        None,
        shutdown_rx,
    );

    wait_for_objects(&server.store, 1, Duration::from_secs(10)).await;

    let keys = server.store.keys();
    assert_eq!(keys.len(), 1);
    let key = keys[0].strip_prefix("captures/").unwrap();
    assert_eq!(server.store.get("captures", key).unwrap(), content);

    let record = server.ingest_rx.recv().await.unwrap();
    assert_eq!(record.owner_id, 7);
    assert_eq!(record.device_profile, "cam-0");
    assert_eq!(record.bytes, content);

    // The local file leaves the device only after the acknowledged write.
    let start = tokio::time::Instant::now();
    while path.exists() {
        assert!(start.elapsed() < Duration::from_secs(5), "local file kept");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let _ = shutdown.send(true);
    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_files_arrive_intact() {
    let mut server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let mut contents = Vec::new();
    for i in 0..6 {
        let content = pattern(700 * (i + 1) + i);
        std::fs::write(dir.path().join(format!("frame-{:04}.jpg", i)), &content).unwrap();
        contents.push(content);
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let _uploader = Uploader::start(
        sender_cfg(dir.path(), vec![server.addr.clone()]),
        None,
        shutdown_rx,
    );

    wait_for_objects(&server.store, contents.len(), Duration::from_secs(15)).await;

    // Each file lands as exactly one object with its own bytes.
    let mut stored: Vec<Vec<u8>> = Vec::new();
    for _ in 0..contents.len() {
        stored.push(server.ingest_rx.recv().await.unwrap().bytes);
    }
    stored.sort_by_key(|b| b.len());
    contents.sort_by_key(|b| b.len());
    assert_eq!(stored, contents);

    let _ = shutdown.send(true);
    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_file_is_dropped_without_upload() {
    let server = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.jpg");
    std::fs::write(&path, b"").unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let _uploader = Uploader::start(
        sender_cfg(dir.path(), vec![server.addr.clone()]),
        None,
        shutdown_rx,
    );

    let start = tokio::time::Instant::now();
    while path.exists() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "empty file not removed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Nothing to transfer, so nothing may reach the store.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.store.is_empty());

    let _ = shutdown.send(true);
    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dead_server_in_rotation_does_not_lose_files() {
    let server = start_server().await;

    // Reserve an address nobody listens on.
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().to_string()
    };

    let dir = tempfile::tempdir().unwrap();
    let mut contents = Vec::new();
    for i in 0..4 {
        let content = pattern(3_000 + i * 17);
        std::fs::write(dir.path().join(format!("frame-{:04}.jpg", i)), &content).unwrap();
        contents.push(content);
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let _uploader = Uploader::start(
        sender_cfg(dir.path(), vec![dead, server.addr.clone()]),
        None,
        shutdown_rx,
    );

    // Files routed to the dead address are re-queued and eventually land
    // on the live collector.
    wait_for_objects(&server.store, contents.len(), Duration::from_secs(20)).await;

    let _ = shutdown.send(true);
    let _ = server.shutdown.send(true);
}

/// A collector that accepts the upload but has lost its state by the time
/// the first chunk arrives, as after a restart.
async fn start_amnesiac_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                while let Ok(msg) = read_frame(&mut stream).await {
                    let rsp = match msg {
                        Message::InitUpload(req) => {
                            Some(Message::InitUploadResponse(
                                framesync::protocol::InitUploadResponse {
                                    seq: req.seq,
                                    upload_id: 1,
                                    code: Code::Success,
                                },
                            ))
                        }
                        Message::Upload(req) => Some(Message::UploadResponse(
                            framesync::protocol::UploadResponse {
                                upload_id: req.upload_id,
                                index: 0,
                                code: Code::Missing,
                            },
                        )),
                        _ => None,
                    };
                    if let Some(rsp) = rsp {
                        if write_frame(&mut stream, &rsp).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_state_requeues_to_another_server() {
    let server = start_server().await;
    let amnesiac = start_amnesiac_server().await;

    let dir = tempfile::tempdir().unwrap();
    let content = pattern(5_000);
    std::fs::write(dir.path().join("frame-0001.jpg"), &content).unwrap();

    // Round-robin tries the amnesiac collector first; its Missing answer
    // must push the file back through prepare onto the healthy one.
    let (shutdown, shutdown_rx) = watch::channel(false);
    let _uploader = Uploader::start(
        sender_cfg(dir.path(), vec![amnesiac, server.addr.clone()]),
        None,
        shutdown_rx,
    );

    wait_for_objects(&server.store, 1, Duration::from_secs(15)).await;
    let keys = server.store.keys();
    let key = keys[0].strip_prefix("captures/").unwrap();
    assert_eq!(server.store.get("captures", key).unwrap(), content);

    let _ = shutdown.send(true);
    let _ = server.shutdown.send(true);
}

/// A collector that accepts one session, answers the init, then dies on
/// the first chunk: connection dropped and the port left refusing dials.
async fn start_dying_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Ok(msg) = read_frame(&mut stream).await {
            match msg {
                Message::InitUpload(req) => {
                    let rsp = Message::InitUploadResponse(
                        framesync::protocol::InitUploadResponse {
                            seq: req.seq,
                            upload_id: 1,
                            code: Code::Success,
                        },
                    );
                    if write_frame(&mut stream, &rsp).await.is_err() {
                        break;
                    }
                }
                Message::Upload(_) => break,
                _ => {}
            }
        }
        drop(stream);
        drop(listener);
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_retry_does_not_block_other_transfers() {
    let server = start_server().await;
    let dying = start_dying_server().await;

    let dir = tempfile::tempdir().unwrap();
    for i in 0..2 {
        std::fs::write(dir.path().join(format!("frame-{:04}.jpg", i)), pattern(5_000)).unwrap();
    }

    // A long retry schedule against the dead port; the session bound to the
    // healthy collector must finish while the other one is still retrying.
    let cfg = SenderCfg {
        retries_per_server: 50,
        retry_interval: Duration::from_millis(100),
        ..sender_cfg(dir.path(), vec![dying, server.addr.clone()])
    };
    let (shutdown, shutdown_rx) = watch::channel(false);
    let _uploader = Uploader::start(cfg, None, shutdown_rx);

    wait_for_objects(&server.store, 1, Duration::from_secs(3)).await;

    let _ = shutdown.send(true);
    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_after_reconnect() {
    let server = start_server().await;
    let content = pattern(8 * 100);
    let chunks: Vec<&[u8]> = content.chunks(100).collect();

    let init = Message::InitUpload(InitUpload {
        seq: 1,
        content_length: content.len() as u64,
        chunk_count: chunks.len() as u32,
        mod_time: 1_700_000_000,
        source_label: "cam-0".into(),
        device_id: "aa:bb:cc:dd:ee:ff".into(),
    });

    // First connection: init and half the chunks, then hang up.
    let mut conn = TcpStream::connect(&server.addr).await.unwrap();
    write_frame(&mut conn, &init).await.unwrap();
    let upload_id = match read_frame(&mut conn).await.unwrap() {
        Message::InitUploadResponse(rsp) => {
            assert_eq!(rsp.code, Code::Success);
            rsp.upload_id
        }
        other => panic!("unexpected {:?}", other),
    };
    for (i, data) in chunks.iter().take(4).enumerate() {
        write_frame(
            &mut conn,
            &Message::Upload(Upload {
                upload_id,
                index: i as i64,
                data: data.to_vec(),
            }),
        )
        .await
        .unwrap();
        read_frame(&mut conn).await.unwrap();
    }
    drop(conn);

    // Second connection: ask where to resume, then finish.
    let mut conn = TcpStream::connect(&server.addr).await.unwrap();
    write_frame(
        &mut conn,
        &Message::UploadContinue(UploadContinue { upload_id }),
    )
    .await
    .unwrap();
    let resume_at = match read_frame(&mut conn).await.unwrap() {
        Message::UploadResponse(rsp) => {
            assert_eq!(rsp.code, Code::Success);
            assert_eq!(rsp.index, 3);
            rsp.index + 1
        }
        other => panic!("unexpected {:?}", other),
    };
    for (i, data) in chunks.iter().enumerate().skip(resume_at as usize) {
        write_frame(
            &mut conn,
            &Message::Upload(Upload {
                upload_id,
                index: i as i64,
                data: data.to_vec(),
            }),
        )
        .await
        .unwrap();
        read_frame(&mut conn).await.unwrap();
    }
    write_frame(
        &mut conn,
        &Message::UploadComplete(UploadComplete { upload_id }),
    )
    .await
    .unwrap();
    match read_frame(&mut conn).await.unwrap() {
        Message::UploadCompleteResponse(rsp) => assert_eq!(rsp.code, Code::Success),
        other => panic!("unexpected {:?}", other),
    }

    let keys = server.store.keys();
    assert_eq!(keys.len(), 1);
    let key = keys[0].strip_prefix("captures/").unwrap();
    assert_eq!(server.store.get("captures", key).unwrap(), content);

    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_upload_reports_missing() {
    let server = start_server().await;
    let mut conn = TcpStream::connect(&server.addr).await.unwrap();
    write_frame(
        &mut conn,
        &Message::UploadContinue(UploadContinue { upload_id: 999 }),
    )
    .await
    .unwrap();
    match read_frame(&mut conn).await.unwrap() {
        Message::UploadResponse(rsp) => assert_eq!(rsp.code, Code::Missing),
        other => panic!("unexpected {:?}", other),
    }
    let _ = server.shutdown.send(true);
}
