//! End-to-end tests of the download engine against local HTTP servers

mod support;

use rdm_core::engine::TransferStore;
use rdm_core::{DownloadEngine, EngineError, Listeners};
use rdm_types::{
    EngineConfig, EngineEvent, ErrorInfo, ErrorKind, Progress, TransferEvent, TransferStatus,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{payload, serve_raw, RangeServer};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY_LEN: usize = 256 * 1024;

fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: dir.join("data"),
        progress_interval_ms: 10,
        read_timeout_ms: 5_000,
        connect_timeout_ms: 5_000,
        ..EngineConfig::default()
    }
}

fn persistent(dir: &Path) -> EngineConfig {
    EngineConfig {
        database_enabled: true,
        ..config(dir)
    }
}

async fn slow_server() -> RangeServer {
    RangeServer::start(payload(BODY_LEN), 4096, Duration::from_millis(10)).await
}

/// Wait for the next event of `id` accepted by `want`
async fn next_event(
    events: &mut broadcast::Receiver<EngineEvent>,
    id: Uuid,
    want: impl Fn(&TransferEvent) -> bool,
) -> TransferEvent {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let event = events.recv().await.expect("event channel");
            if event.id == id && want(&event.event) {
                return event.event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn started_bytes(events: &mut broadcast::Receiver<EngineEvent>, id: Uuid) {
    next_event(events, id, |e| {
        matches!(e, TransferEvent::Progress(p) if p.current_bytes > 0)
    })
    .await;
}

/// Start a download, let some bytes arrive, then pause it
async fn start_and_pause(
    engine: &DownloadEngine,
    server: &RangeServer,
    dir: &Path,
    events: &mut broadcast::Receiver<EngineEvent>,
) -> Uuid {
    let request = engine
        .download(server.url("data.bin"), dir, "data.bin")
        .build();
    let id = engine.start(request, Listeners::new()).unwrap();

    started_bytes(events, id).await;
    engine.pause(id).unwrap();
    next_event(events, id, |e| *e == TransferEvent::Pause).await;
    id
}

#[tokio::test]
async fn test_download_completes() {
    let server = MockServer::start().await;
    let body = payload(10_000);
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();

    let progress: Arc<Mutex<Vec<Progress>>> = Arc::default();
    let started = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));

    let seen = progress.clone();
    let flag = started.clone();
    let listeners = Listeners::new()
        .on_start_or_resume(move |_| flag.store(true, Ordering::SeqCst))
        .on_progress(move |_, p| seen.lock().unwrap().push(p))
        .on_complete(move |id| {
            if let Some(tx) = done_tx.lock().unwrap().take() {
                let _ = tx.send(id);
            }
        });

    let request = engine
        .download(format!("{}/file.bin", server.uri()), dir.path(), "file.bin")
        .build();
    let id = engine.start(request, listeners).unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(10), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed, id);
    assert!(started.load(Ordering::SeqCst));

    assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), body);
    assert!(!dir.path().join("file.bin.part").exists());

    let progress = progress.lock().unwrap();
    assert!(progress
        .windows(2)
        .all(|w| w[0].current_bytes <= w[1].current_bytes));
    assert_eq!(
        progress.last(),
        Some(&Progress {
            current_bytes: 10_000,
            total_bytes: Some(10_000)
        })
    );
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(persistent(dir.path())).await.unwrap();

    let (error_tx, error_rx) = oneshot::channel::<ErrorInfo>();
    let error_tx = Mutex::new(Some(error_tx));
    let listeners = Listeners::new().on_error(move |_, info| {
        if let Some(tx) = error_tx.lock().unwrap().take() {
            let _ = tx.send(info.clone());
        }
    });

    let request = engine
        .download(format!("{}/gone.bin", server.uri()), dir.path(), "gone.bin")
        .build();
    let id = engine.start(request, listeners).unwrap();

    let info = tokio::time::timeout(Duration::from_secs(10), error_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(info.is_server_error);
    assert!(!info.is_connection_error);
    assert_eq!(info.error_code, Some(404));
    assert_eq!(info.server_error_message.as_deref(), Some("missing"));

    let transfer = engine.transfer(id).unwrap();
    assert_eq!(transfer.status, TransferStatus::Failed);
    assert!(transfer.error.is_some());
    assert!(!dir.path().join("gone.bin").exists());
}

#[tokio::test]
async fn test_custom_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/private.bin"))
        .and(header("X-Token", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(2048)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let request = engine
        .download(format!("{}/private.bin", server.uri()), dir.path(), "private.bin")
        .header("X-Token", "secret")
        .build();
    let id = engine.start(request, Listeners::new()).unwrap();

    let outcome = next_event(&mut events, id, TransferEvent::is_terminal).await;
    assert_eq!(outcome, TransferEvent::Complete);
    assert_eq!(
        std::fs::read(dir.path().join("private.bin")).unwrap(),
        payload(2048)
    );
}

#[tokio::test]
async fn test_pause_and_resume_yield_identical_file() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let id = start_and_pause(&engine, &server, dir.path(), &mut events).await;

    let paused = engine.transfer(id).unwrap();
    assert_eq!(paused.status, TransferStatus::Paused);
    assert!(paused.bytes_downloaded > 0);
    assert!(paused.bytes_downloaded < BODY_LEN as u64);
    let partial = std::fs::metadata(paused.partial_path()).unwrap();
    assert_eq!(partial.len(), paused.bytes_downloaded);

    engine.resume(id).unwrap();
    assert_eq!(
        next_event(&mut events, id, |e| *e == TransferEvent::StartOrResume).await,
        TransferEvent::StartOrResume
    );

    let mut last = None;
    let outcome = loop {
        match next_event(&mut events, id, |_| true).await {
            TransferEvent::Progress(p) => last = Some(p),
            other => break other,
        }
    };
    assert_eq!(outcome, TransferEvent::Complete);
    assert_eq!(last.and_then(|p| p.total_bytes), Some(BODY_LEN as u64));

    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        payload(BODY_LEN)
    );
    assert_eq!(
        server.range_headers().last().cloned().flatten(),
        Some(format!("bytes={}-", paused.bytes_downloaded))
    );
}

#[tokio::test]
async fn test_cancel_removes_partial_file_and_record() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(persistent(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let request = engine
        .download(server.url("data.bin"), dir.path(), "data.bin")
        .build();
    let id = engine.start(request, Listeners::new()).unwrap();
    started_bytes(&mut events, id).await;
    let partial = engine.transfer(id).unwrap().partial_path();

    engine.cancel(id).unwrap();
    next_event(&mut events, id, |e| *e == TransferEvent::Cancel).await;

    assert_eq!(engine.status(id), TransferStatus::Unknown);
    assert!(!partial.exists());
    assert!(!dir.path().join("data.bin").exists());

    engine.flush().await;
    let store = TransferStore::open(engine.config().database_path())
        .await
        .unwrap();
    assert!(store.load(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_paused_transfer() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let id = start_and_pause(&engine, &server, dir.path(), &mut events).await;
    let partial = engine.transfer(id).unwrap().partial_path();
    assert!(partial.exists());

    engine.cancel(id).unwrap();
    next_event(&mut events, id, |e| *e == TransferEvent::Cancel).await;
    assert_eq!(engine.status(id), TransferStatus::Unknown);

    for _ in 0..100 {
        if !partial.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!partial.exists());
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let server = RangeServer::start(payload(64 * 1024), 4096, Duration::from_millis(10)).await;
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        DownloadEngine::new(EngineConfig {
            max_concurrent_downloads: 2,
            ..config(dir.path())
        })
        .await
        .unwrap(),
    );
    let mut events = engine.subscribe();

    let ids: Vec<Uuid> = ["a.bin", "b.bin", "c.bin"]
        .iter()
        .map(|name| {
            let request = engine.download(server.url(name), dir.path(), *name).build();
            engine.start(request, Listeners::new()).unwrap()
        })
        .collect();
    assert_eq!(engine.status(ids[2]), TransferStatus::Queued);

    let peak = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let sampler = {
        let (engine, peak, stop) = (engine.clone(), peak.clone(), stop.clone());
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                let running = engine
                    .transfers()
                    .iter()
                    .filter(|t| t.status.is_active())
                    .count();
                peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    // Completions seen before the third transfer got a slot
    let mut third_started_after = None;
    let mut completed = 0;
    tokio::time::timeout(Duration::from_secs(20), async {
        while completed < ids.len() {
            let event = events.recv().await.unwrap();
            match &event.event {
                TransferEvent::Complete => completed += 1,
                TransferEvent::StartOrResume if event.id == ids[2] => {
                    third_started_after = Some(completed)
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    stop.store(true, Ordering::SeqCst);
    sampler.await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(matches!(third_started_after, Some(n) if n >= 1));
    for name in ["a.bin", "b.bin", "c.bin"] {
        assert_eq!(
            std::fs::read(dir.path().join(name)).unwrap(),
            payload(64 * 1024)
        );
    }
}

#[tokio::test]
async fn test_queued_transfer_pauses_immediately() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(EngineConfig {
        max_concurrent_downloads: 1,
        ..config(dir.path())
    })
    .await
    .unwrap();
    let mut events = engine.subscribe();

    let first = engine
        .start(
            engine.download(server.url("a.bin"), dir.path(), "a.bin").build(),
            Listeners::new(),
        )
        .unwrap();
    let second = engine
        .start(
            engine.download(server.url("b.bin"), dir.path(), "b.bin").build(),
            Listeners::new(),
        )
        .unwrap();
    assert_eq!(engine.status(second), TransferStatus::Queued);

    engine.pause(second).unwrap();
    assert_eq!(engine.status(second), TransferStatus::Paused);
    next_event(&mut events, second, |e| *e == TransferEvent::Pause).await;

    // A paused transfer is not admitted when the slot frees up
    next_event(&mut events, first, |e| *e == TransferEvent::Complete).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.status(second), TransferStatus::Paused);
}

#[tokio::test]
async fn test_invalid_operations_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(1024)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(persistent(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let request = engine
        .download(format!("{}/small.bin", server.uri()), dir.path(), "small.bin")
        .build();
    let id = engine.start(request, Listeners::new()).unwrap();
    next_event(&mut events, id, |e| *e == TransferEvent::Complete).await;

    assert_eq!(engine.status(id), TransferStatus::Completed);
    assert!(matches!(
        engine.pause(id),
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine.resume(id),
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine.cancel(id),
        Err(EngineError::InvalidTransition { .. })
    ));

    let unknown = Uuid::new_v4();
    assert!(matches!(engine.pause(unknown), Err(EngineError::NotFound(_))));
    assert!(matches!(engine.resume(unknown), Err(EngineError::NotFound(_))));
    assert!(matches!(engine.cancel(unknown), Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_duplicate_destination_is_rejected() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();

    let first = engine
        .start(
            engine.download(server.url("a.bin"), dir.path(), "same.bin").build(),
            Listeners::new(),
        )
        .unwrap();
    let again = engine.start(
        engine.download(server.url("b.bin"), dir.path(), "same.bin").build(),
        Listeners::new(),
    );

    assert!(matches!(again, Err(EngineError::AlreadyExists(id)) if id == first));
    assert_eq!(
        engine
            .find(&server.url("a.bin"), dir.path(), "same.bin")
            .map(|t| t.id),
        Some(first)
    );
    engine.cancel(first).unwrap();
}

#[tokio::test]
async fn test_modified_partial_file_restarts_from_zero() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let id = start_and_pause(&engine, &server, dir.path(), &mut events).await;
    std::fs::write(engine.transfer(id).unwrap().partial_path(), b"junk").unwrap();

    engine.resume(id).unwrap();
    let warning = next_event(&mut events, id, |e| {
        matches!(e, TransferEvent::Warning { .. })
    })
    .await;
    assert!(matches!(warning, TransferEvent::Warning { message } if message.contains("restarting from zero")));

    let outcome = next_event(&mut events, id, TransferEvent::is_terminal).await;
    assert_eq!(outcome, TransferEvent::Complete);
    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        payload(BODY_LEN)
    );
    assert_eq!(server.range_headers().last().cloned().flatten(), None);
}

#[tokio::test]
async fn test_server_without_ranges_restarts_from_zero() {
    let server = slow_server().await;
    server.set_ranges(false);
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let id = start_and_pause(&engine, &server, dir.path(), &mut events).await;
    engine.resume(id).unwrap();

    let warning = next_event(&mut events, id, |e| {
        matches!(e, TransferEvent::Warning { .. })
    })
    .await;
    assert!(matches!(warning, TransferEvent::Warning { message } if message.contains("range")));

    let outcome = next_event(&mut events, id, TransferEvent::is_terminal).await;
    assert_eq!(outcome, TransferEvent::Complete);
    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        payload(BODY_LEN)
    );
}

#[tokio::test]
async fn test_paused_transfer_survives_restart() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();

    let (id, bytes) = {
        let engine = DownloadEngine::new(persistent(dir.path())).await.unwrap();
        let mut events = engine.subscribe();
        let id = start_and_pause(&engine, &server, dir.path(), &mut events).await;
        engine.shutdown().await;
        (id, engine.transfer(id).unwrap().bytes_downloaded)
    };

    let engine = DownloadEngine::new(persistent(dir.path())).await.unwrap();
    let resumable = engine.resumable();
    assert_eq!(resumable.len(), 1);
    assert_eq!(resumable[0].id, id);
    assert_eq!(resumable[0].status, TransferStatus::Paused);
    assert_eq!(resumable[0].bytes_downloaded, bytes);

    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));
    engine
        .listen(
            id,
            Listeners::new().on_complete(move |_| {
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }),
        )
        .unwrap();
    engine.resume(id).unwrap();

    tokio::time::timeout(Duration::from_secs(20), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        payload(BODY_LEN)
    );
    assert_eq!(
        server.range_headers().last().cloned().flatten(),
        Some(format!("bytes={}-", bytes))
    );

    // Completed transfers stay on record until cleared
    engine.flush().await;
    let again = DownloadEngine::new(persistent(dir.path())).await.unwrap();
    assert_eq!(again.status(id), TransferStatus::Completed);
    assert!(again.resumable().is_empty());
}

#[tokio::test]
async fn test_clean_up_keeps_completed_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(1024)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(persistent(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let request = engine
        .download(format!("{}/keep.bin", server.uri()), dir.path(), "keep.bin")
        .tag("nightly")
        .build();
    let id = engine.start(request, Listeners::new()).unwrap();
    next_event(&mut events, id, |e| *e == TransferEvent::Complete).await;

    assert_eq!(engine.clean_up(chrono::Duration::zero()).await, 1);
    assert_eq!(engine.status(id), TransferStatus::Unknown);
    assert!(engine.transfers().is_empty());
    assert!(dir.path().join("keep.bin").exists());
}

#[tokio::test]
async fn test_cancel_by_tag() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let tagged: Vec<Uuid> = ["a.bin", "b.bin"]
        .iter()
        .map(|name| {
            let request = engine
                .download(server.url(name), dir.path(), *name)
                .tag("batch")
                .build();
            engine.start(request, Listeners::new()).unwrap()
        })
        .collect();
    let other = engine
        .start(
            engine.download(server.url("c.bin"), dir.path(), "c.bin").build(),
            Listeners::new(),
        )
        .unwrap();

    assert_eq!(engine.cancel_tag("batch"), 2);

    let mut pending: Vec<Uuid> = tagged.clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !pending.is_empty() {
            let event = events.recv().await.unwrap();
            if event.event == TransferEvent::Cancel {
                pending.retain(|id| *id != event.id);
            }
        }
    })
    .await
    .unwrap();
    for id in &tagged {
        assert_eq!(engine.status(*id), TransferStatus::Unknown);
    }
    assert_ne!(engine.status(other), TransferStatus::Unknown);
    engine.cancel(other).unwrap();
}

/// Wait for the error reported for `id`
async fn next_error(events: &mut broadcast::Receiver<EngineEvent>, id: Uuid) -> ErrorInfo {
    match next_event(events, id, TransferEvent::is_terminal).await {
        TransferEvent::Error(info) => info,
        other => panic!("expected an error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connection_refused_is_a_connection_error() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let request = engine
        .download(format!("http://{}/nothing.bin", addr), dir.path(), "nothing.bin")
        .build();
    let id = engine.start(request, Listeners::new()).unwrap();

    let info = next_error(&mut events, id).await;
    assert_eq!(info.kind, ErrorKind::Network);
    assert!(info.is_connection_error);
    assert!(!info.is_server_error);
    assert_eq!(info.error_code, None);
    assert!(!dir.path().join("nothing.bin").exists());
}

#[tokio::test]
async fn test_stalled_body_times_out() {
    let server = RangeServer::start(payload(4096), 1024, Duration::from_millis(500)).await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(EngineConfig {
        read_timeout_ms: 100,
        ..persistent(dir.path())
    })
    .await
    .unwrap();
    let mut events = engine.subscribe();

    let request = engine
        .download(server.url("stalled.bin"), dir.path(), "stalled.bin")
        .build();
    let id = engine.start(request, Listeners::new()).unwrap();

    let info = next_error(&mut events, id).await;
    assert_eq!(info.kind, ErrorKind::Network);
    assert!(info.is_connection_error);

    let transfer = engine.transfer(id).unwrap();
    assert_eq!(transfer.status, TransferStatus::Failed);
    assert_eq!(transfer.error.as_deref(), Some("Timeout"));
}

#[tokio::test]
async fn test_short_body_is_a_length_mismatch() {
    let mut response = b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-99/100\r\nConnection: close\r\n\r\n".to_vec();
    response.extend_from_slice(&payload(40));
    let url = serve_raw(response).await;

    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let id = engine
        .start(
            engine.download(url, dir.path(), "short.bin").build(),
            Listeners::new(),
        )
        .unwrap();

    let info = next_error(&mut events, id).await;
    assert_eq!(info.kind, ErrorKind::Network);
    assert!(info.message.contains("Length mismatch"), "{}", info.message);
    assert!(!info.is_connection_error);
    assert!(!dir.path().join("short.bin").exists());
}

#[tokio::test]
async fn test_resume_at_capacity_queues() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(EngineConfig {
        max_concurrent_downloads: 1,
        ..config(dir.path())
    })
    .await
    .unwrap();
    let mut events = engine.subscribe();

    let first = engine
        .start(
            engine.download(server.url("a.bin"), dir.path(), "a.bin").build(),
            Listeners::new(),
        )
        .unwrap();
    let second = engine
        .start(
            engine.download(server.url("b.bin"), dir.path(), "b.bin").build(),
            Listeners::new(),
        )
        .unwrap();
    engine.pause(second).unwrap();
    assert_eq!(engine.status(second), TransferStatus::Paused);

    engine.resume(second).unwrap();
    assert_eq!(engine.status(second), TransferStatus::Queued);

    // The queued transfer only starts once the running one is done
    let mut first_done = false;
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.id == first && event.event == TransferEvent::Complete {
                first_done = true;
            }
            if event.id == second && event.event == TransferEvent::StartOrResume {
                assert!(first_done);
            }
            if event.id == second && event.event.is_terminal() {
                assert_eq!(event.event, TransferEvent::Complete);
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("b.bin")).unwrap(),
        payload(BODY_LEN)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_right_after_pause() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let request = engine
        .download(server.url("data.bin"), dir.path(), "data.bin")
        .build();
    let id = engine.start(request, Listeners::new()).unwrap();
    started_bytes(&mut events, id).await;

    // Resume as soon as the transfer reports Paused, possibly before its
    // worker has given the slot back
    engine.pause(id).unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match engine.resume(id) {
                Ok(()) => break,
                Err(EngineError::InvalidTransition { .. }) => tokio::task::yield_now().await,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    })
    .await
    .unwrap();

    let outcome = next_event(&mut events, id, TransferEvent::is_terminal).await;
    assert_eq!(outcome, TransferEvent::Complete);
    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        payload(BODY_LEN)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_from_plain_threads() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(DownloadEngine::new(config(dir.path())).await.unwrap());
    let mut events = engine.subscribe();

    let request = engine
        .download(server.url("data.bin"), dir.path(), "data.bin")
        .build();
    let id = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.start(request, Listeners::new()))
            .join()
            .unwrap()
            .unwrap()
    };

    started_bytes(&mut events, id).await;
    {
        let engine = engine.clone();
        std::thread::spawn(move || engine.pause(id)).join().unwrap().unwrap();
    }
    next_event(&mut events, id, |e| *e == TransferEvent::Pause).await;
    let partial = engine.transfer(id).unwrap().partial_path();

    // Cancelling a paused transfer removes its file in the background
    {
        let engine = engine.clone();
        std::thread::spawn(move || engine.cancel(id)).join().unwrap().unwrap();
    }
    next_event(&mut events, id, |e| *e == TransferEvent::Cancel).await;
    for _ in 0..100 {
        if !partial.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!partial.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_starts_claim_destination_once() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(DownloadEngine::new(config(dir.path())).await.unwrap());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            let request = engine
                .download(server.url(&format!("{}.bin", i)), dir.path(), "same.bin")
                .build();
            std::thread::spawn(move || engine.start(request, Listeners::new()))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let started: Vec<Uuid> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(started.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, EngineError::AlreadyExists(id) if *id == started[0])));
    assert_eq!(engine.transfers().len(), 1);
    engine.cancel(started[0]).unwrap();
}

#[tokio::test]
async fn test_longer_partial_file_resumes_from_recorded_offset() {
    let server = slow_server().await;
    let dir = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::new(config(dir.path())).await.unwrap();
    let mut events = engine.subscribe();

    let id = start_and_pause(&engine, &server, dir.path(), &mut events).await;
    let paused = engine.transfer(id).unwrap();

    // Bytes written after the last recorded progress
    let mut partial = std::fs::read(paused.partial_path()).unwrap();
    partial.extend_from_slice(b"unrecorded tail");
    std::fs::write(paused.partial_path(), partial).unwrap();

    engine.resume(id).unwrap();
    let outcome = loop {
        match next_event(&mut events, id, |_| true).await {
            TransferEvent::Warning { message } => panic!("unexpected warning: {}", message),
            event if event.is_terminal() => break event,
            _ => {}
        }
    };
    assert_eq!(outcome, TransferEvent::Complete);
    assert_eq!(
        server.range_headers().last().cloned().flatten(),
        Some(format!("bytes={}-", paused.bytes_downloaded))
    );
    assert_eq!(
        std::fs::read(dir.path().join("data.bin")).unwrap(),
        payload(BODY_LEN)
    );
}
