//! End-to-end orchestration scenarios against mock collaborators: the
//! HTTP layer, the link resolver and the external engine are all
//! scripted, so every path through resolve → rank → supervise → verify
//! runs without a network.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use grabbox_core::net::{BoxStream, HttpClient};
use grabbox_core::{
    Aria2Api, Aria2Status, BackoffPolicy, CancelKind, CoreError, EnginePreference, FileEntry,
    LinkResolver, Mirror, MirrorSet, Orchestrator, OrchestratorConfig, StallPolicy, TaskEvent,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::broadcast;

#[derive(Debug)]
struct MockErr(String);

impl std::fmt::Display for MockErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MockErr {}

#[derive(Clone)]
enum Route {
    /// Serve the body, honoring `Range: bytes=N-`.
    Body(Vec<u8>),
    /// First request: serve `cut_at` bytes, then a mid-stream error.
    /// Every later request serves the (range-aware) body cleanly.
    DisconnectOnce { body: Vec<u8>, cut_at: usize },
    /// Serve a prefix, then never produce another chunk.
    Hang { first: Vec<u8> },
    /// Refuse every request.
    Dead,
}

struct MockHttp {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl MockHttp {
    fn new(routes: &[(&str, Route)]) -> Self {
        Self {
            routes: Mutex::new(
                routes
                    .iter()
                    .map(|(url, r)| (url.to_string(), r.clone()))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests_for(&self, url: &str) -> Vec<Vec<(String, String)>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, h)| h.clone())
            .collect()
    }

    fn range_start(headers: &[(String, String)]) -> usize {
        headers
            .iter()
            .find(|(k, _)| k == "Range")
            .and_then(|(_, v)| v.strip_prefix("bytes="))
            .and_then(|v| v.strip_suffix("-"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn chunked(data: &[u8]) -> Vec<Result<Bytes, MockErr>> {
        data.chunks(4 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }
}

impl HttpClient for MockHttp {
    type Error = MockErr;

    async fn stream(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<BoxStream<'static, Result<Bytes, Self::Error>>, Self::Error> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), headers.to_vec()));

        let route = {
            let routes = self.routes.lock().unwrap();
            routes.get(url).cloned()
        };
        let start = Self::range_start(headers);

        match route {
            None | Some(Route::Dead) => Err(MockErr(format!("connection refused: {url}"))),
            Some(Route::Body(body)) => {
                let items = Self::chunked(&body[start.min(body.len())..]);
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
            Some(Route::DisconnectOnce { body, cut_at }) => {
                // Downgrade the route so the retry sees a clean server.
                self.routes
                    .lock()
                    .unwrap()
                    .insert(url.to_string(), Route::Body(body.clone()));

                let served = &body[start.min(body.len())..cut_at.min(body.len())];
                let mut items = Self::chunked(served);
                items.push(Err(MockErr("connection reset by peer".to_string())));
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
            Some(Route::Hang { first }) => {
                let head = futures_util::stream::iter(Self::chunked(&first));
                let tail = futures_util::stream::pending();
                Ok(Box::pin(futures_util::stream::StreamExt::chain(head, tail)))
            }
        }
    }
}

struct MockResolver {
    sets: HashMap<String, MirrorSet>,
    fail_ids: Vec<String>,
}

impl MockResolver {
    fn single(id: &str, url: &str) -> Self {
        Self::with_mirrors(id, &[("primary", url)])
    }

    fn with_mirrors(id: &str, mirrors: &[(&str, &str)]) -> Self {
        let set = MirrorSet {
            mirrors: mirrors
                .iter()
                .map(|(label, url)| Mirror {
                    label: label.to_string(),
                    url: url.to_string(),
                })
                .collect(),
            cookie: Some("ndus=test-cookie".to_string()),
        };
        Self {
            sets: HashMap::from([(id.to_string(), set)]),
            fail_ids: Vec::new(),
        }
    }

    fn add(mut self, id: &str, url: &str) -> Self {
        let set = MirrorSet {
            mirrors: vec![Mirror {
                label: "primary".to_string(),
                url: url.to_string(),
            }],
            cookie: None,
        };
        self.sets.insert(id.to_string(), set);
        self
    }

    fn failing_for(mut self, id: &str) -> Self {
        self.fail_ids.push(id.to_string());
        self
    }
}

impl LinkResolver for MockResolver {
    async fn resolve(&self, entry: &FileEntry) -> grabbox_resolve::Result<MirrorSet> {
        if self.fail_ids.contains(&entry.id) {
            return Err(grabbox_resolve::ResolveError::Status(
                "share expired".to_string(),
            ));
        }
        self.sets
            .get(&entry.id)
            .cloned()
            .ok_or_else(|| grabbox_resolve::ResolveError::UnknownFile(entry.id.clone()))
    }
}

/// External engine that is never reachable; used when the test wants
/// the direct backend.
struct UnavailableAria2;

impl Aria2Api for UnavailableAria2 {
    async fn add_uri(&self, _uris: Vec<String>, _options: Value) -> grabbox_core::Result<String> {
        Err(CoreError::Network("engine offline".to_string()))
    }

    async fn tell_status(&self, _gid: &str) -> grabbox_core::Result<Aria2Status> {
        Err(CoreError::Network("engine offline".to_string()))
    }

    async fn remove(&self, _gid: &str) -> grabbox_core::Result<()> {
        Err(CoreError::Network("engine offline".to_string()))
    }

    async fn get_version(&self) -> grabbox_core::Result<String> {
        Err(CoreError::EngineUnavailable(
            "connection refused".to_string(),
        ))
    }
}

/// External engine whose every download freezes at a constant offset.
#[derive(Default)]
struct FrozenAria2 {
    added_options: Mutex<Vec<Value>>,
    removed: Mutex<Vec<String>>,
}

impl Aria2Api for FrozenAria2 {
    async fn add_uri(&self, _uris: Vec<String>, options: Value) -> grabbox_core::Result<String> {
        let mut added = self.added_options.lock().unwrap();
        added.push(options);
        Ok(format!("gid-{}", added.len()))
    }

    async fn tell_status(&self, _gid: &str) -> grabbox_core::Result<Aria2Status> {
        Ok(Aria2Status {
            status: "active".to_string(),
            completed_length: 4_096,
            total_length: 1_000_000,
            download_speed: 0,
            ..Aria2Status::default()
        })
    }

    async fn remove(&self, gid: &str) -> grabbox_core::Result<()> {
        self.removed.lock().unwrap().push(gid.to_string());
        Ok(())
    }

    async fn get_version(&self) -> grabbox_core::Result<String> {
        Ok("1.37.0".to_string())
    }
}

fn fast_config(dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        download_dir: dir.to_path_buf(),
        engine: EnginePreference::Direct,
        parallel_tasks: 1,
        stall: StallPolicy {
            threshold: Duration::from_millis(150),
            max_restarts: 3,
        },
        backoff: BackoffPolicy {
            base: Duration::from_millis(2),
            factor: 1.5,
            cap: Duration::from_millis(10),
            jitter: 0.1,
        },
        poll_interval: Duration::from_millis(10),
        probe_sample_size: 1_024,
        probe_timeout: Duration::from_millis(500),
        ..OrchestratorConfig::default()
    }
}

fn entry(id: &str, name: &str, size: u64) -> FileEntry {
    FileEntry {
        id: id.to_string(),
        name: name.to_string(),
        size,
        display_path: name.to_string(),
    }
}

async fn wait_terminal(rx: &mut broadcast::Receiver<TaskEvent>, id: &str) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let matches = match &event {
                        TaskEvent::Completed { task_id }
                        | TaskEvent::Cancelled { task_id }
                        | TaskEvent::Failed { task_id, .. } => task_id == id,
                        TaskEvent::Progress(_) => false,
                    };
                    if matches {
                        return event;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("task did not reach a terminal state in time")
}

#[tokio::test]
async fn exact_size_transfer_completes() {
    let dir = TempDir::new().unwrap();
    let body: Vec<u8> = (0..1_000_000u32).map(|i| (i % 247) as u8).collect();
    let http = MockHttp::new(&[("http://m1/file", Route::Body(body.clone()))]);
    let resolver = MockResolver::single("f1", "http://m1/file");

    let orch = Orchestrator::new(fast_config(dir.path()), http, UnavailableAria2, resolver).await;
    let mut rx = orch.subscribe();

    let id = orch.submit(entry("f1", "big.bin", 1_000_000)).unwrap();
    let event = wait_terminal(&mut rx, &id).await;

    assert!(matches!(event, TaskEvent::Completed { .. }), "{event:?}");
    let written = tokio::fs::read(dir.path().join("big.bin")).await.unwrap();
    assert_eq!(written.len(), 1_000_000);
    assert_eq!(written, body);
    assert!(orch.list_active().is_empty());
}

#[tokio::test]
async fn disconnect_resumes_from_the_partial_offset() {
    let dir = TempDir::new().unwrap();
    let body: Vec<u8> = (0..500_000u32).map(|i| (i % 249) as u8).collect();
    let http = Arc::new(MockHttp::new(&[(
        "http://m1/file",
        Route::DisconnectOnce {
            body: body.clone(),
            cut_at: 200_000,
        },
    )]));
    let resolver = MockResolver::single("f1", "http://m1/file");

    let orch = Orchestrator::new(
        fast_config(dir.path()),
        Arc::clone(&http),
        UnavailableAria2,
        resolver,
    )
    .await;
    let mut rx = orch.subscribe();

    let id = orch.submit(entry("f1", "resume.bin", 500_000)).unwrap();
    let event = wait_terminal(&mut rx, &id).await;
    assert!(matches!(event, TaskEvent::Completed { .. }), "{event:?}");

    let requests = http.requests_for("http://m1/file");
    assert_eq!(requests.len(), 2);
    // The retry asked only for the missing suffix; bytes [0, 200000)
    // were never re-requested.
    assert!(
        requests[1]
            .iter()
            .any(|(k, v)| k == "Range" && v == "bytes=200000-"),
        "second request headers: {:?}",
        requests[1]
    );

    let written = tokio::fs::read(dir.path().join("resume.bin")).await.unwrap();
    assert_eq!(written, body);
}

#[tokio::test]
async fn speed_test_picks_the_live_mirror() {
    let dir = TempDir::new().unwrap();
    let body = vec![3u8; 64_000];
    let http = Arc::new(MockHttp::new(&[
        ("http://fast/file", Route::Body(body.clone())),
        ("http://dead-a/file", Route::Dead),
        ("http://dead-b/file", Route::Dead),
    ]));
    let resolver = MockResolver::with_mirrors(
        "f1",
        &[
            ("cdn-a", "http://dead-a/file"),
            ("cdn-b", "http://fast/file"),
            ("cdn-c", "http://dead-b/file"),
        ],
    );

    let mut config = fast_config(dir.path());
    config.speed_test = true;
    let orch = Orchestrator::new(config, Arc::clone(&http), UnavailableAria2, resolver).await;
    let mut rx = orch.subscribe();

    let id = orch.submit(entry("f1", "picked.bin", 64_000)).unwrap();
    let event = wait_terminal(&mut rx, &id).await;
    assert!(matches!(event, TaskEvent::Completed { .. }), "{event:?}");

    // One probe plus the real transfer hit the fast mirror; the dead
    // ones saw only probes.
    assert!(http.requests_for("http://fast/file").len() >= 2);
    assert_eq!(tokio::fs::read(dir.path().join("picked.bin")).await.unwrap(), body);
}

#[tokio::test]
async fn preferred_label_skips_the_speed_test() {
    let dir = TempDir::new().unwrap();
    let body = vec![8u8; 10_000];
    let http = Arc::new(MockHttp::new(&[("http://direct-class/file", Route::Body(body.clone()))]));
    let resolver = MockResolver::with_mirrors(
        "f1",
        &[
            ("cdn", "http://never-touched/file"),
            ("direct", "http://direct-class/file"),
        ],
    );

    let mut config = fast_config(dir.path());
    config.speed_test = true;
    config.preferred_mirror_label = Some("direct".to_string());
    let orch = Orchestrator::new(config, Arc::clone(&http), UnavailableAria2, resolver).await;
    let mut rx = orch.subscribe();

    let id = orch.submit(entry("f1", "preferred.bin", 10_000)).unwrap();
    let event = wait_terminal(&mut rx, &id).await;
    assert!(matches!(event, TaskEvent::Completed { .. }), "{event:?}");

    assert!(http.requests_for("http://never-touched/file").is_empty());
}

#[tokio::test]
async fn frozen_external_engine_escalates_then_fails() {
    let dir = TempDir::new().unwrap();
    let http = MockHttp::new(&[]);
    let resolver = MockResolver::single("f1", "http://m1/file");
    let aria2 = Arc::new(FrozenAria2::default());

    let mut config = fast_config(dir.path());
    config.engine = EnginePreference::External;
    let orch = Orchestrator::new(config, http, Arc::clone(&aria2), resolver).await;
    assert!(orch.uses_external_engine());
    let mut rx = orch.subscribe();

    let id = orch.submit(entry("f1", "stuck.bin", 1_000_000)).unwrap();
    let event = wait_terminal(&mut rx, &id).await;

    match event {
        TaskEvent::Failed { reason, .. } => {
            assert!(reason.contains("stalled"), "reason: {reason}")
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // Initial session plus three escalated restarts, each one more
    // conservative than the last.
    let added = aria2.added_options.lock().unwrap();
    assert_eq!(added.len(), 4);
    let first_split: u32 = added[0]["split"].as_str().unwrap().parse().unwrap();
    let second_split: u32 = added[1]["split"].as_str().unwrap().parse().unwrap();
    assert!(second_split < first_split);
    assert_eq!(added[1]["stream-piece-selector"], "random");
    // Every frozen session's gid was released.
    assert_eq!(aria2.removed.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn user_abort_removes_the_partial_file() {
    let dir = TempDir::new().unwrap();
    let http = MockHttp::new(&[(
        "http://m1/file",
        Route::Hang {
            first: vec![1u8; 32_000],
        },
    )]);
    let resolver = MockResolver::single("f1", "http://m1/file");

    let orch = Orchestrator::new(fast_config(dir.path()), http, UnavailableAria2, resolver).await;
    let mut rx = orch.subscribe();

    let id = orch.submit(entry("f1", "aborted.bin", 1_000_000)).unwrap();

    // Let the first bytes land, then abort.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(orch.cancel(&id, CancelKind::UserAbort));

    let event = wait_terminal(&mut rx, &id).await;
    assert!(matches!(event, TaskEvent::Cancelled { .. }), "{event:?}");
    assert!(!dir.path().join("aborted.bin.part").exists());
    assert!(!dir.path().join("aborted.bin").exists());
}

#[tokio::test]
async fn shutdown_keeps_the_partial_file() {
    let dir = TempDir::new().unwrap();
    let http = MockHttp::new(&[(
        "http://m1/file",
        Route::Hang {
            first: vec![1u8; 32_000],
        },
    )]);
    let resolver = MockResolver::single("f1", "http://m1/file");

    let orch = Orchestrator::new(fast_config(dir.path()), http, UnavailableAria2, resolver).await;
    let mut rx = orch.subscribe();

    let id = orch.submit(entry("f1", "kept.bin", 1_000_000)).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !dir.path().join("kept.bin.part").exists() {
        assert!(tokio::time::Instant::now() < deadline, "no partial appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    orch.cancel_all(CancelKind::Shutdown);

    let event = wait_terminal(&mut rx, &id).await;
    assert!(matches!(event, TaskEvent::Cancelled { .. }), "{event:?}");
    assert!(dir.path().join("kept.bin.part").exists());
}

#[tokio::test]
async fn one_failure_does_not_block_the_queue() {
    let dir = TempDir::new().unwrap();
    let body = vec![2u8; 5_000];
    let http = MockHttp::new(&[("http://m2/file", Route::Body(body.clone()))]);
    let resolver = MockResolver::single("bad", "http://m1/file")
        .add("good", "http://m2/file")
        .failing_for("bad");

    let orch = Orchestrator::new(fast_config(dir.path()), http, UnavailableAria2, resolver).await;
    let mut rx = orch.subscribe();

    let bad = orch.submit(entry("bad", "bad.bin", 5_000)).unwrap();
    let good = orch.submit(entry("good", "good.bin", 5_000)).unwrap();

    let first = wait_terminal(&mut rx, &bad).await;
    match first {
        TaskEvent::Failed { reason, .. } => assert!(reason.contains("share expired")),
        other => panic!("expected resolution failure, got {other:?}"),
    }

    let second = wait_terminal(&mut rx, &good).await;
    assert!(matches!(second, TaskEvent::Completed { .. }), "{second:?}");
    assert_eq!(tokio::fs::read(dir.path().join("good.bin")).await.unwrap(), body);
}

#[tokio::test]
async fn destination_collisions_are_rejected_at_submit() {
    let dir = TempDir::new().unwrap();
    let http = MockHttp::new(&[(
        "http://m1/file",
        Route::Hang {
            first: Vec::new(),
        },
    )]);
    let resolver = MockResolver::single("f1", "http://m1/file");

    let orch = Orchestrator::new(fast_config(dir.path()), http, UnavailableAria2, resolver).await;

    orch.submit(entry("f1", "same.bin", 10)).unwrap();
    let err = orch.submit(entry("f2", "same.bin", 10)).unwrap_err();
    assert!(matches!(err, CoreError::DestinationCollision(_)));

    orch.cancel_all(CancelKind::Shutdown);
}

#[tokio::test]
async fn completion_claim_without_a_file_fails_verification() {
    // The external engine reports instant completion but never wrote
    // the file; verification must veto the completed state.
    struct LyingAria2;

    impl Aria2Api for LyingAria2 {
        async fn add_uri(&self, _uris: Vec<String>, _options: Value) -> grabbox_core::Result<String> {
            Ok("gid-1".to_string())
        }

        async fn tell_status(&self, _gid: &str) -> grabbox_core::Result<Aria2Status> {
            Ok(Aria2Status {
                status: "complete".to_string(),
                completed_length: 1_000,
                total_length: 1_000,
                ..Aria2Status::default()
            })
        }

        async fn remove(&self, _gid: &str) -> grabbox_core::Result<()> {
            Ok(())
        }

        async fn get_version(&self) -> grabbox_core::Result<String> {
            Ok("1.37.0".to_string())
        }
    }

    let dir = TempDir::new().unwrap();
    let http = MockHttp::new(&[]);
    let resolver = MockResolver::single("f1", "http://m1/file");

    let mut config = fast_config(dir.path());
    config.engine = EnginePreference::External;
    let orch = Orchestrator::new(config, http, LyingAria2, resolver).await;
    let mut rx = orch.subscribe();

    let id = orch.submit(entry("f1", "ghost.bin", 1_000)).unwrap();
    let event = wait_terminal(&mut rx, &id).await;
    assert!(matches!(event, TaskEvent::Failed { .. }), "{event:?}");
    assert!(!dir.path().join("ghost.bin").exists());
}

#[tokio::test]
async fn progress_events_are_monotone_per_task() {
    let dir = TempDir::new().unwrap();
    let body: Vec<u8> = vec![0u8; 400_000];
    let http = MockHttp::new(&[("http://m1/file", Route::Body(body))]);
    let resolver = MockResolver::single("f1", "http://m1/file");

    let orch = Orchestrator::new(fast_config(dir.path()), http, UnavailableAria2, resolver).await;
    let mut rx = orch.subscribe();

    let id = orch.submit(entry("f1", "mono.bin", 400_000)).unwrap();

    let mut bytes_seen = Vec::new();
    loop {
        match rx.recv().await.unwrap() {
            TaskEvent::Progress(p) if p.task_id == id => {
                assert!(p.bytes_transferred <= p.total_bytes);
                bytes_seen.push(p.bytes_transferred);
            }
            TaskEvent::Completed { task_id } if task_id == id => break,
            TaskEvent::Failed { reason, .. } => panic!("unexpected failure: {reason}"),
            _ => {}
        }
    }

    for pair in bytes_seen.windows(2) {
        assert!(pair[1] >= pair[0], "events went backwards: {bytes_seen:?}");
    }
}
