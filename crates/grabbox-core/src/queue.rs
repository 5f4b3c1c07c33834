//! Task queue and worker.
//!
//! The orchestrator owns the full pipeline: resolve mirrors, optionally
//! rank them, drive the chosen engine under supervision, verify, emit
//! terminal events. All shared state (engine backend, HTTP client,
//! configuration, event channel) lives in one injected context value,
//! so independent orchestrator instances can run side by side.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use grabbox_resolve::{FileEntry, LinkResolver};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::{info, warn};

use crate::config::{EnginePreference, OrchestratorConfig};
use crate::engine::{Aria2Api, Aria2Engine, DirectEngine, EngineBackend};
use crate::error::{CoreError, Result};
use crate::mirror;
use crate::net::HttpClient;
use crate::progress::{ProgressAggregator, TaskEvent, TaskTracker};
use crate::supervisor::Supervisor;
use crate::task::{CancelFlag, CancelKind, DownloadTask, TaskId, TaskState};
use crate::verify::verify;

/// Download orchestrator: the task-control boundary.
///
/// Cloneable handle; all clones share one queue and one worker.
pub struct Orchestrator<C, A, R>
where
    C: HttpClient + 'static,
    A: Aria2Api + 'static,
    R: LinkResolver + 'static,
{
    inner: Arc<Inner<C, A, R>>,
}

impl<C, A, R> Clone for Orchestrator<C, A, R>
where
    C: HttpClient + 'static,
    A: Aria2Api + 'static,
    R: LinkResolver + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C, A, R>
where
    C: HttpClient + 'static,
    A: Aria2Api + 'static,
    R: LinkResolver + 'static,
{
    config: OrchestratorConfig,
    client: Arc<C>,
    engine: EngineBackend<C, A>,
    resolver: R,
    aggregator: ProgressAggregator,
    supervisor: Supervisor,
    queue_tx: mpsc::UnboundedSender<QueuedTask>,
    active: Mutex<HashMap<TaskId, ActiveEntry>>,
}

struct ActiveEntry {
    cancel: Arc<CancelFlag>,
    destination: PathBuf,
}

struct QueuedTask {
    task: DownloadTask,
    entry: FileEntry,
    cancel: Arc<CancelFlag>,
}

impl<C, A, R> Orchestrator<C, A, R>
where
    C: HttpClient + 'static,
    A: Aria2Api + Send + Sync + 'static,
    R: LinkResolver + 'static,
{
    /// Build the orchestrator and start its worker.
    ///
    /// With `Auto` or `External` preference the external engine is
    /// probed once; if its control channel is unreachable the direct
    /// engine takes over for the process lifetime, with a warning but
    /// no task failure.
    pub async fn new(config: OrchestratorConfig, client: C, api: A, resolver: R) -> Self {
        let client = Arc::new(client);

        let engine = match config.engine {
            EnginePreference::Direct => EngineBackend::Direct(DirectEngine::new(Arc::clone(&client))),
            EnginePreference::Auto | EnginePreference::External => {
                match api.get_version().await {
                    Ok(version) => {
                        info!(version, "external engine available");
                        EngineBackend::External(Aria2Engine::new(api, config.user_agent.clone()))
                    }
                    Err(e) => {
                        warn!(error = %e, "external engine unavailable, using direct engine");
                        EngineBackend::Direct(DirectEngine::new(Arc::clone(&client)))
                    }
                }
            }
        };

        // The external engine enforces a single active transfer; the
        // direct engine runs independent files in a bounded pool.
        let permits = if engine.is_external() {
            1
        } else {
            config.parallel_tasks.max(1)
        };

        let supervisor = Supervisor::new(
            config.stall.clone(),
            config.backoff.clone(),
            config.escalation(),
        )
        .with_poll_interval(config.poll_interval);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            client,
            engine,
            resolver,
            aggregator: ProgressAggregator::new(256),
            supervisor,
            queue_tx,
            active: Mutex::new(HashMap::new()),
        });

        tokio::spawn(worker_loop(
            Arc::clone(&inner),
            queue_rx,
            Arc::new(Semaphore::new(permits)),
        ));

        Self { inner }
    }

    /// Queue a file for download. Returns its task id.
    ///
    /// Destination collisions are rejected here: no two tasks ever
    /// write the same path concurrently.
    pub fn submit(&self, entry: FileEntry) -> Result<TaskId> {
        let destination = self.inner.config.download_dir.join(&entry.name);

        let mut active = self.inner.active.lock().expect("active map lock poisoned");
        if active.contains_key(&entry.id)
            || active.values().any(|a| a.destination == destination)
        {
            return Err(CoreError::DestinationCollision(destination));
        }

        let task = DownloadTask::new(
            entry.id.clone(),
            entry.name.clone(),
            entry.size,
            destination.clone(),
        );
        let cancel = Arc::new(CancelFlag::new());
        active.insert(
            entry.id.clone(),
            ActiveEntry {
                cancel: Arc::clone(&cancel),
                destination,
            },
        );
        drop(active);

        let id = task.id.clone();
        self.inner
            .queue_tx
            .send(QueuedTask { task, entry, cancel })
            .map_err(|_| CoreError::Network("task queue worker stopped".to_string()))?;
        Ok(id)
    }

    /// Flag a task for cancellation. Engines observe the flag within
    /// one poll/read cycle; queued-but-not-started tasks are dropped
    /// when the worker reaches them. Returns false for unknown ids.
    pub fn cancel(&self, task_id: &str, kind: CancelKind) -> bool {
        let active = self.inner.active.lock().expect("active map lock poisoned");
        match active.get(task_id) {
            Some(entry) => {
                entry.cancel.cancel(kind);
                true
            }
            None => false,
        }
    }

    /// Cancel every live task, typically with `CancelKind::Shutdown` on
    /// process exit so partial files survive for the next run.
    pub fn cancel_all(&self, kind: CancelKind) {
        let active = self.inner.active.lock().expect("active map lock poisoned");
        for entry in active.values() {
            entry.cancel.cancel(kind);
        }
    }

    pub fn list_active(&self) -> Vec<TaskId> {
        let active = self.inner.active.lock().expect("active map lock poisoned");
        active.keys().cloned().collect()
    }

    /// Subscribe to the task event stream (progress at ≤4 Hz per task,
    /// plus terminal events).
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.aggregator.subscribe()
    }

    /// Which backend won the startup probe.
    pub fn uses_external_engine(&self) -> bool {
        self.inner.engine.is_external()
    }
}

async fn worker_loop<C, A, R>(
    inner: Arc<Inner<C, A, R>>,
    mut queue_rx: mpsc::UnboundedReceiver<QueuedTask>,
    semaphore: Arc<Semaphore>,
) where
    C: HttpClient + 'static,
    A: Aria2Api + Send + Sync + 'static,
    R: LinkResolver + 'static,
{
    while let Some(queued) = queue_rx.recv().await {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let _permit = permit;
            inner.process(queued).await;
        });
    }
}

impl<C, A, R> Inner<C, A, R>
where
    C: HttpClient + 'static,
    A: Aria2Api + Send + Sync + 'static,
    R: LinkResolver + 'static,
{
    async fn process(&self, queued: QueuedTask) {
        let QueuedTask {
            mut task,
            entry,
            cancel,
        } = queued;
        let mut tracker =
            self.aggregator
                .tracker(task.id.clone(), task.name.clone(), task.expected_size);

        let result = self.run(&mut task, &entry, &mut tracker, &cancel).await;

        match result {
            Ok(()) => {
                info!(task = %task.id, file = %task.name, "download completed");
                tracker.completed();
            }
            Err(CoreError::Cancelled) => {
                let kind = cancel.get().unwrap_or(CancelKind::UserAbort);
                info!(task = %task.id, ?kind, "download cancelled");
                if kind == CancelKind::UserAbort {
                    self.remove_partials(&task).await;
                }
                tracker.cancelled();
            }
            Err(e) => {
                warn!(task = %task.id, error = %e, "download failed");
                if matches!(
                    e,
                    CoreError::SizeMismatch { .. } | CoreError::Integrity(_)
                ) {
                    // A file that failed verification must never be
                    // mistaken for a finished download.
                    let _ = tokio::fs::remove_file(&task.destination).await;
                }
                tracker.failed(e.to_string());
            }
        }

        self.active
            .lock()
            .expect("active map lock poisoned")
            .remove(&task.id);
    }

    async fn run(
        &self,
        task: &mut DownloadTask,
        entry: &FileEntry,
        tracker: &mut TaskTracker,
        cancel: &CancelFlag,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        task.state = TaskState::ResolvingLink;
        tracker.set_state(TaskState::ResolvingLink);
        let mirror_set = self.resolver.resolve(entry).await?;
        if mirror_set.mirrors.is_empty() {
            return Err(CoreError::NoMirrorAvailable);
        }
        task.cookie = mirror_set.cookie;
        task.mirrors = mirror_set.mirrors;

        let url = self.select_mirror(task, tracker).await;

        self.supervisor
            .drive(&self.engine, task, &url, tracker, cancel)
            .await?;

        task.state = TaskState::Verifying;
        tracker.set_state(TaskState::Verifying);
        verify(&task.destination, task.expected_size).await
    }

    /// Pick the URL for this task: a configured mirror label wins
    /// outright, then opt-in speed testing, then plain input order.
    async fn select_mirror(&self, task: &mut DownloadTask, tracker: &mut TaskTracker) -> String {
        if let Some(label) = &self.config.preferred_mirror_label
            && let Some(preferred) = task.mirrors.iter().find(|m| &m.label == label)
        {
            return preferred.url.clone();
        }

        if self.config.speed_test && task.mirrors.len() > 1 {
            task.state = TaskState::TestingMirrors;
            tracker.set_state(TaskState::TestingMirrors);

            let mut headers = Vec::new();
            if let Some(cookie) = &task.cookie {
                headers.push(("Cookie".to_string(), cookie.clone()));
            }
            let ranked = mirror::rank(
                self.client.as_ref(),
                &task.mirrors,
                &headers,
                self.config.probe_sample_size,
                self.config.probe_timeout,
            )
            .await;
            // Even when every probe scored zero the list is non-empty
            // and keeps input order, so the first entry is the same
            // fallback a caller without speed testing would use.
            return ranked[0].mirror.url.clone();
        }

        task.mirrors[0].url.clone()
    }

    /// User-initiated abort: drop everything a dead task left behind,
    /// including the external engine's control file.
    async fn remove_partials(&self, task: &DownloadTask) {
        let _ = tokio::fs::remove_file(task.part_path()).await;
        let _ = tokio::fs::remove_file(&task.destination).await;
        let _ = tokio::fs::remove_file(sibling(&task.destination, ".aria2")).await;
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
