//! Direct streaming engine: one streamed HTTP connection, manual
//! chunked writes, partial-file resume via `Range` requests.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::engine::{EngineHandle, EngineStatus, TransferEngine};
use crate::error::{CoreError, Result};
use crate::net::HttpClient;
use crate::task::{DownloadTask, TransferSession};

/// Disk write granularity. Distinct from whatever chunk size the HTTP
/// stack hands back; network chunks are re-sliced to this.
const WRITE_CHUNK: usize = 8 * 1024;

/// No bytes from the stream for this long counts as a dead connection.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DirectEngine<C: HttpClient + 'static> {
    client: Arc<C>,
    transfers: Mutex<HashMap<String, Arc<TransferShared>>>,
    next_id: AtomicU64,
}

/// State shared between the streaming task and `poll`/`cancel`.
#[derive(Default)]
struct TransferShared {
    bytes: AtomicU64,
    finished: AtomicBool,
    complete: AtomicBool,
    cancel: AtomicBool,
    error: Mutex<Option<String>>,
}

impl<C: HttpClient + 'static> DirectEngine<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            transfers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn headers(task: &DownloadTask, resume_from: u64) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(cookie) = &task.cookie {
            headers.push(("Cookie".to_string(), cookie.clone()));
        }
        if resume_from > 0 {
            headers.push(("Range".to_string(), format!("bytes={resume_from}-")));
        }
        headers
    }
}

impl<C: HttpClient + 'static> TransferEngine for DirectEngine<C> {
    async fn start(&self, task: &DownloadTask, session: &TransferSession) -> Result<EngineHandle> {
        let part = task.part_path();
        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let resume_from = resume_offset(&part, task.expected_size).await?;
        let headers = Self::headers(task, resume_from);

        let shared = Arc::new(TransferShared::default());
        shared.bytes.store(resume_from, Ordering::Relaxed);

        let id = format!(
            "direct-{}-{}",
            task.id,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        self.transfers
            .lock()
            .expect("transfer map lock poisoned")
            .insert(id.clone(), Arc::clone(&shared));

        debug!(task = %task.id, resume_from, url = %session.url, "direct session starting");

        let client = Arc::clone(&self.client);
        let url = session.url.clone();
        let destination = task.destination.clone();
        let expected = task.expected_size;
        tokio::spawn(async move {
            let result = stream_to_disk(
                client.as_ref(),
                &url,
                &part,
                &destination,
                expected,
                resume_from,
                &headers,
                &shared,
            )
            .await;
            match result {
                Ok(()) => shared.complete.store(true, Ordering::SeqCst),
                // Cancellation is a silent stop: partial data stays on
                // disk for the next session to resume.
                Err(CoreError::Cancelled) => {}
                Err(e) => {
                    *shared.error.lock().expect("error slot lock poisoned") = Some(e.to_string());
                }
            }
            shared.finished.store(true, Ordering::SeqCst);
        });

        Ok(EngineHandle(id))
    }

    async fn poll(&self, handle: &EngineHandle) -> Result<EngineStatus> {
        let mut transfers = self.transfers.lock().expect("transfer map lock poisoned");
        let shared = transfers
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| CoreError::Network(format!("unknown transfer handle {}", handle.0)))?;

        let finished = shared.finished.load(Ordering::SeqCst);
        if finished {
            transfers.remove(&handle.0);
        }
        drop(transfers);

        Ok(EngineStatus {
            completed_bytes: shared.bytes.load(Ordering::Relaxed),
            total_bytes: 0,
            speed_bps: 0,
            is_active: !finished,
            is_complete: shared.complete.load(Ordering::SeqCst),
            error: shared.error.lock().expect("error slot lock poisoned").clone(),
        })
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<()> {
        let shared = self
            .transfers
            .lock()
            .expect("transfer map lock poisoned")
            .remove(&handle.0);
        if let Some(shared) = shared {
            // The flag is checked before every write, so no new write
            // starts after this point; a write already in flight can at
            // worst grow the partial past the next session's resume
            // offset, which the final size check rejects.
            shared.cancel.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Bytes already usable in the temp file. A partial smaller than the
/// expected size resumes; anything at or past it is stale (a previous
/// run that failed verification) and is discarded.
pub(crate) async fn resume_offset(part: &Path, expected_size: u64) -> io::Result<u64> {
    match tokio::fs::metadata(part).await {
        Ok(meta) if meta.len() < expected_size => Ok(meta.len()),
        Ok(meta) => {
            warn!(
                part = %part.display(),
                size = meta.len(),
                "stale partial file at or past expected size, restarting from zero"
            );
            tokio::fs::remove_file(part).await?;
            Ok(0)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_to_disk<C: HttpClient>(
    client: &C,
    url: &str,
    part: &Path,
    destination: &Path,
    expected_size: u64,
    resume_from: u64,
    headers: &[(String, String)],
    shared: &TransferShared,
) -> Result<()> {
    let mut file = if resume_from > 0 {
        OpenOptions::new().append(true).open(part).await?
    } else {
        File::create(part).await?
    };

    let mut stream = client
        .stream(url, headers)
        .await
        .map_err(|e| CoreError::Network(e.to_string()))?;

    let mut written = resume_from;
    loop {
        // Flush before every early return: the next session derives its
        // resume offset from the partial file's on-disk size.
        let next = match tokio::time::timeout(READ_TIMEOUT, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = file.flush().await;
                return Err(CoreError::Network("response body read timed out".to_string()));
            }
        };
        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = file.flush().await;
                return Err(CoreError::Network(e.to_string()));
            }
        };

        for slice in chunk.chunks(WRITE_CHUNK) {
            // Checked at every write boundary so cancellation lands
            // within one chunk. The partial file stays in place.
            if shared.cancel.load(Ordering::SeqCst) {
                let _ = file.flush().await;
                return Err(CoreError::Cancelled);
            }
            file.write_all(slice).await?;
            written += slice.len() as u64;
            shared.bytes.store(written, Ordering::Relaxed);
        }
    }
    file.flush().await?;
    drop(file);

    let actual = tokio::fs::metadata(part).await?.len();
    if actual != expected_size {
        let _ = tokio::fs::remove_file(part).await;
        return Err(CoreError::SizeMismatch {
            expected: expected_size,
            actual,
        });
    }

    tokio::fs::rename(part, destination).await?;
    Ok(())
}
