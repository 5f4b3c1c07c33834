//! Task and session state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use grabbox_resolve::Mirror;

use crate::config::EngineParams;

/// Stable task identifier: the file-system id assigned by the source.
pub type TaskId = String;

/// Lifecycle of a download task.
///
/// Terminal states are `Completed`, `Failed` and `Cancelled`; the queue
/// drops a task once it reaches one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    Queued,
    ResolvingLink,
    TestingMirrors,
    Downloading,
    Stalled,
    Retrying,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::ResolvingLink => "resolving link",
            TaskState::TestingMirrors => "testing mirrors",
            TaskState::Downloading => "downloading",
            TaskState::Stalled => "stalled",
            TaskState::Retrying => "retrying",
            TaskState::Verifying => "verifying",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One file to retrieve.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub id: TaskId,
    pub name: String,
    /// Known before transfer starts; `bytes_transferred` never exceeds it.
    pub expected_size: u64,
    pub destination: PathBuf,
    /// Ordered candidate URLs, filled during link resolution.
    pub mirrors: Vec<Mirror>,
    pub cookie: Option<String>,
    pub state: TaskState,
    pub bytes_transferred: u64,
    /// When the byte count last moved; the stall timer's anchor.
    pub last_progress: Option<Instant>,
    pub retry_count: u32,
}

impl DownloadTask {
    pub fn new(id: TaskId, name: String, expected_size: u64, destination: PathBuf) -> Self {
        Self {
            id,
            name,
            expected_size,
            destination,
            mirrors: Vec::new(),
            cookie: None,
            state: TaskState::Queued,
            bytes_transferred: 0,
            last_progress: None,
            retry_count: 0,
        }
    }

    /// Sibling temporary path used by the direct engine during transfer.
    pub fn part_path(&self) -> PathBuf {
        part_path_for(&self.destination)
    }
}

pub(crate) fn part_path_for(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// One concrete attempt at moving bytes for a task: one engine/URL
/// combination with fixed connection parameters. A task may span several
/// sessions across stall restarts, but only one is active at a time.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub url: String,
    pub params: EngineParams,
    pub started_at: Instant,
    /// Bytes already on disk when this session began.
    pub resume_from: u64,
}

impl TransferSession {
    pub fn new(url: String, params: EngineParams) -> Self {
        Self {
            url,
            params,
            started_at: Instant::now(),
            resume_from: 0,
        }
    }
}

/// Why a task was cancelled. The distinction decides partial-file
/// cleanup: a user abort removes the partial file, a process shutdown
/// keeps it so the next run can resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    UserAbort,
    Shutdown,
}

const CANCEL_NONE: u8 = 0;
const CANCEL_USER: u8 = 1;
const CANCEL_SHUTDOWN: u8 = 2;

/// Per-task cooperative cancellation flag, checked by the active engine
/// at chunk/poll boundaries.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicU8);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, kind: CancelKind) {
        let value = match kind {
            CancelKind::UserAbort => CANCEL_USER,
            CancelKind::Shutdown => CANCEL_SHUTDOWN,
        };
        // First cancellation wins; a shutdown must not upgrade an
        // earlier user abort, or vice versa.
        let _ = self
            .0
            .compare_exchange(CANCEL_NONE, value, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn get(&self) -> Option<CancelKind> {
        match self.0.load(Ordering::SeqCst) {
            CANCEL_USER => Some(CancelKind::UserAbort),
            CANCEL_SHUTDOWN => Some(CancelKind::Shutdown),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix() {
        let task = DownloadTask::new(
            "1".into(),
            "movie.mkv".into(),
            10,
            PathBuf::from("/downloads/movie.mkv"),
        );
        assert_eq!(task.part_path(), PathBuf::from("/downloads/movie.mkv.part"));
    }

    #[test]
    fn first_cancellation_wins() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());

        flag.cancel(CancelKind::Shutdown);
        flag.cancel(CancelKind::UserAbort);
        assert_eq!(flag.get(), Some(CancelKind::Shutdown));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Downloading.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
    }
}
