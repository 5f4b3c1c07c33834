//! Stall detection and restart supervision.
//!
//! Wraps either transfer engine and drives one task to completion
//! across as many sessions as it takes. Two recovery paths exist:
//!
//! - A *network error* retries the session after exponential backoff
//!   with jitter.
//! - A *stall* (engine active, zero byte progress past the threshold)
//!   cancels the session and immediately reissues it with the next
//!   preset of the escalation ladder; repeating the same request shape
//!   would just hit the same per-connection throttle.
//!
//! Both share one restart budget, and the budget refills whenever byte
//! progress resumes. Exhausting it is a terminal failure; the
//! supervisor never silently drops a task.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{BackoffPolicy, EscalationPolicy, StallPolicy};
use crate::engine::TransferEngine;
use crate::error::{CoreError, Result};
use crate::progress::TaskTracker;
use crate::task::{CancelFlag, DownloadTask, TaskState, TransferSession};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Consecutive control-channel failures tolerated before the session is
/// treated as errored. Transient RPC hiccups must not abort a task.
const POLL_ERROR_TOLERANCE: u32 = 20;

/// Granularity of cancellation checks inside waits.
const CANCEL_SLICE: Duration = Duration::from_millis(100);

pub struct Supervisor {
    stall: StallPolicy,
    backoff: BackoffPolicy,
    escalation: EscalationPolicy,
    poll_interval: Duration,
}

enum SessionEnd {
    Complete,
    Stalled,
    Errored(String),
    Cancelled,
}

impl Supervisor {
    pub fn new(stall: StallPolicy, backoff: BackoffPolicy, escalation: EscalationPolicy) -> Self {
        Self {
            stall,
            backoff,
            escalation,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll cadence; tests run at millisecond scale.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Drive `task` over `url` until it completes, fails terminally, or
    /// is cancelled. Byte counts land on the task and the tracker as
    /// they move.
    pub async fn drive<E: TransferEngine>(
        &self,
        engine: &E,
        task: &mut DownloadTask,
        url: &str,
        tracker: &mut TaskTracker,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let mut restarts: u32 = 0;
        let mut backoff_attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let params = self.escalation.preset(restarts).clone();
            let mut session = TransferSession::new(url.to_string(), params);
            session.resume_from = task.bytes_transferred;
            transition(task, tracker, TaskState::Downloading);

            let handle = match engine.start(task, &session).await {
                Ok(handle) => handle,
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(e) => {
                    restarts += 1;
                    task.retry_count += 1;
                    if restarts > self.stall.max_restarts {
                        return Err(e);
                    }
                    warn!(task = %task.id, error = %e, "session start failed, backing off");
                    transition(task, tracker, TaskState::Retrying);
                    if self.wait_backoff(backoff_attempt, cancel).await {
                        return Err(CoreError::Cancelled);
                    }
                    backoff_attempt += 1;
                    continue;
                }
            };

            let end = self
                .poll_session(engine, &handle, task, tracker, cancel, &mut restarts, &mut backoff_attempt)
                .await;

            match end {
                SessionEnd::Complete => {
                    debug!(task = %task.id, "session complete");
                    return Ok(());
                }
                SessionEnd::Cancelled => {
                    let _ = engine.cancel(&handle).await;
                    return Err(CoreError::Cancelled);
                }
                SessionEnd::Stalled => {
                    let _ = engine.cancel(&handle).await;
                    restarts += 1;
                    task.retry_count += 1;
                    transition(task, tracker, TaskState::Stalled);
                    if restarts > self.stall.max_restarts {
                        return Err(CoreError::StallTimeout {
                            restarts: restarts - 1,
                        });
                    }
                    info!(
                        task = %task.id,
                        restart = restarts,
                        "stalled, restarting with escalated parameters"
                    );
                    transition(task, tracker, TaskState::Retrying);
                }
                SessionEnd::Errored(message) => {
                    let _ = engine.cancel(&handle).await;
                    restarts += 1;
                    task.retry_count += 1;
                    if restarts > self.stall.max_restarts {
                        return Err(CoreError::Network(message));
                    }
                    warn!(task = %task.id, error = %message, "session errored, backing off");
                    transition(task, tracker, TaskState::Retrying);
                    if self.wait_backoff(backoff_attempt, cancel).await {
                        let _ = engine.cancel(&handle).await;
                        return Err(CoreError::Cancelled);
                    }
                    backoff_attempt += 1;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn poll_session<E: TransferEngine>(
        &self,
        engine: &E,
        handle: &crate::engine::EngineHandle,
        task: &mut DownloadTask,
        tracker: &mut TaskTracker,
        cancel: &CancelFlag,
        restarts: &mut u32,
        backoff_attempt: &mut u32,
    ) -> SessionEnd {
        let mut last_bytes = task.bytes_transferred;
        let mut last_change = Instant::now();
        let mut poll_errors = 0u32;

        loop {
            if cancel.is_cancelled() {
                return SessionEnd::Cancelled;
            }

            match engine.poll(handle).await {
                Err(e) => {
                    poll_errors += 1;
                    warn!(task = %task.id, error = %e, "transient control-channel error");
                    if poll_errors >= POLL_ERROR_TOLERANCE {
                        return SessionEnd::Errored(e.to_string());
                    }
                }
                Ok(status) => {
                    poll_errors = 0;

                    if status.completed_bytes > last_bytes {
                        last_bytes = status.completed_bytes;
                        last_change = Instant::now();
                        // Measurable progress refills the restart budget.
                        *restarts = 0;
                        *backoff_attempt = 0;
                        task.bytes_transferred = status.completed_bytes.min(task.expected_size);
                        task.last_progress = Some(last_change);
                        tracker.update(status.completed_bytes);
                    }

                    if status.is_complete {
                        task.bytes_transferred = task.expected_size;
                        tracker.update(task.expected_size);
                        return SessionEnd::Complete;
                    }
                    if let Some(error) = status.error {
                        return SessionEnd::Errored(error);
                    }
                    if status.is_active {
                        if last_change.elapsed() >= self.stall.threshold {
                            return SessionEnd::Stalled;
                        }
                    } else {
                        return SessionEnd::Errored("engine stopped before completion".to_string());
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Sleep out a backoff delay in slices so cancellation still lands
    /// at sub-second granularity. Returns true when cancelled.
    async fn wait_backoff(&self, attempt: u32, cancel: &CancelFlag) -> bool {
        let delay = self.backoff.delay(attempt);
        debug!(?delay, attempt, "retry backoff");
        let deadline = Instant::now() + delay;
        loop {
            if cancel.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep((deadline - now).min(CANCEL_SLICE)).await;
        }
    }
}

fn transition(task: &mut DownloadTask, tracker: &mut TaskTracker, state: TaskState) {
    task.state = state;
    tracker.set_state(state);
}
