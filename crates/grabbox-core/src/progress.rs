//! Progress aggregation: raw byte-count snapshots in, rate-limited
//! events out.
//!
//! The core emits structured events onto a broadcast channel; any
//! consumer (terminal renderer, desktop widget) subscribes
//! independently. Per task, byte-progress events are coalesced to at
//! most one per `min_interval` (250 ms, i.e. ≤ 4 Hz), always carrying
//! the most recent snapshot rather than an average. State transitions
//! and terminal events bypass the rate limit.

use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::task::{TaskId, TaskState};

/// One throttled progress snapshot for a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub file_name: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Speed over the most recent emit interval, not a running average.
    pub speed_bps: u64,
    /// `None` until a non-zero speed sample exists.
    pub eta_seconds: Option<u64>,
    pub state: TaskState,
}

impl ProgressEvent {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Everything a subscriber can observe about the task set.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Progress(ProgressEvent),
    Completed { task_id: TaskId },
    Failed { task_id: TaskId, reason: String },
    Cancelled { task_id: TaskId },
}

/// Fan-out point for task events.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    tx: broadcast::Sender<TaskEvent>,
    min_interval: Duration,
}

impl ProgressAggregator {
    pub fn new(capacity: usize) -> Self {
        Self::with_interval(capacity, Duration::from_millis(250))
    }

    pub fn with_interval(capacity: usize, min_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, min_interval }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Per-task handle that owns the throttle state. One tracker per
    /// task, held by the worker driving it.
    pub fn tracker(&self, task_id: TaskId, file_name: String, total_bytes: u64) -> TaskTracker {
        TaskTracker {
            tx: self.tx.clone(),
            min_interval: self.min_interval,
            task_id,
            file_name,
            total_bytes,
            state: TaskState::Queued,
            high_water: 0,
            speed_bps: 0,
            last_emit: None,
            anchor: None,
        }
    }
}

/// Throttled per-task progress emitter.
///
/// Byte counts are clamped monotone non-decreasing and never exceed
/// `total_bytes`, so subscribers observe the ordering guarantee directly.
#[derive(Debug)]
pub struct TaskTracker {
    tx: broadcast::Sender<TaskEvent>,
    min_interval: Duration,
    task_id: TaskId,
    file_name: String,
    total_bytes: u64,
    state: TaskState,
    high_water: u64,
    speed_bps: u64,
    last_emit: Option<Instant>,
    /// Time/byte pair of the previous emit, the basis for speed.
    anchor: Option<(Instant, u64)>,
}

impl TaskTracker {
    pub fn bytes(&self) -> u64 {
        self.high_water
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Record a byte-count snapshot; emits when the throttle allows.
    pub fn update(&mut self, bytes: u64) {
        self.update_at(Instant::now(), bytes);
    }

    pub(crate) fn update_at(&mut self, now: Instant, bytes: u64) {
        self.high_water = bytes.max(self.high_water).min(self.total_bytes);

        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.min_interval);
        if due {
            self.emit(now);
        }
    }

    /// Record a state transition; always emits immediately.
    pub fn set_state(&mut self, state: TaskState) {
        self.set_state_at(Instant::now(), state);
    }

    pub(crate) fn set_state_at(&mut self, now: Instant, state: TaskState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.emit(now);
    }

    fn emit(&mut self, now: Instant) {
        if let Some((at, bytes)) = self.anchor {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.0 {
                self.speed_bps = ((self.high_water.saturating_sub(bytes)) as f64 / elapsed) as u64;
            }
        }
        self.anchor = Some((now, self.high_water));
        self.last_emit = Some(now);

        let _ = self.tx.send(TaskEvent::Progress(self.snapshot()));
    }

    fn snapshot(&self) -> ProgressEvent {
        let remaining = self.total_bytes.saturating_sub(self.high_water);
        let eta_seconds = if self.speed_bps > 0 && remaining > 0 {
            Some(remaining / self.speed_bps)
        } else {
            None
        };
        ProgressEvent {
            task_id: self.task_id.clone(),
            file_name: self.file_name.clone(),
            bytes_transferred: self.high_water,
            total_bytes: self.total_bytes,
            speed_bps: self.speed_bps,
            eta_seconds,
            state: self.state,
        }
    }

    /// Terminal events consume the tracker; nothing is emitted for the
    /// task afterwards.
    pub fn completed(mut self) {
        self.high_water = self.total_bytes;
        self.set_state(TaskState::Completed);
        let _ = self.tx.send(TaskEvent::Completed {
            task_id: self.task_id.clone(),
        });
    }

    pub fn failed(mut self, reason: String) {
        self.set_state(TaskState::Failed);
        let _ = self.tx.send(TaskEvent::Failed {
            task_id: self.task_id.clone(),
            reason,
        });
    }

    pub fn cancelled(mut self) {
        self.set_state(TaskState::Cancelled);
        let _ = self.tx.send(TaskEvent::Cancelled {
            task_id: self.task_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn progress_bytes(events: &[TaskEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                TaskEvent::Progress(p) => Some(p.bytes_transferred),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn byte_updates_are_rate_limited() {
        let agg = ProgressAggregator::with_interval(64, Duration::from_millis(250));
        let mut rx = agg.subscribe();
        let mut tracker = agg.tracker("t1".into(), "file.bin".into(), 10_000);

        let start = Instant::now();
        // 100 snapshots over one simulated second: at most 4 + the
        // leading edge may pass the throttle.
        for i in 0..100u64 {
            tracker.update_at(start + Duration::from_millis(i * 10), i * 100);
        }

        let emitted = progress_bytes(&drain(&mut rx));
        assert!(emitted.len() <= 5, "got {} events", emitted.len());
        assert!(!emitted.is_empty());
    }

    #[test]
    fn emitted_bytes_are_monotone_and_clamped() {
        let agg = ProgressAggregator::with_interval(64, Duration::from_millis(0));
        let mut rx = agg.subscribe();
        let mut tracker = agg.tracker("t1".into(), "file.bin".into(), 1_000);

        let start = Instant::now();
        for (i, bytes) in [100u64, 300, 200, 900, 5_000].into_iter().enumerate() {
            tracker.update_at(start + Duration::from_millis(i as u64), bytes);
        }

        let emitted = progress_bytes(&drain(&mut rx));
        for pair in emitted.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        // A raw count past the expected size never leaks through.
        assert_eq!(*emitted.last().unwrap(), 1_000);
    }

    #[test]
    fn latest_snapshot_wins_within_a_window() {
        let agg = ProgressAggregator::with_interval(64, Duration::from_millis(250));
        let mut rx = agg.subscribe();
        let mut tracker = agg.tracker("t1".into(), "file.bin".into(), 10_000);

        let start = Instant::now();
        tracker.update_at(start, 100);
        // Suppressed by the throttle, but retained as the high-water mark.
        tracker.update_at(start + Duration::from_millis(10), 2_000);
        tracker.update_at(start + Duration::from_millis(300), 2_500);

        let emitted = progress_bytes(&drain(&mut rx));
        assert_eq!(emitted, vec![100, 2_500]);
    }

    #[test]
    fn state_changes_bypass_the_throttle() {
        let agg = ProgressAggregator::with_interval(64, Duration::from_millis(250));
        let mut rx = agg.subscribe();
        let mut tracker = agg.tracker("t1".into(), "file.bin".into(), 10_000);

        let start = Instant::now();
        tracker.update_at(start, 100);
        tracker.set_state_at(start + Duration::from_millis(1), TaskState::Downloading);
        tracker.set_state_at(start + Duration::from_millis(2), TaskState::Stalled);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn speed_uses_the_most_recent_interval() {
        let agg = ProgressAggregator::with_interval(64, Duration::from_millis(0));
        let mut rx = agg.subscribe();
        let mut tracker = agg.tracker("t1".into(), "file.bin".into(), 1_000_000);

        let start = Instant::now();
        tracker.update_at(start, 0);
        tracker.update_at(start + Duration::from_secs(1), 100_000);

        let events = drain(&mut rx);
        let last = match events.last().unwrap() {
            TaskEvent::Progress(p) => p,
            _ => panic!("expected progress"),
        };
        // 100 KB over one second.
        assert!((90_000..=110_000).contains(&last.speed_bps));
        let eta = last.eta_seconds.unwrap();
        assert!((8..=10).contains(&eta));
    }

    #[test]
    fn terminal_events_follow_the_final_snapshot() {
        let agg = ProgressAggregator::new(64);
        let mut rx = agg.subscribe();

        let tracker = agg.tracker("t1".into(), "file.bin".into(), 500);
        tracker.completed();

        let events = drain(&mut rx);
        assert!(matches!(
            events.last().unwrap(),
            TaskEvent::Completed { task_id } if task_id == "t1"
        ));
        match &events[events.len() - 2] {
            TaskEvent::Progress(p) => {
                assert_eq!(p.state, TaskState::Completed);
                assert_eq!(p.bytes_transferred, 500);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
