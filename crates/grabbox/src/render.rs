//! Terminal rendering of the orchestrator's event stream: one progress
//! bar per task, plus a final summary.

use std::collections::HashMap;

use console::style;
use grabbox_core::{TaskEvent, TaskId};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast;

const PB_STYLE: &str = "{spinner:.blue} {prefix:>20.cyan.bold} {wide_bar:.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(PB_STYLE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

#[derive(Debug, Default)]
pub struct Summary {
    pub completed: usize,
    pub cancelled: usize,
    pub failed: Vec<(TaskId, String)>,
}

impl Summary {
    fn terminal_count(&self) -> usize {
        self.completed + self.cancelled + self.failed.len()
    }

    pub fn print(&self) {
        eprintln!(
            "\n{} completed, {} failed, {} cancelled",
            style(self.completed).green(),
            style(self.failed.len()).red(),
            style(self.cancelled).yellow(),
        );
        for (task, reason) in &self.failed {
            eprintln!("  {} {task}: {reason}", style("✗").red());
        }
    }
}

/// Consume events until `expected` tasks reached a terminal state.
pub async fn run(mut rx: broadcast::Receiver<TaskEvent>, expected: usize) -> Summary {
    let progress = MultiProgress::new();
    let mut bars: HashMap<TaskId, ProgressBar> = HashMap::new();
    let mut summary = Summary::default();

    while summary.terminal_count() < expected {
        match rx.recv().await {
            Ok(TaskEvent::Progress(event)) => {
                let bar = bars.entry(event.task_id.clone()).or_insert_with(|| {
                    let bar = progress.add(ProgressBar::new(event.total_bytes));
                    bar.set_style(bar_style());
                    bar.set_prefix(event.file_name.clone());
                    bar
                });
                bar.set_position(event.bytes_transferred);
                bar.set_message(event.state.to_string());
            }
            Ok(TaskEvent::Completed { task_id }) => {
                if let Some(bar) = bars.get(&task_id) {
                    bar.finish_with_message("done");
                }
                summary.completed += 1;
            }
            Ok(TaskEvent::Failed { task_id, reason }) => {
                if let Some(bar) = bars.get(&task_id) {
                    bar.abandon_with_message("failed");
                }
                summary.failed.push((task_id, reason));
            }
            Ok(TaskEvent::Cancelled { task_id }) => {
                if let Some(bar) = bars.get(&task_id) {
                    bar.abandon_with_message("cancelled");
                }
                summary.cancelled += 1;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    summary
}
