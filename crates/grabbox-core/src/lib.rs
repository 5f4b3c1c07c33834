//! Download orchestration for share-link file retrieval.
//!
//! Given candidate source URLs for a file, this crate manages the
//! transfer through either an external aria2 daemon or a direct
//! streaming fallback, picks the fastest viable mirror, detects and
//! recovers from stalled transfers, resumes partial downloads, and
//! reports throttled progress to any subscriber.
//!
//! # Architecture
//!
//! - [`queue::Orchestrator`] — task-control boundary: submit, cancel,
//!   list, subscribe
//! - [`supervisor::Supervisor`] — stall detection, backoff, parameter
//!   escalation across sessions
//! - [`engine`] — the two interchangeable transfer backends
//! - [`mirror`] — concurrent speed probing and ranking
//! - [`progress`] — rate-limited event stream for consumers
//! - [`verify`] — size and full-read verification before completion

pub mod config;
pub mod engine;
pub mod error;
pub mod mirror;
pub mod net;
pub mod progress;
pub mod queue;
pub mod supervisor;
pub mod task;
pub mod verify;

pub use config::{
    BackoffPolicy, EngineParams, EnginePreference, EscalationPolicy, OrchestratorConfig,
    PieceSelection, RpcConfig, StallPolicy,
};
pub use engine::{Aria2Api, Aria2Engine, Aria2Status, DirectEngine, EngineStatus, TransferEngine};
pub use error::{CoreError, Result};
pub use mirror::MirrorScore;
pub use progress::{ProgressAggregator, ProgressEvent, TaskEvent};
pub use queue::Orchestrator;
pub use supervisor::Supervisor;
pub use task::{CancelFlag, CancelKind, DownloadTask, TaskId, TaskState, TransferSession};

#[cfg(feature = "reqwest")]
pub use engine::Aria2Rpc;
#[cfg(feature = "reqwest")]
pub use net::ReqwestClient;

// The resolver boundary types travel with the orchestrator API.
pub use grabbox_resolve::{FileEntry, LinkResolver, Mirror, MirrorSet};
