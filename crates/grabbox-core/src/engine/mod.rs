//! Transfer engine backends.
//!
//! Two interchangeable backends move bytes: the external aria2 daemon
//! (higher throughput, multi-connection) and the in-process direct
//! streaming engine (single connection, no extra dependency). The
//! supervisor drives either through the same handle-based contract:
//! start a session, poll it at a bounded rate, cancel it.

pub mod aria2;
pub mod direct;

use std::future::Future;

use crate::error::Result;
use crate::net::HttpClient;
use crate::task::{DownloadTask, TransferSession};

pub use aria2::{Aria2Api, Aria2Engine, Aria2Status};
pub use direct::DirectEngine;

#[cfg(feature = "reqwest")]
pub use aria2::Aria2Rpc;

/// Opaque reference to one running transfer session inside an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineHandle(pub(crate) String);

impl EngineHandle {
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Snapshot of a running session.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    pub completed_bytes: u64,
    pub total_bytes: u64,
    /// Engine-reported transfer rate; informational only, the progress
    /// aggregator derives its own from byte deltas.
    pub speed_bps: u64,
    /// The engine still considers the session live.
    pub is_active: bool,
    pub is_complete: bool,
    pub error: Option<String>,
}

/// A backend capable of moving a task's bytes for one session.
pub trait TransferEngine: Send + Sync {
    /// Begin a transfer session. Resumption of existing partial data is
    /// the engine's own concern.
    fn start(
        &self,
        task: &DownloadTask,
        session: &TransferSession,
    ) -> impl Future<Output = Result<EngineHandle>> + Send;

    fn poll(&self, handle: &EngineHandle) -> impl Future<Output = Result<EngineStatus>> + Send;

    /// Stop the session and release the engine-side handle. Never
    /// deletes partial data; cleanup policy belongs to the caller.
    fn cancel(&self, handle: &EngineHandle) -> impl Future<Output = Result<()>> + Send;
}

/// Runtime-selected backend, decided once at orchestrator construction.
pub enum EngineBackend<C: HttpClient + 'static, A: Aria2Api> {
    External(Aria2Engine<A>),
    Direct(DirectEngine<C>),
}

impl<C: HttpClient + 'static, A: Aria2Api> EngineBackend<C, A> {
    pub fn is_external(&self) -> bool {
        matches!(self, EngineBackend::External(_))
    }
}

impl<C: HttpClient + 'static, A: Aria2Api> TransferEngine for EngineBackend<C, A> {
    async fn start(&self, task: &DownloadTask, session: &TransferSession) -> Result<EngineHandle> {
        match self {
            EngineBackend::External(engine) => engine.start(task, session).await,
            EngineBackend::Direct(engine) => engine.start(task, session).await,
        }
    }

    async fn poll(&self, handle: &EngineHandle) -> Result<EngineStatus> {
        match self {
            EngineBackend::External(engine) => engine.poll(handle).await,
            EngineBackend::Direct(engine) => engine.poll(handle).await,
        }
    }

    async fn cancel(&self, handle: &EngineHandle) -> Result<()> {
        match self {
            EngineBackend::External(engine) => engine.cancel(handle).await,
            EngineBackend::Direct(engine) => engine.cancel(handle).await,
        }
    }
}
