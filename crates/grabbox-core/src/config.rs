//! Immutable configuration: orchestrator context, engine parameters,
//! the restart escalation ladder and the retry backoff policy.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

/// Piece-selection order passed to the external engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceSelection {
    /// Sequential pieces, best for streaming reads.
    #[default]
    InOrder,
    /// Randomized pieces, used to escape per-connection throttling.
    Random,
}

impl PieceSelection {
    pub fn as_str(self) -> &'static str {
        match self {
            PieceSelection::InOrder => "inorder",
            PieceSelection::Random => "random",
        }
    }
}

/// Connection/split parameters for one transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineParams {
    /// Max parallel connections per server.
    pub max_connections: u32,
    /// Number of splits for a single file.
    pub split: u32,
    /// Minimum size of one split, in bytes.
    pub min_split_size: u64,
    pub piece_selection: PieceSelection,
    /// Resume a partial file instead of starting over.
    pub continue_partial: bool,
    pub allow_overwrite: bool,
    /// Engine-level retry count and wait, below our own supervision.
    pub max_tries: u32,
    pub retry_wait_secs: u32,
    /// Per-download byte-rate cap; 0 means unlimited.
    pub max_download_limit: u64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            max_connections: 16,
            split: 16,
            min_split_size: 1024 * 1024,
            piece_selection: PieceSelection::InOrder,
            continue_partial: true,
            allow_overwrite: true,
            max_tries: 10,
            retry_wait_secs: 3,
            max_download_limit: 0,
        }
    }
}

impl EngineParams {
    /// The next rung of the escalation ladder: halved connection and
    /// split counts, doubled minimum split size, randomized piece order.
    /// The intent is to escape a pathological per-connection throttle,
    /// not to repeat the same request shape.
    pub fn degraded(&self) -> Self {
        Self {
            max_connections: (self.max_connections / 2).max(1),
            split: (self.split / 2).max(1),
            min_split_size: self.min_split_size.saturating_mul(2),
            piece_selection: PieceSelection::Random,
            ..self.clone()
        }
    }
}

/// Ordered list of parameter presets tried on successive stall restarts.
///
/// Restart `n` uses `presets[n]`, clamped to the last entry once the
/// ladder is exhausted.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    presets: Vec<EngineParams>,
}

impl EscalationPolicy {
    /// Derive a ladder from an initial preset: each rung degrades the
    /// previous one. `steps` is the number of degraded rungs after the
    /// initial preset.
    pub fn from_initial(initial: EngineParams, steps: u32) -> Self {
        let mut presets = Vec::with_capacity(steps as usize + 1);
        presets.push(initial);
        for _ in 0..steps {
            let next = presets.last().map(EngineParams::degraded).unwrap_or_default();
            presets.push(next);
        }
        Self { presets }
    }

    pub fn preset(&self, restart: u32) -> &EngineParams {
        let idx = (restart as usize).min(self.presets.len() - 1);
        &self.presets[idx]
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::from_initial(EngineParams::default(), 3)
    }
}

/// Stall detection thresholds.
#[derive(Debug, Clone)]
pub struct StallPolicy {
    /// Zero byte progress for longer than this, while the engine still
    /// reports itself active, counts as a stall.
    pub threshold: Duration,
    /// Terminal failure after this many restarts without progress.
    pub max_restarts: u32,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(30),
            max_restarts: 3,
        }
    }
}

/// Exponential backoff with uniform jitter for session-level retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    /// Upper bound of the uniform jitter, as a fraction of the computed
    /// delay. Spreads out simultaneous retries across tasks.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            factor: 1.5,
            cap: Duration::from_secs(60),
            jitter: 0.10,
        }
    }
}

impl BackoffPolicy {
    /// The deterministic part of the delay for a 0-indexed attempt:
    /// `min(base * factor^attempt, cap)`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let scaled = self.base.mul_f64(self.factor.powi(attempt as i32));
        scaled.min(self.cap)
    }

    /// The raw delay plus uniform random jitter in `[0, jitter]` of it.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter <= 0.0 {
            return raw;
        }
        raw.mul_f64(1.0 + rand::rng().random_range(0.0..=self.jitter))
    }
}

/// Which transfer backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnginePreference {
    /// Probe the external engine once at startup; fall back to the
    /// direct engine for the process lifetime if it is unreachable.
    #[default]
    Auto,
    External,
    Direct,
}

/// Location of the external engine's control channel.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub endpoint: String,
    pub secret: Option<String>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:6800/jsonrpc".to_string(),
            secret: None,
        }
    }
}

/// Everything the queue, supervisor and engines need, injected
/// explicitly so independent orchestrator instances can coexist (one per
/// test, typically).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub download_dir: PathBuf,
    pub engine: EnginePreference,
    pub rpc: RpcConfig,
    /// Rank mirrors by probe throughput before picking one. Off by
    /// default; the first (or preferred-label) mirror is used as-is.
    pub speed_test: bool,
    /// Bytes read by one mirror probe.
    pub probe_sample_size: u64,
    pub probe_timeout: Duration,
    /// Mirror label preferred when present, instead of rewriting URL
    /// host names the way the upstream site's clients do.
    pub preferred_mirror_label: Option<String>,
    /// Concurrent transfers when the direct engine is active. The
    /// external engine always runs one transfer at a time.
    pub parallel_tasks: usize,
    pub stall: StallPolicy,
    pub backoff: BackoffPolicy,
    /// Supervisor poll cadence against the active engine (5–10 Hz).
    pub poll_interval: Duration,
    pub initial_params: EngineParams,
    pub user_agent: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            engine: EnginePreference::Auto,
            rpc: RpcConfig::default(),
            speed_test: false,
            probe_sample_size: 1024 * 1024,
            probe_timeout: Duration::from_secs(5),
            preferred_mirror_label: None,
            parallel_tasks: 3,
            stall: StallPolicy::default(),
            backoff: BackoffPolicy::default(),
            poll_interval: Duration::from_millis(150),
            initial_params: EngineParams::default(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn escalation(&self) -> EscalationPolicy {
        EscalationPolicy::from_initial(self.initial_params.clone(), self.stall.max_restarts)
    }
}
