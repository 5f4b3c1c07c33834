use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use console::style;
use grabbox_core::{
    Aria2Rpc, CancelKind, EnginePreference, Orchestrator, OrchestratorConfig, ReqwestClient,
    RpcConfig,
};
use grabbox_resolve::{ManifestResolver, ShareManifest, flatten};
use tracing::warn;

use crate::cli::parse_selection;
use crate::render;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EngineArg {
    /// Probe aria2, fall back to direct streaming.
    Auto,
    Aria2,
    Direct,
}

impl From<EngineArg> for EnginePreference {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Auto => EnginePreference::Auto,
            EngineArg::Aria2 => EnginePreference::External,
            EngineArg::Direct => EnginePreference::Direct,
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct Fetch {
    /// Resolved share manifest (JSON produced by the link resolver).
    pub manifest: PathBuf,

    /// Which files to download: `all` or a 1-based list like `1,3-5`.
    #[arg(long, default_value = "all")]
    pub files: String,

    /// Destination directory.
    #[arg(long)]
    pub dest: Option<PathBuf>,

    /// Probe every mirror and download from the fastest one.
    #[arg(long)]
    pub speed_test: bool,

    /// Transfer backend.
    #[arg(long, value_enum)]
    pub engine: Option<EngineArg>,

    /// aria2 JSON-RPC endpoint.
    #[arg(long)]
    pub rpc_url: Option<String>,

    /// aria2 RPC secret token.
    #[arg(long)]
    pub rpc_secret: Option<String>,

    /// Concurrent transfers (direct engine only).
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Settings file; flags override its values.
    #[arg(long, default_value = "settings.json")]
    pub settings: PathBuf,
}

impl Fetch {
    pub async fn run(self) -> anyhow::Result<()> {
        let settings = Settings::load(&self.settings).await?;
        let config = self.build_config(&settings);

        let manifest = ShareManifest::from_path(&self.manifest)
            .await
            .with_context(|| format!("reading manifest {}", self.manifest.display()))?;
        let entries = flatten(&manifest.file_tree());
        anyhow::ensure!(!entries.is_empty(), "the share contains no files");

        let picked = parse_selection(&self.files, entries.len())?;

        let client = ReqwestClient::new(&config.user_agent, Duration::from_secs(15))
            .context("building HTTP client")?;
        let rpc = Aria2Rpc::new(config.rpc.endpoint.clone(), config.rpc.secret.clone())
            .context("building aria2 RPC client")?;
        let resolver = ManifestResolver::new(manifest);

        let orchestrator = Orchestrator::new(config, client, rpc, resolver).await;
        eprintln!(
            "{} {}",
            style("engine:").dim(),
            if orchestrator.uses_external_engine() {
                "aria2"
            } else {
                "direct streaming"
            }
        );

        let events = orchestrator.subscribe();
        let mut submitted = 0usize;
        for idx in &picked {
            let entry = &entries[*idx];
            match orchestrator.submit(entry.clone()) {
                Ok(_) => submitted += 1,
                Err(e) => warn!(file = %entry.display_path, error = %e, "skipping file"),
            }
        }
        anyhow::ensure!(submitted > 0, "nothing to download");

        let mut render_handle = tokio::spawn(render::run(events, submitted));

        let summary = tokio::select! {
            summary = &mut render_handle => summary?,
            _ = tokio::signal::ctrl_c() => {
                // Shutdown-kind cancellation: engines stop within one
                // poll cycle and partial files stay for the next run.
                eprintln!("\n{}", style("interrupted, keeping partial files for resume").yellow());
                orchestrator.cancel_all(CancelKind::Shutdown);
                render_handle.await?
            }
        };

        summary.print();
        anyhow::ensure!(summary.failed.is_empty(), "{} download(s) failed", summary.failed.len());
        Ok(())
    }

    fn build_config(&self, settings: &Settings) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        let mut params = defaults.initial_params.clone();
        if let Some(v) = settings.max_connections {
            params.max_connections = v;
        }
        if let Some(v) = settings.split {
            params.split = v;
        }
        if let Some(v) = settings.min_split_size {
            params.min_split_size = v;
        }

        let engine = self
            .engine
            .map(EnginePreference::from)
            .or_else(|| settings.engine_preference())
            .unwrap_or(defaults.engine);

        OrchestratorConfig {
            download_dir: self
                .dest
                .clone()
                .or_else(|| settings.download_dir.clone())
                .unwrap_or(defaults.download_dir),
            engine,
            rpc: RpcConfig {
                endpoint: self
                    .rpc_url
                    .clone()
                    .or_else(|| settings.rpc_url.clone())
                    .unwrap_or(defaults.rpc.endpoint),
                secret: self.rpc_secret.clone().or_else(|| settings.rpc_secret.clone()),
            },
            speed_test: self.speed_test || settings.speed_test.unwrap_or(false),
            preferred_mirror_label: settings.preferred_mirror.clone(),
            parallel_tasks: self
                .parallel
                .or(settings.parallel)
                .unwrap_or(defaults.parallel_tasks),
            initial_params: params,
            user_agent: settings
                .user_agent
                .clone()
                .unwrap_or(defaults.user_agent),
            ..OrchestratorConfig::default()
        }
    }
}
