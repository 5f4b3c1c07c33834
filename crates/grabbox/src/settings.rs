//! Settings persistence. A thin JSON round-trip; defaults win when the
//! file is absent.

use std::path::{Path, PathBuf};

use anyhow::Context;
use grabbox_core::EnginePreference;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_dir: Option<PathBuf>,
    /// `auto`, `aria2` or `direct`.
    pub engine: Option<String>,
    pub rpc_url: Option<String>,
    pub rpc_secret: Option<String>,
    pub max_connections: Option<u32>,
    pub split: Option<u32>,
    pub min_split_size: Option<u64>,
    pub user_agent: Option<String>,
    pub preferred_mirror: Option<String>,
    pub parallel: Option<usize>,
    pub speed_test: Option<bool>,
}

impl Settings {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("malformed settings file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    pub fn engine_preference(&self) -> Option<EnginePreference> {
        match self.engine.as_deref() {
            Some("aria2") => Some(EnginePreference::External),
            Some("direct") => Some(EnginePreference::Direct),
            Some("auto") => Some(EnginePreference::Auto),
            _ => None,
        }
    }
}
