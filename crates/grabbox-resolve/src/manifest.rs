//! Serde model of the external resolver's JSON output.
//!
//! The resolver tool emits one JSON document per share link. All the
//! loose typing lives in this file; everything past `ManifestResolver`
//! works with the structs from the crate root.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::{FileEntry, LinkResolver, Mirror, MirrorSet, ResolveError, ResolvedFile, Result};

/// Top-level resolver output: status, file tree, share cookie, and
/// per-file mirror URL maps keyed by origin label.
#[derive(Debug, Clone, Deserialize)]
pub struct ShareManifest {
    pub status: String,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    #[serde(default)]
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub children: Vec<ManifestFile>,
    /// Candidate URLs keyed by mirror label. BTreeMap keeps the label
    /// order deterministic across runs.
    #[serde(default)]
    pub mirrors: BTreeMap<String, String>,
}

impl ShareManifest {
    pub fn from_json(raw: &str) -> Result<Self> {
        let manifest: ShareManifest = serde_json::from_str(raw)?;
        if manifest.status != "success" {
            return Err(ResolveError::Status(manifest.status));
        }
        Ok(manifest)
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }

    pub fn file_tree(&self) -> Vec<ResolvedFile> {
        self.files.iter().map(to_resolved).collect()
    }
}

fn to_resolved(file: &ManifestFile) -> ResolvedFile {
    ResolvedFile {
        id: file.id.clone(),
        name: file.name.clone(),
        size: file.size,
        is_directory: file.is_directory,
        children: file.children.iter().map(to_resolved).collect(),
    }
}

/// `LinkResolver` backed by an already-materialized manifest.
pub struct ManifestResolver {
    manifest: ShareManifest,
}

impl ManifestResolver {
    pub fn new(manifest: ShareManifest) -> Self {
        Self { manifest }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::new(ShareManifest::from_path(path).await?))
    }

    pub fn manifest(&self) -> &ShareManifest {
        &self.manifest
    }

    fn find<'a>(files: &'a [ManifestFile], id: &str) -> Option<&'a ManifestFile> {
        for file in files {
            if !file.is_directory && file.id == id {
                return Some(file);
            }
            if let Some(found) = Self::find(&file.children, id) {
                return Some(found);
            }
        }
        None
    }
}

impl LinkResolver for ManifestResolver {
    async fn resolve(&self, entry: &FileEntry) -> Result<MirrorSet> {
        let file = Self::find(&self.manifest.files, &entry.id)
            .ok_or_else(|| ResolveError::UnknownFile(entry.id.clone()))?;
        if file.mirrors.is_empty() {
            return Err(ResolveError::NoMirrors(entry.id.clone()));
        }
        Ok(MirrorSet {
            mirrors: file
                .mirrors
                .iter()
                .map(|(label, url)| Mirror {
                    label: label.clone(),
                    url: url.clone(),
                })
                .collect(),
            cookie: self.manifest.cookie.clone(),
        })
    }
}
