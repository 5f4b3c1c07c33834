//! Typed boundary for share-link resolution results.
//!
//! Link resolution itself (scraping the share page, signing URLs,
//! authentication) happens in an external tool. This crate owns the one
//! adapter that maps the resolver's loosely-typed JSON output into
//! strongly-typed structures, so the rest of the system never touches a
//! dynamic dictionary: the consumed keys (id, name, size, mirror URLs,
//! cookie) each have an explicit field.

mod manifest;

use std::future::Future;

use thiserror::Error;

pub use manifest::{ManifestResolver, ShareManifest};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("resolver reported failure: {0}")]
    Status(String),

    #[error("unknown file id: {0}")]
    UnknownFile(String),

    #[error("resolver returned no mirror URLs for file {0}")]
    NoMirrors(String),

    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// One candidate source URL for a file, tagged with its origin label.
///
/// Labels are opaque strings chosen by the resolver ("primary", "cdn",
/// ...). No host-name scheme is assumed for any label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    pub label: String,
    pub url: String,
}

/// The full set of candidate URLs for one file, plus the cookie the
/// source requires on every request against them.
#[derive(Debug, Clone, Default)]
pub struct MirrorSet {
    pub mirrors: Vec<Mirror>,
    pub cookie: Option<String>,
}

/// A node of the resolved share listing. Directories carry children,
/// files carry a size and a stable file-system id.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
    pub children: Vec<ResolvedFile>,
}

/// A file flattened out of the share tree, ready to submit for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub size: u64,
    /// Slash-joined path inside the share, for display only.
    pub display_path: String,
}

/// Per-file mirror resolution, consumed by the download orchestrator.
///
/// Implementations wrap whatever external tool produces signed URLs.
/// `ManifestResolver` is the bundled one; tests inject their own.
pub trait LinkResolver: Send + Sync {
    fn resolve(&self, file: &FileEntry) -> impl Future<Output = Result<MirrorSet>> + Send;
}

/// Flatten a share tree into downloadable files with display paths.
///
/// Directories themselves are dropped; their children are visited in
/// listing order, so the output order is deterministic.
pub fn flatten(files: &[ResolvedFile]) -> Vec<FileEntry> {
    let mut out = Vec::new();
    flatten_into(files, "", &mut out);
    out
}

fn flatten_into(files: &[ResolvedFile], parent: &str, out: &mut Vec<FileEntry>) {
    for file in files {
        let path = if parent.is_empty() {
            file.name.clone()
        } else {
            format!("{parent}/{}", file.name)
        };
        if file.is_directory {
            flatten_into(&file.children, &path, out);
        } else {
            out.push(FileEntry {
                id: file.id.clone(),
                name: file.name.clone(),
                size: file.size,
                display_path: path,
            });
        }
    }
}
