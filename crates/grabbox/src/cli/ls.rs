use std::path::PathBuf;

use anyhow::Context;
use grabbox_resolve::{ShareManifest, flatten};
use indicatif::HumanBytes;
use tabled::{Table, Tabled, settings::Style};

#[derive(Debug, clap::Args)]
#[clap(visible_alias = "list")]
pub struct Ls {
    /// Resolved share manifest (JSON produced by the link resolver).
    pub manifest: PathBuf,
}

#[derive(Tabled)]
struct Row {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Size")]
    size: String,
}

impl Ls {
    pub async fn run(self) -> anyhow::Result<()> {
        let manifest = ShareManifest::from_path(&self.manifest)
            .await
            .with_context(|| format!("reading manifest {}", self.manifest.display()))?;
        let entries = flatten(&manifest.file_tree());

        let rows: Vec<Row> = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| Row {
                index: i + 1,
                path: entry.display_path.clone(),
                size: HumanBytes(entry.size).to_string(),
            })
            .collect();

        let total: u64 = entries.iter().map(|e| e.size).sum();
        println!("{}", Table::new(rows).with(Style::sharp()));
        println!(
            "{} files, {} total",
            entries.len(),
            HumanBytes(total)
        );
        Ok(())
    }
}
