mod fetch;
mod ls;

pub use fetch::Fetch;
pub use ls::Ls;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "grabbox", version, about = "Share-link downloader")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the files in a resolved share manifest.
    Ls(Ls),
    /// Download files from a resolved share manifest.
    Fetch(Fetch),
}

/// Parse a 1-based selection like `1,3-5` against a listing of `len`
/// entries. `all` (or nothing) selects everything.
pub fn parse_selection(spec: &str, len: usize) -> anyhow::Result<Vec<usize>> {
    let spec = spec.trim();
    if spec.is_empty() || spec.eq_ignore_ascii_case("all") {
        return Ok((0..len).collect());
    }

    let mut picked = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let (lo, hi) = match part.split_once('-') {
            Some((lo, hi)) => (lo.trim(), hi.trim()),
            None => (part, part),
        };
        let lo: usize = lo
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid selection: {part:?}"))?;
        let hi: usize = hi
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid selection: {part:?}"))?;
        if lo == 0 || hi < lo || hi > len {
            anyhow::bail!("selection {part:?} is out of range (1-{len})");
        }
        for idx in lo..=hi {
            if !picked.contains(&(idx - 1)) {
                picked.push(idx - 1);
            }
        }
    }
    Ok(picked)
}
