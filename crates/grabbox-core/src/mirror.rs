//! Mirror speed testing.
//!
//! Each candidate URL gets one short streamed probe; the composite
//! score weighs measured throughput at 70% and inverse connection
//! latency at 30%. A probe that errors or times out scores zero but is
//! never dropped from the result, so callers can always fall back to
//! "first URL in input order" when every probe fails.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::future::join_all;
use grabbox_resolve::Mirror;
use tracing::debug;

use crate::net::HttpClient;

/// Ephemeral ranking result, recomputed per task.
#[derive(Debug, Clone)]
pub struct MirrorScore {
    pub mirror: Mirror,
    pub score: f64,
}

/// Probe all mirrors concurrently (one in-flight probe per URL) and
/// return them ordered by descending score. The sort is stable: ties
/// keep input order. Total latency is roughly one probe, not the sum.
pub async fn rank<C: HttpClient>(
    client: &C,
    mirrors: &[Mirror],
    headers: &[(String, String)],
    sample_size: u64,
    probe_timeout: Duration,
) -> Vec<MirrorScore> {
    let probes = mirrors
        .iter()
        .map(|mirror| probe(client, mirror, headers, sample_size, probe_timeout));
    let scores = join_all(probes).await;

    let mut ranked: Vec<MirrorScore> = mirrors
        .iter()
        .cloned()
        .zip(scores)
        .map(|(mirror, score)| MirrorScore { mirror, score })
        .collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

async fn probe<C: HttpClient>(
    client: &C,
    mirror: &Mirror,
    headers: &[(String, String)],
    sample_size: u64,
    probe_timeout: Duration,
) -> f64 {
    let started = Instant::now();
    let sampled = tokio::time::timeout(probe_timeout, async {
        let mut stream = match client.stream(&mirror.url, headers).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(mirror = %mirror.label, error = %e, "probe connect failed");
                return None;
            }
        };
        let latency = started.elapsed();

        let mut read = 0u64;
        while read < sample_size {
            match stream.next().await {
                Some(Ok(chunk)) => read += chunk.len() as u64,
                Some(Err(e)) => {
                    debug!(mirror = %mirror.label, error = %e, "probe read failed");
                    return None;
                }
                None => break,
            }
        }
        Some((read, latency))
    })
    .await;

    let Ok(Some((read, latency))) = sampled else {
        return 0.0;
    };
    if read == 0 {
        return 0.0;
    }

    let duration = started.elapsed().as_secs_f64();
    let speed_score = if duration > 0.0 {
        read as f64 / duration
    } else {
        0.0
    };
    let latency_secs = latency.as_secs_f64();
    let latency_score = if latency_secs > 0.0 {
        1.0 / latency_secs
    } else {
        0.0
    };

    let score = speed_score * 0.7 + latency_score * 0.3;
    debug!(mirror = %mirror.label, score, read, "probe finished");
    score
}
