//! Batch precompute: walk directories, summarize every supported audio file,
//! persist the results.
//!
//! Processes files in chunks: summarize a chunk in parallel with rayon, then
//! write the chunk's results to the cache store serially. This gives
//! incremental cache progress on crash and bounded memory, and keeps the
//! store single-writer.

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use walkdir::WalkDir;

use crate::cache::{CacheError, SummaryCache};
use crate::config::AppConfig;
use crate::identity;
use crate::summarizer::decode::DecoderFactory;
use crate::summarizer::{self, SummarizeError, TrackSummary};
use crate::track::Track;
use crate::SUPPORTED_EXTENSIONS;

#[derive(Error, Debug)]
pub enum PrecomputeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

pub struct PrecomputeResult {
    pub computed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Summarize every supported file under `paths` into `cache`. Files already
/// cached (unless `force` is set) and files failing the summarization gate
/// are counted as skipped. Per-file failures are counted and logged, never
/// fatal.
pub fn precompute(
    cache: &mut SummaryCache,
    factory: &(dyn DecoderFactory),
    config: &AppConfig,
    paths: &[String],
    force: bool,
    jobs: usize,
) -> std::result::Result<PrecomputeResult, PrecomputeError> {
    // First pass: collect all audio file paths
    let mut audio_files: Vec<String> = Vec::new();
    for path in paths {
        for entry in WalkDir::new(path).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                audio_files.push(entry.path().to_string_lossy().to_string());
            }
        }
    }

    let mut result = PrecomputeResult {
        computed: 0,
        skipped: 0,
        failed: 0,
    };

    // Skip already-cached files up front so the progress bar counts real work
    let pending: Vec<String> = audio_files
        .into_iter()
        .filter(|uri| {
            if !force && cache.exists(uri) {
                result.skipped += 1;
                false
            } else {
                true
            }
        })
        .collect();

    if pending.is_empty() {
        return Ok(result);
    }

    log::info!("Summarizing {} files with {} workers", pending.len(), jobs);

    let pb = ProgressBar::new(pending.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .unwrap();

    // Chunk size = jobs * 2 gives good parallelism while keeping memory bounded.
    let chunk_size = jobs * 2;

    for chunk in pending.chunks(chunk_size) {
        let summaries: Vec<(String, std::result::Result<Option<TrackSummary>, SummarizeError>)> =
            pool.install(|| {
                use rayon::prelude::*;
                chunk
                    .par_iter()
                    .map(|uri| {
                        let summary = summarize_file(factory, config, uri);
                        pb.inc(1);
                        (uri.clone(), summary)
                    })
                    .collect()
            });

        // Serial write phase: the cache store is single-writer
        for (uri, summary) in summaries {
            match summary {
                Ok(Some(summary)) => {
                    cache.write(&summary.key, summary.channel_count, summary.cells())?;
                    result.computed += 1;
                }
                Ok(None) => {
                    log::debug!("{uri} fails the summarization gate, skipping");
                    result.skipped += 1;
                }
                Err(e) => {
                    log::warn!("failed to summarize {uri}: {e}");
                    result.failed += 1;
                }
            }
        }
    }

    pb.finish_and_clear();
    Ok(result)
}

/// Open, gate, and summarize one file from scratch. The decoder is opened
/// once; its declared stream length supplies the duration the gate checks.
/// `Ok(None)` means the track fails the summarization gate (over the
/// configured duration limit, or not a summarizable source); that is a
/// silent skip, not an error.
pub fn summarize_file(
    factory: &dyn DecoderFactory,
    config: &AppConfig,
    uri: &str,
) -> std::result::Result<Option<TrackSummary>, SummarizeError> {
    let mut track = Track::local_file(uri, 0.0);
    let mut decoder = factory.open(&track)?;
    let rate = decoder.sample_rate();
    if rate > 0 {
        track.duration_secs = decoder.total_frames() as f64 / rate as f64;
    }
    if !summarizer::supported_track(&track, config) {
        return Ok(None);
    }
    let key = identity::resolve(&track, &track.uri)
        .map_err(|e| SummarizeError::InvalidFormat(e.to_string()))?;
    summarizer::summarize(
        &track,
        key,
        decoder.as_mut(),
        config.bucket_bound(),
        &mut |_, _| {},
    )
    .map(Some)
}
