use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use seekwave::buffer::BUFFER_CAPACITY;
use seekwave::cache::{CacheError, SummaryCache};
use seekwave::summarizer::decode::FileDecoderFactory;
use seekwave::VALUES_PER_BUCKET;

#[derive(Parser)]
#[command(name = "seekwave", version, about = "Waveform summary precompute and cache tool")]
struct Cli {
    /// Cache directory (overrides config and the XDG default)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk directories and summarize every supported audio file into the cache
    Precompute {
        /// Directories (or single files) to process
        paths: Vec<String>,

        /// Recompute files that are already cached
        #[arg(long)]
        force: bool,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Print the summary of one file, served from the cache when possible
    Show {
        /// Audio file to summarize
        file: String,
    },

    /// Cache store maintenance
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Delete the cached summaries for the given files
    Remove {
        /// Files whose summaries should be dropped
        files: Vec<String>,
    },

    /// Print the cache store location and basic statistics
    Path,

    /// Rewrite the store, reclaiming overwritten and deleted records
    Compact,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let mut config = seekwave::config::AppConfig::load();
    if cli.cache_dir.is_some() {
        config.cache_dir = cli.cache_dir;
    }

    let cache_dir = config.resolve_cache_dir();
    log::info!("Cache: {}", cache_dir.display());
    let mut cache = SummaryCache::open(&cache_dir)
        .context("Failed to open the waveform cache")?;

    match cli.command {
        Commands::Precompute { paths, force, jobs } => {
            if paths.is_empty() {
                anyhow::bail!("No directories to process. Pass paths as arguments.");
            }
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let result = seekwave::precompute::precompute(
                &mut cache,
                &FileDecoderFactory,
                &config,
                &paths,
                force,
                workers,
            )
            .context("Precompute failed")?;
            println!(
                "Precompute complete: {} summarized, {} already cached, {} failed",
                result.computed, result.skipped, result.failed
            );
        }

        Commands::Show { file } => {
            let mut cells = vec![0i16; BUFFER_CAPACITY];
            let cached = if config.cache_enabled {
                match cache.read_into(&file, &mut cells) {
                    Ok(info) => Some(info),
                    Err(CacheError::NotFound) => None,
                    Err(e @ CacheError::BufferTooSmall { .. }) => {
                        // a record from a build with larger bounds; fail open
                        // to recomputation like the playback path does
                        log::warn!("cached summary for {} is unusable ({}); recomputing", file, e);
                        None
                    }
                    Err(e) => return Err(e).context("Cache read failed"),
                }
            } else {
                None
            };

            match cached {
                Some(info) => {
                    print_summary(&file, info.channels, &cells[..info.len], "cache");
                }
                None => {
                    let summary =
                        seekwave::precompute::summarize_file(&FileDecoderFactory, &config, &file)
                            .with_context(|| format!("Failed to summarize {}", file))?;
                    match summary {
                        Some(summary) => {
                            if config.cache_enabled {
                                cache
                                    .write(&summary.key, summary.channel_count, summary.cells())
                                    .context("Failed to persist the summary")?;
                            }
                            print_summary(&file, summary.channel_count, summary.cells(), "computed");
                        }
                        None => {
                            println!(
                                "{} is not eligible for summarization (duration or source limits)",
                                file
                            );
                        }
                    }
                }
            }
        }

        Commands::Cache { action } => match action {
            CacheCommands::Remove { files } => {
                let mut removed = 0usize;
                for file in &files {
                    if cache.delete(file).context("Cache delete failed")? {
                        removed += 1;
                    } else {
                        println!("No cached summary for {}", file);
                    }
                }
                println!("Removed {} of {} summaries", removed, files.len());
            }

            CacheCommands::Path => {
                println!("Store:   {}", cache.path().display());
                println!("Entries: {}", cache.entry_count());
                println!("Size:    {} bytes", cache.file_size());
            }

            CacheCommands::Compact => {
                let before = cache.file_size();
                cache.compact().context("Compaction failed")?;
                println!(
                    "Compacted: {} entries, {} -> {} bytes",
                    cache.entry_count(),
                    before,
                    cache.file_size()
                );
            }
        },
    }

    cache.close().context("Failed to close the waveform cache")?;
    Ok(())
}

/// Print per-channel statistics of a bucket-major summary.
fn print_summary(file: &str, channels: usize, cells: &[i16], source: &str) {
    let stride = channels * VALUES_PER_BUCKET;
    let buckets = if stride == 0 { 0 } else { cells.len() / stride };
    println!("{} ({})", file, source);
    println!("Channels: {}  Buckets: {}", channels, buckets);

    for ch in 0..channels {
        let mut min = i16::MAX;
        let mut max = i16::MIN;
        let mut rms_sum = 0i64;
        for bucket in cells.chunks_exact(stride) {
            let base = ch * VALUES_PER_BUCKET;
            min = min.min(bucket[base]);
            max = max.max(bucket[base + 1]);
            rms_sum += bucket[base + 2] as i64;
        }
        if buckets == 0 {
            min = 0;
            max = 0;
        }
        let avg_rms = if buckets > 0 { rms_sum / buckets as i64 } else { 0 };
        println!(
            "  ch {}: min {:>5}  max {:>5}  avg rms {:>4}  (fixed point, 1000 = full scale)",
            ch, min, max, avg_rms
        );
    }
}
