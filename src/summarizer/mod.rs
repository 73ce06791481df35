//! Streaming downsampler: decoded audio in, fixed-size amplitude summary out.
//!
//! One decoder chunk maps to one output bucket. For every bucket and channel
//! we track the running min/max and sum of squares, then emit a fixed-point
//! (min, max, rms) triplet. Partial progress is handed to a callback at a
//! cadence of roughly one publish per 30 seconds of audio so long tracks
//! show up incrementally.

pub mod decode;

use thiserror::Error;

use crate::config::AppConfig;
use crate::identity::TrackKey;
use crate::track::Track;
use crate::{FIXED_POINT_SCALE, MAX_CHANNELS, VALUES_PER_BUCKET};
use decode::{DecodeError, Decoder};

#[derive(Error, Debug)]
pub enum SummarizeError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("out of memory assembling the summary buffer")]
    OutOfMemory,
    #[error("invalid audio format: {0}")]
    InvalidFormat(String),
}

/// One bucket of one channel, fixed point (1.0 → 1000).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triplet {
    pub min: i16,
    pub max: i16,
    pub rms: i16,
}

/// A finished (or in-progress) summary. Cells are bucket-major: bucket 0
/// holds one triplet per channel, then bucket 1, and so on — the same layout
/// the shared buffer and the cache store use, so a prefix of the cells is
/// always a whole number of completed buckets.
#[derive(Debug, Clone)]
pub struct TrackSummary {
    pub key: TrackKey,
    pub source_uri: String,
    pub channel_count: usize,
    cells: Vec<i16>,
}

impl TrackSummary {
    pub fn cells(&self) -> &[i16] {
        &self.cells
    }

    pub fn buckets(&self) -> usize {
        self.cells.len() / (self.channel_count * VALUES_PER_BUCKET)
    }

    /// Iterate one channel's triplets.
    pub fn channel(&self, ch: usize) -> impl Iterator<Item = Triplet> + '_ {
        assert!(ch < self.channel_count);
        let stride = self.channel_count * VALUES_PER_BUCKET;
        self.cells
            .chunks_exact(stride)
            .map(move |bucket| Triplet {
                min: bucket[ch * VALUES_PER_BUCKET],
                max: bucket[ch * VALUES_PER_BUCKET + 1],
                rms: bucket[ch * VALUES_PER_BUCKET + 2],
            })
    }
}

/// Whether a track qualifies for summarization at all. A `false` here is a
/// silent skip, never an error surfaced to the user.
pub fn supported_track(track: &Track, config: &AppConfig) -> bool {
    if !track.is_local {
        log::debug!("skipping non-local track {}", track.uri);
        return false;
    }
    if config.max_track_minutes != -1
        && track.duration_secs / 60.0 >= config.max_track_minutes as f64
    {
        log::debug!(
            "skipping {} ({:.1} min exceeds the {} min limit)",
            track.uri,
            track.duration_secs / 60.0,
            config.max_track_minutes
        );
        return false;
    }
    if track.filetype.as_deref() == Some("cdda") {
        log::debug!("skipping disc audio {}", track.uri);
        return false;
    }
    true
}

/// Stream `decoder` into a summary of at most `bucket_bound` buckets per
/// channel. `progress` receives (channels, cells-so-far) at the publish
/// cadence; the caller decides whether those partials are still wanted.
///
/// No retry happens here: any failure aborts this one summarization and
/// retry policy belongs to the caller.
pub fn summarize(
    track: &Track,
    key: TrackKey,
    decoder: &mut dyn Decoder,
    bucket_bound: usize,
    progress: &mut dyn FnMut(usize, &[i16]),
) -> Result<TrackSummary, SummarizeError> {
    let duration = track.duration_secs;
    if duration <= 0.0 {
        return Err(SummarizeError::InvalidFormat(format!(
            "non-positive duration {duration}"
        )));
    }
    let channels = decoder.channels();
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(SummarizeError::InvalidFormat(format!(
            "{channels} channels (supported: 1-{MAX_CHANNELS})"
        )));
    }
    let sample_rate = decoder.sample_rate();
    if sample_rate == 0 {
        return Err(SummarizeError::InvalidFormat("zero sample rate".into()));
    }

    let total_frames = (duration * sample_rate as f64).floor() as u64;
    let frames_per_bucket = total_frames.div_ceil(bucket_bound as u64).max(1) as usize;

    // One partial publish per ~30s of audio. Tracks under 30s run to
    // completion without partials; the caller's final publish covers them.
    let num_updates = ((duration.floor() as u64) / 30).max(1) as usize;
    let publish_every = (bucket_bound / num_updates).max(1);

    let capacity = bucket_bound * channels * VALUES_PER_BUCKET;
    let mut cells: Vec<i16> = Vec::new();
    cells
        .try_reserve_exact(capacity)
        .map_err(|_| SummarizeError::OutOfMemory)?;
    let mut chunk: Vec<f32> = Vec::new();
    // one frame of slack absorbs the bucket-count rounding
    chunk
        .try_reserve_exact((frames_per_bucket + 1) * channels)
        .map_err(|_| SummarizeError::OutOfMemory)?;

    let mut since_publish = 0usize;
    loop {
        let frames = decoder.read_chunk(frames_per_bucket, &mut chunk)?;
        if frames == 0 {
            break;
        }

        for ch in 0..channels {
            let mut min = 1.0f32;
            let mut max = -1.0f32;
            let mut sum_sq = 0.0f64;
            for frame in 0..frames {
                let v = chunk[frame * channels + ch];
                min = min.min(v);
                max = max.max(v);
                sum_sq += (v as f64) * (v as f64);
            }
            let rms = (sum_sq / frames as f64).sqrt() as f32;
            cells.push(scale(min));
            cells.push(scale(max));
            cells.push(scale(rms));
        }

        since_publish += 1;
        if since_publish >= publish_every {
            progress(channels, &cells);
            since_publish = 0;
        }

        // a short chunk is the stream's final bucket; the capacity check
        // guards against decoders that produce more frames than declared
        if frames < frames_per_bucket || cells.len() >= capacity {
            break;
        }
    }

    log::debug!(
        "summarized {}: {} channels, {} buckets",
        track.uri,
        channels,
        cells.len() / (channels * VALUES_PER_BUCKET)
    );

    Ok(TrackSummary {
        key,
        source_uri: track.uri.clone(),
        channel_count: channels,
        cells,
    })
}

fn scale(v: f32) -> i16 {
    (v * FIXED_POINT_SCALE) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic decoder producing a repeating sample pattern.
    struct PatternDecoder {
        channels: usize,
        sample_rate: u32,
        frames_left: u64,
        pattern: Vec<f32>,
        frame_index: u64,
        reads: usize,
    }

    impl PatternDecoder {
        fn constant(channels: usize, sample_rate: u32, secs: f64, value: f32) -> Self {
            Self {
                channels,
                sample_rate,
                frames_left: (secs * sample_rate as f64) as u64,
                pattern: vec![value],
                frame_index: 0,
                reads: 0,
            }
        }
    }

    impl Decoder for PatternDecoder {
        fn channels(&self) -> usize {
            self.channels
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn total_frames(&self) -> u64 {
            self.frames_left
        }

        fn read_chunk(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<usize, DecodeError> {
            self.reads += 1;
            out.clear();
            let n = (frames as u64).min(self.frames_left) as usize;
            for _ in 0..n {
                let v = self.pattern[(self.frame_index % self.pattern.len() as u64) as usize];
                self.frame_index += 1;
                for _ in 0..self.channels {
                    out.push(v);
                }
            }
            self.frames_left -= n as u64;
            Ok(n)
        }
    }

    fn track(secs: f64) -> Track {
        Track::local_file("/music/t.wav", secs)
    }

    fn no_progress() -> impl FnMut(usize, &[i16]) {
        |_, _| {}
    }

    #[test]
    fn constant_full_scale_signal_yields_unit_triplets() {
        let mut dec = PatternDecoder::constant(2, 44100, 10.0, 1.0);
        let summary =
            summarize(&track(10.0), "k".into(), &mut dec, 2048, &mut no_progress()).unwrap();

        assert_eq!(summary.channel_count, 2);
        assert!(summary.buckets() > 0);
        assert!(summary.buckets() <= 2048);
        for ch in 0..2 {
            for t in summary.channel(ch) {
                assert_eq!(t, Triplet { min: 1000, max: 1000, rms: 1000 });
            }
        }
    }

    #[test]
    fn alternating_signal_separates_min_max_rms() {
        let mut dec = PatternDecoder::constant(1, 8000, 4.0, 0.0);
        dec.pattern = vec![0.5, -0.5];
        let summary =
            summarize(&track(4.0), "k".into(), &mut dec, 2048, &mut no_progress()).unwrap();

        for t in summary.channel(0) {
            assert_eq!(t.min, -500);
            assert_eq!(t.max, 500);
            // rms of a ±0.5 square wave is 0.5, within fixed-point rounding
            assert!((t.rms - 500).abs() <= 1, "rms {}", t.rms);
        }
    }

    #[test]
    fn sine_like_rms_is_below_peak() {
        // half amplitude on even frames, full on odd: rms = sqrt((0.25+1)/2)
        let mut dec = PatternDecoder::constant(1, 8000, 2.0, 0.0);
        dec.pattern = vec![0.5, 1.0];
        let summary =
            summarize(&track(2.0), "k".into(), &mut dec, 2048, &mut no_progress()).unwrap();
        let expected = ((0.25 + 1.0) / 2.0f64).sqrt();
        for t in summary.channel(0) {
            assert!((t.rms as f64 - expected * 1000.0).abs() <= 1.0);
        }
    }

    #[test]
    fn bucket_count_is_bounded_and_positive() {
        for secs in [0.1, 1.0, 7.3, 60.0, 600.0] {
            let mut dec = PatternDecoder::constant(1, 44100, secs, 0.25);
            let summary =
                summarize(&track(secs), "k".into(), &mut dec, 2048, &mut no_progress()).unwrap();
            assert!(summary.buckets() > 0, "secs={secs}");
            assert!(summary.buckets() <= 2048, "secs={secs}");
        }
    }

    #[test]
    fn short_final_chunk_still_contributes_a_bucket() {
        // 1025 frames at 100 Hz with bound 512: 3 frames per bucket,
        // 341 full buckets plus a 2-frame final bucket
        let mut dec = PatternDecoder::constant(1, 100, 10.25, 0.5);
        assert_eq!(dec.total_frames(), 1025);
        let summary =
            summarize(&track(10.25), "k".into(), &mut dec, 512, &mut no_progress()).unwrap();
        assert_eq!(summary.buckets(), 342);
        let last = summary.channel(0).last().unwrap();
        assert_eq!(last.rms, 500);
    }

    #[test]
    fn zero_duration_aborts_before_any_decode() {
        let mut dec = PatternDecoder::constant(2, 44100, 0.0, 1.0);
        let err = summarize(&track(0.0), "k".into(), &mut dec, 2048, &mut no_progress())
            .unwrap_err();
        assert!(matches!(err, SummarizeError::InvalidFormat(_)));
        assert_eq!(dec.reads, 0);

        let err = summarize(&track(-3.0), "k".into(), &mut dec, 2048, &mut no_progress())
            .unwrap_err();
        assert!(matches!(err, SummarizeError::InvalidFormat(_)));
        assert_eq!(dec.reads, 0);
    }

    #[test]
    fn too_many_channels_is_rejected_not_truncated() {
        let mut dec = PatternDecoder::constant(7, 44100, 5.0, 1.0);
        let err = summarize(&track(5.0), "k".into(), &mut dec, 2048, &mut no_progress())
            .unwrap_err();
        assert!(matches!(err, SummarizeError::InvalidFormat(_)));
        assert_eq!(dec.reads, 0);
    }

    #[test]
    fn progress_fires_at_the_publish_cadence() {
        // 120s of audio: 4 updates over the run, i.e. every bound/4 buckets
        let mut dec = PatternDecoder::constant(1, 100, 120.0, 0.5);
        let mut publishes: Vec<usize> = Vec::new();
        let mut progress = |channels: usize, cells: &[i16]| {
            assert_eq!(channels, 1);
            publishes.push(cells.len());
        };
        let summary = summarize(&track(120.0), "k".into(), &mut dec, 2048, &mut progress).unwrap();

        assert!(!publishes.is_empty());
        // each partial is a strict prefix extension of the previous
        assert!(publishes.windows(2).all(|w| w[0] < w[1]));
        assert!(*publishes.last().unwrap() <= summary.cells().len());
        // every partial holds whole buckets only
        assert!(publishes.iter().all(|len| len % VALUES_PER_BUCKET == 0));
    }

    #[test]
    fn tracks_under_thirty_seconds_skip_partial_publishes() {
        let mut dec = PatternDecoder::constant(1, 100, 3.0, 0.5);
        let mut count = 0usize;
        let mut progress = |_: usize, _: &[i16]| count += 1;
        let summary = summarize(&track(3.0), "k".into(), &mut dec, 2048, &mut progress).unwrap();
        assert_eq!(count, 0);
        assert_eq!(summary.buckets(), 300);
    }

    mod gate {
        use super::*;

        fn config(max_minutes: i64) -> AppConfig {
            AppConfig {
                max_track_minutes: max_minutes,
                ..AppConfig::default()
            }
        }

        #[test]
        fn local_short_track_is_supported() {
            assert!(supported_track(&track(300.0), &config(180)));
        }

        #[test]
        fn streams_are_skipped() {
            let mut t = track(300.0);
            t.is_local = false;
            t.uri = "http://radio.example/stream".into();
            assert!(!supported_track(&t, &config(180)));
        }

        #[test]
        fn over_long_tracks_are_skipped_unless_disabled() {
            let t = track(200.0 * 60.0);
            assert!(!supported_track(&t, &config(180)));
            assert!(supported_track(&t, &config(-1)));
        }

        #[test]
        fn disc_audio_is_skipped() {
            let mut t = track(300.0);
            t.filetype = Some("cdda".into());
            assert!(!supported_track(&t, &config(180)));
        }
    }
}
