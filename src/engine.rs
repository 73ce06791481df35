//! Playback-facing orchestration.
//!
//! The engine owns everything a running player needs: the shared display
//! buffer and the disk cache behind one mutex, the in-flight set, and the
//! identity of the currently active track. Playback events come in through
//! [`PlaybackEvents`]; summarization work runs on detached rayon jobs that
//! never block the event path.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::SummaryBuffer;
use crate::cache::{CacheError, SummaryCache};
use crate::config::AppConfig;
use crate::identity::{self, TrackKey};
use crate::inflight::InFlightSet;
use crate::summarizer::{self, decode::DecoderFactory};
use crate::track::Track;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Host-side playback notifications. The host calls these from its event
/// thread; every implementation here returns quickly and defers real work.
pub trait PlaybackEvents {
    fn track_started(&self, track: &Track);
    fn track_stopped(&self);
    fn paused(&self, paused: bool);
    fn config_changed(&self, config: AppConfig);
}

/// Display buffer and cache store share one lock: a cache read deserializes
/// straight into the buffer, and that has to be atomic with respect to
/// worker publishes.
struct SharedState {
    buffer: SummaryBuffer,
    /// `None` once [`WaveformEngine::shutdown`] has run.
    cache: Option<SummaryCache>,
}

pub struct WaveformEngine {
    shared: Mutex<SharedState>,
    inflight: InFlightSet,
    active_key: Mutex<Option<TrackKey>>,
    status: Mutex<PlaybackStatus>,
    config: Mutex<AppConfig>,
    decoders: Arc<dyn DecoderFactory>,
}

impl WaveformEngine {
    /// Bring the engine up, opening the cache store in the configured
    /// directory.
    pub fn new(
        config: AppConfig,
        decoders: Arc<dyn DecoderFactory>,
    ) -> crate::cache::Result<Arc<Self>> {
        let cache = SummaryCache::open(&config.resolve_cache_dir())?;
        Ok(Arc::new(Self {
            shared: Mutex::new(SharedState {
                buffer: SummaryBuffer::new(),
                cache: Some(cache),
            }),
            inflight: InFlightSet::new(),
            active_key: Mutex::new(None),
            status: Mutex::new(PlaybackStatus::Stopped),
            config: Mutex::new(config),
            decoders,
        }))
    }

    pub fn status(&self) -> PlaybackStatus {
        *self.status.lock().unwrap()
    }

    /// Run `f` against the currently displayed summary. The lock is held for
    /// the duration of the call, so keep `f` cheap.
    pub fn with_summary<R>(&self, f: impl FnOnce(&SummaryBuffer) -> R) -> R {
        f(&self.shared.lock().unwrap().buffer)
    }

    /// Drop the cached summary for `track`. Returns whether a record was
    /// actually removed.
    pub fn remove_cached(&self, track: &Track) -> crate::cache::Result<bool> {
        let key = match identity::resolve(track, &track.uri) {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };
        let mut shared = self.shared.lock().unwrap();
        match shared.cache.as_mut() {
            Some(cache) => cache.delete(&key),
            None => Ok(false),
        }
    }

    /// Flush and close the cache store. Playback events arriving afterwards
    /// still work; they just no longer touch the cache.
    pub fn shutdown(&self) -> crate::cache::Result<()> {
        let cache = self.shared.lock().unwrap().cache.take();
        match cache {
            Some(cache) => cache.close(),
            None => Ok(()),
        }
    }

    fn is_active(&self, key: &str) -> bool {
        self.active_key.lock().unwrap().as_deref() == Some(key)
    }

    fn shared(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap()
    }

    /// Satisfy a new track from the cache if possible. Returns true when the
    /// buffer now holds the cached summary.
    fn publish_from_cache(&self, key: &str) -> bool {
        let mut shared = self.shared.lock().unwrap();
        let shared = &mut *shared;
        let Some(cache) = shared.cache.as_mut() else {
            return false;
        };
        match cache.read_into(key, shared.buffer.cells_mut()) {
            Ok(info) => {
                shared.buffer.set_layout(info.channels, info.len);
                true
            }
            Err(CacheError::NotFound) => false,
            Err(e) => {
                // a record too large for the buffer or an I/O hiccup both
                // fall back to recomputation
                log::warn!("cache read for {key:?} failed: {e}");
                false
            }
        }
    }

    /// The detached body of one summarization job. Separated from the spawn
    /// so tests can drive it synchronously.
    fn summarize_worker(&self, track: Track, key: TrackKey) {
        let result = self.run_summary(&track, &key);
        if let Err(e) = result {
            log::warn!("summarization of {} failed: {e}", track.uri);
        }
        self.inflight.end(&key);
    }

    fn run_summary(
        &self,
        track: &Track,
        key: &TrackKey,
    ) -> Result<(), summarizer::SummarizeError> {
        let (bucket_bound, cache_enabled) = {
            let config = self.config.lock().unwrap();
            (config.bucket_bound(), config.cache_enabled)
        };

        let mut decoder = self.decoders.open(track)?;
        let mut progress = |channels: usize, cells: &[i16]| {
            // partials are advisory: skip the publish when the listener has
            // already moved on, but keep decoding for the cache
            if self.is_active(key) {
                self.shared().buffer.publish(channels, cells);
            }
        };
        let summary = summarizer::summarize(
            track,
            key.clone(),
            decoder.as_mut(),
            bucket_bound,
            &mut progress,
        )?;

        let mut shared = self.shared();
        if cache_enabled {
            if let Some(cache) = shared.cache.as_mut() {
                if let Err(e) = cache.write(key, summary.channel_count, summary.cells()) {
                    log::warn!("persisting summary for {key:?} failed: {e}");
                }
            }
        }
        if self.is_active(key) {
            shared
                .buffer
                .publish(summary.channel_count, summary.cells());
        }
        Ok(())
    }
}

impl PlaybackEvents for Arc<WaveformEngine> {
    fn track_started(&self, track: &Track) {
        *self.status.lock().unwrap() = PlaybackStatus::Playing;

        let key = match identity::resolve(track, &track.uri) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("cannot resolve a summary key for {:?}: {e}", track.uri);
                return;
            }
        };
        *self.active_key.lock().unwrap() = Some(key.clone());

        let config = self.config.lock().unwrap().clone();
        if !summarizer::supported_track(track, &config) {
            self.shared().buffer.clear();
            return;
        }

        if config.cache_enabled && self.publish_from_cache(&key) {
            log::debug!("cache hit for {key:?}");
            return;
        }

        // the old track's summary must not linger while the new one computes
        self.shared().buffer.clear();

        if !self.inflight.try_begin(&key) {
            log::debug!("summarization of {key:?} already underway");
            return;
        }
        let engine = Arc::clone(self);
        let track = track.clone();
        rayon::spawn(move || engine.summarize_worker(track, key));
    }

    fn track_stopped(&self) {
        *self.status.lock().unwrap() = PlaybackStatus::Stopped;
        *self.active_key.lock().unwrap() = None;
        self.shared().buffer.clear();
    }

    fn paused(&self, paused: bool) {
        *self.status.lock().unwrap() = if paused {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Playing
        };
    }

    fn config_changed(&self, config: AppConfig) {
        *self.config.lock().unwrap() = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::decode::{DecodeError, Decoder};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct ConstDecoder {
        frames_left: u64,
        gate: Option<Arc<AtomicBool>>,
    }

    impl Decoder for ConstDecoder {
        fn channels(&self) -> usize {
            1
        }

        fn sample_rate(&self) -> u32 {
            1000
        }

        fn total_frames(&self) -> u64 {
            self.frames_left
        }

        fn read_chunk(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<usize, DecodeError> {
            if let Some(gate) = &self.gate {
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            out.clear();
            let n = (frames as u64).min(self.frames_left) as usize;
            out.resize(n, 0.5);
            self.frames_left -= n as u64;
            Ok(n)
        }
    }

    /// Counts opens so tests can tell recomputation from a cache hit. With a
    /// gate installed, decoding blocks until the gate opens.
    struct CountingFactory {
        opens: AtomicUsize,
        gate: Option<Arc<AtomicBool>>,
    }

    impl CountingFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated(gate: Arc<AtomicBool>) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                gate: Some(gate),
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl DecoderFactory for CountingFactory {
        fn open(&self, track: &Track) -> Result<Box<dyn Decoder>, DecodeError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ConstDecoder {
                frames_left: (track.duration_secs * 1000.0) as u64,
                gate: self.gate.clone(),
            }))
        }
    }

    fn engine_in(dir: &TempDir, factory: Arc<CountingFactory>) -> Arc<WaveformEngine> {
        let config = AppConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..AppConfig::default()
        };
        WaveformEngine::new(config, factory).unwrap()
    }

    fn wait_for_idle(engine: &WaveformEngine) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !engine.inflight.is_empty() {
            assert!(Instant::now() < deadline, "worker never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn started_track_gets_summarized_and_published() {
        let dir = TempDir::new().unwrap();
        let factory = CountingFactory::new();
        let engine = engine_in(&dir, Arc::clone(&factory));

        let track = Track::local_file("/music/a.wav", 10.0);
        engine.track_started(&track);
        wait_for_idle(&engine);

        assert_eq!(engine.status(), PlaybackStatus::Playing);
        engine.with_summary(|buf| {
            assert!(!buf.is_empty());
            assert_eq!(buf.channels(), 1);
            // a 0.5 constant signal summarizes to (500, 500, 500)
            assert!(buf.cells().iter().all(|&c| c == 500));
        });
        assert_eq!(factory.opens(), 1);
    }

    #[test]
    fn second_start_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let factory = CountingFactory::new();
        let engine = engine_in(&dir, Arc::clone(&factory));

        let track = Track::local_file("/music/a.wav", 10.0);
        engine.track_started(&track);
        wait_for_idle(&engine);
        engine.track_stopped();
        engine.with_summary(|buf| assert!(buf.is_empty()));

        engine.track_started(&track);
        wait_for_idle(&engine);
        assert_eq!(factory.opens(), 1, "cache hit must not reopen the decoder");
        engine.with_summary(|buf| {
            assert!(!buf.is_empty());
            assert!(buf.cells().iter().all(|&c| c == 500));
        });
    }

    #[test]
    fn duplicate_starts_spawn_at_most_one_worker() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(AtomicBool::new(false));
        let factory = CountingFactory::gated(Arc::clone(&gate));
        let engine = engine_in(&dir, Arc::clone(&factory));

        // the first worker blocks inside the decoder, so the repeat starts
        // all land while the key is demonstrably in flight
        let track = Track::local_file("/music/a.wav", 30.0);
        for _ in 0..8 {
            engine.track_started(&track);
        }
        gate.store(true, Ordering::SeqCst);
        wait_for_idle(&engine);

        assert_eq!(factory.opens(), 1);
        let key = identity::resolve(&track, &track.uri).unwrap();
        let mut shared = engine.shared();
        assert!(shared.cache.as_mut().unwrap().exists(&key));
    }

    #[test]
    fn oversized_cache_record_falls_back_to_recompute() {
        let dir = TempDir::new().unwrap();
        let factory = CountingFactory::new();
        let engine = engine_in(&dir, Arc::clone(&factory));

        let track = Track::local_file("/music/a.wav", 5.0);
        let key = identity::resolve(&track, &track.uri).unwrap();
        {
            let mut shared = engine.shared();
            let cache = shared.cache.as_mut().unwrap();
            let too_big = vec![7i16; crate::buffer::BUFFER_CAPACITY + 3];
            cache.write(&key, 1, &too_big).unwrap();
        }

        engine.track_started(&track);
        wait_for_idle(&engine);

        // the unusable record is a miss, not an error: recompute and replace
        assert_eq!(factory.opens(), 1);
        engine.with_summary(|buf| {
            assert!(!buf.is_empty());
            assert!(buf.cells().iter().all(|&c| c == 500));
        });
    }

    #[test]
    fn stale_worker_persists_but_does_not_publish() {
        let dir = TempDir::new().unwrap();
        let factory = CountingFactory::new();
        let engine = engine_in(&dir, Arc::clone(&factory));

        let old = Track::local_file("/music/old.wav", 5.0);
        let key = identity::resolve(&old, &old.uri).unwrap();
        // the listener has already moved on before the worker runs
        *engine.active_key.lock().unwrap() = Some("other-key".to_owned());
        assert!(engine.inflight.try_begin(&key));
        engine.summarize_worker(old, key.clone());

        engine.with_summary(|buf| assert!(buf.is_empty()));
        let mut shared = engine.shared();
        assert!(shared.cache.as_mut().unwrap().exists(&key));
    }

    #[test]
    fn unsupported_track_clears_and_skips() {
        let dir = TempDir::new().unwrap();
        let factory = CountingFactory::new();
        let engine = engine_in(&dir, Arc::clone(&factory));

        engine.track_started(&Track::local_file("/music/a.wav", 5.0));
        wait_for_idle(&engine);
        engine.with_summary(|buf| assert!(!buf.is_empty()));

        let mut stream = Track::local_file("http://radio.example/live", 5.0);
        stream.is_local = false;
        engine.track_started(&stream);
        wait_for_idle(&engine);

        assert_eq!(factory.opens(), 1);
        engine.with_summary(|buf| assert!(buf.is_empty()));
    }

    #[test]
    fn stop_clears_the_buffer_and_pause_tracks_status() {
        let dir = TempDir::new().unwrap();
        let factory = CountingFactory::new();
        let engine = engine_in(&dir, Arc::clone(&factory));

        engine.track_started(&Track::local_file("/music/a.wav", 5.0));
        wait_for_idle(&engine);

        engine.paused(true);
        assert_eq!(engine.status(), PlaybackStatus::Paused);
        engine.paused(false);
        assert_eq!(engine.status(), PlaybackStatus::Playing);

        engine.track_stopped();
        assert_eq!(engine.status(), PlaybackStatus::Stopped);
        engine.with_summary(|buf| {
            assert!(buf.is_empty());
            assert_eq!(buf.channels(), 0);
        });
    }

    #[test]
    fn remove_cached_deletes_the_record() {
        let dir = TempDir::new().unwrap();
        let factory = CountingFactory::new();
        let engine = engine_in(&dir, Arc::clone(&factory));

        let track = Track::local_file("/music/a.wav", 5.0);
        engine.track_started(&track);
        wait_for_idle(&engine);

        assert!(engine.remove_cached(&track).unwrap());
        assert!(!engine.remove_cached(&track).unwrap());

        // a fresh start recomputes now that the record is gone
        engine.track_stopped();
        engine.track_started(&track);
        wait_for_idle(&engine);
        assert_eq!(factory.opens(), 2);
    }

    #[test]
    fn shutdown_closes_the_cache_but_events_still_work() {
        let dir = TempDir::new().unwrap();
        let factory = CountingFactory::new();
        let engine = engine_in(&dir, Arc::clone(&factory));

        let track = Track::local_file("/music/a.wav", 5.0);
        engine.track_started(&track);
        wait_for_idle(&engine);
        engine.shutdown().unwrap();

        engine.track_started(&track);
        wait_for_idle(&engine);
        engine.with_summary(|buf| assert!(!buf.is_empty()));
        engine.track_stopped();
    }
}
