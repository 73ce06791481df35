pub mod buffer;
pub mod cache;
pub mod config;
pub mod engine;
pub mod identity;
pub mod inflight;
pub mod precompute;
pub mod summarizer;
pub mod track;

/// Audio file extensions we can decode natively
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav", "flac"];

/// Application name for XDG paths
pub const APP_NAME: &str = "seekwave";

/// Cells per bucket: min, max, RMS
pub const VALUES_PER_BUCKET: usize = 3;

/// Most channels a summary may carry; the shared buffer is sized for this
pub const MAX_CHANNELS: usize = 6;

/// Worst-case bucket capacity of the shared buffer
pub const MAX_BUCKETS: usize = 4096;

/// Configurable per-channel bucket bound is clamped to this range
pub const BUCKET_BOUND_MIN: usize = 2048;
pub const BUCKET_BOUND_MAX: usize = 4092;

/// Amplitude 1.0 maps to this fixed-point value
pub const FIXED_POINT_SCALE: f32 = 1000.0;
