//! The slice of track metadata the summary pipeline needs from the host.

/// A playable item as seen by the waveform pipeline. The host player owns the
/// full metadata; we only carry what identity resolution and the
/// summarization gate look at.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    /// Location of the audio, as the host reports it.
    pub uri: String,
    /// Duration in seconds from the host's metadata; may be zero if unknown.
    pub duration_secs: f64,
    /// Ordinal within a container file (e.g. one cue sheet entry among
    /// several sharing a file), if this track is a logical sub-track.
    pub subtrack: Option<u32>,
    /// Host-reported transport/file type, e.g. "cdda" for disc audio.
    pub filetype: Option<String>,
    /// Whether the URI refers to a local file (streams are never summarized).
    pub is_local: bool,
}

impl Track {
    /// A plain local file with no sub-track structure.
    pub fn local_file(uri: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            uri: uri.into(),
            duration_secs,
            subtrack: None,
            filetype: None,
            is_local: true,
        }
    }
}
