//! Stable cache identity for tracks.
//!
//! Two references to the same audio must yield the same key; perceptually
//! distinct audio must never collide. Sub-tracks of a container file share a
//! URI, so their ordinal is folded into the key.

use crate::track::Track;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("track has an empty URI")]
    EmptyUri,
}

/// Opaque cache key derived from a track's location.
pub type TrackKey = String;

/// Derive the cache key for a track. Pure; no I/O, no shared state.
pub fn resolve(track: &Track, raw_uri: &str) -> Result<TrackKey, IdentityError> {
    if raw_uri.is_empty() {
        return Err(IdentityError::EmptyUri);
    }
    match track.subtrack {
        Some(ordinal) => Ok(format!("{ordinal}{raw_uri}")),
        None => Ok(raw_uri.to_owned()),
    }
}
