//! Streaming pull interface over external decoders.
//!
//! The summarizer only ever sees interleaved f32 frames; converting from the
//! decoder's native sample format happens here. WAV goes through hound,
//! FLAC through claxon. Anything else is an unsupported format, which the
//! caller treats as terminal for that one summarization.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use thiserror::Error;

use crate::track::Track;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("WAV decode error: {0}")]
    Wav(#[from] hound::Error),
    #[error("FLAC decode error: {0}")]
    Flac(#[from] claxon::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoder opened for one track. Chunks come back as interleaved f32 in
/// [-1.0, 1.0]; a short or zero read signals end of stream.
pub trait Decoder: Send {
    fn channels(&self) -> usize;
    fn sample_rate(&self) -> u32;
    /// Frames per channel the stream declares, 0 if unknown.
    fn total_frames(&self) -> u64;
    /// Read up to `frames` frames into `out` (cleared first). Returns frames
    /// actually produced.
    fn read_chunk(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<usize, DecodeError>;
}

/// Opens decoders for tracks. The engine holds one of these; tests inject
/// synthetic implementations.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, track: &Track) -> Result<Box<dyn Decoder>, DecodeError>;
}

/// Production factory: dispatch on file extension.
pub struct FileDecoderFactory;

impl DecoderFactory for FileDecoderFactory {
    fn open(&self, track: &Track) -> Result<Box<dyn Decoder>, DecodeError> {
        let path = Path::new(&track.uri);
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "wav" => Ok(Box::new(WavDecoder::open(path)?)),
            "flac" => Ok(Box::new(FlacDecoder::open(path)?)),
            _ => Err(DecodeError::UnsupportedFormat(ext)),
        }
    }
}

enum WavSamples {
    Int { norm: f32 },
    Float,
}

struct WavDecoder {
    reader: hound::WavReader<BufReader<File>>,
    kind: WavSamples,
    channels: usize,
    sample_rate: u32,
    total_frames: u64,
}

impl WavDecoder {
    fn open(path: &Path) -> Result<Self, DecodeError> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let kind = match spec.sample_format {
            hound::SampleFormat::Float => WavSamples::Float,
            hound::SampleFormat::Int => WavSamples::Int {
                norm: (1i64 << (spec.bits_per_sample - 1)) as f32,
            },
        };
        let total_frames = reader.duration() as u64;
        Ok(Self {
            kind,
            channels: spec.channels as usize,
            sample_rate: spec.sample_rate,
            total_frames,
            reader,
        })
    }
}

impl Decoder for WavDecoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn read_chunk(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<usize, DecodeError> {
        out.clear();
        let want = frames * self.channels;
        match self.kind {
            WavSamples::Float => {
                for sample in self.reader.samples::<f32>().take(want) {
                    out.push(sample?);
                }
            }
            WavSamples::Int { norm } => {
                for sample in self.reader.samples::<i32>().take(want) {
                    out.push(sample? as f32 / norm);
                }
            }
        }
        // drop a ragged trailing frame rather than hand out half a frame
        out.truncate(out.len() - out.len() % self.channels);
        Ok(out.len() / self.channels)
    }
}

struct FlacDecoder {
    reader: claxon::FlacReader<BufReader<File>>,
    norm: f32,
    channels: usize,
    sample_rate: u32,
    total_frames: u64,
}

impl FlacDecoder {
    fn open(path: &Path) -> Result<Self, DecodeError> {
        let reader = claxon::FlacReader::new(BufReader::new(File::open(path)?))?;
        let info = reader.streaminfo();
        Ok(Self {
            norm: (1i64 << (info.bits_per_sample - 1)) as f32,
            channels: info.channels as usize,
            sample_rate: info.sample_rate,
            total_frames: info.samples.unwrap_or(0),
            reader,
        })
    }
}

impl Decoder for FlacDecoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn read_chunk(&mut self, frames: usize, out: &mut Vec<f32>) -> Result<usize, DecodeError> {
        out.clear();
        let want = frames * self.channels;
        for sample in self.reader.samples().take(want) {
            out.push(sample? as f32 / self.norm);
        }
        out.truncate(out.len() - out.len() % self.channels);
        Ok(out.len() / self.channels)
    }
}
