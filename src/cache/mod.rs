//! Disk-backed summary cache.
//!
//! One append-capable keyed binary file per cache directory. Records are
//! appended and an in-memory key index (rebuilt by scanning at open) always
//! points at the newest complete record for a key, so a reader observes
//! either the old record or the new one, never a mix. Overwritten and
//! deleted records become dead bytes that compaction reclaims.
//!
//! Layout, little endian:
//!   header:  magic "SKWV", format version u16
//!   record:  flags u8 (1 live, 0 tombstone), key_len u16, key bytes,
//!            channels u8, payload_len u32 (i16 cells), payload
//!
//! Corruption is never fatal on the read path: a record that fails to parse
//! is reported as a miss so the caller recomputes, and a broken tail is
//! truncated at open.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::MAX_CHANNELS;

const MAGIC: &[u8; 4] = b"SKWV";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: u64 = 6;

const FLAG_TOMBSTONE: u8 = 0;
const FLAG_LIVE: u8 = 1;

/// Cache file name inside the cache directory.
pub const STORE_FILE: &str = "waveforms.db";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no cached summary for key")]
    NotFound,
    #[error("destination holds {capacity} cells but the record needs {needed}")]
    BufferTooSmall { needed: usize, capacity: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Shape of a record just read into a caller-supplied buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadInfo {
    pub channels: usize,
    /// i16 cells written into the destination.
    pub len: usize,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    size: u64,
}

pub struct SummaryCache {
    path: PathBuf,
    file: File,
    index: HashMap<String, IndexEntry>,
    /// Append position; also the logical end of valid data.
    end: u64,
    dead_bytes: u64,
}

impl SummaryCache {
    /// Open (creating if needed) the store inside `dir`. Called once at
    /// startup; the matching [`close`](Self::close) runs once at shutdown.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN {
            if file_len > 0 {
                log::warn!("cache file {} has a short header, starting fresh", path.display());
            }
            file.set_len(0)?;
            write_header(&mut file)?;
        } else {
            let mut header = [0u8; HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            let version = u16::from_le_bytes([header[4], header[5]]);
            if &header[..4] != MAGIC || version != FORMAT_VERSION {
                log::warn!("cache file {} is not ours or has an unknown version, starting fresh", path.display());
                file.set_len(0)?;
                write_header(&mut file)?;
            }
        }

        let mut cache = Self {
            path,
            file,
            index: HashMap::new(),
            end: HEADER_LEN,
            dead_bytes: 0,
        };
        cache.rebuild_index()?;

        log::debug!(
            "waveform cache open: {} entries, {} bytes ({} dead)",
            cache.index.len(),
            cache.end,
            cache.dead_bytes
        );
        Ok(cache)
    }

    /// Scan all records, keeping the newest live record per key. A torn tail
    /// (crash mid-append) is truncated away.
    fn rebuild_index(&mut self) -> Result<()> {
        self.index.clear();
        self.dead_bytes = 0;

        let file_len = self.file.metadata()?.len();
        self.file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut reader = BufReader::new(&self.file);
        let mut offset = HEADER_LEN;

        while offset < file_len {
            match read_record_meta(&mut reader, file_len - offset).and_then(|meta| {
                // the scan only parses headers; step over the payload
                let payload = meta.payload_cells as u64 * 2;
                let skipped = io::copy(&mut reader.by_ref().take(payload), &mut io::sink())?;
                if skipped < payload {
                    return Err(CacheError::NotFound);
                }
                Ok(meta)
            }) {
                Ok(meta) => {
                    let size = meta.record_size();
                    match meta.flags {
                        FLAG_LIVE => {
                            let entry = IndexEntry { offset, size };
                            if let Some(old) = self.index.insert(meta.key, entry) {
                                self.dead_bytes += old.size;
                            }
                        }
                        _ => {
                            // tombstone: both it and whatever it shadowed are dead
                            if let Some(old) = self.index.remove(&meta.key) {
                                self.dead_bytes += old.size;
                            }
                            self.dead_bytes += size;
                        }
                    }
                    offset += size;
                }
                Err(e) => {
                    log::warn!(
                        "cache file {} truncated at byte {offset} ({e}); dropping the damaged tail",
                        self.path.display()
                    );
                    drop(reader);
                    self.file.set_len(offset)?;
                    break;
                }
            }
        }

        self.end = offset.min(file_len);
        Ok(())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    pub fn file_size(&self) -> u64 {
        self.end
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the summary for `key` into `dest`, failing with `BufferTooSmall`
    /// rather than overflowing it. A record that no longer parses is treated
    /// as a miss so the caller falls back to recomputation.
    pub fn read_into(&mut self, key: &str, dest: &mut [i16]) -> Result<ReadInfo> {
        let entry = *self.index.get(key).ok_or(CacheError::NotFound)?;

        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut reader = BufReader::new(&self.file);
        let meta = match read_record_meta(&mut reader, entry.size) {
            Ok(meta) if meta.flags == FLAG_LIVE && meta.key == key => meta,
            Ok(_) | Err(CacheError::NotFound) => {
                log::warn!("cache record for {key:?} is corrupt, treating as a miss");
                return Err(CacheError::NotFound);
            }
            Err(e) => return Err(e),
        };

        let needed = meta.payload_cells as usize;
        if needed > dest.len() {
            return Err(CacheError::BufferTooSmall {
                needed,
                capacity: dest.len(),
            });
        }

        let mut raw = vec![0u8; needed * 2];
        if let Err(e) = reader.read_exact(&mut raw) {
            log::warn!("cache record for {key:?} is short ({e}), treating as a miss");
            return Err(CacheError::NotFound);
        }
        for (cell, pair) in dest[..needed].iter_mut().zip(raw.chunks_exact(2)) {
            *cell = i16::from_le_bytes([pair[0], pair[1]]);
        }

        Ok(ReadInfo {
            channels: meta.channels as usize,
            len: needed,
        })
    }

    /// Persist a summary, replacing any prior record for the same key. The
    /// index is repointed only after the full record is on disk.
    pub fn write(&mut self, key: &str, channels: usize, cells: &[i16]) -> Result<()> {
        let record = encode_record(FLAG_LIVE, key, channels as u8, cells);
        let offset = self.append(&record)?;
        let entry = IndexEntry {
            offset,
            size: record.len() as u64,
        };
        if let Some(old) = self.index.insert(key.to_owned(), entry) {
            self.dead_bytes += old.size;
        }
        Ok(())
    }

    /// Remove a key. Idempotent: deleting an absent key is a no-op that
    /// returns false.
    pub fn delete(&mut self, key: &str) -> Result<bool> {
        let Some(old) = self.index.remove(key) else {
            return Ok(false);
        };
        let record = encode_record(FLAG_TOMBSTONE, key, 0, &[]);
        self.append(&record)?;
        self.dead_bytes += old.size + record.len() as u64;
        Ok(true)
    }

    fn append(&mut self, record: &[u8]) -> Result<u64> {
        let offset = self.end;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(record)?;
        self.file.flush()?;
        self.end = offset + record.len() as u64;
        Ok(offset)
    }

    /// Rewrite the store with live records only. Writes to a sibling temp
    /// file and renames over the original so a crash leaves a usable store.
    pub fn compact(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("db.tmp");
        let mut entries: Vec<(String, IndexEntry)> = self
            .index
            .iter()
            .map(|(k, e)| (k.clone(), *e))
            .collect();
        // preserve on-disk order so offsets stay monotonic
        entries.sort_by_key(|(_, e)| e.offset);

        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            writer.write_all(MAGIC)?;
            writer.write_all(&FORMAT_VERSION.to_le_bytes())?;

            let mut new_offset = HEADER_LEN;
            let mut new_index = HashMap::with_capacity(entries.len());
            for (key, entry) in &entries {
                let mut record = vec![0u8; entry.size as usize];
                self.file.seek(SeekFrom::Start(entry.offset))?;
                self.file.read_exact(&mut record)?;
                writer.write_all(&record)?;
                new_index.insert(
                    key.clone(),
                    IndexEntry {
                        offset: new_offset,
                        size: entry.size,
                    },
                );
                new_offset += entry.size;
            }
            writer.flush()?;

            fs::rename(&tmp_path, &self.path)?;
            self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            self.index = new_index;
            self.end = new_offset;
            self.dead_bytes = 0;
        }

        log::info!(
            "compacted waveform cache: {} entries, {} bytes",
            self.index.len(),
            self.end
        );
        Ok(())
    }

    /// Shut the store down, compacting first when dead bytes dominate.
    pub fn close(mut self) -> Result<()> {
        let data = self.end.saturating_sub(HEADER_LEN);
        if data > 0 && self.dead_bytes * 2 > data {
            self.compact()?;
        }
        self.file.flush()?;
        Ok(())
    }
}

fn write_header(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(MAGIC)?;
    file.write_all(&FORMAT_VERSION.to_le_bytes())?;
    file.flush()?;
    Ok(())
}

struct RecordMeta {
    flags: u8,
    key: String,
    channels: u8,
    payload_cells: u32,
}

impl RecordMeta {
    fn record_size(&self) -> u64 {
        1 + 2 + self.key.len() as u64 + 1 + 4 + self.payload_cells as u64 * 2
    }
}

/// Parse one record header from `reader`, consuming the payload too when
/// scanning. `remaining` bounds how many bytes may belong to this record;
/// anything inconsistent maps to `NotFound` so callers treat it as damage.
fn read_record_meta<R: Read>(reader: &mut R, remaining: u64) -> Result<RecordMeta> {
    let mut fixed = [0u8; 3];
    reader.read_exact(&mut fixed).map_err(short_read)?;
    let flags = fixed[0];
    if flags != FLAG_LIVE && flags != FLAG_TOMBSTONE {
        return Err(CacheError::NotFound);
    }
    let key_len = u16::from_le_bytes([fixed[1], fixed[2]]) as usize;
    if key_len == 0 || (key_len as u64) + 8 > remaining {
        return Err(CacheError::NotFound);
    }

    let mut key_bytes = vec![0u8; key_len];
    reader.read_exact(&mut key_bytes).map_err(short_read)?;
    let key = String::from_utf8(key_bytes).map_err(|_| CacheError::NotFound)?;

    let mut tail = [0u8; 5];
    reader.read_exact(&mut tail).map_err(short_read)?;
    let channels = tail[0];
    let payload_cells = u32::from_le_bytes([tail[1], tail[2], tail[3], tail[4]]);

    let meta = RecordMeta {
        flags,
        key,
        channels,
        payload_cells,
    };
    if meta.record_size() > remaining {
        return Err(CacheError::NotFound);
    }
    if flags == FLAG_LIVE && (channels == 0 || channels as usize > MAX_CHANNELS) {
        return Err(CacheError::NotFound);
    }
    Ok(meta)
}

/// Unexpected EOF while parsing is damage, not an I/O failure.
fn short_read(e: io::Error) -> CacheError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        CacheError::NotFound
    } else {
        CacheError::Io(e)
    }
}

fn encode_record(flags: u8, key: &str, channels: u8, cells: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 2 + key.len() + 1 + 4 + cells.len() * 2);
    out.push(flags);
    out.extend_from_slice(&(key.len() as u16).to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.push(channels);
    out.extend_from_slice(&(cells.len() as u32).to_le_bytes());
    for cell in cells {
        out.extend_from_slice(&cell.to_le_bytes());
    }
    out
}
