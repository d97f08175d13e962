//! Expert Witness Format (EWF / E01) container driver.
//!
//! Implements the read/size contract over single- and multi-segment E01
//! sets: signature-validated segment headers, section-descriptor walks,
//! volume geometry, and chunk tables with zlib-compressed chunks.
//! Acquisition metadata beyond the volume geometry is not interpreted.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use parking_lot::Mutex;
use tracing::debug;

use crate::driver::ImageDriver;
use crate::error::{ImageError, Result};
use crate::image::alloc_buf;

/// 8-byte signature opening every E01 segment file: `EVF\x09\x0d\x0a\xff\x00`.
pub(crate) const EWF_SIGNATURE: [u8; 8] = [0x45, 0x56, 0x46, 0x09, 0x0d, 0x0a, 0xff, 0x00];

const HEADER_LEN: u64 = 13;
const DESCRIPTOR_LEN: u64 = 76;
const COMPRESSED_FLAG: u32 = 0x8000_0000;

/// A corrupt volume section must not drive huge allocations.
const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
const MAX_TABLE_ENTRIES: u32 = 1 << 20;

fn corrupt(path: &Path, detail: &str) -> ImageError {
    ImageError::DriverIo(format!("ewf \"{}\": {detail}", path.display()))
}

fn le32(raw: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&raw[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le64(raw: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(b)
}

#[derive(Debug)]
struct EwfChunk {
    segment: usize,
    /// Absolute offset of the stored chunk data within its segment file.
    offset: u64,
    /// One past the stored data; bounds the zlib stream of a compressed chunk.
    end: u64,
    compressed: bool,
}

struct Volume {
    chunk_count: u32,
    sectors_per_chunk: u32,
    bytes_per_sector: u32,
    sector_count: u32,
}

/// Driver for EnCase/EWF evidence containers.
#[derive(Debug)]
pub struct EwfDriver {
    // seek-based handles are not reentrant, so every read serializes here;
    // this lock is independent of the image-level cache lock
    files: Mutex<Vec<File>>,
    paths: Vec<PathBuf>,
    chunks: Vec<EwfChunk>,
    chunk_size: usize,
    sector_size: u32,
    size: u64,
}

impl EwfDriver {
    /// Opens an EWF segment set.
    ///
    /// A single path is expanded through the EWF extension convention
    /// (`.E01 → .E02 … .E99 → .EAA …`); multiple paths are taken as the
    /// complete ordered set.
    pub fn open(paths: &[PathBuf]) -> Result<Self> {
        let first = paths
            .first()
            .ok_or_else(|| ImageError::Argument("no segment paths given".into()))?;
        let paths = if paths.len() == 1 {
            find_segments(first)
        } else {
            paths.to_vec()
        };

        let mut files = Vec::with_capacity(paths.len());
        let mut chunks = Vec::new();
        let mut volume: Option<Volume> = None;
        for (seg_idx, path) in paths.iter().enumerate() {
            let mut file = File::open(path).map_err(|e| {
                ImageError::DriverIo(format!("cannot open segment \"{}\": {e}", path.display()))
            })?;
            parse_segment(&mut file, seg_idx, path, &mut volume, &mut chunks)?;
            files.push(file);
        }

        let volume = volume.ok_or_else(|| corrupt(&paths[0], "no volume section"))?;
        let chunk_size = volume.sectors_per_chunk as u64 * volume.bytes_per_sector as u64;
        if volume.bytes_per_sector == 0 || chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(corrupt(
                &paths[0],
                &format!(
                    "implausible geometry: {} sectors of {} bytes per chunk",
                    volume.sectors_per_chunk, volume.bytes_per_sector
                ),
            ));
        }
        let size = volume.sector_count as u64 * volume.bytes_per_sector as u64;
        let needed = size.div_ceil(chunk_size);
        if (chunks.len() as u64) < needed {
            return Err(corrupt(
                &paths[0],
                &format!(
                    "tables describe {} chunks, geometry needs {needed}",
                    chunks.len()
                ),
            ));
        }
        if volume.chunk_count != 0 && (chunks.len() as u64) < volume.chunk_count as u64 {
            return Err(corrupt(
                &paths[0],
                &format!(
                    "tables describe {} of {} declared chunks",
                    chunks.len(),
                    volume.chunk_count
                ),
            ));
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let stored = chunk.end.saturating_sub(chunk.offset);
            if stored == 0 || stored > MAX_CHUNK_SIZE {
                return Err(corrupt(
                    &paths[chunk.segment],
                    &format!("chunk {i} has implausible stored size {stored}"),
                ));
            }
        }
        debug!(
            segments = paths.len(),
            chunks = chunks.len(),
            chunk_size,
            size,
            "ewf image opened"
        );

        Ok(Self {
            files: Mutex::new(files),
            paths,
            chunks,
            chunk_size: chunk_size as usize,
            sector_size: volume.bytes_per_sector,
            size,
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Reads and, when needed, inflates one stored chunk.
    fn read_chunk(&self, files: &mut [File], index: usize) -> Result<Vec<u8>> {
        let chunk = &self.chunks[index];
        let path = &self.paths[chunk.segment];
        let file = &mut files[chunk.segment];
        let stored = (chunk.end - chunk.offset) as usize;

        file.seek(SeekFrom::Start(chunk.offset))
            .map_err(|e| corrupt(path, &format!("seek to chunk {index}: {e}")))?;

        if !chunk.compressed {
            let mut data = alloc_buf(stored.min(self.chunk_size))?;
            file.read_exact(&mut data)
                .map_err(|e| corrupt(path, &format!("chunk {index}: {e}")))?;
            return Ok(data);
        }

        let mut packed = alloc_buf(stored)?;
        file.read_exact(&mut packed)
            .map_err(|e| corrupt(path, &format!("chunk {index}: {e}")))?;

        let mut data = Vec::new();
        data.try_reserve_exact(self.chunk_size)
            .map_err(|_| ImageError::Allocation {
                bytes: self.chunk_size,
            })?;
        // bound the inflated size; a chunk that blows past the declared
        // geometry is corrupt, not a bigger read
        let mut decoder = ZlibDecoder::new(&packed[..]).take(self.chunk_size as u64 + 1);
        decoder
            .read_to_end(&mut data)
            .map_err(|e| corrupt(path, &format!("chunk {index} inflate: {e}")))?;
        if data.len() > self.chunk_size {
            return Err(corrupt(
                path,
                &format!("chunk {index} inflates past the chunk size"),
            ));
        }
        Ok(data)
    }
}

impl ImageDriver for EwfDriver {
    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Err(ImageError::OffsetBeyondImage {
                offset,
                size: self.size,
            });
        }

        let want = (self.size - offset).min(buf.len() as u64) as usize;
        let mut files = self.files.lock();
        let mut done = 0usize;
        while done < want {
            let pos = offset + done as u64;
            let index = (pos / self.chunk_size as u64) as usize;
            if index >= self.chunks.len() {
                return Err(corrupt(
                    &self.paths[0],
                    &format!("no chunk covers offset {pos}"),
                ));
            }
            let within = (pos % self.chunk_size as u64) as usize;
            let data = self.read_chunk(&mut files, index)?;
            if within >= data.len() {
                return Err(corrupt(
                    &self.paths[self.chunks[index].segment],
                    &format!("chunk {index} is shorter than its declared span"),
                ));
            }
            let take = (data.len() - within).min(want - done);
            buf[done..done + take].copy_from_slice(&data[within..within + take]);
            done += take;
        }
        Ok(want)
    }

    fn describe(&self) -> String {
        format!(
            "ewf image ({} segments, {}-byte chunks)",
            self.paths.len(),
            self.chunk_size
        )
    }
}

fn parse_segment(
    file: &mut File,
    seg_idx: usize,
    path: &Path,
    volume: &mut Option<Volume>,
    chunks: &mut Vec<EwfChunk>,
) -> Result<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header)
        .map_err(|e| corrupt(path, &format!("segment header: {e}")))?;
    if header[..8] != EWF_SIGNATURE {
        return Err(corrupt(path, "bad signature"));
    }
    if header[8] != 1 || header[11] != 0 || header[12] != 0 {
        return Err(corrupt(path, "bad header fields"));
    }
    let segment_number = u16::from_le_bytes([header[9], header[10]]);
    if segment_number as usize != seg_idx + 1 {
        return Err(corrupt(
            path,
            &format!("segment number {segment_number} out of order"),
        ));
    }

    let first_chunk = chunks.len();
    let mut end_of_sectors: Option<u64> = None;
    let mut offset = HEADER_LEN;
    loop {
        let (kind, next, size) = read_descriptor(file, offset, path)?;
        match kind.as_str() {
            "disk" | "volume" => {
                *volume = Some(read_volume(file, offset + DESCRIPTOR_LEN, path)?);
            }
            "table" => read_table(file, offset + DESCRIPTOR_LEN, seg_idx, path, chunks)?,
            "sectors" => {
                let end = offset
                    .checked_add(size)
                    .ok_or_else(|| corrupt(path, "sectors section overflows"))?;
                end_of_sectors = Some(end);
            }
            _ => {}
        }
        if kind == "done" || next == offset {
            break;
        }
        if next < offset || next - offset < DESCRIPTOR_LEN {
            return Err(corrupt(path, "section chain goes backwards"));
        }
        offset = next;
    }

    // Resolve the stored span of each chunk this segment contributed: a
    // chunk ends where the next one starts, the last at the end of the
    // sectors section.
    if chunks.len() > first_chunk {
        let end_of_sectors = end_of_sectors
            .ok_or_else(|| corrupt(path, "chunk table without a sectors section"))?;
        for i in first_chunk..chunks.len() {
            let end = if i + 1 < chunks.len() {
                chunks[i + 1].offset
            } else {
                end_of_sectors
            };
            if end <= chunks[i].offset {
                return Err(corrupt(path, &format!("chunk {i} table entry out of order")));
            }
            chunks[i].end = end;
        }
    }
    Ok(())
}

fn read_descriptor(file: &mut File, offset: u64, path: &Path) -> Result<(String, u64, u64)> {
    let mut raw = [0u8; DESCRIPTOR_LEN as usize];
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| corrupt(path, &format!("seek to section at {offset}: {e}")))?;
    file.read_exact(&mut raw)
        .map_err(|e| corrupt(path, &format!("section descriptor at {offset}: {e}")))?;
    let kind: String = raw[..16]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    Ok((kind, le64(&raw, 16), le64(&raw, 24)))
}

fn read_volume(file: &mut File, offset: u64, path: &Path) -> Result<Volume> {
    let mut raw = [0u8; 20];
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| corrupt(path, &format!("seek to volume section: {e}")))?;
    file.read_exact(&mut raw)
        .map_err(|e| corrupt(path, &format!("volume section: {e}")))?;
    Ok(Volume {
        chunk_count: le32(&raw, 4),
        sectors_per_chunk: le32(&raw, 8),
        bytes_per_sector: le32(&raw, 12),
        sector_count: le32(&raw, 16),
    })
}

fn read_table(
    file: &mut File,
    offset: u64,
    seg_idx: usize,
    path: &Path,
    chunks: &mut Vec<EwfChunk>,
) -> Result<()> {
    let mut head = [0u8; 24];
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| corrupt(path, &format!("seek to table section: {e}")))?;
    file.read_exact(&mut head)
        .map_err(|e| corrupt(path, &format!("table section: {e}")))?;
    let entry_count = le32(&head, 0);
    let base = le64(&head, 8);
    if entry_count == 0 {
        return Ok(());
    }
    if entry_count > MAX_TABLE_ENTRIES {
        return Err(corrupt(
            path,
            &format!("table claims {entry_count} entries"),
        ));
    }

    let mut entries = alloc_buf(entry_count as usize * 4)?;
    file.read_exact(&mut entries)
        .map_err(|e| corrupt(path, &format!("table entries: {e}")))?;
    for i in 0..entry_count as usize {
        let entry = le32(&entries, i * 4);
        let data_offset = base
            .checked_add((entry & !COMPRESSED_FLAG) as u64)
            .ok_or_else(|| corrupt(path, "table entry offset overflows"))?;
        chunks.push(EwfChunk {
            segment: seg_idx,
            offset: data_offset,
            end: 0,
            compressed: entry & COMPRESSED_FLAG != 0,
        });
    }
    Ok(())
}

/// Expands the first segment's path through the EWF extension convention:
/// `.E01 … .E99`, then letter pairs `.EAA … .EZZ`, carrying into the first
/// character up to `.ZZZ`. Case is preserved.
fn find_segments(first: &Path) -> Vec<PathBuf> {
    let mut found = vec![first.to_path_buf()];
    let Some(name) = first.to_str() else {
        return found;
    };
    if name.len() < 3 || !name.is_char_boundary(name.len() - 3) {
        return found;
    }
    let (prefix, ext) = name.split_at(name.len() - 3);
    let ext = ext.as_bytes();
    if !ext[0].is_ascii_alphabetic() || !ext[1].is_ascii_digit() || !ext[2].is_ascii_digit() {
        return found;
    }

    let mut suffix = [ext[0], ext[1], ext[2]];
    while let Some(next) = next_suffix(suffix) {
        suffix = next;
        let text: String = suffix.iter().map(|&b| b as char).collect();
        let candidate = PathBuf::from(format!("{prefix}{text}"));
        if !candidate.exists() {
            break;
        }
        debug!(segment = %candidate.display(), "ewf segment found");
        found.push(candidate);
    }
    found
}

fn next_suffix(mut s: [u8; 3]) -> Option<[u8; 3]> {
    let (a, z) = if s[0].is_ascii_uppercase() {
        (b'A', b'Z')
    } else {
        (b'a', b'z')
    };

    if s[1].is_ascii_digit() {
        let n = (s[1] - b'0') * 10 + (s[2] - b'0');
        if n < 99 {
            let n = n + 1;
            s[1] = b'0' + n / 10;
            s[2] = b'0' + n % 10;
        } else {
            // E99 rolls over to EAA
            s[1] = a;
            s[2] = a;
        }
        return Some(s);
    }

    if s[2] < z {
        s[2] += 1;
        return Some(s);
    }
    s[2] = a;
    if s[1] < z {
        s[1] += 1;
        return Some(s);
    }
    s[1] = a;
    if s[0] < z {
        s[0] += 1;
        return Some(s);
    }
    None
}
