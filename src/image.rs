//! Image session object: open-time driver selection and the validated
//! read entry point with its cached and direct strategies.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::info;

use crate::cache::LruCache;
use crate::crypto::BlockDecryptor;
use crate::driver::{self, Driver, DriverKind, ImageDriver};
use crate::error::{ImageError, Result};
use crate::ewf::EwfDriver;
use crate::raw::RawDriver;
use crate::segments;

/// Caching unit over the logical address space.
pub const CHUNK_LEN: usize = 64 * 1024;
/// Default number of resident chunks (2 MiB of cache with 64 KiB chunks).
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Read strategy, fixed per image at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Whole-chunk LRU caching (the default).
    Chunked { capacity: usize },
    /// No caching; short requests are rounded up to sector multiples
    /// because many drivers mishandle sub-sector reads.
    Direct,
}

/// Options for [`Image::open`].
pub struct OpenOptions {
    /// Sector size hint for raw images; must be a positive multiple of
    /// 512. Container drivers report their own and ignore the hint.
    pub sector_size: Option<u32>,
    pub cache: CacheMode,
    /// Volume decryption state, handed over at open and owned by the image.
    pub encryption: Option<BlockDecryptor>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            sector_size: None,
            cache: CacheMode::Chunked {
                capacity: DEFAULT_CACHE_CAPACITY,
            },
            encryption: None,
        }
    }
}

/// An open disk image: one logically contiguous, randomly addressable
/// byte stream over whatever physical layout backs it.
///
/// The image exclusively owns its driver, chunk cache, and decryption
/// state; everything is released together when it is dropped or
/// [`close`](Image::close)d. Reads are safe from multiple threads.
#[derive(Debug)]
pub struct Image {
    driver: Driver,
    cache: Option<Mutex<LruCache<u64, Vec<u8>>>>,
    encryption: Option<BlockDecryptor>,
    segments: Vec<PathBuf>,
    size: u64,
    sector_size: u32,
}

impl Image {
    /// Opens the image starting at `first`, discovering further raw
    /// segments by naming convention (EWF sets glob their own extensions).
    pub fn open(first: impl AsRef<Path>, options: OpenOptions) -> Result<Image> {
        let first = first.as_ref();
        let sector_size = resolve_sector_size(options.sector_size)?;
        let (driver, segments) = match driver::sniff(first)? {
            DriverKind::Raw => {
                let segments = segments::find_segment_files(first)?;
                (
                    Driver::Raw(RawDriver::open(&segments, sector_size)?),
                    segments,
                )
            }
            DriverKind::Ewf => {
                let driver = EwfDriver::open(std::slice::from_ref(&first.to_path_buf()))?;
                let segments = driver.paths().to_vec();
                (Driver::Ewf(driver), segments)
            }
        };
        Self::assemble(driver, segments, options)
    }

    /// Opens an explicit, pre-ordered segment list with no discovery.
    pub fn open_segments(paths: &[PathBuf], options: OpenOptions) -> Result<Image> {
        let first = paths
            .first()
            .ok_or_else(|| ImageError::Argument("no segment paths given".into()))?;
        let sector_size = resolve_sector_size(options.sector_size)?;
        let driver = match driver::sniff(first)? {
            DriverKind::Raw => Driver::Raw(RawDriver::open(paths, sector_size)?),
            DriverKind::Ewf => Driver::Ewf(EwfDriver::open(paths)?),
        };
        Self::assemble(driver, paths.to_vec(), options)
    }

    #[cfg(test)]
    pub(crate) fn with_driver(driver: Driver, options: OpenOptions) -> Result<Image> {
        Self::assemble(driver, Vec::new(), options)
    }

    fn assemble(driver: Driver, segments: Vec<PathBuf>, options: OpenOptions) -> Result<Image> {
        let cache = match options.cache {
            CacheMode::Chunked { capacity } => {
                if capacity == 0 {
                    return Err(ImageError::Argument(
                        "chunk cache capacity must be nonzero".into(),
                    ));
                }
                Some(Mutex::new(LruCache::new(capacity)))
            }
            CacheMode::Direct => None,
        };
        let image = Image {
            size: driver.size(),
            sector_size: driver.sector_size(),
            driver,
            cache,
            encryption: options.encryption,
            segments,
        };
        info!(
            image = %image.driver.describe(),
            size = image.size,
            segments = image.segments.len(),
            "image opened"
        );
        Ok(image)
    }

    /// Reads up to `buf.len()` bytes starting at logical `offset`.
    ///
    /// Returns exactly `min(buf.len(), size - offset)` bytes; a short
    /// count only ever means the read ran into the end of the image.
    /// Everything else is an error, never a partial success.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(ImageError::Argument("empty destination buffer".into()));
        }
        if offset >= self.size {
            return Err(ImageError::OffsetBeyondImage {
                offset,
                size: self.size,
            });
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= i64::MAX as u64)
            .ok_or_else(|| {
                ImageError::Argument(format!(
                    "offset {offset} plus length {} overflows",
                    buf.len()
                ))
            })?;
        let end = end.min(self.size);

        match &self.cache {
            Some(cache) => self.read_chunked(cache, offset, end, buf),
            None => self.read_direct(offset, end, buf),
        }
    }

    /// Cached strategy: service the covering chunk range out of the LRU,
    /// filling whole driver-sourced chunks on miss. The cache never holds
    /// a partial chunk, and its lock is never held across driver I/O.
    fn read_chunked(
        &self,
        cache: &Mutex<LruCache<u64, Vec<u8>>>,
        offset: u64,
        end: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let total = (end - offset) as usize;
        let chunk_len = CHUNK_LEN as u64;
        let mut chunk_off = offset - offset % chunk_len;
        while chunk_off < end {
            let copy_from = chunk_off.max(offset);
            let copy_to = (chunk_off + chunk_len).min(end);
            let within = (copy_from - chunk_off) as usize;
            let dst = &mut buf[(copy_from - offset) as usize..(copy_to - offset) as usize];

            let recycled = {
                let mut cache = cache.lock();
                if let Some(chunk) = cache.get(&chunk_off) {
                    dst.copy_from_slice(&chunk[within..within + dst.len()]);
                    chunk_off += chunk_len;
                    continue;
                }
                if cache.len() == cache.capacity() {
                    cache.pop_lru().map(|(_, chunk)| chunk)
                } else {
                    None
                }
            };
            let mut chunk = match recycled {
                Some(chunk) => chunk,
                None => alloc_buf(CHUNK_LEN)?,
            };

            let want = chunk_len.min(self.size - chunk_off) as usize;
            let n = self.driver.read_at(chunk_off, &mut chunk[..want])?;
            if n != want {
                return Err(ImageError::DriverIo(format!(
                    "driver returned {n} of {want} bytes for the chunk at offset {chunk_off}"
                )));
            }
            chunk[want..].fill(0); // tail padding past the image end

            dst.copy_from_slice(&chunk[within..within + dst.len()]);
            // two threads may race to fill the same chunk; driver reads
            // are deterministic, so the second insert is idempotent
            cache.lock().put(chunk_off, chunk);
            chunk_off += chunk_len;
        }
        Ok(total)
    }

    /// Direct strategy: pass reads through, rounding sub-sector lengths up
    /// through a scratch buffer.
    fn read_direct(&self, offset: u64, end: u64, buf: &mut [u8]) -> Result<usize> {
        let total = (end - offset) as usize;
        let sector = self.sector_size as usize;
        if total % sector == 0 {
            let n = self.driver.read_at(offset, &mut buf[..total])?;
            if n != total {
                return Err(short_read(n, total, offset));
            }
            return Ok(total);
        }

        let padded = ((total / sector + 1) * sector) as u64;
        let want = padded.min(self.size - offset) as usize;
        let mut scratch = alloc_buf(want)?;
        let n = self.driver.read_at(offset, &mut scratch)?;
        if n != want {
            return Err(short_read(n, want, offset));
        }
        buf[..total].copy_from_slice(&scratch[..total]);
        Ok(total)
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Ordered physical segment paths backing this image.
    pub fn segment_paths(&self) -> &[PathBuf] {
        &self.segments
    }

    pub fn encryption(&self) -> Option<&BlockDecryptor> {
        self.encryption.as_ref()
    }

    pub fn describe(&self) -> String {
        let mut text = format!(
            "{}, {} bytes, {}-byte sectors",
            self.driver.describe(),
            self.size,
            self.sector_size
        );
        if self.cache.is_none() {
            text.push_str(", uncached");
        }
        if self.encryption.is_some() {
            text.push_str(", encrypted");
        }
        text
    }

    /// Releases the driver, cache, and decryption state together.
    pub fn close(self) {
        info!(image = %self.driver.describe(), "image closed");
    }
}

fn resolve_sector_size(hint: Option<u32>) -> Result<u32> {
    match hint {
        None => Ok(DEFAULT_SECTOR_SIZE),
        Some(s) if s > 0 && s % 512 == 0 => Ok(s),
        Some(s) => Err(ImageError::Argument(format!(
            "sector size {s} is not a positive multiple of 512"
        ))),
    }
}

fn short_read(n: usize, want: usize, offset: u64) -> ImageError {
    ImageError::DriverIo(format!(
        "driver returned {n} of {want} bytes at offset {offset}"
    ))
}

/// Fallible buffer allocation: a huge scratch request fails the call,
/// not the process.
pub(crate) fn alloc_buf(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ImageError::Allocation { bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}
