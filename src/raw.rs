//! Raw single- and multi-segment image driver.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::driver::ImageDriver;
use crate::error::{ImageError, Result};

#[derive(Debug)]
struct Segment {
    path: PathBuf,
    // seek + read is not atomic, so each handle gets its own lock; this is
    // the driver-level lock, distinct from the image's cache lock
    file: Mutex<File>,
    start: u64,
    len: u64,
}

/// Driver for raw images: one file, or an ordered set of segment files
/// concatenated into a single logical address space.
#[derive(Debug)]
pub struct RawDriver {
    segments: Vec<Segment>,
    // (logical start, segment index) of non-empty segments, for lookup
    table: Vec<(u64, usize)>,
    size: u64,
    sector_size: u32,
}

impl RawDriver {
    /// Opens every segment eagerly and records cumulative start offsets.
    ///
    /// `paths` must already be in segment order (discovery or an explicit
    /// caller-supplied list).
    pub fn open(paths: &[PathBuf], sector_size: u32) -> Result<Self> {
        if paths.is_empty() {
            return Err(ImageError::Argument("no segment paths given".into()));
        }

        let mut segments = Vec::with_capacity(paths.len());
        let mut size = 0u64;
        for path in paths {
            let mut file = File::open(path).map_err(|e| {
                ImageError::DriverIo(format!("cannot open segment \"{}\": {e}", path.display()))
            })?;

            #[cfg(target_os = "linux")]
            {
                use rustix::fs::{Advice, fadvise};
                let _ = fadvise(&file, 0, None, Advice::Random);
            }

            let len = segment_len(&mut file, path)?;
            let start = size;
            size = size.checked_add(len).ok_or_else(|| {
                ImageError::DriverIo(format!(
                    "segment sizes overflow at \"{}\"",
                    path.display()
                ))
            })?;
            debug!(segment = %path.display(), len, "raw segment opened");
            segments.push(Segment {
                path: path.clone(),
                file: Mutex::new(file),
                start,
                len,
            });
        }

        let table = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.len > 0)
            .map(|(i, s)| (s.start, i))
            .collect();

        Ok(Self {
            segments,
            table,
            size,
            sector_size,
        })
    }
}

/// Block devices report a zero metadata length; fall back to seeking.
fn segment_len(file: &mut File, path: &Path) -> Result<u64> {
    let metadata = file.metadata().map_err(|e| {
        ImageError::DriverIo(format!("cannot stat \"{}\": {e}", path.display()))
    })?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(len)
}

fn read_err(path: &Path, offset: u64, e: &std::io::Error) -> ImageError {
    ImageError::DriverIo(format!(
        "raw read of \"{}\" at offset {offset}: {e}",
        path.display()
    ))
}

impl ImageDriver for RawDriver {
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
        let mut done = 0usize;
        while done < want {
            let pos = offset + done as u64;
            let ti = self.table.partition_point(|&(start, _)| start <= pos) - 1;
            let segment = &self.segments[self.table[ti].1];
            let rel = pos - segment.start;
            let take = ((segment.len - rel) as usize).min(want - done);

            let mut file = segment.file.lock();
            file.seek(SeekFrom::Start(rel))
                .map_err(|e| read_err(&segment.path, pos, &e))?;
            file.read_exact(&mut buf[done..done + take])
                .map_err(|e| read_err(&segment.path, pos, &e))?;
            done += take;
        }
        Ok(want)
    }

    fn describe(&self) -> String {
        if self.segments.len() == 1 {
            format!("raw image \"{}\"", self.segments[0].path.display())
        } else {
            format!("split raw image ({} segments)", self.segments.len())
        }
    }
}
