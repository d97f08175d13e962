//! File-system-layer reads over an open image: block addressing, in-place
//! volume decryption, per-block framing, and partial-image bounds.

use crate::error::{ImageError, Result};
use crate::image::{Image, alloc_buf};

/// Reads file-system data from a volume inside an [`Image`].
///
/// Offsets are relative to the volume start. When the image carries
/// encryption state, reads are transparently decrypted: the transform is
/// defined only over whole blocks, so aligned block-multiple requests
/// decrypt straight into the caller's buffer and anything else goes
/// through an aligned scratch span.
pub struct VolumeReader<'a> {
    image: &'a Image,
    offset: u64,
    block_size: u32,
    block_pre: u32,
    block_post: u32,
    total_blocks: Option<u64>,
    captured_blocks: Option<u64>,
}

impl<'a> VolumeReader<'a> {
    /// Wraps `image` starting at byte `offset`, reading `block_size`-byte
    /// blocks.
    ///
    /// If the image is encrypted, `block_size` must equal the decryption
    /// granularity recorded at open time.
    pub fn new(image: &'a Image, offset: u64, block_size: u32) -> Result<Self> {
        if block_size == 0 {
            return Err(ImageError::Argument("block size must be nonzero".into()));
        }
        if let Some(decryptor) = image.encryption() {
            if decryptor.block_size() != block_size {
                return Err(ImageError::Decryption(format!(
                    "volume block size {block_size} does not match the decryption granularity {}",
                    decryptor.block_size()
                )));
            }
        }
        Ok(Self {
            image,
            offset,
            block_size,
            block_pre: 0,
            block_post: 0,
            total_blocks: None,
            captured_blocks: None,
        })
    }

    /// Per-block leading/trailing framing bytes (raw CD style), skipped on
    /// every block read.
    pub fn with_padding(mut self, pre: u32, post: u32) -> Self {
        self.block_pre = pre;
        self.block_post = post;
        self
    }

    /// Declares the volume's block count from file-system metadata.
    ///
    /// Reads past the prefix actually present in the image then fail with
    /// a partial-image error, distinct from reads past the declared end.
    pub fn with_block_count(mut self, total: u64) -> Self {
        let per = self.block_size as u64 + self.block_pre as u64 + self.block_post as u64;
        let span = self.image.size().saturating_sub(self.offset);
        self.total_blocks = Some(total);
        self.captured_blocks = Some((span / per).min(total));
        self
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads `buf.len()` bytes at byte offset `off` within the volume.
    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(ImageError::Argument("empty destination buffer".into()));
        }
        self.check_bounds(off)?;

        if self.image.encryption().is_some() {
            let block = self.block_size as u64;
            if off % block == 0 && buf.len() as u64 % block == 0 {
                return self.read_block_decrypt(off / block, buf, off / block);
            }

            // widen to the enclosing block span, decrypt in scratch, then
            // hand back the requested sub-range
            let start = off - off % block;
            let end = off
                .checked_add(buf.len() as u64)
                .and_then(|e| e.checked_add(block - 1))
                .map(|e| e / block * block)
                .ok_or_else(|| {
                    ImageError::Argument(format!(
                        "offset {off} plus length {} overflows",
                        buf.len()
                    ))
                })?;
            let mut scratch = alloc_buf((end - start) as usize)?;
            self.read_block_decrypt(start / block, &mut scratch, start / block)?;
            let from = (off - start) as usize;
            buf.copy_from_slice(&scratch[from..from + buf.len()]);
            return Ok(buf.len());
        }

        if self.block_pre != 0 || self.block_post != 0 {
            return self.read_padded(off, buf);
        }
        let pos = self.position(off, 0)?;
        self.image.read(pos, buf)
    }

    /// Reads whole blocks starting at block address `addr`.
    pub fn read_block(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        self.read_block_decrypt(addr, buf, addr)
    }

    /// Reads whole blocks, decrypting with `crypto_id` as the starting
    /// tweak index.
    ///
    /// Logical-volume schemes key the transform by an index that can
    /// differ from the physical block address; plain volumes pass
    /// `crypto_id == addr` (see [`read_block`](Self::read_block)).
    pub fn read_block_decrypt(&self, addr: u64, buf: &mut [u8], crypto_id: u64) -> Result<usize> {
        let block = self.block_size as u64;
        if buf.is_empty() || buf.len() as u64 % block != 0 {
            return Err(ImageError::Argument(format!(
                "length {} is not a multiple of the {block}-byte block size",
                buf.len()
            )));
        }
        let off = addr.checked_mul(block).ok_or_else(|| {
            ImageError::Argument(format!("block address {addr} overflows"))
        })?;
        self.check_bounds(off)?;

        if self.block_pre != 0 || self.block_post != 0 {
            self.read_padded(off, buf)?;
        } else {
            let pos = self.position(off, 0)?;
            let n = self.image.read(pos, buf)?;
            if n != buf.len() {
                return Err(ImageError::DriverIo(format!(
                    "short read of block {addr}: {n} of {} bytes",
                    buf.len()
                )));
            }
        }

        if let Some(decryptor) = self.image.encryption() {
            decryptor.decrypt_blocks(crypto_id, buf)?;
        }
        Ok(buf.len())
    }

    /// Block-by-block read skipping the per-block framing bytes.
    fn read_padded(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        let block = self.block_size as u64;
        let end = off.checked_add(buf.len() as u64).ok_or_else(|| {
            ImageError::Argument(format!("offset {off} plus length {} overflows", buf.len()))
        })?;

        let mut cur = off;
        let mut filled = 0usize;
        while cur < end {
            let index = cur / block;
            let within = cur % block;
            let take = ((block - within).min(end - cur)) as usize;
            let pos = self.position(cur, index)?;
            let n = self.image.read(pos, &mut buf[filled..filled + take])?;
            if n != take {
                return Err(ImageError::DriverIo(format!(
                    "short read in framed block {index}: {n} of {take} bytes"
                )));
            }
            filled += n;
            cur += n as u64;
        }
        Ok(buf.len())
    }

    /// Maps a volume byte offset to an image position, accounting for the
    /// framing bytes of every block up to and including `block_index`.
    fn position(&self, off: u64, block_index: u64) -> Result<u64> {
        let framing = self.block_pre as u64 + self.block_post as u64;
        block_index
            .checked_mul(framing)
            .and_then(|skip| skip.checked_add(self.block_pre as u64))
            .and_then(|skip| skip.checked_add(off))
            .and_then(|rel| rel.checked_add(self.offset))
            .ok_or_else(|| {
                ImageError::Argument(format!("volume offset {off} overflows the image range"))
            })
    }

    /// Distinguishes reads past the captured prefix of a partial image
    /// from reads past the declared volume end.
    fn check_bounds(&self, off: u64) -> Result<()> {
        let (Some(total), Some(captured)) = (self.total_blocks, self.captured_blocks) else {
            return Ok(());
        };
        let block = self.block_size as u64;
        if off >= captured.saturating_mul(block) {
            if off < total.saturating_mul(block) {
                return Err(ImageError::OffsetInPartialImage {
                    offset: off,
                    captured,
                    total,
                });
            }
            return Err(ImageError::OffsetBeyondImage {
                offset: off,
                size: total.saturating_mul(block),
            });
        }
        Ok(())
    }
}
