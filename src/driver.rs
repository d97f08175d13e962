//! Driver capability interface and open-time format selection.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::Result;
use crate::ewf::{self, EwfDriver};
use crate::raw::RawDriver;

/// Capability contract every container-format driver implements.
///
/// Offsets are in the driver's own logical address space. A read either
/// fails or returns the requested bytes; a short count is legal only when
/// the request itself extends past `size()`. Drivers release their
/// resources on drop, which the owning image reaches exactly once.
pub trait ImageDriver {
    fn size(&self) -> u64;

    fn sector_size(&self) -> u32;

    /// Reads into `buf` starting at `offset`, returning the byte count.
    ///
    /// Errors on `offset >= size()`, underlying I/O failure, or container
    /// corruption, with any underlying diagnostic text folded into the
    /// message.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn describe(&self) -> String;
}

/// Closed set of format drivers.
///
/// The variant is selected once at open time by signature sniffing and the
/// dispatch is static for the life of the image; there is no per-process
/// driver registry.
#[derive(Debug)]
pub enum Driver {
    Raw(RawDriver),
    Ewf(EwfDriver),
    #[cfg(test)]
    Mock(mock::MockDriver),
}

impl ImageDriver for Driver {
    fn size(&self) -> u64 {
        match self {
            Driver::Raw(d) => d.size(),
            Driver::Ewf(d) => d.size(),
            #[cfg(test)]
            Driver::Mock(d) => d.size(),
        }
    }

    fn sector_size(&self) -> u32 {
        match self {
            Driver::Raw(d) => d.sector_size(),
            Driver::Ewf(d) => d.sector_size(),
            #[cfg(test)]
            Driver::Mock(d) => d.sector_size(),
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Driver::Raw(d) => d.read_at(offset, buf),
            Driver::Ewf(d) => d.read_at(offset, buf),
            #[cfg(test)]
            Driver::Mock(d) => d.read_at(offset, buf),
        }
    }

    fn describe(&self) -> String {
        match self {
            Driver::Raw(d) => d.describe(),
            Driver::Ewf(d) => d.describe(),
            #[cfg(test)]
            Driver::Mock(d) => d.describe(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverKind {
    Raw,
    Ewf,
}

/// Decides the driver for `path` from its leading magic bytes. Anything
/// without a recognized container signature is treated as raw.
pub(crate) fn sniff(path: &Path) -> Result<DriverKind> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 8];
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    if filled == magic.len() && magic == ewf::EWF_SIGNATURE {
        Ok(DriverKind::Ewf)
    } else {
        Ok(DriverKind::Raw)
    }
}
