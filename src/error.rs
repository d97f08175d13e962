use std::io;
use thiserror::Error;

/// Errors produced by the image access layer.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("offset {offset} is out of bounds (image size {size})")]
    OffsetBeyondImage { offset: u64, size: u64 },

    #[error("offset {offset} is missing from a partial image ({captured} of {total} blocks captured)")]
    OffsetInPartialImage {
        offset: u64,
        captured: u64,
        total: u64,
    },

    #[error("driver error: {0}")]
    DriverIo(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to allocate {bytes} byte buffer")]
    Allocation { bytes: usize },

    #[error("decryption error: {0}")]
    Decryption(String),
}

pub type Result<T> = std::result::Result<T, ImageError>;
