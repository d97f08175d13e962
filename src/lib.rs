pub mod cache;
pub mod crypto;
mod driver;
pub mod error;
mod ewf;
mod image;
mod raw;
pub mod segments;
mod volume;

pub use cache::LruCache;
pub use crypto::{BlockDecryptor, EncryptionScheme, derive_xts128_keys};
pub use driver::ImageDriver;
pub use error::{ImageError, Result};
pub use image::{CHUNK_LEN, CacheMode, DEFAULT_CACHE_CAPACITY, Image, OpenOptions};
pub use segments::{NamingScheme, find_segment_files};
pub use volume::VolumeReader;
