//! Volume-encryption primitives: XTS block decryption and key derivation.

use std::fmt;

use aes::cipher::KeyInit;
use aes::cipher::generic_array::GenericArray;
use aes::{Aes128, Aes256};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use xts_mode::{Xts128, get_tweak_default};

use crate::error::{ImageError, Result};

/// Supported full-volume encryption schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionScheme {
    XtsAes128,
    XtsAes256,
}

impl EncryptionScheme {
    /// Length in bytes of each of the two XTS keys.
    pub fn key_len(self) -> usize {
        match self {
            EncryptionScheme::XtsAes128 => 16,
            EncryptionScheme::XtsAes256 => 32,
        }
    }
}

enum Cipher {
    Aes128(Xts128<Aes128>),
    Aes256(Xts128<Aes256>),
}

/// Decrypts whole volume blocks in place.
///
/// The XTS tweak is keyed by the block index, not a byte offset, so the
/// transform is only defined over aligned whole blocks; callers hand in
/// the index of the first block alongside the data.
pub struct BlockDecryptor {
    cipher: Cipher,
    scheme: EncryptionScheme,
    block_size: u32,
}

// key material stays out of logs
impl fmt::Debug for BlockDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDecryptor")
            .field("scheme", &self.scheme)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl BlockDecryptor {
    /// Builds a decryptor from raw key halves.
    ///
    /// Key lengths must match the scheme (16 + 16 or 32 + 32 bytes) and
    /// `block_size` must be a positive multiple of the 16-byte cipher
    /// block.
    pub fn from_keys(
        scheme: EncryptionScheme,
        data_key: &[u8],
        tweak_key: &[u8],
        block_size: u32,
    ) -> Result<Self> {
        let want = scheme.key_len();
        if data_key.len() != want || tweak_key.len() != want {
            return Err(ImageError::Decryption(format!(
                "{scheme:?} takes two {want}-byte keys, got {} and {}",
                data_key.len(),
                tweak_key.len()
            )));
        }
        if block_size == 0 || block_size % 16 != 0 {
            return Err(ImageError::Decryption(format!(
                "block size {block_size} is not a positive multiple of the cipher block"
            )));
        }
        let cipher = match scheme {
            EncryptionScheme::XtsAes128 => Cipher::Aes128(Xts128::new(
                Aes128::new(GenericArray::from_slice(data_key)),
                Aes128::new(GenericArray::from_slice(tweak_key)),
            )),
            EncryptionScheme::XtsAes256 => Cipher::Aes256(Xts128::new(
                Aes256::new(GenericArray::from_slice(data_key)),
                Aes256::new(GenericArray::from_slice(tweak_key)),
            )),
        };
        Ok(Self {
            cipher,
            scheme,
            block_size,
        })
    }

    /// Builds a decryptor from hex-encoded key halves, as carried in case
    /// configuration and key-escrow exports.
    pub fn from_hex_keys(
        scheme: EncryptionScheme,
        data_key: &str,
        tweak_key: &str,
        block_size: u32,
    ) -> Result<Self> {
        let data = hex::decode(data_key.trim())
            .map_err(|e| ImageError::Decryption(format!("data key: {e}")))?;
        let tweak = hex::decode(tweak_key.trim())
            .map_err(|e| ImageError::Decryption(format!("tweak key: {e}")))?;
        Self::from_keys(scheme, &data, &tweak, block_size)
    }

    #[inline]
    pub fn scheme(&self) -> EncryptionScheme {
        self.scheme
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Decrypts `buf` in place, starting at block index `first_block`.
    ///
    /// `buf` must hold a whole number of blocks.
    pub fn decrypt_blocks(&self, first_block: u64, buf: &mut [u8]) -> Result<()> {
        let block = self.block_size as usize;
        if buf.is_empty() || buf.len() % block != 0 {
            return Err(ImageError::Decryption(format!(
                "length {} is not a whole number of {block}-byte blocks",
                buf.len()
            )));
        }
        match &self.cipher {
            Cipher::Aes128(xts) => {
                xts.decrypt_area(buf, block, first_block as u128, get_tweak_default)
            }
            Cipher::Aes256(xts) => {
                xts.decrypt_area(buf, block, first_block as u128, get_tweak_default)
            }
        }
        Ok(())
    }
}

/// Expands a shared secret and a 16-byte per-volume seed into an
/// XTS-AES-128 key pair via HMAC-SHA256.
///
/// Returns `(data_key, tweak_key)`.
pub fn derive_xts128_keys(secret: &[u8], seed: &[u8; 16]) -> Result<([u8; 16], [u8; 16])> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret)
        .map_err(|_| ImageError::Decryption("unusable derivation secret".into()))?;
    mac.update(&[0x01, 0x00, 0x00, 0x00]);
    mac.update(seed);
    let digest = mac.finalize().into_bytes();

    let mut tweak_key = [0u8; 16];
    let mut data_key = [0u8; 16];
    tweak_key.copy_from_slice(&digest[..16]);
    data_key.copy_from_slice(&digest[16..]);
    Ok((data_key, tweak_key))
}
