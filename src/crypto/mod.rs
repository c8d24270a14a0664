//! MS-OFFCRYPTO encryption metadata parsing and decryption.
//!
//! [`EncryptionInfo`] is produced by reading the first bytes of the `EncryptionInfo`
//! stream and dispatches to either the [`standard`] or [`agile`] scheme, mirroring how
//! MS-OFFCRYPTO readers pick a decoder before even knowing the rest of the stream layout.

pub mod agile;
pub mod standard;

use crate::error::{Error, Result};
use crate::util::rdu32le;
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use cbc::cipher::block_padding::NoPadding;
use std::io::Read;

/// Which AES variant a descriptor selected, keyed by its declared key length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgo {
    Aes128,
    Aes192,
    Aes256,
}

impl CipherAlgo {
    pub fn from_key_bits(bits: u32) -> Result<Self> {
        match bits {
            128 => Ok(Self::Aes128),
            192 => Ok(Self::Aes192),
            256 => Ok(Self::Aes256),
            other => Err(Error::InvalidCipher(other)),
        }
    }

    pub fn key_bytes(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }
}

/// AES-ECB decrypt of `ciphertext` with `key` (no padding removal: the caller truncates
/// to the logical plaintext size it already knows from the descriptor or the
/// `EncryptedPackage` size prefix).
pub fn aes_ecb_decrypt(algo: CipherAlgo, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % 16 != 0 {
        return Err(Error::TruncatedCiphertext);
    }
    let mut out = ciphertext.to_vec();
    let blocks = out.chunks_exact_mut(16);
    match algo {
        CipherAlgo::Aes128 => {
            let cipher = aes::Aes128Dec::new_from_slice(key).map_err(|e| Error::Crypto(e.to_string()))?;
            for block in blocks {
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
            }
        }
        CipherAlgo::Aes192 => {
            let cipher = aes::Aes192Dec::new_from_slice(key).map_err(|e| Error::Crypto(e.to_string()))?;
            for block in blocks {
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
            }
        }
        CipherAlgo::Aes256 => {
            let cipher = aes::Aes256Dec::new_from_slice(key).map_err(|e| Error::Crypto(e.to_string()))?;
            for block in blocks {
                cipher.decrypt_block(GenericArray::from_mut_slice(block));
            }
        }
    }
    Ok(out)
}

/// AES-CBC decrypt (no padding) of `ciphertext` with `key`/`iv`, both exactly
/// block-sized inputs as required by the Agile scheme.
pub fn aes_cbc_decrypt(algo: CipherAlgo, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % 16 != 0 {
        return Err(Error::TruncatedCiphertext);
    }
    let mut out = ciphertext.to_vec();
    macro_rules! decrypt_with {
        ($dec:ty) => {{
            let cipher =
                <$dec>::new_from_slices(key, iv).map_err(|e| Error::Crypto(e.to_string()))?;
            cipher
                .decrypt_padded_mut::<NoPadding>(&mut out)
                .map_err(|e| Error::Crypto(e.to_string()))?;
        }};
    }
    match algo {
        CipherAlgo::Aes128 => decrypt_with!(cbc::Decryptor<aes::Aes128>),
        CipherAlgo::Aes192 => decrypt_with!(cbc::Decryptor<aes::Aes192>),
        CipherAlgo::Aes256 => decrypt_with!(cbc::Decryptor<aes::Aes256>),
    }
    Ok(out)
}

/// The two recognized MS-OFFCRYPTO metadata schemes.
pub enum EncryptionInfo {
    Standard(standard::StandardEncryptionInfo),
    Agile(agile::AgileEncryptionInfo),
}

impl EncryptionInfo {
    /// Reads the 8-byte version/flags prefix of the `EncryptionInfo` stream and
    /// dispatches to the matching scheme parser.
    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        let major = rdu16(&mut bytes)?;
        let minor = rdu16(&mut bytes)?;
        let flags = rdu32le(&mut bytes)?;

        match (major, minor) {
            (4, 4) => {
                if flags != 0x40 {
                    return Err(Error::BadHeader(format!(
                        "Agile EncryptionInfo flags must be 0x40, got {flags:#x}"
                    )));
                }
                Ok(Self::Agile(agile::AgileEncryptionInfo::parse(bytes)?))
            }
            (3, 3) | (4, 3) => Err(Error::UnsupportedExtensibleEncryption),
            (major, 2) if (2..=4).contains(&major) => {
                validate_standard_flags(flags)?;
                Ok(Self::Standard(standard::StandardEncryptionInfo::parse(
                    bytes,
                )?))
            }
            (major, minor) => Err(Error::UnsupportedVersion { major, minor }),
        }
    }
}

fn rdu16<R: Read>(r: &mut R) -> Result<u16> {
    crate::util::rdu16le(r).map_err(Error::Io)
}

fn validate_standard_flags(flags: u32) -> Result<()> {
    const RESERVED_MASK: u32 = 0b11;
    const CRYPTO_API: u32 = 1 << 2;
    const EXTERNAL: u32 = 1 << 4;
    const AES: u32 = 1 << 5;

    if flags & RESERVED_MASK != 0 {
        return Err(Error::BadHeader(format!(
            "reserved flag bits set in Standard EncryptionInfo: {flags:#x}"
        )));
    }
    if flags & EXTERNAL != 0 || flags & CRYPTO_API == 0 {
        return Err(Error::UnsupportedExtensibleEncryption);
    }
    if flags & AES == 0 {
        return Err(Error::NotOoxml);
    }
    Ok(())
}
