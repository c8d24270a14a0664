//! Small binary-reading helpers shared by the OLE2 and `EncryptionInfo` parsers.

use std::io::{self, Read};

/// Little endian `u16` reader
#[inline]
pub fn rdu16le<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

/// Little endian `u32` reader
#[inline]
pub fn rdu32le<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Little endian `u64` reader
#[inline]
pub fn rdu64le<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Returns the smaller of two values of possibly different unsigned widths, never
/// panicking if the conversion doesn't fit (falls back to `a`, matching the fact that
/// when `b` doesn't fit in `A`'s width it is necessarily larger than `a`).
#[inline]
pub fn umin<A, B>(a: A, b: B) -> A
where
    A: Copy + Ord + TryFrom<B>,
    B: Copy,
{
    match A::try_from(b) {
        Ok(b) => a.min(b),
        Err(_) => a,
    }
}

/// Decode a NUL-terminated UTF-16LE byte string (e.g. a CryptoAPI CSP name).
pub fn decode_utf16le_nul_terminated(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Encode a password to UTF-16LE bytes (no BOM, no terminator), per MS-OFFCRYPTO.
pub fn password_to_utf16le(password: &str) -> Vec<u8> {
    password
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect()
}
