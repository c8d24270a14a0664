//! Password-based decryption of MS-OFFCRYPTO *Standard* and *Agile* encrypted OOXML
//! (spreadsheet) containers.
//!
//! An encrypted `.xlsx` is itself an OLE2 Compound File ([MS-CFB]) wrapping two streams:
//! `EncryptionInfo` (metadata describing how the payload was encrypted) and
//! `EncryptedPackage` (the encrypted bytes of the inner ZIP/OOXML package). [`decrypt_xlsx`]
//! is the single entry point most callers need: given the raw container bytes and a UTF-8
//! password, it returns the plaintext ZIP bytes or a classified [`Error`].
//!
//! The lower-level pieces ([`ole::Ole`], [`crypto::EncryptionInfo`]) are public for callers
//! that already hold key material, want to inspect `EncryptionInfo` without decrypting, or
//! want to opt into the Agile `dataIntegrity` HMAC check via
//! [`crypto::agile::AgileEncryptionInfo::verify_data_integrity`].

pub mod crypto;
pub mod error;
mod ole;
mod util;

pub use crypto::EncryptionInfo;
pub use error::{Error, Result};
pub use ole::Ole;

/// Decrypts an encrypted OOXML container with `password`, returning the plaintext bytes of
/// the inner ZIP package.
///
/// This opens `container_bytes` as an OLE2 Compound File, reads the `EncryptionInfo` and
/// `EncryptedPackage` streams, dispatches on the `EncryptionInfo` header to the Standard or
/// Agile scheme, derives the bulk key from `password` and checks it against the scheme's
/// verifier, then decrypts and truncates `EncryptedPackage` to its declared plaintext size.
///
/// Returns `Err(Error::BadPassword)` if `password` does not match; any other error indicates
/// a format or cryptographic problem with `container_bytes` itself and is not recoverable by
/// retrying with a different password.
pub fn decrypt_xlsx(container_bytes: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut ole = Ole::open(container_bytes)?;
    let encryption_info_bytes = ole.read_stream("EncryptionInfo")?;
    let encrypted_package = ole.read_stream("EncryptedPackage")?;

    tracing::debug!(
        encryption_info_len = encryption_info_bytes.len(),
        encrypted_package_len = encrypted_package.len(),
        "read EncryptionInfo/EncryptedPackage streams"
    );

    match EncryptionInfo::parse(&encryption_info_bytes)? {
        EncryptionInfo::Standard(info) => {
            tracing::debug!("dispatching to Standard encryption");
            let key = info.derive_and_verify_key(password)?;
            info.decrypt(&key, &encrypted_package)
        }
        EncryptionInfo::Agile(info) => {
            tracing::debug!("dispatching to Agile encryption");
            let key = info.derive_and_verify_key(password)?;
            info.decrypt(&key, &encrypted_package)
        }
    }
}
