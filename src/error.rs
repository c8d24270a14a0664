//! Classified error type for the decryption pipeline.

use thiserror::Error;

/// Everything that can go wrong while decrypting an OOXML container.
///
/// Variants are grouped by the layer that raises them: container parsing,
/// `EncryptionInfo` header dispatch, Standard/Agile descriptor validation,
/// and the key-derivation/verification/decryption steps themselves.
#[derive(Error, Debug)]
pub enum Error {
    #[error("input buffer is empty")]
    EmptyInput,

    #[error("not a compound file: {0}")]
    NotCompoundFile(String),

    #[error("missing required stream: {0}")]
    MissingStream(&'static str),

    #[error("malformed encryption header: {0}")]
    BadHeader(String),

    #[error("unsupported EncryptionInfo version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Extensible Encryption is recognized but not implemented")]
    UnsupportedExtensibleEncryption,

    #[error("document is not AES/OOXML encrypted (legacy RC4 binary document encryption?)")]
    NotOoxml,

    #[error("unsupported or invalid cipher algorithm id: {0:#x}")]
    InvalidCipher(u32),

    #[error("unsupported or invalid hash algorithm id: {0:#x}")]
    InvalidHash(u32),

    #[error("unsupported or invalid CSP provider type: {0:#x}")]
    InvalidProviderType(u32),

    #[error("unrecognized cryptographic service provider name: {0:?}")]
    InvalidCsp(String),

    #[error("malformed EncryptionInfo body: {0}")]
    BadEncryptionInfo(String),

    #[error("unsupported encryption feature: {0}")]
    Unsupported(String),

    #[error("no password-based key encryptor present")]
    NoPasswordKey,

    #[error("password does not match (verifier check failed)")]
    BadPassword,

    #[error("data integrity (HMAC) check failed")]
    IntegrityCheckFailed,

    #[error("cryptographic primitive failure: {0}")]
    Crypto(String),

    #[error("ciphertext is truncated or misaligned to the cipher block size")]
    TruncatedCiphertext,

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
