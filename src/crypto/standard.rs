//! MS-OFFCRYPTO "Standard" encryption: binary `EncryptionInfo` body, SHA-1 key
//! derivation, AES-ECB bulk decryption.

use super::{aes_ecb_decrypt, CipherAlgo};
use crate::error::{Error, Result};
use crate::util::{password_to_utf16le, rdu32le, umin};
use sha1::{Digest, Sha1};
use std::io::Read;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const SPIN_COUNT: u32 = 50_000;

/// CSP names MS-OFFCRYPTO Standard encryption is known to actually produce.
const CSP_NAME_ALLOWLIST: &[&str] = &[
    "Microsoft Enhanced RSA and AES Cryptographic Provider",
    "Microsoft Enhanced RSA and AES Cryptographic Provider (Prototype)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlgId {
    Aes128,
    Aes192,
    Aes256,
}

impl AlgId {
    /// `alg_id == 0` means "implied by `key_bits`" rather than naming an explicit AES
    /// width; the caller resolves that case via `CipherAlgo::from_key_bits` instead.
    fn from_u32(v: u32) -> Result<Option<Self>> {
        match v {
            0 => Ok(None),
            0x660e => Ok(Some(Self::Aes128)),
            0x660f => Ok(Some(Self::Aes192)),
            0x6610 => Ok(Some(Self::Aes256)),
            other => Err(Error::InvalidCipher(other)),
        }
    }

    fn cipher(self) -> CipherAlgo {
        match self {
            Self::Aes128 => CipherAlgo::Aes128,
            Self::Aes192 => CipherAlgo::Aes192,
            Self::Aes256 => CipherAlgo::Aes256,
        }
    }
}

/// A parsed Standard-scheme `EncryptionInfo` body, ready for key derivation.
pub struct StandardEncryptionInfo {
    algo: CipherAlgo,
    key_bytes: usize,
    salt: [u8; 16],
    verifier_hash_input: [u8; 16],
    verifier_hash_value: [u8; 32],
}

impl StandardEncryptionInfo {
    pub(crate) fn parse(mut body: &[u8]) -> Result<Self> {
        let header_length = rdu32le(&mut body)? as usize;
        if header_length < 32 || header_length > body.len() {
            return Err(Error::BadEncryptionInfo(format!(
                "invalid EncryptionHeader length {header_length}"
            )));
        }
        let (mut header, mut rest) = body.split_at(header_length);

        let _flags = rdu32le(&mut header)?;
        let size_extra = rdu32le(&mut header)?;
        if size_extra != 0 {
            return Err(Error::BadEncryptionInfo(
                "EncryptionHeader SizeExtra must be 0".into(),
            ));
        }
        let alg_id = rdu32le(&mut header)?;
        let alg_id_hash = rdu32le(&mut header)?;
        if alg_id_hash != 0 && alg_id_hash != 0x8004 {
            return Err(Error::InvalidHash(alg_id_hash));
        }
        let key_bits = rdu32le(&mut header)?;
        let provider_type = rdu32le(&mut header)?;
        if provider_type != 0 && provider_type != 0x18 {
            return Err(Error::InvalidProviderType(provider_type));
        }
        let _reserved1 = rdu32le(&mut header)?;
        let reserved2 = rdu32le(&mut header)?;
        if reserved2 != 0 {
            return Err(Error::BadEncryptionInfo(
                "EncryptionHeader Reserved2 must be 0".into(),
            ));
        }
        let csp_name = crate::util::decode_utf16le_nul_terminated(header);
        if !CSP_NAME_ALLOWLIST.contains(&csp_name.as_str()) {
            return Err(Error::InvalidCsp(csp_name));
        }
        tracing::debug!(csp_name, "Standard encryption CSP name");

        let cipher = match AlgId::from_u32(alg_id)? {
            Some(alg) => alg.cipher(),
            None => CipherAlgo::from_key_bits(key_bits)?,
        };
        let key_bytes = (key_bits / 8) as usize;
        if key_bytes != cipher.key_bytes() {
            return Err(Error::BadEncryptionInfo(format!(
                "key_bits {key_bits} does not match alg_id {alg_id:#x}"
            )));
        }

        let salt_size = rdu32le(&mut rest)?;
        if salt_size != 16 {
            return Err(Error::BadEncryptionInfo(format!(
                "Standard salt size must be 16, got {salt_size}"
            )));
        }
        let mut salt = [0u8; 16];
        rest.read_exact(&mut salt)?;
        let mut verifier_hash_input = [0u8; 16];
        rest.read_exact(&mut verifier_hash_input)?;
        let verifier_hash_size = rdu32le(&mut rest)?;
        if verifier_hash_size != 20 {
            return Err(Error::BadEncryptionInfo(format!(
                "Standard verifier hash size must be 20, got {verifier_hash_size}"
            )));
        }
        let mut verifier_hash_value = [0u8; 32];
        rest.read_exact(&mut verifier_hash_value)?;

        Ok(Self {
            algo: cipher,
            key_bytes,
            salt,
            verifier_hash_input,
            verifier_hash_value,
        })
    }

    /// Derives the bulk encryption key from `password` and checks it against the
    /// verifier pair. Returns the derived key, zeroized on drop, or `BadPassword`.
    pub fn derive_and_verify_key(&self, password: &str) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.derive_key(password);

        let candidate_verifier = aes_ecb_decrypt(self.algo, &key, &self.verifier_hash_input)?;
        let candidate_hash = aes_ecb_decrypt(self.algo, &key, &self.verifier_hash_value)?;
        let calculated = Sha1::digest(&candidate_verifier);

        if calculated.as_slice().ct_eq(&candidate_hash[0..20]).unwrap_u8() != 1 {
            return Err(Error::BadPassword);
        }
        Ok(key)
    }

    fn derive_key(&self, password: &str) -> Zeroizing<Vec<u8>> {
        let password_bytes = password_to_utf16le(password);

        let mut hasher = Sha1::new();
        hasher.update(self.salt);
        hasher.update(&password_bytes);
        let mut h: Zeroizing<Vec<u8>> = Zeroizing::new(hasher.finalize().to_vec());

        for i in 0..SPIN_COUNT {
            let mut hasher = Sha1::new();
            hasher.update(i.to_le_bytes());
            hasher.update(&*h);
            h = Zeroizing::new(hasher.finalize().to_vec());
        }
        let mut hasher = Sha1::new();
        hasher.update(&*h);
        hasher.update(0u32.to_le_bytes());
        let h_final = Zeroizing::new(hasher.finalize().to_vec());

        let x1 = hmac_pad_hash(&h_final, 0x36);
        let x2 = hmac_pad_hash(&h_final, 0x5c);

        let mut key = Vec::with_capacity(x1.len() + x2.len());
        key.extend_from_slice(&x1);
        key.extend_from_slice(&x2);
        key.truncate(self.key_bytes);
        Zeroizing::new(key)
    }

    /// AES-ECB decrypts the `EncryptedPackage` stream and truncates to its declared
    /// plaintext length.
    pub fn decrypt(&self, key: &[u8], mut encrypted_package: &[u8]) -> Result<Vec<u8>> {
        if encrypted_package.len() < 8 {
            return Err(Error::TruncatedCiphertext);
        }
        let plaintext_size = crate::util::rdu64le(&mut encrypted_package)?;
        let ciphertext = encrypted_package;
        let mut plaintext = aes_ecb_decrypt(self.algo, key, ciphertext)?;
        let truncated_len = umin(plaintext.len(), plaintext_size);
        plaintext.truncate(truncated_len);
        Ok(plaintext)
    }
}

/// `SHA1(pad64(fill) XOR digest)`, used to build the final derived key from the two
/// halves of the HMAC-like construction MS-OFFCRYPTO's Standard scheme uses.
fn hmac_pad_hash(digest: &[u8], fill: u8) -> [u8; 20] {
    let mut buf = [fill; 64];
    for (b, d) in buf.iter_mut().zip(digest.iter()) {
        *b ^= *d;
    }
    Sha1::digest(buf).into()
}
