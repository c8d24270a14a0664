//! MS-OFFCRYPTO "Agile" encryption: XML `EncryptionInfo` body, configurable hash,
//! block-key-derived AES-CBC subkeys, segmented bulk decryption.

use super::{aes_cbc_decrypt, CipherAlgo};
use crate::error::{Error, Result};
use crate::util::password_to_utf16le;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{de::Error as _, Deserialize, Deserializer};
use sha1::Sha1;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const SEGMENT_LEN: usize = 4096;

const BLOCK_KEY_VERIFIER_INPUT: [u8; 8] = [0xfe, 0xa7, 0xd2, 0x76, 0x3b, 0x4b, 0x9e, 0x79];
const BLOCK_KEY_VERIFIER_HASH: [u8; 8] = [0xd7, 0xaa, 0x0f, 0x6d, 0x30, 0x61, 0x34, 0x4e];
const BLOCK_KEY_KEY_VALUE: [u8; 8] = [0x14, 0x6e, 0x0b, 0xe7, 0xab, 0xac, 0xd0, 0xd6];
const BLOCK_KEY_INTEGRITY_KEY: [u8; 8] = [0x5f, 0xb2, 0xad, 0x01, 0x0c, 0xb9, 0xe1, 0xf6];
const BLOCK_KEY_INTEGRITY_VALUE: [u8; 8] = [0xa0, 0x67, 0x7f, 0x02, 0xb2, 0x2c, 0x84, 0x33];

#[derive(Debug)]
struct Base64Binary(Vec<u8>);

impl<'de> Deserialize<'de> for Base64Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        base64::prelude::BASE64_STANDARD
            .decode(&s)
            .map(Base64Binary)
            .map_err(|e| D::Error::custom(format!("invalid base64 value ({s}): {e}")))
    }
}

/// The subset of hash algorithms this crate's Agile path supports for the password
/// key encryptor. Other values parse fine syntactically but are rejected as
/// `Unsupported` before any key derivation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashAlgo {
    Sha1,
    Sha512,
}

impl HashAlgo {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "SHA1" => Ok(Self::Sha1),
            "SHA512" => Ok(Self::Sha512),
            other => Err(Error::Unsupported(format!(
                "hash algorithm {other} (only SHA1 and SHA512 are supported)"
            ))),
        }
    }

    fn digest_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha512 => 64,
        }
    }

    fn hash(self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Sha1 => {
                let mut h = Sha1::new();
                for p in parts {
                    sha1::Digest::update(&mut h, p);
                }
                sha1::Digest::finalize(h).to_vec()
            }
            Self::Sha512 => {
                let mut h = Sha512::new();
                for p in parts {
                    Digest::update(&mut h, p);
                }
                Digest::finalize(h).to_vec()
            }
        }
    }

    fn hmac(self, key: &[u8], message: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            Self::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

#[derive(Deserialize, Debug)]
struct XmlKeyData {
    #[serde(rename = "@saltSize")]
    salt_size: usize,
    #[serde(rename = "@blockSize")]
    block_size: usize,
    #[serde(rename = "@keyBits")]
    key_bits: usize,
    #[serde(rename = "@hashSize")]
    hash_size: usize,
    #[serde(rename = "@cipherAlgorithm")]
    cipher_algorithm: String,
    #[serde(rename = "@cipherChaining")]
    cipher_chaining: String,
    #[serde(rename = "@hashAlgorithm")]
    hash_algorithm: String,
    #[serde(rename = "@saltValue")]
    salt_value: Base64Binary,
}

#[derive(Deserialize, Debug)]
struct XmlDataIntegrity {
    #[serde(rename = "@encryptedHmacKey")]
    encrypted_hmac_key: Base64Binary,
    #[serde(rename = "@encryptedHmacValue")]
    encrypted_hmac_value: Base64Binary,
}

#[derive(Deserialize, Debug)]
struct XmlPasswordKeyEncryptor {
    #[serde(rename = "@saltSize")]
    salt_size: usize,
    #[serde(rename = "@blockSize")]
    block_size: usize,
    #[serde(rename = "@keyBits")]
    key_bits: usize,
    #[serde(rename = "@hashSize")]
    hash_size: usize,
    #[serde(rename = "@cipherAlgorithm")]
    cipher_algorithm: String,
    #[serde(rename = "@cipherChaining")]
    cipher_chaining: String,
    #[serde(rename = "@hashAlgorithm")]
    hash_algorithm: String,
    #[serde(rename = "@saltValue")]
    salt_value: Base64Binary,
    #[serde(rename = "@spinCount")]
    spin_count: u32,
    #[serde(rename = "@encryptedVerifierHashInput")]
    encrypted_verifier_hash_input: Base64Binary,
    #[serde(rename = "@encryptedVerifierHashValue")]
    encrypted_verifier_hash_value: Base64Binary,
    #[serde(rename = "@encryptedKeyValue")]
    encrypted_key_value: Base64Binary,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct XmlKeyEncryptor {
    /// Present only for a password-based key encryptor; absent for any other
    /// (e.g. certificate-based) `keyEncryptor` child, which this crate does not
    /// implement.
    #[serde(rename = "encryptedKey", default)]
    encrypted_key: Option<XmlPasswordKeyEncryptor>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct XmlKeyEncryptors {
    #[serde(rename = "keyEncryptor", default)]
    key_encryptor: Vec<XmlKeyEncryptor>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct XmlEncryption {
    key_data: XmlKeyData,
    data_integrity: Option<XmlDataIntegrity>,
    key_encryptors: XmlKeyEncryptors,
}

/// A parsed Agile-scheme `EncryptionInfo` body.
pub struct AgileEncryptionInfo {
    key_algo: CipherAlgo,
    key_bytes: usize,
    block_size: usize,
    salt: Vec<u8>,
    password: PasswordKeyEncryptor,
    data_integrity: Option<DataIntegrity>,
}

struct PasswordKeyEncryptor {
    algo: CipherAlgo,
    block_size: usize,
    hash: HashAlgo,
    salt: Vec<u8>,
    spin_count: u32,
    encrypted_verifier_hash_input: Vec<u8>,
    encrypted_verifier_hash_value: Vec<u8>,
    encrypted_key_value: Vec<u8>,
}

struct DataIntegrity {
    encrypted_hmac_key: Vec<u8>,
    encrypted_hmac_value: Vec<u8>,
}

fn cipher_algo(name: &str, key_bits: usize) -> Result<CipherAlgo> {
    if name != "AES" {
        return Err(Error::Unsupported(format!(
            "cipher algorithm {name} (only AES is supported)"
        )));
    }
    CipherAlgo::from_key_bits(key_bits as u32)
}

fn require_cbc(chaining: &str) -> Result<()> {
    match chaining {
        "ChainingModeCBC" => Ok(()),
        other => Err(Error::Unsupported(format!(
            "cipher chaining mode {other} (only CBC is supported)"
        ))),
    }
}

impl AgileEncryptionInfo {
    pub(crate) fn parse(xml: &[u8]) -> Result<Self> {
        let parsed: XmlEncryption = quick_xml::de::from_reader(xml)?;

        let kd = &parsed.key_data;
        require_cbc(&kd.cipher_chaining)?;
        let key_algo = cipher_algo(&kd.cipher_algorithm, kd.key_bits)?;
        let key_hash = HashAlgo::parse(&kd.hash_algorithm)?;
        if kd.hash_size != key_hash.digest_size() {
            return Err(Error::BadEncryptionInfo(format!(
                "keyData hashSize {} does not match {}",
                kd.hash_size, kd.hash_algorithm
            )));
        }
        if kd.salt_value.0.len() != kd.salt_size {
            return Err(Error::BadEncryptionInfo("keyData saltSize mismatch".into()));
        }
        if kd.block_size != 16 {
            return Err(Error::Unsupported(format!(
                "blockSize {} (only 16-byte AES blocks are supported)",
                kd.block_size
            )));
        }

        let total_key_encryptors = parsed.key_encryptors.key_encryptor.len();
        let mut password_entries = parsed
            .key_encryptors
            .key_encryptor
            .into_iter()
            .filter_map(|ke| ke.encrypted_key);
        let ek = match password_entries.next() {
            Some(ek) => ek,
            // No keyEncryptor elements at all: genuinely nothing to try a password against.
            None if total_key_encryptors == 0 => return Err(Error::NoPasswordKey),
            // keyEncryptor elements exist but none is the password-type child this crate
            // recognizes (e.g. a certificate-based key encryptor).
            None => {
                return Err(Error::Unsupported(
                    "keyEncryptor child is not a password key encryptor (only \
                     encryption-password is supported)"
                        .into(),
                ))
            }
        };

        require_cbc(&ek.cipher_chaining)?;
        let ek_algo = cipher_algo(&ek.cipher_algorithm, ek.key_bits)?;
        let ek_hash = HashAlgo::parse(&ek.hash_algorithm)?;
        if ek.hash_size != ek_hash.digest_size() {
            return Err(Error::BadEncryptionInfo(format!(
                "encryptedKey hashSize {} does not match {}",
                ek.hash_size, ek.hash_algorithm
            )));
        }
        if ek.cipher_algorithm != kd.cipher_algorithm || ek.hash_algorithm != kd.hash_algorithm {
            return Err(Error::BadEncryptionInfo(
                "encryptedKey cipher/hash do not match keyData".into(),
            ));
        }
        if !(1..=10_000_000).contains(&ek.spin_count) {
            return Err(Error::BadEncryptionInfo(format!(
                "invalid spinCount {}",
                ek.spin_count
            )));
        }
        if ek.salt_value.0.len() != ek.salt_size {
            return Err(Error::BadEncryptionInfo(
                "encryptedKey saltSize mismatch".into(),
            ));
        }
        let key_bytes = (kd.key_bits / 8) as usize;
        if ek.encrypted_key_value.0.len() < key_bytes {
            return Err(Error::BadEncryptionInfo(
                "encryptedKeyValue shorter than keyBits".into(),
            ));
        }

        let data_integrity = parsed.data_integrity.map(|di| DataIntegrity {
            encrypted_hmac_key: di.encrypted_hmac_key.0,
            encrypted_hmac_value: di.encrypted_hmac_value.0,
        });

        Ok(Self {
            key_algo,
            key_bytes,
            block_size: kd.block_size,
            salt: kd.salt_value.0.clone(),
            password: PasswordKeyEncryptor {
                algo: ek_algo,
                block_size: ek.block_size,
                hash: ek_hash,
                salt: ek.salt_value.0,
                spin_count: ek.spin_count,
                encrypted_verifier_hash_input: ek.encrypted_verifier_hash_input.0,
                encrypted_verifier_hash_value: ek.encrypted_verifier_hash_value.0,
                encrypted_key_value: ek.encrypted_key_value.0,
            },
            data_integrity,
        })
    }

    /// Runs the iterated-hash + block-key verifier check and, on success, returns the
    /// intermediate bulk encryption key.
    pub fn derive_and_verify_key(&self, password: &str) -> Result<Zeroizing<Vec<u8>>> {
        let hash = self.password.hash;
        let partial = self.derive_partial_key(password);

        let iv = self.iv(&self.password.salt, self.password.block_size, None);

        let verifier_input_key = self.block_key(&partial, &BLOCK_KEY_VERIFIER_INPUT);
        let verifier_input = aes_cbc_decrypt(
            self.password.algo,
            &verifier_input_key,
            &iv,
            &pad_to_block(&self.password.encrypted_verifier_hash_input, 16),
        )?;
        let calculated = hash.hash(&[verifier_input.as_slice()]);

        let verifier_hash_key = self.block_key(&partial, &BLOCK_KEY_VERIFIER_HASH);
        let expected = aes_cbc_decrypt(
            self.password.algo,
            &verifier_hash_key,
            &iv,
            &pad_to_block(&self.password.encrypted_verifier_hash_value, 16),
        )?;
        let expected = &expected[..calculated.len()];

        if calculated.as_slice().ct_eq(expected).unwrap_u8() != 1 {
            return Err(Error::BadPassword);
        }

        let key_value_key = self.block_key(&partial, &BLOCK_KEY_KEY_VALUE);
        let mut key = aes_cbc_decrypt(
            self.password.algo,
            &key_value_key,
            &iv,
            &pad_to_block(&self.password.encrypted_key_value, 16),
        )?;
        key.truncate(self.key_bytes);
        Ok(Zeroizing::new(key))
    }

    fn derive_partial_key(&self, password: &str) -> Zeroizing<Vec<u8>> {
        let password_bytes = password_to_utf16le(password);
        let hash = self.password.hash;
        let mut h = hash.hash(&[self.password.salt.as_slice(), password_bytes.as_slice()]);
        for i in 0..self.password.spin_count {
            h = hash.hash(&[i.to_le_bytes().as_slice(), h.as_slice()]);
        }
        Zeroizing::new(h)
    }

    /// `hash(partial ‖ block_key)`, resized to the key-encryptor's key size, padded
    /// with `0x36` bytes if the hash is shorter than the requested key (matching how
    /// MS-OFFCRYPTO pads every block-key subkey, not just the bulk key).
    fn block_key(&self, partial: &[u8], block_key: &[u8; 8]) -> Vec<u8> {
        let mut key = self.password.hash.hash(&[partial, block_key.as_slice()]);
        let wanted = self.password.algo.key_bytes();
        if key.len() != wanted {
            key.resize(wanted, 0x36);
        }
        key
    }

    fn iv(&self, salt: &[u8], block_size: usize, segment: Option<u32>) -> Vec<u8> {
        let mut hash = match segment {
            Some(n) => self.password.hash.hash(&[salt, n.to_le_bytes().as_slice()]),
            None => salt.to_vec(),
        };
        if hash.len() != block_size {
            hash.resize(block_size, 0x36);
        }
        hash
    }

    /// Decrypts the `EncryptedPackage` stream segment by segment (4096-byte AES-CBC
    /// blocks, each with its own salt-derived IV) and truncates the result to the
    /// declared plaintext size.
    pub fn decrypt(&self, key: &[u8], mut encrypted_package: &[u8]) -> Result<Vec<u8>> {
        if encrypted_package.len() < 8 {
            return Err(Error::TruncatedCiphertext);
        }
        let plaintext_size = crate::util::rdu64le(&mut encrypted_package)? as usize;
        let ciphertext = encrypted_package;

        let mut plaintext = Vec::with_capacity(ciphertext.len());
        for (n, chunk) in ciphertext.chunks(SEGMENT_LEN).enumerate() {
            let iv = self.iv(&self.salt, self.block_size, Some(n as u32));
            let padded = pad_to_block(chunk, self.block_size);
            let mut segment_plain = aes_cbc_decrypt(self.key_algo, key, &iv, &padded)?;
            segment_plain.truncate(chunk.len());
            plaintext.extend_from_slice(&segment_plain);
        }
        plaintext.truncate(plaintext_size);
        Ok(plaintext)
    }

    /// Verifies the Agile `dataIntegrity` HMAC over the ciphertext bytes of
    /// `EncryptedPackage` (header 8 bytes plus segments). This is not run
    /// automatically by `decrypt` - callers that want tamper detection opt in
    /// explicitly.
    pub fn verify_data_integrity(&self, key: &[u8], encrypted_package: &[u8]) -> Result<()> {
        let di = self
            .data_integrity
            .as_ref()
            .ok_or_else(|| Error::Unsupported("dataIntegrity element not present".into()))?;

        let hash = self.password.hash;
        let iv_key = self.iv(&self.salt, self.block_size, None);

        let hmac_key_key = {
            let mut k = hash.hash(&[key, BLOCK_KEY_INTEGRITY_KEY.as_slice()]);
            let wanted = self.key_algo.key_bytes();
            if k.len() != wanted {
                k.resize(wanted, 0x36);
            }
            k
        };
        let hmac_key = aes_cbc_decrypt(
            self.key_algo,
            &hmac_key_key,
            &iv_key,
            &pad_to_block(&di.encrypted_hmac_key, 16),
        )?;
        let hmac_key = &hmac_key[..hash.digest_size()];

        let hmac_value_key = {
            let mut k = hash.hash(&[key, &BLOCK_KEY_INTEGRITY_VALUE]);
            let wanted = self.key_algo.key_bytes();
            if k.len() != wanted {
                k.resize(wanted, 0x36);
            }
            k
        };
        let hmac_value = aes_cbc_decrypt(
            self.key_algo,
            &hmac_value_key,
            &iv_key,
            &pad_to_block(&di.encrypted_hmac_value, 16),
        )?;
        let expected = &hmac_value[..hash.digest_size()];

        let calculated = hash.hmac(hmac_key, encrypted_package);
        if calculated.as_slice().ct_eq(expected).unwrap_u8() != 1 {
            return Err(Error::IntegrityCheckFailed);
        }
        Ok(())
    }
}

fn pad_to_block(data: &[u8], block_size: usize) -> Vec<u8> {
    let rem = data.len() % block_size;
    if rem == 0 {
        data.to_vec()
    } else {
        let mut out = data.to_vec();
        out.resize(data.len() + (block_size - rem), 0);
        out
    }
}
