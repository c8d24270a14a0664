//! Test-only fixture construction: builds Standard/Agile encrypted `EncryptionInfo` +
//! `EncryptedPackage` stream pairs, wrapped in a real OLE2 CFB container, so the integration
//! tests can exercise [`ooxml_crypt::decrypt_xlsx`] without shipping binary fixture files.
//!
//! The key derivation and encryption performed here is deliberately reimplemented from the
//! MS-OFFCRYPTO formulas rather than calling into `ooxml_crypt`'s own (decrypt-only) internals,
//! so a bug shared between encode and decode here can't hide a correctness bug in the crate.
#![allow(dead_code)]

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use base64::Engine as _;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use sha1::Sha1;
use sha2::Sha512;
use sha2::Digest as Sha2Digest;
use sha1::Digest as Sha1Digest;
use std::io::{Cursor, Write};

const SEGMENT_LEN: usize = 4096;

const BLOCK_KEY_VERIFIER_INPUT: [u8; 8] = [0xfe, 0xa7, 0xd2, 0x76, 0x3b, 0x4b, 0x9e, 0x79];
const BLOCK_KEY_VERIFIER_HASH: [u8; 8] = [0xd7, 0xaa, 0x0f, 0x6d, 0x30, 0x61, 0x34, 0x4e];
const BLOCK_KEY_KEY_VALUE: [u8; 8] = [0x14, 0x6e, 0x0b, 0xe7, 0xab, 0xac, 0xd0, 0xd6];

pub fn password_to_utf16le(password: &str) -> Vec<u8> {
    password.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

pub fn pad_to_block(data: &[u8], block_size: usize) -> Vec<u8> {
    let rem = data.len() % block_size;
    if rem == 0 {
        data.to_vec()
    } else {
        let mut out = data.to_vec();
        out.resize(data.len() + (block_size - rem), 0);
        out
    }
}

fn aes_ecb_encrypt(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let mut out = plaintext.to_vec();
    macro_rules! encrypt_with {
        ($enc:ty) => {{
            let cipher = <$enc>::new_from_slice(key).expect("valid AES key length");
            for block in out.chunks_exact_mut(16) {
                cipher.encrypt_block(GenericArray::from_mut_slice(block));
            }
        }};
    }
    match key.len() {
        16 => encrypt_with!(aes::Aes128Enc),
        24 => encrypt_with!(aes::Aes192Enc),
        32 => encrypt_with!(aes::Aes256Enc),
        other => panic!("invalid AES key length {other}"),
    }
    out
}

fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
    assert_eq!(plaintext.len() % 16, 0);
    let mut out = plaintext.to_vec();
    let len = out.len();
    macro_rules! encrypt_with {
        ($enc:ty) => {{
            let cipher = <$enc>::new_from_slices(key, iv).expect("valid key/iv");
            cipher
                .encrypt_padded_mut::<NoPadding>(&mut out, len)
                .expect("encrypt");
        }};
    }
    match key.len() {
        16 => encrypt_with!(cbc::Encryptor<aes::Aes128>),
        24 => encrypt_with!(cbc::Encryptor<aes::Aes192>),
        32 => encrypt_with!(cbc::Encryptor<aes::Aes256>),
        other => panic!("invalid AES key length {other}"),
    }
    out
}

/// A minimal but plausible OOXML ZIP payload: the local-file-header signature followed by
/// enough filler bytes to exercise multi-segment Agile decryption. `len` need not be a
/// multiple of anything; callers pick sizes that straddle the 4096-byte segment boundary.
pub fn fake_zip_payload(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(b"PK\x03\x04");
    let mut i = 0u8;
    while out.len() < len {
        out.push(i);
        i = i.wrapping_add(1);
    }
    out.truncate(len);
    out
}

/// Builds a Standard-encryption (`EncryptionInfo`, `EncryptedPackage`) stream pair for
/// `plaintext` encrypted under `password` with AES-128-ECB/SHA-1, mirroring §4.D.
pub fn encrypt_standard(plaintext: &[u8], password: &str) -> (Vec<u8>, Vec<u8>) {
    const SPIN_COUNT: u32 = 50_000;
    let salt = [0x42u8; 16];

    let password_bytes = password_to_utf16le(password);
    let mut h = Sha1::digest([salt.as_slice(), password_bytes.as_slice()].concat()).to_vec();
    for i in 0..SPIN_COUNT {
        h = Sha1::digest([&i.to_le_bytes()[..], &h].concat()).to_vec();
    }
    let h_final = Sha1::digest([&h[..], &0u32.to_le_bytes()].concat()).to_vec();

    let pad_hash = |fill: u8| -> Vec<u8> {
        let mut buf = [fill; 64];
        for (b, d) in buf.iter_mut().zip(h_final.iter()) {
            *b ^= *d;
        }
        Sha1::digest(buf).to_vec()
    };
    let x1 = pad_hash(0x36);
    let x2 = pad_hash(0x5c);
    let mut key = x1;
    key.extend_from_slice(&x2);
    key.truncate(16);

    let verifier_plain = [0x11u8; 16];
    let verifier_hash = Sha1::digest(verifier_plain).to_vec();
    let encrypted_verifier = aes_ecb_encrypt(&key, &verifier_plain);
    let encrypted_verifier_hash = aes_ecb_encrypt(&key, &pad_to_block(&verifier_hash, 16));

    let mut header_body = Vec::new();
    header_body.extend_from_slice(&0u32.to_le_bytes()); // flags (ignored by parser)
    header_body.extend_from_slice(&0u32.to_le_bytes()); // size extra
    header_body.extend_from_slice(&0x660eu32.to_le_bytes()); // alg id: AES-128
    header_body.extend_from_slice(&0x8004u32.to_le_bytes()); // alg id hash: SHA-1
    header_body.extend_from_slice(&128u32.to_le_bytes()); // key bits
    header_body.extend_from_slice(&0u32.to_le_bytes()); // provider type
    header_body.extend_from_slice(&0u32.to_le_bytes()); // reserved1
    header_body.extend_from_slice(&0u32.to_le_bytes()); // reserved2
    header_body.extend_from_slice(&password_to_utf16le(
        "Microsoft Enhanced RSA and AES Cryptographic Provider",
    )); // NUL-terminated UTF-16LE CSP name
    header_body.extend_from_slice(&[0u8, 0u8]);

    let mut encryption_info = Vec::new();
    encryption_info.extend_from_slice(&3u16.to_le_bytes()); // major
    encryption_info.extend_from_slice(&2u16.to_le_bytes()); // minor
    encryption_info.extend_from_slice(&0b10_0100u32.to_le_bytes()); // flags: fCryptoAPI | fAES
    encryption_info.extend_from_slice(&(header_body.len() as u32).to_le_bytes());
    encryption_info.extend_from_slice(&header_body);
    encryption_info.extend_from_slice(&16u32.to_le_bytes()); // salt size
    encryption_info.extend_from_slice(&salt);
    encryption_info.extend_from_slice(&encrypted_verifier);
    encryption_info.extend_from_slice(&20u32.to_le_bytes()); // verifier hash size
    encryption_info.extend_from_slice(&encrypted_verifier_hash);

    let ciphertext = aes_ecb_encrypt(&key, &pad_to_block(plaintext, 16));
    let mut encrypted_package = Vec::new();
    encrypted_package.extend_from_slice(&(plaintext.len() as u64).to_le_bytes());
    encrypted_package.extend_from_slice(&ciphertext);

    (encryption_info, encrypted_package)
}

enum Hash {
    Sha1,
    Sha512,
}

impl Hash {
    fn name(&self) -> &'static str {
        match self {
            Hash::Sha1 => "SHA1",
            Hash::Sha512 => "SHA512",
        }
    }

    fn digest_size(&self) -> usize {
        match self {
            Hash::Sha1 => 20,
            Hash::Sha512 => 64,
        }
    }

    fn hash(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Hash::Sha1 => {
                let mut h = Sha1::new();
                for p in parts {
                    Sha1Digest::update(&mut h, p);
                }
                Sha1Digest::finalize(h).to_vec()
            }
            Hash::Sha512 => {
                let mut h = Sha512::new();
                for p in parts {
                    Sha2Digest::update(&mut h, p);
                }
                Sha2Digest::finalize(h).to_vec()
            }
        }
    }
}

/// Builds an Agile-encryption (`EncryptionInfo`, `EncryptedPackage`) stream pair for
/// `plaintext` encrypted under `password`, mirroring §4.E/§4.F/§4.G.
///
/// `key_bits` selects AES-128/192/256 for both the password key encryptor and the bulk key;
/// `use_sha512` selects SHA-512 over SHA-1 for both the iterated hash and the per-segment IV
/// hash.
pub fn encrypt_agile(
    plaintext: &[u8],
    password: &str,
    key_bits: u32,
    use_sha512: bool,
    spin_count: u32,
) -> (Vec<u8>, Vec<u8>) {
    let hash = if use_sha512 { Hash::Sha512 } else { Hash::Sha1 };
    let key_bytes = (key_bits / 8) as usize;

    let password_salt = [0x7au8; 16];
    let key_data_salt = [0x5bu8; 16];
    let bulk_key: Vec<u8> = (0..key_bytes).map(|i| (0xa0 + i) as u8).collect();

    let password_bytes = password_to_utf16le(password);
    let mut h = hash.hash(&[&password_salt, password_bytes.as_slice()]);
    for i in 0..spin_count {
        h = hash.hash(&[&i.to_le_bytes(), h.as_slice()]);
    }

    let block_key = |bk: &[u8; 8]| -> Vec<u8> {
        let mut k = hash.hash(&[h.as_slice(), bk.as_slice()]);
        k.resize(key_bytes, 0x36);
        k
    };

    let verifier_input = vec![0x99u8; 16];
    let verifier_hash = hash.hash(&[&verifier_input]);

    let encrypted_verifier_hash_input = aes_cbc_encrypt(
        &block_key(&BLOCK_KEY_VERIFIER_INPUT),
        &password_salt,
        &pad_to_block(&verifier_input, 16),
    );
    let encrypted_verifier_hash_value = aes_cbc_encrypt(
        &block_key(&BLOCK_KEY_VERIFIER_HASH),
        &password_salt,
        &pad_to_block(&verifier_hash, 16),
    );
    let encrypted_key_value = aes_cbc_encrypt(
        &block_key(&BLOCK_KEY_KEY_VALUE),
        &password_salt,
        &pad_to_block(&bulk_key, 16),
    );

    let b64 = base64::prelude::BASE64_STANDARD;
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption" xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
  <keyData saltSize="16" blockSize="16" keyBits="{key_bits}" hashSize="{hash_size}" cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" hashAlgorithm="{hash_name}" saltValue="{key_data_salt_b64}"/>
  <dataIntegrity encryptedHmacKey="{dummy}" encryptedHmacValue="{dummy}"/>
  <keyEncryptors>
    <keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
      <p:encryptedKey spinCount="{spin_count}" saltSize="16" blockSize="16" keyBits="{key_bits}" hashSize="{hash_size}" cipherAlgorithm="AES" cipherChaining="ChainingModeCBC" hashAlgorithm="{hash_name}" saltValue="{password_salt_b64}" encryptedVerifierHashInput="{evhi}" encryptedVerifierHashValue="{evhv}" encryptedKeyValue="{ekv}"/>
    </keyEncryptor>
  </keyEncryptors>
</encryption>
"#,
        hash_size = hash.digest_size(),
        hash_name = hash.name(),
        key_data_salt_b64 = b64.encode(key_data_salt),
        dummy = b64.encode([0u8; 16]),
        password_salt_b64 = b64.encode(password_salt),
        evhi = b64.encode(&encrypted_verifier_hash_input),
        evhv = b64.encode(&encrypted_verifier_hash_value),
        ekv = b64.encode(&encrypted_key_value),
    );

    let mut encryption_info = Vec::new();
    encryption_info.extend_from_slice(&4u16.to_le_bytes()); // major
    encryption_info.extend_from_slice(&4u16.to_le_bytes()); // minor
    encryption_info.extend_from_slice(&0x40u32.to_le_bytes()); // flags
    encryption_info.extend_from_slice(xml.as_bytes());

    let mut encrypted_package = Vec::new();
    encrypted_package.extend_from_slice(&(plaintext.len() as u64).to_le_bytes());
    for (n, chunk) in plaintext.chunks(SEGMENT_LEN).enumerate() {
        let iv = {
            let mut v = hash.hash(&[&key_data_salt, &(n as u32).to_le_bytes()]);
            v.resize(16, 0x36);
            v
        };
        let ct = aes_cbc_encrypt(&bulk_key, &iv, &pad_to_block(chunk, 16));
        encrypted_package.extend_from_slice(&ct);
    }

    (encryption_info, encrypted_package)
}

/// Wraps `EncryptionInfo` and `EncryptedPackage` streams in a real OLE2/CFB container, the way
/// every encrypted OOXML file is actually packaged on disk.
pub fn wrap_in_ole_cfb(encryption_info: &[u8], encrypted_package: &[u8]) -> Vec<u8> {
    let cursor = Cursor::new(Vec::new());
    let mut ole = cfb::CompoundFile::create(cursor).expect("create cfb");

    ole.create_stream("EncryptionInfo")
        .expect("create EncryptionInfo stream")
        .write_all(encryption_info)
        .expect("write EncryptionInfo stream");

    ole.create_stream("EncryptedPackage")
        .expect("create EncryptedPackage stream")
        .write_all(encrypted_package)
        .expect("write EncryptedPackage stream");

    ole.into_inner().into_inner()
}
