//! AES and text encoders behind the `CryptoJS` global.
//!
//! Ciphertexts are AES-CBC with PKCS#7 padding. Raw keys of 16, 24 or 32
//! bytes select AES-128, AES-192 or AES-256. A string key without an IV is
//! an OpenSSL passphrase: a random 8-byte salt is drawn, key and IV come
//! from MD5 `EVP_BytesToKey`, and the output is `Salted__ | salt | data`.
//! A raw key without an IV gets a random IV prepended to the output.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BLOCK_SIZE: usize = 16;
const SALT_LEN: usize = 8;
const OPENSSL_MAGIC: &[u8] = b"Salted__";

#[derive(Error, Debug, PartialEq)]
pub enum CryptoError {
    #[error("invalid AES key length {0}: expected 16, 24 or 32 bytes")]
    InvalidKeyLength(usize),

    #[error("invalid IV length {0}: expected 16 bytes")]
    InvalidIvLength(usize),

    #[error("ciphertext is too short")]
    CiphertextTooShort,

    #[error("decryption failed: wrong key or corrupted data")]
    Decrypt,

    #[error("malformed {encoding} data: {message}")]
    Encoding {
        encoding: &'static str,
        message: String,
    },

    #[error("unknown encoding '{0}'")]
    UnknownEncoding(String),
}

// ─── Encoders ───────────────────────────────────────────────────────────

/// Byte ↔ text encodings shared by `CryptoJS.enc` and `Buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
    Base64,
    Hex,
    Latin1,
    Utf16,
    Utf16le,
}

impl Encoding {
    /// Accepts the `CryptoJS.enc` names and the Node `Buffer` spellings.
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "base64" => Ok(Encoding::Base64),
            "hex" => Ok(Encoding::Hex),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "utf16" | "utf-16" | "utf16be" => Ok(Encoding::Utf16),
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(Encoding::Utf16le),
            _ => Err(CryptoError::UnknownEncoding(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Base64 => "base64",
            Encoding::Hex => "hex",
            Encoding::Latin1 => "latin1",
            Encoding::Utf16 => "utf16",
            Encoding::Utf16le => "utf16le",
        }
    }

    /// Bytes → text.
    pub fn stringify(&self, bytes: &[u8]) -> Result<String, CryptoError> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|e| self.error(e)),
            Encoding::Base64 => Ok(STANDARD.encode(bytes)),
            Encoding::Hex => Ok(data_encoding::HEXLOWER.encode(bytes)),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Encoding::Utf16 | Encoding::Utf16le => {
                if bytes.len() % 2 != 0 {
                    return Err(self.error("odd number of bytes"));
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| {
                        let pair = [pair[0], pair[1]];
                        if *self == Encoding::Utf16 {
                            u16::from_be_bytes(pair)
                        } else {
                            u16::from_le_bytes(pair)
                        }
                    })
                    .collect();
                String::from_utf16(&units).map_err(|e| self.error(e))
            }
        }
    }

    /// Text → bytes.
    pub fn parse(&self, text: &str) -> Result<Vec<u8>, CryptoError> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Base64 => {
                let trimmed = text.trim();
                STANDARD
                    .decode(trimmed)
                    .or_else(|_| STANDARD_NO_PAD.decode(trimmed.trim_end_matches('=')))
                    .map_err(|e| self.error(e))
            }
            Encoding::Hex => data_encoding::HEXLOWER_PERMISSIVE
                .decode(text.trim().as_bytes())
                .map_err(|e| self.error(e)),
            Encoding::Latin1 => Ok(text.chars().map(|c| (u32::from(c) & 0xff) as u8).collect()),
            Encoding::Utf16 => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
            Encoding::Utf16le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
        }
    }

    fn error(&self, message: impl ToString) -> CryptoError {
        CryptoError::Encoding {
            encoding: self.name(),
            message: message.to_string(),
        }
    }
}

// ─── AES ────────────────────────────────────────────────────────────────

/// Key material passed by the script.
#[derive(Debug, Clone, Copy)]
pub enum AesKey<'a> {
    /// A string key; a passphrase unless an explicit IV is given.
    Text(&'a str),
    Raw(&'a [u8]),
}

pub fn aes_encrypt(
    plaintext: &[u8],
    key: AesKey<'_>,
    iv: Option<&[u8]>,
) -> Result<Vec<u8>, CryptoError> {
    match (key, iv) {
        (AesKey::Text(passphrase), None) => {
            let salt: [u8; SALT_LEN] = rand::random();
            encrypt_with_passphrase(plaintext, passphrase, &salt)
        }
        (AesKey::Text(text), Some(iv)) => cbc_encrypt(text.as_bytes(), iv, plaintext),
        (AesKey::Raw(raw), Some(iv)) => cbc_encrypt(raw, iv, plaintext),
        (AesKey::Raw(raw), None) => {
            let iv: [u8; BLOCK_SIZE] = rand::random();
            let mut out = iv.to_vec();
            out.extend(cbc_encrypt(raw, &iv, plaintext)?);
            Ok(out)
        }
    }
}

pub fn aes_decrypt(
    ciphertext: &[u8],
    key: AesKey<'_>,
    iv: Option<&[u8]>,
) -> Result<Vec<u8>, CryptoError> {
    match (key, iv) {
        (AesKey::Text(passphrase), None) => {
            if ciphertext.len() < OPENSSL_MAGIC.len() + SALT_LEN
                || !ciphertext.starts_with(OPENSSL_MAGIC)
            {
                return Err(CryptoError::CiphertextTooShort);
            }
            let salt = &ciphertext[OPENSSL_MAGIC.len()..OPENSSL_MAGIC.len() + SALT_LEN];
            let (key, iv) = evp_bytes_to_key(passphrase.as_bytes(), salt);
            cbc_decrypt(&key, &iv, &ciphertext[OPENSSL_MAGIC.len() + SALT_LEN..])
        }
        (AesKey::Text(text), Some(iv)) => cbc_decrypt(text.as_bytes(), iv, ciphertext),
        (AesKey::Raw(raw), Some(iv)) => cbc_decrypt(raw, iv, ciphertext),
        (AesKey::Raw(raw), None) => {
            if ciphertext.len() < BLOCK_SIZE {
                return Err(CryptoError::CiphertextTooShort);
            }
            let (iv, data) = ciphertext.split_at(BLOCK_SIZE);
            cbc_decrypt(raw, iv, data)
        }
    }
}

fn encrypt_with_passphrase(
    plaintext: &[u8],
    passphrase: &str,
    salt: &[u8; SALT_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let (key, iv) = evp_bytes_to_key(passphrase.as_bytes(), salt);
    let mut out = Vec::with_capacity(OPENSSL_MAGIC.len() + SALT_LEN + plaintext.len() + BLOCK_SIZE);
    out.extend_from_slice(OPENSSL_MAGIC);
    out.extend_from_slice(salt);
    out.extend(cbc_encrypt(&key, &iv, plaintext)?);
    Ok(out)
}

/// OpenSSL `EVP_BytesToKey` with MD5 and one iteration: 32-byte key, 16-byte IV.
fn evp_bytes_to_key(password: &[u8], salt: &[u8]) -> ([u8; 32], [u8; BLOCK_SIZE]) {
    let mut material = Vec::with_capacity(48);
    let mut previous: Option<[u8; 16]> = None;
    while material.len() < 48 {
        let mut ctx = md5::Context::new();
        if let Some(prev) = previous {
            ctx.consume(prev);
        }
        ctx.consume(password);
        ctx.consume(salt);
        let digest = ctx.compute().0;
        material.extend_from_slice(&digest);
        previous = Some(digest);
    }

    let mut key = [0u8; 32];
    let mut iv = [0u8; BLOCK_SIZE];
    key.copy_from_slice(&material[..32]);
    iv.copy_from_slice(&material[32..48]);
    (key, iv)
}

fn check_iv(iv: &[u8]) -> Result<(), CryptoError> {
    if iv.len() != BLOCK_SIZE {
        return Err(CryptoError::InvalidIvLength(iv.len()));
    }
    Ok(())
}

fn cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_iv(iv)?;
    let invalid = |_| CryptoError::InvalidKeyLength(key.len());
    let out = match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    };
    Ok(out)
}

fn cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_iv(iv)?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Decrypt);
    }
    let invalid = |_| CryptoError::InvalidKeyLength(key.len());
    let out = match key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    };
    out.map_err(|_| CryptoError::Decrypt)
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Encoders ────────────────────────────────────────────────────

    #[test]
    fn test_encoder_known_values() {
        assert_eq!(Encoding::Hex.stringify(b"Hello").unwrap(), "48656c6c6f");
        assert_eq!(Encoding::Hex.parse("48656C6C6F").unwrap(), b"Hello");
        assert_eq!(Encoding::Base64.stringify(b"Hello").unwrap(), "SGVsbG8=");
        assert_eq!(Encoding::Base64.parse("SGVsbG8").unwrap(), b"Hello");
        assert_eq!(Encoding::Latin1.stringify(&[0xe9]).unwrap(), "é");
        assert_eq!(Encoding::Latin1.parse("é").unwrap(), vec![0xe9]);
        assert_eq!(Encoding::Utf16.parse("A").unwrap(), vec![0x00, 0x41]);
        assert_eq!(Encoding::Utf16le.parse("A").unwrap(), vec![0x41, 0x00]);
        assert_eq!(Encoding::Utf16le.stringify(&[0x41, 0x00]).unwrap(), "A");
    }

    #[test]
    fn test_encoder_errors() {
        assert!(Encoding::Utf8.stringify(&[0xff, 0xfe]).is_err());
        assert!(Encoding::Hex.parse("zz").is_err());
        assert!(Encoding::Utf16.stringify(&[0x00]).is_err());
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!(Encoding::from_name("UTF-8").unwrap(), Encoding::Utf8);
        assert_eq!(Encoding::from_name("binary").unwrap(), Encoding::Latin1);
        assert_eq!(Encoding::from_name("ucs2").unwrap(), Encoding::Utf16le);
        assert_eq!(
            Encoding::from_name("ebcdic").unwrap_err(),
            CryptoError::UnknownEncoding("ebcdic".into())
        );
    }

    // ── AES ─────────────────────────────────────────────────────────

    #[test]
    fn test_aes128_known_answer() {
        // NIST SP 800-38A F.2.1, first block.
        let key = data_encoding::HEXLOWER
            .decode(b"2b7e151628aed2a6abf7158809cf4f3c")
            .unwrap();
        let iv = data_encoding::HEXLOWER
            .decode(b"000102030405060708090a0b0c0d0e0f")
            .unwrap();
        let plaintext = data_encoding::HEXLOWER
            .decode(b"6bc1bee22e409f96e93d7e117393172a")
            .unwrap();
        let out = aes_encrypt(&plaintext, AesKey::Raw(&key), Some(&iv)).unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(
            data_encoding::HEXLOWER.encode(&out[..16]),
            "7649abac8119b246cee98e9b12e9197d"
        );
    }

    #[test]
    fn test_round_trip_every_key_size_and_encoder() {
        let samples = [
            (Encoding::Utf8, "The quick brown fox 狐"),
            (Encoding::Base64, "c2VjcmV0IHBheWxvYWQ="),
            (Encoding::Hex, "deadbeef00112233"),
        ];
        for key_len in [16usize, 24, 32] {
            let key: Vec<u8> = (0..key_len as u8).collect();
            for (encoder, sample) in samples {
                let plaintext = encoder.parse(sample).unwrap();
                let sealed = aes_encrypt(&plaintext, AesKey::Raw(&key), None).unwrap();
                let carried = Encoding::Base64.stringify(&sealed).unwrap();
                let opened =
                    aes_decrypt(&Encoding::Base64.parse(&carried).unwrap(), AesKey::Raw(&key), None)
                        .unwrap();
                assert_eq!(encoder.stringify(&opened).unwrap(), sample);
            }
        }
    }

    #[test]
    fn test_round_trip_with_explicit_iv() {
        let key = [7u8; 24];
        let iv = [1u8; 16];
        let sealed = aes_encrypt(b"chapter-42", AesKey::Raw(&key), Some(&iv)).unwrap();
        assert_eq!(sealed.len(), 16);
        let opened = aes_decrypt(&sealed, AesKey::Raw(&key), Some(&iv)).unwrap();
        assert_eq!(opened, b"chapter-42");
    }

    #[test]
    fn test_passphrase_round_trip_uses_openssl_format() {
        let sealed = aes_encrypt(b"secret", AesKey::Text("hunter2"), None).unwrap();
        assert!(sealed.starts_with(b"Salted__"));
        assert_eq!((sealed.len() - 16) % 16, 0);
        let opened = aes_decrypt(&sealed, AesKey::Text("hunter2"), None).unwrap();
        assert_eq!(opened, b"secret");
        assert!(aes_decrypt(&sealed, AesKey::Text("wrong"), None).is_err());
    }

    #[test]
    fn test_passphrase_is_deterministic_for_fixed_salt() {
        let salt = [9u8; SALT_LEN];
        let a = encrypt_with_passphrase(b"x", "pw", &salt).unwrap();
        let b = encrypt_with_passphrase(b"x", "pw", &salt).unwrap();
        assert_eq!(a, b);
        let (key, iv) = evp_bytes_to_key(b"pw", &salt);
        assert_ne!(key, [0u8; 32]);
        assert_ne!(iv, [0u8; 16]);
    }

    #[test]
    fn test_text_key_with_iv_is_raw() {
        let iv = [0u8; 16];
        let sealed = aes_encrypt(b"data", AesKey::Text("0123456789abcdef"), Some(&iv)).unwrap();
        let opened = aes_decrypt(
            &sealed,
            AesKey::Raw(b"0123456789abcdef"),
            Some(&iv),
        )
        .unwrap();
        assert_eq!(opened, b"data");
    }

    #[test]
    fn test_invalid_key_and_iv_lengths() {
        assert_eq!(
            aes_encrypt(b"x", AesKey::Raw(&[0u8; 10]), None).unwrap_err(),
            CryptoError::InvalidKeyLength(10)
        );
        assert_eq!(
            aes_encrypt(b"x", AesKey::Raw(&[0u8; 16]), Some(&[0u8; 8])).unwrap_err(),
            CryptoError::InvalidIvLength(8)
        );
        assert_eq!(
            aes_decrypt(&[0u8; 4], AesKey::Raw(&[0u8; 16]), None).unwrap_err(),
            CryptoError::CiphertextTooShort
        );
    }
}
