//! Recovering the package content key ("secret key").
//!
//! Three mutually exclusive sources are supported, modelled by [`KeySource`]:
//! - a raw secret key supplied by the caller (used as-is),
//! - a password, stretched and used to AES-CBC unwrap `encryptedKeyValue`,
//! - an RSA private key, used to PKCS#1 v1.5 unwrap the certificate encryptor's key.
//!
//! Password derivation:
//! 1. `H = Hash(salt || UTF-16LE(password))`
//! 2. For `i in 0..spinCount`: `H = Hash(LE32(i) || H)`
//! 3. `K = Hash(H || KEY_VALUE_BLOCK)`, truncated (or `0x36`-padded) to `keyBits / 8`
//! 4. `secretKey = AES-CBC-Decrypt(key = K, iv = salt, encryptedKeyValue)` with no padding removal
//!
//! There is no password verifier check here: a wrong password yields a well-formed but wrong key,
//! and the package then decrypts to garbage.

use std::fmt;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use zeroize::Zeroizing;

use crate::crypto::{aes_cbc_decrypt_in_place, normalize_key_material};
use crate::descriptor::{EncryptionDescriptor, PasswordKeyEncryptor};
use crate::{AgileError, DecryptLimits, HashAlgorithm};

/// MS-OFFCRYPTO Agile block key for deriving the `encryptedKeyValue` key-encryption key.
pub const KEY_VALUE_BLOCK: [u8; 8] = [0x14, 0x6E, 0x0B, 0xE7, 0xAB, 0xAC, 0xD0, 0xD6];

/// The symmetric key that decrypts the `EncryptedPackage` payload.
///
/// Wiped on drop; `Debug` never prints the key bytes.
pub struct SecretKey(Zeroizing<Vec<u8>>);

impl SecretKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a hexadecimal secret key (e.g. as printed by other MS-OFFCRYPTO tooling).
    pub fn from_hex(hex_key: &str) -> Result<Self, AgileError> {
        hex::decode(hex_key.trim())
            .map(Self::new)
            .map_err(|_| AgileError::InvalidEncryptionInfo {
                context: "invalid hex secret key",
            })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

/// Where the secret key comes from. Exactly one source is used per decryption.
pub enum KeySource {
    /// The secret key itself. No length validation beyond what AES enforces at use time.
    RawKey(SecretKey),
    /// A document password.
    Password(Zeroizing<String>),
    /// An RSA private key matching the certificate the package key was wrapped for.
    PrivateKey(Box<RsaPrivateKey>),
}

impl KeySource {
    pub fn raw_key(bytes: impl Into<Vec<u8>>) -> Self {
        KeySource::RawKey(SecretKey::new(bytes.into()))
    }

    pub fn raw_key_from_hex(hex_key: &str) -> Result<Self, AgileError> {
        SecretKey::from_hex(hex_key).map(KeySource::RawKey)
    }

    pub fn password(password: impl Into<String>) -> Self {
        KeySource::Password(Zeroizing::new(password.into()))
    }

    pub fn private_key(key: RsaPrivateKey) -> Self {
        KeySource::PrivateKey(Box::new(key))
    }

    /// Load an unencrypted PEM RSA private key (`BEGIN PRIVATE KEY` or `BEGIN RSA PRIVATE KEY`).
    pub fn private_key_from_pem(pem: &str) -> Result<Self, AgileError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|pkcs8_err| {
                RsaPrivateKey::from_pkcs1_pem(pem).map_err(|pkcs1_err| {
                    AgileError::InvalidPrivateKey(format!(
                        "not a PKCS#8 ({pkcs8_err}) or PKCS#1 ({pkcs1_err}) PEM RSA key"
                    ))
                })
            })?;
        Ok(Self::private_key(key))
    }

    /// Short name of the source, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            KeySource::RawKey(_) => "secret key",
            KeySource::Password(_) => "password",
            KeySource::PrivateKey(_) => "private key",
        }
    }

    /// Produce the package secret key for `descriptor`.
    pub fn derive_secret_key(
        &self,
        descriptor: &EncryptionDescriptor,
        limits: &DecryptLimits,
    ) -> Result<SecretKey, AgileError> {
        log::debug!("deriving package secret key from {}", self.kind());
        match self {
            KeySource::RawKey(key) => Ok(SecretKey::new(key.as_bytes().to_vec())),
            KeySource::Password(password) => {
                secret_key_from_password(password, &descriptor.password, limits)
            }
            KeySource::PrivateKey(key) => {
                secret_key_from_private_key(key, descriptor.asymmetric_wrapped_key())
            }
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySource::{}(..)", match self {
            KeySource::RawKey(_) => "RawKey",
            KeySource::Password(_) => "Password",
            KeySource::PrivateKey(_) => "PrivateKey",
        })
    }
}

pub(crate) fn password_to_utf16le_bytes(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() * 2);
    for unit in password.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Steps 1 and 2 of password derivation: the salted, `spin_count`-times iterated hash.
pub fn iterated_hash(
    password_utf16le: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    spin_count: u32,
) -> Zeroizing<Vec<u8>> {
    let digest_len = hash_alg.digest_len();
    let mut h = Zeroizing::new(vec![0u8; digest_len]);

    let mut buf = Zeroizing::new(Vec::with_capacity(salt.len() + password_utf16le.len()));
    buf.extend_from_slice(salt);
    buf.extend_from_slice(password_utf16le);
    hash_alg.digest_into(&buf, &mut h);

    // Reuse one buffer across rounds: LE32(i) || H.
    let mut round = Zeroizing::new(vec![0u8; 4 + digest_len]);
    for i in 0..spin_count {
        round[..4].copy_from_slice(&i.to_le_bytes());
        round[4..].copy_from_slice(&h);
        hash_alg.digest_into(&round, &mut h);
    }

    h
}

/// Step 3: `Hash(H || KEY_VALUE_BLOCK)` sized to `key_bits / 8`.
pub fn derive_key_encryption_key(
    h: &[u8],
    hash_alg: HashAlgorithm,
    key_bits: usize,
) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(Vec::with_capacity(h.len() + KEY_VALUE_BLOCK.len()));
    buf.extend_from_slice(h);
    buf.extend_from_slice(&KEY_VALUE_BLOCK);
    let digest = Zeroizing::new(hash_alg.digest(&buf));
    Zeroizing::new(normalize_key_material(&digest, key_bits / 8))
}

/// Stretch `password` and unwrap the password encryptor's `encryptedKeyValue`.
pub fn secret_key_from_password(
    password: &str,
    encryptor: &PasswordKeyEncryptor,
    limits: &DecryptLimits,
) -> Result<SecretKey, AgileError> {
    if let Some(max) = limits.max_spin_count {
        if encryptor.spin_count > max {
            return Err(AgileError::SpinCountTooLarge {
                spin_count: encryptor.spin_count,
                max,
            });
        }
    }

    let password_utf16le = Zeroizing::new(password_to_utf16le_bytes(password));
    let h = iterated_hash(
        &password_utf16le,
        &encryptor.salt,
        encryptor.hash_algorithm,
        encryptor.spin_count,
    );
    let kek = derive_key_encryption_key(&h, encryptor.hash_algorithm, encryptor.key_bits);

    let mut key_value = Zeroizing::new(encryptor.encrypted_key_value.clone());
    aes_cbc_decrypt_in_place(&kek, &encryptor.salt, &mut key_value).map_err(|err| {
        AgileError::KeyUnwrap(format!("encryptedKeyValue could not be decrypted: {err}"))
    })?;

    Ok(SecretKey::new(key_value.to_vec()))
}

/// Unwrap `wrapped_key` with an RSA private key (PKCS#1 v1.5).
pub fn secret_key_from_private_key(
    key: &RsaPrivateKey,
    wrapped_key: &[u8],
) -> Result<SecretKey, AgileError> {
    key.decrypt(Pkcs1v15Encrypt, wrapped_key)
        .map(SecretKey::new)
        .map_err(|err| AgileError::KeyUnwrap(format!("RSA PKCS#1 v1.5 decryption failed: {err}")))
}
