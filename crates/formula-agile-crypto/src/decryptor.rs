use std::io::{Read, Write};

use rsa::RsaPrivateKey;

use crate::descriptor::{parse_encryption_info, EncryptionDescriptor};
use crate::key::{KeySource, SecretKey};
use crate::package::{decrypt_package, decrypt_package_streaming};
use crate::AgileError;

/// Resource limits applied while deriving keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptLimits {
    /// Largest `spinCount` accepted for password derivation. `None` disables the check.
    pub max_spin_count: Option<u32>,
}

impl DecryptLimits {
    pub const DEFAULT_MAX_SPIN_COUNT: u32 = 10_000_000;
}

impl Default for DecryptLimits {
    fn default() -> Self {
        Self {
            max_spin_count: Some(Self::DEFAULT_MAX_SPIN_COUNT),
        }
    }
}

/// Options controlling [`AgileDecryptor::decrypt_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecryptOptions {
    /// Cut the output at the `EncryptedPackage` declared size. Off by default: the plaintext is
    /// written exactly as decrypted, including the final segment's block padding.
    pub truncate_to_declared_size: bool,
    /// Write each segment as soon as it is decrypted instead of buffering the whole package.
    /// A failure part-way through then leaves the already written segments in the sink.
    pub streaming: bool,
    pub limits: DecryptLimits,
}

/// Holds a parsed descriptor and, once loaded, the package secret key.
///
/// Each `load_*` call replaces any previously loaded key; keys from different sources are never
/// combined.
#[derive(Debug)]
pub struct AgileDecryptor {
    descriptor: EncryptionDescriptor,
    secret_key: Option<SecretKey>,
    options: DecryptOptions,
}

impl AgileDecryptor {
    pub fn new(descriptor: EncryptionDescriptor) -> Self {
        Self::with_options(descriptor, DecryptOptions::default())
    }

    pub fn with_options(descriptor: EncryptionDescriptor, options: DecryptOptions) -> Self {
        Self {
            descriptor,
            secret_key: None,
            options,
        }
    }

    /// Parse `EncryptionInfo` stream bytes and wrap the result.
    pub fn from_encryption_info(bytes: &[u8]) -> Result<Self, AgileError> {
        parse_encryption_info(bytes).map(Self::new)
    }

    pub fn descriptor(&self) -> &EncryptionDescriptor {
        &self.descriptor
    }

    pub fn options(&self) -> &DecryptOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: DecryptOptions) {
        self.options = options;
    }

    pub fn secret_key(&self) -> Option<&SecretKey> {
        self.secret_key.as_ref()
    }

    pub fn has_key(&self) -> bool {
        self.secret_key.is_some()
    }

    /// Derive the secret key from `source` and keep it for subsequent decryption.
    ///
    /// On failure the previously loaded key (if any) is discarded.
    pub fn load_key_source(&mut self, source: &KeySource) -> Result<(), AgileError> {
        self.secret_key = None;
        self.secret_key = Some(source.derive_secret_key(&self.descriptor, &self.options.limits)?);
        Ok(())
    }

    /// Use `key` directly as the package secret key.
    pub fn load_raw_key(&mut self, key: impl Into<Vec<u8>>) {
        self.secret_key = Some(SecretKey::new(key.into()));
    }

    /// Derive the secret key from a document password.
    ///
    /// A wrong password is not detected here; it produces a wrong key and garbage output.
    pub fn load_password(&mut self, password: &str) -> Result<(), AgileError> {
        self.load_key_source(&KeySource::password(password))
    }

    /// Unwrap the secret key with an RSA private key.
    pub fn load_private_key(&mut self, key: &RsaPrivateKey) -> Result<(), AgileError> {
        self.load_key_source(&KeySource::private_key(key.clone()))
    }

    /// Decrypt an `EncryptedPackage` stream into `sink`, returning the number of bytes written.
    pub fn decrypt_to<R: Read, W: Write>(
        &self,
        encrypted_package: R,
        mut sink: W,
    ) -> Result<u64, AgileError> {
        let secret_key = self.secret_key.as_ref().ok_or(AgileError::NoKeyLoaded)?;
        let salt = self.descriptor.payload_salt();
        let hash_alg = self.descriptor.payload_hash_algorithm();

        if self.options.streaming {
            let (_, written) = decrypt_package_streaming(
                secret_key.as_bytes(),
                salt,
                hash_alg,
                encrypted_package,
                sink,
                self.options.truncate_to_declared_size,
            )?;
            return Ok(written);
        }

        let mut package = decrypt_package(secret_key.as_bytes(), salt, hash_alg, encrypted_package)?;
        if self.options.truncate_to_declared_size {
            package.truncate_to_declared_size();
        }
        sink.write_all(&package.plaintext)?;
        sink.flush()?;
        Ok(package.plaintext.len() as u64)
    }

    /// Decrypt an in-memory `EncryptedPackage` stream.
    pub fn decrypt_to_vec(&self, encrypted_package: &[u8]) -> Result<Vec<u8>, AgileError> {
        let mut out = Vec::new();
        self.decrypt_to(encrypted_package, &mut out)?;
        Ok(out)
    }
}
