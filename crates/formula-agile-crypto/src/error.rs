use thiserror::Error;

/// Errors returned by this crate.
///
/// None of these are retried internally: they describe malformed input or caller mistakes, not
/// transient faults. I/O failures of the underlying streams are passed through as [`AgileError::Io`].
#[derive(Debug, Error)]
pub enum AgileError {
    /// The `EncryptionInfo` version is not the Agile `4.4` pair.
    #[error("unsupported EncryptionInfo version {major}.{minor} (expected 4.4)")]
    UnsupportedVersion { major: u16, minor: u16 },
    /// A required descriptor attribute (or the element carrying it) is absent.
    #[error("missing required EncryptionInfo field `{0}`")]
    MissingField(&'static str),
    /// The descriptor is present but structurally invalid (bad XML, base64, number, algorithm...).
    #[error("invalid EncryptionInfo: {context}")]
    InvalidEncryptionInfo { context: &'static str },
    /// Not enough bytes to read a fixed-size header.
    #[error("truncated data while reading {context}")]
    Truncated { context: &'static str },
    /// Unwrapping the content key (password-derived AES or RSA) failed at the primitive level.
    #[error("failed to unwrap the content key: {0}")]
    KeyUnwrap(String),
    /// Ciphertext is not a whole number of AES blocks.
    #[error("ciphertext length must be a multiple of 16 bytes for AES-CBC, got {len}")]
    BlockAlignment { len: usize },
    /// The AES primitive rejected the key.
    #[error("invalid AES key length {len}; expected 16, 24, or 32 bytes")]
    InvalidKeyLength { len: usize },
    /// `decrypt_to` was called before any key source was loaded.
    #[error("no key loaded; load a password, secret key or private key first")]
    NoKeyLoaded,
    /// `spinCount` exceeds the configured [`crate::DecryptLimits::max_spin_count`].
    #[error("spinCount {spin_count} exceeds the configured maximum of {max}")]
    SpinCountTooLarge { spin_count: u32, max: u32 },
    /// The PEM private key could not be deserialized.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
