//! Decryption of MS-OFFCRYPTO *Agile* (version 4.4) encrypted Office documents.
//!
//! Password-protected `.docx`/`.xlsx`/`.pptx` files are OLE compound files holding two streams:
//! `EncryptionInfo` (an XML key descriptor behind a small binary header) and `EncryptedPackage`
//! (the AES-CBC encrypted OOXML zip, in 4096-byte segments). This crate:
//! - parses the `EncryptionInfo` descriptor ([`parse_encryption_info`])
//! - derives the package secret key from a raw key, a password or an RSA private key
//!   ([`KeySource`])
//! - decrypts `EncryptedPackage` segment by segment ([`decrypt_package`], [`decrypt_segment`])
//! - ties it together over a compound file ([`EncryptedOfficeFile`])
//!
//! The `dataIntegrity` HMAC and the password verifier are not checked: a wrong password or wrong
//! raw key yields garbage output rather than an error.
//!
//! ```no_run
//! use formula_agile_crypto::EncryptedOfficeFile;
//!
//! # fn main() -> Result<(), formula_agile_crypto::AgileError> {
//! let mut file = EncryptedOfficeFile::open_path("protected.xlsx")?;
//! file.load_password("password")?;
//! let mut out = Vec::new();
//! file.decrypt_to(&mut out)?;
//! # Ok(())
//! # }
//! ```

pub mod container;
mod crypto;
mod decryptor;
pub mod descriptor;
mod error;
pub mod key;
pub mod package;
#[cfg(feature = "parallel")]
mod parallel;

#[cfg(test)]
mod fuzz_tests;

pub use container::{is_encrypted_container, EncryptedOfficeFile, StreamSource};
pub use crypto::{HashAlgorithm, AES_BLOCK_SIZE};
pub use decryptor::{AgileDecryptor, DecryptLimits, DecryptOptions};
pub use descriptor::{parse_encryption_info, EncryptionDescriptor};
pub use error::AgileError;
pub use key::{KeySource, SecretKey};
pub use package::{decrypt_package, decrypt_segment};
