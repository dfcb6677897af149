//! Thin adapters over the RustCrypto hash and AES-CBC primitives.
//!
//! Padding is always caller-managed: Agile ciphertexts are block aligned by construction, so
//! decryption runs with `NoPadding` and never strips anything.

use aes::{Aes128, Aes192, Aes256};
use cbc::Decryptor;
use cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};

use crate::AgileError;

/// AES block size in bytes. Also the length of every IV used by the format.
pub const AES_BLOCK_SIZE: usize = 16;

/// Hash algorithm named by an Agile `hashAlgorithm` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub(crate) fn parse_offcrypto_name(name: &str) -> Result<Self, AgileError> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SHA1" | "SHA-1" => Ok(HashAlgorithm::Sha1),
            "SHA256" | "SHA-256" => Ok(HashAlgorithm::Sha256),
            "SHA384" | "SHA-384" => Ok(HashAlgorithm::Sha384),
            "SHA512" | "SHA-512" => Ok(HashAlgorithm::Sha512),
            _ => Err(AgileError::InvalidEncryptionInfo {
                context: "unsupported hashAlgorithm",
            }),
        }
    }

    /// Name as it appears in `EncryptionInfo`.
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; self.digest_len()];
        self.digest_into(data, &mut out);
        out
    }

    /// Hash `data` into `out`, which must be exactly [`HashAlgorithm::digest_len`] bytes.
    pub(crate) fn digest_into(self, data: &[u8], out: &mut [u8]) {
        match self {
            HashAlgorithm::Sha1 => {
                use sha1::Digest as _;
                out.copy_from_slice(&sha1::Sha1::digest(data));
            }
            HashAlgorithm::Sha256 => {
                use sha2::Digest as _;
                out.copy_from_slice(&sha2::Sha256::digest(data));
            }
            HashAlgorithm::Sha384 => {
                use sha2::Digest as _;
                out.copy_from_slice(&sha2::Sha384::digest(data));
            }
            HashAlgorithm::Sha512 => {
                use sha2::Digest as _;
                out.copy_from_slice(&sha2::Sha512::digest(data));
            }
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Truncate `bytes` to `out_len`, or pad with `0x36` when it is shorter (MS-OFFCRYPTO
/// `TruncateHash` expansion).
pub(crate) fn normalize_key_material(bytes: &[u8], out_len: usize) -> Vec<u8> {
    if bytes.len() >= out_len {
        bytes[..out_len].to_vec()
    } else {
        let mut out = vec![0x36u8; out_len];
        out[..bytes.len()].copy_from_slice(bytes);
        out
    }
}

/// Decrypt `buf` in place with AES-CBC (key size picked from `key.len()`), without padding removal.
pub(crate) fn aes_cbc_decrypt_in_place(
    key: &[u8],
    iv: &[u8],
    buf: &mut [u8],
) -> Result<(), AgileError> {
    if buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(AgileError::BlockAlignment { len: buf.len() });
    }
    if iv.len() != AES_BLOCK_SIZE {
        return Err(AgileError::InvalidEncryptionInfo {
            context: "AES-CBC IV must be 16 bytes",
        });
    }

    let len = buf.len();
    match key.len() {
        16 => {
            Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| AgileError::InvalidKeyLength { len: key.len() })?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(|_| AgileError::BlockAlignment { len })?;
        }
        24 => {
            Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(|_| AgileError::InvalidKeyLength { len: key.len() })?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(|_| AgileError::BlockAlignment { len })?;
        }
        32 => {
            Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| AgileError::InvalidKeyLength { len: key.len() })?
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(|_| AgileError::BlockAlignment { len })?;
        }
        len => return Err(AgileError::InvalidKeyLength { len }),
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn aes_cbc_encrypt_no_padding(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
    use cbc::Encryptor;
    use cipher::BlockEncryptMut;

    assert_eq!(plaintext.len() % AES_BLOCK_SIZE, 0);
    let mut buf = plaintext.to_vec();
    let len = buf.len();
    match key.len() {
        16 => Encryptor::<Aes128>::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map(|_| ())
            .unwrap(),
        24 => Encryptor::<Aes192>::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map(|_| ())
            .unwrap(),
        32 => Encryptor::<Aes256>::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map(|_| ())
            .unwrap(),
        other => panic!("unsupported AES key length {other}"),
    }
    buf
}
