//! Segmented decryption of the `EncryptedPackage` stream.
//!
//! Stream layout: `[0..4)` declared plaintext size (u32 LE), `[4..8)` reserved, then the ciphertext
//! in 4096-byte segments. Segment `i` is AES-CBC encrypted with
//! `IV_i = Hash(keyData.salt || LE32(i))[..16]`, so every segment decrypts on its own: CBC state is
//! never carried across a segment boundary.

use std::io::{self, Read, Write};

use crate::crypto::{aes_cbc_decrypt_in_place, normalize_key_material, AES_BLOCK_SIZE};
use crate::{AgileError, HashAlgorithm};

/// Plaintext bytes covered by one segment.
pub const SEGMENT_LENGTH: usize = 4096;

/// Size of the `EncryptedPackage` header (declared size + reserved).
pub const ENCRYPTED_PACKAGE_HEADER_LEN: usize = 8;

/// Header at the start of an `EncryptedPackage` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedPackageHeader {
    /// Plaintext size recorded by the producer.
    pub declared_size: u32,
    pub reserved: u32,
}

impl EncryptedPackageHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, AgileError> {
        if bytes.len() < ENCRYPTED_PACKAGE_HEADER_LEN {
            return Err(AgileError::Truncated {
                context: "EncryptedPackage header",
            });
        }
        Ok(Self {
            declared_size: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            reserved: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self, AgileError> {
        let mut buf = [0u8; ENCRYPTED_PACKAGE_HEADER_LEN];
        let n = read_full(reader, &mut buf)?;
        Self::parse(&buf[..n])
    }
}

/// IV for segment `index`: `Hash(salt || LE32(index))` truncated to the AES block size.
pub fn segment_iv(salt: &[u8], hash_alg: HashAlgorithm, index: u32) -> [u8; AES_BLOCK_SIZE] {
    let mut buf = Vec::with_capacity(salt.len() + 4);
    buf.extend_from_slice(salt);
    buf.extend_from_slice(&index.to_le_bytes());
    let digest = hash_alg.digest(&buf);

    let mut iv = [0u8; AES_BLOCK_SIZE];
    iv.copy_from_slice(&normalize_key_material(&digest, AES_BLOCK_SIZE));
    iv
}

/// Decrypt one segment in place.
pub fn decrypt_segment_in_place(
    secret_key: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    index: u32,
    segment: &mut [u8],
) -> Result<(), AgileError> {
    let iv = segment_iv(salt, hash_alg, index);
    aes_cbc_decrypt_in_place(secret_key, &iv, segment)
}

/// Decrypt segment `index` in isolation, independent of every other segment.
pub fn decrypt_segment(
    secret_key: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    index: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>, AgileError> {
    let mut out = ciphertext.to_vec();
    decrypt_segment_in_place(secret_key, salt, hash_alg, index, &mut out)?;
    Ok(out)
}

/// Fully decrypted package contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPackage {
    pub header: EncryptedPackageHeader,
    /// Concatenated segment plaintexts, in stream order.
    pub plaintext: Vec<u8>,
}

impl DecryptedPackage {
    /// Drop trailing padding beyond the declared size. A declared size larger than the
    /// decrypted length leaves the plaintext untouched.
    pub fn truncate_to_declared_size(&mut self) {
        let declared = self.header.declared_size as usize;
        if declared < self.plaintext.len() {
            self.plaintext.truncate(declared);
        } else if declared > self.plaintext.len() {
            log::warn!(
                "EncryptedPackage declares {declared} bytes but only {} were decrypted",
                self.plaintext.len()
            );
        }
    }
}

/// Decrypt a whole `EncryptedPackage` stream into memory.
///
/// Nothing is returned unless every segment decrypts.
pub fn decrypt_package<R: Read>(
    secret_key: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    mut package: R,
) -> Result<DecryptedPackage, AgileError> {
    let header = EncryptedPackageHeader::read_from(&mut package)?;
    log::debug!("EncryptedPackage declared size: {}", header.declared_size);

    let mut plaintext = Vec::new();
    package.read_to_end(&mut plaintext)?;
    if plaintext.len() % AES_BLOCK_SIZE != 0 {
        // Only the final segment can be short; report it the way the segment decrypt would.
        let tail = plaintext.len() % SEGMENT_LENGTH;
        return Err(AgileError::BlockAlignment { len: tail });
    }
    check_segment_count(plaintext.len())?;

    decrypt_segments_in_place(secret_key, salt, hash_alg, &mut plaintext)?;
    Ok(DecryptedPackage { header, plaintext })
}

/// Decrypt an `EncryptedPackage` stream segment by segment, writing each plaintext segment to
/// `sink` as soon as it is ready.
///
/// Memory use is bounded by one segment. On error, segments already written stay in `sink`.
/// With `truncate_to_declared_size`, output stops after the header's declared size. Returns the
/// header and the number of plaintext bytes written.
pub fn decrypt_package_streaming<R: Read, W: Write>(
    secret_key: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    mut package: R,
    mut sink: W,
    truncate_to_declared_size: bool,
) -> Result<(EncryptedPackageHeader, u64), AgileError> {
    let header = EncryptedPackageHeader::read_from(&mut package)?;
    log::debug!("EncryptedPackage declared size: {}", header.declared_size);

    let limit = truncate_to_declared_size.then_some(u64::from(header.declared_size));
    let mut written = 0u64;
    let mut segment = vec![0u8; SEGMENT_LENGTH];
    let mut index = 0u32;

    loop {
        let n = read_full(&mut package, &mut segment)?;
        if n == 0 {
            break;
        }
        let chunk = &mut segment[..n];
        decrypt_segment_in_place(secret_key, salt, hash_alg, index, chunk)?;
        log::trace!("decrypted EncryptedPackage segment {index} ({n} bytes)");

        let take = match limit {
            Some(limit) => (limit.saturating_sub(written)).min(n as u64) as usize,
            None => n,
        };
        sink.write_all(&chunk[..take])?;
        written += take as u64;

        if n < SEGMENT_LENGTH {
            break;
        }
        index = index.checked_add(1).ok_or(AgileError::InvalidEncryptionInfo {
            context: "EncryptedPackage has too many segments",
        })?;
    }

    sink.flush()?;
    Ok((header, written))
}

fn check_segment_count(ciphertext_len: usize) -> Result<(), AgileError> {
    let segments = ciphertext_len.div_ceil(SEGMENT_LENGTH);
    if segments.saturating_sub(1) > u32::MAX as usize {
        return Err(AgileError::InvalidEncryptionInfo {
            context: "EncryptedPackage has too many segments",
        });
    }
    Ok(())
}

#[cfg(not(feature = "parallel"))]
fn decrypt_segments_in_place(
    secret_key: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    buf: &mut [u8],
) -> Result<(), AgileError> {
    for (index, segment) in buf.chunks_mut(SEGMENT_LENGTH).enumerate() {
        decrypt_segment_in_place(secret_key, salt, hash_alg, index as u32, segment)?;
        log::trace!(
            "decrypted EncryptedPackage segment {index} ({} bytes)",
            segment.len()
        );
    }
    Ok(())
}

#[cfg(feature = "parallel")]
fn decrypt_segments_in_place(
    secret_key: &[u8],
    salt: &[u8],
    hash_alg: HashAlgorithm,
    buf: &mut [u8],
) -> Result<(), AgileError> {
    crate::parallel::decrypt_segments_in_place(secret_key, salt, hash_alg, buf)
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
