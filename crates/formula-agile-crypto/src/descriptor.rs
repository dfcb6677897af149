//! Agile `EncryptionInfo` stream parsing.
//!
//! Layout:
//! - `[0..2)` `versionMajor` (u16 LE), `[2..4)` `versionMinor` (u16 LE); only `4.4` is accepted.
//! - `[4..8)` flags.
//! - `[8..)` a UTF-8 XML `<encryption>` document. Some producers insert another reserved DWORD
//!   before the XML, so the body starts at the first `<` at or after offset 8.
//!
//! Only the fields needed to recover the package key are extracted: the `<keyData>` salt and hash,
//! the password key encryptor (`p:encryptedKey`, located by namespace) and, when present, the
//! certificate key encryptor (`c:encryptedKey`).

use std::io::Read;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader as XmlReader;

use crate::crypto::AES_BLOCK_SIZE;
use crate::{AgileError, HashAlgorithm};

/// The only `EncryptionInfo` version this crate understands (Agile encryption).
pub const SUPPORTED_VERSION: (u16, u16) = (4, 4);

/// Offset of the XML body within the `EncryptionInfo` stream.
const XML_BODY_OFFSET: usize = 8;

pub const PASSWORD_KEY_ENCRYPTOR_NS: &str =
    "http://schemas.microsoft.com/office/2006/keyEncryptor/password";
pub const CERTIFICATE_KEY_ENCRYPTOR_NS: &str =
    "http://schemas.microsoft.com/office/2006/keyEncryptor/certificate";

/// `<keyData>`: parameters for decrypting the `EncryptedPackage` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyData {
    /// Salt hashed with the segment index to derive each segment IV.
    pub salt: Vec<u8>,
    /// Hash used for per-segment IV derivation.
    pub hash_algorithm: HashAlgorithm,
    pub block_size: Option<usize>,
    pub key_bits: Option<usize>,
}

/// Password key encryptor (`encryptedKey` in the `keyEncryptor/password` namespace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordKeyEncryptor {
    pub spin_count: u32,
    /// Salt for the first hash round; also the IV used to unwrap `encrypted_key_value`.
    pub salt: Vec<u8>,
    pub hash_algorithm: HashAlgorithm,
    pub key_bits: usize,
    pub encrypted_key_value: Vec<u8>,
}

impl PasswordKeyEncryptor {
    /// Length in bytes of the content key this encryptor wraps.
    pub fn key_len(&self) -> usize {
        self.key_bits / 8
    }
}

/// Certificate key encryptor (`encryptedKey` in the `keyEncryptor/certificate` namespace).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateKeyEncryptor {
    /// Content key wrapped with the certificate's RSA public key (PKCS#1 v1.5).
    pub encrypted_key_value: Vec<u8>,
    /// DER-encoded certificate, when the producer recorded it.
    pub x509_certificate: Option<Vec<u8>>,
}

/// Parsed Agile `EncryptionInfo`. Fully populated or not constructed at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionDescriptor {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub key_data: KeyData,
    pub password: PasswordKeyEncryptor,
    pub certificate: Option<CertificateKeyEncryptor>,
}

impl EncryptionDescriptor {
    /// Salt used for per-segment IV derivation.
    pub fn payload_salt(&self) -> &[u8] {
        &self.key_data.salt
    }

    /// Hash used for per-segment IV derivation.
    pub fn payload_hash_algorithm(&self) -> HashAlgorithm {
        self.key_data.hash_algorithm
    }

    /// Wrapped content key to hand to an RSA private key: the certificate encryptor's blob when
    /// one is present, otherwise the password encryptor's.
    pub fn asymmetric_wrapped_key(&self) -> &[u8] {
        match &self.certificate {
            Some(cert) => &cert.encrypted_key_value,
            None => &self.password.encrypted_key_value,
        }
    }
}

/// Parse an `EncryptionInfo` stream read to completion from `reader`.
pub fn parse_encryption_info_from_reader<R: Read>(
    mut reader: R,
) -> Result<EncryptionDescriptor, AgileError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    parse_encryption_info(&bytes)
}

/// Parse the bytes of an Agile `EncryptionInfo` stream.
pub fn parse_encryption_info(bytes: &[u8]) -> Result<EncryptionDescriptor, AgileError> {
    if bytes.len() < 4 {
        return Err(AgileError::Truncated {
            context: "EncryptionInfo version",
        });
    }
    let version_major = u16::from_le_bytes([bytes[0], bytes[1]]);
    let version_minor = u16::from_le_bytes([bytes[2], bytes[3]]);
    if (version_major, version_minor) != SUPPORTED_VERSION {
        return Err(AgileError::UnsupportedVersion {
            major: version_major,
            minor: version_minor,
        });
    }

    if bytes.len() < XML_BODY_OFFSET {
        return Err(AgileError::Truncated {
            context: "EncryptionInfo flags",
        });
    }
    let flags = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    let body = &bytes[XML_BODY_OFFSET..];
    let start = body
        .iter()
        .position(|b| *b == b'<')
        .ok_or(AgileError::InvalidEncryptionInfo {
            context: "missing XML descriptor body",
        })?;

    let parsed = parse_descriptor_xml(&body[start..])?;
    let descriptor = EncryptionDescriptor {
        version_major,
        version_minor,
        flags,
        key_data: parsed.key_data.ok_or(AgileError::MissingField("keyData"))?,
        password: parsed
            .password
            .ok_or(AgileError::MissingField("encryptedKey"))?,
        certificate: parsed.certificate,
    };

    log::debug!(
        "parsed Agile EncryptionInfo: keyData hash={} salt_len={}, password hash={} keyBits={} spinCount={}, certificate encryptor={}",
        descriptor.key_data.hash_algorithm,
        descriptor.key_data.salt.len(),
        descriptor.password.hash_algorithm,
        descriptor.password.key_bits,
        descriptor.password.spin_count,
        descriptor.certificate.is_some(),
    );

    Ok(descriptor)
}

#[derive(Default)]
struct ParsedElements {
    key_data: Option<KeyData>,
    password: Option<PasswordKeyEncryptor>,
    certificate: Option<CertificateKeyEncryptor>,
}

#[derive(Debug, Clone)]
struct NamespaceFrame {
    decls: Vec<(Vec<u8> /* prefix */, Vec<u8> /* uri */)>,
}

fn push_namespace_frame(
    stack: &mut Vec<NamespaceFrame>,
    elem: &BytesStart<'_>,
) -> Result<(), AgileError> {
    let mut frame = NamespaceFrame { decls: Vec::new() };

    for attr in elem.attributes().with_checks(false) {
        let attr = attr.map_err(|_| AgileError::InvalidEncryptionInfo {
            context: "invalid XML attribute",
        })?;
        let key = attr.key.as_ref();
        let value = attr.value.as_ref();

        if key == b"xmlns" {
            frame.decls.push((Vec::new(), value.to_vec()));
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            frame.decls.push((prefix.to_vec(), value.to_vec()));
        }
    }

    stack.push(frame);
    Ok(())
}

fn resolve_namespace_uri<'a>(stack: &'a [NamespaceFrame], prefix: &[u8]) -> Option<&'a [u8]> {
    stack
        .iter()
        .rev()
        .flat_map(|frame| frame.decls.iter())
        .find(|(p, _)| p.as_slice() == prefix)
        .map(|(_, uri)| uri.as_slice())
}

fn element_prefix(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[..idx])
        .unwrap_or(&[])
}

fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|b| *b == b':')
        .map(|idx| &name[idx + 1..])
        .unwrap_or(name)
}

fn parse_descriptor_xml(xml_bytes: &[u8]) -> Result<ParsedElements, AgileError> {
    let xml = std::str::from_utf8(xml_bytes).map_err(|_| AgileError::InvalidEncryptionInfo {
        context: "agile EncryptionInfo XML is not valid UTF-8",
    })?;

    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut ns_stack: Vec<NamespaceFrame> = Vec::new();
    let mut parsed = ParsedElements::default();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|_| AgileError::InvalidEncryptionInfo {
                context: "agile EncryptionInfo XML parse error",
            })?;

        match event {
            XmlEvent::Start(e) => {
                push_namespace_frame(&mut ns_stack, &e)?;
                parse_element(&ns_stack, &e, &mut parsed)?;
            }
            XmlEvent::Empty(e) => {
                push_namespace_frame(&mut ns_stack, &e)?;
                parse_element(&ns_stack, &e, &mut parsed)?;
                ns_stack.pop();
            }
            XmlEvent::End(_) => {
                ns_stack.pop();
            }
            XmlEvent::Eof => break,
            _ => {}
        }

        buf.clear();
    }

    Ok(parsed)
}

fn parse_element(
    ns_stack: &[NamespaceFrame],
    e: &BytesStart<'_>,
    parsed: &mut ParsedElements,
) -> Result<(), AgileError> {
    match e.local_name().as_ref() {
        b"keyData" if parsed.key_data.is_none() => {
            parsed.key_data = Some(parse_key_data_attrs(e)?);
        }
        b"encryptedKey" => {
            let name = e.name();
            let ns_uri = resolve_namespace_uri(ns_stack, element_prefix(name.as_ref()));
            if ns_uri == Some(PASSWORD_KEY_ENCRYPTOR_NS.as_bytes()) && parsed.password.is_none() {
                parsed.password = Some(parse_password_encrypted_key_attrs(e)?);
            } else if ns_uri == Some(CERTIFICATE_KEY_ENCRYPTOR_NS.as_bytes())
                && parsed.certificate.is_none()
            {
                parsed.certificate = Some(parse_certificate_encrypted_key_attrs(e)?);
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_key_data_attrs(e: &BytesStart<'_>) -> Result<KeyData, AgileError> {
    let mut salt: Option<Vec<u8>> = None;
    let mut hash_algorithm: Option<HashAlgorithm> = None;
    let mut block_size: Option<usize> = None;
    let mut key_bits: Option<usize> = None;

    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|_| AgileError::InvalidEncryptionInfo {
            context: "invalid XML attribute",
        })?;
        let value = attr.value.as_ref();
        match local_name(attr.key.as_ref()) {
            b"saltValue" => salt = Some(decode_base64(value)?),
            b"hashAlgorithm" => {
                hash_algorithm = Some(HashAlgorithm::parse_offcrypto_name(attr_str(value)?)?)
            }
            b"blockSize" => block_size = Some(parse_decimal_usize(value)?),
            b"keyBits" => key_bits = Some(parse_decimal_usize(value)?),
            b"cipherAlgorithm" => check_cipher_algorithm(value)?,
            b"cipherChaining" => check_cipher_chaining(value)?,
            _ => {}
        }
    }

    let salt = salt.ok_or(AgileError::MissingField("keyData.saltValue"))?;
    if salt.is_empty() {
        return Err(AgileError::InvalidEncryptionInfo {
            context: "keyData.saltValue is empty",
        });
    }
    if let Some(block_size) = block_size {
        if block_size != AES_BLOCK_SIZE {
            return Err(AgileError::InvalidEncryptionInfo {
                context: "keyData.blockSize must be 16 for AES-CBC",
            });
        }
    }

    Ok(KeyData {
        salt,
        hash_algorithm: hash_algorithm.ok_or(AgileError::MissingField("keyData.hashAlgorithm"))?,
        block_size,
        key_bits,
    })
}

fn parse_password_encrypted_key_attrs(
    e: &BytesStart<'_>,
) -> Result<PasswordKeyEncryptor, AgileError> {
    let mut spin_count: Option<u32> = None;
    let mut salt: Option<Vec<u8>> = None;
    let mut hash_algorithm: Option<HashAlgorithm> = None;
    let mut key_bits: Option<usize> = None;
    let mut encrypted_key_value: Option<Vec<u8>> = None;

    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|_| AgileError::InvalidEncryptionInfo {
            context: "invalid XML attribute",
        })?;
        let value = attr.value.as_ref();
        match local_name(attr.key.as_ref()) {
            b"spinCount" => spin_count = Some(parse_decimal_u32(value)?),
            b"saltValue" => salt = Some(decode_base64(value)?),
            b"hashAlgorithm" => {
                hash_algorithm = Some(HashAlgorithm::parse_offcrypto_name(attr_str(value)?)?)
            }
            b"keyBits" => key_bits = Some(parse_decimal_usize(value)?),
            b"encryptedKeyValue" => encrypted_key_value = Some(decode_base64(value)?),
            b"cipherAlgorithm" => check_cipher_algorithm(value)?,
            b"cipherChaining" => check_cipher_chaining(value)?,
            _ => {}
        }
    }

    let spin_count = spin_count.ok_or(AgileError::MissingField("spinCount"))?;
    let salt = salt.ok_or(AgileError::MissingField("saltValue"))?;
    let hash_algorithm = hash_algorithm.ok_or(AgileError::MissingField("hashAlgorithm"))?;
    let key_bits = key_bits.ok_or(AgileError::MissingField("keyBits"))?;
    let encrypted_key_value =
        encrypted_key_value.ok_or(AgileError::MissingField("encryptedKeyValue"))?;

    if salt.len() != AES_BLOCK_SIZE {
        return Err(AgileError::InvalidEncryptionInfo {
            context: "encryptedKey.saltValue must be 16 bytes",
        });
    }
    if !matches!(key_bits, 128 | 192 | 256) {
        return Err(AgileError::InvalidEncryptionInfo {
            context: "encryptedKey.keyBits must be 128, 192 or 256",
        });
    }

    Ok(PasswordKeyEncryptor {
        spin_count,
        salt,
        hash_algorithm,
        key_bits,
        encrypted_key_value,
    })
}

fn parse_certificate_encrypted_key_attrs(
    e: &BytesStart<'_>,
) -> Result<CertificateKeyEncryptor, AgileError> {
    let mut encrypted_key_value: Option<Vec<u8>> = None;
    let mut x509_certificate: Option<Vec<u8>> = None;

    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|_| AgileError::InvalidEncryptionInfo {
            context: "invalid XML attribute",
        })?;
        let value = attr.value.as_ref();
        match local_name(attr.key.as_ref()) {
            b"encryptedKeyValue" => encrypted_key_value = Some(decode_base64(value)?),
            b"X509Certificate" => x509_certificate = Some(decode_base64(value)?),
            _ => {}
        }
    }

    Ok(CertificateKeyEncryptor {
        encrypted_key_value: encrypted_key_value
            .ok_or(AgileError::MissingField("certificate encryptedKeyValue"))?,
        x509_certificate,
    })
}

fn check_cipher_algorithm(value: &[u8]) -> Result<(), AgileError> {
    if !attr_str(value)?.trim().eq_ignore_ascii_case("AES") {
        return Err(AgileError::InvalidEncryptionInfo {
            context: "unsupported cipherAlgorithm (only AES is supported)",
        });
    }
    Ok(())
}

fn check_cipher_chaining(value: &[u8]) -> Result<(), AgileError> {
    if !attr_str(value)?.trim().eq_ignore_ascii_case("ChainingModeCBC") {
        return Err(AgileError::InvalidEncryptionInfo {
            context: "unsupported cipherChaining (only ChainingModeCBC is supported)",
        });
    }
    Ok(())
}

fn attr_str(value: &[u8]) -> Result<&str, AgileError> {
    std::str::from_utf8(value).map_err(|_| AgileError::InvalidEncryptionInfo {
        context: "invalid UTF-8 attribute value",
    })
}

fn decode_b64_attr(value: &str) -> Result<Vec<u8>, AgileError> {
    // Pretty-printed descriptors may wrap long base64 values; some producers drop `=` padding.
    let cleaned: Vec<u8> = value
        .bytes()
        .filter(|b| !matches!(b, b'\r' | b'\n' | b'\t' | b' '))
        .collect();

    STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .map_err(|_| AgileError::InvalidEncryptionInfo {
            context: "invalid base64 value",
        })
}

fn decode_base64(value: &[u8]) -> Result<Vec<u8>, AgileError> {
    decode_b64_attr(attr_str(value)?)
}

fn parse_decimal_u32(value: &[u8]) -> Result<u32, AgileError> {
    attr_str(value)?
        .trim()
        .parse::<u32>()
        .map_err(|_| AgileError::InvalidEncryptionInfo {
            context: "invalid numeric attribute",
        })
}

fn parse_decimal_usize(value: &[u8]) -> Result<usize, AgileError> {
    attr_str(value)?
        .trim()
        .parse::<usize>()
        .map_err(|_| AgileError::InvalidEncryptionInfo {
            context: "invalid numeric attribute",
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<encryption xmlns="http://schemas.microsoft.com/office/2006/encryption"
    xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
  <keyData saltValue="AAECAwQF BgcICQoLDA0ODw" hashAlgorithm="SHA1" blockSize="16" keyBits="128"
    cipherAlgorithm="AES" cipherChaining="ChainingModeCBC"/>
  <keyEncryptors>
    <keyEncryptor uri="http://schemas.microsoft.com/office/2006/keyEncryptor/password">
      <p:encryptedKey spinCount="100000" saltValue="ABEiM0RVZneImaq7zN3u/w==" hashAlgorithm="SHA512"
        keyBits="256" encryptedKeyValue="BQY HCA"/>
    </keyEncryptor>
  </keyEncryptors>
</encryption>
"#;

    fn with_header(major: u16, minor: u16, xml: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&major.to_le_bytes());
        bytes.extend_from_slice(&minor.to_le_bytes());
        bytes.extend_from_slice(&0x40u32.to_le_bytes());
        bytes.extend_from_slice(xml.as_bytes());
        bytes
    }

    #[test]
    fn decode_b64_attr_padded_unpadded_and_whitespace() {
        assert_eq!(decode_b64_attr("AQIDBA==").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(decode_b64_attr("AQIDBA").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(decode_b64_attr("A QID\r\nBA==\t").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn parses_minimal_descriptor() {
        let info = parse_encryption_info(&with_header(4, 4, MINIMAL_XML)).expect("parse");
        assert_eq!((info.version_major, info.version_minor), (4, 4));
        assert_eq!(info.flags, 0x40);
        assert_eq!(info.key_data.salt, (0u8..16).collect::<Vec<_>>());
        assert_eq!(info.key_data.hash_algorithm, HashAlgorithm::Sha1);
        assert_eq!(info.key_data.block_size, Some(16));
        assert_eq!(info.key_data.key_bits, Some(128));
        assert_eq!(info.password.spin_count, 100_000);
        assert_eq!(info.password.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(info.password.key_bits, 256);
        assert_eq!(info.password.key_len(), 32);
        assert_eq!(info.password.encrypted_key_value, vec![5, 6, 7, 8]);
        assert!(info.certificate.is_none());
        assert_eq!(info.asymmetric_wrapped_key(), &[5, 6, 7, 8]);
    }

    #[test]
    fn accepts_extra_reserved_dword_before_xml() {
        let mut bytes = with_header(4, 4, "");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(MINIMAL_XML.as_bytes());
        let info = parse_encryption_info(&bytes).expect("parse");
        assert_eq!(info.password.spin_count, 100_000);
    }

    #[test]
    fn password_encryptor_is_found_by_namespace_not_prefix() {
        let xml = MINIMAL_XML
            .replace("xmlns:p=", "xmlns:pw=")
            .replace("<p:encryptedKey", "<pw:encryptedKey");
        let info = parse_encryption_info(&with_header(4, 4, &xml)).expect("parse");
        assert_eq!(info.password.key_bits, 256);

        // Same element name under an unrelated namespace is not the password encryptor.
        let xml = MINIMAL_XML.replace(
            r#"xmlns:p="http://schemas.microsoft.com/office/2006/keyEncryptor/password""#,
            r#"xmlns:p="urn:example:other""#,
        );
        let err = parse_encryption_info(&with_header(4, 4, &xml)).unwrap_err();
        assert!(matches!(err, AgileError::MissingField("encryptedKey")), "{err:?}");
    }

    #[test]
    fn rejects_non_aes_cipher() {
        let xml = MINIMAL_XML.replace(r#"cipherAlgorithm="AES""#, r#"cipherAlgorithm="3DES""#);
        let err = parse_encryption_info(&with_header(4, 4, &xml)).unwrap_err();
        assert!(matches!(err, AgileError::InvalidEncryptionInfo { .. }));
    }

    #[test]
    fn rejects_unsupported_key_bits() {
        let xml = MINIMAL_XML.replace(r#"keyBits="256""#, r#"keyBits="100""#);
        let err = parse_encryption_info(&with_header(4, 4, &xml)).unwrap_err();
        assert!(matches!(err, AgileError::InvalidEncryptionInfo { .. }));
    }

    #[test]
    fn missing_key_data_element_is_missing_field() {
        let start = MINIMAL_XML.find("<keyData").unwrap();
        let end = MINIMAL_XML[start..].find("/>").unwrap() + start + 2;
        let xml = format!("{}{}", &MINIMAL_XML[..start], &MINIMAL_XML[end..]);
        let err = parse_encryption_info(&with_header(4, 4, &xml)).unwrap_err();
        assert!(matches!(err, AgileError::MissingField("keyData")), "{err:?}");
    }

    #[test]
    fn truncated_headers() {
        assert!(matches!(
            parse_encryption_info(&[4, 0]),
            Err(AgileError::Truncated { .. })
        ));
        assert!(matches!(
            parse_encryption_info(&[4, 0, 4, 0, 0]),
            Err(AgileError::Truncated { .. })
        ));
        assert!(matches!(
            parse_encryption_info(&[4, 0, 4, 0, 0, 0, 0, 0]),
            Err(AgileError::InvalidEncryptionInfo { .. })
        ));
    }
}
