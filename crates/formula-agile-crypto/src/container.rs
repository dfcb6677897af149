//! Access to the `EncryptionInfo` / `EncryptedPackage` streams of an OLE compound file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rsa::RsaPrivateKey;

use crate::descriptor::parse_encryption_info_from_reader;
use crate::key::KeySource;
use crate::{AgileDecryptor, AgileError, DecryptOptions, EncryptionDescriptor};

/// OLE / CFB signature at offset 0 of every compound file.
pub const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

pub const ENCRYPTION_INFO_STREAM: &str = "EncryptionInfo";
pub const ENCRYPTED_PACKAGE_STREAM: &str = "EncryptedPackage";

/// Something that can hand out named byte streams.
pub trait StreamSource {
    fn open_stream(&mut self, name: &str) -> io::Result<Box<dyn Read + '_>>;
}

impl<F: Read + Seek> StreamSource for cfb::CompoundFile<F> {
    fn open_stream(&mut self, name: &str) -> io::Result<Box<dyn Read + '_>> {
        let path = resolve_stream_path(self, name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("compound file has no `{}` stream", name.trim_start_matches('/')),
            )
        })?;
        let stream = cfb::CompoundFile::open_stream(self, &path)?;
        Ok(Box::new(stream))
    }
}

/// Streams already extracted into memory, keyed by stream name.
impl StreamSource for HashMap<String, Vec<u8>> {
    fn open_stream(&mut self, name: &str) -> io::Result<Box<dyn Read + '_>> {
        let want = name.trim_start_matches('/');
        let bytes = self
            .iter()
            .find(|(key, _)| key.trim_start_matches('/').eq_ignore_ascii_case(want))
            .map(|(_, bytes)| bytes.as_slice())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no `{want}` stream"))
            })?;
        Ok(Box::new(bytes))
    }
}

/// Locate a stream by name: exact root path first, then a case-insensitive walk.
fn resolve_stream_path<F>(ole: &cfb::CompoundFile<F>, name: &str) -> Option<PathBuf> {
    let want = name.trim_start_matches('/');
    let rooted = PathBuf::from(format!("/{want}"));
    if ole.is_stream(&rooted) {
        return Some(rooted);
    }

    ole.walk()
        .filter(|entry| entry.is_stream())
        .find(|entry| {
            entry
                .path()
                .to_string_lossy()
                .trim_start_matches('/')
                .eq_ignore_ascii_case(want)
        })
        .map(|entry| entry.path().to_path_buf())
}

/// Returns `true` if `bytes` is an OLE compound file carrying both encryption streams.
///
/// Only the presence of the streams is checked; the `EncryptionInfo` version is not.
pub fn is_encrypted_container(bytes: &[u8]) -> bool {
    if !bytes.starts_with(&OLE_MAGIC) {
        return false;
    }
    let Ok(ole) = cfb::CompoundFile::open(Cursor::new(bytes)) else {
        return false;
    };
    resolve_stream_path(&ole, ENCRYPTION_INFO_STREAM).is_some()
        && resolve_stream_path(&ole, ENCRYPTED_PACKAGE_STREAM).is_some()
}

/// An encrypted Office document: its stream source plus a decryptor built from `EncryptionInfo`.
#[derive(Debug)]
pub struct EncryptedOfficeFile<S> {
    source: S,
    decryptor: AgileDecryptor,
}

impl EncryptedOfficeFile<cfb::CompoundFile<File>> {
    /// Open a compound file on disk and parse its `EncryptionInfo` stream.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, AgileError> {
        let path = path.as_ref();
        let mut file = File::open(path)?;

        let mut magic = [0u8; OLE_MAGIC.len()];
        let is_ole = match file.read_exact(&mut magic) {
            Ok(()) => magic == OLE_MAGIC,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => false,
            Err(err) => return Err(err.into()),
        };
        if !is_ole {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not an OLE compound file").into());
        }
        file.seek(SeekFrom::Start(0))?;

        log::debug!("opening compound file {}", path.display());
        Self::open(cfb::CompoundFile::open(file)?)
    }
}

impl<S: StreamSource> EncryptedOfficeFile<S> {
    pub fn open(source: S) -> Result<Self, AgileError> {
        Self::open_with_options(source, DecryptOptions::default())
    }

    pub fn open_with_options(mut source: S, options: DecryptOptions) -> Result<Self, AgileError> {
        let descriptor = {
            let stream = source.open_stream(ENCRYPTION_INFO_STREAM)?;
            parse_encryption_info_from_reader(stream)?
        };
        Ok(Self {
            source,
            decryptor: AgileDecryptor::with_options(descriptor, options),
        })
    }

    pub fn descriptor(&self) -> &EncryptionDescriptor {
        self.decryptor.descriptor()
    }

    pub fn decryptor(&self) -> &AgileDecryptor {
        &self.decryptor
    }

    pub fn decryptor_mut(&mut self) -> &mut AgileDecryptor {
        &mut self.decryptor
    }

    pub fn load_key_source(&mut self, source: &KeySource) -> Result<(), AgileError> {
        self.decryptor.load_key_source(source)
    }

    pub fn load_raw_key(&mut self, key: impl Into<Vec<u8>>) {
        self.decryptor.load_raw_key(key)
    }

    pub fn load_password(&mut self, password: &str) -> Result<(), AgileError> {
        self.decryptor.load_password(password)
    }

    pub fn load_private_key(&mut self, key: &RsaPrivateKey) -> Result<(), AgileError> {
        self.decryptor.load_private_key(key)
    }

    /// Decrypt the `EncryptedPackage` stream into `sink`, returning the number of bytes written.
    pub fn decrypt_to<W: Write>(&mut self, sink: W) -> Result<u64, AgileError> {
        if !self.decryptor.has_key() {
            return Err(AgileError::NoKeyLoaded);
        }
        let package = self.source.open_stream(ENCRYPTED_PACKAGE_STREAM)?;
        self.decryptor.decrypt_to(package, sink)
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}
