//! In-memory EPUB fixtures shared by the unit tests

use std::{
    io::{Cursor, Write},
    sync::Arc,
};

use flate2::{Compression, write::DeflateEncoder};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::{
    archive::{ArchiveReader, ZipArchiveReader},
    drm::DrmLicense,
    error::EpubError,
};

/// Builds a ZIP archive in memory, entries are stored in insertion order
pub(crate) struct ArchiveBuilder {
    entries: Vec<(String, Vec<u8>, CompressionMethod)>,
}

impl ArchiveBuilder {
    /// An archive starting with a valid `mimetype` entry
    pub(crate) fn new() -> Self {
        Self::bare().file("mimetype", "application/epub+zip")
    }

    /// An archive without any entry
    pub(crate) fn bare() -> Self {
        Self { entries: vec![] }
    }

    pub(crate) fn file(mut self, path: &str, content: impl AsRef<[u8]>) -> Self {
        self.entries.push((
            path.to_string(),
            content.as_ref().to_vec(),
            CompressionMethod::Stored,
        ));
        self
    }

    /// Adds an entry compressed by the ZIP layer itself
    pub(crate) fn deflated_file(mut self, path: &str, content: impl AsRef<[u8]>) -> Self {
        self.entries.push((
            path.to_string(),
            content.as_ref().to_vec(),
            CompressionMethod::Deflated,
        ));
        self
    }

    /// Replaces the content of the entries already added at `path`
    pub(crate) fn replace(mut self, path: &str, content: impl AsRef<[u8]>) -> Self {
        for entry in self.entries.iter_mut().filter(|(name, ..)| name == path) {
            entry.1 = content.as_ref().to_vec();
        }
        self
    }

    pub(crate) fn container(self, package_path: &str) -> Self {
        self.file("META-INF/container.xml", container_xml(package_path))
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (path, content, method) in self.entries {
            let options = SimpleFileOptions::default().compression_method(method);
            zip.start_file(path, options).unwrap();
            zip.write_all(&content).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    pub(crate) fn open(self) -> Arc<dyn ArchiveReader> {
        Arc::new(ZipArchiveReader::new(Cursor::new(self.build())).unwrap())
    }
}

pub(crate) fn container_xml(package_path: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="{}" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
        package_path
    )
}

/// A package document with the given manifest items, spine attributes and spine itemrefs
pub(crate) fn package_opf(version: &str, manifest: &str, spine_attrs: &str, spine: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="{}" unique-identifier="pub-id">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="pub-id">urn:uuid:0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0</dc:identifier>
    <dc:title>Fixture Book</dc:title>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>
{}
  </manifest>
  <spine {}>
{}
  </spine>
</package>"#,
        version, manifest, spine_attrs, spine
    )
}

/// An XHTML document with its own stylesheet
pub(crate) fn xhtml(title: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xml:lang="en">
<head>
<title>{0}</title>
<link rel="stylesheet" href="style.css"/>
</head>
<body><h1>{0}</h1></body>
</html>"#,
        title
    )
}

pub(crate) fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// A license XORing every byte with a single key byte
pub(crate) struct XorLicense {
    pub(crate) algorithm: &'static str,
    pub(crate) key: u8,
}

impl XorLicense {
    pub(crate) const ALGORITHM: &'static str = "urn:test:xor";

    pub(crate) fn new(key: u8) -> Self {
        Self {
            algorithm: Self::ALGORITHM,
            key,
        }
    }

    pub(crate) fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        data.iter().map(|byte| byte ^ self.key).collect()
    }
}

impl DrmLicense for XorLicense {
    fn decipher(&self, algorithm: &str, data: &[u8]) -> Result<Vec<u8>, EpubError> {
        if algorithm != self.algorithm {
            return Err(EpubError::UnsupportedEncryptedMethod {
                method: algorithm.to_string(),
            });
        }
        Ok(self.encrypt(data))
    }
}

/// Encrypts with AES-256-CBC and PKCS#7 padding, the IV is prepended
#[cfg(feature = "aes")]
pub(crate) fn aes256_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    use aes::{
        Aes256,
        cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7},
    };

    let cipher = cbc::Encryptor::<Aes256>::new_from_slices(key, iv).unwrap();
    let mut output = iv.to_vec();
    output.extend(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext));
    output
}
