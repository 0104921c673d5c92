//! Archive access
//!
//! The parser and the fetcher only need random access to the named entries of
//! the container. [`ArchiveReader`] is that seam; [`ZipArchiveReader`] implements
//! it over any seekable ZIP source.

use std::{
    fs::File,
    io::{BufReader, Read, Seek},
    path::Path,
    sync::Mutex,
};

use log::warn;
use zip::{CompressionMethod, ZipArchive, result::ZipError};

use crate::{error::EpubError, utils::DecodeBytes};

/// Path of the entry declaring the media type of the container
pub const MIMETYPE_PATH: &str = "mimetype";

/// The only media type accepted for an EPUB container
pub const EPUB_MIMETYPE: &str = "application/epub+zip";

/// Thread-safe, random-access reader over the named entries of a container
///
/// Implementations must report a missing entry as [`EpubError::ResourceNotFound`]
/// so that the fetcher can propagate it unchanged.
pub trait ArchiveReader: Send + Sync {
    /// Reads the whole content of the entry at `path`
    fn read(&self, path: &str) -> Result<Vec<u8>, EpubError>;

    /// Whether the container has an entry at `path`
    fn contains(&self, path: &str) -> bool;

    /// Reads an entry and decodes it to a string
    fn read_to_string(&self, path: &str) -> Result<String, EpubError> {
        self.read(path)?.decode()
    }
}

/// [`ArchiveReader`] over a ZIP archive
///
/// Entry reads are serialized behind a mutex, the underlying `ZipArchive`
/// needs mutable access to seek into its source.
pub struct ZipArchiveReader<R: Read + Seek + Send> {
    archive: Mutex<ZipArchive<R>>,
}

impl<R: Read + Seek + Send> ZipArchiveReader<R> {
    /// Opens a ZIP source as an EPUB container
    ///
    /// The `mimetype` entry, when present, must declare `application/epub+zip`.
    /// A container without `mimetype` is accepted with a warning. Every entry must
    /// use the Stored or Deflated compression method.
    ///
    /// ## Return
    /// - `Ok(ZipArchiveReader)`: The opened container
    /// - `Err(EpubError)`: The source is not a ZIP archive, declares a wrong media
    ///   type, or uses an unusable compression method
    pub fn new(reader: R) -> Result<Self, EpubError> {
        let mut archive = ZipArchive::new(reader)?;

        check_mimetype(&mut archive)?;
        compression_method_check(&mut archive)?;

        Ok(Self {
            archive: Mutex::new(archive),
        })
    }
}

impl ZipArchiveReader<BufReader<File>> {
    /// Opens the EPUB file at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EpubError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek + Send> ArchiveReader for ZipArchiveReader<R> {
    fn read(&self, path: &str) -> Result<Vec<u8>, EpubError> {
        let mut archive = self.archive.lock()?;
        get_file_in_zip_archive(&mut archive, path)
    }

    fn contains(&self, path: &str) -> bool {
        match self.archive.lock() {
            Ok(archive) => archive.index_for_name(path).is_some(),
            Err(_) => false,
        }
    }
}

/// Reads the whole content of a ZIP entry
///
/// A missing entry is reported as [`EpubError::ResourceNotFound`].
fn get_file_in_zip_archive<R: Read + Seek>(
    zip_file: &mut ZipArchive<R>,
    file_name: &str,
) -> Result<Vec<u8>, EpubError> {
    let mut buffer = Vec::<u8>::new();
    match zip_file.by_name(file_name) {
        Ok(mut file) => {
            file.read_to_end(&mut buffer)?;
            Ok(buffer)
        }
        Err(ZipError::FileNotFound) => Err(EpubError::ResourceNotFound {
            resource: file_name.to_string(),
        }),
        Err(err) => Err(EpubError::from(err)),
    }
}

fn check_mimetype<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<(), EpubError> {
    match get_file_in_zip_archive(archive, MIMETYPE_PATH) {
        Ok(content) => {
            let found = String::from_utf8_lossy(&content).trim().to_string();
            if found != EPUB_MIMETYPE {
                return Err(EpubError::WrongMimeType { found });
            }
            Ok(())
        }
        Err(EpubError::ResourceNotFound { .. }) => {
            warn!("The container has no \"{}\" entry.", MIMETYPE_PATH);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Checks if the compression method of all entries in the EPUB file
/// conforms to the specification requirements.
///
/// OCF ZIP containers can only use either Stored (uncompressed) or
/// Deflated (deflate compression).
fn compression_method_check<R: Read + Seek>(
    zip_archive: &mut ZipArchive<R>,
) -> Result<(), EpubError> {
    for index in 0..zip_archive.len() {
        let file = zip_archive.by_index(index)?;

        match file.compression() {
            CompressionMethod::Stored | CompressionMethod::Deflated => continue,
            _ => {
                return Err(EpubError::UnusableCompressionMethod {
                    file: file.name().to_string(),
                    method: file.compression().to_string(),
                });
            }
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::{
        archive::{ArchiveReader, ZipArchiveReader},
        error::EpubError,
        test_support::ArchiveBuilder,
    };

    #[test]
    fn test_read_existing_and_missing_entry() {
        let bytes = ArchiveBuilder::new()
            .file("OEBPS/chapter.xhtml", "<html/>")
            .build();
        let reader = ZipArchiveReader::new(Cursor::new(bytes));
        assert!(reader.is_ok());

        let reader = reader.unwrap();
        assert!(reader.contains("OEBPS/chapter.xhtml"));
        assert!(!reader.contains("OEBPS/missing.xhtml"));
        assert_eq!(reader.read("OEBPS/chapter.xhtml").unwrap(), b"<html/>");
        assert_eq!(
            reader.read("OEBPS/missing.xhtml").unwrap_err(),
            EpubError::ResourceNotFound {
                resource: "OEBPS/missing.xhtml".to_string()
            }
        );
    }

    #[test]
    fn test_deflated_entries() {
        let content = "<html><body>".to_string() + &"lorem ipsum ".repeat(64) + "</body></html>";
        let archive = ArchiveBuilder::new()
            .deflated_file("OEBPS/chapter.xhtml", &content)
            .open();

        let result = archive.read_to_string("OEBPS/chapter.xhtml");
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), content);
    }

    #[test]
    fn test_wrong_mimetype() {
        let bytes = ArchiveBuilder::bare()
            .file("mimetype", "application/zip")
            .build();
        let result = ZipArchiveReader::new(Cursor::new(bytes));
        assert_eq!(
            result.err().unwrap(),
            EpubError::WrongMimeType {
                found: "application/zip".to_string()
            }
        );
    }

    /// A container without a mimetype entry is still opened
    #[test]
    fn test_missing_mimetype_is_tolerated() {
        let bytes = ArchiveBuilder::bare().file("content.opf", "<package/>").build();
        assert!(ZipArchiveReader::new(Cursor::new(bytes)).is_ok());
    }

    #[test]
    fn test_not_a_zip() {
        let result = ZipArchiveReader::new(Cursor::new(b"definitely not a zip".to_vec()));
        assert!(matches!(result, Err(EpubError::ArchiveError { .. })));
    }
}
