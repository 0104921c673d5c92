//! Error Type Definition Module
//!
//! This module defines the various error types that may be encountered while
//! parsing an EPUB package and while reading resources through the transforming
//! fetcher. All errors are uniformly wrapped in the `EpubError` enumeration for
//! convenient error handling by the caller.
//!
//! Structural errors (`WrongMimeType`, `MissingFile`, `MissingRootfile`, `XmlParse`)
//! abort the whole parse. Errors reported by [`crate::epub::Publication::read`]
//! are local to the resource being read.

use thiserror::Error;

/// Types of errors that can occur during EPUB processing
#[derive(Debug, Error)]
pub enum EpubError {
    /// ZIP archive related errors
    ///
    /// Errors occur when processing the ZIP structure of EPUB files,
    /// such as file corruption, unreadability, etc.
    #[error("Archive error: {source}")]
    ArchiveError { source: zip::result::ZipError },

    /// Decryption failure error
    ///
    /// The license accepted the algorithm but the ciphertext could not be deciphered,
    /// usually because the credential is wrong or the data is truncated.
    #[error("Decryption failed: Unable to decipher \"{resource}\": {reason}.")]
    DecryptionFailed { resource: String, reason: String },

    /// DRM already settled error
    ///
    /// The resolution continuation was invoked after the DRM descriptor
    /// had already been resolved or abandoned.
    #[error("DRM already settled: The DRM of this publication can only be resolved once.")]
    DrmAlreadySettled,

    /// Data Decoding Error - Null data
    ///
    /// This error occurs when trying to decode an empty stream.
    #[error("Decode error: The data is empty.")]
    EmptyDataError,

    #[error("IO error: {source}")]
    IOError { source: std::io::Error },

    /// Missing fixed-path file error
    ///
    /// Triggered when a file required at a fixed location of the container,
    /// or the package document itself, does not exist in the archive.
    #[error("Missing file: The \"{path}\" file was not found in the container.")]
    MissingFile { path: String },

    /// Missing rootfile error
    ///
    /// The container document does not declare any package document path.
    #[error("Missing rootfile: The container does not declare any package document.")]
    MissingRootfile,

    /// Mutex error
    ///
    /// This error occurs when a lock is poisoned, which means
    /// that a thread has panicked while holding it.
    #[error("Mutex error: Mutex was poisoned.")]
    MutexError,

    /// Non-canonical file structure error
    ///
    /// This error is triggered when the required XML elements in the
    /// specification are missing from the EPUB file.
    #[error("Non-canonical file: The \"{tag}\" elements was not found.")]
    NonCanonicalFile { tag: String },

    /// No DRM to resolve error
    ///
    /// The resolution continuation was invoked on a publication without DRM.
    #[error("No DRM: This publication is not protected by any DRM.")]
    NoDrmToResolve,

    /// Missing supported file format error
    ///
    /// This error occurs when trying to get a resource but there isn't any supported file format.
    /// It usually happens when there are no supported formats available in the fallback chain.
    #[error(
        "No supported file format: The fallback resource does not contain the file format you support."
    )]
    NoSupportedFileFormat,

    /// Obfuscation key unavailable error
    ///
    /// A font is obfuscated but no key can be derived from the publication identifier.
    #[error("Obfuscation key unavailable: Unable to derive a key to de-obfuscate \"{resource}\".")]
    ObfuscationKeyUnavailable { resource: String },

    /// Protected resource error
    ///
    /// The resource is encrypted with a DRM whose credential has not been supplied,
    /// or whose resolution has been abandoned.
    #[error("Protected resource: \"{resource}\" is protected by the {brand} DRM.")]
    ProtectedResource { resource: String, brand: String },

    /// Relative link leak error
    ///
    /// This error occurs when a relative path link is outside the scope
    /// of an EPUB container, which is a security protection mechanism.
    #[error("Relative link leakage: Path \"{path}\" is out of container range.")]
    RelativeLinkLeakage { path: String },

    /// Unable to find the resource id error
    ///
    /// This error occurs when trying to get a resource by id but that id doesn't exist in the manifest.
    #[error("Resource Id Not Exist: There is no resource item with id \"{id}\".")]
    ResourceIdNotExist { id: String },

    /// Unable to find the resource error
    ///
    /// This error occurs when an attempt is made to get a resource
    /// but it does not exist in the EPUB container.
    #[error("Resource not found: Unable to find resource from \"{resource}\".")]
    ResourceNotFound { resource: String },

    /// Unsupported encryption method error
    ///
    /// This error is triggered when attempting to decrypt a resource that uses
    /// an encryption method not supported by this library or by the resolved license.
    #[error("Unsupported encryption method: The \"{method}\" encryption method is not supported.")]
    UnsupportedEncryptedMethod { method: String },

    /// Unusable compression method error
    ///
    /// This error occurs when an EPUB file uses an unsupported compression method.
    #[error(
        "Unusable compression method: The \"{file}\" file uses the unsupported \"{method}\" compression method."
    )]
    UnusableCompressionMethod { file: String, method: String },

    /// UTF-8 decoding error
    #[error("Decode error: {source}")]
    Utf8DecodeError { source: std::string::FromUtf8Error },

    /// UTF-16 decoding error
    #[error("Decode error: {source}")]
    Utf16DecodeError { source: std::string::FromUtf16Error },

    /// Wrong mime type error
    ///
    /// The `mimetype` file of the container does not declare `application/epub+zip`.
    #[error("Wrong mime type: Expected \"application/epub+zip\" but found \"{found}\".")]
    WrongMimeType { found: String },

    /// XML parsing failure error
    ///
    /// Any structured document of the package could not be parsed.
    #[error("Failed parsing XML: {cause}")]
    XmlParse { cause: String },
}

impl From<zip::result::ZipError> for EpubError {
    fn from(value: zip::result::ZipError) -> Self {
        EpubError::ArchiveError { source: value }
    }
}

impl From<quick_xml::Error> for EpubError {
    fn from(value: quick_xml::Error) -> Self {
        EpubError::XmlParse {
            cause: value.to_string(),
        }
    }
}

impl From<std::io::Error> for EpubError {
    fn from(value: std::io::Error) -> Self {
        EpubError::IOError { source: value }
    }
}

impl From<std::string::FromUtf8Error> for EpubError {
    fn from(value: std::string::FromUtf8Error) -> Self {
        EpubError::Utf8DecodeError { source: value }
    }
}

impl From<std::string::FromUtf16Error> for EpubError {
    fn from(value: std::string::FromUtf16Error) -> Self {
        EpubError::Utf16DecodeError { source: value }
    }
}

impl<T> From<std::sync::PoisonError<T>> for EpubError {
    fn from(_value: std::sync::PoisonError<T>) -> Self {
        EpubError::MutexError
    }
}

#[cfg(test)]
impl PartialEq for EpubError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::DecryptionFailed {
                    resource: l_resource,
                    ..
                },
                Self::DecryptionFailed {
                    resource: r_resource,
                    ..
                },
            ) => l_resource == r_resource,
            (Self::MissingFile { path: l_path }, Self::MissingFile { path: r_path }) => {
                l_path == r_path
            }
            (Self::NonCanonicalFile { tag: l_tag }, Self::NonCanonicalFile { tag: r_tag }) => {
                l_tag == r_tag
            }
            (
                Self::ObfuscationKeyUnavailable {
                    resource: l_resource,
                },
                Self::ObfuscationKeyUnavailable {
                    resource: r_resource,
                },
            ) => l_resource == r_resource,
            (
                Self::ProtectedResource {
                    resource: l_resource,
                    brand: l_brand,
                },
                Self::ProtectedResource {
                    resource: r_resource,
                    brand: r_brand,
                },
            ) => l_resource == r_resource && l_brand == r_brand,
            (
                Self::RelativeLinkLeakage { path: l_path },
                Self::RelativeLinkLeakage { path: r_path },
            ) => l_path == r_path,
            (Self::ResourceIdNotExist { id: l_id }, Self::ResourceIdNotExist { id: r_id }) => {
                l_id == r_id
            }
            (
                Self::ResourceNotFound {
                    resource: l_resource,
                },
                Self::ResourceNotFound {
                    resource: r_resource,
                },
            ) => l_resource == r_resource,
            (
                Self::UnsupportedEncryptedMethod { method: l_method },
                Self::UnsupportedEncryptedMethod { method: r_method },
            ) => l_method == r_method,
            (
                Self::UnusableCompressionMethod {
                    file: l_file,
                    method: l_method,
                },
                Self::UnusableCompressionMethod {
                    file: r_file,
                    method: r_method,
                },
            ) => l_file == r_file && l_method == r_method,
            (
                Self::Utf8DecodeError { source: l_source },
                Self::Utf8DecodeError { source: r_source },
            ) => l_source == r_source,
            (Self::WrongMimeType { found: l_found }, Self::WrongMimeType { found: r_found }) => {
                l_found == r_found
            }

            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}
