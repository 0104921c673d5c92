//! EPUB streamer
//!
//! A Rust library turning an EPUB container into a publication model and
//! serving its resources through a transforming fetcher.
//!
//! Parsing locates the package document through `META-INF/container.xml`,
//! probes the container for a DRM, reads the optional encryption descriptor,
//! parses the package document and builds the navigation collections from the
//! navigation document, falling back to the legacy NCX. Resources are then read
//! through an ordered chain of stages: decryption, font de-obfuscation and the
//! injection of ReadiumCSS and reader settings into content documents.
//!
//! ## Features
//!
//! - EPUB 2 and EPUB 3 package documents, metadata, reading order and resources.
//! - Navigation collections: table of contents, page list, landmarks and lists of
//!   illustrations, audio, tables and videos.
//! - IDPF and Adobe font de-obfuscation.
//! - Pluggable DRM detection and licenses, LCP and Adobe ADEPT detected by default.
//! - Non-fatal problems are collected as diagnostics instead of failing the parse.
//!
//! ## Quick Start
//!
//! ```rust, ignore
//! # use std::sync::Arc;
//! # use epub_streamer::{drm::ContentKeyLicense, epub::parse, types::NavRole};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (publication, resolver) = parse("path/to/epub/file.epub")?;
//!
//! println!("Title: {:?}", publication.get_title()?);
//! for link in publication.collections(NavRole::TableOfContents) {
//!     println!("{:?} -> {}", link.title, link.href);
//! }
//!
//! // Encrypted resources become readable once the DRM is resolved
//! if publication.drm_state()?.drm().is_some() {
//!     resolver.resolve(Some(Arc::new(ContentKeyLicense::new(&[0u8; 32])?)))?;
//! }
//!
//! let chapter = publication.read(&publication.reading_order[0].href)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `aes` (default): Enable `epub_streamer::drm::ContentKeyLicense`, a license
//!   deciphering AES-256-CBC resources with a raw content key.

pub mod archive;
pub mod container;
pub mod drm;
pub mod encryption;
pub mod epub;
pub mod error;
pub mod fetcher;
pub mod navigation;
pub mod package;
pub mod settings;
pub mod types;
pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use epub::{ParserOptions, Publication, parse, parse_archive};
pub use error::EpubError;
pub use utils::DecodeBytes;
