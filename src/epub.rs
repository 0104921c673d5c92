use std::{
    path::Path,
    sync::{Arc, RwLock},
};

use log::debug;

use crate::{
    archive::{ArchiveReader, ZipArchiveReader},
    container::locate_package,
    drm::{DrmDetector, DrmHolder, DrmResolver, DrmState, default_detectors, detect_drm},
    encryption::parse_encryption,
    error::EpubError,
    fetcher::{DecryptStage, DeobfuscateStage, Fetcher, InjectStage, InjectionConfig, TransformStage},
    navigation::parse_collections,
    package::parse_package,
    settings::{SharedSettings, UserSettings},
    types::{
        Collections, Diagnostic, EpubVersion, Link, MetadataItem, MetadataLinkItem, NavRole,
        ReadingProgression, RenditionLayout,
    },
};

/// Options of [`parse_archive`]
///
/// Created with [`ParserOptions::builder`] or [`ParserOptions::default`].
#[derive(Clone)]
pub struct ParserOptions {
    /// DRM detectors, probed in order
    ///
    /// Defaults to [`default_detectors`].
    pub detectors: Vec<Arc<dyn DrmDetector>>,

    /// Assets injected into reflowable content documents
    pub injection: InjectionConfig,

    /// Initial reader settings, see [`Publication::settings`]
    pub settings: UserSettings,
}

impl ParserOptions {
    pub fn builder() -> ParserOptionsBuilder {
        ParserOptionsBuilder(Self::default())
    }
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            detectors: default_detectors(),
            injection: InjectionConfig::default(),
            settings: UserSettings::default(),
        }
    }
}

impl From<ParserOptionsBuilder> for ParserOptions {
    fn from(value: ParserOptionsBuilder) -> Self {
        value.0
    }
}

/// Builder of [`ParserOptions`]
///
/// ```rust, ignore
/// # use epub_streamer::epub::ParserOptions;
/// let options = ParserOptions::builder()
///     .asset_prefix("/readium-css/")
///     .script("/js/reader.js")
///     .build();
/// ```
pub struct ParserOptionsBuilder(ParserOptions);

impl ParserOptionsBuilder {
    pub fn build(self) -> ParserOptions {
        self.0
    }

    /// Registers a DRM detector after the already registered ones
    pub fn detector(mut self, detector: Arc<dyn DrmDetector>) -> Self {
        self.0.detectors.push(detector);
        self
    }

    /// Replaces the registered DRM detectors
    pub fn detectors(mut self, detectors: Vec<Arc<dyn DrmDetector>>) -> Self {
        self.0.detectors = detectors;
        self
    }

    /// See [`InjectionConfig::enabled`]
    pub fn inject(mut self, enabled: bool) -> Self {
        self.0.injection.enabled = enabled;
        self
    }

    /// See [`InjectionConfig::asset_prefix`]
    pub fn asset_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.0.injection.asset_prefix = prefix.into();
        self
    }

    /// Appends a script to [`InjectionConfig::scripts`]
    pub fn script(mut self, url: impl Into<String>) -> Self {
        self.0.injection.scripts.push(url.into());
        self
    }

    pub fn settings(mut self, settings: UserSettings) -> Self {
        self.0.settings = settings;
        self
    }
}

/// A parsed EPUB publication
///
/// The publication is immutable once parsed, with two exceptions shared with its
/// fetcher: the DRM state, settled once through the [`DrmResolver`] returned by
/// [`parse_archive`], and the reader settings. It can be shared between threads,
/// resources are read concurrently through [`Publication::read`].
pub struct Publication {
    /// The path to the package document, relative to the container root
    pub package_path: String,

    /// The epub version
    pub version: EpubVersion,

    /// The unique identifier of the publication
    ///
    /// This is the value of the `dc:identifier` designated by the `unique-identifier`
    /// attribute of the package. Font obfuscation keys are derived from it.
    pub unique_identifier: Option<String>,

    /// Epub metadata extracted from the package document
    pub metadata: Vec<MetadataItem>,

    /// Data in metadata that points to external files
    pub metadata_link: Vec<MetadataLinkItem>,

    /// Spine items, in spine order
    pub reading_order: Vec<Link>,

    /// Manifest items that are not part of the reading order
    pub resources: Vec<Link>,

    pub layout: RenditionLayout,

    pub reading_progression: ReadingProgression,

    collections: Collections,
    diagnostics: Vec<Diagnostic>,
    fetcher: Fetcher,
    drm: Arc<DrmHolder>,
    settings: SharedSettings,
}

/// Parses the EPUB file at `path` with the default options
pub fn parse<P: AsRef<Path>>(path: P) -> Result<(Publication, DrmResolver), EpubError> {
    parse_with(path, ParserOptions::default())
}

/// Parses the EPUB file at `path`
pub fn parse_with<P: AsRef<Path>>(
    path: P,
    options: impl Into<ParserOptions>,
) -> Result<(Publication, DrmResolver), EpubError> {
    let archive = ZipArchiveReader::open(path)?;
    parse_archive(Arc::new(archive), options)
}

/// Parses a publication from an opened container
///
/// Parsing process:
/// 1. Locate the package document through `META-INF/container.xml`
/// 2. Probe the registered DRM detectors
/// 3. Build the encryption map from `META-INF/encryption.xml`
/// 4. Parse the package document, attaching the encryption records to its links
/// 5. Build the navigation collections
/// 6. Set up the fetcher with the decrypt, de-obfuscate and inject stages
///
/// A failure of step 1 or 4 is fatal. Steps 3 and 5 degrade to empty results,
/// their problems are available through [`Publication::diagnostics`].
///
/// ## Return
/// - `Ok((Publication, DrmResolver))`: The publication and the one-shot resolver
///   of its DRM. Encrypted resources are unreadable until the DRM is resolved.
/// - `Err(EpubError)`: The container has no usable package document
pub fn parse_archive(
    archive: Arc<dyn ArchiveReader>,
    options: impl Into<ParserOptions>,
) -> Result<(Publication, DrmResolver), EpubError> {
    let options = options.into();
    let mut diagnostics = Vec::new();

    let package_path = locate_package(archive.as_ref())?;
    let drm = detect_drm(archive.as_ref(), &options.detectors);
    let encryption = parse_encryption(archive.as_ref(), drm.as_ref()).drain_into(&mut diagnostics);
    let package =
        parse_package(archive.as_ref(), &package_path, &encryption)?.drain_into(&mut diagnostics);
    let collections = parse_collections(archive.as_ref(), &package).drain_into(&mut diagnostics);

    let drm = Arc::new(DrmHolder::new(drm));
    let settings = Arc::new(RwLock::new(options.settings));

    let language = package
        .metadata
        .iter()
        .find(|item| item.property == "language")
        .map(|item| item.value.clone());
    let stages: Vec<Box<dyn TransformStage>> = vec![
        Box::new(DecryptStage::new(drm.clone())),
        Box::new(DeobfuscateStage::new(package.unique_identifier.clone())),
        Box::new(InjectStage::new(
            options.injection,
            package.layout,
            package.reading_progression,
            language.as_deref(),
            settings.clone(),
        )),
    ];
    let fetcher = Fetcher::new(archive, package.links().cloned(), stages);

    debug!(
        "Parsed \"{}\": {} reading order items, {} resources, {} diagnostics.",
        package_path,
        package.reading_order.len(),
        package.resources.len(),
        diagnostics.len()
    );

    let publication = Publication {
        package_path,
        version: package.version,
        unique_identifier: package.unique_identifier,
        metadata: package.metadata,
        metadata_link: package.metadata_link,
        reading_order: package.reading_order,
        resources: package.resources,
        layout: package.layout,
        reading_progression: package.reading_progression,
        collections,
        diagnostics,
        fetcher,
        drm: drm.clone(),
        settings,
    };

    Ok((publication, DrmResolver::new(drm)))
}

impl Publication {
    /// Reads a resource through the transform stages
    ///
    /// `href` is relative to the container root, a leading slash and a fragment
    /// identifier are ignored. Failures are local to the requested resource.
    ///
    /// ## Return
    /// - `Ok(Vec<u8>)`: The decrypted, de-obfuscated and injected resource
    /// - `Err(EpubError::ResourceNotFound)`: The container has no such entry
    /// - `Err(EpubError::ProtectedResource)`: The resource is encrypted and the DRM
    ///   is not resolved
    pub fn read(&self, href: &str) -> Result<Vec<u8>, EpubError> {
        self.fetcher.read(href)
    }

    /// The ordered links of a navigation collection, empty when the role is absent
    pub fn collections(&self, role: NavRole) -> &[Link] {
        self.collections.get(role)
    }

    /// Every navigation collection of the publication
    pub fn navigation(&self) -> &Collections {
        &self.collections
    }

    /// Iterates over the links of the reading order and of the resources
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.reading_order.iter().chain(self.resources.iter())
    }

    /// The link describing the resource at `href`
    pub fn link(&self, href: &str) -> Option<&Link> {
        self.fetcher.link(href)
    }

    /// The link of the manifest item `id`
    pub fn link_by_id(&self, id: &str) -> Option<&Link> {
        self.links().find(|link| link.id.as_deref() == Some(id))
    }

    /// The cover image declared in the manifest
    pub fn cover(&self) -> Option<&Link> {
        self.links().find(|link| link.has_rel("cover"))
    }

    /// Problems met while parsing, in the order they were met
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// A snapshot of the DRM state
    pub fn drm_state(&self) -> Result<DrmState, EpubError> {
        self.drm.snapshot()
    }

    /// The reader settings used by the inject stage
    ///
    /// Changes are visible to the next read.
    pub fn settings(&self) -> SharedSettings {
        self.settings.clone()
    }

    /// Retrieves a list of metadata items
    ///
    /// # Parameters
    /// - `key`: The name of the metadata property to retrieve
    ///
    /// # Return
    /// - `Some(Vec<MetadataItem>)`: All matching metadata items
    /// - `None`: If no matching metadata items are found
    pub fn get_metadata(&self, key: &str) -> Option<Vec<MetadataItem>> {
        let metadatas = self
            .metadata
            .iter()
            .filter(|item| item.property == key)
            .cloned()
            .collect::<Vec<MetadataItem>>();

        (!metadatas.is_empty()).then_some(metadatas)
    }

    /// Retrieves a list of values for specific metadata items
    pub fn get_metadata_value(&self, key: &str) -> Option<Vec<String>> {
        let values = self
            .metadata
            .iter()
            .filter(|item| item.property == key)
            .map(|item| item.value.clone())
            .collect::<Vec<String>>();

        (!values.is_empty()).then_some(values)
    }

    /// Retrieves the titles of the publication, in metadata order
    ///
    /// # Return
    /// - `Ok(Vec<String>)`: All titles
    /// - `Err(EpubError)`: If and only if the package document has no `<dc:title>`
    pub fn get_title(&self) -> Result<Vec<String>, EpubError> {
        self.get_metadata_value("title")
            .ok_or_else(|| EpubError::NonCanonicalFile {
                tag: "title".to_string(),
            })
    }

    /// Retrieves the languages of the publication
    pub fn get_language(&self) -> Result<Vec<String>, EpubError> {
        self.get_metadata_value("language")
            .ok_or_else(|| EpubError::NonCanonicalFile {
                tag: "language".to_string(),
            })
    }

    /// Retrieves the identifiers of the publication
    ///
    /// # Notes
    /// - The identifier designated by the package, used as the unique identifier,
    ///   is one of them.
    pub fn get_identifier(&self) -> Result<Vec<String>, EpubError> {
        self.get_metadata_value("identifier")
            .ok_or_else(|| EpubError::NonCanonicalFile {
                tag: "identifier".to_string(),
            })
    }

    /// Reads the manifest item `id`, following its fallback chain
    ///
    /// When the media type of the item is not in `supported_formats`, the items of
    /// its fallback chain are tried in order.
    ///
    /// # Return
    /// - `Ok((Vec<u8>, String))`: The resource data and its media type
    /// - `Err(EpubError::ResourceIdNotExist)`: An item of the chain does not exist
    /// - `Err(EpubError::NoSupportedFileFormat)`: No item of the chain is supported
    pub fn read_with_fallback(
        &self,
        id: &str,
        supported_formats: &[&str],
    ) -> Result<(Vec<u8>, String), EpubError> {
        let mut link = self
            .link_by_id(id)
            .ok_or_else(|| EpubError::ResourceIdNotExist { id: id.to_string() })?;

        let mut fallback_chain = vec![id];
        loop {
            if let Some(media_type) = &link.media_type {
                if supported_formats.contains(&media_type.as_str()) {
                    return Ok((self.read(&link.href)?, media_type.clone()));
                }
            }

            match link.fallback.as_deref() {
                // The loop ends when no fallback resource exists
                None => break,

                // or when the chain loops back
                Some(next) if fallback_chain.contains(&next) => break,

                Some(next) => {
                    fallback_chain.push(next);
                    link = self
                        .link_by_id(next)
                        .ok_or_else(|| EpubError::ResourceIdNotExist { id: next.to_string() })?;
                }
            }
        }

        Err(EpubError::NoSupportedFileFormat)
    }
}
