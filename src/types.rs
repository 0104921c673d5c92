use std::fmt::Display;

use indexmap::IndexMap;
use log::warn;

/// Version of the package document
///
/// Package documents without a recognizable `version` attribute are treated
/// as the oldest supported version.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpubVersion {
    #[default]
    Version2_0,
    Version3_0,
}

/// Represents a metadata item in the EPUB publication
///
/// Metadata items contain information about the publication such as title, author,
/// identifier, language, and other descriptive information.
///
/// In EPUB 3.0, metadata items can have refinements that provide additional details about
/// the main metadata item. For example, a title metadata item might have refinements that
/// specify it is the main title of the publication.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataItem {
    /// Optional unique identifier for this metadata item
    ///
    /// Used to reference this metadata item from refinements.
    pub id: Option<String>,

    /// The metadata property name
    ///
    /// Common properties include "title", "creator", "identifier", "language",
    /// "publisher", etc. These typically correspond to Dublin Core metadata terms.
    pub property: String,

    /// The metadata value
    pub value: String,

    /// Optional language code for this metadata item
    pub lang: Option<String>,

    /// Refinements of this metadata item
    ///
    /// In EPUB 2.x, the extra attributes of a Dublin Core element (such as
    /// `opf:role` or `opf:file-as`) are parsed as refinements as well.
    pub refined: Vec<MetadataRefinement>,
}

/// Represents a refinement of a metadata item
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRefinement {
    /// The id of the refined metadata item, without the leading `#`
    pub refines: String,

    /// The refinement property name, such as "role", "file-as" or "title-type"
    pub property: String,

    /// The refinement value
    pub value: String,

    /// Optional language code for this refinement
    pub lang: Option<String>,

    /// Optional scheme identifier for this refinement
    pub scheme: Option<String>,
}

/// Represents a `<link>` element of the package metadata
///
/// These links associate the publication with external records, alternate
/// editions, or related resources.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataLinkItem {
    /// The URI of the linked resource
    pub href: String,

    /// The relationship between this publication and the linked resource
    pub rel: String,

    /// Optional language of the linked resource
    pub hreflang: Option<String>,

    /// Optional unique identifier for this link item
    pub id: Option<String>,

    /// Optional MIME type of the linked resource
    pub mime: Option<String>,

    /// Optional space-separated properties of this link
    pub properties: Option<String>,

    /// Optional id of the metadata item this link refines
    pub refines: Option<String>,
}

/// Rendition layout declared by the `rendition:layout` metadata property
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RenditionLayout {
    #[default]
    Reflowable,
    PrePaginated,
}

/// Page progression direction declared on the spine
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReadingProgression {
    #[default]
    Auto,
    Ltr,
    Rtl,
}

/// Compression applied to a resource before it was encrypted
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Deflate,
}

/// Font obfuscation algorithms
///
/// Obfuscation is a lightweight scrambling of embedded fonts, unrelated to DRM,
/// that can be reversed with a key derived from the publication identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontObfuscation {
    /// `http://www.idpf.org/2008/embedding`
    Idpf,

    /// `http://ns.adobe.com/pdf/enc#RC`
    Adobe,
}

impl FontObfuscation {
    pub const IDPF_ALGORITHM: &'static str = "http://www.idpf.org/2008/embedding";
    pub const ADOBE_ALGORITHM: &'static str = "http://ns.adobe.com/pdf/enc#RC";

    /// Returns the obfuscation algorithm identified by an encryption algorithm URI
    pub fn from_algorithm(algorithm: &str) -> Option<Self> {
        match algorithm {
            Self::IDPF_ALGORITHM => Some(Self::Idpf),
            Self::ADOBE_ALGORITHM => Some(Self::Adobe),
            _ => None,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Idpf => Self::IDPF_ALGORITHM,
            Self::Adobe => Self::ADOBE_ALGORITHM,
        }
    }
}

/// Encryption metadata of a single resource, extracted from `META-INF/encryption.xml`
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionRecord {
    /// Container-root relative path of the encrypted resource
    pub href: String,

    /// The encryption algorithm URI
    pub algorithm: String,

    /// Compression applied before encryption
    pub compression: Compression,

    /// Length of the resource before compression and encryption
    pub original_length: Option<u64>,

    /// URI of the `KeyInfo/RetrievalMethod` element, if any
    pub retrieval_method: Option<String>,

    /// Scheme URI of the DRM this record belongs to
    ///
    /// Only set when the record's key is retrieved from the detected DRM license.
    pub scheme: Option<String>,
}

/// Typed property bag of a [`Link`]
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LinkProperties {
    /// Tokens of the manifest item `properties` attribute, e.g. `nav`, `scripted`
    pub contains: Vec<String>,

    /// Tokens of the spine itemref `properties` attribute, e.g. `page-spread-left`
    pub spine: Vec<String>,

    /// Whether a reading order item is part of the linear reading sequence
    pub linear: Option<bool>,

    /// DRM encryption of the resource
    pub encrypted: Option<EncryptionRecord>,

    /// Font obfuscation of the resource
    pub obfuscation: Option<FontObfuscation>,
}

/// A reference to a resource of the publication
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Link {
    /// Container-root relative path, without leading slash
    ///
    /// Navigation links keep their fragment identifier.
    pub href: String,

    /// Media type of the resource, if known
    pub media_type: Option<String>,

    /// Display title, used by navigation links
    pub title: Option<String>,

    /// Relations of the link, such as `contents`, `cover` or `ncx`
    pub rels: Vec<String>,

    pub properties: LinkProperties,

    /// Nested links of hierarchical navigation collections
    pub children: Vec<Link>,

    /// Manifest id of the item this link was built from
    pub id: Option<String>,

    /// Manifest id of the fallback item
    pub fallback: Option<String>,
}

impl Link {
    pub fn has_rel(&self, rel: &str) -> bool {
        self.rels.iter().any(|item| item == rel)
    }

    /// The href without its fragment identifier
    pub fn path(&self) -> &str {
        self.href.split('#').next().unwrap_or(&self.href)
    }

    /// Whether the resource is a markup document that can carry injected content
    pub fn is_markup(&self) -> bool {
        matches!(
            self.media_type.as_deref(),
            Some("application/xhtml+xml") | Some("text/html")
        )
    }
}

/// Roles of the navigation collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavRole {
    TableOfContents,
    PageList,
    Landmarks,
    ListOfAudioFiles,
    ListOfIllustrations,
    ListOfTables,
    ListOfVideos,
}

impl NavRole {
    pub const ALL: [NavRole; 7] = [
        NavRole::TableOfContents,
        NavRole::PageList,
        NavRole::Landmarks,
        NavRole::ListOfAudioFiles,
        NavRole::ListOfIllustrations,
        NavRole::ListOfTables,
        NavRole::ListOfVideos,
    ];

    /// The `epub:type` value identifying this role in a navigation document
    pub fn epub_type(&self) -> &'static str {
        match self {
            NavRole::TableOfContents => "toc",
            NavRole::PageList => "page-list",
            NavRole::Landmarks => "landmarks",
            NavRole::ListOfAudioFiles => "loa",
            NavRole::ListOfIllustrations => "loi",
            NavRole::ListOfTables => "lot",
            NavRole::ListOfVideos => "lov",
        }
    }

    pub fn from_epub_type(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.epub_type() == value)
    }
}

impl Display for NavRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.epub_type())
    }
}

/// Navigation collections of a publication
///
/// A role is only present when its link sequence is non-empty.
/// Roles keep the order in which they were first inserted.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Collections {
    roles: IndexMap<NavRole, Vec<Link>>,
}

impl Collections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the links of a role, ignoring empty sequences
    pub fn insert(&mut self, role: NavRole, links: Vec<Link>) {
        if links.is_empty() {
            return;
        }
        self.roles.insert(role, links);
    }

    pub fn get(&self, role: NavRole) -> &[Link] {
        self.roles.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, role: NavRole) -> bool {
        self.roles.contains_key(&role)
    }

    /// Adds every role of `fallback` that is absent from `self`
    ///
    /// Roles already present keep their current links.
    pub fn merge_missing(&mut self, fallback: Collections) {
        for (role, links) in fallback.roles {
            self.roles.entry(role).or_insert(links);
        }
    }

    pub fn roles(&self) -> impl Iterator<Item = NavRole> + '_ {
        self.roles.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }
}

/// The part of the package a diagnostic was raised by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSource {
    Encryption,
    Package,
    Navigation,
    Ncx,
}

/// A non-fatal problem found while parsing the package
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub source: DiagnosticSource,
    pub message: String,
}

impl Diagnostic {
    pub fn new(source: DiagnosticSource, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.source, self.message)
    }
}

/// Result of a best-effort parse: the value that could be recovered and the
/// problems that were skipped on the way
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub value: T,
    pub diagnostics: Vec<Diagnostic>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            diagnostics: vec![],
        }
    }

    pub fn with_diagnostics(value: T, diagnostics: Vec<Diagnostic>) -> Self {
        Self { value, diagnostics }
    }

    /// Records a diagnostic and forwards it to the `log` facade
    pub fn report(&mut self, source: DiagnosticSource, message: impl Into<String>) {
        let diagnostic = Diagnostic::new(source, message);
        warn!("{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Splits the outcome, appending its diagnostics to `sink`
    pub fn drain_into(self, sink: &mut Vec<Diagnostic>) -> T {
        sink.extend(self.diagnostics);
        self.value
    }
}

impl<T: Default> Default for Outcome<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
