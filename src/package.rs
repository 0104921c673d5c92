//! Package document parsing
//!
//! Turns the OPF package document into the publication model: metadata, the
//! reading order built from the spine and the remaining resources of the
//! manifest. Hrefs are normalized to container-root relative paths and the
//! encryption records of the container are attached to the links they describe.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::{
    archive::ArchiveReader,
    encryption::EncryptionMap,
    error::EpubError,
    types::{
        DiagnosticSource, EpubVersion, FontObfuscation, Link, LinkProperties, MetadataItem,
        MetadataLinkItem, MetadataRefinement, Outcome, ReadingProgression, RenditionLayout,
    },
    utils::{NormalizeWhitespace, XmlElement, XmlReader, resolve_href},
};

const DC_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";
const OPF_NAMESPACE: &str = "http://www.idpf.org/2007/opf";

/// Media type of the legacy NCX navigation document
pub const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";

/// The parsed package document
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDocument {
    /// Container-root relative path of the package document
    pub path: String,

    pub version: EpubVersion,

    /// Value of the `dc:identifier` designated by `package@unique-identifier`
    ///
    /// Falls back to the first `dc:identifier` when the designated one is missing.
    pub unique_identifier: Option<String>,

    pub metadata: Vec<MetadataItem>,

    pub metadata_link: Vec<MetadataLinkItem>,

    /// Spine items, in spine order
    pub reading_order: Vec<Link>,

    /// Manifest items that are not part of the spine, in manifest order
    pub resources: Vec<Link>,

    pub layout: RenditionLayout,

    pub reading_progression: ReadingProgression,
}

impl PackageDocument {
    /// Iterates over every link of the reading order and of the resources
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.reading_order.iter().chain(self.resources.iter())
    }
}

/// Parses the package document at `path`
///
/// Structural problems are fatal: a missing document, malformed XML or a package
/// without `manifest` or `spine`. Everything else (unknown version, items without
/// href, spine references to unknown items, links escaping the container, broken
/// fallback chains, encryption records for unknown resources) is skipped and
/// reported as a diagnostic.
///
/// ## Parameters
/// - `archive`: The container
/// - `path`: Container-root relative path of the package document
/// - `encryption`: Encryption records of the container
pub fn parse_package(
    archive: &dyn ArchiveReader,
    path: &str,
    encryption: &EncryptionMap,
) -> Result<Outcome<PackageDocument>, EpubError> {
    let data = archive.read(path).map_err(|err| match err {
        EpubError::ResourceNotFound { .. } => EpubError::MissingFile {
            path: path.to_string(),
        },
        err => err,
    })?;
    let package = XmlReader::parse_bytes(&data)?;

    let manifest_element = package
        .find_children_by_name("manifest")
        .next()
        .ok_or_else(|| EpubError::NonCanonicalFile {
            tag: "manifest".to_string(),
        })?;
    let spine_element = package
        .find_children_by_name("spine")
        .next()
        .ok_or_else(|| EpubError::NonCanonicalFile {
            tag: "spine".to_string(),
        })?;

    let mut parser = PackageParser {
        path,
        outcome: Outcome::new(()),
    };

    let version = parser.determine_epub_version(&package);

    let (metadata, metadata_link) = match package.find_children_by_name("metadata").next() {
        Some(element) => parser.parse_metadata(element),
        None => {
            parser.report("the package has no metadata element");
            (vec![], vec![])
        }
    };

    let mut manifest = parser.parse_manifest(manifest_element);
    parser.validate_fallback_chains(&manifest);
    parser.mark_ncx(&mut manifest, spine_element);
    parser.attach_encryption(&mut manifest, encryption);

    let reading_order = parser.parse_spine(spine_element, &manifest);
    let spine_ids = reading_order
        .iter()
        .filter_map(|link| link.id.as_deref())
        .collect::<HashSet<_>>();
    let resources = manifest
        .values()
        .filter(|link| link.id.as_deref().is_none_or(|id| !spine_ids.contains(id)))
        .cloned()
        .collect::<Vec<_>>();

    let unique_identifier = parser.unique_identifier(&package, &metadata);

    let layout = match metadata
        .iter()
        .find(|item| item.property == "rendition:layout")
        .map(|item| item.value.as_str())
    {
        Some("pre-paginated") => RenditionLayout::PrePaginated,
        _ => RenditionLayout::Reflowable,
    };

    let reading_progression = match spine_element.get_attr("page-progression-direction").as_deref() {
        Some("ltr") => ReadingProgression::Ltr,
        Some("rtl") => ReadingProgression::Rtl,
        _ => ReadingProgression::Auto,
    };

    let document = PackageDocument {
        path: path.to_string(),
        version,
        unique_identifier,
        metadata,
        metadata_link,
        reading_order,
        resources,
        layout,
        reading_progression,
    };

    Ok(Outcome::with_diagnostics(document, parser.outcome.diagnostics))
}

struct PackageParser<'a> {
    path: &'a str,
    outcome: Outcome<()>,
}

impl PackageParser<'_> {
    fn report(&mut self, message: impl Into<String>) {
        self.outcome.report(DiagnosticSource::Package, message);
    }

    /// Reads the version attribute of the package
    ///
    /// Versions other than 2.x and 3.x, or an absent attribute, fall back to
    /// the oldest supported version.
    fn determine_epub_version(&mut self, package: &XmlElement) -> EpubVersion {
        match package.get_attr("version").as_deref().map(str::trim) {
            Some(version) if version.starts_with("3.") || version == "3" => EpubVersion::Version3_0,
            Some(version) if version.starts_with("2.") || version == "2" => EpubVersion::Version2_0,
            Some(version) => {
                self.report(format!(
                    "unknown package version \"{}\", treated as 2.0",
                    version
                ));
                EpubVersion::Version2_0
            }
            None => EpubVersion::Version2_0,
        }
    }

    /// Parse the EPUB metadata section
    ///
    /// Handles Dublin Core elements, EPUB 3 `meta` elements (with their `refines`
    /// refinements), EPUB 2 `meta name/content` pairs and `link` elements.
    fn parse_metadata(
        &mut self,
        metadata_element: &XmlElement,
    ) -> (Vec<MetadataItem>, Vec<MetadataLinkItem>) {
        let mut metadata = Vec::new();
        let mut metadata_link = Vec::new();
        let mut refinements = HashMap::<String, Vec<MetadataRefinement>>::new();

        for element in metadata_element.children() {
            let namespace = element.namespace.as_deref();
            let prefix = element.prefix.as_deref();

            if namespace == Some(DC_NAMESPACE) || prefix == Some("dc") {
                metadata.push(Self::parse_dc_metadata(element));
                continue;
            }

            if namespace == Some(OPF_NAMESPACE) || prefix.is_none() || prefix == Some("opf") {
                match element.name.as_str() {
                    "meta" => self.parse_meta_element(element, &mut metadata, &mut refinements),
                    "link" => self.parse_link_element(element, &mut metadata_link),
                    _ => {}
                }
            }
        }

        for item in metadata.iter_mut() {
            if let Some(id) = &item.id {
                if let Some(refinements) = refinements.remove(id) {
                    item.refined.extend(refinements);
                }
            }
        }

        (metadata, metadata_link)
    }

    /// Parse metadata elements under the Dublin Core namespace
    ///
    /// EPUB 2 expresses refinements as extra attributes of the element
    /// (`opf:role`, `opf:file-as`), they are kept as refinements of the item.
    #[inline]
    fn parse_dc_metadata(element: &XmlElement) -> MetadataItem {
        let id = element.get_attr("id");
        let lang = element.get_attr_local("lang");
        let value = element.text().normalize_whitespace();

        let mut refined = element
            .attributes
            .iter()
            .filter(|(name, _)| !matches!(name.as_str(), "id" | "xml:lang" | "lang"))
            .map(|(name, value)| MetadataRefinement {
                refines: id.clone().unwrap_or_default(),
                property: name.rsplit(':').next().unwrap_or(name).to_string(),
                value: value.normalize_whitespace(),
                lang: None,
                scheme: None,
            })
            .collect::<Vec<_>>();
        refined.sort_by(|a, b| a.property.cmp(&b.property));

        MetadataItem {
            id,
            property: element.name.clone(),
            value,
            lang,
            refined,
        }
    }

    #[inline]
    fn parse_meta_element(
        &mut self,
        element: &XmlElement,
        metadata: &mut Vec<MetadataItem>,
        refinements: &mut HashMap<String, Vec<MetadataRefinement>>,
    ) {
        if let Some(property) = element.get_attr("property") {
            let value = element.text().normalize_whitespace();
            let lang = element.get_attr_local("lang");

            if let Some(refines) = element.get_attr("refines") {
                let id = refines.strip_prefix('#').unwrap_or(&refines).to_string();
                let scheme = element.get_attr("scheme");
                refinements.entry(id.clone()).or_default().push(MetadataRefinement {
                    refines: id,
                    property,
                    value,
                    lang,
                    scheme,
                });
            } else {
                metadata.push(MetadataItem {
                    id: element.get_attr("id"),
                    property,
                    value,
                    lang,
                    refined: vec![],
                });
            }
            return;
        }

        match (element.get_attr("name"), element.get_attr("content")) {
            (Some(property), Some(content)) => metadata.push(MetadataItem {
                id: None,
                property,
                value: content.normalize_whitespace(),
                lang: None,
                refined: vec![],
            }),
            _ => self.report("meta element without property nor name/content skipped"),
        }
    }

    #[inline]
    fn parse_link_element(&mut self, element: &XmlElement, metadata_link: &mut Vec<MetadataLinkItem>) {
        let (Some(href), Some(rel)) = (element.get_attr("href"), element.get_attr("rel")) else {
            self.report("metadata link without href or rel skipped");
            return;
        };

        metadata_link.push(MetadataLinkItem {
            href,
            rel,
            hreflang: element.get_attr("hreflang"),
            id: element.get_attr("id"),
            mime: element.get_attr("media-type"),
            properties: element.get_attr("properties"),
            refines: element
                .get_attr("refines")
                .map(|refines| refines.trim_start_matches('#').to_string()),
        });
    }

    /// Parse the EPUB manifest section
    ///
    /// Items are keyed by id and keep the manifest order. Items without id or
    /// href, duplicated ids and hrefs escaping the container are skipped. An
    /// item sharing its href with a previous one is kept, lookups by href
    /// resolve to the first.
    fn parse_manifest(&mut self, manifest_element: &XmlElement) -> IndexMap<String, Link> {
        let mut manifest = IndexMap::with_capacity(manifest_element.children.len());
        let mut hrefs = HashSet::new();

        for element in manifest_element.find_children_by_name("item") {
            let (Some(id), Some(href)) = (element.get_attr("id"), element.get_attr("href")) else {
                self.report("manifest item without id or href skipped");
                continue;
            };

            if manifest.contains_key(&id) {
                self.report(format!("duplicate manifest id \"{}\" skipped", id));
                continue;
            }

            let href = match resolve_href(self.path, &href) {
                Ok(href) => href,
                Err(err) => {
                    self.report(format!("manifest item \"{}\" skipped: {}", id, err));
                    continue;
                }
            };

            if !hrefs.insert(href.clone()) {
                self.report(format!("manifest item \"{}\" duplicates the href \"{}\"", id, href));
            }

            let media_type = element.get_attr("media-type");
            if media_type.is_none() {
                self.report(format!("manifest item \"{}\" has no media type", id));
            }

            let contains = element
                .get_attr("properties")
                .map(|properties| {
                    properties
                        .split_whitespace()
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            let mut rels = vec![];
            if contains.iter().any(|property| property == "nav") {
                rels.push("contents".to_string());
            }
            if contains.iter().any(|property| property == "cover-image") {
                rels.push("cover".to_string());
            }

            manifest.insert(
                id.clone(),
                Link {
                    href,
                    media_type,
                    rels,
                    properties: LinkProperties {
                        contains,
                        ..Default::default()
                    },
                    id: Some(id),
                    fallback: element.get_attr("fallback"),
                    ..Default::default()
                },
            );
        }

        manifest
    }

    /// Marks the legacy NCX document with the `ncx` relation
    ///
    /// The `toc` attribute of the spine designates it; without that attribute
    /// every item with the NCX media type is marked.
    fn mark_ncx(&mut self, manifest: &mut IndexMap<String, Link>, spine_element: &XmlElement) {
        if let Some(toc) = spine_element.get_attr("toc") {
            match manifest.get_mut(&toc) {
                Some(link) => link.rels.push("ncx".to_string()),
                None => self.report(format!("spine toc \"{}\" is not a manifest item", toc)),
            }
            return;
        }

        for link in manifest.values_mut() {
            if link.media_type.as_deref() == Some(NCX_MEDIA_TYPE) {
                link.rels.push("ncx".to_string());
            }
        }
    }

    /// Attaches the encryption records to the links they describe
    ///
    /// Font obfuscation records set the `obfuscation` property, any other
    /// record sets the `encrypted` property. Records for hrefs that are not
    /// manifest items are dropped.
    fn attach_encryption(&mut self, manifest: &mut IndexMap<String, Link>, encryption: &EncryptionMap) {
        let mut attached = HashSet::new();

        for link in manifest.values_mut() {
            let Some(records) = encryption.get(&link.href) else {
                continue;
            };
            attached.insert(link.href.clone());

            for record in records {
                match FontObfuscation::from_algorithm(&record.algorithm) {
                    Some(obfuscation) => link.properties.obfuscation = Some(obfuscation),
                    None => link.properties.encrypted = Some(record.clone()),
                }
            }
        }

        for href in encryption.keys().filter(|href| !attached.contains(*href)) {
            self.outcome.report(
                DiagnosticSource::Encryption,
                format!("encryption record for unknown resource \"{}\" dropped", href),
            );
        }
    }

    /// Parse the EPUB spine section
    ///
    /// Builds the reading order from the `itemref` elements. References to
    /// unknown items and repeated references are skipped.
    fn parse_spine(&mut self, spine_element: &XmlElement, manifest: &IndexMap<String, Link>) -> Vec<Link> {
        let mut reading_order = Vec::new();
        let mut seen = HashSet::new();

        for element in spine_element.find_children_by_name("itemref") {
            let Some(idref) = element.get_attr("idref") else {
                self.report("itemref without idref skipped");
                continue;
            };

            let Some(item) = manifest.get(&idref) else {
                self.report(format!("itemref \"{}\" is not a manifest item", idref));
                continue;
            };

            if !seen.insert(idref.clone()) {
                self.report(format!("itemref \"{}\" is referenced twice", idref));
                continue;
            }

            let mut link = item.clone();
            link.properties.linear = Some(element.get_attr("linear").as_deref() != Some("no"));
            link.properties.spine = element
                .get_attr("properties")
                .map(|properties| {
                    properties
                        .split_whitespace()
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            reading_order.push(link);
        }

        reading_order
    }

    /// Verify the fallback chain of all manifest items
    ///
    /// Circular references and fallbacks to unknown items are reported, the
    /// items themselves are kept.
    fn validate_fallback_chains(&mut self, manifest: &IndexMap<String, Link>) {
        for (id, link) in manifest {
            if link.fallback.is_none() {
                continue;
            }

            let mut fallback_chain = Vec::new();
            if let Err(msg) = Self::validate_fallback_chain(manifest, id, &mut fallback_chain) {
                self.report(format!("invalid fallback chain for item {}: {}", id, msg));
            }
        }
    }

    fn validate_fallback_chain(
        manifest: &IndexMap<String, Link>,
        manifest_id: &str,
        fallback_chain: &mut Vec<String>,
    ) -> Result<(), String> {
        if fallback_chain.iter().any(|id| id == manifest_id) {
            fallback_chain.push(manifest_id.to_string());

            return Err(format!(
                "circular reference detected in fallback chain {}",
                fallback_chain.join("->")
            ));
        }

        let Some(fallback_id) = manifest.get(manifest_id).and_then(|link| link.fallback.as_ref())
        else {
            // The end of the fallback chain
            return Ok(());
        };

        if !manifest.contains_key(fallback_id) {
            return Err(format!(
                "fallback resource {} does not exist in manifest",
                fallback_id
            ));
        }

        fallback_chain.push(manifest_id.to_string());
        Self::validate_fallback_chain(manifest, fallback_id, fallback_chain)
    }

    fn unique_identifier(&mut self, package: &XmlElement, metadata: &[MetadataItem]) -> Option<String> {
        let mut identifiers = metadata.iter().filter(|item| item.property == "identifier");

        let designated = package.get_attr("unique-identifier").and_then(|uid| {
            identifiers
                .clone()
                .find(|item| item.id.as_deref() == Some(uid.as_str()))
        });

        match designated.or_else(|| identifiers.next()) {
            Some(item) => Some(item.value.clone()),
            None => {
                self.report("the package has no dc:identifier");
                None
            }
        }
    }
}
