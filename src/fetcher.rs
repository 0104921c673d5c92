//! Transforming resource fetcher
//!
//! Every read goes through an ordered list of [`TransformStage`]s. The default
//! list is fixed: [`DecryptStage`], [`DeobfuscateStage`], then [`InjectStage`].
//! A stage only runs on the links it applies to, and the first failing stage
//! ends the read.

use std::{collections::HashMap, sync::Arc};

use log::{debug, warn};

use crate::{
    archive::ArchiveReader,
    drm::{DrmHolder, DrmState},
    error::EpubError,
    settings::SharedSettings,
    types::{Compression, FontObfuscation, Link, ReadingProgression, RenditionLayout},
    utils::{
        DecodeBytes, adobe_font_deobfuscation, idpf_font_deobfuscation, inflate,
        normalize_request_path,
    },
};

/// A named byte transformation applied to the resources it applies to
pub trait TransformStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the stage must run for the resource described by `link`
    fn applies_to(&self, link: &Link) -> bool;

    fn transform(&self, data: Vec<u8>, link: &Link) -> Result<Vec<u8>, EpubError>;
}

/// Reads resources of the container through the transform stages
pub struct Fetcher {
    archive: Arc<dyn ArchiveReader>,
    links: HashMap<String, Link>,
    stages: Vec<Box<dyn TransformStage>>,
}

impl Fetcher {
    /// Creates a fetcher over `archive`
    ///
    /// `links` describe the resources of the publication, a resource without
    /// link is served as stored in the container.
    pub fn new(
        archive: Arc<dyn ArchiveReader>,
        links: impl IntoIterator<Item = Link>,
        stages: Vec<Box<dyn TransformStage>>,
    ) -> Self {
        let links = links
            .into_iter()
            .map(|link| (link.path().to_string(), link))
            .collect();
        Self {
            archive,
            links,
            stages,
        }
    }

    /// Reads the resource at `href`
    ///
    /// A leading slash and the fragment identifier of `href` are ignored.
    /// A missing resource fails with [`EpubError::ResourceNotFound`].
    pub fn read(&self, href: &str) -> Result<Vec<u8>, EpubError> {
        let path = normalize_request_path(href);
        let mut data = self.archive.read(path)?;

        let Some(link) = self.links.get(path) else {
            return Ok(data);
        };

        for stage in self.stages.iter().filter(|stage| stage.applies_to(link)) {
            debug!("Applying {} to \"{}\".", stage.name(), path);
            data = stage.transform(data, link)?;
        }
        Ok(data)
    }

    /// The link describing the resource at `href`
    pub fn link(&self, href: &str) -> Option<&Link> {
        self.links.get(normalize_request_path(href))
    }

    /// Names of the configured stages, in application order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }
}

/// Deciphers resources encrypted by the DRM of the publication
///
/// Reads the current [`DrmState`] at every call. Resources are only readable
/// once the DRM is resolved; decrypted data compressed before encryption is
/// inflated again.
pub struct DecryptStage {
    drm: Arc<DrmHolder>,
}

impl DecryptStage {
    pub fn new(drm: Arc<DrmHolder>) -> Self {
        Self { drm }
    }
}

impl TransformStage for DecryptStage {
    fn name(&self) -> &'static str {
        "decrypt"
    }

    fn applies_to(&self, link: &Link) -> bool {
        link.properties.encrypted.is_some()
    }

    fn transform(&self, data: Vec<u8>, link: &Link) -> Result<Vec<u8>, EpubError> {
        let Some(record) = &link.properties.encrypted else {
            return Ok(data);
        };

        let drm = match self.drm.snapshot()? {
            DrmState::NoDrm => {
                return Err(EpubError::UnsupportedEncryptedMethod {
                    method: record.algorithm.clone(),
                });
            }
            DrmState::Unresolved(drm) | DrmState::Abandoned(drm) => {
                return Err(EpubError::ProtectedResource {
                    resource: link.href.clone(),
                    brand: drm.brand.to_string(),
                });
            }
            DrmState::Resolved(drm) => drm,
        };

        if record.scheme.as_deref() != Some(drm.scheme.as_str()) {
            return Err(EpubError::UnsupportedEncryptedMethod {
                method: record.algorithm.clone(),
            });
        }

        let license = drm
            .license
            .as_ref()
            .ok_or_else(|| EpubError::ProtectedResource {
                resource: link.href.clone(),
                brand: drm.brand.to_string(),
            })?;

        let failed = |reason: String| EpubError::DecryptionFailed {
            resource: link.href.clone(),
            reason,
        };

        let plaintext = license
            .decipher(&record.algorithm, &data)
            .map_err(|err| match err {
                EpubError::DecryptionFailed { reason, .. } => failed(reason),
                err => err,
            })?;

        let plaintext = match record.compression {
            Compression::Deflate => inflate(&plaintext).map_err(|err| failed(err.to_string()))?,
            Compression::None => plaintext,
        };

        if let Some(length) = record.original_length {
            if plaintext.len() as u64 != length {
                warn!(
                    "\"{}\" is {} bytes long once decrypted, {} bytes were declared.",
                    link.href,
                    plaintext.len(),
                    length
                );
            }
        }

        Ok(plaintext)
    }
}

/// Reverses the font obfuscation of embedded fonts
///
/// The key is derived from the unique identifier of the publication.
pub struct DeobfuscateStage {
    identifier: Option<String>,
}

impl DeobfuscateStage {
    pub fn new(identifier: Option<String>) -> Self {
        Self { identifier }
    }
}

impl TransformStage for DeobfuscateStage {
    fn name(&self) -> &'static str {
        "deobfuscate"
    }

    fn applies_to(&self, link: &Link) -> bool {
        link.properties.obfuscation.is_some()
    }

    fn transform(&self, data: Vec<u8>, link: &Link) -> Result<Vec<u8>, EpubError> {
        let Some(obfuscation) = link.properties.obfuscation else {
            return Ok(data);
        };

        let unavailable = || EpubError::ObfuscationKeyUnavailable {
            resource: link.href.clone(),
        };
        let identifier = self.identifier.as_deref().ok_or_else(unavailable)?;

        match obfuscation {
            FontObfuscation::Idpf => Ok(idpf_font_deobfuscation(&data, identifier)),
            FontObfuscation::Adobe => {
                adobe_font_deobfuscation(&data, identifier).ok_or_else(unavailable)
            }
        }
    }
}

/// Assets injected into content documents
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionConfig {
    /// Whether the inject stage runs at all
    pub enabled: bool,

    /// Prefix of the ReadiumCSS stylesheets, e.g. `/assets/`
    pub asset_prefix: String,

    /// Script URLs appended to the head of every document
    pub scripts: Vec<String>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            asset_prefix: "/assets/".to_string(),
            scripts: vec![],
        }
    }
}

/// Injects ReadiumCSS and the reader settings into reflowable markup documents
pub struct InjectStage {
    config: InjectionConfig,
    layout: RenditionLayout,
    subdirectory: &'static str,
    settings: SharedSettings,
}

impl InjectStage {
    pub fn new(
        config: InjectionConfig,
        layout: RenditionLayout,
        progression: ReadingProgression,
        language: Option<&str>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            config,
            layout,
            subdirectory: asset_subdirectory(progression, language),
            settings,
        }
    }

    fn stylesheet(&self, name: &str) -> String {
        format!(
            r#"<link rel="stylesheet" type="text/css" href="{}{}{}"/>"#,
            self.config.asset_prefix, self.subdirectory, name
        )
    }
}

impl TransformStage for InjectStage {
    fn name(&self) -> &'static str {
        "inject"
    }

    fn applies_to(&self, link: &Link) -> bool {
        self.config.enabled && self.layout != RenditionLayout::PrePaginated && link.is_markup()
    }

    fn transform(&self, data: Vec<u8>, link: &Link) -> Result<Vec<u8>, EpubError> {
        let document = match data.decode() {
            Ok(document) => document,
            Err(err) => {
                warn!("\"{}\" left unchanged, it cannot be decoded: {}", link.href, err);
                return Ok(data);
            }
        };

        let lowercase = document.to_ascii_lowercase();
        let Some(head_open) = find_tag_end(&lowercase, "<head") else {
            warn!("\"{}\" left unchanged, it has no head element.", link.href);
            return Ok(data);
        };
        // `None` for an empty `<head/>`
        let head_close = if lowercase[..head_open].ends_with("/>") {
            None
        } else {
            match lowercase[head_open..].find("</head>") {
                Some(index) => Some(head_open + index),
                None => {
                    warn!("\"{}\" left unchanged, its head element is not closed.", link.href);
                    return Ok(data);
                }
            }
        };

        let style = self.settings.read()?.to_style_attribute();

        let mut head_end = String::new();
        if !has_own_styles(&lowercase) {
            head_end.push_str(&self.stylesheet("ReadiumCSS-default.css"));
            head_end.push('\n');
        }
        head_end.push_str(&self.stylesheet("ReadiumCSS-after.css"));
        head_end.push('\n');
        for script in &self.config.scripts {
            head_end.push_str(&format!(
                r#"<script type="text/javascript" src="{}"></script>"#,
                script
            ));
            head_end.push('\n');
        }

        let head_start = format!("\n{}", self.stylesheet("ReadiumCSS-before.css"));

        let mut output = document;
        match head_close {
            Some(head_close) => {
                output.insert_str(head_close, &head_end);
                output.insert_str(head_open, &head_start);
            }
            None => output.replace_range(
                head_open - 2..head_open,
                &format!(">{}\n{}</head>", head_start, head_end),
            ),
        }
        set_html_style(&mut output, &lowercase, &style);

        Ok(output.into_bytes())
    }
}

/// Sub-directory of the ReadiumCSS flavor matching the script of the publication
fn asset_subdirectory(progression: ReadingProgression, language: Option<&str>) -> &'static str {
    let primary = language
        .and_then(|language| language.split(['-', '_']).next())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let cjk = matches!(primary.as_str(), "zh" | "ja" | "ko");
    let rtl_script = matches!(primary.as_str(), "ar" | "fa" | "he");

    match progression {
        ReadingProgression::Rtl if cjk => "cjk-vertical/",
        ReadingProgression::Rtl => "rtl/",
        ReadingProgression::Auto if rtl_script => "rtl/",
        _ if cjk => "cjk-horizontal/",
        _ => "",
    }
}

/// Position right after the `>` closing the first opening tag named like `tag`
fn find_tag_end(lowercase: &str, tag: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(index) = lowercase[offset..].find(tag) {
        let start = offset + index;
        let after = start + tag.len();
        match lowercase[after..].chars().next() {
            Some(ch) if ch == '>' || ch == '/' || ch.is_whitespace() => {
                return lowercase[after..].find('>').map(|end| after + end + 1);
            }
            _ => offset = after,
        }
    }
    None
}

fn has_own_styles(lowercase: &str) -> bool {
    if lowercase.contains("<style") {
        return true;
    }

    lowercase.match_indices("<link").any(|(start, _)| {
        let tag = &lowercase[start..];
        let tag = &tag[..tag.find('>').unwrap_or(tag.len())];
        tag.contains("stylesheet")
    })
}

/// Prepends `style` to the style attribute of the `html` element
///
/// `lowercase` is the lowercase copy of the document before any insertion,
/// everything inserted so far sits after the `html` start tag.
fn set_html_style(document: &mut String, lowercase: &str, style: &str) {
    let Some(tag_end) = find_tag_end(lowercase, "<html") else {
        return;
    };
    let tag_start = lowercase[..tag_end].rfind("<html").unwrap_or(0);
    let tag = &lowercase[tag_start..tag_end];

    match tag.find(" style=\"").or_else(|| tag.find(" style='")) {
        Some(index) => {
            let value_start = tag_start + index + " style=\"".len();
            document.insert_str(value_start, &format!("{} ", style));
        }
        None => {
            let close = if tag.ends_with("/>") { tag_end - 2 } else { tag_end - 1 };
            document.insert_str(close, &format!(" style=\"{}\"", style));
        }
    }
}
