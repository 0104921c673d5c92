use indexmap::IndexMap;

use crate::{
    archive::ArchiveReader,
    drm::Drm,
    types::{Compression, DiagnosticSource, EncryptionRecord, FontObfuscation, Outcome},
    utils::{XmlElement, XmlReader, resolve_href},
};

/// Fixed path of the encryption descriptor
pub const ENCRYPTION_PATH: &str = "META-INF/encryption.xml";

/// Encryption records of the container, keyed by resource href
///
/// A resource may carry several records, e.g. an obfuscated font that is also
/// encrypted by a DRM. Records keep their declaration order.
pub type EncryptionMap = IndexMap<String, Vec<EncryptionRecord>>;

/// Parse the EPUB encryption file (META-INF/encryption.xml)
///
/// The descriptor is optional: its absence yields an empty map. Parsing is
/// best-effort, an `EncryptedData` entry missing its algorithm or cipher reference
/// is skipped, and a descriptor that cannot be parsed at all yields an empty map.
/// Every skipped part is reported as a diagnostic.
///
/// A record is associated with the detected DRM when its `KeyInfo/RetrievalMethod`
/// matches the key retrieval URI of the DRM. When the DRM declares no retrieval
/// URI, every record that is not a font obfuscation belongs to it.
pub fn parse_encryption(archive: &dyn ArchiveReader, drm: Option<&Drm>) -> Outcome<EncryptionMap> {
    let mut outcome = Outcome::new(EncryptionMap::new());
    if !archive.contains(ENCRYPTION_PATH) {
        return outcome;
    }

    let root = match archive
        .read(ENCRYPTION_PATH)
        .and_then(|data| XmlReader::parse_bytes(&data))
    {
        Ok(root) => root,
        Err(err) => {
            outcome.report(
                DiagnosticSource::Encryption,
                format!("\"{}\" could not be parsed: {}", ENCRYPTION_PATH, err),
            );
            return outcome;
        }
    };

    for (index, data) in root.find_elements_by_name("EncryptedData").enumerate() {
        match parse_encrypted_data(data, drm) {
            Ok(record) => outcome
                .value
                .entry(record.href.clone())
                .or_default()
                .push(record),
            Err(reason) => outcome.report(
                DiagnosticSource::Encryption,
                format!("EncryptedData #{} skipped: {}", index + 1, reason),
            ),
        }
    }

    outcome
}

fn parse_encrypted_data(data: &XmlElement, drm: Option<&Drm>) -> Result<EncryptionRecord, String> {
    let algorithm = data
        .find_children_by_name("EncryptionMethod")
        .next()
        .and_then(|method| method.get_attr("Algorithm"))
        .ok_or("missing EncryptionMethod@Algorithm")?;

    let uri = data
        .find_children_by_name("CipherData")
        .flat_map(|cipher| cipher.find_children_by_name("CipherReference"))
        .next()
        .and_then(|reference| reference.get_attr("URI"))
        .ok_or("missing CipherData/CipherReference@URI")?;

    // Cipher references are relative to the root of the container
    let href = resolve_href("", &uri).map_err(|err| err.to_string())?;

    let retrieval_method = data
        .find_children_by_name("KeyInfo")
        .flat_map(|info| info.find_children_by_name("RetrievalMethod"))
        .next()
        .and_then(|method| method.get_attr("URI"));

    let (compression, original_length) = match data.find_elements_by_name("Compression").next() {
        Some(element) => {
            let compression = match element.get_attr("Method").as_deref().map(str::trim) {
                Some("8") => Compression::Deflate,
                Some("0") | None => Compression::None,
                Some(method) => return Err(format!("unknown compression method \"{}\"", method)),
            };
            let original_length = element
                .get_attr("OriginalLength")
                .and_then(|length| length.trim().parse::<u64>().ok());
            (compression, original_length)
        }
        None => (Compression::None, None),
    };

    let scheme = drm.and_then(|drm| {
        let belongs = match &drm.key_retrieval {
            Some(uri) => retrieval_method.as_ref() == Some(uri),
            None => FontObfuscation::from_algorithm(&algorithm).is_none(),
        };
        belongs.then(|| drm.scheme.clone())
    });

    Ok(EncryptionRecord {
        href,
        algorithm,
        compression,
        original_length,
        retrieval_method,
        scheme,
    })
}

#[cfg(test)]
mod tests {
    use crate::{
        drm::{Drm, DrmBrand, LCP_KEY_RETRIEVAL, LCP_SCHEME},
        encryption::{ENCRYPTION_PATH, parse_encryption},
        test_support::ArchiveBuilder,
        types::{Compression, DiagnosticSource},
    };

    const ENCRYPTION_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<encryption xmlns="urn:oasis:names:tc:opendocument:xmlns:container"
            xmlns:enc="http://www.w3.org/2001/04/xmlenc#"
            xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.idpf.org/2008/embedding"/>
    <enc:CipherData><enc:CipherReference URI="OEBPS/fonts/font.otf"/></enc:CipherData>
  </enc:EncryptedData>
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes256-cbc"/>
    <ds:KeyInfo><ds:RetrievalMethod URI="license.lcpl#/encryption/content_key"/></ds:KeyInfo>
    <enc:CipherData><enc:CipherReference URI="OEBPS/chapter%201.xhtml"/></enc:CipherData>
    <enc:EncryptionProperties>
      <enc:EncryptionProperty>
        <Compression xmlns="http://www.idpf.org/2016/encryption#compression" Method="8" OriginalLength="1234"/>
      </enc:EncryptionProperty>
    </enc:EncryptionProperties>
  </enc:EncryptedData>
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes256-cbc"/>
  </enc:EncryptedData>
</encryption>"#;

    #[test]
    fn test_parse_encryption() {
        let archive = ArchiveBuilder::new().file(ENCRYPTION_PATH, ENCRYPTION_XML).open();
        let drm = Drm::new(DrmBrand::Lcp, LCP_SCHEME).with_key_retrieval(LCP_KEY_RETRIEVAL);

        let outcome = parse_encryption(archive.as_ref(), Some(&drm));
        assert_eq!(outcome.value.len(), 2);

        let font = &outcome.value["OEBPS/fonts/font.otf"][0];
        assert_eq!(font.algorithm, "http://www.idpf.org/2008/embedding");
        assert_eq!(font.compression, Compression::None);
        assert!(font.scheme.is_none());

        let chapter = &outcome.value["OEBPS/chapter 1.xhtml"][0];
        assert_eq!(chapter.compression, Compression::Deflate);
        assert_eq!(chapter.original_length, Some(1234));
        assert_eq!(chapter.retrieval_method.as_deref(), Some(LCP_KEY_RETRIEVAL));
        assert_eq!(chapter.scheme.as_deref(), Some(LCP_SCHEME));

        // The entry without a cipher reference is skipped
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].source, DiagnosticSource::Encryption);
    }

    /// Without a detected DRM no record is associated with a scheme
    #[test]
    fn test_parse_encryption_without_drm() {
        let archive = ArchiveBuilder::new().file(ENCRYPTION_PATH, ENCRYPTION_XML).open();
        let outcome = parse_encryption(archive.as_ref(), None);
        assert!(
            outcome
                .value
                .values()
                .flatten()
                .all(|record| record.scheme.is_none())
        );
    }

    #[test]
    fn test_absent_descriptor() {
        let archive = ArchiveBuilder::new().file("content.opf", "<package/>").open();
        let outcome = parse_encryption(archive.as_ref(), None);
        assert!(outcome.value.is_empty());
        assert!(outcome.is_clean());
    }

    /// An unparseable descriptor degrades to an empty map
    #[test]
    fn test_malformed_descriptor() {
        let archive = ArchiveBuilder::new()
            .file(ENCRYPTION_PATH, "<encryption><EncryptedData></encryption>")
            .open();
        let outcome = parse_encryption(archive.as_ref(), None);
        assert!(outcome.value.is_empty());
        assert_eq!(outcome.diagnostics.len(), 1);
    }
}
