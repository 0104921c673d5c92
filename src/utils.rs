use std::{collections::HashMap, io::Read};

use flate2::read::DeflateDecoder;
use percent_encoding::percent_decode_str;
use quick_xml::{
    NsReader,
    escape::{resolve_predefined_entity, unescape},
    events::{BytesStart, Event},
};
use sha1::{Digest, Sha1};

use crate::error::EpubError;

/// Resolves an href found in a document of the container against that document
///
/// The result is a normalized, container-root relative path without a leading slash.
/// Relative hrefs are resolved against the directory of `base_file`, path-absolute
/// hrefs (starting with `/`) against the container root. Percent-encoded characters
/// are decoded and the fragment identifier, if any, is kept. Hrefs carrying a URL
/// scheme (`http:`, `mailto:`) are returned unchanged.
///
/// ## Parameters
/// - `base_file`: Container-root relative path of the document holding the href
/// - `href`: The href to resolve
///
/// ## Return
/// - `Ok(String)`: The resolved path
/// - `Err(EpubError)`: The href climbs above the container root
pub fn resolve_href(base_file: &str, href: &str) -> Result<String, EpubError> {
    let href = href.trim();
    if has_url_scheme(href) {
        return Ok(href.to_string());
    }

    let (path, fragment) = match href.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (href, None),
    };
    let path = percent_decode_str(path).decode_utf8_lossy();

    let mut segments: Vec<&str> = if path.is_empty() {
        base_file.split('/').filter(|s| !s.is_empty()).collect()
    } else if path.starts_with('/') {
        vec![]
    } else {
        let mut base = base_file
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        base.pop();
        base
    };

    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(EpubError::RelativeLinkLeakage {
                        path: href.to_string(),
                    });
                }
            }
            segment => segments.push(segment),
        }
    }

    let mut resolved = segments.join("/");
    if let Some(fragment) = fragment {
        resolved.push('#');
        resolved.push_str(fragment);
    }
    Ok(resolved)
}

/// Strips the leading slash and the fragment identifier of a requested href
pub fn normalize_request_path(href: &str) -> &str {
    let href = href.split('#').next().unwrap_or(href);
    href.strip_prefix('/').unwrap_or(href)
}

#[inline]
fn has_url_scheme(href: &str) -> bool {
    match href.find(':') {
        Some(index) => {
            let scheme = &href[..index];
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
                && !href[..index].contains('/')
        }
        None => false,
    }
}

/// De-obfuscates a font using the IDPF font obfuscation algorithm
///
/// The IDPF font obfuscation algorithm XORs the first 1040 bytes of the font file
/// with the SHA-1 digest of the publication's unique identifier, from which every
/// whitespace character has been removed. Due to the involution of the XOR
/// operation (A XOR B XOR B = A), obfuscation and de-obfuscation use the same algorithm.
///
/// ## Parameters
/// - `data`: Obfuscated font data
/// - `identifier`: The unique identifier of the EPUB publication
///
/// ## Notes
/// - Only processes the first 1040 bytes of the font file; the rest remains unchanged.
pub fn idpf_font_deobfuscation(data: &[u8], identifier: &str) -> Vec<u8> {
    const OBFUSCATED_LENGTH: usize = 1040;

    let identifier = identifier
        .chars()
        .filter(|ch| !matches!(ch, ' ' | '\t' | '\r' | '\n'))
        .collect::<String>();

    let mut hasher = Sha1::new();
    hasher.update(identifier.as_bytes());
    let key = hasher.finalize();

    let mut output = data.to_vec();
    for (index, byte) in output.iter_mut().take(OBFUSCATED_LENGTH).enumerate() {
        *byte ^= key[index % key.len()];
    }
    output
}

/// De-obfuscates a font using the Adobe font obfuscation algorithm
///
/// The Adobe algorithm XORs the first 1024 bytes of the font file with the 16 bytes
/// of the UUID contained in the publication identifier (`urn:uuid:` prefix and
/// dashes removed, hex decoded).
///
/// ## Return
/// - `Some(Vec<u8>)`: De-obfuscated font data
/// - `None`: The identifier does not contain a valid UUID
pub fn adobe_font_deobfuscation(data: &[u8], identifier: &str) -> Option<Vec<u8>> {
    const OBFUSCATED_LENGTH: usize = 1024;

    let key = adobe_key(identifier)?;
    let mut output = data.to_vec();
    for (index, byte) in output.iter_mut().take(OBFUSCATED_LENGTH).enumerate() {
        *byte ^= key[index % key.len()];
    }
    Some(output)
}

fn adobe_key(identifier: &str) -> Option<[u8; 16]> {
    let identifier = identifier.trim();
    let uuid = identifier
        .strip_prefix("urn:uuid:")
        .unwrap_or(identifier)
        .chars()
        .filter(|ch| *ch != '-' && !ch.is_whitespace())
        .collect::<String>();

    if uuid.len() != 32 || !uuid.is_ascii() {
        return None;
    }

    let mut key = [0u8; 16];
    for (index, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&uuid[index * 2..index * 2 + 2], 16).ok()?;
    }
    Some(key)
}

/// Inflates raw DEFLATE data, as produced before encrypting a compressed resource
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, EpubError> {
    let mut decoder = DeflateDecoder::new(data);
    let mut output = Vec::new();
    decoder.read_to_end(&mut output)?;
    Ok(output)
}

/// Provides functionality to decode byte data into strings
///
/// This trait is primarily used to decode raw byte data (such as
/// text files read from EPUB files) into a suitable string representation.
/// It supports automatic detection of multiple encoding formats,
/// including UTF-8 (with or without BOM), UTF-16 BE, and UTF-16 LE.
///
/// ## Notes
/// - When attempting to parse a byte stream lacking a BOM (Byte Order Mark), the parsing
///   results may be unreadable; caution should be exercised when using such streams.
pub trait DecodeBytes {
    fn decode(&self) -> Result<String, EpubError>;
}

impl DecodeBytes for [u8] {
    fn decode(&self) -> Result<String, EpubError> {
        if self.is_empty() || self.len() < 4 {
            return Err(EpubError::EmptyDataError);
        }

        match self[0..3] {
            // UTF-8 BOM (0xEF, 0xBB, 0xBF)
            [0xEF, 0xBB, 0xBF, ..] => {
                String::from_utf8(self[3..].to_vec()).map_err(EpubError::from)
            }

            // UTF-16 BE BOM (0xFE, 0xFF)
            [0xFE, 0xFF, ..] => {
                let utf16_units: Vec<u16> = self[2..]
                    .chunks_exact(2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .collect();

                String::from_utf16(&utf16_units).map_err(EpubError::from)
            }

            // UTF-16 LE BOM (0xFF, 0xFE)
            [0xFF, 0xFE, ..] => {
                let utf16_units: Vec<u16> = self[2..]
                    .chunks_exact(2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .collect();

                String::from_utf16(&utf16_units).map_err(EpubError::from)
            }

            // The analytical results for this branch are unpredictable,
            // making it difficult to cover all possibilities when testing it.
            _ => {
                if let Ok(utf8_str) = String::from_utf8(self.to_vec()) {
                    return Ok(utf8_str);
                }

                if self.len() % 2 == 0 {
                    let utf16_units: Vec<u16> = self
                        .chunks_exact(2)
                        .map(|b| u16::from_be_bytes([b[0], b[1]]))
                        .collect();

                    if let Ok(utf16_str) = String::from_utf16(&utf16_units) {
                        return Ok(utf16_str);
                    }
                }

                Ok(String::from_utf8_lossy(self).to_string())
            }
        }
    }
}

impl DecodeBytes for Vec<u8> {
    fn decode(&self) -> Result<String, EpubError> {
        self.as_slice().decode()
    }
}

/// Provides functionality for normalizing whitespace characters
///
/// Sequences of whitespace characters (spaces, tabs, newlines, etc.) are
/// collapsed into a single space, leading and trailing whitespace is removed.
pub trait NormalizeWhitespace {
    fn normalize_whitespace(&self) -> String;
}

impl NormalizeWhitespace for &str {
    fn normalize_whitespace(&self) -> String {
        self.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl NormalizeWhitespace for String {
    fn normalize_whitespace(&self) -> String {
        self.as_str().normalize_whitespace()
    }
}

/// Represents an element node in an XML document
#[derive(Debug)]
pub struct XmlElement {
    /// The local name of the element(excluding namespace prefix)
    pub name: String,

    /// The namespace prefix of the element
    pub prefix: Option<String>,

    /// The namespace of the element
    pub namespace: Option<String>,

    /// The attributes of the element
    ///
    /// The key is the qualified attribute name (e.g. `epub:type`), the value is
    /// the unescaped attribute value.
    pub attributes: HashMap<String, String>,

    /// The text content of the element
    pub text: Option<String>,

    /// The children of the element
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: String) -> Self {
        Self {
            name,
            prefix: None,
            namespace: None,
            attributes: HashMap::new(),
            text: None,
            children: Vec::new(),
        }
    }

    /// Get the full tag name of the element
    ///
    /// If the element has a namespace prefix, return "prefix:name" format;
    /// otherwise, return only the element name.
    pub fn tag_name(&self) -> String {
        if let Some(prefix) = &self.prefix {
            format!("{}:{}", prefix, self.name)
        } else {
            self.name.clone()
        }
    }

    /// Gets the text content of the element and all its child elements
    pub fn text(&self) -> String {
        let mut result = String::new();
        self.collect_text(&mut result);
        result.trim().to_string()
    }

    fn collect_text(&self, buffer: &mut String) {
        if let Some(text_value) = &self.text {
            buffer.push_str(text_value);
        }

        for child in &self.children {
            child.collect_text(buffer);
        }
    }

    /// Returns the value of the specified attribute
    pub fn get_attr(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned()
    }

    /// Returns the value of an attribute whose local name is `name`, whatever its prefix
    pub fn get_attr_local(&self, name: &str) -> Option<String> {
        self.get_attr(name).or_else(|| {
            self.attributes
                .iter()
                .find(|(key, _)| key.rsplit(':').next() == Some(name))
                .map(|(_, value)| value.clone())
        })
    }

    /// Find all elements with the specified name, depth first, including self
    pub fn find_elements_by_name(&self, name: &str) -> impl Iterator<Item = &XmlElement> {
        SearchElementsByNameIter::new(self, name)
    }

    /// Find all elements with the specified name among the child elements of the current element
    pub fn find_children_by_name(&self, name: &str) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Find all elements with the specified name list among the child elements of the current element
    pub fn find_children_by_names(&self, names: &[&str]) -> impl Iterator<Item = &XmlElement> {
        self.children
            .iter()
            .filter(move |child| names.contains(&child.name.as_str()))
    }

    pub fn children(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter()
    }
}

struct SearchElementsByNameIter<'a> {
    elements: Vec<&'a XmlElement>,
    current_index: usize,
    target_name: String,
}

impl<'a> SearchElementsByNameIter<'a> {
    fn new(root: &'a XmlElement, name: &str) -> Self {
        let mut elements = Vec::new();
        Self::collect_elements(root, &mut elements);
        Self {
            elements,
            current_index: 0,
            target_name: name.to_string(),
        }
    }

    fn collect_elements(element: &'a XmlElement, collection: &mut Vec<&'a XmlElement>) {
        collection.push(element);
        for child in &element.children {
            Self::collect_elements(child, collection);
        }
    }
}

impl<'a> Iterator for SearchElementsByNameIter<'a> {
    type Item = &'a XmlElement;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current_index < self.elements.len() {
            let element = self.elements[self.current_index];
            self.current_index += 1;
            if element.name == self.target_name {
                return Some(element);
            }
        }
        None
    }
}

/// XML parser used to parse XML content and build an XML element tree
pub struct XmlReader {}

impl XmlReader {
    /// Parses an XML from string and builds the root element
    ///
    /// ## Return
    /// - `Ok(XmlElement)`: The root element of the XML element tree
    /// - `Err(EpubError)`: The document is empty, malformed or has no root element
    pub fn parse(content: &str) -> Result<XmlElement, EpubError> {
        if content.trim().is_empty() {
            return Err(EpubError::XmlParse {
                cause: "the document is empty".to_string(),
            });
        }

        let mut reader = NsReader::from_str(content);

        let mut buf = Vec::new();
        let mut stack = Vec::<XmlElement>::new();
        let mut root = None;
        let mut namespace_map = HashMap::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Eof) => break,

                Ok(Event::Start(e)) => {
                    let element = Self::build_element(&e, &mut namespace_map);
                    stack.push(element);
                }

                Ok(Event::End(_)) => {
                    if let Some(element) = stack.pop() {
                        if stack.is_empty() {
                            root = Some(element);
                        } else if let Some(parent) = stack.last_mut() {
                            parent.children.push(element);
                        }
                    }
                }

                // Self-closing element
                Ok(Event::Empty(e)) => {
                    let element = Self::build_element(&e, &mut namespace_map);
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = Some(element),
                    }
                }

                Ok(Event::Text(e)) => {
                    if let Some(element) = stack.last_mut() {
                        let text = String::from_utf8_lossy(e.as_ref());
                        element.text.get_or_insert_with(String::new).push_str(&text);
                    }
                }

                // Entity and character references are reported apart from the text around them
                Ok(Event::GeneralRef(e)) => {
                    if let Some(element) = stack.last_mut() {
                        let name = String::from_utf8_lossy(e.as_ref()).to_string();
                        let resolved = match e.resolve_char_ref() {
                            Ok(Some(ch)) => ch.to_string(),
                            _ => resolve_predefined_entity(&name)
                                .map(str::to_string)
                                .unwrap_or_else(|| format!("&{};", name)),
                        };
                        element
                            .text
                            .get_or_insert_with(String::new)
                            .push_str(&resolved);
                    }
                }

                Ok(Event::CData(e)) => {
                    if let Some(element) = stack.last_mut() {
                        let text = String::from_utf8_lossy(e.as_ref());
                        element.text.get_or_insert_with(String::new).push_str(&text);
                    }
                }

                Err(err) => return Err(err.into()),

                // Comment, PI, Declaration, Doctype
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(EpubError::XmlParse {
                cause: format!("unclosed element \"{}\"", stack[stack.len() - 1].tag_name()),
            });
        }

        let mut root = root.ok_or_else(|| EpubError::XmlParse {
            cause: "the document has no root element".to_string(),
        })?;
        Self::assign_namespace(&mut root, &namespace_map);
        Ok(root)
    }

    /// Parse XML from bytes and builds the root element
    pub fn parse_bytes(bytes: &[u8]) -> Result<XmlElement, EpubError> {
        let content = bytes.decode().map_err(|err| EpubError::XmlParse {
            cause: err.to_string(),
        })?;
        Self::parse(&content)
    }

    fn build_element(
        start: &BytesStart<'_>,
        namespace_map: &mut HashMap<String, String>,
    ) -> XmlElement {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).to_string();
        let mut element = XmlElement::new(name);

        if let Some(prefix) = start.name().prefix() {
            element.prefix = Some(String::from_utf8_lossy(prefix.as_ref()).to_string());
        }

        for attr in start.attributes().flatten() {
            let attr_key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let raw_value = String::from_utf8_lossy(&attr.value).to_string();
            let attr_value = unescape(&raw_value)
                .map(|value| value.into_owned())
                .unwrap_or(raw_value);

            if attr_key == "xmlns" || attr_key.starts_with("xmlns:") {
                match attr_key.split_once(':') {
                    Some((_, prefix)) => namespace_map.insert(prefix.to_string(), attr_value),
                    None => namespace_map.insert(attr_key, attr_value),
                };
                continue;
            }

            element.attributes.insert(attr_key, attr_value);
        }

        element
    }

    /// Assign namespace to element recursively
    fn assign_namespace(element: &mut XmlElement, namespace_map: &HashMap<String, String>) {
        if let Some(prefix) = &element.prefix {
            if let Some(namespace) = namespace_map.get(prefix) {
                element.namespace = Some(namespace.clone());
            }
        } else if let Some(namespace) = namespace_map.get("xmlns") {
            element.namespace = Some(namespace.clone());
        }

        for child in element.children.iter_mut() {
            Self::assign_namespace(child, namespace_map);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::EpubError,
        utils::{
            DecodeBytes, NormalizeWhitespace, XmlReader, adobe_font_deobfuscation,
            idpf_font_deobfuscation, inflate, normalize_request_path, resolve_href,
        },
    };

    /// Test with empty data
    #[test]
    fn test_decode_empty_data() {
        let data: Vec<u8> = vec![];
        let result = data.decode();
        assert!(result.is_err());
        assert_eq!(result.unwrap_err(), EpubError::EmptyDataError);
    }

    /// Testing text decoding with UTF-8 BOM
    #[test]
    fn test_decode_utf8_with_bom() {
        let data: Vec<u8> = vec![0xEF, 0xBB, 0xBF, b'H', b'e', b'l', b'l', b'o'];
        assert_eq!(data.decode().unwrap(), "Hello");
    }

    /// Testing text decoding with UTF-16 LE BOM
    #[test]
    fn test_decode_utf16_le_with_bom() {
        let data = vec![
            0xFF, 0xFE, // BOM
            b'H', 0x00, // H
            b'e', 0x00, // e
            b'l', 0x00, // l
            b'l', 0x00, // l
            b'o', 0x00, // o
        ];
        assert_eq!(data.decode().unwrap(), "Hello");
    }

    #[test]
    fn test_normalize_whitespace_trait() {
        let text = "  Hello,\tWorld!\n\nRust  ";
        assert_eq!(text.normalize_whitespace(), "Hello, World! Rust");
    }

    #[test]
    fn test_resolve_href_relative() {
        assert_eq!(
            resolve_href("OEBPS/content.opf", "text/ch1.xhtml").unwrap(),
            "OEBPS/text/ch1.xhtml"
        );
        assert_eq!(
            resolve_href("OEBPS/text/nav.xhtml", "../images/a.png").unwrap(),
            "OEBPS/images/a.png"
        );
        assert_eq!(
            resolve_href("OEBPS/text/nav.xhtml", "./ch1.xhtml#p3").unwrap(),
            "OEBPS/text/ch1.xhtml#p3"
        );
        assert_eq!(
            resolve_href("content.opf", "my%20chapter.xhtml").unwrap(),
            "my chapter.xhtml"
        );
    }

    #[test]
    fn test_resolve_href_absolute_and_fragment_only() {
        assert_eq!(
            resolve_href("OEBPS/content.opf", "/media/photo.jpg").unwrap(),
            "media/photo.jpg"
        );
        assert_eq!(
            resolve_href("OEBPS/nav.xhtml", "#toc").unwrap(),
            "OEBPS/nav.xhtml#toc"
        );
        assert_eq!(
            resolve_href("OEBPS/nav.xhtml", "https://example.org/a").unwrap(),
            "https://example.org/a"
        );
    }

    /// A relative href that climbs out of the container is rejected
    #[test]
    fn test_resolve_href_leakage() {
        let result = resolve_href("OEBPS/content.opf", "../../../media/imgs/monastery.jpg");
        assert_eq!(
            result.unwrap_err(),
            EpubError::RelativeLinkLeakage {
                path: "../../../media/imgs/monastery.jpg".to_string()
            }
        );
    }

    #[test]
    fn test_normalize_request_path() {
        assert_eq!(normalize_request_path("/OEBPS/a.xhtml#x"), "OEBPS/a.xhtml");
        assert_eq!(normalize_request_path("OEBPS/a.xhtml"), "OEBPS/a.xhtml");
    }

    /// Obfuscating twice with the same identifier restores the font
    #[test]
    fn test_idpf_font_deobfuscation_is_involutive() {
        let font = (0..2048).map(|i| (i % 251) as u8).collect::<Vec<u8>>();
        let obfuscated = idpf_font_deobfuscation(&font, "urn:uuid:1234");
        assert_ne!(obfuscated[..1040], font[..1040]);
        assert_eq!(obfuscated[1040..], font[1040..]);

        // Whitespace in the identifier does not change the key
        let restored = idpf_font_deobfuscation(&obfuscated, " urn:uuid:12\n34 ");
        assert_eq!(restored, font);
    }

    #[test]
    fn test_adobe_font_deobfuscation() {
        let identifier = "urn:uuid:0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0";
        let font = vec![0u8; 1100];
        let obfuscated = adobe_font_deobfuscation(&font, identifier).unwrap();
        assert_eq!(obfuscated[0], 0x0f);
        assert_eq!(obfuscated[15], 0xf0);
        assert_eq!(obfuscated[16], 0x0f);
        assert_eq!(obfuscated[1024..], font[1024..]);

        assert!(adobe_font_deobfuscation(&font, "isbn:9780000000000").is_none());
    }

    #[test]
    fn test_inflate_raw_deflate() {
        use std::io::Write;

        use flate2::{Compression, write::DeflateEncoder};

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"chapter text chapter text").unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(inflate(&compressed).unwrap(), b"chapter text chapter text");
    }

    #[test]
    fn test_xml_reader_entities_and_attributes() {
        let root = XmlReader::parse(
            r#"<?xml version="1.0"?>
            <root xmlns="urn:a" xmlns:epub="urn:epub">
                <a href="x.xhtml?a=1&amp;b=2" epub:type="toc">Tom &amp; Jerry &#169;</a>
                <empty/>
            </root>"#,
        )
        .unwrap();

        assert_eq!(root.namespace.as_deref(), Some("urn:a"));
        let anchor = root.find_elements_by_name("a").next().unwrap();
        assert_eq!(anchor.get_attr("href").unwrap(), "x.xhtml?a=1&b=2");
        assert_eq!(anchor.get_attr_local("type").unwrap(), "toc");
        assert_eq!(anchor.text().normalize_whitespace(), "Tom & Jerry ©");
        assert_eq!(root.find_children_by_name("empty").count(), 1);
    }

    #[test]
    fn test_xml_reader_malformed() {
        let result = XmlReader::parse("<root><child></root>");
        assert!(matches!(result, Err(EpubError::XmlParse { .. })));

        let result = XmlReader::parse("   ");
        assert!(matches!(result, Err(EpubError::XmlParse { .. })));
    }
}
