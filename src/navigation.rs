//! Navigation collections
//!
//! The EPUB 3 navigation document is the primary source of the table of
//! contents, page list, landmarks and the other lists. The legacy NCX document
//! is only consulted when the navigation document has no table of contents.

use log::debug;

use crate::{
    archive::ArchiveReader,
    package::PackageDocument,
    types::{Collections, DiagnosticSource, Link, NavRole, Outcome},
    utils::{NormalizeWhitespace, XmlElement, XmlReader, resolve_href},
};

/// Builds the navigation collections of a publication
///
/// The navigation document is the link with the `contents` relation. When it is
/// absent or unreadable no collection is produced. When its table of contents is
/// empty, the NCX document (relation `ncx`) is parsed and contributes every role
/// the navigation document lacks. Problems are reported as diagnostics, never as
/// errors.
pub fn parse_collections(archive: &dyn ArchiveReader, package: &PackageDocument) -> Outcome<Collections> {
    let mut outcome = Outcome::new(Collections::new());

    let Some(nav) = package.links().find(|link| link.has_rel("contents")) else {
        debug!("The publication has no navigation document.");
        return outcome;
    };

    let data = match archive.read(nav.path()) {
        Ok(data) => data,
        Err(err) => {
            outcome.report(
                DiagnosticSource::Navigation,
                format!("navigation document \"{}\" is unreadable: {}", nav.href, err),
            );
            return outcome;
        }
    };

    let mut collections = parse_navigation_document(&data, nav.path()).drain_into(&mut outcome.diagnostics);

    if !collections.contains(NavRole::TableOfContents) {
        if let Some(ncx) = package.links().find(|link| link.has_rel("ncx")) {
            match archive.read(ncx.path()) {
                Ok(data) => {
                    let fallback = parse_ncx(&data, ncx.path()).drain_into(&mut outcome.diagnostics);
                    collections.merge_missing(fallback);
                }
                Err(err) => outcome.report(
                    DiagnosticSource::Ncx,
                    format!("NCX document \"{}\" is unreadable: {}", ncx.href, err),
                ),
            }
        }
    }

    outcome.value = collections;
    outcome
}

/// Parses the `nav` elements of an EPUB 3 navigation document
///
/// Each `nav` whose `epub:type` names a supported role yields the links of its
/// `ol` list. Hrefs are resolved against `href`, the path of the document.
pub fn parse_navigation_document(data: &[u8], href: &str) -> Outcome<Collections> {
    let mut parser = ListParser::new(href, DiagnosticSource::Navigation);

    let root = match XmlReader::parse_bytes(data) {
        Ok(root) => root,
        Err(err) => {
            parser.report(format!("navigation document \"{}\" could not be parsed: {}", href, err));
            return Outcome::with_diagnostics(Collections::new(), parser.outcome.diagnostics);
        }
    };

    let mut collections = Collections::new();
    for nav in root.find_elements_by_name("nav") {
        let Some(role) = epub_types(nav).iter().find_map(|token| NavRole::from_epub_type(token)) else {
            continue;
        };

        if collections.contains(role) {
            parser.report(format!("duplicate \"{}\" navigation ignored", role));
            continue;
        }

        let links = match nav.find_children_by_name("ol").next() {
            Some(list) => parser.parse_list(list),
            None => vec![],
        };
        collections.insert(role, links);
    }

    Outcome::with_diagnostics(collections, parser.outcome.diagnostics)
}

/// Parses the navigation map and the page list of a legacy NCX document
pub fn parse_ncx(data: &[u8], href: &str) -> Outcome<Collections> {
    let mut parser = ListParser::new(href, DiagnosticSource::Ncx);

    let root = match XmlReader::parse_bytes(data) {
        Ok(root) => root,
        Err(err) => {
            parser.report(format!("NCX document \"{}\" could not be parsed: {}", href, err));
            return Outcome::with_diagnostics(Collections::new(), parser.outcome.diagnostics);
        }
    };

    let mut collections = Collections::new();
    if let Some(nav_map) = root.find_children_by_name("navMap").next() {
        let links = parser.parse_nav_points(nav_map);
        collections.insert(NavRole::TableOfContents, links);
    }

    if let Some(page_list) = root.find_children_by_name("pageList").next() {
        let links = page_list
            .find_children_by_name("pageTarget")
            .filter_map(|target| parser.parse_target(target, vec![]))
            .collect();
        collections.insert(NavRole::PageList, links);
    }

    Outcome::with_diagnostics(collections, parser.outcome.diagnostics)
}

fn epub_types(element: &XmlElement) -> Vec<String> {
    element
        .get_attr("epub:type")
        .or_else(|| element.get_attr_local("type"))
        .map(|types| types.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

struct ListParser<'a> {
    href: &'a str,
    source: DiagnosticSource,
    outcome: Outcome<()>,
}

impl<'a> ListParser<'a> {
    fn new(href: &'a str, source: DiagnosticSource) -> Self {
        Self {
            href,
            source,
            outcome: Outcome::new(()),
        }
    }

    fn report(&mut self, message: String) {
        self.outcome.report(self.source, message);
    }

    /// Resolves an href of the document, reporting the ones escaping the container
    fn resolve(&mut self, href: Option<String>) -> Option<String> {
        let href = href?;
        match resolve_href(self.href, &href) {
            Ok(resolved) => Some(resolved),
            Err(err) => {
                self.report(err.to_string());
                None
            }
        }
    }

    /// Builds a link, an entry with neither target nor children is dropped
    fn link(&self, href: Option<String>, title: String, rels: Vec<String>, children: Vec<Link>) -> Option<Link> {
        if href.is_none() && children.is_empty() {
            return None;
        }

        Some(Link {
            href: href.unwrap_or_else(|| "#".to_string()),
            title: (!title.is_empty()).then_some(title),
            rels,
            children,
            ..Default::default()
        })
    }

    /// Recursively parses an `ol > li > (a|span)` list
    fn parse_list(&mut self, list: &XmlElement) -> Vec<Link> {
        let mut links = Vec::new();
        for item in list.find_children_by_name("li") {
            let children = match item.find_children_by_name("ol").next() {
                Some(sub_list) => self.parse_list(sub_list),
                None => vec![],
            };

            let Some(label) = item.find_children_by_names(&["a", "span"]).next() else {
                links.extend(children);
                continue;
            };

            let href = self.resolve(label.get_attr("href"));
            let title = label.text().normalize_whitespace();
            if let Some(link) = self.link(href, title, epub_types(label), children) {
                links.push(link);
            }
        }
        links
    }

    /// Recursively parses NCX `navPoint` elements
    ///
    /// Siblings are ordered by `playOrder` when every one of them declares it.
    fn parse_nav_points(&mut self, parent: &XmlElement) -> Vec<Link> {
        let mut points = Vec::new();
        for nav_point in parent.find_children_by_name("navPoint") {
            let children = self.parse_nav_points(nav_point);
            let play_order = nav_point
                .get_attr("playOrder")
                .and_then(|order| order.trim().parse::<u32>().ok());

            if let Some(link) = self.parse_target(nav_point, children) {
                points.push((play_order, link));
            }
        }

        if points.iter().all(|(order, _)| order.is_some()) {
            points.sort_by_key(|(order, _)| *order);
        }
        points.into_iter().map(|(_, link)| link).collect()
    }

    /// Parses the `navLabel/text` and `content@src` of a `navPoint` or `pageTarget`
    fn parse_target(&mut self, target: &XmlElement, children: Vec<Link>) -> Option<Link> {
        let title = target
            .find_children_by_name("navLabel")
            .flat_map(|label| label.find_children_by_name("text"))
            .next()
            .map(|text| text.text().normalize_whitespace())
            .unwrap_or_default();
        let src = target
            .find_children_by_name("content")
            .next()
            .and_then(|content| content.get_attr("src"));
        let href = self.resolve(src);

        self.link(href, title, vec![], children)
    }
}
