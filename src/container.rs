use crate::{archive::ArchiveReader, error::EpubError, utils::XmlReader};

/// Fixed path of the container entry point descriptor
pub const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Locates the package document of the container
///
/// Parses `META-INF/container.xml` and returns the `full-path` of the first
/// `rootfile` element declaring one. When a container holds multiple renditions,
/// the first one is the default rendition.
///
/// ## Return
/// - `Ok(String)`: Container-root relative path of the package document
/// - `Err(EpubError::MissingFile)`: `META-INF/container.xml` is absent
/// - `Err(EpubError::XmlParse)`: The descriptor is malformed
/// - `Err(EpubError::MissingRootfile)`: No package document path is declared
pub fn locate_package(archive: &dyn ArchiveReader) -> Result<String, EpubError> {
    let data = archive.read(CONTAINER_PATH).map_err(|err| match err {
        EpubError::ResourceNotFound { .. } => EpubError::MissingFile {
            path: CONTAINER_PATH.to_string(),
        },
        err => err,
    })?;

    let root = XmlReader::parse_bytes(&data)?;
    root.find_elements_by_name("rootfile")
        .filter_map(|rootfile| rootfile.get_attr("full-path"))
        .map(|path| path.trim().trim_start_matches('/').to_string())
        .find(|path| !path.is_empty())
        .ok_or(EpubError::MissingRootfile)
}
