use std::path::{Path, PathBuf};

use lsp_types::{GotoDefinitionResponse, Location, LocationLink, Range, Uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LspError;

/// A location returned by the server, resolved against the workspace
///
/// Serializes as `{uri, absolutePath, relativePath, range}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLocation {
    pub uri: Uri,
    /// `None` when the URI is not a `file:` URI
    pub absolute_path: Option<PathBuf>,
    /// `None` when the file lies outside the workspace root
    pub relative_path: Option<PathBuf>,
    pub range: Range,
}

impl FileLocation {
    /// Resolve `uri` to absolute and workspace-relative paths
    pub fn resolve(uri: Uri, range: Range, root: &Path) -> Self {
        let absolute_path = uri_to_path(&uri);
        let relative_path = absolute_path
            .as_deref()
            .and_then(|path| relative_to(root, path));

        Self {
            uri,
            absolute_path,
            relative_path,
            range,
        }
    }

    fn from_location(location: Location, root: &Path) -> Self {
        Self::resolve(location.uri, location.range, root)
    }

    fn from_link(link: LocationLink, root: &Path) -> Self {
        Self::resolve(link.target_uri, link.target_selection_range, root)
    }
}

/// Converts an absolute path to an `lsp_types::Uri` using `file://` encoding.
pub fn path_to_uri(path: &Path) -> Result<Uri, LspError> {
    let file_url = url::Url::from_file_path(path)
        .map_err(|()| LspError::invalid_path(path, "cannot be expressed as a file:// URI"))?;

    file_url.as_str().parse().map_err(|source| {
        LspError::invalid_path(path, format!("failed to parse file URI '{file_url}': {source}"))
    })
}

/// Filesystem path of a `file:` URI
pub fn uri_to_path(uri: &Uri) -> Option<PathBuf> {
    let url = url::Url::parse(uri.as_str()).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

/// `path` relative to `root`, if it lies inside it
///
/// `root` is expected to be canonical; `path` is canonicalized as a
/// fallback so symlinked locations still resolve.
pub fn relative_to(root: &Path, path: &Path) -> Option<PathBuf> {
    if let Ok(relative) = path.strip_prefix(root) {
        return Some(relative.to_path_buf());
    }

    let canonical = path.canonicalize().ok()?;
    canonical
        .strip_prefix(root)
        .ok()
        .map(Path::to_path_buf)
}

/// Normalize a definition-style response (`Location`, `Location[]`,
/// `LocationLink[]` or `null`)
pub fn parse_locations(value: Value, root: &Path) -> Result<Vec<FileLocation>, serde_json::Error> {
    let response: Option<GotoDefinitionResponse> = serde_json::from_value(value)?;

    Ok(match response {
        None => Vec::new(),
        Some(GotoDefinitionResponse::Scalar(location)) => {
            vec![FileLocation::from_location(location, root)]
        }
        Some(GotoDefinitionResponse::Array(locations)) => locations
            .into_iter()
            .map(|location| FileLocation::from_location(location, root))
            .collect(),
        Some(GotoDefinitionResponse::Link(links)) => links
            .into_iter()
            .map(|link| FileLocation::from_link(link, root))
            .collect(),
    })
}
