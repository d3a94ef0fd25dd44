//! Media references and resolution results.
//!
//! A reference is whatever a framework put into a `file` field: a URL the
//! gateway can already fetch, an inline `base64://` payload, a `file://` URI
//! or a plain filesystem path.

use std::path::{Path, PathBuf};
use url::Url;

/// A media reference classified by form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaReference {
    /// `http://` or `https://`, passed through untouched.
    Remote(String),
    /// Payload after the `base64://` prefix, optionally with a data-URI header.
    Base64(String),
    /// Filesystem path extracted from a `file://` URI.
    FileUri(PathBuf),
    /// Plain path, absolute or relative to the working directory.
    Path(PathBuf),
}

impl MediaReference {
    pub fn parse(reference: &str) -> Self {
        if is_remote(reference) {
            return Self::Remote(reference.to_string());
        }
        if let Some(payload) = reference.strip_prefix("base64://") {
            return Self::Base64(payload.to_string());
        }
        if reference.starts_with("file://") {
            return Self::FileUri(file_uri_to_path(reference));
        }
        Self::Path(PathBuf::from(reference))
    }

    /// Suggested display name when the caller did not supply one.
    pub fn default_name(&self) -> String {
        match self {
            Self::Remote(url) => url_file_name(url).unwrap_or_default(),
            Self::Base64(_) => DEFAULT_BLOB_NAME.to_string(),
            Self::FileUri(path) | Self::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Name used for inline payloads that arrive without one.
pub const DEFAULT_BLOB_NAME: &str = "file.bin";

/// Whether the gateway can fetch this reference on its own.
pub fn is_remote(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

/// Last non-empty path segment of a URL, percent-decoded.
pub fn url_file_name(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()?
        .to_string();
    let decoded = percent_decode(&segment);
    (!decoded.is_empty()).then_some(decoded)
}

fn file_uri_to_path(uri: &str) -> PathBuf {
    if let Ok(url) = Url::parse(uri) {
        if let Ok(path) = url.to_file_path() {
            return path;
        }
        return PathBuf::from(strip_drive_slash(&percent_decode(url.path())));
    }
    PathBuf::from(strip_drive_slash(uri.trim_start_matches("file://")))
}

/// `/C:/x` → `C:/x`; everything else unchanged.
fn strip_drive_slash(path: &str) -> &str {
    let bytes = path.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':'
    {
        &path[1..]
    } else {
        path
    }
}

/// Percent-decode, replacing invalid UTF-8 rather than failing.
fn percent_decode(s: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(s.as_bytes())).into_owned()
}

/// Make a path absolute against the process's working directory.
pub fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// A successfully resolved reference.
///
/// At least one of `remote_url` and `local_path` is set; constructors
/// enforce this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    /// URL the gateway can fetch.
    pub remote_url: Option<String>,
    /// Canonical path on the storage host, usable if the gateway shares it.
    pub local_path: Option<String>,
    /// Display name for the media.
    pub name: String,
}

impl ResolvedMedia {
    pub fn remote(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            remote_url: Some(url.into()),
            local_path: None,
            name: name.into(),
        }
    }

    /// Build from an upload response; `None` when both locations are empty.
    pub fn uploaded(url: String, local_path: String, name: String) -> Option<Self> {
        let remote_url = (!url.is_empty()).then_some(url);
        let local_path = (!local_path.is_empty()).then_some(local_path);
        if remote_url.is_none() && local_path.is_none() {
            return None;
        }
        Some(Self {
            remote_url,
            local_path,
            name,
        })
    }
}
