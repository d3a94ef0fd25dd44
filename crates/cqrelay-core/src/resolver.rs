//! Media resolution through the upload endpoint.
//!
//! [`UploadResolver`] turns local and embedded references into URLs by
//! submitting them as multipart uploads:
//!
//! ```text
//! POST <endpoint>
//!   file = <bytes>  (filename = display name; local files are streamed)
//!   name = <display name>
//! → 2xx {"url": "...", "name": "...", "local_path": "..."}
//! ```
//!
//! There is exactly one attempt per reference. Every failure is reported as a
//! [`ResolveError`] which callers treat as "leave the reference alone".

use crate::error::ResolveError;
use crate::media::{absolutize, MediaReference, ResolvedMedia};
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Something that can turn a media reference into a fetchable location.
pub trait MediaResolver: Send + Sync {
    /// Resolve `reference`. `suggested_name` may be empty.
    fn resolve(
        &self,
        reference: &str,
        suggested_name: &str,
    ) -> impl Future<Output = Result<ResolvedMedia, ResolveError>> + Send;
}

/// Body returned by the upload endpoint. Missing fields read as empty.
#[derive(Debug, Default, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    url: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    local_path: String,
}

/// Production resolver backed by the multipart upload endpoint.
pub struct UploadResolver {
    /// Upload endpoint URL; `None` disables uploads.
    endpoint: Option<String>,
    /// HTTP client (reusable, carries the request timeout).
    http_client: reqwest::Client,
}

impl UploadResolver {
    /// Default upload timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(endpoint: Option<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.filter(|e| !e.is_empty()),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Stream a local file to the upload endpoint.
    async fn upload_path(&self, path: &Path, name: &str) -> Result<ResolvedMedia, ResolveError> {
        let io_err = |path: &Path, source| ResolveError::Io {
            path: path.display().to_string(),
            source,
        };
        let path = absolutize(path).map_err(|e| io_err(path, e))?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| io_err(path.as_path(), e))?;
        let length = file.metadata().await.map_err(|e| io_err(path.as_path(), e))?.len();
        let part = Part::stream_with_length(Body::from(file), length);
        self.submit(part, name).await
    }

    /// Upload in-memory bytes, e.g. a decoded base64 payload.
    async fn upload_bytes(&self, data: Vec<u8>, name: &str) -> Result<ResolvedMedia, ResolveError> {
        self.submit(Part::bytes(data), name).await
    }

    /// Submit `part` as the `file` field to the upload endpoint.
    async fn submit(&self, part: Part, name: &str) -> Result<ResolvedMedia, ResolveError> {
        let endpoint = self.endpoint.as_deref().ok_or(ResolveError::NoEndpoint)?;

        let form = Form::new()
            .part("file", part.file_name(name.to_string()))
            .text("name", name.to_string());

        debug!(endpoint = %endpoint, name = %name, "uploading media");
        let response = self.http_client.post(endpoint).multipart(form).send().await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(ResolveError::UploadStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let uploaded: UploadResponse = serde_json::from_slice(&body)?;
        let name = if uploaded.name.is_empty() {
            name.to_string()
        } else {
            uploaded.name
        };
        ResolvedMedia::uploaded(uploaded.url, uploaded.local_path, name)
            .ok_or(ResolveError::EmptyUpload)
    }
}

impl MediaResolver for UploadResolver {
    async fn resolve(
        &self,
        reference: &str,
        suggested_name: &str,
    ) -> Result<ResolvedMedia, ResolveError> {
        let media = MediaReference::parse(reference);
        let name = if suggested_name.is_empty() {
            media.default_name()
        } else {
            suggested_name.to_string()
        };

        let result = match &media {
            MediaReference::Remote(url) => return Ok(ResolvedMedia::remote(url.clone(), name)),
            MediaReference::Base64(payload) => match decode_base64_payload(payload) {
                Ok(data) => self.upload_bytes(data, &name).await,
                Err(e) => Err(e),
            },
            MediaReference::FileUri(path) | MediaReference::Path(path) => {
                self.upload_path(path, &name).await
            }
        };

        if let Err(ref e) = result {
            warn!(reference = %truncate(reference, 96), error = %e, "media resolution failed");
        }
        result
    }
}

/// Decode a `base64://` payload, dropping an optional `data:...;base64,` header.
pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>, ResolveError> {
    let encoded = match payload.find(',') {
        Some(idx) => &payload[idx + 1..],
        None => payload,
    };
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded.trim())?)
}

/// Keep log lines readable when the reference is an inline payload.
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver_for(server: &MockServer) -> UploadResolver {
        UploadResolver::new(
            Some(format!("{}/upload", server.uri())),
            Duration::from_secs(5),
        )
    }

    async fn mount_ok(server: &MockServer, body: &str) {
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn remote_url_is_returned_unchanged() {
        let resolver = UploadResolver::new(None, Duration::from_secs(1));
        let resolved = resolver
            .resolve("https://cdn.example/pics/cat.png", "")
            .await
            .unwrap();
        assert_eq!(resolved.remote_url.as_deref(), Some("https://cdn.example/pics/cat.png"));
        assert_eq!(resolved.local_path, None);
        assert_eq!(resolved.name, "cat.png");

        let named = resolver.resolve("http://cdn.example/x", "kept.png").await.unwrap();
        assert_eq!(named.name, "kept.png");
    }

    #[tokio::test]
    async fn local_file_is_uploaded() {
        let server = MockServer::start().await;
        mount_ok(
            &server,
            r#"{"url":"https://cdn/x.png","name":"a.png","local_path":"/srv/uploads/a.png"}"#,
        )
        .await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"png bytes").unwrap();

        let resolved = resolver_for(&server)
            .resolve(file.path().to_str().unwrap(), "")
            .await
            .unwrap();
        assert_eq!(resolved.remote_url.as_deref(), Some("https://cdn/x.png"));
        assert_eq!(resolved.local_path.as_deref(), Some("/srv/uploads/a.png"));
        assert_eq!(resolved.name, "a.png");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"file\""));
        assert!(body.contains("png bytes"));
        assert!(body.contains("name=\"name\""));
    }

    #[tokio::test]
    async fn large_file_is_streamed_whole() {
        let server = MockServer::start().await;
        mount_ok(&server, r#"{"url":"https://cdn/big.bin"}"#).await;

        let payload: Vec<u8> = (0..512 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&payload).unwrap();

        let resolved = resolver_for(&server)
            .resolve(file.path().to_str().unwrap(), "big.bin")
            .await
            .unwrap();
        assert_eq!(resolved.remote_url.as_deref(), Some("https://cdn/big.bin"));

        let requests = server.received_requests().await.unwrap();
        let body = &requests[0].body;
        assert!(body
            .windows(payload.len())
            .any(|window| window == payload.as_slice()));
    }

    #[tokio::test]
    async fn suggested_name_survives_empty_response_name() {
        let server = MockServer::start().await;
        mount_ok(&server, r#"{"url":"https://cdn/y.bin"}"#).await;

        let resolved = resolver_for(&server)
            .resolve("base64://aGVsbG8=", "greeting.txt")
            .await
            .unwrap();
        assert_eq!(resolved.name, "greeting.txt");
        assert_eq!(resolved.remote_url.as_deref(), Some("https://cdn/y.bin"));
    }

    #[tokio::test]
    async fn base64_defaults_name_and_strips_data_header() {
        let server = MockServer::start().await;
        mount_ok(&server, r#"{"url":"https://cdn/z","local_path":""}"#).await;

        let resolved = resolver_for(&server)
            .resolve("base64://data:image/png;base64,aGVsbG8=", "")
            .await
            .unwrap();
        assert_eq!(resolved.name, "file.bin");

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("hello"));
        assert!(body.contains("filename=\"file.bin\""));
    }

    #[tokio::test]
    async fn bad_base64_fails_without_upload() {
        let server = MockServer::start().await;
        mount_ok(&server, r#"{"url":"https://cdn/z"}"#).await;

        let err = resolver_for(&server)
            .resolve("base64://!!!not base64!!!", "")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Base64(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let server = MockServer::start().await;
        mount_ok(&server, r#"{"url":"https://cdn/z"}"#).await;

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.png");
        let err = resolver_for(&server)
            .resolve(missing.to_str().unwrap(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Io { .. }));
    }

    #[tokio::test]
    async fn non_success_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
            .mount(&server)
            .await;

        let err = resolver_for(&server)
            .resolve("base64://aGk=", "")
            .await
            .unwrap_err();
        match err {
            ResolveError::UploadStatus { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "disk full");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_or_empty_response_fails() {
        let server = MockServer::start().await;
        mount_ok(&server, "not json").await;
        let err = resolver_for(&server).resolve("base64://aGk=", "").await.unwrap_err();
        assert!(matches!(err, ResolveError::UploadDecode(_)));

        let server = MockServer::start().await;
        mount_ok(&server, r#"{"name":"x"}"#).await;
        let err = resolver_for(&server).resolve("base64://aGk=", "").await.unwrap_err();
        assert!(matches!(err, ResolveError::EmptyUpload));
    }

    #[tokio::test]
    async fn no_endpoint_fails_local_references() {
        let resolver = UploadResolver::new(Some(String::new()), Duration::from_secs(1));
        let err = resolver.resolve("base64://aGk=", "").await.unwrap_err();
        assert!(matches!(err, ResolveError::NoEndpoint));
    }

    #[test]
    fn decodes_plain_and_prefixed_payloads() {
        assert_eq!(decode_base64_payload("aGk=").unwrap(), b"hi");
        assert_eq!(decode_base64_payload("data:text/plain;base64,aGk=").unwrap(), b"hi");
    }
}
