//! CQ code scanning and media rewriting.
//!
//! Message text embeds directives of the form `[CQ:kind,key=value,...]`.
//! Only `image` and `record` segments are rewritten; everything else, and all
//! surrounding text, is copied through byte for byte.
//!
//! Values the relay writes are escaped so the segment stays parseable:
//! `,` → `%2C`, `[` → `%5B`, `]` → `%5D`.

use crate::media::is_remote;
use crate::resolver::MediaResolver;
use serde_json::Value;
use tracing::debug;

const OPENER: &str = "[CQ:";

/// Segment kinds whose `file` reference is rewritten.
pub const MEDIA_KINDS: [&str; 2] = ["image", "record"];

fn is_media_kind(kind: &str) -> bool {
    MEDIA_KINDS.contains(&kind)
}

/// Escape a value for embedding in a CQ segment.
pub fn escape_value(value: &str) -> String {
    value
        .replace(',', "%2C")
        .replace('[', "%5B")
        .replace(']', "%5D")
}

/// Inverse of [`escape_value`] for values that held no `%2C`, `%5B` or `%5D`
/// before escaping. Such sequences already in a URL come back as the literal
/// character, which names the same resource. `%` itself is never escaped so
/// other percent-escapes (`%20`) reach the gateway unchanged.
pub fn unescape_value(value: &str) -> String {
    value
        .replace("%2C", ",")
        .replace("%5B", "[")
        .replace("%5D", "]")
}

/// Decode the HTML-style entities frameworks use inside CQ values.
fn decode_entities(value: &str) -> String {
    value
        .replace("&#44;", ",")
        .replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&amp;", "&")
}

/// Build a `[CQ:file,...]` segment pointing at a remote URL.
pub fn file_markup(url: &str, name: &str) -> String {
    format!(
        "[CQ:file,file={},name={}]",
        escape_value(url),
        escape_value(name)
    )
}

/// One parsed `[CQ:...]` segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqSegment {
    pub kind: String,
    /// Attributes in first-seen order. A later duplicate overwrites the value
    /// in place. Bare keys without `=` keep `None`.
    pub attrs: Vec<(String, Option<String>)>,
}

impl CqSegment {
    /// Parse the text between `[CQ:` and `]`.
    pub fn parse(inner: &str) -> Self {
        let mut parts = inner.split(',');
        let kind = parts.next().unwrap_or_default().trim().to_string();
        let mut segment = Self {
            kind,
            attrs: Vec::new(),
        };
        for part in parts {
            if part.trim().is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((k, v)) => segment.set(k.trim(), v.trim().to_string()),
                None => {
                    let key = part.trim();
                    if !segment.attrs.iter().any(|(k, _)| k == key) {
                        segment.attrs.push((key.to_string(), None));
                    }
                }
            }
        }
        segment
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn set(&mut self, key: &str, value: String) {
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = Some(value),
            None => self.attrs.push((key.to_string(), Some(value))),
        }
    }

    /// Render with `file` first, other attributes in their stored order.
    pub fn render(&self) -> String {
        let mut out = String::from(OPENER);
        out.push_str(&self.kind);
        if let Some(file) = self.get("file") {
            out.push_str(",file=");
            out.push_str(file);
        }
        for (k, v) in self.attrs.iter().filter(|(k, _)| k != "file") {
            out.push(',');
            out.push_str(k);
            if let Some(v) = v {
                out.push('=');
                out.push_str(v);
            }
        }
        out.push(']');
        out
    }
}

/// A piece of scanned message text.
#[derive(Debug, PartialEq, Eq)]
enum Piece<'a> {
    Text(&'a str),
    /// Full segment text including brackets, and the inner part.
    Code { raw: &'a str, inner: &'a str },
}

/// Split text into plain runs and `[CQ:...]` segments.
///
/// An opener whose body contains another `[` or never closes is plain text.
fn scan(text: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut plain_start = 0;
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(OPENER) {
        let start = cursor + offset;
        let body_start = start + OPENER.len();
        let Some(close) = text[body_start..].find(']') else {
            break;
        };
        let inner = &text[body_start..body_start + close];
        if inner.contains('[') {
            cursor = start + 1;
            continue;
        }
        if plain_start < start {
            pieces.push(Piece::Text(&text[plain_start..start]));
        }
        let end = body_start + close + 1;
        pieces.push(Piece::Code {
            raw: &text[start..end],
            inner,
        });
        plain_start = end;
        cursor = end;
    }

    if plain_start < text.len() {
        pieces.push(Piece::Text(&text[plain_start..]));
    }
    pieces
}

/// Shared decision for both the text and the array form.
///
/// Returns the resolved `(remote_url, name)` when the segment should change.
async fn resolve_media<R: MediaResolver>(
    resolver: &R,
    file: Option<&str>,
    url: Option<&str>,
    name: Option<&str>,
) -> Option<(String, String)> {
    if url.is_some_and(is_remote) {
        return None;
    }
    let file = file.filter(|f| !f.is_empty())?;
    if is_remote(file) {
        return None;
    }
    let resolved = resolver.resolve(file, name.unwrap_or_default()).await.ok()?;
    let remote = resolved.remote_url?;
    Some((remote, resolved.name))
}

/// Rewrite every media segment in `text` whose reference is not yet remote.
///
/// The result equals `text` when nothing needed rewriting.
pub async fn rewrite_markup<R: MediaResolver>(text: &str, resolver: &R) -> String {
    let mut out = String::with_capacity(text.len());
    for piece in scan(text) {
        match piece {
            Piece::Text(t) => out.push_str(t),
            Piece::Code { raw, inner } => {
                let mut segment = CqSegment::parse(inner);
                if !is_media_kind(&segment.kind) {
                    out.push_str(raw);
                    continue;
                }
                let file = segment.get("file").map(decode_entities);
                let resolved = resolve_media(
                    resolver,
                    file.as_deref(),
                    segment.get("url"),
                    segment.get("name"),
                )
                .await;
                match resolved {
                    Some((remote, name)) => {
                        debug!(kind = %segment.kind, url = %remote, "rewrote media segment");
                        segment.set("file", escape_value(&remote));
                        if !name.is_empty() {
                            segment.set("name", escape_value(&name));
                        }
                        out.push_str(&segment.render());
                    }
                    None => out.push_str(raw),
                }
            }
        }
    }
    out
}

/// Rewrite media elements of an array-form message in place.
///
/// Elements look like `{"type": "image", "data": {"file": "..."}}`. Returns
/// whether anything changed.
pub async fn rewrite_segments<R: MediaResolver>(segments: &mut [Value], resolver: &R) -> bool {
    let mut changed = false;
    for segment in segments.iter_mut() {
        let is_media = segment
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(is_media_kind);
        if !is_media {
            continue;
        }
        let Some(data) = segment.get_mut("data").and_then(Value::as_object_mut) else {
            continue;
        };
        let resolved = resolve_media(
            resolver,
            data.get("file").and_then(Value::as_str),
            data.get("url").and_then(Value::as_str),
            data.get("name").and_then(Value::as_str),
        )
        .await;
        if let Some((remote, name)) = resolved {
            data.insert("file".into(), Value::String(remote));
            if !name.is_empty() {
                data.insert("name".into(), Value::String(name));
            }
            changed = true;
        }
    }
    changed
}
