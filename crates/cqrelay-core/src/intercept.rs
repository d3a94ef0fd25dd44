//! Outbound command interception.
//!
//! Applied to every text frame travelling from the framework to the gateway.
//! A frame is only re-serialized when a media reference was actually
//! rewritten; in every other case, including any decode problem, the frame
//! is returned exactly as received.

use crate::command::{Action, Command, Params, UploadParams};
use crate::markup::{file_markup, rewrite_markup, rewrite_segments};
use crate::resolver::MediaResolver;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Rewrites media references in outbound commands.
pub struct Interceptor<R> {
    resolver: R,
}

impl<R: MediaResolver> Interceptor<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Return the frame to forward in place of `raw`.
    pub async fn intercept(&self, raw: String) -> String {
        let Some(command) = Command::parse(&raw) else {
            return raw;
        };

        let rewritten = match command.params() {
            Params::Message { action, fields } => self.rewrite_message(&command, action, fields).await,
            Params::Upload { action, upload } => self.rewrite_upload(&command, action, upload).await,
            Params::Opaque => None,
        };

        rewritten.unwrap_or(raw)
    }

    async fn rewrite_message(
        &self,
        command: &Command,
        action: Action,
        mut fields: Map<String, Value>,
    ) -> Option<String> {
        let message = match fields.get_mut("message")? {
            Value::String(text) => {
                let rewritten = rewrite_markup(text, &self.resolver).await;
                if rewritten == *text {
                    return None;
                }
                Value::String(rewritten)
            }
            Value::Array(segments) => {
                if !rewrite_segments(segments, &self.resolver).await {
                    return None;
                }
                Value::Array(std::mem::take(segments))
            }
            _ => return None,
        };
        fields.insert("message".into(), message);

        debug!(action = action.name(), "rewrote media in message");
        serialize(command, action, &Value::Object(fields))
    }

    async fn rewrite_upload(
        &self,
        command: &Command,
        action: Action,
        upload: UploadParams,
    ) -> Option<String> {
        if upload.file.is_empty() {
            return None;
        }
        let suggested = upload.name.as_deref().unwrap_or_default();
        let resolved = self.resolver.resolve(&upload.file, suggested).await.ok()?;

        if let Some(local_path) = &resolved.local_path {
            info!(action = action.name(), local_path = %local_path, "rewrote upload to stored path");
            let params = upload.to_upload_params(action, local_path, &resolved.name);
            return serialize(command, action, &params);
        }

        // An upload action cannot take a URL as its source; send a file
        // segment in a message instead.
        let remote = resolved.remote_url.as_deref()?;
        let downgraded = action.message_action();
        info!(
            from = action.name(),
            to = downgraded.name(),
            url = %remote,
            "downgraded upload to file message"
        );
        let params = upload.to_message_params(downgraded, file_markup(remote, &resolved.name));
        serialize(command, downgraded, &params)
    }
}

fn serialize(command: &Command, action: Action, params: &Value) -> Option<String> {
    match command.rebuild(action, params) {
        Ok(out) => Some(out),
        Err(e) => {
            warn!(action = action.name(), error = %e, "failed to serialize rewritten command");
            None
        }
    }
}
