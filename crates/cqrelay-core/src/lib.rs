//! cqrelay-core: protocol library for the cqrelay OneBot relay.
//!
//! Provides the OneBot command model, CQ code scanning and rewriting, media
//! reference classification, the upload-backed resolver and the outbound
//! command interceptor.

pub mod command;
pub mod error;
pub mod intercept;
pub mod markup;
pub mod media;
pub mod resolver;

// Re-export commonly used items at crate root.
pub use command::{Action, ChatId, Command, Params, UploadParams};
pub use error::{RelayError, RelayResult, ResolveError};
pub use intercept::Interceptor;
pub use markup::{escape_value, file_markup, rewrite_markup, unescape_value, CqSegment};
pub use media::{MediaReference, ResolvedMedia};
pub use resolver::{MediaResolver, UploadResolver};
