//! Hostmask - a host-masking reverse proxy
//!
//! Fronts an origin site behind a different public hostname and rewrites
//! every reference to the origin host in proxied content, so the site
//! appears natively hosted at the public domain:
//! - Streaming HTML rewriting (attributes, text, srcset, meta/link/script)
//! - CSS `url()` literals
//! - JavaScript/JSON hostname substitution, escaped and raw
//! - Content-type driven dispatch with untouched binary passthrough

pub mod context;
pub mod dispatch;
pub mod error;
pub mod html;
pub mod proxy;
pub mod text;
pub mod transform;

pub use context::HostContext;
pub use dispatch::{ContentClass, RewritePlan};
pub use error::ProxyError;
pub use html::DocumentRewriter;
pub use proxy::{MaskServer, ProxyConfig};
