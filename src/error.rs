//! Error types for the masking pipeline

use thiserror::Error;

/// Failures that abort a request and surface as a 502 to the client.
///
/// Per-URL transform failures never reach this type: the transformer is
/// fail-soft and leaves the candidate string unmodified instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("origin fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("invalid request URL: {0}")]
    RequestUrl(#[from] url::ParseError),

    #[error("failed to read request body: {0}")]
    RequestBody(#[from] hyper::Error),

    #[error("failed to build response: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("html rewrite failed: {0}")]
    Rewrite(String),
}
