//! Per-request host context
//! Pairs the masked origin URL with the public request URL

use url::Url;

/// Immutable masked/request URL pair, built once per inbound request.
///
/// The masked base mirrors the request's path and query so the outbound
/// fetch hits the same resource on the origin. The context is passed by
/// reference through every rewrite call and never mutated, so concurrent
/// requests never contend on shared state.
#[derive(Debug, Clone)]
pub struct HostContext {
    masked_base: Url,
    request_base: Url,
}

impl HostContext {
    /// Build a context from the configured mask base and the URL the
    /// client actually requested.
    pub fn new(mask_base: &Url, request_url: Url) -> Self {
        let mut masked_base = mask_base.clone();
        masked_base.set_path(request_url.path());
        masked_base.set_query(request_url.query());

        Self {
            masked_base,
            request_base: request_url,
        }
    }

    /// The origin URL the outbound fetch should hit.
    pub fn masked_base(&self) -> &Url {
        &self.masked_base
    }

    /// The URL the client used to reach the proxy.
    pub fn request_base(&self) -> &Url {
        &self.request_base
    }

    /// Hostname of the masked origin.
    pub fn masked_host(&self) -> &str {
        self.masked_base.host_str().unwrap_or_default()
    }

    /// Hostname the client addressed.
    pub fn request_host(&self) -> &str {
        self.request_base.host_str().unwrap_or_default()
    }

    /// `scheme://hostname` of the masked origin, without port or path.
    /// This is the string that must never leak into client-visible output.
    pub fn masked_origin(&self) -> String {
        format!("{}://{}", self.masked_base.scheme(), self.masked_host())
    }

    /// `scheme://host` of the request, including an explicit port when the
    /// client used a non-default one.
    pub fn request_origin(&self) -> String {
        match self.request_base.port() {
            Some(port) => format!(
                "{}://{}:{}",
                self.request_base.scheme(),
                self.request_host(),
                port
            ),
            None => format!("{}://{}", self.request_base.scheme(), self.request_host()),
        }
    }

    /// The full request URL, used verbatim for canonical/og:url forcing.
    pub fn request_url(&self) -> &str {
        self.request_base.as_str()
    }
}
