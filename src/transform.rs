//! URL transformation between the masked origin and the public request host

use crate::context::HostContext;
use tracing::debug;
use url::Url;

/// How a candidate string resolves to an absolute URL before the hostname
/// comparison. Only root-relative, protocol-relative, and absolute http(s)
/// forms are eligible for rewriting; everything else passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    DataUri,
    RootRelative,
    ProtocolRelative,
    Absolute,
    Opaque,
}

/// Classify a candidate string found in a document.
pub fn classify(candidate: &str) -> UrlKind {
    if candidate.starts_with("data:") {
        UrlKind::DataUri
    } else if candidate.starts_with("//") {
        UrlKind::ProtocolRelative
    } else if candidate.starts_with('/') {
        UrlKind::RootRelative
    } else if candidate.starts_with("http://") || candidate.starts_with("https://") {
        UrlKind::Absolute
    } else {
        // mailto:, tel:, fragments, and relative-sibling paths stay untouched
        UrlKind::Opaque
    }
}

/// Outcome of a single transform attempt; `changed` gates whether the
/// caller mutates the underlying attribute or node at all.
#[derive(Debug, Clone)]
pub struct RewriteDecision {
    pub rewritten: String,
    pub changed: bool,
}

/// Run [`transform`] and record whether anything changed.
pub fn decide(candidate: &str, ctx: &HostContext) -> RewriteDecision {
    let rewritten = transform(candidate, ctx);
    RewriteDecision {
        changed: rewritten != candidate,
        rewritten,
    }
}

/// Remap a candidate URL from the masked host to the request host.
///
/// Never fails the caller: on any parse error the candidate is returned
/// unchanged, since rewriting is best-effort cosmetic masking. URLs whose
/// hostname is not the masked host are returned unchanged, which also makes
/// the function idempotent on its own output.
pub fn transform(candidate: &str, ctx: &HostContext) -> String {
    match try_transform(candidate, ctx) {
        Ok(Some(rewritten)) => rewritten,
        Ok(None) => candidate.to_string(),
        Err(e) => {
            debug!("leaving unparseable URL untouched: {}: {}", candidate, e);
            candidate.to_string()
        }
    }
}

fn try_transform(candidate: &str, ctx: &HostContext) -> Result<Option<String>, url::ParseError> {
    let absolute = match classify(candidate) {
        UrlKind::DataUri | UrlKind::Opaque => return Ok(None),
        UrlKind::ProtocolRelative => format!("https:{}", candidate),
        UrlKind::RootRelative => format!("{}{}", ctx.masked_origin(), candidate),
        UrlKind::Absolute => candidate.to_string(),
    };

    let mut url = Url::parse(&absolute)?;

    // Third-party URLs must survive untouched.
    if url.host_str() != Some(ctx.masked_host()) {
        return Ok(None);
    }

    url.set_host(Some(ctx.request_host()))?;

    // Development proxies run on a scheme/port the production origin never
    // uses, so localhost carries both over from the request URL.
    if ctx.request_host() == "localhost" {
        let _ = url.set_scheme(ctx.request_base().scheme());
        let _ = url.set_port(ctx.request_base().port());
    }

    Ok(Some(url.into()))
}
