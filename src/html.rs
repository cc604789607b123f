//! Streaming HTML rewriting
//! Single forward pass over the token stream via lol_html; matched nodes
//! are mutated in place and the document is never buffered whole

use crate::context::HostContext;
use crate::text::{self, ScriptPatterns};
use crate::transform;
use lol_html::errors::RewritingError;
use lol_html::html_content::{ContentType, Element};
use lol_html::{doc_comments, element, text as text_chunk, HtmlRewriter, Settings};
use percent_encoding::percent_decode_str;
use tracing::debug;
use url::Url;

/// Third-party analytics hosts whose link/script tags are dropped outright
/// rather than rewritten. Overridable from configuration.
pub const DEFAULT_STRIP_DOMAINS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "hotjar.com",
    "segment.io",
];

/// Content rewriter for HTML documents.
///
/// Holds the per-request context plus the compiled script patterns, and
/// hands out [`HtmlRewriter`] instances wired with the full handler set:
/// wildcard href/content attributes, comment stripping, text substitution,
/// img srcset handling, meta/link forcing, script src/text rewriting, and
/// ld+json removal.
pub struct DocumentRewriter {
    ctx: HostContext,
    strip_domains: Vec<String>,
    patterns: ScriptPatterns,
}

impl DocumentRewriter {
    pub fn new(ctx: HostContext, strip_domains: Vec<String>) -> Self {
        let patterns = ScriptPatterns::new(ctx.masked_host());
        Self {
            ctx,
            strip_domains,
            patterns,
        }
    }

    /// Build a streaming rewriter that pushes rewritten bytes into `sink`.
    /// Feed it chunks with `write` and finish with `end`.
    pub fn stream<S: FnMut(&[u8])>(&self, sink: S) -> HtmlRewriter<'_, S> {
        HtmlRewriter::new(self.settings(), sink)
    }

    /// Buffered variant for small documents and tests.
    pub fn rewrite(&self, input: &[u8]) -> Result<Vec<u8>, RewritingError> {
        let mut out = Vec::with_capacity(input.len());
        let mut rewriter = self.stream(|chunk: &[u8]| out.extend_from_slice(chunk));
        rewriter.write(input)?;
        rewriter.end()?;
        Ok(out)
    }

    fn settings(&self) -> Settings<'_, '_> {
        let ctx = &self.ctx;
        let patterns = &self.patterns;
        let strip_domains = &self.strip_domains;

        Settings {
            element_content_handlers: vec![
                // Wildcard rule: href/content on every element, plus text
                // nodes anywhere in the document.
                element!("*", move |el| {
                    rewrite_generic_attributes(el, ctx);
                    Ok(())
                }),
                text_chunk!("*", move |chunk| {
                    let replaced = text::substitute_origin_then_host(chunk.as_str(), ctx);
                    if replaced != chunk.as_str() {
                        chunk.replace(&replaced, ContentType::Text);
                    }
                    Ok(())
                }),
                element!("img", move |el| {
                    rewrite_img_attributes(el, ctx)?;
                    Ok(())
                }),
                element!("meta", move |el| {
                    if let Some(content) = el.get_attribute("content") {
                        let decision = transform::decide(&content, ctx);
                        if decision.changed {
                            el.set_attribute("content", &decision.rewritten)?;
                        }
                    }
                    // These must reflect the public-facing address exactly,
                    // not a best-effort substitution.
                    let property = el.get_attribute("property");
                    if matches!(property.as_deref(), Some("og:url") | Some("twitter:url")) {
                        el.set_attribute("content", ctx.request_url())?;
                    }
                    Ok(())
                }),
                element!("link", move |el| {
                    rewrite_link(el, ctx, strip_domains)?;
                    Ok(())
                }),
                // Structured data tied to the masked identity is dropped,
                // not rewritten; partial rewriting of it is unreliable.
                element!("script[type=\"application/ld+json\"]", |el| {
                    el.remove();
                    Ok(())
                }),
                element!("script", move |el| {
                    rewrite_script_element(el, ctx, strip_domains)?;
                    Ok(())
                }),
                text_chunk!("script", move |chunk| {
                    let replaced = text::rewrite_script_text(chunk.as_str(), ctx, patterns);
                    if replaced != chunk.as_str() {
                        chunk.replace(&replaced, ContentType::Html);
                    }
                    Ok(())
                }),
                text_chunk!("noscript", move |chunk| {
                    let replaced = text::substitute_origin_then_host(chunk.as_str(), ctx);
                    if replaced != chunk.as_str() {
                        chunk.replace(&replaced, ContentType::Text);
                    }
                    Ok(())
                }),
            ],
            // Comments may leak internal markup mentioning the masked host;
            // they are removed unconditionally.
            document_content_handlers: vec![doc_comments!(|comment| {
                comment.remove();
                Ok(())
            })],
            ..Settings::default()
        }
    }
}

fn rewrite_generic_attributes(el: &mut Element, ctx: &HostContext) {
    for attr in ["href", "content"] {
        let Some(value) = el.get_attribute(attr) else {
            continue;
        };
        if !value.contains(ctx.masked_host()) {
            continue;
        }

        let decision = transform::decide(&value, ctx);
        if decision.changed {
            if let Err(e) = el.set_attribute(attr, &decision.rewritten) {
                // A bad attribute must never abort the stream.
                debug!("skipping {} rewrite: {}", attr, e);
            }
        }
    }
}

fn rewrite_img_attributes(
    el: &mut Element,
    ctx: &HostContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for attr in ["src", "srcset", "data-src", "data-srcset"] {
        let Some(value) = el.get_attribute(attr) else {
            continue;
        };

        if attr.ends_with("srcset") {
            el.set_attribute(attr, &rewrite_srcset(&value, ctx))?;
        } else {
            let decoded = percent_decode(&value);
            if decoded.contains(ctx.masked_host()) {
                el.set_attribute(attr, &transform::transform(&decoded, ctx))?;
            }
        }
    }
    Ok(())
}

/// Split a srcset value into `url descriptor` pairs, percent-decode and
/// rewrite each URL that mentions the masked host, and rejoin the pairs
/// with the canonical `", "` separator.
fn rewrite_srcset(value: &str, ctx: &HostContext) -> String {
    value
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            let mut parts = entry.splitn(2, char::is_whitespace);
            let url = parts.next().unwrap_or_default();
            let descriptor = parts.next().unwrap_or_default().trim();

            let decoded = percent_decode(url);
            let rewritten = if decoded.contains(ctx.masked_host()) {
                transform::transform(&decoded, ctx)
            } else {
                decoded
            };

            if descriptor.is_empty() {
                rewritten
            } else {
                format!("{} {}", rewritten, descriptor)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn rewrite_link(
    el: &mut Element,
    ctx: &HostContext,
    strip_domains: &[String],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Strip-list removal wins over every other link rule.
    if let Some(href) = el.get_attribute("href") {
        if matches_strip_list(&href, strip_domains) {
            el.remove();
            return Ok(());
        }
    }

    if el.get_attribute("rel").as_deref() == Some("canonical") {
        el.set_attribute("href", ctx.request_url())?;
    }

    if let Some(href) = el.get_attribute("href") {
        if href.contains(ctx.masked_host()) {
            let decoded = percent_decode(&href);
            let rewritten = decoded.replace(&ctx.masked_origin(), &ctx.request_origin());
            el.set_attribute("href", &rewritten)?;
        }
    }
    Ok(())
}

fn rewrite_script_element(
    el: &mut Element,
    ctx: &HostContext,
    strip_domains: &[String],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(src) = el.get_attribute("src") {
        if matches_strip_list(&src, strip_domains) {
            el.remove();
            return Ok(());
        }
        if src.contains(ctx.masked_host()) {
            let decision = transform::decide(&src, ctx);
            if decision.changed {
                el.set_attribute("src", &decision.rewritten)?;
            }
        }
    }
    Ok(())
}

/// Whether a URL points at one of the suppressed analytics domains.
fn matches_strip_list(candidate: &str, strip_domains: &[String]) -> bool {
    let Ok(url) = Url::parse(candidate) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };

    strip_domains
        .iter()
        .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)))
}

/// Percent-decode a value, falling back to the original on invalid UTF-8.
fn percent_decode(value: &str) -> String {
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| value.to_string())
}
