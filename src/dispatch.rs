//! Content classification and per-response dispatch
//! One branch per response, decided from the declared content-type only

use hyper::StatusCode;

/// Content class of an origin response, derived once from its
/// `content-type` header. Unrecognized or missing types fall through to
/// `Binary` and pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Html,
    Css,
    JavaScript,
    Json,
    Image,
    Binary,
}

impl ContentClass {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return Self::Binary;
        };
        let content_type = content_type.to_ascii_lowercase();

        if content_type.contains("application/json") {
            Self::Json
        } else if content_type.contains("text/css") {
            Self::Css
        } else if content_type.contains("javascript") {
            Self::JavaScript
        } else if content_type.starts_with("image/") {
            Self::Image
        } else if content_type.contains("text/html") {
            Self::Html
        } else {
            Self::Binary
        }
    }
}

/// The single rewrite branch chosen for an origin response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewritePlan {
    /// Forward status, headers, and bytes untouched. Covers images, other
    /// binary content, and non-success upstream responses.
    Passthrough,
    Html,
    Css,
    JavaScript,
    Json,
}

/// Decide the branch for a response. Non-success upstream responses are
/// never rewritten; they surface to the client as-is.
pub fn plan(status: StatusCode, content_type: Option<&str>) -> RewritePlan {
    if !status.is_success() {
        return RewritePlan::Passthrough;
    }

    match ContentClass::from_content_type(content_type) {
        ContentClass::Json => RewritePlan::Json,
        ContentClass::Css => RewritePlan::Css,
        ContentClass::JavaScript => RewritePlan::JavaScript,
        ContentClass::Image | ContentClass::Binary => RewritePlan::Passthrough,
        ContentClass::Html => RewritePlan::Html,
    }
}
