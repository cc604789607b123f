//! Masking proxy server
//! Accepts requests on the public hostname, fetches the origin with
//! rewritten identity headers, and pipes bodies through the content rewriters

use crate::context::HostContext;
use crate::dispatch::{self, RewritePlan};
use crate::error::ProxyError;
use crate::html::DocumentRewriter;
use crate::text;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Origins expect a browser; a proxy User-Agent tends to get blocked.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Bounded channel depth for the streaming HTML pipe. Small on purpose:
/// a slow client should stall the origin fetch, not grow a buffer.
const REWRITE_CHANNEL_DEPTH: usize = 16;

/// Proxy server configuration
#[derive(Clone)]
pub struct ProxyConfig {
    pub port: u16,
    /// Base URL of the origin site being masked.
    pub mask_base: Url,
    /// Public hostnames the proxy answers for; anything else gets a 403.
    pub allowed_domains: Vec<String>,
    /// Analytics domains whose link/script tags are stripped from HTML.
    pub strip_domains: Vec<String>,
}

/// Masking proxy server
pub struct MaskServer {
    config: ProxyConfig,
    client: reqwest::Client,
}

impl MaskServer {
    /// Create a new server with a shared origin-facing HTTP client.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self { config, client })
    }

    /// Start the accept loop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port).parse()?;
        let listener = TcpListener::bind(addr).await?;

        info!("Masking proxy listening on {}", addr);
        info!("Fronting origin {}", self.config.mask_base);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let server = self.clone();

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        debug!("{} {} from {}", req.method(), req.uri().path(), remote_addr);

        let mut response = match self.process_request(req).await {
            Ok(response) => response,
            Err(e) => {
                error!("request failed: {}", e);
                Self::text_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("Failed to fetch content: {}", e),
                )
            }
        };

        // Keep the public mirror out of search indexes.
        response.headers_mut().insert(
            HeaderName::from_static("x-robots-tag"),
            HeaderValue::from_static("noindex, nofollow"),
        );

        Ok(response)
    }

    async fn process_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let path = req.uri().path().to_string();

        if req.method() == Method::GET && path == "/robots.txt" {
            return Ok(Self::robots_response());
        }

        let host_header = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        let host_header = match host_header {
            Some(h) => h,
            None => {
                return Ok(Self::text_response(
                    StatusCode::BAD_REQUEST,
                    "Missing Host header",
                ))
            }
        };
        let hostname = host_header.split(':').next().unwrap_or(&host_header);

        if !self.config.allowed_domains.iter().any(|d| d == hostname) {
            warn!("rejecting request for unlisted host {}", hostname);
            return Ok(Self::text_response(StatusCode::FORBIDDEN, "Not allowed"));
        }

        let scheme = if Self::is_forwarded_https(&req) {
            "https"
        } else {
            "http"
        };
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let request_url: Url = format!("{}://{}{}", scheme, host_header, path_and_query).parse()?;

        let ctx = HostContext::new(&self.config.mask_base, request_url);
        debug!("masking {} -> {}", ctx.request_base(), ctx.masked_base());

        let upstream = self.fetch_origin(req, &ctx).await?;
        self.dispatch_response(upstream, ctx).await
    }

    /// Fetch the origin resource with identity headers pointing at the
    /// masked host; the client's own Host header is never forwarded.
    async fn fetch_origin(
        &self,
        req: Request<Incoming>,
        ctx: &HostContext,
    ) -> Result<reqwest::Response, ProxyError> {
        let (parts, body) = req.into_parts();
        let body_bytes = body.collect().await?.to_bytes();

        let masked_host = match ctx.masked_base().port() {
            Some(port) => format!("{}:{}", ctx.masked_host(), port),
            None => ctx.masked_host().to_string(),
        };

        let response = self
            .client
            .request(parts.method, ctx.masked_base().clone())
            .header(header::USER_AGENT, BROWSER_USER_AGENT)
            .header(header::HOST, masked_host)
            .header(header::ORIGIN, ctx.masked_origin())
            .header(header::REFERER, ctx.masked_origin())
            // rewriting needs uncompressed bodies
            .header(header::ACCEPT_ENCODING, "identity")
            .body(body_bytes)
            .send()
            .await?;

        Ok(response)
    }

    /// Select exactly one branch per response based on status and declared
    /// content type, then re-emit the body through the matching rewriter.
    async fn dispatch_response(
        &self,
        upstream: reqwest::Response,
        ctx: HostContext,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let status = upstream.status();
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let plan = dispatch::plan(status, content_type.as_deref());
        debug!(
            "origin responded {} ({}) -> {:?}",
            status,
            content_type.as_deref().unwrap_or("-"),
            plan
        );

        match plan {
            RewritePlan::Passthrough => Self::passthrough_response(upstream),
            RewritePlan::Html => self.html_response(upstream, ctx),
            RewritePlan::Css | RewritePlan::JavaScript | RewritePlan::Json => {
                let headers = upstream.headers().clone();
                let body = upstream.text().await?;
                let rewritten = match plan {
                    RewritePlan::Css => text::rewrite_css(&body, &ctx),
                    RewritePlan::JavaScript => text::rewrite_js(&body, &ctx),
                    _ => text::rewrite_json(&body, &ctx),
                };
                Self::buffered_response(status, &headers, rewritten)
            }
        }
    }

    /// Forward the origin response untouched, streaming the bytes through.
    fn passthrough_response(
        upstream: reqwest::Response,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let status = upstream.status();
        let headers = upstream.headers().clone();

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }

        let stream = upstream
            .bytes_stream()
            .map(|chunk| chunk.map(Frame::data).map_err(|e| Box::new(e) as BoxError));

        Ok(builder.body(StreamBody::new(stream).boxed_unsync())?)
    }

    /// Re-emit a rewritten text body under the origin's headers, dropping
    /// the ones invalidated by the new body length.
    fn buffered_response(
        status: StatusCode,
        headers: &HeaderMap,
        body: String,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            if !is_hop_by_hop(name) && !is_body_shape_header(name) {
                builder = builder.header(name, value);
            }
        }

        Ok(builder.body(Self::full_body(Bytes::from(body)))?)
    }

    /// Pipe an HTML body through the streaming rewriter without ever
    /// holding the whole document. The lol_html rewriter is not Send, so it
    /// lives on the blocking pool, fed and drained through bounded channels;
    /// a slow client stalls the pipe end to end instead of growing a buffer.
    fn html_response(
        &self,
        upstream: reqwest::Response,
        ctx: HostContext,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let status = upstream.status();
        let headers = upstream.headers().clone();
        let strip_domains = self.config.strip_domains.clone();

        let (chunk_tx, mut chunk_rx) =
            mpsc::channel::<Result<Bytes, reqwest::Error>>(REWRITE_CHANNEL_DEPTH);
        let (out_tx, out_rx) = mpsc::channel::<Result<Bytes, BoxError>>(REWRITE_CHANNEL_DEPTH);

        let mut byte_stream = upstream.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = byte_stream.next().await {
                if chunk_tx.send(chunk).await.is_err() {
                    // rewriter stopped, client likely disconnected
                    break;
                }
            }
        });

        tokio::task::spawn_blocking(move || {
            let rewriter = DocumentRewriter::new(ctx, strip_domains);
            let client_gone = Arc::new(AtomicBool::new(false));
            let sink = out_tx.clone();
            let sink_gone = client_gone.clone();
            let mut writer = rewriter.stream(move |chunk: &[u8]| {
                if sink.blocking_send(Ok(Bytes::copy_from_slice(chunk))).is_err() {
                    // receiver dropped, the client is gone
                    sink_gone.store(true, Ordering::Relaxed);
                }
            });

            while let Some(chunk) = chunk_rx.blocking_recv() {
                // Stop rewriting and drop the origin stream as soon as the
                // client stops consuming; there is nobody left to serve.
                if client_gone.load(Ordering::Relaxed) {
                    debug!("client disconnected, abandoning html rewrite");
                    return;
                }
                let result = match chunk {
                    Ok(bytes) => writer.write(&bytes).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(message) = result {
                    error!("html rewrite aborted: {}", message);
                    let _ = out_tx.blocking_send(Err(Box::new(ProxyError::Rewrite(message)) as BoxError));
                    return;
                }
            }

            if let Err(e) = writer.end() {
                error!("html rewrite failed to finish: {}", e);
                let _ = out_tx
                    .blocking_send(Err(Box::new(ProxyError::Rewrite(e.to_string())) as BoxError));
            }
        });

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if !is_hop_by_hop(name) && !is_body_shape_header(name) {
                builder = builder.header(name, value);
            }
        }

        Ok(builder.body(Self::channel_body(out_rx))?)
    }

    /// Heuristic for requests that arrived over TLS at an outer proxy.
    fn is_forwarded_https<T>(req: &Request<T>) -> bool {
        let header_is = |name: &str, expected: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v == expected)
                .unwrap_or(false)
        };

        header_is("x-forwarded-proto", "https")
            || header_is("x-forwarded-ssl", "on")
            || header_is("front-end-https", "on")
    }

    fn robots_response() -> Response<ProxyBody> {
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CACHE_CONTROL, "public, max-age=86400")
            .body(Self::full_body(Bytes::from_static(
                b"User-agent: *\nDisallow: /",
            )))
            .unwrap()
    }

    fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Self::full_body(Bytes::from(body.to_string())))
            .unwrap()
    }

    fn full_body(bytes: Bytes) -> ProxyBody {
        Full::new(bytes)
            .map_err(|never| match never {})
            .boxed_unsync()
    }

    fn channel_body(rx: mpsc::Receiver<Result<Bytes, BoxError>>) -> ProxyBody {
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item.map(Frame::data), rx))
        });

        StreamBody::new(stream).boxed_unsync()
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

/// Headers invalidated when a rewriter changes the body length.
fn is_body_shape_header(name: &HeaderName) -> bool {
    matches!(name.as_str(), "content-length" | "content-encoding")
}
