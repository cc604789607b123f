//! Integration tests for Hostmask
//!
//! Runs the full proxy against a wiremock origin and checks:
//! - HTML, CSS, and JSON rewriting end to end
//! - binary and upstream-error passthrough
//! - identity headers sent to the origin
//! - robots.txt and the host allow-list

use futures_util::StreamExt;
use hostmask::html::DEFAULT_STRIP_DOMAINS;
use hostmask::{MaskServer, ProxyConfig};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19300);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Start a proxy fronting `mask_base`, answering for `localhost`.
async fn start_proxy(mask_base: &str, port: u16) -> Arc<MaskServer> {
    let config = ProxyConfig {
        port,
        mask_base: Url::parse(mask_base).unwrap(),
        allowed_domains: vec!["localhost".to_string()],
        strip_domains: DEFAULT_STRIP_DOMAINS.iter().map(|s| s.to_string()).collect(),
    };

    let server = Arc::new(MaskServer::new(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });

    // Wait for the server to start
    sleep(Duration::from_millis(100)).await;

    server
}

#[tokio::test]
async fn test_robots_txt() {
    let origin = MockServer::start().await;
    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/robots.txt", proxy_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response
            .headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("public, max-age=86400")
    );
    assert_eq!(response.text().await.unwrap(), "User-agent: *\nDisallow: /");
}

#[tokio::test]
async fn test_unlisted_host_403() {
    let origin = MockServer::start().await;
    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    // default Host header is 127.0.0.1, which is not allow-listed
    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/", proxy_port))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 403);
    assert_eq!(response.text().await.unwrap(), "Not allowed");
}

#[tokio::test]
async fn test_html_rewritten_end_to_end() {
    let origin = MockServer::start().await;

    let html = concat!(
        "<!doctype html><html><head>",
        "<!-- internal build 42 -->",
        r#"<meta property="og:url" content="http://127.0.0.1/stale">"#,
        r#"<link rel="canonical" href="http://127.0.0.1/old">"#,
        "</head><body>",
        r#"<a href="http://127.0.0.1/about">About</a>"#,
        r#"<img srcset="http://127.0.0.1/a.jpg 1x, http://127.0.0.1/b.jpg 2x">"#,
        r#"<script>var u = "http:\/\/127.0.0.1\/api";</script>"#,
        "</body></html>"
    );

    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/html; charset=utf-8"))
        .mount(&origin)
        .await;

    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/page", proxy_port))
        .header("Host", "localhost")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-robots-tag")
            .and_then(|v| v.to_str().ok()),
        Some("noindex, nofollow")
    );

    let body = response.text().await.unwrap();

    assert!(body.contains(r#"href="http://localhost/about""#));
    assert!(body.contains(r#"content="http://localhost/page""#));
    assert!(body.contains(r#"rel="canonical" href="http://localhost/page""#));
    assert!(body.contains("http://localhost/a.jpg 1x, http://localhost/b.jpg 2x"));
    assert!(body.contains(r"http:\/\/localhost\/api"));
    assert!(!body.contains("internal build 42"));
    assert!(!body.contains("127.0.0.1"));
}

#[tokio::test]
async fn test_localhost_port_propagated() {
    let origin = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/p"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"<a href="http://127.0.0.1/x">x</a>"#, "text/html"),
        )
        .mount(&origin)
        .await;

    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/p", proxy_port))
        .header("Host", format!("localhost:{}", proxy_port))
        .send()
        .await
        .unwrap();

    let body = response.text().await.unwrap();
    assert!(body.contains(&format!(r#"href="http://localhost:{}/x""#, proxy_port)));
}

#[tokio::test]
async fn test_css_rewritten() {
    let origin = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/style.css"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "a{background:url('http://127.0.0.1/i.png')}",
            "text/css",
        ))
        .mount(&origin)
        .await;

    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/style.css", proxy_port))
        .header("Host", "localhost")
        .send()
        .await
        .unwrap();

    assert_eq!(
        response.text().await.unwrap(),
        "a{background:url(\"http://localhost/i.png\")}"
    );
}

#[tokio::test]
async fn test_json_rewritten() {
    let origin = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/info"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"url":"http://127.0.0.1/api","host":"127.0.0.1"}"#,
            "application/json",
        ))
        .mount(&origin)
        .await;

    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/api/info", proxy_port))
        .header("Host", "localhost")
        .send()
        .await
        .unwrap();

    assert_eq!(
        response.text().await.unwrap(),
        r#"{"url":"http://localhost/api","host":"localhost"}"#
    );
}

#[tokio::test]
async fn test_binary_passthrough_untouched() {
    let origin = MockServer::start().await;

    // fake png whose bytes happen to contain the masked host
    let mut payload = vec![0x89, b'P', b'N', b'G'];
    payload.extend_from_slice(b"http://127.0.0.1/leak");

    Mock::given(method("GET"))
        .and(path("/logo.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(payload.clone(), "image/png"))
        .mount(&origin)
        .await;

    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/logo.png", proxy_port))
        .header("Host", "localhost")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), payload.as_slice());
}

#[tokio::test]
async fn test_upstream_error_forwarded_unrewritten() {
    let origin = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_raw("<p>not found at http://127.0.0.1/missing</p>", "text/html"),
        )
        .mount(&origin)
        .await;

    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/missing", proxy_port))
        .header("Host", "localhost")
        .send()
        .await
        .unwrap();

    // error bodies surface as-is, never rewritten
    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(
        response.text().await.unwrap(),
        "<p>not found at http://127.0.0.1/missing</p>"
    );
}

#[tokio::test]
async fn test_origin_sees_masked_identity_headers() {
    let origin = MockServer::start().await;

    // the mock only answers when Referer and Origin point at the masked host
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("referer", "http://127.0.0.1"))
        .and(header("origin", "http://127.0.0.1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("ok", "text/plain"))
        .mount(&origin)
        .await;

    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/", proxy_port))
        .header("Host", "localhost")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_query_string_forwarded() {
    let origin = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "mask"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("found", "text/plain"))
        .mount(&origin)
        .await;

    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&origin.uri(), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/search?q=mask", proxy_port))
        .header("Host", "localhost")
        .send()
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "found");
}

#[tokio::test]
async fn test_client_disconnect_releases_origin_connection() {
    // Raw TCP origin streaming an endless HTML body; it signals once the
    // proxy drops the connection.
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_port = origin_listener.local_addr().unwrap().port();
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = origin_listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await;

        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\n\r\n";
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        loop {
            if socket.write_all(b"<p>more of the endless page</p>").await.is_err() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        let _ = closed_tx.send(());
    });

    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&format!("http://127.0.0.1:{}", origin_port), proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/endless", proxy_port))
        .header("Host", "localhost")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // Read one chunk, then walk away from the rest of the body.
    let mut body = response.bytes_stream();
    let _ = body.next().await;
    drop(body);

    // The proxy must stop pulling from the origin shortly after.
    timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("proxy kept the origin connection open after client disconnect")
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_origin_502() {
    // no server on this port
    let dead_origin = format!("http://127.0.0.1:{}", get_unique_port());
    let proxy_port = get_unique_port();
    let _proxy = start_proxy(&dead_origin, proxy_port).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/", proxy_port))
        .header("Host", "localhost")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
    assert!(response
        .text()
        .await
        .unwrap()
        .starts_with("Failed to fetch content"));
}
