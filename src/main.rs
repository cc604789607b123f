//! Hostmask - Main entry point
//!
//! A reverse proxy that masks an origin site behind a public hostname and
//! rewrites origin references out of the proxied content.

use anyhow::Result;
use clap::Parser;
use hostmask::html::DEFAULT_STRIP_DOMAINS;
use hostmask::{MaskServer, ProxyConfig};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

/// Hostmask - a host-masking reverse proxy
#[derive(Parser, Debug)]
#[command(name = "hostmask")]
#[command(version = "1.0.0")]
#[command(about = "Serves an origin site under a different public hostname")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8787")]
    port: u16,

    /// Base URL of the origin site to mask (e.g. https://origin.internal)
    #[arg(long, env = "MASK_DOMAIN")]
    mask_url: Url,

    /// Comma-separated public hostnames the proxy answers for.
    /// Required: an empty allow-list would reject every request.
    #[arg(long, env = "ALLOWED_DOMAINS", value_delimiter = ',', required = true)]
    allowed_domains: Vec<String>,

    /// Comma-separated analytics domains stripped from HTML
    /// (defaults to a built-in list when omitted)
    #[arg(long, env = "STRIP_DOMAINS", value_delimiter = ',')]
    strip_domains: Vec<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let strip_domains = if args.strip_domains.is_empty() {
        DEFAULT_STRIP_DOMAINS.iter().map(|s| s.to_string()).collect()
    } else {
        args.strip_domains
    };

    let config = ProxyConfig {
        port: args.port,
        mask_base: args.mask_url,
        allowed_domains: args.allowed_domains,
        strip_domains,
    };

    info!("Starting Hostmask v1.0.0");
    info!("Masking origin: {}", config.mask_base);
    info!("Allowed domains: {}", config.allowed_domains.join(", "));

    let server = Arc::new(MaskServer::new(config)?);
    server.run().await?;

    Ok(())
}
