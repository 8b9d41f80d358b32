// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Dulus: range pool management for Ludus
//!
//! Serves scenario, topology and pool folders from disk and fans pool
//! operations out to the Ludus API, one request per pool user.

mod api;
mod config;
mod ctfd;
mod ludus;
mod pools;
mod proxmox;
mod store;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Dulus: Ludus range pool management
#[derive(Parser)]
#[command(name = "dulus", version, about = "Range pool management for Ludus")]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, default_value = config::CONFIG_PATH)]
    config: PathBuf,

    /// Port to listen on; overrides the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address; overrides the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// TLS certificate path (PEM). Auto-detected from Proxmox or Ludus if not set.
    #[arg(long)]
    tls_cert: Option<String>,

    /// TLS private key path (PEM)
    #[arg(long)]
    tls_key: Option<String>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

/// First certificate pair on disk: the Proxmox node cert, then the Ludus one
fn find_tls_certificate(node: &str) -> Option<(String, String)> {
    let candidates = [
        (
            format!("/etc/pve/nodes/{}/pve-ssl.pem", node),
            format!("/etc/pve/nodes/{}/pve-ssl.key", node),
        ),
        ("/opt/ludus/cert.pem".to_string(), "/opt/ludus/key.pem".to_string()),
    ];
    candidates
        .into_iter()
        .find(|(cert, key)| Path::new(cert).exists() && Path::new(key).exists())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dulus=info".parse().unwrap())
                .add_directive("actix_web=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = config::Config::load(&cli.config);
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind.clone() {
        config.bind = bind;
    }

    if cli.write_config {
        config.save(&cli.config).map_err(std::io::Error::other)?;
        println!("{}", cli.config.display());
        return Ok(());
    }

    config.ensure_data_dirs()?;

    info!("");
    info!("  Dulus v{}", env!("CARGO_PKG_VERSION"));
    info!("  ──────────────────────────────────");
    info!("  Ludus:      {}", config.ludus_url);
    info!("  Admin:      {}", config.ludus_admin_url);
    info!("  Pools:      {}", config.data.pools_dir.display());
    info!("  Batch size: {}", config.max_concurrent_requests);

    let executor = ludus::LudusClient::new(config.request_timeout()).map_err(|e| {
        tracing::error!("Failed to build Ludus HTTP client: {}", e);
        std::io::Error::other(e)
    })?;

    let bind = format!("{}:{}", config.bind, config.port);
    let tls_paths = if let (Some(cert), Some(key)) = (&cli.tls_cert, &cli.tls_key) {
        Some((cert.clone(), key.clone()))
    } else {
        find_tls_certificate(&config.proxmox.node)
    };

    let app_state = web::Data::new(api::AppState::new(config, Arc::new(executor)));

    // Try to load TLS config using OpenSSL; fall back to HTTP if anything goes wrong
    let ssl_builder = tls_paths.as_ref().and_then(|(cert_path, key_path)| {
        use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

        let mut builder = match SslAcceptor::mozilla_intermediate(SslMethod::tls()) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Failed to create SSL acceptor: {}, falling back to HTTP", e);
                return None;
            }
        };

        if let Err(e) = builder.set_certificate_chain_file(cert_path) {
            tracing::warn!("Cannot load TLS cert '{}': {}, falling back to HTTP", cert_path, e);
            return None;
        }

        if let Err(e) = builder.set_private_key_file(key_path, SslFiletype::PEM) {
            tracing::warn!("Cannot load TLS key '{}': {}, falling back to HTTP", key_path, e);
            return None;
        }

        Some(builder)
    });

    let server = HttpServer::new(move || App::new().app_data(app_state.clone()).configure(api::configure));

    match (ssl_builder, tls_paths.as_ref()) {
        (Some(ssl_builder), Some((cert_path, key_path))) => {
            info!("  🔒 TLS enabled");
            info!("     Cert: {}", cert_path);
            info!("     Key:  {}", key_path);
            info!("     API:  https://{}", bind);
            info!("");

            server
                .bind_openssl(&bind, ssl_builder)
                .map_err(|e| {
                    tracing::error!("❌ Failed to bind HTTPS on {}: {}", bind, e);
                    e
                })?
                .run()
                .await
        }
        _ => {
            if tls_paths.is_some() {
                info!("  ⚠️  TLS certificates found but failed to load, running HTTP only");
            } else {
                info!("  ⚡ HTTP mode (no TLS certificates found)");
            }
            info!("     API:  http://{}", bind);
            info!("");

            server
                .bind(&bind)
                .map_err(|e| {
                    tracing::error!("❌ Failed to bind HTTP on {}: {}", bind, e);
                    e
                })?
                .run()
                .await
        }
    }
}
