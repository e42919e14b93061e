//! asr-relay: real-time speech transcription relay.
//!
//! Accepts browser WebSocket connections speaking a small JSON protocol,
//! authorizes them, and bridges each session to a streaming speech
//! recognition service over its binary WebSocket protocol.

mod bridge;
mod config;
mod identity;
mod registry;
mod server;
mod settings;
mod transport;
mod upstream;

use clap::Parser;
use config::ServerConfig;
use identity::TokenIdentityProvider;
use server::RelayServer;
use settings::CredentialsCache;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use upstream::WsUpstreamConnector;

/// Default interval between credential refreshes.
const DEFAULT_REFRESH_SECS: u64 = 300;

/// asr-relay: speech transcription relay
#[derive(Parser, Debug)]
#[command(name = "asr-relay", version, about = "Real-time speech transcription relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.asr-relay/config.toml")]
    config: String,

    /// Print a signed client token for this user id and exit
    #[arg(long, value_name = "USER_ID")]
    issue_token: Option<String>,

    /// Role embedded in issued tokens
    #[arg(long, default_value = "user")]
    role: String,

    /// Print a fresh hex secret for `[auth] token_secret` and exit
    #[arg(long)]
    generate_secret: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if cli.generate_secret {
        match identity::generate_secret() {
            Ok(secret) => println!("{}", hex::encode(secret)),
            Err(e) => {
                error!(error = %e, "failed to generate secret");
                std::process::exit(1);
            }
        }
        return;
    }

    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.host.as_deref(),
        cli.port,
        cli.cert.as_deref(),
        cli.key.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let identity = match TokenIdentityProvider::from_config(&server_config.auth) {
        Ok(provider) => provider,
        Err(e) => {
            error!(error = %e, "invalid auth config");
            std::process::exit(1);
        }
    };

    if let Some(user_id) = &cli.issue_token {
        let Some(secret) = identity.secret() else {
            error!("issuing tokens requires [auth] token_secret");
            std::process::exit(1);
        };
        let token = identity::create_token(
            secret,
            user_id,
            &cli.role,
            server_config.auth.token_ttl_secs,
        );
        println!("{token}");
        return;
    }

    if identity.is_open() {
        warn!("no static tokens or token_secret configured; every client will be rejected");
    }

    let tls = match (&server_config.cert_path, &server_config.key_path) {
        (Some(cert), Some(key)) => match load_tls_config(cert, key) {
            Ok(cfg) => Some(TlsAcceptor::from(Arc::new(cfg))),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        _ => None,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %server_config.host,
        port = server_config.port,
        tls = tls.is_some(),
        "starting asr-relay"
    );

    let credentials = Arc::new(CredentialsCache::new(
        server_config.upstream.clone(),
        server_config.source.clone(),
    ));
    let refresh_every = Duration::from_secs(
        server_config
            .upstream
            .refresh_secs
            .unwrap_or(DEFAULT_REFRESH_SECS)
            .max(1),
    );
    let refresh_task = credentials.clone().spawn_refresh(refresh_every);

    let relay = RelayServer::new(
        server_config,
        Arc::new(identity),
        credentials,
        Arc::new(WsUpstreamConnector),
    );

    if let Err(e) = relay.run(tls, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    refresh_task.abort();
    info!("asr-relay stopped");
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;

    let key =
        rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // WebSocket upgrade only.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
