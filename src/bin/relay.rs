//! Wiremesh relay daemon
//!
//! Accepts raw-TLS and HTTP/2 tunnel connections on one listener,
//! dispatching on ALPN, and relays them onward per the init payload.

use anyhow::{Context, Result};
use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};
use wiremesh::config::Config;
use wiremesh::relay::{Relay, RelayOptions};
use wiremesh::transport::{Transport, TransportOptions};

/// Wiremesh Relay - one hop of a relay-mesh overlay network
#[derive(Parser, Debug)]
#[command(name = "wiremesh-relay")]
#[command(about = "Wiremesh relay - tunnel hop for a relay-mesh overlay network")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    // Load configuration, writing out the defaults on first run
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(_) => {
            let config = Config::default();
            config
                .save(&args.config)
                .context("Failed to write default configuration")?;
            info!("Wrote default configuration to {}", args.config);
            config
        }
    };
    let relay_config = config.relay;

    let listen = args.listen.unwrap_or(relay_config.listen);

    let (certs, key) = load_or_generate_identity(
        relay_config.tls_cert.as_deref(),
        relay_config.tls_key.as_deref(),
    )?;
    let mut tls_config = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("Invalid TLS identity")?;
    // raw-substrate clients skip ALPN; h2 clients negotiate it
    tls_config.alpn_protocols = vec![b"h2".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let transport = Transport::new(TransportOptions {
        tls_verify: relay_config.tls_verify,
        certs: None,
        timeout: Duration::from_secs(relay_config.dial_timeout_secs),
    })
    .context("Failed to initialize transport")?;

    let relay = Arc::new(Relay::new(
        Arc::new(transport),
        RelayOptions {
            buf_size: relay_config.buf_size,
            max_time: Duration::from_secs(relay_config.max_time_secs),
            handle_token: None,
            error_origin: relay_config.error_origin,
            allow_loopback: relay_config.allow_loopback,
            ..Default::default()
        },
    ));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    let serving = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.serve_listener(listener, acceptor).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    relay.shutdown();
    serving.await??;
    Ok(())
}

/// Loads the PEM identity from disk, or generates a self-signed one when
/// no paths are configured.
fn load_or_generate_identity(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
                std::fs::File::open(cert_path)
                    .with_context(|| format!("Failed to open {}", cert_path))?,
            ))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to parse certificate PEM")?;
            let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
                std::fs::File::open(key_path)
                    .with_context(|| format!("Failed to open {}", key_path))?,
            ))
            .context("Failed to parse key PEM")?
            .context("No private key found in PEM")?;
            Ok((certs, key))
        }
        _ => {
            warn!("No TLS identity configured, generating a self-signed certificate");
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .context("Failed to generate self-signed certificate")?;
            let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
            Ok((vec![cert.cert.into()], key))
        }
    }
}
