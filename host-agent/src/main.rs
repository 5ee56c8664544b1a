//! Worker Manager: bridges the orchestrator's control plane to a
//! QEMU-backed guest, publishes fused host/guest metrics, and supervises
//! the guest's liveness (§1, §2 C9).

mod config;
mod error;
mod http_api;
mod hypervisor;
mod metrics_publisher;
mod net;
mod node_identity;
mod relay;
mod ws_server;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use config::HostConfig;
use hypervisor::HypervisorDriver;
use metrics_publisher::MetricsPublisher;
use net::{get_available_port, get_primary_ip};
use relay::HostRelay;
use ws_server::{TlsMaterial, WsServer};

const MAINTENANCE_TICK: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, help = "Path to the JSON configuration file")]
    config: Option<std::path::PathBuf>,
}

fn main() {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(HostConfig::default_path);
    let config = match HostConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e:#}");
            std::process::exit(1);
        }
    };

    let trace_level = match config.trace_level {
        0 => tracing::Level::TRACE,
        1 => tracing::Level::DEBUG,
        2 => tracing::Level::INFO,
        3 => tracing::Level::WARN,
        4 => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_max_level(trace_level)
        .init();

    if let Err(e) = supervisor_main(config) {
        tracing::error!("fatal error: {e:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn supervisor_main(config: HostConfig) -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("failed to install rustls crypto provider: {e:?}"))?;

    let node = node_identity::detect_node_details().context("detecting node identity")?;
    tracing::info!(name = %node.name, id = %node.id, "node identity established");

    let config = Arc::new(config);

    let server_ip: IpAddr = get_primary_ip().unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    let server_port = get_available_port().context("allocating persistent channel port")?;
    let vm_port = get_available_port().context("allocating guest bootstrap forward port")?;

    let cert = net::SelfSignedCert::generate(&node.name, server_ip)
        .context("generating self-signed certificate")?;

    let hypervisor = Arc::new(HypervisorDriver::new(
        config.qemu_installation_location.clone(),
        config.vm_image_location.clone(),
        config.cpu_limit,
        config.memory_limit,
    ));
    hypervisor.run(vm_port).context("launching hypervisor")?;

    let key_der = rustls_pki_types::PrivatePkcs8KeyDer::from(cert.key_pem_der()?);
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![rustls_pki_types::CertificateDer::from(cert.cert_der.clone())],
            rustls_pki_types::PrivateKeyDer::Pkcs8(key_der),
        )
        .context("building TLS server config")?;
    let tls_acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let ws_server = WsServer::spawn(
        IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        server_port,
        Some(TlsMaterial { acceptor: tls_acceptor }),
    )
    .await
    .context("starting persistent channel ws server")?;

    let relay = HostRelay::new(
        node.clone(),
        config.server_url.clone(),
        cert,
        ws_server.clone(),
        hypervisor.clone(),
        server_ip,
        server_port,
        vm_port,
    );
    ws_server.subscribe("/vm_connection", relay.clone()).await;

    {
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.run_bootstrap().await {
                tracing::error!(fatal = e.is_fatal(), "bootstrap handshake failed: {e}");
            }
        });
    }

    let metrics = MetricsPublisher::new(node.clone(), config.server_url.clone(), hypervisor.clone());
    tokio::spawn(metrics.clone().run());
    http_api::spawn(metrics.clone(), node.clone(), config.server_url.clone());

    let mut ticker = tokio::time::interval(MAINTENANCE_TICK);
    loop {
        ticker.tick().await;
        if relay.should_terminate() || metrics.should_terminate() {
            tracing::warn!("supervisor detected termination condition, shutting down");
            relay.terminate();
            std::process::exit(255);
        }
    }
}
