//! Internal Controller: joins this guest to the overlay mesh and the
//! cluster control plane, registers with the orchestrator, and dispatches
//! pod lifecycle commands relayed from the host (§1, §2 C4/C5/C6).

mod bootstrap;
mod cert_pin;
mod cluster_agent;
mod cluster_api;
mod config;
mod dispatcher;
mod error;
mod lifecycle;
mod mesh;
mod orchestrator_client;
mod persistent_channel;

use std::sync::Arc;

use clap::Parser;

use cluster_api::ClusterApi;
use config::GuestConfig;
use dispatcher::Dispatcher;
use lifecycle::LifecycleTracker;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, help = "Path to the JSON configuration file")]
    config: Option<std::path::PathBuf>,
}

fn main() {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(GuestConfig::default_path);
    let config = match GuestConfig::load_or_default(&config_path) {
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

    if let Err(code) = guest_main(config) {
        std::process::exit(code);
    }
}

#[tokio::main]
async fn guest_main(config: GuestConfig) -> Result<(), i32> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::error!("failed to install rustls crypto provider: {e:?}");
        return Err(255);
    }

    let lifecycle = LifecycleTracker::new();

    let outcome = match bootstrap::run(&config, &lifecycle).await {
        Some(outcome) => outcome,
        None => {
            tracing::error!("bootstrap failed, guest lifecycle is terminal");
            return Err(255);
        }
    };

    let cluster = Arc::new(ClusterApi::new(config.kubeconfig_path()));
    if !cluster.prepare().await {
        tracing::error!("cluster control plane never became ready after registration");
        lifecycle.fail().await;
        return Err(255);
    }

    let dispatcher = Arc::new(Dispatcher::new(cluster));

    match persistent_channel::run(&outcome.handshake, dispatcher).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(fatal = e.is_fatal(), "persistent channel terminated: {e}");
            lifecycle.fail().await;
            Err(255)
        }
    }
}
