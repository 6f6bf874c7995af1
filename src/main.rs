//! `proxyd` - CLI entry point for the forward proxy engine.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use bump_proxy::{FileConfig, ProxyGateway};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "proxyd")]
#[command(author = "UBIO Engineering")]
#[command(version)]
#[command(about = "Forward HTTP/HTTPS proxy with routing and SSL bumping")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Validate configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Override the plain HTTP/CONNECT listen address
    #[arg(long = "listen")]
    listen: Option<SocketAddr>,

    /// Override the SSL-bump listen address
    #[arg(long = "bump")]
    bump: Option<SocketAddr>,

    /// Override the bump CA certificate path
    #[arg(long = "ca-cert")]
    ca_cert: Option<PathBuf>,

    /// Override the bump CA private key path
    #[arg(long = "ca-key")]
    ca_key: Option<PathBuf>,
}

/// Apply `--listen`/`--bump`/`--ca-cert`/`--ca-key` on top of the loaded
/// file config, each flag replacing its corresponding field when present.
fn apply_overrides(mut config: FileConfig, args: &Args) -> anyhow::Result<FileConfig> {
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(bump) = args.bump {
        config.bump_listen = Some(bump);
    }
    if args.ca_cert.is_some() || args.ca_key.is_some() {
        let cert_store = config.cert_store.get_or_insert_with(|| {
            bump_proxy::config::CertStoreFileConfig::new(String::new(), String::new())
        });
        if let Some(ca_cert) = &args.ca_cert {
            cert_store.ca_cert_path = ca_cert.display().to_string();
        }
        if let Some(ca_key) = &args.ca_key {
            cert_store.ca_key_path = ca_key.display().to_string();
        }
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        .event_interval(61)
        .global_queue_interval(31)
        .thread_name("proxyd-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bump_proxy=info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("loading configuration from {}", args.config.display());
    let config = match FileConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    let config = apply_overrides(config, &args)?;
    if let Err(e) = config.validate() {
        error!("invalid configuration after overrides: {}", e);
        std::process::exit(1);
    }

    if args.test {
        info!("configuration is valid");
        return Ok(());
    }

    let gateway = match ProxyGateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("failed to initialize proxy gateway: {}", e);
            std::process::exit(1);
        }
    };
    let gateway = std::sync::Arc::new(gateway);

    let shutdown_gateway = gateway.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_gateway.shutdown(false);
        }
    });

    if let Err(e) = gateway.start().await {
        error!("proxy gateway error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
