//! AppRegistry Kubernetes Operator
//!
//! Runs a package registry server for every PackageRegistry custom resource.

use anyhow::{Context, Result};
use appregistry_operator::controller::{self, OperatorConfig};
use appregistry_operator::crd;
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// AppRegistry Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "appregistry-operator")]
#[command(about = "Kubernetes operator serving package registries over gRPC")]
#[command(version)]
struct Args {
    /// Image running the appregistry-server binary
    #[arg(
        long,
        env = "REGISTRY_SERVER_IMAGE",
        default_value = "quay.io/appregistry/registry-server:latest"
    )]
    registry_image: String,

    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        image = %args.registry_image,
        "Starting AppRegistry Kubernetes Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Empty string means cluster-wide
    let namespace = if args.namespace.is_empty() {
        None
    } else {
        Some(args.namespace)
    };

    let config = OperatorConfig {
        registry_image: args.registry_image,
    };

    controller::run_controller(client, namespace, config)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging. `RUST_LOG` overrides `--log-level` when set.
fn init_logging(args: &Args) -> Result<()> {
    let default_filter = format!(
        "{},kube=info,tower=warn,hyper=warn",
        args.log_level.as_str().to_lowercase()
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print both CRDs as a multi-document YAML stream
fn print_crd() -> Result<()> {
    use kube::CustomResourceExt;

    let registry = serde_yaml::to_string(&crd::PackageRegistry::crd())?;
    let source = serde_yaml::to_string(&crd::PackageSource::crd())?;
    println!("{}---\n{}", registry, source);

    Ok(())
}
