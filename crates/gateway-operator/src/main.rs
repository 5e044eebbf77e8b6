//! Gateway Kubernetes Operator
//!
//! Watches DataPlane and ControlPlane resources and keeps the proxy and
//! ingress controller workloads they describe running.

use anyhow::{Context, Result};
use clap::Parser;
use gateway_operator::config::OperatorConfig;
use gateway_operator::consts::{DEFAULT_CONTROLPLANE_IMAGE, DEFAULT_DATAPLANE_IMAGE};
use gateway_operator::{controller, crd};
use kube::Client;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Gateway Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "gateway-operator")]
#[command(about = "Kubernetes operator for Kong DataPlane and ControlPlane resources")]
#[command(version)]
struct Args {
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

    /// Proxy image for DataPlanes that do not set one
    #[arg(long, env = "DATAPLANE_IMAGE", default_value = DEFAULT_DATAPLANE_IMAGE)]
    dataplane_image: String,

    /// Controller image for ControlPlanes that do not set one
    #[arg(long, env = "CONTROLPLANE_IMAGE", default_value = DEFAULT_CONTROLPLANE_IMAGE)]
    controlplane_image: String,

    /// Resync interval for settled resources, in seconds
    #[arg(long, env = "RESYNC_SECONDS", default_value = "300")]
    resync_seconds: u64,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            dataplane_image: self.dataplane_image.clone(),
            controlplane_image: self.controlplane_image.clone(),
            resync_interval: Duration::from_secs(self.resync_seconds),
            ..OperatorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", crd::crds_yaml()?);
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        dataplane_image = %config.dataplane_image,
        controlplane_image = %config.controlplane_image,
        "Starting gateway operator"
    );

    install_metrics_exporter(args.metrics_addr)?;

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    controller::run(client, config)
        .await
        .context("Controller failed")?;

    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
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

/// Serve Prometheus metrics; the exporter runs its own listener task
fn install_metrics_exporter(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")
}

/// Liveness/readiness probe endpoint
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
