use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use cio_agent::cio::{CioManager, StorageTier, VdiskProfile};
use cio_agent::device::CioBlockDeviceApi;
use cio_agent::metadata::InstanceMetadataClient;
use cio_agent::metrics;
use cio_agent::service::BlockDeviceAgentService;
use cio_agent::service::proto::block_device_agent_server::BlockDeviceAgentServer;

#[derive(Parser, Debug)]
#[command(name = "cio-agent")]
#[command(about = "CIO block-device agent for cluster volume orchestration")]
struct Args {
    /// gRPC listen address
    #[arg(long, default_value = "[::1]:50051")]
    listen: String,

    /// Path to the cio command-line tool
    #[arg(long, env = "CIO_PATH", default_value = "/usr/bin/cio")]
    cio_path: String,

    /// Cluster id this agent's volumes are tagged with
    #[arg(long, env = "CIO_CLUSTER_ID")]
    cluster_id: Uuid,

    /// Replica count for new vdisks
    #[arg(long, default_value_t = 2)]
    redundancy: u32,

    /// Storage tier for new vdisks (ssd, hdd, nvme)
    #[arg(long, default_value = "ssd")]
    tier: StorageTier,

    /// Minimum provisioned IOPS for new vdisks
    #[arg(long, default_value_t = 1000)]
    min_iops: u32,

    /// Maximum provisioned IOPS for new vdisks
    #[arg(long, default_value_t = 2000)]
    max_iops: u32,

    /// Cloud instance-metadata endpoint
    #[arg(long, env = "METADATA_ENDPOINT", default_value = "http://169.254.169.254")]
    metadata_endpoint: String,

    /// Instance id override (skips the metadata lookup)
    #[arg(long, env = "INSTANCE_ID")]
    instance_id: Option<String>,

    /// Seconds to wait for create/attach/detach transitions
    #[arg(long, default_value_t = 120)]
    op_timeout_secs: u64,

    /// Seconds between backend state polls
    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,

    /// TLS certificate file (PEM format)
    #[arg(long, env = "TLS_CERT_PATH")]
    tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM format)
    #[arg(long, env = "TLS_KEY_PATH")]
    tls_key: Option<PathBuf>,

    /// CA certificate for client verification (enables mTLS)
    #[arg(long, env = "TLS_CLIENT_CA_PATH")]
    tls_client_ca: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Maximum concurrent storage operations (rate limiting)
    #[arg(long, env = "MAX_CONCURRENT_OPS", default_value = "10")]
    max_concurrent_ops: usize,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    info!("Starting cio-agent on {}", args.listen);
    info!("Log level: {}", args.log_level);
    info!("CIO tool path: {}", args.cio_path);
    info!("Cluster id: {}", args.cluster_id);
    info!(
        "Vdisk profile: redundancy={} tier={} iops={}..{}",
        args.redundancy, args.tier, args.min_iops, args.max_iops
    );
    info!("Max concurrent operations: {}", args.max_concurrent_ops);

    // Initialize the backend CLI manager (probes the cio tool)
    let cio = CioManager::new(args.cio_path.clone())?;

    // Resolve the local compute instance identity
    let instance_id = match args.instance_id {
        Some(id) => {
            info!("Using configured instance id: {}", id);
            id
        }
        None => resolve_instance_id(&args.metadata_endpoint).await,
    };
    info!("Compute instance id: {}", instance_id);

    let profile = VdiskProfile {
        redundancy: args.redundancy,
        tier: args.tier,
        min_iops: args.min_iops,
        max_iops: args.max_iops,
    };

    let api = CioBlockDeviceApi::new(cio, args.cluster_id, instance_id, profile).with_timeouts(
        Duration::from_secs(args.poll_interval_secs),
        Duration::from_secs(args.op_timeout_secs),
    );

    // Create the agent service with rate limiting
    let service =
        BlockDeviceAgentService::with_concurrency_limit(Arc::new(api), args.max_concurrent_ops);

    // Parse the listen address
    let addr = args.listen.parse()?;

    info!("gRPC server listening on {}", addr);

    // Build the gRPC server with optional TLS
    let mut builder = Server::builder();

    // Configure TLS if certificates provided
    if let (Some(cert_path), Some(key_path)) = (&args.tls_cert, &args.tls_key) {
        let cert = tokio::fs::read(cert_path).await?;
        let key = tokio::fs::read(key_path).await?;
        let identity = Identity::from_pem(cert, key);

        let mut tls = ServerTlsConfig::new().identity(identity);

        // If client CA provided, require client certificates (mTLS)
        if let Some(ca_path) = &args.tls_client_ca {
            let ca = tokio::fs::read(ca_path).await?;
            tls = tls.client_ca_root(Certificate::from_pem(ca));
            info!("mTLS enabled - client certificates required");
        } else {
            info!("TLS enabled (server-only, no client verification)");
        }

        builder = builder.tls_config(tls)?;
    } else {
        info!("TLS disabled - running in plaintext mode");
    }

    // Start the gRPC server with graceful shutdown
    builder
        .add_service(BlockDeviceAgentServer::new(service))
        .serve_with_shutdown(addr, async {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    info!("cio-agent shutdown complete");
    Ok(())
}

/// Resolve the instance id from the metadata endpoint, falling back to the
/// node hostname when the agent is not running on a cloud instance.
async fn resolve_instance_id(endpoint: &str) -> String {
    match InstanceMetadataClient::new(endpoint) {
        Ok(client) => {
            // Prefer the identity document so placement can be logged too
            match client.instance_identity().await {
                Ok(identity) => {
                    if !identity.region.is_empty() || !identity.availability_zone.is_empty() {
                        info!(
                            "Instance placement: region={} zone={}",
                            identity.region, identity.availability_zone
                        );
                    }
                    return identity.instance_id;
                }
                Err(e) => warn!("Instance identity document unavailable: {}", e),
            }

            match client.instance_id().await {
                Ok(id) => return id,
                Err(e) => warn!("Instance metadata lookup failed: {}", e),
            }
        }
        Err(e) => warn!("Failed to build metadata client: {}", e),
    }

    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    warn!("Falling back to hostname '{}' as instance id", host);
    host
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
///
/// This function only supports Unix systems since the agent runs alongside
/// the CIO storage nodes.
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    // Wait for any signal - use pending() for handlers that failed to install
    tokio::select! {
        _ = async { sigterm.as_mut().unwrap().recv().await }, if sigterm.is_some() => {
            info!("Received SIGTERM");
        }
        _ = async { sigint.as_mut().unwrap().recv().await }, if sigint.is_some() => {
            info!("Received SIGINT");
        }
        _ = async { sighup.as_mut().unwrap().recv().await }, if sighup.is_some() => {
            info!("Received SIGHUP (config reload not implemented, shutting down)");
        }
    }
}
