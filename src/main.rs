/// k8s-preflight - cluster readiness checks for backup and restore
///
/// Verifies that a Kubernetes cluster has what a snapshot-based backup product
/// needs (tooling, RBAC, CSI snapshot support, DNS) by exercising it with
/// short-lived, labelled resources that are removed afterwards.
mod config;
mod k8s;
mod preflight;
mod utils;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::RunConfig;
use crate::k8s::naming::{is_valid_run_uid, UID_LENGTH};
use crate::k8s::KubeGateway;
use crate::preflight::cleanup::cleanup_by_uid;
use crate::preflight::Preflight;
use crate::utils::cancel::CancelSignal;

#[derive(Parser)]
#[command(name = "k8s-preflight")]
#[command(about = "Check that a Kubernetes cluster is ready for snapshot-based backup", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the kubeconfig file (defaults to $KUBECONFIG or ~/.kube/config)
    #[arg(short, long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Namespace in which preflight resources are created [default: default]
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Directory in which the log file is written
    #[arg(long, global = true, default_value = ".")]
    log_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all preflight checks
    Run(RunArgs),

    /// Delete resources left behind by preflight runs
    Cleanup {
        /// UID of the run to clean up; all preflight resources when omitted
        #[arg(long)]
        uid: Option<String>,
    },

    /// Generate an example configuration file
    Init {
        /// Output path of the configuration file
        #[arg(long, default_value = "preflight.yaml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// YAML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage class to validate
    #[arg(long)]
    storage_class: Option<String>,

    /// Volume snapshot class; found from the storage class provisioner when omitted
    #[arg(long)]
    volume_snapshot_class: Option<String>,

    /// Registry from which the test images are pulled
    #[arg(long)]
    local_registry: Option<String>,

    /// Pull secret for the local registry
    #[arg(long)]
    image_pull_secret: Option<String>,

    /// Service account for the test pods
    #[arg(long)]
    service_account: Option<String>,

    /// Remove preflight resources even when some check failed
    #[arg(long)]
    cleanup_on_failure: bool,

    /// CPU request of the test pods
    #[arg(long)]
    request_cpu: Option<String>,

    /// Memory request of the test pods
    #[arg(long)]
    request_memory: Option<String>,

    /// CPU limit of the test pods
    #[arg(long)]
    limit_cpu: Option<String>,

    /// Memory limit of the test pods
    #[arg(long)]
    limit_memory: Option<String>,

    /// Storage requested by the test PVCs [default: 1Gi]
    #[arg(long)]
    pvc_storage_request: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Run(_) => Some("preflight"),
        Commands::Cleanup { .. } => Some("preflight_cleanup"),
        Commands::Init { .. } => None,
    };
    if let Err(e) = init_tracing(&cli.log_level, &cli.log_dir, log_file) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    let result = match &cli.command {
        Commands::Run(args) => run_preflight(&cli, args).await,
        Commands::Cleanup { uid } => cleanup(&cli, uid.as_deref()).await,
        Commands::Init { output } => init_config(output).await,
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Log to stdout and, when `file_prefix` is set, to `<log_dir>/<prefix>-<timestamp>.log`
fn init_tracing(log_level: &str, log_dir: &Path, file_prefix: Option<&str>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("k8s_preflight={}", log_level).into());

    let file_layer = match file_prefix {
        Some(prefix) => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
            let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
            let path = log_dir.join(format!("{}-{}.log", prefix, timestamp));
            let file = File::create(&path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(())
}

/// Resolve the run configuration: file first, flags on top
fn build_config(cli: &Cli, args: &RunArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RunConfig::default(),
    };

    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(storage_class) = &args.storage_class {
        config.storage_class = storage_class.clone();
    }
    if args.cleanup_on_failure {
        config.cleanup_on_failure = true;
    }
    if let Some(request) = &args.pvc_storage_request {
        config.pvc_storage_request = request.clone();
    }

    let overrides = [
        (&args.volume_snapshot_class, &mut config.snapshot_class),
        (&args.local_registry, &mut config.local_registry),
        (&args.image_pull_secret, &mut config.image_pull_secret),
        (&args.service_account, &mut config.service_account),
        (&args.request_cpu, &mut config.resources.requests.cpu),
        (&args.request_memory, &mut config.resources.requests.memory),
        (&args.limit_cpu, &mut config.resources.limits.cpu),
        (&args.limit_memory, &mut config.resources.limits.memory),
    ];
    for (flag, field) in overrides {
        if flag.is_some() {
            field.clone_from(flag);
        }
    }

    config.normalize();
    config.validate()?;
    Ok(config)
}

/// Run the preflight checks; `Ok(false)` when any check failed
async fn run_preflight(cli: &Cli, args: &RunArgs) -> Result<bool> {
    let config = build_config(cli, args)?;

    let gateway = KubeGateway::connect(cli.kubeconfig.as_deref())
        .await
        .context("Failed to build kubernetes client")?;

    let (handle, cancel) = CancelSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling preflight run");
            handle.cancel();
        }
    });

    let report = Preflight::new(Arc::new(gateway), config)
        .run(&cancel)
        .await?;
    report.log_summary();
    if let Some(e) = &report.cleanup_error {
        warn!(
            "Some preflight resources were not removed; retry with `k8s-preflight cleanup --uid {}` :: {}",
            report.uid, e
        );
    }

    Ok(report.passed())
}

/// Delete preflight resources of one run, or of all runs
async fn cleanup(cli: &Cli, uid: Option<&str>) -> Result<bool> {
    if let Some(uid) = uid.filter(|uid| !is_valid_run_uid(uid)) {
        anyhow::bail!(
            "--uid '{}' is not a preflight run UID ({} lowercase letters or digits)",
            uid,
            UID_LENGTH
        );
    }

    let namespace = cli
        .namespace
        .clone()
        .filter(|ns| !ns.trim().is_empty())
        .unwrap_or_else(|| config::DEFAULT_NAMESPACE.to_string());

    let gateway = KubeGateway::connect(cli.kubeconfig.as_deref())
        .await
        .context("Failed to build kubernetes client")?;

    cleanup_by_uid(&gateway, &namespace, uid).await?;
    info!("✓ Cleanup completed");
    Ok(true)
}

/// Write an example configuration file
async fn init_config(output: &Path) -> Result<bool> {
    if output.exists() {
        anyhow::bail!("Configuration file already exists: {}", output.display());
    }

    let yaml = serde_yaml::to_string(&RunConfig::example())?;
    tokio::fs::write(output, yaml)
        .await
        .context("Failed to write configuration file")?;

    info!("Example configuration created: {}", output.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the configuration file to match your cluster");
    info!("  2. Run the checks:");
    info!("     k8s-preflight run --config {}", output.display());

    Ok(true)
}
