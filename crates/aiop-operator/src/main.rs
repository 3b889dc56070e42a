//! AI operator - reconciles KnowledgeBase and Agent resources

use clap::Parser;
use kube::Client;

use aiop_common::config::OperatorConfig;
use aiop_common::telemetry::{init_telemetry, TelemetryConfig};
use aiop_operator::controller_runner::{
    build_agent_controllers, build_knowledge_base_controllers, ControllerFuture,
};
use aiop_operator::startup::{crd_manifests, ensure_crds_installed};

/// Kubernetes operator for knowledge-base indexing and agent deployment
#[derive(Parser, Debug)]
#[command(name = "aiop-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "LOG_PRETTY")]
    log_pretty: bool,

    #[command(flatten)]
    config: OperatorConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The operator cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        pretty: cli.log_pretty,
        ..Default::default()
    })?;

    run_controllers(cli.config).await
}

async fn run_controllers(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    tracing::info!(
        provider = %config.provider,
        namespaces = ?config.namespaces(),
        workers = config.workers,
        "Starting controllers"
    );

    let mut controllers: Vec<ControllerFuture> =
        build_knowledge_base_controllers(client.clone(), &config)?;
    controllers.extend(build_agent_controllers(client, &config));

    futures::future::join_all(controllers).await;
    tracing::info!("Controllers stopped");
    Ok(())
}
