//! changeguard operator - change defense for Deployments and StatefulSets

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;

use changeguard_common::config::{watch_config_map, ConfigPublisher, DefenseConfig};
use changeguard_common::events::KubeEventPublisher;
use changeguard_common::kube_client::KubeClientImpl;
use changeguard_common::telemetry::{init_telemetry, TelemetryConfig};
use changeguard_controller::{callback_router, CallbackState, Context, CONTROLLER_NAME};
use changeguard_operator::controller_runner::{
    build_execution_controller, build_owner_caches, build_policy_controller,
};
use changeguard_operator::server::{health_router, serve_http, serve_tls};
use changeguard_operator::startup::{
    crd_yaml, ensure_crds_installed, ensure_webhooks_installed, WebhookTarget,
};
use changeguard_review::{ReviewClient, ReviewClientConfig};
use changeguard_webhook::{webhook_router, WebhookState};

/// changeguard - hold workload rollouts until the review service clears them
///
/// Run flags are accepted with or without the `run` subcommand.
#[derive(Parser, Debug)]
#[command(name = "changeguard", version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator (default mode)
    ///
    /// Runs the policy and execution controllers, the admission webhooks and
    /// the review-service callback endpoint in one process.
    Run(RunArgs),
}

/// Run mode arguments
#[derive(Args, Debug)]
struct RunArgs {
    /// Review service base URL (required to run)
    #[arg(long, env = "REVIEW_ENDPOINT")]
    review_endpoint: Option<String>,

    /// Shared secret used to sign review-service requests
    #[arg(long, env = "REVIEW_TOKEN")]
    review_token: Option<String>,

    /// Platform id reported to the review service
    #[arg(long, env = "REVIEW_PLATFORM")]
    review_platform: Option<String>,

    /// Listen address of the HTTPS admission webhooks
    #[arg(long, default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// Directory holding tls.crt, tls.key and optionally ca.crt
    #[arg(long, env = "CERT_DIR", default_value = "/etc/changeguard/certs")]
    cert_dir: PathBuf,

    /// Listen address of the callback endpoint and health endpoints
    #[arg(long, default_value = "0.0.0.0:8080")]
    callback_addr: SocketAddr,

    /// Namespace the operator runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "changeguard-system")]
    namespace: String,

    /// ConfigMap (in the operator namespace) with runtime tuning
    #[arg(long, env = "CONFIG_MAP")]
    config_map: Option<String>,

    /// Service fronting the webhook listener
    #[arg(long, default_value = "changeguard-webhook")]
    webhook_service: String,

    /// Do not install CRDs and webhook configurations on startup
    #[arg(long)]
    skip_install: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs both the webhook server and
    // the kube client. Nothing can serve TLS without it.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    init_telemetry(TelemetryConfig::default())?;

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Run(args)) => args,
        None => cli.run,
    };
    run(args).await
}

/// Run the operator until a shutdown signal arrives
async fn run(args: RunArgs) -> anyhow::Result<()> {
    let endpoint = args
        .review_endpoint
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--review-endpoint (or REVIEW_ENDPOINT) is required"))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    if !args.skip_install {
        ensure_crds_installed(&client).await?;
        let target = WebhookTarget {
            namespace: args.namespace.clone(),
            service: args.webhook_service.clone(),
            ca_bundle: read_ca_bundle(&args.cert_dir).await?,
        };
        ensure_webhooks_installed(&client, &target).await?;
    }

    let publisher = ConfigPublisher::new(DefenseConfig::default());
    let config = publisher.handle();
    if let Some(name) = args.config_map.clone() {
        let client = client.clone();
        let namespace = args.namespace.clone();
        tokio::spawn(async move { watch_config_map(client, &namespace, &name, publisher).await });
    }

    let mut review_config = ReviewClientConfig::new(endpoint);
    if let Some(token) = args.review_token.clone() {
        review_config.secret = token;
    }
    if let Some(platform) = args.review_platform.clone() {
        review_config.platform = platform;
    }
    let review = Arc::new(
        ReviewClient::new(review_config)
            .map_err(|e| anyhow::anyhow!("failed to build review client: {}", e))?,
    );
    tracing::info!(endpoint = %review.base_url(), "Review service client ready");

    let kube = Arc::new(KubeClientImpl::new(client.clone()));
    let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
    let ctx = Arc::new(
        Context::builder(client.clone(), review.clone())
            .kube_client(kube.clone())
            .workload_reader(kube.clone())
            .event_publisher(events.clone())
            .config(config.clone())
            .build(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let webhooks = webhook_router(Arc::new(WebhookState {
        kube: kube.clone(),
        workloads: kube.clone(),
        review,
        config,
        cancel: cancel.clone(),
    }));
    let callbacks = callback_router(Arc::new(CallbackState { kube, events })).merge(health_router());

    tracing::info!("Starting changeguard controllers...");
    let (owners, mut controllers) = build_owner_caches(&client);
    controllers.push(build_policy_controller(client.clone(), ctx.clone()));
    controllers.push(build_execution_controller(client, ctx, owners));

    tokio::select! {
        _ = futures::future::join_all(controllers) => {
            tracing::info!("Controllers stopped");
        }
        result = serve_tls(args.webhook_addr, &args.cert_dir, webhooks, cancel.clone()) => {
            result?;
            tracing::info!("Webhook server stopped");
        }
        result = serve_http(args.callback_addr, callbacks, cancel.clone()) => {
            result?;
            tracing::info!("Callback server stopped");
        }
    }

    cancel.cancel();
    tracing::info!("Shutting down");
    Ok(())
}

/// CA bundle for the webhook configurations, if the cert directory has one
async fn read_ca_bundle(cert_dir: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    let path = cert_dir.join("ca.crt");
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "No CA bundle found, relying on cluster trust");
            Ok(None)
        }
        Err(e) => Err(anyhow::anyhow!("failed to read {}: {}", path.display(), e)),
    }
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
    token.cancel();
}
