//! conveyor-controller - pipeline gating controller.
//!
//! Watches build-outcome records and promotes a pull request into its
//! second-stage tests once the first-stage quorum succeeds on a single
//! revision. Also serves the HMAC-verified webhook that posts the
//! informational comment on new pull requests and handles the lgtm flow.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use conveyor_core::forge::{ForgeClient, GitHubClient};

mod config_provider;
mod records;
mod reconciler;
mod webhook;

use config_provider::{ConfigDataProvider, ConfigWatcher};
use records::RecordStore;
use reconciler::Reconciler;

/// Pipeline gating controller.
#[derive(Debug, Parser)]
#[command(name = "conveyor-controller", version, about)]
struct Options {
    /// Config file with the enabled orgs and repos.
    #[arg(long, required = true)]
    config_file: PathBuf,

    /// Config file with orgs and repos whose second stage is triggered by
    /// the lgtm label.
    #[arg(long, required = true)]
    lgtm_config_file: PathBuf,

    /// Path to the file containing the webhook HMAC secret.
    #[arg(long, default_value = "/etc/webhook/hmac")]
    hmac_secret_file: PathBuf,

    /// Job configuration file the presubmit sets are computed from.
    #[arg(long, required = true)]
    job_config_file: PathBuf,

    /// Path to the file containing the forge token.
    #[arg(long)]
    github_token_path: Option<PathBuf>,

    /// Address of the scheduling cluster API server.
    #[arg(long, required = true)]
    cluster_api_url: String,

    /// File holding the scheduling cluster bearer token.
    #[arg(long, required = true)]
    cluster_token_file: PathBuf,

    /// Namespace holding the build-outcome records.
    #[arg(long, default_value = "ci")]
    records_namespace: String,

    /// Address the webhook server listens on.
    #[arg(long, default_value = "0.0.0.0:8888")]
    listen_address: String,

    /// Run in dry-run mode: log decisions, never post.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(Options::parse()).await {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(options: Options) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let hmac_secret = std::fs::read_to_string(&options.hmac_secret_file)
        .with_context(|| format!("could not read {}", options.hmac_secret_file.display()))?;
    let github_token = match &options.github_token_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?
            .trim()
            .to_string(),
        None => String::new(),
    };
    let cluster_token = std::fs::read_to_string(&options.cluster_token_file)
        .with_context(|| format!("could not read {}", options.cluster_token_file.display()))?
        .trim()
        .to_string();

    let watcher = Arc::new(
        ConfigWatcher::new(&options.config_file).map_err(|err| anyhow::anyhow!(err))?,
    );
    let lgtm_watcher = Arc::new(
        ConfigWatcher::new(&options.lgtm_config_file).map_err(|err| anyhow::anyhow!(err))?,
    );
    tokio::spawn(Arc::clone(&watcher).watch(cancel.clone()));
    tokio::spawn(Arc::clone(&lgtm_watcher).watch(cancel.clone()));

    let provider = Arc::new(
        ConfigDataProvider::new(&options.job_config_file).map_err(|err| anyhow::anyhow!(err))?,
    );
    tokio::spawn(Arc::clone(&provider).run(cancel.clone()));

    let forge: Arc<dyn ForgeClient> = Arc::new(GitHubClient::new(
        SecretString::from(github_token),
        options.dry_run,
    ));

    let store = Arc::new(RecordStore::new(
        &options.cluster_api_url,
        SecretString::from(cluster_token),
        &options.records_namespace,
    ));

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&forge),
        Arc::clone(&provider),
        Arc::clone(&watcher),
    ));

    // Changed records flow from the poller into the reconcile loop.
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tokio::spawn(async move { store.watch_changed(tx, cancel).await });
    }
    {
        let reconciler = Arc::clone(&reconciler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    record = rx.recv() => {
                        let Some(record) = record else { return };
                        if let Err(err) = reconciler.reconcile(&record).await {
                            tracing::error!(job = %record.job, error = %err, "reconcile failed");
                        }
                    }
                }
            }
        });
    }
    {
        let reconciler = Arc::clone(&reconciler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            reconciler.sweep_old_ids(Duration::from_secs(60 * 60), cancel).await;
        });
    }

    let state = Arc::new(webhook::WebhookState {
        secret: SecretString::from(hmac_secret.trim().to_string()),
        forge,
        provider,
        watcher,
        lgtm_watcher,
    });
    let app = webhook::router(state);

    tracing::debug!(address = %options.listen_address, "starting event server");
    let listener = tokio::net::TcpListener::bind(&options.listen_address)
        .await
        .with_context(|| format!("could not bind {}", options.listen_address))?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("event server exited with error")?;

    tracing::info!("graceful shutdown complete");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("interrupt received, shutting down");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
