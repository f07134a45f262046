mod cli;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use refinery_core::config::load_dotenv;
use refinery_core::{Config, FileJobStore, JobStore};
use refinery_exec::ProcessRunner;
use refinery_monitor::{RemoteBatchMonitor, SfApiClient, StaticToken, TokenFile, TokenProvider};
use refinery_notify::{CompletionMailer, CompletionNotifier, DisabledNotifier, EmailNotifier};
use refinery_pipeline::{Orchestrator, PipelineSettings};
use tokio::sync::Notify;
use tracing::{error, info};
use uuid::Uuid;

use crate::cli::{Command, WorkerArgs};

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = WorkerArgs::parse();
    let config = Config::from_env();
    config.log_summary();

    let store_dir = args.store_dir.clone().unwrap_or_else(|| config.worker.job_store_dir.clone());
    let store: Arc<dyn JobStore> = Arc::new(
        FileJobStore::open(&store_dir)
            .await
            .with_context(|| format!("failed to open job store at {}", store_dir.display()))?,
    );

    match args.command {
        Command::Run { job, attempt } => run_job(&config, store, job, attempt).await,
        Command::Monitor { once, token } => monitor(&config, store, once, token).await,
        Command::Show { job } => {
            let job = store.load(job).await.with_context(|| format!("failed to load job {job}"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
    }
}

async fn run_job(config: &Config, store: Arc<dyn JobStore>, job_id: Uuid, attempt: u32) -> Result<()> {
    let orchestrator = Orchestrator::new(
        Arc::new(PipelineSettings::from_config(config)),
        Arc::new(ProcessRunner::new()),
        store,
        notifier(config)?,
        config.worker.max_attempts,
    );

    match orchestrator.run(job_id, attempt).await {
        Ok(job) => {
            info!(job_id = %job.id, status = %job.status, "job finished");
            Ok(())
        }
        Err(e) => {
            error!(job_id = %job_id, attempt, error = %e, "job attempt failed");
            Err(e).with_context(|| format!("job {job_id} attempt {attempt} failed"))
        }
    }
}

async fn monitor(
    config: &Config,
    store: Arc<dyn JobStore>,
    once: bool,
    token: Option<String>,
) -> Result<()> {
    let token: Arc<dyn TokenProvider> = match (&config.remote.token_file, token) {
        (Some(path), _) => Arc::new(TokenFile::new(path)),
        (None, Some(token)) => Arc::new(StaticToken::new(token)),
        (None, None) => bail!("set SFAPI_TOKEN_FILE or SFAPI_TOKEN to reach the scheduler API"),
    };

    let monitor = RemoteBatchMonitor::new(
        store,
        Arc::new(SfApiClient::new(&config.remote, token)),
        Arc::new(PipelineSettings::from_config(config)),
        Arc::new(ProcessRunner::new()),
        notifier(config)?,
    );

    if once {
        let summary = monitor.poll_once().await?;
        info!(polled = summary.polled, cleaned_up = summary.cleaned_up, errors = summary.errors, "poll finished");
        return Ok(());
    }

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.notify_one();
        }
    });

    info!(interval_secs = config.remote.poll_interval_secs, "remote monitor started");
    monitor.run_until(config.remote.poll_interval(), shutdown).await;
    Ok(())
}

fn notifier(config: &Config) -> Result<Arc<dyn CompletionNotifier>> {
    let notify = &config.notify;
    match (&notify.smtp_host, notify.send_email_notifications) {
        (Some(host), true) => {
            let email = EmailNotifier::from_config(host, notify.smtp_port, notify.smtp_tls, &notify.email_from)
                .context("invalid SMTP configuration")?;
            Ok(Arc::new(CompletionMailer::new(email)))
        }
        _ => Ok(Arc::new(DisabledNotifier)),
    }
}
